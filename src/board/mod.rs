//! Agency board: clients, projects, sprints and tasks with slug identifiers.
//!
//! ## Overview
//!
//! Every project, sprint and task gets a short human-readable slug built
//! from its client's project key: `ACME-P-2`, `ACME-S-4`, `ACME-17`. Numbers
//! come from one counter row per key, advanced with an optimistic
//! compare-and-set so several processes sharing one SQLite file never issue
//! the same number twice.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ DbHandle::call() on the blocking pool  │
//!                       │         v                                        │
//!                       │  db.rs  (AgencyDb: CRUD, cascades, backfill)     │
//!                       │         │                                        │
//!                       │         │ SlugAllocator::allocate()              │
//!                       │         v                                        │
//!                       │  allocator.rs  (CounterStore trait, CAS loop)    │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  slug.rs  (format, normalize, classify)          │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                            |
//! |----------|-----------------------------------------------------------|
//! | `models` | Shared types: `EntityKind`, `CounterRecord`, `Task`, ...  |
//! | `ws`     | `WsMessage` enum + `broadcast_message()` helper           |
//!
//! ## Typical Request Flow (create task)
//!
//! 1. `POST /api/projects/{id}/tasks` → `api::create_task()`
//! 2. `AgencyDb::create_task()` inserts the row, then looks up the owning
//!    client's project key.
//! 3. `SlugAllocator::allocate()` reads the counter, proposes `last + 1`, and
//!    commits the counter bump and the task's slug in one transaction. A lost
//!    race retries with jittered backoff up to the configured attempt budget.
//! 4. If allocation fails the task row is removed and the error returned; a
//!    client without a key leaves the task slug-less until `backfill`.
//! 5. The created task is broadcast as `TaskCreated` over the WebSocket.

pub mod allocator;
pub mod api;
pub mod db;
pub mod models;
pub mod server;
pub mod slug;
pub mod ws;
