//! CLI command implementations.
//!
//! | Module   | Commands handled                      |
//! |----------|---------------------------------------|
//! | `serve`  | `Serve`, `Init`                       |
//! | `slugs`  | `Resolve`, `Allocate`, `Backfill`     |
//! | `config` | `Config`                              |

pub mod config;
pub mod serve;
pub mod slugs;

pub use config::cmd_config;
pub use serve::{cmd_init, cmd_serve};
pub use slugs::{cmd_allocate, cmd_backfill, cmd_resolve};
