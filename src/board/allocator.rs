//! Per-key slug numbering under optimistic concurrency.
//!
//! ## Protocol
//!
//! 1. Resolve the key's counter record, creating it lazily (counters at 0).
//! 2. Read the record by id and compute `next = last + 1` for the entity kind.
//! 3. Commit: compare-and-set the counter from `last` to `next` and write the
//!    slug onto the entity, both in one store transaction.
//! 4. On a conflict (another writer moved the counter first) back off and go
//!    to 2. A vanished counter or entity is terminal.
//!
//! A committed number is never handed out twice: a successful commit strictly
//! increases the stored counter and any writer holding a stale read fails its
//! compare-and-set. The loop is bounded by [`RetryPolicy::max_attempts`].

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use super::models::{CounterRecord, EntityKind, NewCounter};
use super::slug::{Slug, normalize_key};
use crate::errors::SlugError;

/// Slug state of a target entity as seen by the allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitySlugState {
    Missing,
    Unassigned,
    Assigned(Slug),
}

/// Result of one compare-and-set commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The counter no longer holds the value the attempt was based on.
    Conflict,
    CounterMissing,
    EntityMissing,
    /// Another allocator assigned the entity's slug first; nothing was written.
    AlreadyAssigned(Slug),
}

/// Storage operations the allocator needs. Implemented by the SQLite store;
/// anything offering a conditional write can back it.
pub trait CounterStore {
    fn find_counter(&self, key: &str) -> anyhow::Result<Option<CounterRecord>>;

    /// Insert a counter record unless one already exists for the key.
    /// Returns `true` if this call created it.
    fn insert_counter(&self, new: &NewCounter<'_>) -> anyhow::Result<bool>;

    fn load_counter(&self, id: i64) -> anyhow::Result<Option<CounterRecord>>;

    fn entity_slug(&self, kind: EntityKind, entity_id: i64) -> anyhow::Result<EntitySlugState>;

    /// Atomically move `kind`'s counter on record `counter_id` from
    /// `expected_last` to `slug.number` and store `slug` on the entity.
    /// Must write nothing unless both updates apply.
    fn commit_allocation(
        &self,
        counter_id: i64,
        kind: EntityKind,
        expected_last: i64,
        entity_id: i64,
        slug: &Slug,
    ) -> anyhow::Result<CommitOutcome>;
}

/// Bounds on the compare-and-set loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            backoff_base: Duration::from_millis(2),
            backoff_jitter: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    /// Retry without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_base: Duration::ZERO,
            backoff_jitter: Duration::ZERO,
        }
    }

    /// Delay before the attempt following `attempt` (1-based): exponential in
    /// the attempt number, capped at 64x the base, plus uniform jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(6);
        let base = self.backoff_base.saturating_mul(1 << exp);
        let jitter_us = u64::try_from(self.backoff_jitter.as_micros()).unwrap_or(u64::MAX);
        let jitter = if jitter_us > 0 {
            Duration::from_micros(rand::rng().random_range(0..=jitter_us))
        } else {
            Duration::ZERO
        };
        base + jitter
    }
}

/// Hands out slugs for tasks, sprints and projects.
pub struct SlugAllocator<'a, S: CounterStore + ?Sized> {
    store: &'a S,
    policy: RetryPolicy,
}

impl<'a, S: CounterStore + ?Sized> SlugAllocator<'a, S> {
    pub fn new(store: &'a S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Return the counter record for `key`, creating it with all counters at 0
    /// if absent. Concurrent creators of the same key converge on one row.
    pub fn resolve_counter(
        &self,
        key: &str,
        owner_id: Option<i64>,
        description: &str,
    ) -> Result<CounterRecord, SlugError> {
        let key = normalize_key(key)?;
        if let Some(record) = self.store.find_counter(&key)? {
            return Ok(record);
        }

        let created = self.store.insert_counter(&NewCounter {
            key: &key,
            owner_id,
            description,
        })?;
        if created {
            info!(key = %key, owner_id, "created counter record");
        }

        self.store
            .find_counter(&key)?
            .ok_or_else(|| SlugError::not_found(format!("Counter record for key {}", key)))
    }

    /// Assign the next slug of `kind` under `key` to the entity, or return the
    /// slug it already has.
    pub fn allocate(
        &self,
        kind: EntityKind,
        entity_id: i64,
        key: &str,
        owner_id: Option<i64>,
    ) -> Result<Slug, SlugError> {
        match self.store.entity_slug(kind, entity_id)? {
            EntitySlugState::Missing => {
                return Err(SlugError::not_found(format!("{} {}", kind, entity_id)));
            }
            EntitySlugState::Assigned(existing) => return Ok(existing),
            EntitySlugState::Unassigned => {}
        }

        let description = format!("Slug numbering for {}", key.trim().to_ascii_uppercase());
        let counter = self.resolve_counter(key, owner_id, &description)?;
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let current = self
                .store
                .load_counter(counter.id)?
                .ok_or_else(|| SlugError::not_found(format!("Counter record {}", counter.id)))?;
            let last = current.last_number(kind);
            let slug = Slug::new(kind, &current.key, last + 1);

            match self
                .store
                .commit_allocation(current.id, kind, last, entity_id, &slug)?
            {
                CommitOutcome::Committed => {
                    debug!(slug = %slug, entity_id, attempt, "assigned slug");
                    return Ok(slug);
                }
                CommitOutcome::AlreadyAssigned(existing) => {
                    debug!(slug = %existing, entity_id, "slug assigned concurrently");
                    return Ok(existing);
                }
                CommitOutcome::CounterMissing => {
                    return Err(SlugError::not_found(format!("Counter record {}", current.id)));
                }
                CommitOutcome::EntityMissing => {
                    return Err(SlugError::not_found(format!("{} {}", kind, entity_id)));
                }
                CommitOutcome::Conflict => {
                    debug!(key = %current.key, kind = %kind, attempt, "counter conflict, retrying");
                    if attempt < max_attempts {
                        std::thread::sleep(self.policy.delay_for(attempt));
                    }
                }
            }
        }

        warn!(key = %counter.key, kind = %kind, attempts = max_attempts, "slug allocation gave up");
        Err(SlugError::ContentionExceeded {
            key: counter.key,
            kind,
            attempts: max_attempts,
        })
    }
}
