//! Transactional access to the stores
//!
//! All mutations run inside a write transaction. Side effects the body
//! triggers (pub/sub events, driver kills, follow-up work) are buffered and
//! escape only after the transaction commits; a failed transaction restores
//! the pre-transaction snapshot and discards every buffered effect.
//!
//! Nesting: a transaction body receives `&mut WriteContext`; nested
//! operations are functions taking the same context, so inner work shares the
//! outer buffers and the finalizer runs exactly once at the outermost commit.

use std::sync::RwLock;

use tracing::debug;

use super::mem::StoreState;
use crate::events::{EventSink, PubsubEvent};
use crate::machine::work::WorkQueue;

/// Effects accumulated during a write transaction.
#[derive(Debug, Default)]
pub struct SideEffects {
    /// Deferred state-machine work, drained by the finalizer.
    pub work: WorkQueue,
    events: Vec<PubsubEvent>,
    kills: Vec<String>,
}

impl SideEffects {
    /// Buffer an event for post-commit publication.
    pub fn add_event(&mut self, event: PubsubEvent) {
        self.events.push(event);
    }

    /// Record a driver kill to issue post-commit.
    pub fn add_kill(&mut self, task_id: impl Into<String>) {
        self.kills.push(task_id.into());
    }
}

/// Store provider plus side-effect buffers handed to a write transaction.
pub struct WriteContext<'a> {
    pub stores: &'a mut StoreState,
    pub effects: &'a mut SideEffects,
}

/// Task ids whose kills must be issued to the driver, in drain order.
/// Produced by a committed transaction.
#[derive(Debug, Default)]
pub struct CommittedEffects {
    pub kills: Vec<String>,
}

/// Single-writer transactional wrapper around the in-memory stores.
///
/// Write transactions serialize; read transactions run in parallel with each
/// other.
pub struct TransactionalStorage {
    state: RwLock<StoreState>,
    events: EventSink,
}

impl TransactionalStorage {
    pub fn new(events: EventSink) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    /// Run a read-only transaction.
    pub fn read<T>(&self, work: impl FnOnce(&StoreState) -> T) -> T {
        let guard = self.state.read().expect("storage lock poisoned");
        work(&guard)
    }

    /// Run a write transaction.
    ///
    /// `body` performs the mutation and may enqueue deferred work;
    /// `finalizer` drains the work queue against the still-open transaction.
    /// On success the new state is committed, buffered events are published,
    /// and the recorded kills are returned for the caller to issue. On error
    /// the snapshot is restored and nothing escapes.
    pub fn write<T, E, B, F>(&self, body: B, finalizer: F) -> Result<(T, CommittedEffects), E>
    where
        B: FnOnce(&mut WriteContext<'_>) -> Result<T, E>,
        F: FnOnce(&mut WriteContext<'_>),
    {
        let mut guard = self.state.write().expect("storage lock poisoned");
        let snapshot = guard.clone();
        let mut effects = SideEffects::default();

        let outcome = {
            let mut ctx = WriteContext {
                stores: &mut guard,
                effects: &mut effects,
            };
            body(&mut ctx).map(|value| {
                finalizer(&mut ctx);
                value
            })
        };

        match outcome {
            Ok(value) => {
                debug_assert!(effects.work.is_empty(), "finalizer left work undrained");
                drop(guard);
                debug!(events = effects.events.len(), kills = effects.kills.len(), "transaction committed");
                self.events.publish_all(effects.events);
                Ok((value, CommittedEffects { kills: effects.kills }))
            }
            Err(err) => {
                *guard = snapshot;
                debug!("transaction aborted, snapshot restored");
                Err(err)
            }
        }
    }

    /// Subscribe to post-commit events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PubsubEvent> {
        self.events.subscribe()
    }
}
