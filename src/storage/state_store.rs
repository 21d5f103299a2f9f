//! State store adapter: load/save of [`PersistedState`] plus the run lock.
//!
//! Every backend call goes through the store's [`RetryPolicy`]. Exhausted
//! reads surface as `StateUnavailable`, exhausted writes as
//! `StateWriteFailed`. A blob that is readable but does not decode is not an
//! outage: the store logs a warning and hands back an empty state so the run
//! can rebuild.

use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::codec;
use super::{BackendError, PersistedState, StateBackend};
use crate::error::MinerError;
use crate::retry::{RetryError, RetryPolicy};
use crate::types::now_ms;

/// Fixed name of the run lock.
pub const LOCK_KEY: &str = "template-miner:run-lock";

/// Where a loaded state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrigin {
    /// Nothing stored yet: first run or after a reset.
    Fresh,
    /// Decoded from the backend.
    Restored,
    /// Stored blob was corrupt and has been replaced by an empty state.
    Rebuilt,
}

impl fmt::Display for StateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateOrigin::Fresh => write!(f, "fresh"),
            StateOrigin::Restored => write!(f, "restored"),
            StateOrigin::Rebuilt => write!(f, "rebuilt"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedState {
    pub state: PersistedState,
    pub origin: StateOrigin,
}

/// Proof of holding the run lock. Expires on its own after the TTL.
#[derive(Debug)]
pub struct RunLease {
    owner: String,
    acquired_at_ms: u64,
    ttl: Duration,
}

impl RunLease {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn acquired_at_ms(&self) -> u64 {
        self.acquired_at_ms
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn unavailable(err: RetryError<BackendError>) -> MinerError {
    MinerError::StateUnavailable {
        attempts: err.attempts(),
        reason: err.into_inner().to_string(),
    }
}

pub struct StateStore {
    backend: Box<dyn StateBackend>,
    key: String,
    compress: bool,
    retry: RetryPolicy,
}

impl StateStore {
    pub fn new(
        backend: Box<dyn StateBackend>,
        key: impl Into<String>,
        compress: bool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            key: key.into(),
            compress,
            retry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the persisted state, or an empty one if none is stored.
    pub fn load(&self) -> Result<LoadedState, MinerError> {
        let blob = self
            .retry
            .run("state load", || self.backend.get(&self.key))
            .map_err(unavailable)?;

        let Some(bytes) = blob else {
            info!("No state stored under '{}', starting fresh", self.key);
            return Ok(LoadedState {
                state: PersistedState::default(),
                origin: StateOrigin::Fresh,
            });
        };

        match codec::decode(&bytes) {
            Ok(state) => {
                debug!(
                    "Loaded state '{}': {} bytes, {} clusters, cursor {}",
                    self.key,
                    bytes.len(),
                    state.tree.len(),
                    state.cursor
                );
                Ok(LoadedState {
                    state,
                    origin: StateOrigin::Restored,
                })
            }
            Err(e) => {
                warn!(
                    "State '{}' is corrupt ({}); rebuilding from an empty tree",
                    self.key, e
                );
                Ok(LoadedState {
                    state: PersistedState::default(),
                    origin: StateOrigin::Rebuilt,
                })
            }
        }
    }

    /// Write `state` in one backend call. Returns the encoded size.
    pub fn save(&self, state: &PersistedState) -> Result<usize, MinerError> {
        let bytes =
            codec::encode(state, self.compress).map_err(|e| MinerError::StateWriteFailed {
                attempts: 0,
                reason: e.to_string(),
            })?;

        self.retry
            .run("state save", || self.backend.set(&self.key, &bytes))
            .map_err(|err| MinerError::StateWriteFailed {
                attempts: err.attempts(),
                reason: err.into_inner().to_string(),
            })?;

        debug!("Saved state '{}': {} bytes", self.key, bytes.len());
        Ok(bytes.len())
    }

    /// Take the run lock for `ttl`.
    ///
    /// Fails with `LockContention` while another run holds a live lease.
    pub fn acquire_lock(&self, ttl: Duration) -> Result<RunLease, MinerError> {
        let owner = Uuid::new_v4().to_string();

        let acquired = self
            .retry
            .run("lock acquire", || {
                self.backend.set_with_lease(LOCK_KEY, owner.as_bytes(), ttl)
            })
            .map_err(unavailable)?;

        if !acquired {
            return Err(MinerError::LockContention {
                lock: LOCK_KEY.to_string(),
            });
        }

        debug!("Acquired run lock {} for {}s", owner, ttl.as_secs());
        Ok(RunLease {
            owner,
            acquired_at_ms: now_ms(),
            ttl,
        })
    }

    /// Give the lock back if it is still ours.
    ///
    /// Returns `false` when the lease had already expired or moved on to
    /// another run.
    pub fn release_lock(&self, lease: RunLease) -> Result<bool, MinerError> {
        let released = self
            .retry
            .run("lock release", || {
                self.backend
                    .delete_if_equal(LOCK_KEY, lease.owner.as_bytes())
            })
            .map_err(unavailable)?;

        if !released {
            warn!(
                "Run lock {} expired before release (held {}ms, ttl {}s)",
                lease.owner,
                now_ms().saturating_sub(lease.acquired_at_ms),
                lease.ttl.as_secs()
            );
        }
        Ok(released)
    }

    /// Drop the stored state. The next load starts fresh.
    pub fn reset(&self) -> Result<bool, MinerError> {
        self.retry
            .run("state reset", || self.backend.delete(&self.key))
            .map_err(|err| MinerError::StateWriteFailed {
                attempts: err.attempts(),
                reason: err.into_inner().to_string(),
            })
    }
}
