//! Error taxonomy for a mining run.
//!
//! Per-line problems ([`InputError`]) are absorbed by the run and counted.
//! Everything else in [`MinerError`] is a per-run outcome: fetch and state
//! failures abort the run, lock contention turns it into a no-op, and
//! forwarding failures only degrade it.

use thiserror::Error;

/// A line that cannot be turned into a token sequence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("line contains a NUL byte at offset {offset}")]
    NulByte { offset: usize },
    #[error("line contains control character U+{code:04X} at offset {offset}")]
    ControlCharacter { code: u32, offset: usize },
}

/// Run-level failures.
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("invalid input: {0}")]
    Input(#[from] InputError),

    #[error("log store unavailable after {attempts} attempt(s): {reason}")]
    FetchUnavailable { attempts: u32, reason: String },

    #[error("state backend unavailable after {attempts} attempt(s): {reason}")]
    StateUnavailable { attempts: u32, reason: String },

    #[error("state write failed after {attempts} attempt(s): {reason}")]
    StateWriteFailed { attempts: u32, reason: String },

    #[error("run lock '{lock}' is held by another run")]
    LockContention { lock: String },

    #[error("sink unavailable ({delivered} delivered, {undelivered} undelivered): {reason}")]
    ForwardUnavailable {
        delivered: usize,
        undelivered: usize,
        reason: String,
    },

    #[error("run timed out during {stage}")]
    RunTimedOut { stage: &'static str },

    #[error("configuration error: {0}")]
    Config(String),
}

impl MinerError {
    /// Whether the run should exit with a failure status.
    ///
    /// Lock contention is a no-op and a degraded forward still counts as a
    /// successful run once state has been saved.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MinerError::LockContention { .. } | MinerError::ForwardUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!MinerError::LockContention { lock: "l".into() }.is_fatal());
        assert!(!MinerError::ForwardUnavailable {
            delivered: 1,
            undelivered: 2,
            reason: "down".into()
        }
        .is_fatal());
        assert!(MinerError::StateUnavailable {
            attempts: 3,
            reason: "down".into()
        }
        .is_fatal());
        assert!(MinerError::RunTimedOut { stage: "fetch" }.is_fatal());
    }

    #[test]
    fn test_input_error_converts() {
        let err: MinerError = InputError::NulByte { offset: 3 }.into();
        assert!(err.to_string().contains("NUL byte at offset 3"));
    }
}
