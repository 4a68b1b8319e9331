//! Conflict policy for diverged replicas.
//!
//! The system is last-writer-wins at whole-document granularity, gated by
//! the version number. There is no character-level merge: when a write is
//! rejected, the session either adopts the store's state or retries its own
//! buffer against the refreshed version.

use serde::{Deserialize, Serialize};

/// What an editing session does when its compare-and-set write is rejected.
///
/// The two strategies have opposite data-loss characteristics under true
/// concurrent editing:
///
/// - `Strict` never overwrites a concurrent writer, but discards the local
///   unsaved buffer.
/// - `Override` preserves the local buffer by re-writing it at the current
///   version, silently discarding the other writer's intervening edit.
///
/// Either way the store's version invariant holds: every successful write
/// observed the latest version at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergencePolicy {
    /// Drop the local buffer and adopt the remote content.
    Strict,

    /// Retry the local buffer against the refreshed version.
    #[default]
    Override,
}

/// Outcome of consulting the policy against the store's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    AdoptRemote { content: String, version: u64 },
    RetryWrite { expected_version: u64 },
}

impl ConvergencePolicy {
    pub fn resolve(&self, current_version: u64, current_content: String) -> Resolution {
        match self {
            ConvergencePolicy::Strict => Resolution::AdoptRemote {
                content: current_content,
                version: current_version,
            },
            ConvergencePolicy::Override => Resolution::RetryWrite {
                expected_version: current_version,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_adopts_remote_state() {
        let resolution = ConvergencePolicy::Strict.resolve(4, "theirs".to_string());
        assert_eq!(
            resolution,
            Resolution::AdoptRemote {
                content: "theirs".to_string(),
                version: 4,
            }
        );
    }

    #[test]
    fn override_retries_at_current_version() {
        let resolution = ConvergencePolicy::Override.resolve(4, "theirs".to_string());
        assert_eq!(resolution, Resolution::RetryWrite { expected_version: 4 });
    }

    #[test]
    fn default_policy_is_override() {
        assert_eq!(ConvergencePolicy::default(), ConvergencePolicy::Override);
    }
}
