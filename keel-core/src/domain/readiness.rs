//! Derived readiness of a watched workload

use serde::{Deserialize, Serialize};

/// Display state derived from replica counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadinessState {
    /// Never observed
    #[default]
    Unknown,
    Starting,
    Running,
    NotReady,
    Updating,
}

impl std::fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessState::Unknown => write!(f, ""),
            ReadinessState::Starting => write!(f, "Starting"),
            ReadinessState::Running => write!(f, "Running"),
            ReadinessState::NotReady => write!(f, "NotReady"),
            ReadinessState::Updating => write!(f, "Updating"),
        }
    }
}

/// Computes the next readiness state
///
/// Rules are checked in order:
/// 1. all desired replicas ready (and at least one desired) → Running
/// 2. never been running yet → Starting
/// 3. nothing ready → NotReady
/// 4. otherwise → Updating
pub fn transition_state(
    desired_replicas: i32,
    ready_replicas: i32,
    previous: ReadinessState,
) -> ReadinessState {
    if desired_replicas > 0 && desired_replicas == ready_replicas {
        return ReadinessState::Running;
    }

    if matches!(previous, ReadinessState::Unknown | ReadinessState::Starting) {
        return ReadinessState::Starting;
    }

    if ready_replicas == 0 {
        return ReadinessState::NotReady;
    }

    ReadinessState::Updating
}
