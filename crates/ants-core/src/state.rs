use serde::{Deserialize, Serialize};

/// Lifecycle state of an executor.
///
/// Moves forward only: `Creating -> Pending -> Running -> {Succeeded, Failed,
/// Removing, Unknown}`. A new command may move a ready executor back into
/// `Running`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    #[default]
    Creating,
    Pending,
    Running,
    Succeeded,
    Failed,
    Removing,
    Unknown,
}

impl State {
    pub fn ready_or_running(&self) -> bool {
        matches!(self, State::Creating | State::Pending | State::Running)
    }

    /// Terminal states.
    pub fn done(&self) -> bool {
        matches!(
            self,
            State::Removing | State::Unknown | State::Succeeded | State::Failed
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Creating => write!(f, "CREATING"),
            State::Pending => write!(f, "PENDING"),
            State::Running => write!(f, "RUNNING"),
            State::Succeeded => write!(f, "SUCCEEDED"),
            State::Failed => write!(f, "FAILED"),
            State::Removing => write!(f, "REMOVING"),
            State::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_and_done_partition_states() {
        let all = [
            State::Creating,
            State::Pending,
            State::Running,
            State::Succeeded,
            State::Failed,
            State::Removing,
            State::Unknown,
        ];
        for state in all {
            assert_ne!(state.ready_or_running(), state.done(), "{}", state);
        }
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(serde_json::to_string(&State::Removing).unwrap(), "\"REMOVING\"");
        let state: State = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(state, State::Running);
    }
}
