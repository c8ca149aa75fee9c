//! App status state machine (spec §4.4), built with `rust-fsm` the same way
//! the teacher's `Controller` models `OperationMode`.

use rust_fsm::*;

state_machine! {
    derive(Debug)
    pub AppStatusMachine(Created)

    Created => {
        Initialize => Initializing,
    },
    Initializing => {
        InitSucceeded => Running,
        InitFailed => Failed,
    },
    Running(Terminate) => Finalizing,
    Finalizing(FinalizeDone) => Terminated,
}

/// Flattened, introspection-friendly mirror of the fsm's internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Created,
    Initializing,
    Running,
    Finalizing,
    Terminated,
    Failed,
}

impl From<&AppStatusMachineState> for AppStatus {
    fn from(state: &AppStatusMachineState) -> Self {
        match state {
            AppStatusMachineState::Created => AppStatus::Created,
            AppStatusMachineState::Initializing => AppStatus::Initializing,
            AppStatusMachineState::Running => AppStatus::Running,
            AppStatusMachineState::Finalizing => AppStatus::Finalizing,
            AppStatusMachineState::Terminated => AppStatus::Terminated,
            AppStatusMachineState::Failed => AppStatus::Failed,
        }
    }
}

impl AppStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AppStatus::Terminated | AppStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_running_then_terminated() {
        let mut m: StateMachine<AppStatusMachine> = StateMachine::new();
        assert_eq!(AppStatus::from(m.state()), AppStatus::Created);
        m.consume(&AppStatusMachineInput::Initialize).unwrap();
        assert_eq!(AppStatus::from(m.state()), AppStatus::Initializing);
        m.consume(&AppStatusMachineInput::InitSucceeded).unwrap();
        assert_eq!(AppStatus::from(m.state()), AppStatus::Running);
        m.consume(&AppStatusMachineInput::Terminate).unwrap();
        assert_eq!(AppStatus::from(m.state()), AppStatus::Finalizing);
        m.consume(&AppStatusMachineInput::FinalizeDone).unwrap();
        assert_eq!(AppStatus::from(m.state()), AppStatus::Terminated);
    }

    #[test]
    fn init_failure_goes_to_failed_without_running() {
        let mut m: StateMachine<AppStatusMachine> = StateMachine::new();
        m.consume(&AppStatusMachineInput::Initialize).unwrap();
        m.consume(&AppStatusMachineInput::InitFailed).unwrap();
        assert_eq!(AppStatus::from(m.state()), AppStatus::Failed);
        assert!(AppStatus::from(m.state()).is_terminal());
    }
}
