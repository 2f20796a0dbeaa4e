//! Error types for Dobot control operations

use std::time::Duration;
use thiserror::Error;

use crate::snapshot::CommandId;

pub type Result<T> = std::result::Result<T, DobotError>;

#[derive(Error, Debug)]
pub enum DobotError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dashboard protocol error: {0}")]
    Protocol(String),

    /// The controller is not accepting TCP commands (another control source owns it)
    #[error("Control mode is not TCP: {reply}")]
    WrongControlMode { reply: String },

    #[error("Reply carried no status values: {reply}")]
    EmptyReply { reply: String },

    #[error("Command rejected by controller (code {code}): {reply}")]
    Rejected { code: i64, reply: String },

    #[error("Command {command_id} did not complete within {waited:?}")]
    Timeout { command_id: CommandId, waited: Duration },

    #[error("Wait for command {command_id} was cancelled")]
    Cancelled { command_id: CommandId },

    #[error("Tool did not reach the target pose within {waited:?}")]
    TargetNotReached { waited: Duration },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("No Modbus session open on the tool port")]
    NoModbusSession,

    #[error("Device write failed (code {code}): {reply}")]
    Device { code: i64, reply: String },

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DobotError {
    /// True for errors raised by the controller refusing a command
    pub fn is_rejection(&self) -> bool {
        matches!(self, DobotError::Rejected { .. } | DobotError::WrongControlMode { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DobotError::Timeout { .. } | DobotError::TargetNotReached { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_and_timeout_are_distinct() {
        let rejected = DobotError::Rejected { code: -2, reply: "-2,{},MovJ();".to_string() };
        let timed_out = DobotError::Timeout { command_id: 7, waited: Duration::from_secs(1) };

        assert!(rejected.is_rejection());
        assert!(!rejected.is_timeout());
        assert!(timed_out.is_timeout());
        assert!(!timed_out.is_rejection());
    }

    #[test]
    fn test_error_display() {
        let err = DobotError::Device { code: -1, reply: "-1,{},SetHoldRegs();".to_string() };
        assert!(format!("{}", err).contains("code -1"));

        let err = DobotError::NoModbusSession;
        assert_eq!(format!("{}", err), "No Modbus session open on the tool port");
    }
}
