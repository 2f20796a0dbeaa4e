//! Telemetry snapshot and the single-writer publication primitive
//!
//! The feed task owns the only [`SnapshotPublisher`]. Every publish swaps in a
//! fresh `Arc<TelemetrySnapshot>` through a tokio `watch` channel, so readers
//! either see a whole snapshot from one frame or the previous one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Identifier the controller assigns to a queued motion command
pub type CommandId = u64;

/// Robot mode reported in the feedback frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotMode {
    Init = 1,
    BrakeOpen = 2,
    PowerOff = 3,
    Disabled = 4,
    Enabled = 5,
    Dragging = 6,
    Running = 7,
    Recording = 8,
    Error = 9,
    Paused = 10,
    Jogging = 11,
}

impl RobotMode {
    pub fn from_code(code: u64) -> Option<Self> {
        let mode = match code {
            1 => RobotMode::Init,
            2 => RobotMode::BrakeOpen,
            3 => RobotMode::PowerOff,
            4 => RobotMode::Disabled,
            5 => RobotMode::Enabled,
            6 => RobotMode::Dragging,
            7 => RobotMode::Running,
            8 => RobotMode::Recording,
            9 => RobotMode::Error,
            10 => RobotMode::Paused,
            11 => RobotMode::Jogging,
            _ => return None,
        };
        Some(mode)
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn name(self) -> &'static str {
        match self {
            RobotMode::Init => "ROBOT_MODE_INIT",
            RobotMode::BrakeOpen => "ROBOT_MODE_BRAKE_OPEN",
            RobotMode::PowerOff => "ROBOT_MODE_POWER_OFF",
            RobotMode::Disabled => "ROBOT_MODE_DISABLED",
            RobotMode::Enabled => "ROBOT_MODE_ENABLE",
            RobotMode::Dragging => "ROBOT_MODE_DRAG",
            RobotMode::Running => "ROBOT_MODE_RUNNING",
            RobotMode::Recording => "ROBOT_MODE_RECORDING",
            RobotMode::Error => "ROBOT_MODE_ERROR",
            RobotMode::Paused => "ROBOT_MODE_PAUSE",
            RobotMode::Jogging => "ROBOT_MODE_JOG",
        }
    }
}

/// Single-byte status flags from the feedback frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    pub brake: bool,
    pub enabled: bool,
    pub drag: bool,
    pub running: bool,
    pub error: bool,
    pub jog: bool,
    pub collision: bool,
}

/// One fully decoded feedback frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub robot_mode: RobotMode,
    pub active_command_id: CommandId,
    /// Length field of the frame (diagnostic)
    pub message_size: u16,
    pub digital_inputs: u64,
    pub digital_outputs: u64,
    /// Actual joint angles in degrees
    pub joint_angles: [f64; 6],
    /// Actual tool pose [x, y, z, rx, ry, rz] in mm and degrees
    pub tool_pose: [f64; 6],
    pub speed_scaling: f64,
    /// Controller timestamp in milliseconds
    pub controller_time_ms: u64,
    pub status: StatusFlags,
    /// Publish counter assigned by the feed, starts at 1
    pub sequence: u64,
    /// Wall-clock seconds when the frame was decoded
    pub received_at: f64,
}

impl TelemetrySnapshot {
    /// The controller reports a command as finished once it is back in the
    /// enabled state with that command as the current one.
    pub fn is_command_complete(&self, command_id: CommandId) -> bool {
        self.robot_mode == RobotMode::Enabled && self.active_command_id == command_id
    }

    pub fn digital_input(&self, index: u32) -> bool {
        index < 64 && self.digital_inputs & (1u64 << index) != 0
    }

    pub fn digital_output(&self, index: u32) -> bool {
        index < 64 && self.digital_outputs & (1u64 << index) != 0
    }
}

/// Create a linked publisher/reader pair with no snapshot yet
pub fn snapshot_channel() -> (SnapshotPublisher, SnapshotReader) {
    let (sender, receiver) = watch::channel(None);
    (SnapshotPublisher { sender }, SnapshotReader { receiver })
}

/// Write side, held only by the feed
#[derive(Debug)]
pub struct SnapshotPublisher {
    sender: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
}

impl SnapshotPublisher {
    /// Replace the published snapshot in one step
    pub fn publish(&self, snapshot: impl Into<Arc<TelemetrySnapshot>>) {
        self.sender.send_replace(Some(snapshot.into()));
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Read side, cheap to clone and share between tasks
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    receiver: watch::Receiver<Option<Arc<TelemetrySnapshot>>>,
}

impl SnapshotReader {
    /// Latest published snapshot, if any frame has been accepted yet
    pub fn latest(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next publish; returns `None` once the feed has gone away
    pub async fn next(&mut self) -> Option<Arc<TelemetrySnapshot>> {
        self.receiver.changed().await.ok()?;
        self.receiver.borrow_and_update().clone()
    }
}

#[cfg(test)]
pub(crate) fn sample_snapshot(sequence: u64, mode: RobotMode, command_id: CommandId) -> TelemetrySnapshot {
    let value = sequence as f64;
    TelemetrySnapshot {
        robot_mode: mode,
        active_command_id: command_id,
        message_size: 1440,
        digital_inputs: sequence,
        digital_outputs: sequence,
        joint_angles: [value; 6],
        tool_pose: [value; 6],
        speed_scaling: value,
        controller_time_ms: sequence,
        status: StatusFlags::default(),
        sequence,
        received_at: value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_robot_mode_codes() {
        for code in 1..=11 {
            let mode = RobotMode::from_code(code).unwrap();
            assert_eq!(mode.code(), code);
        }
        assert_eq!(RobotMode::from_code(0), None);
        assert_eq!(RobotMode::from_code(12), None);
        assert_eq!(RobotMode::Enabled.name(), "ROBOT_MODE_ENABLE");
    }

    #[test]
    fn test_reader_starts_empty() {
        let (_publisher, reader) = snapshot_channel();
        assert!(reader.latest().is_none());
    }

    #[test]
    fn test_publish_replaces_snapshot() {
        let (publisher, reader) = snapshot_channel();
        publisher.publish(sample_snapshot(1, RobotMode::Running, 40));
        let first = reader.latest().unwrap();

        publisher.publish(sample_snapshot(2, RobotMode::Enabled, 41));
        let second = reader.latest().unwrap();

        // The earlier Arc is untouched by the later publish
        assert_eq!(first.sequence, 1);
        assert_eq!(first.active_command_id, 40);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.robot_mode, RobotMode::Enabled);
    }

    #[test]
    fn test_command_completion_predicate() {
        assert!(sample_snapshot(1, RobotMode::Enabled, 42).is_command_complete(42));
        assert!(!sample_snapshot(1, RobotMode::Running, 42).is_command_complete(42));
        assert!(!sample_snapshot(1, RobotMode::Enabled, 41).is_command_complete(42));
    }

    #[test]
    fn test_digital_bits() {
        let mut snapshot = sample_snapshot(1, RobotMode::Enabled, 0);
        snapshot.digital_inputs = 0b1010;
        assert!(snapshot.digital_input(1));
        assert!(!snapshot.digital_input(2));
        assert!(snapshot.digital_input(3));
        assert!(!snapshot.digital_input(64));
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish() {
        let (publisher, mut reader) = snapshot_channel();
        let waiter = tokio::spawn(async move { reader.next().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        publisher.publish(sample_snapshot(3, RobotMode::Enabled, 9));

        let snapshot = waiter.await.unwrap().unwrap();
        assert_eq!(snapshot.sequence, 3);
    }

    #[test]
    fn test_concurrent_readers_never_see_mixed_fields() {
        let (publisher, reader) = snapshot_channel();
        publisher.publish(sample_snapshot(1, RobotMode::Running, 1));

        let writer = std::thread::spawn(move || {
            for i in 2..2000u64 {
                publisher.publish(sample_snapshot(i, RobotMode::Running, i));
            }
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            let reader = reader.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..2000 {
                    let snapshot = reader.latest().unwrap();
                    // Every field was derived from the same sequence number
                    let value = snapshot.sequence as f64;
                    assert_eq!(snapshot.active_command_id, snapshot.sequence);
                    assert_eq!(snapshot.digital_inputs, snapshot.sequence);
                    assert_eq!(snapshot.joint_angles, [value; 6]);
                    assert_eq!(snapshot.tool_pose, [value; 6]);
                }
            }));
        }

        writer.join().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
