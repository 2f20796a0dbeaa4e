//! JSON-based Robot Monitoring
//!
//! Turns published snapshots into JSON lines with change detection and
//! publication rate limiting.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::PublishingConfig;
use crate::snapshot::{RobotMode, StatusFlags, TelemetrySnapshot};

/// Tool pose and joint angles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionData {
    /// Controller timestamp in seconds
    pub rtime: f64,
    /// Wall-clock seconds when the frame was decoded
    pub stime: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// [x, y, z, rx, ry, rz] in mm and degrees
    pub tool_pose: [f64; 6],
    /// Joint angles in degrees
    pub joint_angles: [f64; 6],
}

/// Robot mode and status flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStateData {
    pub rtime: f64,
    pub stime: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub robot_mode: u64,
    pub robot_mode_name: String,
    pub active_command_id: u64,
    pub status: StatusFlags,
}

impl PositionData {
    pub fn new_rounded(snapshot: &TelemetrySnapshot, decimal_places: u32) -> Self {
        let multiplier = 10.0_f64.powi(decimal_places as i32);
        let round = |values: [f64; 6]| values.map(|v| (v * multiplier).round() / multiplier);

        Self {
            rtime: snapshot.controller_time_ms as f64 / 1000.0,
            stime: snapshot.received_at,
            event_type: "position".to_string(),
            tool_pose: round(snapshot.tool_pose),
            joint_angles: round(snapshot.joint_angles),
        }
    }
}

impl RobotStateData {
    pub fn new(snapshot: &TelemetrySnapshot) -> Self {
        Self {
            rtime: snapshot.controller_time_ms as f64 / 1000.0,
            stime: snapshot.received_at,
            event_type: "robot_state".to_string(),
            robot_mode: snapshot.robot_mode.code(),
            robot_mode_name: snapshot.robot_mode.name().to_string(),
            active_command_id: snapshot.active_command_id,
            status: snapshot.status,
        }
    }
}

/// Monitor output manager that handles dynamic output and rate limiting
pub struct MonitorOutput {
    last_position: Option<([f64; 6], [f64; 6])>,
    last_robot_state: Option<(RobotMode, u64, StatusFlags)>,
    last_position_output: Option<Instant>,
    pub_rate_hz: u32,
    /// 0.01 mm or 0.01 degrees
    position_threshold: f64,
    dynamic_mode: bool,
    pub decimal_places: u32,
}

impl MonitorOutput {
    pub fn new(pub_rate_hz: u32, dynamic_mode: bool, decimal_places: u32) -> Self {
        Self {
            last_position: None,
            last_robot_state: None,
            last_position_output: None,
            pub_rate_hz,
            position_threshold: 0.01,
            dynamic_mode,
            decimal_places,
        }
    }

    pub fn from_config(config: &PublishingConfig) -> Self {
        Self::new(config.pub_rate_hz, config.dynamic, config.decimal_places)
    }

    /// Rate-limited; in dynamic mode also suppressed until something moves
    pub fn should_output_position(&mut self, tool_pose: [f64; 6], joint_angles: [f64; 6], now: Instant) -> bool {
        if let Some(last_output) = self.last_position_output {
            if self.pub_rate_hz > 0 {
                let min_interval = Duration::from_millis(1000 / self.pub_rate_hz as u64);
                if now.duration_since(last_output) < min_interval {
                    return false;
                }
            }
        }

        if self.dynamic_mode {
            if let Some((last_tool, last_joints)) = self.last_position {
                if !self.positions_changed(&last_tool, &tool_pose) && !self.positions_changed(&last_joints, &joint_angles) {
                    return false;
                }
            }
        }

        self.last_position = Some((tool_pose, joint_angles));
        self.last_position_output = Some(now);
        true
    }

    /// Never rate limited, only change detection
    pub fn should_output_robot_state(&mut self, mode: RobotMode, command_id: u64, status: StatusFlags) -> bool {
        let current = (mode, command_id, status);
        if self.dynamic_mode && self.last_robot_state == Some(current) {
            return false;
        }
        self.last_robot_state = Some(current);
        true
    }

    fn positions_changed(&self, old: &[f64; 6], new: &[f64; 6]) -> bool {
        old.iter().zip(new.iter()).any(|(a, b)| (a - b).abs() > self.position_threshold)
    }

    /// JSON lines due for this snapshot
    pub fn lines_for(&mut self, snapshot: &TelemetrySnapshot, now: Instant) -> Vec<String> {
        let mut lines = Vec::new();

        if self.should_output_robot_state(snapshot.robot_mode, snapshot.active_command_id, snapshot.status) {
            if let Ok(json) = serde_json::to_string(&RobotStateData::new(snapshot)) {
                lines.push(json);
            }
        }

        if self.should_output_position(snapshot.tool_pose, snapshot.joint_angles, now) {
            lines.push(self.format_position(&PositionData::new_rounded(snapshot, self.decimal_places)));
        }

        lines
    }

    /// Print every line due for this snapshot to stdout
    pub fn process(&mut self, snapshot: &TelemetrySnapshot) {
        for line in self.lines_for(snapshot, Instant::now()) {
            println!("{}", line);
        }
    }

    /// Fixed decimal places, which serde_json would not preserve
    pub fn format_position(&self, data: &PositionData) -> String {
        let precision = self.decimal_places as usize;
        let format = |values: &[f64; 6]| {
            values
                .iter()
                .map(|v| format!("{:.prec$}", v, prec = precision))
                .collect::<Vec<_>>()
                .join(",")
        };

        format!(
            r#"{{"rtime":{:.3},"stime":{:.6},"type":"{}","tool_pose":[{}],"joint_angles":[{}]}}"#,
            data.rtime,
            data.stime,
            data.event_type,
            format(&data.tool_pose),
            format(&data.joint_angles)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::sample_snapshot;

    #[test]
    fn test_position_is_rate_limited() {
        let mut monitor = MonitorOutput::new(10, false, 4);
        let start = Instant::now();

        assert!(monitor.should_output_position([0.0; 6], [0.0; 6], start));
        assert!(!monitor.should_output_position([1.0; 6], [0.0; 6], start + Duration::from_millis(50)));
        assert!(monitor.should_output_position([1.0; 6], [0.0; 6], start + Duration::from_millis(100)));
    }

    #[test]
    fn test_dynamic_mode_suppresses_unchanged_position() {
        let mut monitor = MonitorOutput::new(1000, true, 4);
        let start = Instant::now();

        assert!(monitor.should_output_position([0.0; 6], [0.0; 6], start));
        assert!(!monitor.should_output_position([0.005; 6], [0.0; 6], start + Duration::from_secs(1)));
        assert!(monitor.should_output_position([0.0; 6], [0.5; 6], start + Duration::from_secs(2)));
    }

    #[test]
    fn test_robot_state_on_change_only() {
        let mut monitor = MonitorOutput::new(10, true, 4);
        let status = StatusFlags::default();

        assert!(monitor.should_output_robot_state(RobotMode::Running, 4, status));
        assert!(!monitor.should_output_robot_state(RobotMode::Running, 4, status));
        assert!(monitor.should_output_robot_state(RobotMode::Enabled, 4, status));
    }

    #[test]
    fn test_lines_for_snapshot() {
        let mut monitor = MonitorOutput::new(10, true, 2);
        let mut snapshot = sample_snapshot(1, RobotMode::Enabled, 42);
        snapshot.tool_pose = [146.3759, -283.4321, 332.3956, 177.7879, -1.854, 147.5821];
        snapshot.controller_time_ms = 1500;

        let lines = monitor.lines_for(&snapshot, Instant::now());
        assert_eq!(lines.len(), 2);

        let state: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(state["type"], "robot_state");
        assert_eq!(state["robot_mode"], 5);
        assert_eq!(state["robot_mode_name"], "ROBOT_MODE_ENABLE");
        assert_eq!(state["active_command_id"], 42);

        assert!(lines[1].contains(r#""tool_pose":[146.38,-283.43,332.40,177.79,-1.85,147.58]"#));
        assert!(lines[1].starts_with(r#"{"rtime":1.500,"#));
        let position: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(position["type"], "position");
    }
}
