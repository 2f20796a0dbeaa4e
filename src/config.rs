//! Configuration loading for the Dobot controller link

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use crate::{DobotError, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub robot: RobotConfig,
    pub feed: FeedConfig,
    pub motion: MotionConfig,
    pub gripper: GripperConfig,
    pub publishing: PublishingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RobotConfig {
    pub host: String,
    pub ports: PortConfig,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortConfig {
    pub dashboard: u16,
    pub feedback: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Upper bound on one read, so the connection flag is re-checked this often
    pub read_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub read_chunk_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MotionConfig {
    pub poll_interval_ms: u64,
    pub completion_timeout_ms: u64,
    /// Applied to commands that do not carry their own velocity ratio
    pub velocity_ratio: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GripperConfig {
    pub slave_id: u8,
    pub baud: u32,
    pub parity: String,
    pub data_bits: u8,
    pub stop_bits: u8,
    /// Pause held under the write lock after every register write
    pub settle_ms: u64,
    /// Re-send the tool RS-485 settings before each write
    pub reassert_tool_port: bool,
    pub tool_port_delay_ms: u64,
    /// How long the release command is held before returning to idle
    pub release_hold_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishingConfig {
    pub pub_rate_hz: u32,
    pub decimal_places: u32,
    pub dynamic: bool,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            host: "192.168.5.1".to_string(),
            ports: PortConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            dashboard: 29999,
            feedback: 30004,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            reply_timeout_ms: 5000,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 200,
            retry_delay_ms: 200,
            read_chunk_bytes: 16 * 1440,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            completion_timeout_ms: 60_000,
            velocity_ratio: None,
        }
    }
}

impl Default for GripperConfig {
    fn default() -> Self {
        Self {
            slave_id: 9,
            baud: 115200,
            parity: "N".to_string(),
            data_bits: 8,
            stop_bits: 1,
            settle_ms: 500,
            reassert_tool_port: true,
            tool_port_delay_ms: 10,
            release_hold_ms: 1000,
        }
    }
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            pub_rate_hz: 10,
            decimal_places: 4,
            dynamic: true,
        }
    }
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self> {
        let contents = fs::read_to_string(config_path)
            .map_err(|e| DobotError::Config(format!("Failed to read {}: {}", config_path, e)))?;

        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks also applied to configs built in code
    pub fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(DobotError::Config("robot.host is empty".to_string()));
        }
        if self.feed.read_timeout_ms == 0 {
            return Err(DobotError::Config("feed.read_timeout_ms must be positive".to_string()));
        }
        if self.motion.poll_interval_ms == 0 {
            return Err(DobotError::Config("motion.poll_interval_ms must be positive".to_string()));
        }
        if let Some(ratio) = self.motion.velocity_ratio {
            if !(1..=100).contains(&ratio) {
                return Err(DobotError::Config(format!("motion.velocity_ratio {} outside 1..=100", ratio)));
            }
        }
        if !matches!(self.gripper.parity.as_str(), "N" | "E" | "O") {
            return Err(DobotError::Config(format!("gripper.parity must be N, E or O, got {}", self.gripper.parity)));
        }
        Ok(())
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl FeedConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl MotionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

impl GripperConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn tool_port_delay(&self) -> Duration {
        Duration::from_millis(self.tool_port_delay_ms)
    }

    pub fn release_hold(&self) -> Duration {
        Duration::from_millis(self.release_hold_ms)
    }
}
