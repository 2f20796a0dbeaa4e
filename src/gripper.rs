//! Vacuum gripper register protocol
//!
//! The gripper sits on the tool-flange RS-485 port and is driven through
//! Modbus holding registers. Register 1000 carries the action word in its high
//! byte (and the max-vacuum threshold in its low byte); register 1001 carries
//! the grip parameters. The controller bridges Modbus RTU for us, so every
//! write is a dashboard command.
//!
//! The gripper must see a fault-clear before it accepts a new action, so every
//! sequence starts with one, and each write is given time to settle before the
//! next one goes out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GripperConfig;
use crate::dashboard::ControlChannel;
use crate::reply::{parse_reply, CommandAck};
use crate::{DobotError, Result};

/// Action request register
pub const ACTION_REGISTER: u16 = 0x03E8;
/// Grip parameter register (max vacuum, timeout and min vacuum)
pub const PARAMETER_REGISTER: u16 = 0x03E9;
/// Low-byte threshold that lets go of the part
pub const RELEASE_VACUUM: u16 = 0xFF;
/// Largest timeout the parameter register can hold, in milliseconds
pub const MAX_GRIP_TIMEOUT_MS: u32 = 255 * 100;

/// `rACT`: clearing it resets the gripper and clears faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    ClearFault = 0,
    Enable = 1,
}

/// `rGTO`: hold the current state or regulate towards the requested vacuum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoTo {
    Hold = 0,
    Controlled = 1,
}

/// `rMOD`: two-bit operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Automatic = 0b00,
    Advanced = 0b01,
}

/// `rATR`: emergency auto-release overrides everything but `rACT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoRelease {
    Normal = 0,
    Release = 1,
}

/// Action request, packed as `ATR GTO MOD(2) ACT` into the high byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionWord {
    pub auto_release: AutoRelease,
    pub go_to: GoTo,
    pub mode: OperatingMode,
    pub activation: Activation,
}

impl ActionWord {
    /// Reset faults, keep holding, advanced mode
    pub const CLEAR_HOLD: Self = Self::advanced(Activation::ClearFault, GoTo::Hold);
    /// Activated, holding
    pub const ENABLE_HOLD: Self = Self::advanced(Activation::Enable, GoTo::Hold);
    /// Activated, regulating towards the configured vacuum
    pub const CONTROLLED_ENABLE: Self = Self::advanced(Activation::Enable, GoTo::Controlled);

    pub const fn advanced(activation: Activation, go_to: GoTo) -> Self {
        Self {
            auto_release: AutoRelease::Normal,
            go_to,
            mode: OperatingMode::Advanced,
            activation,
        }
    }

    pub fn auto_release(mut self, auto_release: AutoRelease) -> Self {
        self.auto_release = auto_release;
        self
    }

    pub fn mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Action byte in the high half of the register, low half left zero
    pub fn to_register(self) -> u16 {
        let byte = ((self.auto_release as u16) << 4)
            | ((self.go_to as u16) << 3)
            | ((self.mode as u16) << 1)
            | self.activation as u16;
        byte << 8
    }
}

/// Threshold word: the gripper expects the complement of the percentage
pub fn vacuum_threshold(percent: u8) -> Result<u16> {
    check_percent("vacuum", percent)?;
    Ok(100 - percent as u16)
}

/// Timeout (in 100 ms units, rounded up) in the high byte, min vacuum threshold in the low byte
pub fn timeout_and_min_vacuum(timeout_ms: u32, min_percent: u8) -> Result<u16> {
    if timeout_ms > MAX_GRIP_TIMEOUT_MS {
        return Err(DobotError::InvalidCommand(format!(
            "Grip timeout {} ms exceeds {} ms",
            timeout_ms, MAX_GRIP_TIMEOUT_MS
        )));
    }
    let timeout = timeout_ms.div_ceil(100) as u16;
    Ok((timeout << 8) | vacuum_threshold(min_percent)?)
}

fn check_percent(what: &str, percent: u8) -> Result<()> {
    if percent > 100 {
        return Err(DobotError::InvalidCommand(format!("{} {}% outside 0..=100", what, percent)));
    }
    Ok(())
}

/// Link that can write holding registers on the gripper
#[async_trait]
pub trait RegisterChannel: Send + Sync {
    /// Open a bus session and return its handle
    async fn open_session(&self) -> Result<u32>;

    async fn close_session(&self, session: u32) -> Result<()>;

    /// Write consecutive holding registers starting at `address`
    async fn write_registers(&self, session: u32, address: u16, values: &[u16]) -> Result<()>;
}

/// Modbus RTU bridged through the controller's dashboard commands
pub struct DashboardModbusBridge<C: ?Sized> {
    channel: Arc<C>,
    config: GripperConfig,
}

impl<C> DashboardModbusBridge<C>
where
    C: ControlChannel + ?Sized,
{
    pub fn new(channel: Arc<C>, config: GripperConfig) -> Self {
        Self { channel, config }
    }

    /// Power the tool port and configure its serial line
    pub async fn prepare_tool_port(&self) -> Result<()> {
        self.device_command("SetToolMode(1,1,1)").await?;
        self.device_command(&self.tool_485_command()).await?;
        Ok(())
    }

    fn tool_485_command(&self) -> String {
        format!("SetTool485({},{},{})", self.config.baud, self.config.parity, self.config.stop_bits)
    }

    /// Any non-zero status code is a device failure
    async fn device_command(&self, command: &str) -> Result<CommandAck> {
        let reply = self.channel.request(command).await?;
        let ack = parse_reply(&reply)?;
        if ack.code != 0 {
            return Err(DobotError::Device {
                code: ack.code,
                reply: ack.raw,
            });
        }
        Ok(ack)
    }
}

#[async_trait]
impl<C> RegisterChannel for DashboardModbusBridge<C>
where
    C: ControlChannel + ?Sized,
{
    async fn open_session(&self) -> Result<u32> {
        // A session left over from an earlier run would make create fail
        if let Err(e) = self.device_command("ModbusClose(0)").await {
            debug!("Closing stale Modbus session: {}", e);
        }

        let command = format!(
            "ModbusRTUCreate({},{},{},{},{})",
            self.config.slave_id, self.config.baud, self.config.parity, self.config.data_bits, self.config.stop_bits
        );
        let ack = self.device_command(&command).await?;

        let index = ack
            .values
            .get(1)
            .copied()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| DobotError::Protocol(format!("Modbus create reply carries no index: {}", ack.raw)))?;

        info!("Modbus session {} open to slave {}", index, self.config.slave_id);
        Ok(index)
    }

    async fn close_session(&self, session: u32) -> Result<()> {
        self.device_command(&format!("ModbusClose({})", session)).await?;
        info!("Modbus session {} closed", session);
        Ok(())
    }

    async fn write_registers(&self, session: u32, address: u16, values: &[u16]) -> Result<()> {
        if self.config.reassert_tool_port {
            self.device_command(&self.tool_485_command()).await?;
            tokio::time::sleep(self.config.tool_port_delay()).await;
        }

        let list: Vec<String> = values.iter().map(u16::to_string).collect();
        let command = format!("SetHoldRegs({},{},{},{{{}}})", session, address, values.len(), list.join(","));
        self.device_command(&command).await?;
        Ok(())
    }
}

/// Vacuum gripper driven through a [`RegisterChannel`]
pub struct VacuumGripper<B> {
    bridge: B,
    session: Mutex<Option<u32>>,
    /// Held for a whole init/grip/release sequence
    action_lock: Mutex<()>,
    /// Held across each write and its settle delay
    write_lock: Mutex<()>,
    settle: Duration,
    release_hold: Duration,
}

impl<B: RegisterChannel> VacuumGripper<B> {
    pub fn new(bridge: B, config: &GripperConfig) -> Self {
        Self {
            bridge,
            session: Mutex::new(None),
            action_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            settle: config.settle(),
            release_hold: config.release_hold(),
        }
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Open the bus session used by every later write; an open session is reused
    pub async fn create_channel(&self) -> Result<u32> {
        let mut session = self.session.lock().await;
        if let Some(index) = *session {
            debug!("Modbus session {} already open", index);
            return Ok(index);
        }
        let index = self.bridge.open_session().await?;
        *session = Some(index);
        Ok(index)
    }

    pub async fn close_channel(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(index) = session.take() {
            self.bridge.close_session(index).await?;
        }
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// One serialized register write followed by the settle delay
    pub async fn write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        let session = self.session.lock().await.ok_or(DobotError::NoModbusSession)?;

        let _write = self.write_lock.lock().await;
        debug!("gripper write @{} {:?}", address, values);
        let result = self.bridge.write_registers(session, address, values).await;
        tokio::time::sleep(self.settle).await;

        if let Err(e) = &result {
            warn!("Gripper register write @{} failed: {}", address, e);
        }
        result
    }

    async fn write_action(&self, action: ActionWord, low_byte: Option<u16>) -> Result<()> {
        match low_byte {
            Some(low) => self.write_registers(ACTION_REGISTER, &[action.to_register(), low]).await,
            None => self.write_registers(ACTION_REGISTER, &[action.to_register()]).await,
        }
    }

    /// Clear faults, then activate with the vacuum released
    pub async fn init(&self) -> Result<()> {
        let _action = self.action_lock.lock().await;
        info!("Initializing vacuum gripper");

        self.write_action(ActionWord::CLEAR_HOLD, Some(RELEASE_VACUUM)).await?;
        self.write_action(ActionWord::ENABLE_HOLD, Some(RELEASE_VACUUM)).await?;
        Ok(())
    }

    /// Regulate vacuum between the given percentages, giving up after `timeout_ms`
    pub async fn grip(&self, max_vacuum_percent: u8, min_vacuum_percent: u8, timeout_ms: u32) -> Result<()> {
        let max = vacuum_threshold(max_vacuum_percent)?;
        let timeout_and_min = timeout_and_min_vacuum(timeout_ms, min_vacuum_percent)?;

        let _action = self.action_lock.lock().await;
        info!(
            "Gripping at {}%..{}% vacuum, timeout {} ms",
            min_vacuum_percent, max_vacuum_percent, timeout_ms
        );

        self.write_action(ActionWord::CLEAR_HOLD, None).await?;
        self.write_action(ActionWord::ENABLE_HOLD, None).await?;
        self.write_registers(PARAMETER_REGISTER, &[max, timeout_and_min]).await?;
        self.write_action(ActionWord::CONTROLLED_ENABLE, None).await?;
        Ok(())
    }

    /// Drop the vacuum, then return to an activated idle state
    pub async fn release(&self) -> Result<()> {
        let _action = self.action_lock.lock().await;
        info!("Releasing vacuum gripper");

        self.write_action(ActionWord::CLEAR_HOLD, None).await?;
        self.write_action(ActionWord::CONTROLLED_ENABLE, Some(RELEASE_VACUUM)).await?;
        tokio::time::sleep(self.release_hold).await;
        self.write_action(ActionWord::ENABLE_HOLD, None).await?;
        Ok(())
    }
}
