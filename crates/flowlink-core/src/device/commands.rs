//! Sensor commands
//!
//! Defines the commands understood by the SF06 flow sensor cable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::RESEND_COMMAND_ID;

/// Commands of the sensor cable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Reboot the cable and sensor
    DeviceReset,

    /// Read the product name (data `[0x01]`)
    ProductName,

    /// Read the part name of the attached sensor
    SensorPartName,

    /// Select the attached sensor type
    SensorType,

    /// Read the scale factor and unit of the measurement
    ScaleFactorUnit,

    /// Start measuring at a fixed interval
    StartContinuousMeasurement,

    /// Stop continuous measurement
    StopContinuousMeasurement,

    /// Read the newest measurement
    LastMeasurement,

    /// Enable or disable the totalizator
    TotalizatorStatus,

    /// Read the totalizator sum
    TotalizatorValue,

    /// Clear the totalizator sum
    ResetTotalizator,

    /// Ask for the last response again
    Resend,
}

impl Command {
    /// Every command, in id order
    pub const ALL: [Command; 12] = [
        Command::SensorType,
        Command::StartContinuousMeasurement,
        Command::StopContinuousMeasurement,
        Command::LastMeasurement,
        Command::TotalizatorStatus,
        Command::TotalizatorValue,
        Command::ResetTotalizator,
        Command::SensorPartName,
        Command::ScaleFactorUnit,
        Command::ProductName,
        Command::DeviceReset,
        Command::Resend,
    ];

    /// Command id sent on the wire
    pub fn id(&self) -> u8 {
        match self {
            Command::DeviceReset => 0xD3,
            Command::ProductName => 0xD0,
            Command::SensorPartName => 0x50,
            Command::SensorType => 0x24,
            Command::ScaleFactorUnit => 0x53,
            Command::StartContinuousMeasurement => 0x33,
            Command::StopContinuousMeasurement => 0x34,
            Command::LastMeasurement => 0x35,
            Command::TotalizatorStatus => 0x37,
            Command::TotalizatorValue => 0x38,
            Command::ResetTotalizator => 0x39,
            Command::Resend => RESEND_COMMAND_ID,
        }
    }

    /// Look up a command by its wire id
    pub fn from_id(id: u8) -> Option<Command> {
        Command::ALL.iter().copied().find(|c| c.id() == id)
    }

    /// Maximum response time declared for the command, in milliseconds
    pub fn timeout_ms(&self) -> u64 {
        match self {
            Command::DeviceReset => 250, // Reboot
            Command::ProductName => 100,
            Command::SensorType => 25,
            Command::SensorPartName => 3,
            _ => 1,
        }
    }

    /// Maximum response time declared for the command
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms())
    }
}
