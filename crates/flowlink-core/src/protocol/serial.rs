//! Serial port handling
//!
//! Binds a [`StreamPort`](super::StreamPort) to an OS serial device and finds the sensor
//! cable among the devices attached to this host.

use async_trait::async_trait;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};
use tracing::debug;

use super::{Link, ProtocolError};
use crate::config::SerialSettings;

/// USB (vendor, product) ids of the FTDI RS485 bridges found in sensor cables
pub const SENSOR_CABLE_USB_IDS: [(u16, u16); 2] = [(0x0403, 0x6001), (0x0403, 0x6015)];

/// USB identity of a serial device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

/// A serial device attached to this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,
    /// USB identity, if the device sits on USB and the OS reported it
    pub usb: Option<UsbId>,
    /// USB product string
    pub product: Option<String>,
}

impl PortInfo {
    fn from_path(name: String) -> Self {
        Self {
            name,
            usb: None,
            product: None,
        }
    }

    /// Whether the device is an RS485 bridge of the kind built into the sensor cable
    pub fn is_sensor_cable(&self) -> bool {
        self.usb
            .is_some_and(|id| SENSOR_CABLE_USB_IDS.contains(&(id.vid, id.pid)))
    }

    /// Discovery order: sensor cables, then other USB serial adapters, then everything
    /// else. Within a class, devices sort by their trailing number.
    fn rank(&self) -> (u8, usize, &str) {
        let basename = self.name.rsplit('/').next().unwrap_or(&self.name);
        let class = if self.is_sensor_cable() {
            0
        } else if basename.starts_with("ttyUSB") || self.usb.is_some() {
            1
        } else if basename.starts_with("ttyACM") {
            2
        } else {
            3
        };
        let digits = basename.trim_start_matches(|c: char| !c.is_ascii_digit());
        (class, digits.parse().unwrap_or(usize::MAX), basename)
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                usb: Some(UsbId {
                    vid: usb.vid,
                    pid: usb.pid,
                }),
                product: usb.product,
            },
            _ => Self::from_path(info.port_name),
        }
    }
}

fn sort_ports(ports: &mut [PortInfo]) {
    ports.sort_by(|a, b| a.rank().cmp(&b.rank()));
}

/// Serial devices on this host, sensor cables first
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: BTreeMap<String, PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|info| {
            let port = PortInfo::from(info);
            (port.name.clone(), port)
        })
        .collect();

    // udev sometimes lags behind the device nodes
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for name in entries.flatten().filter_map(|e| e.file_name().into_string().ok()) {
            if name.starts_with("ttyUSB") || name.starts_with("ttyACM") {
                let path = format!("/dev/{name}");
                found
                    .entry(path.clone())
                    .or_insert_with(|| PortInfo::from_path(path));
            }
        }
    }

    let mut ports: Vec<PortInfo> = found.into_values().collect();
    sort_ports(&mut ports);
    ports
}

/// First attached device whose USB identity matches a sensor cable
pub fn find_sensor_cable() -> Option<PortInfo> {
    list_ports().into_iter().find(PortInfo::is_sensor_cable)
}

/// [`Link`] to an OS serial device, configured 8N1 without flow control
#[derive(Debug, Clone)]
pub struct SerialLink {
    settings: SerialSettings,
}

impl SerialLink {
    /// Link to the device described by `settings`
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }

    /// Settings this link opens the device with
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[async_trait]
impl Link for SerialLink {
    type Stream = SerialStream;

    async fn connect(&self) -> Result<SerialStream, ProtocolError> {
        let builder = tokio_serial::new(&self.settings.path, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None);

        let stream = SerialStream::open(&builder).map_err(|e| {
            ProtocolError::SerialError(format!("{}: {}", self.settings.path, e))
        })?;
        debug!(
            path = %self.settings.path,
            baud = self.settings.baud_rate,
            "serial device opened"
        );
        Ok(stream)
    }

    fn name(&self) -> String {
        self.settings.path.clone()
    }
}
