//! Flow sensor devices
//!
//! A [`Device`] issues commands from the [`Command`] table through any [`Exchange`],
//! normally a [`RetryConnection`]. [`FlowMeter`] adds the SF06 flow meter operations
//! on top of a device.

mod commands;
pub mod data;

pub use commands::Command;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::{HexBytes, Port, ProtocolError, RequestFrame, ResponseFrame, RetryConnection};

/// Slave address of a sensor cable that was never re-addressed
pub const DEFAULT_SLAVE_ADDRESS: u8 = 0x00;

/// Raw measurement units per ml/min
pub const SCALE_FACTOR: f64 = 500.0;

/// Default interval between continuous measurements, in milliseconds
pub const DEFAULT_MEASUREMENT_INTERVAL_MS: u16 = 20;

/// Wait after a device reset before the next command
pub const REBOOT_DELAY: Duration = Duration::from_millis(100);

/// Sensor type selected during initialisation
const SENSOR_TYPE: u8 = 0x03;

/// Sensor-level command the cable forwards to start measuring water flow
const SENSOR_MEASURE_WATER: u16 = 0x3608;

const MILLISECONDS_PER_MINUTE: f64 = 60_000.0;

/// Errors returned by device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Integer of {len} bytes does not fit in 64 bits")]
    IntegerTooWide { len: usize },
}

/// One validated request/response exchange with a slave
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Send `request` and return the validated response
    async fn exchange(
        &self,
        request: &RequestFrame,
        response_timeout: Duration,
    ) -> Result<ResponseFrame, ProtocolError>;
}

#[async_trait]
impl<P: Port> Exchange for RetryConnection<P> {
    async fn exchange(
        &self,
        request: &RequestFrame,
        response_timeout: Duration,
    ) -> Result<ResponseFrame, ProtocolError> {
        self.transceive(request, response_timeout).await
    }
}

/// A sensor cable at one slave address
pub struct Device<E: Exchange> {
    exchange: E,
    slave_address: u8,
}

impl<E: Exchange> Device<E> {
    /// Device at the default slave address
    pub fn new(exchange: E) -> Self {
        Self::with_address(exchange, DEFAULT_SLAVE_ADDRESS)
    }

    /// Device at `slave_address`
    pub fn with_address(exchange: E, slave_address: u8) -> Self {
        Self {
            exchange,
            slave_address,
        }
    }

    /// Slave address requests are sent to
    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    /// The exchange the device talks through
    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Issue `command` with `data` and return the response data
    pub async fn request(&self, command: Command, data: Vec<u8>) -> Result<Vec<u8>, DeviceError> {
        let request = RequestFrame::new(self.slave_address, command.id(), data);
        let response = self.exchange.exchange(&request, command.timeout()).await?;
        debug!(?command, data = %HexBytes(&response.command_data), "response data");
        Ok(response.command_data)
    }

    /// Name of the product
    pub async fn product_name(&self) -> Result<String, DeviceError> {
        let data = self.request(Command::ProductName, vec![0x01]).await?;
        Ok(data::parse_string(&data))
    }
}

/// SF06 flow meter
pub struct FlowMeter<E: Exchange> {
    device: Device<E>,
    scale_factor: f64,
}

impl<E: Exchange> FlowMeter<E> {
    /// Flow meter at the default slave address
    pub fn new(exchange: E) -> Self {
        Self::from_device(Device::new(exchange))
    }

    /// Flow meter on an existing device
    pub fn from_device(device: Device<E>) -> Self {
        Self {
            device,
            scale_factor: SCALE_FACTOR,
        }
    }

    /// The underlying device
    pub fn device(&self) -> &Device<E> {
        &self.device
    }

    /// Raw measurement units per ml/min
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Name of the product
    pub async fn product_name(&self) -> Result<String, DeviceError> {
        self.device.product_name().await
    }

    /// Part name of the attached sensor
    pub async fn sensor_part_name(&self) -> Result<String, DeviceError> {
        let data = self.device.request(Command::SensorPartName, Vec::new()).await?;
        Ok(data::parse_string(&data))
    }

    /// Reset the cable and select the flow sensor
    pub async fn init(&self) -> Result<(), DeviceError> {
        info!("device reset");
        self.device.request(Command::DeviceReset, Vec::new()).await?;
        info!("wait for device reboot");
        tokio::time::sleep(REBOOT_DELAY).await;
        info!("set sensor type");
        self.device
            .request(Command::SensorType, vec![SENSOR_TYPE])
            .await?;
        let scale_factor_unit = self.scale_factor_unit().await?;
        info!(scale_factor = %HexBytes(&scale_factor_unit), "scale factor and unit");
        Ok(())
    }

    /// Raw scale factor and unit reported by the sensor
    pub async fn scale_factor_unit(&self) -> Result<Vec<u8>, DeviceError> {
        self.device
            .request(Command::ScaleFactorUnit, vec![0x00, 0x00])
            .await
    }

    /// Enable or disable the totalizator
    pub async fn set_totalizator_status(&self, enabled: bool) -> Result<(), DeviceError> {
        self.device
            .request(Command::TotalizatorStatus, vec![u8::from(enabled)])
            .await?;
        Ok(())
    }

    /// Clear the totalizator sum
    pub async fn reset_totalizator(&self) -> Result<(), DeviceError> {
        self.device
            .request(Command::ResetTotalizator, Vec::new())
            .await?;
        Ok(())
    }

    /// Start measuring every `interval_ms` milliseconds
    pub async fn start_continuous_measurement(&self, interval_ms: u16) -> Result<(), DeviceError> {
        let mut data = vec![0u8; 4];
        BigEndian::write_u16(&mut data[..2], interval_ms);
        BigEndian::write_u16(&mut data[2..], SENSOR_MEASURE_WATER);
        self.device
            .request(Command::StartContinuousMeasurement, data)
            .await?;
        Ok(())
    }

    /// Stop continuous measurement
    pub async fn stop_continuous_measurement(&self) -> Result<(), DeviceError> {
        self.device
            .request(Command::StopContinuousMeasurement, Vec::new())
            .await?;
        Ok(())
    }

    /// Newest raw measurement
    pub async fn last_measurement(&self) -> Result<i64, DeviceError> {
        let data = self
            .device
            .request(Command::LastMeasurement, Vec::new())
            .await?;
        let value = data::parse_signed(&data)?;
        info!(value, "last measurement");
        Ok(value)
    }

    /// Raw totalizator sum
    pub async fn totalizator_value(&self) -> Result<i64, DeviceError> {
        let data = self
            .device
            .request(Command::TotalizatorValue, Vec::new())
            .await?;
        let value = data::parse_signed(&data)?;
        info!(value, "totalizator value");
        Ok(value)
    }

    /// Current flow rate in ml/min
    pub async fn current_flow_rate(&self) -> Result<f64, DeviceError> {
        let flow_rate = self.last_measurement().await? as f64 / self.scale_factor;
        info!(flow_rate, "flow rate");
        Ok(flow_rate)
    }

    /// Volume in ml accumulated by the totalizator, sampled every `interval_ms`
    pub async fn total_volume(&self, interval_ms: u16) -> Result<f64, DeviceError> {
        let ticks = self.totalizator_value().await?;
        let volume = volume_from_ticks(ticks, interval_ms, self.scale_factor);
        info!(volume, "total volume");
        Ok(volume)
    }

    /// Enable and clear the totalizator, then start measuring every `interval_ms`
    pub async fn start_recording_volume(&self, interval_ms: u16) -> Result<(), DeviceError> {
        debug!("set totalizator status");
        self.set_totalizator_status(true).await?;
        debug!("reset totalizator");
        self.reset_totalizator().await?;
        debug!("start continuous measurement");
        self.start_continuous_measurement(interval_ms).await?;
        info!(interval_ms, "started recording volume");
        Ok(())
    }

    /// Stop measuring and return the recorded volume in ml
    pub async fn stop_recording_volume(&self, interval_ms: u16) -> Result<f64, DeviceError> {
        self.stop_continuous_measurement().await?;
        let volume = self.total_volume(interval_ms).await?;
        info!("stopped recording volume");
        Ok(volume)
    }
}

/// Each tick is one sample of `interval_ms` at a flow of `1 / scale_factor` ml/min
fn volume_from_ticks(ticks: i64, interval_ms: u16, scale_factor: f64) -> f64 {
    let sampling_time = f64::from(interval_ms) / MILLISECONDS_PER_MINUTE;
    ticks as f64 / scale_factor * sampling_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SlaveState;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers every command with fixed data and records the requests
    #[derive(Default)]
    struct MockExchange {
        answers: HashMap<u8, Vec<u8>>,
        requests: Mutex<Vec<(RequestFrame, Duration)>>,
    }

    impl MockExchange {
        fn answering(answers: Vec<(Command, Vec<u8>)>) -> Self {
            Self {
                answers: answers
                    .into_iter()
                    .map(|(command, data)| (command.id(), data))
                    .collect(),
                ..Self::default()
            }
        }

        fn command_ids(&self) -> Vec<u8> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(r, _)| r.command_id)
                .collect()
        }

        fn request(&self, index: usize) -> (RequestFrame, Duration) {
            self.requests.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl Exchange for MockExchange {
        async fn exchange(
            &self,
            request: &RequestFrame,
            response_timeout: Duration,
        ) -> Result<ResponseFrame, ProtocolError> {
            self.requests
                .lock()
                .unwrap()
                .push((request.clone(), response_timeout));
            Ok(ResponseFrame {
                slave_address: request.slave_address,
                command_id: request.command_id,
                slave_state: SlaveState(0x00),
                command_data: self
                    .answers
                    .get(&request.command_id)
                    .cloned()
                    .unwrap_or_default(),
            })
        }
    }

    #[tokio::test]
    async fn test_product_name() {
        let exchange = MockExchange::answering(vec![(Command::ProductName, b"name".to_vec())]);
        let device = Device::with_address(exchange, 0x12);

        assert_eq!(device.product_name().await.unwrap(), "name");
        let (request, timeout) = device.exchange().request(0);
        assert_eq!(request, RequestFrame::new(0x12, 0xD0, vec![0x01]));
        assert_eq!(timeout, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_sensor_part_name() {
        let exchange = MockExchange::answering(vec![(
            Command::SensorPartName,
            b"SLF3S-1300F\0\0".to_vec(),
        )]);
        let meter = FlowMeter::new(exchange);

        assert_eq!(meter.sensor_part_name().await.unwrap(), "SLF3S-1300F");
    }

    #[tokio::test]
    async fn test_start_continuous_measurement_data() {
        let meter = FlowMeter::new(MockExchange::default());
        meter.start_continuous_measurement(250).await.unwrap();

        let (request, _) = meter.device().exchange().request(0);
        assert_eq!(
            request.to_bytes().unwrap(),
            vec![0x00, 0x33, 0x04, 0x00, 0xFA, 0x36, 0x08]
        );
    }

    #[tokio::test]
    async fn test_totalizator_status_data() {
        let meter = FlowMeter::new(MockExchange::default());
        meter.set_totalizator_status(true).await.unwrap();
        meter.set_totalizator_status(false).await.unwrap();

        let exchange = meter.device().exchange();
        assert_eq!(exchange.request(0).0.command_data, vec![0x01]);
        assert_eq!(exchange.request(1).0.command_data, vec![0x00]);
    }

    #[tokio::test]
    async fn test_flow_rate_uses_scale_factor() {
        let exchange = MockExchange::answering(vec![(Command::LastMeasurement, vec![0x03, 0xE8])]);
        let meter = FlowMeter::new(exchange);

        assert_eq!(meter.last_measurement().await.unwrap(), 1000);
        assert_eq!(meter.current_flow_rate().await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_negative_measurement() {
        let exchange = MockExchange::answering(vec![(Command::LastMeasurement, vec![0xFF, 0xC6])]);
        let meter = FlowMeter::new(exchange);

        assert_eq!(meter.last_measurement().await.unwrap(), -58);
    }

    #[tokio::test]
    async fn test_recording_volume_sequence() {
        // 3_000_000 ticks of 20 ms at 1/500 ml/min each
        let exchange = MockExchange::answering(vec![(
            Command::TotalizatorValue,
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x2D, 0xC6, 0xC0],
        )]);
        let meter = FlowMeter::new(exchange);

        meter.start_recording_volume(20).await.unwrap();
        let volume = meter.stop_recording_volume(20).await.unwrap();

        assert!((volume - 2.0).abs() < 1e-9, "volume {volume}");
        assert_eq!(
            meter.device().exchange().command_ids(),
            vec![0x37, 0x39, 0x33, 0x34, 0x38]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_sequence() {
        let meter = FlowMeter::new(MockExchange::answering(vec![(
            Command::ScaleFactorUnit,
            vec![0x01, 0xF4, 0x08, 0x45],
        )]));
        let start = tokio::time::Instant::now();

        meter.init().await.unwrap();

        let exchange = meter.device().exchange();
        assert_eq!(exchange.command_ids(), vec![0xD3, 0x24, 0x53]);
        assert_eq!(exchange.request(0).1, Duration::from_millis(250));
        assert_eq!(exchange.request(1).0.command_data, vec![0x03]);
        assert_eq!(exchange.request(2).0.command_data, vec![0x00, 0x00]);
        assert!(start.elapsed() >= REBOOT_DELAY);
    }

    #[tokio::test]
    async fn test_too_wide_measurement() {
        let exchange = MockExchange::answering(vec![(Command::LastMeasurement, vec![0x00; 9])]);
        let meter = FlowMeter::new(exchange);

        assert!(matches!(
            meter.last_measurement().await,
            Err(DeviceError::IntegerTooWide { len: 9 })
        ));
    }

    #[test]
    fn test_volume_from_ticks() {
        assert_eq!(volume_from_ticks(0, 20, SCALE_FACTOR), 0.0);
        assert!((volume_from_ticks(1_500_000, 40, SCALE_FACTOR) - 2.0).abs() < 1e-9);
    }
}
