//! # Flowlink Core Library
//!
//! Core functionality for talking to flow sensors over an asynchronous serial link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Frame encapsulation (terminal bytes, byte stuffing, checksum)
//! - Request/response message frames
//! - A timing-aware response collector
//! - A serial port with single-request-in-flight semantics
//! - A retrying connection that recovers from line noise and timing faults
//! - A data-driven flow meter command catalog
//!
//! ## Example
//!
//! ```rust,ignore
//! use flowlink_core::config::FlowlinkConfig;
//! use flowlink_core::device::FlowMeter;
//! use flowlink_core::protocol::{Port, RetryConnection, SerialLink, StreamPort};
//!
//! let config = FlowlinkConfig::for_path("/dev/ttyUSB0");
//! let port = StreamPort::new(SerialLink::new(config.serial.clone()), config.port.clone());
//! port.open().await?;
//!
//! let connection = RetryConnection::new(port, config.retry.clone());
//! let meter = FlowMeter::new(connection);
//! println!("product: {}", meter.product_name().await?);
//! ```

pub mod config;
pub mod device;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{FlowlinkConfig, PortTiming, RetryPolicy, SerialSettings};
    pub use crate::device::{Command, Device, DeviceError, Exchange, FlowMeter};
    pub use crate::protocol::{
        Port, ProtocolError, RequestFrame, ResponseFrame, RetryConnection, SerialLink, StreamPort,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
