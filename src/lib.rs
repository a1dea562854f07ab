//! # tuyactl
//!
//! Asynchronous Tuya Local API client for querying and switching a single
//! smart plug or switch without cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyactl::{Device, Version, status};
//!
//! # async fn run() -> tuyactl::error::Result<()> {
//! let device = Device::new("DEVICE_ID", "192.168.1.253", "0123456789abcdef", Version::V3_4);
//! device.set_relay(true).await?;
//! let response = device.status().await?;
//! println!("{}", status::extract("dps.1", &response)?);
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod crypto;
pub mod device;
pub mod error;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transport;

pub use device::{Device, DeviceBuilder};
pub use error::TuyaError;
pub use protocol::{CommandType, Version};
pub use session::{CommandResponse, Session, SessionState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
