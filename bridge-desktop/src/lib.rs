//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `JobScheduler` using the Tokio runtime (`TokioJobScheduler`)
//! - `DeviceMonitor` using a TCP reachability probe (`DesktopDeviceMonitor`)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopDeviceMonitor, TokioJobScheduler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let monitor = Arc::new(DesktopDeviceMonitor::new());
//!     let scheduler = TokioJobScheduler::with_device_monitor(Some(monitor));
//!
//!     // Hand the scheduler to the sync coordinator
//! }
//! ```

mod background;
mod device;

pub use background::TokioJobScheduler;
pub use device::DesktopDeviceMonitor;
