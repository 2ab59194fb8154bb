//! Dynamically controllable TCP forwarding
//!
//! A [`Forwarder`] listens on a local address and relays every accepted
//! connection, byte for byte, to a fixed remote address. A [`Registry`] owns
//! many forwarders by name and serializes their lifecycle changes.
//!
//! ```no_run
//! use portrelay_core::{Registry, RegistryConfig, TracingSink};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), portrelay_core::RegistryError> {
//! let registry = Registry::new(RegistryConfig::default(), Arc::new(TracingSink::default()));
//! registry.add("mysql", "3307", "127.0.0.1:3306").await?;
//! for detail in registry.list_details().await {
//!     println!("{} {} -> {} running={}", detail.name, detail.local, detail.remote, detail.running);
//! }
//! registry.remove("mysql").await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod forwarder;
pub mod registry;
pub mod relay;
pub mod sink;

pub use address::{resolve as resolve_address, AddressError};
pub use forwarder::{Forwarder, ForwarderConfig, ForwarderError};
pub use registry::{Detail, Registry, RegistryConfig, RegistryError};
pub use relay::RELAY_BUFFER_SIZE;
pub use sink::{LogSink, NoopSink, TracingSink};
