//! # ESPHome native API client
//!
//! Async session layer for the ESPHome native API over tokio.
//!
//! ## Overview
//!
//! - **Frame transport**: TCP socket with plaintext or Noise-encrypted
//!   framing, reassembly and decoding into [`protocol::Message`]s
//! - **Connection**: hello and credential exchange, keepalive pings,
//!   automatic reconnection and request/response correlation
//! - **Client**: initialization sequence, entity registry and
//!   application-level events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                     Client                      │
//! │     (initialization, entities, ClientEvent)     │
//! ├─────────────────────────────────────────────────┤
//! │                   Connection                    │
//! │ (authorization, keepalive, reconnect, waiters)  │
//! ├─────────────────────────────────────────────────┤
//! │                 FrameTransport                  │
//! │      (TCP, plaintext or Noise framing)          │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use client::{Client, ClientEvent, ClientOptions, ConnectionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConnectionConfig::new("livingroom.local").with_password("secret");
//!     let client = Client::new(config, ClientOptions::default())?;
//!     let mut events = client.subscribe();
//!     client.connect()?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ClientEvent::NewEntity(entity) = event {
//!             println!("{} {}", entity.component(), entity.info.name);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod transport;

pub use client::{BleAdvertisement, Client, ClientEvent};
pub use config::{
    default_client_info, default_config_path, ClientOptions, Config, ConfigError,
    ConnectionConfig, LogSubscription, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEPALIVE_FAILURE_THRESHOLD,
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_PORT, DEFAULT_RECONNECT_INTERVAL, DEFAULT_REQUEST_TIMEOUT,
};
pub use connection::{
    Connection, ConnectionEvent, GattServices, ListedEntity, BLUETOOTH_REQUEST_TIMEOUT,
};
pub use error::{ConnectionError, Result, TransportError};
pub use transport::{FrameTransport, TransportConfig, TransportEvent};
