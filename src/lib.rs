//! MQTT transport core for Azure IoT Hub device clients.
//!
//! The [`MqttTransportHandler`] multiplexes telemetry publishing, direct
//! method dispatch and device twin synchronization over a single MQTT
//! connection. It owns the subscribe/unsubscribe lifecycle per topic family,
//! correlates twin requests to their responses by `$rid`, and turns channel
//! failures into typed faults instead of hung futures.
//!
//! Every operation takes a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! and a configured timeout; retry policy belongs to the caller.
//!
//! # Examples
//!
//! ```no_run
//! use azure_iot_mqtt::{Message, MqttTransportHandler, SasTokenSource, TransportSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> azure_iot_mqtt::Result<()> {
//!     let settings = TransportSettings::new("myhub.azure-devices.net", "mydevice");
//!     let token_source = SasTokenSource::new("SharedAccessSignature sr=...");
//!     let handler = MqttTransportHandler::new(settings, token_source);
//!
//!     let ct = CancellationToken::new();
//!     handler.open(&ct).await?;
//!
//!     let msg = Message::builder()
//!         .set_body(b"temperature: 21.0".to_vec())
//!         .set_message_id("1-t".to_string())
//!         .build();
//!     handler.send_message(msg, &ct).await?;
//!
//!     handler.close().await
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// SDK package version
pub const SDK_VERSION: &str = std::env!("CARGO_PKG_VERSION");

/// Duplex channel abstraction under the transport handler
pub mod channel;
/// Fault taxonomy
pub mod error;
/// The MQTT transport handler state machine
pub mod handler;
/// Message types for communicating with the IoT Hub
pub mod message;
/// Connection identity, transport settings and credential provider
pub mod settings;
/// Topic codec for the IoT hub MQTT surface
pub mod topic;

pub use channel::{Channel, ChannelFactory, ConnectAuth, TlsChannel};
pub use error::IoTHubError;
pub use handler::{MqttTransportHandler, TwinResponse};
pub use message::{DirectMethodInvocation, DirectMethodResponse, Message, MessageType};
pub use settings::{SasTokenSource, TokenSource, TransportSettings};

/// Result alias for fallible transport operations
pub type Result<T> = std::result::Result<T, IoTHubError>;
