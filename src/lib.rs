// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `iotf_client` - An async application client for IoT command and event
//! messaging over MQTT.
//!
//! An application connects to the platform's broker with its organization
//! credentials, subscribes to the commands and events of the devices it
//! cares about, publishes commands and events of its own, and receives
//! everything through one callback.
//!
//! # Supported Features
//!
//! - **Connection lifecycle**: connect, disconnect, automatic reconnect with
//!   backoff, observable connection state
//! - **Subscriptions**: per-device command and event filters, recorded while
//!   offline and restored after every reconnect
//! - **Publishing**: commands and events as JSON envelopes, text or raw bytes
//! - **Delivery**: a single callback fed by a bounded queue, isolated from
//!   callback errors and panics
//! - **Diagnostics**: a broadcast stream of [`ClientEvent`]s
//!
//! # Topics
//!
//! ```text
//! iot-2/type/{deviceType}/id/{deviceId}/cmd/{command}/fmt/{format}
//! iot-2/type/{deviceType}/id/{deviceId}/evt/{event}/fmt/{format}
//! ```
//!
//! # Quick Start
//!
//! ## In-process broker
//!
//! ```
//! use iotf_client::transport::memory::MemoryBroker;
//! use iotf_client::{Client, ClientIdentity, Message};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> iotf_client::Result<()> {
//!     let broker = MemoryBroker::new();
//!     let identity = ClientIdentity::quickstart_application("dashboard");
//!     let client = Client::builder(identity).build(broker.transport())?;
//!
//!     client.set_event_callback(|message: Message| {
//!         if let Some(command) = message.as_command() {
//!             println!("received {command}");
//!         }
//!         Ok(())
//!     });
//!
//!     client.connect().await?;
//!     client.subscribe_to_device_commands("Sensor", "dev42").await?;
//!     client
//!         .publish_command("Sensor", "dev42", "run", &json!({"distance": 10}))
//!         .await?;
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ## MQTT Broker
//!
//! ```no_run
//! use iotf_client::{Client, ClientIdentity, ClientEvent};
//!
//! #[tokio::main]
//! async fn main() -> iotf_client::Result<()> {
//!     let identity = ClientIdentity::application("myorg", "dashboard", "a-myorg-key", "token");
//!     let client = Client::builder(identity).build_mqtt()?;
//!
//!     let mut events = client.events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let ClientEvent::Reconnecting { attempt, delay } = event {
//!                 eprintln!("reconnect #{attempt} in {delay:?}");
//!             }
//!         }
//!     });
//!
//!     client.connect().await?;
//!     client.subscribe_to_device_events("Sensor", "dev42").await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod connection;
mod dispatch;
pub mod error;
pub mod event;
pub mod identity;
pub mod message;
mod publish;
mod subscription;
pub mod topic;
pub mod transport;

pub use client::Client;
pub use config::{
    ClientBuilder, ClientConfig, DEFAULT_PLAIN_PORT, DEFAULT_TLS_PORT, ReconnectPolicy,
};
pub use connection::ConnectionState;
pub use dispatch::{CallbackResult, EventCallback};
pub use error::{
    ConfigError, ConnectError, DeliveryError, Error, PublishError, Result, SubscribeError,
    TopicError, TransportError,
};
pub use event::{ClientEvent, EventBus};
pub use identity::{ClientIdentity, DEFAULT_DOMAIN, IdentityKind, QUICKSTART_ORG};
pub use message::{
    Command, Event, InboundMessage, Message, OutboundMessage, Payload, decode_payload,
    encode_payload,
};
pub use subscription::ResyncReport;
pub use topic::{
    MessageClass, MessageFormat, ParsedTopic, TopicFilter, command_topic, event_topic,
    topic_matches,
};
pub use transport::QoS;

/// A client speaking MQTT to the platform broker.
#[cfg(feature = "mqtt")]
pub type ApplicationClient = Client<transport::mqtt::MqttTransport>;
