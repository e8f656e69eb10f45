// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transport boundary between the client and a pub/sub broker.
//!
//! The client core never speaks a wire protocol itself. It drives a
//! [`Transport`] through two halves, modelled on how `rumqttc` splits a
//! connection:
//!
//! - a cloneable [`Link`] used by caller-facing operations to publish,
//!   subscribe and disconnect;
//! - an [`EventStream`] owned by the background task, which establishes the
//!   session when polled and yields inbound events.
//!
//! Polling an [`EventStream`] again after it returned an error starts a new
//! connection attempt. Backoff between attempts is the caller's business.
//!
//! # Implementations
//!
//! - [`mqtt::MqttTransport`]: MQTT 3.1.1 over TCP or TLS (feature `mqtt`)
//! - [`memory::MemoryTransport`]: an in-process broker for tests and demos

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;
use crate::message::OutboundMessage;

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;

/// Transport used by [`Client`](crate::Client) when none is named.
#[cfg(feature = "mqtt")]
pub type DefaultTransport = mqtt::MqttTransport;

/// Transport used by [`Client`](crate::Client) when none is named.
#[cfg(not(feature = "mqtt"))]
pub type DefaultTransport = memory::MemoryTransport;

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Delivered at least once.
    #[default]
    AtLeastOnce,
    /// Delivered exactly once.
    ExactlyOnce,
}

/// Parameters for opening a broker session.
#[derive(Clone)]
pub struct SessionOptions {
    /// MQTT client id.
    pub client_id: String,
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// `(username, password)` sent with CONNECT.
    pub credentials: Option<(String, String)>,
    /// Whether to wrap the connection in TLS.
    pub use_tls: bool,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Whether the broker should discard session state on connect.
    pub clean_session: bool,
    /// Capacity of the outgoing request queue.
    pub request_capacity: usize,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.credentials.as_ref().map(|(u, _)| u))
            .field("use_tls", &self.use_tls)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .finish_non_exhaustive()
    }
}

/// Something the broker session reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session was established (CONNACK accepted).
    Connected,
    /// A message arrived on a subscribed topic.
    Message {
        /// The topic it was published on.
        topic: String,
        /// Raw payload bytes.
        payload: Vec<u8>,
    },
    /// The broker refused a filter after the subscribe request was accepted
    /// for sending.
    SubscribeRefused {
        /// The refused topic filter.
        filter: String,
    },
    /// The session ended cleanly, either by our DISCONNECT or the broker's.
    Disconnected,
}

/// A pub/sub transport able to open broker sessions.
pub trait Transport: Send + Sync + 'static {
    /// Handle for outgoing requests.
    type Link: Link;
    /// Stream of inbound events; also drives the connection.
    type Events: EventStream;

    /// Prepares a session. No I/O happens until the event stream is polled.
    fn open(&self, options: &SessionOptions) -> (Self::Link, Self::Events);
}

/// Outgoing half of a broker session.
pub trait Link: Clone + Send + Sync + 'static {
    /// Publishes a message.
    fn publish(
        &self,
        message: OutboundMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribes to one topic filter.
    ///
    /// A transport that learns about a refusal only after returning reports
    /// it as [`TransportEvent::SubscribeRefused`] on the event stream.
    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribes to several topic filters in a single request.
    fn subscribe_many(
        &self,
        filters: &[String],
        qos: QoS,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Removes a topic filter subscription.
    fn unsubscribe(&self, filter: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Requests a graceful end of the session.
    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Inbound half of a broker session.
pub trait EventStream: Send + 'static {
    /// Waits for the next event, connecting first if there is no live session.
    fn poll(&mut self) -> impl Future<Output = Result<TransportEvent, TransportError>> + Send;
}
