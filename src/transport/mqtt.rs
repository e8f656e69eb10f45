// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport backed by `rumqttc`.
//!
//! Each session is one `rumqttc` [`AsyncClient`] / [`EventLoop`] pair. The
//! event loop reconnects by itself whenever it is polled after an error, so
//! [`MqttEvents::poll`] only has to translate packets into
//! [`TransportEvent`]s.
//!
//! A SUBACK only carries a packet id, so every subscribe request is queued
//! in send order with its filters. The event loop pairs each outgoing
//! SUBSCRIBE with the oldest queued entry and turns failure codes in the
//! matching SUBACK into [`TransportEvent::SubscribeRefused`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, SubAck, SubscribeFilter, SubscribeReasonCode,
};

use crate::error::TransportError;
use crate::message::OutboundMessage;
use crate::transport::{EventStream, Link, QoS, SessionOptions, Transport, TransportEvent};

/// MQTT 3.1.1 transport over TCP, or TLS with the platform's root certificates.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTransport;

impl MqttTransport {
    /// Creates the transport.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Transport for MqttTransport {
    type Link = MqttLink;
    type Events = MqttEvents;

    fn open(&self, options: &SessionOptions) -> (MqttLink, MqttEvents) {
        let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(options.clean_session);

        if let Some((ref username, ref password)) = options.credentials {
            mqtt_options.set_credentials(username, password);
        }
        if options.use_tls {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, options.request_capacity);
        let queued = Arc::new(Mutex::new(VecDeque::new()));

        tracing::debug!(
            client_id = %options.client_id,
            host = %options.host,
            port = options.port,
            tls = options.use_tls,
            "Opened MQTT session"
        );

        (
            MqttLink {
                client,
                queued: Arc::clone(&queued),
                send_order: Arc::new(tokio::sync::Mutex::new(())),
            },
            MqttEvents {
                event_loop,
                connected: false,
                tracker: SubscribeTracker::new(queued),
                pending: VecDeque::new(),
            },
        )
    }
}

/// Filter lists of subscribe requests handed to the client, oldest first.
type QueuedSubscribes = Arc<Mutex<VecDeque<Vec<String>>>>;

/// Outgoing half of an MQTT session.
#[derive(Debug, Clone)]
pub struct MqttLink {
    client: AsyncClient,
    queued: QueuedSubscribes,
    send_order: Arc<tokio::sync::Mutex<()>>,
}

impl MqttLink {
    /// Queues `filters` for SUBACK matching, then hands the request to the client.
    async fn send_subscribe(&self, filters: Vec<String>, qos: QoS) -> Result<(), TransportError> {
        let qos = to_mqtt_qos(qos);
        let _order = self.send_order.lock().await;
        self.queued.lock().push_back(filters.clone());

        let result = self
            .client
            .subscribe_many(
                filters
                    .into_iter()
                    .map(|filter| SubscribeFilter::new(filter, qos)),
            )
            .await;
        if result.is_err() {
            self.queued.lock().pop_back();
        }
        result.map_err(map_client_error)
    }
}

impl Link for MqttLink {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.client
            .publish(message.topic, to_mqtt_qos(message.qos), false, message.payload)
            .await
            .map_err(map_client_error)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.send_subscribe(vec![filter.to_string()], qos).await
    }

    async fn subscribe_many(&self, filters: &[String], qos: QoS) -> Result<(), TransportError> {
        self.send_subscribe(filters.to_vec(), qos).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(filter)
            .await
            .map_err(map_client_error)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client.disconnect().await.map_err(map_client_error)
    }
}

/// Pairs SUBACK packets with the filters of their SUBSCRIBE.
#[derive(Debug)]
struct SubscribeTracker {
    queued: QueuedSubscribes,
    in_flight: HashMap<u16, Vec<String>>,
}

impl SubscribeTracker {
    fn new(queued: QueuedSubscribes) -> Self {
        Self {
            queued,
            in_flight: HashMap::new(),
        }
    }

    /// The event loop wrote the oldest queued SUBSCRIBE with `pkid`.
    fn sent(&mut self, pkid: u16) {
        match self.queued.lock().pop_front() {
            Some(filters) => {
                self.in_flight.insert(pkid, filters);
            }
            None => tracing::debug!(pkid, "SUBSCRIBE without queued filters"),
        }
    }

    /// Returns the filters `suback` refused.
    fn acknowledged(&mut self, suback: &SubAck) -> Vec<String> {
        let Some(filters) = self.in_flight.remove(&suback.pkid) else {
            return Vec::new();
        };
        filters
            .into_iter()
            .zip(&suback.return_codes)
            .filter(|(_, code)| matches!(code, SubscribeReasonCode::Failure))
            .map(|(filter, _)| filter)
            .collect()
    }

    /// Forgets requests that died with the previous connection.
    fn reset(&mut self) {
        self.in_flight.clear();
    }
}

/// Inbound half of an MQTT session.
pub struct MqttEvents {
    event_loop: EventLoop,
    connected: bool,
    tracker: SubscribeTracker,
    pending: VecDeque<TransportEvent>,
}

impl std::fmt::Debug for MqttEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttEvents")
            .field("connected", &self.connected)
            .field("in_flight_subscribes", &self.tracker.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl EventStream for MqttEvents {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    tracing::debug!(?connack, "MQTT connection acknowledged");
                    if connack.code != ConnectReturnCode::Success {
                        return Err(map_return_code(connack.code));
                    }
                    self.tracker.reset();
                    self.connected = true;
                    return Ok(TransportEvent::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    tracing::trace!(
                        topic = %publish.topic,
                        bytes = publish.payload.len(),
                        "MQTT message received"
                    );
                    return Ok(TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => self.tracker.sent(pkid),
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    let refused = self.tracker.acknowledged(&suback);
                    if refused.is_empty() {
                        tracing::debug!(pkid = suback.pkid, "MQTT subscription acknowledged");
                        continue;
                    }
                    tracing::warn!(
                        pkid = suback.pkid,
                        refused = refused.len(),
                        "Broker refused subscription filters"
                    );
                    self.pending.extend(
                        refused
                            .into_iter()
                            .map(|filter| TransportEvent::SubscribeRefused { filter }),
                    );
                    if let Some(event) = self.pending.pop_front() {
                        return Ok(event);
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect) | Event::Outgoing(Outgoing::Disconnect)) => {
                    self.connected = false;
                    return Ok(TransportEvent::Disconnected);
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(code)) => {
                    self.connected = false;
                    return Err(map_return_code(code));
                }
                Err(e) => {
                    let was_connected = std::mem::replace(&mut self.connected, false);
                    return Err(if was_connected {
                        TransportError::ConnectionLost(e.to_string())
                    } else {
                        TransportError::Unreachable(e.to_string())
                    });
                }
            }
        }
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn map_return_code(code: ConnectReturnCode) -> TransportError {
    match code {
        ConnectReturnCode::BadUserNamePassword
        | ConnectReturnCode::NotAuthorized
        | ConnectReturnCode::BadClientId => TransportError::AuthRejected,
        other => TransportError::Unreachable(format!("connection refused: {other:?}")),
    }
}

fn map_client_error(err: ClientError) -> TransportError {
    TransportError::Rejected(err.to_string())
}
