// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process broker for tests and demos.
//!
//! [`MemoryBroker`] routes messages between sessions opened through its
//! [`MemoryTransport`] using MQTT wildcard matching. It also lets a test
//! inject the failures a real broker produces:
//!
//! - [`MemoryBroker::set_online`] makes connection attempts fail and drops
//!   every live session when switched off
//! - [`MemoryBroker::drop_client`] kills one session as if the network broke
//! - [`MemoryBroker::reject_filter`] makes the broker refuse a topic filter
//! - [`MemoryBroker::revoke_subscription`] refuses a filter after it was
//!   accepted, the way a late SUBACK failure arrives
//!
//! Credentials are only checked once at least one account was registered
//! with [`MemoryBroker::add_account`].
//!
//! # Examples
//!
//! ```
//! use iotf_client::transport::memory::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! broker.add_account("a-org1-key", "secret");
//! assert!(broker.connected_clients().is_empty());
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::OutboundMessage;
use crate::topic::topic_matches;
use crate::transport::{EventStream, Link, QoS, SessionOptions, Transport, TransportEvent};

/// What the broker tells a session's event stream.
#[derive(Debug)]
enum Signal {
    Deliver { topic: String, payload: Vec<u8> },
    Refused(String),
    Drop(String),
    Closed,
}

#[derive(Debug)]
struct SessionEntry {
    generation: u64,
    clean_session: bool,
    filters: BTreeSet<String>,
    tx: mpsc::UnboundedSender<Signal>,
}

#[derive(Debug)]
struct BrokerState {
    online: bool,
    accounts: HashMap<String, String>,
    sessions: HashMap<String, SessionEntry>,
    stored_sessions: HashMap<String, BTreeSet<String>>,
    rejected_filters: HashSet<String>,
    next_generation: u64,
}

impl BrokerState {
    fn authenticate(&self, credentials: Option<&(String, String)>) -> bool {
        if self.accounts.is_empty() {
            return true;
        }
        credentials.is_some_and(|(user, pass)| self.accounts.get(user) == Some(pass))
    }

    /// Removes a session, keeping its filters if it asked for a persistent session.
    fn remove_session(&mut self, client_id: &str) -> Option<SessionEntry> {
        let mut entry = self.sessions.remove(client_id)?;
        if !entry.clean_session {
            self.stored_sessions
                .insert(client_id.to_string(), std::mem::take(&mut entry.filters));
        }
        Some(entry)
    }

    fn session_mut(
        &mut self,
        client_id: &str,
        generation: Option<u64>,
    ) -> Result<&mut SessionEntry, TransportError> {
        let generation = generation.ok_or(TransportError::Closed)?;
        self.sessions
            .get_mut(client_id)
            .filter(|entry| entry.generation == generation)
            .ok_or(TransportError::Closed)
    }

    fn route(&self, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.values() {
            if entry.filters.iter().any(|filter| topic_matches(filter, topic))
                && entry
                    .tx
                    .send(Signal::Deliver {
                        topic: topic.to_string(),
                        payload: payload.to_vec(),
                    })
                    .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }
}

/// An in-process pub/sub broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an online broker with no accounts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                accounts: HashMap::new(),
                sessions: HashMap::new(),
                stored_sessions: HashMap::new(),
                rejected_filters: HashSet::new(),
                next_generation: 1,
            })),
        }
    }

    /// Returns a transport that opens sessions on this broker.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
        }
    }

    /// Registers a username/password pair and turns on credential checks.
    pub fn add_account(&self, username: impl Into<String>, password: impl Into<String>) {
        self.state
            .lock()
            .accounts
            .insert(username.into(), password.into());
    }

    /// Takes the broker on or off line.
    ///
    /// Going offline drops every live session. While offline, connection
    /// attempts fail as unreachable.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        state.online = online;
        if !online {
            let client_ids: Vec<String> = state.sessions.keys().cloned().collect();
            for client_id in client_ids {
                if let Some(entry) = state.remove_session(&client_id) {
                    let _ = entry.tx.send(Signal::Drop("broker went offline".to_string()));
                }
            }
        }
        tracing::debug!(online, "Memory broker availability changed");
    }

    /// Kills a client's session as if its network connection broke.
    ///
    /// Returns `false` if the client was not connected.
    pub fn drop_client(&self, client_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.remove_session(client_id) {
            Some(entry) => {
                let _ = entry.tx.send(Signal::Drop("dropped by broker".to_string()));
                tracing::debug!(client_id, "Memory broker dropped client");
                true
            }
            None => false,
        }
    }

    /// Makes the broker refuse subscriptions to `filter`.
    pub fn reject_filter(&self, filter: impl Into<String>) {
        self.state.lock().rejected_filters.insert(filter.into());
    }

    /// Removes `filter` from a live session and tells its event stream the
    /// broker refused it.
    ///
    /// Returns `false` if the session does not hold the filter.
    pub fn revoke_subscription(&self, client_id: &str, filter: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.sessions.get_mut(client_id) else {
            return false;
        };
        if !entry.filters.remove(filter) {
            return false;
        }
        let _ = entry.tx.send(Signal::Refused(filter.to_string()));
        tracing::debug!(client_id, filter, "Memory broker revoked subscription");
        true
    }

    /// Returns `true` if a session for `client_id` is live.
    #[must_use]
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state.lock().sessions.contains_key(client_id)
    }

    /// Returns the filters the live session for `client_id` is subscribed to.
    #[must_use]
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.state
            .lock()
            .sessions
            .get(client_id)
            .map(|entry| entry.filters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the client ids of all live sessions, sorted.
    #[must_use]
    pub fn connected_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.state.lock().sessions.keys().cloned().collect();
        clients.sort();
        clients
    }

    /// Publishes a message from outside any session.
    ///
    /// Returns the number of sessions it was delivered to. Each session
    /// receives a message at most once, however many of its filters match.
    pub fn publish(&self, topic: &str, payload: impl AsRef<[u8]>) -> usize {
        self.state.lock().route(topic, payload.as_ref())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport that opens sessions on a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl Transport for MemoryTransport {
    type Link = MemoryLink;
    type Events = MemoryEvents;

    fn open(&self, options: &SessionOptions) -> (MemoryLink, MemoryEvents) {
        let shared = Arc::new(LinkShared {
            broker: self.broker.clone(),
            client_id: options.client_id.clone(),
            generation: Mutex::new(None),
        });
        (
            MemoryLink {
                shared: Arc::clone(&shared),
            },
            MemoryEvents {
                shared,
                options: options.clone(),
                rx: None,
            },
        )
    }
}

#[derive(Debug)]
struct LinkShared {
    broker: MemoryBroker,
    client_id: String,
    generation: Mutex<Option<u64>>,
}

impl LinkShared {
    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut BrokerState, u64) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let generation = *self.generation.lock();
        let mut state = self.broker.state.lock();
        let current = state.session_mut(&self.client_id, generation)?.generation;
        f(&mut state, current)
    }
}

/// Outgoing half of a memory session.
#[derive(Debug, Clone)]
pub struct MemoryLink {
    shared: Arc<LinkShared>,
}

impl Link for MemoryLink {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.shared.with_session(|state, _| {
            state.route(&message.topic, &message.payload);
            Ok(())
        })
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.subscribe_many(&[filter.to_string()], qos).await
    }

    async fn subscribe_many(&self, filters: &[String], _qos: QoS) -> Result<(), TransportError> {
        let client_id = self.shared.client_id.as_str();
        self.shared.with_session(|state, generation| {
            if let Some(rejected) = filters
                .iter()
                .find(|filter| state.rejected_filters.contains(*filter))
            {
                return Err(TransportError::Rejected(format!(
                    "filter {rejected} not authorized"
                )));
            }
            let entry = state.session_mut(client_id, Some(generation))?;
            entry.filters.extend(filters.iter().cloned());
            Ok(())
        })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let client_id = self.shared.client_id.as_str();
        self.shared.with_session(|state, generation| {
            state
                .session_mut(client_id, Some(generation))?
                .filters
                .remove(filter);
            Ok(())
        })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client_id = self.shared.client_id.as_str();
        self.shared.with_session(|state, _| {
            if let Some(entry) = state.remove_session(client_id) {
                let _ = entry.tx.send(Signal::Closed);
            }
            Ok(())
        })
    }
}

/// Inbound half of a memory session.
#[derive(Debug)]
pub struct MemoryEvents {
    shared: Arc<LinkShared>,
    options: SessionOptions,
    rx: Option<mpsc::UnboundedReceiver<Signal>>,
}

impl MemoryEvents {
    fn connect(&mut self) -> Result<TransportEvent, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.broker.state.lock();

        if !state.online {
            return Err(TransportError::Unreachable("broker offline".to_string()));
        }
        if !state.authenticate(self.options.credentials.as_ref()) {
            return Err(TransportError::AuthRejected);
        }

        let client_id = self.options.client_id.clone();
        if let Some(previous) = state.remove_session(&client_id) {
            let _ = previous
                .tx
                .send(Signal::Drop("session taken over".to_string()));
        }

        let stored = state.stored_sessions.remove(&client_id);
        let filters = if self.options.clean_session {
            BTreeSet::new()
        } else {
            stored.unwrap_or_default()
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        state.sessions.insert(
            client_id,
            SessionEntry {
                generation,
                clean_session: self.options.clean_session,
                filters,
                tx,
            },
        );
        drop(state);

        *self.shared.generation.lock() = Some(generation);
        self.rx = Some(rx);
        Ok(TransportEvent::Connected)
    }
}

impl EventStream for MemoryEvents {
    async fn poll(&mut self) -> Result<TransportEvent, TransportError> {
        let Some(rx) = self.rx.as_mut() else {
            return self.connect();
        };

        match rx.recv().await {
            Some(Signal::Deliver { topic, payload }) => {
                Ok(TransportEvent::Message { topic, payload })
            }
            Some(Signal::Refused(filter)) => Ok(TransportEvent::SubscribeRefused { filter }),
            Some(Signal::Drop(reason)) => {
                self.rx = None;
                Err(TransportError::ConnectionLost(reason))
            }
            Some(Signal::Closed) | None => {
                self.rx = None;
                Ok(TransportEvent::Disconnected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::MessageFormat;
    use std::time::Duration;

    fn options(client_id: &str) -> SessionOptions {
        SessionOptions {
            client_id: client_id.to_string(),
            host: "localhost".to_string(),
            port: 1883,
            credentials: None,
            use_tls: false,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            request_capacity: 16,
        }
    }

    fn outbound(topic: &str, payload: &[u8]) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            format: MessageFormat::Text,
            payload: payload.to_vec(),
            qos: QoS::AtLeastOnce,
        }
    }

    #[tokio::test]
    async fn link_is_closed_before_connect() {
        let broker = MemoryBroker::new();
        let (link, _events) = broker.transport().open(&options("a:o:x"));

        let err = link.subscribe("a/b", QoS::AtLeastOnce).await.unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn routes_matching_messages() {
        let broker = MemoryBroker::new();
        let (link, mut events) = broker.transport().open(&options("a:o:x"));
        assert_eq!(events.poll().await.unwrap(), TransportEvent::Connected);

        link.subscribe("iot-2/type/+/id/+/cmd/+/fmt/+", QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(broker.subscriptions("a:o:x").len(), 1);

        assert_eq!(broker.publish("iot-2/type/T/id/D/evt/e/fmt/json", b"{}"), 0);
        assert_eq!(broker.publish("iot-2/type/T/id/D/cmd/c/fmt/text", b"hi"), 1);

        match events.poll().await.unwrap() {
            TransportEvent::Message { topic, payload } => {
                assert_eq!(topic, "iot-2/type/T/id/D/cmd/c/fmt/text");
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlapping_filters_deliver_once() {
        let broker = MemoryBroker::new();
        let (link, mut events) = broker.transport().open(&options("a:o:x"));
        events.poll().await.unwrap();

        link.subscribe_many(&["a/+".to_string(), "a/#".to_string()], QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(broker.publish("a/b", b"1"), 1);
    }

    #[tokio::test]
    async fn credentials_checked_once_accounts_exist() {
        let broker = MemoryBroker::new();
        broker.add_account("key", "secret");

        let mut opts = options("a:o:x");
        opts.credentials = Some(("key".to_string(), "wrong".to_string()));
        let (_link, mut events) = broker.transport().open(&opts);
        assert_eq!(events.poll().await.unwrap_err(), TransportError::AuthRejected);

        opts.credentials = Some(("key".to_string(), "secret".to_string()));
        let (_link, mut events) = broker.transport().open(&opts);
        assert_eq!(events.poll().await.unwrap(), TransportEvent::Connected);
    }

    #[tokio::test]
    async fn offline_broker_is_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_online(false);
        let (_link, mut events) = broker.transport().open(&options("a:o:x"));
        assert!(matches!(
            events.poll().await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn dropped_session_reconnects_with_clean_state() {
        let broker = MemoryBroker::new();
        let (link, mut events) = broker.transport().open(&options("a:o:x"));
        events.poll().await.unwrap();
        link.subscribe("a/b", QoS::AtLeastOnce).await.unwrap();

        assert!(broker.drop_client("a:o:x"));
        assert!(matches!(
            events.poll().await,
            Err(TransportError::ConnectionLost(_))
        ));
        assert_eq!(link.publish(outbound("a/b", b"x")).await, Err(TransportError::Closed));

        assert_eq!(events.poll().await.unwrap(), TransportEvent::Connected);
        assert!(broker.subscriptions("a:o:x").is_empty());
        link.publish(outbound("a/b", b"x")).await.unwrap();
    }

    #[tokio::test]
    async fn persistent_session_keeps_filters() {
        let broker = MemoryBroker::new();
        let mut opts = options("a:o:x");
        opts.clean_session = false;
        let (link, mut events) = broker.transport().open(&opts);
        events.poll().await.unwrap();
        link.subscribe("a/b", QoS::AtLeastOnce).await.unwrap();

        broker.drop_client("a:o:x");
        let _ = events.poll().await;
        events.poll().await.unwrap();
        assert_eq!(broker.subscriptions("a:o:x"), vec!["a/b".to_string()]);
    }

    #[tokio::test]
    async fn rejected_filter_fails_whole_batch() {
        let broker = MemoryBroker::new();
        broker.reject_filter("secret/#");
        let (link, mut events) = broker.transport().open(&options("a:o:x"));
        events.poll().await.unwrap();

        let err = link
            .subscribe_many(&["a/b".to_string(), "secret/#".to_string()], QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
        assert!(broker.subscriptions("a:o:x").is_empty());
    }

    #[tokio::test]
    async fn revoked_subscription_is_signalled() {
        let broker = MemoryBroker::new();
        let (link, mut events) = broker.transport().open(&options("a:o:x"));
        events.poll().await.unwrap();
        link.subscribe("a/b", QoS::AtLeastOnce).await.unwrap();

        assert!(broker.revoke_subscription("a:o:x", "a/b"));
        assert!(!broker.revoke_subscription("a:o:x", "a/b"));
        assert_eq!(
            events.poll().await.unwrap(),
            TransportEvent::SubscribeRefused {
                filter: "a/b".to_string()
            }
        );
        assert!(broker.subscriptions("a:o:x").is_empty());
    }

    #[tokio::test]
    async fn disconnect_closes_stream() {
        let broker = MemoryBroker::new();
        let (link, mut events) = broker.transport().open(&options("a:o:x"));
        events.poll().await.unwrap();

        link.disconnect().await.unwrap();
        assert_eq!(events.poll().await.unwrap(), TransportEvent::Disconnected);
        assert!(!broker.is_connected("a:o:x"));
    }

    #[tokio::test]
    async fn same_client_id_takes_over_session() {
        let broker = MemoryBroker::new();
        let (_link1, mut events1) = broker.transport().open(&options("a:o:x"));
        events1.poll().await.unwrap();

        let (_link2, mut events2) = broker.transport().open(&options("a:o:x"));
        events2.poll().await.unwrap();

        assert!(matches!(
            events1.poll().await,
            Err(TransportError::ConnectionLost(_))
        ));
        assert_eq!(broker.connected_clients(), vec!["a:o:x".to_string()]);
    }
}
