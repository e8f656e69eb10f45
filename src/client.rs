// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The application-facing client.
//!
//! # Examples
//!
//! ```no_run
//! use iotf_client::{Client, ClientIdentity, Message};
//! use serde_json::json;
//!
//! # async fn example() -> iotf_client::Result<()> {
//! let identity = ClientIdentity::application("myorg", "dashboard", "a-myorg-key", "token");
//! let client = Client::builder(identity).build_mqtt()?;
//!
//! client.set_event_callback(|message: Message| {
//!     if let Some(command) = message.as_command() {
//!         println!("{command}: {:?}", command.payload());
//!     }
//!     Ok(())
//! });
//!
//! client.connect().await?;
//! client.subscribe_to_device_commands("Sensor", "dev42").await?;
//! client
//!     .publish_command("Sensor", "dev42", "run", &json!({"distance": 10}))
//!     .await?;
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::{ClientBuilder, ClientConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::dispatch::{CallbackResult, Dispatcher, EventCallback};
use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::event::{ClientEvent, EventBus};
use crate::identity::ClientIdentity;
use crate::message::Message;
use crate::publish::{PublishRequest, Publisher};
use crate::subscription::SubscriptionRegistry;
use crate::topic::{MessageClass, MessageFormat, TopicFilter};
use crate::transport::{DefaultTransport, Transport};

/// A client bound to one identity and one transport.
///
/// `Client` is cheaply cloneable (via `Arc`); all clones share the same
/// session, subscriptions and callback. The session is closed when the last
/// clone is dropped.
///
/// Every instance is independent: two clients never share state, even when
/// they use the same broker.
pub struct Client<T: Transport = DefaultTransport> {
    inner: Arc<ClientInner<T>>,
}

struct ClientInner<T: Transport> {
    identity: ClientIdentity,
    client_id: String,
    config: ClientConfig,
    connection: ConnectionManager<T>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    publisher: Publisher,
    events: EventBus,
}

impl Client {
    /// Creates a new builder for a client with `identity`.
    ///
    /// The transport is chosen when building: [`ClientBuilder::build`] takes
    /// any transport, `ClientBuilder::build_mqtt` uses MQTT.
    #[must_use]
    pub fn builder(identity: ClientIdentity) -> ClientBuilder {
        ClientBuilder::new(identity)
    }
}

impl<T: Transport> Client<T> {
    pub(crate) fn from_parts(identity: ClientIdentity, config: ClientConfig, transport: T) -> Self {
        let events = EventBus::new();
        let registry = Arc::new(SubscriptionRegistry::new(config.qos, events.clone()));
        let dispatcher = Dispatcher::new(
            config.dispatch_capacity,
            config.dispatch_timeout,
            events.clone(),
        );
        let connection = ConnectionManager::new(
            transport,
            config.session_options(&identity),
            &config,
            Arc::clone(&registry),
            dispatcher.clone(),
            events.clone(),
        );

        Self {
            inner: Arc::new(ClientInner {
                client_id: identity.client_id(),
                identity,
                publisher: Publisher::new(config.qos),
                config,
                connection,
                registry,
                dispatcher,
                events,
            }),
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects to the broker and waits until the session is usable.
    ///
    /// Recorded subscriptions are applied before this returns. Calling it
    /// while connected does nothing; calling it while another connect is in
    /// progress waits for that attempt.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::AuthFailed`] if the broker rejects the credentials
    /// - [`ConnectError::Unreachable`] after the configured number of attempts
    /// - [`ConnectError::Timeout`] if no outcome is reached in time
    /// - [`ConnectError::Cancelled`] if [`disconnect`](Self::disconnect) is
    ///   called meanwhile
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.inner.connection.connect().await
    }

    /// Closes the session and stops reconnecting.
    ///
    /// Idempotent. Subscriptions stay recorded and are restored by the next
    /// [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await;
    }

    /// Returns `true` if the session is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Waits until the connection reaches `state`.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        self.inner.connection.wait_for_state(state, timeout).await
    }

    /// Returns the MQTT client id derived from the identity.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Returns the client's identity.
    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    /// Returns the client's configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // =========================================================================
    // Callback
    // =========================================================================

    /// Registers the closure every inbound command and event is passed to.
    ///
    /// Replaces any previous callback. Returns `true` if one was replaced.
    pub fn set_event_callback<F>(&self, callback: F) -> bool
    where
        F: Fn(Message) -> CallbackResult + Send + Sync + 'static,
    {
        self.inner.dispatcher.set_callback(Arc::new(callback))
    }

    /// Registers an [`EventCallback`] implementation.
    ///
    /// Replaces any previous callback. Returns `true` if one was replaced.
    pub fn set_event_handler<H: EventCallback>(&self, handler: H) -> bool {
        self.inner.dispatcher.set_callback(Arc::new(handler))
    }

    /// Removes the callback. Later messages are dropped.
    ///
    /// Returns `true` if a callback was registered.
    pub fn clear_event_callback(&self) -> bool {
        self.inner.dispatcher.clear_callback()
    }

    /// Returns a receiver for diagnostic events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribes to every command addressed to one device.
    ///
    /// Applied immediately when connected, otherwise on the next connect.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] if the identifiers cannot form a topic or
    /// the broker refuses the subscription.
    pub async fn subscribe_to_device_commands(
        &self,
        device_type: &str,
        device_id: &str,
    ) -> Result<(), SubscribeError> {
        self.subscribe(TopicFilter::device_commands(device_type, device_id))
            .await
    }

    /// Subscribes to every event reported by one device.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] if the identifiers cannot form a topic or
    /// the broker refuses the subscription.
    pub async fn subscribe_to_device_events(
        &self,
        device_type: &str,
        device_id: &str,
    ) -> Result<(), SubscribeError> {
        self.subscribe(TopicFilter::device_events(device_type, device_id))
            .await
    }

    /// Subscribes to an arbitrary filter.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] if the filter is invalid or the broker
    /// refuses it.
    pub async fn subscribe(&self, filter: TopicFilter) -> Result<(), SubscribeError> {
        let connection = &self.inner.connection;
        self.inner
            .registry
            .subscribe(filter, || connection.connected_link())
            .await
    }

    /// Removes a filter. Returns `true` if it was subscribed.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] if the broker refuses the unsubscribe. The
    /// filter is forgotten either way.
    pub async fn unsubscribe(&self, filter: &TopicFilter) -> Result<bool, SubscribeError> {
        let connection = &self.inner.connection;
        self.inner
            .registry
            .unsubscribe(filter, || connection.connected_link())
            .await
    }

    /// Stops receiving commands for one device.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] if the broker refuses the unsubscribe.
    pub async fn unsubscribe_from_device_commands(
        &self,
        device_type: &str,
        device_id: &str,
    ) -> Result<bool, SubscribeError> {
        self.unsubscribe(&TopicFilter::device_commands(device_type, device_id))
            .await
    }

    /// Returns the recorded filters in order.
    pub async fn subscriptions(&self) -> Vec<TopicFilter> {
        self.inner.registry.filters().await
    }

    /// Returns `true` if `filter` is recorded.
    pub async fn is_subscribed(&self, filter: &TopicFilter) -> bool {
        self.inner.registry.contains(filter).await
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Publishes a JSON command to a device.
    ///
    /// # Errors
    ///
    /// - [`PublishError::NotConnected`] unless connected; nothing is queued
    /// - [`PublishError::SerializationFailed`] if `data` cannot be encoded
    /// - [`PublishError::TransportRejected`] if the transport refuses it
    pub async fn publish_command<P>(
        &self,
        device_type: &str,
        device_id: &str,
        command: &str,
        data: &P,
    ) -> Result<(), PublishError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.publish_command_with_format(device_type, device_id, command, MessageFormat::Json, data)
            .await
    }

    /// Publishes a command in `format`.
    ///
    /// # Errors
    ///
    /// See [`publish_command`](Self::publish_command).
    pub async fn publish_command_with_format<P>(
        &self,
        device_type: &str,
        device_id: &str,
        command: &str,
        format: MessageFormat,
        data: &P,
    ) -> Result<(), PublishError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.publish(PublishRequest {
            class: MessageClass::Command,
            device_type,
            device_id,
            name: command,
            format,
            data,
        })
        .await
    }

    /// Publishes a JSON event on behalf of a device.
    ///
    /// # Errors
    ///
    /// See [`publish_command`](Self::publish_command).
    pub async fn publish_event<P>(
        &self,
        device_type: &str,
        device_id: &str,
        event: &str,
        data: &P,
    ) -> Result<(), PublishError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.publish_event_with_format(device_type, device_id, event, MessageFormat::Json, data)
            .await
    }

    /// Publishes an event in `format`.
    ///
    /// # Errors
    ///
    /// See [`publish_command`](Self::publish_command).
    pub async fn publish_event_with_format<P>(
        &self,
        device_type: &str,
        device_id: &str,
        event: &str,
        format: MessageFormat,
        data: &P,
    ) -> Result<(), PublishError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.publish(PublishRequest {
            class: MessageClass::Event,
            device_type,
            device_id,
            name: event,
            format,
            data,
        })
        .await
    }

    async fn publish<P>(&self, request: PublishRequest<'_, P>) -> Result<(), PublishError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.inner
            .publisher
            .publish(self.inner.connection.connected_link(), request)
            .await
    }
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}
