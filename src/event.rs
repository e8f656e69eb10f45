// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diagnostic events emitted by a client.
//!
//! Inbound messages go to the registered callback. Everything else a caller
//! may want to observe without being in the call path (state transitions,
//! reconnect attempts, failed subscriptions, dropped messages) is broadcast
//! as a [`ClientEvent`] on the client's [`EventBus`].

use std::time::Duration;

use tokio::sync::broadcast;

use crate::connection::ConnectionState;
use crate::error::{DeliveryError, TransportError};
use crate::topic::TopicFilter;

/// Default channel capacity for the event bus.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Something noteworthy that happened inside a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),

    /// The session was lost and a reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },

    /// The reconnect policy gave up. The client is now disconnected.
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// A recorded subscription could not be restored on the wire.
    SubscriptionFailed {
        /// The filter that failed.
        filter: TopicFilter,
        /// Why it failed.
        error: TransportError,
    },

    /// An inbound message was dropped before or inside the callback.
    DeliveryFailed(DeliveryError),
}

/// Broadcast channel for [`ClientEvent`]s.
///
/// Every subscriber gets its own copy of each event published after it
/// subscribed. A subscriber that falls more than the channel capacity
/// behind loses the oldest events (`RecvError::Lagged`).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    /// Creates a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new event bus with the specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to client events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event to all subscribers.
    ///
    /// If there are no subscribers, the event is silently discarded.
    pub fn publish(&self, event: ClientEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
