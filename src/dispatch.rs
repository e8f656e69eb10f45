// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delivery of inbound messages to the registered callback.
//!
//! Each session gets a [`DispatchQueue`]: a bounded channel drained by one
//! worker on the blocking thread pool, so a slow callback never runs on the
//! transport read loop.
//!
//! # Backpressure
//!
//! When the queue is full the read loop waits up to the configured dispatch
//! timeout for a free slot. If none frees up, the incoming (newest) message
//! is dropped and reported as [`DeliveryError::QueueFull`]. Messages already
//! queued are never discarded.
//!
//! # Ordering
//!
//! A single worker consumes the queue in arrival order, so messages on the
//! same topic reach the callback in the order the transport produced them.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::event::{ClientEvent, EventBus};
use crate::message::{InboundMessage, Message};

/// Result a callback returns for one message.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives every decoded inbound message of a client.
///
/// Closures of the form `Fn(Message) -> CallbackResult` implement this trait.
/// An error or a panic is reported as [`DeliveryError::CallbackFailed`] and
/// delivery continues with the next message.
///
/// # Examples
///
/// ```
/// use iotf_client::{CallbackResult, EventCallback, Message};
///
/// struct Printer;
///
/// impl EventCallback for Printer {
///     fn on_message(&self, message: Message) -> CallbackResult {
///         if let Some(command) = message.as_command() {
///             println!("{command}");
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait EventCallback: Send + Sync + 'static {
    /// Handles one message. Runs on the dispatcher's worker thread.
    fn on_message(&self, message: Message) -> CallbackResult;
}

impl<F> EventCallback for F
where
    F: Fn(Message) -> CallbackResult + Send + Sync + 'static,
{
    fn on_message(&self, message: Message) -> CallbackResult {
        self(message)
    }
}

type CallbackSlot = Arc<RwLock<Option<Arc<dyn EventCallback>>>>;

/// Holds the callback and starts per-session delivery queues.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    callback: CallbackSlot,
    events: EventBus,
    capacity: usize,
    timeout: Duration,
}

impl Dispatcher {
    pub(crate) fn new(capacity: usize, timeout: Duration, events: EventBus) -> Self {
        Self {
            callback: Arc::new(RwLock::new(None)),
            events,
            capacity,
            timeout,
        }
    }

    /// Installs `callback`, replacing any previous one.
    ///
    /// Each message is handed to whichever callback is installed when the
    /// worker picks it up, never to both.
    pub(crate) fn set_callback(&self, callback: Arc<dyn EventCallback>) -> bool {
        self.callback.write().replace(callback).is_some()
    }

    pub(crate) fn clear_callback(&self) -> bool {
        self.callback.write().take().is_some()
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Spawns a worker and returns the queue feeding it.
    ///
    /// Dropping the queue lets the worker deliver what is left, then exit.
    pub(crate) fn start(&self, session_id: Uuid) -> DispatchQueue {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(self.capacity);
        let callback = Arc::clone(&self.callback);
        let events = self.events.clone();

        tokio::task::spawn_blocking(move || {
            tracing::debug!(session = %session_id, "Dispatcher started");
            while let Some(inbound) = rx.blocking_recv() {
                deliver(&callback, &events, inbound);
            }
            tracing::debug!(session = %session_id, "Dispatcher stopped");
        });

        DispatchQueue {
            tx,
            timeout: self.timeout,
            events: self.events.clone(),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("has_callback", &self.has_callback())
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Producer side of a session's delivery queue.
pub(crate) struct DispatchQueue {
    tx: mpsc::Sender<InboundMessage>,
    timeout: Duration,
    events: EventBus,
}

impl DispatchQueue {
    /// Queues `inbound`, waiting up to the dispatch timeout for space.
    ///
    /// Returns `false` if the message was dropped.
    pub(crate) async fn enqueue(&self, inbound: InboundMessage) -> bool {
        match tokio::time::timeout(self.timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(inbound);
                true
            }
            Ok(Err(_)) => {
                tracing::debug!(topic = %inbound.topic, "Dispatcher gone, message discarded");
                false
            }
            Err(_) => {
                tracing::warn!(
                    topic = %inbound.topic,
                    sequence = inbound.arrival_sequence,
                    "Dispatch queue full, dropping message"
                );
                self.events
                    .publish(ClientEvent::DeliveryFailed(DeliveryError::QueueFull {
                        topic: inbound.topic,
                    }));
                false
            }
        }
    }
}

fn deliver(callback: &CallbackSlot, events: &EventBus, inbound: InboundMessage) {
    let message = match Message::decode(&inbound) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping undecodable message");
            events.publish(ClientEvent::DeliveryFailed(e));
            return;
        }
    };

    let Some(callback) = callback.read().clone() else {
        tracing::debug!(
            topic = %inbound.topic,
            "No callback registered, message dropped"
        );
        return;
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| callback.on_message(message)));
    let reason = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => format!("callback panicked: {}", panic_message(&*panic)),
    };

    tracing::warn!(topic = %inbound.topic, reason = %reason, "Callback failed");
    events.publish(ClientEvent::DeliveryFailed(DeliveryError::CallbackFailed {
        topic: inbound.topic,
        reason,
    }));
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
