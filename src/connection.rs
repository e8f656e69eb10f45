// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection lifecycle.
//!
//! [`ConnectionManager`] owns the client's [`ConnectionState`] and at most one
//! live session. A session is a transport [`Link`] for outgoing requests plus
//! a background supervisor task that owns the transport's event stream. The
//! supervisor:
//!
//! - resynchronizes the subscription registry on every (re)connect, before
//!   the state becomes [`ConnectionState::Connected`];
//! - hands inbound messages to the session's dispatch queue;
//! - retries lost sessions according to the reconnect policy.
//!
//! Caller-driven transitions (`connect`, `disconnect`) are serialized by an
//! async mutex. The state itself lives in a `watch` channel so waiters
//! suspend instead of polling.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::dispatch::{DispatchQueue, Dispatcher};
use crate::error::{ConnectError, TransportError};
use crate::event::{ClientEvent, EventBus};
use crate::message::InboundMessage;
use crate::subscription::{ResyncReport, ResyncScope, SubscriptionRegistry};
use crate::transport::{EventStream, Link, SessionOptions, Transport, TransportEvent};

/// Lifecycle state of a client's broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session and no attempt in progress.
    Disconnected,
    /// A session is being established or re-established.
    Connecting,
    /// The session is up and subscriptions are in sync.
    Connected,
    /// The session is being closed.
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        })
    }
}

/// Current state plus change notification.
struct StateCell {
    tx: watch::Sender<ConnectionState>,
    events: EventBus,
}

impl StateCell {
    fn new(events: EventBus) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx, events }
    }

    fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    fn set(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
            self.events.publish(ClientEvent::StateChanged(state));
        }
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

struct Session<L> {
    id: Uuid,
    link: L,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub(crate) struct ConnectionManager<T: Transport> {
    transport: T,
    options: SessionOptions,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
    initial_connect_attempts: u32,
    reconnect: ReconnectPolicy,
    resubscribe_on_reconnect: bool,
    state: Arc<StateCell>,
    session: Mutex<Option<Session<T::Link>>>,
    transition: tokio::sync::Mutex<()>,
    last_error: Arc<Mutex<Option<ConnectError>>>,
    sequence: Arc<AtomicU64>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    events: EventBus,
}

impl<T: Transport> ConnectionManager<T> {
    pub(crate) fn new(
        transport: T,
        options: SessionOptions,
        config: &ClientConfig,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Dispatcher,
        events: EventBus,
    ) -> Self {
        Self {
            transport,
            options,
            connect_timeout: config.connect_timeout,
            disconnect_timeout: config.disconnect_timeout,
            initial_connect_attempts: config.initial_connect_attempts,
            reconnect: config.reconnect,
            resubscribe_on_reconnect: config.resubscribe_on_reconnect,
            state: Arc::new(StateCell::new(events.clone())),
            session: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            last_error: Arc::new(Mutex::new(None)),
            sequence: Arc::new(AtomicU64::new(0)),
            registry,
            dispatcher,
            events,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Returns the session's link, but only while connected.
    pub(crate) fn connected_link(&self) -> Option<T::Link> {
        if self.state.get() != ConnectionState::Connected {
            return None;
        }
        self.session.lock().as_ref().map(|session| session.link.clone())
    }

    /// Suspends until the state equals `target` or `timeout` elapses.
    pub(crate) async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| *state == target).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    /// Establishes a session, or joins the attempt already in progress.
    pub(crate) async fn connect(&self) -> Result<(), ConnectError> {
        let mut state_rx = self.state.subscribe();

        let started = {
            let _transition = self.transition.lock().await;
            match self.state.get() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => None,
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                    Some(self.start_session().await)
                }
            }
        };

        let outcome = tokio::time::timeout(self.connect_timeout, async {
            state_rx
                .wait_for(|state| {
                    matches!(
                        state,
                        ConnectionState::Connected | ConnectionState::Disconnected
                    )
                })
                .await
                .map(|state| *state)
        })
        .await;

        match outcome {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(self.last_error.lock().clone().unwrap_or(ConnectError::Cancelled)),
            Err(_) => self.connect_timed_out(started).await,
        }
    }

    /// Fails a timed-out `connect()`. The session is torn down only if it is
    /// still the one this call started.
    async fn connect_timed_out(&self, started: Option<Uuid>) -> Result<(), ConnectError> {
        let _transition = self.transition.lock().await;
        if self.state.get() == ConnectionState::Connected {
            return Ok(());
        }

        let timeout_ms = u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(
            client_id = %self.options.client_id,
            timeout_ms,
            "Connect timed out"
        );
        let current = self.session.lock().as_ref().map(|session| session.id);
        if started.is_some() && current == started {
            self.teardown().await;
        }
        Err(ConnectError::Timeout(timeout_ms))
    }

    /// Closes the session. Does nothing if there is none.
    ///
    /// A `connect()` pending in another task fails with
    /// [`ConnectError::Cancelled`].
    pub(crate) async fn disconnect(&self) {
        let _transition = self.transition.lock().await;
        self.teardown().await;
    }

    async fn start_session(&self) -> Uuid {
        let stale = self.session.lock().take();
        if let Some(stale) = stale {
            let _ = stale.shutdown.send(true);
            stale.task.abort();
            let _ = stale.task.await;
        }

        *self.last_error.lock() = None;
        self.state.set(ConnectionState::Connecting);

        let id = Uuid::new_v4();
        let (link, stream) = self.transport.open(&self.options);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            client_id = %self.options.client_id,
            host = %self.options.host,
            port = self.options.port,
            session = %id,
            "Connecting to broker"
        );

        let supervisor: Supervisor<T> = Supervisor {
            session_id: id,
            stream,
            link: link.clone(),
            connected: false,
            state: Arc::clone(&self.state),
            registry: Arc::clone(&self.registry),
            queue: self.dispatcher.start(id),
            events: self.events.clone(),
            last_error: Arc::clone(&self.last_error),
            sequence: Arc::clone(&self.sequence),
            shutdown: shutdown_rx,
            initial_connect_attempts: self.initial_connect_attempts,
            reconnect: self.reconnect,
            resubscribe_on_reconnect: self.resubscribe_on_reconnect,
            drain_timeout: self.disconnect_timeout / 2,
        };
        let task = tokio::spawn(supervisor.run());

        *self.session.lock() = Some(Session {
            id,
            link,
            shutdown: shutdown_tx,
            task,
        });
        id
    }

    async fn teardown(&self) {
        let Some(session) = self.session.lock().take() else {
            self.state.set(ConnectionState::Disconnected);
            return;
        };

        tracing::info!(
            client_id = %self.options.client_id,
            session = %session.id,
            "Disconnecting from broker"
        );

        let _ = session.shutdown.send(true);
        self.state.set(ConnectionState::Disconnecting);

        if let Err(e) = session.link.disconnect().await {
            tracing::debug!(session = %session.id, error = %e, "Transport disconnect skipped");
        }

        let mut task = session.task;
        if tokio::time::timeout(self.disconnect_timeout, &mut task)
            .await
            .is_err()
        {
            tracing::warn!(session = %session.id, "Session did not stop in time, aborting");
            task.abort();
        }

        self.state.set(ConnectionState::Disconnected);
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            let _ = session.shutdown.send(true);
            session.task.abort();
        }
    }
}

/// Background task owning one session's event stream.
struct Supervisor<T: Transport> {
    session_id: Uuid,
    stream: T::Events,
    link: T::Link,
    connected: bool,
    state: Arc<StateCell>,
    registry: Arc<SubscriptionRegistry>,
    queue: DispatchQueue,
    events: EventBus,
    last_error: Arc<Mutex<Option<ConnectError>>>,
    sequence: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
    initial_connect_attempts: u32,
    reconnect: ReconnectPolicy,
    resubscribe_on_reconnect: bool,
    drain_timeout: Duration,
}

impl<T: Transport> Supervisor<T> {
    async fn run(mut self) {
        let mut ever_connected = false;
        let mut failures: u32 = 0;

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    self.drain().await;
                    return;
                }
                polled = self.stream.poll() => polled,
            };

            let error = match polled {
                Ok(TransportEvent::Connected) => {
                    failures = 0;
                    let scope = if !ever_connected || self.resubscribe_on_reconnect {
                        ResyncScope::Full
                    } else {
                        ResyncScope::Pending
                    };
                    self.on_connected(scope).await;
                    ever_connected = true;
                    continue;
                }
                Ok(TransportEvent::SubscribeRefused { filter }) => {
                    self.registry.refused(&filter).await;
                    continue;
                }
                Ok(TransportEvent::Message { topic, payload }) => {
                    let inbound = InboundMessage {
                        topic,
                        payload,
                        arrival_sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
                        received_at: Utc::now(),
                    };
                    self.queue.enqueue(inbound).await;
                    continue;
                }
                Ok(TransportEvent::Disconnected) => {
                    TransportError::ConnectionLost("broker closed the session".to_string())
                }
                Err(e) => e,
            };

            failures += 1;
            if !self.recover(error, failures, ever_connected).await {
                return;
            }
        }
    }

    async fn on_connected(&mut self, scope: ResyncScope) {
        self.connected = true;

        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let mark_connected = move |_: &ResyncReport| {
            if !*shutdown.borrow() {
                state.set(ConnectionState::Connected);
            }
        };

        let report = self
            .registry
            .resync(&self.link, scope, mark_connected)
            .await;
        tracing::info!(
            session = %self.session_id,
            scope = ?scope,
            subscribed = report.subscribed,
            unsubscribed = report.unsubscribed,
            failed = report.failures.len(),
            "Connected, subscriptions in sync"
        );
        *self.last_error.lock() = None;
    }

    /// Decides whether to retry after `error`. Returns `false` when the
    /// supervisor should stop.
    async fn recover(&mut self, error: TransportError, failures: u32, ever_connected: bool) -> bool {
        let was_connected = std::mem::replace(&mut self.connected, false);

        if error.is_fatal() {
            tracing::error!(session = %self.session_id, "Broker rejected credentials");
            self.fail(ConnectError::AuthFailed);
            return false;
        }

        if !ever_connected {
            if failures >= self.initial_connect_attempts {
                tracing::error!(
                    session = %self.session_id,
                    attempts = failures,
                    error = %error,
                    "Broker unreachable"
                );
                self.fail(ConnectError::Unreachable {
                    attempts: failures,
                    reason: error.to_string(),
                });
                return false;
            }
            let delay = self.reconnect.delay_for(failures);
            tracing::debug!(
                session = %self.session_id,
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Connect attempt failed, retrying"
            );
            return self.pause(delay).await;
        }

        if was_connected {
            tracing::warn!(session = %self.session_id, error = %error, "Connection lost");
            self.state.set(ConnectionState::Connecting);
        }

        if !self.reconnect.allows(failures) {
            let attempts = failures - 1;
            tracing::error!(session = %self.session_id, attempts, "Reconnect attempts exhausted");
            self.events
                .publish(ClientEvent::ReconnectExhausted { attempts });
            self.fail(ConnectError::Unreachable {
                attempts,
                reason: error.to_string(),
            });
            return false;
        }

        let delay = self.reconnect.delay_for(failures);
        tracing::info!(
            session = %self.session_id,
            attempt = failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting"
        );
        self.events.publish(ClientEvent::Reconnecting {
            attempt: failures,
            delay,
        });
        self.pause(delay).await
    }

    /// Sleeps for `delay`. Returns `false` if shut down meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn fail(&self, error: ConnectError) {
        *self.last_error.lock() = Some(error);
        self.state.set(ConnectionState::Disconnected);
    }

    /// Lets a live session finish its disconnect handshake.
    async fn drain(&mut self) {
        if !self.connected {
            return;
        }
        let stream = &mut self.stream;
        let drained = tokio::time::timeout(self.drain_timeout, async {
            loop {
                match stream.poll().await {
                    Ok(TransportEvent::Message { topic, .. }) => {
                        tracing::trace!(topic = %topic, "Discarding message received while closing");
                    }
                    Ok(TransportEvent::Connected | TransportEvent::SubscribeRefused { .. }) => {}
                    Ok(TransportEvent::Disconnected) | Err(_) => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!(session = %self.session_id, "Disconnect handshake timed out");
        }
        self.connected = false;
    }
}
