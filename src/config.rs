// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client configuration.
//!
//! A [`ClientBuilder`] is obtained from [`Client::builder`](crate::Client::builder).
//! Every option has a default derived from the identity, so the shortest
//! setup is:
//!
//! ```no_run
//! use iotf_client::{Client, ClientIdentity};
//!
//! # async fn example() -> iotf_client::Result<()> {
//! let identity = ClientIdentity::application("myorg", "dashboard", "a-myorg-key", "token");
//! let client = Client::builder(identity).build_mqtt()?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use crate::client::Client;
use crate::error::ConfigError;
use crate::identity::{ClientIdentity, DEFAULT_DOMAIN};
use crate::transport::{QoS, SessionOptions, Transport};

/// Default port for TLS connections.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Default port for plain TCP connections (quickstart).
pub const DEFAULT_PLAIN_PORT: u16 = 1883;

/// How the client retries after a lost session.
///
/// Delays grow geometrically from `initial_delay` by `multiplier` per
/// attempt and are capped at `max_delay`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use iotf_client::ReconnectPolicy;
///
/// let policy = ReconnectPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60))
///     .with_max_retries(5);
/// assert_eq!(policy.delay_for(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(4));
/// assert!(policy.allows(5));
/// assert!(!policy.allows(6));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    max_retries: Option<u32>,
}

impl ReconnectPolicy {
    /// Doubling backoff between `initial_delay` and `max_delay`, retrying forever.
    #[must_use]
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2,
            max_retries: None,
        }
    }

    /// Constant delay between attempts, retrying forever.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1,
            max_retries: None,
        }
    }

    /// Never reconnects after a lost session.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: Some(0),
            ..Self::default()
        }
    }

    /// Limits the number of attempts per outage.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the growth factor between attempts.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Returns the delay before the first attempt.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Returns the delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Returns the attempt limit, `None` meaning unlimited.
    #[must_use]
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Returns the delay before attempt number `attempt` (starting at 1).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Returns `true` if attempt number `attempt` may be made.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt <= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Tunables of a client. Built through [`ClientBuilder`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) host: Option<String>,
    pub(crate) domain: String,
    pub(crate) port: u16,
    pub(crate) use_tls: bool,
    pub(crate) keep_alive: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) disconnect_timeout: Duration,
    pub(crate) initial_connect_attempts: u32,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) qos: QoS,
    pub(crate) dispatch_capacity: usize,
    pub(crate) dispatch_timeout: Duration,
    pub(crate) resubscribe_on_reconnect: bool,
    pub(crate) request_capacity: usize,
}

impl ClientConfig {
    /// Returns the defaults for `identity`.
    ///
    /// The quickstart organization gets plain TCP on port 1883, everything
    /// else TLS on port 8883.
    #[must_use]
    pub fn for_identity(identity: &ClientIdentity) -> Self {
        let quickstart = identity.is_quickstart();
        Self {
            host: None,
            domain: DEFAULT_DOMAIN.to_string(),
            port: if quickstart {
                DEFAULT_PLAIN_PORT
            } else {
                DEFAULT_TLS_PORT
            },
            use_tls: !quickstart,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            initial_connect_attempts: 3,
            reconnect: ReconnectPolicy::default(),
            qos: QoS::AtLeastOnce,
            dispatch_capacity: 64,
            dispatch_timeout: Duration::from_secs(5),
            resubscribe_on_reconnect: true,
            request_capacity: 64,
        }
    }

    /// Returns the broker host for `identity`.
    #[must_use]
    pub fn host(&self, identity: &ClientIdentity) -> String {
        self.host
            .clone()
            .unwrap_or_else(|| identity.broker_host(&self.domain))
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the reconnect policy.
    #[must_use]
    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    /// Returns the QoS used for subscriptions and publishes.
    #[must_use]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Builds the transport session parameters for `identity`.
    ///
    /// With `resubscribe_on_reconnect` off the broker is asked to keep the
    /// session, so subscriptions survive a reconnect without being replayed.
    #[must_use]
    pub fn session_options(&self, identity: &ClientIdentity) -> SessionOptions {
        SessionOptions {
            client_id: identity.client_id(),
            host: self.host(identity),
            port: self.port,
            credentials: identity
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            use_tls: self.use_tls,
            keep_alive: self.keep_alive,
            clean_session: self.resubscribe_on_reconnect,
            request_capacity: self.request_capacity,
        }
    }

    fn validate(&self, identity: &ClientIdentity) -> Result<(), ConfigError> {
        if identity.organization_id().is_empty() {
            return Err(ConfigError::MissingOption("org"));
        }
        if identity.identity_id().is_empty() {
            return Err(ConfigError::MissingOption("id"));
        }
        if self.host(identity).is_empty() {
            return Err(ConfigError::MissingOption("host"));
        }
        if self.initial_connect_attempts == 0 {
            return Err(invalid("initial_connect_attempts", "must be at least 1"));
        }
        if self.dispatch_capacity == 0 {
            return Err(invalid("dispatch_capacity", "must be at least 1"));
        }
        if self.request_capacity == 0 {
            return Err(invalid("request_capacity", "must be at least 1"));
        }
        if !self.keep_alive.is_zero() && self.keep_alive < Duration::from_secs(1) {
            return Err(invalid("keep_alive", "must be zero or at least one second"));
        }
        if self.reconnect.multiplier == 0 {
            return Err(invalid("reconnect.multiplier", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(option: &'static str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        option,
        message: message.to_string(),
    }
}

/// Builder for a [`Client`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use iotf_client::transport::memory::MemoryBroker;
/// use iotf_client::{Client, ClientIdentity, ReconnectPolicy};
///
/// let broker = MemoryBroker::new();
/// let client = Client::builder(ClientIdentity::quickstart_application("demo"))
///     .connect_timeout(Duration::from_secs(2))
///     .reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(100)))
///     .dispatch_capacity(16)
///     .build(broker.transport())
///     .unwrap();
/// assert_eq!(client.client_id(), "a:quickstart:demo");
/// ```
#[derive(Debug)]
pub struct ClientBuilder {
    identity: ClientIdentity,
    config: ClientConfig,
}

impl ClientBuilder {
    pub(crate) fn new(identity: ClientIdentity) -> Self {
        let config = ClientConfig::for_identity(&identity);
        Self { identity, config }
    }

    /// Overrides the broker host (default: `<org>.messaging.<domain>`).
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    /// Sets the messaging domain (default: `internetofthings.ibmcloud.com`).
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = domain.into();
        self
    }

    /// Sets the broker port (default: 8883, or 1883 for quickstart).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Enables or disables TLS (default: on, off for quickstart).
    #[must_use]
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.config.use_tls = use_tls;
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets how long `connect()` waits for an outcome (default: 10 seconds).
    #[must_use]
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Sets how long `disconnect()` waits for the session to wind down (default: 5 seconds).
    #[must_use]
    pub fn disconnect_timeout(mut self, duration: Duration) -> Self {
        self.config.disconnect_timeout = duration;
        self
    }

    /// Sets how many attempts the first connect makes (default: 3).
    #[must_use]
    pub fn initial_connect_attempts(mut self, attempts: u32) -> Self {
        self.config.initial_connect_attempts = attempts;
        self
    }

    /// Sets the policy for reconnecting after a lost session.
    #[must_use]
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Sets the QoS for subscriptions and publishes (default: at least once).
    #[must_use]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.config.qos = qos;
        self
    }

    /// Sets the dispatch queue capacity (default: 64).
    #[must_use]
    pub fn dispatch_capacity(mut self, capacity: usize) -> Self {
        self.config.dispatch_capacity = capacity;
        self
    }

    /// Sets how long an inbound message may wait for queue space before it
    /// is dropped (default: 5 seconds).
    #[must_use]
    pub fn dispatch_timeout(mut self, duration: Duration) -> Self {
        self.config.dispatch_timeout = duration;
        self
    }

    /// Replays recorded subscriptions after every reconnect (default: on).
    ///
    /// Turning this off requests a persistent broker session instead.
    #[must_use]
    pub fn resubscribe_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.resubscribe_on_reconnect = enabled;
        self
    }

    /// Sets the transport's outgoing request queue capacity (default: 64).
    #[must_use]
    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.config.request_capacity = capacity;
        self
    }

    /// Returns the configuration built so far.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Builds a client on `transport`. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an option is missing or out of range.
    pub fn build<T: Transport>(self, transport: T) -> Result<Client<T>, ConfigError> {
        self.config.validate(&self.identity)?;
        Ok(Client::from_parts(self.identity, self.config, transport))
    }

    /// Builds a client on the MQTT transport. Does not connect.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an option is missing or out of range.
    #[cfg(feature = "mqtt")]
    pub fn build_mqtt(self) -> Result<crate::ApplicationClient, ConfigError> {
        self.build(crate::transport::mqtt::MqttTransport::new())
    }
}
