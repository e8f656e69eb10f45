// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `iotf_client` library.
//!
//! Every caller-facing operation returns its own error enum so callers can
//! match on exactly the failures that operation can produce:
//!
//! - [`ConnectError`] for [`Client::connect`](crate::Client::connect)
//! - [`PublishError`] for the publish family
//! - [`SubscribeError`] for subscribe and unsubscribe
//! - [`DeliveryError`] for inbound messages that could not reach the callback
//!
//! [`Error`] wraps all of them for code that just wants to use `?`.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Establishing the session failed.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Publishing a message failed.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Subscribing or unsubscribing failed.
    #[error("subscribe error: {0}")]
    Subscribe(#[from] SubscribeError),

    /// The client configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The transport reported a failure outside of the operations above.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors returned by [`Client::connect`](crate::Client::connect).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The broker rejected the identity's credentials. Never retried.
    #[error("authentication rejected by broker")]
    AuthFailed,

    /// The broker could not be reached within the allowed attempts.
    #[error("broker unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        /// Number of connection attempts made.
        attempts: u32,
        /// Last transport-level failure.
        reason: String,
    },

    /// No outcome was reached before the connect timeout elapsed.
    #[error("connect timed out after {0} ms")]
    Timeout(u64),

    /// The pending connect was cancelled by a concurrent disconnect.
    #[error("connect cancelled")]
    Cancelled,
}

/// Errors returned by the publish operations.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The client is not in the `Connected` state. Nothing was queued.
    #[error("client is not connected")]
    NotConnected,

    /// The payload cannot be encoded in the requested format.
    #[error("payload serialization failed: {0}")]
    SerializationFailed(String),

    /// The transport refused the message.
    #[error("transport rejected publish: {0}")]
    TransportRejected(#[source] TransportError),

    /// A topic segment cannot be used to build a topic.
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
}

/// Errors returned by subscribe and unsubscribe.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The session went away between the state check and the wire call.
    #[error("client is not connected")]
    NotConnected,

    /// The transport refused the subscription request.
    #[error("transport rejected subscription: {0}")]
    TransportRejected(#[source] TransportError),

    /// A filter field cannot be used to build a topic filter.
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] TopicError),
}

impl SubscribeError {
    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::NotConnected,
            other => Self::TransportRejected(other),
        }
    }
}

impl PublishError {
    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::NotConnected,
            other => Self::TransportRejected(other),
        }
    }
}

/// A device type, device id or message name that cannot appear in a topic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{field} {value:?} must be non-empty and free of '/', '+' and '#'")]
pub struct TopicError {
    /// Which topic segment was rejected.
    pub field: &'static str,
    /// The rejected value.
    pub value: String,
}

/// Failures on the inbound delivery path.
///
/// These never reach the caller of an operation. They are reported through
/// [`Client::events`](crate::Client::events) and the offending message is
/// dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The topic or payload of an inbound message could not be decoded.
    #[error("failed to decode message on {topic}: {reason}")]
    DecodeFailed {
        /// Raw topic of the message.
        topic: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The registered callback returned an error or panicked.
    #[error("callback failed for message on {topic}: {reason}")]
    CallbackFailed {
        /// Raw topic of the message.
        topic: String,
        /// Error text or panic message.
        reason: String,
    },

    /// The dispatch queue stayed full for the whole dispatch timeout.
    #[error("dispatch queue full, dropped message on {topic}")]
    QueueFull {
        /// Raw topic of the dropped message.
        topic: String,
    },
}

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker refused the credentials.
    #[error("authentication rejected")]
    AuthRejected,

    /// The broker could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// An established session was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The broker or client library refused a request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The session handle is no longer usable.
    #[error("session closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` if retrying with the same credentials cannot succeed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected)
    }
}

/// Errors related to client configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required option is missing.
    #[error("missing required option: {0}")]
    MissingOption(&'static str),

    /// An option has an unusable value.
    #[error("invalid value for {option}: {message}")]
    InvalidValue {
        /// The option name.
        option: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
