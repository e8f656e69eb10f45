// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic naming for device commands and events.
//!
//! Applications address devices through topics of the form:
//!
//! ```text
//! iot-2/type/<deviceType>/id/<deviceId>/cmd/<commandId>/fmt/<format>
//! iot-2/type/<deviceType>/id/<deviceId>/evt/<eventId>/fmt/<format>
//! ```
//!
//! [`TopicFilter`] describes a set of such topics, with `+` standing in for
//! any field left unset. [`ParsedTopic`] is the reverse mapping from a
//! concrete topic string back to its fields.

use std::fmt;

use crate::error::TopicError;

/// Leading segment shared by all platform topics.
const ROOT: &str = "iot-2";

/// Single-level MQTT wildcard.
const WILDCARD: &str = "+";

/// Whether a message is sent to a device or reported by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageClass {
    /// An instruction sent toward a device (`cmd`).
    Command,
    /// Data reported by a device (`evt`).
    Event,
}

impl MessageClass {
    /// Returns the topic segment for this class.
    #[must_use]
    pub fn segment(self) -> &'static str {
        match self {
            Self::Command => "cmd",
            Self::Event => "evt",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "cmd" => Some(Self::Command),
            "evt" => Some(Self::Event),
            _ => None,
        }
    }
}

/// Declared payload format, carried in the `fmt` topic segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum MessageFormat {
    /// JSON document (`json`).
    #[default]
    Json,
    /// UTF-8 text (`text`).
    Text,
    /// Opaque bytes (`bin`).
    Binary,
    /// Any other format name; the payload is passed through as bytes.
    Custom(String),
}

impl MessageFormat {
    /// Returns the `fmt` segment for this format.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Binary => "bin",
            Self::Custom(name) => name,
        }
    }

    /// Maps a `fmt` segment to a format. Unknown names become [`MessageFormat::Custom`].
    #[must_use]
    pub fn from_segment(segment: &str) -> Self {
        match segment {
            "json" => Self::Json,
            "text" => Self::Text,
            "bin" => Self::Binary,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of command or event topics the client wants to receive.
///
/// Unset fields match any value. Equality is structural, so two filters
/// built from the same fields are the same subscription.
///
/// # Examples
///
/// ```
/// use iotf_client::{MessageFormat, TopicFilter};
///
/// let filter = TopicFilter::device_commands("T", "D");
/// assert_eq!(filter.to_topic_string(), "iot-2/type/T/id/D/cmd/+/fmt/+");
///
/// let narrowed = filter.with_name("run").with_format(MessageFormat::Json);
/// assert_eq!(narrowed.to_topic_string(), "iot-2/type/T/id/D/cmd/run/fmt/json");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicFilter {
    class: MessageClass,
    device_type: Option<String>,
    device_id: Option<String>,
    name: Option<String>,
    format: Option<MessageFormat>,
}

impl TopicFilter {
    /// Creates a filter matching every message of `class`.
    #[must_use]
    pub fn all(class: MessageClass) -> Self {
        Self {
            class,
            device_type: None,
            device_id: None,
            name: None,
            format: None,
        }
    }

    /// Matches every command addressed to one device.
    #[must_use]
    pub fn device_commands(device_type: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::all(MessageClass::Command)
            .with_device_type(device_type)
            .with_device_id(device_id)
    }

    /// Matches every event reported by one device.
    #[must_use]
    pub fn device_events(device_type: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::all(MessageClass::Event)
            .with_device_type(device_type)
            .with_device_id(device_id)
    }

    /// Restricts the filter to one device type.
    #[must_use]
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    /// Restricts the filter to one device id.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Restricts the filter to one command or event name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restricts the filter to one payload format.
    #[must_use]
    pub fn with_format(mut self, format: MessageFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Returns the message class.
    #[must_use]
    pub fn class(&self) -> MessageClass {
        self.class
    }

    /// Returns the device type, or `None` for any.
    #[must_use]
    pub fn device_type(&self) -> Option<&str> {
        self.device_type.as_deref()
    }

    /// Returns the device id, or `None` for any.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Checks that every fixed field can appear in a topic.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError`] for the first offending field.
    pub fn validate(&self) -> Result<(), TopicError> {
        for (field, value) in [
            ("device type", self.device_type.as_deref()),
            ("device id", self.device_id.as_deref()),
            ("name", self.name.as_deref()),
            ("format", self.format.as_ref().map(MessageFormat::as_str)),
        ] {
            if let Some(value) = value {
                validate_segment(field, value)?;
            }
        }
        Ok(())
    }

    /// Renders the MQTT topic filter string.
    #[must_use]
    pub fn to_topic_string(&self) -> String {
        format!(
            "{ROOT}/type/{}/id/{}/{}/{}/fmt/{}",
            self.device_type.as_deref().unwrap_or(WILDCARD),
            self.device_id.as_deref().unwrap_or(WILDCARD),
            self.class.segment(),
            self.name.as_deref().unwrap_or(WILDCARD),
            self.format
                .as_ref()
                .map_or(WILDCARD, MessageFormat::as_str),
        )
    }

    /// Returns `true` if a parsed topic falls inside this filter.
    #[must_use]
    pub fn matches(&self, topic: &ParsedTopic<'_>) -> bool {
        fn field_matches(expected: Option<&str>, actual: &str) -> bool {
            expected.is_none_or(|e| e == actual)
        }

        self.class == topic.class
            && field_matches(self.device_type.as_deref(), topic.device_type)
            && field_matches(self.device_id.as_deref(), topic.device_id)
            && field_matches(self.name.as_deref(), topic.name)
            && self.format.as_ref().is_none_or(|f| *f == topic.format)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_topic_string())
    }
}

/// A concrete command or event topic split into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic<'a> {
    /// Command or event.
    pub class: MessageClass,
    /// The device type segment.
    pub device_type: &'a str,
    /// The device id segment.
    pub device_id: &'a str,
    /// The command or event name.
    pub name: &'a str,
    /// The declared payload format.
    pub format: MessageFormat,
}

impl<'a> ParsedTopic<'a> {
    /// Parses a topic of the form `iot-2/type/T/id/D/{cmd|evt}/N/fmt/F`.
    ///
    /// Returns `None` for any other layout, for empty segments and for
    /// segments containing wildcards.
    #[must_use]
    pub fn parse(topic: &'a str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        let [root, "type", device_type, "id", device_id, class, name, "fmt", format] = parts[..]
        else {
            return None;
        };
        if root != ROOT {
            return None;
        }
        let class = MessageClass::from_segment(class)?;
        for segment in [device_type, device_id, name, format] {
            if !is_valid_segment(segment) {
                return None;
            }
        }

        Some(Self {
            class,
            device_type,
            device_id,
            name,
            format: MessageFormat::from_segment(format),
        })
    }
}

/// Builds the topic a command to a device is published on.
///
/// # Errors
///
/// Returns [`TopicError`] if any segment is empty or contains `/`, `+` or `#`.
pub fn command_topic(
    device_type: &str,
    device_id: &str,
    command: &str,
    format: &MessageFormat,
) -> Result<String, TopicError> {
    device_topic(MessageClass::Command, device_type, device_id, command, format)
}

/// Builds the topic a device event is published on.
///
/// # Errors
///
/// Returns [`TopicError`] if any segment is empty or contains `/`, `+` or `#`.
pub fn event_topic(
    device_type: &str,
    device_id: &str,
    event: &str,
    format: &MessageFormat,
) -> Result<String, TopicError> {
    device_topic(MessageClass::Event, device_type, device_id, event, format)
}

fn device_topic(
    class: MessageClass,
    device_type: &str,
    device_id: &str,
    name: &str,
    format: &MessageFormat,
) -> Result<String, TopicError> {
    validate_segment("device type", device_type)?;
    validate_segment("device id", device_id)?;
    validate_segment("name", name)?;
    validate_segment("format", format.as_str())?;
    Ok(format!(
        "{ROOT}/type/{device_type}/id/{device_id}/{}/{name}/fmt/{format}",
        class.segment()
    ))
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(['/', '+', '#'])
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), TopicError> {
    if is_valid_segment(value) {
        Ok(())
    } else {
        Err(TopicError {
            field,
            value: value.to_string(),
        })
    }
}

/// Returns `true` if an MQTT topic filter (with `+` and `#` wildcards) matches `topic`.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    // Wildcards never match topics reserved by the broker.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
