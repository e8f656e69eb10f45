// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound commands and events.
//!
//! Publishing is fire-when-connected: nothing is queued while the client is
//! not connected, and no acknowledgement is awaited beyond what the
//! transport's QoS provides.

use chrono::Utc;
use serde::Serialize;

use crate::error::PublishError;
use crate::message::{OutboundMessage, encode_payload};
use crate::topic::{MessageClass, MessageFormat, command_topic, event_topic};
use crate::transport::{Link, QoS};

/// One outbound command or event, before encoding.
#[derive(Debug)]
pub(crate) struct PublishRequest<'a, P: ?Sized> {
    pub class: MessageClass,
    pub device_type: &'a str,
    pub device_id: &'a str,
    pub name: &'a str,
    pub format: MessageFormat,
    pub data: &'a P,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Publisher {
    qos: QoS,
}

impl Publisher {
    pub(crate) fn new(qos: QoS) -> Self {
        Self { qos }
    }

    /// Encodes `request` and hands it to `link`.
    ///
    /// `link` is `None` when the client is not connected.
    pub(crate) async fn publish<L, P>(
        &self,
        link: Option<L>,
        request: PublishRequest<'_, P>,
    ) -> Result<(), PublishError>
    where
        L: Link,
        P: Serialize + ?Sized + Sync,
    {
        let link = link.ok_or(PublishError::NotConnected)?;
        let message = self.prepare(&request)?;
        let topic = message.topic.clone();

        link.publish(message)
            .await
            .map_err(PublishError::from_transport)?;

        tracing::debug!(topic = %topic, qos = ?self.qos, "Published");
        Ok(())
    }

    fn prepare<P>(&self, request: &PublishRequest<'_, P>) -> Result<OutboundMessage, PublishError>
    where
        P: Serialize + ?Sized,
    {
        let build_topic = match request.class {
            MessageClass::Command => command_topic,
            MessageClass::Event => event_topic,
        };
        let topic = build_topic(
            request.device_type,
            request.device_id,
            request.name,
            &request.format,
        )?;
        let payload = encode_payload(request.data, &request.format, Utc::now())?;

        Ok(OutboundMessage {
            topic,
            format: request.format.clone(),
            payload,
            qos: self.qos,
        })
    }
}
