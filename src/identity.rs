// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client identities and the broker session parameters derived from them.
//!
//! A [`ClientIdentity`] is fixed when the client is built. It determines the
//! MQTT client id, the credentials sent in CONNECT, and the default broker
//! host for the organization.
//!
//! # Examples
//!
//! ```
//! use iotf_client::ClientIdentity;
//!
//! let app = ClientIdentity::application("myorg", "dashboard", "a-myorg-key", "token");
//! assert_eq!(app.client_id(), "a:myorg:dashboard");
//! assert_eq!(app.credentials(), Some(("a-myorg-key", "token")));
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::error::ConfigError;

/// Organization id that accepts unauthenticated clients.
pub const QUICKSTART_ORG: &str = "quickstart";

/// Default messaging domain appended to the organization id.
pub const DEFAULT_DOMAIN: &str = "internetofthings.ibmcloud.com";

/// Username devices present when authenticating with a token.
const DEVICE_TOKEN_USERNAME: &str = "use-token-auth";

/// What kind of participant a client identity represents.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IdentityKind {
    /// A consuming application.
    Application,
    /// A device of the given type.
    Device {
        /// The device type the device is registered under.
        device_type: String,
    },
}

/// Immutable identity of a client.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ClientIdentity {
    #[serde(flatten)]
    kind: IdentityKind,
    organization_id: String,
    identity_id: String,
    #[serde(default)]
    auth_key: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
}

impl ClientIdentity {
    /// Creates an application identity authenticated with an API key.
    #[must_use]
    pub fn application(
        organization_id: impl Into<String>,
        app_id: impl Into<String>,
        api_key: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            kind: IdentityKind::Application,
            organization_id: organization_id.into(),
            identity_id: app_id.into(),
            auth_key: Some(api_key.into()),
            auth_token: Some(auth_token.into()),
        }
    }

    /// Creates an unauthenticated application identity in the quickstart organization.
    #[must_use]
    pub fn quickstart_application(app_id: impl Into<String>) -> Self {
        Self {
            kind: IdentityKind::Application,
            organization_id: QUICKSTART_ORG.to_string(),
            identity_id: app_id.into(),
            auth_key: None,
            auth_token: None,
        }
    }

    /// Creates a device identity authenticated with a device token.
    #[must_use]
    pub fn device(
        organization_id: impl Into<String>,
        device_type: impl Into<String>,
        device_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            kind: IdentityKind::Device {
                device_type: device_type.into(),
            },
            organization_id: organization_id.into(),
            identity_id: device_id.into(),
            auth_key: None,
            auth_token: Some(auth_token.into()),
        }
    }

    /// Builds an application identity from a flat option map.
    ///
    /// Recognized keys: `org`, `id`, `auth-key` (or `API-Key`) and
    /// `auth-token` (or `Authentication-Token`). The key pair is optional
    /// only for the quickstart organization.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required option is missing or empty.
    pub fn application_from_properties(
        props: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let org = required(props, &["org", "Organization-ID"], "org")?;
        let id = required(props, &["id", "App-ID"], "id")?;
        let auth_key = optional(props, &["auth-key", "API-Key"]);
        let auth_token = optional(props, &["auth-token", "Authentication-Token"]);

        if org != QUICKSTART_ORG {
            if auth_key.is_none() {
                return Err(ConfigError::MissingOption("auth-key"));
            }
            if auth_token.is_none() {
                return Err(ConfigError::MissingOption("auth-token"));
            }
        }

        Ok(Self {
            kind: IdentityKind::Application,
            organization_id: org,
            identity_id: id,
            auth_key,
            auth_token,
        })
    }

    /// Builds a device identity from a flat option map.
    ///
    /// Recognized keys: `org`, `type`, `id` and `auth-token`. An
    /// `auth-method` other than `token` is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required option is missing or invalid.
    pub fn device_from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let org = required(props, &["org", "Organization-ID"], "org")?;
        let device_type = required(props, &["type", "Device-Type"], "type")?;
        let id = required(props, &["id", "Device-ID"], "id")?;

        if let Some(method) = optional(props, &["auth-method", "Authentication-Method"])
            && method != "token"
        {
            return Err(ConfigError::InvalidValue {
                option: "auth-method",
                message: format!("devices only support token authentication, got {method}"),
            });
        }

        let auth_token = optional(props, &["auth-token", "Authentication-Token"]);
        if org != QUICKSTART_ORG && auth_token.is_none() {
            return Err(ConfigError::MissingOption("auth-token"));
        }

        Ok(Self {
            kind: IdentityKind::Device { device_type },
            organization_id: org,
            identity_id: id,
            auth_key: None,
            auth_token,
        })
    }

    /// Returns the identity kind.
    #[must_use]
    pub fn kind(&self) -> &IdentityKind {
        &self.kind
    }

    /// Returns the organization id.
    #[must_use]
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    /// Returns the application id or device id.
    #[must_use]
    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    /// Returns `true` for the unauthenticated quickstart organization.
    #[must_use]
    pub fn is_quickstart(&self) -> bool {
        self.organization_id == QUICKSTART_ORG
    }

    /// Returns the MQTT client id for this identity.
    ///
    /// Applications use `a:<org>:<appId>`, devices `d:<org>:<type>:<deviceId>`.
    #[must_use]
    pub fn client_id(&self) -> String {
        match &self.kind {
            IdentityKind::Application => {
                format!("a:{}:{}", self.organization_id, self.identity_id)
            }
            IdentityKind::Device { device_type } => format!(
                "d:{}:{}:{}",
                self.organization_id, device_type, self.identity_id
            ),
        }
    }

    /// Returns the `(username, password)` pair sent with CONNECT, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.is_quickstart() {
            return None;
        }
        let token = self.auth_token.as_deref()?;
        match self.kind {
            IdentityKind::Application => self.auth_key.as_deref().map(|key| (key, token)),
            IdentityKind::Device { .. } => Some((DEVICE_TOKEN_USERNAME, token)),
        }
    }

    /// Returns the broker host for this organization under `domain`.
    #[must_use]
    pub fn broker_host(&self, domain: &str) -> String {
        format!("{}.messaging.{domain}", self.organization_id)
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("kind", &self.kind)
            .field("organization_id", &self.organization_id)
            .field("identity_id", &self.identity_id)
            .field("auth_key", &self.auth_key)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn optional(props: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| props.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn required(
    props: &HashMap<String, String>,
    keys: &[&str],
    name: &'static str,
) -> Result<String, ConfigError> {
    optional(props, keys).ok_or(ConfigError::MissingOption(name))
}
