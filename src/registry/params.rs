use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde::Serialize;

use crate::Metadata;
use crate::RegistrationError;
use crate::Result;

/// Input of [`ServiceRegistry::register`](crate::ServiceRegistry::register).
///
/// Everything but the credentials is mandatory. Credentials are either
/// `user` + `password`, or `auth_key` = base64("user,password"); the
/// key wins when both are given.
///
/// ```toml
/// [registration]
/// server_type = "app"
/// namespace_prefix = "/prod"
/// store_endpoints = "http://etcd-0:2379,http://etcd-1:2379"
/// auth_key = "dXNlcixwYXNz"
///
/// [registration.metadata]
/// httpHost = "10.0.0.1"
/// httpPort = "8080"
/// ```
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RegisterParams {
    #[serde(default, alias = "serverType", alias = "servertype")]
    pub server_type: String,

    /// Namespace every store key lives under
    #[serde(default, alias = "namespacePrefix", alias = "namespaceprefix")]
    pub namespace_prefix: String,

    /// Comma-separated store endpoints
    #[serde(default, alias = "storeEndpoints", alias = "storeendpoints")]
    pub store_endpoints: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(
        default,
        alias = "authKey",
        alias = "authkey",
        skip_serializing_if = "Option::is_none"
    )]
    pub auth_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl std::fmt::Debug for RegisterParams {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RegisterParams")
            .field("server_type", &self.server_type)
            .field("namespace_prefix", &self.namespace_prefix)
            .field("store_endpoints", &self.store_endpoints)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("auth_key", &self.auth_key.as_ref().map(|_| "***"))
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl RegisterParams {
    pub fn new(
        server_type: impl Into<String>,
        namespace_prefix: impl Into<String>,
        store_endpoints: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            server_type: server_type.into(),
            namespace_prefix: namespace_prefix.into(),
            store_endpoints: store_endpoints.into(),
            metadata: Some(metadata),
            ..Default::default()
        }
    }

    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_auth_key(
        mut self,
        auth_key: impl Into<String>,
    ) -> Self {
        self.auth_key = Some(auth_key.into());
        self
    }

    /// # Errors
    /// [`RegistrationError::MissingParam`] naming the first empty
    /// mandatory field.
    pub fn validate(&self) -> Result<()> {
        if self.server_type.trim().is_empty() {
            return Err(RegistrationError::MissingParam("server_type").into());
        }
        if self.namespace_prefix.trim().is_empty() {
            return Err(RegistrationError::MissingParam("namespace_prefix").into());
        }
        if self.endpoints().is_empty() {
            return Err(RegistrationError::MissingParam("store_endpoints").into());
        }
        if self.metadata.is_none() {
            return Err(RegistrationError::MissingParam("metadata").into());
        }
        Ok(())
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.store_endpoints
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect()
    }

    /// Resolves `(user, password)`, decoding `auth_key` when present.
    ///
    /// # Errors
    /// [`RegistrationError::InvalidAuthKey`] when the key is not base64
    /// or does not decode to exactly two comma-separated parts.
    pub fn credentials(&self) -> Result<Option<(String, String)>> {
        if let Some(auth_key) = self.auth_key.as_deref().filter(|k| !k.is_empty()) {
            return decode_auth_key(auth_key).map(Some);
        }
        match self.user.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => Ok(Some((user.to_string(), self.password.clone().unwrap_or_default()))),
            None => Ok(None),
        }
    }
}

fn decode_auth_key(auth_key: &str) -> Result<(String, String)> {
    let decoded = STANDARD
        .decode(auth_key)
        .map_err(|e| RegistrationError::InvalidAuthKey(format!("base64 decode failed: {e}")))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| RegistrationError::InvalidAuthKey("not utf-8".into()))?;

    let parts: Vec<&str> = text.split(',').collect();
    match parts.as_slice() {
        [user, password] => Ok((user.to_string(), password.to_string())),
        _ => Err(RegistrationError::InvalidAuthKey(
            "expected base64(user,password)".into(),
        )
        .into()),
    }
}
