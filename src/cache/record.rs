use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

use crate::DecodeError;

/// Endpoint addresses a server exposes, per protocol.
///
/// Wire keys are camelCase (`httpHost`); snake_case and lowercase
/// aliases let the same struct be filled from config files and
/// environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(
        rename = "httpHost",
        alias = "http_host",
        alias = "httphost",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub http_host: Option<String>,
    #[serde(
        rename = "httpPort",
        alias = "http_port",
        alias = "httpport",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub http_port: Option<String>,
    #[serde(
        rename = "tcpHost",
        alias = "tcp_host",
        alias = "tcphost",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tcp_host: Option<String>,
    #[serde(
        rename = "tcpPort",
        alias = "tcp_port",
        alias = "tcpport",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tcp_port: Option<String>,
    #[serde(
        rename = "grpcHost",
        alias = "grpc_host",
        alias = "grpchost",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub grpc_host: Option<String>,
    #[serde(
        rename = "grpcPort",
        alias = "grpc_port",
        alias = "grpcport",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub grpc_port: Option<String>,
}

impl Metadata {
    pub fn http(
        host: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            http_host: Some(host.into()),
            http_port: Some(port.into()),
            ..Default::default()
        }
    }

    /// `(host, port)` when a non-empty http host is published
    pub fn http_endpoint(&self) -> Option<(String, String)> {
        match &self.http_host {
            Some(host) if !host.is_empty() => {
                Some((host.clone(), self.http_port.clone().unwrap_or_default()))
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Metadata::default()
    }
}

/// A registered process, stored as JSON under `/servers/{type}/{id}`.
///
/// Created once at process start and never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,

    #[serde(rename = "type")]
    pub server_type: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(rename = "cpuNum", default, skip_serializing_if = "is_zero")]
    pub cpu_count: usize,

    /// RFC3339 creation time
    #[serde(rename = "createAt", default)]
    pub created_at: String,
}

impl ServerRecord {
    /// Logical store key of this record
    pub fn key(&self) -> String {
        server_key(&self.server_type, &self.id)
    }

    pub fn decode(
        key: &str,
        value: &[u8],
    ) -> std::result::Result<Self, DecodeError> {
        serde_json::from_slice(value).map_err(|source| DecodeError::Json {
            key: key.to_string(),
            source,
        })
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

pub(crate) fn server_key(
    server_type: &str,
    id: &str,
) -> String {
    format!("{}/{}/{}", crate::constants::SERVERS_PREFIX, server_type, id)
}

/// Splits a store key into its last two `/`-separated segments.
///
/// `/servers/app/app-01` -> `("app", "app-01")`,
/// `/certs/public/app/sign` -> `("app", "sign")`.
pub fn split_key_path(key: &str) -> std::result::Result<(&str, &str), DecodeError> {
    let mut segments = key.rsplit('/');
    match (segments.next(), segments.next()) {
        (Some(last), Some(parent)) => Ok((parent, last)),
        _ => Err(DecodeError::InvalidPath(key.to_string())),
    }
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
