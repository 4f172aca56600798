// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::configuration::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where a crash report goes.
///
/// * `http://host[:port][/path]` is a plain HTTP/1.1 endpoint. TLS is not supported, the
///   crash handler writes on a raw socket.
/// * `unix:///abs/path` is an HTTP endpoint listening on a unix domain socket. On Linux,
///   `unix://name` (no leading slash) names a socket in the abstract namespace.
/// * `file:///abs/path` is only understood by the receiver process, which writes the decoded
///   report there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Http {
        host: String,
        port: u16,
        path_and_query: String,
    },
    Unix {
        path: String,
    },
    File {
        path: PathBuf,
    },
}

impl Endpoint {
    pub fn from_slice(url: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidUrl {
            url: url.to_owned(),
            reason: reason.to_owned(),
        };

        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(invalid("missing socket path"));
            }
            #[cfg(not(target_os = "linux"))]
            if !path.starts_with('/') {
                return Err(invalid("abstract unix sockets are only available on linux"));
            }
            return Ok(Endpoint::Unix {
                path: path.to_owned(),
            });
        }
        if let Some(path) = url.strip_prefix("file://") {
            if !path.starts_with('/') {
                return Err(invalid("file path must be absolute"));
            }
            return Ok(Endpoint::File { path: path.into() });
        }

        let uri = http::Uri::from_str(url).map_err(|e| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(ConfigurationError::UnsupportedScheme(other.to_owned())),
            None => return Err(invalid("missing scheme")),
        }
        let host = uri.host().ok_or_else(|| invalid("missing host"))?;
        // `[::1]` is kept bracketed by `http::Uri`; the resolver wants it bare.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let path_and_query = uri
            .path_and_query()
            .map(|p| p.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or("/");
        Ok(Endpoint::Http {
            host: host.to_owned(),
            port: uri.port_u16().unwrap_or(80),
            path_and_query: path_and_query.to_owned(),
        })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Endpoint::File { .. })
    }

    /// Value for the `Host:` header of a request sent to this endpoint.
    pub fn host_header(&self) -> String {
        match self {
            Endpoint::Http { host, port, .. } if host.contains(':') => format!("[{host}]:{port}"),
            Endpoint::Http { host, port, .. } => format!("{host}:{port}"),
            Endpoint::Unix { .. } | Endpoint::File { .. } => "localhost".to_owned(),
        }
    }

    pub fn request_path(&self) -> &str {
        match self {
            Endpoint::Http { path_and_query, .. } => path_and_query,
            Endpoint::Unix { .. } | Endpoint::File { .. } => "/",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Http {
                host,
                port,
                path_and_query,
            } => {
                if host.contains(':') {
                    write!(f, "http://[{host}]:{port}{path_and_query}")
                } else {
                    write!(f, "http://{host}:{port}{path_and_query}")
                }
            }
            Endpoint::Unix { path } => write!(f, "unix://{path}"),
            Endpoint::File { path } => write!(f, "file://{}", path.display()),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::from_slice(&value)
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}
