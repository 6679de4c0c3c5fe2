//! Remote command requests, responses and the identifiers that tie them to
//! callers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::NetworkError;

/// Port used when an endpoint string carries none.
pub const DEFAULT_PORT: u16 = 27017;

/// A remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    /// Creates an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostAndPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty host".to_string());
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 literal in {:?}", s))?;
            let port = match after.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| format!("bad port in {:?}", s))?,
                None if after.is_empty() => DEFAULT_PORT,
                None => return Err(format!("unexpected trailing text in {:?}", s)),
            };
            return Ok(Self::new(host, port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port.parse().map_err(|_| format!("bad port in {:?}", s))?;
                Ok(Self::new(host, port))
            }
            _ => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

/// Caller-assigned identifier of an in-flight command, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    /// Wraps a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A command to run against a database on a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommandRequest {
    /// Node to run on.
    pub target: HostAndPort,
    /// Database the command addresses.
    pub dbname: String,
    /// Command document; its first key names the command.
    pub cmd: Document,
    /// Request metadata.
    pub metadata: Document,
    /// Per-command timeout; `None` falls back to the interface default.
    pub timeout: Option<Duration>,
}

impl RemoteCommandRequest {
    /// Creates a request with empty metadata and no timeout.
    pub fn new(target: HostAndPort, dbname: impl Into<String>, cmd: Document) -> Self {
        Self {
            target,
            dbname: dbname.into(),
            cmd,
            metadata: Document::empty(),
            timeout: None,
        }
    }

    /// Sets the request metadata.
    pub fn with_metadata(mut self, metadata: Document) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Name of the command, if the document is not empty.
    pub fn command_name(&self) -> Option<&str> {
        self.cmd.first_key()
    }
}

impl fmt::Display for RemoteCommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} at {}",
            self.command_name().unwrap_or("<empty>"),
            self.dbname,
            self.target
        )
    }
}

/// Successful reply to a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommandResponse {
    /// Command result document.
    pub data: Document,
    /// Reply metadata.
    pub metadata: Document,
    /// Time from the start of the operation to its completion.
    pub elapsed: Duration,
}

/// What a completion callback receives.
pub type ResponseStatus = Result<RemoteCommandResponse, NetworkError>;

/// Completion callback, invoked exactly once per command.
pub type CompletionFn = Box<dyn FnOnce(ResponseStatus) + Send + 'static>;
