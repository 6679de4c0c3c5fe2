#![warn(missing_docs)]

//! Shardlink network interface: asynchronous remote commands over the
//! length-prefixed wire protocol, with pooled connections, cooperative
//! cancellation and per-command timeouts.

pub mod auth;
pub mod cancel;
pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod interface;
pub mod metrics;
pub mod operation;
pub mod pool;
pub mod registry;
pub mod request;
pub mod state;
pub mod wire;

pub use auth::{Authenticator, CommandRunner, MetadataHook};
pub use config::NetworkInterfaceConfig;
pub use document::{Document, DocumentBuilder};
pub use error::{AuthError, ConfigError, ConnectError, FrameError, NetworkError, Result};
pub use interface::{InterfaceState, NetworkInterface};
pub use metrics::MetricsSnapshot;
pub use pool::{AsyncStream, ConnectionPool, Lease, PoolConfig, TcpConnectionPool};
pub use request::{
    CallbackHandle, HostAndPort, RemoteCommandRequest, RemoteCommandResponse, ResponseStatus,
};
pub use wire::{Protocol, ProtocolSet, WireCodec};
