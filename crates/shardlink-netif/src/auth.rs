//! Hooks run on a connection before and around a command.
//!
//! The authentication protocol itself is not implemented here. An
//! [`Authenticator`] is handed a [`CommandRunner`] bound to the leased
//! connection and may run whatever conversation it needs over it.

use async_trait::async_trait;

use crate::document::Document;
use crate::error::NetworkError;
use crate::request::{HostAndPort, RemoteCommandRequest, RemoteCommandResponse};

/// Runs commands over one already-negotiated connection.
#[async_trait]
pub trait CommandRunner: Send {
    /// Sends `request` and waits for its reply.
    async fn run_command(
        &mut self,
        request: RemoteCommandRequest,
    ) -> Result<RemoteCommandResponse, NetworkError>;
}

/// Authenticates a freshly negotiated connection.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticates against `target`. Errors that are
    /// [`AuthError::MechanismUnavailable`](crate::error::AuthError) leave the
    /// connection reusable; every other error closes it.
    async fn authenticate(
        &self,
        target: &HostAndPort,
        runner: &mut dyn CommandRunner,
    ) -> Result<(), NetworkError>;
}

/// Rewrites request metadata and inspects reply metadata.
pub trait MetadataHook: Send + Sync + 'static {
    /// Returns the metadata to send with a command to `target`.
    fn write_request_metadata(
        &self,
        target: &HostAndPort,
        metadata: &Document,
    ) -> Result<Document, NetworkError>;

    /// Inspects the metadata of a reply from `target`. An error fails the
    /// command.
    fn read_reply_metadata(
        &self,
        target: &HostAndPort,
        metadata: &Document,
    ) -> Result<(), NetworkError>;
}
