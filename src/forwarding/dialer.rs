//! Seam between tunnels and the hosts that carry their traffic

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Address;
use crate::ssh::SshError;

/// A bidirectional byte stream to a forward destination
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

pub type BoxedStream = Box<dyn RelayStream>;

/// Something that can open streams to destinations on behalf of a tunnel
#[async_trait]
pub trait HostDialer: Send + Sync {
    /// Host name, for logging
    fn name(&self) -> &str;

    /// Make sure the shared session exists; reuses a live one
    async fn open(&self) -> Result<(), SshError>;

    /// Open a new logical stream to `destination` over the shared session
    async fn dial(&self, destination: &Address) -> Result<BoxedStream, SshError>;
}
