use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use tracing::debug;

use crate::errors::BackendError;

/// Hands out loopback ports for the backend to bind
pub struct PortAllocator;

impl PortAllocator {
    /// Ask the OS for a free ephemeral port on 127.0.0.1.
    ///
    /// The listener is dropped before returning, so the port is only reserved
    /// until another process claims it. The backend is launched right after.
    pub fn allocate() -> Result<u16, BackendError> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .map_err(BackendError::PortAllocation)?;
        let port = listener
            .local_addr()
            .map_err(BackendError::PortAllocation)?
            .port();

        debug!(port, "allocated ephemeral backend port");
        Ok(port)
    }
}
