use std::net::{Ipv4Addr, TcpListener};

use tracing::debug;

use crate::error::{ControllerError, Result};

/// Asks the OS for a free loopback port.
///
/// The listener is dropped before returning, so the port is only free at the
/// time of the call; the backend binds it shortly after.
pub fn allocate_port() -> Result<u16> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(ControllerError::Allocation)?;
    let port = listener
        .local_addr()
        .map_err(ControllerError::Allocation)?
        .port();
    drop(listener);
    debug!(port, "ports: allocated loopback port");
    Ok(port)
}
