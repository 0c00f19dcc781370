//! Listen address derivation and fail-fast binding.
//!
//! The RPC surface always sits at the HTTP port plus [`GRPC_PORT_OFFSET`].
//! Tooling relies on this to find a master's RPC port from its HTTP port.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket};

use crate::error::{MasterError, Result};
use crate::peers::NodeAddress;

pub const GRPC_PORT_OFFSET: u16 = 10000;

/// Listen backlog for both surfaces.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// The two addresses a master binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddrs {
    pub http: String,
    pub grpc: String,
}

impl ListenAddrs {
    pub fn derive(bind_host: &str, port: u16) -> Result<Self> {
        let grpc_port = grpc_port(port)?;
        Ok(Self {
            http: join_host_port(bind_host, port),
            grpc: join_host_port(bind_host, grpc_port),
        })
    }
}

pub fn grpc_port(http_port: u16) -> Result<u16> {
    http_port
        .checked_add(GRPC_PORT_OFFSET)
        .ok_or(MasterError::InvalidPort {
            port: http_port,
            offset: GRPC_PORT_OFFSET,
        })
}

/// RPC address of a master known by its HTTP address.
pub fn grpc_address(addr: &NodeAddress) -> Result<String> {
    let (host, port) = addr.host_port()?;
    Ok(format!("{}:{}", host, grpc_port(port)?))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Reserve `addr` and start listening. Any failure is returned, never retried.
pub async fn bind(addr: &str, backlog: u32) -> Result<TcpListener> {
    let bind_err = |source: std::io::Error| MasterError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket_addr: SocketAddr = tokio::net::lookup_host(addr)
        .await
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "host resolved to no addresses",
            ))
        })?;

    let socket = if socket_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;

    socket.bind(socket_addr).map_err(bind_err)?;
    let listener = socket.listen(backlog).map_err(bind_err)?;

    tracing::debug!(addr = %addr, local = ?listener.local_addr().ok(), "Bound listener");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_applies_fixed_offset() {
        let addrs = ListenAddrs::derive("0.0.0.0", 9333).unwrap();
        assert_eq!(addrs.http, "0.0.0.0:9333");
        assert_eq!(addrs.grpc, "0.0.0.0:19333");
    }

    #[test]
    fn derive_brackets_ipv6_hosts() {
        let addrs = ListenAddrs::derive("::1", 8080).unwrap();
        assert_eq!(addrs.http, "[::1]:8080");
        assert_eq!(addrs.grpc, "[::1]:18080");
    }

    #[test]
    fn offset_overflow_is_rejected() {
        assert_eq!(grpc_port(55535).unwrap(), 65535);
        assert!(matches!(
            grpc_port(55536),
            Err(MasterError::InvalidPort { port: 55536, .. })
        ));
    }

    #[test]
    fn grpc_address_of_peer() {
        let peer = NodeAddress::from("10.0.0.2:9333");
        assert_eq!(grpc_address(&peer).unwrap(), "10.0.0.2:19333");
        assert!(grpc_address(&NodeAddress::from("10.0.0.2")).is_err());
    }

    #[tokio::test]
    async fn bind_fails_fast_when_port_taken() {
        let first = bind("127.0.0.1:0", DEFAULT_BACKLOG).await.unwrap();
        let taken = first.local_addr().unwrap().to_string();

        let err = bind(&taken, DEFAULT_BACKLOG).await.unwrap_err();
        match err {
            MasterError::Bind { addr, source } => {
                assert_eq!(addr, taken);
                assert_eq!(source.kind(), std::io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
