//! Socket option plumbing on top of `socket2`.

use std::net::SocketAddr;

use anyhow::Context;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};

use crate::config::TransportConfig;
use crate::Result;

const LISTEN_BACKLOG: i32 = 1024;

fn new_socket(addr: SocketAddr) -> Result<Socket> {
    Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .with_context(|| format!("Failed to create socket for {}", addr))
}

/// Bound, listening, non-blocking listener ready for `TcpListener::from_std`
pub(crate) fn bind_listener(addr: SocketAddr, config: &TransportConfig) -> Result<std::net::TcpListener> {
    let socket = new_socket(addr)?;
    socket
        .set_reuse_address(config.reuse_address)
        .context("Failed to set SO_REUSEADDR")?;
    socket
        .set_nonblocking(true)
        .context("Failed to make listener non-blocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("Failed to listen on {}", addr))?;
    Ok(socket.into())
}

/// Options for a child accepted by the listener
pub(crate) fn configure_accepted(stream: &TcpStream, config: &TransportConfig) -> Result<()> {
    let socket = SockRef::from(stream);
    socket
        .set_keepalive(config.keep_alive)
        .context("Failed to set SO_KEEPALIVE")?;
    socket
        .set_nodelay(config.tcp_no_delay)
        .context("Failed to set TCP_NODELAY")?;
    socket
        .set_linger(config.linger)
        .context("Failed to set SO_LINGER")?;
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .context("Failed to set SO_SNDBUF")?;
    Ok(())
}

/// Unconnected client socket with every connector option applied.
///
/// Must be called from inside a tokio runtime.
pub(crate) fn connect_socket(addr: SocketAddr, config: &TransportConfig) -> Result<TcpSocket> {
    let socket = new_socket(addr)?;
    socket
        .set_keepalive(config.keep_alive)
        .context("Failed to set SO_KEEPALIVE")?;
    socket
        .set_reuse_address(config.reuse_address)
        .context("Failed to set SO_REUSEADDR")?;
    socket
        .set_nodelay(config.tcp_no_delay)
        .context("Failed to set TCP_NODELAY")?;
    socket
        .set_linger(config.linger)
        .context("Failed to set SO_LINGER")?;
    socket
        .set_recv_buffer_size(config.receive_buffer_size)
        .context("Failed to set SO_RCVBUF")?;
    socket
        .set_nonblocking(true)
        .context("Failed to make socket non-blocking")?;
    Ok(TcpSocket::from_std_stream(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accepted_socket_gets_options() {
        let mut config = TransportConfig::default();
        config.tcp_no_delay = true;
        config.keep_alive = true;
        config.linger = None;

        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        configure_accepted(&server, &config).unwrap();

        let socket = SockRef::from(&server);
        assert!(socket.nodelay().unwrap());
        assert!(socket.keepalive().unwrap());
        assert_eq!(socket.linger().unwrap(), None);
        drop(client);
    }

    #[tokio::test]
    async fn test_connect_socket_applies_options() {
        let mut config = TransportConfig::default();
        config.tcp_no_delay = true;

        let socket = connect_socket("127.0.0.1:9".parse().unwrap(), &config).unwrap();
        assert!(socket.nodelay().unwrap());
        assert!(socket.keepalive().unwrap());
    }
}
