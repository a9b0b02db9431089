use std::io;
use std::io::ErrorKind;
use std::net::UdpSocket;
#[cfg(test)] use mockall::automock;
use tracing::info;
use crate::messaging::net_address::NetAddress;

/// An abstraction for a non-blocking datagram socket, introduced to facilitate replacing the
///  network for testing.
///
/// Both operations return immediately. 'Nothing to receive' and 'send buffer full' are reported
///  as [ErrorKind::WouldBlock].
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(&self, to: NetAddress, buf: &[u8]) -> io::Result<usize>;

    fn receive_from(&self, buf: &mut [u8]) -> io::Result<(NetAddress, usize)>;

    fn local_address(&self) -> NetAddress;
}

/// A bound IPv4 UDP socket in non-blocking mode. It is detached from the tokio runtime after
///  binding, so sends and receives need no I/O driver running between ticks.
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    local_address: NetAddress,
}

impl UdpDatagramSocket {
    /// Binds to all interfaces on the given port, 0 for an ephemeral port
    pub async fn bind(port: u16) -> anyhow::Result<UdpDatagramSocket> {
        let socket = tokio::net::UdpSocket::bind(("0.0.0.0", port)).await?
            .into_std()?;
        socket.set_nonblocking(true)?;
        let local_address = NetAddress::try_from(socket.local_addr()?)?;
        info!("bound UDP socket to {}", local_address);

        Ok(UdpDatagramSocket {
            socket,
            local_address,
        })
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&self, to: NetAddress, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, to.to_socket_addr())
    }

    fn receive_from(&self, buf: &mut [u8]) -> io::Result<(NetAddress, usize)> {
        let (len, from) = self.socket.recv_from(buf)?;
        let from = NetAddress::try_from(from)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        Ok((from, len))
    }

    fn local_address(&self) -> NetAddress {
        self.local_address
    }
}
