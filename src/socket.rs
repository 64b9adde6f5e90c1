//! Datagram endpoint.
//!
//! Wraps a bound UDP socket and, when the `SIMULATOR` environment variable
//! is set to `host:port`, transparently routes every datagram through a
//! network simulator: outgoing datagrams gain a 16-byte routing header
//! naming the true source and destination and go to the simulator's
//! address; incoming datagrams from the simulator carry the same header,
//! which is stripped and validated here. Without the variable this is a
//! plain pass-through UDP endpoint.
//!
//! Routing header, big-endian: source id (4), source IPv4 (4),
//! destination IPv4 (4), source port (2), destination port (2).

use std::io;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::constants::MAX_PACKET;

const ROUTE_HEADER_LEN: usize = 16;

/// Receive buffers must leave room for the simulator routing header.
pub const RECV_BUF_LEN: usize = MAX_PACKET + ROUTE_HEADER_LEN;

/// A UDP endpoint with optional simulator routing.
pub struct SimSock {
    sock: UdpSocket,
    local: SocketAddrV4,
    node_id: u32,
    simulator: Option<SocketAddr>,
}

impl SimSock {
    /// Binds the endpoint and reads `SIMULATOR` from the environment.
    pub async fn bind(node_id: u32, addr: SocketAddr) -> io::Result<Self> {
        let sock = UdpSocket::bind(addr).await?;
        let local = match sock.local_addr()? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(v6) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("IPv4 address required, bound {v6}"),
                ));
            }
        };

        let simulator = match std::env::var("SIMULATOR") {
            Ok(value) => {
                let sim = value
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("bad SIMULATOR address: {value}"),
                        )
                    })?;
                info!(%sim, "routing datagrams through simulator");
                Some(sim)
            }
            Err(_) => None,
        };

        Ok(Self {
            sock,
            local,
            node_id,
            simulator,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.local)
    }

    /// Sends one datagram to a peer, via the simulator when active.
    pub async fn send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let Some(sim) = self.simulator else {
            return self.sock.send_to(data, dest).await;
        };

        let framed = self.frame(data, dest)?;
        let sent = self.sock.send_to(&framed, sim).await?;
        Ok(sent.saturating_sub(ROUTE_HEADER_LEN))
    }

    /// Awaits one datagram; returns payload length and the true sender.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (len, from) = self.sock.recv_from(buf).await?;
        self.unframe(buf, len, from)
    }

    /// Non-blocking receive for draining the socket after a wake-up.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (len, from) = self.sock.try_recv_from(buf)?;
        self.unframe(buf, len, from)
    }

    fn frame(&self, data: &[u8], dest: SocketAddr) -> io::Result<Vec<u8>> {
        let SocketAddr::V4(dest) = dest else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "simulator routing requires IPv4 peers",
            ));
        };

        let mut framed = Vec::with_capacity(ROUTE_HEADER_LEN + data.len());
        framed.extend_from_slice(&self.node_id.to_be_bytes());
        framed.extend_from_slice(&self.local.ip().octets());
        framed.extend_from_slice(&dest.ip().octets());
        framed.extend_from_slice(&self.local.port().to_be_bytes());
        framed.extend_from_slice(&dest.port().to_be_bytes());
        framed.extend_from_slice(data);
        Ok(framed)
    }

    fn unframe(
        &self,
        buf: &mut [u8],
        len: usize,
        from: SocketAddr,
    ) -> io::Result<(usize, SocketAddr)> {
        if self.simulator.is_none() {
            return Ok((len, from));
        }

        if len < ROUTE_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram shorter than routing header",
            ));
        }

        let mut src_ip = [0u8; 4];
        src_ip.copy_from_slice(&buf[4..8]);
        let mut dst_ip = [0u8; 4];
        dst_ip.copy_from_slice(&buf[8..12]);
        let src_port = u16::from_be_bytes([buf[12], buf[13]]);
        let dst_port = u16::from_be_bytes([buf[14], buf[15]]);

        let dest = SocketAddrV4::new(dst_ip.into(), dst_port);
        if dest != self.local {
            warn!(%dest, local = %self.local, "routing header names another destination");
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "routing header destination mismatch",
            ));
        }

        buf.copy_within(ROUTE_HEADER_LEN..len, 0);
        let sender = SocketAddr::V4(SocketAddrV4::new(src_ip.into(), src_port));
        Ok((len - ROUTE_HEADER_LEN, sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pass_through_round_trip() {
        let a = SimSock::bind(1, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = SimSock::bind(2, "127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.send_to(b"hello", b.local_addr()).await.unwrap();

        let mut buf = [0u8; RECV_BUF_LEN];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.local_addr());
    }

    async fn routed_sock() -> SimSock {
        SimSock {
            sock: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            local: SocketAddrV4::new([127, 0, 0, 1].into(), 10001),
            node_id: 7,
            simulator: Some("127.0.0.1:9999".parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let sock = routed_sock().await;

        let framed = sock
            .frame(b"xy", "127.0.0.2:10002".parse().unwrap())
            .unwrap();
        assert_eq!(framed.len(), ROUTE_HEADER_LEN + 2);
        assert_eq!(&framed[0..4], &7u32.to_be_bytes());
        assert_eq!(&framed[4..8], &[127, 0, 0, 1]);
        assert_eq!(&framed[8..12], &[127, 0, 0, 2]);
        assert_eq!(u16::from_be_bytes([framed[12], framed[13]]), 10001);
        assert_eq!(u16::from_be_bytes([framed[14], framed[15]]), 10002);

        // A framed datagram addressed to us unpacks to the original payload.
        let mut buf = [0u8; RECV_BUF_LEN];
        let reply = {
            let mut v = framed.clone();
            v[4..8].copy_from_slice(&[127, 0, 0, 2]);
            v[8..12].copy_from_slice(&[127, 0, 0, 1]);
            v[12..14].copy_from_slice(&10002u16.to_be_bytes());
            v[14..16].copy_from_slice(&10001u16.to_be_bytes());
            v
        };
        buf[..reply.len()].copy_from_slice(&reply);
        let (len, from) = sock
            .unframe(&mut buf, reply.len(), "127.0.0.1:9999".parse().unwrap())
            .unwrap();
        assert_eq!(&buf[..len], b"xy");
        assert_eq!(from, "127.0.0.2:10002".parse().unwrap());
    }

    #[tokio::test]
    async fn test_unframe_rejects_wrong_destination() {
        let sock = routed_sock().await;

        let mut buf = [0u8; RECV_BUF_LEN];
        // Header addressed to a different port.
        buf[..16].copy_from_slice(&{
            let mut h = [0u8; 16];
            h[4..8].copy_from_slice(&[127, 0, 0, 2]);
            h[8..12].copy_from_slice(&[127, 0, 0, 1]);
            h[14..16].copy_from_slice(&4242u16.to_be_bytes());
            h
        });
        let err = sock
            .unframe(&mut buf, 16, "127.0.0.1:9999".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
