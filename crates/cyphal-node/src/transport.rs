//! UDP multicast transport -- one socket to publish, one to listen.
//!
//! Each subject maps to its own multicast group `base | subject_id`.
//! Both sockets are framed with [`EnvelopeCodec`], one envelope per datagram.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use cyphal_protocol::{EnvelopeCodec, SUBJECT_ID_MAX};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::udp::UdpFramed;

use crate::config::TransportSection;

/// Cyphal/UDP well-known port.
pub const CYPHAL_UDP_PORT: u16 = 9382;

pub type EnvelopeSocket = UdpFramed<EnvelopeCodec>;

/// Multicast group carrying `subject_id`.
pub fn subject_multicast_addr(base: Ipv4Addr, subject_id: u16, port: u16) -> SocketAddrV4 {
    let group = u32::from(base) | u32::from(subject_id & SUBJECT_ID_MAX);
    SocketAddrV4::new(Ipv4Addr::from(group), port)
}

/// Publishing socket: ephemeral port on the configured interface.
pub fn bind_sender(cfg: &TransportSection) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(cfg.ttl)?;
    socket.set_multicast_loop_v4(cfg.loopback)?;
    if !cfg.interface.is_unspecified() {
        socket.set_multicast_if_v4(&cfg.interface)?;
    }
    let bind = SocketAddr::V4(SocketAddrV4::new(cfg.interface, 0));
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Listening socket on the shared port, joined to every subject's group.
///
/// SO_REUSEADDR lets several nodes on one host share the port.
pub fn bind_receiver(cfg: &TransportSection, subjects: &[u16]) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.port));
    socket.bind(&bind.into())?;
    for subject in subjects {
        let group = subject_multicast_addr(cfg.multicast_base, *subject, cfg.port);
        socket.join_multicast_v4(group.ip(), &cfg.interface)?;
        tracing::debug!(subject, group = %group, "transport: joined multicast group");
    }
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Framed sender and receiver plus the sender's own address, used to
/// recognise our datagrams looping back.
pub struct Transport {
    pub tx: EnvelopeSocket,
    pub rx: EnvelopeSocket,
    pub local: SocketAddr,
}

impl Transport {
    pub fn open(cfg: &TransportSection, subjects: &[u16]) -> io::Result<Self> {
        let tx = bind_sender(cfg)?;
        let local = tx.local_addr()?;
        let rx = bind_receiver(cfg, subjects)?;
        tracing::info!(
            local = %local,
            port = cfg.port,
            base = %cfg.multicast_base,
            subjects = subjects.len(),
            "transport: sockets ready"
        );
        Ok(Self {
            tx: UdpFramed::new(tx, EnvelopeCodec),
            rx: UdpFramed::new(rx, EnvelopeCodec),
            local,
        })
    }
}

/// True when `from` is our own publishing socket. An unspecified local IP
/// matches any address with the same port.
pub fn is_own_datagram(local: SocketAddr, from: SocketAddr) -> bool {
    from.port() == local.port() && (local.ip().is_unspecified() || from.ip() == local.ip())
}
