//! A device built around the stdlib's UdpSocket.
//!
//! smoltcp deals in whole IP packets, but opening a raw socket or a TUN/TAP
//! interface needs privileges. Instead every port the server binds gets a
//! host UDP socket on the same port. Received datagrams are wrapped in an
//! IP and UDP header addressed to that port, and outgoing packets are
//! stripped back to their payload and sent from the host socket owning the
//! source port.

use log::{debug, warn};
use smoltcp::{
    phy::{DeviceCapabilities, Medium},
    time::{Duration, Instant},
    wire::{IpAddress, IpEndpoint, IpProtocol, Ipv4Packet, Ipv6Packet, UdpPacket},
};

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    os::fd::AsRawFd,
};

use crate::socket::{Binder, Wait, DATAGRAM_SIZE};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

pub struct RxToken(Vec<u8>);

impl smoltcp::phy::RxToken for RxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub struct TxToken<'a>(&'a [(u16, UdpSocket)]);

impl<'a> smoltcp::phy::TxToken for TxToken<'a> {
    /// Consume a raw IP packet and send its payload over the host socket
    /// bound to its source port.
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0; len];
        let result = f(&mut buffer);
        let Some((port, payload, addr)) = strip_ip_packet(&buffer) else {
            debug!("dropping a non-UDP packet");
            return result;
        };
        match self.0.iter().find(|(bound, _)| *bound == port) {
            Some((_, socket)) => {
                if let Err(e) = socket.send_to(payload, addr) {
                    warn!("port {port}: send to {addr} failed: {e}");
                }
            }
            None => debug!("port {port} is no longer bound, dropping packet to {addr}"),
        }
        result
    }
}

/// Set basic UDP headers on a packet.
fn set_udp_headers<T: AsRef<[u8]> + AsMut<[u8]>>(
    src_addr: &IpEndpoint,
    dst_addr: &IpEndpoint,
    packet: &mut UdpPacket<T>,
    payload: &[u8],
) {
    packet.set_src_port(src_addr.port);
    packet.set_dst_port(dst_addr.port);
    packet.set_len(packet.as_ref().len() as u16);
    packet.payload_mut().copy_from_slice(payload);
    packet.fill_checksum(&src_addr.addr, &dst_addr.addr);
}

/// Craft a minimal raw packet given a source and a destination. Both must
/// be of the same IP version.
fn craft_raw_packet(src_addr: &IpEndpoint, dst_addr: &IpEndpoint, payload: &[u8]) -> Option<Vec<u8>> {
    match (src_addr.addr, dst_addr.addr) {
        (IpAddress::Ipv4(src), IpAddress::Ipv4(dst)) => {
            let mut buffer = vec![0; IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()];
            let mut udp_packet = UdpPacket::new_unchecked(&mut buffer[IPV4_HEADER_LEN..]);
            set_udp_headers(src_addr, dst_addr, &mut udp_packet, payload);

            let mut ip_packet = Ipv4Packet::new_unchecked(&mut buffer);
            ip_packet.set_version(4);
            ip_packet.set_header_len(IPV4_HEADER_LEN as u8);
            ip_packet.set_next_header(IpProtocol::Udp);
            ip_packet.set_dont_frag(true);
            ip_packet.set_hop_limit(64);
            ip_packet.set_total_len(ip_packet.as_ref().len() as u16);
            ip_packet.set_src_addr(src);
            ip_packet.set_dst_addr(dst);
            // The header length must be in place before the checksum.
            ip_packet.fill_checksum();
            Some(buffer)
        }
        (IpAddress::Ipv6(src), IpAddress::Ipv6(dst)) => {
            let mut buffer = vec![0; IPV6_HEADER_LEN + UDP_HEADER_LEN + payload.len()];
            let mut udp_packet = UdpPacket::new_unchecked(&mut buffer[IPV6_HEADER_LEN..]);
            let udp_len = udp_packet.as_ref().len();
            set_udp_headers(src_addr, dst_addr, &mut udp_packet, payload);

            let mut ip_packet = Ipv6Packet::new_unchecked(&mut buffer);
            ip_packet.set_version(6);
            ip_packet.set_next_header(IpProtocol::Udp);
            ip_packet.set_payload_len(udp_len as u16);
            ip_packet.set_hop_limit(64);
            ip_packet.set_src_addr(src);
            ip_packet.set_dst_addr(dst);
            Some(buffer)
        }
        _ => None,
    }
}

/// Split an outgoing IP packet into its UDP source port, payload and
/// destination.
fn strip_ip_packet(packet: &[u8]) -> Option<(u16, &[u8], SocketAddr)> {
    let (dst, payload) = match packet.first()? >> 4 {
        4 => {
            let ip_packet = Ipv4Packet::new_checked(packet).ok()?;
            if ip_packet.next_header() != IpProtocol::Udp {
                return None;
            }
            (IpAddr::from(ip_packet.dst_addr()), ip_packet.payload())
        }
        6 => {
            let ip_packet = Ipv6Packet::new_checked(packet).ok()?;
            if ip_packet.next_header() != IpProtocol::Udp {
                return None;
            }
            (IpAddr::from(ip_packet.dst_addr()), ip_packet.payload())
        }
        _ => return None,
    };
    let udp_packet = UdpPacket::new_checked(payload).ok()?;
    Some((
        udp_packet.src_port(),
        udp_packet.payload(),
        SocketAddr::new(dst, udp_packet.dst_port()),
    ))
}

/// Host UDP sockets posing as one IP-medium device.
pub struct UdpSocketDevice {
    bind_ip: IpAddr,
    host: IpAddress,
    sockets: Vec<(u16, UdpSocket)>,
    // Where the next receive starts, so one busy port can't starve the rest.
    next: usize,
}

impl UdpSocketDevice {
    /// Create a device whose ports are bound on `bind_ip`.
    pub fn new(bind_ip: IpAddr) -> Self {
        // Datagrams don't tell which local address they arrived on, so an
        // unspecified bind address is stood in for by loopback.
        let host = match bind_ip {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        Self {
            bind_ip,
            host: host.into(),
            sockets: Vec::new(),
            next: 0,
        }
    }

    /// The address the interface must own for received packets to reach it.
    pub fn host(&self) -> IpAddress {
        self.host
    }
}

impl Binder for UdpSocketDevice {
    fn bind(&mut self, port: u16) -> io::Result<()> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, port))?;
        socket.set_nonblocking(true)?;
        debug!("bound host port {port}");
        self.sockets.push((port, socket));
        Ok(())
    }

    fn unbind(&mut self, port: u16) {
        self.sockets.retain(|(bound, _)| *bound != port);
    }
}

impl Wait for UdpSocketDevice {
    fn wait(&mut self, timeout: Duration) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .sockets
            .iter()
            .map(|(_, socket)| libc::pollfd {
                fd: socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let timeout = libc::c_int::try_from(timeout.total_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: `fds` is a live, initialized array of `fds.len()` pollfds.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// This is a hack! We don't have raw access to IP headers, but we pretend like we do.
impl smoltcp::phy::Device for UdpSocketDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = TxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let count = self.sockets.len();
        let mut buffer = vec![0; u16::MAX as usize];
        for i in 0..count {
            let index = (self.next + i) % count;
            let (port, socket) = &self.sockets[index];
            let (size, from) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("port {port}: receive failed: {e}");
                    continue;
                }
            };
            self.next = (index + 1) % count;

            let local = IpEndpoint::new(self.host, *port);
            match craft_raw_packet(&from.into(), &local, &buffer[..size]) {
                Some(raw) => return Some((RxToken(raw), TxToken(&self.sockets))),
                None => debug!("{from}: address family differs from {}, dropped", self.host),
            }
        }
        None
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxToken(&self.sockets))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut capabilities = DeviceCapabilities::default();
        capabilities.medium = Medium::Ip;
        capabilities.max_transmission_unit = IPV6_HEADER_LEN + UDP_HEADER_LEN + DATAGRAM_SIZE;
        capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted_packet_strips_back() {
        let peer = IpEndpoint::new(IpAddress::v4(192, 0, 2, 7), 3000);
        let local = IpEndpoint::new(IpAddress::v4(127, 0, 0, 1), 69);
        let raw = craft_raw_packet(&peer, &local, b"\x00\x04\x00\x01").unwrap();

        let ip_packet = Ipv4Packet::new_checked(&raw[..]).unwrap();
        assert!(ip_packet.verify_checksum());
        let udp_packet = UdpPacket::new_checked(ip_packet.payload()).unwrap();
        assert!(udp_packet.verify_checksum(&peer.addr, &local.addr));

        let (port, payload, addr) = strip_ip_packet(&raw).unwrap();
        assert_eq!(port, 3000);
        assert_eq!(payload, b"\x00\x04\x00\x01");
        assert_eq!(addr, "127.0.0.1:69".parse().unwrap());
    }

    #[test]
    fn mixed_families_are_refused() {
        let v4 = IpEndpoint::new(IpAddress::v4(127, 0, 0, 1), 69);
        let v6 = IpEndpoint::new(IpAddress::v6(0, 0, 0, 0, 0, 0, 0, 1), 69);
        assert!(craft_raw_packet(&v4, &v6, b"").is_none());
    }

    #[test]
    fn v6_packet_strips_back() {
        let peer = IpEndpoint::new(IpAddress::v6(0xfe80, 0, 0, 0, 0, 0, 0, 2), 3000);
        let local = IpEndpoint::new(IpAddress::v6(0xfe80, 0, 0, 0, 0, 0, 0, 1), 69);
        let raw = craft_raw_packet(&peer, &local, b"hi").unwrap();
        let (port, payload, addr) = strip_ip_packet(&raw).unwrap();
        assert_eq!(port, 3000);
        assert_eq!(payload, b"hi");
        assert_eq!(addr, "[fe80::1]:69".parse().unwrap());
    }

    #[test]
    fn unspecified_bind_uses_loopback() {
        let device = UdpSocketDevice::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(device.host(), IpAddress::v4(127, 0, 0, 1));
    }
}
