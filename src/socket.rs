//! UDP endpoints for the listener and per-transfer sockets, and the host
//! services the server needs from whatever carries its packets.

use std::collections::HashSet;
use std::io;

use log::debug;
use smoltcp::{
    iface::{Config as IfaceConfig, Interface},
    phy::{Device, Loopback},
    socket::udp::{PacketBuffer, PacketMetadata, Socket as UdpSocket},
    time::{Duration, Instant},
    wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint},
};

use crate::error::{Error, Result};

/// Receive buffer per datagram slot. Larger datagrams still count as
/// received, see [`recv_datagram`].
pub const DATAGRAM_SIZE: usize = 1500;

/// Reserves and releases UDP ports on the host, so a smoltcp socket bound to
/// a port is reachable from the outside.
pub trait Binder {
    fn bind(&mut self, port: u16) -> io::Result<()>;
    fn unbind(&mut self, port: u16);
}

/// Blocks until a packet might be ready or `timeout` passes.
pub trait Wait {
    fn wait(&mut self, timeout: Duration) -> io::Result<()>;
}

// A loopback device has no host ports and never blocks.
impl Binder for Loopback {
    fn bind(&mut self, _port: u16) -> io::Result<()> {
        Ok(())
    }

    fn unbind(&mut self, _port: u16) {}
}

impl Wait for Loopback {
    fn wait(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

/// Create an unbound UDP socket buffering up to `packets` datagrams each way.
pub fn udp_socket<'a>(packets: usize) -> UdpSocket<'a> {
    let rx_buffer = PacketBuffer::new(
        vec![PacketMetadata::EMPTY; packets],
        vec![0u8; packets * DATAGRAM_SIZE],
    );
    let tx_buffer = PacketBuffer::new(
        vec![PacketMetadata::EMPTY; packets],
        vec![0u8; packets * DATAGRAM_SIZE],
    );
    UdpSocket::new(rx_buffer, tx_buffer)
}

/// Take the next datagram off `socket`, copying as much as fits into `buf`.
///
/// Returns the datagram's full size and sender. A size above `buf.len()`
/// means the copy was cut short; the datagram is consumed either way so
/// its sender can be answered.
pub fn recv_datagram(socket: &mut UdpSocket<'_>, buf: &mut [u8]) -> Result<(usize, IpEndpoint)> {
    let (payload, meta) = socket.recv()?;
    let copied = payload.len().min(buf.len());
    buf[..copied].copy_from_slice(&payload[..copied]);
    Ok((payload.len(), meta.endpoint))
}

/// Build an IP-medium interface that owns `host`.
///
/// The address gets a zero-length prefix so every peer is treated as
/// directly reachable; the device decides how packets really leave.
pub fn interface<D>(device: &mut D, host: IpAddress, now: Instant) -> Interface
where
    D: Device + ?Sized,
{
    let mut iface = Interface::new(IfaceConfig::new(HardwareAddress::Ip), device, now);
    iface.update_ip_addrs(|addrs| {
        if addrs.push(IpCidr::new(host, 0)).is_err() {
            log::error!("interface address table is full, {host} not added");
        }
    });
    iface
}

/// Hands out per-transfer ports from an inclusive range.
#[derive(Debug)]
pub struct PortAllocator {
    first: u16,
    last: u16,
    next: u16,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(first: u16, last: u16) -> Self {
        Self {
            first,
            last,
            next: first,
            in_use: HashSet::new(),
        }
    }

    /// Take the next free port the binder accepts. Ports the host refuses
    /// are skipped.
    pub fn allocate<B: Binder + ?Sized>(&mut self, binder: &mut B) -> Result<u16> {
        let span = usize::from(self.last - self.first) + 1;
        for _ in 0..span {
            let port = self.next;
            self.next = if port == self.last { self.first } else { port + 1 };
            if self.in_use.contains(&port) {
                continue;
            }
            match binder.bind(port) {
                Ok(()) => {
                    self.in_use.insert(port);
                    return Ok(port);
                }
                Err(err) => debug!("skipping port {port}: {err}"),
            }
        }
        Err(Error::PortsExhausted)
    }

    pub fn release<B: Binder + ?Sized>(&mut self, binder: &mut B, port: u16) {
        if self.in_use.remove(&port) {
            binder.unbind(port);
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}
