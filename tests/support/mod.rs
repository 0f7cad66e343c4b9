//! A server and its clients on one loopback interface, driven by a manual
//! clock.

#![allow(dead_code)]

use std::path::PathBuf;

use smol_tftpd::{
    config::Config,
    packet::{self, Packet, Repr, MAX_DATA_SIZE},
    server::Server,
    socket::{self, udp_socket},
};
use smoltcp::{
    iface::{Interface, SocketHandle},
    phy::{Loopback, Medium},
    socket::udp::Socket as UdpSocket,
    time::{Duration, Instant},
    wire::{IpAddress, IpEndpoint},
};
use tempfile::TempDir;

pub const SERVER_PORT: u16 = 69;
pub const FIRST_TRANSFER_PORT: u16 = 50000;

pub struct Harness {
    pub root: TempDir,
    pub device: Loopback,
    pub iface: Interface,
    pub server: Server<'static>,
    pub now: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config {
            port: SERVER_PORT,
            root: root.path().to_path_buf(),
            port_range: (FIRST_TRANSFER_PORT, FIRST_TRANSFER_PORT + 99),
            ..Config::default()
        };
        tweak(&mut config);

        let now = Instant::ZERO;
        let mut device = Loopback::new(Medium::Ip);
        let iface = socket::interface(&mut device, localhost(), now);
        let server = Server::new(config, &mut device, vec![]).unwrap();
        Self {
            root,
            device,
            iface,
            server,
            now,
        }
    }

    /// The listener's address.
    pub fn listener(&self) -> IpEndpoint {
        IpEndpoint::new(localhost(), SERVER_PORT)
    }

    /// Open a client socket on `port`, sharing the server's interface.
    pub fn client(&mut self, port: u16) -> SocketHandle {
        let mut socket = udp_socket(8);
        socket.bind(port).unwrap();
        self.server.sockets_mut().add(socket)
    }

    pub fn send_raw(&mut self, client: SocketHandle, to: IpEndpoint, bytes: &[u8]) {
        self.socket(client).send_slice(bytes, to).unwrap();
        self.pump();
    }

    pub fn send(&mut self, client: SocketHandle, to: IpEndpoint, repr: Repr<'_>) {
        self.queue(client, to, repr);
        self.pump();
    }

    /// Put a packet on the client's transmit queue without running the server.
    pub fn queue(&mut self, client: SocketHandle, to: IpEndpoint, repr: Repr<'_>) {
        let mut buf = vec![0u8; repr.buffer_len()];
        repr.emit(&mut Packet::new_unchecked(&mut buf[..]));
        self.socket(client).send_slice(&buf, to).unwrap();
    }

    pub fn rrq(&mut self, client: SocketHandle, filename: &str) {
        let to = self.listener();
        self.send(
            client,
            to,
            Repr::Rrq {
                filename,
                mode: "octet",
            },
        );
    }

    pub fn wrq(&mut self, client: SocketHandle, filename: &str) {
        let to = self.listener();
        self.send(
            client,
            to,
            Repr::Wrq {
                filename,
                mode: "octet",
            },
        );
    }

    /// Take the next datagram a client received, with its sender.
    pub fn recv(&mut self, client: SocketHandle) -> Option<(Vec<u8>, IpEndpoint)> {
        let mut buf = vec![0u8; 2048];
        let socket = self.socket(client);
        if !socket.can_recv() {
            return None;
        }
        let (len, meta) = socket.recv_slice(&mut buf).unwrap();
        buf.truncate(len);
        Some((buf, meta.endpoint))
    }

    /// Like [`Harness::recv`], but the datagram must be there.
    pub fn expect(&mut self, client: SocketHandle) -> (Vec<u8>, IpEndpoint) {
        self.recv(client).expect("no datagram for the client")
    }

    /// Run enough iterations for packets in flight to land.
    pub fn pump(&mut self) {
        for _ in 0..3 {
            self.poll_once();
        }
    }

    pub fn poll_once(&mut self) {
        self.server
            .poll(self.now, &mut self.iface, &mut self.device);
    }

    /// The sleep the server would take before its next iteration.
    pub fn poll_delay(&mut self) -> Duration {
        self.server.poll_delay(self.now, &mut self.iface)
    }

    pub fn advance(&mut self, by: Duration) {
        self.now = self.now + by;
        self.pump();
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) {
        std::fs::write(self.root.path().join(name), contents).unwrap();
    }

    pub fn read_file(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.root.path().join(name)).unwrap()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn socket(&mut self, handle: SocketHandle) -> &mut UdpSocket<'static> {
        self.server.sockets_mut().get_mut::<UdpSocket>(handle)
    }
}

pub fn localhost() -> IpAddress {
    IpAddress::v4(127, 0, 0, 1)
}

/// Decode a datagram the server sent.
pub fn decode(bytes: &[u8]) -> Repr<'_> {
    packet::decode(bytes, MAX_DATA_SIZE).unwrap()
}

/// A file of `len` bytes that differs from block to block.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
