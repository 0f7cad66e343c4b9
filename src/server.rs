//! The server event loop.
//!
//! One thread multiplexes the listening socket and every transfer socket.
//! Each iteration accepts at most one request, then visits every session
//! once: a session with a datagram waiting handles it, a quiet one is
//! checked against its timeout. Time is passed in, so [`Server::poll`] can
//! be driven by a test clock as well as by [`Server::run`].

use log::{debug, error, info, warn};
use managed::ManagedSlice;
use smoltcp::{
    iface::{Interface, SocketHandle, SocketSet, SocketStorage},
    phy::Device,
    socket::udp::Socket as UdpSocket,
    time::{Duration, Instant},
    wire::IpEndpoint,
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::{self, Repr};
use crate::registry::Registry;
use crate::session::Role;
use crate::socket::{recv_datagram, udp_socket, Binder, PortAllocator, Wait, DATAGRAM_SIZE};
use crate::transfer::{self, Flow};

/// Requests the listener can hold between two iterations.
const LISTENER_PACKETS: usize = 16;

pub struct Server<'a> {
    config: Config,
    sockets: SocketSet<'a>,
    listener: SocketHandle,
    registry: Registry,
}

impl<'a> Server<'a> {
    /// Validate `config` and bind the listening socket.
    ///
    /// `storage` backs the socket set; pass an empty `Vec` to let it grow
    /// with the number of transfers.
    pub fn new<B, S>(config: Config, binder: &mut B, storage: S) -> Result<Self>
    where
        B: Binder + ?Sized,
        S: Into<ManagedSlice<'a, SocketStorage<'a>>>,
    {
        config.validate()?;
        binder.bind(config.port)?;
        let mut listener = udp_socket(LISTENER_PACKETS);
        if let Err(err) = listener.bind(config.port) {
            binder.unbind(config.port);
            return Err(err.into());
        }
        let mut sockets = SocketSet::new(storage);
        let listener = sockets.add(listener);
        let (first, last) = config.port_range;

        Ok(Self {
            registry: Registry::new(PortAllocator::new(first, last)),
            config,
            sockets,
            listener,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn listener(&self) -> SocketHandle {
        self.listener
    }

    pub fn sockets(&self) -> &SocketSet<'a> {
        &self.sockets
    }

    /// The socket set is shared with the interface, so other sockets on the
    /// same interface live here too.
    pub fn sockets_mut(&mut self) -> &mut SocketSet<'a> {
        &mut self.sockets
    }

    /// Serve forever, waiting at most one poll interval between iterations.
    /// The loop doesn't wait at all while datagrams are still buffered.
    pub fn run<D>(&mut self, iface: &mut Interface, device: &mut D) -> Result<()>
    where
        D: Device + Binder + Wait + ?Sized,
    {
        info!(
            "serving {} on port {}",
            self.config.root.display(),
            self.config.port
        );
        loop {
            let now = Instant::now();
            self.poll(now, iface, device);

            let delay = self.poll_delay(now, iface);
            if delay > Duration::ZERO {
                device.wait(delay)?;
            }
        }
    }

    /// How long the loop may sleep after an iteration at `now`.
    ///
    /// Each iteration takes one datagram per socket, so anything the
    /// interface already moved into a socket buffer makes the delay zero.
    /// The host device can't see that backlog.
    pub fn poll_delay(&self, now: Instant, iface: &mut Interface) -> Duration {
        if self.pending() {
            return Duration::ZERO;
        }
        let interval = self.config.poll_interval();
        iface
            .poll_delay(now, &self.sockets)
            .map_or(interval, |delay| delay.min(interval))
    }

    /// Whether the listener or a live session has a datagram waiting.
    fn pending(&self) -> bool {
        let readable = |handle| self.sockets.get::<UdpSocket>(handle).can_recv();
        readable(self.listener) || self.registry.handles().into_iter().any(readable)
    }

    /// Run one iteration of the event loop at `now`.
    pub fn poll<D>(&mut self, now: Instant, iface: &mut Interface, device: &mut D)
    where
        D: Device + Binder + ?Sized,
    {
        iface.poll(now, device, &mut self.sockets);

        let fresh = self.accept(now, device);
        for handle in self.registry.handles() {
            // A session created this iteration has already had its turn.
            if Some(handle) == fresh {
                continue;
            }
            self.service(handle, now);
        }

        iface.poll(now, device, &mut self.sockets);
        self.registry
            .release(&mut self.sockets, device, now, self.config.timeout());
    }

    /// Take one datagram off the listener and start a transfer for it.
    fn accept<B>(&mut self, now: Instant, binder: &mut B) -> Option<SocketHandle>
    where
        B: Binder + ?Sized,
    {
        let mut buf = [0u8; DATAGRAM_SIZE];
        let listener = self.sockets.get_mut::<UdpSocket>(self.listener);
        if !listener.can_recv() {
            return None;
        }
        let (size, peer) = match recv_datagram(listener, &mut buf) {
            Ok(received) => received,
            Err(err) => {
                warn!("listener: {err}");
                return None;
            }
        };

        let repr = match decode(&buf, size, self.config.block_size) {
            Ok(repr @ (Repr::Rrq { .. } | Repr::Wrq { .. })) => repr,
            Ok(repr) => {
                warn!("{peer}: {} sent to the listener", repr.opcode());
                self.refuse(peer, &Error::Unexpected(repr.opcode()));
                return None;
            }
            Err(err) => {
                warn!("{peer}: bad request: {err}");
                self.refuse(peer, &err);
                return None;
            }
        };

        if let Some(existing) = self.registry.find_peer(peer) {
            self.duplicate(existing, repr);
            return None;
        }
        if self.registry.len() >= self.config.max_sessions {
            warn!("{peer}: refused, {} transfers running", self.registry.len());
            self.refuse(peer, &Error::Busy);
            return None;
        }

        let handle = match self
            .registry
            .create(&mut self.sockets, binder, peer, now)
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!("{peer}: could not open a transfer: {err}");
                self.refuse(peer, &err);
                return None;
            }
        };
        self.dispatch(handle, repr, now);
        Some(handle)
    }

    /// Answer a request from a peer that already has a transfer. Only a WRQ
    /// whose ACK 0 may have been lost gets a reply.
    fn duplicate(&mut self, handle: SocketHandle, repr: Repr<'_>) {
        let Some(session) = self.registry.get(handle) else {
            return;
        };
        let peer = session.peer();
        if matches!(repr, Repr::Wrq { .. })
            && session.role() == Role::Writing
            && session.last_block() == 0
        {
            debug!("{peer}: repeated WRQ, resending ACK 0");
            let socket = self.sockets.get_mut::<UdpSocket>(handle);
            if let Err(err) = transfer::send(socket, peer, &Repr::Ack { block: 0 }) {
                warn!("{peer}: {err}");
            }
        } else {
            debug!("{peer}: ignoring {} during a transfer", repr.opcode());
        }
    }

    /// Reply to `peer` from the listener. No session is involved.
    fn refuse(&mut self, peer: IpEndpoint, err: &Error) {
        let listener = self.sockets.get_mut::<UdpSocket>(self.listener);
        transfer::report(listener, peer, err);
    }

    /// Give a session its turn: one waiting datagram, or a timeout check.
    fn service(&mut self, handle: SocketHandle, now: Instant) {
        let mut buf = [0u8; DATAGRAM_SIZE];
        let socket = self.sockets.get_mut::<UdpSocket>(handle);
        if !socket.can_recv() {
            self.expire(handle, now);
            return;
        }
        match recv_datagram(socket, &mut buf) {
            Ok((size, from)) => self.deliver(handle, &buf, size, from, now),
            Err(err) => warn!("transfer socket: {err}"),
        }
    }

    fn deliver(
        &mut self,
        handle: SocketHandle,
        buf: &[u8],
        size: usize,
        from: IpEndpoint,
        now: Instant,
    ) {
        let Some(session) = self.registry.get(handle) else {
            return;
        };
        let peer = session.peer();
        let socket = self.sockets.get_mut::<UdpSocket>(handle);

        // Someone other than the peer found the transfer port. Tell them
        // off and leave the transfer alone.
        if from != peer {
            warn!("{from}: datagram for the transfer with {peer}");
            transfer::report(socket, from, &Error::InvalidAddr(from));
            return;
        }

        match decode(buf, size, self.config.block_size) {
            Ok(repr) => self.dispatch(handle, repr, now),
            Err(err) => {
                warn!("{peer}: bad packet: {err}");
                transfer::report(socket, peer, &err);
                self.registry.destroy(handle, now);
            }
        }
    }

    /// Feed a packet to a session and act on the outcome.
    fn dispatch(&mut self, handle: SocketHandle, repr: Repr<'_>, now: Instant) {
        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };
        let socket = self.sockets.get_mut::<UdpSocket>(handle);
        let peer = session.peer();

        match session.process(socket, repr, &self.config) {
            Ok(Flow::Progress) => session.touch(now),
            Ok(Flow::Ignored) => {}
            Ok(Flow::Complete) => {
                info!("{peer}: transfer complete");
                self.registry.destroy(handle, now);
            }
            Err(err) => {
                match err {
                    Error::Io(_) => error!("{peer}: transfer failed: {err}"),
                    _ => warn!("{peer}: transfer failed: {err}"),
                }
                transfer::report(socket, peer, &err);
                self.registry.destroy(handle, now);
            }
        }
    }

    /// Count a timeout if the session has been quiet for too long, and
    /// either resend or give up.
    fn expire(&mut self, handle: SocketHandle, now: Instant) {
        let Some(session) = self.registry.get_mut(handle) else {
            return;
        };
        if now - session.last_activity() < self.config.timeout() {
            return;
        }

        session.timeouts += 1;
        let peer = session.peer();
        if session.timeouts >= self.config.max_timeouts {
            warn!("{peer}: timed out {} times, giving up", session.timeouts);
            self.registry.destroy(handle, now);
            return;
        }

        let socket = self.sockets.get_mut::<UdpSocket>(handle);
        match session.retransmit(socket, &self.config) {
            Ok(Flow::Complete) => {
                self.registry.destroy(handle, now);
            }
            Ok(_) => session.last_activity = now,
            Err(err) => {
                warn!("{peer}: resend failed: {err}");
                transfer::report(socket, peer, &err);
                self.registry.destroy(handle, now);
            }
        }
    }
}

/// Decode a received datagram of `size` bytes, of which `buf` holds the
/// part that fit. Anything cut short is too long for a TFTP packet anyway.
fn decode(buf: &[u8], size: usize, max_data: usize) -> Result<Repr<'_>> {
    if size > buf.len() {
        return Err(Error::Length(size));
    }
    packet::decode(&buf[..size], max_data)
}
