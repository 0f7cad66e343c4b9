//! The live sessions, keyed by the handle of each session's socket.

use std::collections::HashMap;

use log::{debug, info};
use smoltcp::{
    iface::{SocketHandle, SocketSet},
    socket::udp::Socket as UdpSocket,
    time::{Duration, Instant},
    wire::IpEndpoint,
};

use crate::error::Result;
use crate::session::Session;
use crate::socket::{udp_socket, Binder, PortAllocator};

/// Datagrams buffered per transfer socket. A transfer only ever has one
/// packet in flight each way, the rest is slack for duplicates.
const SESSION_PACKETS: usize = 4;

/// A destroyed session's socket, kept until its queued packets are out.
#[derive(Debug)]
struct Lingering {
    handle: SocketHandle,
    port: u16,
    since: Instant,
}

#[derive(Debug)]
pub struct Registry {
    sessions: HashMap<SocketHandle, Session>,
    lingering: Vec<Lingering>,
    ports: PortAllocator,
}

impl Registry {
    pub fn new(ports: PortAllocator) -> Self {
        Self {
            sessions: HashMap::new(),
            lingering: Vec::new(),
            ports,
        }
    }

    /// Open a session for `peer` on a freshly bound transfer socket.
    pub fn create<B>(
        &mut self,
        sockets: &mut SocketSet<'_>,
        binder: &mut B,
        peer: IpEndpoint,
        now: Instant,
    ) -> Result<SocketHandle>
    where
        B: Binder + ?Sized,
    {
        let port = self.ports.allocate(binder)?;
        let mut socket = udp_socket(SESSION_PACKETS);
        if let Err(err) = socket.bind(port) {
            self.ports.release(binder, port);
            return Err(err.into());
        }
        let handle = sockets.add(socket);
        self.sessions
            .insert(handle, Session::new(handle, port, peer, now));
        info!("{peer}: session opened on port {port}");
        Ok(handle)
    }

    /// Drop a session and close its file. The socket stays in the set until
    /// [`Registry::release`] finds its transmit queue empty.
    pub fn destroy(&mut self, handle: SocketHandle, now: Instant) -> bool {
        let Some(session) = self.sessions.remove(&handle) else {
            return false;
        };
        info!(
            "{}: session on port {} closed",
            session.peer(),
            session.port()
        );
        self.lingering.push(Lingering {
            handle,
            port: session.port(),
            since: now,
        });
        true
    }

    /// Remove the sockets of destroyed sessions once their last packets
    /// have left, or once `grace` has passed regardless.
    pub fn release<B>(
        &mut self,
        sockets: &mut SocketSet<'_>,
        binder: &mut B,
        now: Instant,
        grace: Duration,
    ) where
        B: Binder + ?Sized,
    {
        let ports = &mut self.ports;
        self.lingering.retain(|entry| {
            let flushed = sockets.get::<UdpSocket>(entry.handle).send_queue() == 0;
            if !flushed && now - entry.since < grace {
                return true;
            }
            debug!("releasing port {}", entry.port);
            sockets.remove(entry.handle);
            ports.release(binder, entry.port);
            false
        });
    }

    pub fn get(&self, handle: SocketHandle) -> Option<&Session> {
        self.sessions.get(&handle)
    }

    pub fn get_mut(&mut self, handle: SocketHandle) -> Option<&mut Session> {
        self.sessions.get_mut(&handle)
    }

    /// Find the session talking to `peer`, if any.
    pub fn find_peer(&self, peer: IpEndpoint) -> Option<SocketHandle> {
        self.sessions
            .values()
            .find(|session| session.peer() == peer)
            .map(Session::handle)
    }

    /// Handles of all live sessions, detached from the registry so sessions
    /// can be destroyed while iterating.
    pub fn handles(&self) -> Vec<SocketHandle> {
        let mut handles: Vec<_> = self.sessions.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Transfer ports held by live or lingering sockets.
    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use smoltcp::{phy::Loopback, phy::Medium, wire::IpAddress};

    use crate::transfer::send;
    use crate::packet::Repr;

    fn peer(port: u16) -> IpEndpoint {
        IpEndpoint::new(IpAddress::v4(127, 0, 0, 1), port)
    }

    #[test]
    fn create_lookup_destroy() {
        let mut device = Loopback::new(Medium::Ip);
        let mut sockets = SocketSet::new(vec![]);
        let mut registry = Registry::new(PortAllocator::new(50000, 50001));
        let now = Instant::from_millis(0);

        let a = registry.create(&mut sockets, &mut device, peer(1000), now).unwrap();
        let b = registry.create(&mut sockets, &mut device, peer(1001), now).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().port(), 50000);
        assert_eq!(registry.find_peer(peer(1001)), Some(b));
        assert_eq!(registry.find_peer(peer(1002)), None);

        // Range exhausted.
        assert!(registry
            .create(&mut sockets, &mut device, peer(1002), now)
            .is_err());

        assert!(registry.destroy(a, now));
        assert!(!registry.destroy(a, now));
        assert!(registry.get(a).is_none());
        assert_eq!(registry.handles(), vec![b]);

        registry.release(&mut sockets, &mut device, now, Duration::from_secs(5));
        assert_eq!(registry.ports_in_use(), 1);
        assert_eq!(sockets.iter().count(), 1);
    }

    #[test]
    fn socket_lingers_until_flushed() {
        let mut device = Loopback::new(Medium::Ip);
        let mut sockets = SocketSet::new(vec![]);
        let mut registry = Registry::new(PortAllocator::new(50000, 50000));
        let start = Instant::from_millis(0);
        let grace = Duration::from_secs(5);

        let handle = registry.create(&mut sockets, &mut device, peer(1000), start).unwrap();
        let socket = sockets.get_mut::<UdpSocket>(handle);
        send(socket, peer(1000), &Repr::Ack { block: 0 }).unwrap();
        registry.destroy(handle, start);

        registry.release(&mut sockets, &mut device, start, grace);
        assert_eq!(registry.ports_in_use(), 1);

        registry.release(&mut sockets, &mut device, start + grace, grace);
        assert_eq!(registry.ports_in_use(), 0);
        assert_eq!(sockets.iter().count(), 0);
    }
}
