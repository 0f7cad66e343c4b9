//! Per-transfer state.

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use smoltcp::{iface::SocketHandle, time::Instant, wire::IpEndpoint};

use crate::error::{Error, Result};

/// Which side of the transfer the server plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No request accepted yet.
    Unset,
    /// Serving a read request: the server sends DATA and receives ACK.
    Reading,
    /// Serving a write request: the server receives DATA and sends ACK.
    Writing,
}

/// One in-flight transfer, bound to a peer's transfer ID and to its own
/// socket in the server's socket set.
#[derive(Debug)]
pub struct Session {
    pub(crate) handle: SocketHandle,
    pub(crate) port: u16,
    pub(crate) peer: IpEndpoint,
    pub(crate) file: Option<File>,
    pub(crate) role: Role,
    /// Last block fully sent (reading) or acknowledged (writing).
    pub(crate) last_block: u16,
    /// Size of the last block moved; `None` until one has been.
    pub(crate) last_len: Option<usize>,
    pub(crate) last_activity: Instant,
    pub(crate) timeouts: u32,
}

impl Session {
    pub fn new(handle: SocketHandle, port: u16, peer: IpEndpoint, now: Instant) -> Self {
        Self {
            handle,
            port,
            peer,
            file: None,
            role: Role::Unset,
            last_block: 0,
            last_len: None,
            last_activity: now,
            timeouts: 0,
        }
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    /// The local per-transfer port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The peer's transfer ID.
    pub fn peer(&self) -> IpEndpoint {
        self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn last_block(&self) -> u16 {
        self.last_block
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Record forward progress: the timeout clock restarts.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.timeouts = 0;
    }
}

/// Confine a requested filename to `root` by keeping only its final
/// component. Names without one (`..`, `/`, `dir/..`) are refused.
pub fn sandbox(root: &Path, filename: &str) -> Result<PathBuf> {
    // Both separators count, whatever the host's convention.
    let last = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    match Path::new(last).components().next() {
        Some(Component::Normal(name)) => Ok(root.join(name)),
        _ => Err(Error::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_final_component() {
        let root = Path::new("/srv/tftp");
        assert_eq!(
            sandbox(root, "report.txt").unwrap(),
            PathBuf::from("/srv/tftp/report.txt")
        );
        assert_eq!(
            sandbox(root, "../../etc/passwd").unwrap(),
            PathBuf::from("/srv/tftp/passwd")
        );
        assert_eq!(
            sandbox(root, "C:\\boot\\pxelinux.0").unwrap(),
            PathBuf::from("/srv/tftp/pxelinux.0")
        );
    }

    #[test]
    fn refuses_names_without_a_file() {
        let root = Path::new("/srv/tftp");
        assert!(sandbox(root, "..").is_err());
        assert!(sandbox(root, "boot/").is_err());
        assert!(sandbox(root, "a/.").is_err());
    }
}
