//! The protocol state machine: how a session answers each packet.
//!
//! A session starts [`Role::Unset`]. An accepted RRQ makes it a sender
//! ([`Role::Reading`]), an accepted WRQ a receiver ([`Role::Writing`]), and
//! from then on only the packets of that role are legal. Handlers return a
//! [`Flow`] for the event loop, or an error that ends the transfer.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, info, warn};
use smoltcp::{socket::udp::Socket as UdpSocket, wire::IpEndpoint};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::{ErrorCode, Opcode, Packet, Repr, MAX_DATA_SIZE, OCTET};
use crate::session::{sandbox, Role, Session};

/// What the event loop does with a session after handing it a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The transfer moved forward; its timeout clock restarts.
    Progress,
    /// A stale or duplicate packet. The timeout clock keeps running.
    Ignored,
    /// The final, short block went out or came in.
    Complete,
}

impl Session {
    /// Drive the state machine with one decoded packet, replying through
    /// `socket`.
    pub fn process(
        &mut self,
        socket: &mut UdpSocket<'_>,
        repr: Repr<'_>,
        config: &Config,
    ) -> Result<Flow> {
        match repr {
            Repr::Rrq { filename, mode } => self.read_request(socket, filename, mode, config),
            Repr::Wrq { filename, mode } => self.write_request(socket, filename, mode, config),
            Repr::Data { block, data } => self.data(socket, block, data, config),
            Repr::Ack { block } => self.ack(socket, block, config),
            Repr::Error { code, msg } => {
                warn!("{}: peer aborted with {code}: {msg}", self.peer);
                Err(Error::Remote(code))
            }
        }
    }

    /// Resend the last DATA block after a timeout, rewinding the file by the
    /// size of that block. Only a sender retransmits; a receiver waits for
    /// the peer to resend.
    pub fn retransmit(&mut self, socket: &mut UdpSocket<'_>, config: &Config) -> Result<Flow> {
        if self.role != Role::Reading {
            return Ok(Flow::Ignored);
        }
        if let Some(len) = self.last_len.take() {
            self.file_mut()?.seek(SeekFrom::Current(-(len as i64)))?;
            self.last_block = self.last_block.wrapping_sub(1);
        }
        debug!(
            "{}: resending block {}",
            self.peer,
            self.last_block.wrapping_add(1)
        );
        self.send_data(socket, config)
    }

    fn require(&self, role: Role, opcode: Opcode) -> Result<()> {
        if self.role != role {
            warn!("{}: {opcode} while {:?}", self.peer, self.role);
            return Err(Error::Unexpected(opcode));
        }
        Ok(())
    }

    fn read_request(
        &mut self,
        socket: &mut UdpSocket<'_>,
        filename: &str,
        mode: &str,
        config: &Config,
    ) -> Result<Flow> {
        self.require(Role::Unset, Opcode::Rrq)?;
        let path = accept(filename, mode, config)?;
        info!("{}: read {}", self.peer, path.display());

        let file = File::open(&path)?;
        if file.metadata()?.is_dir() {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied).into());
        }
        self.file = Some(file);
        self.role = Role::Reading;
        self.send_data(socket, config)
    }

    fn write_request(
        &mut self,
        socket: &mut UdpSocket<'_>,
        filename: &str,
        mode: &str,
        config: &Config,
    ) -> Result<Flow> {
        self.require(Role::Unset, Opcode::Wrq)?;
        let path = accept(filename, mode, config)?;
        info!("{}: write {}", self.peer, path.display());

        // Never overwrite: creation fails if the file is already there.
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        self.file = Some(file);
        self.role = Role::Writing;
        send(socket, self.peer, &Repr::Ack { block: 0 })?;
        Ok(Flow::Progress)
    }

    fn data(
        &mut self,
        socket: &mut UdpSocket<'_>,
        block: u16,
        data: &[u8],
        config: &Config,
    ) -> Result<Flow> {
        self.require(Role::Writing, Opcode::Data)?;

        // Most likely a resend after our ACK got lost. Acknowledge what was
        // received so the sender can move on, but never write it twice.
        let expected = self.last_block.wrapping_add(1);
        if block != expected {
            debug!(
                "{}: got block {block}, expected {expected}; acknowledging and discarding",
                self.peer
            );
            send(socket, self.peer, &Repr::Ack { block })?;
            return Ok(Flow::Ignored);
        }

        if !data.is_empty() {
            self.file_mut()?.write_all(data)?;
        }
        send(socket, self.peer, &Repr::Ack { block })?;
        self.last_block = block;
        self.last_len = Some(data.len());

        if data.len() < config.block_size {
            info!("{}: received final block {block}", self.peer);
            return Ok(Flow::Complete);
        }
        Ok(Flow::Progress)
    }

    fn ack(&mut self, socket: &mut UdpSocket<'_>, block: u16, config: &Config) -> Result<Flow> {
        self.require(Role::Reading, Opcode::Ack)?;

        // Acting on a stale or forged ACK would let anyone who can guess the
        // transfer ID desynchronize the transfer.
        if block != self.last_block {
            debug!(
                "{}: ignoring ACK {block}, waiting for {}",
                self.peer, self.last_block
            );
            return Ok(Flow::Ignored);
        }
        self.send_data(socket, config)
    }

    fn send_data(&mut self, socket: &mut UdpSocket<'_>, config: &Config) -> Result<Flow> {
        let mut buf = heapless::Vec::<u8, MAX_DATA_SIZE>::new();
        buf.resize_default(config.block_size)
            .map_err(|_| Error::Config("block_size exceeds the largest DATA packet"))?;
        let len = read_block(self.file_mut()?, &mut buf)?;

        let block = self.last_block.wrapping_add(1);
        send(
            socket,
            self.peer,
            &Repr::Data {
                block,
                data: &buf[..len],
            },
        )?;
        debug!("{}: sent block {block} ({len} bytes)", self.peer);
        self.last_block = block;
        self.last_len = Some(len);

        if len < config.block_size {
            info!("{}: sent final block {block}", self.peer);
            return Ok(Flow::Complete);
        }
        Ok(Flow::Progress)
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no open file").into())
    }
}

/// Check the mode and confine the filename to the server root.
fn accept(filename: &str, mode: &str, config: &Config) -> Result<PathBuf> {
    if !mode.eq_ignore_ascii_case(OCTET) {
        warn!("refusing mode {mode:?}");
        return Err(Error::Mode);
    }
    sandbox(&config.root, filename)
}

/// Fill `buf` from the file, stopping early only at end of file.
fn read_block(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Queue one packet on `socket` for `peer`.
pub(crate) fn send(socket: &mut UdpSocket<'_>, peer: IpEndpoint, repr: &Repr<'_>) -> Result<()> {
    let buf = socket.send(repr.buffer_len(), peer)?;
    repr.emit(&mut Packet::new_unchecked(buf));
    Ok(())
}

/// Tell `peer` why its transfer is over, if the error is one we report.
/// A failure to send is only logged; the transfer ends either way.
pub(crate) fn report(socket: &mut UdpSocket<'_>, peer: IpEndpoint, err: &Error) {
    if let Some((code, msg)) = err.reply() {
        send_error(socket, peer, code, &msg);
    }
}

fn send_error(socket: &mut UdpSocket<'_>, peer: IpEndpoint, code: ErrorCode, msg: &str) {
    debug!("{peer}: sending error {code}: {msg}");
    if let Err(err) = send(socket, peer, &Repr::Error { code, msg }) {
        warn!("{peer}: could not send error: {err}");
    }
}
