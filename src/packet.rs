//! TFTP Protocol (Revision 2)
//! from https://datatracker.ietf.org/doc/html/rfc1350
//!
//! Only the binary (`octet`) mode is served and options (RFC 2347) are never
//! negotiated, so request trailers past the mode string are ignored.

use core::fmt::{self, Write};
use core::str;

use crate::error::{Error, Result};

/// The max number of bytes sent at a time.
pub const DATA_SIZE: usize = 512;

/// The largest block size a server can be configured with. A DATA packet of
/// this size still fits a 1500 byte MTU over IPv6.
pub const MAX_DATA_SIZE: usize = 1428;

/// Opcode plus block number or error code.
pub const META_SIZE: usize = 4;

/// A full DATA packet at the default block size.
pub const PACKET_SIZE: usize = META_SIZE + DATA_SIZE;

/// Capacity of a locally generated ERROR message.
pub const MSG_SIZE: usize = 128;

/// The only transfer mode accepted in a request.
pub const OCTET: &str = "octet";

enum_with_unknown! {
    /// The five TFTP packet types. 2 bytes in length.
    pub enum Opcode(u16) {
        /// Read request (RRQ)
        Rrq = 0x1,
        /// Write request (WRQ)
        Wrq = 0x2,
        /// Data (DATA)
        Data = 0x3,
        /// Acknowledgement (ACK)
        Ack = 0x4,
        /// Error (ERROR)
        Error = 0x5
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Opcode::Rrq => f.write_str("RRQ"),
            Opcode::Wrq => f.write_str("WRQ"),
            Opcode::Data => f.write_str("DATA"),
            Opcode::Ack => f.write_str("ACK"),
            Opcode::Error => f.write_str("ERROR"),
            Opcode::Unknown(op) => write!(f, "opcode {op}"),
        }
    }
}

enum_with_unknown! {
    /// Error codes carried by an ERROR packet.
    pub enum ErrorCode(u16) {
        /// Not defined, see error message.
        NotDefined = 0,
        FileNotFound = 1,
        AccessViolation = 2,
        /// Disk full or allocation exceeded.
        DiskFull = 3,
        IllegalOperation = 4,
        UnknownTransferId = 5,
        FileAlreadyExists = 6,
        NoSuchUser = 7
    }
}

impl ErrorCode {
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined | ErrorCode::Unknown(_) => "Undefined error",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), u16::from(*self))
    }
}

mod field {
    use core::ops::{Range, RangeFrom};

    pub const OPCODE: Range<usize> = 0..2;
    pub const REQUEST: RangeFrom<usize> = 2..;
    pub const BLOCK: Range<usize> = 2..4;
    pub const CODE: Range<usize> = 2..4;
    pub const PAYLOAD: RangeFrom<usize> = 4..;
}

/// A read/write wrapper around a TFTP packet buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with TFTP packet structure.
    pub const fn new_unchecked(buffer: T) -> Self {
        Packet { buffer }
    }

    /// Shorthand for [`Packet::new_checked_with`] at the default block size.
    pub fn new_checked(buffer: T) -> Result<Self> {
        Self::new_checked_with(buffer, DATA_SIZE)
    }

    /// Wrap a buffer after checking that it is a TFTP packet carrying at
    /// most `max_data` bytes of payload.
    pub fn new_checked_with(buffer: T, max_data: usize) -> Result<Self> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len(max_data)?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    ///
    /// Returns `Err(Error::Length)` if the buffer is shorter than the fixed
    /// header or longer than the header plus `max_data`, and
    /// `Err(Error::Opcode)` for an opcode outside the five packet types.
    pub fn check_len(&self, max_data: usize) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len > META_SIZE + max_data {
            return Err(Error::Length(len));
        }
        self.check_header()
    }

    fn check_header(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < META_SIZE {
            return Err(Error::Length(len));
        }
        match self.opcode() {
            Opcode::Ack if len != META_SIZE => Err(Error::Length(len)),
            Opcode::Unknown(op) => Err(Error::Opcode(op)),
            _ => Ok(()),
        }
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the type of the packet.
    pub fn opcode(&self) -> Opcode {
        read_be_u16(&self.buffer.as_ref()[field::OPCODE]).into()
    }

    /// Return the block number of a DATA or ACK packet.
    pub fn block(&self) -> u16 {
        read_be_u16(&self.buffer.as_ref()[field::BLOCK])
    }

    /// Return the error code of an ERROR packet.
    pub fn error_code(&self) -> ErrorCode {
        read_be_u16(&self.buffer.as_ref()[field::CODE]).into()
    }

    /// Return the payload of a DATA packet.
    pub fn data(&self) -> &[u8] {
        &self.buffer.as_ref()[field::PAYLOAD]
    }

    /// Return the filename of a request.
    ///
    /// Fails if the packet is not a request, a field is missing its nul
    /// terminator, or the filename is not netascii.
    pub fn filename(&self) -> Result<&str> {
        self.request_fields().map(|(filename, _)| filename)
    }

    /// Return the transfer mode of a request.
    pub fn mode(&self) -> Result<&str> {
        self.request_fields().map(|(_, mode)| mode)
    }

    fn request_fields(&self) -> Result<(&str, &str)> {
        request_fields(self.buffer.as_ref())
    }

    /// Return the message of an ERROR packet, up to its terminator.
    ///
    /// Messages are informational only, so a missing terminator or invalid
    /// UTF-8 shortens the message rather than failing.
    pub fn error_msg(&self) -> &str {
        error_msg(self.buffer.as_ref())
    }
}

impl<T> Packet<T>
where
    T: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Set the type of the packet.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.buffer.as_mut()[field::OPCODE].copy_from_slice(&u16::from(opcode).to_be_bytes());
    }

    pub fn set_block(&mut self, block: u16) {
        self.buffer.as_mut()[field::BLOCK].copy_from_slice(&block.to_be_bytes());
    }

    pub fn set_error_code(&mut self, code: ErrorCode) {
        self.buffer.as_mut()[field::CODE].copy_from_slice(&u16::from(code).to_be_bytes());
    }

    /// Write `filename\0mode\0` after the opcode.
    pub fn set_request(&mut self, filename: &str, mode: &str) {
        let body = &mut self.buffer.as_mut()[field::REQUEST];
        let (name, rest) = body.split_at_mut(filename.len());
        name.copy_from_slice(filename.as_bytes());
        rest[0] = 0;
        rest[1..1 + mode.len()].copy_from_slice(mode.as_bytes());
        rest[1 + mode.len()] = 0;
    }

    /// Write a nul terminated message after the error code.
    pub fn set_error_msg(&mut self, msg: &str) {
        let payload = self.data_mut();
        payload[..msg.len()].copy_from_slice(msg.as_bytes());
        payload[msg.len()] = 0;
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[field::PAYLOAD]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// A high-level representation of a TFTP packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Repr<'a> {
    Rrq { filename: &'a str, mode: &'a str },
    Wrq { filename: &'a str, mode: &'a str },
    // data field of data may only be one block in length.
    Data { block: u16, data: &'a [u8] },
    Ack { block: u16 },
    Error { code: ErrorCode, msg: &'a str },
}

impl<'a> Repr<'a> {
    /// Parse a TFTP packet into a high-level representation.
    ///
    /// Only the header is checked here; the payload bound depends on the
    /// configured block size and is enforced by [`Packet::check_len`].
    pub fn parse<T>(packet: &Packet<&'a T>) -> Result<Self>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_header()?;
        let buf: &'a [u8] = T::as_ref(packet.buffer);
        match packet.opcode() {
            Opcode::Rrq => {
                let (filename, mode) = request_fields(buf)?;
                Ok(Repr::Rrq { filename, mode })
            }
            Opcode::Wrq => {
                let (filename, mode) = request_fields(buf)?;
                Ok(Repr::Wrq { filename, mode })
            }
            Opcode::Data => Ok(Repr::Data {
                block: packet.block(),
                data: &buf[field::PAYLOAD],
            }),
            Opcode::Ack => Ok(Repr::Ack {
                block: packet.block(),
            }),
            Opcode::Error => Ok(Repr::Error {
                code: packet.error_code(),
                msg: error_msg(buf),
            }),
            Opcode::Unknown(op) => Err(Error::Opcode(op)),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Repr::Rrq { .. } => Opcode::Rrq,
            Repr::Wrq { .. } => Opcode::Wrq,
            Repr::Data { .. } => Opcode::Data,
            Repr::Ack { .. } => Opcode::Ack,
            Repr::Error { .. } => Opcode::Error,
        }
    }

    /// Return the length of a packet that will be emitted from this
    /// high-level representation.
    pub fn buffer_len(&self) -> usize {
        match *self {
            Repr::Rrq { filename, mode } | Repr::Wrq { filename, mode } => {
                2 + filename.len() + 1 + mode.len() + 1
            }
            Repr::Data { data, .. } => META_SIZE + data.len(),
            Repr::Ack { .. } => META_SIZE,
            Repr::Error { msg, .. } => META_SIZE + msg.len() + 1,
        }
    }

    /// Emit a high-level representation into a TFTP packet. The packet must
    /// be at least [`Repr::buffer_len`] bytes long.
    pub fn emit<T>(&self, packet: &mut Packet<T>)
    where
        T: AsRef<[u8]> + AsMut<[u8]>,
    {
        packet.set_opcode(self.opcode());
        match *self {
            Repr::Rrq { filename, mode } | Repr::Wrq { filename, mode } => {
                packet.set_request(filename, mode);
            }
            Repr::Data { block, data } => {
                packet.set_block(block);
                packet.data_mut()[..data.len()].copy_from_slice(data);
            }
            Repr::Ack { block } => packet.set_block(block),
            Repr::Error { code, msg } => {
                packet.set_error_code(code);
                packet.set_error_msg(msg);
            }
        }
    }
}

/// Check and parse one received datagram carrying at most `max_data` bytes
/// of payload.
pub fn decode(datagram: &[u8], max_data: usize) -> Result<Repr<'_>> {
    let packet = Packet::new_checked_with(datagram, max_data)?;
    Repr::parse(&packet)
}

/// A bounded ERROR message built without allocating.
pub type Message = heapless::String<MSG_SIZE>;

/// Format an ERROR message, cutting it at [`MSG_SIZE`] bytes. Nul bytes are
/// dropped since they would end the message on the wire.
pub fn message(args: fmt::Arguments<'_>) -> Message {
    let mut msg = Message::new();
    // Running out of room only truncates.
    let _ = Truncating(&mut msg).write_fmt(args);
    msg
}

struct Truncating<'a>(&'a mut Message);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars().filter(|&c| c != '\0') {
            self.0.push(c).map_err(|_| fmt::Error)?;
        }
        Ok(())
    }
}

fn request_fields(buf: &[u8]) -> Result<(&str, &str)> {
    match Opcode::from(read_be_u16(&buf[field::OPCODE])) {
        Opcode::Rrq | Opcode::Wrq => {}
        _ => return Err(Error::Malformed),
    }
    let (filename, rest) = split_nul(&buf[field::REQUEST]).ok_or(Error::Malformed)?;
    let (mode, _options) = split_nul(rest).ok_or(Error::Malformed)?;
    if filename.is_empty() || mode.is_empty() {
        return Err(Error::Malformed);
    }
    Ok((netascii_from_u8(filename)?, netascii_from_u8(mode)?))
}

// Messages are informational only, so a missing terminator or invalid
// UTF-8 shortens the message rather than failing.
fn error_msg(buf: &[u8]) -> &str {
    let payload = &buf[field::PAYLOAD];
    let msg = &payload[..memchr(payload, 0).unwrap_or(payload.len())];
    match str::from_utf8(msg) {
        Ok(msg) => msg,
        Err(e) => str::from_utf8(&msg[..e.valid_up_to()]).unwrap_or_default(),
    }
}

fn read_be_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Split off the bytes before the first nul, dropping the nul itself.
fn split_nul(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = memchr(buf, 0)?;
    Some((&buf[..end], &buf[end + 1..]))
}

/// Converts a slice of bytes into a netascii string slice.
///
/// netascii, as defined in RFC 764, is a 8 bit extension of the printable
/// ascii characters and eight other control characters. A carriage return
/// must be followed by a line feed or a nul. One trailing nul is allowed and
/// is not part of the returned string.
pub fn netascii_from_u8(v: &[u8]) -> Result<&str> {
    let body = match v.split_last() {
        Some((&0, rest)) => rest,
        _ => v,
    };
    let mut cr = false;
    for &b in body {
        match b {
            b'\n' | b'\0' if cr => cr = false,
            _ if cr => return Err(Error::Malformed),
            b'\r' => cr = true,
            b' '..=b'~' | b'\x07'..=b'\x0c' => {}
            _ => return Err(Error::Malformed),
        }
    }
    if cr {
        return Err(Error::Malformed);
    }
    str::from_utf8(body).map_err(|_| Error::Malformed)
}

fn memchr<T>(buf: &[T], needle: T) -> Option<usize>
where
    T: core::cmp::PartialEq + core::marker::Copy,
{
    buf.iter().position(|&b| b == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_read_request() {
        let bytes = b"\x00\x01report.txt\x00octet\x00";
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.opcode(), Opcode::Rrq);
        assert_eq!(
            Repr::parse(&packet).unwrap(),
            Repr::Rrq {
                filename: "report.txt",
                mode: "octet"
            }
        );
    }

    #[test]
    fn request_trailer_is_ignored() {
        let bytes = b"\x00\x02a.bin\x00octet\x00blksize\x001024\x00";
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.filename().unwrap(), "a.bin");
        assert_eq!(packet.mode().unwrap(), "octet");
    }

    #[test]
    fn request_without_terminators_is_malformed() {
        let missing_mode = b"\x00\x01report.txt\x00octet";
        let packet = Packet::new_checked(&missing_mode[..]).unwrap();
        assert!(matches!(Repr::parse(&packet), Err(Error::Malformed)));

        let empty_name = b"\x00\x01\x00octet\x00";
        let packet = Packet::new_checked(&empty_name[..]).unwrap();
        assert!(matches!(Repr::parse(&packet), Err(Error::Malformed)));
    }

    #[test]
    fn length_bounds() {
        assert!(matches!(
            Packet::new_checked(&[0u8, 4, 0][..]),
            Err(Error::Length(3))
        ));

        let mut big = [0u8; PACKET_SIZE + 1];
        big[1] = 3;
        assert!(matches!(
            Packet::new_checked(&big[..]),
            Err(Error::Length(517))
        ));
        assert!(Packet::new_checked(&big[..PACKET_SIZE]).is_ok());
        assert!(Packet::new_checked_with(&big[..], DATA_SIZE + 1).is_ok());
    }

    #[test]
    fn ack_carries_no_payload() {
        assert!(Packet::new_checked(&[0u8, 4, 0, 1][..]).is_ok());
        assert!(matches!(
            Packet::new_checked(&[0u8, 4, 0, 1, 9][..]),
            Err(Error::Length(5))
        ));
    }

    #[test]
    fn unknown_opcode() {
        assert!(matches!(
            Packet::new_checked(&[0u8, 9, 0, 1][..]),
            Err(Error::Opcode(9))
        ));
        assert_eq!(Opcode::from(6), Opcode::Unknown(6));
    }

    #[test]
    fn emit_data() {
        let repr = Repr::Data {
            block: 0xfffe,
            data: b"hello",
        };
        let mut buf = [0u8; 9];
        repr.emit(&mut Packet::new_unchecked(&mut buf[..]));
        assert_eq!(&buf, b"\x00\x03\xff\xfehello");
        assert_eq!(repr.buffer_len(), buf.len());
    }

    #[test]
    fn emit_error_terminates_message() {
        let repr = Repr::Error {
            code: ErrorCode::UnknownTransferId,
            msg: "Unknown transfer ID",
        };
        let mut buf = [0xffu8; 24];
        repr.emit(&mut Packet::new_unchecked(&mut buf[..]));
        assert_eq!(&buf, b"\x00\x05\x00\x05Unknown transfer ID\x00");

        let packet = Packet::new_checked(&buf[..]).unwrap();
        assert_eq!(
            Repr::parse(&packet).unwrap(),
            Repr::Error {
                code: ErrorCode::UnknownTransferId,
                msg: "Unknown transfer ID"
            }
        );
    }

    #[test]
    fn error_message_without_terminator() {
        let packet = Packet::new_checked(&b"\x00\x05\x00\x01gone"[..]).unwrap();
        assert_eq!(packet.error_code(), ErrorCode::FileNotFound);
        assert_eq!(packet.error_msg(), "gone");
    }

    #[test]
    fn message_is_truncated() {
        let long = [b'x'; MSG_SIZE * 2];
        let msg = message(format_args!("{}", str::from_utf8(&long).unwrap()));
        assert_eq!(msg.len(), MSG_SIZE);

        let msg = message(format_args!("a\0b"));
        assert_eq!(msg.as_str(), "ab");
    }
}
