//! SFTP version 3 wire protocol.
//!
//! Packets are `u32 length | u8 type | body`, big-endian throughout, with
//! strings as `u32 length | bytes`. [`SftpCodec`] frames the server side of
//! a channel (requests in, responses out); [`SftpClientCodec`] is its mirror
//! image and exists for driving a server in tests and tools.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::MAX_PACKET_LEN;

// Packet type bytes (draft-ietf-secsh-filexfer-02).
const SSH_FXP_INIT: u8 = 1;
const SSH_FXP_VERSION: u8 = 2;
const SSH_FXP_OPEN: u8 = 3;
const SSH_FXP_CLOSE: u8 = 4;
const SSH_FXP_READ: u8 = 5;
const SSH_FXP_WRITE: u8 = 6;
const SSH_FXP_LSTAT: u8 = 7;
const SSH_FXP_FSTAT: u8 = 8;
const SSH_FXP_SETSTAT: u8 = 9;
const SSH_FXP_FSETSTAT: u8 = 10;
const SSH_FXP_OPENDIR: u8 = 11;
const SSH_FXP_READDIR: u8 = 12;
const SSH_FXP_REMOVE: u8 = 13;
const SSH_FXP_MKDIR: u8 = 14;
const SSH_FXP_RMDIR: u8 = 15;
const SSH_FXP_REALPATH: u8 = 16;
const SSH_FXP_STAT: u8 = 17;
const SSH_FXP_RENAME: u8 = 18;
const SSH_FXP_READLINK: u8 = 19;
const SSH_FXP_SYMLINK: u8 = 20;
const SSH_FXP_STATUS: u8 = 101;
const SSH_FXP_HANDLE: u8 = 102;
const SSH_FXP_DATA: u8 = 103;
const SSH_FXP_NAME: u8 = 104;
const SSH_FXP_ATTRS: u8 = 105;
const SSH_FXP_EXTENDED: u8 = 200;

const ATTR_SIZE: u32 = 0x0000_0001;
const ATTR_UIDGID: u32 = 0x0000_0002;
const ATTR_PERMISSIONS: u32 = 0x0000_0004;
const ATTR_ACMODTIME: u32 = 0x0000_0008;
const ATTR_EXTENDED: u32 = 0x8000_0000;

/// Wire protocol errors. Any of these ends the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet truncated")]
    Truncated,

    #[error("packet of {0} bytes exceeds limit")]
    PacketTooLarge(usize),

    #[error("unexpected packet type {0}")]
    UnexpectedType(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// SFTP v3 status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl StatusCode {
    fn from_u32(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Eof,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            _ => Self::Failure,
        }
    }

    /// Default message text for the code.
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation unsupported",
        }
    }
}

/// `pflags` of an OPEN request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    pub const APPEND: u32 = 0x04;
    pub const CREATE: u32 = 0x08;
    pub const TRUNCATE: u32 = 0x10;
    pub const EXCLUSIVE: u32 = 0x20;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn read(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

/// File attributes. Absent fields are omitted from the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    /// `(atime, mtime)` in seconds since the epoch.
    pub times: Option<(u32, u32)>,
}

impl FileAttributes {
    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= ATTR_SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= ATTR_PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= ATTR_ACMODTIME;
        }
        flags
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.flags());
        if let Some(size) = self.size {
            dst.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            dst.put_u32(uid);
            dst.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            dst.put_u32(permissions);
        }
        if let Some((atime, mtime)) = self.times {
            dst.put_u32(atime);
            dst.put_u32(mtime);
        }
    }

    fn decode(src: &mut WireReader) -> Result<Self, ProtocolError> {
        let flags = src.u32()?;
        let mut attrs = Self::default();
        if flags & ATTR_SIZE != 0 {
            attrs.size = Some(src.u64()?);
        }
        if flags & ATTR_UIDGID != 0 {
            attrs.uid_gid = Some((src.u32()?, src.u32()?));
        }
        if flags & ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(src.u32()?);
        }
        if flags & ATTR_ACMODTIME != 0 {
            attrs.times = Some((src.u32()?, src.u32()?));
        }
        if flags & ATTR_EXTENDED != 0 {
            for _ in 0..src.u32()? {
                src.bytes()?;
                src.bytes()?;
            }
        }
        Ok(attrs)
    }
}

/// One row of a NAME response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttributes,
}

/// Packets sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Init { version: u32 },
    Request(Request),
}

/// A request carrying an id that its response will echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u32,
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Open { path: String, flags: OpenFlags, attrs: FileAttributes },
    Close { handle: Bytes },
    Read { handle: Bytes, offset: u64, len: u32 },
    Write { handle: Bytes, offset: u64, data: Bytes },
    Lstat { path: String },
    Fstat { handle: Bytes },
    SetStat { path: String, attrs: FileAttributes },
    FSetStat { handle: Bytes, attrs: FileAttributes },
    OpenDir { path: String },
    ReadDir { handle: Bytes },
    Remove { path: String },
    Mkdir { path: String, attrs: FileAttributes },
    Rmdir { path: String },
    RealPath { path: String },
    Stat { path: String },
    Rename { from: String, to: String },
    ReadLink { path: String },
    Symlink { link_path: String, target: String },
    Extended { name: String, data: Bytes },
    /// A packet type this server does not know.
    Unknown { kind: u8 },
    /// A known request carrying a path that is not valid UTF-8.
    InvalidPath { kind: u8 },
}

impl Operation {
    /// Span name for the operation.
    pub fn span_name(&self) -> &'static str {
        match self {
            Operation::Open { .. } => "sftp.open",
            Operation::Close { .. } => "sftp.close",
            Operation::Read { .. } => "sftp.read",
            Operation::Write { .. } => "sftp.write",
            Operation::Lstat { .. } => "sftp.lstat",
            Operation::Fstat { .. } => "sftp.fstat",
            Operation::SetStat { .. } => "sftp.setstat",
            Operation::FSetStat { .. } => "sftp.fsetstat",
            Operation::OpenDir { .. } => "sftp.opendir",
            Operation::ReadDir { .. } => "sftp.readdir",
            Operation::Remove { .. } => "sftp.remove",
            Operation::Mkdir { .. } => "sftp.mkdir",
            Operation::Rmdir { .. } => "sftp.rmdir",
            Operation::RealPath { .. } => "sftp.realpath",
            Operation::Stat { .. } => "sftp.stat",
            Operation::Rename { .. } => "sftp.rename",
            Operation::ReadLink { .. } => "sftp.readlink",
            Operation::Symlink { .. } => "sftp.symlink",
            Operation::Extended { .. } => "sftp.extended",
            Operation::Unknown { .. } => "sftp.unknown",
            Operation::InvalidPath { .. } => "sftp.invalid_path",
        }
    }
}

/// Packets sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version { version: u32, extensions: Vec<(String, String)> },
    Status { id: u32, code: StatusCode, message: String },
    Handle { id: u32, handle: Bytes },
    Data { id: u32, data: Bytes },
    Name { id: u32, entries: Vec<NameEntry> },
    Attrs { id: u32, attrs: FileAttributes },
}

impl Response {
    /// STATUS with the code's default message.
    pub fn status(id: u32, code: StatusCode) -> Self {
        Response::Status { id, code, message: code.message().to_string() }
    }

    pub fn ok(id: u32) -> Self {
        Self::status(id, StatusCode::Ok)
    }

    /// Request id echoed by the response, if any.
    pub fn id(&self) -> Option<u32> {
        match self {
            Response::Version { .. } => None,
            Response::Status { id, .. }
            | Response::Handle { id, .. }
            | Response::Data { id, .. }
            | Response::Name { id, .. }
            | Response::Attrs { id, .. } => Some(*id),
        }
    }
}

// ============================================================================
// Field readers and writers
// ============================================================================

struct WireReader {
    buf: Bytes,
}

impl WireReader {
    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Truncated)
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn has_remaining(&self) -> bool {
        self.buf.has_remaining()
    }
}

fn put_bytes(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32(data.len() as u32);
    dst.put_slice(data);
}

/// Write one length-prefixed frame whose body is produced by `body`.
fn put_frame(dst: &mut BytesMut, body: impl FnOnce(&mut BytesMut)) {
    let start = dst.len();
    dst.put_u32(0);
    body(dst);
    let len = (dst.len() - start - 4) as u32;
    dst[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Split one frame body off `src`, or `None` if more input is needed.
fn take_frame(src: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>, ProtocolError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > max_len {
        return Err(ProtocolError::PacketTooLarge(len));
    }
    if len == 0 {
        return Err(ProtocolError::Truncated);
    }
    if src.len() < 4 + len {
        src.reserve(4 + len - src.len());
        return Ok(None);
    }
    src.advance(4);
    Ok(Some(src.split_to(len).freeze()))
}

// ============================================================================
// Client packets
// ============================================================================

impl ClientPacket {
    /// Decode one frame body.
    pub fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        let mut src = WireReader { buf: body };
        let kind = src.u8()?;
        if kind == SSH_FXP_INIT {
            // Extension pairs after the version are ignored
            return Ok(ClientPacket::Init { version: src.u32()? });
        }

        let id = src.u32()?;
        // Answered with FAILURE rather than mapped onto some other key
        let op = match decode_operation(kind, &mut src) {
            Err(ProtocolError::InvalidUtf8) => Operation::InvalidPath { kind },
            other => other?,
        };
        Ok(ClientPacket::Request(Request { id, op }))
    }

    /// Encode as a complete frame.
    pub fn encode(&self, dst: &mut BytesMut) {
        put_frame(dst, |dst| match self {
            ClientPacket::Init { version } => {
                dst.put_u8(SSH_FXP_INIT);
                dst.put_u32(*version);
            }
            ClientPacket::Request(Request { id, op }) => encode_operation(dst, *id, op),
        });
    }
}

fn decode_operation(kind: u8, src: &mut WireReader) -> Result<Operation, ProtocolError> {
    Ok(match kind {
        SSH_FXP_OPEN => Operation::Open {
            path: src.string()?,
            flags: OpenFlags(src.u32()?),
            attrs: FileAttributes::decode(src)?,
        },
        SSH_FXP_CLOSE => Operation::Close { handle: src.bytes()? },
        SSH_FXP_READ => Operation::Read {
            handle: src.bytes()?,
            offset: src.u64()?,
            len: src.u32()?,
        },
        SSH_FXP_WRITE => Operation::Write {
            handle: src.bytes()?,
            offset: src.u64()?,
            data: src.bytes()?,
        },
        SSH_FXP_LSTAT => Operation::Lstat { path: src.string()? },
        SSH_FXP_FSTAT => Operation::Fstat { handle: src.bytes()? },
        SSH_FXP_SETSTAT => Operation::SetStat {
            path: src.string()?,
            attrs: FileAttributes::decode(src)?,
        },
        SSH_FXP_FSETSTAT => Operation::FSetStat {
            handle: src.bytes()?,
            attrs: FileAttributes::decode(src)?,
        },
        SSH_FXP_OPENDIR => Operation::OpenDir { path: src.string()? },
        SSH_FXP_READDIR => Operation::ReadDir { handle: src.bytes()? },
        SSH_FXP_REMOVE => Operation::Remove { path: src.string()? },
        SSH_FXP_MKDIR => Operation::Mkdir {
            path: src.string()?,
            // Some clients omit the attrs entirely
            attrs: if src.has_remaining() {
                FileAttributes::decode(src)?
            } else {
                FileAttributes::default()
            },
        },
        SSH_FXP_RMDIR => Operation::Rmdir { path: src.string()? },
        SSH_FXP_REALPATH => Operation::RealPath { path: src.string()? },
        SSH_FXP_STAT => Operation::Stat { path: src.string()? },
        SSH_FXP_RENAME => Operation::Rename {
            from: src.string()?,
            to: src.string()?,
        },
        SSH_FXP_READLINK => Operation::ReadLink { path: src.string()? },
        SSH_FXP_SYMLINK => Operation::Symlink {
            link_path: src.string()?,
            target: src.string()?,
        },
        SSH_FXP_EXTENDED => Operation::Extended {
            name: src.string()?,
            data: src.buf.split_off(0),
        },
        kind => Operation::Unknown { kind },
    })
}

fn encode_operation(dst: &mut BytesMut, id: u32, op: &Operation) {
    let kind = match op {
        Operation::Open { .. } => SSH_FXP_OPEN,
        Operation::Close { .. } => SSH_FXP_CLOSE,
        Operation::Read { .. } => SSH_FXP_READ,
        Operation::Write { .. } => SSH_FXP_WRITE,
        Operation::Lstat { .. } => SSH_FXP_LSTAT,
        Operation::Fstat { .. } => SSH_FXP_FSTAT,
        Operation::SetStat { .. } => SSH_FXP_SETSTAT,
        Operation::FSetStat { .. } => SSH_FXP_FSETSTAT,
        Operation::OpenDir { .. } => SSH_FXP_OPENDIR,
        Operation::ReadDir { .. } => SSH_FXP_READDIR,
        Operation::Remove { .. } => SSH_FXP_REMOVE,
        Operation::Mkdir { .. } => SSH_FXP_MKDIR,
        Operation::Rmdir { .. } => SSH_FXP_RMDIR,
        Operation::RealPath { .. } => SSH_FXP_REALPATH,
        Operation::Stat { .. } => SSH_FXP_STAT,
        Operation::Rename { .. } => SSH_FXP_RENAME,
        Operation::ReadLink { .. } => SSH_FXP_READLINK,
        Operation::Symlink { .. } => SSH_FXP_SYMLINK,
        Operation::Extended { .. } => SSH_FXP_EXTENDED,
        Operation::Unknown { kind } | Operation::InvalidPath { kind } => *kind,
    };
    dst.put_u8(kind);
    dst.put_u32(id);

    match op {
        Operation::Open { path, flags, attrs } => {
            put_bytes(dst, path.as_bytes());
            dst.put_u32(flags.0);
            attrs.encode(dst);
        }
        Operation::Close { handle }
        | Operation::Fstat { handle }
        | Operation::ReadDir { handle } => put_bytes(dst, handle),
        Operation::Read { handle, offset, len } => {
            put_bytes(dst, handle);
            dst.put_u64(*offset);
            dst.put_u32(*len);
        }
        Operation::Write { handle, offset, data } => {
            put_bytes(dst, handle);
            dst.put_u64(*offset);
            put_bytes(dst, data);
        }
        Operation::Lstat { path }
        | Operation::OpenDir { path }
        | Operation::Remove { path }
        | Operation::Rmdir { path }
        | Operation::RealPath { path }
        | Operation::Stat { path }
        | Operation::ReadLink { path } => put_bytes(dst, path.as_bytes()),
        Operation::SetStat { path, attrs } | Operation::Mkdir { path, attrs } => {
            put_bytes(dst, path.as_bytes());
            attrs.encode(dst);
        }
        Operation::FSetStat { handle, attrs } => {
            put_bytes(dst, handle);
            attrs.encode(dst);
        }
        Operation::Rename { from: a, to: b }
        | Operation::Symlink { link_path: a, target: b } => {
            put_bytes(dst, a.as_bytes());
            put_bytes(dst, b.as_bytes());
        }
        Operation::Extended { name, data } => {
            put_bytes(dst, name.as_bytes());
            dst.put_slice(data);
        }
        Operation::Unknown { .. } | Operation::InvalidPath { .. } => {}
    }
}

// ============================================================================
// Server packets
// ============================================================================

impl Response {
    /// Encode as a complete frame.
    pub fn encode(&self, dst: &mut BytesMut) {
        put_frame(dst, |dst| match self {
            Response::Version { version, extensions } => {
                dst.put_u8(SSH_FXP_VERSION);
                dst.put_u32(*version);
                for (name, data) in extensions {
                    put_bytes(dst, name.as_bytes());
                    put_bytes(dst, data.as_bytes());
                }
            }
            Response::Status { id, code, message } => {
                dst.put_u8(SSH_FXP_STATUS);
                dst.put_u32(*id);
                dst.put_u32(*code as u32);
                put_bytes(dst, message.as_bytes());
                // language tag
                put_bytes(dst, b"");
            }
            Response::Handle { id, handle } => {
                dst.put_u8(SSH_FXP_HANDLE);
                dst.put_u32(*id);
                put_bytes(dst, handle);
            }
            Response::Data { id, data } => {
                dst.put_u8(SSH_FXP_DATA);
                dst.put_u32(*id);
                put_bytes(dst, data);
            }
            Response::Name { id, entries } => {
                dst.put_u8(SSH_FXP_NAME);
                dst.put_u32(*id);
                dst.put_u32(entries.len() as u32);
                for entry in entries {
                    put_bytes(dst, entry.filename.as_bytes());
                    put_bytes(dst, entry.longname.as_bytes());
                    entry.attrs.encode(dst);
                }
            }
            Response::Attrs { id, attrs } => {
                dst.put_u8(SSH_FXP_ATTRS);
                dst.put_u32(*id);
                attrs.encode(dst);
            }
        });
    }

    /// Decode one frame body.
    pub fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        let mut src = WireReader { buf: body };
        let kind = src.u8()?;
        if kind == SSH_FXP_VERSION {
            let version = src.u32()?;
            let mut extensions = Vec::new();
            while src.has_remaining() {
                extensions.push((src.string()?, src.string()?));
            }
            return Ok(Response::Version { version, extensions });
        }

        let id = src.u32()?;
        Ok(match kind {
            SSH_FXP_STATUS => {
                let code = StatusCode::from_u32(src.u32()?);
                let message = if src.has_remaining() { src.string()? } else { String::new() };
                Response::Status { id, code, message }
            }
            SSH_FXP_HANDLE => Response::Handle { id, handle: src.bytes()? },
            SSH_FXP_DATA => Response::Data { id, data: src.bytes()? },
            SSH_FXP_NAME => {
                let count = src.u32()?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    entries.push(NameEntry {
                        filename: src.string()?,
                        longname: src.string()?,
                        attrs: FileAttributes::decode(&mut src)?,
                    });
                }
                Response::Name { id, entries }
            }
            SSH_FXP_ATTRS => Response::Attrs { id, attrs: FileAttributes::decode(&mut src)? },
            other => return Err(ProtocolError::UnexpectedType(other)),
        })
    }
}

// ============================================================================
// Codecs
// ============================================================================

/// Server-side framing: decodes [`ClientPacket`]s, encodes [`Response`]s.
#[derive(Debug, Clone)]
pub struct SftpCodec {
    max_len: usize,
}

impl Default for SftpCodec {
    fn default() -> Self {
        Self { max_len: MAX_PACKET_LEN }
    }
}

impl Decoder for SftpCodec {
    type Item = ClientPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        take_frame(src, self.max_len)?.map(ClientPacket::decode).transpose()
    }
}

impl Encoder<Response> for SftpCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Client-side framing: decodes [`Response`]s, encodes [`ClientPacket`]s.
#[derive(Debug, Clone)]
pub struct SftpClientCodec {
    max_len: usize,
}

impl Default for SftpClientCodec {
    fn default() -> Self {
        // Directory pages can exceed the request limit
        Self { max_len: 16 * MAX_PACKET_LEN }
    }
}

impl Decoder for SftpClientCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        take_frame(src, self.max_len)?.map(Response::decode).transpose()
    }
}

impl Encoder<ClientPacket> for SftpClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ClientPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(packet: &ClientPacket) -> BytesMut {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        buf
    }

    #[test]
    fn test_decode_read_request_bytes() {
        // READ id=7 handle=[0,0,0,1] offset=5 len=10
        let mut raw = BytesMut::new();
        raw.put_u32(1 + 4 + 4 + 4 + 8 + 4);
        raw.put_u8(5);
        raw.put_u32(7);
        raw.put_u32(4);
        raw.put_slice(&[0, 0, 0, 1]);
        raw.put_u64(5);
        raw.put_u32(10);

        let packet = SftpCodec::default().decode(&mut raw).unwrap().unwrap();
        assert_eq!(
            packet,
            ClientPacket::Request(Request {
                id: 7,
                op: Operation::Read {
                    handle: Bytes::from_static(&[0, 0, 0, 1]),
                    offset: 5,
                    len: 10,
                },
            })
        );
        assert!(raw.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let full = frame_of(&ClientPacket::Init { version: 3 });
        let mut codec = SftpCodec::default();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(ClientPacket::Init { version: 3 })
        );
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32((MAX_PACKET_LEN + 1) as u32);
        assert!(matches!(
            SftpCodec::default().decode(&mut raw),
            Err(ProtocolError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_truncated_body_is_error() {
        let mut raw = BytesMut::new();
        raw.put_u32(3);
        raw.put_u8(SSH_FXP_STAT);
        raw.put_u16(0);
        assert!(matches!(
            SftpCodec::default().decode(&mut raw),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_unknown_type_keeps_id() {
        let mut raw = BytesMut::new();
        raw.put_u32(5);
        raw.put_u8(42);
        raw.put_u32(99);
        let packet = SftpCodec::default().decode(&mut raw).unwrap().unwrap();
        assert_eq!(
            packet,
            ClientPacket::Request(Request { id: 99, op: Operation::Unknown { kind: 42 } })
        );
    }

    #[test]
    fn test_non_utf8_path_keeps_id() {
        // STAT id=4 path=[0x66, 0xff]
        let mut raw = BytesMut::new();
        raw.put_u32(1 + 4 + 4 + 2);
        raw.put_u8(SSH_FXP_STAT);
        raw.put_u32(4);
        raw.put_u32(2);
        raw.put_slice(&[0x66, 0xff]);
        let packet = SftpCodec::default().decode(&mut raw).unwrap().unwrap();
        assert_eq!(
            packet,
            ClientPacket::Request(Request {
                id: 4,
                op: Operation::InvalidPath { kind: SSH_FXP_STAT },
            })
        );
        assert!(raw.is_empty());
    }

    #[test]
    fn test_status_wire_layout() {
        let mut buf = BytesMut::new();
        Response::status(3, StatusCode::Eof).encode(&mut buf);
        let expected_body_len = 1 + 4 + 4 + (4 + "End of file".len()) + 4;
        assert_eq!(&buf[..4], &(expected_body_len as u32).to_be_bytes());
        assert_eq!(buf[4], SSH_FXP_STATUS);
        assert_eq!(&buf[9..13], &1u32.to_be_bytes());
    }

    #[test]
    fn test_attrs_flags_follow_fields() {
        let attrs = FileAttributes {
            size: Some(10),
            permissions: Some(0o100777),
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        attrs.encode(&mut buf);
        assert_eq!(&buf[..4], &(ATTR_SIZE | ATTR_PERMISSIONS).to_be_bytes());
        assert_eq!(buf.len(), 4 + 8 + 4);
    }

    #[test]
    fn test_client_codec_reads_name() {
        let response = Response::Name {
            id: 1,
            entries: vec![NameEntry {
                filename: "a".into(),
                longname: "-rw-rw-rw- 1 none none 1 x a".into(),
                attrs: FileAttributes { size: Some(1), ..Default::default() },
            }],
        };
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(SftpClientCodec::default().decode(&mut buf).unwrap(), Some(response));
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE);
        assert!(flags.write());
        assert!(!flags.read());
        assert!(flags.contains(OpenFlags::CREATE));
    }
}
