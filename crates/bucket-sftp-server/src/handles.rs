//! Per-session handle table.
//!
//! Handles are opaque to the client: four big-endian bytes naming a slot in
//! this table. Numbers are allocated from a counter and never reused within
//! a session, so a stale handle can only ever miss.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{SftpError, SftpResult};
use crate::files::{ReadFeed, WriteSink};

/// A handle number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Wire form: four bytes, big-endian.
    pub fn to_wire(self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    /// Parse the wire form. Anything but exactly four bytes is not a handle.
    pub fn from_wire(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = raw.try_into().ok()?;
        Some(Handle(u32::from_be_bytes(bytes)))
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an open handle refers to.
#[derive(Debug)]
pub enum OpenRecord {
    File(OpenFile),
    Directory(OpenDirectory),
}

impl OpenRecord {
    /// Normalized path the record was opened with.
    pub fn path(&self) -> &str {
        match self {
            OpenRecord::File(file) => &file.path,
            OpenRecord::Directory(dir) => &dir.path,
        }
    }
}

#[derive(Debug)]
pub struct OpenFile {
    pub path: String,
    pub mode: FileMode,
}

/// A file is open for exactly one direction.
#[derive(Debug)]
pub enum FileMode {
    Read(ReadFeed),
    Write(WriteSink),
}

#[derive(Debug)]
pub struct OpenDirectory {
    pub path: String,
    /// The single listing page has been returned.
    pub read_complete: bool,
}

/// Arena of open records keyed by handle.
#[derive(Debug, Default)]
pub struct HandleTable {
    next: u64,
    entries: HashMap<Handle, OpenRecord>,
}

/// The table as shared between a session's in-flight requests.
///
/// The lock is only ever taken for synchronous sections.
pub type SharedHandles = Arc<Mutex<HandleTable>>;

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record under a fresh handle.
    pub fn allocate(&mut self, record: OpenRecord) -> SftpResult<Handle> {
        let index = u32::try_from(self.next).map_err(|_| SftpError::HandlesExhausted)?;
        self.next += 1;
        let handle = Handle(index);
        self.entries.insert(handle, record);
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&OpenRecord> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut OpenRecord> {
        self.entries.get_mut(&handle)
    }

    /// Look up by wire bytes, failing with `HandleNotFound`.
    pub fn lookup(&self, raw: &[u8]) -> SftpResult<&OpenRecord> {
        Handle::from_wire(raw)
            .and_then(|handle| self.get(handle))
            .ok_or(SftpError::HandleNotFound)
    }

    pub fn lookup_mut(&mut self, raw: &[u8]) -> SftpResult<(Handle, &mut OpenRecord)> {
        let handle = Handle::from_wire(raw).ok_or(SftpError::HandleNotFound)?;
        let record = self.get_mut(handle).ok_or(SftpError::HandleNotFound)?;
        Ok((handle, record))
    }

    /// Remove a record, returning it.
    pub fn release(&mut self, handle: Handle) -> Option<OpenRecord> {
        self.entries.remove(&handle)
    }

    /// Drop every record. Returns how many were open.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
