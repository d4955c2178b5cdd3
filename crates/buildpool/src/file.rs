//! File objects and their byte contents.
//!
//! A [`File`] is the unit of work a processor receives and produces. Its
//! contents come in two flavors with different boundary behavior:
//!
//! - [`Contents::Owned`] exclusively owns its buffer. When the file is sent
//!   to a worker the vector moves across the boundary without copying and
//!   the sender is left holding an empty (length 0) buffer.
//! - [`Contents::Shared`] is a view into reference-counted storage. It is
//!   copied on send; the sender's view and the underlying storage stay
//!   intact, and nothing the receiver does is visible through them.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::value::Value;

// ── Contents ──────────────────────────────────────────────────────────────────

/// Byte contents of a [`File`].
#[derive(Clone)]
pub enum Contents {
    /// An exclusively-owned buffer. Transferred by ownership on send.
    Owned(Vec<u8>),
    /// A view of `len` bytes at `offset` into shared storage. Copied on send.
    Shared {
        buf: Arc<Vec<u8>>,
        offset: usize,
        len: usize,
    },
}

impl Contents {
    /// Owned contents from any byte source.
    pub fn owned(bytes: impl Into<Vec<u8>>) -> Contents {
        Contents::Owned(bytes.into())
    }

    /// A view into shared storage.
    ///
    /// # Panics
    ///
    /// Panics if the view extends past the end of `buf`.
    pub fn shared(buf: Arc<Vec<u8>>, offset: usize, len: usize) -> Contents {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= buf.len()),
            "shared view out of bounds: offset {offset} + len {len} > buffer {}",
            buf.len()
        );
        Contents::Shared { buf, offset, len }
    }

    pub fn len(&self) -> usize {
        match self {
            Contents::Owned(bytes) => bytes.len(),
            Contents::Shared { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Contents::Owned(bytes) => bytes,
            Contents::Shared { buf, offset, len } => &buf[*offset..*offset + *len],
        }
    }

    /// Mutable access to the bytes.
    ///
    /// A shared view detaches into an owned copy first, so mutations never
    /// reach the shared storage.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if matches!(self, Contents::Shared { .. }) {
            *self = Contents::Owned(self.as_slice().to_vec());
        }
        match self {
            Contents::Owned(bytes) => bytes,
            Contents::Shared { .. } => unreachable!("shared contents detached above"),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Produces the representation that crosses the worker boundary.
    ///
    /// Owned buffers are taken: the vector itself moves and `self` is left
    /// as an empty owned buffer. Shared views are copied and `self` is
    /// untouched.
    pub(crate) fn take_for_transport(&mut self) -> Contents {
        match self {
            Contents::Owned(bytes) => Contents::Owned(mem::take(bytes)),
            Contents::Shared { .. } => Contents::Owned(self.as_slice().to_vec()),
        }
    }
}

impl PartialEq for Contents {
    fn eq(&self, other: &Contents) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for Contents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contents::Owned(bytes) => write!(f, "Contents::Owned({} bytes)", bytes.len()),
            Contents::Shared { buf, offset, len } => write!(
                f,
                "Contents::Shared({len} bytes at {offset} of {})",
                buf.len()
            ),
        }
    }
}

impl From<Vec<u8>> for Contents {
    fn from(bytes: Vec<u8>) -> Contents {
        Contents::Owned(bytes)
    }
}

impl From<&[u8]> for Contents {
    fn from(bytes: &[u8]) -> Contents {
        Contents::Owned(bytes.to_vec())
    }
}

impl From<&str> for Contents {
    fn from(text: &str) -> Contents {
        Contents::Owned(text.as_bytes().to_vec())
    }
}

// ── File ──────────────────────────────────────────────────────────────────────

/// An addressable content unit.
///
/// Files are detached copies on the worker side: a processor may mutate the
/// file it receives freely and yield it back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct File {
    /// Output-relative path. Required; validated when a plugin yields the file.
    pub path: String,
    /// Origin URL, informational.
    pub source: Option<String>,
    pub created_at: Option<SystemTime>,
    pub modified_at: Option<SystemTime>,
    /// Plugin-defined structured data.
    pub metadata: Value,
    pub contents: Option<Contents>,
}

impl File {
    pub fn new(path: impl Into<String>) -> File {
        File {
            path: path.into(),
            ..File::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> File {
        self.set_text(text);
        self
    }

    pub fn with_contents(mut self, contents: impl Into<Contents>) -> File {
        self.contents = Some(contents.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> File {
        self.metadata = metadata;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> File {
        self.source = Some(source.into());
        self
    }

    /// The contents decoded as UTF-8 (lossy). Empty when there are none.
    pub fn text(&self) -> String {
        match &self.contents {
            Some(contents) => String::from_utf8_lossy(contents.as_slice()).into_owned(),
            None => String::new(),
        }
    }

    /// Replaces the contents with UTF-8 text in a fresh owned buffer.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.contents = Some(Contents::Owned(text.into().into_bytes()));
    }

    /// A copy of this file without its contents. Change records and other
    /// metadata-only transports use this.
    pub fn without_contents(&self) -> File {
        File {
            contents: None,
            ..self.clone()
        }
    }

    /// The shallow copy that crosses the worker boundary.
    ///
    /// Owned contents transfer (this file keeps an empty buffer); shared
    /// views are copied (this file keeps its view). Metadata nodes are
    /// immutable and move by handle.
    pub fn take_for_transport(&mut self) -> File {
        File {
            path: self.path.clone(),
            source: self.source.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            metadata: self.metadata.clone(),
            contents: self.contents.as_mut().map(Contents::take_for_transport),
        }
    }
}

/// Validates a plugin-produced file before it is streamed back.
///
/// The only hard requirement is a non-empty path.
pub fn normalize_output(file: File) -> Result<File, PoolError> {
    if file.path.trim().is_empty() {
        return Err(PoolError::InvalidFile(format!(
            "Invalid output file: {:?}",
            file.path
        )));
    }
    Ok(file)
}

// ── Changed files ─────────────────────────────────────────────────────────────

/// How a file changed since the previous build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A file plus its change kind. Change records carry metadata only, so the
/// contents are stripped before transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedFile {
    pub file: File,
    pub change: ChangeKind,
}

impl ChangedFile {
    pub fn new(file: File, change: ChangeKind) -> ChangedFile {
        ChangedFile { file, change }
    }

    pub(crate) fn without_contents(&self) -> ChangedFile {
        ChangedFile {
            file: self.file.without_contents(),
            change: self.change,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
