//! Stream Callbacks
//!
//! Adapts an arbitrary byte stream into the read/seek callback pair a native
//! decoder pulls from. Errors never cross the callback boundary: they are
//! logged and reported through the callback's return value.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

/// A readable, seekable byte source
pub trait ByteStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> ByteStream for T {}

/// Seek origin for [`StreamCallbacks::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// Relative to the start
    Begin,
    /// Relative to the current position
    Current,
    /// Relative to the end
    End,
    /// Query the total size without moving
    Size,
}

/// Outcome of a read callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes copied into the buffer (zero after an error)
    Bytes(usize),
    /// The stream is exhausted
    EndOfStream,
}

/// Read/seek callbacks over an owned byte stream
pub struct StreamCallbacks {
    stream: Box<dyn ByteStream>,
}

impl StreamCallbacks {
    /// Wrap a stream
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        Self { stream }
    }

    /// Wrap an in-memory buffer
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(Box::new(io::Cursor::new(bytes)))
    }

    /// Read into `buf`
    pub fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => ReadOutcome::EndOfStream,
            Ok(n) => ReadOutcome::Bytes(n),
            Err(e) => {
                log::error!("Stream read failed: {}", e);
                ReadOutcome::Bytes(0)
            }
        }
    }

    /// Seek and return the new position, or the total size for [`SeekOrigin::Size`].
    /// Returns `None` on failure.
    pub fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Option<u64> {
        let result = match origin {
            SeekOrigin::Size => self.size(),
            SeekOrigin::Begin => match u64::try_from(offset) {
                Ok(start) => self.stream.seek(SeekFrom::Start(start)),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "negative absolute seek",
                )),
            },
            SeekOrigin::Current => self.stream.seek(SeekFrom::Current(offset)),
            SeekOrigin::End => self.stream.seek(SeekFrom::End(offset)),
        };

        match result {
            Ok(position) => Some(position),
            Err(e) => {
                log::error!("Stream seek ({:?}, {}) failed: {}", origin, offset, e);
                None
            }
        }
    }

    fn size(&mut self) -> io::Result<u64> {
        let position = self.stream.stream_position()?;
        let size = self.stream.seek(SeekFrom::End(0))?;
        self.stream.seek(SeekFrom::Start(position))?;
        Ok(size)
    }

    /// View the callbacks as a plain `Read + Seek` source for decoders
    pub fn into_reader(self) -> CallbackReader {
        CallbackReader { callbacks: self }
    }
}

impl fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallbacks").finish_non_exhaustive()
    }
}

/// `Read + Seek` implemented purely in terms of [`StreamCallbacks`]
pub struct CallbackReader {
    callbacks: StreamCallbacks,
}

impl Read for CallbackReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.callbacks.read(buf) {
            ReadOutcome::Bytes(n) => Ok(n),
            ReadOutcome::EndOfStream => Ok(0),
        }
    }
}

impl Seek for CallbackReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, origin) = match pos {
            SeekFrom::Start(start) => (
                i64::try_from(start).map_err(|_| io::Error::other("seek offset overflow"))?,
                SeekOrigin::Begin,
            ),
            SeekFrom::Current(offset) => (offset, SeekOrigin::Current),
            SeekFrom::End(offset) => (offset, SeekOrigin::End),
        };

        self.callbacks
            .seek(offset, origin)
            .ok_or_else(|| io::Error::other("stream seek failed"))
    }
}
