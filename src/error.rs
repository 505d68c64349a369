use std::fmt::{self, Display};
use std::path::PathBuf;

/// A bitcaskrs result, with our [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors returned by this crate.
#[derive(Debug)]
pub enum Error {
    /// An entry could not be decoded from bytes: a truncated header, or a
    /// body shorter than the key/value sizes it declares.
    MalformedEntry(String),
    /// An append can't be satisfied by the target segment. Handled
    /// internally by the segment manager via rollover; never surfaced to a
    /// [`crate::store::Store`] caller.
    SegmentFull(u64),
    /// The keydir references a segment id the segment manager doesn't know
    /// about. Indicates the keydir has drifted from what's on disk.
    SegmentNotFound(u64),
    /// A segment log file was expected to exist but doesn't.
    NotFound(PathBuf),
    /// The store directory is already locked by another process.
    Locked(PathBuf),
    /// An underlying I/O failure, with the operation and path that failed.
    Io(String, std::io::Error),
    /// A hint or index sidecar failed to (de)serialize.
    Serialization(serde_json::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedEntry(msg) => write!(f, "malformed entry: {msg}"),
            Error::SegmentFull(id) => write!(f, "segment {id} is full"),
            Error::SegmentNotFound(id) => write!(f, "segment {id} not found"),
            Error::NotFound(path) => write!(f, "segment file not found: {}", path.display()),
            Error::Locked(path) => write!(f, "store directory already locked: {}", path.display()),
            Error::Io(op, err) => write!(f, "{op}: {err}"),
            Error::Serialization(err) => write!(f, "serialization error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(_, err) => Some(err),
            Error::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(String::new(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}

/// Attaches an operation description to an I/O error, so failures read as
/// e.g. "renaming segment_3.hint.tmp: permission denied" instead of a bare
/// `std::io::Error`.
pub(crate) trait IoContext<T> {
    fn context(self, op: impl Into<String>) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn context(self, op: impl Into<String>) -> Result<T> {
        self.map_err(|err| Error::Io(op.into(), err))
    }
}
