use std::fmt;

/// Error kinds surfaced by the log, reader, state coordinator and replication layer.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Corrupt(&'static str),
    UnsupportedVersion(u32),
    /// read/write attempted after `close`.
    LogClosed,
    /// read beyond `last_index` on the hot path; internal, drives the reader's wait state.
    NotFound,
    /// a blocking wait was cancelled.
    Cancelled,
    /// underlying segment store write failed. The log remains usable.
    WriteFailure(String),
    /// underlying fsync failed. The log remains usable.
    FsyncFailure(String),
    /// a composed sub-state does not own this record. Caught by the composer, never surfaced.
    SkipApply,
    /// no sub-state claimed a replayed record.
    FsmNotFound,
    /// a pending future was cancelled because the coordinator is closing.
    Shutdown,
    /// a packed stream name exceeded 255 bytes.
    FrameTooLarge,
    /// the leader was asked to replay an index that has since aged out of the in-memory cache.
    ReplicationLagOverflow,
    /// `write_entry`/`write_batch` received an index that was not `last_index + 1`.
    IndexGap { expected: u64, got: u64 },
    /// a CRUD-style mutation referenced an id that is already present.
    AlreadyExists,
    /// a CRUD-style mutation referenced an id that is not present.
    NotFoundItem,
    /// the coordinator's mutator surface was used before the coordinator finished construction.
    MutatorNotInitialized,
    Transport(String),
    Codec(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::UnsupportedVersion(v) => write!(f, "unsupported segment version: {v}"),
            Error::LogClosed => write!(f, "log closed"),
            Error::NotFound => write!(f, "index not found"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::WriteFailure(msg) => write!(f, "write failure: {msg}"),
            Error::FsyncFailure(msg) => write!(f, "fsync failure: {msg}"),
            Error::SkipApply => write!(f, "skip apply"),
            Error::FsmNotFound => write!(f, "no state machine claimed this record"),
            Error::Shutdown => write!(f, "coordinator shutting down"),
            Error::FrameTooLarge => write!(f, "framed stream name exceeds 255 bytes"),
            Error::ReplicationLagOverflow => write!(f, "requested index aged out of cache"),
            Error::IndexGap { expected, got } => {
                write!(f, "index gap: expected {expected}, got {got}")
            }
            Error::AlreadyExists => write!(f, "already exists"),
            Error::NotFoundItem => write!(f, "not found"),
            Error::MutatorNotInitialized => write!(f, "mutator not initialized"),
            Error::Transport(msg) => write!(f, "transport error: {msg}"),
            Error::Codec(msg) => write!(f, "codec error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
