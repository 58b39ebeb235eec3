//! A replicated write-ahead log with deterministic state-machine replay.
//!
//! Four pieces make up the core (`SPEC_FULL.md` §1): the segmented
//! [`log`] itself, the [`state`] coordinator that serializes writes and waits
//! for their replay, the [`framing`] that multiplexes logical streams through
//! one physical log, and [`replication`], which streams a leader's log to
//! followers. Everything else (`state::crud`, `metrics`) is an external
//! collaborator built on top of that core.

pub mod codec;
pub mod error;
pub mod framing;
pub mod log;
pub mod metrics;
pub mod notify;
pub mod reader;
pub mod replication;
pub mod segment;
pub mod segment_cursor;
pub mod segment_writer;
pub mod state;
pub mod varint;

pub use codec::{Codec, JsonCodec};
pub use error::{Error, Result};
pub use framing::{match_any, match_stream, pack, unpack};
pub use log::{Data, Entry, Log, LogOptions, WriteMetrics};
pub use reader::Reader;
pub use state::compose::{ComposedStateMachine, SubState};
pub use state::crud::{Crud, CrudHandle, WithId};
pub use state::{State, StateMachine};
