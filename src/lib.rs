//! A replicated write-ahead log with deterministic state-machine replay.

pub mod wal;
