//! Leader/follower replication over gRPC. See `SPEC_FULL.md` §4.6/§4.7.

pub mod follower;
pub mod leader;

pub mod pb {
    tonic::include_proto!("wal.v1");
}

pub use follower::{Follower, FollowerOptions};
pub use leader::{serve, ColdLogOpener, LeaderOptions, ReplicatorService};
