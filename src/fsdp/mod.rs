//! Fully sharded data parallelism.
//!
//! Parameters are partitioned across a mesh sub-group and only gathered in
//! full while a group computes:
//! - `shard`: how one tensor is split and reassembled
//! - `param_group`: per-group unshard/reshard state machine and gradient accumulators
//! - `scheduler`: communication stream, collective handles and delay hooks
//! - `root_sync`: outstanding handles and deferred work of one invocation
//! - `coordinator`: the `FullyShard` engine driving forward and backward
//! - `inputs`: moving forward inputs onto the engine device

pub mod coordinator;
pub mod inputs;
pub mod param_group;
pub mod root_sync;
pub mod scheduler;
pub mod shard;

pub use coordinator::{ComputeHooks, FsdpStats, FullyShard, ShardedModule};
pub use inputs::ToDevice;
pub use param_group::{
    GradAccumulator, GroupId, GroupState, ParamGroup, ParamSpec, ShardedParam, UnshardStatus,
};
pub use root_sync::{DeferredTask, RootSync};
pub use scheduler::{CollectiveKind, CommHandle, CommHooks, CommScheduler, DelayHook};
pub use shard::ShardDescriptor;
