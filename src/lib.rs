//! Fully sharded data-parallel training on candle.
//!
//! - `distributed`: device mesh, process groups and in-process collectives
//! - `fsdp`: parameter sharding, communication scheduling and the `FullyShard` engine
//! - `model`: small MLP models in sharded and replicated form
//! - `training`: sharded-versus-replicated training runs
//! - `utils`: configuration, errors, logging and metrics

pub mod distributed;
pub mod fsdp;
pub mod model;
pub mod training;
pub mod utils;
