//! Collective communication layer used by the sharding engine.
//!
//! Provides:
//! - `CollectiveCommunicator`: blocking collectives over one process group
//! - `LocalCommunicator`: in-process transport (threads + barrier)
//! - `ProcessGroup`: a communicator bound to an ordered set of global ranks
//! - `DeviceMesh`: N-d logical arrangement of ranks and its sub-groups

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};

/// Trait for collective communications.
///
/// Calls block until every member of the group has joined. The sharding
/// engine never calls these on the compute thread; its communication
/// stream turns them into waitable handles.
pub trait CollectiveCommunicator: Send + Sync {
    /// Rank of this member within the group
    fn rank(&self) -> usize;

    /// Number of members in the group
    fn world_size(&self) -> usize;

    /// All-reduce: Sum tensor across all ranks and broadcast result.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// All-gather: Gather tensors from all ranks, concatenating along dim 0.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Broadcast: Send tensor from root rank to all others.
    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor>;

    /// Reduce-scatter: Sum across ranks, each rank keeps its dim-0 chunk.
    fn reduce_scatter(&self, tensor: &Tensor) -> Result<Tensor> {
        let world_size = self.world_size();
        let rows = tensor.dim(0)?;
        if rows % world_size != 0 {
            return Err(candle_core::Error::Msg(format!(
                "reduce_scatter input of {} rows is not divisible by {} ranks",
                rows, world_size
            )));
        }
        let reduced = self.all_reduce(tensor)?;
        let chunk_size = rows / world_size;
        reduced.narrow(0, self.rank() * chunk_size, chunk_size)
    }
}

pub mod backend;
pub mod groups;
pub mod mesh;

pub use backend::LocalCommunicator;
pub use groups::{build_local_process_groups, run_local_ranks, ProcessGroup, RankContext};
pub use mesh::{DeviceMesh, MeshGroup, MeshGroupId};

/// Synchronize gradients across ranks using all-reduce.
///
/// Averages the gradient of every var in `vars` that has one.
/// All ranks must call this with vars in the same order.
pub fn synchronize_gradients(
    grads: &mut GradStore,
    vars: &[Var],
    communicator: &dyn CollectiveCommunicator,
) -> Result<()> {
    if communicator.world_size() == 1 {
        return Ok(());
    }

    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let summed = communicator.all_reduce(grad)?;
            let avg = (summed / communicator.world_size() as f64)?;
            grads.insert(var.as_tensor(), avg);
        }
    }
    Ok(())
}

/// Reduce a scalar value across all ranks.
pub fn all_reduce_scalar(value: f64, communicator: &dyn CollectiveCommunicator) -> Result<f64> {
    if communicator.world_size() == 1 {
        return Ok(value);
    }

    let tensor = Tensor::new(&[value as f32], &candle_core::Device::Cpu)?;
    let reduced = communicator.all_reduce(&tensor)?;
    let result = reduced.to_vec1::<f32>()?[0] as f64;
    Ok(result / communicator.world_size() as f64)
}
