//! Process groups bound to mesh sub-groups.
//!
//! Groups are built explicitly from a `DeviceMesh` and handed to whoever
//! needs them; there is no process-wide registry. For in-process runs,
//! `run_local_ranks` starts one thread per rank with its groups already
//! wired through `LocalCommunicator`s.

use super::backend::LocalCommunicator;
use super::mesh::{DeviceMesh, MeshGroupId};
use super::CollectiveCommunicator;
use crate::utils::error::{FsdpError, Result};
use std::sync::Arc;
use std::thread;
use tracing::{info, info_span};

/// Process group handle
#[derive(Clone)]
pub struct ProcessGroup {
    /// Communicator for this group
    pub communicator: Arc<dyn CollectiveCommunicator>,
    /// Global ranks in this group, indexed by local rank
    pub ranks: Vec<usize>,
    /// Size of this group
    pub size: usize,
}

impl ProcessGroup {
    pub fn new(communicator: Arc<dyn CollectiveCommunicator>, ranks: Vec<usize>) -> Self {
        let size = ranks.len();
        Self { communicator, ranks, size }
    }

    /// Get local rank within this group
    pub fn local_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }

    /// Local rank of the member holding this handle
    pub fn rank(&self) -> usize {
        self.communicator.rank()
    }

    /// Single-member group, used when a mesh dimension has extent 1.
    pub fn solo(global_rank: usize) -> Result<Self> {
        let comm = LocalCommunicator::new_group(1)
            .pop()
            .ok_or_else(|| FsdpError::Config("empty local group".to_string()))?;
        Ok(Self::new(Arc::new(comm), vec![global_rank]))
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("ranks", &self.ranks)
            .field("size", &self.size)
            .finish()
    }
}

/// Build in-process communicators for every sub-group of every mesh dimension.
///
/// Returns `groups[i][dim]`: the process group along `dim` for the i-th rank
/// of `mesh.ranks()`.
pub fn build_local_process_groups(mesh: &DeviceMesh) -> Result<Vec<Vec<ProcessGroup>>> {
    let mut per_rank: Vec<Vec<ProcessGroup>> = vec![Vec::with_capacity(mesh.ndim()); mesh.size()];

    for dim in 0..mesh.ndim() {
        for group in mesh.sub_groups(dim)? {
            let comms = LocalCommunicator::new_group(group.size());
            for (comm, &global_rank) in comms.into_iter().zip(&group.ranks) {
                let slot = mesh
                    .ranks()
                    .iter()
                    .position(|&r| r == global_rank)
                    .ok_or_else(|| {
                        FsdpError::Config(format!("rank {} missing from mesh", global_rank))
                    })?;
                per_rank[slot].push(ProcessGroup::new(Arc::new(comm), group.ranks.clone()));
            }
        }
    }

    Ok(per_rank)
}

/// Everything one rank thread needs to join the run.
pub struct RankContext {
    pub rank: usize,
    pub mesh: Arc<DeviceMesh>,
    /// Process group per mesh dimension
    pub groups: Vec<ProcessGroup>,
}

impl RankContext {
    pub fn group(&self, dim: usize) -> Result<&ProcessGroup> {
        self.groups.get(dim).ok_or_else(|| {
            FsdpError::InvalidMeshShape(format!("no process group for mesh dimension {}", dim))
        })
    }

    pub fn group_id(&self, dim: usize) -> Result<MeshGroupId> {
        Ok(self.mesh.sub_group(dim, self.rank)?.id)
    }
}

/// Run `f` once per mesh rank, each on its own named thread, and collect the
/// results in rank order.
///
/// Every rank must issue the same collectives in the same order; a rank that
/// bails out early leaves its peers waiting on the barrier.
pub fn run_local_ranks<T, E, F>(mesh: Arc<DeviceMesh>, f: F) -> std::result::Result<Vec<T>, E>
where
    T: Send,
    E: Send + From<FsdpError>,
    F: Fn(RankContext) -> std::result::Result<T, E> + Sync,
{
    let groups = build_local_process_groups(&mesh).map_err(E::from)?;
    info!(world_size = mesh.size(), shape = ?mesh.shape(), "Launching local ranks");

    thread::scope(|scope| {
        let f = &f;
        let handles = mesh
            .ranks()
            .iter()
            .copied()
            .zip(groups)
            .map(|(rank, groups)| {
                let ctx = RankContext {
                    rank,
                    mesh: mesh.clone(),
                    groups,
                };
                thread::Builder::new()
                    .name(format!("rank-{}", rank))
                    .spawn_scoped(scope, move || {
                        let _span = info_span!("rank", rank).entered();
                        f(ctx)
                    })
                    .map_err(FsdpError::from)
            })
            .collect::<Result<Vec<_>>>()
            .map_err(E::from)?;

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().map_err(|_| {
                    E::from(FsdpError::comm_failure(
                        "join",
                        format!("rank {} thread panicked", rank),
                    ))
                })?
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn test_local_groups_follow_mesh() -> Result<()> {
        let mesh = DeviceMesh::new(vec![0, 1, 2, 3], vec![2, 2])?;
        let groups = build_local_process_groups(&mesh)?;

        assert_eq!(groups.len(), 4);
        assert_eq!(groups[3][0].ranks, vec![1, 3]);
        assert_eq!(groups[3][0].rank(), 1);
        assert_eq!(groups[3][1].ranks, vec![2, 3]);
        assert_eq!(groups[2][1].local_rank(2), Some(0));
        Ok(())
    }

    #[test]
    fn test_run_local_ranks_sub_group_collectives() -> Result<()> {
        let mesh = Arc::new(DeviceMesh::new(vec![0, 1, 2, 3], vec![2, 2])?);
        let sums = run_local_ranks(mesh, |ctx| -> Result<f32> {
            let t = Tensor::new(&[ctx.rank as f32], &Device::Cpu)?;
            let row = ctx.group(1)?.communicator.all_reduce(&t)?;
            Ok(row.to_vec1::<f32>()?[0])
        })?;
        // rows are {0,1} and {2,3}
        assert_eq!(sums, vec![1.0, 1.0, 5.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_solo_group() -> Result<()> {
        let pg = ProcessGroup::solo(7)?;
        assert_eq!(pg.size, 1);
        assert_eq!(pg.local_rank(7), Some(0));
        Ok(())
    }
}
