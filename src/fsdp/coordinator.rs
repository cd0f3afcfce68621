//! Forward/backward coordination across parameter groups.
//!
//! `FullyShard` owns every group of one rank in an arena and drives them
//! through the compute hooks. The root of an invocation is whichever module
//! the caller handed to `forward`; everything reached from inside it is
//! non-root. Root-ness comes from the call stack depth only.
//!
//! candle's autograd has no per-node hooks, so backward goes through
//! `FullyShard::backward`: it runs the tape once, then fires the
//! post-backward hook of every group that took part in the forward, in
//! reverse order of forward completion, and finally drains the root sync.

use super::inputs::ToDevice;
use super::param_group::{GroupId, GroupState, ParamGroup, ParamSpec, UnshardStatus};
use super::root_sync::{DeferredTask, RootSync};
use super::scheduler::{CommHooks, CommScheduler};
use crate::distributed::{DeviceMesh, ProcessGroup, RankContext};
use crate::utils::config::EngineConfig;
use crate::utils::error::{FsdpError, Result};
use crate::utils::metrics;
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Capability every sharded computation unit is driven through.
pub trait ComputeHooks {
    /// Runs before the unit reads its parameters.
    fn pre_compute(&mut self, group: GroupId) -> Result<()>;
    /// Runs after the unit's last parameter read in this invocation.
    fn post_compute(&mut self, group: GroupId) -> Result<()>;
}

/// A computation unit whose parameters live in one parameter group.
///
/// `forward` reads its parameters through `fsdp.params(self.group())` and
/// calls child units through `fsdp.forward`.
pub trait ShardedModule {
    type Input: ToDevice;

    fn group(&self) -> GroupId;

    fn forward(&self, fsdp: &mut FullyShard, input: Self::Input) -> Result<Tensor>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsdpStats {
    pub root_forwards: u64,
    pub backwards: u64,
    pub all_gathers: u64,
    pub reduce_scatters: u64,
    pub prefetches: u64,
    pub root_finalizes: u64,
    /// Most non-ancestor groups (with params) unsharded at once
    pub max_concurrent_unsharded: usize,
    /// Most bytes of full parameter views kept alive for backward after
    /// their groups were resharded
    pub peak_backward_retained_bytes: usize,
}

pub struct FullyShard {
    config: EngineConfig,
    mesh: Arc<DeviceMesh>,
    rank: usize,
    device: Device,
    process_groups: Vec<ProcessGroup>,

    groups: Vec<ParamGroup>,
    sched: CommScheduler,
    root_sync: RootSync,

    call_stack: Vec<GroupId>,
    grad_mode: bool,
    forward_order: Vec<GroupId>,
    prev_forward_order: Vec<GroupId>,
    backward_pending: Vec<GroupId>,
    /// Non-root groups past their post-compute whose reference is still held.
    lazy_reshard: Vec<GroupId>,
    /// Pre-compute count per group in the current and previous root invocation.
    visits: Vec<usize>,
    prev_visits: Vec<usize>,
    stats: FsdpStats,
}

impl FullyShard {
    /// `process_groups[d]` must be this rank's group along mesh dimension `d`.
    pub fn new(
        config: EngineConfig,
        mesh: Arc<DeviceMesh>,
        rank: usize,
        process_groups: Vec<ProcessGroup>,
    ) -> Result<Self> {
        if mesh.coords(rank).is_none() {
            return Err(FsdpError::Config(format!("rank {} is not part of the mesh", rank)));
        }
        if process_groups.len() != mesh.ndim() {
            return Err(FsdpError::InvalidMeshShape(format!(
                "{} process groups for a {}-d mesh",
                process_groups.len(),
                mesh.ndim()
            )));
        }
        for (dim, pg) in process_groups.iter().enumerate() {
            let expected = mesh.sub_group(dim, rank)?;
            if pg.ranks != expected.ranks {
                return Err(FsdpError::InvalidMeshShape(format!(
                    "process group {:?} on dim {} does not match mesh sub-group {:?}",
                    pg.ranks, dim, expected.ranks
                )));
            }
        }
        if config.shard_mesh_dim >= mesh.ndim() {
            return Err(FsdpError::Config(format!(
                "shard_mesh_dim {} out of range for mesh shape {:?}",
                config.shard_mesh_dim,
                mesh.shape()
            )));
        }

        let device = config.device()?;
        let sched = CommScheduler::new(rank)?;
        debug!(rank, device = ?device, prefetch = config.forward_prefetch, "engine ready");

        Ok(Self {
            config,
            mesh,
            rank,
            device,
            process_groups,
            groups: Vec::new(),
            sched,
            root_sync: RootSync::new(),
            call_stack: Vec::new(),
            grad_mode: true,
            forward_order: Vec::new(),
            prev_forward_order: Vec::new(),
            backward_pending: Vec::new(),
            lazy_reshard: Vec::new(),
            visits: Vec::new(),
            prev_visits: Vec::new(),
            stats: FsdpStats::default(),
        })
    }

    pub fn from_context(config: EngineConfig, ctx: RankContext) -> Result<Self> {
        Self::new(config, ctx.mesh, ctx.rank, ctx.groups)
    }

    pub fn set_comm_hooks(&mut self, hooks: CommHooks) {
        self.sched.set_hooks(hooks);
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mesh(&self) -> &Arc<DeviceMesh> {
        &self.mesh
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a parameter group sharded along the configured mesh dimension.
    pub fn register_group(
        &mut self,
        name: impl Into<String>,
        params: Vec<ParamSpec>,
        parent: Option<GroupId>,
    ) -> Result<GroupId> {
        let dim = self.config.shard_mesh_dim;
        self.register_group_on(name, params, parent, dim)
    }

    /// Register a parameter group sharded along mesh dimension `mesh_dim`.
    pub fn register_group_on(
        &mut self,
        name: impl Into<String>,
        params: Vec<ParamSpec>,
        parent: Option<GroupId>,
        mesh_dim: usize,
    ) -> Result<GroupId> {
        if let Some(parent) = parent {
            if parent.0 >= self.groups.len() {
                return Err(FsdpError::Config(format!("parent group {} does not exist", parent)));
            }
        }
        let process_group = self
            .process_groups
            .get(mesh_dim)
            .ok_or_else(|| {
                FsdpError::InvalidMeshShape(format!(
                    "mesh dimension {} exceeds mesh shape {:?}",
                    mesh_dim,
                    self.mesh.shape()
                ))
            })?
            .clone();

        let id = GroupId(self.groups.len());
        let mut group = ParamGroup::new(
            id,
            name,
            parent,
            mesh_dim,
            process_group,
            params,
            self.config.shard_dim,
            self.rank,
            &self.device,
        )?;
        group.set_reshard_after_forward(self.config.reshard_after_forward);
        self.groups.push(group);
        self.visits.push(0);
        Ok(id)
    }

    fn index(&self, id: GroupId) -> Result<usize> {
        if id.0 < self.groups.len() {
            Ok(id.0)
        } else {
            Err(FsdpError::state_violation(id.to_string(), "unknown parameter group"))
        }
    }

    pub fn group(&self, id: GroupId) -> Result<&ParamGroup> {
        Ok(&self.groups[self.index(id)?])
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn group_state(&self, id: GroupId) -> Result<GroupState> {
        Ok(self.group(id)?.state())
    }

    /// Unsharded parameter views of a group, valid inside its forward.
    pub fn params(&self, id: GroupId) -> Result<Vec<Tensor>> {
        Ok(self.group(id)?.views()?.to_vec())
    }

    pub fn param(&self, id: GroupId, name: &str) -> Result<Tensor> {
        let group = self.group(id)?;
        let idx = group
            .params()
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| {
                FsdpError::Config(format!("group '{}' has no parameter '{}'", group.name(), name))
            })?;
        Ok(group.views()?[idx].clone())
    }

    /// Local shards of every grad-requiring parameter, for the optimizer.
    pub fn sharded_vars(&self) -> Vec<Var> {
        self.groups
            .iter()
            .flat_map(|g| g.params())
            .filter(|p| p.requires_grad())
            .map(|p| p.shard().clone())
            .collect()
    }

    /// Full values of a group's parameters, detached from autograd.
    pub fn full_parameters(&mut self, id: GroupId) -> Result<Vec<(String, Tensor)>> {
        let idx = self.index(id)?;
        let group = &mut self.groups[idx];
        let values = group.full_parameters(&mut self.sched)?;
        // Waited inline, nothing left for the root to track.
        let _ = group.take_issued();
        Ok(group
            .params()
            .iter()
            .map(|p| p.name().to_string())
            .zip(values)
            .collect())
    }

    pub fn zero_grad(&mut self, set_to_none: bool) -> Result<()> {
        for group in &mut self.groups {
            group.zero_grad(set_to_none)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> FsdpStats {
        FsdpStats {
            all_gathers: self.sched.all_gathers_issued(),
            reduce_scatters: self.sched.reduce_scatters_issued(),
            root_finalizes: self.root_sync.finalizes(),
            ..self.stats.clone()
        }
    }

    /// Run `module` with gradient tracking; pair with `backward`.
    pub fn forward<M: ShardedModule + ?Sized>(&mut self, module: &M, input: M::Input) -> Result<Tensor> {
        self.run_forward(module, input, true)
    }

    /// Run `module` without gradient tracking; every group ends sharded.
    pub fn forward_no_grad<M: ShardedModule + ?Sized>(
        &mut self,
        module: &M,
        input: M::Input,
    ) -> Result<Tensor> {
        self.run_forward(module, input, false)
    }

    fn run_forward<M: ShardedModule + ?Sized>(
        &mut self,
        module: &M,
        input: M::Input,
        grad: bool,
    ) -> Result<Tensor> {
        self.index(module.group())?;
        let is_root = self.call_stack.is_empty();

        let result = self.invoke(module, input, grad, is_root);
        if is_root {
            if let Err(e) = &result {
                warn!(rank = self.rank, error = %e, "forward failed, resharding every group");
                self.recover();
            }
        }
        result
    }

    fn invoke<M: ShardedModule + ?Sized>(
        &mut self,
        module: &M,
        input: M::Input,
        grad: bool,
        is_root: bool,
    ) -> Result<Tensor> {
        let id = module.group();
        let input = if is_root {
            self.root_pre_forward(grad)?;
            input.move_to_device(&self.device)?
        } else {
            input
        };

        self.pre_compute(id)?;
        self.call_stack.push(id);
        let output = module.forward(self, input);
        self.call_stack.pop();
        let output = output?;
        self.post_compute(id)?;

        if is_root {
            self.root_post_forward()?;
        }
        Ok(if self.grad_mode { output } else { output.detach() })
    }

    fn root_pre_forward(&mut self, grad: bool) -> Result<()> {
        if !self.backward_pending.is_empty() {
            warn!(
                rank = self.rank,
                groups = self.backward_pending.len(),
                "new forward before backward, dropping pending backward state"
            );
            self.discard_backward_state()?;
        }
        self.grad_mode = grad;
        self.forward_order.clear();
        self.visits.iter_mut().for_each(|v| *v = 0);
        self.stats.root_forwards += 1;
        Ok(())
    }

    fn root_post_forward(&mut self) -> Result<()> {
        self.release_lazy(true)?;
        // Order everything issued so far before the caller touches the output.
        self.sched.synchronize()?;

        for group in &mut self.groups {
            if group.is_unsharded() && group.refcount() == 0 {
                debug!(group = group.name(), "dropping unused prefetch");
                group.force_reshard()?;
            }
        }

        self.prev_forward_order = std::mem::take(&mut self.forward_order);
        self.prev_visits = self.visits.clone();
        if !self.grad_mode {
            self.root_sync.finalize(&mut self.groups)?;
        }
        self.record_unsharded();
        Ok(())
    }

    fn discard_backward_state(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.backward_pending) {
            let group = &mut self.groups[id.0];
            group.take_backward_views();
            for _ in 0..group.take_backward_holds() {
                group.request_reshard(&mut self.sched, None)?;
            }
        }
        self.root_sync.finalize(&mut self.groups)
    }

    /// Reset every group after a failed invocation. Further errors are only logged.
    fn recover(&mut self) {
        self.call_stack.clear();
        self.backward_pending.clear();
        self.lazy_reshard.clear();
        self.visits.iter_mut().for_each(|v| *v = 0);
        if let Err(e) = self.root_sync.finalize(&mut self.groups) {
            warn!(error = %e, "finalize during recovery failed");
        }
        for group in &mut self.groups {
            group.take_backward_views();
            if let Err(e) = group.force_reshard() {
                warn!(group = group.name(), error = %e, "reshard during recovery failed");
            }
        }
    }

    fn track_issued(&mut self, idx: usize) {
        let id = self.groups[idx].id();
        for (kind, seq) in self.groups[idx].take_issued() {
            self.root_sync.track(id, kind, seq);
        }
    }

    fn prefetch_after(&mut self, id: GroupId) -> Result<()> {
        let next = self
            .prev_forward_order
            .iter()
            .position(|&g| g == id)
            .and_then(|pos| self.prev_forward_order.get(pos + 1))
            .copied();
        let Some(next) = next else {
            return Ok(());
        };
        if next == id || self.call_stack.contains(&next) {
            return Ok(());
        }
        if self.groups[next.0].prefetch(&mut self.sched)? {
            self.stats.prefetches += 1;
            self.track_issued(next.0);
            trace!(current = %id, next = %next, "prefetched next group");
        }
        Ok(())
    }

    /// Drop the held reference of every lazily kept group, except those the
    /// previous invocation entered more often than this one has so far.
    fn release_lazy(&mut self, all: bool) -> Result<()> {
        for id in std::mem::take(&mut self.lazy_reshard) {
            let expected = self.prev_visits.get(id.0).copied().unwrap_or(0);
            if !all && expected > self.visits[id.0] {
                self.lazy_reshard.push(id);
                continue;
            }
            self.groups[id.0].request_reshard(&mut self.sched, None)?;
            self.track_issued(id.0);
        }
        Ok(())
    }

    fn unsharded_now(&self) -> (usize, usize) {
        self.groups
            .iter()
            .filter(|g| g.has_params() && g.is_unsharded())
            .filter(|g| !self.call_stack.contains(&g.id()))
            .fold((0, 0), |(n, bytes), g| (n + 1, bytes + g.unsharded_bytes()))
    }

    /// Bytes of recorded backward views whose group no longer holds them
    /// unsharded. candle's graph keeps these alive until backward runs.
    pub fn backward_retained_bytes(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| !g.is_unsharded())
            .map(|g| g.backward_view_bytes())
            .sum()
    }

    fn record_unsharded(&mut self) {
        let (count, bytes) = self.unsharded_now();
        metrics::record_unsharded(self.rank, count, bytes);
        let retained = self.backward_retained_bytes();
        self.stats.peak_backward_retained_bytes =
            self.stats.peak_backward_retained_bytes.max(retained);
        metrics::record_backward_retained(self.rank, retained);
    }

    /// Fire the post-backward hook of one group: collect its view gradients
    /// from the store and hand them to `request_reshard`.
    fn post_backward(&mut self, id: GroupId, grads: &mut GradStore) -> Result<()> {
        let idx = self.index(id)?;
        let group = &mut self.groups[idx];
        let views = group.take_backward_views();
        let holds = group.take_backward_holds();

        let mut per_param: Vec<Option<Tensor>> = vec![None; group.params().len()];
        for set in &views {
            for (slot, view) in per_param.iter_mut().zip(set) {
                if let Some(g) = grads.remove(view) {
                    *slot = Some(match slot.take() {
                        Some(acc) => (acc + g)?,
                        None => g,
                    });
                }
            }
        }

        if holds == 0 {
            group.reduce_gradients(&mut self.sched, per_param)?;
        } else {
            for _ in 1..holds {
                group.request_reshard(&mut self.sched, None)?;
            }
            group.request_reshard(&mut self.sched, Some(per_param))?;
        }
        trace!(group = group.name(), holds, state = group.state().as_str(), "post-backward");
        self.track_issued(idx);
        Ok(())
    }

    /// Backpropagate `loss`, reduce-scatter every participating group's
    /// gradients and wait for all of them.
    ///
    /// The returned store maps each sharded var to its reduced, sharded
    /// gradient, ready for `Optimizer::step`.
    pub fn backward(&mut self, loss: &Tensor) -> Result<GradStore> {
        if !self.call_stack.is_empty() {
            return Err(FsdpError::state_violation(
                self.call_stack[0].to_string(),
                "backward called inside a forward",
            ));
        }

        let mut grads = loss.backward()?;
        let pending = std::mem::take(&mut self.backward_pending);
        let mut first_err: Option<FsdpError> = None;
        for &id in pending.iter().rev() {
            if let Err(e) = self.post_backward(id, &mut grads) {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.root_sync.finalize(&mut self.groups) {
            first_err.get_or_insert(e);
        }
        if let Some(e) = first_err {
            self.recover();
            return Err(e);
        }

        self.stats.backwards += 1;
        self.record_unsharded();
        for group in &self.groups {
            for p in group.params() {
                if let Some(g) = p.grad() {
                    grads.insert(p.shard().as_tensor(), g.clone());
                }
            }
        }
        debug!(rank = self.rank, groups = pending.len(), "backward finalized");
        Ok(grads)
    }
}

impl ComputeHooks for FullyShard {
    fn pre_compute(&mut self, id: GroupId) -> Result<()> {
        let idx = self.index(id)?;
        // A group still held from an earlier use in this invocation keeps its
        // reference and views, so it is gathered once.
        let held = match self.lazy_reshard.iter().position(|&g| g == id) {
            Some(pos) => {
                self.lazy_reshard.remove(pos);
                true
            }
            None => false,
        };
        self.visits[idx] += 1;
        self.release_lazy(false)?;
        let status = if held {
            UnshardStatus::AlreadyUnsharded
        } else {
            self.groups[idx].request_unshard(&mut self.sched)?
        };
        self.track_issued(idx);

        // The order only records first visits, so later ones have nothing new to fetch.
        if self.config.forward_prefetch && self.visits[idx] == 1 {
            self.prefetch_after(id)?;
        }

        let grad_mode = self.grad_mode;
        let group = &mut self.groups[idx];
        group.materialize(grad_mode)?;
        if grad_mode {
            group.record_backward_views();
        }
        trace!(group = group.name(), status = ?status, "pre-compute");

        if !self.forward_order.contains(&id) {
            self.forward_order.push(id);
        }

        let (count, _) = self.unsharded_now();
        if count > self.stats.max_concurrent_unsharded {
            self.stats.max_concurrent_unsharded = count;
            metrics::record_peak_unsharded(self.rank, count);
        }
        Ok(())
    }

    fn post_compute(&mut self, id: GroupId) -> Result<()> {
        let idx = self.index(id)?;
        let is_root = self.call_stack.is_empty();
        let grad_mode = self.grad_mode;
        let group = &mut self.groups[idx];

        if grad_mode && (is_root || !group.reshard_after_forward()) {
            group.hold_for_backward();
        } else if is_root {
            group.request_reshard(&mut self.sched, None)?;
        } else {
            // Released when another group starts computing or the root exits.
            self.lazy_reshard.push(id);
        }
        if grad_mode && !self.backward_pending.contains(&id) {
            self.backward_pending.push(id);
        }
        if !is_root {
            self.root_sync.defer(DeferredTask::EnsureResharded(id));
        }
        self.track_issued(idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::CollectiveCommunicator;
    use candle_core::{DType, Module};

    struct Linear {
        group: GroupId,
    }

    impl ShardedModule for Linear {
        type Input = Tensor;

        fn group(&self) -> GroupId {
            self.group
        }

        fn forward(&self, fsdp: &mut FullyShard, x: Tensor) -> Result<Tensor> {
            let w = fsdp.param(self.group, "weight")?;
            let b = fsdp.param(self.group, "bias")?;
            Ok(candle_nn::Linear::new(w, Some(b)).forward(&x)?)
        }
    }

    /// Calls the same child twice, like a shared layer.
    struct Twice {
        group: GroupId,
        child: Linear,
    }

    impl ShardedModule for Twice {
        type Input = Tensor;

        fn group(&self) -> GroupId {
            self.group
        }

        fn forward(&self, fsdp: &mut FullyShard, x: Tensor) -> Result<Tensor> {
            let h = fsdp.forward(&self.child, x)?;
            fsdp.forward(&self.child, h)
        }
    }

    /// Runs `outer`, then `inner`, then `outer` again.
    struct Sandwich {
        group: GroupId,
        outer: Linear,
        inner: Linear,
    }

    impl ShardedModule for Sandwich {
        type Input = Tensor;

        fn group(&self) -> GroupId {
            self.group
        }

        fn forward(&self, fsdp: &mut FullyShard, x: Tensor) -> Result<Tensor> {
            let h = fsdp.forward(&self.outer, x)?;
            let h = fsdp.forward(&self.inner, h)?;
            fsdp.forward(&self.outer, h)
        }
    }

    /// Single-member group whose gathers succeed and whose reductions fail.
    struct LossyReduce;

    impl CollectiveCommunicator for LossyReduce {
        fn rank(&self) -> usize {
            0
        }

        fn world_size(&self) -> usize {
            1
        }

        fn all_reduce(&self, _: &Tensor) -> candle_core::Result<Tensor> {
            Err(candle_core::Error::Msg("peer lost".into()))
        }

        fn all_gather(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
            Ok(tensor.clone())
        }

        fn broadcast(&self, tensor: &Tensor, _: usize) -> candle_core::Result<Tensor> {
            Ok(tensor.clone())
        }
    }

    fn engine() -> Result<FullyShard> {
        let mesh = Arc::new(DeviceMesh::flat(1)?);
        let config = EngineConfig {
            mesh_shape: vec![1],
            ..EngineConfig::default()
        };
        FullyShard::new(config, mesh, 0, vec![ProcessGroup::solo(0)?])
    }

    fn linear_params() -> Result<Vec<ParamSpec>> {
        Ok(vec![
            ParamSpec::new("weight", Tensor::ones((3, 3), DType::F32, &Device::Cpu)?),
            ParamSpec::new("bias", Tensor::zeros(3, DType::F32, &Device::Cpu)?),
        ])
    }

    #[test]
    fn test_shared_child_grads_accumulate() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", vec![], None)?;
        let child = fsdp.register_group("child", linear_params()?, Some(root))?;
        let model = Twice {
            group: root,
            child: Linear { group: child },
        };

        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu)?;
        let out = fsdp.forward(&model, x)?;
        assert_eq!(out.to_vec2::<f32>()?, vec![vec![9.0, 9.0, 9.0]]);
        assert_eq!(fsdp.group_state(child)?, GroupState::Sharded);

        let grads = fsdp.backward(&out.sum_all()?)?;
        // d/db of sum(W(Wx+b)+b) = W^T 1 + 1 = 4 per entry
        let bias_shard = &fsdp.group(child)?.params()[1];
        let g = grads.get(bias_shard.shard().as_tensor()).unwrap().to_vec1::<f32>()?;
        assert_eq!(g, vec![4.0, 4.0, 4.0]);
        // both uses share one unshard
        assert_eq!(fsdp.stats().all_gathers, 1);
        assert_eq!(fsdp.stats().reduce_scatters, 1);
        for g in fsdp.groups() {
            assert_eq!(g.state(), GroupState::Sharded);
        }
        Ok(())
    }

    #[test]
    fn test_shared_child_unsharded_once_without_grad() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", vec![], None)?;
        let child = fsdp.register_group("child", linear_params()?, Some(root))?;
        let model = Twice {
            group: root,
            child: Linear { group: child },
        };

        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu)?;
        fsdp.forward_no_grad(&model, x)?;
        assert_eq!(fsdp.stats().all_gathers, 1);
        assert_eq!(fsdp.group_state(child)?, GroupState::Sharded);
        assert_eq!(fsdp.group(child)?.refcount(), 0);
        Ok(())
    }

    #[test]
    fn test_group_reused_later_in_forward_is_kept() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", vec![], None)?;
        let outer = fsdp.register_group("outer", linear_params()?, Some(root))?;
        let inner = fsdp.register_group("inner", linear_params()?, Some(root))?;
        let model = Sandwich {
            group: root,
            outer: Linear { group: outer },
            inner: Linear { group: inner },
        };

        let mut gathers = Vec::new();
        for _ in 0..2 {
            fsdp.zero_grad(true)?;
            let before = fsdp.stats().all_gathers;
            let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu)?;
            let out = fsdp.forward(&model, x)?;
            gathers.push(fsdp.stats().all_gathers - before);
            for g in fsdp.groups() {
                assert_eq!(g.state(), GroupState::Sharded);
            }

            let grads = fsdp.backward(&out.sum_all()?)?;
            // 1 from the last use plus (W_o W_i)^T 1 from the first
            let bias = fsdp.group(outer)?.params()[1].shard().clone();
            let g = grads.get(bias.as_tensor()).unwrap().to_vec1::<f32>()?;
            assert_eq!(g, vec![10.0, 10.0, 10.0]);
        }
        // the first pass learns that `outer` comes back; the second keeps it
        assert_eq!(gathers, vec![3, 2]);
        assert_eq!(fsdp.stats().max_concurrent_unsharded, 2);
        Ok(())
    }

    #[test]
    fn test_backward_retained_bytes_reported() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", vec![], None)?;
        let child = fsdp.register_group("child", linear_params()?, Some(root))?;
        let model = Twice {
            group: root,
            child: Linear { group: child },
        };
        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu)?;

        let out = fsdp.forward(&model, x.clone())?;
        assert_eq!(fsdp.group_state(child)?, GroupState::Sharded);
        // 3x3 weight and 3 bias, f32
        assert_eq!(fsdp.backward_retained_bytes(), 48);
        assert_eq!(fsdp.stats().peak_backward_retained_bytes, 48);

        fsdp.backward(&out.sum_all()?)?;
        assert_eq!(fsdp.backward_retained_bytes(), 0);

        fsdp.forward_no_grad(&model, x)?;
        assert_eq!(fsdp.backward_retained_bytes(), 0);
        assert_eq!(fsdp.stats().peak_backward_retained_bytes, 48);
        Ok(())
    }

    #[test]
    fn test_failed_reduce_scatter_surfaces_from_backward() -> Result<()> {
        let mesh = Arc::new(DeviceMesh::flat(1)?);
        let config = EngineConfig {
            mesh_shape: vec![1],
            ..EngineConfig::default()
        };
        let pg = ProcessGroup::new(Arc::new(LossyReduce), vec![0]);
        let mut fsdp = FullyShard::new(config, mesh, 0, vec![pg])?;
        let root = fsdp.register_group("root", vec![], None)?;
        let child = fsdp.register_group("child", linear_params()?, Some(root))?;
        let model = Twice {
            group: root,
            child: Linear { group: child },
        };

        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu)?;
        let out = fsdp.forward(&model, x.clone())?;
        assert!(matches!(
            fsdp.backward(&out.sum_all()?),
            Err(FsdpError::CommunicationFailure { .. })
        ));
        for g in fsdp.groups() {
            assert_eq!(g.state(), GroupState::Sharded);
            assert!(!g.has_pending_reduce());
            assert!(g.params().iter().all(|p| !p.grad_in_flight()));
        }
        assert_eq!(fsdp.backward_retained_bytes(), 0);

        // the engine stays usable for gather-only work
        let out = fsdp.forward_no_grad(&model, x)?;
        assert_eq!(out.to_vec2::<f32>()?, vec![vec![9.0, 9.0, 9.0]]);
        Ok(())
    }

    #[test]
    fn test_no_grad_forward_reshards_everything() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", linear_params()?, None)?;
        let model = Linear { group: root };

        let x = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
        let out = fsdp.forward_no_grad(&model, x)?;
        assert!(!out.is_variable());
        assert_eq!(fsdp.group_state(root)?, GroupState::Sharded);
        assert_eq!(fsdp.stats().reduce_scatters, 0);
        Ok(())
    }

    #[test]
    fn test_root_held_until_backward() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", linear_params()?, None)?;
        let model = Linear { group: root };

        let x = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
        let out = fsdp.forward(&model, x)?;
        assert_eq!(fsdp.group_state(root)?, GroupState::Unsharded);
        fsdp.backward(&out.sum_all()?)?;
        assert_eq!(fsdp.group_state(root)?, GroupState::Sharded);
        assert!(fsdp.group(root)?.params()[0].grad().is_some());
        Ok(())
    }

    #[test]
    fn test_forward_without_backward_is_discarded() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", linear_params()?, None)?;
        let model = Linear { group: root };
        let x = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;

        fsdp.forward(&model, x.clone())?;
        let out = fsdp.forward(&model, x)?;
        assert_eq!(fsdp.group(root)?.refcount(), 1);
        fsdp.backward(&out.sum_all()?)?;
        assert_eq!(fsdp.group_state(root)?, GroupState::Sharded);
        Ok(())
    }

    #[test]
    fn test_params_outside_forward_is_violation() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", linear_params()?, None)?;
        assert!(matches!(fsdp.params(root), Err(FsdpError::StateViolation { .. })));
        assert!(matches!(fsdp.group(GroupId(5)), Err(FsdpError::StateViolation { .. })));
        assert!(fsdp.register_group("orphan", vec![], Some(GroupId(9))).is_err());
        assert!(fsdp.register_group_on("bad-dim", vec![], None, 3).is_err());
        Ok(())
    }

    #[test]
    fn test_full_parameters_summons_and_reshards() -> Result<()> {
        let mut fsdp = engine()?;
        let root = fsdp.register_group("root", linear_params()?, None)?;
        let full = fsdp.full_parameters(root)?;
        assert_eq!(full[0].0, "weight");
        assert_eq!(full[0].1.dims(), &[3, 3]);
        assert_eq!(fsdp.group_state(root)?, GroupState::Sharded);
        Ok(())
    }

    #[test]
    fn test_mismatched_process_groups_rejected() -> Result<()> {
        let mesh = Arc::new(DeviceMesh::flat(2)?);
        let result = FullyShard::new(EngineConfig::default(), mesh, 0, vec![ProcessGroup::solo(0)?]);
        assert!(matches!(result, Err(FsdpError::InvalidMeshShape(_))));
        Ok(())
    }
}
