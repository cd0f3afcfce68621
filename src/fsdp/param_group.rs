//! Parameter groups: the unit that is unsharded and resharded together.
//!
//! State machine per group:
//!
//! ```text
//! Sharded --request_unshard--> Unsharding --materialize--> Unsharded
//!    ^                                                        |
//!    +---- reduce-scatter waited <-- Resharding <-- request_reshard (refcount 0)
//! ```
//!
//! Unsharding is reference counted: every `request_unshard` takes a
//! reference and every `request_reshard` drops one; the buffer is only freed
//! at zero, and never before an in-flight reduce-scatter has been waited.

use super::scheduler::{CollectiveKind, CommHandle, CommScheduler};
use super::shard::ShardDescriptor;
use crate::distributed::ProcessGroup;
use crate::utils::error::{FsdpError, Result};
use crate::utils::metrics;
use candle_core::{Device, Tensor, Var};
use std::fmt;
use tracing::{debug, trace};

/// Index of a group in the coordinator's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Sharded,
    Unsharding,
    Unsharded,
    Resharding,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Sharded => "sharded",
            GroupState::Unsharding => "unsharding",
            GroupState::Unsharded => "unsharded",
            GroupState::Resharding => "resharding",
        }
    }
}

/// What `request_unshard` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnshardStatus {
    /// A new all-gather was issued
    Issued,
    /// An all-gather was already in flight; a reference was taken
    InFlight,
    /// Already materialized; a reference was taken
    AlreadyUnsharded,
}

/// A full parameter handed to a group at registration.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub value: Tensor,
    pub requires_grad: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            requires_grad: true,
        }
    }

    /// Mark the parameter as not requiring gradients.
    pub fn frozen(mut self) -> Self {
        self.requires_grad = false;
        self
    }
}

/// Sharded gradient staging for one parameter.
#[derive(Debug, Default)]
pub struct GradAccumulator {
    value: Option<Tensor>,
    in_flight: bool,
}

impl GradAccumulator {
    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    fn begin(&mut self) {
        self.in_flight = true;
    }

    fn complete(&mut self, reduced: Tensor) -> Result<()> {
        let next = match &self.value {
            Some(prev) => (prev + &reduced)?,
            None => reduced,
        };
        self.value = Some(next);
        self.in_flight = false;
        Ok(())
    }

    fn abort(&mut self) {
        self.in_flight = false;
    }

    fn zero(&mut self, set_to_none: bool) -> Result<()> {
        if set_to_none {
            self.value = None;
        } else if let Some(v) = &self.value {
            self.value = Some(v.zeros_like()?);
        }
        Ok(())
    }
}

/// One parameter as held by this rank: its local shard and how it was cut.
#[derive(Debug)]
pub struct ShardedParam {
    name: String,
    descriptor: ShardDescriptor,
    shard: Var,
    requires_grad: bool,
    grad: GradAccumulator,
}

impl ShardedParam {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ShardDescriptor {
        &self.descriptor
    }

    /// The local shard; this is what the optimizer updates.
    pub fn shard(&self) -> &Var {
        &self.shard
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Reduced, sharded gradient accumulated so far.
    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.value()
    }

    pub fn grad_in_flight(&self) -> bool {
        self.grad.is_in_flight()
    }
}

struct PendingReduce {
    handle: CommHandle<Tensor>,
    /// Indices of the params packed into the buffer, in packing order
    params: Vec<usize>,
}

pub struct ParamGroup {
    id: GroupId,
    name: String,
    parent: Option<GroupId>,
    mesh_dim: usize,
    process_group: ProcessGroup,
    params: Vec<ShardedParam>,

    state: GroupState,
    refcount: usize,
    pending_unshard: Option<CommHandle<Tensor>>,
    pending_reduce: Option<PendingReduce>,
    unsharded: Vec<Tensor>,
    views_recorded: bool,

    backward_views: Vec<Vec<Tensor>>,
    backward_holds: usize,
    reshard_after_forward: bool,

    issued: Vec<(CollectiveKind, u64)>,
}

impl ParamGroup {
    /// Shard `specs` across `process_group`. Every rank must pass identical
    /// full values; each keeps only its own shard.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: GroupId,
        name: impl Into<String>,
        parent: Option<GroupId>,
        mesh_dim: usize,
        process_group: ProcessGroup,
        specs: Vec<ParamSpec>,
        shard_dim: usize,
        global_rank: usize,
        device: &Device,
    ) -> Result<Self> {
        let name = name.into();
        let local_index = process_group.local_rank(global_rank).ok_or_else(|| {
            FsdpError::Config(format!(
                "rank {} is not a member of {:?} for group '{}'",
                global_rank, process_group.ranks, name
            ))
        })?;

        if let Some(first) = specs.first() {
            let dtype = first.value.dtype();
            if let Some(other) = specs.iter().find(|s| s.value.dtype() != dtype) {
                return Err(FsdpError::Config(format!(
                    "group '{}' mixes dtypes: '{}' is {:?}, expected {:?}",
                    name,
                    other.name,
                    other.value.dtype(),
                    dtype
                )));
            }
        }

        let mut params = Vec::with_capacity(specs.len());
        for spec in specs {
            let full = spec.value.to_device(device)?.detach();
            // Vectors and other low-rank params fall back to dim 0.
            let dim = if shard_dim < full.rank() { shard_dim } else { 0 };
            let descriptor =
                ShardDescriptor::new(full.dims(), dim, process_group.ranks.clone(), local_index)?;
            let shard = Var::from_tensor(&descriptor.local_shard(&full)?)?;
            params.push(ShardedParam {
                name: spec.name,
                descriptor,
                shard,
                requires_grad: spec.requires_grad,
                grad: GradAccumulator::default(),
            });
        }

        debug!(
            group = %name,
            %id,
            params = params.len(),
            shards = process_group.size,
            "registered parameter group"
        );

        Ok(Self {
            id,
            name,
            parent,
            mesh_dim,
            process_group,
            params,
            state: GroupState::Sharded,
            refcount: 0,
            pending_unshard: None,
            pending_reduce: None,
            unsharded: Vec::new(),
            views_recorded: false,
            backward_views: Vec::new(),
            backward_holds: 0,
            reshard_after_forward: true,
            issued: Vec::new(),
        })
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    pub fn mesh_dim(&self) -> usize {
        self.mesh_dim
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn params(&self) -> &[ShardedParam] {
        &self.params
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn reshard_after_forward(&self) -> bool {
        self.reshard_after_forward
    }

    pub fn set_reshard_after_forward(&mut self, value: bool) {
        self.reshard_after_forward = value;
    }

    /// Unsharded or on its way there.
    pub fn is_unsharded(&self) -> bool {
        matches!(self.state, GroupState::Unsharding | GroupState::Unsharded)
    }

    pub fn has_pending_reduce(&self) -> bool {
        self.pending_reduce.is_some()
    }

    pub fn unsharded_bytes(&self) -> usize {
        self.unsharded
            .iter()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }

    /// Bytes of the view sets recorded for backward.
    pub fn backward_view_bytes(&self) -> usize {
        self.backward_views
            .iter()
            .flatten()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }

    /// Collectives issued since the last call, as `(kind, seq)`.
    pub fn take_issued(&mut self) -> Vec<(CollectiveKind, u64)> {
        std::mem::take(&mut self.issued)
    }

    fn violation(&self, reason: impl Into<String>) -> FsdpError {
        FsdpError::state_violation(self.name.clone(), reason)
    }

    fn transition(&mut self, to: GroupState) {
        let from = self.state;
        self.state = to;
        metrics::record_state_transition(from.as_str(), to.as_str());
        debug!(
            group = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            refcount = self.refcount,
            "state transition"
        );
    }

    fn free_unsharded(&mut self) {
        self.unsharded.clear();
        self.views_recorded = false;
    }

    fn issue_all_gather(&mut self, sched: &mut CommScheduler) -> Result<()> {
        if self.params.is_empty() {
            return Ok(());
        }
        let flat = self
            .params
            .iter()
            .map(|p| p.shard.as_tensor().detach().flatten_all())
            .collect::<candle_core::Result<Vec<_>>>()?;
        // cat copies, so the optimizer may update shards while this is in flight
        let buffer = Tensor::cat(&flat, 0)?;
        let handle = sched.schedule_all_gather(&self.process_group, &self.name, buffer)?;
        self.issued.push((CollectiveKind::AllGather, handle.seq()));
        self.pending_unshard = Some(handle);
        Ok(())
    }

    /// Take a reference on the unsharded parameters, issuing the all-gather
    /// only when the group is sharded.
    pub fn request_unshard(&mut self, sched: &mut CommScheduler) -> Result<UnshardStatus> {
        match self.state {
            GroupState::Sharded => {
                self.issue_all_gather(sched)?;
                self.refcount = 1;
                self.transition(GroupState::Unsharding);
                Ok(UnshardStatus::Issued)
            }
            GroupState::Unsharding => {
                self.refcount += 1;
                Ok(UnshardStatus::InFlight)
            }
            GroupState::Unsharded => {
                self.refcount += 1;
                Ok(UnshardStatus::AlreadyUnsharded)
            }
            GroupState::Resharding => {
                // The old buffer is freed once its reduce-scatter is waited.
                self.complete_reduce()?;
                self.request_unshard(sched)
            }
        }
    }

    /// Issue the all-gather ahead of use without taking a reference.
    pub fn prefetch(&mut self, sched: &mut CommScheduler) -> Result<bool> {
        if self.state != GroupState::Sharded || self.params.is_empty() {
            return Ok(false);
        }
        self.issue_all_gather(sched)?;
        self.transition(GroupState::Unsharding);
        Ok(true)
    }

    /// Wait for the in-flight all-gather and build the full parameter views.
    ///
    /// With `track_grad`, views of grad-requiring params are fresh leaf
    /// variables so backward reports their gradients.
    pub fn materialize(&mut self, track_grad: bool) -> Result<()> {
        match self.state {
            GroupState::Unsharded => Ok(()),
            GroupState::Unsharding => {
                let gathered = self.pending_unshard.take().map(|h| h.wait()).transpose();
                match gathered.and_then(|g| self.build_views(g, track_grad)) {
                    Ok(views) => {
                        self.unsharded = views;
                        self.views_recorded = false;
                        self.transition(GroupState::Unsharded);
                        Ok(())
                    }
                    Err(e) => {
                        self.refcount = 0;
                        self.free_unsharded();
                        self.transition(GroupState::Sharded);
                        Err(e)
                    }
                }
            }
            GroupState::Sharded | GroupState::Resharding => Err(self.violation(format!(
                "materialize requires an issued unshard, group is {}",
                self.state.as_str()
            ))),
        }
    }

    fn build_views(&self, gathered: Option<Tensor>, track_grad: bool) -> Result<Vec<Tensor>> {
        let Some(gathered) = gathered else {
            return Ok(Vec::new());
        };

        let n = self.process_group.size;
        let total: usize = self.params.iter().map(|p| p.descriptor.shard_numel()).sum();
        if gathered.dims() != [n * total] {
            return Err(FsdpError::ShapeMismatch(format!(
                "all-gather for '{}' returned {:?}, expected [{}]",
                self.name,
                gathered.dims(),
                n * total
            )));
        }

        let mut views = Vec::with_capacity(self.params.len());
        let mut offset = 0;
        for p in &self.params {
            let numel = p.descriptor.shard_numel();
            let shape = p.descriptor.shard_shape();
            let shards = (0..n)
                .map(|r| gathered.narrow(0, r * total + offset, numel)?.reshape(shape.as_slice()))
                .collect::<candle_core::Result<Vec<_>>>()?;
            let full = p.descriptor.reconstruct_full(&shards)?;
            let view = if track_grad && p.requires_grad {
                Var::from_tensor(&full)?.as_tensor().clone()
            } else {
                full
            };
            views.push(view);
            offset += numel;
        }
        Ok(views)
    }

    /// Full parameter views; only valid while unsharded.
    pub fn views(&self) -> Result<&[Tensor]> {
        if self.state != GroupState::Unsharded {
            return Err(self.violation(format!(
                "parameters read while {}",
                self.state.as_str()
            )));
        }
        Ok(&self.unsharded)
    }

    /// Remember the current views so their gradients are collected at backward.
    pub fn record_backward_views(&mut self) {
        if self.views_recorded || self.state != GroupState::Unsharded || self.unsharded.is_empty()
        {
            return;
        }
        self.backward_views.push(self.unsharded.clone());
        self.views_recorded = true;
    }

    pub(crate) fn take_backward_views(&mut self) -> Vec<Vec<Tensor>> {
        self.views_recorded = false;
        std::mem::take(&mut self.backward_views)
    }

    pub(crate) fn hold_for_backward(&mut self) {
        self.backward_holds += 1;
    }

    pub(crate) fn take_backward_holds(&mut self) -> usize {
        std::mem::take(&mut self.backward_holds)
    }

    pub fn backward_holds(&self) -> usize {
        self.backward_holds
    }

    /// Drop a reference. With gradients, reduce-scatter them into the
    /// accumulators first; the buffer is freed once the count hits zero and
    /// the reduction has been waited.
    pub fn request_reshard(
        &mut self,
        sched: &mut CommScheduler,
        grads: Option<Vec<Option<Tensor>>>,
    ) -> Result<()> {
        match (self.state, grads) {
            (GroupState::Unsharding, _) => {
                Err(self.violation("reshard requested before the unshard completed"))
            }
            (GroupState::Unsharded, grads) => {
                self.refcount = self.refcount.saturating_sub(1);
                if let Some(grads) = grads {
                    self.issue_reduce(sched, grads)?;
                }
                if self.refcount == 0 {
                    if self.pending_reduce.is_some() {
                        self.transition(GroupState::Resharding);
                    } else {
                        self.free_unsharded();
                        self.transition(GroupState::Sharded);
                    }
                }
                Ok(())
            }
            (GroupState::Sharded | GroupState::Resharding, Some(grads)) => {
                self.issue_reduce(sched, grads)?;
                Ok(())
            }
            (GroupState::Sharded, None) => {
                Err(self.violation("reshard requested while already sharded"))
            }
            (GroupState::Resharding, None) => {
                Err(self.violation("reshard requested while already resharding"))
            }
        }
    }

    /// Reduce-scatter gradients without touching the unshard reference count.
    pub fn reduce_gradients(
        &mut self,
        sched: &mut CommScheduler,
        grads: Vec<Option<Tensor>>,
    ) -> Result<bool> {
        self.issue_reduce(sched, grads)
    }

    fn issue_reduce(&mut self, sched: &mut CommScheduler, grads: Vec<Option<Tensor>>) -> Result<bool> {
        if grads.len() != self.params.len() {
            return Err(FsdpError::ShapeMismatch(format!(
                "group '{}' got {} gradients for {} params",
                self.name,
                grads.len(),
                self.params.len()
            )));
        }

        let selected: Vec<(usize, Tensor)> = grads
            .into_iter()
            .enumerate()
            .filter(|(i, _)| self.params[*i].requires_grad)
            .filter_map(|(i, g)| g.map(|g| (i, g)))
            .collect();
        if selected.is_empty() {
            debug!(group = %self.name, "no gradients to reduce, skipping reduce-scatter");
            return Ok(false);
        }

        if self.pending_reduce.is_some() {
            debug!(group = %self.name, "queueing behind in-flight reduce-scatter");
            self.complete_reduce()?;
        }
        // Rejected before anything is issued, so no accumulator is left half-begun.
        if let Some((i, _)) = selected.iter().find(|(i, _)| self.params[*i].grad.is_in_flight()) {
            return Err(self.violation(format!(
                "second reduction for '{}' while one is in flight",
                self.params[*i].name
            )));
        }

        // Rank-major packing: rank r's chunk of every param, then rank r+1's.
        let n = self.process_group.size;
        let mut per_rank: Vec<Vec<Tensor>> = vec![Vec::with_capacity(selected.len()); n];
        for (i, grad) in &selected {
            let chunks = self.params[*i].descriptor.shard_tensor(&grad.detach())?;
            for (r, chunk) in chunks.into_iter().enumerate() {
                per_rank[r].push(chunk.flatten_all()?);
            }
        }
        let flat: Vec<Tensor> = per_rank.into_iter().flatten().collect();
        let buffer = Tensor::cat(&flat, 0)?;

        let handle = sched.schedule_reduce_scatter(&self.process_group, &self.name, buffer)?;
        let indices: Vec<usize> = selected.into_iter().map(|(i, _)| i).collect();
        for &i in &indices {
            self.params[i].grad.begin();
        }
        trace!(group = %self.name, seq = handle.seq(), params = indices.len(), "reduce-scatter pending");
        self.issued.push((CollectiveKind::ReduceScatter, handle.seq()));
        self.pending_reduce = Some(PendingReduce {
            handle,
            params: indices,
        });
        Ok(true)
    }

    /// Wait for the in-flight reduce-scatter, if any, and fold its result into
    /// the accumulators. Frees the unsharded buffer when resharding.
    pub fn complete_reduce(&mut self) -> Result<()> {
        let Some(pending) = self.pending_reduce.take() else {
            return Ok(());
        };

        let result = pending
            .handle
            .wait()
            .and_then(|local| self.accumulate(&pending.params, local));
        if result.is_err() {
            for &i in &pending.params {
                self.params[i].grad.abort();
            }
        }

        if self.state == GroupState::Resharding {
            self.free_unsharded();
            self.transition(GroupState::Sharded);
        }
        result
    }

    fn accumulate(&mut self, indices: &[usize], local: Tensor) -> Result<()> {
        let n = self.process_group.size as f64;
        let total: usize = indices
            .iter()
            .map(|&i| self.params[i].descriptor.shard_numel())
            .sum();
        if local.dims() != [total] {
            return Err(FsdpError::ShapeMismatch(format!(
                "reduce-scatter for '{}' returned {:?}, expected [{}]",
                self.name,
                local.dims(),
                total
            )));
        }

        let mut offset = 0;
        for &i in indices {
            let param = &mut self.params[i];
            let numel = param.descriptor.shard_numel();
            let shape = param.descriptor.shard_shape();
            let shard_grad = (local.narrow(0, offset, numel)?.reshape(shape.as_slice())? / n)?;
            param.grad.complete(shard_grad)?;
            offset += numel;
        }
        Ok(())
    }

    /// Wait for a specific outstanding collective if it is still pending.
    /// Handles already consumed elsewhere are skipped.
    pub fn wait_outstanding(&mut self, kind: CollectiveKind, seq: u64) -> Result<()> {
        match kind {
            CollectiveKind::ReduceScatter => {
                let matches = self.pending_reduce.as_ref().map(|p| p.handle.seq()) == Some(seq);
                if matches {
                    self.complete_reduce()?;
                }
                Ok(())
            }
            CollectiveKind::AllGather => {
                let matches = self.pending_unshard.as_ref().map(|h| h.seq()) == Some(seq);
                if matches {
                    self.materialize(false)?;
                    if self.refcount == 0 {
                        self.free_unsharded();
                        self.transition(GroupState::Sharded);
                    }
                }
                Ok(())
            }
            CollectiveKind::Marker => Ok(()),
        }
    }

    /// Bring the group back to `Sharded` regardless of references, waiting on
    /// anything still in flight. Used by the root finalize sweep.
    pub fn force_reshard(&mut self) -> Result<()> {
        let reduced = self.complete_reduce();
        let gathered = match self.pending_unshard.take() {
            Some(handle) => handle.wait().map(|_| ()),
            None => Ok(()),
        };
        self.backward_holds = 0;
        if self.state != GroupState::Sharded {
            self.refcount = 0;
            self.free_unsharded();
            self.transition(GroupState::Sharded);
        }
        reduced.and(gathered)
    }

    /// Reset the sharded gradients.
    pub fn zero_grad(&mut self, set_to_none: bool) -> Result<()> {
        if let Some(p) = self.params.iter().find(|p| p.grad.is_in_flight()) {
            return Err(self.violation(format!(
                "zero_grad while the reduction for '{}' is in flight",
                p.name
            )));
        }
        for p in &mut self.params {
            p.grad.zero(set_to_none)?;
        }
        Ok(())
    }

    /// Full parameter values, gathering them transiently if needed.
    pub fn full_parameters(&mut self, sched: &mut CommScheduler) -> Result<Vec<Tensor>> {
        if self.state == GroupState::Unsharded {
            return Ok(self.unsharded.iter().map(|t| t.detach()).collect());
        }
        self.request_unshard(sched)?;
        self.materialize(false)?;
        let full = self.unsharded.iter().map(|t| t.detach()).collect();
        self.request_reshard(sched, None)?;
        Ok(full)
    }
}

impl fmt::Debug for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .field("refcount", &self.refcount)
            .field("params", &self.params.len())
            .finish()
    }
}
