//! Root synchronization: outstanding collectives and deferred work for one
//! top-level invocation.
//!
//! Non-root groups never block on their own collectives at forward exit.
//! They record what they issued here and queue a task; the root drains both
//! at `finalize`, after backward and before the optimizer step.

use super::param_group::{GroupId, ParamGroup};
use super::scheduler::CollectiveKind;
use crate::utils::error::{FsdpError, Result};
use crate::utils::metrics;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outstanding {
    pub group: GroupId,
    pub kind: CollectiveKind,
    pub seq: u64,
}

/// Work queued by non-root groups for the next root finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredTask {
    /// Make sure the group ends the step sharded with its reductions waited.
    EnsureResharded(GroupId),
}

#[derive(Debug, Default)]
pub struct RootSync {
    outstanding: Vec<Outstanding>,
    deferred: VecDeque<DeferredTask>,
    finalizes: u64,
}

impl RootSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, group: GroupId, kind: CollectiveKind, seq: u64) {
        self.outstanding.push(Outstanding { group, kind, seq });
    }

    pub fn defer(&mut self, task: DeferredTask) {
        if !self.deferred.contains(&task) {
            self.deferred.push_back(task);
        }
    }

    pub fn outstanding(&self) -> &[Outstanding] {
        &self.outstanding
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty() && self.deferred.is_empty()
    }

    /// Number of finalizes that had work to do.
    pub fn finalizes(&self) -> u64 {
        self.finalizes
    }

    /// Wait on every outstanding collective in submission order, then run the
    /// deferred tasks. Keeps draining after an error so no handle is left
    /// behind; the first error is returned.
    pub fn finalize(&mut self, groups: &mut [ParamGroup]) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let outstanding = std::mem::take(&mut self.outstanding);
        let deferred = std::mem::take(&mut self.deferred);
        debug!(
            outstanding = outstanding.len(),
            deferred = deferred.len(),
            "root finalize"
        );

        let mut first_err: Option<FsdpError> = None;
        let mut keep = |result: Result<()>| {
            if let Err(e) = result {
                warn!(error = %e, "error while finalizing root");
                first_err.get_or_insert(e);
            }
        };

        for item in &outstanding {
            keep(match groups.get_mut(item.group.0) {
                Some(group) => group.wait_outstanding(item.kind, item.seq),
                None => Err(unknown_group(item.group)),
            });
        }

        for task in deferred {
            match task {
                DeferredTask::EnsureResharded(id) => keep(match groups.get_mut(id.0) {
                    Some(group) => group.force_reshard(),
                    None => Err(unknown_group(id)),
                }),
            }
        }

        self.finalizes += 1;
        metrics::record_finalize_time(start.elapsed().as_secs_f64());

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn unknown_group(id: GroupId) -> FsdpError {
    FsdpError::state_violation(id.to_string(), "unknown parameter group")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ProcessGroup;
    use crate::fsdp::param_group::{GroupState, ParamSpec};
    use crate::fsdp::scheduler::{CommHooks, CommScheduler};
    use candle_core::{DType, Device, Tensor};
    use std::time::Duration;

    fn group(id: usize) -> Result<ParamGroup> {
        ParamGroup::new(
            GroupId(id),
            format!("g{}", id),
            None,
            0,
            ProcessGroup::solo(0)?,
            vec![ParamSpec::new("w", Tensor::ones((2, 2), DType::F32, &Device::Cpu)?)],
            0,
            0,
            &Device::Cpu,
        )
    }

    #[test]
    fn test_finalize_empty_is_noop() -> Result<()> {
        let mut sync = RootSync::new();
        sync.finalize(&mut [])?;
        sync.finalize(&mut [])?;
        assert_eq!(sync.finalizes(), 0);
        Ok(())
    }

    #[test]
    fn test_finalize_waits_reductions_and_reshards() -> Result<()> {
        let mut sched = CommScheduler::new(0)?
            .with_hooks(CommHooks::with_delays(None, Some(Duration::from_millis(10))));
        let mut groups = vec![group(0)?, group(1)?];
        let mut sync = RootSync::new();

        for g in groups.iter_mut() {
            g.request_unshard(&mut sched)?;
            g.materialize(true)?;
            let grad = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
            g.request_reshard(&mut sched, Some(vec![Some(grad)]))?;
            for (kind, seq) in g.take_issued() {
                sync.track(g.id(), kind, seq);
            }
            sync.defer(DeferredTask::EnsureResharded(g.id()));
        }
        sync.defer(DeferredTask::EnsureResharded(GroupId(0)));
        assert_eq!(sync.outstanding().len(), 4);
        assert_eq!(sync.deferred_len(), 2);
        assert_eq!(groups[1].state(), GroupState::Resharding);

        sync.finalize(&mut groups)?;
        assert!(sync.is_empty());
        for g in &groups {
            assert_eq!(g.state(), GroupState::Sharded);
            assert!(!g.has_pending_reduce());
            assert!(g.params()[0].grad().is_some());
        }
        Ok(())
    }

    #[test]
    fn test_finalize_reports_unknown_group_and_still_clears() -> Result<()> {
        let mut groups = vec![group(0)?];
        let mut sync = RootSync::new();
        sync.defer(DeferredTask::EnsureResharded(GroupId(9)));
        sync.defer(DeferredTask::EnsureResharded(GroupId(0)));

        assert!(matches!(
            sync.finalize(&mut groups),
            Err(FsdpError::StateViolation { .. })
        ));
        assert!(sync.is_empty());
        Ok(())
    }
}
