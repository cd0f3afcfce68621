//! Communication stream and collective scheduling.
//!
//! Each rank owns one communication stream: a dedicated thread draining a
//! FIFO of jobs. Collectives are submitted to it and return a `CommHandle`
//! immediately; the compute thread only blocks when it waits on a handle.
//! Because the stream is FIFO, collectives complete in submission order, so
//! every group's all-gathers and reduce-scatters keep their request order.
//!
//! Delay hooks run on the stream thread right before the collective, so an
//! injected delay never stalls compute that does not wait on its result.

use crate::distributed::ProcessGroup;
use crate::utils::error::{FsdpError, Result};
use crate::utils::metrics;
use candle_core::Tensor;
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Hook executed on the communication stream before a collective.
pub type DelayHook = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    AllGather,
    ReduceScatter,
    Marker,
}

impl CollectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectiveKind::AllGather => "all_gather",
            CollectiveKind::ReduceScatter => "reduce_scatter",
            CollectiveKind::Marker => "marker",
        }
    }
}

/// Optional hooks run on the communication stream before each collective.
#[derive(Clone, Default)]
pub struct CommHooks {
    pub before_all_gather: Option<DelayHook>,
    pub before_reduce_scatter: Option<DelayHook>,
}

impl CommHooks {
    /// Hooks that sleep for the given durations.
    pub fn with_delays(all_gather: Option<Duration>, reduce_scatter: Option<Duration>) -> Self {
        let sleep = |d: Duration| -> DelayHook { Arc::new(move || thread::sleep(d)) };
        Self {
            before_all_gather: all_gather.map(sleep),
            before_reduce_scatter: reduce_scatter.map(sleep),
        }
    }

    fn for_kind(&self, kind: CollectiveKind) -> Option<DelayHook> {
        match kind {
            CollectiveKind::AllGather => self.before_all_gather.clone(),
            CollectiveKind::ReduceScatter => self.before_reduce_scatter.clone(),
            CollectiveKind::Marker => None,
        }
    }
}

impl std::fmt::Debug for CommHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommHooks")
            .field("before_all_gather", &self.before_all_gather.is_some())
            .field("before_reduce_scatter", &self.before_reduce_scatter.is_some())
            .finish()
    }
}

/// The per-rank communication stream.
pub struct CommStream {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl CommStream {
    pub fn spawn(rank: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name(format!("fsdp-comm-{}", rank))
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn submit(&self, op: &'static str, job: Job) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| FsdpError::comm_failure(op, "communication stream is shut down"))?;
        sender
            .send(job)
            .map_err(|_| FsdpError::comm_failure(op, "communication stream has exited"))
    }
}

impl Drop for CommStream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain queued jobs and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("communication stream thread panicked");
            }
        }
    }
}

/// One in-flight collective. Consumed by `wait`, so it is waited at most once.
#[must_use = "a collective handle must be waited before its result is used"]
pub struct CommHandle<T> {
    seq: u64,
    kind: CollectiveKind,
    label: String,
    receiver: Receiver<candle_core::Result<T>>,
    issued_at: Instant,
    waited: bool,
}

impl<T> CommHandle<T> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> CollectiveKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the result is ready; waiting will not block.
    pub fn is_complete(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Block until the collective finishes. Transport errors surface here
    /// as `CommunicationFailure`.
    pub fn wait(mut self) -> Result<T> {
        self.waited = true;
        let op = self.kind.as_str();
        let outcome = self.receiver.recv().map_err(|_| {
            FsdpError::comm_failure(op, "communication stream dropped the result")
        })?;

        let elapsed = self.issued_at.elapsed().as_secs_f64();
        metrics::record_collective_completed(op, elapsed, outcome.is_ok());
        trace!(seq = self.seq, op, label = %self.label, elapsed, "collective waited");

        outcome.map_err(|e| FsdpError::comm_failure(op, e))
    }
}

impl<T> Drop for CommHandle<T> {
    fn drop(&mut self) {
        if !self.waited && !thread::panicking() {
            warn!(
                seq = self.seq,
                op = self.kind.as_str(),
                label = %self.label,
                "collective handle dropped without wait"
            );
        }
    }
}

/// Issues collectives onto the communication stream.
pub struct CommScheduler {
    rank: usize,
    stream: CommStream,
    hooks: CommHooks,
    next_seq: u64,
    all_gathers: u64,
    reduce_scatters: u64,
}

impl CommScheduler {
    pub fn new(rank: usize) -> Result<Self> {
        Ok(Self {
            rank,
            stream: CommStream::spawn(rank)?,
            hooks: CommHooks::default(),
            next_seq: 0,
            all_gathers: 0,
            reduce_scatters: 0,
        })
    }

    pub fn with_hooks(mut self, hooks: CommHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn set_hooks(&mut self, hooks: CommHooks) {
        self.hooks = hooks;
    }

    pub fn hooks(&self) -> &CommHooks {
        &self.hooks
    }

    /// Number of all-gathers issued so far.
    pub fn all_gathers_issued(&self) -> u64 {
        self.all_gathers
    }

    /// Number of reduce-scatters issued so far.
    pub fn reduce_scatters_issued(&self) -> u64 {
        self.reduce_scatters
    }

    fn issue<T, F>(&mut self, kind: CollectiveKind, label: &str, op: F) -> Result<CommHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> candle_core::Result<T> + Send + 'static,
    {
        let seq = self.next_seq;
        self.next_seq += 1;

        let (tx, rx) = channel::bounded(1);
        let hook = self.hooks.for_kind(kind);
        self.stream.submit(
            kind.as_str(),
            Box::new(move || {
                if let Some(hook) = hook {
                    hook();
                }
                // The receiver may be gone if the handle was dropped unwaited.
                let _ = tx.send(op());
            }),
        )?;

        match kind {
            CollectiveKind::AllGather => self.all_gathers += 1,
            CollectiveKind::ReduceScatter => self.reduce_scatters += 1,
            CollectiveKind::Marker => {}
        }
        if kind != CollectiveKind::Marker {
            metrics::record_collective_issued(kind.as_str());
        }
        debug!(rank = self.rank, seq, op = kind.as_str(), label, "collective issued");

        Ok(CommHandle {
            seq,
            kind,
            label: label.to_string(),
            receiver: rx,
            issued_at: Instant::now(),
            waited: false,
        })
    }

    /// Gather every member's flat `local_shard` into one `[n * len]` buffer.
    pub fn schedule_all_gather(
        &mut self,
        group: &ProcessGroup,
        label: &str,
        local_shard: Tensor,
    ) -> Result<CommHandle<Tensor>> {
        let comm = group.communicator.clone();
        self.issue(CollectiveKind::AllGather, label, move || {
            comm.all_gather(&local_shard)
        })
    }

    /// Sum a rank-major `[n * len]` gradient buffer across members; each keeps its `[len]` chunk.
    pub fn schedule_reduce_scatter(
        &mut self,
        group: &ProcessGroup,
        label: &str,
        local_grad: Tensor,
    ) -> Result<CommHandle<Tensor>> {
        let comm = group.communicator.clone();
        self.issue(CollectiveKind::ReduceScatter, label, move || {
            comm.reduce_scatter(&local_grad)
        })
    }

    /// Wait until every collective submitted so far has run.
    pub fn synchronize(&mut self) -> Result<()> {
        let marker = self.issue(CollectiveKind::Marker, "sync", || Ok(()))?;
        marker.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::CollectiveCommunicator;
    use candle_core::Device;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FailingCommunicator;

    impl CollectiveCommunicator for FailingCommunicator {
        fn rank(&self) -> usize {
            0
        }

        fn world_size(&self) -> usize {
            1
        }

        fn all_reduce(&self, _: &Tensor) -> candle_core::Result<Tensor> {
            Err(candle_core::Error::Msg("link down".to_string()))
        }
        fn all_gather(&self, _: &Tensor) -> candle_core::Result<Tensor> {
            Err(candle_core::Error::Msg("link down".to_string()))
        }
        fn broadcast(&self, _: &Tensor, _: usize) -> candle_core::Result<Tensor> {
            Err(candle_core::Error::Msg("link down".to_string()))
        }
    }

    #[test]
    fn test_all_gather_single_rank() -> Result<()> {
        let group = ProcessGroup::solo(0)?;
        let mut sched = CommScheduler::new(0)?;
        let shard = Tensor::new(&[1.0f32, 2.0], &Device::Cpu)?;

        let handle = sched.schedule_all_gather(&group, "g", shard)?;
        assert_eq!(handle.kind(), CollectiveKind::AllGather);
        assert_eq!(handle.wait()?.to_vec1::<f32>()?, vec![1.0, 2.0]);
        assert_eq!(sched.all_gathers_issued(), 1);
        Ok(())
    }

    #[test]
    fn test_hooks_run_on_comm_stream() -> Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let hook: DelayHook = Arc::new(move || {
            let name = thread::current().name().map(str::to_string);
            record.lock().unwrap().push(name);
        });

        let group = ProcessGroup::solo(0)?;
        let mut sched = CommScheduler::new(3)?.with_hooks(CommHooks {
            before_all_gather: Some(hook.clone()),
            before_reduce_scatter: Some(hook),
        });

        let t = Tensor::new(&[1.0f32], &Device::Cpu)?;
        sched.schedule_all_gather(&group, "g", t.clone())?.wait()?;
        sched.schedule_reduce_scatter(&group, "g", t)?.wait()?;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|n| n.as_deref() == Some("fsdp-comm-3")));
        Ok(())
    }

    #[test]
    fn test_delay_does_not_block_submission() -> Result<()> {
        let group = ProcessGroup::solo(0)?;
        let mut sched = CommScheduler::new(0)?
            .with_hooks(CommHooks::with_delays(Some(Duration::from_millis(50)), None));

        let start = Instant::now();
        let handle = sched.schedule_all_gather(&group, "g", Tensor::new(&[1.0f32], &Device::Cpu)?)?;
        assert!(start.elapsed() < Duration::from_millis(50));
        handle.wait()?;
        assert!(start.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn test_fifo_completion_order() -> Result<()> {
        let order = Arc::new(AtomicUsize::new(0));
        let first = order.clone();
        let group = ProcessGroup::solo(0)?;
        let mut sched = CommScheduler::new(0)?.with_hooks(CommHooks {
            before_all_gather: Some(Arc::new(move || {
                thread::sleep(Duration::from_millis(10));
                first.fetch_add(1, Ordering::SeqCst);
            })),
            before_reduce_scatter: None,
        });

        let t = Tensor::new(&[1.0f32], &Device::Cpu)?;
        let ag = sched.schedule_all_gather(&group, "a", t.clone())?;
        let rs = sched.schedule_reduce_scatter(&group, "b", t)?;
        assert!(ag.seq() < rs.seq());

        rs.wait()?;
        // the earlier all-gather has already run by the time the later reduce completes
        assert_eq!(order.load(Ordering::SeqCst), 1);
        assert!(ag.is_complete());
        ag.wait()?;
        Ok(())
    }

    #[test]
    fn test_transport_error_surfaces_at_wait() -> Result<()> {
        let group = ProcessGroup::new(Arc::new(FailingCommunicator), vec![0]);
        let mut sched = CommScheduler::new(0)?;

        let handle = sched.schedule_all_gather(&group, "g", Tensor::new(&[1.0f32], &Device::Cpu)?)?;
        match handle.wait() {
            Err(FsdpError::CommunicationFailure { op, reason }) => {
                assert_eq!(op, "all_gather");
                assert!(reason.contains("link down"));
            }
            other => panic!("expected communication failure, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[test]
    fn test_synchronize_drains_stream() -> Result<()> {
        let group = ProcessGroup::solo(0)?;
        let mut sched = CommScheduler::new(0)?
            .with_hooks(CommHooks::with_delays(None, Some(Duration::from_millis(20))));

        let handle = sched.schedule_reduce_scatter(&group, "g", Tensor::new(&[2.0f32], &Device::Cpu)?)?;
        sched.synchronize()?;
        assert!(handle.is_complete());
        handle.wait()?;
        Ok(())
    }
}
