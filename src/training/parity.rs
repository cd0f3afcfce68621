//! Sharded-versus-replicated training parity.
//!
//! Every rank trains the same MLP stack twice from the same seed: once
//! through `FullyShard` and once fully replicated with gradients averaged by
//! all-reduce. Both see the same per-rank batches and the same Adam settings,
//! so their losses must agree at every step.

use crate::distributed::{synchronize_gradients, RankContext};
use crate::fsdp::{CommHooks, FsdpStats, FullyShard};
use crate::model::mlp::{randn, MlpParams, ReplicatedModel, ShardedSequential};
use crate::utils::config::FsdpConfig;
use crate::utils::error::{FsdpError, Result};
use crate::utils::metrics;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

/// Hidden width multiplier of every MLP block.
pub const MLP_MULTIPLIER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    pub step: usize,
    pub reference: f32,
    pub sharded: f32,
}

impl StepLosses {
    pub fn abs_diff(&self) -> f32 {
        (self.reference - self.sharded).abs()
    }
}

#[derive(Debug, Clone)]
pub struct ParityReport {
    pub rank: usize,
    pub steps: Vec<StepLosses>,
    pub stats: FsdpStats,
}

impl ParityReport {
    pub fn max_abs_diff(&self) -> f32 {
        self.steps.iter().map(StepLosses::abs_diff).fold(0.0, f32::max)
    }

    /// Fail with the first step whose losses differ by more than `tol`
    /// relative to the reference.
    pub fn check(&self, tol: f32) -> Result<()> {
        for s in &self.steps {
            if s.abs_diff() > tol * s.reference.abs().max(1.0) {
                return Err(FsdpError::LossMismatch {
                    rank: self.rank,
                    step: s.step,
                    sharded: s.sharded,
                    reference: s.reference,
                });
            }
        }
        Ok(())
    }
}

fn adam(vars: Vec<candle_core::Var>, lr: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr,
        weight_decay: 0.0,
        ..ParamsAdamW::default()
    };
    Ok(AdamW::new(vars, params)?)
}

/// Train the configured MLP stack on one rank and return both loss curves.
///
/// All ranks of the mesh must run this with the same `config`.
pub fn run_rank(config: &FsdpConfig, ctx: RankContext) -> Result<ParityReport> {
    let rank = ctx.rank;
    let train = &config.training;
    let delays = &config.delays;
    let reference_group = ctx.group(config.engine.shard_mesh_dim)?.clone();

    let mut fsdp = FullyShard::from_context(config.engine.clone(), ctx)?;
    fsdp.set_comm_hooks(CommHooks::with_delays(
        delays.before_all_gather(),
        delays.before_reduce_scatter(),
    ));
    let device = fsdp.device().clone();

    let mut init_rng = StdRng::seed_from_u64(train.seed);
    let blocks = (0..train.num_layers)
        .map(|_| MlpParams::init(&mut init_rng, train.hidden_dim, MLP_MULTIPLIER, &device))
        .collect::<Result<Vec<_>>>()?;

    let reference = ReplicatedModel::mlp_stack(&blocks)?;
    let mut reference_optim = adam(reference.vars(), train.learning_rate)?;
    let model = ShardedSequential::register(&mut fsdp, &blocks)?;
    let mut optim = adam(fsdp.sharded_vars(), train.learning_rate)?;

    let mut data_rng = StdRng::seed_from_u64(train.seed + rank as u64 + 1);
    let mut steps = Vec::with_capacity(train.steps);

    for step in 0..train.steps {
        let start = Instant::now();
        let input = randn(&mut data_rng, train.batch_size, train.hidden_dim, &device)?;

        // Shares the engine's communicator; its stream is idle here because
        // the previous backward waited every collective.
        let ref_loss = reference.forward(&input)?.sum_all()?;
        let mut ref_grads = ref_loss.backward()?;
        synchronize_gradients(
            &mut ref_grads,
            &reference.vars(),
            reference_group.communicator.as_ref(),
        )?;
        reference_optim.step(&ref_grads)?;

        fsdp.zero_grad(step % 2 == 0)?;
        let loss = fsdp.forward(&model, input)?.sum_all()?;
        if let Some(d) = delays.after_forward() {
            thread::sleep(d);
        }
        let grads = fsdp.backward(&loss)?;
        if let Some(d) = delays.before_optim() {
            thread::sleep(d);
        }
        optim.step(&grads)?;

        let losses = StepLosses {
            step,
            reference: ref_loss.to_scalar::<f32>()?,
            sharded: loss.to_scalar::<f32>()?,
        };
        metrics::record_training_step(losses.sharded as f64, start.elapsed().as_secs_f64());
        debug!(
            rank,
            step,
            loss = losses.sharded,
            reference = losses.reference,
            "step done"
        );
        steps.push(losses);
    }

    let stats = fsdp.stats();
    info!(
        rank,
        steps = steps.len(),
        all_gathers = stats.all_gathers,
        reduce_scatters = stats.reduce_scatters,
        peak_unsharded = stats.max_concurrent_unsharded,
        peak_retained_bytes = stats.peak_backward_retained_bytes,
        "training finished"
    );
    Ok(ParityReport { rank, steps, stats })
}
