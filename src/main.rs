use fully_shard::distributed::{run_local_ranks, DeviceMesh};
use fully_shard::training::{run_rank, ParityReport};
use fully_shard::utils::config::FsdpConfig;
use fully_shard::utils::error::Result;
use fully_shard::utils::logging::{self, LogFormat};
use fully_shard::utils::metrics;
use std::sync::Arc;
use tracing::{error, info};

/// Relative loss tolerance between the sharded and the replicated run.
const LOSS_TOLERANCE: f32 = 1e-4;

fn load_config() -> Result<FsdpConfig> {
    match std::env::args().nth(1) {
        Some(path) => FsdpConfig::from_file_with_env(path),
        None => Ok(FsdpConfig::from_env()),
    }
}

#[cfg(feature = "metrics-server")]
fn spawn_metrics_server() {
    let Some(port) = std::env::var("FSDP_METRICS_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
    else {
        return;
    };
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!(error = %e, "failed to start metrics runtime");
                return;
            }
        };
        if let Err(e) = runtime.block_on(metrics::start_metrics_server(port)) {
            error!(error = %e, "metrics server stopped");
        }
    });
}

fn main() -> Result<()> {
    let config = load_config()?;
    logging::init_logging_with_format(LogFormat::parse(&config.log_format));
    config.validate()?;

    #[cfg(feature = "metrics-server")]
    spawn_metrics_server();

    let world_size = config.training.world_size;
    let mesh = Arc::new(DeviceMesh::new(
        (0..world_size).collect(),
        config.engine.mesh_shape.clone(),
    )?);
    info!(
        world_size,
        mesh = ?config.engine.mesh_shape,
        steps = config.training.steps,
        layers = config.training.num_layers,
        prefetch = config.engine.forward_prefetch,
        "Starting sharded training"
    );

    let reports: Vec<ParityReport> = run_local_ranks(mesh, |ctx| run_rank(&config, ctx))?;

    println!("{:>4} {:>6} {:>14} {:>14} {:>10}", "rank", "step", "reference", "sharded", "diff");
    for report in &reports {
        for s in &report.steps {
            println!(
                "{:>4} {:>6} {:>14.6} {:>14.6} {:>10.2e}",
                report.rank,
                s.step,
                s.reference,
                s.sharded,
                s.abs_diff()
            );
        }
    }

    for report in &reports {
        if let Err(e) = report.check(LOSS_TOLERANCE) {
            error!(rank = report.rank, error = %e, "sharded run diverged");
            return Err(e);
        }
    }

    let worst = reports.iter().map(ParityReport::max_abs_diff).fold(0.0, f32::max);
    info!(max_abs_diff = worst, "Sharded and replicated losses match");
    if let Ok(text) = metrics::get_metrics().gather() {
        tracing::debug!(metrics = %text, "final metrics");
    }
    Ok(())
}
