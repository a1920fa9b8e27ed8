use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use plato_louvain::cluster;
use plato_louvain::config::{Cli, LouvainConfig};
use plato_louvain::error::LouvainError;
use plato_louvain::logger::init_logger;

fn main() -> ExitCode {
    let config = match LouvainConfig::from_cli(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            // No log file is known yet, report on stderr.
            if let Err(log_error) = init_logger(None) {
                eprintln!("cannot initialize logging: {}", log_error);
            }
            error!("{}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = init_logger(config.log_file.as_deref()) {
        eprintln!("cannot initialize logging: {}", e);
        return ExitCode::from(1);
    }

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let configuration = e.downcast_ref::<LouvainError>()
                .map(LouvainError::is_configuration)
                .unwrap_or(false);
            ExitCode::from(if configuration { 1 } else { 2 })
        }
    }
}

fn run(config: &LouvainConfig) -> anyhow::Result<()> {
    let start = Instant::now();
    info!("input: {}, output: {}, workers: {}, threads: {}",
          config.input.display(), config.output.display(), config.workers, config.threads);
    let summary = cluster::run(config)
        .with_context(|| format!("community detection on {} failed", config.input.display()))?;
    info!("{} vertices, {} edges, {} communities, modularity {:.6} after {} rounds",
          summary.vertex_count, summary.edge_count, summary.community_count,
          summary.modularity, summary.rounds);
    info!("wrote {} parts to {}", summary.parts.len(), config.output.display());
    info!("total cost: {:.3}", start.elapsed().as_secs_f64());
    Ok(())
}
