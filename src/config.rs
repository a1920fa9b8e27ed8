use std::fs::File;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::error::{LouvainError, Result};

pub(crate) const READ_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Above this fraction of malformed records the load is rejected.
pub(crate) const MAX_MALFORMED_FRACTION: f64 = 0.1;

/// A partition carrying more than this multiple of the mean load is reported.
pub(crate) const IMBALANCE_THRESHOLD: f64 = 1.5;

/// Smallest modularity improvement counted as a real gain.
pub(crate) const GAIN_EPSILON: f64 = 1e-12;

pub(crate) const DEFAULT_BARRIER_TIMEOUT_SECS: u64 = 600;

/// Command line of the `fast_unfolding` binary. Flags are given as
/// `--name=value` or `--name value`.
#[derive(Parser, Debug, Default)]
#[command(name = "fast_unfolding", about = "Distributed Louvain community detection")]
pub struct Cli {
    /// input file, in csv format (src,dst[,weight])
    #[arg(long)]
    pub input: Option<PathBuf>,
    /// output directory, one part-NNNNN.csv per worker thread
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// is graph directed or not
    #[arg(long = "is_directed")]
    pub is_directed: Option<bool>,
    /// alpha value used in sequence balance partition
    #[arg(long, allow_negative_numbers = true)]
    pub alpha: Option<i32>,
    /// partition by in-degree
    #[arg(long = "part_by_in_degree", alias = "part_by_in")]
    pub part_by_in_degree: Option<bool>,
    /// outer iteration of algorithm
    #[arg(long = "outer_iteration", allow_negative_numbers = true)]
    pub outer_iteration: Option<i32>,
    /// inner iteration of algorithm
    #[arg(long = "inner_iteration", allow_negative_numbers = true)]
    pub inner_iteration: Option<i32>,
    /// number of workers (partitions)
    #[arg(long)]
    pub workers: Option<u32>,
    /// threads per worker
    #[arg(long)]
    pub threads: Option<u32>,
    /// seconds a worker waits at a synchronization point
    #[arg(long = "barrier_timeout_secs")]
    pub barrier_timeout_secs: Option<u64>,
    /// append logs to this file instead of stderr
    #[arg(long = "log_file")]
    pub log_file: Option<PathBuf>,
    /// yaml file providing defaults for any of the options above
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Resolved settings of a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LouvainConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub is_directed: bool,
    pub alpha: i32,
    pub part_by_in_degree: bool,
    pub outer_iteration: i32,
    pub inner_iteration: i32,
    pub workers: u32,
    pub threads: u32,
    pub barrier_timeout_secs: u64,
    pub log_file: Option<PathBuf>,
}

impl Default for LouvainConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            is_directed: false,
            alpha: -1,
            part_by_in_degree: false,
            outer_iteration: 3,
            inner_iteration: 2,
            workers: 1,
            threads: num_cpus::get_physical() as u32,
            barrier_timeout_secs: DEFAULT_BARRIER_TIMEOUT_SECS,
            log_file: None,
        }
    }
}

impl LouvainConfig {
    /// Load settings from a yaml file, missing keys keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| LouvainError::Configuration(
            format!("cannot open config file {}: {}", path.display(), e)))?;
        serde_yaml::from_reader(file).map_err(|e| LouvainError::Configuration(
            format!("cannot parse config file {}: {}", path.display(), e)))
    }

    /// Merge the command line over the yaml file (if any) over the defaults.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        if let Some(input) = cli.input { config.input = input; }
        if let Some(output) = cli.output { config.output = output; }
        if let Some(is_directed) = cli.is_directed { config.is_directed = is_directed; }
        if let Some(alpha) = cli.alpha { config.alpha = alpha; }
        if let Some(by_in) = cli.part_by_in_degree { config.part_by_in_degree = by_in; }
        if let Some(outer) = cli.outer_iteration { config.outer_iteration = outer; }
        if let Some(inner) = cli.inner_iteration { config.inner_iteration = inner; }
        if let Some(workers) = cli.workers { config.workers = workers; }
        if let Some(threads) = cli.threads { config.threads = threads; }
        if let Some(timeout) = cli.barrier_timeout_secs { config.barrier_timeout_secs = timeout; }
        if cli.log_file.is_some() { config.log_file = cli.log_file; }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(LouvainError::Configuration("input path is required".to_owned()));
        }
        if self.output.as_os_str().is_empty() {
            return Err(LouvainError::Configuration("output directory is required".to_owned()));
        }
        if self.outer_iteration <= 0 {
            return Err(LouvainError::Configuration(
                format!("outer_iteration must be positive, got {}", self.outer_iteration)));
        }
        if self.inner_iteration <= 0 {
            return Err(LouvainError::Configuration(
                format!("inner_iteration must be positive, got {}", self.inner_iteration)));
        }
        if self.workers == 0 {
            return Err(LouvainError::Configuration("workers must be positive".to_owned()));
        }
        if self.threads == 0 {
            return Err(LouvainError::Configuration("threads must be positive".to_owned()));
        }
        if self.barrier_timeout_secs == 0 {
            return Err(LouvainError::Configuration("barrier_timeout_secs must be positive".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod config_test {
    use std::io::Write;
    use std::path::PathBuf;

    use clap::Parser;

    use crate::config::{Cli, LouvainConfig};

    #[test]
    fn test_defaults_from_flags() {
        let cli = Cli::parse_from(["fast_unfolding", "--input", "g.csv", "--output", "out"]);
        let config = LouvainConfig::from_cli(cli).unwrap();
        assert_eq!(config.input, PathBuf::from("g.csv"));
        assert!(!config.is_directed);
        assert_eq!(config.alpha, -1);
        assert!(!config.part_by_in_degree);
        assert_eq!(config.outer_iteration, 3);
        assert_eq!(config.inner_iteration, 2);
        assert_eq!(config.workers, 1);
        assert!(config.threads >= 1);
    }

    #[test]
    fn test_gflags_style() {
        let cli = Cli::parse_from([
            "fast_unfolding", "--input=g.csv", "--output=out", "--is_directed=true",
            "--alpha=4", "--part_by_in=true", "--outer_iteration=5", "--inner_iteration=1",
        ]);
        let config = LouvainConfig::from_cli(cli).unwrap();
        assert!(config.is_directed);
        assert_eq!(config.alpha, 4);
        assert!(config.part_by_in_degree);
        assert_eq!(config.outer_iteration, 5);
        assert_eq!(config.inner_iteration, 1);
    }

    #[test]
    fn test_rejects_bad_settings() {
        let missing = Cli::parse_from(["fast_unfolding", "--output", "out"]);
        assert!(LouvainConfig::from_cli(missing).unwrap_err().is_configuration());

        let zero = Cli::parse_from(["fast_unfolding", "--input", "g", "--output", "o",
                                    "--outer_iteration", "0"]);
        assert!(LouvainConfig::from_cli(zero).unwrap_err().is_configuration());

        let negative = Cli::parse_from(["fast_unfolding", "--input", "g", "--output", "o",
                                        "--inner_iteration=-2"]);
        assert!(LouvainConfig::from_cli(negative).unwrap_err().is_configuration());

        let no_workers = Cli::parse_from(["fast_unfolding", "--input", "g", "--output", "o",
                                          "--workers", "0"]);
        assert!(LouvainConfig::from_cli(no_workers).unwrap_err().is_configuration());
    }

    #[test]
    fn test_yaml_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "input: from_yaml.csv\noutput: yaml_out\nouter_iteration: 7\nworkers: 2").unwrap();
        let path = file.path().to_str().unwrap().to_owned();
        let cli = Cli::parse_from(["fast_unfolding", "--config", &path, "--output", "cli_out"]);
        let config = LouvainConfig::from_cli(cli).unwrap();
        assert_eq!(config.input, PathBuf::from("from_yaml.csv"));
        assert_eq!(config.output, PathBuf::from("cli_out"));
        assert_eq!(config.outer_iteration, 7);
        assert_eq!(config.inner_iteration, 2);
        assert_eq!(config.workers, 2);
    }
}
