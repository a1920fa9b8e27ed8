use std::time::Duration;

use log::{error, info};

use crate::compressed_graph::CompressedGraph;
use crate::config::LouvainConfig;
use crate::context::ExecutionContext;
use crate::error::{LouvainError, Result};
use crate::exchange::Exchange;
use crate::graph::{EdgeList, VInt};
use crate::louvain::{CommId, Community, LouvainEngine, LouvainOptions, Message};
use crate::partition::{PartitionAssignment, PartitionConfig, Partitioner};
use crate::writer::{FileSinkProvider, ResultWriter, SinkProvider};

/// Topology and tuning of one run.
#[derive(Debug, Clone, Copy)]
pub struct ClusterOptions {
    pub partition: PartitionConfig,
    pub louvain: LouvainOptions,
    pub threads_per_worker: u32,
    pub barrier_timeout: Duration,
}

impl ClusterOptions {
    pub fn new(workers: u32, threads_per_worker: u32, louvain: LouvainOptions) -> Self {
        ClusterOptions {
            partition: PartitionConfig::vertex_balanced(workers),
            louvain,
            threads_per_worker,
            barrier_timeout: Duration::from_secs(crate::config::DEFAULT_BARRIER_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &LouvainConfig) -> Self {
        ClusterOptions {
            partition: PartitionConfig {
                alpha: config.alpha,
                part_by_in_degree: config.part_by_in_degree,
                partition_count: config.workers,
            },
            louvain: LouvainOptions {
                outer_iteration: config.outer_iteration.max(0) as u32,
                inner_iteration: config.inner_iteration.max(0) as u32,
            },
            threads_per_worker: config.threads,
            barrier_timeout: Duration::from_secs(config.barrier_timeout_secs),
        }
    }

    pub fn worker_count(&self) -> u32 {
        self.partition.partition_count
    }
}

/// What a worker hands back once its parts are written.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub rank: u32,
    pub parts: Vec<u32>,
    pub rounds: u32,
    pub modularity: f64,
    pub modularity_history: Vec<f64>,
    pub assignment: Vec<CommId>,
    pub communities: Vec<Community>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub vertex_count: u32,
    pub edge_count: u64,
    pub community_count: usize,
    pub modularity: f64,
    /// Modularity after every local-move pass.
    pub modularity_history: Vec<f64>,
    pub rounds: u32,
    /// Every part index written, across all workers.
    pub parts: Vec<u32>,
    /// Final community of every original vertex.
    pub assignment: Vec<CommId>,
    pub communities: Vec<Community>,
}

/// Load the input, detect communities and write the parts to the output directory.
pub fn run(config: &LouvainConfig) -> Result<RunSummary> {
    let (edge_list, load_summary) = EdgeList::from_csv_file(&config.input, config.is_directed)?;
    info!("records: {}, malformed: {}", load_summary.records, load_summary.malformed);
    let provider = FileSinkProvider::create(&config.output)?;
    run_with(&edge_list, &ClusterOptions::from_config(config), &provider)
}

/// Run all workers over an in-memory edge list, writing through `provider`.
pub fn run_with<P: SinkProvider>(
    edge_list: &EdgeList,
    options: &ClusterOptions,
    provider: &P,
) -> Result<RunSummary> {
    let partitioner = Partitioner::new(options.partition)?;
    let degrees = edge_list.degree_distribution(options.partition.part_by_in_degree);
    let assignment = partitioner.assign(&edge_list.info, &degrees)?;

    let worker_count = options.worker_count();
    let exchanges = Exchange::<Message>::mesh(worker_count, options.barrier_timeout);
    let assignment = &assignment;
    let results: Vec<Result<WorkerReport>> = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = exchanges.into_iter()
            .enumerate()
            .map(|(rank, exchange)| {
                let ctx = ExecutionContext::new(rank as u32, worker_count, options.threads_per_worker);
                scope.builder()
                    .name(format!("worker-{}", rank))
                    .spawn(move |_| run_worker(ctx, edge_list, assignment, options, exchange, provider))
            })
            .collect();
        handles.into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| Err(LouvainError::Synchronization(
                    format!("worker {} panicked", rank)))),
                Err(e) => Err(LouvainError::Io(e)),
            })
            .collect()
    }).map_err(|_| LouvainError::Synchronization("worker scope panicked".to_owned()))?;

    let mut reports = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        for e in &errors {
            error!("{}", e);
        }
        // Prefer the root cause over the peers that merely saw it.
        let root = errors.iter()
            .position(|e| !matches!(e, LouvainError::Synchronization(_)))
            .unwrap_or(0);
        return Err(errors.swap_remove(root));
    }

    let parts = reports.iter().flat_map(|r| r.parts.iter().copied()).collect();
    let first = reports.swap_remove(0);
    Ok(RunSummary {
        vertex_count: edge_list.info.vertex_count,
        edge_count: edge_list.info.edge_count,
        community_count: first.communities.len(),
        modularity: first.modularity,
        modularity_history: first.modularity_history,
        rounds: first.rounds,
        parts,
        assignment: first.assignment,
        communities: first.communities,
    })
}

fn run_worker<P: SinkProvider>(
    ctx: ExecutionContext,
    edge_list: &EdgeList,
    assignment: &PartitionAssignment,
    options: &ClusterOptions,
    exchange: Exchange<Message>,
    provider: &P,
) -> Result<WorkerReport> {
    info!("partitions: {} partition_id: {}", ctx.worker_count, ctx.worker_rank);
    let graph = CompressedGraph::from_edge_list(edge_list, assignment, ctx.worker_rank);
    let mut engine = LouvainEngine::new(ctx, options.louvain, graph, exchange)?;
    let owned = assignment.vertices_of(ctx.worker_rank);
    let outcome = drive(&mut engine, ctx, &owned, provider);
    if let Err(e) = &outcome {
        engine.abort(&e.to_string());
    }
    outcome
}

fn drive<P: SinkProvider>(
    engine: &mut LouvainEngine,
    ctx: ExecutionContext,
    owned: &[VInt],
    provider: &P,
) -> Result<WorkerReport> {
    engine.compute()?;
    let communities = engine.communities()?;
    let assignment = engine.final_assignment();
    let parts = ResultWriter::new(ctx).write(owned, &assignment, provider)?;
    Ok(WorkerReport {
        rank: ctx.worker_rank,
        parts,
        rounds: engine.rounds(),
        modularity: engine.modularity_history().last().copied().unwrap_or(0.0),
        modularity_history: engine.modularity_history().to_vec(),
        assignment,
        communities,
    })
}

#[cfg(test)]
mod cluster_test {
    use std::io::Write;

    use crate::cluster::{run, run_with, ClusterOptions};
    use crate::config::LouvainConfig;
    use crate::graph::{Edge, EdgeList};
    use crate::louvain::LouvainOptions;
    use crate::writer::{part_file_name, MemorySinkProvider};

    fn two_triangles() -> EdgeList {
        EdgeList::from_edges(vec![
            Edge::unit(0, 1), Edge::unit(1, 2), Edge::unit(2, 0),
            Edge::unit(3, 4), Edge::unit(4, 5), Edge::unit(5, 3),
        ], false)
    }

    fn ring_of_cliques(cliques: u32, size: u32) -> EdgeList {
        let mut edges = Vec::new();
        for c in 0..cliques {
            let base = c * size;
            for a in 0..size {
                for b in a + 1..size {
                    edges.push(Edge::unit(base + a, base + b));
                }
            }
            edges.push(Edge::new(base + size - 1, ((c + 1) % cliques) * size, 0.5));
        }
        EdgeList::from_edges(edges, false)
    }

    #[test]
    fn test_single_worker() {
        let provider = MemorySinkProvider::default();
        let options = ClusterOptions::new(1, 1, LouvainOptions::default());
        let summary = run_with(&two_triangles(), &options, &provider).unwrap();
        assert_eq!(summary.vertex_count, 6);
        assert_eq!(summary.edge_count, 6);
        assert_eq!(summary.community_count, 2);
        assert_eq!(summary.assignment, vec![0, 0, 0, 1, 1, 1]);
        assert!((summary.modularity - 0.5).abs() < 1e-9);
        assert_eq!(summary.parts, vec![0]);
        assert_eq!(provider.part(0).unwrap(), "0,0\n1,0\n2,0\n3,1\n4,1\n5,1\n");
    }

    #[test]
    fn test_workers_agree_on_triangles() {
        for (workers, threads) in [(2, 1), (2, 2), (3, 1)] {
            let provider = MemorySinkProvider::default();
            let options = ClusterOptions::new(workers, threads, LouvainOptions::default());
            let summary = run_with(&two_triangles(), &options, &provider).unwrap();
            assert_eq!(summary.assignment, vec![0, 0, 0, 1, 1, 1], "{}x{}", workers, threads);
            assert_eq!(summary.parts.len(), (workers * threads) as usize);
        }
    }

    #[test]
    fn test_every_vertex_written_once() {
        let edge_list = ring_of_cliques(6, 4);
        let provider = MemorySinkProvider::default();
        let options = ClusterOptions::new(3, 2, LouvainOptions::default());
        let summary = run_with(&edge_list, &options, &provider).unwrap();

        let mut seen = vec![0u32; 24];
        for text in provider.parts().values() {
            for line in text.lines() {
                let (v, c) = line.split_once(',').unwrap();
                let v: usize = v.parse().unwrap();
                let c: u32 = c.parse().unwrap();
                assert_eq!(summary.assignment[v], c);
                seen[v] += 1;
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
        let members: usize = summary.communities.iter().map(|c| c.member_vertices.len()).sum();
        assert_eq!(members, 24);
    }

    #[test]
    fn test_workers_keep_modularity() {
        let edge_list = ring_of_cliques(6, 4);
        let single = run_with(&edge_list, &ClusterOptions::new(1, 1, LouvainOptions::default()),
                              &MemorySinkProvider::default()).unwrap();
        for (workers, threads) in [(4, 1), (2, 2), (3, 2)] {
            let options = ClusterOptions::new(workers, threads, LouvainOptions { outer_iteration: 3, inner_iteration: 4 });
            let summary = run_with(&edge_list, &options, &MemorySinkProvider::default()).unwrap();
            let history = &summary.modularity_history;
            for pair in history.windows(2) {
                assert!(pair[1] >= pair[0] - 1e-9, "{}x{}: {:?}", workers, threads, history);
            }
            assert!(summary.community_count > 1);
            assert!(summary.modularity > 0.5, "{}x{}: {}", workers, threads, summary.modularity);
            assert!(summary.modularity >= single.modularity - 0.15,
                    "{}x{}: {} against {}", workers, threads, summary.modularity, single.modularity);
        }
    }

    #[test]
    fn test_reruns_are_identical() {
        let edge_list = ring_of_cliques(5, 4);
        let options = ClusterOptions::new(2, 2, LouvainOptions::default());
        let first = MemorySinkProvider::default();
        let second = MemorySinkProvider::default();
        run_with(&edge_list, &options, &first).unwrap();
        run_with(&edge_list, &options, &second).unwrap();
        assert_eq!(first.parts(), second.parts());
    }

    #[test]
    fn test_idle_worker_writes_empty_part() {
        let edge_list = EdgeList::from_edges(vec![Edge::unit(0, 1)], false);
        let provider = MemorySinkProvider::default();
        let options = ClusterOptions::new(3, 1, LouvainOptions::default());
        let summary = run_with(&edge_list, &options, &provider).unwrap();
        assert_eq!(summary.assignment, vec![0, 0]);
        assert_eq!(summary.parts, vec![0, 1, 2]);
        assert_eq!(provider.part(0).unwrap(), "0,0\n");
        assert_eq!(provider.part(1).unwrap(), "1,0\n");
        assert_eq!(provider.part(2).unwrap(), "");
    }

    #[test]
    fn test_failure_reaches_caller() {
        let provider = MemorySinkProvider::default();
        let options = ClusterOptions::new(2, 1, LouvainOptions { outer_iteration: 1, inner_iteration: 0 });
        let err = run_with(&two_triangles(), &options, &provider).unwrap_err();
        assert!(err.is_configuration());

        let options = ClusterOptions::new(0, 1, LouvainOptions::default());
        assert!(run_with(&two_triangles(), &options, &provider).unwrap_err().is_configuration());
    }

    #[test]
    fn test_run_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("graph.csv");
        let mut file = std::fs::File::create(&input).unwrap();
        writeln!(file, "# two triangles").unwrap();
        for (a, b) in [(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)] {
            writeln!(file, "{},{}", a, b).unwrap();
        }
        drop(file);

        let config = LouvainConfig {
            input,
            output: dir.path().join("out"),
            workers: 2,
            threads: 1,
            ..LouvainConfig::default()
        };
        let summary = run(&config).unwrap();
        assert_eq!(summary.community_count, 2);
        let mut lines = Vec::new();
        for part in 0..2 {
            let text = std::fs::read_to_string(config.output.join(part_file_name(part))).unwrap();
            lines.extend(text.lines().map(str::to_owned));
        }
        lines.sort();
        assert_eq!(lines, vec!["0,0", "1,0", "2,0", "3,1", "4,1", "5,1"]);
    }
}
