use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::{info, warn};

use crate::config::IMBALANCE_THRESHOLD;
use crate::error::{LouvainError, PartitionImbalanceWarning, Result};
use crate::graph::{GraphInfo, VInt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Below zero: balance vertex counts only. Otherwise the load of a
    /// partition is `edges + alpha * vertices`.
    pub alpha: i32,
    pub part_by_in_degree: bool,
    pub partition_count: u32,
}

impl PartitionConfig {
    /// Vertex-count balancing over `partition_count` partitions.
    pub fn vertex_balanced(partition_count: u32) -> Self {
        PartitionConfig { alpha: -1, part_by_in_degree: false, partition_count }
    }

    fn load(&self, edges: u64, vertices: u64) -> u64 {
        if self.alpha < 0 {
            vertices
        } else {
            edges + self.alpha as u64 * vertices
        }
    }
}

/// Owner of every vertex. Built once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionAssignment {
    owners: Vec<u32>,
    partition_count: u32,
    vertex_loads: Vec<u64>,
    edge_loads: Vec<u64>,
    config: PartitionConfig,
}

impl PartitionAssignment {
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn vertex_count(&self) -> u32 {
        self.owners.len() as u32
    }

    #[inline]
    pub fn owner_of(&self, vertex: VInt) -> u32 {
        self.owners[vertex as usize]
    }

    /// Vertices of one partition in ascending id order.
    pub fn vertices_of(&self, partition_id: u32) -> Vec<VInt> {
        self.owners.iter()
            .enumerate()
            .filter(|(_, &owner)| owner == partition_id)
            .map(|(v, _)| v as VInt)
            .collect()
    }

    pub fn vertex_load(&self, partition_id: u32) -> u64 {
        self.vertex_loads[partition_id as usize]
    }

    pub fn edge_load(&self, partition_id: u32) -> u64 {
        self.edge_loads[partition_id as usize]
    }

    /// Partitions whose weighted load exceeds the tolerated multiple of the mean.
    pub fn check_balance(&self) -> Vec<PartitionImbalanceWarning> {
        let loads: Vec<f64> = (0..self.partition_count as usize)
            .map(|p| self.config.load(self.edge_loads[p], self.vertex_loads[p]) as f64)
            .collect();
        let mean_load = loads.iter().sum::<f64>() / loads.len() as f64;
        if mean_load == 0.0 {
            return vec![];
        }
        loads.iter()
            .enumerate()
            .filter(|(_, &load)| load > IMBALANCE_THRESHOLD * mean_load)
            .map(|(p, &load)| PartitionImbalanceWarning {
                partition_id: p as u32,
                load,
                mean_load,
            })
            .collect()
    }
}

/// Greedy sequence partitioner: vertices in id order go to the partition
/// holding the least load, the lowest index winning ties.
#[derive(Debug)]
pub struct Partitioner {
    config: PartitionConfig,
}

impl Partitioner {
    pub fn new(config: PartitionConfig) -> Result<Self> {
        if config.partition_count == 0 {
            return Err(LouvainError::Configuration(
                "partition count must be positive".to_owned()));
        }
        Ok(Partitioner { config })
    }

    pub fn assign(&self, info: &GraphInfo, degrees: &[u32]) -> Result<PartitionAssignment> {
        if degrees.len() != info.vertex_count as usize {
            return Err(LouvainError::Configuration(format!(
                "degree distribution covers {} vertices, graph has {}",
                degrees.len(), info.vertex_count)));
        }
        let partition_count = self.config.partition_count as usize;
        let mut vertex_loads = vec![0u64; partition_count];
        let mut edge_loads = vec![0u64; partition_count];
        let mut owners = Vec::with_capacity(degrees.len());

        // Min-heap over (load, partition).
        let mut heap: BinaryHeap<Reverse<(u64, u32)>> = (0..partition_count as u32)
            .map(|p| Reverse((0u64, p)))
            .collect();
        for &degree in degrees {
            let Reverse((_, p)) = heap.pop().ok_or_else(|| LouvainError::Configuration(
                "no partition available".to_owned()))?;
            let idx = p as usize;
            owners.push(p);
            vertex_loads[idx] += 1;
            edge_loads[idx] += degree as u64;
            heap.push(Reverse((self.config.load(edge_loads[idx], vertex_loads[idx]), p)));
        }

        let assignment = PartitionAssignment {
            owners,
            partition_count: self.config.partition_count,
            vertex_loads,
            edge_loads,
            config: self.config,
        };
        for p in 0..self.config.partition_count {
            info!("partition {}: {} vertices, {} edges", p,
                  assignment.vertex_load(p), assignment.edge_load(p));
        }
        for warning in assignment.check_balance() {
            warn!("partition imbalance: {}", warning);
        }
        Ok(assignment)
    }

    /// Vertex-balanced assignment of `vertex_count` vertices without degree data.
    pub fn assign_uniform(vertex_count: u32, partition_count: u32) -> Result<PartitionAssignment> {
        let partitioner = Partitioner::new(PartitionConfig::vertex_balanced(partition_count))?;
        let info = GraphInfo { vertex_count, edge_count: 0, is_directed: false };
        partitioner.assign(&info, &vec![0u32; vertex_count as usize])
    }
}
