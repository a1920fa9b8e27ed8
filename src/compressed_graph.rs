use std::collections::BTreeMap;
use std::mem;

use itertools::Itertools;

use crate::graph::{EdgeList, VInt};
use crate::partition::PartitionAssignment;

/// One row entry `(row vertex, column vertex, weight)` in global ids.
pub type RowEntry = (VInt, VInt, f64);

/// Compressed-row adjacency of the vertices owned by one partition.
///
/// Rows are the owned vertices in ascending global id. Row `i` spans
/// `columns[row_offsets[i]..row_offsets[i + 1]]`, columns sorted and unique,
/// with `weights` aligned by index. A generation is immutable: aggregation
/// produces the next generation instead of editing this one.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedGraph {
    generation: u32,
    global_vertex_count: u32,
    vertices: Vec<VInt>,
    row_offsets: Vec<usize>,
    columns: Vec<VInt>,
    weights: Vec<f64>,
}

impl CompressedGraph {
    /// Build a generation from the row entries of the owned `vertices`.
    /// Entries whose row vertex is not owned are ignored; parallel entries
    /// are summed.
    pub fn build(
        generation: u32,
        global_vertex_count: u32,
        mut vertices: Vec<VInt>,
        entries: &[RowEntry],
    ) -> CompressedGraph {
        vertices.sort_unstable();
        vertices.dedup();
        let local_count = vertices.len();

        // Count the entries of every row, then prefix-sum into offsets.
        let mut counts = vec![0usize; local_count];
        let mut slots = Vec::with_capacity(entries.len());
        for (src, _, _) in entries {
            let slot = vertices.binary_search(src).ok();
            if let Some(row) = slot {
                counts[row] += 1;
            }
            slots.push(slot);
        }
        let mut row_offsets = Vec::with_capacity(local_count + 1);
        row_offsets.push(0usize);
        for count in &counts {
            let last = *row_offsets.last().unwrap_or(&0);
            row_offsets.push(last + count);
        }

        // Scatter every entry to the next free slot of its row.
        let total = *row_offsets.last().unwrap_or(&0);
        let mut cursor = row_offsets.clone();
        let mut columns = vec![0 as VInt; total];
        let mut weights = vec![0f64; total];
        for ((_, dst, weight), slot) in entries.iter().zip(slots) {
            if let Some(row) = slot {
                columns[cursor[row]] = *dst;
                weights[cursor[row]] = *weight;
                cursor[row] += 1;
            }
        }

        let mut graph = CompressedGraph {
            generation,
            global_vertex_count,
            vertices,
            row_offsets,
            columns,
            weights,
        };
        graph.normalize_rows();
        graph
    }

    /// Generation zero of partition `partition_id`: every record becomes two
    /// row entries, a self-loop becomes one entry of twice its weight.
    pub fn from_edge_list(
        edge_list: &EdgeList,
        assignment: &PartitionAssignment,
        partition_id: u32,
    ) -> CompressedGraph {
        let mut entries = Vec::new();
        for edge in &edge_list.edges {
            if edge.is_self_loop() {
                if assignment.owner_of(edge.src) == partition_id {
                    entries.push((edge.src, edge.src, 2.0 * edge.weight));
                }
                continue;
            }
            if assignment.owner_of(edge.src) == partition_id {
                entries.push((edge.src, edge.dst, edge.weight));
            }
            if assignment.owner_of(edge.dst) == partition_id {
                entries.push((edge.dst, edge.src, edge.weight));
            }
        }
        CompressedGraph::build(
            0,
            edge_list.info.vertex_count,
            assignment.vertices_of(partition_id),
            &entries,
        )
    }

    /// Sort each row by column and merge repeated columns.
    fn normalize_rows(&mut self) {
        let mut columns = Vec::with_capacity(self.columns.len());
        let mut weights = Vec::with_capacity(self.weights.len());
        let mut row_offsets = Vec::with_capacity(self.row_offsets.len());
        row_offsets.push(0usize);
        for row in 0..self.vertices.len() {
            let (start, end) = (self.row_offsets[row], self.row_offsets[row + 1]);
            let merged = (start..end)
                .map(|i| (self.columns[i], self.weights[i]))
                .sorted_by_key(|(column, _)| *column)
                .coalesce(|a, b| if a.0 == b.0 { Ok((a.0, a.1 + b.1)) } else { Err((a, b)) });
            for (column, weight) in merged {
                columns.push(column);
                weights.push(weight);
            }
            row_offsets.push(columns.len());
        }
        self.columns = columns;
        self.weights = weights;
        self.row_offsets = row_offsets;
    }

    /// Partial rows of the next generation. `mapping` sends every vertex of
    /// this generation to its vertex in the next one. Edges internal to a
    /// community land on its diagonal once per endpoint, so the self-loop of
    /// a collapsed community carries twice the internal edge weight.
    pub fn collapse(&self, mapping: &[VInt]) -> BTreeMap<(VInt, VInt), f64> {
        let mut collapsed = BTreeMap::new();
        for row in 0..self.vertices.len() {
            let from = mapping[self.vertices[row] as usize];
            let (columns, weights) = self.row(row);
            for (column, weight) in columns.iter().zip(weights) {
                *collapsed.entry((from, mapping[*column as usize])).or_insert(0.0) += *weight;
            }
        }
        collapsed
    }

    /// Collapse and rebuild in one step when this partition owns every vertex.
    pub fn rebuild(&self, mapping: &[VInt], next_vertex_count: u32) -> CompressedGraph {
        let entries: Vec<RowEntry> = self.collapse(mapping)
            .into_iter()
            .map(|((src, dst), weight)| (src, dst, weight))
            .collect();
        CompressedGraph::build(
            self.generation + 1,
            next_vertex_count,
            (0..next_vertex_count).collect(),
            &entries,
        )
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn global_vertex_count(&self) -> u32 {
        self.global_vertex_count
    }

    /// Number of rows held by this partition.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn entry_count(&self) -> usize {
        self.columns.len()
    }

    pub fn vertices(&self) -> &[VInt] {
        &self.vertices
    }

    #[inline]
    pub fn vertex(&self, row: usize) -> VInt {
        self.vertices[row]
    }

    pub fn local_index(&self, vertex: VInt) -> Option<usize> {
        self.vertices.binary_search(&vertex).ok()
    }

    /// Columns and weights of one row.
    #[inline]
    pub fn row(&self, row: usize) -> (&[VInt], &[f64]) {
        let (start, end) = (self.row_offsets[row], self.row_offsets[row + 1]);
        (&self.columns[start..end], &self.weights[start..end])
    }

    /// Weighted degree of a row, self-loop included.
    pub fn degree_weight(&self, row: usize) -> f64 {
        self.row(row).1.iter().sum()
    }

    /// Sum of all entry weights in this partition.
    pub fn total_row_weight(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn memory_usage(&self) -> usize {
        mem::size_of::<Self>()
            + self.vertices.capacity() * mem::size_of::<VInt>()
            + self.row_offsets.capacity() * mem::size_of::<usize>()
            + self.columns.capacity() * mem::size_of::<VInt>()
            + self.weights.capacity() * mem::size_of::<f64>()
    }

    /// Check the structural invariants of the row layout.
    pub fn is_well_formed(&self) -> bool {
        self.row_offsets.len() == self.vertices.len() + 1
            && self.row_offsets.first() == Some(&0)
            && self.row_offsets.last() == Some(&self.columns.len())
            && self.columns.len() == self.weights.len()
            && self.row_offsets.windows(2).all(|w| w[0] <= w[1])
            && self.columns.iter().all(|c| *c < self.global_vertex_count)
            && (0..self.vertices.len()).all(|row| self.row(row).0.windows(2).all(|w| w[0] < w[1]))
    }
}
