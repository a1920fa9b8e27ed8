use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use fixedbitset::FixedBitSet;
use log::{debug, info};
use rayon::prelude::*;

use crate::compressed_graph::{CompressedGraph, RowEntry};
use crate::config::GAIN_EPSILON;
use crate::context::ExecutionContext;
use crate::error::{LouvainError, Result};
use crate::exchange::Exchange;
use crate::graph::VInt;
use crate::partition::Partitioner;

pub type CommId = VInt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LouvainOptions {
    /// Aggregation rounds.
    pub outer_iteration: u32,
    /// Local-move passes per round.
    pub inner_iteration: u32,
}

impl Default for LouvainOptions {
    fn default() -> Self {
        LouvainOptions { outer_iteration: 3, inner_iteration: 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    LocalMove,
    Aggregate,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexState {
    pub current_community_id: CommId,
    pub degree_weight: f64,
}

/// Final community as reported after convergence.
#[derive(Debug, Clone, PartialEq)]
pub struct Community {
    pub id: CommId,
    pub member_vertices: BTreeSet<VInt>,
    /// Weight of the edges with both ends inside, each edge counted once.
    pub total_internal_weight: f64,
    pub total_degree_weight: f64,
}

/// One vertex changing community during a pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Move {
    pub vertex: VInt,
    pub from: CommId,
    pub to: CommId,
    pub degree_weight: f64,
}

/// A move as proposed by one thread, with the vertex's neighbors so that
/// every worker can check it again against the reconciled table.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub mv: Move,
    /// `(neighbor, weight)` of the vertex row, self-loop excluded.
    pub neighbors: Vec<(VInt, f64)>,
}

/// Everything workers send each other.
#[derive(Debug, Clone)]
pub enum Message {
    Degrees(Vec<(VInt, f64)>),
    Proposals(Vec<Proposal>),
    Scalar(f64),
    Entries(Vec<RowEntry>),
    Weights(Vec<(CommId, f64)>),
}

fn unexpected(expected: &str, got: &Message) -> LouvainError {
    LouvainError::Synchronization(format!("expected {} message, got {:?}", expected, got))
}

/// Community view of one generation, identical on every worker after each
/// exchange: vertex states for all vertices plus per-community totals.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CommunityTable {
    states: Vec<VertexState>,
    total: Vec<f64>,
    size: Vec<u32>,
}

impl CommunityTable {
    /// Every vertex alone in the community carrying its own id.
    pub(crate) fn singletons(degrees: &[f64]) -> Self {
        CommunityTable {
            states: degrees.iter()
                .enumerate()
                .map(|(v, &k)| VertexState { current_community_id: v as CommId, degree_weight: k })
                .collect(),
            total: degrees.to_vec(),
            size: vec![1; degrees.len()],
        }
    }

    #[inline]
    pub(crate) fn community_of(&self, vertex: VInt) -> CommId {
        self.states[vertex as usize].current_community_id
    }

    #[inline]
    pub(crate) fn degree_of(&self, vertex: VInt) -> f64 {
        self.states[vertex as usize].degree_weight
    }

    pub(crate) fn apply(&mut self, mv: &Move) {
        self.states[mv.vertex as usize].current_community_id = mv.to;
        self.total[mv.from as usize] -= mv.degree_weight;
        self.total[mv.to as usize] += mv.degree_weight;
        self.size[mv.from as usize] -= 1;
        self.size[mv.to as usize] += 1;
    }

    /// Apply `proposal` if it still strictly improves modularity on the
    /// current table. Returns whether it was applied.
    pub(crate) fn try_apply(&mut self, proposal: &Proposal, two_m: f64) -> bool {
        let mv = &proposal.mv;
        let current = self.community_of(mv.vertex);
        if two_m <= 0.0 || current != mv.from || mv.to == current {
            return false;
        }
        let (mut k_in_current, mut k_in_target) = (0f64, 0f64);
        for &(neighbor, weight) in &proposal.neighbors {
            let c = self.community_of(neighbor);
            if c == current {
                k_in_current += weight;
            } else if c == mv.to {
                k_in_target += weight;
            }
        }
        let k = mv.degree_weight;
        let stay = k_in_current - k * (self.total[current as usize] - k) / two_m;
        let gain = k_in_target - k * self.total[mv.to as usize] / two_m;
        if gain > stay + GAIN_EPSILON {
            self.apply(mv);
            true
        } else {
            false
        }
    }

    pub(crate) fn community_count(&self) -> usize {
        self.size.iter().filter(|&&s| s > 0).count()
    }

    pub(crate) fn total_degree_weight(&self) -> f64 {
        self.total.iter().sum()
    }

    /// Dense renumbering of the surviving communities, ascending by id.
    /// Returns the vertex-to-new-vertex map and the new vertex count.
    pub(crate) fn renumber(&self) -> (Vec<VInt>, u32) {
        let mut alive = FixedBitSet::with_capacity(self.size.len());
        for (c, &s) in self.size.iter().enumerate() {
            alive.set(c, s > 0);
        }
        let mut dense = vec![0 as VInt; self.size.len()];
        let mut next = 0u32;
        for c in alive.ones() {
            dense[c] = next;
            next += 1;
        }
        let mapping = self.states.iter()
            .map(|s| dense[s.current_community_id as usize])
            .collect();
        (mapping, next)
    }
}

/// Per-thread view on top of the pass snapshot: the thread sees its own
/// moves immediately and everybody else's at the next pass.
struct ThreadOverlay<'a> {
    table: &'a CommunityTable,
    moved: HashMap<VInt, CommId>,
    total_delta: HashMap<CommId, f64>,
    size_delta: HashMap<CommId, i64>,
}

impl<'a> ThreadOverlay<'a> {
    fn new(table: &'a CommunityTable) -> Self {
        ThreadOverlay {
            table,
            moved: HashMap::new(),
            total_delta: HashMap::new(),
            size_delta: HashMap::new(),
        }
    }

    fn community_of(&self, vertex: VInt) -> CommId {
        match self.moved.get(&vertex) {
            Some(&c) => c,
            None => self.table.community_of(vertex),
        }
    }

    fn total(&self, c: CommId) -> f64 {
        self.table.total[c as usize] + self.total_delta.get(&c).copied().unwrap_or(0.0)
    }

    fn size(&self, c: CommId) -> i64 {
        self.table.size[c as usize] as i64 + self.size_delta.get(&c).copied().unwrap_or(0)
    }

    fn apply(&mut self, mv: &Move) {
        self.moved.insert(mv.vertex, mv.to);
        *self.total_delta.entry(mv.from).or_insert(0.0) -= mv.degree_weight;
        *self.total_delta.entry(mv.to).or_insert(0.0) += mv.degree_weight;
        *self.size_delta.entry(mv.from).or_insert(0) -= 1;
        *self.size_delta.entry(mv.to).or_insert(0) += 1;
    }
}

/// Pick the community `vertex` should join, or `None` to stay.
///
/// `neighbor_weights` holds the edge weight from the vertex to each
/// neighboring community, self-loop excluded. The gain of joining `C` is
/// `k_in(C) - k * tot(C) / 2m`, with the vertex taken out of its current
/// community first. Candidates are scanned in ascending id, so on equal
/// gains the lowest id wins, and the current community wins over all.
fn best_community(
    overlay: &ThreadOverlay,
    current: CommId,
    k: f64,
    neighbor_weights: &BTreeMap<CommId, f64>,
    two_m: f64,
    singleton_guard: bool,
) -> Option<CommId> {
    if two_m <= 0.0 {
        return None;
    }
    let k_in_current = neighbor_weights.get(&current).copied().unwrap_or(0.0);
    let mut best = current;
    let mut best_gain = k_in_current - k * (overlay.total(current) - k) / two_m;
    let current_alone = overlay.size(current) == 1;

    for (&c, &k_in) in neighbor_weights {
        if c == current {
            continue;
        }
        // Two stale singletons could otherwise keep trading places.
        if singleton_guard && current_alone && overlay.size(c) == 1 && c > current {
            continue;
        }
        let gain = k_in - k * overlay.total(c) / two_m;
        if gain > best_gain + GAIN_EPSILON {
            best = c;
            best_gain = gain;
        }
    }
    if best != current { Some(best) } else { None }
}

/// Evaluate a contiguous run of rows, as one thread does during a pass.
fn evaluate_rows(
    graph: &CompressedGraph,
    table: &CommunityTable,
    rows: Range<usize>,
    two_m: f64,
    singleton_guard: bool,
) -> Vec<Proposal> {
    let mut overlay = ThreadOverlay::new(table);
    let mut proposals = Vec::new();
    let mut neighbor_weights = BTreeMap::<CommId, f64>::new();
    for row in rows {
        let vertex = graph.vertex(row);
        let k = table.degree_of(vertex);
        let current = overlay.community_of(vertex);

        neighbor_weights.clear();
        let (columns, weights) = graph.row(row);
        for (&neighbor, &weight) in columns.iter().zip(weights) {
            if neighbor == vertex {
                continue;
            }
            *neighbor_weights.entry(overlay.community_of(neighbor)).or_insert(0.0) += weight;
        }

        if let Some(to) = best_community(&overlay, current, k, &neighbor_weights, two_m, singleton_guard) {
            let mv = Move { vertex, from: current, to, degree_weight: k };
            overlay.apply(&mv);
            let neighbors = columns.iter()
                .zip(weights)
                .filter(|(neighbor, _)| **neighbor != vertex)
                .map(|(&neighbor, &weight)| (neighbor, weight))
                .collect();
            proposals.push(Proposal { mv, neighbors });
        }
    }
    proposals
}

/// Contiguous row ranges, one per thread.
fn thread_ranges(rows: usize, threads: usize) -> Vec<Range<usize>> {
    let threads = threads.max(1);
    let chunk = rows.div_ceil(threads);
    (0..threads)
        .map(|t| {
            let start = (t * chunk).min(rows);
            start..(start + chunk).min(rows)
        })
        .collect()
}

/// The Louvain engine of one worker. All workers drive their engines in
/// lockstep; every decision is taken on data that went through the exchange,
/// so all of them reach the same phase transitions.
pub struct LouvainEngine {
    ctx: ExecutionContext,
    options: LouvainOptions,
    graph: CompressedGraph,
    table: CommunityTable,
    exchange: Exchange<Message>,
    pool: rayon::ThreadPool,
    phase: Phase,
    two_m: Option<f64>,
    levels: Vec<Vec<VInt>>,
    modularity_history: Vec<f64>,
    rounds: u32,
}

impl LouvainEngine {
    pub fn new(
        ctx: ExecutionContext,
        options: LouvainOptions,
        graph: CompressedGraph,
        exchange: Exchange<Message>,
    ) -> Result<Self> {
        if options.outer_iteration == 0 || options.inner_iteration == 0 {
            let reason = "iteration counts must be positive".to_owned();
            exchange.abort(&reason);
            return Err(LouvainError::Configuration(reason));
        }
        let rank = ctx.worker_rank;
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(ctx.threads_per_worker.max(1) as usize)
            .thread_name(move |t| format!("louvain-{}-{}", rank, t))
            .build() {
            Ok(pool) => pool,
            Err(e) => {
                let reason = format!("cannot start worker threads: {}", e);
                exchange.abort(&reason);
                return Err(LouvainError::Configuration(reason));
            }
        };
        Ok(LouvainEngine {
            ctx,
            options,
            graph,
            table: CommunityTable::singletons(&[]),
            exchange,
            pool,
            phase: Phase::Init,
            two_m: None,
            levels: Vec::new(),
            modularity_history: Vec::new(),
            rounds: 0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Modularity after every local-move pass, in order.
    pub fn modularity_history(&self) -> &[f64] {
        &self.modularity_history
    }

    pub fn total_edge_weight(&self) -> f64 {
        self.two_m.unwrap_or(0.0) / 2.0
    }

    pub fn graph(&self) -> &CompressedGraph {
        &self.graph
    }

    /// States of the vertices owned by this worker in the current generation.
    pub fn vertex_states(&self) -> Vec<VertexState> {
        self.graph.vertices().iter().map(|&v| self.table.states[v as usize]).collect()
    }

    pub fn community_count(&self) -> usize {
        self.table.community_count()
    }

    pub(crate) fn table(&self) -> &CommunityTable {
        &self.table
    }

    /// Tell the other workers this one failed.
    pub fn abort(&self, reason: &str) {
        self.exchange.abort(reason);
    }

    /// Run the state machine to `Done`.
    pub fn compute(&mut self) -> Result<()> {
        info!("outer_iteration: {} inner_iteration: {}",
              self.options.outer_iteration, self.options.inner_iteration);
        while self.step()? != Phase::Done {}
        info!("done after {} rounds, {} communities", self.rounds, self.table.community_count());
        Ok(())
    }

    /// Perform one state transition and return the new phase.
    pub fn step(&mut self) -> Result<Phase> {
        match self.phase {
            Phase::Init => {
                self.init_generation()?;
                self.phase = Phase::LocalMove;
            }
            Phase::LocalMove => {
                self.rounds += 1;
                for pass in 0..self.options.inner_iteration {
                    let moves = self.local_move_pass()?;
                    let q = self.modularity()?;
                    self.modularity_history.push(q);
                    info!("round {} pass {}: {} moves, {} communities, modularity {:.6}",
                          self.rounds, pass, moves, self.table.community_count(), q);
                    if moves == 0 {
                        break;
                    }
                }
                self.phase = Phase::Aggregate;
            }
            Phase::Aggregate => {
                self.phase = if self.aggregate()? { Phase::LocalMove } else { Phase::Done };
            }
            Phase::Done => {}
        }
        Ok(self.phase)
    }

    /// Gather every vertex's degree weight and start from singletons. The
    /// normalizer `2m` is fixed at the first generation.
    fn init_generation(&mut self) -> Result<()> {
        let owned: Vec<(VInt, f64)> = (0..self.graph.vertex_count())
            .map(|row| (self.graph.vertex(row), self.graph.degree_weight(row)))
            .collect();
        let mut degrees = vec![0f64; self.graph.global_vertex_count() as usize];
        for message in self.exchange.all_gather(Message::Degrees(owned))? {
            match message {
                Message::Degrees(list) => {
                    for (v, k) in list {
                        degrees[v as usize] = k;
                    }
                }
                other => return Err(unexpected("degrees", &other)),
            }
        }
        if self.two_m.is_none() {
            let two_m: f64 = degrees.iter().sum();
            info!("total edge weight: {}", two_m / 2.0);
            self.two_m = Some(two_m);
        }
        self.table = CommunityTable::singletons(&degrees);
        debug!("worker {} generation {}: {} owned of {} vertices", self.ctx.worker_rank,
               self.graph.generation(), self.graph.vertex_count(), degrees.len());
        Ok(())
    }

    /// One pass over the owned vertices on all threads, then reconcile every
    /// worker's proposals. Proposals are replayed in rank then thread order
    /// and each is applied only if it still gains on the reconciled table, so
    /// modularity never drops. Returns the number of applied moves.
    fn local_move_pass(&mut self) -> Result<usize> {
        let two_m = self.two_m.unwrap_or(0.0);
        let singleton_guard = self.ctx.is_concurrent();
        let ranges = thread_ranges(self.graph.vertex_count(), self.ctx.threads_per_worker as usize);
        let graph = &self.graph;
        let table = &self.table;
        let per_thread: Vec<Vec<Proposal>> = self.pool.install(|| {
            ranges.into_par_iter()
                .map(|rows| evaluate_rows(graph, table, rows, two_m, singleton_guard))
                .collect()
        });
        let local: Vec<Proposal> = per_thread.into_iter().flatten().collect();

        let (mut applied, mut proposed) = (0usize, 0usize);
        for message in self.exchange.all_gather(Message::Proposals(local))? {
            match message {
                Message::Proposals(proposals) => {
                    proposed += proposals.len();
                    for proposal in &proposals {
                        if self.table.try_apply(proposal, two_m) {
                            applied += 1;
                        }
                    }
                }
                other => return Err(unexpected("proposals", &other)),
            }
        }
        if applied < proposed {
            debug!("worker {} dropped {} stale moves of {}",
                   self.ctx.worker_rank, proposed - applied, proposed);
        }
        Ok(applied)
    }

    /// Modularity of the current assignment. Collective: every worker must call it.
    pub fn modularity(&mut self) -> Result<f64> {
        let two_m = self.two_m.unwrap_or(0.0);
        let mut internal = 0f64;
        for row in 0..self.graph.vertex_count() {
            let c = self.table.community_of(self.graph.vertex(row));
            let (columns, weights) = self.graph.row(row);
            for (&neighbor, &weight) in columns.iter().zip(weights) {
                if self.table.community_of(neighbor) == c {
                    internal += weight;
                }
            }
        }
        let mut total_internal = 0f64;
        for message in self.exchange.all_gather(Message::Scalar(internal))? {
            match message {
                Message::Scalar(x) => total_internal += x,
                other => return Err(unexpected("scalar", &other)),
            }
        }
        if two_m <= 0.0 {
            return Ok(0.0);
        }
        let spread: f64 = self.table.total.iter()
            .map(|t| (t / two_m) * (t / two_m))
            .sum();
        Ok(total_internal / two_m - spread)
    }

    /// Collapse the communities into the next generation. Returns false once
    /// nothing is left to merge or the round budget is spent.
    fn aggregate(&mut self) -> Result<bool> {
        let vertex_count = self.graph.global_vertex_count();
        let (mapping, next_count) = self.table.renumber();
        info!("round {}: {} vertices collapse into {} communities",
              self.rounds, vertex_count, next_count);
        self.levels.push(mapping);

        if next_count == vertex_count {
            info!("no merges in round {}, done", self.rounds);
            return Ok(false);
        }
        if self.rounds >= self.options.outer_iteration {
            return Ok(false);
        }

        let next_assignment = Partitioner::assign_uniform(next_count, self.ctx.worker_count)?;
        let mapping = self.levels.last().map(|m| m.as_slice()).unwrap_or(&[]);
        let mut outgoing: Vec<Vec<RowEntry>> = vec![Vec::new(); self.ctx.worker_count as usize];
        for ((src, dst), weight) in self.graph.collapse(mapping) {
            outgoing[next_assignment.owner_of(src) as usize].push((src, dst, weight));
        }
        let outgoing = outgoing.into_iter().map(Message::Entries).collect();
        let mut entries = Vec::new();
        for message in self.exchange.all_to_all(outgoing)? {
            match message {
                Message::Entries(list) => entries.extend(list),
                other => return Err(unexpected("entries", &other)),
            }
        }

        self.graph = CompressedGraph::build(
            self.graph.generation() + 1,
            next_count,
            next_assignment.vertices_of(self.ctx.worker_rank),
            &entries,
        );
        self.init_generation()?;
        Ok(true)
    }

    /// Final community of every original vertex, composed through all rounds.
    pub fn final_assignment(&self) -> Vec<CommId> {
        let original = match self.levels.first() {
            Some(level) => level.len(),
            None => self.table.states.len(),
        };
        (0..original as VInt)
            .map(|v| self.levels.iter().fold(v, |c, level| level[c as usize]))
            .collect()
    }

    /// Summaries of the final communities. Collective: every worker must call it.
    pub fn communities(&mut self) -> Result<Vec<Community>> {
        let assignment = self.final_assignment();
        // Levels not yet folded into the current generation.
        let first = (self.graph.generation() as usize).min(self.levels.len());
        let current_to_final: Vec<CommId> = (0..self.graph.global_vertex_count())
            .map(|v| self.levels[first..].iter().fold(v, |c, level| level[c as usize]))
            .collect();

        let mut internal = BTreeMap::<CommId, f64>::new();
        let mut degree = BTreeMap::<CommId, f64>::new();
        for row in 0..self.graph.vertex_count() {
            let c = current_to_final[self.graph.vertex(row) as usize];
            let (columns, weights) = self.graph.row(row);
            for (&neighbor, &weight) in columns.iter().zip(weights) {
                if current_to_final[neighbor as usize] == c {
                    *internal.entry(c).or_insert(0.0) += weight;
                }
                *degree.entry(c).or_insert(0.0) += weight;
            }
        }
        let local: Vec<(CommId, f64)> = internal.into_iter().collect();
        let mut internal_total = BTreeMap::<CommId, f64>::new();
        for message in self.exchange.all_gather(Message::Weights(local))? {
            match message {
                Message::Weights(list) => {
                    for (c, w) in list {
                        *internal_total.entry(c).or_insert(0.0) += w;
                    }
                }
                other => return Err(unexpected("weights", &other)),
            }
        }
        let local: Vec<(CommId, f64)> = degree.into_iter().collect();
        let mut degree_total = BTreeMap::<CommId, f64>::new();
        for message in self.exchange.all_gather(Message::Weights(local))? {
            match message {
                Message::Weights(list) => {
                    for (c, w) in list {
                        *degree_total.entry(c).or_insert(0.0) += w;
                    }
                }
                other => return Err(unexpected("weights", &other)),
            }
        }

        let mut members = BTreeMap::<CommId, BTreeSet<VInt>>::new();
        for (v, &c) in assignment.iter().enumerate() {
            members.entry(c).or_default().insert(v as VInt);
        }
        Ok(members.into_iter()
            .map(|(id, member_vertices)| Community {
                id,
                member_vertices,
                total_internal_weight: internal_total.get(&id).copied().unwrap_or(0.0) / 2.0,
                total_degree_weight: degree_total.get(&id).copied().unwrap_or(0.0),
            })
            .collect())
    }
}
