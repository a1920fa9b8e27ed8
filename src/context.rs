/// Topology of the running computation, handed explicitly to every
/// component instead of living in a process-wide singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub worker_rank: u32,
    pub worker_count: u32,
    pub threads_per_worker: u32,
}

impl ExecutionContext {
    pub fn new(worker_rank: u32, worker_count: u32, threads_per_worker: u32) -> Self {
        debug_assert!(worker_rank < worker_count);
        Self { worker_rank, worker_count, threads_per_worker }
    }

    /// A single worker running a single thread.
    pub fn single() -> Self {
        Self::new(0, 1, 1)
    }

    /// Global index of a local thread, used to name output parts.
    pub fn global_thread_index(&self, local_thread_id: u32) -> u32 {
        self.worker_rank * self.threads_per_worker + local_thread_id
    }

    pub fn total_threads(&self) -> u32 {
        self.worker_count * self.threads_per_worker
    }

    /// True when moves are evaluated by more than one thread at a time.
    pub fn is_concurrent(&self) -> bool {
        self.total_threads() > 1
    }
}
