use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::graph::VInt;
use crate::louvain::CommId;

/// Line-oriented output capability.
pub trait OutputSink {
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Flush whatever is buffered. Called once before release.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Hands out one sink per output part and takes it back when done.
pub trait SinkProvider: Sync {
    type Sink: OutputSink + Send;

    fn acquire(&self, part: u32) -> Result<Self::Sink>;

    fn release(&self, _part: u32, mut sink: Self::Sink) -> Result<()> {
        sink.finish()
    }
}

/// Name of an output part: `part-NNNNN.csv`.
pub fn part_file_name(part: u32) -> String {
    format!("part-{:05}.csv", part)
}

/// Writes parts as csv files under a local directory.
pub struct FileSinkProvider {
    dir: PathBuf,
}

impl FileSinkProvider {
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(FileSinkProvider { dir: dir.as_ref().to_path_buf() })
    }

    pub fn part_path(&self, part: u32) -> PathBuf {
        self.dir.join(part_file_name(part))
    }
}

pub struct FileSink {
    writer: BufWriter<File>,
}

impl OutputSink for FileSink {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl SinkProvider for FileSinkProvider {
    type Sink = FileSink;

    fn acquire(&self, part: u32) -> Result<FileSink> {
        let path = self.part_path(part);
        info!("{}", path.display());
        Ok(FileSink { writer: BufWriter::new(File::create(path)?) })
    }
}

/// Keeps finished parts in memory, keyed by part index.
#[derive(Default)]
pub struct MemorySinkProvider {
    parts: Mutex<BTreeMap<u32, String>>,
}

pub struct MemorySink {
    buffer: String,
}

impl OutputSink for MemorySink {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.buffer.push_str(line);
        self.buffer.push('\n');
        Ok(())
    }
}

impl SinkProvider for MemorySinkProvider {
    type Sink = MemorySink;

    fn acquire(&self, _part: u32) -> Result<MemorySink> {
        Ok(MemorySink { buffer: String::new() })
    }

    fn release(&self, part: u32, sink: MemorySink) -> Result<()> {
        self.parts.lock().insert(part, sink.buffer);
        Ok(())
    }
}

impl MemorySinkProvider {
    pub fn part(&self, part: u32) -> Option<String> {
        self.parts.lock().get(&part).cloned()
    }

    pub fn parts(&self) -> BTreeMap<u32, String> {
        self.parts.lock().clone()
    }
}

/// Writes `vertex_id,community_id` records of one worker's vertices, split
/// over its threads in contiguous runs.
pub struct ResultWriter {
    ctx: ExecutionContext,
}

impl ResultWriter {
    pub fn new(ctx: ExecutionContext) -> Self {
        ResultWriter { ctx }
    }

    /// Acquire a sink for `part`, run `body` on it and release it whatever
    /// the body returned.
    fn with_sink<P, F>(provider: &P, part: u32, body: F) -> Result<()>
    where
        P: SinkProvider,
        F: FnOnce(&mut P::Sink) -> Result<()>,
    {
        let mut sink = provider.acquire(part)?;
        let outcome = body(&mut sink);
        let released = provider.release(part, sink);
        outcome.and(released)
    }

    /// `vertices` are the original vertices owned by this worker, ascending;
    /// `assignment` maps every original vertex to its final community.
    /// Returns the part indices written, one per local thread.
    pub fn write<P: SinkProvider>(
        &self,
        vertices: &[VInt],
        assignment: &[CommId],
        provider: &P,
    ) -> Result<Vec<u32>> {
        let threads = self.ctx.threads_per_worker.max(1) as usize;
        let chunk = vertices.len().div_ceil(threads);
        (0..threads)
            .into_par_iter()
            .map(|tid| {
                let start = (tid * chunk).min(vertices.len());
                let end = (start + chunk).min(vertices.len());
                let part = self.ctx.global_thread_index(tid as u32);
                Self::with_sink(provider, part, |sink| {
                    for &vertex in &vertices[start..end] {
                        sink.write_line(&format!("{},{}", vertex, assignment[vertex as usize]))?;
                    }
                    Ok(())
                })?;
                Ok(part)
            })
            .collect()
    }
}

#[cfg(test)]
mod writer_test {
    use crate::context::ExecutionContext;
    use crate::writer::{part_file_name, FileSinkProvider, MemorySinkProvider, ResultWriter};

    #[test]
    fn test_part_names() {
        assert_eq!(part_file_name(0), "part-00000.csv");
        assert_eq!(part_file_name(123), "part-00123.csv");
    }

    #[test]
    fn test_split_over_threads() {
        let provider = MemorySinkProvider::default();
        let writer = ResultWriter::new(ExecutionContext::new(1, 2, 2));
        let parts = writer.write(&[1, 3, 5], &[0, 0, 0, 1, 1, 1], &provider).unwrap();
        assert_eq!(parts, vec![2, 3]);
        assert_eq!(provider.part(2).unwrap(), "1,0\n3,1\n");
        assert_eq!(provider.part(3).unwrap(), "5,1\n");
    }

    #[test]
    fn test_empty_worker_still_writes_parts() {
        let provider = MemorySinkProvider::default();
        let writer = ResultWriter::new(ExecutionContext::new(2, 3, 2));
        let parts = writer.write(&[], &[0, 0], &provider).unwrap();
        assert_eq!(parts, vec![4, 5]);
        assert_eq!(provider.part(4).unwrap(), "");
        assert_eq!(provider.part(5).unwrap(), "");
    }

    #[test]
    fn test_file_parts() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileSinkProvider::create(dir.path().join("out")).unwrap();
        let writer = ResultWriter::new(ExecutionContext::single());
        writer.write(&[0, 1], &[7, 7], &provider).unwrap();
        let text = std::fs::read_to_string(provider.part_path(0)).unwrap();
        assert_eq!(text, "0,7\n1,7\n");
    }
}
