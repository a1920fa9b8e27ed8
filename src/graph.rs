use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{info, warn};

use crate::config::{MAX_MALFORMED_FRACTION, READ_BUFFER_SIZE};
use crate::error::{LouvainError, Result};

pub type VInt = u32;

/// Largest accepted vertex id, so that `vertex_count = max id + 1` fits in a `VInt`.
pub const MAX_VERTEX_ID: VInt = VInt::MAX - 1;

/// Shape of the loaded graph. Vertex ids are dense in `[0, vertex_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphInfo {
    pub vertex_count: u32,
    pub edge_count: u64,
    pub is_directed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub src: VInt,
    pub dst: VInt,
    pub weight: f64,
}

impl Edge {
    pub fn new(src: VInt, dst: VInt, weight: f64) -> Self {
        Edge { src, dst, weight }
    }

    /// An edge of weight 1.0, the default when the record carries none.
    pub fn unit(src: VInt, dst: VInt) -> Self {
        Edge { src, dst, weight: 1.0 }
    }

    pub fn is_self_loop(&self) -> bool {
        self.src == self.dst
    }
}

/// Per-record outcome of a load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub records: u64,
    pub malformed: u64,
    pub first_error: Option<(u64, String)>,
}

impl LoadSummary {
    pub fn malformed_fraction(&self) -> f64 {
        if self.records == 0 {
            0.0
        } else {
            self.malformed as f64 / self.records as f64
        }
    }
}

/// The whole edge list together with its descriptor.
#[derive(Debug, Clone, Default)]
pub struct EdgeList {
    pub info: GraphInfo,
    pub edges: Vec<Edge>,
}

/// Decode one `src,dst[,weight]` record. Blank lines and `#` comments yield `None`.
pub fn parse_record(line: &str) -> std::result::Result<Option<Edge>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let tokens: Vec<&str> = line.split(',').map(|t| t.trim()).collect();
    if tokens.len() < 2 || tokens.len() > 3 {
        return Err(format!("expected 2 or 3 fields, found {}", tokens.len()));
    }
    let src = tokens[0].parse::<VInt>()
        .map_err(|e| format!("bad source '{}': {}", tokens[0], e))?;
    let dst = tokens[1].parse::<VInt>()
        .map_err(|e| format!("bad destination '{}': {}", tokens[1], e))?;
    if src > MAX_VERTEX_ID || dst > MAX_VERTEX_ID {
        return Err(format!("vertex id above {}", MAX_VERTEX_ID));
    }
    let weight = match tokens.get(2) {
        Some(token) if !token.is_empty() => {
            let w = token.parse::<f64>()
                .map_err(|e| format!("bad weight '{}': {}", token, e))?;
            if !w.is_finite() || w < 0.0 {
                return Err(format!("weight must be finite and non-negative, got {}", w));
            }
            w
        }
        _ => 1.0,
    };
    Ok(Some(Edge::new(src, dst, weight)))
}

impl EdgeList {
    /// Build from edges whose ids are at most [`MAX_VERTEX_ID`], as
    /// [`parse_record`] guarantees.
    ///
    /// # Panics
    ///
    /// If an edge carries the id `VInt::MAX`.
    pub fn from_edges(edges: impl IntoIterator<Item = Edge>, is_directed: bool) -> Self {
        let edges: Vec<Edge> = edges.into_iter().collect();
        let max_id = edges.iter().map(|e| e.src.max(e.dst)).max();
        if let Some(id) = max_id {
            assert!(id <= MAX_VERTEX_ID, "vertex id {} out of range", id);
        }
        let vertex_count = max_id.map_or(0, |id| id + 1);
        EdgeList {
            info: GraphInfo {
                vertex_count,
                edge_count: edges.len() as u64,
                is_directed,
            },
            edges,
        }
    }

    /// Decode an edge list from any line source. Malformed records are skipped
    /// and counted; the load fails only when they exceed the tolerated fraction.
    pub fn from_reader(reader: impl BufRead, is_directed: bool) -> Result<(Self, LoadSummary)> {
        let mut summary = LoadSummary::default();
        let mut edges = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            match parse_record(&line) {
                Ok(None) => continue,
                Ok(Some(edge)) => {
                    summary.records += 1;
                    edges.push(edge);
                }
                Err(reason) => {
                    summary.records += 1;
                    summary.malformed += 1;
                    if summary.first_error.is_none() {
                        summary.first_error = Some((line_no as u64 + 1, reason));
                    }
                }
            }
        }

        if summary.malformed > 0 {
            let (first_line, first_reason) = summary.first_error.clone().unwrap_or_default();
            if summary.malformed_fraction() > MAX_MALFORMED_FRACTION {
                return Err(LouvainError::InputFormat {
                    records: summary.records,
                    malformed: summary.malformed,
                    first_line,
                    first_reason,
                });
            }
            warn!("skipped {} malformed records of {} (first at line {}: {})",
                  summary.malformed, summary.records, first_line, first_reason);
        }
        Ok((Self::from_edges(edges, is_directed), summary))
    }

    /// Load a csv edge list from a file.
    pub fn from_csv_file(path: impl AsRef<Path>, is_directed: bool) -> Result<(Self, LoadSummary)> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        let (edge_list, summary) = Self::from_reader(reader, is_directed)?;
        info!("loaded {}: {} vertices, {} edges, directed: {}",
              path.display(), edge_list.info.vertex_count,
              edge_list.info.edge_count, is_directed);
        Ok((edge_list, summary))
    }

    /// Number of edges attached to every vertex, the input of the partitioner.
    /// Undirected graphs count both endpoints; directed graphs count either
    /// the source or the destination side.
    pub fn degree_distribution(&self, by_in_degree: bool) -> Vec<u32> {
        let mut degrees = vec![0u32; self.info.vertex_count as usize];
        for edge in &self.edges {
            if self.info.is_directed {
                let v = if by_in_degree { edge.dst } else { edge.src };
                degrees[v as usize] += 1;
            } else {
                degrees[edge.src as usize] += 1;
                if !edge.is_self_loop() {
                    degrees[edge.dst as usize] += 1;
                }
            }
        }
        degrees
    }

    /// Sum of record weights, i.e. `m` in the modularity formula.
    pub fn total_weight(&self) -> f64 {
        self.edges.iter().map(|e| e.weight).sum()
    }
}

#[cfg(test)]
mod graph_test {
    use std::io::{Cursor, Write};

    use crate::graph::{parse_record, Edge, EdgeList, MAX_VERTEX_ID};

    #[test]
    fn test_parse_record() {
        assert_eq!(parse_record("1,2").unwrap(), Some(Edge::unit(1, 2)));
        assert_eq!(parse_record(" 3 , 4 , 0.5 ").unwrap(), Some(Edge::new(3, 4, 0.5)));
        assert_eq!(parse_record("").unwrap(), None);
        assert_eq!(parse_record("# comment").unwrap(), None);
        assert!(parse_record("1").is_err());
        assert!(parse_record("a,2").is_err());
        assert!(parse_record("1,2,-1").is_err());
        assert!(parse_record("1,2,3,4").is_err());
    }

    #[test]
    fn test_load_with_bad_records() {
        let mut text = String::new();
        for i in 0..20 {
            text.push_str(&format!("{},{}\n", i, i + 1));
        }
        text.push_str("oops\n");
        let (edge_list, summary) = EdgeList::from_reader(Cursor::new(text), false).unwrap();
        assert_eq!(summary.records, 21);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.first_error.as_ref().unwrap().0, 21);
        assert_eq!(edge_list.info.vertex_count, 21);
        assert_eq!(edge_list.info.edge_count, 20);
    }

    #[test]
    fn test_vertex_id_range() {
        assert!(parse_record("4294967295,0").is_err());
        assert!(parse_record("0,4294967295").is_err());
        assert_eq!(parse_record("4294967294,0").unwrap(), Some(Edge::unit(MAX_VERTEX_ID, 0)));

        let mut text = String::new();
        for i in 0..20 {
            text.push_str(&format!("{},{}\n", i, i + 1));
        }
        text.push_str("4294967295,3\n");
        let (edge_list, summary) = EdgeList::from_reader(Cursor::new(text), false).unwrap();
        assert_eq!(summary.malformed, 1);
        assert_eq!(edge_list.info.vertex_count, 21);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_edges_beyond_id_range() {
        EdgeList::from_edges(vec![Edge::unit(u32::MAX, 0)], false);
    }

    #[test]
    fn test_too_many_bad_records() {
        let text = "0,1\nx,y\n1,2\nz\n";
        assert!(EdgeList::from_reader(Cursor::new(text), false).is_err());
    }

    #[test]
    fn test_degree_distribution() {
        let edges = vec![Edge::unit(0, 1), Edge::unit(0, 2), Edge::unit(2, 2)];
        let undirected = EdgeList::from_edges(edges.clone(), false);
        assert_eq!(undirected.degree_distribution(false), vec![2, 1, 2]);

        let directed = EdgeList::from_edges(edges, true);
        assert_eq!(directed.degree_distribution(false), vec![2, 0, 1]);
        assert_eq!(directed.degree_distribution(true), vec![0, 1, 2]);
        assert!((directed.total_weight() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_csv_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "0,1,2.5\n1,2\n").unwrap();
        let (edge_list, summary) = EdgeList::from_csv_file(file.path(), false).unwrap();
        assert_eq!(summary.malformed, 0);
        assert_eq!(edge_list.info.vertex_count, 3);
        assert!((edge_list.total_weight() - 3.5).abs() < 1e-12);
    }
}
