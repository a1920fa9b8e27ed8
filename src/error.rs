use std::fmt;

use derive_more::Display;

/// Errors raised by the community detection pipeline.
#[derive(Debug, Display)]
pub enum LouvainError {
    /// Invalid or missing settings, never retried.
    #[display(fmt = "configuration error: {}", _0)]
    Configuration(String),
    /// Too many malformed edge records in the input.
    #[display(fmt = "input format error: {} of {} records malformed (first: line {}: {})",
              malformed, records, first_line, first_reason)]
    InputFormat {
        records: u64,
        malformed: u64,
        first_line: u64,
        first_reason: String,
    },
    /// A worker failed to reach a synchronization point.
    #[display(fmt = "synchronization failure: {}", _0)]
    Synchronization(String),
    #[display(fmt = "io error: {}", _0)]
    Io(std::io::Error),
}

impl std::error::Error for LouvainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LouvainError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LouvainError {
    fn from(e: std::io::Error) -> Self {
        LouvainError::Io(e)
    }
}

impl LouvainError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, LouvainError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, LouvainError>;

/// Load skew beyond the expected bound, logged and otherwise ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionImbalanceWarning {
    pub partition_id: u32,
    pub load: f64,
    pub mean_load: f64,
}

impl PartitionImbalanceWarning {
    pub fn skew(&self) -> f64 {
        if self.mean_load == 0.0 {
            0.0
        } else {
            self.load / self.mean_load
        }
    }
}

impl fmt::Display for PartitionImbalanceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition {} holds load {:.1}, {:.2}x the mean {:.1}",
               self.partition_id, self.load, self.skew(), self.mean_load)
    }
}

#[cfg(test)]
mod error_test {
    use crate::error::{LouvainError, PartitionImbalanceWarning};

    #[test]
    fn test_display() {
        let e = LouvainError::Configuration("missing input".to_owned());
        assert_eq!(e.to_string(), "configuration error: missing input");
        assert!(e.is_configuration());

        let io: LouvainError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(io.to_string().starts_with("io error"));
        assert!(!io.is_configuration());
    }

    #[test]
    fn test_imbalance_skew() {
        let warning = PartitionImbalanceWarning { partition_id: 1, load: 30.0, mean_load: 10.0 };
        assert!((warning.skew() - 3.0).abs() < 1e-9);
        let empty = PartitionImbalanceWarning { partition_id: 0, load: 0.0, mean_load: 0.0 };
        assert_eq!(empty.skew(), 0.0);
    }
}
