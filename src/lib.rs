pub mod cluster;
pub mod compressed_graph;
pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod graph;
pub mod logger;
pub mod louvain;
pub mod partition;
pub mod writer;
