pub mod axes;
pub mod config;
pub mod errors;
pub mod graph;
pub mod mesh;
pub mod ops;
pub mod replication;
pub mod shard_map;
pub mod types;
pub mod values;
