pub mod cluster;
pub mod loader;

pub use cluster::{Cluster, ReadData};
pub use loader::{ClusterSource, TileBatch, TileFileSource, TileLoader};
