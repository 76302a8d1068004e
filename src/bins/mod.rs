pub mod metadata;
pub mod partitioner;
pub mod record;

pub use metadata::{BinGrid, BinMetadata};
pub use partitioner::BinPartitioner;
pub use record::{records_from_template, BinRecord};
