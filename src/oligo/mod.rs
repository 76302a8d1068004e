pub mod generator;
pub mod kmer;

pub use generator::KmerGenerator;
pub use kmer::Kmer;
