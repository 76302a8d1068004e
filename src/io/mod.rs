pub mod alignment_writer;
pub mod bgzf;
pub mod vcf;
