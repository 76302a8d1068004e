//! Shared fixtures: synthetic genomes, on-disk references and tile files.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use sortalign::config::AlignConfig;
use sortalign::reference::contig::Contig;
use sortalign::reference::kmer_index::{
    apply_repeat_threshold, scan_reference_kmers, write_mask_file, KmerIndexSet,
};
use sortalign::reference::metadata::{ContigMetadata, MaskMetadata, ReferenceMetadata};
use sortalign::reference::{ContigList, Reference};
use sortalign::tiles::cluster::{Cluster, ReadData};
use sortalign::tiles::loader::{write_filter_file, write_tile_file};

/// Deterministic pseudo-random genome.
pub fn synthetic_genome(length: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15).max(1);
    let mut genome = Vec::with_capacity(length);
    for _ in 0..length {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        genome.push(match (state >> 33) & 3 {
            0 => b'A',
            1 => b'C',
            2 => b'G',
            _ => b'T',
        });
    }
    genome
}

pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            other => other,
        })
        .collect()
}

fn contig_list(sequences: &[(&str, Vec<u8>)]) -> ContigList {
    let mut contigs = Vec::new();
    let mut offset = 0u64;
    for (index, (name, sequence)) in sequences.iter().enumerate() {
        contigs.push(Contig {
            index: index as u32,
            name: name.to_string(),
            decoy: false,
            genomic_position: offset,
            sequence: sequence.clone(),
        });
        offset += sequence.len() as u64;
    }
    ContigList::new(contigs).unwrap()
}

/// An in-memory reference over the given contigs, for builder-level tests.
pub fn in_memory_reference(sequences: &[(&str, Vec<u8>)], seed_length: u32) -> Reference {
    let contigs = contig_list(sequences);
    let index = KmerIndexSet::build_in_memory(&contigs, seed_length, 1000).unwrap();
    let metadata = synthetic_metadata(sequences);
    Reference::from_parts(metadata, contigs, index, seed_length)
}

fn synthetic_metadata(sequences: &[(&str, Vec<u8>)]) -> ReferenceMetadata {
    let mut contigs = Vec::new();
    let mut byte_offset = 0u64;
    let mut genomic = 0u64;
    for (index, (name, sequence)) in sequences.iter().enumerate() {
        contigs.push(ContigMetadata {
            index: index as u32,
            name: name.to_string(),
            file_path: "genome.seq".into(),
            byte_offset,
            byte_size: sequence.len() as u64,
            total_bases: sequence.len() as u64,
            acgt_bases: sequence.len() as u64,
            genomic_position: genomic,
            decoy: false,
            bam_sq_as: None,
            bam_sq_ur: None,
            bam_m5: None,
        });
        byte_offset += sequence.len() as u64;
        genomic += sequence.len() as u64;
    }
    ReferenceMetadata {
        format_version: 9,
        contigs,
        masks: Vec::new(),
        annotations: Vec::new(),
    }
}

/// Writes a complete on-disk reference (sequence file, mask file,
/// manifest) and returns the manifest path.
pub fn write_reference(
    dir: &Path,
    sequences: &[(&str, Vec<u8>)],
    seed_length: u32,
    repeat_threshold: u32,
) -> PathBuf {
    let genome: Vec<u8> = sequences.iter().flat_map(|(_, s)| s.iter().copied()).collect();
    std::fs::write(dir.join("genome.seq"), &genome).unwrap();

    let contigs = contig_list(sequences);
    let entries = apply_repeat_threshold(
        scan_reference_kmers(&contigs, seed_length),
        repeat_threshold,
    );
    let mask_name = format!("mask-{}-0.dat", seed_length);
    write_mask_file(&dir.join(&mask_name), seed_length, 0, 0, &entries).unwrap();

    let mut metadata = synthetic_metadata(sequences);
    metadata.masks.push(MaskMetadata {
        seed_length,
        mask_width: 0,
        mask: 0,
        kmers: entries.len() as u64,
        path: mask_name.into(),
    });
    let path = dir.join("sorted-reference.txt");
    metadata.store(&path).unwrap();
    path
}

/// A cluster built directly, bypassing tile files.
pub fn cluster(id: u64, reads: Vec<(Vec<u8>, Vec<u8>)>) -> Cluster {
    Cluster {
        id,
        tile: (id >> 32) as u32,
        barcode: 0,
        x: (id % 1000) as i32,
        y: (id / 1000) as i32,
        pf: true,
        reads: reads
            .into_iter()
            .map(|(sequence, quality)| ReadData { sequence, quality })
            .collect(),
    }
}

pub fn read_with_quality(sequence: &[u8], quality: u8) -> (Vec<u8>, Vec<u8>) {
    (sequence.to_vec(), vec![quality; sequence.len()])
}

/// Writes a tile (and its all-pass filter file) from per-cluster reads.
pub fn write_tile(
    path: &Path,
    tile_id: u32,
    clusters: &[Vec<(Vec<u8>, Vec<u8>)>],
) -> PathBuf {
    let tile_clusters: Vec<(i32, i32, Vec<ReadData>)> = clusters
        .iter()
        .enumerate()
        .map(|(index, reads)| {
            (
                index as i32,
                (index * 2) as i32,
                reads
                    .iter()
                    .map(|(sequence, quality)| ReadData {
                        sequence: sequence.clone(),
                        quality: quality.clone(),
                    })
                    .collect(),
            )
        })
        .collect();
    write_tile_file(path, tile_id, 0, &tile_clusters).unwrap();
    write_filter_file(path, &vec![true; clusters.len()]).unwrap();
    path.to_path_buf()
}

/// A config wired to a temp workspace, quiet about trimming and PF.
pub fn base_config(dir: &Path, tiles: Vec<PathBuf>, reference: PathBuf) -> AlignConfig {
    let mut config = AlignConfig::default();
    config.tile_paths = tiles;
    config.reference_metadata = reference;
    config.temp_directory = dir.join("Temp");
    config.output_directory = dir.join("Aligned");
    config.base_quality_cutoff = 0;
    config.cores_max = 2;
    config.input_loaders_max = 1;
    config.temp_savers_max = 2;
    config.temp_loaders_max = 2;
    config.command_line = "sortalign --test".into();
    config
}
