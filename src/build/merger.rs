//! Bin merge: re-reads each bin, realigns gaps, marks duplicates and
//! establishes the in-bin sort order. Concatenating processed bins in grid
//! order yields the globally sorted output.

use crate::bins::metadata::BinMetadata;
use crate::bins::partitioner::read_bin_records;
use crate::bins::record::BinRecord;
use crate::build::duplicates::mark_duplicates;
use crate::build::realigner::Realigner;
use crate::config::{AlignConfig, RealignGapsMode};
use crate::error::Result;
use crate::io::vcf::KnownIndels;
use crate::reference::ContigList;
use crate::stats::BuildStats;

pub struct ProcessedBin {
    pub records: Vec<BinRecord>,
    pub stats: BuildStats,
}

/// Runs the full build treatment of one bin.
pub fn process_bin(
    bin: &BinMetadata,
    contigs: &ContigList,
    known_indels: &KnownIndels,
    config: &AlignConfig,
) -> Result<ProcessedBin> {
    let mut records = read_bin_records(bin)?;
    let mut stats = BuildStats {
        bins: 1,
        fragments: records.len() as u64,
        ..Default::default()
    };

    if bin.is_unmapped() {
        // unmapped bin: order by cluster for reproducibility, nothing to
        // realign or deduplicate
        records.sort_by_key(|r| (r.cluster_id, r.read_index));
        stats.unaligned_fragments = records.len() as u64;
        return Ok(ProcessedBin { records, stats });
    }

    if config.realign_gaps != RealignGapsMode::Off {
        let contig = contigs.get(bin.contig as u32);
        let realigner = Realigner::new(config, known_indels);
        stats.realigned = realigner.realign_bin(&mut records, contig);
    }

    records.sort_by_key(|r| r.sort_key());

    let flagged = mark_duplicates(&mut records, config);
    stats.duplicates = flagged;
    if !config.keep_duplicates {
        records.retain(|r| !r.is_duplicate());
    }

    debug_assert!(records
        .iter()
        .all(|r| bin.contains(r.contig, r.position)));

    Ok(ProcessedBin { records, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::cigar::{self, CigarOp};
    use crate::bins::metadata::BinGrid;
    use crate::bins::partitioner::BinPartitioner;
    use crate::bins::record::flags;
    use crate::reference::contig::Contig;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn contigs() -> ContigList {
        ContigList::new(vec![Contig {
            index: 0,
            name: "chr1".into(),
            decoy: false,
            genomic_position: 0,
            sequence: b"ACGTACGTACGTACGTACGTACGTACGTACGT".repeat(32),
        }])
        .unwrap()
    }

    fn record(cluster_id: u64, position: u32) -> BinRecord {
        BinRecord {
            cluster_id,
            barcode: 0,
            read_index: 0,
            flags: 0,
            contig: 0,
            position,
            mapq: 60,
            cigar: cigar::to_raw(&[(CigarOp::Align, 8)]),
            sequence: b"ACGTACGT".to_vec(),
            quality: vec![30; 8],
            mate_contig: -1,
            mate_position: 0,
            template_length: 0,
            alignment_score: 80,
            template_score: 80,
            mismatches: 0,
            log_probability: -0.1,
            original_cigar: None,
            x: 0,
            y: 0,
        }
    }

    #[test]
    fn processed_bin_is_sorted_and_in_range() {
        let dir = TempDir::new().unwrap();
        let contigs = contigs();
        let grid = Arc::new(BinGrid::new(&contigs, 512, dir.path(), false));
        let partitioner = BinPartitioner::new(Arc::clone(&grid), 1, false);
        partitioner
            .route(vec![record(3, 200), record(1, 8), record(2, 96)])
            .unwrap();
        let bins = partitioner.finish().unwrap();
        assert_eq!(bins.len(), 1);

        let config = AlignConfig::default();
        let indels = KnownIndels::empty(1);
        let processed = process_bin(&bins[0], &contigs, &indels, &config).unwrap();
        let positions: Vec<u32> = processed.records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![8, 96, 200]);
        assert_eq!(processed.stats.fragments, 3);
    }

    #[test]
    fn duplicates_can_be_dropped_entirely() {
        let dir = TempDir::new().unwrap();
        let contigs = contigs();
        let grid = Arc::new(BinGrid::new(&contigs, 4096, dir.path(), false));
        let partitioner = BinPartitioner::new(Arc::clone(&grid), 1, false);
        let mut duplicate = record(9, 64);
        duplicate.quality = vec![10; 8];
        partitioner.route(vec![record(1, 64), duplicate]).unwrap();
        let bins = partitioner.finish().unwrap();

        let mut config = AlignConfig::default();
        config.keep_duplicates = false;
        let indels = KnownIndels::empty(1);
        let processed = process_bin(&bins[0], &contigs, &indels, &config).unwrap();
        assert_eq!(processed.records.len(), 1);
        assert_eq!(processed.records[0].cluster_id, 1);
        assert_eq!(processed.stats.duplicates, 1);
        assert_eq!(processed.records[0].flags & flags::DUPLICATE, 0);
    }
}
