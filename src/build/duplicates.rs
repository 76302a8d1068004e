//! Duplicate marking.
//!
//! Fragments sharing (library, contig, unclipped 5' start, strand, mate 5'
//! start, mate strand) form a duplicate set. The representative is the
//! fragment with the highest summed base quality over the first half of
//! the read; ties go to the lowest cluster id. Everything else gets the
//! duplicate flag.

use rustc_hash::FxHashMap;

use crate::bins::record::{flags, BinRecord};
use crate::config::AlignConfig;

type DuplicateKey = (u32, i32, i64, bool, i32, u32, bool);

fn duplicate_key(record: &BinRecord, config: &AlignConfig) -> DuplicateKey {
    let library = if config.single_library_samples {
        0
    } else {
        record.barcode
    };
    (
        library,
        record.contig,
        record.five_prime_position(),
        record.is_reverse(),
        record.mate_contig,
        record.mate_position,
        record.flags & flags::MATE_REVERSE != 0,
    )
}

/// The score deciding the representative: summed quality over the first
/// half of the read, in instrument orientation.
fn representative_score(record: &BinRecord) -> u64 {
    let half = record.quality.len().div_ceil(2);
    let quals: Box<dyn Iterator<Item = &u8>> = if record.is_reverse() {
        // stored reversed; the instrument's first bases are at the tail
        Box::new(record.quality.iter().rev())
    } else {
        Box::new(record.quality.iter())
    };
    quals.take(half).map(|&q| q as u64).sum()
}

/// Flags duplicates in place. Returns the number of records flagged.
pub fn mark_duplicates(records: &mut [BinRecord], config: &AlignConfig) -> u64 {
    if !config.mark_duplicates {
        return 0;
    }
    let mut groups: FxHashMap<DuplicateKey, Vec<usize>> = FxHashMap::default();
    for (index, record) in records.iter().enumerate() {
        if record.is_unmapped() {
            continue;
        }
        groups.entry(duplicate_key(record, config)).or_default().push(index);
    }

    let mut flagged = 0u64;
    for (_, group) in groups {
        if group.len() < 2 {
            continue;
        }
        let representative = group
            .iter()
            .copied()
            .max_by(|&a, &b| {
                representative_score(&records[a])
                    .cmp(&representative_score(&records[b]))
                    // lower cluster id wins a quality tie
                    .then_with(|| records[b].cluster_id.cmp(&records[a].cluster_id))
            })
            .unwrap();
        for index in group {
            if index != representative {
                records[index].flags |= flags::DUPLICATE;
                flagged += 1;
            }
        }
    }
    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::cigar::{self, CigarOp};

    fn record(cluster_id: u64, position: u32, qualities: &[u8]) -> BinRecord {
        BinRecord {
            cluster_id,
            barcode: 0,
            read_index: 0,
            flags: flags::PAIRED | flags::FIRST_IN_TEMPLATE,
            contig: 0,
            position,
            mapq: 60,
            cigar: cigar::to_raw(&[(CigarOp::Align, qualities.len() as u32)]),
            sequence: vec![b'A'; qualities.len()],
            quality: qualities.to_vec(),
            mate_contig: 0,
            mate_position: 300,
            template_length: 250,
            alignment_score: 90,
            template_score: 90,
            mismatches: 0,
            log_probability: -0.1,
            original_cigar: None,
            x: 0,
            y: 0,
        }
    }

    #[test]
    fn higher_first_half_quality_wins() {
        let mut records = vec![
            record(2, 100, &[20, 20, 20, 20, 35, 35, 35, 35]),
            record(1, 100, &[30, 30, 30, 30, 10, 10, 10, 10]),
        ];
        let config = AlignConfig::default();
        let flagged = mark_duplicates(&mut records, &config);
        assert_eq!(flagged, 1);
        assert!(records[0].is_duplicate());
        assert!(!records[1].is_duplicate());
    }

    #[test]
    fn quality_ties_go_to_the_lowest_cluster_id() {
        let mut records = vec![
            record(9, 100, &[30; 8]),
            record(3, 100, &[30; 8]),
        ];
        let config = AlignConfig::default();
        mark_duplicates(&mut records, &config);
        assert!(records[0].is_duplicate());
        assert!(!records[1].is_duplicate());
    }

    #[test]
    fn different_positions_do_not_group() {
        let mut records = vec![record(1, 100, &[30; 8]), record(2, 200, &[30; 8])];
        let config = AlignConfig::default();
        assert_eq!(mark_duplicates(&mut records, &config), 0);
    }

    #[test]
    fn clipping_does_not_hide_duplicates() {
        // same molecule, one alignment soft-clipped at the start
        let plain = record(1, 100, &[30; 8]);
        let mut clipped = record(2, 103, &[20; 8]);
        clipped.cigar = cigar::to_raw(&[(CigarOp::SoftClip, 3), (CigarOp::Align, 5)]);
        let config = AlignConfig::default();
        let mut records = vec![plain, clipped];
        assert_eq!(mark_duplicates(&mut records, &config), 1);
        assert!(records[1].is_duplicate());
    }

    #[test]
    fn marking_can_be_disabled() {
        let mut records = vec![record(1, 100, &[30; 8]), record(2, 100, &[30; 8])];
        let mut config = AlignConfig::default();
        config.mark_duplicates = false;
        assert_eq!(mark_duplicates(&mut records, &config), 0);
    }
}
