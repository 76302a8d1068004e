//! Gap realignment: re-evaluates confident fragments against the gaps
//! observed in their bin and the known indels, replacing the CIGAR when a
//! gapped interpretation is strictly more probable.

use crate::alignment::cigar::{self, Cigar, CigarOp};
use crate::alignment::quality::{log_match, log_mismatch, lp_less, UNKNOWN_MAPQ};
use crate::bins::record::BinRecord;
use crate::build::Gap;
use crate::config::AlignConfig;
use crate::io::vcf::KnownIndels;
use crate::reference::contig::Contig;

/// Candidate gaps considered around one fragment.
const FRAGMENT_GAPS_MAX: usize = 12;
/// Gap combinations evaluated per fragment.
const COMBINATIONS_MAX: usize = 256;
/// How far outside the fragment span gaps are still considered.
const GAP_FLANK: u32 = 100;

/// Gaps present in the CIGARs of a set of bin records, deduplicated and
/// position-sorted.
pub fn collect_fragment_gaps(records: &[BinRecord]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    for record in records {
        if record.is_unmapped() {
            continue;
        }
        let mut reference_at = record.position;
        for (op, len) in record.cigar() {
            match op {
                CigarOp::Align => reference_at += len,
                CigarOp::Insert => gaps.push(Gap {
                    position: reference_at,
                    length: len as i32,
                }),
                CigarOp::Delete | CigarOp::Split => {
                    gaps.push(Gap {
                        position: reference_at,
                        length: -(len as i32),
                    });
                    reference_at += len;
                }
                CigarOp::SoftClip => {}
            }
        }
    }
    gaps.sort_unstable();
    gaps.dedup();
    gaps
}

pub struct Realigner<'a> {
    config: &'a AlignConfig,
    known_indels: &'a KnownIndels,
}

impl<'a> Realigner<'a> {
    pub fn new(config: &'a AlignConfig, known_indels: &'a KnownIndels) -> Self {
        Realigner {
            config,
            known_indels,
        }
    }

    /// Realigns every eligible record in the bin in place. Returns how
    /// many records changed.
    pub fn realign_bin(&self, records: &mut [BinRecord], contig: &Contig) -> u64 {
        let fragment_gaps = collect_fragment_gaps(records);
        let mut realigned = 0u64;
        for record in records.iter_mut() {
            if self.realign_record(record, &fragment_gaps, contig) {
                realigned += 1;
            }
        }
        realigned
    }

    fn eligible(&self, record: &BinRecord) -> bool {
        !record.is_unmapped()
            && record.mapq != UNKNOWN_MAPQ
            && record.mapq >= self.config.realign_mapq_min
    }

    fn realign_record(
        &self,
        record: &mut BinRecord,
        fragment_gaps: &[Gap],
        contig: &Contig,
    ) -> bool {
        if !self.eligible(record) {
            return false;
        }
        let span_start = record.position.saturating_sub(GAP_FLANK);
        let span_end = record.end_position() + GAP_FLANK;

        let mut candidates: Vec<Gap> = fragment_gaps
            .iter()
            .filter(|g| (span_start..span_end).contains(&g.position))
            .copied()
            .collect();
        candidates.extend(
            self.known_indels
                .in_range(record.contig as u32, span_start, span_end),
        );
        candidates.sort_unstable();
        candidates.dedup();
        if candidates.len() > FRAGMENT_GAPS_MAX {
            // keep the gaps closest to the fragment
            let center = (record.position + record.end_position()) / 2;
            candidates.sort_by_key(|g| (g.position as i64 - center as i64).unsigned_abs());
            candidates.truncate(FRAGMENT_GAPS_MAX);
            candidates.sort_unstable();
        }
        if candidates.is_empty() {
            return false;
        }

        let original = Evaluation::of_record(record, contig);
        let mut best = original.clone();
        let mut best_gaps: Option<Vec<Gap>> = None;

        let mut combination = Vec::new();
        let mut evaluated = 0usize;
        self.try_combinations(
            record,
            contig,
            &candidates,
            0,
            &mut combination,
            &mut evaluated,
            &mut |gaps, evaluation| {
                // a tie keeps the original alignment
                if lp_less(best.log_probability, evaluation.log_probability)
                    && (self.config.realign_vigorously
                        || evaluation.mismatches < original.mismatches)
                {
                    best = evaluation.clone();
                    best_gaps = Some(gaps.to_vec());
                }
            },
        );

        if best_gaps.is_none() {
            return false;
        }
        if record.original_cigar.is_none() {
            record.original_cigar = Some(record.cigar.clone());
        }
        record.cigar = cigar::to_raw(&best.cigar);
        record.mismatches = best.mismatches;
        record.log_probability = best.log_probability;
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn try_combinations(
        &self,
        record: &BinRecord,
        contig: &Contig,
        candidates: &[Gap],
        from: usize,
        combination: &mut Vec<Gap>,
        evaluated: &mut usize,
        accept: &mut dyn FnMut(&[Gap], &Evaluation),
    ) {
        if *evaluated >= COMBINATIONS_MAX {
            return;
        }
        if !combination.is_empty() {
            *evaluated += 1;
            if let Some(evaluation) = Evaluation::with_gaps(record, contig, combination, self.config)
            {
                accept(combination, &evaluation);
            }
        }
        if combination.len() >= self.config.realigned_gaps_per_fragment as usize {
            return;
        }
        for index in from..candidates.len() {
            combination.push(candidates[index]);
            self.try_combinations(
                record,
                contig,
                candidates,
                index + 1,
                combination,
                evaluated,
                accept,
            );
            combination.pop();
        }
    }
}

/// One evaluated interpretation of a record against the reference.
#[derive(Clone)]
struct Evaluation {
    cigar: Cigar,
    mismatches: u32,
    log_probability: f64,
}

impl Evaluation {
    fn of_record(record: &BinRecord, contig: &Contig) -> Evaluation {
        let cigar = record.cigar();
        let (mismatches, log_probability) =
            score_alignment(record, contig, record.position, &cigar)
                .unwrap_or((record.mismatches, record.log_probability));
        Evaluation {
            cigar,
            mismatches,
            log_probability,
        }
    }

    /// Rebuilds the record's alignment with the given gaps applied at
    /// their reference positions, keeping the fragment start fixed.
    fn with_gaps(
        record: &BinRecord,
        contig: &Contig,
        gaps: &[Gap],
        config: &AlignConfig,
    ) -> Option<Evaluation> {
        let original = record.cigar();
        let leading = cigar::leading_clip(&original);
        let trailing = cigar::trailing_clip(&original);
        let read_length = record.sequence.len() as u32;
        let aligned_bases = read_length - leading - trailing;
        if aligned_bases == 0 {
            return None;
        }

        let mut cigar: Cigar = Vec::new();
        if leading > 0 {
            cigar.push((CigarOp::SoftClip, leading));
        }

        let mut gaps = gaps.to_vec();
        gaps.sort_unstable();

        let mut reference_at = record.position;
        let mut read_remaining = aligned_bases;
        for gap in &gaps {
            if gap.position < reference_at {
                return None; // overlapping combination
            }
            let advance = gap.position - reference_at;
            if advance >= read_remaining {
                return None; // gap past the read end contributes nothing
            }
            if advance > 0 {
                cigar.push((CigarOp::Align, advance));
                reference_at += advance;
                read_remaining -= advance;
            }
            if gap.is_deletion() {
                let length = (-gap.length) as u32;
                let op = if length >= config.alignment_cfg.split_gap_length {
                    CigarOp::Split
                } else {
                    CigarOp::Delete
                };
                cigar.push((op, length));
                reference_at += length;
            } else {
                let length = (gap.length as u32).min(read_remaining.saturating_sub(1));
                if length == 0 {
                    return None;
                }
                cigar.push((CigarOp::Insert, length));
                read_remaining -= length;
            }
        }
        if read_remaining > 0 {
            cigar.push((CigarOp::Align, read_remaining));
        }
        if trailing > 0 {
            cigar.push((CigarOp::SoftClip, trailing));
        }
        cigar::normalize(&mut cigar);

        let (mismatches, log_probability) =
            score_alignment(record, contig, record.position, &cigar)?;
        Some(Evaluation {
            cigar,
            mismatches,
            log_probability,
        })
    }
}

/// Mismatch count and log probability of the record's bases under a
/// CIGAR. `None` when the CIGAR walks off the contig.
fn score_alignment(
    record: &BinRecord,
    contig: &Contig,
    position: u32,
    cigar: &[(CigarOp, u32)],
) -> Option<(u32, f64)> {
    let mut mismatches = 0u32;
    let mut log_probability = 0.0f64;
    let mut read_at = 0usize;
    let mut reference_at = position as usize;
    for &(op, len) in cigar {
        match op {
            CigarOp::Align => {
                if reference_at + len as usize > contig.len() {
                    return None;
                }
                for _ in 0..len {
                    let reference_base = contig.sequence[reference_at];
                    let quality = record.quality[read_at];
                    if record.sequence[read_at] == reference_base
                        && matches!(reference_base, b'A' | b'C' | b'G' | b'T')
                    {
                        log_probability += log_match(quality);
                    } else {
                        log_probability += log_mismatch(quality);
                        mismatches += 1;
                    }
                    read_at += 1;
                    reference_at += 1;
                }
            }
            CigarOp::Insert => {
                for _ in 0..len {
                    log_probability += log_mismatch(record.quality[read_at]);
                    read_at += 1;
                }
            }
            CigarOp::SoftClip => read_at += len as usize,
            CigarOp::Delete | CigarOp::Split => reference_at += len as usize,
        }
    }
    Some((mismatches, log_probability))
}
