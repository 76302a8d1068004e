//! Seed matcher: candidate reference positions for one read.
//!
//! Seeds are extracted at fixed offsets along the read, looked up in the
//! k-mer index on both strands and classified by repeat count. Candidates
//! from better-classified seeds win when the total has to be capped.

use crate::config::AlignConfig;
use crate::oligo::kmer::{one_mismatch_neighbors, pack_kmer, reverse_complement};
use crate::reference::{KmerLookup, Reference, ReferencePosition};
use crate::stats::MatchFinderTileStats;
use crate::tiles::ReadData;

/// A candidate alignment start. `start` may stick out of the contig on
/// either side; the aligners soft-clip the overhang.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedCandidate {
    pub contig: u32,
    pub start: i64,
    pub reverse: bool,
}

/// Candidates of one read, deduplicated and position-ordered.
#[derive(Debug, Default)]
pub struct CandidateSet {
    pub candidates: Vec<SeedCandidate>,
    /// All candidates came from heavily repeated seeds; the alignment has
    /// no probabilistic distinction and is treated as dodgy downstream.
    pub dodgy: bool,
}

// Candidate plus the repeat count of the cheapest seed that produced it,
// for the capping tie-break.
#[derive(Debug, Clone, Copy)]
struct RankedCandidate {
    candidate: SeedCandidate,
    seed_repeats: u32,
}

/// Seed offsets: every `step` bases plus the read tail, so the last bases
/// of the read still anchor a seed.
pub fn seed_offsets(read_length: usize, seed_length: u32, step: u32) -> Vec<usize> {
    let seed_length = seed_length as usize;
    let step = (step as usize).max(1);
    let mut offsets = Vec::new();
    if read_length < seed_length {
        return offsets;
    }
    let mut offset = 0usize;
    while offset + seed_length <= read_length {
        offsets.push(offset);
        offset += step;
    }
    let tail = read_length - seed_length;
    if offsets.last() != Some(&tail) {
        offsets.push(tail);
    }
    offsets
}

pub fn find_candidates(
    read: &ReadData,
    reference: &Reference,
    config: &AlignConfig,
    stats: &mut MatchFinderTileStats,
) -> CandidateSet {
    let k = reference.seed_length;
    let read_length = read.len();
    let mut ranked: Vec<RankedCandidate> = Vec::new();
    let mut fallback: Vec<RankedCandidate> = Vec::new();
    let mut discarded_heavy = false;

    for offset in seed_offsets(read_length, k, config.seed_step) {
        if read.quality[offset..offset + k as usize]
            .iter()
            .any(|&q| q < config.seed_base_quality_min)
        {
            continue;
        }
        let Some(forward) = pack_kmer(&read.sequence, offset, k) else {
            continue; // ambiguous base inside the seed
        };
        let rc = reverse_complement(forward, k);

        let forward_matches = lookup_positions(reference, forward);
        let rc_matches = lookup_positions(reference, rc);

        let (forward_positions, forward_heavy) = forward_matches;
        let (rc_positions, rc_heavy) = rc_matches;
        if forward_heavy || rc_heavy {
            // Over the repeat threshold: the index does not even know the
            // positions.
            stats.too_many_repeats_seeds += 1;
            discarded_heavy = true;
            continue;
        }

        let total = forward_positions.len() + rc_positions.len();
        if total == 0 {
            stats.no_match_seeds += 1;
            continue;
        }

        let push = |list: &mut Vec<RankedCandidate>, seed_repeats: u32| {
            for &position in forward_positions {
                if let Some(candidate) =
                    candidate_from_match(reference, position, false, offset, read_length, k)
                {
                    list.push(RankedCandidate {
                        candidate,
                        seed_repeats,
                    });
                }
            }
            for &position in rc_positions {
                if let Some(candidate) =
                    candidate_from_match(reference, position, true, offset, read_length, k)
                {
                    list.push(RankedCandidate {
                        candidate,
                        seed_repeats,
                    });
                }
            }
        };

        if total == 1 {
            stats.unique_match_seeds += 1;
            push(&mut ranked, 1);
            if !config.ignore_neighbors {
                expand_neighbors(
                    reference,
                    config,
                    forward,
                    rc,
                    offset,
                    read_length,
                    forward_positions,
                    rc_positions,
                    &mut ranked,
                    stats,
                );
            }
        } else if total as u32 <= config.match_finder_too_many_repeats {
            stats.repeat_match_seeds += 1;
            stats.repeat_matches += total as u64;
            push(&mut ranked, total as u32);
        } else if total as u32 <= config.match_finder_way_too_many_repeats {
            // Kept only if no better seed produces anything for this read.
            stats.too_many_repeats_seeds += 1;
            if !config.ignore_repeats {
                push(&mut fallback, total as u32);
            }
        } else {
            stats.too_many_repeats_seeds += 1;
            discarded_heavy = true;
        }
    }

    let mut dodgy = false;
    if ranked.is_empty() && !fallback.is_empty() {
        ranked = fallback;
        dodgy = true;
    } else if ranked.is_empty() && discarded_heavy {
        dodgy = true;
    }

    // Cap, preferring low-repeat seeds, then low contig, then low offset.
    if ranked.len() > config.candidate_matches_max {
        ranked.sort_by_key(|r| (r.seed_repeats, r.candidate.contig, r.candidate.start));
        ranked.truncate(config.candidate_matches_max);
    }

    let mut candidates: Vec<SeedCandidate> = ranked.into_iter().map(|r| r.candidate).collect();
    candidates.sort_by_key(|c| (c.contig, c.start, c.reverse));
    candidates.dedup();

    CandidateSet { candidates, dodgy }
}

/// (positions, over-threshold flag)
fn lookup_positions(reference: &Reference, kmer: u64) -> (&[ReferencePosition], bool) {
    match reference.index.lookup(kmer) {
        KmerLookup::NoMatch => (&[], false),
        KmerLookup::TooManyRepeats => (&[], true),
        KmerLookup::Matches(positions) => (positions, false),
    }
}

fn candidate_from_match(
    reference: &Reference,
    position: ReferencePosition,
    reverse: bool,
    seed_offset: usize,
    read_length: usize,
    k: u32,
) -> Option<SeedCandidate> {
    let contig = position.contig();
    let contig_length = reference.contigs.get(contig).len() as i64;
    let start = if reverse {
        position.offset() as i64 - (read_length - seed_offset - k as usize) as i64
    } else {
        position.offset() as i64 - seed_offset as i64
    };
    // require at least one base of overlap with the contig
    if start <= -(read_length as i64) || start >= contig_length {
        return None;
    }
    Some(SeedCandidate {
        contig,
        start,
        reverse,
    })
}

const NEIGHBOR_POSITIONS_MAX: usize = 16;

/// Adds positions one mismatch away from a unique seed, when the
/// k-uniqueness annotation marks the seed near-unique.
#[allow(clippy::too_many_arguments)]
fn expand_neighbors(
    reference: &Reference,
    config: &AlignConfig,
    forward: u64,
    rc: u64,
    seed_offset: usize,
    read_length: usize,
    forward_positions: &[ReferencePosition],
    rc_positions: &[ReferencePosition],
    ranked: &mut Vec<RankedCandidate>,
    stats: &mut MatchFinderTileStats,
) {
    if config.neighborhood_size_threshold == 0 {
        return;
    }
    let Some(annotation) = &reference.k_uniqueness else {
        return;
    };
    let matched = forward_positions.first().or(rc_positions.first());
    let Some(&position) = matched else { return };
    let genomic = reference.contigs.position_to_genomic_offset(position);
    if annotation.value_at(genomic) > config.neighborhood_size_threshold {
        return;
    }

    let reverse = forward_positions.is_empty();
    let seed = if reverse { rc } else { forward };
    let k = reference.seed_length;
    let mut added = 0usize;
    for neighbor in one_mismatch_neighbors(seed, k) {
        if added >= NEIGHBOR_POSITIONS_MAX {
            break;
        }
        if let KmerLookup::Matches(positions) = reference.index.lookup(neighbor) {
            for &p in positions {
                if added >= NEIGHBOR_POSITIONS_MAX {
                    break;
                }
                if let Some(candidate) =
                    candidate_from_match(reference, p, reverse, seed_offset, read_length, k)
                {
                    ranked.push(RankedCandidate {
                        candidate,
                        seed_repeats: 2,
                    });
                    stats.repeat_matches += 1;
                    added += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_cover_the_tail() {
        assert_eq!(seed_offsets(75, 16, 16), vec![0, 16, 32, 48, 59]);
        assert_eq!(seed_offsets(32, 16, 16), vec![0, 16]);
        assert_eq!(seed_offsets(16, 16, 16), vec![0]);
        assert!(seed_offsets(10, 16, 16).is_empty());
    }
}
