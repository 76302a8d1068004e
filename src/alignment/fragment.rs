//! Fragment metadata: one proposed alignment of one read.

use crate::alignment::cigar::{self, Cigar};
use crate::alignment::quality::{UNKNOWN_ALIGNMENT_SCORE, UNKNOWN_MAPQ};
use crate::reference::ReferencePosition;

/// Created by the template builder, refined by the realigner, persisted
/// into bins. `position` is the leftmost aligned reference base, after any
/// leading soft clip.
#[derive(Debug, Clone)]
pub struct FragmentMetadata {
    /// 0 or 1: which read of the cluster this fragment describes.
    pub read_index: usize,
    pub position: ReferencePosition,
    pub reverse: bool,
    pub cigar: Cigar,
    pub mismatches: u32,
    pub gaps: u32,
    pub edit_distance: u32,
    /// Sum of per-base log probabilities over the aligned (non-clipped)
    /// bases of the read.
    pub log_probability: f64,
    pub alignment_score: u32,
    pub mapq: u8,
    /// Produced by shadow rescue rather than seed matching.
    pub rescued: bool,
    /// No probabilistic distinction from its alternatives.
    pub dodgy: bool,
}

impl FragmentMetadata {
    pub fn new(
        read_index: usize,
        position: ReferencePosition,
        reverse: bool,
        cigar: Cigar,
        mismatches: u32,
        log_probability: f64,
    ) -> Self {
        let gaps = cigar::gap_count(&cigar);
        let gap_bases: u32 = cigar
            .iter()
            .filter(|(op, _)| matches!(op, cigar::CigarOp::Insert | cigar::CigarOp::Delete))
            .map(|&(_, len)| len)
            .sum();
        FragmentMetadata {
            read_index,
            position,
            reverse,
            cigar,
            mismatches,
            gaps,
            edit_distance: mismatches + gap_bases,
            log_probability,
            alignment_score: UNKNOWN_ALIGNMENT_SCORE,
            mapq: UNKNOWN_MAPQ,
            rescued: false,
            dodgy: false,
        }
    }

    /// Reference span of the alignment.
    pub fn observed_length(&self) -> u32 {
        cigar::reference_length(&self.cigar)
    }

    /// Exclusive end position on the reference.
    pub fn end_position(&self) -> ReferencePosition {
        self.position.shifted(self.observed_length() as i64)
    }

    /// Key identifying the alignment for deduplication of candidates that
    /// converged to the same spot.
    pub fn alignment_key(&self) -> (ReferencePosition, bool) {
        (self.position, self.reverse)
    }
}
