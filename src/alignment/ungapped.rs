//! Ungapped aligner: slides the read against the reference window and
//! counts mismatches. The fast path for the overwhelming majority of
//! fragments; the banded gap aligner only runs when this one reports too
//! many mismatches.

use crate::alignment::cigar::{Cigar, CigarOp};
use crate::alignment::fragment::FragmentMetadata;
use crate::alignment::quality::{log_match, log_mismatch};
use crate::reference::contig::Contig;
use crate::reference::ReferencePosition;
use crate::tiles::ReadData;

/// A read in the orientation it aligns in. Computed once per read and
/// shared by every candidate on that strand.
pub struct OrientedRead {
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
}

impl OrientedRead {
    pub fn forward(read: &ReadData) -> Self {
        OrientedRead {
            sequence: read.sequence.clone(),
            quality: read.quality.clone(),
        }
    }

    pub fn reverse(read: &ReadData) -> Self {
        let sequence = read
            .sequence
            .iter()
            .rev()
            .map(|&b| complement(b))
            .collect();
        let quality = read.quality.iter().rev().copied().collect();
        OrientedRead {
            sequence,
            quality,
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

#[inline]
pub fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'C' => b'G',
        b'G' => b'C',
        b'T' => b'A',
        other => other,
    }
}

#[inline]
fn bases_match(read_base: u8, reference_base: u8) -> bool {
    read_base == reference_base && matches!(read_base, b'A' | b'C' | b'G' | b'T')
}

/// Result of an ungapped pass: the fragment plus the longest run of
/// consecutive mismatches, which gates the smart gap aligner.
pub struct UngappedAlignment {
    pub fragment: FragmentMetadata,
    pub longest_mismatch_run: u32,
}

/// Aligns the oriented read at `start` on the contig (which may be
/// negative or overhang the end; the overhang is soft-clipped). Returns
/// `None` if no base lands inside the contig.
pub fn align_ungapped(
    read_index: usize,
    oriented: &OrientedRead,
    reverse: bool,
    contig: &Contig,
    start: i64,
    clip_semialigned: bool,
) -> Option<UngappedAlignment> {
    let read_length = oriented.len();
    let contig_length = contig.len() as i64;
    let mut first = (-start).max(0) as usize;
    let mut last = ((contig_length - start).min(read_length as i64)).max(0) as usize;
    if first >= last {
        return None;
    }

    if clip_semialigned {
        let (clipped_first, clipped_last) =
            semialigned_window(oriented, contig, start, first, last);
        first = clipped_first;
        last = clipped_last;
        if first >= last {
            return None;
        }
    }

    let mut mismatches = 0u32;
    let mut log_probability = 0.0f64;
    let mut longest_run = 0u32;
    let mut run = 0u32;
    for j in first..last {
        let reference_base = contig.sequence[(start + j as i64) as usize];
        let quality = oriented.quality[j];
        if bases_match(oriented.sequence[j], reference_base) {
            log_probability += log_match(quality);
            run = 0;
        } else {
            log_probability += log_mismatch(quality);
            mismatches += 1;
            run += 1;
            longest_run = longest_run.max(run);
        }
    }

    let mut cigar: Cigar = Vec::with_capacity(3);
    if first > 0 {
        cigar.push((CigarOp::SoftClip, first as u32));
    }
    cigar.push((CigarOp::Align, (last - first) as u32));
    if last < read_length {
        cigar.push((CigarOp::SoftClip, (read_length - last) as u32));
    }

    let position = ReferencePosition::new(contig.index, (start + first as i64) as u32);
    Some(UngappedAlignment {
        fragment: FragmentMetadata::new(
            read_index,
            position,
            reverse,
            cigar,
            mismatches,
            log_probability,
        ),
        longest_mismatch_run: longest_run,
    })
}

const SEMIALIGNED_MATCH: i32 = 1;
const SEMIALIGNED_MISMATCH: i32 = -2;

/// Soft-clips read ends whose mismatch density drags the running
/// match/mismatch score below zero: keeps the best-scoring core window.
/// Ties resolve to the leftmost window.
fn semialigned_window(
    oriented: &OrientedRead,
    contig: &Contig,
    start: i64,
    first: usize,
    last: usize,
) -> (usize, usize) {
    let score_at = |j: usize| -> i32 {
        let reference_base = contig.sequence[(start + j as i64) as usize];
        if bases_match(oriented.sequence[j], reference_base) {
            SEMIALIGNED_MATCH
        } else {
            SEMIALIGNED_MISMATCH
        }
    };

    let mut best_score = 0i32;
    let mut best = (first, first);
    let mut running = 0i32;
    let mut run_start = first;
    for j in first..last {
        running += score_at(j);
        if running > best_score {
            best_score = running;
            best = (run_start, j + 1);
        }
        if running < 0 {
            running = 0;
            run_start = j + 1;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contig(seq: &[u8]) -> Contig {
        Contig {
            index: 0,
            name: "chr1".into(),
            decoy: false,
            genomic_position: 0,
            sequence: seq.to_vec(),
        }
    }

    fn read(seq: &[u8]) -> OrientedRead {
        OrientedRead {
            sequence: seq.to_vec(),
            quality: vec![30; seq.len()],
        }
    }

    #[test]
    fn exact_match_has_no_mismatches() {
        let contig = contig(b"AAAACGTACGTCCCC");
        let oriented = read(b"ACGTACGT");
        let result = align_ungapped(0, &oriented, false, &contig, 3, false).unwrap();
        assert_eq!(result.fragment.mismatches, 0);
        assert_eq!(result.fragment.cigar, vec![(CigarOp::Align, 8)]);
        assert_eq!(result.fragment.position, ReferencePosition::new(0, 3));
        assert_eq!(result.longest_mismatch_run, 0);
    }

    #[test]
    fn overhang_is_soft_clipped() {
        let contig = contig(b"CGTACGTCCCC");
        let oriented = read(b"ACGTACGT");
        // starts one base before the contig
        let result = align_ungapped(0, &oriented, false, &contig, -1, false).unwrap();
        assert_eq!(
            result.fragment.cigar,
            vec![(CigarOp::SoftClip, 1), (CigarOp::Align, 7)]
        );
        assert_eq!(result.fragment.position, ReferencePosition::new(0, 0));
    }

    #[test]
    fn mismatch_run_is_reported() {
        let contig = contig(b"ACGTACGTACGT");
        let oriented = read(b"ACGTTTTTACGT");
        let result = align_ungapped(0, &oriented, false, &contig, 0, false).unwrap();
        assert!(result.fragment.mismatches >= 3);
        assert!(result.longest_mismatch_run >= 3);
    }

    #[test]
    fn semialigned_clipping_drops_bad_tail() {
        // perfect first half, garbage second half
        let contig = contig(b"ACGTACGTAAAAAAAA");
        let oriented = read(b"ACGTACGTTTTTTTTT");
        let result = align_ungapped(0, &oriented, false, &contig, 0, true).unwrap();
        assert_eq!(
            result.fragment.cigar,
            vec![(CigarOp::Align, 8), (CigarOp::SoftClip, 8)]
        );
        assert_eq!(result.fragment.mismatches, 0);
    }

    #[test]
    fn fully_outside_contig_is_rejected() {
        let contig = contig(b"ACGT");
        let oriented = read(b"ACGTACGT");
        assert!(align_ungapped(0, &oriented, false, &contig, 10, false).is_none());
        assert!(align_ungapped(0, &oriented, false, &contig, -20, false).is_none());
    }
}
