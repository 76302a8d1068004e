//! Base-quality math: log-probability lookup tables, alignment scores and
//! mapping-quality selection.

use std::sync::OnceLock;

pub const REPEAT_ALIGNMENT_SCORE: u32 = 3;
pub const UNKNOWN_ALIGNMENT_SCORE: u32 = u32::MAX;
pub const UNKNOWN_MAPQ: u8 = 255;
pub const MAX_MAPQ: u8 = 60;

/// Qualities are PHRED integers in 0..=63.
pub const QUALITY_RANGE: usize = 64;

struct QualityTables {
    /// log(perror) where perror = 10^(-q/10)
    log_error: [f64; QUALITY_RANGE],
    /// log(1 - perror)
    log_match: [f64; QUALITY_RANGE],
    /// log(perror / 3): an erroneous call is any of the three other bases
    log_mismatch: [f64; QUALITY_RANGE],
}

fn tables() -> &'static QualityTables {
    static TABLES: OnceLock<QualityTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut t = QualityTables {
            log_error: [0.0; QUALITY_RANGE],
            log_match: [0.0; QUALITY_RANGE],
            log_mismatch: [0.0; QUALITY_RANGE],
        };
        for q in 0..QUALITY_RANGE {
            let perror = 10f64.powf(-(q as f64) / 10.0);
            t.log_error[q] = perror.ln();
            // q = 0 means perror = 1; keep the value finite so an all-N
            // read still has a comparable log probability
            t.log_match[q] = if q == 0 {
                (f64::MIN_POSITIVE).ln()
            } else {
                (1.0 - perror).ln()
            };
            t.log_mismatch[q] = (perror / 3.0).ln();
        }
        t
    })
}

#[inline]
fn clamp_quality(quality: u8) -> usize {
    (quality as usize).min(QUALITY_RANGE - 1)
}

/// log of the probability that a base call is wrong.
#[inline]
pub fn log_error(quality: u8) -> f64 {
    tables().log_error[clamp_quality(quality)]
}

/// log of the probability that a base matching the reference is correct.
#[inline]
pub fn log_match(quality: u8) -> f64 {
    tables().log_match[clamp_quality(quality)]
}

/// log of the probability that a base mismatching the reference is wrong in
/// exactly the observed way.
#[inline]
pub fn log_mismatch(quality: u8) -> f64 {
    tables().log_mismatch[clamp_quality(quality)]
}

/// The "rest of the genome" correction for a read of the given length:
/// `2 * genomeLength / 4^readLength`, the prior probability mass of an
/// equally good alignment somewhere the candidates did not cover.
pub fn rest_of_genome_correction(genome_length: u64, read_length: usize) -> f64 {
    (2f64.ln() + (genome_length as f64).ln() - 4f64.ln() * read_length as f64).exp()
}

/// Phred-scaled confidence that the chosen alignment, rather than any of
/// the others, is the true one.
pub fn compute_alignment_score(
    rest_of_genome_correction: f64,
    alignment_probability: f64,
    other_alignments_probability: f64,
) -> u32 {
    let numerator = other_alignments_probability + rest_of_genome_correction;
    let denominator =
        other_alignments_probability + alignment_probability + rest_of_genome_correction;
    let score = (-10.0 * (numerator / denominator).log10()).floor();
    if !score.is_finite() {
        return UNKNOWN_ALIGNMENT_SCORE;
    }
    score.max(0.0).min(u32::MAX as f64 - 1.0) as u32
}

#[inline]
pub fn is_unique(alignment_score: u32) -> bool {
    UNKNOWN_ALIGNMENT_SCORE != alignment_score && alignment_score > REPEAT_ALIGNMENT_SCORE
}

#[inline]
pub fn alignment_score_to_mapq(alignment_score: u32) -> u8 {
    debug_assert!(UNKNOWN_ALIGNMENT_SCORE != alignment_score);
    alignment_score.min(MAX_MAPQ as u32) as u8
}

/// Mapping quality of an aligned fragment. For proper pairs a non-unique
/// fragment is rescued only when both the mate and the pairing are unique;
/// using the pair score alone would accept a high score without having seen
/// all pairings of two non-unique fragments.
pub fn pick_mapq(
    alignment_score: u32,
    mate_alignment_score: u32,
    proper_pair: bool,
    template_alignment_score: u32,
) -> u8 {
    debug_assert!(UNKNOWN_ALIGNMENT_SCORE != alignment_score);
    alignment_score_to_mapq(if proper_pair {
        debug_assert!(UNKNOWN_ALIGNMENT_SCORE != mate_alignment_score);
        debug_assert!(UNKNOWN_ALIGNMENT_SCORE != template_alignment_score);
        alignment_score.max(template_alignment_score.min(mate_alignment_score))
    } else {
        alignment_score
    })
}

/// Mapping quality of a rescued shadow: it can never beat its anchor.
pub fn pick_mapq_from_mate(mate_mapq: u8, template_alignment_score: u32) -> u8 {
    debug_assert!(UNKNOWN_MAPQ != mate_mapq);
    debug_assert!(UNKNOWN_ALIGNMENT_SCORE != template_alignment_score);
    alignment_score_to_mapq(template_alignment_score).min(mate_mapq)
}

const LP_EPSILON: f64 = 0.000_000_1;

/// Log-probability comparison with the tolerance used throughout the
/// builder and the realigner.
#[inline]
pub fn lp_equals(left: f64, right: f64) -> bool {
    (left - right).abs() <= LP_EPSILON
}

#[inline]
pub fn lp_less(left: f64, right: f64) -> bool {
    !lp_equals(left, right) && left < right
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_match_definitions() {
        let q = 30u8;
        let perror = 10f64.powf(-3.0);
        assert!((log_error(q) - perror.ln()).abs() < 1e-12);
        assert!((log_match(q) - (1.0 - perror).ln()).abs() < 1e-12);
        assert!((log_mismatch(q) - (perror / 3.0).ln()).abs() < 1e-12);
        // out-of-range qualities clamp to the top entry
        assert_eq!(log_match(200), log_match(63));
    }

    #[test]
    fn rest_of_genome_correction_is_two_l_over_4_pow_len() {
        let rog = rest_of_genome_correction(1000, 4);
        assert!((rog - 2.0 * 1000.0 / 256.0).abs() < 1e-9);
    }

    #[test]
    fn equal_repeat_pair_scores_three() {
        // two equally likely candidates, negligible correction
        let p = 0.9f64;
        let rog = rest_of_genome_correction(1000, 75);
        let score = compute_alignment_score(rog, p, p);
        assert_eq!(score, 3);
        assert!(!is_unique(score));
    }

    #[test]
    fn unique_alignment_scores_high() {
        let rog = rest_of_genome_correction(1000, 75);
        let score = compute_alignment_score(rog, 0.97, 0.0);
        assert!(score > 60);
        assert!(is_unique(score));
        assert_eq!(alignment_score_to_mapq(score), MAX_MAPQ);
    }

    #[test]
    fn proper_pair_rescues_via_mate_and_template() {
        // non-unique fragment, unique mate and pairing
        assert_eq!(pick_mapq(3, 80, true, 100), 60);
        // both fragments non-unique: pair score must not rescue
        assert_eq!(pick_mapq(3, 2, true, 100), 3);
        assert_eq!(pick_mapq(3, 80, false, 100), 3);
    }

    #[test]
    fn shadow_mapq_capped_by_mate() {
        assert_eq!(pick_mapq_from_mate(42, 100), 42);
        assert_eq!(pick_mapq_from_mate(60, 10), 10);
    }

    #[test]
    fn lp_comparisons_tolerate_rounding() {
        assert!(lp_equals(-1.0, -1.0 + 1e-9));
        assert!(lp_less(-2.0, -1.0));
        assert!(!lp_less(-1.0 + 1e-9, -1.0));
    }
}
