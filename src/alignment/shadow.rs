//! Shadow rescue: windowed search for a read whose mate anchored but that
//! produced no seed candidates itself (too many errors, or the seed bases
//! were low quality).

use crate::alignment::fragment::FragmentMetadata;
use crate::alignment::quality::lp_less;
use crate::alignment::tls::{PairOrientation, TemplateLengthStatistics};
use crate::alignment::ungapped::{align_ungapped, OrientedRead};
use crate::config::AlignConfig;
use crate::reference::Reference;

/// Rescued shadows may carry real errors; accept up to a quarter of the
/// read mismatching.
const SHADOW_MISMATCH_FRACTION: u32 = 4;

/// How many rescued placements may enter pair enumeration.
const SHADOW_CANDIDATES_MAX: usize = 4;

/// Scans the reference window implied by the anchor and the TLS for
/// placements of the shadow read. The window is the TLS mean insert
/// extended by `match_finder_shadow_split_repeats` standard deviations on
/// both sides. Results are ordered by descending log probability.
pub fn rescue_shadow(
    shadow_read_index: usize,
    shadow_forward: &OrientedRead,
    shadow_reverse: &OrientedRead,
    anchor: &FragmentMetadata,
    tls: &TemplateLengthStatistics,
    reference: &Reference,
    config: &AlignConfig,
) -> Vec<FragmentMetadata> {
    if !tls.stable {
        return Vec::new();
    }
    let shadow_length = shadow_forward.len() as i64;
    if shadow_length == 0 {
        return Vec::new();
    }

    // the shadow strand implied by the learned orientation
    let shadow_reverse_strand = match tls.orientation {
        PairOrientation::Fr | PairOrientation::Rf => !anchor.reverse,
        PairOrientation::Ff | PairOrientation::Rr => anchor.reverse,
    };
    let oriented = if shadow_reverse_strand {
        shadow_reverse
    } else {
        shadow_forward
    };

    let drift =
        (config.match_finder_shadow_split_repeats as f64 * tls.std_dev).ceil() as i64;
    let median = tls.median as i64;
    let anchor_start = anchor.position.offset() as i64;
    let anchor_end = anchor_start + anchor.observed_length() as i64;

    // the shadow sits downstream of a forward anchor, upstream of a
    // reverse one
    let (window_low, window_high) = if !anchor.reverse {
        (
            anchor_start + median - drift - shadow_length,
            anchor_start + median + drift - shadow_length,
        )
    } else {
        (anchor_end - median - drift, anchor_end - median + drift)
    };

    let contig = reference.contigs.get(anchor.position.contig());
    let mismatches_max = (shadow_length as u32 / SHADOW_MISMATCH_FRACTION).max(1);

    let mut rescued: Vec<FragmentMetadata> = Vec::new();
    for start in window_low..=window_high {
        if start <= -shadow_length || start >= contig.len() as i64 {
            continue;
        }
        let Some(result) = align_ungapped(
            shadow_read_index,
            oriented,
            shadow_reverse_strand,
            contig,
            start,
            false,
        ) else {
            continue;
        };
        // only fully-landed placements with a plausible error load
        if result.fragment.mismatches > mismatches_max
            || result.fragment.observed_length() < shadow_length as u32
        {
            continue;
        }
        let mut fragment = result.fragment;
        fragment.rescued = true;
        rescued.push(fragment);
    }

    rescued.sort_by(|a, b| {
        if lp_less(a.log_probability, b.log_probability) {
            std::cmp::Ordering::Greater
        } else if lp_less(b.log_probability, a.log_probability) {
            std::cmp::Ordering::Less
        } else {
            a.position.cmp(&b.position)
        }
    });
    rescued.dedup_by_key(|f| f.alignment_key());
    rescued.truncate(SHADOW_CANDIDATES_MAX);
    rescued
}
