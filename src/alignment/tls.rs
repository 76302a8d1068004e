//! Template length statistics: the per-barcode empirical insert-size
//! distribution learned from the first confidently aligned pairs.

use serde::{Deserialize, Serialize};

use crate::alignment::fragment::FragmentMetadata;

/// Relative orientation of the two reads of a template, named by the
/// strand of the leftmost read then the rightmost one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairOrientation {
    Ff,
    Fr,
    Rf,
    Rr,
}

impl PairOrientation {
    pub const ALL: [PairOrientation; 4] = [
        PairOrientation::Ff,
        PairOrientation::Fr,
        PairOrientation::Rf,
        PairOrientation::Rr,
    ];

    pub fn index(self) -> usize {
        match self {
            PairOrientation::Ff => 0,
            PairOrientation::Fr => 1,
            PairOrientation::Rf => 2,
            PairOrientation::Rr => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PairOrientation::Ff => "FF",
            PairOrientation::Fr => "FR",
            PairOrientation::Rf => "RF",
            PairOrientation::Rr => "RR",
        }
    }
}

/// Observed geometry of an aligned pair on the same contig: orientation and
/// template length (distance from the leftmost aligned base of the left
/// fragment to the rightmost aligned base of the right one).
pub fn observe_pair(first: &FragmentMetadata, second: &FragmentMetadata) -> Option<(PairOrientation, u32)> {
    if first.position.contig() != second.position.contig() {
        return None;
    }
    let (left, right) = if first.position <= second.position {
        (first, second)
    } else {
        (second, first)
    };
    let orientation = match (left.reverse, right.reverse) {
        (false, false) => PairOrientation::Ff,
        (false, true) => PairOrientation::Fr,
        (true, false) => PairOrientation::Rf,
        (true, true) => PairOrientation::Rr,
    };
    let length = right.end_position().offset() as i64 - left.position.offset() as i64;
    if length <= 0 {
        return None;
    }
    Some((orientation, length as u32))
}

/// Frozen distribution: (median, low and high quantiles, dominant
/// orientation). `low`/`high` already include the configured drift range,
/// so proper-pair classification is a plain range check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TemplateLengthStatistics {
    pub orientation: PairOrientation,
    pub median: u32,
    pub quantile_low: u32,
    pub quantile_high: u32,
    pub mean: f64,
    pub std_dev: f64,
    pub low: u32,
    pub high: u32,
    pub sample_count: u64,
    pub stable: bool,
}

impl TemplateLengthStatistics {
    /// A user-specified distribution: median plus an explicit window.
    pub fn from_user(orientation: PairOrientation, median: u32, low: u32, high: u32) -> Self {
        let spread = (high.saturating_sub(low)) as f64 / 4.0;
        TemplateLengthStatistics {
            orientation,
            median,
            quantile_low: low,
            quantile_high: high,
            mean: median as f64,
            std_dev: spread.max(1.0),
            low,
            high,
            sample_count: 0,
            stable: true,
        }
    }

    /// Is a pair with this geometry a proper pair?
    pub fn is_proper(&self, orientation: PairOrientation, template_length: u32) -> bool {
        self.stable
            && orientation == self.orientation
            && (self.low..=self.high).contains(&template_length)
    }
}

const MIN_ORIENTATION_COUNT: usize = 10;
const OUTLIER_BOUND: f64 = 2.0;

/// Accumulates insert sizes until the configured pair count is reached,
/// then freezes. One builder per barcode, mutex-guarded during training.
pub struct TlsBuilder {
    samples: [Vec<u32>; 4],
    target: usize,
    drift: f64,
    max_insert: u32,
    frozen: Option<TemplateLengthStatistics>,
}

impl TlsBuilder {
    pub fn new(target: usize, drift: f64) -> Self {
        TlsBuilder {
            samples: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
            target,
            drift,
            max_insert: 50_000,
            frozen: None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    pub fn statistics(&self) -> Option<&TemplateLengthStatistics> {
        self.frozen.as_ref()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.iter().map(|s| s.len()).sum()
    }

    /// Records one confidently aligned pair. Returns true if this sample
    /// completed the training block and froze the statistics.
    pub fn add(&mut self, orientation: PairOrientation, template_length: u32) -> bool {
        if self.frozen.is_some() {
            return false;
        }
        if template_length == 0 || template_length > self.max_insert {
            return false;
        }
        self.samples[orientation.index()].push(template_length);
        if self.sample_count() >= self.target {
            self.freeze();
            return true;
        }
        false
    }

    /// Computes the distribution from whatever was collected. Harmless on
    /// an already-frozen builder.
    pub fn freeze(&mut self) {
        if self.frozen.is_some() {
            return;
        }
        let dominant = PairOrientation::ALL
            .into_iter()
            .max_by_key(|o| self.samples[o.index()].len())
            .unwrap();
        let sizes = &mut self.samples[dominant.index()];
        if sizes.len() < MIN_ORIENTATION_COUNT {
            log::warn!(
                "[tls] only {} pairs observed, template statistics unstable",
                sizes.len()
            );
            self.frozen = Some(TemplateLengthStatistics {
                orientation: dominant,
                median: 0,
                quantile_low: 0,
                quantile_high: 0,
                mean: 0.0,
                std_dev: 0.0,
                low: 0,
                high: 0,
                sample_count: sizes.len() as u64,
                stable: false,
            });
            return;
        }

        sizes.sort_unstable();
        let quantile = |q: f64| sizes[((q * sizes.len() as f64 + 0.499) as usize).min(sizes.len() - 1)];
        let p25 = quantile(0.25);
        let p50 = quantile(0.50);
        let p75 = quantile(0.75);
        let iqr = (p75 - p25) as f64;

        // Mean and deviation over the inliers only.
        let low_cut = (p25 as f64 - OUTLIER_BOUND * iqr).max(1.0);
        let high_cut = p75 as f64 + OUTLIER_BOUND * iqr;
        let inliers: Vec<u32> = sizes
            .iter()
            .copied()
            .filter(|&s| (s as f64) >= low_cut && (s as f64) <= high_cut)
            .collect();
        let mean = inliers.iter().map(|&s| s as f64).sum::<f64>() / inliers.len() as f64;
        let variance = inliers
            .iter()
            .map(|&s| (s as f64 - mean) * (s as f64 - mean))
            .sum::<f64>()
            / inliers.len() as f64;
        let std_dev = variance.sqrt().max(1.0);

        let low = (mean - self.drift * std_dev).max(0.0) as u32;
        let high = (mean + self.drift * std_dev).ceil() as u32;

        log::info!(
            "[tls] orientation {} median {} quantiles ({}, {}) mean {:.1} sd {:.1} proper range [{}, {}] from {} pairs",
            dominant.name(),
            p50,
            p25,
            p75,
            mean,
            std_dev,
            low,
            high,
            sizes.len()
        );

        self.frozen = Some(TemplateLengthStatistics {
            orientation: dominant,
            median: p50,
            quantile_low: p25,
            quantile_high: p75,
            mean,
            std_dev,
            low,
            high,
            sample_count: sizes.len() as u64,
            stable: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::cigar::CigarOp;
    use crate::reference::ReferencePosition;

    fn fragment(offset: u32, reverse: bool, len: u32) -> FragmentMetadata {
        FragmentMetadata::new(
            0,
            ReferencePosition::new(0, offset),
            reverse,
            vec![(CigarOp::Align, len)],
            0,
            -1.0,
        )
    }

    #[test]
    fn pair_observation_reports_fr_geometry() {
        let first = fragment(100, false, 75);
        let second = fragment(225, true, 75);
        let (orientation, length) = observe_pair(&first, &second).unwrap();
        assert_eq!(orientation, PairOrientation::Fr);
        assert_eq!(length, 200);
        // argument order does not matter
        assert_eq!(observe_pair(&second, &first).unwrap(), (orientation, length));
    }

    #[test]
    fn builder_freezes_at_target_and_classifies() {
        let mut builder = TlsBuilder::new(100, 3.0);
        for i in 0..100u32 {
            let length = 190 + (i % 21); // 190..=210
            if builder.add(PairOrientation::Fr, length) {
                break;
            }
        }
        let tls = builder.statistics().expect("frozen");
        assert!(tls.stable);
        assert_eq!(tls.orientation, PairOrientation::Fr);
        assert!((190..=210).contains(&tls.median));
        assert!(tls.is_proper(PairOrientation::Fr, 200));
        assert!(!tls.is_proper(PairOrientation::Rf, 200));
        assert!(!tls.is_proper(PairOrientation::Fr, 5000));
    }

    #[test]
    fn sparse_data_freezes_unstable() {
        let mut builder = TlsBuilder::new(10, 3.0);
        builder.add(PairOrientation::Fr, 200);
        builder.freeze();
        assert!(!builder.statistics().unwrap().stable);
    }
}
