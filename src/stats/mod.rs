//! Pipeline statistics and their XML dumps.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::AddAssign;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AlignError, Result};
use crate::tiles::loader::TileLoadStats;

/// Seed classification counts, accumulated per tile.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct MatchFinderTileStats {
    pub unique_match_seeds: u64,
    pub no_match_seeds: u64,
    pub repeat_match_seeds: u64,
    pub too_many_repeats_seeds: u64,
    pub repeat_matches: u64,
}

impl AddAssign for MatchFinderTileStats {
    fn add_assign(&mut self, rhs: MatchFinderTileStats) {
        self.unique_match_seeds += rhs.unique_match_seeds;
        self.no_match_seeds += rhs.no_match_seeds;
        self.repeat_match_seeds += rhs.repeat_match_seeds;
        self.too_many_repeats_seeds += rhs.too_many_repeats_seeds;
        self.repeat_matches += rhs.repeat_matches;
    }
}

/// Template outcomes, accumulated across the alignment phase.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct TemplateStats {
    pub clusters: u64,
    pub no_candidates: u64,
    pub unaligned: u64,
    pub solo_aligned: u64,
    pub shadow_rescued: u64,
    pub proper_pairs: u64,
    pub anomalous_pairs: u64,
    pub below_mapq_threshold: u64,
}

impl AddAssign for TemplateStats {
    fn add_assign(&mut self, rhs: TemplateStats) {
        self.clusters += rhs.clusters;
        self.no_candidates += rhs.no_candidates;
        self.unaligned += rhs.unaligned;
        self.solo_aligned += rhs.solo_aligned;
        self.shadow_rescued += rhs.shadow_rescued;
        self.proper_pairs += rhs.proper_pairs;
        self.anomalous_pairs += rhs.anomalous_pairs;
        self.below_mapq_threshold += rhs.below_mapq_threshold;
    }
}

impl TemplateStats {
    pub fn record(&mut self, class: crate::alignment::TemplateClass) {
        use crate::alignment::TemplateClass::*;
        self.clusters += 1;
        match class {
            NoCandidates => self.no_candidates += 1,
            Unaligned => self.unaligned += 1,
            SoloAligned => self.solo_aligned += 1,
            ShadowRescued => self.shadow_rescued += 1,
            ProperPair => self.proper_pairs += 1,
            AnomalousPair => self.anomalous_pairs += 1,
        }
    }
}

/// Build-phase statistics, per bin then summed.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct BuildStats {
    pub bins: u64,
    pub fragments: u64,
    pub duplicates: u64,
    pub realigned: u64,
    pub unaligned_fragments: u64,
}

impl AddAssign for BuildStats {
    fn add_assign(&mut self, rhs: BuildStats) {
        self.bins += rhs.bins;
        self.fragments += rhs.fragments;
        self.duplicates += rhs.duplicates;
        self.realigned += rhs.realigned;
        self.unaligned_fragments += rhs.unaligned_fragments;
    }
}

fn open(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(
        File::create(path).map_err(|e| AlignError::io(path, e))?,
    ))
}

/// `DemultiplexingStats.xml`: what the tile loader saw.
pub fn write_demultiplexing_stats(
    path: &Path,
    per_tile: &[(u32, TileLoadStats)],
) -> Result<()> {
    let mut out = open(path)?;
    writeln!(out, "<?xml version=\"1.0\" encoding=\"utf-8\"?>")?;
    writeln!(out, "<DemultiplexingStats>")?;
    for (tile, stats) in per_tile {
        writeln!(
            out,
            "  <Tile id=\"{}\" clusters=\"{}\" pfFailed=\"{}\" malformed=\"{}\" basesTrimmed=\"{}\"/>",
            tile,
            stats.clusters_total,
            stats.clusters_pf_failed,
            stats.clusters_malformed,
            stats.bases_trimmed
        )?;
    }
    writeln!(out, "</DemultiplexingStats>")?;
    out.flush()?;
    Ok(())
}

/// `AlignmentStats.xml`: seed and template outcomes.
pub fn write_alignment_stats(
    path: &Path,
    match_finder: &MatchFinderTileStats,
    templates: &TemplateStats,
) -> Result<()> {
    let mut out = open(path)?;
    writeln!(out, "<?xml version=\"1.0\" encoding=\"utf-8\"?>")?;
    writeln!(out, "<AlignmentStats>")?;
    writeln!(
        out,
        "  <Seeds unique=\"{}\" noMatch=\"{}\" repeat=\"{}\" tooManyRepeats=\"{}\" repeatMatches=\"{}\"/>",
        match_finder.unique_match_seeds,
        match_finder.no_match_seeds,
        match_finder.repeat_match_seeds,
        match_finder.too_many_repeats_seeds,
        match_finder.repeat_matches
    )?;
    writeln!(
        out,
        "  <Templates clusters=\"{}\" noCandidates=\"{}\" unaligned=\"{}\" solo=\"{}\" shadowRescued=\"{}\" properPairs=\"{}\" anomalousPairs=\"{}\" belowMapqThreshold=\"{}\"/>",
        templates.clusters,
        templates.no_candidates,
        templates.unaligned,
        templates.solo_aligned,
        templates.shadow_rescued,
        templates.proper_pairs,
        templates.anomalous_pairs,
        templates.below_mapq_threshold
    )?;
    writeln!(out, "</AlignmentStats>")?;
    out.flush()?;
    Ok(())
}

/// `BuildStats.xml`: merge, realignment and duplicate marking outcomes.
pub fn write_build_stats(path: &Path, build: &BuildStats) -> Result<()> {
    let mut out = open(path)?;
    writeln!(out, "<?xml version=\"1.0\" encoding=\"utf-8\"?>")?;
    writeln!(out, "<BuildStats>")?;
    writeln!(
        out,
        "  <Bins count=\"{}\" fragments=\"{}\" duplicates=\"{}\" realigned=\"{}\" unaligned=\"{}\"/>",
        build.bins, build.fragments, build.duplicates, build.realigned, build.unaligned_fragments
    )?;
    writeln!(out, "</BuildStats>")?;
    out.flush()?;
    Ok(())
}
