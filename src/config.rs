// Alignment options structure. One instance is built from the command line
// and threaded through the whole pipeline; nothing reads configuration from
// the environment.

use std::path::PathBuf;

use crate::alignment::tls::TemplateLengthStatistics;
use crate::memory::MemoryControl;

/// What to do with alignments that have no probabilistic distinction from
/// their alternatives (for example both seeds fell into repeats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DodgyAlignmentScore {
    /// Emit the fragment as unaligned.
    Unaligned,
    /// Keep the position, report MAPQ 255.
    Unknown,
    /// Keep the position with this fixed score.
    Score(u8),
}

/// Gap realignment mode for the build phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealignGapsMode {
    Off,
    /// Realign against gaps seen in the sample plus known indels.
    Sample,
    /// Same gap sources, but candidate gaps are shared across all samples.
    Cohort,
}

/// Optional SAM tag selection for the output writer.
#[derive(Debug, Clone, Copy)]
pub struct IncludeTags {
    pub alignment_score: bool, // AS
    pub barcode: bool,         // BC
    pub edit_distance: bool,   // NM
    pub original_cigar: bool,  // OC
    pub read_group: bool,      // RG
    pub template_score: bool,  // SM
    pub cluster_x: bool,       // ZX
    pub cluster_y: bool,       // ZY
}

impl Default for IncludeTags {
    fn default() -> Self {
        IncludeTags {
            alignment_score: true,
            barcode: true,
            edit_distance: true,
            original_cigar: true,
            read_group: true,
            template_score: true,
            cluster_x: false,
            cluster_y: false,
        }
    }
}

/// Scores used by the banded gap aligner. Match is positive, the rest are
/// penalties expressed as negative numbers.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentCfg {
    pub match_score: i32,
    pub mismatch_score: i32,
    pub gap_open_score: i32,
    pub gap_extend_score: i32,
    /// Floor on the total extension score of a single gap run, so long
    /// gaps inside the band stay competitive with mismatching the flank.
    pub min_gap_extend_score: i32,
    /// Deletions at least this long are encoded as splits (CIGAR N).
    pub split_gap_length: u32,
}

impl Default for AlignmentCfg {
    fn default() -> Self {
        AlignmentCfg {
            match_score: 2,
            mismatch_score: -4,
            gap_open_score: -6,
            gap_extend_score: -1,
            min_gap_extend_score: -5,
            split_gap_length: 10_000,
        }
    }
}

/// Per-sample metadata. The pipeline supports one or more barcodes; every
/// cluster carries the index of the barcode it was demultiplexed into.
#[derive(Debug, Clone)]
pub struct BarcodeMetadata {
    pub name: String,
    pub sample: String,
    pub library: String,
    pub read_group_id: String,
}

impl Default for BarcodeMetadata {
    fn default() -> Self {
        BarcodeMetadata {
            name: "default".into(),
            sample: "sample".into(),
            library: "lib0".into(),
            read_group_id: "RG0".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlignConfig {
    // Input
    pub tile_paths: Vec<PathBuf>,
    pub reference_metadata: PathBuf,
    pub temp_directory: PathBuf,
    pub output_directory: PathBuf,
    pub known_indels: Option<PathBuf>,
    pub barcodes: Vec<BarcodeMetadata>,
    /// Contig names containing any of these substrings are flagged decoy in
    /// addition to the flags carried by the reference metadata.
    pub decoy_filter: Vec<String>,

    // Seeding
    pub seed_length: u32,
    pub seed_step: u32,
    pub seed_base_quality_min: u8,
    pub repeat_threshold: u32,
    pub candidate_matches_max: usize,
    pub match_finder_too_many_repeats: u32,
    pub match_finder_way_too_many_repeats: u32,
    pub match_finder_shadow_split_repeats: u32,
    pub neighborhood_size_threshold: u8,
    pub ignore_neighbors: bool,
    pub ignore_repeats: bool,

    // Tile loading
    pub clusters_at_a_time_max: usize,
    pub pf_only: bool,
    pub base_quality_cutoff: u8,
    pub ignore_missing_bcls: bool,
    pub ignore_missing_filters: bool,

    // Template building
    pub gapped_mismatches_max: u32,
    pub smith_waterman_gaps_max: u32,
    pub smart_smith_waterman: bool,
    pub smith_waterman_gap_size_max: u32,
    pub alignment_cfg: AlignmentCfg,
    pub anomalous_pair_handicap: u32,
    pub dodgy_alignment_score: DodgyAlignmentScore,
    pub mate_drift_range: f64,
    pub tls_sample_pairs: usize,
    pub user_tls: Option<TemplateLengthStatistics>,
    pub scatter_repeats: bool,
    pub rescue_shadows: bool,
    pub trim_pe_adapters: bool,
    pub clip_semialigned: bool,
    pub mapq_threshold: u8,

    // Binning
    pub expected_coverage: u32,
    pub target_bin_size: u64,
    pub expected_bgzf_compression_ratio: f64,
    pub pre_sort_bins: bool,
    pub keep_unaligned: bool,
    pub put_unaligned_in_the_back: bool,

    // Build phase
    pub realign_gaps: RealignGapsMode,
    pub realign_mapq_min: u8,
    pub realigned_gaps_per_fragment: u32,
    pub realign_vigorously: bool,
    pub mark_duplicates: bool,
    pub keep_duplicates: bool,
    pub single_library_samples: bool,

    // Output
    pub bam_gzip_level: u32,
    pub bam_produce_md5: bool,
    pub include_tags: IncludeTags,
    pub command_line: String,

    // Resources
    pub cores_max: usize,
    pub input_loaders_max: usize,
    pub temp_savers_max: usize,
    pub temp_loaders_max: usize,
    pub output_savers_max: usize,
    pub available_memory: u64,
    pub memory_control: MemoryControl,
    pub cleanup_intermediary: bool,
}

impl Default for AlignConfig {
    fn default() -> Self {
        AlignConfig {
            tile_paths: Vec::new(),
            reference_metadata: PathBuf::new(),
            temp_directory: PathBuf::from("Temp"),
            output_directory: PathBuf::from("Aligned"),
            known_indels: None,
            barcodes: vec![BarcodeMetadata::default()],
            decoy_filter: Vec::new(),

            seed_length: 16,
            seed_step: 16,
            seed_base_quality_min: 3,
            repeat_threshold: 1000,
            candidate_matches_max: 800,
            match_finder_too_many_repeats: 8,
            match_finder_way_too_many_repeats: 128,
            match_finder_shadow_split_repeats: 2,
            neighborhood_size_threshold: 0,
            ignore_neighbors: false,
            ignore_repeats: false,

            clusters_at_a_time_max: 500_000,
            pf_only: true,
            base_quality_cutoff: 25,
            ignore_missing_bcls: false,
            ignore_missing_filters: false,

            gapped_mismatches_max: 5,
            smith_waterman_gaps_max: 2,
            smart_smith_waterman: true,
            smith_waterman_gap_size_max: 16,
            alignment_cfg: AlignmentCfg::default(),
            anomalous_pair_handicap: 240,
            dodgy_alignment_score: DodgyAlignmentScore::Score(8),
            mate_drift_range: 3.0,
            tls_sample_pairs: 10_000,
            user_tls: None,
            scatter_repeats: true,
            rescue_shadows: true,
            trim_pe_adapters: true,
            clip_semialigned: false,
            mapq_threshold: 0,

            expected_coverage: 60,
            target_bin_size: 0,
            expected_bgzf_compression_ratio: 0.5,
            pre_sort_bins: true,
            keep_unaligned: true,
            put_unaligned_in_the_back: false,

            realign_gaps: RealignGapsMode::Sample,
            realign_mapq_min: 60,
            realigned_gaps_per_fragment: 2,
            realign_vigorously: false,
            mark_duplicates: true,
            keep_duplicates: true,
            single_library_samples: true,

            bam_gzip_level: 6,
            bam_produce_md5: true,
            include_tags: IncludeTags::default(),
            command_line: String::new(),

            cores_max: num_cpus::get(),
            input_loaders_max: 4,
            temp_savers_max: 8,
            temp_loaders_max: 8,
            output_savers_max: 8,
            available_memory: 4 << 30,
            memory_control: MemoryControl::Off,
            cleanup_intermediary: false,
        }
    }
}

impl AlignConfig {
    /// Estimated on-disk size of one serialised fragment, assuming a
    /// one-component CIGAR. Drives bin sizing.
    pub fn estimated_fragment_size(&self, max_read_length: usize) -> u64 {
        // fixed record fields + sequence + quality + one cigar component
        (96 + 2 * max_read_length + 8) as u64
    }

    /// Target number of fragments per bin. Either derived from the explicit
    /// bin size target or estimated from available memory, the expected
    /// compression ratio and the core count.
    pub fn target_fragments_per_bin(&self, max_read_length: usize) -> u64 {
        let fragment_size = self.estimated_fragment_size(max_read_length);
        if self.target_bin_size != 0 {
            (self.target_bin_size / fragment_size).max(1)
        } else {
            // Keep one uncompressed bin per core resident during the build
            // phase without exceeding half the memory budget.
            let per_core = self.available_memory / 2 / self.cores_max.max(1) as u64;
            let budget = (per_core as f64 * self.expected_bgzf_compression_ratio) as u64;
            (budget / fragment_size).max(1)
        }
    }

    /// Target bin length in reference bases.
    pub fn target_bin_length(&self, max_read_length: usize) -> u64 {
        (self.target_fragments_per_bin(max_read_length) / self.expected_coverage.max(1) as u64)
            .max(1)
            * max_read_length as u64
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::AlignError;
        if !(16..=32).contains(&self.seed_length) {
            return Err(AlignError::Precondition(format!(
                "seed length {} not supported, expected 16..=32",
                self.seed_length
            )));
        }
        if self.bam_gzip_level > 9 {
            return Err(AlignError::Precondition(format!(
                "invalid gzip level {}",
                self.bam_gzip_level
            )));
        }
        if self.tile_paths.is_empty() {
            return Err(AlignError::Precondition("no input tiles specified".into()));
        }
        if self.barcodes.is_empty() {
            return Err(AlignError::Precondition("no barcodes configured".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_sizing_honours_explicit_target() {
        let mut config = AlignConfig::default();
        config.target_bin_size = 1 << 20;
        let per_bin = config.target_fragments_per_bin(100);
        assert_eq!(per_bin, (1u64 << 20) / config.estimated_fragment_size(100));
        assert!(config.target_bin_length(100) >= 100);
    }

    #[test]
    fn validate_rejects_wide_seeds() {
        let mut config = AlignConfig::default();
        config.tile_paths.push("t.tile".into());
        config.seed_length = 64;
        assert!(config.validate().is_err());
    }
}
