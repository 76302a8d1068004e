use clap::Parser;
use std::path::PathBuf;

use sortalign::alignment::tls::{PairOrientation, TemplateLengthStatistics};
use sortalign::config::{AlignConfig, BarcodeMetadata, DodgyAlignmentScore, IncludeTags, RealignGapsMode};
use sortalign::memory::MemoryControl;
use sortalign::workflow::AlignWorkflow;

#[derive(Parser)]
#[command(name = "sortalign")]
#[command(about = "Seed-based short-read aligner producing sorted, indexed, compressed alignment files", long_about = None)]
#[command(version)]
struct Cli {
    // ===== Input =====
    /// Input tile files (packed cluster format, optionally .gz)
    #[arg(long = "tiles", value_name = "TILE", required = true, num_args = 1..)]
    tiles: Vec<PathBuf>,

    /// Reference metadata file (sorted-reference manifest)
    #[arg(long = "reference", value_name = "METADATA")]
    reference: PathBuf,

    /// Known indels for gap realignment (position-sorted VCF)
    #[arg(long = "known-indels", value_name = "VCF")]
    known_indels: Option<PathBuf>,

    /// Sample name for the read group and the output layout
    #[arg(long = "sample-name", value_name = "STR", default_value = "sample")]
    sample_name: String,

    /// Library name for duplicate grouping
    #[arg(long = "library-name", value_name = "STR", default_value = "lib0")]
    library_name: String,

    /// Flag contigs whose name contains any of these strings as decoys
    #[arg(long = "decoy-filter", value_name = "STR", num_args = 0..)]
    decoy_filter: Vec<String>,

    // ===== Seeding =====
    /// Seed length in bases (16..=32)
    #[arg(long = "seed-length", value_name = "INT", default_value = "16")]
    seed_length: u32,

    /// Offset step between consecutive seeds
    #[arg(long = "seed-step", value_name = "INT", default_value = "16")]
    seed_step: u32,

    /// Skip seeds containing a base below this quality
    #[arg(long = "seed-base-quality-min", value_name = "INT", default_value = "3")]
    seed_base_quality_min: u8,

    /// K-mers with more reference matches than this are unusable
    #[arg(long = "repeat-threshold", value_name = "INT", default_value = "1000")]
    repeat_threshold: u32,

    /// Cap on candidate positions per read
    #[arg(long = "candidate-matches-max", value_name = "INT", default_value = "800")]
    candidate_matches_max: usize,

    /// Seeds with at most this many matches contribute unconditionally
    #[arg(long = "too-many-repeats", value_name = "INT", default_value = "8")]
    too_many_repeats: u32,

    /// Seeds beyond this many matches are discarded outright
    #[arg(long = "way-too-many-repeats", value_name = "INT", default_value = "128")]
    way_too_many_repeats: u32,

    /// Shadow rescue window half-width, in TLS standard deviations
    #[arg(long = "shadow-split-repeats", value_name = "INT", default_value = "2")]
    shadow_split_repeats: u32,

    /// Expand near-unique seeds with one-mismatch neighbors up to this
    /// annotation value (0 disables)
    #[arg(long = "neighborhood-size-threshold", value_name = "INT", default_value = "0")]
    neighborhood_size_threshold: u8,

    /// Never expand neighbor positions
    #[arg(long = "ignore-neighbors")]
    ignore_neighbors: bool,

    /// Never fall back to heavily repeated seeds
    #[arg(long = "ignore-repeats")]
    ignore_repeats: bool,

    // ===== Tile loading =====
    /// Clusters resident per batch
    #[arg(long = "clusters-at-a-time", value_name = "INT", default_value = "500000")]
    clusters_at_a_time: usize,

    /// Also align clusters that failed the chastity filter
    #[arg(long = "include-non-pf")]
    include_non_pf: bool,

    /// Trim trailing bases below this quality (0 disables)
    #[arg(long = "base-quality-cutoff", value_name = "INT", default_value = "25")]
    base_quality_cutoff: u8,

    /// Tolerate missing tile files
    #[arg(long = "ignore-missing-bcls")]
    ignore_missing_bcls: bool,

    /// Tolerate missing filter files
    #[arg(long = "ignore-missing-filters")]
    ignore_missing_filters: bool,

    // ===== Alignment =====
    /// Mismatch count that triggers the gapped aligner
    #[arg(long = "gapped-mismatches-max", value_name = "INT", default_value = "5")]
    gapped_mismatches_max: u32,

    /// Reject gapped alignments with more gaps than this
    #[arg(long = "smith-waterman-gaps-max", value_name = "INT", default_value = "2")]
    smith_waterman_gaps_max: u32,

    /// Run the gapped aligner on every escalated candidate, not only those
    /// whose mismatch pattern suggests a gap
    #[arg(long = "exhaustive-smith-waterman")]
    exhaustive_smith_waterman: bool,

    /// Band width of the gapped aligner (largest representable gap)
    #[arg(long = "smith-waterman-gap-size-max", value_name = "INT", default_value = "16")]
    smith_waterman_gap_size_max: u32,

    /// Gap aligner match score
    #[arg(long = "gap-match-score", value_name = "INT", default_value = "2")]
    gap_match_score: i32,

    /// Gap aligner mismatch score
    #[arg(long = "gap-mismatch-score", value_name = "INT", default_value = "-4")]
    gap_mismatch_score: i32,

    /// Gap open score
    #[arg(long = "gap-open-score", value_name = "INT", default_value = "-6")]
    gap_open_score: i32,

    /// Gap extend score
    #[arg(long = "gap-extend-score", value_name = "INT", default_value = "-1")]
    gap_extend_score: i32,

    /// Floor on the total extension score of one gap
    #[arg(long = "min-gap-extend-score", value_name = "INT", default_value = "-5")]
    min_gap_extend_score: i32,

    /// Deletions at least this long are reported as splits
    #[arg(long = "split-gap-length", value_name = "INT", default_value = "10000")]
    split_gap_length: u32,

    /// Score handicap for pairs with no TLS-consistent combination
    #[arg(long = "anomalous-pair-handicap", value_name = "INT", default_value = "240")]
    anomalous_pair_handicap: u32,

    /// What to report for alignments with no probabilistic distinction:
    /// "unaligned", "unknown", or a fixed score
    #[arg(long = "dodgy-alignment-score", value_name = "STR", default_value = "8")]
    dodgy_alignment_score: String,

    /// Accepted deviation from the TLS median, in standard deviations
    #[arg(long = "mate-drift-range", value_name = "FLOAT", default_value = "3.0")]
    mate_drift_range: f64,

    /// Pairs used to learn the template length distribution
    #[arg(long = "tls-sample-pairs", value_name = "INT", default_value = "10000")]
    tls_sample_pairs: usize,

    /// Use a fixed template length distribution instead of learning one:
    /// ORIENTATION:MEDIAN:MIN:MAX (e.g. FR:300:150:450)
    #[arg(long = "tls", value_name = "STR")]
    tls: Option<String>,

    /// Pick repeat placements deterministically instead of scattering by
    /// cluster id
    #[arg(long = "no-scatter-repeats")]
    no_scatter_repeats: bool,

    /// Do not rescue shadow reads by windowed search
    #[arg(long = "no-rescue-shadows")]
    no_rescue_shadows: bool,

    /// Do not clip adapter run-through in proper pairs
    #[arg(long = "no-trim-pe-adapters")]
    no_trim_pe_adapters: bool,

    /// Soft-clip read ends with a high mismatch density
    #[arg(long = "clip-semialigned")]
    clip_semialigned: bool,

    /// Treat fragments below this mapping quality as unaligned (0 keeps
    /// everything)
    #[arg(long = "mapq-threshold", value_name = "INT", default_value = "0")]
    mapq_threshold: u8,

    // ===== Binning and build =====
    /// Expected genome coverage, used for bin sizing
    #[arg(long = "expected-coverage", value_name = "INT", default_value = "60")]
    expected_coverage: u32,

    /// Target bin size in bytes (0 derives it from available memory)
    #[arg(long = "target-bin-size", value_name = "BYTES", default_value = "0")]
    target_bin_size: u64,

    /// Expected compressed/uncompressed ratio of the output
    #[arg(long = "expected-bgzf-compression-ratio", value_name = "FLOAT", default_value = "0.5")]
    expected_bgzf_compression_ratio: f64,

    /// Let the merger do all the sorting instead of pre-sorting batches
    #[arg(long = "no-pre-sort-bins")]
    no_pre_sort_bins: bool,

    /// Drop unaligned clusters instead of keeping them in the output
    #[arg(long = "discard-unaligned")]
    discard_unaligned: bool,

    /// Emit unaligned fragments after all aligned ones
    #[arg(long = "put-unaligned-in-the-back")]
    put_unaligned_in_the_back: bool,

    /// Gap realignment mode: off, sample or cohort
    #[arg(long = "realign-gaps", value_name = "MODE", default_value = "sample")]
    realign_gaps: String,

    /// Only realign fragments with at least this mapping quality
    #[arg(long = "realign-mapq-min", value_name = "INT", default_value = "60")]
    realign_mapq_min: u8,

    /// Maximum gaps introduced per realigned fragment
    #[arg(long = "realigned-gaps-per-fragment", value_name = "INT", default_value = "2")]
    realigned_gaps_per_fragment: u32,

    /// Accept realignments that do not reduce the mismatch count
    #[arg(long = "realign-vigorously")]
    realign_vigorously: bool,

    /// Do not mark duplicates
    #[arg(long = "no-mark-duplicates")]
    no_mark_duplicates: bool,

    /// Remove duplicate fragments instead of flagging them
    #[arg(long = "discard-duplicates")]
    discard_duplicates: bool,

    /// Group duplicates per barcode library instead of one library per
    /// sample
    #[arg(long = "per-barcode-libraries")]
    per_barcode_libraries: bool,

    // ===== Output =====
    /// Output directory
    #[arg(short = 'o', long = "output-directory", value_name = "DIR", default_value = "Aligned")]
    output_directory: PathBuf,

    /// Temporary directory
    #[arg(long = "temp-directory", value_name = "DIR", default_value = "Temp")]
    temp_directory: PathBuf,

    /// Compression level of the output blocks
    #[arg(long = "bam-gzip-level", value_name = "INT", default_value = "6")]
    bam_gzip_level: u32,

    /// Skip the MD5 digest of the uncompressed output
    #[arg(long = "no-bam-md5")]
    no_bam_md5: bool,

    /// Optional tags to emit (comma-separated subset of
    /// AS,BC,NM,OC,RG,SM,ZX,ZY)
    #[arg(long = "bam-tags", value_name = "TAGS", default_value = "AS,BC,NM,OC,RG,SM")]
    bam_tags: String,

    /// Remove intermediary bin files once the output is written
    #[arg(long = "cleanup-intermediary")]
    cleanup_intermediary: bool,

    // ===== Resources =====
    /// Worker threads (default: all cores)
    #[arg(short = 't', long = "threads", value_name = "INT")]
    threads: Option<usize>,

    /// Tile loader threads
    #[arg(long = "input-loaders-max", value_name = "INT", default_value = "4")]
    input_loaders_max: usize,

    /// Bin saver threads
    #[arg(long = "temp-savers-max", value_name = "INT", default_value = "8")]
    temp_savers_max: usize,

    /// Bin loader threads for the build phase
    #[arg(long = "temp-loaders-max", value_name = "INT", default_value = "8")]
    temp_loaders_max: usize,

    /// Output writer threads
    #[arg(long = "output-savers-max", value_name = "INT", default_value = "8")]
    output_savers_max: usize,

    /// Memory budget in gigabytes for bin sizing
    #[arg(long = "memory-limit", value_name = "GiB", default_value = "4")]
    memory_limit: u64,

    /// Memory throttle: off, warn or strict
    #[arg(long = "memory-control", value_name = "MODE", default_value = "off")]
    memory_control: String,

    /// Verbosity: 1=error, 2=warning, 3=info, 4=debug, 5+=trace
    #[arg(short = 'v', long = "verbosity", value_name = "INT", default_value = "3")]
    verbosity: i32,
}

fn parse_dodgy(value: &str) -> Result<DodgyAlignmentScore, String> {
    match value {
        "unaligned" => Ok(DodgyAlignmentScore::Unaligned),
        "unknown" => Ok(DodgyAlignmentScore::Unknown),
        number => number
            .parse::<u8>()
            .map(DodgyAlignmentScore::Score)
            .map_err(|_| format!("invalid dodgy alignment score '{}'", number)),
    }
}

/// ORIENTATION:MEDIAN:MIN:MAX
fn parse_tls(value: &str) -> Result<TemplateLengthStatistics, String> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 4 {
        return Err(format!("expected ORIENTATION:MEDIAN:MIN:MAX, got '{}'", value));
    }
    let orientation = match parts[0] {
        "FF" => PairOrientation::Ff,
        "FR" => PairOrientation::Fr,
        "RF" => PairOrientation::Rf,
        "RR" => PairOrientation::Rr,
        other => return Err(format!("unknown orientation '{}'", other)),
    };
    let parse = |s: &str| s.parse::<u32>().map_err(|_| format!("bad number '{}'", s));
    Ok(TemplateLengthStatistics::from_user(
        orientation,
        parse(parts[1])?,
        parse(parts[2])?,
        parse(parts[3])?,
    ))
}

fn parse_tags(value: &str) -> Result<IncludeTags, String> {
    let mut tags = IncludeTags {
        alignment_score: false,
        barcode: false,
        edit_distance: false,
        original_cigar: false,
        read_group: false,
        template_score: false,
        cluster_x: false,
        cluster_y: false,
    };
    for tag in value.split(',').filter(|t| !t.is_empty()) {
        match tag {
            "AS" => tags.alignment_score = true,
            "BC" => tags.barcode = true,
            "NM" => tags.edit_distance = true,
            "OC" => tags.original_cigar = true,
            "RG" => tags.read_group = true,
            "SM" => tags.template_score = true,
            "ZX" => tags.cluster_x = true,
            "ZY" => tags.cluster_y = true,
            other => return Err(format!("unknown tag '{}'", other)),
        }
    }
    Ok(tags)
}

fn build_config(cli: &Cli) -> Result<AlignConfig, String> {
    let mut config = AlignConfig::default();
    config.tile_paths = cli.tiles.clone();
    config.reference_metadata = cli.reference.clone();
    config.temp_directory = cli.temp_directory.clone();
    config.output_directory = cli.output_directory.clone();
    config.known_indels = cli.known_indels.clone();
    config.barcodes = vec![BarcodeMetadata {
        name: "default".into(),
        sample: cli.sample_name.clone(),
        library: cli.library_name.clone(),
        read_group_id: format!("{}-{}", cli.sample_name, cli.library_name),
    }];
    config.decoy_filter = cli.decoy_filter.clone();

    config.seed_length = cli.seed_length;
    config.seed_step = cli.seed_step;
    config.seed_base_quality_min = cli.seed_base_quality_min;
    config.repeat_threshold = cli.repeat_threshold;
    config.candidate_matches_max = cli.candidate_matches_max;
    config.match_finder_too_many_repeats = cli.too_many_repeats;
    config.match_finder_way_too_many_repeats = cli.way_too_many_repeats;
    config.match_finder_shadow_split_repeats = cli.shadow_split_repeats;
    config.neighborhood_size_threshold = cli.neighborhood_size_threshold;
    config.ignore_neighbors = cli.ignore_neighbors;
    config.ignore_repeats = cli.ignore_repeats;

    config.clusters_at_a_time_max = cli.clusters_at_a_time;
    config.pf_only = !cli.include_non_pf;
    config.base_quality_cutoff = cli.base_quality_cutoff;
    config.ignore_missing_bcls = cli.ignore_missing_bcls;
    config.ignore_missing_filters = cli.ignore_missing_filters;

    config.gapped_mismatches_max = cli.gapped_mismatches_max;
    config.smith_waterman_gaps_max = cli.smith_waterman_gaps_max;
    config.smart_smith_waterman = !cli.exhaustive_smith_waterman;
    config.smith_waterman_gap_size_max = cli.smith_waterman_gap_size_max;
    config.alignment_cfg.match_score = cli.gap_match_score;
    config.alignment_cfg.mismatch_score = cli.gap_mismatch_score;
    config.alignment_cfg.gap_open_score = cli.gap_open_score;
    config.alignment_cfg.gap_extend_score = cli.gap_extend_score;
    config.alignment_cfg.min_gap_extend_score = cli.min_gap_extend_score;
    config.alignment_cfg.split_gap_length = cli.split_gap_length;
    config.anomalous_pair_handicap = cli.anomalous_pair_handicap;
    config.dodgy_alignment_score = parse_dodgy(&cli.dodgy_alignment_score)?;
    config.mate_drift_range = cli.mate_drift_range;
    config.tls_sample_pairs = cli.tls_sample_pairs;
    config.user_tls = cli.tls.as_deref().map(parse_tls).transpose()?;
    config.scatter_repeats = !cli.no_scatter_repeats;
    config.rescue_shadows = !cli.no_rescue_shadows;
    config.trim_pe_adapters = !cli.no_trim_pe_adapters;
    config.clip_semialigned = cli.clip_semialigned;
    config.mapq_threshold = cli.mapq_threshold;

    config.expected_coverage = cli.expected_coverage;
    config.target_bin_size = cli.target_bin_size;
    config.expected_bgzf_compression_ratio = cli.expected_bgzf_compression_ratio;
    config.pre_sort_bins = !cli.no_pre_sort_bins;
    config.keep_unaligned = !cli.discard_unaligned;
    config.put_unaligned_in_the_back = cli.put_unaligned_in_the_back;

    config.realign_gaps = match cli.realign_gaps.as_str() {
        "off" => RealignGapsMode::Off,
        "sample" => RealignGapsMode::Sample,
        "cohort" => RealignGapsMode::Cohort,
        other => return Err(format!("unknown realign-gaps mode '{}'", other)),
    };
    config.realign_mapq_min = cli.realign_mapq_min;
    config.realigned_gaps_per_fragment = cli.realigned_gaps_per_fragment;
    config.realign_vigorously = cli.realign_vigorously;
    config.mark_duplicates = !cli.no_mark_duplicates;
    config.keep_duplicates = !cli.discard_duplicates;
    config.single_library_samples = !cli.per_barcode_libraries;

    config.bam_gzip_level = cli.bam_gzip_level;
    config.bam_produce_md5 = !cli.no_bam_md5;
    config.include_tags = parse_tags(&cli.bam_tags)?;
    config.command_line = std::env::args().collect::<Vec<_>>().join(" ");

    config.cores_max = cli.threads.unwrap_or_else(num_cpus::get).max(1);
    config.input_loaders_max = cli.input_loaders_max;
    config.temp_savers_max = cli.temp_savers_max;
    config.temp_loaders_max = cli.temp_loaders_max;
    config.output_savers_max = cli.output_savers_max;
    config.available_memory = cli.memory_limit.max(1) << 30;
    config.memory_control = cli.memory_control.parse::<MemoryControl>()?;
    config.cleanup_intermediary = cli.cleanup_intermediary;
    Ok(config)
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_target(false)
        .init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(message) => {
            log::error!("{}", message);
            std::process::exit(2);
        }
    };

    log::info!("sortalign {} starting", env!("CARGO_PKG_VERSION"));
    log::info!("  reference: {}", config.reference_metadata.display());
    log::info!("  tiles: {}", config.tile_paths.len());
    log::info!("  threads: {}", config.cores_max);

    let mut workflow = match AlignWorkflow::new(config) {
        Ok(workflow) => workflow,
        Err(e) => {
            log::error!("Aligner failed at startup: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = workflow.run() {
        log::error!(
            "Aligner failed at {}: {}",
            workflow.state().stage(),
            e
        );
        for transition in workflow.transitions() {
            log::error!("  {}", transition);
        }
        std::process::exit(e.exit_code());
    }
    log::info!("sortalign finished");
}
