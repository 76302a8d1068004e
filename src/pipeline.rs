//! The concurrent alignment phase: tile loaders feed bounded batches into
//! a worker pool running seed matching and template building, and the
//! resulting records stream into bin files through the partitioner's saver
//! threads.
//!
//! Failures propagate through an abort flag: the first worker to fail
//! records its error, everybody else drains the unit in flight and exits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::bounded;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::alignment::template_builder::TemplateBuilder;
use crate::alignment::tls::{observe_pair, TemplateLengthStatistics, TlsBuilder};
use crate::alignment::TemplateClass;
use crate::alignment::quality::is_unique;
use crate::bins::metadata::{BinGrid, BinMetadata};
use crate::bins::record::records_from_template;
use crate::bins::BinPartitioner;
use crate::config::AlignConfig;
use crate::error::{AlignError, Result};
use crate::memory::{request_large_allocation, ScopedMemoryBlock};
use crate::reference::Reference;
use crate::stats::{MatchFinderTileStats, TemplateStats};
use crate::tiles::loader::{ClusterSource, TileBatch, TileLoadStats};
use crate::tiles::TileLoader;

pub struct AlignOutcome {
    pub bins: Vec<BinMetadata>,
    pub tile_stats: Vec<(u32, TileLoadStats)>,
    pub match_stats: MatchFinderTileStats,
    pub template_stats: TemplateStats,
    pub tls: Vec<TemplateLengthStatistics>,
    pub max_read_length: usize,
}

/// Learns the per-barcode template length statistics from the first
/// confidently aligned pairs. Runs single-threaded over the tiles in
/// their configured order so the learned distribution is reproducible.
fn train_template_length_statistics(
    config: &AlignConfig,
    reference: &Reference,
) -> Result<Vec<TemplateLengthStatistics>> {
    let barcode_count = config.barcodes.len();
    if let Some(user) = &config.user_tls {
        log::info!(
            "[tls] using user-provided statistics: median {} range [{}, {}]",
            user.median,
            user.low,
            user.high
        );
        return Ok(vec![*user; barcode_count]);
    }

    let mut builders: Vec<TlsBuilder> = (0..barcode_count)
        .map(|_| TlsBuilder::new(config.tls_sample_pairs, config.mate_drift_range))
        .collect();
    let loader = TileLoader::new(config);
    let builder = TemplateBuilder::new(reference, config);
    let mut match_stats = MatchFinderTileStats::default();
    let mut template_stats = TemplateStats::default();

    'tiles: for path in &config.tile_paths {
        let Some(mut source) = loader.open(path)? else {
            continue;
        };
        if source.layout().read_count < 2 {
            continue;
        }
        while let Some(batch) = loader.next_batch(&mut source)? {
            for cluster in &batch.clusters {
                if !cluster.is_paired() {
                    continue;
                }
                let template =
                    builder.build(cluster, None, &mut match_stats, &mut template_stats);
                // only unambiguous pairs may shape the distribution
                if template.class != TemplateClass::AnomalousPair {
                    continue;
                }
                let (Some(first), Some(second)) =
                    (template.fragment(0), template.fragment(1))
                else {
                    continue;
                };
                if first.dodgy || second.dodgy {
                    continue;
                }
                if !is_unique(first.alignment_score) || !is_unique(second.alignment_score) {
                    continue;
                }
                let Some((orientation, length)) = observe_pair(first, second) else {
                    continue;
                };
                if builders[cluster.barcode as usize].add(orientation, length)
                    && builders.iter().all(|b| b.is_frozen())
                {
                    break 'tiles;
                }
            }
        }
    }
    for builder in &mut builders {
        builder.freeze();
    }
    Ok(builders
        .into_iter()
        .map(|b| *b.statistics().expect("frozen above"))
        .collect())
}

/// Peeks at the first readable tile to learn the read geometry.
fn probe_max_read_length(config: &AlignConfig) -> Result<usize> {
    let loader = TileLoader::new(config);
    for path in &config.tile_paths {
        if let Some(source) = loader.open(path)? {
            return Ok(source.layout().max_read_length());
        }
    }
    Err(AlignError::Precondition(
        "no readable input tiles".into(),
    ))
}

/// Runs the whole alignment phase: every tile through matching, template
/// building and bin partitioning.
pub fn align_phase(config: &AlignConfig, reference: &Reference) -> Result<AlignOutcome> {
    let max_read_length = probe_max_read_length(config)?;
    let tls = train_template_length_statistics(config, reference)?;

    let bin_length = config.target_bin_length(max_read_length);
    log::info!(
        "[align] target bin length {} bases ({} fragments per bin)",
        bin_length,
        config.target_fragments_per_bin(max_read_length)
    );
    let grid = Arc::new(BinGrid::new(
        &reference.contigs,
        bin_length,
        &config.temp_directory,
        config.put_unaligned_in_the_back,
    ));
    let partitioner = BinPartitioner::new(Arc::clone(&grid), config.temp_savers_max, config.pre_sort_bins);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.cores_max.max(1))
        .build()
        .map_err(|e| AlignError::Resource {
            stage: "thread-pool",
            reason: e.to_string(),
        })?;

    let abort = Arc::new(AtomicBool::new(false));
    let first_error: Arc<Mutex<Option<AlignError>>> = Arc::new(Mutex::new(None));
    let (batch_tx, batch_rx) = bounded::<TileBatch>(config.input_loaders_max.max(1) * 2);
    let next_tile = Arc::new(AtomicUsize::new(0));

    // loader threads pull tile paths off the shared counter
    let mut loaders = Vec::new();
    for _ in 0..config.input_loaders_max.max(1) {
        let config = config.clone();
        let abort = Arc::clone(&abort);
        let first_error = Arc::clone(&first_error);
        let next_tile = Arc::clone(&next_tile);
        let batch_tx = batch_tx.clone();
        loaders.push(std::thread::spawn(move || {
            let loader = TileLoader::new(&config);
            loop {
                if abort.load(Ordering::Relaxed) {
                    return;
                }
                let index = next_tile.fetch_add(1, Ordering::Relaxed);
                let Some(path) = config.tile_paths.get(index) else {
                    return;
                };
                let result = (|| -> Result<()> {
                    let Some(mut source) = loader.open(path)? else {
                        return Ok(());
                    };
                    // sequence + quality bytes plus per-cluster bookkeeping
                    let batch_bytes = config.clusters_at_a_time_max
                        * (2 * source.layout().max_read_length() + 64);
                    loop {
                        // buffering a batch is the speculative large
                        // allocation the memory control gates
                        request_large_allocation(
                            config.memory_control,
                            batch_bytes,
                            "tile-load",
                        );
                        let Some(batch) = loader.next_batch(&mut source)? else {
                            return Ok(());
                        };
                        if abort.load(Ordering::Relaxed) {
                            return Ok(());
                        }
                        if batch_tx.send(batch).is_err() {
                            return Ok(());
                        }
                    }
                })();
                if let Err(error) = result {
                    let mut slot = first_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(error);
                    }
                    abort.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }));
    }
    drop(batch_tx);

    let template_builder = TemplateBuilder::new(reference, config);
    let mut tile_stats: FxHashMap<u32, TileLoadStats> = FxHashMap::default();
    let mut match_stats = MatchFinderTileStats::default();
    let mut template_stats = TemplateStats::default();

    for batch in batch_rx.iter() {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        *tile_stats.entry(batch.tile_id).or_default() += batch.stats;

        // matching and building are the allocation-heavy burst; the block
        // is released before waiting on the next batch so gated loaders
        // make progress in between
        let memory_block = ScopedMemoryBlock::new(config.memory_control);

        let results: Vec<_> = pool.install(|| {
            batch
                .clusters
                .par_iter()
                .map(|cluster| {
                    let mut cluster_match_stats = MatchFinderTileStats::default();
                    let mut cluster_template_stats = TemplateStats::default();
                    let template = template_builder.build(
                        cluster,
                        tls.get(cluster.barcode as usize),
                        &mut cluster_match_stats,
                        &mut cluster_template_stats,
                    );
                    let records =
                        records_from_template(cluster, &template, config.keep_unaligned);
                    (records, cluster_match_stats, cluster_template_stats)
                })
                .collect()
        });

        let mut batch_records = Vec::new();
        for (records, cluster_match_stats, cluster_template_stats) in results {
            batch_records.extend(records);
            match_stats += cluster_match_stats;
            template_stats += cluster_template_stats;
        }
        let route_result = partitioner.route(batch_records);
        drop(memory_block);
        if let Err(error) = route_result {
            let mut slot = first_error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(error);
            }
            abort.store(true, Ordering::Relaxed);
            break;
        }
    }

    for loader in loaders {
        let _ = loader.join();
    }
    if let Some(error) = first_error.lock().unwrap().take() {
        return Err(error);
    }

    let bins = partitioner.finish()?;
    let mut tile_stats: Vec<(u32, TileLoadStats)> = tile_stats.into_iter().collect();
    tile_stats.sort_by_key(|&(tile, _)| tile);

    log::info!(
        "[align] {} clusters -> {} populated bins ({} proper pairs, {} solo, {} unaligned)",
        template_stats.clusters,
        bins.len(),
        template_stats.proper_pairs,
        template_stats.solo_aligned,
        template_stats.unaligned + template_stats.no_candidates
    );

    Ok(AlignOutcome {
        bins,
        tile_stats,
        match_stats,
        template_stats,
        tls,
        max_read_length,
    })
}
