//! The alignment workflow: an explicit, resumable state machine.
//!
//! States run Start -> Aligned -> Reported -> Written -> Done. Each
//! completed transition persists its marker (and the artifacts the later
//! states need) under the temp directory, so a restarted process resumes
//! from the last completed state, and `rewind` can deliberately step back.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::alignment::tls::TemplateLengthStatistics;
use crate::bins::metadata::BinMetadata;
use crate::build::merger::process_bin;
use crate::config::AlignConfig;
use crate::error::{AlignError, Result};
use crate::io::alignment_writer::AlignmentWriter;
use crate::io::vcf::KnownIndels;
use crate::pipeline::{align_phase, AlignOutcome};
use crate::reference::Reference;
use crate::stats::{
    self, BuildStats, MatchFinderTileStats, TemplateStats,
};
use crate::tiles::loader::TileLoadStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkflowState {
    Start,
    Aligned,
    Reported,
    Written,
    Done,
}

impl WorkflowState {
    pub fn name(self) -> &'static str {
        match self {
            WorkflowState::Start => "Start",
            WorkflowState::Aligned => "Aligned",
            WorkflowState::Reported => "Reported",
            WorkflowState::Written => "Written",
            WorkflowState::Done => "Done",
        }
    }

    fn parse(name: &str) -> Option<WorkflowState> {
        match name {
            "Start" => Some(WorkflowState::Start),
            "Aligned" => Some(WorkflowState::Aligned),
            "Reported" => Some(WorkflowState::Reported),
            "Written" => Some(WorkflowState::Written),
            "Done" => Some(WorkflowState::Done),
            _ => None,
        }
    }

    fn next(self) -> WorkflowState {
        match self {
            WorkflowState::Start => WorkflowState::Aligned,
            WorkflowState::Aligned => WorkflowState::Reported,
            WorkflowState::Reported => WorkflowState::Written,
            WorkflowState::Written | WorkflowState::Done => WorkflowState::Done,
        }
    }

    /// The stage a transition out of this state runs.
    pub fn stage(self) -> &'static str {
        match self {
            WorkflowState::Start => "align",
            WorkflowState::Aligned => "report",
            WorkflowState::Reported => "build",
            WorkflowState::Written => "finish",
            WorkflowState::Done => "done",
        }
    }
}

/// Everything the post-alignment states need, persisted at Aligned.
#[derive(Serialize, Deserialize)]
struct AlignArtifacts {
    bins: Vec<BinMetadata>,
    tile_stats: Vec<(u32, TileLoadStats)>,
    match_stats: MatchFinderTileStats,
    template_stats: TemplateStats,
    tls: Vec<TemplateLengthStatistics>,
    max_read_length: usize,
}

impl From<AlignOutcome> for AlignArtifacts {
    fn from(outcome: AlignOutcome) -> Self {
        AlignArtifacts {
            bins: outcome.bins,
            tile_stats: outcome.tile_stats,
            match_stats: outcome.match_stats,
            template_stats: outcome.template_stats,
            tls: outcome.tls,
            max_read_length: outcome.max_read_length,
        }
    }
}

pub struct AlignWorkflow {
    config: AlignConfig,
    reference: Reference,
    state: WorkflowState,
    artifacts: Option<AlignArtifacts>,
    transitions: Vec<String>,
}

impl AlignWorkflow {
    pub fn new(config: AlignConfig) -> Result<AlignWorkflow> {
        config.validate()?;
        std::fs::create_dir_all(&config.temp_directory)
            .map_err(|e| AlignError::io(&config.temp_directory, e))?;
        let stats_dir = config.output_directory.join("Stats");
        std::fs::create_dir_all(&stats_dir).map_err(|e| AlignError::io(&stats_dir, e))?;
        let projects_dir = config.output_directory.join("Projects");
        std::fs::create_dir_all(&projects_dir)
            .map_err(|e| AlignError::io(&projects_dir, e))?;

        let reference = Reference::load(&config.reference_metadata, &config)?;

        let mut workflow = AlignWorkflow {
            config,
            reference,
            state: WorkflowState::Start,
            artifacts: None,
            transitions: Vec::new(),
        };
        workflow.restore_persisted_state()?;
        Ok(workflow)
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// The state transitions performed so far, newest last. Reported with
    /// the terminal diagnostic on failure.
    pub fn transitions(&self) -> &[String] {
        &self.transitions
    }

    fn marker_path(&self) -> PathBuf {
        self.config.temp_directory.join("workflow.state")
    }

    fn artifacts_path(&self) -> PathBuf {
        self.config.temp_directory.join("align-state.dat")
    }

    fn restore_persisted_state(&mut self) -> Result<()> {
        let Ok(marker) = std::fs::read_to_string(self.marker_path()) else {
            return Ok(());
        };
        let Some(persisted) = WorkflowState::parse(marker.trim()) else {
            log::warn!("[workflow] unreadable state marker, starting over");
            return Ok(());
        };
        if persisted >= WorkflowState::Aligned {
            match self.load_artifacts() {
                Ok(artifacts) => {
                    self.artifacts = Some(artifacts);
                    self.state = persisted;
                    log::info!("[workflow] resuming from state {}", persisted.name());
                }
                Err(e) => {
                    log::warn!(
                        "[workflow] state marker says {} but artifacts are unusable ({}); starting over",
                        persisted.name(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    fn persist_state(&self) -> Result<()> {
        std::fs::write(self.marker_path(), format!("{}\n", self.state.name()))
            .map_err(|e| AlignError::io(self.marker_path(), e))?;
        Ok(())
    }

    fn store_artifacts(&self, artifacts: &AlignArtifacts) -> Result<()> {
        let path = self.artifacts_path();
        let file = File::create(&path).map_err(|e| AlignError::io(&path, e))?;
        bincode::serialize_into(BufWriter::new(file), artifacts)?;
        Ok(())
    }

    fn load_artifacts(&self) -> Result<AlignArtifacts> {
        let path = self.artifacts_path();
        let file = File::open(&path).map_err(|e| AlignError::io(&path, e))?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }

    /// Performs one state transition. Idempotent per state: re-running a
    /// completed workflow is a no-op.
    pub fn step(&mut self) -> Result<WorkflowState> {
        let stage = self.state.stage();
        let result = match self.state {
            WorkflowState::Start => self.run_align(),
            WorkflowState::Aligned => self.run_report(),
            WorkflowState::Reported => self.run_build(),
            WorkflowState::Written => self.run_finish(),
            WorkflowState::Done => {
                log::info!("[workflow] already at Done");
                return Ok(self.state);
            }
        };
        match result {
            Ok(()) => {
                let from = self.state;
                self.state = self.state.next();
                self.persist_state()?;
                self.transitions
                    .push(format!("{} -> {}", from.name(), self.state.name()));
                log::info!("[workflow] {} -> {}", from.name(), self.state.name());
                Ok(self.state)
            }
            Err(e) => Err(e.at_stage(stage)),
        }
    }

    /// Runs to completion from the current state.
    pub fn run(&mut self) -> Result<()> {
        while self.state != WorkflowState::Done {
            self.step()?;
        }
        Ok(())
    }

    /// Rewinds to an earlier state so its successor re-runs. Rewinding
    /// forward is a precondition failure.
    pub fn rewind(&mut self, to: WorkflowState) -> Result<WorkflowState> {
        if to > self.state {
            return Err(AlignError::Precondition(format!(
                "cannot rewind forward from {} to {}",
                self.state.name(),
                to.name()
            )));
        }
        if to >= WorkflowState::Aligned && self.artifacts.is_none() {
            return Err(AlignError::Precondition(format!(
                "cannot rewind to {}: alignment artifacts are gone",
                to.name()
            )));
        }
        let from = self.state;
        self.state = to;
        self.persist_state()?;
        self.transitions
            .push(format!("{} ~> {}", from.name(), to.name()));
        log::info!("[workflow] rewound {} -> {}", from.name(), to.name());
        Ok(from)
    }

    fn run_align(&mut self) -> Result<()> {
        let outcome = align_phase(&self.config, &self.reference)?;
        let artifacts = AlignArtifacts::from(outcome);
        self.store_artifacts(&artifacts)?;
        self.artifacts = Some(artifacts);
        Ok(())
    }

    fn run_report(&mut self) -> Result<()> {
        let artifacts = self
            .artifacts
            .as_ref()
            .ok_or_else(|| AlignError::Assertion("report without align artifacts".into()))?;
        let stats_dir = self.config.output_directory.join("Stats");
        stats::write_demultiplexing_stats(
            &stats_dir.join("DemultiplexingStats.xml"),
            &artifacts.tile_stats,
        )?;
        stats::write_alignment_stats(
            &stats_dir.join("AlignmentStats.xml"),
            &artifacts.match_stats,
            &artifacts.template_stats,
        )?;
        Ok(())
    }

    fn run_build(&mut self) -> Result<()> {
        let artifacts = self
            .artifacts
            .as_ref()
            .ok_or_else(|| AlignError::Assertion("build without align artifacts".into()))?;

        let known_indels = match &self.config.known_indels {
            Some(path) => KnownIndels::load(path, &self.reference.contigs)?,
            None => KnownIndels::empty(self.reference.contigs.len()),
        };

        // one output per distinct sample
        let mut samples: Vec<&str> = self
            .config
            .barcodes
            .iter()
            .map(|b| b.sample.as_str())
            .collect();
        samples.sort_unstable();
        samples.dedup();

        let mut writers = Vec::new();
        for sample in &samples {
            let dir = self.config.output_directory.join("Projects").join(sample);
            std::fs::create_dir_all(&dir).map_err(|e| AlignError::io(&dir, e))?;
            let path = dir.join("sorted.sam.gz");
            writers.push(AlignmentWriter::create(
                &path,
                &self.config,
                &self.reference.metadata,
            )?);
        }
        let sample_of_barcode: Vec<usize> = self
            .config
            .barcodes
            .iter()
            .map(|b| samples.iter().position(|s| *s == b.sample).unwrap())
            .collect();

        // bin loading/realignment and output compression share one pool;
        // the loader and saver budgets add up
        let build_threads = (self.config.temp_loaders_max + self.config.output_savers_max).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(build_threads)
            .build()
            .map_err(|e| AlignError::Resource {
                stage: "build-pool",
                reason: e.to_string(),
            })?;

        let mut build_stats = BuildStats::default();
        // bins are processed in parallel chunks but written strictly in
        // grid order, which keeps the concatenation globally sorted
        let chunk = build_threads;
        for bins in artifacts.bins.chunks(chunk) {
            let processed: Vec<_> = pool.install(|| {
                use rayon::prelude::*;
                bins.par_iter()
                    .map(|bin| process_bin(bin, &self.reference.contigs, &known_indels, &self.config))
                    .collect()
            });
            for (bin, processed) in bins.iter().zip(processed) {
                let processed = processed?;
                build_stats += processed.stats;
                // records fan out to their sample's writer
                if writers.len() == 1 {
                    writers[0].write_bin(bin, &processed.records)?;
                } else {
                    for (sample_index, writer) in writers.iter_mut().enumerate() {
                        let records: Vec<_> = processed
                            .records
                            .iter()
                            .filter(|r| sample_of_barcode[r.barcode as usize] == sample_index)
                            .cloned()
                            .collect();
                        writer.write_bin(bin, &records)?;
                    }
                }
            }
        }

        for writer in writers {
            let summary = writer.finish()?;
            log::info!(
                "[build] wrote {} records to {}{}",
                summary.records,
                summary.path.display(),
                summary
                    .md5
                    .as_deref()
                    .map(|m| format!(" (md5 {})", m))
                    .unwrap_or_default()
            );
        }

        stats::write_build_stats(
            &self
                .config
                .output_directory
                .join("Stats")
                .join("BuildStats.xml"),
            &build_stats,
        )?;
        Ok(())
    }

    fn run_finish(&mut self) -> Result<()> {
        if self.config.cleanup_intermediary {
            if let Some(artifacts) = &self.artifacts {
                let mut removed = 0usize;
                for bin in &artifacts.bins {
                    removed += std::fs::remove_file(&bin.path).is_ok() as usize;
                }
                log::info!("[workflow] removed {} intermediary bin files", removed);
            }
        }
        Ok(())
    }
}

impl AlignError {
    /// Attaches the failing stage for the terminal diagnostic.
    pub fn at_stage(self, stage: &'static str) -> AlignError {
        match self {
            AlignError::Resource { reason, .. } => AlignError::Resource { stage, reason },
            other => other,
        }
    }
}
