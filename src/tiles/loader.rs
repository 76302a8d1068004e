//! Streams clusters from per-tile files in bounded batches.
//!
//! The instrument byte layout is opaque to the rest of the pipeline: any
//! `ClusterSource` yielding (sequence, quality, passing-filter) per cluster
//! can feed the loader. The bundled source reads the packed tile format
//! (optionally gzip-compressed) plus an optional sibling `.filter` file
//! carrying the passing-filter bits.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};

use crate::config::AlignConfig;
use crate::error::{AlignError, Result};
use crate::tiles::cluster::{trim_low_quality_ends, Cluster, ReadData, MAX_PHRED_QUALITY};

const TILE_MAGIC: &[u8; 4] = b"SATL";
const TILE_FORMAT_VERSION: u32 = 1;

/// Fixed read geometry of a tile.
#[derive(Debug, Clone, Copy)]
pub struct ReadLayout {
    pub read_count: u8,
    pub read_lengths: [u32; 2],
}

impl ReadLayout {
    pub fn max_read_length(&self) -> usize {
        self.read_lengths[..self.read_count as usize]
            .iter()
            .copied()
            .max()
            .unwrap_or(0) as usize
    }
}

/// One raw cluster as delivered by the instrument format.
pub struct RawCluster {
    /// Zero-based position of the cluster within its tile.
    pub index: u64,
    pub x: i32,
    pub y: i32,
    pub pf: bool,
    pub reads: Vec<ReadData>,
    /// Set when the cluster bytes were unreadable and the reads were
    /// replaced with all-N placeholders.
    pub malformed: bool,
}

/// An opaque stream of clusters.
pub trait ClusterSource {
    fn tile_id(&self) -> u32;
    fn barcode(&self) -> u32;
    fn layout(&self) -> ReadLayout;
    fn cluster_count(&self) -> u64;
    fn next_cluster(&mut self) -> Result<Option<RawCluster>>;
}

/// Per-tile load statistics, merged into `DemultiplexingStats.xml`.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct TileLoadStats {
    pub clusters_total: u64,
    pub clusters_pf_failed: u64,
    pub clusters_malformed: u64,
    pub bases_trimmed: u64,
}

impl std::ops::AddAssign for TileLoadStats {
    fn add_assign(&mut self, rhs: TileLoadStats) {
        self.clusters_total += rhs.clusters_total;
        self.clusters_pf_failed += rhs.clusters_pf_failed;
        self.clusters_malformed += rhs.clusters_malformed;
        self.bases_trimmed += rhs.bases_trimmed;
    }
}

/// A bounded batch of clusters, fully resident until the matcher and the
/// template builder are done with it.
pub struct TileBatch {
    pub tile_id: u32,
    pub layout: ReadLayout,
    pub clusters: Vec<Cluster>,
    pub stats: TileLoadStats,
}

/// Reads the packed tile format.
pub struct TileFileSource {
    tile_id: u32,
    barcode: u32,
    layout: ReadLayout,
    cluster_count: u64,
    next_index: u64,
    reader: Box<dyn Read + Send>,
    filters: Option<Vec<u8>>,
}

fn read_exact_or(
    reader: &mut dyn Read,
    buf: &mut [u8],
    path: &Path,
    what: &str,
) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|_| AlignError::InputData(format!("{}: truncated {}", path.display(), what)))
}

impl TileFileSource {
    pub fn open(path: &Path, config: &AlignConfig) -> Result<TileFileSource> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                return Err(AlignError::Precondition(format!(
                    "cannot open tile {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let mut reader: Box<dyn Read + Send> =
            if path.extension().is_some_and(|e| e == "gz") {
                Box::new(BufReader::new(MultiGzDecoder::new(file)))
            } else {
                Box::new(BufReader::new(file))
            };

        let mut header = [0u8; 33];
        read_exact_or(reader.as_mut(), &mut header, path, "header")?;
        if &header[..4] != TILE_MAGIC {
            return Err(AlignError::InputData(format!(
                "{}: not a tile file",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != TILE_FORMAT_VERSION {
            return Err(AlignError::InputData(format!(
                "{}: unsupported tile format version {}",
                path.display(),
                version
            )));
        }
        let tile_id = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let barcode = u32::from_le_bytes(header[12..16].try_into().unwrap());
        if barcode as usize >= config.barcodes.len() {
            return Err(AlignError::Precondition(format!(
                "{}: barcode index {} but only {} barcodes configured",
                path.display(),
                barcode,
                config.barcodes.len()
            )));
        }
        let cluster_count = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let read_count = header[24];
        if read_count == 0 || read_count > 2 {
            return Err(AlignError::InputData(format!(
                "{}: unsupported read count {}",
                path.display(),
                read_count
            )));
        }
        let read_lengths = [
            u32::from_le_bytes(header[25..29].try_into().unwrap()),
            u32::from_le_bytes(header[29..33].try_into().unwrap()),
        ];

        let filters = Self::load_filters(path, cluster_count, config)?;

        Ok(TileFileSource {
            tile_id,
            barcode,
            layout: ReadLayout {
                read_count,
                read_lengths,
            },
            cluster_count,
            next_index: 0,
            reader,
            filters,
        })
    }

    fn load_filters(
        tile_path: &Path,
        cluster_count: u64,
        config: &AlignConfig,
    ) -> Result<Option<Vec<u8>>> {
        let filter_path = filter_path_for(tile_path);
        match std::fs::read(&filter_path) {
            Ok(bytes) => {
                if bytes.len() as u64 != cluster_count {
                    return Err(AlignError::InputData(format!(
                        "{}: {} filter entries for {} clusters",
                        filter_path.display(),
                        bytes.len(),
                        cluster_count
                    )));
                }
                Ok(Some(bytes))
            }
            Err(_) if config.ignore_missing_filters => {
                log::warn!(
                    "[tiles] filter file {} missing, treating all clusters as PF",
                    filter_path.display()
                );
                Ok(None)
            }
            Err(e) => Err(AlignError::Precondition(format!(
                "cannot open filter file {}: {}",
                filter_path.display(),
                e
            ))),
        }
    }
}

/// `t123.tile(.gz)` -> `t123.filter`
pub fn filter_path_for(tile_path: &Path) -> PathBuf {
    let mut path = tile_path.to_path_buf();
    if path.extension().is_some_and(|e| e == "gz") {
        path.set_extension("");
    }
    path.set_extension("filter");
    path
}

impl ClusterSource for TileFileSource {
    fn tile_id(&self) -> u32 {
        self.tile_id
    }

    fn barcode(&self) -> u32 {
        self.barcode
    }

    fn layout(&self) -> ReadLayout {
        self.layout
    }

    fn cluster_count(&self) -> u64 {
        self.cluster_count
    }

    fn next_cluster(&mut self) -> Result<Option<RawCluster>> {
        if self.next_index >= self.cluster_count {
            return Ok(None);
        }
        let index = self.next_index;
        self.next_index += 1;

        let mut coords = [0u8; 8];
        self.reader.read_exact(&mut coords).map_err(|e| {
            AlignError::InputData(format!("tile {} truncated: {}", self.tile_id, e))
        })?;
        let x = i32::from_le_bytes(coords[0..4].try_into().unwrap());
        let y = i32::from_le_bytes(coords[4..8].try_into().unwrap());

        let pf = match &self.filters {
            Some(filters) => filters[index as usize] != 0,
            None => true,
        };

        let mut reads = Vec::with_capacity(self.layout.read_count as usize);
        let mut malformed = false;
        for r in 0..self.layout.read_count as usize {
            let length = self.layout.read_lengths[r] as usize;
            let mut sequence = vec![0u8; length];
            let mut quality = vec![0u8; length];
            self.reader.read_exact(&mut sequence).map_err(|e| {
                AlignError::InputData(format!("tile {} truncated: {}", self.tile_id, e))
            })?;
            self.reader.read_exact(&mut quality).map_err(|e| {
                AlignError::InputData(format!("tile {} truncated: {}", self.tile_id, e))
            })?;

            // A bad base call or quality poisons the whole cluster: it is
            // replaced with an all-N read and counted, never fatal.
            let bases_valid = sequence
                .iter()
                .all(|b| matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T' | b'N'));
            let quals_valid = quality.iter().all(|&q| q <= MAX_PHRED_QUALITY);
            if bases_valid && quals_valid {
                sequence.make_ascii_uppercase();
                reads.push(ReadData { sequence, quality });
            } else {
                malformed = true;
                reads.push(ReadData::no_call(length));
            }
        }

        Ok(Some(RawCluster {
            index,
            x,
            y,
            pf,
            reads,
            malformed,
        }))
    }
}

/// Applies PF masking and quality trimming while batching clusters off a
/// source.
pub struct TileLoader<'a> {
    config: &'a AlignConfig,
}

impl<'a> TileLoader<'a> {
    pub fn new(config: &'a AlignConfig) -> Self {
        TileLoader { config }
    }

    pub fn open(&self, path: &Path) -> Result<Option<TileFileSource>> {
        match TileFileSource::open(path, self.config) {
            Ok(source) => Ok(Some(source)),
            Err(AlignError::Precondition(reason)) if self.config.ignore_missing_bcls => {
                log::warn!("[tiles] skipping tile: {}", reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Pulls at most `clusters_at_a_time_max` clusters into a batch;
    /// `None` when the source is exhausted.
    pub fn next_batch(&self, source: &mut dyn ClusterSource) -> Result<Option<TileBatch>> {
        let mut clusters = Vec::new();
        let mut stats = TileLoadStats::default();
        let tile_id = source.tile_id();
        let barcode = source.barcode();

        while clusters.len() < self.config.clusters_at_a_time_max {
            let Some(raw) = source.next_cluster()? else {
                break;
            };
            stats.clusters_total += 1;
            if raw.malformed {
                stats.clusters_malformed += 1;
            }
            if self.config.pf_only && !raw.pf {
                stats.clusters_pf_failed += 1;
                continue;
            }
            let mut cluster = Cluster {
                id: ((tile_id as u64) << 32) | raw.index,
                tile: tile_id,
                barcode,
                x: raw.x,
                y: raw.y,
                pf: raw.pf,
                reads: raw.reads,
            };
            stats.bases_trimmed +=
                trim_low_quality_ends(&mut cluster, self.config.base_quality_cutoff) as u64;
            clusters.push(cluster);
        }

        if clusters.is_empty() && stats.clusters_total == 0 {
            return Ok(None);
        }
        Ok(Some(TileBatch {
            tile_id,
            layout: source.layout(),
            clusters,
            stats,
        }))
    }
}

/// Writes a tile file (and optionally its filter file). The inverse of
/// `TileFileSource`; test fixtures and the tile repacker both use it.
pub fn write_tile_file(
    path: &Path,
    tile_id: u32,
    barcode: u32,
    clusters: &[(i32, i32, Vec<ReadData>)],
) -> Result<()> {
    let read_count = clusters.first().map(|c| c.2.len()).unwrap_or(1) as u8;
    let mut read_lengths = [0u32; 2];
    if let Some(first) = clusters.first() {
        for (i, read) in first.2.iter().enumerate() {
            read_lengths[i] = read.len() as u32;
        }
    }

    let file = File::create(path).map_err(|e| AlignError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(TILE_MAGIC)?;
    writer.write_all(&TILE_FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&tile_id.to_le_bytes())?;
    writer.write_all(&barcode.to_le_bytes())?;
    writer.write_all(&(clusters.len() as u64).to_le_bytes())?;
    writer.write_all(&[read_count])?;
    writer.write_all(&read_lengths[0].to_le_bytes())?;
    writer.write_all(&read_lengths[1].to_le_bytes())?;
    for (x, y, reads) in clusters {
        writer.write_all(&x.to_le_bytes())?;
        writer.write_all(&y.to_le_bytes())?;
        for read in reads {
            writer.write_all(&read.sequence)?;
            writer.write_all(&read.quality)?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_filter_file(tile_path: &Path, pf: &[bool]) -> Result<()> {
    let path = filter_path_for(tile_path);
    let bytes: Vec<u8> = pf.iter().map(|&p| p as u8).collect();
    std::fs::write(&path, bytes).map_err(|e| AlignError::io(&path, e))?;
    Ok(())
}
