//! Routes records into bin files through a pool of saver threads.
//!
//! Each bin has exactly one writer: bins are sharded over the savers by
//! index, so no file is ever written from two threads. Batches preserve
//! submission order per bin, which keeps the pipeline deterministic.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use rustc_hash::FxHashMap;

use crate::bins::metadata::{BinGrid, BinMetadata};
use crate::bins::record::BinRecord;
use crate::error::{AlignError, Result};

const SAVER_QUEUE_DEPTH: usize = 64;

type BatchMessage = (usize, Vec<BinRecord>);

pub struct BinPartitioner {
    grid: Arc<BinGrid>,
    senders: Vec<Sender<BatchMessage>>,
    savers: Vec<JoinHandle<Result<FxHashMap<usize, (u64, u64)>>>>,
    pre_sort: bool,
}

impl BinPartitioner {
    pub fn new(grid: Arc<BinGrid>, temp_savers_max: usize, pre_sort: bool) -> BinPartitioner {
        let saver_count = temp_savers_max.max(1);
        let mut senders = Vec::with_capacity(saver_count);
        let mut savers = Vec::with_capacity(saver_count);
        for _ in 0..saver_count {
            let (tx, rx) = bounded::<BatchMessage>(SAVER_QUEUE_DEPTH);
            let grid = Arc::clone(&grid);
            savers.push(std::thread::spawn(move || -> Result<FxHashMap<usize, (u64, u64)>> {
                let mut writers: FxHashMap<usize, BufWriter<File>> = FxHashMap::default();
                let mut written: FxHashMap<usize, (u64, u64)> = FxHashMap::default();
                while let Ok((bin_index, records)) = rx.recv() {
                    let bin = &grid.bins()[bin_index];
                    let writer = match writers.entry(bin_index) {
                        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                        std::collections::hash_map::Entry::Vacant(e) => {
                            let file = File::create(&bin.path)
                                .map_err(|e| AlignError::io(&bin.path, e))?;
                            e.insert(BufWriter::new(file))
                        }
                    };
                    let entry = written.entry(bin_index).or_insert((0, 0));
                    for record in &records {
                        let bytes = bincode::serialize(record)?;
                        writer.write_all(&bytes).map_err(|e| AlignError::Resource {
                            stage: "bin-write",
                            reason: e.to_string(),
                        })?;
                        entry.0 += 1;
                        entry.1 += bytes.len() as u64;
                    }
                }
                for (_, mut writer) in writers {
                    writer.flush().map_err(|e| AlignError::Resource {
                        stage: "bin-write",
                        reason: e.to_string(),
                    })?;
                }
                Ok(written)
            }));
            senders.push(tx);
        }
        BinPartitioner {
            grid,
            senders,
            savers,
            pre_sort,
        }
    }

    /// Routes one batch of records. Records of a bin are grouped and
    /// dispatched to the saver owning that bin.
    pub fn route(&self, records: Vec<BinRecord>) -> Result<()> {
        let mut grouped: FxHashMap<usize, Vec<BinRecord>> = FxHashMap::default();
        for record in records {
            grouped
                .entry(self.grid.bin_for(&record))
                .or_default()
                .push(record);
        }
        let mut bins: Vec<usize> = grouped.keys().copied().collect();
        bins.sort_unstable();
        for bin_index in bins {
            let mut batch = grouped.remove(&bin_index).unwrap();
            if self.pre_sort {
                // amortises the final in-bin sort
                batch.sort_by_key(|r| r.sort_key());
            }
            let saver = bin_index % self.senders.len();
            self.senders[saver]
                .send((bin_index, batch))
                .map_err(|_| AlignError::Assertion("bin saver exited early".into()))?;
        }
        Ok(())
    }

    /// Closes the savers and returns the populated bin metadata in output
    /// order. Bins that never saw a record are omitted.
    pub fn finish(self) -> Result<Vec<BinMetadata>> {
        drop(self.senders);
        let mut totals: FxHashMap<usize, (u64, u64)> = FxHashMap::default();
        for saver in self.savers {
            let written = saver
                .join()
                .map_err(|_| AlignError::Assertion("bin saver panicked".into()))??;
            for (bin, (fragments, bytes)) in written {
                let entry = totals.entry(bin).or_insert((0, 0));
                entry.0 += fragments;
                entry.1 += bytes;
            }
        }
        let mut bins: Vec<BinMetadata> = Vec::new();
        for bin in self.grid.bins() {
            if let Some(&(fragments, bytes)) = totals.get(&bin.index) {
                let mut bin = bin.clone();
                bin.fragments = fragments;
                bin.bytes = bytes;
                bins.push(bin);
            }
        }
        Ok(bins)
    }
}

/// Reads every record of a bin file back. The file ends at EOF; the count
/// in the metadata is advisory.
pub fn read_bin_records(bin: &BinMetadata) -> Result<Vec<BinRecord>> {
    let file = File::open(&bin.path).map_err(|e| AlignError::io(&bin.path, e))?;
    let mut reader = std::io::BufReader::new(file);
    let mut records = Vec::with_capacity(bin.fragments as usize);
    loop {
        match bincode::deserialize_from::<_, BinRecord>(&mut reader) {
            Ok(record) => records.push(record),
            Err(e) => {
                if let bincode::ErrorKind::Io(io_error) = e.as_ref() {
                    if io_error.kind() == std::io::ErrorKind::UnexpectedEof {
                        break;
                    }
                }
                return Err(AlignError::Serialization(e));
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bins::record::flags;
    use crate::reference::contig::Contig;
    use crate::reference::ContigList;
    use tempfile::TempDir;

    fn record_at(contig: i32, position: u32, cluster_id: u64) -> BinRecord {
        BinRecord {
            cluster_id,
            barcode: 0,
            read_index: 0,
            flags: if contig < 0 { flags::UNMAPPED } else { 0 },
            contig,
            position,
            mapq: 60,
            cigar: Vec::new(),
            sequence: b"ACGT".to_vec(),
            quality: vec![30; 4],
            mate_contig: -1,
            mate_position: 0,
            template_length: 0,
            alignment_score: 99,
            template_score: 99,
            mismatches: 0,
            log_probability: -0.1,
            original_cigar: None,
            x: 0,
            y: 0,
        }
    }

    #[test]
    fn partition_and_read_back() {
        let dir = TempDir::new().unwrap();
        let contigs = ContigList::new(vec![Contig {
            index: 0,
            name: "chr1".into(),
            decoy: false,
            genomic_position: 0,
            sequence: vec![b'A'; 3000],
        }])
        .unwrap();
        let grid = Arc::new(BinGrid::new(&contigs, 1000, dir.path(), false));
        let partitioner = BinPartitioner::new(Arc::clone(&grid), 2, true);
        partitioner
            .route(vec![
                record_at(0, 2500, 1),
                record_at(0, 10, 2),
                record_at(0, 1500, 3),
                record_at(-1, 0, 4),
            ])
            .unwrap();
        let bins = partitioner.finish().unwrap();
        // unmapped + three aligned bins received one record each
        assert_eq!(bins.len(), 4);
        let total: u64 = bins.iter().map(|b| b.fragments).sum();
        assert_eq!(total, 4);
        for bin in &bins {
            let records = read_bin_records(bin).unwrap();
            assert_eq!(records.len(), bin.fragments as usize);
            for record in records {
                if !bin.is_unmapped() {
                    assert!(bin.contains(record.contig, record.position));
                }
            }
        }
    }
}
