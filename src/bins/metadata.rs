//! Bin layout: half-open reference ranges and the bin files covering them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bins::record::BinRecord;
use crate::reference::ContigList;

/// One bin on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinMetadata {
    pub index: usize,
    pub path: PathBuf,
    /// -1 for the unmapped bin.
    pub contig: i32,
    pub start: u32,
    /// Exclusive.
    pub end: u32,
    pub fragments: u64,
    pub bytes: u64,
}

impl BinMetadata {
    pub fn is_unmapped(&self) -> bool {
        self.contig < 0
    }

    pub fn contains(&self, contig: i32, position: u32) -> bool {
        self.contig == contig && (self.start..self.end).contains(&position)
    }
}

/// The bin boundaries, computed up front from the target bin length.
/// Every aligned fragment maps to the bin containing its leftmost aligned
/// base; unaligned fragments map to the dedicated unmapped bin, which sits
/// first unless `put_unaligned_in_the_back`.
pub struct BinGrid {
    bins: Vec<BinMetadata>,
    /// First bin index of each contig.
    contig_base: Vec<usize>,
    bin_length: u64,
    unmapped_index: usize,
}

impl BinGrid {
    pub fn new(
        contigs: &ContigList,
        bin_length: u64,
        temp_directory: &Path,
        put_unaligned_in_the_back: bool,
    ) -> BinGrid {
        let bin_length = bin_length.max(1);
        let mut bins = Vec::new();
        let mut contig_base = Vec::with_capacity(contigs.len());

        let unmapped_bin = |index: usize| BinMetadata {
            index,
            path: temp_directory.join("bin-unmapped.dat"),
            contig: -1,
            start: 0,
            end: u32::MAX,
            fragments: 0,
            bytes: 0,
        };

        if !put_unaligned_in_the_back {
            bins.push(unmapped_bin(0));
        }
        for contig in contigs.iter() {
            contig_base.push(bins.len());
            let mut start = 0u64;
            let length = contig.len() as u64;
            while start < length {
                let end = (start + bin_length).min(length);
                bins.push(BinMetadata {
                    index: bins.len(),
                    path: temp_directory
                        .join(format!("bin-{:04}-{:010}-{:010}.dat", contig.index, start, end)),
                    contig: contig.index as i32,
                    start: start as u32,
                    end: end as u32,
                    fragments: 0,
                    bytes: 0,
                });
                start = end;
            }
        }
        if put_unaligned_in_the_back {
            bins.push(unmapped_bin(bins.len()));
        }
        let unmapped_index = if put_unaligned_in_the_back {
            bins.len() - 1
        } else {
            0
        };

        BinGrid {
            bins,
            contig_base,
            bin_length,
            unmapped_index,
        }
    }

    pub fn bins(&self) -> &[BinMetadata] {
        &self.bins
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn unmapped_index(&self) -> usize {
        self.unmapped_index
    }

    /// The bin a record belongs to.
    pub fn bin_for(&self, record: &BinRecord) -> usize {
        if record.is_unmapped() {
            return self.unmapped_index;
        }
        let base = self.contig_base[record.contig as usize];
        base + (record.position as u64 / self.bin_length) as usize
    }

    /// Bins in output order: the concatenation of processed bins yields
    /// the global (contig, position) sort, with the unmapped bin where the
    /// configuration put it.
    pub fn output_order(&self) -> impl Iterator<Item = &BinMetadata> {
        self.bins.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bins::record::flags;
    use crate::reference::contig::Contig;

    fn contigs() -> ContigList {
        ContigList::new(vec![
            Contig {
                index: 0,
                name: "chr1".into(),
                decoy: false,
                genomic_position: 0,
                sequence: vec![b'A'; 2500],
            },
            Contig {
                index: 1,
                name: "chr2".into(),
                decoy: false,
                genomic_position: 2500,
                sequence: vec![b'A'; 800],
            },
        ])
        .unwrap()
    }

    fn record_at(contig: i32, position: u32) -> BinRecord {
        BinRecord {
            cluster_id: 0,
            barcode: 0,
            read_index: 0,
            flags: if contig < 0 { flags::UNMAPPED } else { 0 },
            contig,
            position,
            mapq: 0,
            cigar: Vec::new(),
            sequence: Vec::new(),
            quality: Vec::new(),
            mate_contig: -1,
            mate_position: 0,
            template_length: 0,
            alignment_score: 0,
            template_score: 0,
            mismatches: 0,
            log_probability: 0.0,
            original_cigar: None,
            x: 0,
            y: 0,
        }
    }

    #[test]
    fn every_position_maps_to_the_containing_bin() {
        let grid = BinGrid::new(&contigs(), 1000, Path::new("/tmp"), false);
        // bin 0 unmapped, chr1 -> 3 bins, chr2 -> 1 bin
        assert_eq!(grid.bin_count(), 5);
        for &(contig, position) in &[(0i32, 0u32), (0, 999), (0, 1000), (0, 2499), (1, 799)] {
            let record = record_at(contig, position);
            let bin = &grid.bins()[grid.bin_for(&record)];
            assert!(
                bin.contains(contig, position),
                "position {}:{} landed in bin {:?}",
                contig,
                position,
                bin
            );
        }
        assert_eq!(grid.bin_for(&record_at(-1, 0)), 0);
    }

    #[test]
    fn unmapped_bin_moves_to_the_back_when_configured() {
        let grid = BinGrid::new(&contigs(), 1000, Path::new("/tmp"), true);
        assert_eq!(grid.unmapped_index(), grid.bin_count() - 1);
        let order: Vec<i32> = grid.output_order().map(|b| b.contig).collect();
        assert_eq!(order.last(), Some(&-1));
    }
}
