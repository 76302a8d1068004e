//! Known-indel input: the position-sorted variant file consumed by the
//! gap realigner. Only CHROM/POS/REF/ALT are read; records that are not
//! length-changing are ignored.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rustc_hash::FxHashMap;

use crate::build::Gap;
use crate::error::{AlignError, Result};
use crate::reference::ContigList;

/// Indels per contig, position-sorted.
pub struct KnownIndels {
    per_contig: Vec<Vec<Gap>>,
}

impl KnownIndels {
    pub fn empty(contig_count: usize) -> Self {
        KnownIndels {
            per_contig: vec![Vec::new(); contig_count],
        }
    }

    pub fn load(path: &Path, contigs: &ContigList) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            AlignError::Precondition(format!(
                "cannot open known indels {}: {}",
                path.display(),
                e
            ))
        })?;
        let reader = BufReader::new(file);

        let name_to_index: FxHashMap<&str, u32> = contigs
            .iter()
            .map(|c| (c.name.as_str(), c.index))
            .collect();

        let mut per_contig: Vec<Vec<Gap>> = vec![Vec::new(); contigs.len()];
        let mut skipped_contigs = 0u64;
        for (zero_based, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| AlignError::io(path, e))?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let (Some(chrom), Some(pos), _id, Some(reference), Some(alternate)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(AlignError::InputData(format!(
                    "{}:{}: short VCF record",
                    path.display(),
                    zero_based + 1
                )));
            };
            let Some(&contig) = name_to_index.get(chrom) else {
                skipped_contigs += 1;
                continue;
            };
            let position: u64 = pos.parse().map_err(|_| {
                AlignError::InputData(format!(
                    "{}:{}: bad POS {}",
                    path.display(),
                    zero_based + 1,
                    pos
                ))
            })?;
            // multi-allelic records list alternates comma-separated
            for alternate in alternate.split(',') {
                let length = alternate.len() as i64 - reference.len() as i64;
                if length == 0 {
                    continue;
                }
                // VCF anchors indels on the base before the event;
                // POS is 1-based, so the gap starts at POS in 0-based space
                per_contig[contig as usize].push(Gap {
                    position: position as u32,
                    length: length as i32,
                });
            }
        }

        for gaps in &mut per_contig {
            if !gaps.windows(2).all(|w| w[0].position <= w[1].position) {
                return Err(AlignError::Precondition(
                    "known indels are not position-sorted".into(),
                ));
            }
            gaps.dedup();
        }
        if skipped_contigs > 0 {
            log::warn!(
                "[build] {} known-indel records on contigs absent from the reference",
                skipped_contigs
            );
        }
        Ok(KnownIndels { per_contig })
    }

    /// Indels on a contig overlapping [start, end).
    pub fn in_range(&self, contig: u32, start: u32, end: u32) -> &[Gap] {
        let gaps = &self.per_contig[contig as usize];
        let low = gaps.partition_point(|g| g.position < start);
        let high = gaps.partition_point(|g| g.position < end);
        &gaps[low..high]
    }
}
