//! In-memory contig sequences and coordinate translation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{AlignError, Result};
use crate::reference::metadata::{resolve, ContigMetadata, ReferenceMetadata};
use crate::reference::position::ReferencePosition;

/// One loaded contig. Sequence bytes are upper-case ASCII, memory-resident
/// for the whole alignment phase.
pub struct Contig {
    pub index: u32,
    pub name: String,
    pub decoy: bool,
    /// Number of reference bases preceding this contig.
    pub genomic_position: u64,
    pub sequence: Vec<u8>,
}

impl Contig {
    #[inline]
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

/// Contigs indexed 0..N-1 with no gaps; genomic offsets monotone.
pub struct ContigList {
    contigs: Vec<Contig>,
    genome_length: u64,
    mapped_genome_length: u64,
}

impl ContigList {
    pub fn new(contigs: Vec<Contig>) -> Result<Self> {
        for (expected, contig) in contigs.iter().enumerate() {
            if contig.index as usize != expected {
                return Err(AlignError::ReferenceCorrupt(format!(
                    "contig {} has index {}, expected {}",
                    contig.name, contig.index, expected
                )));
            }
        }
        let mut running = 0u64;
        for contig in &contigs {
            if contig.genomic_position != running {
                return Err(AlignError::ReferenceCorrupt(format!(
                    "contig {} genomic offset {} does not follow previous contigs ({})",
                    contig.name, contig.genomic_position, running
                )));
            }
            running += contig.len() as u64;
        }
        let mapped = contigs
            .iter()
            .filter(|c| !c.decoy)
            .map(|c| c.len() as u64)
            .sum();
        Ok(ContigList {
            contigs,
            genome_length: running,
            mapped_genome_length: mapped,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.contigs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contigs.is_empty()
    }

    #[inline]
    pub fn get(&self, index: u32) -> &Contig {
        &self.contigs[index as usize]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Contig> {
        self.contigs.iter()
    }

    /// Total bases over all contigs, decoys included.
    #[inline]
    pub fn genome_length(&self) -> u64 {
        self.genome_length
    }

    /// Total bases over non-decoy contigs. This is the genome size used for
    /// the rest-of-genome correction, so decoys do not dilute mapping
    /// qualities.
    #[inline]
    pub fn mapped_genome_length(&self) -> u64 {
        self.mapped_genome_length
    }

    /// Translate a 0-based offset from the first base of the first contig
    /// into a reference position. Binary search over the cumulative offsets.
    pub fn genomic_offset_to_position(&self, genomic_offset: u64) -> ReferencePosition {
        let partition = self
            .contigs
            .partition_point(|c| c.genomic_position <= genomic_offset);
        if partition == 0 {
            return ReferencePosition::NONE;
        }
        let contig = &self.contigs[partition - 1];
        let within = genomic_offset - contig.genomic_position;
        if within < contig.len() as u64 {
            ReferencePosition::new(contig.index, within as u32)
        } else {
            ReferencePosition::NONE
        }
    }

    /// Inverse of `genomic_offset_to_position`.
    pub fn position_to_genomic_offset(&self, position: ReferencePosition) -> u64 {
        let contig = self.get(position.contig());
        contig.genomic_position + position.offset() as u64
    }
}

/// Reads every contig sequence named by the metadata. The sequence file is
/// raw bases; each contig is a (byte offset, byte size) extent within it.
pub fn load_contigs(metadata: &ReferenceMetadata, base: Option<&Path>) -> Result<ContigList> {
    let mut contigs = Vec::with_capacity(metadata.contigs.len());
    for meta in &metadata.contigs {
        contigs.push(load_contig(meta, base)?);
    }
    ContigList::new(contigs)
}

fn load_contig(meta: &ContigMetadata, base: Option<&Path>) -> Result<Contig> {
    let path = resolve(base, &meta.file_path);
    let mut file = File::open(&path).map_err(|e| AlignError::io(&path, e))?;
    file.seek(SeekFrom::Start(meta.byte_offset))
        .map_err(|e| AlignError::io(&path, e))?;
    let mut sequence = vec![0u8; meta.byte_size as usize];
    file.read_exact(&mut sequence)
        .map_err(|_| AlignError::ReferenceCorrupt(format!(
            "contig {} extent {}+{} does not fit in {}",
            meta.name,
            meta.byte_offset,
            meta.byte_size,
            path.display()
        )))?;
    sequence.make_ascii_uppercase();
    if sequence.len() as u64 != meta.total_bases {
        return Err(AlignError::ReferenceCorrupt(format!(
            "contig {}: {} bases read, metadata declares {}",
            meta.name,
            sequence.len(),
            meta.total_bases
        )));
    }
    Ok(Contig {
        index: meta.index,
        name: meta.name.clone(),
        decoy: meta.decoy,
        genomic_position: meta.genomic_position,
        sequence,
    })
}
