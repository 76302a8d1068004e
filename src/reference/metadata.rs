//! Pre-processed reference metadata: the versioned manifest enumerating
//! contigs, mask files and annotations.
//!
//! The manifest is a line-oriented text file:
//!
//! ```text
//! SORTED-REFERENCE <formatVersion>
//! CONTIG <index> <name> <path> <byteOffset> <byteSize> <totalBases> <acgtBases> <genomicPosition> <decoy> <as> <ur> <m5>
//! MASK <seedLength> <maskWidth> <mask> <kmers> <path>
//! ANNOTATION <KUniqueness|KRepeatness> <k> <path>
//! ```
//!
//! Optional string fields are `-` when absent. Relative paths are resolved
//! against the manifest's directory.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{AlignError, Result};

pub const OLDEST_SUPPORTED_FORMAT_VERSION: u32 = 3;
pub const CURRENT_FORMAT_VERSION: u32 = 9;

#[derive(Debug, Clone)]
pub struct ContigMetadata {
    pub index: u32,
    pub name: String,
    pub file_path: PathBuf,
    pub byte_offset: u64,
    pub byte_size: u64,
    pub total_bases: u64,
    pub acgt_bases: u64,
    pub genomic_position: u64,
    pub decoy: bool,
    /// Optional SAM @SQ attributes carried through to the output header.
    pub bam_sq_as: Option<String>,
    pub bam_sq_ur: Option<String>,
    pub bam_m5: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MaskMetadata {
    pub seed_length: u32,
    /// Number of high k-mer bits selecting the mask file.
    pub mask_width: u32,
    /// Value of those bits for this file.
    pub mask: u32,
    pub kmers: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKindTag {
    KUniqueness,
    KRepeatness,
}

#[derive(Debug, Clone)]
pub struct AnnotationMetadata {
    pub kind: AnnotationKindTag,
    pub k: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReferenceMetadata {
    pub format_version: u32,
    pub contigs: Vec<ContigMetadata>,
    pub masks: Vec<MaskMetadata>,
    pub annotations: Vec<AnnotationMetadata>,
}

pub fn resolve(base: Option<&Path>, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        match base {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        }
    }
}

fn optional(field: &str) -> Option<String> {
    if field == "-" {
        None
    } else {
        Some(field.to_string())
    }
}

fn bad(path: &Path, line_number: usize, what: &str) -> AlignError {
    AlignError::ReferenceCorrupt(format!(
        "{}:{}: {}",
        path.display(),
        line_number,
        what
    ))
}

impl ReferenceMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            AlignError::Precondition(format!(
                "cannot open reference metadata {}: {}",
                path.display(),
                e
            ))
        })?;
        let reader = BufReader::new(file);

        let mut format_version = None;
        let mut contigs = Vec::new();
        let mut masks = Vec::new();
        let mut annotations = Vec::new();

        for (zero_based, line) in reader.lines().enumerate() {
            let line_number = zero_based + 1;
            let line = line.map_err(|e| AlignError::io(path, e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields[0] {
                "SORTED-REFERENCE" => {
                    let version: u32 = fields
                        .get(1)
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| bad(path, line_number, "bad version"))?;
                    if !(OLDEST_SUPPORTED_FORMAT_VERSION..=CURRENT_FORMAT_VERSION)
                        .contains(&version)
                    {
                        return Err(AlignError::ReferenceCorrupt(format!(
                            "reference format version {} outside supported range [{}, {}]",
                            version, OLDEST_SUPPORTED_FORMAT_VERSION, CURRENT_FORMAT_VERSION
                        )));
                    }
                    format_version = Some(version);
                }
                "CONTIG" => {
                    if fields.len() < 13 {
                        return Err(bad(path, line_number, "short CONTIG line"));
                    }
                    let parse = |i: usize| -> Result<u64> {
                        fields[i]
                            .parse()
                            .map_err(|_| bad(path, line_number, "bad CONTIG number"))
                    };
                    contigs.push(ContigMetadata {
                        index: parse(1)? as u32,
                        name: fields[2].to_string(),
                        file_path: PathBuf::from(fields[3]),
                        byte_offset: parse(4)?,
                        byte_size: parse(5)?,
                        total_bases: parse(6)?,
                        acgt_bases: parse(7)?,
                        genomic_position: parse(8)?,
                        decoy: fields[9] == "1",
                        bam_sq_as: optional(fields[10]),
                        bam_sq_ur: optional(fields[11]),
                        bam_m5: optional(fields[12]),
                    });
                }
                "MASK" => {
                    if fields.len() < 6 {
                        return Err(bad(path, line_number, "short MASK line"));
                    }
                    let parse = |i: usize| -> Result<u64> {
                        fields[i]
                            .parse()
                            .map_err(|_| bad(path, line_number, "bad MASK number"))
                    };
                    masks.push(MaskMetadata {
                        seed_length: parse(1)? as u32,
                        mask_width: parse(2)? as u32,
                        mask: parse(3)? as u32,
                        kmers: parse(4)?,
                        path: PathBuf::from(fields[5]),
                    });
                }
                "ANNOTATION" => {
                    if fields.len() < 4 {
                        return Err(bad(path, line_number, "short ANNOTATION line"));
                    }
                    let kind = match fields[1] {
                        "KUniqueness" => AnnotationKindTag::KUniqueness,
                        "KRepeatness" => AnnotationKindTag::KRepeatness,
                        other => {
                            return Err(bad(
                                path,
                                line_number,
                                &format!("unknown annotation type {}", other),
                            ))
                        }
                    };
                    annotations.push(AnnotationMetadata {
                        kind,
                        k: fields[2]
                            .parse()
                            .map_err(|_| bad(path, line_number, "bad annotation k"))?,
                        path: PathBuf::from(fields[3]),
                    });
                }
                other => {
                    return Err(bad(
                        path,
                        line_number,
                        &format!("unknown record type {}", other),
                    ))
                }
            }
        }

        let format_version = format_version.ok_or_else(|| {
            AlignError::ReferenceCorrupt(format!(
                "{}: missing SORTED-REFERENCE header",
                path.display()
            ))
        })?;
        if contigs.is_empty() {
            return Err(AlignError::ReferenceCorrupt(format!(
                "{}: no contigs",
                path.display()
            )));
        }

        Ok(ReferenceMetadata {
            format_version,
            contigs,
            masks,
            annotations,
        })
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| AlignError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "SORTED-REFERENCE {}", self.format_version)?;
        for contig in &self.contigs {
            writeln!(
                writer,
                "CONTIG {} {} {} {} {} {} {} {} {} {} {} {}",
                contig.index,
                contig.name,
                contig.file_path.display(),
                contig.byte_offset,
                contig.byte_size,
                contig.total_bases,
                contig.acgt_bases,
                contig.genomic_position,
                if contig.decoy { 1 } else { 0 },
                contig.bam_sq_as.as_deref().unwrap_or("-"),
                contig.bam_sq_ur.as_deref().unwrap_or("-"),
                contig.bam_m5.as_deref().unwrap_or("-"),
            )?;
        }
        for mask in &self.masks {
            writeln!(
                writer,
                "MASK {} {} {} {} {}",
                mask.seed_length,
                mask.mask_width,
                mask.mask,
                mask.kmers,
                mask.path.display()
            )?;
        }
        for annotation in &self.annotations {
            let kind = match annotation.kind {
                AnnotationKindTag::KUniqueness => "KUniqueness",
                AnnotationKindTag::KRepeatness => "KRepeatness",
            };
            writeln!(writer, "ANNOTATION {} {} {}", kind, annotation.k, annotation.path.display())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Flags as decoy every contig whose name contains one of the filter
    /// substrings.
    pub fn apply_decoy_filter(&mut self, filter: &[String]) {
        if filter.is_empty() {
            return;
        }
        for contig in &mut self.contigs {
            if !contig.decoy && filter.iter().any(|f| contig.name.contains(f.as_str())) {
                log::info!("[reference] flagging {} as decoy", contig.name);
                contig.decoy = true;
            }
        }
    }

    pub fn masks_for_seed_length(&self, seed_length: u32) -> Vec<&MaskMetadata> {
        self.masks
            .iter()
            .filter(|m| m.seed_length == seed_length)
            .collect()
    }

    pub fn annotation(&self, kind: super::AnnotationKind) -> Option<&AnnotationMetadata> {
        let tag = match kind {
            super::AnnotationKind::KUniqueness => AnnotationKindTag::KUniqueness,
            super::AnnotationKind::KRepeatness => AnnotationKindTag::KRepeatness,
        };
        self.annotations.iter().find(|a| a.kind == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> ReferenceMetadata {
        ReferenceMetadata {
            format_version: CURRENT_FORMAT_VERSION,
            contigs: vec![ContigMetadata {
                index: 0,
                name: "chr1".into(),
                file_path: "genome.seq".into(),
                byte_offset: 0,
                byte_size: 1000,
                total_bases: 1000,
                acgt_bases: 1000,
                genomic_position: 0,
                decoy: false,
                bam_sq_as: Some("test".into()),
                bam_sq_ur: None,
                bam_m5: None,
            }],
            masks: vec![MaskMetadata {
                seed_length: 16,
                mask_width: 0,
                mask: 0,
                kmers: 985,
                path: "mask-16-0.dat".into(),
            }],
            annotations: vec![],
        }
    }

    #[test]
    fn store_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sorted-reference.txt");
        sample().store(&path).unwrap();
        let loaded = ReferenceMetadata::load(&path).unwrap();
        assert_eq!(loaded.format_version, CURRENT_FORMAT_VERSION);
        assert_eq!(loaded.contigs.len(), 1);
        assert_eq!(loaded.contigs[0].name, "chr1");
        assert_eq!(loaded.contigs[0].bam_sq_as.as_deref(), Some("test"));
        assert_eq!(loaded.contigs[0].bam_sq_ur, None);
        assert_eq!(loaded.masks[0].kmers, 985);
    }

    #[test]
    fn unsupported_version_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sorted-reference.txt");
        let mut metadata = sample();
        metadata.format_version = 2;
        metadata.store(&path).unwrap();
        assert!(matches!(
            ReferenceMetadata::load(&path),
            Err(AlignError::ReferenceCorrupt(_))
        ));
    }

    #[test]
    fn decoy_filter_matches_substrings() {
        let mut metadata = sample();
        metadata.contigs[0].name = "chrUn_decoy".into();
        metadata.apply_decoy_filter(&["decoy".into()]);
        assert!(metadata.contigs[0].decoy);
    }
}
