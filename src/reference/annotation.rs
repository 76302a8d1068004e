//! Per-position uniqueness annotations.
//!
//! An annotation file carries one byte per genomic offset: the minimum
//! extension length at which the k-mer starting there becomes genome-unique
//! (KUniqueness) or loses all neighbors (KRepeatness). 255 means "never".

use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{AlignError, Result};

const ANNOTATION_MAGIC: &[u8; 4] = b"SANN";
const ANNOTATION_FORMAT_VERSION: u32 = 1;

pub const ANNOTATION_NEVER: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    KUniqueness,
    KRepeatness,
}

impl AnnotationKind {
    fn tag(self) -> u8 {
        match self {
            AnnotationKind::KUniqueness => 1,
            AnnotationKind::KRepeatness => 2,
        }
    }
}

pub struct Annotation {
    pub kind: AnnotationKind,
    pub k: u32,
    values: Vec<u8>,
}

impl Annotation {
    pub fn load(path: &Path, kind: AnnotationKind) -> Result<Self> {
        let file = File::open(path).map_err(|e| AlignError::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| AlignError::io(path, e))?;
        let bytes: &[u8] = &mmap;
        let corrupt =
            |what: &str| AlignError::ReferenceCorrupt(format!("{}: {}", path.display(), what));

        if bytes.len() < 21 || &bytes[..4] != ANNOTATION_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != ANNOTATION_FORMAT_VERSION {
            return Err(corrupt("unsupported annotation version"));
        }
        if bytes[8] != kind.tag() {
            return Err(corrupt("annotation type does not match metadata"));
        }
        let k = u32::from_le_bytes(bytes[9..13].try_into().unwrap());
        let length = u64::from_le_bytes(bytes[13..21].try_into().unwrap()) as usize;
        if bytes.len() != 21 + length {
            return Err(corrupt("annotation length does not match header"));
        }
        Ok(Annotation {
            kind,
            k,
            values: bytes[21..].to_vec(),
        })
    }

    pub fn store(path: &Path, kind: AnnotationKind, k: u32, values: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(21 + values.len());
        out.extend_from_slice(ANNOTATION_MAGIC);
        out.extend_from_slice(&ANNOTATION_FORMAT_VERSION.to_le_bytes());
        out.push(kind.tag());
        out.extend_from_slice(&k.to_le_bytes());
        out.extend_from_slice(&(values.len() as u64).to_le_bytes());
        out.extend_from_slice(values);
        let mut file = File::create(path).map_err(|e| AlignError::io(path, e))?;
        file.write_all(&out).map_err(|e| AlignError::io(path, e))?;
        Ok(())
    }

    /// Annotation byte for a genomic offset; `ANNOTATION_NEVER` outside the
    /// annotated range.
    #[inline]
    pub fn value_at(&self, genomic_offset: u64) -> u8 {
        self.values
            .get(genomic_offset as usize)
            .copied()
            .unwrap_or(ANNOTATION_NEVER)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("annotation.dat");
        Annotation::store(&path, AnnotationKind::KUniqueness, 32, &[0, 1, 2, 255]).unwrap();
        let annotation = Annotation::load(&path, AnnotationKind::KUniqueness).unwrap();
        assert_eq!(annotation.k, 32);
        assert_eq!(annotation.value_at(1), 1);
        assert_eq!(annotation.value_at(3), 255);
        assert_eq!(annotation.value_at(100), ANNOTATION_NEVER);
    }

    #[test]
    fn kind_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("annotation.dat");
        Annotation::store(&path, AnnotationKind::KRepeatness, 32, &[0]).unwrap();
        assert!(Annotation::load(&path, AnnotationKind::KUniqueness).is_err());
    }
}
