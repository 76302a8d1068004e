pub mod annotation;
pub mod contig;
pub mod kmer_index;
pub mod metadata;
pub mod position;

use std::path::Path;

use crate::config::AlignConfig;
use crate::error::Result;

pub use annotation::{Annotation, AnnotationKind};
pub use contig::{Contig, ContigList};
pub use kmer_index::{KmerIndexSet, KmerLookup};
pub use metadata::ReferenceMetadata;
pub use position::ReferencePosition;

/// The reference genome as used by the aligner: contig sequences, the k-mer
/// index and the optional uniqueness annotations. Immutable once loaded and
/// shared across all workers without locking.
pub struct Reference {
    pub metadata: ReferenceMetadata,
    pub contigs: ContigList,
    pub index: KmerIndexSet,
    pub k_uniqueness: Option<Annotation>,
    pub k_repeatness: Option<Annotation>,
    pub seed_length: u32,
}

impl Reference {
    /// Loads contigs, mask files and annotations named by the metadata file.
    /// Missing or corrupt mask files are fatal.
    pub fn load(metadata_path: &Path, config: &AlignConfig) -> Result<Self> {
        let mut metadata = ReferenceMetadata::load(metadata_path)?;
        metadata.apply_decoy_filter(&config.decoy_filter);

        let contigs = contig::load_contigs(&metadata, metadata_path.parent())?;
        let index = kmer_index::load_masks(
            &metadata,
            metadata_path.parent(),
            config.seed_length,
            config.repeat_threshold,
        )?;

        let base = metadata_path.parent();
        let k_uniqueness = metadata
            .annotation(AnnotationKind::KUniqueness)
            .map(|a| Annotation::load(&metadata::resolve(base, &a.path), AnnotationKind::KUniqueness))
            .transpose()?;
        let k_repeatness = metadata
            .annotation(AnnotationKind::KRepeatness)
            .map(|a| Annotation::load(&metadata::resolve(base, &a.path), AnnotationKind::KRepeatness))
            .transpose()?;

        log::info!(
            "[reference] loaded {} contigs, {} mask files, genome length {}",
            contigs.len(),
            index.mask_count(),
            contigs.genome_length()
        );

        Ok(Reference {
            metadata,
            contigs,
            index,
            k_uniqueness,
            k_repeatness,
            seed_length: config.seed_length,
        })
    }

    /// Assembles a reference from already-loaded parts. Used by fixtures
    /// that never touch the on-disk formats.
    pub fn from_parts(
        metadata: ReferenceMetadata,
        contigs: ContigList,
        index: KmerIndexSet,
        seed_length: u32,
    ) -> Self {
        Reference {
            metadata,
            contigs,
            index,
            k_uniqueness: None,
            k_repeatness: None,
            seed_length,
        }
    }
}
