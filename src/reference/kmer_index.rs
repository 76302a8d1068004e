//! The k-mer hash index backing seed lookup.
//!
//! The index is partitioned across mask files keyed by a prefix of the
//! k-mer. Each mask file holds sorted `(kmer, position)` entries; at load
//! time they are grouped per k-mer and distributed over a dense bucket
//! array indexed by `kmer mod bucketCount`, each bucket mapping to a slice
//! of the flat, position-ordered match array.
//!
//! K-mers whose match count exceeds the repeat threshold carry a single
//! entry with the no-match sentinel position; lookup reports them as
//! `TooManyRepeats` rather than returning positions.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{AlignError, Result};
use crate::oligo::Kmer;
use crate::reference::metadata::{resolve, ReferenceMetadata};
use crate::reference::position::ReferencePosition;
use crate::reference::ContigList;

const MASK_MAGIC: &[u8; 4] = b"SAMK";
const MASK_FORMAT_VERSION: u32 = 1;

/// Outcome of a seed lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum KmerLookup<'a> {
    NoMatch,
    TooManyRepeats,
    /// Positions in total (contig, offset) order.
    Matches(&'a [ReferencePosition]),
}

struct Group {
    kmer: Kmer,
    start: u32,
    /// Zero means the k-mer exceeded the repeat threshold.
    len: u32,
}

/// One loaded mask file.
pub struct MaskIndex {
    buckets: Vec<(u32, u32)>,
    groups: Vec<Group>,
    positions: Vec<ReferencePosition>,
}

impl MaskIndex {
    fn build(
        entries: &[(Kmer, ReferencePosition)],
        repeat_threshold: u32,
    ) -> Result<MaskIndex> {
        // Group runs of the same k-mer; entries arrive sorted.
        let mut groups: Vec<Group> = Vec::new();
        let mut positions: Vec<ReferencePosition> = Vec::new();
        let mut i = 0usize;
        while i < entries.len() {
            let kmer = entries[i].0;
            let mut j = i;
            let mut too_many = false;
            while j < entries.len() && entries[j].0 == kmer {
                if entries[j].1.is_none() {
                    too_many = true;
                }
                j += 1;
            }
            if (j - i) as u32 > repeat_threshold {
                too_many = true;
            }
            if too_many {
                groups.push(Group {
                    kmer,
                    start: positions.len() as u32,
                    len: 0,
                });
            } else {
                let start = positions.len() as u32;
                positions.extend(entries[i..j].iter().map(|e| e.1));
                groups.push(Group {
                    kmer,
                    start,
                    len: (j - i) as u32,
                });
            }
            i = j;
        }

        let bucket_count = groups
            .len()
            .next_power_of_two()
            .clamp(64, 1 << 22);
        groups.sort_by_key(|g| ((g.kmer as usize) & (bucket_count - 1), g.kmer));

        let mut buckets = vec![(0u32, 0u32); bucket_count];
        let mut at = 0usize;
        while at < groups.len() {
            let bucket = (groups[at].kmer as usize) & (bucket_count - 1);
            let begin = at;
            while at < groups.len() && (groups[at].kmer as usize) & (bucket_count - 1) == bucket {
                at += 1;
            }
            buckets[bucket] = (begin as u32, (at - begin) as u32);
        }

        Ok(MaskIndex {
            buckets,
            groups,
            positions,
        })
    }

    fn lookup(&self, kmer: Kmer) -> KmerLookup<'_> {
        let bucket = (kmer as usize) & (self.buckets.len() - 1);
        let (start, len) = self.buckets[bucket];
        for group in &self.groups[start as usize..(start + len) as usize] {
            if group.kmer == kmer {
                return if group.len == 0 {
                    KmerLookup::TooManyRepeats
                } else {
                    KmerLookup::Matches(
                        &self.positions
                            [group.start as usize..(group.start + group.len) as usize],
                    )
                };
            }
        }
        KmerLookup::NoMatch
    }
}

/// All mask files for the configured seed length.
pub struct KmerIndexSet {
    seed_length: u32,
    mask_width: u32,
    masks: Vec<MaskIndex>,
}

impl KmerIndexSet {
    /// Builds a single-mask index directly from loaded contigs, bypassing
    /// mask files. The invariant tests and in-process fixtures use this;
    /// production loading goes through `load_masks`.
    pub fn build_in_memory(
        contigs: &ContigList,
        seed_length: u32,
        repeat_threshold: u32,
    ) -> Result<KmerIndexSet> {
        let entries = scan_reference_kmers(contigs, seed_length);
        Ok(KmerIndexSet {
            seed_length,
            mask_width: 0,
            masks: vec![MaskIndex::build(&entries, repeat_threshold)?],
        })
    }

    pub fn lookup(&self, kmer: Kmer) -> KmerLookup<'_> {
        let mask = self.prefix(kmer);
        // Masks are stored ordered by mask value; width is validated at load.
        self.masks[mask as usize].lookup(kmer)
    }

    #[inline]
    fn prefix(&self, kmer: Kmer) -> u32 {
        if self.mask_width == 0 {
            0
        } else {
            (kmer >> (2 * self.seed_length - self.mask_width)) as u32
        }
    }

    pub fn mask_count(&self) -> usize {
        self.masks.len()
    }

    pub fn seed_length(&self) -> u32 {
        self.seed_length
    }
}

/// Loads and indexes every mask file the metadata declares for the seed
/// length. A missing mask value, truncated file or unsorted entry list is
/// fatal.
pub fn load_masks(
    metadata: &ReferenceMetadata,
    base: Option<&Path>,
    seed_length: u32,
    repeat_threshold: u32,
) -> Result<KmerIndexSet> {
    let declared = metadata.masks_for_seed_length(seed_length);
    if declared.is_empty() {
        return Err(AlignError::Precondition(format!(
            "reference has no mask files for seed length {}",
            seed_length
        )));
    }
    let mask_width = declared[0].mask_width;
    let expected = 1usize << mask_width;
    if declared.len() != expected {
        return Err(AlignError::ReferenceCorrupt(format!(
            "expected {} mask files of width {}, metadata declares {}",
            expected,
            mask_width,
            declared.len()
        )));
    }

    let mut masks: Vec<Option<MaskIndex>> = (0..expected).map(|_| None).collect();
    for meta in declared {
        if meta.mask_width != mask_width {
            return Err(AlignError::ReferenceCorrupt(
                "inconsistent mask widths across mask files".into(),
            ));
        }
        let path = resolve(base, &meta.path);
        let entries = read_mask_file(&path, seed_length, meta.mask)?;
        if entries.len() as u64 != meta.kmers {
            return Err(AlignError::ReferenceCorrupt(format!(
                "{}: {} entries, metadata declares {}",
                path.display(),
                entries.len(),
                meta.kmers
            )));
        }
        log::debug!(
            "[reference] mask {}/{}: {} entries",
            meta.mask,
            expected,
            entries.len()
        );
        masks[meta.mask as usize] = Some(MaskIndex::build(&entries, repeat_threshold)?);
    }

    let masks: Vec<MaskIndex> = masks
        .into_iter()
        .enumerate()
        .map(|(value, mask)| {
            mask.ok_or_else(|| {
                AlignError::ReferenceCorrupt(format!("mask value {} missing", value))
            })
        })
        .collect::<Result<_>>()?;

    Ok(KmerIndexSet {
        seed_length,
        mask_width,
        masks,
    })
}

fn read_u32(bytes: &[u8], at: &mut usize) -> Option<u32> {
    let value = bytes.get(*at..*at + 4)?;
    *at += 4;
    Some(u32::from_le_bytes(value.try_into().unwrap()))
}

fn read_u64(bytes: &[u8], at: &mut usize) -> Option<u64> {
    let value = bytes.get(*at..*at + 8)?;
    *at += 8;
    Some(u64::from_le_bytes(value.try_into().unwrap()))
}

fn read_mask_file(
    path: &Path,
    seed_length: u32,
    mask: u32,
) -> Result<Vec<(Kmer, ReferencePosition)>> {
    let file = File::open(path).map_err(|e| AlignError::io(path, e))?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| AlignError::io(path, e))?;
    let bytes: &[u8] = &mmap;

    let corrupt = |what: &str| AlignError::ReferenceCorrupt(format!("{}: {}", path.display(), what));

    if bytes.len() < 4 || &bytes[..4] != MASK_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut at = 4usize;
    let version = read_u32(bytes, &mut at).ok_or_else(|| corrupt("truncated header"))?;
    if version != MASK_FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported mask format version {}", version)));
    }
    let file_seed = read_u32(bytes, &mut at).ok_or_else(|| corrupt("truncated header"))?;
    let _mask_width = read_u32(bytes, &mut at).ok_or_else(|| corrupt("truncated header"))?;
    let file_mask = read_u32(bytes, &mut at).ok_or_else(|| corrupt("truncated header"))?;
    let count = read_u64(bytes, &mut at).ok_or_else(|| corrupt("truncated header"))?;

    if file_seed != seed_length {
        return Err(corrupt(&format!(
            "mask built for seed length {}, configured {}",
            file_seed, seed_length
        )));
    }
    if file_mask != mask {
        return Err(corrupt(&format!(
            "mask value {} does not match metadata {}",
            file_mask, mask
        )));
    }

    let mut entries = Vec::with_capacity(count as usize);
    let mut previous: Option<(Kmer, ReferencePosition)> = None;
    for _ in 0..count {
        let kmer = read_u64(bytes, &mut at).ok_or_else(|| corrupt("truncated entries"))?;
        let position = ReferencePosition::from_raw(
            read_u64(bytes, &mut at).ok_or_else(|| corrupt("truncated entries"))?,
        );
        if let Some(prev) = previous {
            if (kmer, position) < prev {
                return Err(corrupt("entries out of order"));
            }
        }
        previous = Some((kmer, position));
        entries.push((kmer, position));
    }
    Ok(entries)
}

/// Writes a mask file. Entries must be sorted by (kmer, position).
pub fn write_mask_file(
    path: &Path,
    seed_length: u32,
    mask_width: u32,
    mask: u32,
    entries: &[(Kmer, ReferencePosition)],
) -> Result<()> {
    use std::io::Write;
    let mut out = Vec::with_capacity(24 + entries.len() * 16);
    out.extend_from_slice(MASK_MAGIC);
    out.extend_from_slice(&MASK_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&seed_length.to_le_bytes());
    out.extend_from_slice(&mask_width.to_le_bytes());
    out.extend_from_slice(&mask.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for (kmer, position) in entries {
        out.extend_from_slice(&kmer.to_le_bytes());
        out.extend_from_slice(&position.raw().to_le_bytes());
    }
    let mut file = File::create(path).map_err(|e| AlignError::io(path, e))?;
    file.write_all(&out).map_err(|e| AlignError::io(path, e))?;
    Ok(())
}

/// Brute-force k-mer scan of the loaded contigs, sorted by (kmer,
/// position). This is the ground truth the mask files are built from; the
/// match-finder invariant tests compare against it directly.
pub fn scan_reference_kmers(
    contigs: &ContigList,
    seed_length: u32,
) -> Vec<(Kmer, ReferencePosition)> {
    use crate::oligo::KmerGenerator;
    let mut entries = Vec::new();
    for contig in contigs.iter() {
        for (kmer, offset) in KmerGenerator::new(&contig.sequence, seed_length, 1) {
            entries.push((kmer, ReferencePosition::new(contig.index, offset as u32)));
        }
    }
    entries.sort_unstable();
    entries
}

/// Applies the repeat threshold the way the reference pre-processor does:
/// runs longer than the threshold collapse to a single sentinel entry.
pub fn apply_repeat_threshold(
    entries: Vec<(Kmer, ReferencePosition)>,
    repeat_threshold: u32,
) -> Vec<(Kmer, ReferencePosition)> {
    let mut out = Vec::with_capacity(entries.len());
    let mut i = 0usize;
    while i < entries.len() {
        let kmer = entries[i].0;
        let mut j = i;
        while j < entries.len() && entries[j].0 == kmer {
            j += 1;
        }
        if (j - i) as u32 > repeat_threshold {
            out.push((kmer, ReferencePosition::NONE));
        } else {
            out.extend_from_slice(&entries[i..j]);
        }
        i = j;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oligo::kmer::pack_kmer;
    use crate::reference::contig::Contig;
    use tempfile::TempDir;

    fn contig_list(seq: &[u8]) -> ContigList {
        ContigList::new(vec![Contig {
            index: 0,
            name: "chr1".into(),
            decoy: false,
            genomic_position: 0,
            sequence: seq.to_vec(),
        }])
        .unwrap()
    }

    fn load_single_mask(entries: &[(Kmer, ReferencePosition)], threshold: u32) -> KmerIndexSet {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mask-16-0.dat");
        write_mask_file(&path, 16, 0, 0, entries).unwrap();
        let mask = MaskIndex::build(&read_mask_file(&path, 16, 0).unwrap(), threshold).unwrap();
        KmerIndexSet {
            seed_length: 16,
            mask_width: 0,
            masks: vec![mask],
        }
    }

    #[test]
    fn lookup_finds_scanned_positions() {
        let seq = b"ACGTACGTACGTACGTTTTT";
        let contigs = contig_list(seq);
        let entries = scan_reference_kmers(&contigs, 16);
        let index = load_single_mask(&entries, 1000);

        let kmer = pack_kmer(seq, 2, 16).unwrap();
        match index.lookup(kmer) {
            KmerLookup::Matches(positions) => {
                assert_eq!(positions, &[ReferencePosition::new(0, 2)]);
            }
            other => panic!("unexpected lookup result {:?}", other),
        }
        let absent = pack_kmer(b"GGGGGGGGGGGGGGGG", 0, 16).unwrap();
        assert_eq!(index.lookup(absent), KmerLookup::NoMatch);
    }

    #[test]
    fn repeat_threshold_marks_kmers() {
        // Same 16-mer at two positions with threshold 1.
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGT";
        let contigs = contig_list(seq);
        let entries = scan_reference_kmers(&contigs, 16);
        // ACGT x4 occurs at offsets 0,4,8,12,16
        let index = load_single_mask(&entries, 1);
        let kmer = pack_kmer(seq, 0, 16).unwrap();
        assert_eq!(index.lookup(kmer), KmerLookup::TooManyRepeats);
    }

    #[test]
    fn sentinel_entries_survive_write_and_load() {
        let kmer = pack_kmer(b"ACGTACGTACGTACGT", 0, 16).unwrap();
        let entries = apply_repeat_threshold(
            vec![
                (kmer, ReferencePosition::new(0, 0)),
                (kmer, ReferencePosition::new(0, 4)),
            ],
            1,
        );
        assert_eq!(entries, vec![(kmer, ReferencePosition::NONE)]);
        let index = load_single_mask(&entries, 1000);
        assert_eq!(index.lookup(kmer), KmerLookup::TooManyRepeats);
    }
}
