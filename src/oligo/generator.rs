//! Iterator producing the packed k-mers of a sequence together with their
//! offsets, restarting after every ambiguous base.

use super::kmer::{base_code, kmer_mask, Kmer};

/// Yields `(kmer, offset)` for every position of the sequence where a full
/// k-mer free of ambiguous bases starts, advancing by `step` positions.
pub struct KmerGenerator<'a> {
    seq: &'a [u8],
    k: u32,
    step: usize,
    offset: usize,
}

impl<'a> KmerGenerator<'a> {
    pub fn new(seq: &'a [u8], k: u32, step: usize) -> Self {
        assert!(step > 0, "kmer step must be positive");
        KmerGenerator {
            seq,
            k,
            step,
            offset: 0,
        }
    }
}

impl<'a> Iterator for KmerGenerator<'a> {
    type Item = (Kmer, usize);

    fn next(&mut self) -> Option<(Kmer, usize)> {
        let k = self.k as usize;
        'candidates: while self.offset + k <= self.seq.len() {
            let start = self.offset;
            let mut kmer: Kmer = 0;
            for (within, &base) in self.seq[start..start + k].iter().enumerate() {
                match base_code(base) {
                    Some(code) => kmer = (kmer << 2) | code as Kmer,
                    None => {
                        // Skip past the ambiguous base, keeping step phase.
                        let blocked = start + within;
                        while self.offset <= blocked {
                            self.offset += self.step;
                        }
                        continue 'candidates;
                    }
                }
            }
            self.offset += self.step;
            return Some((kmer & kmer_mask(self.k), start));
        }
        None
    }
}
