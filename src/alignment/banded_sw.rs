//! Banded Smith-Waterman with affine gaps.
//!
//! Semi-global: the whole read is aligned, the reference window absorbs
//! free leading and trailing bases. The band is centred on the diagonal
//! the seed proposed, so the maximum representable gap equals the band
//! width. The total extension score of one gap is floored at
//! `min_gap_extend_score`, so a long gap costs at most
//! `gap_open_score + min_gap_extend_score` and stays competitive with
//! mismatching the flank. Activated only when the ungapped pass reports
//! too many mismatches.

use crate::alignment::cigar::{self, Cigar, CigarOp};
use crate::alignment::fragment::FragmentMetadata;
use crate::alignment::quality::{log_match, log_mismatch};
use crate::alignment::ungapped::OrientedRead;
use crate::config::AlignmentCfg;
use crate::reference::contig::Contig;
use crate::reference::ReferencePosition;

const NEG_INF: i32 = i32::MIN / 4;

// traceback encoding
const TB_SOURCE_MASK: u8 = 0b0011;
const TB_DIAG: u8 = 0;
const TB_FROM_E: u8 = 1; // deletion (target consumed)
const TB_FROM_F: u8 = 2; // insertion (query consumed)
const TB_START: u8 = 3;
const TB_E_EXTEND: u8 = 0b0100;
const TB_F_EXTEND: u8 = 0b1000;

pub struct BandedSmithWaterman {
    cfg: AlignmentCfg,
    band: i32,
}

impl BandedSmithWaterman {
    pub fn new(cfg: AlignmentCfg, band: u32) -> Self {
        BandedSmithWaterman {
            cfg,
            band: band.max(1) as i32,
        }
    }

    /// Aligns the full oriented read around the proposed start. Returns
    /// `None` when no positive-scoring gapped alignment exists in the band.
    pub fn align(
        &self,
        read_index: usize,
        oriented: &OrientedRead,
        reverse: bool,
        contig: &Contig,
        start: i64,
    ) -> Option<FragmentMetadata> {
        let qlen = oriented.len() as i32;
        if qlen == 0 {
            return None;
        }
        let contig_length = contig.len() as i64;
        let window_start = (start - self.band as i64).clamp(0, contig_length);
        let window_end = (start + qlen as i64 + self.band as i64).clamp(0, contig_length);
        let target = &contig.sequence[window_start as usize..window_end as usize];
        let tlen = target.len() as i32;
        if tlen == 0 {
            return None;
        }
        // diagonal of the proposed start within the window
        let d0 = (start - window_start) as i32;

        let open_extend = self.cfg.gap_open_score + self.cfg.gap_extend_score;
        let extend = self.cfg.gap_extend_score;
        // a gap run never scores below this, whatever its length
        let open_floor = self.cfg.gap_open_score + self.cfg.min_gap_extend_score;

        let width = (qlen + 1) as usize;
        let mut h_prev = vec![NEG_INF; width];
        let mut h_cur = vec![NEG_INF; width];
        let mut e_col = vec![NEG_INF; width];
        // H value each pending gap run opened from, for the extension floor
        let mut e_anchor = vec![NEG_INF; width];
        let mut tb = vec![TB_START; (tlen as usize + 1) * width];

        // row 0: free target prefix at j = 0, query insertions otherwise
        h_prev[0] = 0;
        for j in 1..=qlen {
            h_prev[j as usize] =
                self.cfg.gap_open_score + (extend * j).max(self.cfg.min_gap_extend_score);
            tb[j as usize] = TB_FROM_F | if j > 1 { TB_F_EXTEND } else { 0 };
        }

        let mut best_score = 0;
        let mut best_i = 0;

        for i in 1..=tlen {
            let row = i as usize * width;
            h_cur[0] = 0; // free leading target
            tb[row] = TB_START;
            let mut f = NEG_INF;
            let mut f_anchor = NEG_INF;
            let target_base = target[(i - 1) as usize];

            let j_low = (i - d0 - self.band).max(1);
            let j_high = (i - d0 + self.band).min(qlen);
            if j_low > qlen {
                std::mem::swap(&mut h_prev, &mut h_cur);
                continue;
            }
            for j in 1..j_low {
                h_cur[j as usize] = NEG_INF;
            }
            for j in (j_high + 1)..=qlen {
                h_cur[j as usize] = NEG_INF;
            }

            for j in j_low..=j_high.max(j_low) {
                let ju = j as usize;
                let query_base = oriented.sequence[(j - 1) as usize];
                let sub = if query_base == target_base
                    && matches!(query_base, b'A' | b'C' | b'G' | b'T')
                {
                    self.cfg.match_score
                } else {
                    self.cfg.mismatch_score
                };

                // E: gap in the query, consumes target (deletion). The
                // continuation is clamped so the run's extension never
                // drops below the floor.
                let e_open = h_prev[ju].saturating_add(open_extend);
                let e_cont = e_col[ju]
                    .saturating_add(extend)
                    .max(e_anchor[ju].saturating_add(open_floor));
                let (e, e_flag) = if e_cont > e_open {
                    (e_cont, TB_E_EXTEND)
                } else {
                    e_anchor[ju] = h_prev[ju];
                    (e_open, 0)
                };
                e_col[ju] = e;

                // F: gap in the target, consumes query (insertion)
                let f_open = h_cur[ju - 1].saturating_add(open_extend);
                let f_cont = f
                    .saturating_add(extend)
                    .max(f_anchor.saturating_add(open_floor));
                let (f_new, f_flag) = if f_cont > f_open {
                    (f_cont, TB_F_EXTEND)
                } else {
                    f_anchor = h_cur[ju - 1];
                    (f_open, 0)
                };
                f = f_new;

                let diag = h_prev[ju - 1].saturating_add(sub);
                let (h, source) = if diag >= e && diag >= f {
                    (diag, TB_DIAG)
                } else if e >= f {
                    (e, TB_FROM_E)
                } else {
                    (f, TB_FROM_F)
                };
                h_cur[ju] = h;
                tb[row + ju] = source | e_flag | f_flag;
            }

            if h_cur[qlen as usize] > best_score {
                best_score = h_cur[qlen as usize];
                best_i = i;
            }
            std::mem::swap(&mut h_prev, &mut h_cur);
        }

        if best_score <= 0 || best_i == 0 {
            return None;
        }

        let cigar = self.traceback(&tb, width, best_i, qlen)?;
        let (cigar, position_row) = cigar;
        let position = window_start + position_row as i64;
        self.finish(read_index, oriented, reverse, contig, position, cigar)
    }

    /// Walks the traceback from `(end_row, qlen)` to query start. Returns
    /// the reversed-op CIGAR and the row where the alignment begins.
    fn traceback(
        &self,
        tb: &[u8],
        width: usize,
        end_row: i32,
        qlen: i32,
    ) -> Option<(Cigar, i32)> {
        #[derive(PartialEq, Clone, Copy)]
        enum State {
            H,
            E,
            F,
        }
        let mut ops: Vec<(CigarOp, u32)> = Vec::new();
        let mut push = |op: CigarOp| match ops.last_mut() {
            Some((last, len)) if *last == op => *len += 1,
            _ => ops.push((op, 1)),
        };

        let mut i = end_row;
        let mut j = qlen;
        let mut state = State::H;
        while j > 0 {
            if i < 0 {
                return None;
            }
            let cell = tb[i as usize * width + j as usize];
            match state {
                State::H => match cell & TB_SOURCE_MASK {
                    TB_DIAG => {
                        push(CigarOp::Align);
                        i -= 1;
                        j -= 1;
                    }
                    TB_FROM_E => state = State::E,
                    TB_FROM_F => state = State::F,
                    _ => return None, // dead cell
                },
                State::E => {
                    push(CigarOp::Delete);
                    let extended = cell & TB_E_EXTEND != 0;
                    i -= 1;
                    if !extended {
                        state = State::H;
                    }
                }
                State::F => {
                    push(CigarOp::Insert);
                    let extended = cell & TB_F_EXTEND != 0;
                    j -= 1;
                    if !extended {
                        state = State::H;
                    }
                }
            }
        }
        ops.reverse();
        Some((ops, i.max(0)))
    }

    /// Cleans up the raw CIGAR, recounts mismatches and the log
    /// probability, and packages the fragment.
    fn finish(
        &self,
        read_index: usize,
        oriented: &OrientedRead,
        reverse: bool,
        contig: &Contig,
        mut position: i64,
        mut raw: Cigar,
    ) -> Option<FragmentMetadata> {
        // gaps touching the alignment ends carry no information
        while let Some(&(op, len)) = raw.first() {
            match op {
                CigarOp::Delete | CigarOp::Split => {
                    position += len as i64;
                    raw.remove(0);
                }
                CigarOp::Insert => {
                    raw[0] = (CigarOp::SoftClip, len);
                    break;
                }
                _ => break,
            }
        }
        while let Some(&(op, len)) = raw.last() {
            match op {
                CigarOp::Delete | CigarOp::Split => {
                    raw.pop();
                }
                CigarOp::Insert => {
                    let at = raw.len() - 1;
                    raw[at] = (CigarOp::SoftClip, len);
                    break;
                }
                _ => break,
            }
        }
        if raw.is_empty() {
            return None;
        }

        // long deletions become splits
        for component in raw.iter_mut() {
            if component.0 == CigarOp::Delete && component.1 >= self.cfg.split_gap_length {
                component.0 = CigarOp::Split;
            }
        }
        cigar::normalize(&mut raw);

        let mut mismatches = 0u32;
        let mut log_probability = 0.0f64;
        let mut read_at = 0usize;
        let mut ref_at = position;
        for &(op, len) in &raw {
            match op {
                CigarOp::Align => {
                    for _ in 0..len {
                        let reference_base = contig.sequence[ref_at as usize];
                        let quality = oriented.quality[read_at];
                        if oriented.sequence[read_at] == reference_base
                            && matches!(reference_base, b'A' | b'C' | b'G' | b'T')
                        {
                            log_probability += log_match(quality);
                        } else {
                            log_probability += log_mismatch(quality);
                            mismatches += 1;
                        }
                        read_at += 1;
                        ref_at += 1;
                    }
                }
                CigarOp::Insert => {
                    for _ in 0..len {
                        log_probability += log_mismatch(oriented.quality[read_at]);
                        read_at += 1;
                    }
                }
                CigarOp::SoftClip => read_at += len as usize,
                CigarOp::Delete | CigarOp::Split => ref_at += len as i64,
            }
        }

        Some(FragmentMetadata::new(
            read_index,
            ReferencePosition::new(contig.index, position as u32),
            reverse,
            raw,
            mismatches,
            log_probability,
        ))
    }
}
