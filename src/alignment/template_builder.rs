//! Template builder: turns seed candidates into the final template for a
//! cluster.
//!
//! Five stages: fragment construction (ungapped, escalating to banded
//! Smith-Waterman), pair enumeration against the TLS, shadow rescue,
//! probabilistic scoring, and repeat scattering. The per-cluster state
//! machine terminates in one of the `TemplateClass` values.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::alignment::banded_sw::BandedSmithWaterman;
use crate::alignment::cigar::{self, CigarOp};
use crate::alignment::fragment::FragmentMetadata;
use crate::alignment::match_finder::{find_candidates, SeedCandidate};
use crate::alignment::quality::{
    self, alignment_score_to_mapq, compute_alignment_score, lp_equals, lp_less, pick_mapq,
    pick_mapq_from_mate, rest_of_genome_correction, UNKNOWN_ALIGNMENT_SCORE, UNKNOWN_MAPQ,
};
use crate::alignment::shadow::rescue_shadow;
use crate::alignment::template::{Template, TemplateClass};
use crate::alignment::tls::{observe_pair, TemplateLengthStatistics};
use crate::alignment::ungapped::{align_ungapped, OrientedRead};
use crate::config::{AlignConfig, DodgyAlignmentScore};
use crate::reference::Reference;
use crate::stats::{MatchFinderTileStats, TemplateStats};
use crate::tiles::Cluster;

/// A run of at least this many consecutive mismatches makes the smart gap
/// aligner suspect an indel.
const SMART_GAP_MISMATCH_RUN_MIN: u32 = 4;

/// Pairings farther apart than this never enter the probability space.
const PAIR_DISTANCE_MAX: u32 = 50_000;

struct ReadAlignments {
    fragments: Vec<FragmentMetadata>,
    read_length: usize,
    had_candidates: bool,
    forward: OrientedRead,
    reverse: OrientedRead,
}

impl ReadAlignments {
    fn probability_sum(&self) -> f64 {
        self.fragments
            .iter()
            .map(|f| f.log_probability.exp())
            .sum()
    }
}

pub struct TemplateBuilder<'a> {
    reference: &'a Reference,
    config: &'a AlignConfig,
    sw: BandedSmithWaterman,
}

impl<'a> TemplateBuilder<'a> {
    pub fn new(reference: &'a Reference, config: &'a AlignConfig) -> Self {
        TemplateBuilder {
            reference,
            config,
            sw: BandedSmithWaterman::new(
                config.alignment_cfg,
                config.smith_waterman_gap_size_max,
            ),
        }
    }

    /// Builds the template for one cluster. `tls` is the frozen per-barcode
    /// distribution, absent while it is still being learned.
    pub fn build(
        &self,
        cluster: &Cluster,
        tls: Option<&TemplateLengthStatistics>,
        match_stats: &mut MatchFinderTileStats,
        template_stats: &mut TemplateStats,
    ) -> Template {
        let mut template = self.build_inner(cluster, tls, match_stats);
        self.apply_mapq_threshold(&mut template, template_stats);
        template_stats.record(template.class);
        template
    }

    fn build_inner(
        &self,
        cluster: &Cluster,
        tls: Option<&TemplateLengthStatistics>,
        match_stats: &mut MatchFinderTileStats,
    ) -> Template {
        let read_count = cluster.read_count();
        let mut reads: Vec<ReadAlignments> = cluster
            .reads
            .iter()
            .enumerate()
            .map(|(index, read)| self.align_read(index, read, match_stats))
            .collect();

        let any_candidates = reads.iter().any(|r| r.had_candidates);
        let any_fragments = reads.iter().any(|r| !r.fragments.is_empty());
        if !any_fragments {
            let class = if any_candidates {
                TemplateClass::Unaligned
            } else {
                TemplateClass::NoCandidates
            };
            return Template::unaligned(cluster.id, cluster.barcode, read_count, class);
        }

        if read_count == 1 {
            return self.finish_solo(cluster, reads.pop().unwrap());
        }

        let aligned: Vec<bool> = reads.iter().map(|r| !r.fragments.is_empty()).collect();
        match (aligned[0], aligned[1]) {
            (true, true) => self.finish_pair(cluster, reads, tls),
            (true, false) | (false, true) => {
                let anchor_index = if aligned[0] { 0 } else { 1 };
                self.finish_anchor_and_shadow(cluster, reads, anchor_index, tls)
            }
            (false, false) => unreachable!("any_fragments checked above"),
        }
    }

    // ---------------------------------------------------------------
    // Stage A: fragment construction
    // ---------------------------------------------------------------

    fn align_read(
        &self,
        read_index: usize,
        read: &crate::tiles::ReadData,
        match_stats: &mut MatchFinderTileStats,
    ) -> ReadAlignments {
        let candidate_set = find_candidates(read, self.reference, self.config, match_stats);
        let forward = OrientedRead::forward(read);
        let reverse = OrientedRead::reverse(read);

        let mut fragments: Vec<FragmentMetadata> = Vec::new();
        for candidate in &candidate_set.candidates {
            if let Some(mut fragment) = self.align_candidate(read_index, &forward, &reverse, candidate)
            {
                fragment.dodgy = candidate_set.dodgy;
                fragments.push(fragment);
            }
        }

        // candidates that converged to the same placement: keep the best
        fragments.sort_by(|a, b| {
            a.alignment_key()
                .cmp(&b.alignment_key())
                .then_with(|| b.log_probability.total_cmp(&a.log_probability))
        });
        fragments.dedup_by_key(|f| f.alignment_key());
        // best first; equal probabilities resolve by position for
        // deterministic scattering
        fragments.sort_by(|a, b| {
            b.log_probability
                .total_cmp(&a.log_probability)
                .then_with(|| a.alignment_key().cmp(&b.alignment_key()))
        });

        ReadAlignments {
            fragments,
            read_length: read.len(),
            had_candidates: !candidate_set.candidates.is_empty(),
            forward,
            reverse,
        }
    }

    fn align_candidate(
        &self,
        read_index: usize,
        forward: &OrientedRead,
        reverse: &OrientedRead,
        candidate: &SeedCandidate,
    ) -> Option<FragmentMetadata> {
        let contig = self.reference.contigs.get(candidate.contig);
        let oriented = if candidate.reverse { reverse } else { forward };
        let ungapped = align_ungapped(
            read_index,
            oriented,
            candidate.reverse,
            contig,
            candidate.start,
            self.config.clip_semialigned,
        )?;

        if ungapped.fragment.mismatches <= self.config.gapped_mismatches_max {
            return Some(ungapped.fragment);
        }
        if self.config.smart_smith_waterman
            && ungapped.longest_mismatch_run < SMART_GAP_MISMATCH_RUN_MIN
        {
            return Some(ungapped.fragment);
        }

        match self.sw.align(
            read_index,
            oriented,
            candidate.reverse,
            contig,
            candidate.start,
        ) {
            Some(gapped)
                if gapped.gaps <= self.config.smith_waterman_gaps_max
                    && lp_less(ungapped.fragment.log_probability, gapped.log_probability) =>
            {
                Some(gapped)
            }
            _ => Some(ungapped.fragment),
        }
    }

    // ---------------------------------------------------------------
    // Stage D helpers: probabilistic scoring
    // ---------------------------------------------------------------

    /// Picks the best fragment of a read (scattering ties) and computes its
    /// alignment score against the whole candidate set. Returns the index.
    fn score_read(&self, cluster_id: u64, read: &mut ReadAlignments) -> usize {
        let sum: f64 = read.probability_sum();
        let chosen = self.scatter_choice(cluster_id, &read.fragments);
        let probability = read.fragments[chosen].log_probability.exp();
        let rog = rest_of_genome_correction(
            self.reference.contigs.mapped_genome_length(),
            read.read_length,
        );
        let score = compute_alignment_score(rog, probability, (sum - probability).max(0.0));
        let fragment = &mut read.fragments[chosen];
        fragment.alignment_score = score;
        fragment.mapq = alignment_score_to_mapq(score);
        chosen
    }

    /// Alignment score of an arbitrary candidate of the read against the
    /// rest of its candidate set.
    fn fragment_score(&self, read: &ReadAlignments, index: usize) -> u32 {
        let sum: f64 = read.probability_sum();
        let probability = read.fragments[index].log_probability.exp();
        let rog = rest_of_genome_correction(
            self.reference.contigs.mapped_genome_length(),
            read.read_length,
        );
        compute_alignment_score(rog, probability, (sum - probability).max(0.0))
    }

    /// Index of the fragment to report: among the equally most likely
    /// candidates, the cluster-id hash picks one so repeat coverage stays
    /// uniform. Fragments arrive sorted best-first.
    fn scatter_choice(&self, cluster_id: u64, fragments: &[FragmentMetadata]) -> usize {
        let best_lp = fragments[0].log_probability;
        let ties = fragments
            .iter()
            .take_while(|f| lp_equals(f.log_probability, best_lp))
            .count();
        if ties <= 1 || !self.config.scatter_repeats {
            return 0;
        }
        let mut hasher = FxHasher::default();
        cluster_id.hash(&mut hasher);
        (hasher.finish() % ties as u64) as usize
    }

    /// Applies the configured dodgy-alignment policy to a chosen fragment.
    /// Returns false if the fragment must be dropped as unaligned.
    fn resolve_dodgy(&self, fragment: &mut FragmentMetadata) -> bool {
        if !fragment.dodgy {
            return true;
        }
        match self.config.dodgy_alignment_score {
            DodgyAlignmentScore::Unaligned => false,
            DodgyAlignmentScore::Unknown => {
                fragment.alignment_score = UNKNOWN_ALIGNMENT_SCORE;
                fragment.mapq = UNKNOWN_MAPQ;
                true
            }
            DodgyAlignmentScore::Score(score) => {
                fragment.alignment_score = score as u32;
                fragment.mapq = alignment_score_to_mapq(score as u32);
                true
            }
        }
    }

    fn template_rog(&self, reads: &[ReadAlignments]) -> f64 {
        let total: usize = reads.iter().map(|r| r.read_length).sum();
        rest_of_genome_correction(self.reference.contigs.mapped_genome_length(), total)
    }

    // ---------------------------------------------------------------
    // Terminal states
    // ---------------------------------------------------------------

    fn finish_solo(&self, cluster: &Cluster, mut read: ReadAlignments) -> Template {
        let chosen = self.score_read(cluster.id, &mut read);
        let mut fragment = read.fragments.swap_remove(chosen);
        if !self.resolve_dodgy(&mut fragment) {
            return Template::unaligned(
                cluster.id,
                cluster.barcode,
                1,
                TemplateClass::Unaligned,
            );
        }
        let template_score = fragment.alignment_score;
        Template {
            cluster_id: cluster.id,
            barcode: cluster.barcode,
            class: TemplateClass::SoloAligned,
            fragments: vec![Some(fragment)],
            proper_pair: false,
            template_length: 0,
            template_score,
        }
    }

    fn finish_pair(
        &self,
        cluster: &Cluster,
        mut reads: Vec<ReadAlignments>,
        tls: Option<&TemplateLengthStatistics>,
    ) -> Template {
        // probability space over every same-contig pairing within range
        let mut pair_sum = 0.0f64;
        let mut best_pair: Option<(usize, usize, f64, u32)> = None; // (i, j, lp, length)
        for (i, first) in reads[0].fragments.iter().enumerate() {
            for (j, second) in reads[1].fragments.iter().enumerate() {
                let Some((orientation, length)) = observe_pair(first, second) else {
                    continue;
                };
                if length > PAIR_DISTANCE_MAX {
                    continue;
                }
                let lp = first.log_probability + second.log_probability;
                pair_sum += lp.exp();
                let proper = tls.is_some_and(|t| t.is_proper(orientation, length));
                if proper {
                    let better = match best_pair {
                        None => true,
                        Some((bi, bj, best_lp, _)) => {
                            lp_less(best_lp, lp)
                                || (lp_equals(best_lp, lp) && (i, j) < (bi, bj))
                        }
                    };
                    if better {
                        best_pair = Some((i, j, lp, length));
                    }
                }
            }
        }

        let chosen0 = self.score_read(cluster.id, &mut reads[0]);
        let chosen1 = self.score_read(cluster.id, &mut reads[1]);

        if let Some((i, j, pair_lp, length)) = best_pair {
            // proper pair: report the TLS-consistent combination
            let pair_probability = pair_lp.exp();
            let template_score = compute_alignment_score(
                self.template_rog(&reads),
                pair_probability,
                (pair_sum - pair_probability).max(0.0),
            );

            // fragment scores belong to the pair members even when the solo
            // best was elsewhere
            let score0 = if chosen0 == i {
                reads[0].fragments[i].alignment_score
            } else {
                self.fragment_score(&reads[0], i)
            };
            let score1 = if chosen1 == j {
                reads[1].fragments[j].alignment_score
            } else {
                self.fragment_score(&reads[1], j)
            };

            let mut first = reads[0].fragments[i].clone();
            let mut second = reads[1].fragments[j].clone();
            first.alignment_score = score0;
            second.alignment_score = score1;
            first.mapq = pick_mapq(score0, score1, true, template_score);
            second.mapq = pick_mapq(score1, score0, true, template_score);

            let dropped0 = !self.resolve_dodgy(&mut first);
            let dropped1 = !self.resolve_dodgy(&mut second);
            if dropped0 || dropped1 {
                return self.demote_pair(cluster, first, second, dropped0, dropped1);
            }

            self.clip_pair(&reads, &mut first, &mut second);

            return Template {
                cluster_id: cluster.id,
                barcode: cluster.barcode,
                class: TemplateClass::ProperPair,
                fragments: vec![Some(first), Some(second)],
                proper_pair: true,
                template_length: length as i64,
                template_score,
            };
        }

        // anomalous pair: best solo alignments, handicapped template score,
        // then the dodgy substitution
        let mut first = reads[0].fragments[chosen0].clone();
        let mut second = reads[1].fragments[chosen1].clone();
        let template_score = first
            .alignment_score
            .min(second.alignment_score)
            .saturating_sub(self.config.anomalous_pair_handicap);
        first.mapq = pick_mapq(first.alignment_score, second.alignment_score, false, template_score);
        second.mapq = pick_mapq(second.alignment_score, first.alignment_score, false, template_score);
        let dropped0 = !self.resolve_dodgy(&mut first);
        let dropped1 = !self.resolve_dodgy(&mut second);
        if dropped0 || dropped1 {
            return self.demote_pair(cluster, first, second, dropped0, dropped1);
        }
        let template_length = observe_pair(&first, &second)
            .map(|(_, length)| length as i64)
            .unwrap_or(0);
        Template {
            cluster_id: cluster.id,
            barcode: cluster.barcode,
            class: TemplateClass::AnomalousPair,
            fragments: vec![Some(first), Some(second)],
            proper_pair: false,
            template_length,
            template_score,
        }
    }

    /// A pair where dodgy resolution dropped one or both fragments.
    fn demote_pair(
        &self,
        cluster: &Cluster,
        first: FragmentMetadata,
        second: FragmentMetadata,
        dropped0: bool,
        dropped1: bool,
    ) -> Template {
        if dropped0 && dropped1 {
            return Template::unaligned(
                cluster.id,
                cluster.barcode,
                2,
                TemplateClass::Unaligned,
            );
        }
        let (kept, slot0, slot1) = if dropped0 {
            (second.alignment_score, None, Some(second))
        } else {
            (first.alignment_score, Some(first), None)
        };
        Template {
            cluster_id: cluster.id,
            barcode: cluster.barcode,
            class: TemplateClass::SoloAligned,
            fragments: vec![slot0, slot1],
            proper_pair: false,
            template_length: 0,
            template_score: kept,
        }
    }

    fn finish_anchor_and_shadow(
        &self,
        cluster: &Cluster,
        mut reads: Vec<ReadAlignments>,
        anchor_index: usize,
        tls: Option<&TemplateLengthStatistics>,
    ) -> Template {
        let shadow_index = 1 - anchor_index;
        let chosen = self.score_read(cluster.id, &mut reads[anchor_index]);
        let mut anchor = reads[anchor_index].fragments[chosen].clone();
        if !self.resolve_dodgy(&mut anchor) {
            return Template::unaligned(
                cluster.id,
                cluster.barcode,
                2,
                TemplateClass::Unaligned,
            );
        }

        // Stage C: windowed rescue of the shadow around the anchor
        if self.config.rescue_shadows {
            if let Some(tls) = tls.filter(|t| t.stable) {
                let rescued = rescue_shadow(
                    shadow_index,
                    &reads[shadow_index].forward,
                    &reads[shadow_index].reverse,
                    &anchor,
                    tls,
                    self.reference,
                    self.config,
                );
                if !rescued.is_empty() {
                    return self.finish_rescued(cluster, reads, anchor_index, anchor, rescued);
                }
            }
        }

        let template_score = anchor.alignment_score;
        let mut fragments = vec![None, None];
        fragments[anchor_index] = Some(anchor);
        Template {
            cluster_id: cluster.id,
            barcode: cluster.barcode,
            class: TemplateClass::SoloAligned,
            fragments,
            proper_pair: false,
            template_length: 0,
            template_score,
        }
    }

    fn finish_rescued(
        &self,
        cluster: &Cluster,
        reads: Vec<ReadAlignments>,
        anchor_index: usize,
        anchor: FragmentMetadata,
        rescued: Vec<FragmentMetadata>,
    ) -> Template {
        let shadow_index = 1 - anchor_index;
        let pair_sum: f64 = rescued
            .iter()
            .map(|f| (anchor.log_probability + f.log_probability).exp())
            .sum();
        let mut shadow = rescued.into_iter().next().unwrap();
        let pair_probability = (anchor.log_probability + shadow.log_probability).exp();

        let template_score = compute_alignment_score(
            self.template_rog(&reads),
            pair_probability,
            (pair_sum - pair_probability).max(0.0),
        );
        shadow.alignment_score = template_score;
        shadow.mapq = if anchor.mapq == UNKNOWN_MAPQ {
            UNKNOWN_MAPQ
        } else {
            pick_mapq_from_mate(anchor.mapq, template_score)
        };

        let mut anchor = anchor;
        let template_length = observe_pair(&anchor, &shadow)
            .map(|(_, length)| length as i64)
            .unwrap_or(0);

        if anchor_index == 0 {
            self.clip_pair(&reads, &mut anchor, &mut shadow);
        } else {
            self.clip_pair(&reads, &mut shadow, &mut anchor);
        }

        let mut fragments = vec![None, None];
        fragments[anchor_index] = Some(anchor);
        fragments[shadow_index] = Some(shadow);
        Template {
            cluster_id: cluster.id,
            barcode: cluster.barcode,
            class: TemplateClass::ShadowRescued,
            fragments,
            proper_pair: true,
            template_length,
            template_score,
        }
    }

    // ---------------------------------------------------------------
    // Pair clipping: adapter run-through and overlap
    // ---------------------------------------------------------------

    /// `first`/`second` are the fragments of reads 0 and 1 of a proper
    /// pair. Rebuilds whichever fragment needs its reference span reduced.
    fn clip_pair(
        &self,
        reads: &[ReadAlignments],
        first: &mut FragmentMetadata,
        second: &mut FragmentMetadata,
    ) {
        if !self.config.trim_pe_adapters {
            return;
        }
        if first.position.contig() != second.position.contig() {
            return;
        }
        let (forward, fwd_read, reverse, rev_read) = if first.reverse && !second.reverse {
            (second, &reads[1], first, &reads[0])
        } else if second.reverse && !first.reverse {
            (first, &reads[0], second, &reads[1])
        } else {
            return; // FF/RR geometries are not adapter artefacts
        };

        // forward read running past the reverse read's end is adapter
        let insert_end = reverse.end_position();
        if forward.end_position() > insert_end && insert_end > forward.position {
            self.reclip_fragment(
                forward,
                fwd_read,
                forward.position.offset() as i64,
                insert_end.offset() as i64,
            );
        }
        // reverse read running before the forward read's start
        let insert_start = forward.position;
        if reverse.position < insert_start && reverse.end_position() > insert_start {
            self.reclip_fragment(
                reverse,
                rev_read,
                insert_start.offset() as i64,
                reverse.end_position().offset() as i64,
            );
        }
    }

    /// Restricts a gap-free fragment to the reference span
    /// [keep_start, keep_end), converting the trimmed bases to soft clips
    /// and recomputing mismatches and log probability.
    fn reclip_fragment(
        &self,
        fragment: &mut FragmentMetadata,
        read: &ReadAlignments,
        keep_start: i64,
        keep_end: i64,
    ) {
        if fragment.gaps > 0 {
            return; // gapped fragments keep their alignment
        }
        let oriented = if fragment.reverse {
            &read.reverse
        } else {
            &read.forward
        };
        let contig = self.reference.contigs.get(fragment.position.contig());
        let old_start = fragment.position.offset() as i64;
        let leading = cigar::leading_clip(&fragment.cigar) as i64;
        // read offset of the first base to keep
        let aligned_len = fragment.observed_length() as i64;
        let new_start = keep_start.max(old_start);
        let new_end = keep_end.min(old_start + aligned_len);
        if new_start >= new_end {
            return;
        }
        let first = (leading + (new_start - old_start)) as usize;
        let last = (leading + (new_end - old_start)) as usize;

        let mut mismatches = 0u32;
        let mut log_probability = 0.0f64;
        for j in first..last {
            let reference_base = contig.sequence[(new_start + (j - first) as i64) as usize];
            let q = oriented.quality[j];
            if oriented.sequence[j] == reference_base
                && matches!(reference_base, b'A' | b'C' | b'G' | b'T')
            {
                log_probability += quality::log_match(q);
            } else {
                log_probability += quality::log_mismatch(q);
                mismatches += 1;
            }
        }

        let read_length = oriented.len();
        let mut new_cigar = Vec::with_capacity(3);
        if first > 0 {
            new_cigar.push((CigarOp::SoftClip, first as u32));
        }
        new_cigar.push((CigarOp::Align, (last - first) as u32));
        if last < read_length {
            new_cigar.push((CigarOp::SoftClip, (read_length - last) as u32));
        }

        fragment.position = crate::reference::ReferencePosition::new(
            fragment.position.contig(),
            new_start as u32,
        );
        fragment.cigar = new_cigar;
        fragment.mismatches = mismatches;
        fragment.edit_distance = mismatches;
        fragment.log_probability = log_probability;
    }

    // ---------------------------------------------------------------
    // Final MAPQ filter
    // ---------------------------------------------------------------

    fn apply_mapq_threshold(&self, template: &mut Template, stats: &mut TemplateStats) {
        if self.config.mapq_threshold == 0 {
            return;
        }
        let threshold = self.config.mapq_threshold;
        let mut dropped = false;
        for slot in template.fragments.iter_mut() {
            let below = matches!(slot, Some(f) if f.mapq != UNKNOWN_MAPQ && f.mapq < threshold);
            if below {
                *slot = None;
                dropped = true;
                stats.below_mapq_threshold += 1;
            }
        }
        if dropped {
            if template.aligned_fragment_count() == 0 {
                template.class = TemplateClass::Unaligned;
                template.proper_pair = false;
                template.template_length = 0;
            } else {
                template.class = TemplateClass::SoloAligned;
                template.proper_pair = false;
                template.template_length = 0;
            }
        }
    }
}

