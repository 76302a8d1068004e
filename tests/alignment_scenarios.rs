//! Builder-level alignment scenarios: single unique reads, mismatches,
//! repeats, proper pairs and shadow rescue, plus the seed-matcher
//! containment invariant.

mod common;

use common::{cluster, in_memory_reference, read_with_quality, reverse_complement, synthetic_genome};
use sortalign::alignment::cigar::CigarOp;
use sortalign::alignment::match_finder::{find_candidates, seed_offsets};
use sortalign::alignment::quality::{self, MAX_MAPQ, REPEAT_ALIGNMENT_SCORE, UNKNOWN_MAPQ};
use sortalign::alignment::template_builder::TemplateBuilder;
use sortalign::alignment::tls::{PairOrientation, TemplateLengthStatistics};
use sortalign::alignment::TemplateClass;
use sortalign::config::AlignConfig;
use sortalign::stats::{MatchFinderTileStats, TemplateStats};

const SEED: u32 = 16;

fn build_one(
    reference: &sortalign::reference::Reference,
    config: &AlignConfig,
    cluster: &sortalign::tiles::Cluster,
    tls: Option<&TemplateLengthStatistics>,
) -> sortalign::alignment::Template {
    let builder = TemplateBuilder::new(reference, config);
    let mut match_stats = MatchFinderTileStats::default();
    let mut template_stats = TemplateStats::default();
    builder.build(cluster, tls, &mut match_stats, &mut template_stats)
}

#[test]
fn single_unique_read_aligns_perfectly() {
    // E1: one 1000-base contig, the read is an exact 75-base extract
    let genome = synthetic_genome(1000, 11);
    let reference = in_memory_reference(&[("chr1", genome.clone())], SEED);
    let config = AlignConfig::default();
    let cluster = cluster(1, vec![read_with_quality(&genome[100..175], 35)]);

    let template = build_one(&reference, &config, &cluster, None);
    assert_eq!(template.class, TemplateClass::SoloAligned);
    let fragment = template.fragment(0).expect("aligned");
    assert_eq!(fragment.position.contig(), 0);
    assert_eq!(fragment.position.offset(), 100);
    assert!(!fragment.reverse);
    assert_eq!(fragment.cigar, vec![(CigarOp::Align, 75)]);
    assert_eq!(fragment.mismatches, 0);
    assert_eq!(fragment.mapq, MAX_MAPQ);
    assert!(fragment.alignment_score >= 60);
}

#[test]
fn one_mismatch_costs_exactly_the_quality_penalty() {
    // E2: as E1, with one toggled base of quality 30 at read offset 35
    let genome = synthetic_genome(1000, 11);
    let reference = in_memory_reference(&[("chr1", genome.clone())], SEED);
    let config = AlignConfig::default();

    let mut sequence = genome[100..175].to_vec();
    sequence[35] = match sequence[35] {
        b'A' => b'C',
        b'C' => b'G',
        b'G' => b'T',
        _ => b'A',
    };
    let mut quality = vec![35u8; 75];
    quality[35] = 30;
    let cluster = cluster(1, vec![(sequence, quality.clone())]);

    let template = build_one(&reference, &config, &cluster, None);
    let fragment = template.fragment(0).expect("aligned");
    assert_eq!(fragment.cigar, vec![(CigarOp::Align, 75)]);
    assert_eq!(fragment.mismatches, 1);
    assert_eq!(fragment.edit_distance, 1);
    assert_eq!(fragment.mapq, MAX_MAPQ);

    // log probability is the perfect read's minus the match term plus the
    // mismatch term at the toggled base
    let expected: f64 = quality
        .iter()
        .enumerate()
        .map(|(at, &q)| {
            if at == 35 {
                quality::log_mismatch(q)
            } else {
                quality::log_match(q)
            }
        })
        .sum();
    assert!((fragment.log_probability - expected).abs() < 1e-9);
}

#[test]
fn perfect_repeat_scores_as_repeat() {
    // E3: the read occurs identically at offsets 100 and 500
    let mut genome = synthetic_genome(1000, 23);
    let segment = genome[100..175].to_vec();
    genome[500..575].copy_from_slice(&segment);
    let reference = in_memory_reference(&[("chr1", genome)], SEED);
    let config = AlignConfig::default();
    let cluster_a = cluster(1, vec![read_with_quality(&segment, 35)]);

    let template = build_one(&reference, &config, &cluster_a, None);
    let fragment = template.fragment(0).expect("aligned");
    assert_eq!(fragment.alignment_score, REPEAT_ALIGNMENT_SCORE);
    assert_eq!(fragment.mapq, 3);
    assert!(!quality::is_unique(fragment.alignment_score));
    assert!(
        fragment.position.offset() == 100 || fragment.position.offset() == 500,
        "repeat must land on one of its two copies, got {}",
        fragment.position
    );

    // scattering is deterministic per cluster id
    let again = build_one(&reference, &config, &cluster_a, None);
    assert_eq!(
        again.fragment(0).unwrap().position,
        fragment.position
    );
}

#[test]
fn consistent_pair_is_proper() {
    // E4: mates 200 bases apart in FR orientation, TLS centred on 200
    let genome = synthetic_genome(2000, 37);
    let reference = in_memory_reference(&[("chr1", genome.clone())], SEED);
    let config = AlignConfig::default();
    let tls = TemplateLengthStatistics::from_user(PairOrientation::Fr, 200, 150, 250);

    let read1 = genome[1000..1075].to_vec();
    let read2 = reverse_complement(&genome[1125..1200]);
    let pair = cluster(
        5,
        vec![read_with_quality(&read1, 35), read_with_quality(&read2, 35)],
    );

    let template = build_one(&reference, &config, &pair, Some(&tls));
    assert_eq!(template.class, TemplateClass::ProperPair);
    assert!(template.proper_pair);
    assert_eq!(template.template_length, 200);
    let first = template.fragment(0).unwrap();
    let second = template.fragment(1).unwrap();
    assert_eq!(first.position.offset(), 1000);
    assert!(!first.reverse);
    assert_eq!(second.position.offset(), 1125);
    assert!(second.reverse);
    assert!(template.template_score >= first.alignment_score);
    assert!(template.template_score >= second.alignment_score);
    assert_eq!(first.mapq, MAX_MAPQ);
    assert_eq!(second.mapq, MAX_MAPQ);
}

#[test]
fn shadow_is_rescued_from_the_tls_window() {
    // E5: read2's seed bases are below the quality floor, so only the
    // windowed rescue can place it
    let genome = synthetic_genome(2000, 41);
    let reference = in_memory_reference(&[("chr1", genome.clone())], SEED);
    let config = AlignConfig::default();
    let tls = TemplateLengthStatistics::from_user(PairOrientation::Fr, 300, 225, 375);

    let read1 = genome[1000..1075].to_vec();
    let read2 = reverse_complement(&genome[1225..1300]);
    let pair = cluster(
        9,
        vec![read_with_quality(&read1, 35), read_with_quality(&read2, 2)],
    );

    let template = build_one(&reference, &config, &pair, Some(&tls));
    assert_eq!(template.class, TemplateClass::ShadowRescued);
    assert!(template.proper_pair);
    let anchor = template.fragment(0).unwrap();
    let shadow = template.fragment(1).unwrap();
    assert_eq!(anchor.position.offset(), 1000);
    assert_eq!(shadow.position.offset(), 1225);
    assert!(shadow.reverse);
    assert!(shadow.rescued);
    assert!(shadow.mapq <= anchor.mapq);
    assert_eq!(template.template_length, 300);
}

#[test]
fn rescue_can_be_disabled() {
    let genome = synthetic_genome(2000, 41);
    let reference = in_memory_reference(&[("chr1", genome.clone())], SEED);
    let mut config = AlignConfig::default();
    config.rescue_shadows = false;
    let tls = TemplateLengthStatistics::from_user(PairOrientation::Fr, 300, 225, 375);

    let read1 = genome[1000..1075].to_vec();
    let read2 = reverse_complement(&genome[1225..1300]);
    let pair = cluster(
        9,
        vec![read_with_quality(&read1, 35), read_with_quality(&read2, 2)],
    );
    let template = build_one(&reference, &config, &pair, Some(&tls));
    assert_eq!(template.class, TemplateClass::SoloAligned);
    assert!(template.fragment(1).is_none());
}

#[test]
fn all_n_cluster_has_no_candidates() {
    let genome = synthetic_genome(1000, 3);
    let reference = in_memory_reference(&[("chr1", genome)], SEED);
    let config = AlignConfig::default();
    let cluster = cluster(2, vec![(vec![b'N'; 75], vec![0u8; 75])]);
    let template = build_one(&reference, &config, &cluster, None);
    assert_eq!(template.class, TemplateClass::NoCandidates);
    assert_eq!(template.aligned_fragment_count(), 0);
}

#[test]
fn mapq_stays_in_the_contract_range() {
    // invariant 2 over a mixed bag of clusters
    let mut genome = synthetic_genome(1500, 53);
    let segment = genome[200..275].to_vec();
    genome[700..775].copy_from_slice(&segment);
    let reference = in_memory_reference(&[("chr1", genome.clone())], SEED);
    let config = AlignConfig::default();

    for (id, read) in [
        read_with_quality(&genome[50..125], 35),
        read_with_quality(&segment, 35),
        (vec![b'N'; 75], vec![0u8; 75]),
        read_with_quality(&genome[1400..1475], 12),
    ]
    .into_iter()
    .enumerate()
    {
        let template = build_one(&reference, &config, &cluster(id as u64, vec![read]), None);
        for fragment in template.fragments.iter().flatten() {
            assert!(
                fragment.mapq <= MAX_MAPQ || fragment.mapq == UNKNOWN_MAPQ,
                "mapq {} out of range",
                fragment.mapq
            );
        }
    }
}

#[test]
fn matcher_candidates_are_a_subset_of_brute_force() {
    // invariant 1: candidates never exceed what a brute-force scan of the
    // same seeds admits
    let mut genome = synthetic_genome(3000, 71);
    let segment = genome[100..175].to_vec();
    genome[900..975].copy_from_slice(&segment);
    let reference = in_memory_reference(&[("chr1", genome.clone())], SEED);
    let config = AlignConfig::default();

    let read = sortalign::tiles::ReadData {
        sequence: segment.clone(),
        quality: vec![35; segment.len()],
    };
    let mut stats = MatchFinderTileStats::default();
    let candidates = find_candidates(&read, &reference, &config, &mut stats);
    assert!(!candidates.candidates.is_empty());

    // brute force: for every seed offset, every occurrence of the seed or
    // its reverse complement anywhere in the genome
    let mut allowed: Vec<(u32, i64, bool)> = Vec::new();
    for offset in seed_offsets(read.sequence.len(), SEED, config.seed_step) {
        let seed = &read.sequence[offset..offset + SEED as usize];
        let rc = reverse_complement(seed);
        for at in 0..=(genome.len() - SEED as usize) {
            let window = &genome[at..at + SEED as usize];
            if window == seed {
                allowed.push((0, at as i64 - offset as i64, false));
            }
            if window == rc.as_slice() {
                allowed.push((
                    0,
                    at as i64 - (read.sequence.len() - offset - SEED as usize) as i64,
                    true,
                ));
            }
        }
    }
    for candidate in &candidates.candidates {
        assert!(
            allowed.contains(&(candidate.contig, candidate.start, candidate.reverse)),
            "candidate {:?} not justified by brute force",
            candidate
        );
    }
}
