//! End-to-end pipeline runs: tiles in, sorted compressed alignments out,
//! with ordering, duplicate, determinism and resume checks.

mod common;

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;

use common::{base_config, read_with_quality, reverse_complement, synthetic_genome, write_reference, write_tile};
use sortalign::alignment::tls::{PairOrientation, TemplateLengthStatistics};
use sortalign::config::AlignConfig;
use sortalign::workflow::{AlignWorkflow, WorkflowState};
use tempfile::TempDir;

const SEED: u32 = 16;
const READ_LEN: usize = 75;
const INSERT: usize = 200;

fn paired_reads(genome: &[u8], start: usize, quality: u8) -> Vec<(Vec<u8>, Vec<u8>)> {
    let read1 = genome[start..start + READ_LEN].to_vec();
    let read2 = reverse_complement(&genome[start + INSERT - READ_LEN..start + INSERT]);
    vec![
        read_with_quality(&read1, quality),
        read_with_quality(&read2, quality),
    ]
}

/// The standard fixture: 2000-base genome, 20 well-separated proper
/// pairs, one duplicated pair (lower quality copy), one all-N pair.
fn standard_workspace(dir: &Path) -> AlignConfig {
    let genome = synthetic_genome(2000, 97);
    let reference = write_reference(dir, &[("chr1", genome.clone())], SEED, 1000);

    let mut clusters = Vec::new();
    for pair in 0..20usize {
        clusters.push(paired_reads(&genome, 40 + pair * 80, 35));
    }
    // duplicate of the first pair with weaker first-half qualities
    clusters.push(paired_reads(&genome, 40, 20));
    // a cluster the matcher can do nothing with
    clusters.push(vec![
        (vec![b'N'; READ_LEN], vec![0u8; READ_LEN]),
        (vec![b'N'; READ_LEN], vec![0u8; READ_LEN]),
    ]);

    let tile = write_tile(&dir.join("t1.tile"), 1, &clusters);
    let mut config = base_config(dir, vec![tile], reference);
    config.user_tls = Some(TemplateLengthStatistics::from_user(
        PairOrientation::Fr,
        INSERT as u32,
        120,
        280,
    ));
    config.target_bin_size = 16 << 10;
    config.put_unaligned_in_the_back = true;
    config
}

fn output_path(config: &AlignConfig) -> PathBuf {
    config
        .output_directory
        .join("Projects")
        .join("sample")
        .join("sorted.sam.gz")
}

fn decode_output(path: &Path) -> Vec<String> {
    let compressed = std::fs::read(path).unwrap();
    let mut decoder = MultiGzDecoder::new(&compressed[..]);
    let mut text = String::new();
    decoder.read_to_string(&mut text).unwrap();
    text.lines().map(|l| l.to_string()).collect()
}

struct SamRecord {
    flags: u16,
    rname: String,
    pos: u64,
    mapq: u8,
}

fn parse_records(lines: &[String]) -> Vec<SamRecord> {
    lines
        .iter()
        .filter(|l| !l.starts_with('@'))
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            SamRecord {
                flags: fields[1].parse().unwrap(),
                rname: fields[2].to_string(),
                pos: fields[3].parse().unwrap(),
                mapq: fields[4].parse().unwrap(),
            }
        })
        .collect()
}

#[test]
fn workflow_produces_sorted_indexed_output() {
    let dir = TempDir::new().unwrap();
    let config = standard_workspace(dir.path());
    let mut workflow = AlignWorkflow::new(config.clone()).unwrap();
    workflow.run().unwrap();
    assert_eq!(workflow.state(), WorkflowState::Done);

    // stats files from the report and build states
    for name in [
        "DemultiplexingStats.xml",
        "AlignmentStats.xml",
        "BuildStats.xml",
    ] {
        assert!(
            config.output_directory.join("Stats").join(name).exists(),
            "{} missing",
            name
        );
    }

    let out = output_path(&config);
    assert!(out.exists());
    assert!(out.with_extension("gz.idx").exists());
    assert!(out.with_extension("gz.md5").exists());

    let lines = decode_output(&out);
    assert!(lines[0].starts_with("@HD\tVN:1.6\tSO:coordinate"));
    assert!(lines.iter().any(|l| l.starts_with("@SQ\tSN:chr1\tLN:2000")));
    assert!(lines.iter().any(|l| l.starts_with("@RG")));
    assert!(lines.iter().any(|l| l.starts_with("@PG") && l.contains("sortalign")));

    let records = parse_records(&lines);
    // 21 aligned pairs + 1 all-N pair
    assert_eq!(records.len(), 44);

    // invariant 4: mapped records are sorted; unmapped trail the file
    let mapped: Vec<&SamRecord> = records.iter().filter(|r| r.flags & 0x4 == 0).collect();
    assert_eq!(mapped.len(), 42);
    for window in mapped.windows(2) {
        assert!(window[0].pos <= window[1].pos, "output not position-sorted");
    }
    let first_unmapped = records.iter().position(|r| r.flags & 0x4 != 0).unwrap();
    assert!(
        records[first_unmapped..].iter().all(|r| r.flags & 0x4 != 0),
        "unmapped records must be at the back"
    );

    // proper pairs keep the flag and a MAPQ within contract
    for record in &mapped {
        assert_eq!(record.rname, "chr1");
        assert!(record.mapq <= 60 || record.mapq == 255);
    }
    assert!(mapped.iter().filter(|r| r.flags & 0x2 != 0).count() >= 40);

    // the duplicated pair is flagged, the higher-quality copy is not
    let duplicates = records.iter().filter(|r| r.flags & 0x400 != 0).count();
    assert_eq!(duplicates, 2);

    // invariant 5: re-binning the decoded records reproduces their bin
    let reference = sortalign::reference::Reference::load(&config.reference_metadata, &config).unwrap();
    let grid = sortalign::bins::BinGrid::new(
        &reference.contigs,
        config.target_bin_length(READ_LEN),
        &config.temp_directory,
        config.put_unaligned_in_the_back,
    );
    for record in &mapped {
        let position = (record.pos - 1) as u32;
        let probe = probe_record(position);
        let bin = &grid.bins()[grid.bin_for(&probe)];
        assert!(bin.contains(0, position));
    }
}

fn probe_record(position: u32) -> sortalign::bins::BinRecord {
    sortalign::bins::BinRecord {
        cluster_id: 0,
        barcode: 0,
        read_index: 0,
        flags: 0,
        contig: 0,
        position,
        mapq: 60,
        cigar: Vec::new(),
        sequence: Vec::new(),
        quality: Vec::new(),
        mate_contig: -1,
        mate_position: 0,
        template_length: 0,
        alignment_score: 0,
        template_score: 0,
        mismatches: 0,
        log_probability: 0.0,
        original_cigar: None,
        x: 0,
        y: 0,
    }
}

#[test]
fn identical_runs_are_byte_identical() {
    // invariant 7: same inputs, same thread count -> identical bytes
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let config_a = standard_workspace(dir_a.path());
    let config_b = standard_workspace(dir_b.path());

    AlignWorkflow::new(config_a.clone()).unwrap().run().unwrap();
    AlignWorkflow::new(config_b.clone()).unwrap().run().unwrap();

    let bytes_a = std::fs::read(output_path(&config_a)).unwrap();
    let bytes_b = std::fs::read(output_path(&config_b)).unwrap();
    assert_eq!(bytes_a, bytes_b);
}

#[test]
fn learned_tls_matches_the_simulated_insert() {
    // no user TLS: the distribution is learned from the first pairs
    let dir = TempDir::new().unwrap();
    let genome = synthetic_genome(4000, 131);
    let reference = write_reference(dir.path(), &[("chr1", genome.clone())], SEED, 1000);
    let mut clusters = Vec::new();
    for pair in 0..40usize {
        clusters.push(paired_reads(&genome, 50 + pair * 90, 35));
    }
    let tile = write_tile(&dir.path().join("t1.tile"), 1, &clusters);
    let mut config = base_config(dir.path(), vec![tile], reference);
    config.tls_sample_pairs = 30;
    config.target_bin_size = 16 << 10;

    let mut workflow = AlignWorkflow::new(config.clone()).unwrap();
    workflow.run().unwrap();

    let lines = decode_output(&output_path(&config));
    let records = parse_records(&lines);
    let proper = records.iter().filter(|r| r.flags & 0x2 != 0).count();
    assert!(
        proper >= 70,
        "expected most of the 80 records proper-paired, got {}",
        proper
    );
}

#[test]
fn workflow_resumes_from_the_persisted_state() {
    let dir = TempDir::new().unwrap();
    let config = standard_workspace(dir.path());

    {
        let mut workflow = AlignWorkflow::new(config.clone()).unwrap();
        assert_eq!(workflow.step().unwrap(), WorkflowState::Aligned);
    }

    // a fresh process picks up after the align state
    let mut resumed = AlignWorkflow::new(config.clone()).unwrap();
    assert_eq!(resumed.state(), WorkflowState::Aligned);
    resumed.run().unwrap();
    assert_eq!(resumed.state(), WorkflowState::Done);
    assert!(output_path(&config).exists());
}

#[test]
fn rewind_replays_later_states_but_never_skips_forward() {
    let dir = TempDir::new().unwrap();
    let config = standard_workspace(dir.path());
    let mut workflow = AlignWorkflow::new(config.clone()).unwrap();
    workflow.run().unwrap();

    let before = std::fs::read(output_path(&config)).unwrap();
    workflow.rewind(WorkflowState::Reported).unwrap();
    assert_eq!(workflow.state(), WorkflowState::Reported);
    workflow.run().unwrap();
    let after = std::fs::read(output_path(&config)).unwrap();
    assert_eq!(before, after, "replayed build must reproduce the output");

    assert!(workflow.rewind(WorkflowState::Done).is_err() || workflow.state() == WorkflowState::Done);
    let mut fresh = AlignWorkflow::new(config).unwrap();
    // fresh is Done via the persisted marker; rewinding forward is illegal
    assert_eq!(fresh.state(), WorkflowState::Done);
    fresh.rewind(WorkflowState::Start).unwrap();
    assert_eq!(fresh.state(), WorkflowState::Start);
}

#[test]
fn missing_reference_is_a_precondition_failure() {
    let dir = TempDir::new().unwrap();
    let tile = write_tile(
        &dir.path().join("t1.tile"),
        1,
        &[vec![read_with_quality(b"ACGTACGTACGTACGTACGT", 30)]],
    );
    let config = base_config(dir.path(), vec![tile], dir.path().join("absent.txt"));
    match AlignWorkflow::new(config) {
        Err(e) => assert_eq!(e.exit_code(), 2),
        Ok(_) => panic!("expected a precondition failure"),
    }
}
