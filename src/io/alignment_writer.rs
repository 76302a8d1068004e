//! Output writer: block-compressed SAM-compatible records concatenated
//! from processed bins, plus a positional index and an optional digest.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::alignment::cigar;
use crate::alignment::quality::{UNKNOWN_ALIGNMENT_SCORE, UNKNOWN_MAPQ};
use crate::bins::metadata::BinMetadata;
use crate::bins::record::BinRecord;
use crate::config::AlignConfig;
use crate::error::{AlignError, Result};
use crate::io::bgzf::BgzfWriter;
use crate::reference::ReferenceMetadata;

pub struct OutputSummary {
    pub path: PathBuf,
    pub index_path: PathBuf,
    pub md5: Option<String>,
    pub records: u64,
}

struct IndexEntry {
    contig: i32,
    start: u32,
    virtual_offset: u64,
}

pub struct AlignmentWriter<'a> {
    bgzf: BgzfWriter<BufWriter<File>>,
    path: PathBuf,
    config: &'a AlignConfig,
    metadata: &'a ReferenceMetadata,
    index: Vec<IndexEntry>,
    records: u64,
    line: String,
}

impl<'a> AlignmentWriter<'a> {
    pub fn create(
        path: &Path,
        config: &'a AlignConfig,
        metadata: &'a ReferenceMetadata,
    ) -> Result<AlignmentWriter<'a>> {
        let file = File::create(path).map_err(|e| AlignError::io(path, e))?;
        let bgzf = BgzfWriter::new(
            BufWriter::new(file),
            config.bam_gzip_level,
            config.bam_produce_md5,
        );
        let mut writer = AlignmentWriter {
            bgzf,
            path: path.to_path_buf(),
            config,
            metadata,
            index: Vec::new(),
            records: 0,
            line: String::with_capacity(512),
        };
        writer.write_header()?;
        Ok(writer)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = String::new();
        header.push_str("@HD\tVN:1.6\tSO:coordinate\n");
        for contig in &self.metadata.contigs {
            let _ = write!(header, "@SQ\tSN:{}\tLN:{}", contig.name, contig.total_bases);
            if let Some(m5) = &contig.bam_m5 {
                let _ = write!(header, "\tM5:{}", m5);
            }
            if let Some(assembly) = &contig.bam_sq_as {
                let _ = write!(header, "\tAS:{}", assembly);
            }
            if let Some(uri) = &contig.bam_sq_ur {
                let _ = write!(header, "\tUR:{}", uri);
            }
            header.push('\n');
        }
        for barcode in &self.config.barcodes {
            let _ = write!(
                header,
                "@RG\tID:{}\tSM:{}\tLB:{}\n",
                barcode.read_group_id, barcode.sample, barcode.library
            );
        }
        let _ = write!(
            header,
            "@PG\tID:sortalign\tPN:sortalign\tVN:{}\tCL:{}\n",
            env!("CARGO_PKG_VERSION"),
            self.config.command_line
        );
        self.bgzf.write_all(header.as_bytes())
    }

    /// Writes one processed bin. Records must already be in bin sort
    /// order; the bin's first record position becomes an index entry.
    pub fn write_bin(&mut self, bin: &BinMetadata, records: &[BinRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.index.push(IndexEntry {
            contig: bin.contig,
            start: bin.start,
            virtual_offset: self.bgzf.virtual_position(),
        });
        for record in records {
            self.write_record(record)?;
        }
        Ok(())
    }

    fn write_record(&mut self, record: &BinRecord) -> Result<()> {
        let barcode = &self.config.barcodes[record.barcode as usize];
        let tags = &self.config.include_tags;
        self.line.clear();
        let line = &mut self.line;

        // QNAME: tile and cluster index reproduce the instrument identity
        let _ = write!(
            line,
            "t{:04}:{}",
            record.cluster_id >> 32,
            record.cluster_id as u32
        );
        let _ = write!(line, "\t{}", record.flags);
        if record.is_unmapped() {
            if record.mate_contig >= 0 {
                // unmapped mate adopts its anchor's coordinates
                let mate = &self.metadata.contigs[record.mate_contig as usize];
                let _ = write!(line, "\t{}\t{}\t0\t*", mate.name, record.mate_position + 1);
            } else {
                let _ = write!(line, "\t*\t0\t0\t*");
            }
        } else {
            let contig = &self.metadata.contigs[record.contig as usize];
            let mapq = if record.mapq == UNKNOWN_MAPQ {
                255
            } else {
                record.mapq
            };
            let _ = write!(
                line,
                "\t{}\t{}\t{}\t{}",
                contig.name,
                record.position + 1,
                mapq,
                cigar::to_string(&record.cigar())
            );
        }

        // mate columns
        if record.mate_contig >= 0 {
            let mate_name = if record.mate_contig == record.contig && !record.is_unmapped() {
                "="
            } else {
                &self.metadata.contigs[record.mate_contig as usize].name
            };
            let _ = write!(
                line,
                "\t{}\t{}\t{}",
                mate_name,
                record.mate_position + 1,
                record.template_length
            );
        } else {
            let _ = write!(line, "\t*\t0\t0");
        }

        line.push('\t');
        line.push_str(std::str::from_utf8(&record.sequence).unwrap_or("*"));
        line.push('\t');
        for &quality in &record.quality {
            line.push((quality.min(60) + 33) as char);
        }

        if tags.alignment_score && record.template_score != UNKNOWN_ALIGNMENT_SCORE {
            let _ = write!(line, "\tAS:i:{}", record.template_score);
        }
        if tags.template_score && record.alignment_score != UNKNOWN_ALIGNMENT_SCORE {
            let _ = write!(line, "\tSM:i:{}", record.alignment_score);
        }
        if tags.edit_distance && !record.is_unmapped() {
            let gap_bases: u32 = record
                .cigar()
                .iter()
                .filter(|(op, _)| matches!(op, cigar::CigarOp::Insert | cigar::CigarOp::Delete))
                .map(|&(_, len)| len)
                .sum();
            let _ = write!(line, "\tNM:i:{}", record.mismatches + gap_bases);
        }
        if tags.original_cigar {
            if let Some(original) = &record.original_cigar {
                if let Some(original) = cigar::from_raw(original) {
                    let _ = write!(line, "\tOC:Z:{}", cigar::to_string(&original));
                }
            }
        }
        if tags.read_group {
            let _ = write!(line, "\tRG:Z:{}", barcode.read_group_id);
        }
        if tags.barcode {
            let _ = write!(line, "\tBC:Z:{}", barcode.name);
        }
        if tags.cluster_x {
            let _ = write!(line, "\tZX:i:{}", record.x);
        }
        if tags.cluster_y {
            let _ = write!(line, "\tZY:i:{}", record.y);
        }
        line.push('\n');

        self.records += 1;
        let line = std::mem::take(&mut self.line);
        let result = self.bgzf.write_all(line.as_bytes());
        self.line = line;
        result
    }

    /// Finalises the compressed stream, writes the index (and digest) next
    /// to it.
    pub fn finish(self) -> Result<OutputSummary> {
        let AlignmentWriter {
            bgzf,
            path,
            metadata,
            index,
            records,
            ..
        } = self;
        let md5 = bgzf.finish()?;

        let mut index_name = path.as_os_str().to_owned();
        index_name.push(".idx");
        let index_path = PathBuf::from(index_name);
        let index_file = File::create(&index_path).map_err(|e| AlignError::io(&index_path, e))?;
        let mut out = BufWriter::new(index_file);
        for entry in &index {
            let name = if entry.contig < 0 {
                "*"
            } else {
                metadata.contigs[entry.contig as usize].name.as_str()
            };
            writeln!(out, "{}\t{}\t{}", name, entry.start, entry.virtual_offset)
                .map_err(|e| AlignError::io(&index_path, e))?;
        }
        out.flush().map_err(|e| AlignError::io(&index_path, e))?;

        if let Some(md5) = &md5 {
            let mut md5_name = path.as_os_str().to_owned();
            md5_name.push(".md5");
            let md5_path = PathBuf::from(md5_name);
            std::fs::write(&md5_path, format!("{}\n", md5))
                .map_err(|e| AlignError::io(&md5_path, e))?;
        }

        Ok(OutputSummary {
            path,
            index_path,
            md5,
            records,
        })
    }
}
