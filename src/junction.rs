use std::path::Path;

use anyhow::Result;
use bio::alignment::distance::levenshtein;

use crate::{
    config::Settings,
    error::RunError,
    genome::Genome,
    kmer::{canonical_string, gc_bucket},
    record::{KmerRecord, KmerTable, Locus, Source, JUNCTION_PREFIX},
    track::{SvType, Track},
};

/// A classified window must overlap its CIGAR span by at least this much.
const MIN_SPAN_OVERLAP: usize = 10;
/// Clipped windows matching the reference continuation within this many
/// edits are reference sequence, not junction evidence.
const MAX_CLIP_EDITS: u32 = 3;
/// Tracks shorter than this cannot be told apart from alignment noise.
const MIN_SVLEN: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Match,
    Soft,
    Ins,
    Del,
    Other,
}

/// The slice of an alignment the extractor needs; BAM records are converted
/// into this before classification so the walk is testable on its own.
#[derive(Debug, Clone)]
pub struct ReadAlignment {
    pub qname: String,
    pub query: Vec<u8>,
    pub reference_start: i64,
    pub reference_end: i64,
    pub cigar: Vec<(u32, Op)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

fn overlap(a: (usize, usize), b: Span) -> usize {
    let lo = a.0.max(b.start);
    let hi = a.1.min(b.end);
    hi.saturating_sub(lo)
}

/// Extracts junction k-mers by walking soft-clipped and indel-bearing
/// alignments near the breakpoints of each track.
pub struct JunctionExtractOptions<'a> {
    settings: &'a Settings,
    genome: &'a Genome,
}

impl<'a> JunctionExtractOptions<'a> {
    pub fn new(settings: &'a Settings, genome: &'a Genome) -> Self {
        Self { settings, genome }
    }

    pub fn run<P: AsRef<Path>>(&self, tracks: &[Track], bam_path: P) -> Result<KmerTable> {
        let path = bam_path.as_ref();
        let mut reader = bam::IndexedReader::from_path(path)
            .map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
        let mut table = KmerTable::new();
        let mut skipped_reads = 0u64;
        for track in tracks {
            let mut reads = Vec::new();
            for (begin, end) in self.fetch_windows(track) {
                let ref_id = match reader.header().reference_id(&track.chrom) {
                    Some(id) => id,
                    None => {
                        return Err(RunError::Input(format!(
                            "{}: chromosome {} not in BAM header",
                            path.display(),
                            track.chrom
                        ))
                        .into())
                    }
                };
                let region = bam::Region::new(ref_id, begin as u32, end as u32);
                for record in reader.fetch(&region)? {
                    let record = match record {
                        Ok(record) => record,
                        Err(e) => {
                            log::warn!("skipping unreadable record near {}: {e}", track.name());
                            skipped_reads += 1;
                            continue;
                        }
                    };
                    if !record.flag().is_mapped() || record.flag().is_secondary() {
                        continue;
                    }
                    let query = record.sequence().to_vec();
                    if query.is_empty() {
                        continue;
                    }
                    let cigar = record
                        .cigar()
                        .iter()
                        .map(|(len, op)| {
                            use bam::record::cigar::Operation;
                            let op = match op {
                                Operation::Soft => Op::Soft,
                                Operation::Insertion => Op::Ins,
                                Operation::Deletion => Op::Del,
                                Operation::AlnMatch | Operation::SeqMatch | Operation::SeqMismatch => {
                                    Op::Match
                                }
                                _ => Op::Other,
                            };
                            (len, op)
                        })
                        .collect();
                    reads.push(ReadAlignment {
                        qname: String::from_utf8_lossy(record.name()).into_owned(),
                        query,
                        reference_start: i64::from(record.start()),
                        reference_end: i64::from(record.calculate_end()),
                        cigar,
                    });
                }
            }
            let kmers = self.extract_track(track, &reads)?;
            if kmers.is_empty() {
                log::warn!("no junction kmers for {}", track.name());
            }
            for record in kmers {
                match table.get_mut(&record.seq) {
                    Some(existing) => existing.absorb(record),
                    None => {
                        table.insert(record.seq.clone(), record);
                    }
                }
            }
        }
        if skipped_reads > 0 {
            log::warn!("skipped {skipped_reads} unreadable BAM records");
        }
        log::info!("Extracted {} junction kmers", table.len());
        Ok(table)
    }

    fn fetch_windows(&self, track: &Track) -> Vec<(u64, u64)> {
        let slack = self.settings.read_length as u64;
        let begin = (track.begin.saturating_sub(slack), track.begin + slack);
        match track.svtype {
            SvType::Del | SvType::Inv => {
                vec![begin, (track.end.saturating_sub(slack), track.end + slack)]
            }
            SvType::Ins | SvType::Mei => vec![begin],
        }
    }

    /// Walk every candidate read of one track and keep the windows that
    /// survive classification and clip verification.
    pub fn extract_track(&self, track: &Track, reads: &[ReadAlignment]) -> Result<Vec<KmerRecord>> {
        if track.abs_svlen() < MIN_SVLEN {
            return Ok(Vec::new());
        }
        let k = self.settings.ksize;
        let mut kmers = KmerTable::new();
        for read in reads {
            let Some(classified) = classify_cigar(read, track.abs_svlen()) else {
                continue;
            };
            for i in 0..read.query.len().saturating_sub(k - 1) {
                let window = &read.query[i..i + k];
                if window.contains(&b'N') {
                    continue;
                }
                let Some(source) = self.classify_window(track, read, &classified, (i, i + k)) else {
                    continue;
                };
                let seq = canonical_string(std::str::from_utf8(window)?);
                let entry = kmers.entry(seq.clone()).or_insert_with(|| {
                    let mut record = KmerRecord::new(seq, source);
                    let left =
                        (i >= k).then(|| String::from_utf8_lossy(&read.query[i - k..i]).into_owned());
                    let right = (i + 2 * k <= read.query.len())
                        .then(|| String::from_utf8_lossy(&read.query[i + k..i + 2 * k]).into_owned());
                    let gc = gc_bucket(
                        &read.query[i.saturating_sub(k)..read.query.len().min(i + 2 * k)],
                    );
                    record.loci.insert(
                        format!("{JUNCTION_PREFIX}{}", track.name()),
                        Locus::synthetic(left, right, gc),
                    );
                    record.tracks.insert(track.name(), 1);
                    record.read = Some(crate::record::ReadAnchor {
                        start: read.reference_start.max(0) as u64,
                        end: read.reference_end.max(0) as u64,
                        qname: read.qname.clone(),
                    });
                    record
                });
                // support tally rides in `count` until the threshold check
                entry.count += 1;
            }
        }

        let threshold = 3.0_f64.max(self.settings.diploid_coverage() / 4.0);
        let mut records: Vec<KmerRecord> = kmers
            .into_values()
            .filter(|record| f64::from(record.count) >= threshold)
            .map(|mut record| {
                record.count = 0;
                record
            })
            .collect();
        records.sort_by(|a, b| a.seq.cmp(&b.seq));
        Ok(records)
    }

    fn classify_window(
        &self,
        track: &Track,
        read: &ReadAlignment,
        classified: &ClassifiedRead,
        window: (usize, usize),
    ) -> Option<Source> {
        for (idx, clip) in classified.clips.iter().enumerate() {
            if overlap(window, *clip) < MIN_SPAN_OVERLAP {
                continue;
            }
            let leading = idx == 0 && classified.left_clipped;
            if self.clip_matches_reference(track, read, *clip, window, leading) {
                // the aligner clipped reference sequence; not a junction
                return None;
            }
            return Some(Source::Junction);
        }
        for span in &classified.deletions {
            if overlap(window, *span) >= MIN_SPAN_OVERLAP {
                return Some(Source::Deletion);
            }
        }
        for span in &classified.insertions {
            if overlap(window, *span) >= MIN_SPAN_OVERLAP {
                return Some(Source::Insertion);
            }
        }
        None
    }

    /// Re-align the clipped window against the implied reference
    /// continuation. A match within MAX_CLIP_EDITS means the clip was
    /// reference sequence after all.
    fn clip_matches_reference(
        &self,
        track: &Track,
        read: &ReadAlignment,
        clip: Span,
        window: (usize, usize),
        leading: bool,
    ) -> bool {
        let k = self.settings.ksize as i64;
        let window_seq = &read.query[window.0..window.1];
        let ref_seq = if leading {
            let ref_index = read.reference_start - (clip.end as i64 - window.0 as i64);
            self.genome
                .window(&track.chrom, ref_index, ref_index + k)
                .unwrap_or(&[])
        } else {
            let ref_index = read.reference_end + (window.1 as i64 - clip.start as i64);
            self.genome
                .window(&track.chrom, ref_index - k, ref_index)
                .unwrap_or(&[])
        };
        if ref_seq.len() < window_seq.len() {
            return false;
        }
        levenshtein(window_seq, ref_seq) <= MAX_CLIP_EDITS
    }
}

#[derive(Debug, Default)]
struct ClassifiedRead {
    clips: Vec<Span>,
    deletions: Vec<Span>,
    insertions: Vec<Span>,
    left_clipped: bool,
}

/// Classify a read's CIGAR into candidate spans. Returns None for reads
/// whose entire query aligned (nothing to learn from them). The cursor
/// advances by every operation's length, the span convention the counting
/// side of the pipeline was built against.
fn classify_cigar(read: &ReadAlignment, svlen: u64) -> Option<ClassifiedRead> {
    let lo = (svlen as f64 * 0.9) as u32;
    let hi = (svlen as f64 * 1.1).ceil() as u32;
    let mut classified = ClassifiedRead::default();
    let mut offset = 0usize;
    for (idx, &(len, op)) in read.cigar.iter().enumerate() {
        let span = Span {
            start: offset,
            end: offset + len as usize,
        };
        match op {
            Op::Soft => {
                if idx == 0 {
                    classified.left_clipped = true;
                }
                classified.clips.push(span);
            }
            Op::Del if len >= lo && len <= hi => classified.deletions.push(span),
            Op::Ins if len >= lo && len <= hi => classified.insertions.push(span),
            _ => {}
        }
        offset += len as usize;
    }
    if classified.clips.is_empty()
        && classified.deletions.is_empty()
        && classified.insertions.is_empty()
    {
        return None;
    }
    Some(classified)
}
