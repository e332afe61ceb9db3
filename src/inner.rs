use std::collections::BTreeMap;

use anyhow::Result;
use rayon::prelude::*;

use crate::{
    config::Settings,
    counts::KmerCounts,
    genome::Genome,
    kmer::{canonical_string, gc_bucket},
    record::{KmerRecord, KmerTable, Locus, Source, INSIDE_PREFIX},
    track::{SvType, Track},
};

/// Per-track candidate cap; the lowest-reference-count k-mers are kept.
const MAX_INNER_KMERS: usize = 1000;
/// Candidates seen more often than this in the reference are unusable.
const MAX_REFERENCE_COPIES: u32 = 10;
/// Tracks longer than this are skipped outright.
const MAX_TRACK_SPAN: u64 = 1_000_000;

/// Extracts inner k-mers: sequence that exists only when the SV is absent
/// (deletions) or only when it is present (insertions).
pub struct InnerExtractOptions<'a> {
    settings: &'a Settings,
    genome: &'a Genome,
}

impl<'a> InnerExtractOptions<'a> {
    pub fn new(settings: &'a Settings, genome: &'a Genome) -> Self {
        Self { settings, genome }
    }

    pub fn run<C: KmerCounts>(&self, tracks: &[Track], counts: &C) -> Result<KmerTable> {
        let per_track: Vec<Vec<KmerRecord>> = tracks
            .par_iter()
            .map(|track| self.extract_track(track, counts))
            .collect::<Result<_>>()?;

        let mut table = KmerTable::new();
        for records in per_track {
            for record in records {
                match table.get_mut(&record.seq) {
                    Some(existing) => existing.absorb(record),
                    None => {
                        table.insert(record.seq.clone(), record);
                    }
                }
            }
        }
        log::info!("Extracted {} inner kmers from {} tracks", table.len(), tracks.len());
        Ok(table)
    }

    fn extract_track<C: KmerCounts>(&self, track: &Track, counts: &C) -> Result<Vec<KmerRecord>> {
        if track.span() > MAX_TRACK_SPAN {
            log::warn!("skipping {}: span over {MAX_TRACK_SPAN} bp", track.name());
            return Ok(Vec::new());
        }
        let candidates = match track.svtype {
            SvType::Del => self.deletion_kmers(track)?,
            SvType::Ins | SvType::Mei => self.insertion_kmers(track)?,
            // inverted sequence keeps its content; inversions are junction-only
            SvType::Inv => Vec::new(),
        };
        if candidates.is_empty() {
            if track.svtype != SvType::Inv {
                log::warn!("no inner kmers for {}", track.name());
            }
            return Ok(Vec::new());
        }

        let mut merged: BTreeMap<String, KmerRecord> = BTreeMap::new();
        for mut record in candidates {
            record.reference = counts.count(record.seq.as_bytes());
            record.tracks.insert(track.name(), 1);
            match merged.get_mut(&record.seq) {
                Some(existing) => {
                    *existing.tracks.entry(track.name()).or_insert(0) += 1;
                    for (name, locus) in std::mem::take(&mut record.loci) {
                        existing.loci.entry(name).or_insert(locus);
                    }
                }
                None => {
                    merged.insert(record.seq.clone(), record);
                }
            }
        }

        let mut records: Vec<KmerRecord> = merged.into_values().collect();
        if records.len() > MAX_INNER_KMERS {
            records.sort_by(|a, b| {
                a.reference
                    .cmp(&b.reference)
                    .then_with(|| a.seq.cmp(&b.seq))
            });
            records.truncate(MAX_INNER_KMERS);
        }
        records.retain(|r| r.reference <= MAX_REFERENCE_COPIES);
        Ok(records)
    }

    /// Every k-mer whose window overlaps the deleted interval `[begin, end)`.
    fn deletion_kmers(&self, track: &Track) -> Result<Vec<KmerRecord>> {
        let k = self.settings.ksize as i64;
        let span = self.genome.window(
            &track.chrom,
            track.begin as i64 - k + 1,
            track.end as i64 + k - 1,
        )?;
        let mut records = Vec::new();
        for i in 0..span.len().saturating_sub(self.settings.ksize - 1) {
            let window = &span[i..i + self.settings.ksize];
            if window.contains(&b'N') {
                continue;
            }
            let seq = canonical_string(std::str::from_utf8(window)?);
            records.push(KmerRecord::new(seq, Source::Deletion));
        }
        Ok(records)
    }

    /// K-mers of the spliced alternate allele whose window touches the
    /// inserted sequence, each with a synthetic `inside_` locus carrying the
    /// flanks of the altered allele.
    fn insertion_kmers(&self, track: &Track) -> Result<Vec<KmerRecord>> {
        let k = self.settings.ksize;
        let inserted = match track.sequence.as_deref() {
            Some(s) => s.as_bytes().to_vec(),
            None => return Ok(Vec::new()),
        };
        let prefix = self
            .genome
            .window(&track.chrom, track.begin as i64 - k as i64, track.begin as i64)?;
        let suffix = self
            .genome
            .window(&track.chrom, track.end as i64, track.end as i64 + k as i64)?;
        let mut spliced = Vec::with_capacity(prefix.len() + inserted.len() + suffix.len());
        spliced.extend_from_slice(prefix);
        spliced.extend_from_slice(&inserted);
        spliced.extend_from_slice(suffix);

        let inserted_span = prefix.len()..prefix.len() + inserted.len();
        let locus_name = format!("{INSIDE_PREFIX}{}", track.name());
        let mut records = Vec::new();
        for i in 0..spliced.len().saturating_sub(k - 1) {
            // the window has to touch the inserted sequence
            if i + k <= inserted_span.start || i >= inserted_span.end {
                continue;
            }
            let window = &spliced[i..i + k];
            if window.contains(&b'N') {
                continue;
            }
            let seq = canonical_string(std::str::from_utf8(window)?);
            let left = (i >= k).then(|| String::from_utf8_lossy(&spliced[i - k..i]).into_owned());
            let right = (i + 2 * k <= spliced.len())
                .then(|| String::from_utf8_lossy(&spliced[i + k..i + 2 * k]).into_owned());
            let gc = gc_bucket(
                &spliced[i.saturating_sub(k)..spliced.len().min(i + 2 * k)],
            );
            let mut record = KmerRecord::new(seq, Source::Insertion);
            record
                .loci
                .insert(locus_name.clone(), Locus::synthetic(left, right, gc));
            records.push(record);
        }
        Ok(records)
    }
}
