use std::path::{Path, PathBuf};

use anyhow::Result;
use fnv::FnvHashMap;
use rayon::prelude::*;

use crate::{
    config::Settings,
    depth::GcDepthTable,
    error::RunError,
    kmer::{canonical_pack, shares_canonical_core, CanonicalScanner},
    record::KmerTable,
    utils::spinner,
};

/// Reads per parallel batch; bounds memory while keeping workers busy.
const BATCH_SIZE: usize = 8192;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Hits {
    /// Flank-verified occurrences.
    pub count: u32,
    /// Raw occurrences.
    pub total: u32,
}

struct Target {
    /// Union of masks over the k-mer's retained loci; empty means every
    /// occurrence counts.
    masks: Vec<String>,
}

/// Dense lookup from packed canonical k-mer to a hit slot. One `Vec<Hits>`
/// shard per worker, merged on reduce; the shared part is read-only.
pub struct KmerCounter {
    k: usize,
    lookup: FnvHashMap<u64, usize>,
    targets: Vec<Target>,
}

impl KmerCounter {
    pub fn from_table(k: usize, table: &KmerTable) -> Self {
        let mut lookup = FnvHashMap::default();
        let mut targets = Vec::with_capacity(table.len());
        for record in table.values() {
            let Some(packed) = canonical_pack(record.seq.as_bytes()) else {
                continue;
            };
            let masks = record
                .loci
                .values()
                .flat_map(|locus| locus.masks().map(str::to_owned))
                .collect();
            lookup.insert(packed, targets.len());
            targets.push(Target { masks });
        }
        Self { k, lookup, targets }
    }

    /// Counter over bare k-mers with no flank restrictions (depth markers).
    pub fn from_packed(k: usize, kmers: impl IntoIterator<Item = u64>) -> Self {
        let mut lookup = FnvHashMap::default();
        let mut targets = Vec::new();
        for packed in kmers {
            lookup.entry(packed).or_insert_with(|| {
                targets.push(Target { masks: Vec::new() });
                targets.len() - 1
            });
        }
        Self { k, lookup, targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn empty_shard(&self) -> Vec<Hits> {
        vec![Hits::default(); self.targets.len()]
    }

    /// Count one read into a shard. Windows starting before `skip` belong to
    /// the mate's half of an overlapping fragment and are not counted.
    pub fn process_read(&self, seq: &[u8], skip: usize, shard: &mut [Hits]) {
        for (offset, packed) in CanonicalScanner::new(seq, self.k) {
            if offset < skip {
                continue;
            }
            let Some(&slot) = self.lookup.get(&packed) else {
                continue;
            };
            shard[slot].total += 1;
            if self.verify_flanks(&self.targets[slot], seq, offset) {
                shard[slot].count += 1;
            }
        }
    }

    /// An occurrence is credited only when one of the stored locus masks is
    /// found in the read context flanking it; occurrences from unmodeled
    /// loci inflate `total` alone.
    fn verify_flanks(&self, target: &Target, seq: &[u8], offset: usize) -> bool {
        if target.masks.is_empty() {
            return true;
        }
        let left = &seq[offset.saturating_sub(self.k)..offset];
        let right = &seq[(offset + self.k).min(seq.len())..(offset + 2 * self.k).min(seq.len())];
        let left = String::from_utf8_lossy(left);
        let right = String::from_utf8_lossy(right);
        target
            .masks
            .iter()
            .any(|mask| shares_canonical_core(mask, &left) || shares_canonical_core(mask, &right))
    }

    pub fn merge(&self, mut shards: Vec<Vec<Hits>>) -> Vec<Hits> {
        let mut merged = shards.pop().unwrap_or_else(|| self.empty_shard());
        for shard in shards {
            for (slot, hits) in shard.into_iter().enumerate() {
                merged[slot].count += hits.count;
                merged[slot].total += hits.total;
            }
        }
        merged
    }

    pub fn slot(&self, seq: &[u8]) -> Option<usize> {
        canonical_pack(seq).and_then(|packed| self.slot_packed(packed))
    }

    pub fn slot_packed(&self, packed: u64) -> Option<usize> {
        self.lookup.get(&packed).copied()
    }
}

/// Outcome of one streaming pass: merged hit table plus the number of
/// unparseable records that were skipped.
pub struct CountSummary {
    pub hits: Vec<Hits>,
    pub skipped: u64,
}

/// Single streaming pass over the read set, sharded over workers with no
/// shared mutable state.
pub struct CountOptions<'a> {
    settings: &'a Settings,
    progress: bool,
}

impl<'a> CountOptions<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            progress: false,
        }
    }

    pub fn progress(&mut self, progress: bool) -> &mut Self {
        self.progress = progress;
        self
    }

    pub fn run(&self, counter: &KmerCounter) -> Result<CountSummary> {
        if let Some(bam) = &self.settings.bam {
            self.count_bam(counter, bam)
        } else if !self.settings.fastq.is_empty() {
            self.count_fastq(counter, &self.settings.fastq)
        } else {
            Err(RunError::Input("no read set: provide --bam or --fastq".to_string()).into())
        }
    }

    pub fn count_fastq(&self, counter: &KmerCounter, paths: &[PathBuf]) -> Result<CountSummary> {
        let mut shards: Vec<Vec<Hits>> = Vec::new();
        let mut skipped = 0u64;
        let pb = spinner("reads counted", self.progress);
        for path in paths {
            let reader = bio::io::fastq::Reader::from_file(path)
                .map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
            let mut records = reader.records();
            loop {
                let mut batch: Vec<(Vec<u8>, usize)> = Vec::with_capacity(BATCH_SIZE);
                let mut drained = 0usize;
                for record in records.by_ref().take(BATCH_SIZE) {
                    drained += 1;
                    match record {
                        Ok(record) => batch.push((record.seq().to_vec(), 0)),
                        Err(e) => {
                            log::warn!("{}: skipping unreadable record: {e}", path.display());
                            skipped += 1;
                        }
                    }
                }
                if !batch.is_empty() {
                    pb.inc(batch.len() as u64);
                    shards.push(self.count_batch(counter, &batch));
                }
                if drained < BATCH_SIZE {
                    break;
                }
            }
        }
        pb.finish_and_clear();
        Ok(CountSummary {
            hits: counter.merge(shards),
            skipped,
        })
    }

    pub fn count_bam<P: AsRef<Path>>(
        &self,
        counter: &KmerCounter,
        path: P,
    ) -> Result<CountSummary> {
        let path = path.as_ref();
        let reader = bam::BamReader::from_path(path, 0)
            .map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
        let mut shards: Vec<Vec<Hits>> = Vec::new();
        let mut skipped = 0u64;
        let pb = spinner("reads counted", self.progress);
        let mut records = reader.into_iter();
        loop {
            // (sequence, windows to skip at the overlapped fragment start)
            let mut batch: Vec<(Vec<u8>, usize)> = Vec::with_capacity(BATCH_SIZE);
            let mut drained = 0usize;
            for record in records.by_ref().take(BATCH_SIZE) {
                drained += 1;
                match record {
                    Ok(record) => {
                        if record.flag().is_secondary() || record.flag().is_supplementary() {
                            continue;
                        }
                        let seq = record.sequence().to_vec();
                        if seq.is_empty() {
                            continue;
                        }
                        let skip = pair_overlap_skip(&record, seq.len());
                        batch.push((seq, skip));
                    }
                    Err(e) => {
                        log::warn!("{}: skipping unreadable record: {e}", path.display());
                        skipped += 1;
                    }
                }
            }
            if !batch.is_empty() {
                pb.inc(batch.len() as u64);
                shards.push(self.count_batch(counter, &batch));
            }
            if drained < BATCH_SIZE {
                break;
            }
        }
        pb.finish_and_clear();
        Ok(CountSummary {
            hits: counter.merge(shards),
            skipped,
        })
    }

    fn count_batch(&self, counter: &KmerCounter, batch: &[(Vec<u8>, usize)]) -> Vec<Hits> {
        let chunk = (batch.len() / self.settings.threads.max(1)).max(1);
        batch
            .par_chunks(chunk)
            .map(|reads| {
                let mut shard = counter.empty_shard();
                for (seq, skip) in reads {
                    counter.process_read(seq, *skip, &mut shard);
                }
                shard
            })
            .reduce(
                || counter.empty_shard(),
                |mut a, b| {
                    for (slot, hits) in b.into_iter().enumerate() {
                        a[slot].count += hits.count;
                        a[slot].total += hits.total;
                    }
                    a
                },
            )
    }

    /// Write merged hits and GC-adjusted coverage back onto the table.
    pub fn annotate(
        &self,
        table: &mut KmerTable,
        counter: &KmerCounter,
        summary: &CountSummary,
        gc: &GcDepthTable,
    ) {
        // the simulation convention reads two shards per worker; merged
        // counts are halved to stay compatible with the historical output
        let divisor = if self.settings.simulation { 2 } else { 1 };
        for record in table.values_mut() {
            if let Some(slot) = counter.slot(record.seq.as_bytes()) {
                record.count = summary.hits[slot].count / divisor;
                record.total = summary.hits[slot].total / divisor;
            }
            let buckets: Vec<f64> = record
                .loci
                .values()
                .map(|locus| gc.lookup(locus.gc))
                .collect();
            record.coverage = if buckets.is_empty() {
                gc.fallback()
            } else {
                buckets.iter().sum::<f64>() / buckets.len() as f64
            };
        }
        if summary.skipped > 0 {
            log::warn!("skipped {} unreadable reads during counting", summary.skipped);
        }
    }
}

/// Approximate number of leading bases of this read that its leftward mate
/// already covers. Keeps physically overlapping fragments from counting the
/// same molecule twice; the rightmost mate cedes the overlap.
fn pair_overlap_skip(record: &bam::Record, read_len: usize) -> usize {
    let flag = record.flag();
    if !flag.is_paired() || !flag.is_mapped() || !flag.mate_is_mapped() {
        return 0;
    }
    if record.ref_id() != record.mate_ref_id() {
        return 0;
    }
    let start = i64::from(record.start());
    let mate_start = i64::from(record.mate_start());
    // the leftmost mate keeps the overlap; ties go to the first in pair
    if start < mate_start || (start == mate_start && flag.first_in_pair()) {
        return 0;
    }
    let mate_end = mate_start + read_len as i64;
    (mate_end - start).clamp(0, read_len as i64) as usize
}
