use anyhow::Result;
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};

use crate::{
    config::Settings,
    counter::{CountOptions, KmerCounter},
    counts::KmerIndex,
    genome::Genome,
    kmer::{gc_bucket, CanonicalScanner},
};

/// Reference windows feeding the GC estimate.
const GC_WINDOW: usize = 200;
/// Unique marker k-mers sampled per GC bucket.
const MARKERS_PER_BUCKET: usize = 256;

/// Expected diploid depth per GC percentage bucket, estimated once per
/// sample and consumed by the counting stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcDepthTable {
    depth: Vec<f64>,
    mean: f64,
    std: f64,
}

impl GcDepthTable {
    pub fn uniform(depth: f64) -> Self {
        Self {
            depth: vec![depth; 101],
            mean: depth,
            std: 0.0,
        }
    }

    pub fn lookup(&self, gc: u8) -> f64 {
        self.depth[usize::from(gc).min(100)]
    }

    pub fn fallback(&self) -> f64 {
        self.mean
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std(&self) -> f64 {
        self.std
    }
}

/// Estimates the GC→depth table: samples k-mers that are unique in the
/// reference from 200-bp windows, counts them in the read set, and averages
/// per 1 % GC bucket. The configured coverage is only the starting point;
/// buckets with no markers fall back to the global estimate.
pub struct DepthEstimateOptions<'a> {
    settings: &'a Settings,
    genome: &'a Genome,
}

impl<'a> DepthEstimateOptions<'a> {
    pub fn new(settings: &'a Settings, genome: &'a Genome) -> Self {
        Self { settings, genome }
    }

    pub fn run(&self, index: &KmerIndex) -> Result<GcDepthTable> {
        let markers = self.sample_markers(index);
        let total: usize = markers.iter().map(Vec::len).sum();
        log::info!("Counting {total} GC depth markers");
        if total == 0 {
            log::warn!("no unique markers found; GC table falls back to configured coverage");
            return Ok(GcDepthTable::uniform(self.settings.diploid_coverage()));
        }

        let counter = KmerCounter::from_packed(
            self.settings.ksize,
            markers.iter().flatten().copied(),
        );
        let summary = CountOptions::new(self.settings).run(&counter)?;
        let divisor = if self.settings.simulation { 2 } else { 1 };

        let mut all_counts = Vec::with_capacity(total);
        let mut buckets = vec![Vec::new(); 101];
        for (gc, bucket_markers) in markers.iter().enumerate() {
            for packed in bucket_markers {
                let slot = counter
                    .slot_packed(*packed)
                    .expect("marker registered above");
                let count = f64::from(summary.hits[slot].count / divisor);
                buckets[gc].push(count);
                all_counts.push(count);
            }
        }

        let (mean, std) = trimmed_moments(&mut all_counts);
        let mean = if mean > 0.0 {
            mean
        } else {
            self.settings.diploid_coverage()
        };
        log::info!("estimated depth {mean:.2} (std {std:.2})");

        let depth = buckets
            .into_iter()
            .map(|counts| {
                if counts.is_empty() {
                    mean
                } else {
                    counts.iter().sum::<f64>() / counts.len() as f64
                }
            })
            .collect();
        Ok(GcDepthTable { depth, mean, std })
    }

    /// Per GC bucket, up to MARKERS_PER_BUCKET k-mers unique in the
    /// reference, drawn from 200-bp windows of that bucket.
    fn sample_markers(&self, index: &KmerIndex) -> Vec<Vec<u64>> {
        let k = self.settings.ksize;
        let mut buckets: Vec<Vec<u64>> = vec![Vec::new(); 101];
        let mut seen = FnvHashSet::default();
        for chrom in self.genome.names() {
            let seq = self.genome.chrom(chrom).expect("names() yields loaded chroms");
            for window in seq.chunks(GC_WINDOW) {
                if window.len() < GC_WINDOW {
                    continue;
                }
                let bucket = &mut buckets[usize::from(gc_bucket(window))];
                if bucket.len() >= MARKERS_PER_BUCKET {
                    continue;
                }
                for (_, packed) in CanonicalScanner::new(window, k) {
                    if index.count_packed(packed) == 1 && seen.insert(packed) {
                        bucket.push(packed);
                        break;
                    }
                }
            }
        }
        buckets
    }
}

/// Mean and standard deviation with the original's two outlier-trimming
/// rounds (3x then 2x the running mean).
fn trimmed_moments(counts: &mut Vec<f64>) -> (f64, f64) {
    for factor in [3.0, 2.0] {
        let mean = mean_of(counts);
        counts.retain(|&c| c < factor * mean || mean == 0.0);
    }
    let mean = mean_of(counts);
    let var = if counts.len() > 1 {
        counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (counts.len() - 1) as f64
    } else {
        0.0
    };
    (mean, var.sqrt())
}

fn mean_of(counts: &[f64]) -> f64 {
    if counts.is_empty() {
        return 0.0;
    }
    counts.iter().sum::<f64>() / counts.len() as f64
}
