use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use anyhow::Result;
use fnv::FnvHashMap;

use crate::{
    error::RunError,
    genome::Genome,
    kmer::{canonical_pack, CanonicalScanner},
};

const MAGIC: &[u8; 8] = b"KIVARIDX";

/// Whole-reference canonical k-mer counts. The raw index is an external
/// collaborator; this trait is the seam the extractors consume.
pub trait KmerCounts: Sync {
    fn k(&self) -> usize;
    fn count(&self, kmer: &[u8]) -> u32;
}

/// Count table over packed canonical k-mers, binary-searchable and loadable
/// from a binary sidecar of sorted `(u64 kmer, u32 count)` pairs.
pub struct KmerIndex {
    k: usize,
    entries: Vec<(u64, u32)>,
}

impl KmerIndex {
    /// Build the table by scanning a genome. Used in tests and as the
    /// fallback when no sidecar index was supplied.
    pub fn from_genome(genome: &Genome, k: usize) -> Self {
        let mut counts: FnvHashMap<u64, u32> = FnvHashMap::default();
        for name in genome.names() {
            let seq = genome.chrom(name).expect("names() yields loaded chroms");
            for (_, packed) in CanonicalScanner::new(seq, k) {
                *counts.entry(packed).or_insert(0) += 1;
            }
        }
        let mut entries: Vec<(u64, u32)> = counts.into_iter().collect();
        entries.sort_unstable_by_key(|&(kmer, _)| kmer);
        log::info!("Indexed {} distinct {k}-mers", entries.len());
        Self { k, entries }
    }

    pub fn load<P: AsRef<Path>>(path: P, expected_k: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = BufReader::new(
            File::open(path).map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?,
        );
        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
        if &magic != MAGIC {
            return Err(RunError::Input(format!("{}: not a k-mer index", path.display())).into());
        }
        let mut word = [0u8; 4];
        reader.read_exact(&mut word)?;
        let k = u32::from_le_bytes(word) as usize;
        if k != expected_k {
            return Err(RunError::Input(format!(
                "{}: index built with k={k}, run configured with k={expected_k}",
                path.display()
            ))
            .into());
        }
        let mut len = [0u8; 8];
        reader.read_exact(&mut len)?;
        let n = u64::from_le_bytes(len) as usize;
        let mut entries = Vec::with_capacity(n);
        let mut pair = [0u8; 12];
        for _ in 0..n {
            reader
                .read_exact(&mut pair)
                .map_err(|e| RunError::Input(format!("{}: truncated index: {e}", path.display())))?;
            let kmer = u64::from_le_bytes(pair[..8].try_into().unwrap());
            let count = u32::from_le_bytes(pair[8..].try_into().unwrap());
            entries.push((kmer, count));
        }
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(RunError::Input(format!("{}: index not sorted", path.display())).into());
        }
        Ok(Self { k, entries })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&(self.k as u32).to_le_bytes())?;
        writer.write_all(&(self.entries.len() as u64).to_le_bytes())?;
        for &(kmer, count) in &self.entries {
            writer.write_all(&kmer.to_le_bytes())?;
            writer.write_all(&count.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn count_packed(&self, packed: u64) -> u32 {
        match self.entries.binary_search_by_key(&packed, |&(kmer, _)| kmer) {
            Ok(idx) => self.entries[idx].1,
            Err(_) => 0,
        }
    }
}

impl KmerCounts for KmerIndex {
    fn k(&self) -> usize {
        self.k
    }

    fn count(&self, kmer: &[u8]) -> u32 {
        match canonical_pack(kmer) {
            Some(packed) => self.count_packed(packed),
            None => 0,
        }
    }
}
