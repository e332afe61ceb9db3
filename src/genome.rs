use std::path::Path;

use anyhow::Result;
use fnv::FnvHashMap;

use crate::error::RunError;

/// The reference genome, loaded whole and shared read-only between workers.
pub struct Genome {
    chroms: FnvHashMap<String, Vec<u8>>,
    order: Vec<String>,
}

impl Genome {
    pub fn from_fasta<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = bio::io::fasta::Reader::from_file(path)
            .map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
        let mut chroms = FnvHashMap::default();
        let mut order = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| RunError::Input(format!("{}: {e}", path.display())))?;
            let name = record.id().to_string();
            let seq = record.seq().to_ascii_uppercase();
            log::debug!("loaded {} ({} bp)", name, seq.len());
            order.push(name.clone());
            chroms.insert(name, seq);
        }
        if chroms.is_empty() {
            return Err(RunError::Input(format!("{}: empty FASTA", path.display())).into());
        }
        log::info!("Loaded {} chromosomes from {}", order.len(), path.display());
        Ok(Self { chroms, order })
    }

    pub fn from_records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        let mut chroms = FnvHashMap::default();
        let mut order = Vec::new();
        for (name, seq) in records {
            let name = name.into();
            order.push(name.clone());
            chroms.insert(name, seq.to_ascii_uppercase());
        }
        Self { chroms, order }
    }

    /// A missing chromosome aborts the caller; partial scores would bias
    /// genotypes downstream.
    pub fn chrom(&self, name: &str) -> Result<&[u8]> {
        self.chroms
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| RunError::Input(format!("chromosome {name} not in reference")).into())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Fetch `[start, end)` of a chromosome, clamped to its bounds.
    pub fn window(&self, name: &str, start: i64, end: i64) -> Result<&[u8]> {
        let seq = self.chrom(name)?;
        let start = start.clamp(0, seq.len() as i64) as usize;
        let end = end.clamp(0, seq.len() as i64) as usize;
        Ok(&seq[start.min(end)..end])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn window_clamps_to_bounds() -> Result<()> {
        let genome = Genome::from_records([("chr1", b"ACGTACGT".to_vec())]);
        assert_eq!(genome.window("chr1", -3, 4)?, b"ACGT");
        assert_eq!(genome.window("chr1", 6, 100)?, b"GT");
        assert_eq!(genome.window("chr1", 5, 2)?, b"");
        Ok(())
    }

    #[test]
    fn missing_chromosome_is_fatal() {
        let genome = Genome::from_records([("chr1", b"ACGT".to_vec())]);
        assert!(genome.chrom("chr2").is_err());
    }

    #[test]
    fn sequences_uppercased_on_load() -> Result<()> {
        let genome = Genome::from_records([("chr1", b"acgtn".to_vec())]);
        assert_eq!(genome.chrom("chr1")?, b"ACGTN");
        Ok(())
    }
}
