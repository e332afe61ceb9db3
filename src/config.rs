use std::path::PathBuf;

use anyhow::Result;

use crate::error::RunError;

/// Sequencing error rate folded into the LP coefficients.
pub const ERROR_RATE: f64 = 0.03;

/// Immutable run configuration, built once from the command line and passed
/// by reference through the pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    /// K-mer length; even, at most 32.
    pub ksize: usize,
    /// Expected per-haplotype depth, the starting point for GC adjustment.
    pub coverage: f64,
    /// Per-k-mer count standard deviation for the confidence probe.
    pub std: f64,
    pub threads: usize,
    /// Read length used to size the breakpoint windows.
    pub read_length: usize,
    /// Paired-simulation convention: two FASTQ shards per worker, merged
    /// counts halved.
    pub simulation: bool,
    /// Skip stages whose output shards already exist.
    pub resume: bool,
    pub bed: PathBuf,
    pub reference: PathBuf,
    pub bam: Option<PathBuf>,
    pub fastq: Vec<PathBuf>,
    /// Reference k-mer index sidecar; built from the reference when absent.
    pub jellyfish: Option<PathBuf>,
    pub workdir: PathBuf,
}

impl Settings {
    pub fn validate(self) -> Result<Self> {
        if self.ksize == 0 || self.ksize > 32 || self.ksize % 2 != 0 {
            return Err(RunError::Input(format!(
                "ksize must be even and at most 32, got {}",
                self.ksize
            ))
            .into());
        }
        if self.coverage <= 0.0 {
            return Err(RunError::Input(format!(
                "coverage must be positive, got {}",
                self.coverage
            ))
            .into());
        }
        Ok(self)
    }

    /// Haploid depth scaled to the diploid expectation used by the LP.
    pub fn diploid_coverage(&self) -> f64 {
        self.coverage * 2.0
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ksize: 32,
            coverage: 15.0,
            std: 5.0,
            threads: num_cpus::get(),
            read_length: 100,
            simulation: false,
            resume: false,
            bed: PathBuf::new(),
            reference: PathBuf::new(),
            bam: None,
            fastq: Vec::new(),
            jellyfish: None,
            workdir: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_odd_ksize() {
        let settings = Settings {
            ksize: 31,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_oversized_ksize() {
        let settings = Settings {
            ksize: 34,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn accepts_default() {
        assert!(Settings::default().validate().is_ok());
    }
}
