use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const JUNCTION_PREFIX: &str = "junction_";
pub const INSIDE_PREFIX: &str = "inside_";

/// A locus name is synthetic when it marks a breakpoint (`junction_<track>`)
/// or the interior of an inserted allele (`inside_<track>`); everything else
/// is a real reference position named `<chrom>_<position>`.
pub fn is_synthetic(name: &str) -> bool {
    name.starts_with(JUNCTION_PREFIX) || name.starts_with(INSIDE_PREFIX)
}

pub fn is_junction(name: &str) -> bool {
    name.starts_with(JUNCTION_PREFIX)
}

/// One genomic (or synthetic) placement of a k-mer, with the k-bp flanking
/// masks used to tell this placement apart from the others. Masks do not
/// change once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Locus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    /// GC bucket of the surrounding window, set during the reference scan.
    #[serde(default)]
    pub gc: u8,
}

impl Locus {
    pub fn real(chrom: &str, position: u64, left: Option<String>, right: Option<String>, gc: u8) -> Self {
        Self {
            chrom: Some(chrom.to_string()),
            position: Some(position),
            left,
            right,
            gc,
        }
    }

    pub fn synthetic(left: Option<String>, right: Option<String>, gc: u8) -> Self {
        Self {
            chrom: None,
            position: None,
            left,
            right,
            gc,
        }
    }

    pub fn masks(&self) -> impl Iterator<Item = &str> {
        self.left.as_deref().into_iter().chain(self.right.as_deref())
    }

    pub fn has_complete_masks(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    pub fn clear_masks(&mut self) {
        self.left = None;
        self.right = None;
    }
}

/// Which stage planted the k-mer: inner extraction emits `deletion` and
/// `insertion`, the junction stage emits `junction` for clip-derived k-mers
/// and `deletion`/`insertion` for indel-span-derived ones, `assembly` marks
/// k-mers taken from external contigs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Assembly,
    Junction,
    Deletion,
    Insertion,
}

/// The alignment that first supported a junction k-mer. Diagnostic only;
/// the scan stage strips it once real loci are known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadAnchor {
    pub start: u64,
    pub end: u64,
    pub qname: String,
}

/// The working entity threaded through the pipeline stages. Created by the
/// extractors, annotated by the scan, pruned by the mask filter, counted by
/// the read pass, and consumed read-only by the genotyper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmerRecord {
    pub seq: String,
    pub source: Source,
    pub loci: BTreeMap<String, Locus>,
    /// Owning tracks and the k-mer's multiplicity within each.
    pub tracks: BTreeMap<String, u32>,
    /// Copies in the reference genome; equals `loci.len()` only after the
    /// mask filter has run.
    pub reference: u32,
    pub count: u32,
    pub total: u32,
    pub coverage: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filtered_loci: BTreeMap<String, Locus>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inverse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<ReadAnchor>,
}

impl KmerRecord {
    pub fn new(seq: String, source: Source) -> Self {
        debug_assert_eq!(seq, crate::kmer::canonical_string(&seq));
        Self {
            seq,
            source,
            loci: BTreeMap::new(),
            tracks: BTreeMap::new(),
            reference: 0,
            count: 0,
            total: 0,
            coverage: 0.0,
            filtered_loci: BTreeMap::new(),
            inverse: false,
            read: None,
        }
    }

    pub fn real_loci(&self) -> impl Iterator<Item = (&String, &Locus)> {
        self.loci.iter().filter(|(name, _)| !is_synthetic(name))
    }

    pub fn has_junction_locus(&self) -> bool {
        self.loci.keys().any(|name| is_junction(name))
    }

    /// Total multiplicity across owning tracks (Σ_t m_{i,t}).
    pub fn multiplicity(&self) -> u32 {
        self.tracks.values().sum()
    }

    /// Reference copies outside the owning tracks. Junction k-mers have no
    /// reference placement of their own, hence the clamp at zero.
    pub fn residue(&self) -> u32 {
        self.reference.saturating_sub(self.multiplicity())
    }

    /// Whether the k-mer's verified count is expected to rise with the SV
    /// allele fraction. Insertion content and junction spans only exist on
    /// the alternate allele; deletion-interior k-mers disappear with it.
    pub fn rises_with_genotype(&self) -> bool {
        self.inverse
            || self.source == Source::Insertion
            || self.has_junction_locus()
            || self.filtered_loci.keys().any(|name| is_junction(name))
    }

    /// Merge another observation of the same k-mer: union loci without
    /// touching masks already fixed, union owning tracks.
    pub fn absorb(&mut self, other: KmerRecord) {
        debug_assert_eq!(self.seq, other.seq);
        for (name, locus) in other.loci {
            self.loci.entry(name).or_insert(locus);
        }
        for (track, multiplicity) in other.tracks {
            let entry = self.tracks.entry(track).or_insert(0);
            *entry = (*entry).max(multiplicity);
        }
        self.reference = self.reference.max(other.reference);
        self.inverse |= other.inverse;
    }
}

/// Stage checkpoint: every surviving k-mer keyed by its canonical sequence.
pub type KmerTable = BTreeMap<String, KmerRecord>;

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(seq: &str, source: Source) -> KmerRecord {
        KmerRecord::new(crate::kmer::canonical_string(seq), source)
    }

    #[test]
    fn absorb_unions_without_overwriting_masks() {
        let mut a = record("AAAACCCC", Source::Deletion);
        a.loci.insert(
            "chr1_10".to_string(),
            Locus::real("chr1", 10, Some("AAA".into()), None, 40),
        );
        a.tracks.insert("DEL@chr1_5_50".to_string(), 1);

        let mut b = record("AAAACCCC", Source::Deletion);
        b.loci.insert(
            "chr1_10".to_string(),
            Locus::real("chr1", 10, Some("TTT".into()), Some("GGG".into()), 40),
        );
        b.loci.insert(
            "chr2_99".to_string(),
            Locus::real("chr2", 99, None, None, 55),
        );
        b.tracks.insert("DEL@chr2_90_140".to_string(), 2);

        a.absorb(b);
        assert_eq!(a.loci.len(), 2);
        // first-fixed masks win
        assert_eq!(a.loci["chr1_10"].left.as_deref(), Some("AAA"));
        assert_eq!(a.tracks.len(), 2);
        assert_eq!(a.multiplicity(), 3);
    }

    #[test]
    fn residue_clamps_at_zero() {
        let mut r = record("AAAACCCC", Source::Junction);
        r.tracks.insert("DEL@chr1_5_50".to_string(), 1);
        r.reference = 0;
        assert_eq!(r.residue(), 0);
        r.reference = 4;
        assert_eq!(r.residue(), 3);
    }

    #[test]
    fn orientation_follows_source_and_loci() {
        let mut del = record("AAAACCCC", Source::Deletion);
        assert!(!del.rises_with_genotype());
        del.loci.insert(
            "junction_DEL@chr1_5_50".to_string(),
            Locus::synthetic(None, None, 0),
        );
        assert!(del.rises_with_genotype());

        let ins = record("AAAACCCC", Source::Insertion);
        assert!(ins.rises_with_genotype());

        let mut inv = record("AAAACCCC", Source::Deletion);
        inv.inverse = true;
        assert!(inv.rises_with_genotype());
    }

    #[test]
    fn real_loci_excludes_synthetic_names() {
        let mut r = record("AAAACCCC", Source::Junction);
        r.loci.insert(
            "junction_DEL@chr1_5_50".to_string(),
            Locus::synthetic(None, None, 0),
        );
        r.loci
            .insert("chr1_77".to_string(), Locus::real("chr1", 77, None, None, 0));
        let real: Vec<_> = r.real_loci().map(|(name, _)| name.clone()).collect();
        assert_eq!(real, vec!["chr1_77".to_string()]);
    }

    #[test]
    fn roundtrips_through_json() {
        let mut r = record("AAAACCCC", Source::Insertion);
        r.loci.insert(
            "inside_INS@chr1_100_100".to_string(),
            Locus::synthetic(Some("ACGT".into()), Some("TTTT".into()), 62),
        );
        r.tracks.insert("INS@chr1_100_100".to_string(), 1);
        r.count = 12;
        r.total = 14;
        r.coverage = 29.5;
        let json = serde_json::to_string(&r).unwrap();
        let back: KmerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }
}
