use anyhow::Result;
use fnv::FnvHashMap;
use rayon::prelude::*;

use crate::{
    config::Settings,
    genome::Genome,
    kmer::{canonical_pack, gc_bucket, CanonicalScanner},
    record::{KmerTable, Locus},
};

/// Junction k-mers observed at more reference loci than this cannot serve
/// as breakpoint evidence.
const MAX_JUNCTION_LOCI: usize = 3;

/// One streaming pass over every chromosome, annotating each candidate
/// k-mer with the real loci where its canonical form occurs, plus the
/// flanking masks and GC context of each locus.
pub struct ScanOptions<'a> {
    settings: &'a Settings,
    genome: &'a Genome,
}

impl<'a> ScanOptions<'a> {
    pub fn new(settings: &'a Settings, genome: &'a Genome) -> Self {
        Self { settings, genome }
    }

    pub fn run(&self, table: &mut KmerTable) -> Result<()> {
        let lookup: FnvHashMap<u64, String> = table
            .keys()
            .filter_map(|seq| canonical_pack(seq.as_bytes()).map(|packed| (packed, seq.clone())))
            .collect();
        log::info!("Scanning reference for {} kmers", lookup.len());

        let chroms: Vec<&str> = self.genome.names().collect();
        let shards: Vec<Vec<(String, String, Locus)>> = chroms
            .par_iter()
            .map(|chrom| self.scan_chromosome(chrom, &lookup))
            .collect::<Result<_>>()?;

        for shard in shards {
            for (seq, name, locus) in shard {
                if let Some(record) = table.get_mut(&seq) {
                    record.loci.entry(name).or_insert(locus);
                }
            }
        }

        table.retain(|seq, record| {
            let real = record.real_loci().count();
            if record.has_junction_locus() && real > MAX_JUNCTION_LOCI {
                log::debug!("dropping {seq}: junction kmer at {real} reference loci");
                return false;
            }
            record.reference = real as u32;
            record.read = None;
            true
        });
        log::info!("{} kmers after locus scoring", table.len());
        Ok(())
    }

    fn scan_chromosome(
        &self,
        chrom: &str,
        lookup: &FnvHashMap<u64, String>,
    ) -> Result<Vec<(String, String, Locus)>> {
        let k = self.settings.ksize;
        let seq = self.genome.chrom(chrom)?;
        let mut hits = Vec::new();
        for (pos, packed) in CanonicalScanner::new(seq, k) {
            let Some(kmer) = lookup.get(&packed) else {
                continue;
            };
            let left = (pos >= k).then(|| String::from_utf8_lossy(&seq[pos - k..pos]).into_owned());
            let right = (pos + 2 * k <= seq.len())
                .then(|| String::from_utf8_lossy(&seq[pos + k..pos + 2 * k]).into_owned());
            let centre = pos as i64 + k as i64 / 2;
            let gc = gc_bucket(self.genome.window(chrom, centre - 100, centre + 100)?);
            hits.push((
                kmer.clone(),
                format!("{chrom}_{pos}"),
                Locus::real(chrom, pos as u64, left, right, gc),
            ));
        }
        log::debug!("{chrom}: {} hits", hits.len());
        Ok(hits)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::{KmerRecord, Source};

    const K: usize = 8;

    fn settings() -> Settings {
        Settings {
            ksize: K,
            ..Default::default()
        }
    }

    fn chromosome(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                b"ACGT"[(state >> 33) as usize % 4]
            })
            .collect()
    }

    fn table_with(seq: &str, source: Source) -> KmerTable {
        let canon = crate::kmer::canonical_string(seq);
        let mut table = KmerTable::new();
        table.insert(canon.clone(), KmerRecord::new(canon, source));
        table
    }

    #[test]
    fn finds_loci_on_both_strands() -> Result<()> {
        let mut seq = chromosome(400, 51);
        let planted = b"AACCGGTT";
        seq[100..108].copy_from_slice(planted);
        // reverse complement at a second position
        let rc = bio::alphabets::dna::revcomp(planted.as_slice());
        seq[300..308].copy_from_slice(&rc);
        let genome = Genome::from_records([("chr1", seq)]);
        let settings = settings();
        let mut table = table_with("AACCGGTT", Source::Deletion);

        ScanOptions::new(&settings, &genome).run(&mut table)?;
        let record = &table["AACCGGTT"];
        assert!(record.loci.contains_key("chr1_100"));
        assert!(record.loci.contains_key("chr1_300"));
        assert_eq!(record.reference, record.real_loci().count() as u32);
        let locus = &record.loci["chr1_100"];
        assert_eq!(locus.left.as_deref().map(str::len), Some(K));
        assert_eq!(locus.right.as_deref().map(str::len), Some(K));
        Ok(())
    }

    #[test]
    fn edge_loci_have_partial_masks() -> Result<()> {
        let mut seq = chromosome(100, 53);
        seq[0..8].copy_from_slice(b"AACCGGTT");
        let genome = Genome::from_records([("chr1", seq)]);
        let settings = settings();
        let mut table = table_with("AACCGGTT", Source::Deletion);
        ScanOptions::new(&settings, &genome).run(&mut table)?;
        let locus = &table["AACCGGTT"].loci["chr1_0"];
        assert_eq!(locus.left, None);
        assert!(locus.right.is_some());
        Ok(())
    }

    #[test]
    fn repetitive_junction_kmers_dropped() -> Result<()> {
        let planted = b"AACCGGTT";
        let mut seq = chromosome(600, 57);
        for start in [50, 150, 250, 350] {
            seq[start..start + 8].copy_from_slice(planted);
        }
        let genome = Genome::from_records([("chr1", seq)]);
        let settings = settings();
        let mut table = table_with("AACCGGTT", Source::Junction);
        table
            .get_mut("AACCGGTT")
            .unwrap()
            .loci
            .insert("junction_DEL@chr1_5_50".to_string(), Locus::synthetic(None, None, 0));

        ScanOptions::new(&settings, &genome).run(&mut table)?;
        assert!(table.is_empty());
        Ok(())
    }
}
