use std::collections::BTreeMap;

use anyhow::Result;

use crate::{
    config::Settings,
    kmer::shares_canonical_core,
    record::{is_junction, is_synthetic, KmerRecord, KmerTable},
    track::Track,
};

/// Discards k-mer/locus pairs whose flanking context cannot have produced
/// the signature occurrences, and classifies what is left: ambiguous
/// junction k-mers are dropped, k-mers left with junction loci only are
/// inverted, and k-mers that return to a breakpoint-adjacent locus are
/// excluded outright.
pub struct MaskFilterOptions<'a> {
    settings: &'a Settings,
    tracks: &'a BTreeMap<String, Track>,
}

impl<'a> MaskFilterOptions<'a> {
    pub fn new(settings: &'a Settings, tracks: &'a BTreeMap<String, Track>) -> Self {
        Self { settings, tracks }
    }

    pub fn run(&self, table: &mut KmerTable) -> Result<()> {
        let before = table.len();
        let mut dropped = 0usize;
        let mut returning = 0usize;
        let mut inverted = 0usize;

        table.retain(|_, record| {
            match self.filter_record(record) {
                Verdict::Keep => {
                    record.reference = record.real_loci().count() as u32;
                    true
                }
                Verdict::Inverse => {
                    record.inverse = true;
                    record.reference = record.real_loci().count() as u32;
                    inverted += 1;
                    true
                }
                Verdict::Ambiguous => {
                    dropped += 1;
                    false
                }
                Verdict::Returning => {
                    returning += 1;
                    false
                }
            }
        });

        log::info!(
            "Mask filter: {before} -> {} kmers ({dropped} ambiguous, {returning} returning, {inverted} inverse)",
            table.len()
        );
        Ok(())
    }

    fn filter_record(&self, record: &mut KmerRecord) -> Verdict {
        // already processed (or deliberately mask-free): leave untouched so
        // the stage is idempotent
        if record.inverse || record.loci.values().all(|l| l.masks().next().is_none()) {
            return Verdict::Keep;
        }

        let junction_stage = record.has_junction_locus()
            || record.filtered_loci.keys().any(|name| is_junction(name));
        let interest = self.interest_masks(record);

        let names: Vec<String> = record.loci.keys().cloned().collect();
        for name in names {
            let shared = record.loci[&name]
                .masks()
                .any(|mask| interest.iter().any(|y| shares_canonical_core(mask, y)));
            if !shared {
                let locus = record.loci.remove(&name).expect("name from keys");
                record.filtered_loci.insert(name, locus);
            }
        }

        if junction_stage {
            let junction_deficit = record
                .loci
                .iter()
                .any(|(name, locus)| is_junction(name) && !locus.has_complete_masks());
            // a breakpoint locus without both masks cannot be told apart
            // from the remaining reference copies
            if junction_deficit && record.real_loci().next().is_some() {
                return Verdict::Ambiguous;
            }
            let all_junction = !record.loci.is_empty()
                && record.loci.keys().all(|name| is_junction(name));
            let real_filtered = record.filtered_loci.keys().any(|name| !is_synthetic(name));
            if all_junction && real_filtered {
                return Verdict::Inverse;
            }
            // loci that were never discriminated are all being counted;
            // masks make no difference
            if record.filtered_loci.is_empty() && !junction_deficit {
                for locus in record.loci.values_mut() {
                    locus.clear_masks();
                }
            }
            if self.is_returning(record) {
                return Verdict::Returning;
            }
        }
        Verdict::Keep
    }

    /// Masks seen at the SV of interest: synthetic breakpoint loci plus real
    /// loci inside an owning track's window.
    fn interest_masks(&self, record: &KmerRecord) -> Vec<String> {
        let mut interest = Vec::new();
        for (name, locus) in &record.loci {
            let of_interest = if is_synthetic(name) {
                true
            } else {
                match (locus.chrom.as_deref(), locus.position) {
                    (Some(chrom), Some(position)) => record.tracks.keys().any(|track_name| {
                        self.tracks.get(track_name).is_some_and(|track| {
                            track.chrom == chrom
                                && position >= track.begin
                                && position < track.end
                        })
                    }),
                    _ => false,
                }
            };
            if of_interest {
                interest.extend(locus.masks().map(str::to_owned));
            }
        }
        interest
    }

    /// A retained real locus within 2k of the owning track's breakpoints
    /// means the junction recreates sequence that was already there.
    fn is_returning(&self, record: &KmerRecord) -> bool {
        let reach = 2 * self.settings.ksize as i64;
        for track_name in record.tracks.keys() {
            let Some(track) = self.tracks.get(track_name) else {
                continue;
            };
            for (_, locus) in record.real_loci() {
                if locus.chrom.as_deref() != Some(track.chrom.as_str()) {
                    continue;
                }
                let Some(position) = locus.position else {
                    continue;
                };
                let position = position as i64;
                if (position - track.begin as i64).abs() < reach
                    || (position - track.end as i64).abs() < reach
                {
                    return true;
                }
            }
        }
        false
    }
}

enum Verdict {
    Keep,
    Inverse,
    Ambiguous,
    Returning,
}
