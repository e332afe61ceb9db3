use std::{collections::BTreeMap, io::Write};

use anyhow::Result;
use itertools::Itertools;

use crate::{
    config::{Settings, ERROR_RATE},
    record::KmerTable,
    solver::{LinearProgram, Sense, VarId},
    stats,
    track::Track,
};

const SCENARIOS: [f64; 3] = [0.0, 0.5, 1.0];

/// One k-mer as the LP sees it.
struct LpKmer {
    count: f64,
    coverage: f64,
    residue: f64,
    /// (track index, multiplicity)
    terms: Vec<(usize, f64)>,
    rises: bool,
}

#[derive(Debug, Clone)]
pub struct TrackCall {
    pub track: Track,
    /// Continuous allele fraction from the LP.
    pub lp_value: f64,
    pub rounded: f64,
    pub genotype: &'static str,
    pub t_value: f64,
    pub p_value: f64,
    pub num_kmers: usize,
}

pub fn genotype_label(rounded: f64) -> &'static str {
    match (2.0 * rounded).round() as i64 {
        0 => "0/0",
        1 => "0/1",
        _ => "1/1",
    }
}

/// Builds the ℓ₁ relaxation of the genotyping problem, rounds its solution
/// to diploid genotypes, and runs the paired-probe confidence test. Strictly
/// serial; the LP owns the solver for the duration.
pub struct GenotypeOptions<'a> {
    settings: &'a Settings,
    tracks: &'a BTreeMap<String, Track>,
}

impl<'a> GenotypeOptions<'a> {
    pub fn new(settings: &'a Settings, tracks: &'a BTreeMap<String, Track>) -> Self {
        Self { settings, tracks }
    }

    pub fn run(&self, table: &KmerTable) -> Result<Vec<TrackCall>> {
        let names: Vec<String> = table
            .values()
            .flat_map(|record| record.tracks.keys().cloned())
            .filter(|name| self.tracks.contains_key(name))
            .sorted()
            .dedup()
            .collect();
        if names.is_empty() {
            log::warn!("no tracks with surviving kmers; nothing to genotype");
            return Ok(Vec::new());
        }
        let index: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect();

        let lp_kmers: Vec<LpKmer> = table
            .values()
            .filter_map(|record| {
                let terms: Vec<(usize, f64)> = record
                    .tracks
                    .iter()
                    .filter_map(|(name, &m)| {
                        index.get(name.as_str()).map(|&idx| (idx, f64::from(m)))
                    })
                    .collect();
                if terms.is_empty() {
                    return None;
                }
                let coverage = if record.coverage > 0.0 {
                    record.coverage
                } else {
                    self.settings.diploid_coverage()
                };
                Some(LpKmer {
                    count: f64::from(record.count),
                    coverage,
                    residue: f64::from(record.residue()),
                    terms,
                    rises: record.rises_with_genotype(),
                })
            })
            .collect();
        log::info!(
            "Genotyping {} tracks over {} kmers",
            names.len(),
            lp_kmers.len()
        );

        let (mut program, c_vars, e_vars) = self.build_program(names.len(), &lp_kmers);
        log::debug!("LP over {} variables", program.num_variables());
        let solution = program.minimize()?;
        let lp_values: Vec<f64> = c_vars.iter().map(|&var| solution.value(var)).collect();
        let rounded: Vec<f64> = lp_values
            .iter()
            .map(|&c| (2.0 * c).round() / 2.0)
            .collect();

        // per-track kmer slots for the probe
        let mut track_kmers: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
        for (slot, kmer) in lp_kmers.iter().enumerate() {
            for &(track, _) in &kmer.terms {
                track_kmers[track].push(slot);
            }
        }

        // freeze every track at its rounded value, then probe one at a time
        for (idx, &var) in c_vars.iter().enumerate() {
            program.set_bounds(var, rounded[idx], rounded[idx]);
        }

        let mut calls = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let (t_value, p_value) = self.probe_track(
                &mut program,
                c_vars[idx],
                rounded[idx],
                &track_kmers[idx],
                &e_vars,
            )?;
            let track = self.tracks[name].clone();
            calls.push(TrackCall {
                track,
                lp_value: lp_values[idx],
                rounded: rounded[idx],
                genotype: genotype_label(rounded[idx]),
                t_value,
                p_value,
                num_kmers: track_kmers[idx].len(),
            });
        }
        Ok(calls)
    }

    fn build_program(
        &self,
        num_tracks: usize,
        lp_kmers: &[LpKmer],
    ) -> (LinearProgram, Vec<VarId>, Vec<VarId>) {
        let mut program = LinearProgram::new();
        let c_vars: Vec<VarId> = (0..num_tracks)
            .map(|_| program.add_variable(0.0, 0.0, 1.0))
            .collect();
        let mut e_vars = Vec::with_capacity(lp_kmers.len());
        for kmer in lp_kmers {
            let total_m: f64 = kmer.terms.iter().map(|&(_, m)| m).sum();
            let upper = kmer.count - kmer.coverage * kmer.residue;
            let lower = upper - kmer.coverage * total_m;
            let e = program.add_variable(0.0, lower, upper);
            let l = program.add_variable(1.0, 0.0, f64::INFINITY);

            let mut terms: Vec<(VarId, f64)> = Vec::with_capacity(kmer.terms.len() + 1);
            let mut rhs = upper;
            for &(track, m) in &kmer.terms {
                let coef = kmer.coverage * (1.0 - ERROR_RATE) * m;
                if kmer.rises {
                    terms.push((c_vars[track], coef));
                } else {
                    terms.push((c_vars[track], -coef));
                }
            }
            if !kmer.rises {
                rhs -= kmer.coverage * (1.0 - ERROR_RATE) * total_m;
            }
            terms.push((e, 1.0));
            program.add_constraint(&terms, Sense::Eq, rhs);
            program.add_constraint(&[(l, 1.0), (e, 1.0)], Sense::Ge, 0.0);
            program.add_constraint(&[(l, 1.0), (e, -1.0)], Sense::Ge, 0.0);
            e_vars.push(e);
        }
        (program, c_vars, e_vars)
    }

    /// Re-solve with the track pinned at each diploid scenario and compare
    /// the per-kmer absolute errors of the called genotype against the best
    /// alternative.
    fn probe_track(
        &self,
        program: &mut LinearProgram,
        c_var: VarId,
        rounded: f64,
        kmers: &[usize],
        e_vars: &[VarId],
    ) -> Result<(f64, f64)> {
        let mut errors: [Vec<f64>; 3] = Default::default();
        for (scenario, &fixed) in SCENARIOS.iter().enumerate() {
            program.set_bounds(c_var, fixed, fixed);
            let solution = program.minimize()?;
            errors[scenario] = kmers
                .iter()
                .map(|&slot| solution.value(e_vars[slot]).abs())
                .collect();
        }
        program.set_bounds(c_var, rounded, rounded);

        let called = SCENARIOS
            .iter()
            .position(|&v| (v - rounded).abs() < 1e-9)
            .expect("rounded value is a scenario");
        let alternative = (0..SCENARIOS.len())
            .filter(|&s| s != called)
            .min_by(|&a, &b| {
                let a: f64 = errors[a].iter().sum();
                let b: f64 = errors[b].iter().sum();
                a.partial_cmp(&b).expect("objective sums are finite")
            })
            .expect("two alternatives exist");

        match stats::paired_t_test(&errors[alternative], &errors[called], self.settings.std) {
            Some(test) => Ok((test.t, test.p)),
            None => Ok((f64::NAN, f64::NAN)),
        }
    }
}

/// `merge.bed`: per SV, `chrom begin end genotype allele_fraction`.
pub fn write_merge<W: Write>(calls: &[TrackCall], writer: &mut W) -> Result<()> {
    for call in calls {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            call.track.chrom, call.track.begin, call.track.end, call.genotype, call.lp_value
        )?;
    }
    Ok(())
}

/// `confidence.bed`: the probe's verdict per track. Infinite statistics are
/// exported as 1000; rows with an undefined statistic are skipped.
pub fn write_confidence<W: Write>(calls: &[TrackCall], writer: &mut W) -> Result<()> {
    for call in calls {
        if call.t_value.is_nan() {
            continue;
        }
        let t = if call.t_value.is_infinite() {
            1000.0
        } else {
            call.t_value
        };
        let p = if call.p_value.is_infinite() {
            1000.0
        } else {
            call.p_value
        };
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            call.track.chrom,
            call.track.begin,
            call.track.end,
            call.lp_value,
            call.rounded,
            call.genotype,
            call.track.genotype.as_deref().unwrap_or("."),
            t,
            p,
            call.num_kmers
        )?;
    }
    Ok(())
}

/// Tracks that lost every k-mer on the way here are reported, not called.
pub fn write_no_call<W: Write>(
    tracks: &BTreeMap<String, Track>,
    calls: &[TrackCall],
    writer: &mut W,
) -> Result<u64> {
    let called: std::collections::BTreeSet<String> =
        calls.iter().map(|call| call.track.name()).collect();
    let mut missing = 0u64;
    for (name, track) in tracks {
        if !called.contains(name) {
            writeln!(
                writer,
                "{}\t{}\t{}\t./.\t.",
                track.chrom, track.begin, track.end
            )?;
            missing += 1;
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use super::*;
    use crate::{
        record::{KmerRecord, Locus, Source},
        track::SvType,
    };

    fn settings() -> Settings {
        Settings {
            ksize: 16,
            coverage: 15.0,
            ..Default::default()
        }
    }

    fn track(name: &str, svtype: SvType, begin: u64, end: u64) -> Track {
        Track {
            id: name.to_string(),
            chrom: "chr1".to_string(),
            begin,
            end,
            svtype,
            svlen: 100,
            sequence: matches!(svtype, SvType::Ins).then(|| "A".repeat(100)),
            genotype: None,
        }
    }

    /// Sequence of distinct 16-mers so synthetic tables stay collision-free.
    fn kmer_seq(n: usize) -> String {
        let mut state = n as u64 + 7;
        let seq: String = (0..16)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                b"ACGT"[(state >> 33) as usize % 4] as char
            })
            .collect();
        crate::kmer::canonical_string(&seq)
    }

    /// Integer-feasible k-mer: count generated from the model at diploid
    /// genotype `g` (copies of the SV allele).
    fn model_kmer(
        n: usize,
        track: &Track,
        source: Source,
        junction: bool,
        reference: u32,
        coverage: f64,
        g: u32,
    ) -> KmerRecord {
        let mut record = KmerRecord::new(kmer_seq(n), source);
        record.tracks.insert(track.name(), 1);
        record.reference = reference;
        record.coverage = coverage;
        if junction {
            record.loci.insert(
                format!("junction_{}", track.name()),
                Locus::synthetic(None, None, 50),
            );
        }
        let c = f64::from(g) / 2.0;
        let residue = f64::from(record.residue());
        let dose = if record.rises_with_genotype() { c } else { 1.0 - c };
        record.count = (coverage * residue + coverage * (1.0 - ERROR_RATE) * dose).round() as u32;
        record
    }

    fn table_of(records: Vec<KmerRecord>) -> KmerTable {
        records
            .into_iter()
            .map(|record| (record.seq.clone(), record))
            .collect()
    }

    #[test]
    fn lp_recovers_integer_feasible_genotypes() -> Result<()> {
        let settings = settings();
        let del = track("del", SvType::Del, 1000, 2000);
        let ins = track("ins", SvType::Ins, 5000, 5000);
        let hom_ref = track("ref", SvType::Del, 8000, 9000);
        let mut tracks = BTreeMap::new();
        for t in [&del, &ins, &hom_ref] {
            tracks.insert(t.name(), t.clone());
        }

        let mut records = Vec::new();
        // heterozygous deletion: inner kmers fall with the SV allele
        for n in 0..10 {
            records.push(model_kmer(n, &del, Source::Deletion, false, 1, 30.0, 1));
        }
        // homozygous insertion: inner kmers rise
        for n in 10..20 {
            records.push(model_kmer(n, &ins, Source::Insertion, false, 0, 28.0, 2));
        }
        // absent deletion: inner kmers at full reference dose
        for n in 20..30 {
            records.push(model_kmer(n, &hom_ref, Source::Deletion, false, 1, 32.0, 0));
        }

        let calls = GenotypeOptions::new(&settings, &tracks).run(&table_of(records))?;
        let by_name: BTreeMap<String, &TrackCall> = calls
            .iter()
            .map(|call| (call.track.name(), call))
            .collect();
        assert_eq!(by_name[&del.name()].genotype, "0/1");
        assert_eq!(by_name[&ins.name()].genotype, "1/1");
        assert_eq!(by_name[&hom_ref.name()].genotype, "0/0");
        assert_float_eq!(by_name[&del.name()].lp_value, 0.5, abs <= 0.05);
        Ok(())
    }

    #[test]
    fn junction_kmers_drive_genotype_up() -> Result<()> {
        let settings = settings();
        let del = track("del", SvType::Del, 1000, 2000);
        let mut tracks = BTreeMap::new();
        tracks.insert(del.name(), del.clone());

        let records: Vec<KmerRecord> = (0..8)
            .map(|n| model_kmer(n, &del, Source::Junction, true, 0, 30.0, 2))
            .collect();
        let calls = GenotypeOptions::new(&settings, &tracks).run(&table_of(records))?;
        assert_eq!(calls[0].genotype, "1/1");
        assert_float_eq!(calls[0].lp_value, 1.0, abs <= 0.05);
        Ok(())
    }

    #[test]
    fn probe_confidence_degrades_with_noise() -> Result<()> {
        let settings = settings();
        let del = track("del", SvType::Del, 1000, 2000);
        let mut tracks = BTreeMap::new();
        tracks.insert(del.name(), del.clone());

        // heterogeneous coverages keep the probe statistic finite
        let clean: Vec<KmerRecord> = (0..12)
            .map(|n| model_kmer(n, &del, Source::Deletion, false, 1, 26.0 + n as f64, 1))
            .collect();
        let mut noisy = clean.clone();
        // deterministic perturbation standing in for Gaussian count noise
        let offsets: [i64; 12] = [5, -4, 6, -7, 3, -5, 8, -3, 4, -6, 7, -2];
        for (record, offset) in noisy.iter_mut().zip(offsets) {
            record.count = (i64::from(record.count) + offset).max(0) as u32;
        }

        let options = GenotypeOptions::new(&settings, &tracks);
        let clean_call = &options.run(&table_of(clean))?[0];
        let noisy_call = &options.run(&table_of(noisy))?[0];
        assert!(
            clean_call.t_value.abs() > noisy_call.t_value.abs(),
            "clean t {} vs noisy t {}",
            clean_call.t_value,
            noisy_call.t_value
        );
        Ok(())
    }

    #[test]
    fn no_call_reporting() -> Result<()> {
        let settings = settings();
        let del = track("del", SvType::Del, 1000, 2000);
        let silent = track("silent", SvType::Del, 7000, 7500);
        let mut tracks = BTreeMap::new();
        tracks.insert(del.name(), del.clone());
        tracks.insert(silent.name(), silent.clone());

        let records: Vec<KmerRecord> = (0..6)
            .map(|n| model_kmer(n, &del, Source::Deletion, false, 1, 30.0, 0))
            .collect();
        let calls = GenotypeOptions::new(&settings, &tracks).run(&table_of(records))?;
        assert_eq!(calls.len(), 1);

        let mut out = Vec::new();
        let missing = write_no_call(&tracks, &calls, &mut out)?;
        assert_eq!(missing, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("7000\t7500\t./."));
        Ok(())
    }

    #[test]
    fn merge_bed_format() -> Result<()> {
        let del = track("del", SvType::Del, 4000, 4200);
        let call = TrackCall {
            track: del,
            lp_value: 1.0,
            rounded: 1.0,
            genotype: "1/1",
            t_value: 12.0,
            p_value: 0.001,
            num_kmers: 40,
        };
        let mut out = Vec::new();
        write_merge(&[call], &mut out)?;
        assert_eq!(String::from_utf8(out).unwrap(), "chr1\t4000\t4200\t1/1\t1\n");
        Ok(())
    }
}
