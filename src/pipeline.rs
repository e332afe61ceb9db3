use std::{collections::BTreeMap, fs::File, io::BufWriter, path::PathBuf};

use anyhow::Result;

use crate::{
    config::Settings,
    counter::{CountOptions, KmerCounter},
    counts::KmerIndex,
    depth::{DepthEstimateOptions, GcDepthTable},
    error::RunError,
    genome::Genome,
    genotype::{self, GenotypeOptions},
    inner::InnerExtractOptions,
    junction::JunctionExtractOptions,
    mask::MaskFilterOptions,
    record::KmerTable,
    scan::ScanOptions,
    track::{self, Track},
    utils::JsonExt,
};

/// Inter-stage transfer goes through checkpoints in the work directory, one
/// subdirectory per stage, which is what makes the pipeline resumable at
/// stage boundaries.
pub struct Pipeline<'a> {
    settings: &'a Settings,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    pub fn stage_dir(&self, stage: &str) -> PathBuf {
        self.settings.workdir.join(stage)
    }

    pub fn checkpoint(&self, stage: &str) -> PathBuf {
        self.stage_dir(stage).join("kmers.json")
    }

    fn resumable(&self, stage: &str) -> bool {
        self.settings.resume && self.checkpoint(stage).exists()
    }

    /// A stage's input shard that should exist but does not is a partition
    /// failure, not an input error.
    pub fn load_checkpoint(&self, stage: &str) -> Result<KmerTable> {
        let path = self.checkpoint(stage);
        if !path.exists() {
            return Err(RunError::MissingPartition(path.display().to_string()).into());
        }
        KmerTable::load_json(&path)
    }

    pub fn load_tracks(&self) -> Result<BTreeMap<String, Track>> {
        let tracks = track::load_catalog(&self.settings.bed)?;
        Ok(tracks
            .into_iter()
            .map(|track| (track.name(), track))
            .collect())
    }

    pub fn load_genome(&self) -> Result<Genome> {
        Genome::from_fasta(&self.settings.reference)
    }

    pub fn load_index(&self, genome: &Genome) -> Result<KmerIndex> {
        match &self.settings.jellyfish {
            Some(path) => KmerIndex::load(path, self.settings.ksize),
            None => {
                log::info!("no reference index supplied; building one from the reference");
                Ok(KmerIndex::from_genome(genome, self.settings.ksize))
            }
        }
    }

    /// Signature extraction: inner k-mers always, junction k-mers when an
    /// alignment is available.
    pub fn extract(
        &self,
        genome: &Genome,
        tracks: &BTreeMap<String, Track>,
        index: &KmerIndex,
    ) -> Result<KmerTable> {
        const STAGE: &str = "extract";
        if self.resumable(STAGE) {
            log::info!("resuming from {}", self.checkpoint(STAGE).display());
            return self.load_checkpoint(STAGE);
        }
        let track_list: Vec<Track> = tracks.values().cloned().collect();
        let mut table = InnerExtractOptions::new(self.settings, genome).run(&track_list, index)?;
        match &self.settings.bam {
            Some(bam) => {
                let junctions =
                    JunctionExtractOptions::new(self.settings, genome).run(&track_list, bam)?;
                for (seq, record) in junctions {
                    match table.get_mut(&seq) {
                        Some(existing) => existing.absorb(record),
                        None => {
                            table.insert(seq, record);
                        }
                    }
                }
            }
            None => log::info!("no alignment supplied; junction extraction skipped"),
        }
        table.save_json(self.checkpoint(STAGE))?;
        Ok(table)
    }

    pub fn scan(&self, genome: &Genome, mut table: KmerTable) -> Result<KmerTable> {
        const STAGE: &str = "scan";
        if self.resumable(STAGE) {
            log::info!("resuming from {}", self.checkpoint(STAGE).display());
            return self.load_checkpoint(STAGE);
        }
        ScanOptions::new(self.settings, genome).run(&mut table)?;
        table.save_json(self.checkpoint(STAGE))?;
        Ok(table)
    }

    pub fn filter(
        &self,
        tracks: &BTreeMap<String, Track>,
        mut table: KmerTable,
    ) -> Result<KmerTable> {
        const STAGE: &str = "filter";
        if self.resumable(STAGE) {
            log::info!("resuming from {}", self.checkpoint(STAGE).display());
            return self.load_checkpoint(STAGE);
        }
        MaskFilterOptions::new(self.settings, tracks).run(&mut table)?;
        table.save_json(self.checkpoint(STAGE))?;
        Ok(table)
    }

    pub fn gc_table_path(&self) -> PathBuf {
        self.stage_dir("depth").join("gc.json")
    }

    pub fn depth(&self, genome: &Genome, index: &KmerIndex) -> Result<GcDepthTable> {
        let path = self.gc_table_path();
        if self.settings.resume && path.exists() {
            log::info!("resuming from {}", path.display());
            return GcDepthTable::load_json(&path);
        }
        let table = DepthEstimateOptions::new(self.settings, genome).run(index)?;
        log::info!("GC depth table: mean {:.2}, std {:.2}", table.mean(), table.std());
        table.save_json(&path)?;
        Ok(table)
    }

    pub fn count(&self, mut table: KmerTable, gc: &GcDepthTable) -> Result<KmerTable> {
        const STAGE: &str = "count";
        if self.resumable(STAGE) {
            log::info!("resuming from {}", self.checkpoint(STAGE).display());
            return self.load_checkpoint(STAGE);
        }
        let counter = KmerCounter::from_table(self.settings.ksize, &table);
        log::info!("counting {} kmers in the read set", counter.len());
        let mut options = CountOptions::new(self.settings);
        options.progress(true);
        let summary = options.run(&counter)?;
        options.annotate(&mut table, &counter, &summary, gc);
        table.save_json(self.checkpoint(STAGE))?;
        Ok(table)
    }

    pub fn genotype(
        &self,
        tracks: &BTreeMap<String, Track>,
        table: &KmerTable,
    ) -> Result<Vec<genotype::TrackCall>> {
        let dir = self.stage_dir("genotype");
        std::fs::create_dir_all(&dir)?;
        let calls = GenotypeOptions::new(self.settings, tracks).run(table)?;

        let mut merge = BufWriter::new(File::create(dir.join("merge.bed"))?);
        genotype::write_merge(&calls, &mut merge)?;
        let mut confidence = BufWriter::new(File::create(dir.join("confidence.bed"))?);
        genotype::write_confidence(&calls, &mut confidence)?;
        let mut no_call = BufWriter::new(File::create(dir.join("no_call.bed"))?);
        let missing = genotype::write_no_call(tracks, &calls, &mut no_call)?;
        if missing > 0 {
            log::warn!("{missing} tracks had no eligible kmers and were not called");
        }
        log::info!("wrote {} calls to {}", calls.len(), dir.display());
        Ok(calls)
    }

    /// The whole pipeline, checkpointing after every stage.
    pub fn run(&self) -> Result<Vec<genotype::TrackCall>> {
        let genome = self.load_genome()?;
        let tracks = self.load_tracks()?;
        let index = self.load_index(&genome)?;

        let table = self.extract(&genome, &tracks, &index)?;
        let table = self.scan(&genome, table)?;
        let table = self.filter(&tracks, table)?;
        let gc = self.depth(&genome, &index)?;
        let table = self.count(table, &gc)?;
        self.genotype(&tracks, &table)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_checkpoint_is_partition_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            workdir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let pipeline = Pipeline::new(&settings);
        let err = pipeline.load_checkpoint("scan").unwrap_err();
        let run_err = err.downcast_ref::<RunError>().unwrap();
        assert_eq!(run_err.exit_code(), 3);
    }

    #[test]
    fn checkpoints_round_trip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let settings = Settings {
            workdir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let pipeline = Pipeline::new(&settings);
        let table = KmerTable::new();
        table.save_json(pipeline.checkpoint("scan"))?;
        assert!(pipeline.load_checkpoint("scan")?.is_empty());
        Ok(())
    }
}
