use std::path::PathBuf;

use anyhow::Result;
use clap::{Args as ClapArgs, Parser, Subcommand};
use clap_verbosity_flag::Verbosity;
use human_panic::setup_panic;
use kivar::{
    counts::KmerIndex,
    depth::GcDepthTable,
    genome::Genome,
    utils::JsonExt,
    Pipeline, RunError, Settings,
};

#[derive(Debug, ClapArgs)]
struct InputArgs {
    /// SV catalog: BED-like TSV with chrom, begin, end, id, svtype, svlen
    /// and, for insertions, the inserted sequence
    #[clap(short, long)]
    bed: PathBuf,

    /// Reference genome FASTA
    #[clap(short, long)]
    reference: PathBuf,

    /// Aligned reads (indexed BAM); enables junction extraction
    #[clap(long)]
    bam: Option<PathBuf>,

    /// Unaligned reads (FASTQ); repeat for multiple shards
    #[clap(long, num_args = 1..)]
    fastq: Vec<PathBuf>,

    /// Reference k-mer index sidecar; built from the reference when absent
    #[clap(long)]
    jellyfish: Option<PathBuf>,

    /// Work directory holding the per-stage checkpoints
    #[clap(short, long, default_value = "kivar-work")]
    workdir: PathBuf,

    /// K-mer length; must be even and at most 32
    #[clap(long, default_value_t = 32)]
    ksize: usize,

    /// Expected per-haplotype sequencing depth
    #[clap(short, long, default_value_t = 15.0)]
    coverage: f64,

    /// Per-kmer count standard deviation, confidence probe only
    #[clap(long, default_value_t = 5.0)]
    std: f64,

    /// Worker threads, by default num cpus
    #[clap(short = 'j', long)]
    threads: Option<usize>,

    /// Read length used to size breakpoint windows
    #[clap(long, default_value_t = 100)]
    read_length: usize,

    /// Paired-simulation convention: two FASTQ shards per worker, merged
    /// counts halved
    #[clap(long)]
    simulation: bool,

    /// Skip stages whose output checkpoints already exist
    #[clap(long)]
    resume: bool,
}

impl InputArgs {
    fn settings(self) -> Result<Settings> {
        if let Some(n) = self.threads {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build_global()?;
        }
        Settings {
            ksize: self.ksize,
            coverage: self.coverage,
            std: self.std,
            threads: self.threads.unwrap_or_else(num_cpus::get),
            read_length: self.read_length,
            simulation: self.simulation,
            resume: self.resume,
            bed: self.bed,
            reference: self.reference,
            bam: self.bam,
            fastq: self.fastq,
            jellyfish: self.jellyfish,
            workdir: self.workdir,
        }
        .validate()
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
/// K-mer based genotyping of structural variants.
struct Cli {
    #[clap(flatten)]
    verbose: Verbosity,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every stage: extract, scan, filter, depth, count, genotype
    Run {
        #[clap(flatten)]
        input: InputArgs,
    },

    /// Extract inner and junction signature k-mers per track
    Extract {
        #[clap(flatten)]
        input: InputArgs,
    },

    /// Annotate candidate k-mers with their reference loci and masks
    Scan {
        #[clap(flatten)]
        input: InputArgs,
    },

    /// Filter loci whose flanking context does not match the SV of interest
    Filter {
        #[clap(flatten)]
        input: InputArgs,
    },

    /// Estimate the GC bias depth table from the read set
    Depth {
        #[clap(flatten)]
        input: InputArgs,
    },

    /// Count surviving k-mers in the read set with flank verification
    Count {
        #[clap(flatten)]
        input: InputArgs,
    },

    /// Solve the genotyping LP and write merge.bed / confidence.bed
    Genotype {
        #[clap(flatten)]
        input: InputArgs,
    },

    /// Build the binary reference k-mer index sidecar
    Index {
        /// Reference genome FASTA
        #[clap(short, long)]
        reference: PathBuf,

        /// Output index path
        #[clap(short, long)]
        output: PathBuf,

        #[clap(long, default_value_t = 32)]
        ksize: usize,
    },
}

fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run { input } => {
            let settings = input.settings()?;
            Pipeline::new(&settings).run()?;
        }
        Commands::Extract { input } => {
            let settings = input.settings()?;
            let pipeline = Pipeline::new(&settings);
            let genome = pipeline.load_genome()?;
            let tracks = pipeline.load_tracks()?;
            let index = pipeline.load_index(&genome)?;
            pipeline.extract(&genome, &tracks, &index)?;
        }
        Commands::Scan { input } => {
            let settings = input.settings()?;
            let pipeline = Pipeline::new(&settings);
            let genome = pipeline.load_genome()?;
            let table = pipeline.load_checkpoint("extract")?;
            pipeline.scan(&genome, table)?;
        }
        Commands::Filter { input } => {
            let settings = input.settings()?;
            let pipeline = Pipeline::new(&settings);
            let tracks = pipeline.load_tracks()?;
            let table = pipeline.load_checkpoint("scan")?;
            pipeline.filter(&tracks, table)?;
        }
        Commands::Depth { input } => {
            let settings = input.settings()?;
            let pipeline = Pipeline::new(&settings);
            let genome = pipeline.load_genome()?;
            let index = pipeline.load_index(&genome)?;
            pipeline.depth(&genome, &index)?;
        }
        Commands::Count { input } => {
            let settings = input.settings()?;
            let pipeline = Pipeline::new(&settings);
            let table = pipeline.load_checkpoint("filter")?;
            let gc_path = pipeline.gc_table_path();
            if !gc_path.exists() {
                return Err(
                    RunError::MissingPartition(gc_path.display().to_string()).into(),
                );
            }
            let gc = GcDepthTable::load_json(&gc_path)?;
            pipeline.count(table, &gc)?;
        }
        Commands::Genotype { input } => {
            let settings = input.settings()?;
            let pipeline = Pipeline::new(&settings);
            let tracks = pipeline.load_tracks()?;
            let table = pipeline.load_checkpoint("count")?;
            pipeline.genotype(&tracks, &table)?;
        }
        Commands::Index {
            reference,
            output,
            ksize,
        } => {
            let genome = Genome::from_fasta(reference)?;
            let index = KmerIndex::from_genome(&genome, ksize);
            index.save(&output)?;
            log::info!("wrote index to {}", output.display());
        }
    }
    Ok(())
}

fn main() {
    setup_panic!();
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();
    if let Err(err) = dispatch(cli.command) {
        log::error!("{err:#}");
        let code = err
            .downcast_ref::<RunError>()
            .map(RunError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
