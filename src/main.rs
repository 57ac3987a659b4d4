#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

// ========================================================================================
//
//                               THE LDEPI COMMAND LINE
//
// ========================================================================================
//
// Every subcommand follows the same path: read the optional TOML file, let explicit
// flags override it, open the PLINK fileset, and hand everything to the library.

use clap::{Args, Parser, Subcommand, ValueEnum};
use ldepi::arena::resolve_memory_budget;
use ldepi::config::{
    ConfigFile, Delimiter, EpistasisMode, LdStatistic, MatrixEncoding, MatrixShape, PruneMode,
    Shard, WindowExtent, XChromosomeModel,
};
use ldepi::epistasis::run_epistasis;
use ldepi::error::LdError;
use ldepi::io::PlinkDataset;
use ldepi::ld_matrix::write_ld_matrix;
use ldepi::progress::BarProgress;
use ldepi::report::write_prune_lists;
use ldepi::window::prune_markers;
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "ldepi",
    version,
    about = "Pairwise linkage disequilibrium and case/control epistasis on PLINK filesets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every subcommand.
#[derive(Args)]
struct CommonArgs {
    /// PLINK fileset prefix or .bed path
    #[arg(value_name = "BFILE")]
    bfile: PathBuf,

    /// Prefix for every output file
    #[arg(long, value_name = "PREFIX")]
    out: PathBuf,

    /// TOML file with [prune], [ld_matrix], [epistasis] and [resources] sections
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Worker threads (defaults to every available core)
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Working memory budget in MiB
    #[arg(long = "memory-mb", value_name = "MIB")]
    memory_mb: Option<usize>,

    /// Treat the X chromosome like an autosome
    #[arg(long = "ignore-x")]
    ignore_x: bool,

    /// Count non-male X genotypes twice instead of recoding male homozygotes
    #[arg(long = "weighted-x", conflicts_with = "ignore_x")]
    weighted_x: bool,

    /// Count the second .bim allele as loaded instead of the founders' minor allele
    #[arg(long = "keep-allele-order")]
    keep_allele_order: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum PruneModeCli {
    Pairwise,
    Vif,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatisticCli {
    R,
    R2,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShapeCli {
    Square,
    Square0,
    Triangle,
    Table,
}

#[derive(Clone, Copy, ValueEnum)]
enum EncodingCli {
    Text,
    Gz,
    Bin,
}

#[derive(Subcommand)]
enum Commands {
    /// Sliding-window LD pruning
    #[command(about = "Prune variants in LD (outputs: .prune.in, .prune.out)")]
    Prune {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, value_enum)]
        mode: Option<PruneModeCli>,

        /// Window size in variants
        #[arg(long, value_name = "N", conflicts_with = "window_kb")]
        window: Option<usize>,

        /// Window size in kilobases
        #[arg(long = "window-kb", value_name = "KB")]
        window_kb: Option<u32>,

        /// Variants to advance the window by after each scan
        #[arg(long, value_name = "N")]
        step: Option<usize>,

        /// Pairwise r² threshold
        #[arg(long)]
        r2: Option<f64>,

        /// Variance inflation factor threshold
        #[arg(long)]
        vif: Option<f64>,
    },

    /// Full LD matrix
    #[command(about = "Write the LD matrix (outputs: .ld, .ld.gz or .ld.bin)")]
    LdMatrix {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, value_enum)]
        statistic: Option<StatisticCli>,

        #[arg(long, value_enum)]
        shape: Option<ShapeCli>,

        #[arg(long, value_enum)]
        encoding: Option<EncodingCli>,

        /// Separate text cells with spaces instead of tabs
        #[arg(long)]
        spaces: bool,

        #[arg(long = "single-prec")]
        single_precision: bool,

        /// Compute only part K of N
        #[arg(long, num_args = 2, value_names = ["K", "N"])]
        parallel: Option<Vec<u32>>,

        /// Allow an unsharded matrix over more than 400000 variants
        #[arg(long = "yes-really")]
        yes_really: bool,
    },

    /// Fast case/control epistasis
    #[command(about = "Scan every autosomal pair for epistasis (outputs: .epi.cc, .epi.cc.summary)")]
    Epistasis {
        #[command(flatten)]
        common: CommonArgs,

        /// Significance level for the pair report
        #[arg(long)]
        epi1: Option<f64>,

        /// Significance level for the per-variant counts
        #[arg(long)]
        epi2: Option<f64>,

        #[arg(long = "no-ueki")]
        no_ueki: bool,

        #[arg(long = "case-only")]
        case_only: bool,

        #[arg(long = "no-p-value")]
        no_p_value: bool,

        /// Logistic regression instead of the contingency-table statistic
        #[arg(long)]
        regression: bool,
    },
}

/// Resolved shared settings for one run.
struct Session {
    file: ConfigFile,
    threads: usize,
    memory_budget: usize,
    dataset: PlinkDataset,
    out: PathBuf,
}

impl Session {
    fn open(common: &CommonArgs) -> Result<Self, LdError> {
        let mut file = match &common.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        if common.threads.is_some() {
            file.resources.threads = common.threads;
        }
        if let Some(mb) = common.memory_mb {
            file.resources.memory_bytes = Some(mb << 20);
        }
        let threads = file.resources.thread_count();
        let memory_budget = resolve_memory_budget(file.resources.memory_bytes);

        info!("Opening PLINK fileset {}.", common.bfile.display());
        let mut dataset = PlinkDataset::open(&common.bfile)?;
        if common.keep_allele_order {
            dataset.keep_allele_order();
        }
        info!(
            "{} samples and {} variants loaded; using {threads} threads and {} MiB.",
            dataset.samples().len(),
            dataset.markers().len(),
            memory_budget >> 20
        );
        Ok(Self {
            file,
            threads,
            memory_budget,
            dataset,
            out: common.out.clone(),
        })
    }
}

fn apply_x_flags(model: &mut XChromosomeModel, common: &CommonArgs) {
    if common.ignore_x {
        model.ignore_x = true;
    }
    if common.weighted_x {
        model.weighted_x = true;
    }
}

fn ensure_parent_dir(prefix: &Path) -> Result<(), LdError> {
    match prefix.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|e| LdError::write(dir, e))
        }
        _ => Ok(()),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Prune {
            common,
            mode,
            window,
            window_kb,
            step,
            r2,
            vif,
        } => run_prune(&common, mode, window, window_kb, step, r2, vif),
        Commands::LdMatrix {
            common,
            statistic,
            shape,
            encoding,
            spaces,
            single_precision,
            parallel,
            yes_really,
        } => run_ld_matrix(
            &common,
            statistic,
            shape,
            encoding,
            spaces,
            single_precision,
            parallel,
            yes_really,
        ),
        Commands::Epistasis {
            common,
            epi1,
            epi2,
            no_ueki,
            case_only,
            no_p_value,
            regression,
        } => run_fast_epistasis(&common, epi1, epi2, no_ueki, case_only, no_p_value, regression),
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

fn run_prune(
    common: &CommonArgs,
    mode: Option<PruneModeCli>,
    window: Option<usize>,
    window_kb: Option<u32>,
    step: Option<usize>,
    r2: Option<f64>,
    vif: Option<f64>,
) -> Result<(), LdError> {
    let session = Session::open(common)?;
    let mut config = session.file.prune.clone();
    if let Some(mode) = mode {
        config.mode = match mode {
            PruneModeCli::Pairwise => PruneMode::Pairwise,
            PruneModeCli::Vif => PruneMode::VarianceInflation,
        };
    }
    if let Some(n) = window {
        config.window = WindowExtent::Markers(n);
    }
    if let Some(kb) = window_kb {
        config.window = WindowExtent::Kilobases(kb);
    }
    if let Some(step) = step {
        config.step = step;
    }
    if let Some(r2) = r2 {
        config.r2_threshold = r2;
    }
    if let Some(vif) = vif {
        config.vif_threshold = vif;
    }
    apply_x_flags(&mut config.x_model, common);

    let dataset = &session.dataset;
    let outcome = prune_markers(
        dataset.genotypes(),
        dataset,
        dataset.samples(),
        &config,
        session.memory_budget,
        &mut BarProgress::default(),
    )?;
    if let Some(outcome) = outcome {
        ensure_parent_dir(&session.out)?;
        let (kept, removed) = write_prune_lists(&session.out, dataset, &outcome)?;
        info!(
            "Marker lists written to {} and {}.",
            kept.display(),
            removed.display()
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_ld_matrix(
    common: &CommonArgs,
    statistic: Option<StatisticCli>,
    shape: Option<ShapeCli>,
    encoding: Option<EncodingCli>,
    spaces: bool,
    single_precision: bool,
    parallel: Option<Vec<u32>>,
    yes_really: bool,
) -> Result<(), LdError> {
    let session = Session::open(common)?;
    let mut config = session.file.ld_matrix.clone();
    if let Some(statistic) = statistic {
        config.statistic = match statistic {
            StatisticCli::R => LdStatistic::R,
            StatisticCli::R2 => LdStatistic::RSquared,
        };
    }
    if let Some(shape) = shape {
        config.shape = match shape {
            ShapeCli::Square => MatrixShape::Square,
            ShapeCli::Square0 => MatrixShape::Square0,
            ShapeCli::Triangle => MatrixShape::Triangle,
            ShapeCli::Table => MatrixShape::Table,
        };
    }
    if let Some(encoding) = encoding {
        config.encoding = match encoding {
            EncodingCli::Text => MatrixEncoding::Text,
            EncodingCli::Gz => MatrixEncoding::Gzip,
            EncodingCli::Bin => MatrixEncoding::Binary,
        };
    }
    if spaces {
        config.delimiter = Delimiter::Space;
    }
    config.single_precision |= single_precision;
    config.yes_really |= yes_really;
    if let Some(parts) = parallel {
        if let [index, total] = parts[..] {
            config.shard = Some(Shard { index, total });
        }
    }
    apply_x_flags(&mut config.x_model, common);

    ensure_parent_dir(&session.out)?;
    let dataset = &session.dataset;
    write_ld_matrix(
        dataset.genotypes(),
        dataset,
        dataset.samples(),
        &config,
        &session.out,
        session.threads,
        session.memory_budget,
        &mut BarProgress::default(),
    )?;
    Ok(())
}

fn run_fast_epistasis(
    common: &CommonArgs,
    epi1: Option<f64>,
    epi2: Option<f64>,
    no_ueki: bool,
    case_only: bool,
    no_p_value: bool,
    regression: bool,
) -> Result<(), LdError> {
    let session = Session::open(common)?;
    let mut config = session.file.epistasis.clone();
    if let Some(epi1) = epi1 {
        config.epi1 = epi1;
    }
    if let Some(epi2) = epi2 {
        config.epi2 = epi2;
    }
    config.no_ueki |= no_ueki;
    config.case_only |= case_only;
    config.no_p_value |= no_p_value;
    if regression {
        config.mode = EpistasisMode::Regression;
    }

    ensure_parent_dir(&session.out)?;
    let dataset = &session.dataset;
    run_epistasis(
        dataset.genotypes(),
        dataset,
        dataset.samples(),
        &config,
        &session.out,
        session.threads,
        session.memory_budget,
        &mut BarProgress::default(),
    )?;
    Ok(())
}
