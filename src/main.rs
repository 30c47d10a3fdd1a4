use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cxr_vit::training::telemetry::{read_epoch_log, summarize_epoch_log, JsonlTelemetry, EPOCH_LOG};
use cxr_vit::{DeviceKind, DistillSource, DistillTrainer, ExecutionContext, FinetuneConfig, FinetuneTrainer, ModelKind};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cxr-vit")]
#[command(about = "Fine-tune and evaluate image classifiers on chest X-ray datasets", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a model and evaluate it periodically
    Train(RunArgs),

    /// Evaluate a model on the test set only
    Eval(RunArgs),

    /// Train the model as a student of a frozen teacher
    Distill(RunArgs),

    /// Print the per-epoch loss and AUC series from an epoch log
    Summarize {
        /// Path to log.txt, or the output directory containing it
        #[arg(short, long, default_value = "./output_dir")]
        log: PathBuf,
    },

    /// Validate a configuration file and print the resolved values
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file (JSON, YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Training set tensor file
    #[arg(long)]
    train_data: Option<PathBuf>,

    /// Test set tensor file
    #[arg(long)]
    test_data: Option<PathBuf>,

    /// Backbone to train
    #[arg(long)]
    model: Option<ModelKind>,

    /// Batch size per worker
    #[arg(long)]
    batch_size: Option<usize>,

    /// Number of training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Micro-batches accumulated per optimizer step
    #[arg(long)]
    accum_iter: Option<usize>,

    /// Absolute learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Weights to fine-tune from
    #[arg(long)]
    finetune: Option<PathBuf>,

    /// Checkpoint to resume from
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Directory for checkpoints and the epoch log
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Directory for telemetry and evaluation arrays
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Compute device
    #[arg(long, value_enum)]
    device: Option<DeviceKind>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Shard the evaluation set across workers
    #[arg(long)]
    dist_eval: bool,
}

impl RunArgs {
    fn resolve(self, eval: bool) -> Result<FinetuneConfig> {
        let dist_eval = self.dist_eval;
        let mut config = self.load()?;
        config.dist_eval |= dist_eval;
        config.eval |= eval;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// `--train-data` adds one source to the configured training sets
    fn resolve_distill(mut self) -> Result<FinetuneConfig> {
        let extra = self.train_data.take();
        let mut config = self.load()?;
        if let Some(path) = extra {
            config.distill.train_sets.push(DistillSource {
                path,
                dataset: config.dataset,
                nb_classes: config.nb_classes,
            });
        }
        config.validate_distill().context("Invalid configuration")?;
        Ok(config)
    }

    fn load(self) -> Result<FinetuneConfig> {
        let mut config =
            FinetuneConfig::load(self.config.as_deref()).context("Failed to load configuration")?;

        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field { config.$field = value; })*
            };
        }
        apply!(model, batch_size, epochs, accum_iter, device, seed);

        macro_rules! apply_some {
            ($($field:ident),*) => {
                $(if let Some(value) = self.$field { config.$field = Some(value); })*
            };
        }
        apply_some!(train_data, test_data, lr, finetune, resume, output_dir, log_dir);
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();
    cxr_vit::logging::init_logging(cli.verbose, cli.json);

    if let Err(err) = dispatch(cli.command) {
        match err.downcast_ref::<cxr_vit::Error>() {
            Some(e) if e.is_non_finite_loss() => error!("{}", e),
            _ => error!("{:#}", err),
        }
        std::process::exit(1);
    }
}

fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Train(args) => run(args.resolve(false)?),
        Commands::Eval(args) => run(args.resolve(true)?),
        Commands::Distill(args) => run_distill(args.resolve_distill()?),
        Commands::Summarize { log } => summarize(log),
        Commands::Config { file } => validate_config(file),
    }
}

fn run(config: FinetuneConfig) -> Result<()> {
    let ctx = ExecutionContext::from_env(config.device).context("Failed to initialize execution context")?;
    info!("job dir: {}", std::env::current_dir()?.display());
    info!("{}", serde_json::to_string_pretty(&config)?);

    let log_dir = config.log_dir.clone();
    let mut trainer = FinetuneTrainer::from_config(config, ctx).context("Failed to build trainer")?;
    if let Some(dir) = log_dir {
        let sink = JsonlTelemetry::create(&dir).context("Failed to open telemetry log")?;
        trainer = trainer.with_telemetry(Box::new(sink));
    }

    let summary = trainer.run()?;
    info!(
        "Finished {} epochs, {} optimizer steps, max AUC {:.4}",
        summary.epochs_run.len(),
        summary.optimizer_steps,
        summary.max_auc
    );
    Ok(())
}

fn run_distill(config: FinetuneConfig) -> Result<()> {
    let ctx = ExecutionContext::from_env(config.device).context("Failed to initialize execution context")?;
    info!("job dir: {}", std::env::current_dir()?.display());
    info!("{}", serde_json::to_string_pretty(&config)?);

    let log_dir = config.log_dir.clone();
    let mut trainer = DistillTrainer::from_config(config, ctx).context("Failed to build distillation trainer")?;
    if let Some(dir) = log_dir {
        let sink = JsonlTelemetry::create(&dir).context("Failed to open telemetry log")?;
        trainer = trainer.with_telemetry(Box::new(sink));
    }

    let summary = trainer.run()?;
    info!(
        "Finished {} epochs, {} optimizer steps",
        summary.epochs_run.len(),
        summary.optimizer_steps
    );
    Ok(())
}

fn summarize(log: PathBuf) -> Result<()> {
    let path = if log.is_dir() { log.join(EPOCH_LOG) } else { log };
    let entries = read_epoch_log(&path).with_context(|| format!("Failed to read {}", path.display()))?;

    println!("{:>6}  {:>12}  {:>12}", "epoch", "train_loss", "test_auc_avg");
    for row in summarize_epoch_log(&entries) {
        let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.6}", v));
        println!("{:>6}  {:>12}  {:>12}", row.epoch, fmt(row.train_loss), fmt(row.test_auc_avg));
    }
    Ok(())
}

fn validate_config(file: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", file.display());
    let config = FinetuneConfig::load(Some(&file)).context("Failed to load configuration file")?;
    config.validate().context("Invalid configuration")?;

    info!("Configuration is valid");
    info!("  - Model: {} ({} classes)", config.model, config.num_classes());
    info!("  - Dataset: {}", config.dataset);
    info!(
        "  - Batch: {} x {} accumulation, lr {:?} / blr {}",
        config.batch_size, config.accum_iter, config.lr, config.blr
    );
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
