//! Command-line interface
//!
//! Train candidate checkpoints, evaluate weights, and load Gumbel-selected or
//! explicit block combinations.

use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Device;

use crate::config::{TrainingConfig, WideResNetConfig};
use crate::data::Dataset;
use crate::model::{WideResNet, BLOCK_NAMES};
use crate::training::{evaluate, EpochMetrics, Trainer};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn kv(key: &str, val: &str) {
    println!("  {:<16} {}", muted(key), val.white());
}

fn step_ok(msg: &str) {
    println!("  {} {}", ok("✓"), msg);
}

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

fn print_metrics(label: &str, metrics: &EpochMetrics) {
    println!(
        "  {:<16} {} {}",
        muted(label),
        format!("loss {:.4}", metrics.loss).white(),
        format!("acc {:.2}%", metrics.accuracy * 100.0).white().bold()
    );
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "wrn-nas")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Gumbel-Softmax architecture search over a CIFAR Wide ResNet")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that builds a model
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// JSON model configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Network depth (6n + 2)
    #[arg(long)]
    pub depth: Option<usize>,

    /// Widening factor
    #[arg(long)]
    pub width: Option<usize>,

    /// Number of candidate operations per block
    #[arg(long)]
    pub num_ops: Option<usize>,

    /// Seed for alpha initialization and Gumbel noise
    #[arg(long)]
    pub seed: Option<u64>,

    /// CUDA device ordinal (CPU when omitted)
    #[arg(long)]
    pub cuda: Option<usize>,
}

impl ModelArgs {
    pub fn resolve(&self) -> anyhow::Result<WideResNetConfig> {
        let mut config = match &self.config {
            Some(path) => WideResNetConfig::from_json_file(path)?,
            None => WideResNetConfig::default(),
        };
        if let Some(depth) = self.depth {
            config.depth = depth;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(num_ops) = self.num_ops {
            config.num_ops = num_ops;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn device(&self) -> anyhow::Result<Device> {
        Ok(match self.cuda {
            Some(ordinal) => Device::new_cuda(ordinal)?,
            None => Device::Cpu,
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the network and search-space layout
    Info {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Train network weights on CIFAR-10
    Train {
        #[command(flatten)]
        model: ModelArgs,

        /// Directory with the CIFAR-10 binary batches
        #[arg(short, long)]
        data: PathBuf,

        /// Number of epochs
        #[arg(long, default_value = "1")]
        epochs: usize,

        /// Mini-batch size
        #[arg(long, default_value = "128")]
        batch_size: usize,

        /// Learning rate
        #[arg(long, default_value = "0.1")]
        lr: f64,

        /// Output weights file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Save as the checkpoint of this candidate under --weights
        #[arg(long, requires = "weights")]
        candidate: Option<usize>,

        /// Checkpoint directory
        #[arg(short, long)]
        weights: Option<PathBuf>,
    },

    /// Evaluate a weights file on the CIFAR-10 test batch
    Evaluate {
        #[command(flatten)]
        model: ModelArgs,

        /// Directory with the CIFAR-10 binary batches
        #[arg(short, long)]
        data: PathBuf,

        /// Weights file
        #[arg(short, long)]
        weights: PathBuf,

        /// Mini-batch size
        #[arg(long, default_value = "256")]
        batch_size: usize,
    },

    /// Load the arg-max combination of the sampled architecture weights
    LoadGumbel {
        #[command(flatten)]
        model: ModelArgs,

        /// Checkpoint directory
        #[arg(short, long)]
        weights: PathBuf,

        /// Saved architecture parameters (safetensors)
        #[arg(long)]
        alphas: Option<PathBuf>,

        /// Evaluate the loaded network on this CIFAR-10 directory
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Write the loaded weights here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load an explicit per-block combination
    LoadCombination {
        #[command(flatten)]
        model: ModelArgs,

        /// Checkpoint directory
        #[arg(short, long)]
        weights: PathBuf,

        /// Candidate ids, one per block or a single one for all blocks
        #[arg(short, long, value_delimiter = ',', required = true)]
        indices: Vec<usize>,

        /// Treat the indices as positions in the configured candidate table
        #[arg(long)]
        table: bool,

        /// Evaluate the loaded network on this CIFAR-10 directory
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Write the loaded weights here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ─── Commands ──────────────────────────────────────────────────────────────────

pub fn cmd_info(args: &ModelArgs) -> anyhow::Result<()> {
    section("Wide ResNet");
    let device = args.device()?;
    let model = WideResNet::new(args.resolve()?, &device)?;
    let config = model.config();

    kv("Depth", &config.depth.to_string());
    kv("Width", &config.width.to_string());
    kv("Blocks/stage", &config.blocks_per_stage().to_string());
    kv("Stage planes", &format!("{:?}", config.stage_planes()));
    kv("Classes", &config.num_classes.to_string());
    kv("Parameters", &model.num_parameters()?.to_string());

    section("Search space");
    kv("Blocks", &BLOCK_NAMES.join(", "));
    kv("Candidates", &config.num_ops.to_string());
    kv("Tau", &config.tau.to_string());
    kv("Sampled", &format!("{:?}", model.architecture().combination()?));
    println!();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_train(
    args: &ModelArgs,
    data: &Path,
    epochs: usize,
    batch_size: usize,
    lr: f64,
    output: Option<&Path>,
    candidate: Option<usize>,
    weights: Option<&Path>,
) -> anyhow::Result<()> {
    section("Train");
    let mut config = args.resolve()?;
    if let Some(root) = weights {
        config.weight_root = Some(root.to_path_buf());
    }
    let device = args.device()?;

    step_run("Loading CIFAR-10");
    let start = Instant::now();
    let train = Dataset::load_train(data)?;
    let test = Dataset::load_test(data)?;
    step_done(&format!("{} train / {} test in {:?}", train.len(), test.len(), start.elapsed()));

    let model = WideResNet::new(config, &device)?;
    let training = TrainingConfig::default()
        .with_epochs(epochs)
        .with_batch_size(batch_size)
        .with_learning_rate(lr);
    let mut trainer = Trainer::new(&model, training)?;

    step_run(&format!("Training {} epochs", epochs));
    let start = Instant::now();
    trainer.fit(&model, &train)?;
    step_done(&format!("{:?}", start.elapsed()));
    for metrics in trainer.history() {
        print_metrics(&format!("Epoch {}", metrics.epoch), metrics);
    }
    print_metrics("Test", &evaluate(&model, &test, batch_size)?);

    if let Some(candidate) = candidate {
        let path = model.save_candidate(candidate)?;
        step_ok(&format!("Saved candidate {} to {}", candidate, path.display()));
    }
    if let Some(path) = output {
        model.save(path)?;
        step_ok(&format!("Saved weights to {}", path.display()));
    }
    println!();
    Ok(())
}

pub fn cmd_evaluate(args: &ModelArgs, data: &Path, weights: &Path, batch_size: usize) -> anyhow::Result<()> {
    section("Evaluate");
    let config = args.resolve()?;
    let device = args.device()?;
    let model = WideResNet::new(config, &device)?;

    let dict = crate::checkpoint::read_state_dict(weights, &device)?;
    let report = model.load_state_dict(&dict, true)?;
    step_ok(&format!("Loaded {} tensors from {}", report.loaded.len(), weights.display()));

    let test = Dataset::load_test(data)?;
    print_metrics("Test", &evaluate(&model, &test, batch_size)?);
    println!();
    Ok(())
}

pub fn cmd_load_gumbel(
    args: &ModelArgs,
    weights: &Path,
    alphas: Option<&Path>,
    data: Option<&Path>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    section("Load Gumbel combination");
    let config = args.resolve()?.with_weight_root(weights);
    let device = args.device()?;
    let mut model = WideResNet::new(config, &device)?;

    if let Some(path) = alphas {
        model.architecture_mut().load(path)?;
        step_ok(&format!("Restored architecture parameters from {}", path.display()));
    }

    step_run("Loading block weights");
    let start = Instant::now();
    let combination = model.load_gumbel_weight()?;
    step_done(&format!("{:?}", start.elapsed()));

    print_combination(&combination);
    finish_loaded(&model, data, output)
}

pub fn cmd_load_combination(
    args: &ModelArgs,
    weights: &Path,
    indices: &[usize],
    table: bool,
    data: Option<&Path>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    section("Load combination");
    let mut config = args.resolve()?;
    if table {
        config.weight_root = Some(weights.to_path_buf());
    }
    let device = args.device()?;
    let mut model = WideResNet::new(config, &device)?;

    step_run("Loading block weights");
    let start = Instant::now();
    let candidates = if table {
        model.load_combination(indices)?
    } else {
        model.load_combination_weight(indices, weights)?;
        indices.to_vec()
    };
    step_done(&format!("{:?}", start.elapsed()));

    print_combination(&candidates);
    finish_loaded(&model, data, output)
}

fn print_combination(combination: &[usize]) {
    for (i, block) in BLOCK_NAMES.iter().enumerate() {
        let candidate = combination.get(i).or_else(|| combination.first());
        if let Some(candidate) = candidate {
            kv(block, &candidate.to_string());
        }
    }
}

fn finish_loaded(model: &WideResNet, data: Option<&Path>, output: Option<&Path>) -> anyhow::Result<()> {
    if let Some(dir) = data {
        let test = Dataset::load_test(dir)?;
        print_metrics("Test", &evaluate(model, &test, 256)?);
    }
    if let Some(path) = output {
        model.save(path)?;
        step_ok(&format!("Saved weights to {}", path.display()));
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_load_combination() {
        let cli = Cli::try_parse_from([
            "wrn-nas",
            "load-combination",
            "--weights",
            "/w",
            "--indices",
            "1,2,3,4",
            "--depth",
            "14",
        ])
        .unwrap();
        match cli.command {
            Commands::LoadCombination { model, indices, weights, table, .. } => {
                assert_eq!(indices, vec![1, 2, 3, 4]);
                assert!(!table);
                assert_eq!(weights, PathBuf::from("/w"));
                assert_eq!(model.resolve().unwrap().depth, 14);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_load_combination_through_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = WideResNetConfig::new(8, 1)
            .with_num_ops(3)
            .with_candidate_ops(vec![2, 0, 1])
            .with_weight_root(dir.path());
        let source = WideResNet::new(config.clone(), &Device::Cpu).unwrap();
        for candidate in 0..3 {
            source.save_candidate(candidate).unwrap();
        }
        let config_path = dir.path().join("config.json");
        config.save_json(&config_path).unwrap();

        let args = ModelArgs {
            config: Some(config_path),
            depth: None,
            width: None,
            num_ops: None,
            seed: None,
            cuda: None,
        };
        let output = dir.path().join("loaded.safetensors");
        cmd_load_combination(&args, dir.path(), &[0, 1, 2, 0], true, None, Some(&output)).unwrap();
        assert!(output.exists());

        // Raw ids are bounded by num_ops
        assert!(cmd_load_combination(&args, dir.path(), &[3], false, None, None).is_err());
    }

    #[test]
    fn test_candidate_requires_weights() {
        let result = Cli::try_parse_from(["wrn-nas", "train", "--data", "/d", "--candidate", "3"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_depth_rejected() {
        let args = ModelArgs {
            config: None,
            depth: Some(10),
            width: None,
            num_ops: None,
            seed: None,
            cuda: None,
        };
        assert!(args.resolve().is_err());
    }
}
