//! Command-line interface for training and synthesis.
//!
//! `train` runs the epoch loop described by a hyperparameter file,
//! `synthesize` turns symbol sequences into mel spectrograms and `config`
//! prints the merged, validated hyperparameters.

#![recursion_limit = "256"]

use anyhow::Result;
use burn::backend::Autodiff;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tacotron::config::load_config;
use tacotron::data::{load_style, save_mel};
use tacotron::perf;
use tacotron::runtime::{RuntimeParams, TacotronRuntime};
use tacotron::train::summary::{write_matrix, FileSummaryWriter};
use tacotron::train::trainer::{Tacotron2Trainer, TrainerConfig};

#[cfg(feature = "backend-wgpu")]
use burn_wgpu::graphics::AutoGraphicsApi;
#[cfg(feature = "backend-wgpu")]
use burn_wgpu::{init_setup, Wgpu, WgpuDevice};

/// Supported compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum BackendChoice {
    /// Use the WGPU backend (GPU acceleration when available).
    Wgpu,
    /// Use the ndarray backend (CPU).
    Ndarray,
}

#[cfg(feature = "backend-wgpu")]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Wgpu;
#[cfg(not(feature = "backend-wgpu"))]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Ndarray;

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "tacotron")]
#[command(about = "Tacotron 2 training and mel synthesis", long_about = None)]
struct Cli {
    /// Print performance summary at the end of the run.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Compute backend to use.
    #[arg(long, value_enum, default_value_t = DEFAULT_BACKEND, global = true)]
    backend: BackendChoice,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a hyperparameter file.
    Train {
        /// Hyperparameter YAML.
        #[arg(long)]
        config: PathBuf,
        /// Override `log_dir`.
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Override `checkpoint` (warm start).
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Synthesize mel spectrograms from symbol sequences.
    Synthesize {
        /// Hyperparameter YAML.
        #[arg(long)]
        config: PathBuf,
        /// Checkpoint saved by `train`.
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Comma-separated symbol ids; repeat for a batch.
        #[arg(long = "symbols", required = true)]
        symbols: Vec<String>,
        /// Speaker id applied to every sequence.
        #[arg(long)]
        speaker: Option<i64>,
        /// Safetensors file with a `style` vector applied to every sequence.
        #[arg(long)]
        style: Option<PathBuf>,
        /// Directory receiving `mel_<i>.safetensors` and `alignment_<i>.safetensors`.
        #[arg(long)]
        output_dir: PathBuf,
        /// Seed for pre-net dropout.
        #[arg(long, default_value_t = 1234)]
        seed: u64,
        /// Stop-gate threshold override.
        #[arg(long)]
        gate_threshold: Option<f64>,
        /// Decoder step cap override.
        #[arg(long)]
        max_decoder_steps: Option<usize>,
    },
    /// Print the merged and validated hyperparameters.
    Config {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct TrainArgs {
    config: PathBuf,
    log_dir: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct SynthesizeArgs {
    config: PathBuf,
    checkpoint: Option<PathBuf>,
    symbols: Vec<String>,
    speaker: Option<i64>,
    style: Option<PathBuf>,
    output_dir: PathBuf,
    params: RuntimeParams,
}

/// Entry point for the CLI.
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let verbose = cli.verbose;
    let backend = cli.backend;

    match cli.command {
        Commands::Train {
            config,
            log_dir,
            checkpoint,
        } => {
            let args = TrainArgs {
                config,
                log_dir,
                checkpoint,
            };
            let interrupted = Arc::new(AtomicBool::new(false));
            let interrupt_flag = Arc::clone(&interrupted);
            ctrlc::set_handler(move || {
                interrupt_flag.store(true, Ordering::SeqCst);
            })?;
            match backend {
                BackendChoice::Wgpu => {
                    #[cfg(feature = "backend-wgpu")]
                    {
                        let device = WgpuDevice::default();
                        init_setup::<AutoGraphicsApi>(&device, Default::default());
                        run_train::<Autodiff<Wgpu>>(args, &device, interrupted)?;
                    }
                    #[cfg(not(feature = "backend-wgpu"))]
                    {
                        let _ = (args, interrupted);
                        anyhow::bail!("WGPU backend not enabled; build with --features backend-wgpu");
                    }
                }
                BackendChoice::Ndarray => {
                    let device = NdArrayDevice::default();
                    run_train::<Autodiff<NdArray<f32>>>(args, &device, interrupted)?;
                }
            }
        }
        Commands::Synthesize {
            config,
            checkpoint,
            symbols,
            speaker,
            style,
            output_dir,
            seed,
            gate_threshold,
            max_decoder_steps,
        } => {
            let args = SynthesizeArgs {
                config,
                checkpoint,
                symbols,
                speaker,
                style,
                output_dir,
                params: RuntimeParams::new(seed, gate_threshold, max_decoder_steps),
            };
            match backend {
                BackendChoice::Wgpu => {
                    #[cfg(feature = "backend-wgpu")]
                    {
                        let device = WgpuDevice::default();
                        init_setup::<AutoGraphicsApi>(&device, Default::default());
                        run_synthesize::<Wgpu>(args, &device)?;
                    }
                    #[cfg(not(feature = "backend-wgpu"))]
                    {
                        let _ = args;
                        anyhow::bail!("WGPU backend not enabled; build with --features backend-wgpu");
                    }
                }
                BackendChoice::Ndarray => {
                    let device = NdArrayDevice::default();
                    run_synthesize::<NdArray<f32>>(args, &device)?;
                }
            }
        }
        Commands::Config { config } => {
            let hparams = load_config(config)?;
            print!("{}", serde_yaml::to_string(&hparams)?);
        }
    }

    if verbose {
        eprintln!("{}", perf::report());
    }

    Ok(())
}

fn run_train<B: AutodiffBackend>(
    args: TrainArgs,
    device: &B::Device,
    interrupted: Arc<AtomicBool>,
) -> Result<()> {
    let mut hparams = load_config(&args.config)?;
    if let Some(log_dir) = args.log_dir {
        hparams.log_dir = log_dir;
    }
    if let Some(checkpoint) = args.checkpoint {
        hparams.checkpoint = Some(checkpoint);
    }
    if hparams.distributed_run && hparams.world_size > 1 {
        anyhow::bail!(
            "distributed_run with world_size {} needs a gradient transport; none is built in",
            hparams.world_size
        );
    }
    let mut config = TrainerConfig::from_hparams(hparams)?;
    config.training_manifest = resolve_config_relative(&args.config, &config.training_manifest);
    config.validation_manifest = resolve_config_relative(&args.config, &config.validation_manifest);

    let mut writer = FileSummaryWriter::create(&config.hparams.log_dir)?;
    let trainer = Tacotron2Trainer::<B>::new(config, device.clone()).with_interrupt(interrupted);
    trainer.train(&mut writer)?;
    log::info!("Training finished");
    Ok(())
}

fn run_synthesize<B: Backend>(args: SynthesizeArgs, device: &B::Device) -> Result<()> {
    let sequences = args
        .symbols
        .iter()
        .map(|s| parse_symbols(s))
        .collect::<Result<Vec<_>>>()?;
    let mut runtime = TacotronRuntime::<B>::from_config_path(
        &args.config,
        args.checkpoint.as_deref(),
        args.params,
        device,
    )?;
    let speakers = args.speaker.map(|id| vec![id; sequences.len()]);
    let styles = match (&args.style, runtime.hparams().gst_dim) {
        (Some(path), Some(gst_dim)) if runtime.hparams().uses_style() => {
            Some(vec![load_style(path, gst_dim)?; sequences.len()])
        }
        (Some(_), _) => anyhow::bail!("--style was given but the model has no style conditioning"),
        (None, _) if runtime.hparams().uses_style() => {
            anyhow::bail!("The model is style-conditioned; pass --style with a style vector")
        }
        (None, _) => None,
    };
    let results = runtime.synthesize(&sequences, speakers.as_deref(), styles.as_deref())?;

    std::fs::create_dir_all(&args.output_dir)?;
    let n_mel = runtime.hparams().n_mel_channels;
    for (index, result) in results.iter().enumerate() {
        save_mel(
            &args.output_dir.join(format!("mel_{index}.safetensors")),
            &result.mel,
            n_mel,
        )?;
        write_matrix(
            &args.output_dir.join(format!("alignment_{index}.safetensors")),
            "alignment",
            result.frames,
            result.input_length,
            &result.alignment,
        )?;
        eprintln!("sequence {index}: {} frames", result.frames);
    }
    Ok(())
}

/// Parse `"12,4,7"` into symbol ids.
fn parse_symbols(text: &str) -> Result<Vec<i64>> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|e| anyhow::anyhow!("Invalid symbol id {s:?}: {e}"))
        })
        .collect()
}

/// Manifest paths in a config file are relative to that file.
fn resolve_config_relative(config: &Path, path: &Path) -> PathBuf {
    tacotron::config::resolve_relative_path(config, path)
}
