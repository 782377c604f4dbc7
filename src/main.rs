// src/main.rs
// Entry point for the diffusion batch suite.
// Handles command-line argument parsing and dispatches to the profiler, the
// batch driver or the results viewer.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diffusion_batch_suite::batch::{self, BatchConfig, SinglePromptJob};
use diffusion_batch_suite::device::{self, DeviceConfig};
use diffusion_batch_suite::gallery;
use diffusion_batch_suite::pipeline::{CommandPipeline, ModelSelection};
use diffusion_batch_suite::viewer::{self, ResultFilter, ResultsViewer};
use std::path::{Path, PathBuf};

/// Device profiling, batch generation and results browsing for a diffusion pipeline.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect the accelerator and write a device configuration
    Profile {
        /// Only create the config file, don't print device info
        #[arg(long)]
        config_only: bool,

        /// Output config file path
        #[arg(long, default_value = device::DEFAULT_CONFIG_PATH)]
        output: PathBuf,
    },

    /// Generate images for one prompt, or for every prompt x model of a batch config
    Generate {
        /// Positive prompt
        #[arg(required_unless_present = "config")]
        prompt: Option<String>,

        /// Negative prompt
        #[arg(default_value = batch::DEFAULT_NEGATIVE_PROMPT)]
        negative: String,

        /// Sampling steps
        #[arg(default_value_t = batch::DEFAULT_SINGLE_PROMPT_STEPS)]
        steps: u32,

        /// Number of images
        #[arg(default_value_t = 1)]
        count: u32,

        /// Batch config JSON with prompts, models and settings
        #[arg(long, conflicts_with = "prompt")]
        config: Option<PathBuf>,

        /// Device config written by `profile`; detected on the fly when absent
        #[arg(long, default_value = device::DEFAULT_CONFIG_PATH)]
        device_config: PathBuf,

        /// Root directory for single-prompt runs
        #[arg(long, default_value = batch::DEFAULT_OUTPUT_ROOT)]
        output_dir: PathBuf,

        /// Stable-diffusion CLI binary that renders each image
        #[arg(long, env = "DIFFUSION_PIPELINE_BIN", default_value = "sd")]
        pipeline_bin: String,

        /// Directory holding model weights
        #[arg(long, env = "DIFFUSION_MODELS_DIR")]
        models_dir: Option<PathBuf>,

        /// Base model used in single-prompt mode
        #[arg(long, env = "DIFFUSION_BASE_MODEL", default_value = "sd_xl_base_1.0.safetensors")]
        base_model: String,
    },

    /// Analyze and compare generated results
    View {
        /// Results directory
        #[arg(long, default_value = batch::DEFAULT_OUTPUT_ROOT)]
        dir: PathBuf,

        /// Show statistics
        #[arg(long)]
        stats: bool,

        /// Filter by base model name
        #[arg(long)]
        filter_base: Option<String>,

        /// Show only results with refiner
        #[arg(long, conflicts_with = "filter_no_refiner")]
        filter_refiner: bool,

        /// Show only results without refiner
        #[arg(long)]
        filter_no_refiner: bool,

        /// Show only results with LoRAs
        #[arg(long, conflicts_with = "filter_no_loras")]
        filter_loras: bool,

        /// Show only results without LoRAs
        #[arg(long)]
        filter_no_loras: bool,

        /// Filter by prompt text (case-insensitive)
        #[arg(long)]
        filter_prompt: Option<String>,

        /// Copy best results by index
        #[arg(long, num_args = 1..)]
        copy_best: Vec<usize>,

        /// Directory for best results
        #[arg(long, default_value = "best_results")]
        copy_to: PathBuf,

        /// Create HTML comparison page
        #[arg(long)]
        html: bool,
    },
}

fn flag_pair(yes: bool, no: bool) -> Option<bool> {
    match (yes, no) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn load_or_detect_device(path: &Path) -> Result<DeviceConfig> {
    if path.exists() {
        log::info!("Using device config {}", path.display());
        return DeviceConfig::load(path).context("loading device config");
    }
    log::info!("No device config at {}, detecting", path.display());
    Ok(DeviceConfig::detect())
}

fn main() -> Result<()> {
    env_logger::init(); // Initialize logger

    let cli = Cli::parse();

    match cli.command {
        Commands::Profile { config_only, output } => {
            let config = DeviceConfig::detect();
            if !config_only {
                print!("{}", device::render_report(&config.device_settings));
            }
            config.save(&output).context("writing device config")?;
            println!("Device configuration saved to {}", output.display());
        }

        Commands::Generate {
            prompt,
            negative,
            steps,
            count,
            config,
            device_config,
            output_dir,
            pipeline_bin,
            models_dir,
            base_model,
        } => {
            let device = load_or_detect_device(&device_config)?;
            let mut pipeline = CommandPipeline::new(pipeline_bin, models_dir, &device);

            let run = match (config, prompt) {
                (Some(config_path), _) => {
                    let config = BatchConfig::load(&config_path).context("loading batch config")?;
                    batch::run_batch_config(&mut pipeline, &device, &config)?
                }
                (None, Some(prompt)) => {
                    let job = SinglePromptJob {
                        prompt,
                        negative_prompt: negative,
                        steps,
                        count,
                        output_root: output_dir,
                    };
                    let models = ModelSelection {
                        base: base_model,
                        ..ModelSelection::default()
                    };
                    batch::run_single_prompt(&mut pipeline, &device, &models, &job)?
                }
                // clap enforces prompt-or-config.
                (None, None) => anyhow::bail!("either a prompt or --config is required"),
            };
            log::info!(
                "Run finished: {} images, {} failed, summary in {}",
                run.summary.total_images,
                run.summary.failed,
                run.output_dir.display()
            );
        }

        Commands::View {
            dir,
            stats,
            filter_base,
            filter_refiner,
            filter_no_refiner,
            filter_loras,
            filter_no_loras,
            filter_prompt,
            copy_best,
            copy_to,
            html,
        } => {
            let viewer = ResultsViewer::load(&dir)
                .with_context(|| format!("loading results from {}", dir.display()))?;

            if stats {
                print!("{}", viewer::render_statistics(&viewer.statistics()));
            }

            let filter = ResultFilter::new(
                filter_base,
                flag_pair(filter_refiner, filter_no_refiner),
                flag_pair(filter_loras, filter_no_loras),
                filter_prompt,
            );
            if !filter.is_empty() {
                let filtered = viewer.filter(&filter);
                println!("\nFiltered to {} results:", filtered.len());
                for (idx, result) in filtered.iter().take(20) {
                    let base: String = result.record.base_model.chars().take(30).collect();
                    println!("{}: {} - Base: {}", idx, result.record.filename, base);
                }
            }

            if !copy_best.is_empty() {
                viewer.copy_best(&copy_best, &copy_to)?;
            }

            if html {
                gallery::write_comparison_html(&viewer, gallery::DEFAULT_HTML_FILE)?;
            }
        }
    }

    Ok(())
}
