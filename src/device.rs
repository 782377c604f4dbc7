// src/device.rs
// Device profile: maps an observed accelerator and its memory to batch size,
// precision, memory-saving optimizations, compile settings and generation
// defaults, and reads/writes the resulting device_config.json.

use crate::error::Result;
use crate::probe::{self, Observation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Default location of the emitted device configuration.
pub const DEFAULT_CONFIG_PATH: &str = "device_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cuda,
    Mps,
    Cpu,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cuda => "cuda",
            DeviceKind::Mps => "mps",
            DeviceKind::Cpu => "cpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp16,
    Fp32,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Fp16 => f.write_str("fp16"),
            Precision::Fp32 => f.write_str("fp32"),
        }
    }
}

/// Named memory-saving switches understood by the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimization {
    AttentionSlicing,
    VaeSlicing,
    CpuOffload,
    SequentialCpuOffload,
    LowVram,
    CpuOnly,
}

impl Optimization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Optimization::AttentionSlicing => "attention_slicing",
            Optimization::VaeSlicing => "vae_slicing",
            Optimization::CpuOffload => "cpu_offload",
            Optimization::SequentialCpuOffload => "sequential_cpu_offload",
            Optimization::LowVram => "low_vram",
            Optimization::CpuOnly => "cpu_only",
        }
    }

    /// Environment switch the pipeline reads for this optimization, if any.
    fn env_var(&self) -> Option<&'static str> {
        match self {
            Optimization::AttentionSlicing => Some("DIFFUSION_ATTENTION_SLICING"),
            Optimization::VaeSlicing => Some("DIFFUSION_VAE_SLICING"),
            Optimization::CpuOffload => Some("DIFFUSION_CPU_OFFLOAD"),
            Optimization::SequentialCpuOffload => Some("DIFFUSION_SEQUENTIAL_CPU_OFFLOAD"),
            Optimization::LowVram => Some("DIFFUSION_LOW_VRAM"),
            Optimization::CpuOnly => None,
        }
    }
}

use Optimization::*;

struct Tier {
    min_memory_gb: f64,
    batch_size: u32,
    precision: Precision,
    optimizations: &'static [Optimization],
}

// Ordered from the largest memory requirement down; the first tier whose
// minimum is met wins.
const CUDA_TIERS: &[Tier] = &[
    Tier { min_memory_gb: 12.0, batch_size: 4, precision: Precision::Fp16, optimizations: &[AttentionSlicing, VaeSlicing] },
    Tier { min_memory_gb: 8.0, batch_size: 2, precision: Precision::Fp16, optimizations: &[AttentionSlicing, VaeSlicing, CpuOffload] },
    Tier { min_memory_gb: 6.0, batch_size: 1, precision: Precision::Fp16, optimizations: &[AttentionSlicing, VaeSlicing, CpuOffload, SequentialCpuOffload] },
    Tier { min_memory_gb: f64::NEG_INFINITY, batch_size: 1, precision: Precision::Fp16, optimizations: &[AttentionSlicing, VaeSlicing, CpuOffload, SequentialCpuOffload, LowVram] },
];

const MPS_TIERS: &[Tier] = &[
    Tier { min_memory_gb: 16.0, batch_size: 2, precision: Precision::Fp16, optimizations: &[AttentionSlicing] },
    Tier { min_memory_gb: f64::NEG_INFINITY, batch_size: 1, precision: Precision::Fp16, optimizations: &[AttentionSlicing, VaeSlicing] },
];

const CPU_TIERS: &[Tier] = &[
    Tier { min_memory_gb: f64::NEG_INFINITY, batch_size: 1, precision: Precision::Fp32, optimizations: &[CpuOnly, AttentionSlicing, VaeSlicing] },
];

fn select_tier(tiers: &'static [Tier], memory_gb: f64) -> &'static Tier {
    tiers
        .iter()
        .find(|tier| memory_gb >= tier.min_memory_gb)
        .unwrap_or(&tiers[tiers.len() - 1])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub device: DeviceKind,
    pub device_name: String,
    pub memory_gb: f64,
    pub batch_size: u32,
    pub precision: Precision,
    pub optimizations: Vec<Optimization>,
}

impl DeviceSettings {
    /// Apply the fixed memory thresholds for the observed device.
    pub fn for_observation(observation: &Observation) -> Self {
        let tiers = match observation.kind {
            DeviceKind::Cuda => CUDA_TIERS,
            DeviceKind::Mps => MPS_TIERS,
            DeviceKind::Cpu => CPU_TIERS,
        };
        let tier = select_tier(tiers, observation.memory_gb);

        DeviceSettings {
            device: observation.kind,
            device_name: observation.name.clone(),
            memory_gb: observation.memory_gb,
            batch_size: tier.batch_size,
            precision: tier.precision,
            optimizations: tier.optimizations.to_vec(),
        }
    }

    pub fn has(&self, optimization: Optimization) -> bool {
        self.optimizations.contains(&optimization)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileSettings {
    pub enabled: bool,
    pub mode: Option<String>,
    pub backend: Option<String>,
}

impl CompileSettings {
    pub fn for_device(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Cuda => CompileSettings {
                enabled: true,
                mode: Some("reduce-overhead".to_string()),
                backend: Some("inductor".to_string()),
            },
            // Graph compilation is not stable on Metal.
            DeviceKind::Mps => CompileSettings {
                enabled: false,
                mode: None,
                backend: None,
            },
            DeviceKind::Cpu => CompileSettings {
                enabled: true,
                mode: Some("default".to_string()),
                backend: Some("inductor".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    pub default_steps: u32,
    pub default_guidance_scale: f64,
    pub scheduler: String,
    pub enable_vae_tiling: bool,
    pub enable_cpu_offload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub load_in_8bit: bool,
    pub use_safetensors: bool,
    pub cache_models: bool,
}

/// The full record written to `device_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_settings: DeviceSettings,
    pub compile_settings: CompileSettings,
    pub generation_settings: GenerationDefaults,
    pub model_settings: ModelSettings,
}

impl DeviceConfig {
    pub fn from_settings(settings: DeviceSettings) -> Self {
        let is_cpu = settings.device == DeviceKind::Cpu;
        let memory_gb = settings.memory_gb;

        DeviceConfig {
            compile_settings: CompileSettings::for_device(settings.device),
            generation_settings: GenerationDefaults {
                default_steps: if is_cpu { 20 } else { 30 },
                default_guidance_scale: 7.5,
                scheduler: if is_cpu { "euler_a" } else { "dpm_2m_karras" }.to_string(),
                enable_vae_tiling: memory_gb < 8.0,
                enable_cpu_offload: settings.has(CpuOffload),
            },
            model_settings: ModelSettings {
                load_in_8bit: memory_gb < 6.0,
                use_safetensors: true,
                cache_models: memory_gb >= 12.0,
            },
            device_settings: settings,
        }
    }

    pub fn from_observation(observation: &Observation) -> Self {
        Self::from_settings(DeviceSettings::for_observation(observation))
    }

    /// Probe the running machine and build its profile. Never fails; probe
    /// errors fall back to CPU defaults.
    pub fn detect() -> Self {
        let observation = probe::observe();
        log::info!(
            "Detected {} ({}) with {:.1} GB",
            observation.name,
            observation.kind,
            observation.memory_gb
        );
        Self::from_observation(&observation)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        crate::io::read_json(path)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::io::write_json(path, self)
    }

    /// Environment variables that carry this profile into the external
    /// pipeline process.
    pub fn pipeline_env(&self) -> Vec<(String, String)> {
        let settings = &self.device_settings;
        let mut env = Vec::new();

        if settings.precision == Precision::Fp16 {
            env.push(("DIFFUSION_USE_FP16".to_string(), "1".to_string()));
        }
        for optimization in &settings.optimizations {
            if let Some(var) = optimization.env_var() {
                env.push((var.to_string(), "1".to_string()));
            }
        }
        if settings.device == DeviceKind::Mps {
            env.push(("PYTORCH_ENABLE_MPS_FALLBACK".to_string(), "1".to_string()));
        }
        env.push(("DIFFUSION_DEVICE".to_string(), settings.device.as_str().to_string()));
        env
    }
}

pub fn expected_performance(settings: &DeviceSettings) -> &'static str {
    match settings.device {
        DeviceKind::Cuda if settings.memory_gb >= 12.0 => "Excellent (30-60s per image)",
        DeviceKind::Cuda if settings.memory_gb >= 8.0 => "Good (45-90s per image)",
        DeviceKind::Cuda => "Moderate (60-120s per image)",
        DeviceKind::Mps => "Good (45-90s per image)",
        DeviceKind::Cpu => "Slow (5-15 minutes per image)",
    }
}

/// Human-readable detection report.
pub fn render_report(settings: &DeviceSettings) -> String {
    let mut report = String::from("\n🔍 Device Detection Results:\n");
    report.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
    report.push_str(&format!("Device: {}\n", settings.device_name));
    report.push_str(&format!("Type: {}\n", settings.device.as_str().to_uppercase()));
    report.push_str(&format!("Memory: {:.1} GB\n", settings.memory_gb));
    report.push_str(&format!("Recommended batch size: {}\n", settings.batch_size));
    report.push_str(&format!("Precision: {}\n", settings.precision));
    if !settings.optimizations.is_empty() {
        let names: Vec<&str> = settings.optimizations.iter().map(|o| o.as_str()).collect();
        report.push_str(&format!("Optimizations: {}\n", names.join(", ")));
    }
    report.push_str(&format!("⚡ Expected performance: {}\n", expected_performance(settings)));
    report
}
