// src/pipeline.rs
// Seam between the batch driver and the external generation pipeline.
// The suite never samples or decodes images itself. `Pipeline` is the surface
// the driver calls; `CommandPipeline` implements it by running the
// stable-diffusion.cpp `sd` binary once per image, with the device profile
// handed over as environment variables.

use crate::device::{DeviceConfig, DeviceKind};
use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Largest edge the CPU path renders at.
pub const CPU_MAX_EDGE: u32 = 768;

/// A LoRA adapter and the weight it is applied with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraRef {
    pub name: String,
    #[serde(default = "default_lora_weight")]
    pub weight: f64,
}

fn default_lora_weight() -> f64 {
    1.0
}

/// Models the pipeline should have loaded before generating.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelSelection {
    pub base: String,
    pub refiner: Option<String>,
    pub loras: Vec<LoraRef>,
}

/// Settings a caller asks for. Unset values are filled from the device
/// profile when the request is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default)]
    pub steps: Option<u32>,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        GenerationSettings {
            steps: None,
            cfg_scale: 7.0,
            width: 1024,
            height: 1024,
            seed: None,
        }
    }
}

/// A fully resolved request for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub sampler: String,
    pub scheduler: String,
    pub batch_size: u32,
}

impl GenerationRequest {
    pub fn for_device(
        device: &DeviceConfig,
        prompt: &str,
        negative_prompt: &str,
        settings: &GenerationSettings,
    ) -> Self {
        let device_settings = &device.device_settings;
        let defaults = &device.generation_settings;

        let (mut width, mut height) = (settings.width, settings.height);
        if device_settings.device == DeviceKind::Cpu && (width > CPU_MAX_EDGE || height > CPU_MAX_EDGE) {
            width = CPU_MAX_EDGE;
            height = CPU_MAX_EDGE;
            println!("📱 Adjusted resolution to {}x{} for CPU performance", width, height);
        }

        let seed = settings
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..(1u64 << 31)));

        GenerationRequest {
            prompt: prompt.to_string(),
            negative_prompt: negative_prompt.to_string(),
            steps: settings.steps.unwrap_or(defaults.default_steps),
            cfg_scale: settings.cfg_scale,
            width,
            height,
            seed,
            sampler: sampler_for(device_settings.device).to_string(),
            scheduler: defaults.scheduler.clone(),
            batch_size: device_settings.batch_size.max(1),
        }
    }
}

pub fn sampler_for(kind: DeviceKind) -> &'static str {
    match kind {
        DeviceKind::Cpu => "euler_a",
        DeviceKind::Mps => "dpmpp_2m_sde",
        DeviceKind::Cuda => "dpmpp_2m_sde_gpu",
    }
}

/// Sampler name as understood by `sd --sampling-method`.
pub fn cli_sampler(sampler: &str) -> &str {
    match sampler {
        "dpmpp_2m_sde" | "dpmpp_2m_sde_gpu" | "dpmpp_2m" => "dpm++2m",
        "dpmpp_2s_a" => "dpm++2s_a",
        other => other,
    }
}

/// Scheduler name as understood by `sd --schedule`.
pub fn cli_schedule(scheduler: &str) -> &str {
    match scheduler {
        "dpm_2m_karras" | "karras" => "karras",
        "euler_a" | "euler" | "normal" | "discrete" => "discrete",
        other => other,
    }
}

/// The external generation library, as seen by the batch driver.
pub trait Pipeline {
    /// Make `models` the active base/refiner/LoRA set.
    fn load_models(&mut self, models: &ModelSelection) -> Result<()>;

    /// Produce one PNG at `output`.
    fn generate(&mut self, request: &GenerationRequest, output: &Path) -> Result<()>;
}

/// Runs a stable-diffusion CLI binary per image.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: String,
    models_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    vae_tiling: bool,
    cpu_offload: bool,
    models: Option<ModelSelection>,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>, models_dir: Option<PathBuf>, device: &DeviceConfig) -> Self {
        CommandPipeline {
            program: program.into(),
            models_dir,
            env: device.pipeline_env(),
            vae_tiling: device.generation_settings.enable_vae_tiling,
            cpu_offload: device.generation_settings.enable_cpu_offload,
            models: None,
        }
    }

    fn model_path(&self, name: &str) -> PathBuf {
        match &self.models_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Build the process invocation for one image.
    pub fn command_for(&self, request: &GenerationRequest, output: &Path) -> Result<Command> {
        let models = self
            .models
            .as_ref()
            .ok_or_else(|| Error::Pipeline("no models loaded".to_string()))?;

        // LoRAs are activated from the prompt: <lora:name:weight>
        let mut prompt = request.prompt.clone();
        for lora in &models.loras {
            prompt.push_str(&format!(" <lora:{}:{}>", lora.name, lora.weight));
        }

        let mut cmd = Command::new(&self.program);
        // sd has no refiner stage; load_models warns when one is selected.
        cmd.arg("-m").arg(self.model_path(&models.base));
        if let Some(dir) = &self.models_dir {
            if !models.loras.is_empty() {
                cmd.arg("--lora-model-dir").arg(dir);
            }
        }
        cmd.arg("-p").arg(prompt);
        cmd.arg("-n").arg(&request.negative_prompt);
        cmd.arg("--steps").arg(request.steps.to_string());
        cmd.arg("--cfg-scale").arg(request.cfg_scale.to_string());
        cmd.arg("-W").arg(request.width.to_string());
        cmd.arg("-H").arg(request.height.to_string());
        cmd.arg("-s").arg(request.seed.to_string());
        cmd.arg("--sampling-method").arg(cli_sampler(&request.sampler));
        cmd.arg("--schedule").arg(cli_schedule(&request.scheduler));
        if self.vae_tiling {
            cmd.arg("--vae-tiling");
        }
        if self.cpu_offload {
            cmd.arg("--offload-to-cpu");
        }
        cmd.arg("-o").arg(output);

        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.env("DIFFUSION_BATCH_SIZE", request.batch_size.to_string());
        Ok(cmd)
    }
}

impl Pipeline for CommandPipeline {
    fn load_models(&mut self, models: &ModelSelection) -> Result<()> {
        if self.models_dir.is_some() {
            let names = std::iter::once(&models.base).chain(models.refiner.as_ref());
            for name in names {
                let path = self.model_path(name);
                if !path.exists() {
                    return Err(Error::ModelNotFound(path));
                }
            }
        }
        if let Some(refiner) = &models.refiner {
            log::warn!("{} has no refiner stage, rendering without {}", self.program, refiner);
        }
        log::info!(
            "Pipeline models: base={} refiner={} loras={}",
            models.base,
            models.refiner.as_deref().unwrap_or("None"),
            models.loras.len()
        );
        self.models = Some(models.clone());
        Ok(())
    }

    fn generate(&mut self, request: &GenerationRequest, output: &Path) -> Result<()> {
        let mut cmd = self.command_for(request, output)?;
        log::debug!("Running {:?}", cmd);

        let result = cmd.output().map_err(|source| Error::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let last_line = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(Error::Pipeline(format!(
                "{} exited with {}: {}",
                self.program, result.status, last_line
            )));
        }
        if !output.exists() {
            return Err(Error::Pipeline(format!(
                "{} finished without writing {}",
                self.program,
                output.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Observation;
    use std::ffi::OsStr;
    use tempfile::tempdir;

    fn device(kind: DeviceKind, memory_gb: f64) -> DeviceConfig {
        DeviceConfig::from_observation(&Observation {
            kind,
            name: "test".to_string(),
            memory_gb,
            cpu_cores: None,
        })
    }

    #[test]
    fn test_request_uses_device_defaults() {
        let cuda = device(DeviceKind::Cuda, 16.0);
        let request = GenerationRequest::for_device(&cuda, "a castle", "blurry", &GenerationSettings::default());
        assert_eq!(request.steps, 30);
        assert_eq!(request.width, 1024);
        assert_eq!(request.sampler, "dpmpp_2m_sde_gpu");
        assert_eq!(request.scheduler, "dpm_2m_karras");
        assert_eq!(request.batch_size, 4);
        assert!(request.seed < (1 << 31));

        let settings = GenerationSettings {
            steps: Some(12),
            seed: Some(42),
            ..GenerationSettings::default()
        };
        let request = GenerationRequest::for_device(&cuda, "a castle", "", &settings);
        assert_eq!(request.steps, 12);
        assert_eq!(request.seed, 42);
    }

    #[test]
    fn test_cpu_resolution_is_clamped() {
        let cpu = device(DeviceKind::Cpu, 16.0);
        let settings = GenerationSettings {
            width: 1024,
            height: 512,
            ..GenerationSettings::default()
        };
        let request = GenerationRequest::for_device(&cpu, "p", "n", &settings);
        assert_eq!((request.width, request.height), (768, 768));
        assert_eq!(request.steps, 20);
        assert_eq!(request.sampler, "euler_a");

        let small = GenerationSettings {
            width: 512,
            height: 512,
            ..GenerationSettings::default()
        };
        let request = GenerationRequest::for_device(&cpu, "p", "n", &small);
        assert_eq!((request.width, request.height), (512, 512));

        // Only the CPU path is clamped.
        let mps = device(DeviceKind::Mps, 16.0);
        let request = GenerationRequest::for_device(&mps, "p", "n", &settings);
        assert_eq!((request.width, request.height), (1024, 512));
        assert_eq!(request.sampler, "dpmpp_2m_sde");
    }

    #[test]
    fn test_command_arguments() {
        let cuda = device(DeviceKind::Cuda, 8.0);
        let mut pipeline = CommandPipeline::new("sd", None, &cuda);
        let models = ModelSelection {
            base: "base.safetensors".to_string(),
            refiner: None,
            loras: vec![LoraRef { name: "detail".to_string(), weight: 0.5 }],
        };
        pipeline.load_models(&models).unwrap();

        let request = GenerationRequest::for_device(&cuda, "a fox", "blurry", &GenerationSettings {
            seed: Some(7),
            ..GenerationSettings::default()
        });
        let cmd = pipeline.command_for(&request, Path::new("out.png")).unwrap();
        let args: Vec<&OsStr> = cmd.get_args().collect();

        let value_after = |flag: &str| {
            let pos = args.iter().position(|a| *a == flag).unwrap();
            args[pos + 1].to_string_lossy().into_owned()
        };
        assert_eq!(value_after("-m"), "base.safetensors");
        assert_eq!(value_after("-p"), "a fox <lora:detail:0.5>");
        assert_eq!(value_after("-n"), "blurry");
        assert_eq!(value_after("-s"), "7");
        assert_eq!(value_after("-o"), "out.png");
        assert_eq!(value_after("--sampling-method"), "dpm++2m");
        assert_eq!(value_after("--schedule"), "karras");
        assert!(args.contains(&OsStr::new("--offload-to-cpu")));
        assert!(!args.contains(&OsStr::new("--vae-tiling")));

        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs.contains(&(OsStr::new("DIFFUSION_DEVICE"), Some(OsStr::new("cuda")))));
        assert!(envs.contains(&(OsStr::new("DIFFUSION_BATCH_SIZE"), Some(OsStr::new("2")))));
    }

    #[test]
    fn test_cpu_command_and_refiner() {
        let cpu = device(DeviceKind::Cpu, 8.0);
        let mut pipeline = CommandPipeline::new("sd", None, &cpu);
        pipeline
            .load_models(&ModelSelection {
                base: "base.safetensors".to_string(),
                refiner: Some("refiner.safetensors".to_string()),
                loras: Vec::new(),
            })
            .unwrap();

        let request = GenerationRequest::for_device(&cpu, "p", "", &GenerationSettings::default());
        let cmd = pipeline.command_for(&request, Path::new("out.png")).unwrap();
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();

        let pos = args.iter().position(|a| a == "--sampling-method").unwrap();
        assert_eq!(args[pos + 1], "euler_a");
        let pos = args.iter().position(|a| a == "--schedule").unwrap();
        assert_eq!(args[pos + 1], "discrete");
        assert!(!args.iter().any(|a| a.contains("refiner")));
        assert!(!args.iter().any(|a| a == "--lora-model-dir"));
    }

    #[test]
    fn test_cli_names() {
        assert_eq!(cli_sampler("dpmpp_2m_sde"), "dpm++2m");
        assert_eq!(cli_sampler("dpmpp_2m_sde_gpu"), "dpm++2m");
        assert_eq!(cli_sampler("euler_a"), "euler_a");
        assert_eq!(cli_schedule("dpm_2m_karras"), "karras");
        assert_eq!(cli_schedule("euler_a"), "discrete");
        assert_eq!(cli_schedule("exponential"), "exponential");
    }

    #[test]
    fn test_generate_requires_loaded_models() {
        let cpu = device(DeviceKind::Cpu, 8.0);
        let pipeline = CommandPipeline::new("sd", None, &cpu);
        let request = GenerationRequest::for_device(&cpu, "p", "", &GenerationSettings::default());
        assert!(matches!(
            pipeline.command_for(&request, Path::new("x.png")),
            Err(Error::Pipeline(_))
        ));
    }

    #[test]
    fn test_load_models_checks_models_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("base.safetensors"), b"weights").unwrap();
        let cpu = device(DeviceKind::Cpu, 8.0);
        let mut pipeline = CommandPipeline::new("sd", Some(dir.path().to_path_buf()), &cpu);

        let mut models = ModelSelection {
            base: "base.safetensors".to_string(),
            ..ModelSelection::default()
        };
        assert!(pipeline.load_models(&models).is_ok());

        models.refiner = Some("refiner.safetensors".to_string());
        match pipeline.load_models(&models) {
            Err(Error::ModelNotFound(path)) => assert!(path.ends_with("refiner.safetensors")),
            other => panic!("expected missing refiner, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_binary_is_an_error() {
        let dir = tempdir().unwrap();
        let cpu = device(DeviceKind::Cpu, 8.0);
        let mut pipeline = CommandPipeline::new("definitely-not-a-real-sd-binary", None, &cpu);
        pipeline
            .load_models(&ModelSelection {
                base: "base.safetensors".to_string(),
                ..ModelSelection::default()
            })
            .unwrap();
        let request = GenerationRequest::for_device(&cpu, "p", "", &GenerationSettings::default());
        let result = pipeline.generate(&request, &dir.path().join("out.png"));
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }
}
