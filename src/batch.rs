// src/batch.rs
// Batch driver: runs the external pipeline over a single prompt N times or over
// every prompt x base-model combination of a batch config, one image at a
// time. A failed image is reported and skipped; the run always ends with a
// batch_summary.json in its timestamped output directory.

use crate::device::DeviceConfig;
use crate::error::{Error, Result};
use crate::pipeline::{GenerationRequest, GenerationSettings, LoraRef, ModelSelection, Pipeline};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "batch_summary.json";
pub const DEFAULT_OUTPUT_ROOT: &str = "batch_outputs";
pub const DEFAULT_SINGLE_PROMPT_STEPS: u32 = 30;
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    SinglePrompt,
    BatchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPair {
    pub positive: String,
    #[serde(default)]
    pub negative: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLists {
    pub base: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refiner: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loras: Vec<LoraRef>,
}

/// Input of `generate --config FILE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub output_dir: PathBuf,
    pub prompts: Vec<PromptPair>,
    pub models: ModelLists,
    pub settings: GenerationSettings,
}

impl BatchConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        crate::io::read_json(path)
    }

    pub fn combinations(&self) -> usize {
        self.prompts.len() * self.models.base.len()
    }
}

/// Settings an image was actually rendered with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSettings {
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub sampler: Option<String>,
    #[serde(default)]
    pub scheduler: Option<String>,
}

impl From<&GenerationRequest> for ImageSettings {
    fn from(request: &GenerationRequest) -> Self {
        ImageSettings {
            steps: request.steps,
            cfg_scale: request.cfg_scale,
            width: request.width,
            height: request.height,
            seed: Some(request.seed),
            sampler: Some(request.sampler.clone()),
            scheduler: Some(request.scheduler.clone()),
        }
    }
}

/// One generated image, as stored in the summary and next to the PNG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub filename: String,
    pub base_model: String,
    #[serde(default, deserialize_with = "deserialize_refiner")]
    pub refiner_model: Option<String>,
    #[serde(default)]
    pub loras: Vec<LoraRef>,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub settings: ImageSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
}

impl ResultRecord {
    pub fn has_refiner(&self) -> bool {
        self.refiner_model.is_some()
    }

    pub fn has_loras(&self) -> bool {
        !self.loras.is_empty()
    }
}

// Older summaries spell "no refiner" as the string "None".
fn deserialize_refiner<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|name| !name.is_empty() && name != "None"))
}

// Summaries written by other tools may carry a local time without an offset,
// e.g. "2024-01-01T12:00:00.123456".
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Local>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    if let Ok(stamp) = DateTime::parse_from_rfc3339(&text) {
        return Ok(stamp.with_timezone(&Local));
    }
    let naive = NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(serde::de::Error::custom)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| serde::de::Error::custom(format!("nonexistent local time {}", text)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub mode: RunMode,
    pub settings: GenerationSettings,
    pub total_images: usize,
    #[serde(default)]
    pub failed: usize,
    pub results: Vec<ResultRecord>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Local>,
}

impl BatchSummary {
    fn new(mode: RunMode, settings: GenerationSettings, results: Vec<ResultRecord>, failed: usize) -> Self {
        BatchSummary {
            mode,
            settings,
            total_images: results.len(),
            failed,
            results,
            timestamp: Local::now(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        crate::io::read_json(path)
    }
}

/// Parameters of the positional `generate PROMPT [NEGATIVE] [STEPS] [COUNT]` form.
#[derive(Debug, Clone, PartialEq)]
pub struct SinglePromptJob {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub count: u32,
    pub output_root: PathBuf,
}

impl SinglePromptJob {
    pub fn new(prompt: impl Into<String>) -> Self {
        SinglePromptJob {
            prompt: prompt.into(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            steps: DEFAULT_SINGLE_PROMPT_STEPS,
            count: 1,
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub output_dir: PathBuf,
    pub summary: BatchSummary,
}

pub fn run_single_prompt<P: Pipeline + ?Sized>(
    pipeline: &mut P,
    device: &DeviceConfig,
    models: &ModelSelection,
    job: &SinglePromptJob,
) -> Result<BatchRun> {
    let output_dir = create_run_dir(&job.output_root)?;
    let settings = GenerationSettings {
        steps: Some(job.steps),
        ..GenerationSettings::default()
    };

    println!("Batch Generator - Single Prompt Mode");
    println!("Prompt: {}", job.prompt);
    println!("Negative: {}", job.negative_prompt);
    println!("Steps: {}", job.steps);
    println!("Count: {}", job.count);
    println!("Output: {}", output_dir.display());

    announce_device(device);
    pipeline.load_models(models)?;

    let mut results = Vec::new();
    let mut failed = 0;
    for i in 1..=job.count {
        println!("\n=== Image {}/{} ===", i, job.count);
        let stem = format!("img_{:02}", i);
        match generate_one(
            pipeline,
            device,
            models,
            &job.prompt,
            &job.negative_prompt,
            &settings,
            &output_dir,
            &stem,
        ) {
            Ok(record) => {
                println!("Saved: {}", record.filename);
                results.push(record);
            }
            Err(e) => {
                println!("✗ Generation {} failed: {}", i, e);
                log::warn!("generation {} failed: {:?}", i, e);
                failed += 1;
            }
        }
    }

    let summary = BatchSummary::new(RunMode::SinglePrompt, settings, results, failed);
    save_summary(&output_dir, &summary)?;
    Ok(BatchRun { output_dir, summary })
}

pub fn run_batch_config<P: Pipeline + ?Sized>(
    pipeline: &mut P,
    device: &DeviceConfig,
    config: &BatchConfig,
) -> Result<BatchRun> {
    let output_dir = create_run_dir(&config.output_dir)?;

    println!("Batch Generator - Config Mode");
    println!("Prompts: {}", config.prompts.len());
    println!("Models: {}", config.models.base.len());
    println!("Output: {}", output_dir.display());

    announce_device(device);

    let total = config.combinations();
    let mut results = Vec::new();
    let mut failed = 0;
    let mut loaded: Option<&str> = None;
    let mut current = 0;

    for prompt in &config.prompts {
        for base_model in &config.models.base {
            current += 1;
            println!("\n=== Combination {}/{} ===", current, total);
            println!("Model: {}", base_model);
            println!("Prompt: {}...", preview(&prompt.positive, 50));

            let models = ModelSelection {
                base: base_model.clone(),
                refiner: config.models.refiner.clone(),
                loras: config.models.loras.clone(),
            };
            let stem = format!("combo_{:03}_{}", current, model_stem(base_model));

            if loaded != Some(base_model.as_str()) {
                loaded = None;
                if let Err(e) = pipeline.load_models(&models) {
                    println!("✗ Combination {} failed: {}", current, e);
                    log::warn!("loading {} failed: {:?}", base_model, e);
                    failed += 1;
                    continue;
                }
                loaded = Some(base_model.as_str());
            }

            let outcome = generate_one(
                pipeline,
                device,
                &models,
                &prompt.positive,
                &prompt.negative,
                &config.settings,
                &output_dir,
                &stem,
            );

            match outcome {
                Ok(record) => {
                    println!("Saved: {}", record.filename);
                    results.push(record);
                }
                Err(e) => {
                    println!("✗ Combination {} failed: {}", current, e);
                    log::warn!("combination {} ({}) failed: {:?}", current, base_model, e);
                    failed += 1;
                }
            }
        }
    }

    let summary = BatchSummary::new(RunMode::BatchConfig, config.settings.clone(), results, failed);
    save_summary(&output_dir, &summary)?;
    Ok(BatchRun { output_dir, summary })
}

#[allow(clippy::too_many_arguments)]
fn generate_one<P: Pipeline + ?Sized>(
    pipeline: &mut P,
    device: &DeviceConfig,
    models: &ModelSelection,
    prompt: &str,
    negative_prompt: &str,
    settings: &GenerationSettings,
    output_dir: &Path,
    stem: &str,
) -> Result<ResultRecord> {
    let request = GenerationRequest::for_device(device, prompt, negative_prompt, settings);
    println!("Generating: {}...", preview(prompt, 50));
    println!(
        "Device: {} | Steps: {} | Resolution: {}x{} | Seed: {}",
        device.device_settings.device_name, request.steps, request.width, request.height, request.seed
    );

    let filename = format!("{}_{}.png", stem, request.seed);
    let image_path = output_dir.join(&filename);
    pipeline.generate(&request, &image_path)?;

    let record = ResultRecord {
        filename,
        base_model: models.base.clone(),
        refiner_model: models.refiner.clone(),
        loras: models.loras.clone(),
        prompt: prompt.to_string(),
        negative_prompt: negative_prompt.to_string(),
        settings: ImageSettings::from(&request),
        image: Some(image_path.clone()),
    };
    crate::io::write_json(image_path.with_extension("json"), &record)?;
    Ok(record)
}

pub fn save_summary(output_dir: &Path, summary: &BatchSummary) -> Result<()> {
    crate::io::write_json(output_dir.join(SUMMARY_FILE), summary)?;
    println!(
        "\n✓ Generated {} images in {}",
        summary.total_images,
        output_dir.display()
    );
    if summary.failed > 0 {
        println!("✗ {} generations failed", summary.failed);
    }
    Ok(())
}

/// Create `<root>/<YYYYmmdd_HHMMSS>`, suffixed when a run in the same second
/// already claimed the name.
fn create_run_dir(root: &Path) -> Result<PathBuf> {
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let mut dir = root.join(&stamp);
    let mut n = 1;
    while dir.exists() {
        n += 1;
        dir = root.join(format!("{}_{}", stamp, n));
    }
    fs::create_dir_all(&dir).map_err(|source| Error::Write {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

fn announce_device(device: &DeviceConfig) {
    let settings = &device.device_settings;
    println!(
        "🔧 Optimizing for {} ({})",
        settings.device_name,
        settings.device.as_str().to_uppercase()
    );
}

fn model_stem(model: &str) -> String {
    Path::new(model)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| model.to_string())
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::probe::Observation;
    use std::collections::HashSet;
    use tempfile::tempdir;

    /// Writes a fake PNG per call; fails on chosen call numbers and for
    /// chosen models.
    #[derive(Default)]
    struct MockPipeline {
        calls: usize,
        fail_on_calls: HashSet<usize>,
        missing_models: HashSet<String>,
        loads: Vec<String>,
    }

    impl Pipeline for MockPipeline {
        fn load_models(&mut self, models: &ModelSelection) -> Result<()> {
            self.loads.push(models.base.clone());
            if self.missing_models.contains(&models.base) {
                return Err(Error::ModelNotFound(PathBuf::from(&models.base)));
            }
            Ok(())
        }

        fn generate(&mut self, request: &GenerationRequest, output: &Path) -> Result<()> {
            self.calls += 1;
            if self.fail_on_calls.contains(&self.calls) {
                return Err(Error::Pipeline("out of memory".to_string()));
            }
            fs::write(output, format!("PNG {}", request.seed)).unwrap();
            Ok(())
        }
    }

    fn cpu_device() -> DeviceConfig {
        DeviceConfig::from_observation(&Observation {
            kind: DeviceKind::Cpu,
            name: "CPU (4 cores)".to_string(),
            memory_gb: 16.0,
            cpu_cores: Some(4),
        })
    }

    fn batch_config(output_dir: &Path) -> BatchConfig {
        BatchConfig {
            output_dir: output_dir.to_path_buf(),
            prompts: vec![
                PromptPair { positive: "a lighthouse".to_string(), negative: "blurry".to_string() },
                PromptPair { positive: "a forest".to_string(), negative: String::new() },
                PromptPair { positive: "a city at night".to_string(), negative: "text".to_string() },
            ],
            models: ModelLists {
                base: vec!["juggernaut.safetensors".to_string(), "realvis.safetensors".to_string()],
                refiner: None,
                loras: vec![],
            },
            settings: GenerationSettings {
                steps: Some(10),
                cfg_scale: 6.5,
                width: 512,
                height: 512,
                seed: None,
            },
        }
    }

    #[test]
    fn test_batch_continues_past_a_failed_generation() {
        let dir = tempdir().unwrap();
        let config = batch_config(dir.path());
        let mut pipeline = MockPipeline {
            fail_on_calls: [4].into_iter().collect(),
            ..MockPipeline::default()
        };

        let run = run_batch_config(&mut pipeline, &cpu_device(), &config).unwrap();
        assert_eq!(pipeline.calls, 6);
        assert_eq!(run.summary.total_images, 5);
        assert_eq!(run.summary.results.len(), 5);
        assert_eq!(run.summary.failed, 1);
        assert_eq!(run.summary.mode, RunMode::BatchConfig);

        let on_disk = BatchSummary::load(run.output_dir.join(SUMMARY_FILE)).unwrap();
        assert_eq!(on_disk.total_images, 5);
        assert_eq!(on_disk.results, run.summary.results);

        for record in &run.summary.results {
            let image = run.output_dir.join(&record.filename);
            assert!(image.exists());
            assert!(image.with_extension("json").exists());
            assert_eq!(record.settings.steps, 10);
            assert_eq!(record.settings.sampler.as_deref(), Some("euler_a"));
        }
    }

    #[test]
    fn test_batch_iterates_prompt_major_and_names_files() {
        let dir = tempdir().unwrap();
        let config = batch_config(dir.path());
        let mut pipeline = MockPipeline::default();

        let run = run_batch_config(&mut pipeline, &cpu_device(), &config).unwrap();
        let order: Vec<(&str, &str)> = run
            .summary
            .results
            .iter()
            .map(|r| (r.prompt.as_str(), r.base_model.as_str()))
            .collect();
        assert_eq!(order[0], ("a lighthouse", "juggernaut.safetensors"));
        assert_eq!(order[1], ("a lighthouse", "realvis.safetensors"));
        assert_eq!(order[2], ("a forest", "juggernaut.safetensors"));
        assert!(run.summary.results[1].filename.starts_with("combo_002_realvis_"));
        assert!(run.summary.results[1].filename.ends_with(".png"));
    }

    #[test]
    fn test_unloadable_model_fails_only_its_combinations() {
        let dir = tempdir().unwrap();
        let config = batch_config(dir.path());
        let mut pipeline = MockPipeline {
            missing_models: ["realvis.safetensors".to_string()].into_iter().collect(),
            ..MockPipeline::default()
        };

        let run = run_batch_config(&mut pipeline, &cpu_device(), &config).unwrap();
        assert_eq!(run.summary.total_images, 3);
        assert_eq!(run.summary.failed, 3);
        assert!(run
            .summary
            .results
            .iter()
            .all(|r| r.base_model == "juggernaut.safetensors"));
    }

    #[test]
    fn test_models_reload_only_when_base_changes() {
        let dir = tempdir().unwrap();
        let mut config = batch_config(dir.path());
        config.models.base.truncate(1);
        let mut pipeline = MockPipeline::default();

        run_batch_config(&mut pipeline, &cpu_device(), &config).unwrap();
        assert_eq!(pipeline.loads, vec!["juggernaut.safetensors".to_string()]);
    }

    #[test]
    fn test_single_prompt_mode() {
        let dir = tempdir().unwrap();
        let mut job = SinglePromptJob::new("mountain landscape");
        job.count = 3;
        job.output_root = dir.path().to_path_buf();
        let models = ModelSelection {
            base: "base.safetensors".to_string(),
            refiner: Some("refiner.safetensors".to_string()),
            loras: vec![LoraRef { name: "sharp".to_string(), weight: 0.8 }],
        };
        let mut pipeline = MockPipeline {
            fail_on_calls: [2].into_iter().collect(),
            ..MockPipeline::default()
        };

        let run = run_single_prompt(&mut pipeline, &cpu_device(), &models, &job).unwrap();
        assert_eq!(run.summary.mode, RunMode::SinglePrompt);
        assert_eq!(run.summary.total_images, 2);
        assert_eq!(run.summary.failed, 1);

        let first = &run.summary.results[0];
        assert!(first.filename.starts_with("img_01_"));
        assert_eq!(first.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert!(first.has_refiner());
        assert!(first.has_loras());
        // Fixed single-prompt steps win over the CPU profile's 20; resolution is clamped.
        assert_eq!(first.settings.steps, DEFAULT_SINGLE_PROMPT_STEPS);
        assert_eq!((first.settings.width, first.settings.height), (768, 768));
        assert!(run.summary.results[1].filename.starts_with("img_03_"));
    }

    #[test]
    fn test_batch_config_parsing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("batch.json");
        fs::write(
            &path,
            r#"{
                "output_dir": "out",
                "prompts": [{"positive": "a cat", "negative": "dog"}, {"positive": "a bird"}],
                "models": {"base": ["a.safetensors", "b.safetensors"]},
                "settings": {"steps": 25, "cfg_scale": 7.0, "width": 1024, "height": 768}
            }"#,
        )
        .unwrap();

        let config = BatchConfig::load(&path).unwrap();
        assert_eq!(config.combinations(), 4);
        assert_eq!(config.prompts[1].negative, "");
        assert_eq!(config.settings.steps, Some(25));
        assert!(config.models.loras.is_empty());

        fs::write(&path, r#"{"output_dir": "out"}"#).unwrap();
        assert!(matches!(BatchConfig::load(&path), Err(Error::Json { .. })));
    }

    #[test]
    fn test_refiner_none_string_is_absent() {
        let record: ResultRecord = serde_json::from_str(
            r#"{"filename": "x.png", "base_model": "base", "refiner_model": "None",
                "loras": [], "prompt": "p", "settings": {"steps": 30, "cfg_scale": 7.0, "width": 1024, "height": 1024}}"#,
        )
        .unwrap();
        assert!(!record.has_refiner());
        assert_eq!(record.negative_prompt, "");
    }
}
