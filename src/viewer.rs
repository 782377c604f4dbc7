// src/viewer.rs
// Results viewer: loads every batch_summary.json under a results directory,
// flattens the records, and offers filtering, statistics and copying of
// selected images.

use crate::batch::{BatchSummary, ResultRecord, SUMMARY_FILE};
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// How many LoRAs the printed statistics list.
pub const TOP_LORAS: usize = 10;

/// A result record together with where it was loaded from.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedResult {
    pub batch: String,
    pub full_path: PathBuf,
    pub record: ResultRecord,
}

/// Conjunction of optional predicates; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFilter {
    pub base_model: Option<String>,
    pub has_refiner: Option<bool>,
    pub has_loras: Option<bool>,
    pub prompt_contains: Option<String>,
}

impl ResultFilter {
    /// Build a filter from command-line values. Empty text means "no filter".
    pub fn new(
        base_model: Option<String>,
        has_refiner: Option<bool>,
        has_loras: Option<bool>,
        prompt_contains: Option<String>,
    ) -> Self {
        ResultFilter {
            base_model: base_model.filter(|text| !text.is_empty()),
            has_refiner,
            has_loras,
            prompt_contains: prompt_contains.filter(|text| !text.is_empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ResultFilter::default()
    }

    pub fn matches(&self, record: &ResultRecord) -> bool {
        if let Some(base) = &self.base_model {
            if !record.base_model.contains(base.as_str()) {
                return false;
            }
        }
        if let Some(want) = self.has_refiner {
            if record.has_refiner() != want {
                return false;
            }
        }
        if let Some(want) = self.has_loras {
            if record.has_loras() != want {
                return false;
            }
        }
        if let Some(needle) = &self.prompt_contains {
            if !record.prompt.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Image counts per grouping key, most used first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub total: usize,
    pub base_models: Vec<(String, usize)>,
    pub refiner_models: Vec<(String, usize)>,
    pub loras: Vec<(String, usize)>,
}

fn sorted_counts(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}

pub fn render_statistics(stats: &Statistics) -> String {
    let mut out = String::from("\n=== Batch Results Statistics ===\n");
    out.push_str(&format!("Total images: {}\n", stats.total));

    out.push_str("\nBase Models Used:\n");
    for (model, count) in &stats.base_models {
        out.push_str(&format!("  {}: {} images\n", model, count));
    }
    out.push_str("\nRefiner Models Used:\n");
    for (model, count) in &stats.refiner_models {
        out.push_str(&format!("  {}: {} images\n", model, count));
    }
    if !stats.loras.is_empty() {
        out.push_str("\nLoRA Models Used:\n");
        for (model, count) in stats.loras.iter().take(TOP_LORAS) {
            out.push_str(&format!("  {}: {} images\n", model, count));
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ResultsViewer {
    results_dir: PathBuf,
    results: Vec<LoadedResult>,
}

impl ResultsViewer {
    /// Load every `<dir>/<batch>/batch_summary.json`, visiting batches in
    /// name order so indices are stable between invocations. Directories
    /// without a summary are skipped; an unreadable summary is an error.
    pub fn load(results_dir: impl Into<PathBuf>) -> Result<Self> {
        let results_dir = results_dir.into();
        let entries = fs::read_dir(&results_dir).map_err(|source| Error::Read {
            path: results_dir.clone(),
            source,
        })?;

        let mut batch_dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::Read {
                path: results_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                batch_dirs.push(path);
            }
        }
        batch_dirs.sort();

        let mut results = Vec::new();
        for batch_dir in batch_dirs {
            let summary_file = batch_dir.join(SUMMARY_FILE);
            if !summary_file.exists() {
                log::debug!("Skipping {}: no {}", batch_dir.display(), SUMMARY_FILE);
                continue;
            }
            let summary = BatchSummary::load(&summary_file)?;
            let batch = batch_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for record in summary.results {
                results.push(LoadedResult {
                    batch: batch.clone(),
                    full_path: batch_dir.join(&record.filename),
                    record,
                });
            }
        }

        let viewer = ResultsViewer { results_dir, results };
        println!(
            "Loaded {} results from {} batches",
            viewer.results.len(),
            viewer.batch_count()
        );
        Ok(viewer)
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn results(&self) -> &[LoadedResult] {
        &self.results
    }

    pub fn batch_count(&self) -> usize {
        self.results
            .iter()
            .map(|r| r.batch.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Matching results with their index in the full loaded list.
    pub fn filter(&self, filter: &ResultFilter) -> Vec<(usize, &LoadedResult)> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| filter.matches(&r.record))
            .collect()
    }

    pub fn statistics(&self) -> Statistics {
        let mut base_models = HashMap::new();
        let mut refiner_models = HashMap::new();
        let mut loras = HashMap::new();

        for result in &self.results {
            let record = &result.record;
            *base_models.entry(record.base_model.clone()).or_insert(0) += 1;
            let refiner = record.refiner_model.clone().unwrap_or_else(|| "None".to_string());
            *refiner_models.entry(refiner).or_insert(0) += 1;
            for lora in &record.loras {
                *loras.entry(lora.name.clone()).or_insert(0) += 1;
            }
        }

        Statistics {
            total: self.results.len(),
            base_models: sorted_counts(base_models),
            refiner_models: sorted_counts(refiner_models),
            loras: sorted_counts(loras),
        }
    }

    /// Copy the images (and their JSON metadata, when present) at `indices`
    /// into `output_dir`. Unknown indices and missing images are skipped.
    pub fn copy_best(&self, indices: &[usize], output_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir).map_err(|source| Error::Write {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let mut copied = Vec::new();
        for &idx in indices {
            let result = match self.results.get(idx) {
                Some(result) => result,
                None => {
                    log::warn!("Index {} out of range (0..{})", idx, self.results.len());
                    continue;
                }
            };
            let src_image = &result.full_path;
            if !src_image.exists() {
                log::warn!("Skipping index {}: {} is missing", idx, src_image.display());
                continue;
            }

            let name = src_image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let dst_image = output_dir.join(format!("best_{:04}_{}", idx, name));
            copy_file(src_image, &dst_image)?;

            let src_metadata = src_image.with_extension("json");
            if src_metadata.exists() {
                copy_file(&src_metadata, &dst_image.with_extension("json"))?;
            }

            println!(
                "Copied: {}",
                dst_image.file_name().unwrap_or_default().to_string_lossy()
            );
            copied.push(dst_image);
        }
        Ok(copied)
    }
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map(|_| ()).map_err(|source| Error::Write {
        path: dst.to_path_buf(),
        source,
    })
}
