// src/gallery.rs
// Static HTML comparison page for loaded results. The page is a single file
// with embedded CSS and a small script that filters cards client-side; it is
// written next to the results directory so image paths stay relative.

use crate::error::{Error, Result};
use crate::viewer::ResultsViewer;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_HTML_FILE: &str = "comparison.html";

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Batch Results</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .gallery { display: grid; grid-template-columns: repeat(auto-fill, minmax(300px, 1fr)); gap: 20px; }
        .image-card { border: 1px solid #ddd; padding: 10px; border-radius: 5px; }
        .image-card img { width: 100%; height: auto; cursor: pointer; }
        .metadata { font-size: 12px; margin-top: 10px; }
        .filters { margin-bottom: 20px; padding: 20px; background: #f5f5f5; border-radius: 5px; }
        .filter-group { margin-bottom: 10px; }
    </style>
</head>
<body>
    <h1>Batch Results</h1>

    <div class="filters">
        <h3>Filters</h3>
        <div class="filter-group">
            <input type="text" id="searchBox" placeholder="Search prompts..." onkeyup="filterImages()">
        </div>
        <div class="filter-group">
            <label><input type="checkbox" id="showRefiner" checked onchange="filterImages()"> Show with refiner</label>
            <label><input type="checkbox" id="showNoRefiner" checked onchange="filterImages()"> Show without refiner</label>
        </div>
        <div class="filter-group">
            <label><input type="checkbox" id="showLoras" checked onchange="filterImages()"> Show with LoRAs</label>
            <label><input type="checkbox" id="showNoLoras" checked onchange="filterImages()"> Show without LoRAs</label>
        </div>
    </div>

    <div class="gallery" id="gallery">
"#;

const PAGE_TAIL: &str = r#"    </div>

    <script>
    function filterImages() {
        const searchTerm = document.getElementById('searchBox').value.toLowerCase();
        const showRefiner = document.getElementById('showRefiner').checked;
        const showNoRefiner = document.getElementById('showNoRefiner').checked;
        const showLoras = document.getElementById('showLoras').checked;
        const showNoLoras = document.getElementById('showNoLoras').checked;

        document.querySelectorAll('.image-card').forEach(card => {
            const prompt = card.getAttribute('data-prompt');
            const hasRefiner = card.getAttribute('data-has-refiner') === 'true';
            const hasLoras = card.getAttribute('data-has-loras') === 'true';

            let show = true;
            if (searchTerm && !prompt.includes(searchTerm)) show = false;
            if (hasRefiner && !showRefiner) show = false;
            if (!hasRefiner && !showNoRefiner) show = false;
            if (hasLoras && !showLoras) show = false;
            if (!hasLoras && !showNoLoras) show = false;

            card.style.display = show ? 'block' : 'none';
        });
    }
    </script>
</body>
</html>
"#;

/// Directory the page is written to: the parent of the results directory.
pub fn page_root(results_dir: &Path) -> PathBuf {
    match (results_dir.file_name(), results_dir.parent()) {
        (Some(_), Some(parent)) => parent.to_path_buf(),
        _ => results_dir.to_path_buf(),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

// URL-style relative path from the page to an image.
fn relative_src(image: &Path, root: &Path) -> String {
    let relative = image.strip_prefix(root).unwrap_or(image);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Render the page. Results whose image file is missing get no card.
pub fn render(viewer: &ResultsViewer) -> String {
    let root = page_root(viewer.results_dir());
    let mut html = String::from(PAGE_HEAD);

    for (idx, result) in viewer.results().iter().enumerate() {
        if !result.full_path.exists() {
            continue;
        }
        let record = &result.record;
        let lora_names: Vec<&str> = record.loras.iter().map(|l| l.name.as_str()).collect();
        let lora_names = if lora_names.is_empty() {
            "None".to_string()
        } else {
            lora_names.join(", ")
        };

        html.push_str(&format!(
            r#"        <div class="image-card" data-index="{idx}"
             data-prompt="{prompt_lower}"
             data-has-refiner="{has_refiner}"
             data-has-loras="{has_loras}">
            <img src="{src}" onclick="window.open(this.src)" alt="Result {idx}">
            <div class="metadata">
                <strong>Index:</strong> {idx}<br>
                <strong>Base:</strong> {base}<br>
                <strong>Refiner:</strong> {refiner}<br>
                <strong>LoRAs:</strong> {loras}<br>
                <strong>Steps:</strong> {steps}<br>
                <strong>CFG:</strong> {cfg}<br>
                <details>
                    <summary>Prompt</summary>
                    <p>{prompt}</p>
                </details>
            </div>
        </div>
"#,
            idx = idx,
            prompt_lower = escape_html(&record.prompt.to_lowercase()),
            has_refiner = record.has_refiner(),
            has_loras = record.has_loras(),
            src = escape_html(&relative_src(&result.full_path, &root)),
            base = escape_html(&record.base_model),
            refiner = escape_html(record.refiner_model.as_deref().unwrap_or("None")),
            loras = escape_html(&lora_names),
            steps = record.settings.steps,
            cfg = record.settings.cfg_scale,
            prompt = escape_html(&record.prompt),
        ));
    }

    html.push_str(PAGE_TAIL);
    html
}

/// Write the page as `file_name` next to the results directory.
pub fn write_comparison_html(viewer: &ResultsViewer, file_name: &str) -> Result<PathBuf> {
    let path = page_root(viewer.results_dir()).join(file_name);
    fs::write(&path, render(viewer)).map_err(|source| Error::Write {
        path: path.clone(),
        source,
    })?;
    println!("\nComparison HTML created: {}", path.display());
    println!("Open in browser to view and compare all results");
    Ok(path)
}
