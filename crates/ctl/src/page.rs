//! Page and script loading for `start`

use anyhow::Context;
use dom::{DomService, PageScript};
use sandbox::Fetcher;
use std::path::{Path, PathBuf};

/// Read the page from `path`, or fetch the page URL when none is given
pub async fn load_html(path: Option<&Path>, fetcher: &dyn Fetcher) -> anyhow::Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read page {}", path.display())),
        None => {
            let url = fetcher.origin().clone();
            let fetched = fetcher
                .get(&url)
                .await
                .with_context(|| format!("failed to fetch page {}", url))?;
            Ok(fetched.text())
        }
    }
}

/// Script texts in run order. Explicit files replace the page's own scripts.
pub async fn load_scripts(
    files: &[PathBuf],
    dom: &DomService,
    fetcher: &dyn Fetcher,
) -> anyhow::Result<Vec<String>> {
    if !files.is_empty() {
        let mut scripts = Vec::with_capacity(files.len());
        for file in files {
            let script = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("failed to read script {}", file.display()))?;
            scripts.push(script);
        }
        return Ok(scripts);
    }

    let mut scripts = Vec::new();
    for script in dom.scripts().context("failed to collect page scripts")? {
        match script {
            PageScript::Inline(code) => scripts.push(code),
            PageScript::External(src) => match fetch_script(&src, fetcher).await {
                Ok(code) => scripts.push(code),
                Err(err) => tracing::warn!(src = %src, "Skipping script: {:#}", err),
            },
        }
    }
    tracing::info!(count = scripts.len(), "Collected page scripts");
    Ok(scripts)
}

async fn fetch_script(src: &str, fetcher: &dyn Fetcher) -> anyhow::Result<String> {
    let url = fetcher.linked_url(src)?;
    let fetched = fetcher.get(&url).await?;
    Ok(fetched.text())
}
