//! On-disk model artifact cache with an explicit manifest.
//!
//! Artifacts stream into `<cache_dir>/<filename>` through a `.tmp` rename,
//! and a manifest record is written only once the download completed, so a
//! torn download never reads as cached. Eviction happens only through
//! [`clear_cache`], never automatically.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use {
    futures::StreamExt,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tokio::io::AsyncWriteExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    engine::{Backend, ProgressReport},
    error::InitError,
    models::ModelDef,
};

const MANIFEST_FILENAME: &str = "manifest.json";
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Share of the init progress bar taken by the download; the rest is weight
/// loading.
const DOWNLOAD_PROGRESS_SHARE: f32 = 0.85;

/// Byte-level progress for one artifact download.
#[derive(Debug, Clone, Copy)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Total bytes (if known from Content-Length).
    pub total: Option<u64>,
}

/// One completed download, recorded at completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub model_id: String,
    pub backend: Backend,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Manifest of completed downloads, stored next to the artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheManifest {
    pub entries: Vec<CacheEntry>,
}

fn manifest_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(MANIFEST_FILENAME)
}

/// Load the cache manifest; missing or corrupt manifests read as empty.
#[must_use]
pub fn load_manifest(cache_dir: &Path) -> CacheManifest {
    let path = manifest_path(cache_dir);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return CacheManifest::default();
    };
    match serde_json::from_str(&raw) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt cache manifest, treating as empty");
            CacheManifest::default()
        },
    }
}

fn store_manifest(cache_dir: &Path, manifest: &CacheManifest) -> std::io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let raw = serde_json::to_string_pretty(manifest).map_err(std::io::Error::other)?;
    std::fs::write(manifest_path(cache_dir), raw)
}

/// Record a completed download, replacing any prior record for the same
/// model + backend.
pub(crate) fn record_entry(cache_dir: &Path, entry: CacheEntry) -> std::io::Result<()> {
    let mut manifest = load_manifest(cache_dir);
    manifest
        .entries
        .retain(|e| !(e.model_id == entry.model_id && e.backend == entry.backend));
    manifest.entries.push(entry);
    store_manifest(cache_dir, &manifest)
}

/// Whether the artifact for `backend` completed downloading.
///
/// Requires both the manifest record and the artifact file: a file without a
/// record is a torn download, a record without a file was evicted externally.
#[must_use]
pub fn is_model_cached(model: &ModelDef, backend: Backend, cache_dir: &Path) -> bool {
    let recorded = load_manifest(cache_dir)
        .entries
        .iter()
        .any(|e| e.model_id == model.id && e.backend == backend);
    recorded && cache_dir.join(model.artifact(backend)).exists()
}

/// Whether the model is cached for any backend.
#[must_use]
pub fn is_cached_any(model: &ModelDef, cache_dir: &Path) -> bool {
    is_model_cached(model, Backend::Accelerated, cache_dir)
        || is_model_cached(model, Backend::Cpu, cache_dir)
}

/// Map byte progress into the shared init progress scale.
pub(crate) fn download_report(progress: DownloadProgress) -> ProgressReport {
    let mb = |bytes: u64| bytes / (1024 * 1024);
    match progress.total {
        Some(total) if total > 0 => ProgressReport::new(
            DOWNLOAD_PROGRESS_SHARE * (progress.downloaded as f32 / total as f32),
            format!(
                "Downloading model ({}/{} MB)",
                mb(progress.downloaded),
                mb(total)
            ),
        ),
        _ => ProgressReport::new(
            0.0,
            format!("Downloading model ({} MB)", mb(progress.downloaded)),
        ),
    }
}

/// Ensure the artifact for `backend` is cached, downloading it if needed.
///
/// `cancel` is checked before any work and at every received chunk; a
/// cancelled download removes its temp file and fails with
/// [`InitError::Cancelled`].
pub async fn ensure_artifact(
    model: &ModelDef,
    backend: Backend,
    cache_dir: &Path,
    on_progress: &mut (dyn FnMut(DownloadProgress) + Send),
    cancel: &CancellationToken,
) -> Result<PathBuf, InitError> {
    if cancel.is_cancelled() {
        return Err(InitError::Cancelled);
    }

    let artifact_path = cache_dir.join(model.artifact(backend));
    if is_model_cached(model, backend, cache_dir) {
        info!(path = %artifact_path.display(), model = model.id, "model found in cache");
        return Ok(artifact_path);
    }

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| InitError::Download(format!("creating cache dir: {e}")))?;

    let url = model.artifact_url(backend);
    info!(url = %url, model = model.id, backend = %backend, "downloading model artifact");

    let response = reqwest::get(&url)
        .await
        .map_err(|e| InitError::Download(e.to_string()))?
        .error_for_status()
        .map_err(|e| InitError::Download(e.to_string()))?;

    let total = response.content_length();
    let mut downloaded: u64 = 0;

    on_progress(DownloadProgress { downloaded, total });

    let tmp_path = artifact_path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| InitError::Download(format!("creating temp file: {e}")))?;

    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();
    let mut last_report = Instant::now();

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            info!(model = model.id, backend = %backend, "model download cancelled");
            return Err(InitError::Cancelled);
        }

        let chunk = chunk.map_err(|e| InitError::Download(format!("reading chunk: {e}")))?;
        downloaded += chunk.len() as u64;
        hasher.update(&chunk);

        file.write_all(&chunk)
            .await
            .map_err(|e| InitError::Download(format!("writing chunk: {e}")))?;

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            on_progress(DownloadProgress { downloaded, total });
            last_report = Instant::now();
        }
    }

    on_progress(DownloadProgress { downloaded, total });

    file.flush()
        .await
        .map_err(|e| InitError::Download(format!("flushing file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, &artifact_path)
        .await
        .map_err(|e| InitError::Download(format!("renaming artifact: {e}")))?;

    let sha256 = format!("{:x}", hasher.finalize());
    let entry = CacheEntry {
        model_id: model.id.to_string(),
        backend,
        filename: model.artifact(backend).to_string(),
        size_bytes: downloaded,
        sha256,
    };
    // The download itself succeeded; a failed record only means the next
    // launch re-fetches.
    if let Err(e) = record_entry(cache_dir, entry) {
        warn!(error = %e, model = model.id, "failed to record cache manifest entry");
    }

    info!(
        path = %artifact_path.display(),
        size_mb = downloaded / (1024 * 1024),
        model = model.id,
        "model artifact downloaded"
    );

    Ok(artifact_path)
}

/// Delete every cached artifact recorded in the manifest, best effort per
/// entry. Safe to call when the cache was never populated. Returns the number
/// of artifacts removed.
pub async fn clear_cache(cache_dir: &Path) -> usize {
    let manifest = load_manifest(cache_dir);
    let mut removed = 0;

    for entry in &manifest.entries {
        let path = cache_dir.join(&entry.filename);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "deleted cached artifact");
                removed += 1;
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove cached artifact");
            },
        }
    }

    let _ = tokio::fs::remove_file(manifest_path(cache_dir)).await;
    info!(removed, "model cache cleared");
    removed
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models, testing};

    #[test]
    fn manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CacheEntry {
            model_id: "llama-3.2-1b-instruct-q4_k_m".into(),
            backend: Backend::Cpu,
            filename: "Llama-3.2-1B-Instruct-Q3_K_L.gguf".into(),
            size_bytes: 42,
            sha256: "0".repeat(64),
        };
        record_entry(dir.path(), entry.clone()).unwrap();

        let manifest = load_manifest(dir.path());
        assert_eq!(manifest.entries, vec![entry]);
    }

    #[test]
    fn record_replaces_same_model_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = CacheEntry {
            model_id: "m".into(),
            backend: Backend::Cpu,
            filename: "a.gguf".into(),
            size_bytes: 1,
            sha256: "0".repeat(64),
        };
        record_entry(dir.path(), entry.clone()).unwrap();
        entry.size_bytes = 2;
        record_entry(dir.path(), entry.clone()).unwrap();

        let manifest = load_manifest(dir.path());
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].size_bytes, 2);
    }

    #[test]
    fn missing_manifest_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_manifest(dir.path()).entries.is_empty());
    }

    #[test]
    fn corrupt_manifest_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(manifest_path(dir.path()), "{not json").unwrap();
        assert!(load_manifest(dir.path()).entries.is_empty());
    }

    #[test]
    fn cached_requires_record_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = models::find_model(models::DEFAULT_MODEL_ID).unwrap();

        // Nothing present.
        assert!(!is_model_cached(model, Backend::Cpu, dir.path()));

        // File without a record is a torn download.
        let path = dir.path().join(model.artifact(Backend::Cpu));
        std::fs::write(&path, b"weights").unwrap();
        assert!(!is_model_cached(model, Backend::Cpu, dir.path()));

        // Record completes the pair.
        testing::seed_artifact(model, Backend::Cpu, dir.path());
        assert!(is_model_cached(model, Backend::Cpu, dir.path()));

        // Record without the file means external eviction.
        std::fs::remove_file(&path).unwrap();
        assert!(!is_model_cached(model, Backend::Cpu, dir.path()));
    }

    #[test]
    fn backends_cache_independently() {
        let dir = tempfile::tempdir().unwrap();
        let model = models::find_model(models::DEFAULT_MODEL_ID).unwrap();
        testing::seed_artifact(model, Backend::Cpu, dir.path());

        assert!(is_model_cached(model, Backend::Cpu, dir.path()));
        assert!(!is_model_cached(model, Backend::Accelerated, dir.path()));
        assert!(is_cached_any(model, dir.path()));
    }

    #[tokio::test]
    async fn ensure_artifact_returns_cached_path_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let model = models::find_model(models::DEFAULT_MODEL_ID).unwrap();
        testing::seed_artifact(model, Backend::Cpu, dir.path());

        let mut reports = Vec::new();
        let path = ensure_artifact(
            model,
            Backend::Cpu,
            dir.path(),
            &mut |p| reports.push(p),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(path, dir.path().join(model.artifact(Backend::Cpu)));
        assert!(reports.is_empty(), "cached artifact needs no download");
    }

    #[tokio::test]
    async fn ensure_artifact_honors_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let model = models::find_model(models::DEFAULT_MODEL_ID).unwrap();
        testing::seed_artifact(model, Backend::Cpu, dir.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result =
            ensure_artifact(model, Backend::Cpu, dir.path(), &mut |_| {}, &cancel).await;
        assert_eq!(result, Err(InitError::Cancelled));
    }

    #[tokio::test]
    async fn clear_cache_is_safe_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(clear_cache(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn clear_cache_removes_recorded_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let model = models::find_model(models::DEFAULT_MODEL_ID).unwrap();
        testing::seed_artifact(model, Backend::Cpu, dir.path());
        testing::seed_artifact(model, Backend::Accelerated, dir.path());

        assert_eq!(clear_cache(dir.path()).await, 2);
        assert!(!is_cached_any(model, dir.path()));
        assert!(load_manifest(dir.path()).entries.is_empty());
    }

    #[test]
    fn download_report_mapping() {
        let report = download_report(DownloadProgress {
            downloaded: 50 * 1024 * 1024,
            total: Some(100 * 1024 * 1024),
        });
        assert!((report.fraction - 0.425).abs() < 1e-3);
        assert!(report.text.contains("50/100 MB"));

        let unknown = download_report(DownloadProgress {
            downloaded: 10 * 1024 * 1024,
            total: None,
        });
        assert_eq!(unknown.fraction, 0.0);
    }
}
