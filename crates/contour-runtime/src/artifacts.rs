//! Model files fetched before a backend starts.
//!
//! Only `https://` sources are contacted, and destination names are checked
//! before anything is written under the models directory.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use contour_core::{is_within_root, ContourError, Result};
use contour_observability::{emit_event, ObservabilityEvent, ProcessKind};
use reqwest::Url;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::Level;

pub const USER_AGENT: &str = "Contour-LLM-Download/1.0";

pub const DEFAULT_REVISION: &str = "main";

const MODEL_SUFFIX: &str = ".gguf";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub display_name: &'static str,
    pub repo: &'static str,
    pub file: &'static str,
}

const CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        display_name: "TinyLlama 1.1B Chat (Q4_K_M, ~0.7 GB)",
        repo: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
        file: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
    },
    CatalogEntry {
        display_name: "Phi-2 (Q4_K_M, ~1.6 GB)",
        repo: "TheBloke/phi-2-GGUF",
        file: "phi-2.Q4_K_M.gguf",
    },
    CatalogEntry {
        display_name: "Qwen2 0.5B Instruct (Q4_K_M, ~0.4 GB)",
        repo: "Qwen/Qwen2-0.5B-Instruct-GGUF",
        file: "qwen2-0.5b-instruct-q4_k_m.gguf",
    },
    CatalogEntry {
        display_name: "SmolLM2 360M Instruct (Q4_K_M, ~0.3 GB)",
        repo: "HuggingFaceTB/SmolLM2-360M-Instruct-GGUF",
        file: "smollm2-360m-instruct-q4_k_m.gguf",
    },
    CatalogEntry {
        display_name: "Mistral 7B Instruct v0.2 (Q4_K_M, ~4.4 GB)",
        repo: "TheBloke/Mistral-7B-Instruct-v0.2-GGUF",
        file: "mistral-7b-instruct-v0.2.Q4_K_M.gguf",
    },
    CatalogEntry {
        display_name: "Llama 3.2 1B Instruct (Q4_K_M, ~0.8 GB)",
        repo: "bartowski/Llama-3.2-1B-Instruct-GGUF",
        file: "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
    },
    CatalogEntry {
        display_name: "Llama 3.2 3B Instruct (Q4_K_M, ~2.0 GB)",
        repo: "bartowski/Llama-3.2-3B-Instruct-GGUF",
        file: "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
    },
];

pub fn downloadable_models() -> &'static [CatalogEntry] {
    CATALOG
}

/// Small model offered by default.
pub fn recommended_model() -> &'static CatalogEntry {
    &CATALOG[0]
}

/// Direct download URL of `file` in a Hugging Face repository.
pub fn hf_url(repo: &str, file: &str, revision: &str) -> String {
    let repo = repo.trim().trim_matches('/');
    let (org, name) = repo.split_once('/').unwrap_or((repo, repo));
    format!(
        "https://huggingface.co/{}/{}/resolve/{}/{}",
        org, name, revision, file
    )
}

/// Parses `url` and refuses anything but `https`.
pub fn validate_source(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)
        .map_err(|err| ContourError::UnsafeSource(format!("{url:?} is not a valid URL: {err}")))?;
    if parsed.scheme() != "https" {
        return Err(ContourError::UnsafeSource(format!(
            "scheme {:?} is not allowed; only https sources are fetched",
            parsed.scheme()
        )));
    }
    Ok(parsed)
}

/// Accepts a bare file name that stays inside the directory it is joined to.
pub fn validate_artifact_name(name: &str) -> Result<&str> {
    if name.trim().is_empty() {
        return Err(ContourError::UnsafePath("empty file name".to_string()));
    }
    if name.contains('\0') || name.contains('/') || name.contains('\\') || name.contains(':') {
        return Err(ContourError::UnsafePath(format!(
            "{name:?} must be a bare file name"
        )));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(ContourError::UnsafePath(format!(
            "{name:?} is not a plain file name"
        ))),
    }
}

/// File name a direct URL download is saved under: the last path segment,
/// without the query. Percent-encoded segments are refused; pass an explicit
/// name for those.
pub fn file_name_from_url(url: &Url) -> Result<String> {
    let segment = url
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or_default();
    if segment.contains('%') {
        return Err(ContourError::UnsafePath(format!(
            "{segment:?} contains encoded characters; choose an explicit file name"
        )));
    }
    validate_artifact_name(segment).map(str::to_string)
}

fn with_model_suffix(name: &str) -> String {
    let mut name = name.to_string();
    if !name.to_ascii_lowercase().ends_with(MODEL_SUFFIX) {
        name.push_str(MODEL_SUFFIX);
    }
    name
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_000_000.0 {
        format!("{:.1} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec >= 1_000.0 {
        format!("{:.0} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub percent: f32,
    pub speed: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

pub struct ArtifactFetcher {
    models_dir: PathBuf,
    client: reqwest::Client,
}

impl ArtifactFetcher {
    pub fn new(models_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .https_only(true)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| ContourError::Download(format!("failed to build HTTP client: {}", err)))?;
        Ok(Self {
            models_dir: models_dir.into(),
            client,
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// `.gguf` files in the models directory, sorted by name.
    pub async fn list_models(&self) -> Result<Vec<ModelFile>> {
        let mut entries = match tokio::fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut models = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.to_ascii_lowercase().ends_with(MODEL_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            models.push(ModelFile {
                name,
                path: entry.path(),
                size_bytes: metadata.len(),
            });
        }
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Removes a model file. Paths outside the models directory are refused;
    /// anything that is not an existing `.gguf` file is left alone.
    pub async fn delete_model(&self, path: &Path) -> Result<bool> {
        if !is_within_root(path, &self.models_dir) {
            return Err(ContourError::UnsafePath(format!(
                "{} is outside the models directory",
                path.display()
            )));
        }
        let is_model = path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase().ends_with(MODEL_SUFFIX))
            .unwrap_or(false);
        if !is_model || !tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file()) {
            return Ok(false);
        }
        tokio::fs::remove_file(path).await?;
        tracing::info!("Deleted model {}", path.display());
        Ok(true)
    }

    /// Downloads `hf_file` at `revision` from a Hugging Face repository into
    /// the models directory, saved as `output_name` when given.
    pub async fn download_model<F>(
        &self,
        repo: &str,
        hf_file: &str,
        revision: &str,
        output_name: Option<&str>,
        force: bool,
        progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(&DownloadProgress),
    {
        let name = with_model_suffix(output_name.unwrap_or(hf_file));
        self.fetch(&hf_url(repo, hf_file, revision), &name, force, progress)
            .await
    }

    /// Downloads an arbitrary `https` URL. Without `output_name` the file is
    /// named after the URL's last path segment.
    pub async fn download_url<F>(
        &self,
        url: &str,
        output_name: Option<&str>,
        force: bool,
        progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(&DownloadProgress),
    {
        let source = validate_source(url)?;
        let name = match output_name {
            Some(name) => with_model_suffix(name),
            None => with_model_suffix(&file_name_from_url(&source)?),
        };
        self.fetch(source.as_str(), &name, force, progress).await
    }

    pub async fn download_recommended<F>(&self, force: bool, progress: F) -> Result<PathBuf>
    where
        F: FnMut(&DownloadProgress),
    {
        let entry = recommended_model();
        self.download_model(entry.repo, entry.file, DEFAULT_REVISION, None, force, progress)
            .await
    }

    /// Streams `url` into `<models_dir>/<file_name>`. An existing file is
    /// kept unless `force` is set.
    pub async fn fetch<F>(
        &self,
        url: &str,
        file_name: &str,
        force: bool,
        mut progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(&DownloadProgress),
    {
        let source = validate_source(url)?;
        let file_name = validate_artifact_name(file_name)?;
        let dest = self.models_dir.join(file_name);
        if !force && tokio::fs::metadata(&dest).await.is_ok_and(|m| m.is_file()) {
            tracing::info!("Model {} already present; skipping download", dest.display());
            return Ok(dest);
        }
        tokio::fs::create_dir_all(&self.models_dir).await?;

        tracing::info!("Downloading {} from {}", file_name, source);
        let partial = self.models_dir.join(format!("{}.download", file_name));
        let result = self.stream_to(source, &partial, &mut progress).await;
        match result {
            Ok(downloaded) => {
                tokio::fs::rename(&partial, &dest).await?;
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "artifact.downloaded",
                        component: "artifacts",
                        status: Some("ok"),
                        detail: Some(file_name),
                        ..ObservabilityEvent::default()
                    },
                );
                tracing::debug!("Wrote {} bytes to {}", downloaded, dest.display());
                Ok(dest)
            }
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    tracing::debug!("Could not remove {}: {}", partial.display(), cleanup);
                }
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "artifact.download_failed",
                        component: "artifacts",
                        error_code: Some(err.code()),
                        detail: Some(file_name),
                        ..ObservabilityEvent::default()
                    },
                );
                Err(err)
            }
        }
    }

    async fn stream_to<F>(&self, source: Url, partial: &Path, progress: &mut F) -> Result<u64>
    where
        F: FnMut(&DownloadProgress),
    {
        let mut response = self
            .client
            .get(source)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| ContourError::Download(format!("failed to start download: {}", err)))?;
        let total = response.content_length();
        let mut file = tokio::fs::File::create(partial).await?;
        let mut downloaded: u64 = 0;
        let start_time = Instant::now();

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| ContourError::Download(format!("download error: {}", err)))?
        {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let elapsed = start_time.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                format_speed(downloaded as f64 / elapsed)
            } else {
                String::new()
            };
            let percent = match total {
                Some(total) if total > 0 => ((downloaded as f64 / total as f64) * 100.0).min(100.0) as f32,
                _ => 0.0,
            };
            progress(&DownloadProgress {
                downloaded,
                total,
                percent,
                speed,
            });
        }
        file.flush().await?;
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hf_url_splits_org_and_name() {
        assert_eq!(
            hf_url("TheBloke/phi-2-GGUF", "phi-2.Q4_K_M.gguf", "main"),
            "https://huggingface.co/TheBloke/phi-2-GGUF/resolve/main/phi-2.Q4_K_M.gguf"
        );
        assert_eq!(
            hf_url("/solo/", "m.gguf", "v1"),
            "https://huggingface.co/solo/solo/resolve/v1/m.gguf"
        );
    }

    #[test]
    fn only_https_sources_are_allowed() {
        assert!(validate_source("https://huggingface.co/a/b").is_ok());
        for url in ["http://huggingface.co/a/b", "ftp://host/x", "file:///etc/passwd", "nope"] {
            let err = validate_source(url).expect_err(url);
            assert!(matches!(err, ContourError::UnsafeSource(_)), "{url}");
        }
    }

    #[test]
    fn artifact_names_must_be_bare() {
        assert!(validate_artifact_name("tiny.gguf").is_ok());
        for name in ["", "  ", ".", "..", "../x.gguf", "a/b.gguf", "/abs.gguf", "C:evil.gguf", "a\\b"] {
            let err = validate_artifact_name(name).expect_err(name);
            assert!(matches!(err, ContourError::UnsafePath(_)), "{name:?}");
        }
    }

    #[test]
    fn url_file_name_is_the_last_segment_without_query() {
        let url = validate_source("https://host.example/m/tiny.gguf?download=true").expect("url");
        assert_eq!(file_name_from_url(&url).expect("name"), "tiny.gguf");
    }

    #[test]
    fn url_file_names_that_escape_the_models_dir_are_refused() {
        for url in [
            "https://host.example/",
            "https://host.example/models/..",
            "https://host.example/models/",
            "https://host.example/..%2F..%2Fetc%2Fpasswd",
            "https://host.example/%2e%2e",
            "https://host.example/a%5Cb.gguf",
        ] {
            let parsed = validate_source(url).expect(url);
            let err = file_name_from_url(&parsed).expect_err(url);
            assert!(matches!(err, ContourError::UnsafePath(_)), "{url}");
        }
    }

    #[tokio::test]
    async fn plain_http_url_download_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models = dir.path().join("models");
        let fetcher = ArtifactFetcher::new(&models).expect("fetcher");
        let err = fetcher
            .download_url("http://host.example/tiny.gguf", None, false, |_| {})
            .await
            .expect_err("http refused");
        assert!(matches!(err, ContourError::UnsafeSource(_)));
        assert!(!models.exists());
    }

    #[tokio::test]
    async fn traversal_url_download_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models = dir.path().join("models");
        let fetcher = ArtifactFetcher::new(&models).expect("fetcher");
        let err = fetcher
            .download_url("https://host.example/..%2F..%2Fevil.gguf", None, false, |_| {})
            .await
            .expect_err("traversal refused");
        assert!(matches!(err, ContourError::UnsafePath(_)));
        assert!(!models.exists());
        assert!(!dir.path().join("evil.gguf").exists());
    }

    #[tokio::test]
    async fn url_download_keeps_existing_file_named_after_the_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tiny.gguf"), b"gguf").expect("seed");
        let fetcher = ArtifactFetcher::new(dir.path()).expect("fetcher");
        let path = fetcher
            .download_url("https://invalid.invalid/files/tiny?x=1", None, false, |_| {})
            .await
            .expect("skipped");
        assert_eq!(path, dir.path().join("tiny.gguf"));
    }

    #[tokio::test]
    async fn revision_is_part_of_the_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("m.gguf"), b"gguf").expect("seed");
        let fetcher = ArtifactFetcher::new(dir.path()).expect("fetcher");
        let path = fetcher
            .download_model("org/repo", "m.gguf", "v2", None, false, |_| {})
            .await
            .expect("skipped");
        assert_eq!(path, dir.path().join("m.gguf"));
        assert_eq!(
            hf_url("org/repo", "m.gguf", "v2"),
            "https://huggingface.co/org/repo/resolve/v2/m.gguf"
        );
    }

    #[test]
    fn speed_is_humanized() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2_500.0), "2 KB/s");
        assert_eq!(format_speed(3_250_000.0), "3.2 MB/s");
    }

    #[test]
    fn catalog_recommends_a_small_model() {
        assert_eq!(downloadable_models().len(), 7);
        assert!(recommended_model().file.starts_with("tinyllama"));
        assert!(downloadable_models().iter().all(|m| m.file.ends_with(".gguf")));
    }

    #[tokio::test]
    async fn plain_http_fetch_is_rejected_before_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models = dir.path().join("models");
        let fetcher = ArtifactFetcher::new(&models).expect("fetcher");
        let err = fetcher
            .fetch("http://huggingface.co/a/b/resolve/main/m.gguf", "m.gguf", false, |_| {})
            .await
            .expect_err("http refused");
        assert!(matches!(err, ContourError::UnsafeSource(_)));
        assert!(!models.exists(), "nothing may be written");
    }

    #[tokio::test]
    async fn existing_model_is_kept_without_force() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tiny.gguf"), b"gguf").expect("seed");
        let fetcher = ArtifactFetcher::new(dir.path()).expect("fetcher");
        let path = fetcher
            .fetch("https://invalid.invalid/tiny.gguf", "tiny.gguf", false, |_| {})
            .await
            .expect("skipped");
        assert_eq!(path, dir.path().join("tiny.gguf"));
        assert_eq!(std::fs::read(&path).expect("read"), b"gguf");
    }

    #[tokio::test]
    async fn lists_and_deletes_models() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models = dir.path().join("models");
        std::fs::create_dir_all(&models).expect("models");
        std::fs::write(models.join("b.GGUF"), b"12").expect("b");
        std::fs::write(models.join("a.gguf"), b"1").expect("a");
        std::fs::write(models.join("notes.txt"), b"x").expect("notes");
        let outside = dir.path().join("c.gguf");
        std::fs::write(&outside, b"c").expect("outside");

        let fetcher = ArtifactFetcher::new(&models).expect("fetcher");
        let listed = fetcher.list_models().await.expect("list");
        let names: Vec<&str> = listed.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a.gguf", "b.GGUF"]);
        assert_eq!(listed[1].size_bytes, 2);

        assert!(!fetcher.delete_model(&models.join("notes.txt")).await.expect("txt"));
        let err = fetcher.delete_model(&outside).await.expect_err("outside");
        assert!(matches!(err, ContourError::UnsafePath(_)));
        assert!(outside.exists());

        assert!(fetcher.delete_model(&models.join("a.gguf")).await.expect("delete"));
        assert!(!models.join("a.gguf").exists());
    }

    #[tokio::test]
    async fn missing_models_dir_lists_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fetcher = ArtifactFetcher::new(dir.path().join("absent")).expect("fetcher");
        assert!(fetcher.list_models().await.expect("list").is_empty());
    }
}
