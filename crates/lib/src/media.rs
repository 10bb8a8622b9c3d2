//! Media handling: image persistence for vision calls and voice-note
//! transcription (ffmpeg transcode, then a multipart transcription upload).

use crate::llm::retry::{self, RetryPolicy};
use crate::llm::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Audio bytes in, transcript text out. Seam for tests and the resolver.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, ProviderError>;
}

/// Writes inbound images to a public directory and hands back their URL.
#[derive(Clone)]
pub struct MediaStore {
    dir: PathBuf,
    public_base_url: String,
}

impl MediaStore {
    pub fn new(dir: PathBuf, public_base_url: impl Into<String>) -> Self {
        Self {
            dir,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Persist an image under `{timestamp}_{message_id}.{ext}` and return its
    /// public URL. Re-persisting the same message is a no-op returning the
    /// same URL. I/O failures are logged and yield `None`; the caller treats
    /// the message as text-only.
    pub async fn persist_image(
        &self,
        bytes: &[u8],
        mime_type: &str,
        message_id: &str,
        timestamp: i64,
    ) -> Option<String> {
        let ext = extension_for(mime_type);
        let filename = format!("{}_{}.{}", timestamp, message_id, ext);
        let path = self.dir.join(&filename);
        let url = format!("{}/{}", self.public_base_url, filename);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Some(url);
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            log::warn!("creating media dir {} failed: {}", self.dir.display(), e);
            return None;
        }
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => Some(url),
            Err(e) => {
                log::warn!("persisting image {} failed: {}", path.display(), e);
                None
            }
        }
    }
}

/// Subtype of the mime type ("image/jpeg" → "jpeg"), "bin" when missing.
fn extension_for(mime_type: &str) -> &str {
    match mime_type.split('/').nth(1) {
        Some(ext) if !ext.is_empty() => ext,
        _ => "bin",
    }
}

/// Client for an OpenAI-style audio transcription endpoint. Voice notes
/// arrive as ogg/opus and are transcoded to mp3 with ffmpeg first.
#[derive(Clone)]
pub struct WhisperTranscriber {
    base_url: String,
    api_key: Option<String>,
    model: String,
    scratch_dir: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
    client: reqwest::Client,
    missing_key_logged: Arc<AtomicBool>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: Option<String>,
}

impl WhisperTranscriber {
    pub fn new(api_key: Option<String>, base_url: Option<String>, model: impl Into<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
            scratch_dir: std::env::temp_dir(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
            missing_key_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_policy(mut self, timeout: Duration, retry: RetryPolicy) -> Self {
        self.timeout = timeout;
        self.retry = retry;
        self
    }

    #[cfg(test)]
    fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = dir;
        self
    }

    /// ogg → mp3 via ffmpeg. Arguments are passed as a list; nothing is
    /// interpolated through a shell.
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), ProviderError> {
        let result = Command::new("ffmpeg")
            .arg("-i")
            .arg(input)
            .arg("-y")
            .arg(output)
            .output()
            .await?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ProviderError::Api(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn upload(&self, mp3: Vec<u8>, key: &str) -> Result<String, ProviderError> {
        let url = format!("{}/audio/transcriptions", self.base_url);
        let mut attempt: u32 = 0;
        loop {
            // Form is not reusable across attempts; rebuild it each time.
            let part = reqwest::multipart::Part::bytes(mp3.clone())
                .file_name("voice.mp3")
                .mime_str("audio/mpeg")
                .map_err(|e| ProviderError::Api(e.to_string()))?;
            let form = reqwest::multipart::Form::new()
                .part("file", part)
                .text("model", self.model.clone());
            let sent = self
                .client
                .post(&url)
                .bearer_auth(key)
                .timeout(self.timeout)
                .multipart(form)
                .send()
                .await;
            let err: ProviderError = match sent {
                Ok(res) if res.status().is_success() => {
                    let data: TranscriptionResponse = res.json().await?;
                    return Ok(data.text.unwrap_or_default().trim().to_string());
                }
                Ok(res) => {
                    let status = res.status();
                    let text = res.text().await.unwrap_or_default();
                    if !retry::is_recoverable_status(status.as_u16()) {
                        return Err(ProviderError::Api(format!("{} {}", status, text)));
                    }
                    ProviderError::Api(format!("{} {}", status, text))
                }
                Err(e) => ProviderError::Request(e),
            };
            if attempt >= self.retry.max_retries {
                return Err(err);
            }
            let delay = retry::delay_for_attempt(&self.retry, attempt);
            log::debug!(
                "transcription attempt {} failed ({}), retrying in {:?}",
                attempt + 1,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, ProviderError> {
        if audio.is_empty() {
            return Err(ProviderError::EmptyInput);
        }
        let key = match self.api_key.as_deref() {
            Some(k) => k.to_string(),
            None => {
                if !self.missing_key_logged.swap(true, Ordering::SeqCst) {
                    log::warn!("OPENAI_API_KEY not configured; transcription unavailable");
                }
                return Err(ProviderError::Unconfigured("OPENAI_API_KEY"));
            }
        };
        let stem = uuid::Uuid::new_v4().to_string();
        let ogg_path = self.scratch_dir.join(format!("{}.ogg", stem));
        let mp3_path = self.scratch_dir.join(format!("{}.mp3", stem));
        let _guard = ScratchGuard {
            paths: vec![ogg_path.clone(), mp3_path.clone()],
        };
        tokio::fs::write(&ogg_path, audio).await?;
        self.transcode(&ogg_path, &mp3_path).await?;
        let mp3 = tokio::fs::read(&mp3_path).await?;
        self.upload(mp3, &key).await
    }
}

/// Removes scratch files when the transcription attempt ends, on every exit
/// path including errors.
struct ScratchGuard {
    paths: Vec<PathBuf>,
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::debug!("removing scratch file {} failed: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_comes_from_mime_subtype() {
        assert_eq!(extension_for("image/jpeg"), "jpeg");
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("weird"), "bin");
    }

    #[tokio::test]
    async fn persist_image_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().to_path_buf(), "https://media.example.com/files/");

        let url = store
            .persist_image(b"jpegbytes", "image/jpeg", "msg42", 1_700_000_000)
            .await
            .unwrap();
        assert_eq!(url, "https://media.example.com/files/1700000000_msg42.jpeg");

        // Second persist with different bytes must not rewrite the file.
        let again = store
            .persist_image(b"other", "image/jpeg", "msg42", 1_700_000_000)
            .await
            .unwrap();
        assert_eq!(again, url);
        let on_disk = std::fs::read(dir.path().join("1700000000_msg42.jpeg")).unwrap();
        assert_eq!(on_disk, b"jpegbytes");
    }

    #[tokio::test]
    async fn unwritable_media_dir_yields_none() {
        let store = MediaStore::new(
            PathBuf::from("/proc/nonexistent/media"),
            "https://media.example.com",
        );
        assert!(store
            .persist_image(b"x", "image/png", "m1", 1)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn missing_key_short_circuits_before_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let transcriber = WhisperTranscriber::new(None, None, "whisper-1")
            .with_scratch_dir(dir.path().to_path_buf());
        let err = transcriber.transcribe(b"oggdata").await.unwrap_err();
        assert!(err.is_unconfigured());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn scratch_guard_removes_files_it_owns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.ogg");
        std::fs::write(&path, b"x").unwrap();
        drop(ScratchGuard {
            paths: vec![path.clone(), dir.path().join("never-created.mp3")],
        });
        assert!(!path.exists());
    }
}
