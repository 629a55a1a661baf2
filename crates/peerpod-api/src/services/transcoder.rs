//! Video transcoder
//!
//! The encoder itself is an external `ffmpeg` binary; the pod only decides input
//! and output paths and checks the exit status.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encode `input` to `output`, replacing `output` if it exists.
    async fn transcode(&self, input: &Path, output: &Path) -> Result<()>;
}

pub struct FfmpegTranscoder {
    ffmpeg_path: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_path: String) -> Result<Self> {
        let dangerous_chars = [';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r'];
        if ffmpeg_path.is_empty() || ffmpeg_path.chars().any(|c| dangerous_chars.contains(&c)) {
            return Err(anyhow!("Invalid ffmpeg_path: {:?}", ffmpeg_path));
        }
        Ok(Self { ffmpeg_path })
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    #[tracing::instrument(skip(self))]
    async fn transcode(&self, input: &Path, output: &Path) -> Result<()> {
        let args = [
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ];

        let result = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute ffmpeg")?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(anyhow!("FFmpeg transcode failed: {}", stderr.trim()));
        }

        tracing::debug!("Transcode finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_metacharacters_are_refused() {
        assert!(FfmpegTranscoder::new("ffmpeg; rm -rf /".to_string()).is_err());
        assert!(FfmpegTranscoder::new(String::new()).is_err());
        assert!(FfmpegTranscoder::new("/usr/bin/ffmpeg".to_string()).is_ok());
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let transcoder =
            FfmpegTranscoder::new("/nonexistent/peerpod-ffmpeg".to_string()).unwrap();
        let result = transcoder
            .transcode(Path::new("/tmp/in.webm"), Path::new("/tmp/out.mp4"))
            .await;
        assert!(result.is_err());
    }
}
