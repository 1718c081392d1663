//! Conversion of voice notes to Opus in an Ogg container.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tracing::debug;

use crate::error::TranscodeError;

#[async_trait]
pub trait Transcoder: Send + Sync + 'static {
    /// Read `input` and return it as Ogg/Opus suitable for a voice note.
    async fn to_opus_ogg(&self, input: &Path) -> Result<Bytes, TranscodeError>;
}

/// Shells out to `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn to_opus_ogg(&self, input: &Path) -> Result<Bytes, TranscodeError> {
        let output = tempfile::Builder::new()
            .prefix("tether-voice-")
            .suffix(".ogg")
            .tempfile()?;

        debug!(input = %input.display(), "Transcoding voice note");
        let result = Command::new(&self.program)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-c:a", "libopus", "-b:a", "32k", "-ar", "24000", "-application", "voip"])
            .args(["-f", "ogg"])
            .arg(output.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        let finished = match result {
            Ok(finished) => finished,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TranscodeError::Unavailable(format!(
                    "{} not found",
                    self.program.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if !finished.status.success() {
            let stderr = String::from_utf8_lossy(&finished.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(TranscodeError::Failed(format!("{}: {tail}", finished.status)));
        }

        let data = tokio::fs::read(output.path()).await?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/tether-ffmpeg");
        let err = transcoder
            .to_opus_ogg(Path::new("voice.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Unavailable(_)));
    }
}
