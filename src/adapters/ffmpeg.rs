//! Media processing backed by the `ffmpeg`/`ffprobe` binaries.

use crate::ports::media::{MediaProcessor, SourceInfo};
use async_trait::async_trait;
use serde::Deserialize;
use std::error::Error;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

type BoxError = Box<dyn Error + Send + Sync>;

pub struct FfmpegProcessor {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl Default for FfmpegProcessor {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

impl FfmpegProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binaries(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    async fn run(&self, bin: &str, args: &[&str]) -> Result<String, BoxError> {
        debug!(bin, ?args, "spawning media tool");
        let output = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(3)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("; ");
            return Err(format!("{bin} exited with {}: {tail}", output.status).into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    codec_name: Option<String>,
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn probe(&self, input: &Path) -> Result<SourceInfo, BoxError> {
        let input = input.to_string_lossy();
        let stdout = self
            .run(
                &self.ffprobe_bin,
                &[
                    "-v",
                    "error",
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=width,height,codec_name",
                    "-of",
                    "json",
                    &input,
                ],
            )
            .await?;

        let probed: ProbeOutput = serde_json::from_str(&stdout)?;
        let stream = probed
            .streams
            .into_iter()
            .next()
            .ok_or("no video stream found")?;
        match (stream.width, stream.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => Ok(SourceInfo {
                width,
                height,
                codec: stream.codec_name,
            }),
            _ => Err("video stream has no dimensions".into()),
        }
    }

    async fn duration_secs(&self, input: &Path) -> Result<f64, BoxError> {
        let input = input.to_string_lossy();
        let stdout = self
            .run(
                &self.ffprobe_bin,
                &[
                    "-v",
                    "error",
                    "-show_entries",
                    "format=duration",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                    &input,
                ],
            )
            .await?;

        let duration: f64 = stdout.trim().parse()?;
        if !duration.is_finite() || duration < 0.0 {
            return Err(format!("unusable duration: {duration}").into());
        }
        Ok(duration)
    }

    async fn create_720p(
        &self,
        input: &Path,
        output: &Path,
        video_bitrate_kbps: Option<u32>,
    ) -> Result<u64, BoxError> {
        let input_str = input.to_string_lossy().into_owned();
        let output_str = output.to_string_lossy().into_owned();

        let mut args: Vec<String> = vec![
            "-i".into(),
            input_str,
            "-vf".into(),
            "scale=-2:720".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "fast".into(),
        ];
        if let Some(kbps) = video_bitrate_kbps {
            args.push("-b:v".into());
            args.push(format!("{kbps}k"));
            args.push("-maxrate".into());
            args.push(format!("{kbps}k"));
            args.push("-bufsize".into());
            args.push(format!("{}k", kbps * 2));
        }
        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-y".into(),
            output_str,
        ]);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&self.ffmpeg_bin, &arg_refs).await?;

        Ok(tokio::fs::metadata(output).await?.len())
    }

    async fn extract_thumbnail(&self, input: &Path, output: &Path) -> Result<(), BoxError> {
        let input = input.to_string_lossy().into_owned();
        let output = output.to_string_lossy().into_owned();
        self.run(
            &self.ffmpeg_bin,
            &[
                "-ss", "00:00:01", "-i", &input, "-vframes", "1", "-q:v", "2", "-y", &output,
            ],
        )
        .await?;
        Ok(())
    }
}
