//! Media codec subprocess seam.
//!
//! The pipeline treats transcoding as a black box that reads and writes local
//! files; [`FfmpegCodec`] is the default implementation over ffmpeg/ffprobe
//! subprocesses.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Metadata extracted from a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub size_bytes: u64,
}

/// Codec operations the stages need.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaCodec: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;

    /// Extract the audio track to `output` (mp3).
    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<()>;

    /// Cut `[start, end)` seconds of `input` into `output` without
    /// re-encoding.
    async fn cut_clip(&self, input: &Path, output: &Path, start: f64, end: f64) -> Result<()>;
}

/// Clamp a moment window expanded by padding to the media bounds: never a
/// negative start, never past the end.
pub fn clamp_window(
    start: f64,
    end: f64,
    pad_left: f64,
    pad_right: f64,
    duration: f64,
) -> (f64, f64) {
    let clip_start = (start - pad_left).clamp(0.0, duration);
    let clip_end = (end + pad_right).min(duration).max(clip_start);
    (clip_start, clip_end)
}

/// ffmpeg/ffprobe-backed [`MediaCodec`]. Binary paths come from `FFMPEG_PATH`
/// / `FFPROBE_PATH`, falling back to `$PATH` lookup.
pub struct FfmpegCodec {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegCodec {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }

    fn audio_args(input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-c:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            "192k".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    fn clip_args(input: &Path, output: &Path, start: f64, end: f64) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
            "-ss".to_string(),
            format!("{start:.3}"),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-t".to_string(),
            format!("{:.3}", (end - start).max(0.0)),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }

    async fn run_ffmpeg(&self, args: &[String]) -> Result<()> {
        debug!(args = ?args, "Running ffmpeg");
        let output = Command::new(&self.ffmpeg_path)
            .args(args)
            .env("LC_ALL", "C")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::codec(format!("failed to run ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::codec(format!(
                "ffmpeg exited with {}: {}",
                output.status.code().unwrap_or(-1),
                tail
            )));
        }
        Ok(())
    }
}

impl Default for FfmpegCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaCodec for FfmpegCodec {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::codec(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(Error::codec(format!(
                "ffprobe exited with {} for {}",
                output.status.code().unwrap_or(-1),
                path.display()
            )));
        }

        let doc: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        parse_probe_output(&doc, path)
    }

    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<()> {
        self.run_ffmpeg(&Self::audio_args(input, output)).await
    }

    async fn cut_clip(&self, input: &Path, output: &Path, start: f64, end: f64) -> Result<()> {
        if end <= start {
            return Err(Error::codec(format!(
                "empty clip window [{start:.3}, {end:.3})"
            )));
        }
        self.run_ffmpeg(&Self::clip_args(input, output, start, end))
            .await
    }
}

fn parse_probe_output(doc: &serde_json::Value, path: &Path) -> Result<MediaInfo> {
    let streams = doc["streams"]
        .as_array()
        .ok_or_else(|| Error::codec(format!("ffprobe output missing streams for {}", path.display())))?;

    let video = streams
        .iter()
        .find(|s| s["codec_type"] == "video")
        .ok_or_else(|| Error::codec(format!("no video stream in {}", path.display())))?;
    let audio = streams.iter().find(|s| s["codec_type"] == "audio");

    let duration_seconds = doc["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let size_bytes = doc["format"]["size"]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    // e.g. "30000/1001"
    let fps = video["r_frame_rate"]
        .as_str()
        .and_then(parse_frame_rate)
        .unwrap_or(0.0);

    Ok(MediaInfo {
        duration_seconds,
        width: video["width"].as_u64().unwrap_or(0) as u32,
        height: video["height"].as_u64().unwrap_or(0) as u32,
        fps,
        video_codec: video["codec_name"].as_str().unwrap_or("unknown").to_string(),
        audio_codec: audio.and_then(|a| a["codec_name"].as_str()).map(String::from),
        size_bytes,
    })
}

fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 { None } else { Some(num / den) }
        }
        None => raw.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::PathBuf;

    #[rstest]
    #[case::within_bounds(10.0, 20.0, 2.0, 3.0, 100.0, 8.0, 23.0)]
    #[case::never_negative_start(1.0, 5.0, 10.0, 0.0, 100.0, 0.0, 5.0)]
    #[case::never_past_end(95.0, 99.0, 0.0, 10.0, 100.0, 95.0, 100.0)]
    #[case::degenerate_collapses_to_empty(150.0, 160.0, 0.0, 0.0, 100.0, 100.0, 100.0)]
    fn test_clamp_window(
        #[case] start: f64,
        #[case] end: f64,
        #[case] pad_left: f64,
        #[case] pad_right: f64,
        #[case] duration: f64,
        #[case] expected_start: f64,
        #[case] expected_end: f64,
    ) {
        assert_eq!(
            clamp_window(start, end, pad_left, pad_right, duration),
            (expected_start, expected_end)
        );
    }

    #[test]
    fn test_clip_args_use_copy_and_duration() {
        let args = FfmpegCodec::clip_args(
            &PathBuf::from("/in.mp4"),
            &PathBuf::from("/out.mp4"),
            8.0,
            23.5,
        );
        assert!(args.contains(&"-ss".to_string()));
        assert!(args.contains(&"8.000".to_string()));
        assert!(args.contains(&"-t".to_string()));
        assert!(args.contains(&"15.500".to_string()));
        assert!(args.contains(&"copy".to_string()));
    }

    #[test]
    fn test_audio_args_strip_video() {
        let args = FfmpegCodec::audio_args(&PathBuf::from("/in.mp4"), &PathBuf::from("/out.mp3"));
        assert!(args.contains(&"-vn".to_string()));
        assert!(args.contains(&"libmp3lame".to_string()));
    }

    #[test]
    fn test_parse_probe_output() {
        let doc = serde_json::json!({
            "format": { "duration": "123.456", "size": "1048576" },
            "streams": [
                { "codec_type": "video", "codec_name": "h264", "width": 1920,
                  "height": 1080, "r_frame_rate": "30000/1001" },
                { "codec_type": "audio", "codec_name": "aac" }
            ]
        });
        let info = parse_probe_output(&doc, &PathBuf::from("/v.mp4")).unwrap();
        assert_eq!(info.duration_seconds, 123.456);
        assert_eq!(info.width, 1920);
        assert_eq!(info.video_codec, "h264");
        assert_eq!(info.audio_codec.as_deref(), Some("aac"));
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.size_bytes, 1_048_576);
    }

    #[test]
    fn test_parse_probe_output_no_video_stream_fails() {
        let doc = serde_json::json!({
            "format": { "duration": "1.0" },
            "streams": [ { "codec_type": "audio", "codec_name": "aac" } ]
        });
        assert!(parse_probe_output(&doc, &PathBuf::from("/a.mp3")).is_err());
    }
}
