//! FFmpeg-backed renderer
//!
//! Branding draws the destination name centered over the media in
//! semi-transparent red with a white border. Unbranded renders still
//! re-encode so every destination receives a platform-friendly file.
//!
//! The process runs under `tokio::process` with `kill_on_drop`, so the
//! pool's deadline is the only one: when it drops the render, ffmpeg dies.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::RenderConfig;
use crate::error::RenderError;
use crate::render::{MediaRenderer, RenderJob};
use crate::types::MediaKind;

/// Overlay appearance
#[derive(Debug, Clone)]
pub struct BrandingStyle {
    pub color: String,
    pub opacity: f32,
    pub border_color: String,
    pub border_width: u32,
    /// Font size relative to the shorter side
    pub relative_size: f32,
}

impl Default for BrandingStyle {
    fn default() -> Self {
        Self {
            color: "red".to_string(),
            opacity: 0.7,
            border_color: "white".to_string(),
            border_width: 2,
            relative_size: 0.04,
        }
    }
}

impl BrandingStyle {
    /// Smallest font size per media kind, in pixels
    fn min_size(kind: MediaKind) -> u32 {
        match kind {
            MediaKind::Photo => 24,
            MediaKind::Video => 20,
        }
    }

    /// `drawtext` filter reading its label from `label_file`
    pub fn drawtext_filter(&self, font_path: &str, label_file: &Path, kind: MediaKind) -> String {
        format!(
            "drawtext=fontfile='{}':textfile='{}':fontcolor={}@{:.2}:bordercolor={}@{:.2}:borderw={}:fontsize='max({},min(main_w,main_h)*{})':x=(w-text_w)/2:y=(h-text_h)/2",
            escape_filter_value(font_path),
            escape_filter_value(&label_file.to_string_lossy()),
            self.color,
            self.opacity,
            self.border_color,
            self.opacity,
            self.border_width,
            Self::min_size(kind),
            self.relative_size,
        )
    }
}

/// Escape a value placed inside single quotes of a filtergraph option
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("'\\''"),
            ':' => escaped.push_str("\\:"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Argument list builder for one ffmpeg invocation
#[derive(Debug, Clone)]
pub struct FfmpegArgs {
    input: PathBuf,
    output: PathBuf,
    output_args: Vec<String>,
}

impl FfmpegArgs {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn video_filter(self, filter: Option<String>) -> Self {
        match filter {
            Some(filter) => self.arg("-vf").arg(filter),
            None => self,
        }
    }

    pub fn build(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            self.input.to_string_lossy().to_string(),
        ];
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

pub struct FfmpegRenderer {
    binary: String,
    font_path: String,
    style: BrandingStyle,
}

impl FfmpegRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            binary: config.ffmpeg.clone(),
            font_path: config.font_path.clone(),
            style: BrandingStyle::default(),
        }
    }

    pub fn with_style(mut self, style: BrandingStyle) -> Self {
        self.style = style;
        self
    }

    /// Label file written next to the output while the render runs
    fn label_path(job: &RenderJob) -> PathBuf {
        let mut name = job.output.as_os_str().to_owned();
        name.push(".label.txt");
        PathBuf::from(name)
    }

    /// Full argument list for a job
    pub fn build_args(&self, job: &RenderJob) -> Vec<String> {
        let filter = job.branding.as_ref().map(|_| {
            self.style
                .drawtext_filter(&self.font_path, &Self::label_path(job), job.kind)
        });

        let args = FfmpegArgs::new(&job.source, &job.output).video_filter(filter);
        let args = match job.kind {
            MediaKind::Photo => args.args(["-frames:v", "1", "-q:v", "3"]),
            MediaKind::Video => args.args([
                "-fpsmax", "30", "-c:v", "libx264", "-preset", "veryfast", "-crf", "23",
                "-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", "128k", "-movflags",
                "+faststart",
            ]),
        };
        args.build()
    }

    async fn run(&self, args: &[String]) -> std::result::Result<(), RenderError> {
        debug!("Running {} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RenderError::ToolMissing(self.binary.clone())
                } else {
                    RenderError::from(e)
                }
            })?;

        // Drained while the process runs; a full pipe would stall ffmpeg
        let stderr = child.stderr.take();
        let drain = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(mut pipe) = stderr {
                if let Err(e) = pipe.read_to_string(&mut output).await {
                    warn!("Failed to read ffmpeg stderr: {}", e);
                }
            }
            output
        });

        let status = child.wait().await?;
        let stderr = drain.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        Err(RenderError::Process(format!(
            "{} exited with {}: {}",
            self.binary,
            status,
            stderr.trim()
        )))
    }
}

/// Branding label written next to the output, removed when dropped
struct LabelFile(PathBuf);

impl Drop for LabelFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), "Failed to remove branding label: {}", e);
            }
        }
    }
}

#[async_trait]
impl MediaRenderer for FfmpegRenderer {
    async fn render(&self, job: &RenderJob) -> std::result::Result<(), RenderError> {
        let _label = match &job.branding {
            Some(text) => {
                let label = LabelFile(Self::label_path(job));
                tokio::fs::write(&label.0, text).await?;
                Some(label)
            }
            None => None,
        };

        self.run(&self.build_args(job)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> FfmpegRenderer {
        FfmpegRenderer::new(&RenderConfig {
            font_path: "/fonts/Bold.ttf".to_string(),
            ..RenderConfig::default()
        })
    }

    fn job(kind: MediaKind, branding: Option<&str>) -> RenderJob {
        RenderJob {
            destination_id: "-100".to_string(),
            item: 0,
            source: PathBuf::from("/run/source.bin"),
            kind,
            branding: branding.map(str::to_string),
            output: PathBuf::from(format!("/run/out.{}", kind.extension())),
        }
    }

    #[test]
    fn test_branded_photo_args() {
        let args = renderer().build_args(&job(MediaKind::Photo, Some("News CZ")));

        assert_eq!(&args[..5], &["-y", "-v", "error", "-i", "/run/source.bin"]);
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        let filter = &args[vf + 1];
        assert!(filter.starts_with("drawtext=fontfile='/fonts/Bold.ttf'"));
        assert!(filter.contains("textfile='/run/out.jpg.label.txt'"));
        assert!(filter.contains("fontcolor=red@0.70"));
        assert!(filter.contains("max(24,min(main_w,main_h)*0.04)"));
        assert!(args.contains(&"-q:v".to_string()));
        assert_eq!(args.last().unwrap(), "/run/out.jpg");
    }

    #[test]
    fn test_unbranded_video_still_reencodes() {
        let args = renderer().build_args(&job(MediaKind::Video, None));

        assert!(!args.contains(&"-vf".to_string()));
        for expected in ["libx264", "aac", "yuv420p", "+faststart", "30"] {
            assert!(args.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_escape_filter_value() {
        assert_eq!(escape_filter_value("C:\\fonts"), "C\\:\\\\fonts");
        assert_eq!(escape_filter_value("it's"), "it'\\''s");
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let renderer = FfmpegRenderer::new(&RenderConfig {
            ffmpeg: "/nonexistent/ffmpeg-binary".to_string(),
            ..RenderConfig::default()
        });
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut job = job(MediaKind::Photo, Some("Brand"));
        job.output = temp_dir.path().join("out.jpg");

        let result = renderer.render(&job).await;
        assert!(matches!(result, Err(RenderError::ToolMissing(_))));
        // Label file is cleaned up on the failure path too
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_stderr_does_not_stall_process() {
        let renderer = FfmpegRenderer::new(&RenderConfig {
            ffmpeg: "sh".to_string(),
            ..RenderConfig::default()
        });
        let script = "head -c 300000 /dev/zero | tr '\\0' x >&2; exit 3".to_string();
        let args = vec!["-c".to_string(), script];

        let result = tokio::time::timeout(std::time::Duration::from_secs(20), renderer.run(&args))
            .await
            .expect("render should finish once stderr is drained");

        match result {
            Err(RenderError::Process(message)) => {
                assert!(message.contains("exit status: 3"));
                assert!(message.contains("xxxxxxxx"));
            }
            other => panic!("Expected process failure, got {:?}", other),
        }
    }
}
