//! ffmpeg-backed recorder.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, trace, warn};

use super::progress::{Progress, is_error_line, parse_progress};
use super::traits::{RecordExit, RecordRequest, Recorder};
use crate::fallback::Protocol;
use crate::{Error, Result};

fn default_binary_path() -> String {
    "ffmpeg".to_string()
}

fn default_reconnect_delay_max() -> u32 {
    1
}

fn default_io_timeout() -> u64 {
    30
}

fn default_audio_bsf() -> Option<String> {
    Some("aac_adtstoasc".to_string())
}

fn default_primary_container() -> String {
    "mp4".to_string()
}

fn default_secondary_container() -> String {
    "flv".to_string()
}

/// ffmpeg invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    /// Path to the ffmpeg binary, or a bare name resolved through `PATH`.
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// Upper bound for ffmpeg's reconnect delay, in seconds.
    #[serde(default = "default_reconnect_delay_max")]
    pub reconnect_delay_max_secs: u32,
    /// Read/connect timeout, in seconds.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    /// Audio bitstream filter applied while copying (`None` to skip).
    #[serde(default = "default_audio_bsf")]
    pub audio_bitstream_filter: Option<String>,
    /// Fragment container for primary-protocol recordings.
    #[serde(default = "default_primary_container")]
    pub primary_container: String,
    /// Fragment container for secondary-protocol recordings.
    #[serde(default = "default_secondary_container")]
    pub secondary_container: String,
    /// Extra arguments placed before `-i`.
    #[serde(default)]
    pub input_args: Vec<String>,
    /// Extra arguments placed before the output path.
    #[serde(default)]
    pub output_args: Vec<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            reconnect_delay_max_secs: default_reconnect_delay_max(),
            io_timeout_secs: default_io_timeout(),
            audio_bitstream_filter: default_audio_bsf(),
            primary_container: default_primary_container(),
            secondary_container: default_secondary_container(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            user_agent: None,
        }
    }
}

impl FfmpegConfig {
    /// Fragment extension for recordings made over `protocol`.
    pub fn container_for(&self, protocol: Protocol) -> &str {
        match protocol {
            Protocol::Primary => &self.primary_container,
            Protocol::Secondary => &self.secondary_container,
        }
    }
}

/// Records with `ffmpeg -c copy` and concatenates with the concat demuxer.
pub struct FfmpegRecorder {
    config: FfmpegConfig,
    version: Option<String>,
}

impl FfmpegRecorder {
    /// Create a recorder, probing the binary's version once.
    pub fn new(config: FfmpegConfig) -> Self {
        let version = process_utils::probe_version(&config.binary_path);
        Self { config, version }
    }

    pub fn config(&self) -> &FfmpegConfig {
        &self.config
    }

    /// Arguments for one recording attempt.
    pub fn build_record_args(&self, request: &RecordRequest) -> Vec<String> {
        let config = &self.config;
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];

        args.extend([
            "-reconnect".into(),
            "1".into(),
            "-reconnect_at_eof".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            config.reconnect_delay_max_secs.to_string(),
        ]);

        // ffmpeg takes the timeout in microseconds.
        if config.io_timeout_secs > 0 {
            args.extend([
                "-rw_timeout".into(),
                (config.io_timeout_secs * 1_000_000).to_string(),
            ]);
        }

        if let Some(ua) = &config.user_agent {
            args.extend(["-user_agent".into(), ua.clone()]);
        }

        args.extend(config.input_args.iter().cloned());
        args.extend(["-i".into(), request.url.clone()]);
        args.extend(["-c".into(), "copy".into()]);

        if let Some(bsf) = &config.audio_bitstream_filter {
            args.extend(["-bsf:a".into(), bsf.clone()]);
        }

        args.extend(config.output_args.iter().cloned());
        args.push(request.output.to_string_lossy().into_owned());
        args
    }

    /// Arguments for concatenating the fragments named in `list_file`.
    pub fn build_concat_args(&self, list_file: &Path, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_file.to_string_lossy().into_owned(),
            "-c".into(),
            "copy".into(),
            "-y".into(),
            output.to_string_lossy().into_owned(),
        ]
    }

    fn spawn_error(&self, e: std::io::Error) -> Error {
        if e.kind() == ErrorKind::NotFound {
            Error::ToolUnavailable {
                tool: "ffmpeg".to_string(),
                path: self.config.binary_path.clone(),
            }
        } else {
            Error::process(&self.config.binary_path, format!("failed to spawn: {e}"))
        }
    }
}

#[async_trait]
impl Recorder for FfmpegRecorder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn record(&self, request: &RecordRequest) -> Result<RecordExit> {
        let args = self.build_record_args(request);
        debug!(
            target_name = %request.target,
            session_id = %request.session_id,
            protocol = %request.protocol,
            ?args,
            "Spawning ffmpeg"
        );

        let started = Instant::now();
        let mut child = process_utils::tokio_command(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::process(&self.config.binary_path, "stderr not captured"))?;

        let target = request.target.clone();
        let drain = async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last_error: Option<String> = None;
            let mut progress: Option<Progress> = None;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(p) = parse_progress(&line) {
                            progress = Some(p);
                        } else if is_error_line(&line) {
                            trace!(target_name = %target, line = %line, "ffmpeg error output");
                            last_error = Some(line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target_name = %target, error = %e, "Error reading ffmpeg output");
                        break;
                    }
                }
            }
            (last_error, progress)
        };

        let (status, (last_error, progress)) = tokio::join!(child.wait(), drain);
        let status =
            status.map_err(|e| Error::process(&self.config.binary_path, format!("wait failed: {e}")))?;

        Ok(RecordExit {
            exit_code: status.code(),
            last_error,
            progress,
            elapsed: started.elapsed(),
        })
    }

    async fn concat(&self, list_file: &Path, output: &Path) -> Result<()> {
        let args = self.build_concat_args(list_file, output);
        debug!(?args, "Running ffmpeg concat");

        let output_result = process_utils::tokio_command(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if output_result.status.success() {
            info!(output = %output.display(), "ffmpeg concat finished");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output_result.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("no output")
            .to_string();
        Err(Error::process(
            &self.config.binary_path,
            format!("concat exited with {}: {reason}", output_result.status),
        ))
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}
