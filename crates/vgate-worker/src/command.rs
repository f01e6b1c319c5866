//! External command capability (ffmpeg by default).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vgate_models::{JobId, JobPayload, Operation};

use crate::capability::WorkerCapability;
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};

const DEFAULT_VIDEO_CODEC: &str = "h264_nvenc";
const DEFAULT_BITRATE: &str = "4M";
const CPU_VIDEO_CODEC: &str = "libx264";
const CPU_PRESET: &str = "veryfast";
const CPU_CRF: &str = "20";
const DEFAULT_AUDIO_CODEC: &str = "copy";
const DEFAULT_CONTAINER: &str = "mp4";
const DEFAULT_SEGMENT_SECONDS: &str = "10";

/// Stderr lines kept for the error detail.
const STDERR_TAIL_LINES: usize = 8;

/// Progress block parsed from `-progress pipe:2` output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub out_time_ms: i64,
    pub frame: u64,
    pub speed: f64,
    pub is_complete: bool,
}

/// Runs an external program per job and reports the output path.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    program: PathBuf,
    prefix_args: Vec<String>,
    work_dir: PathBuf,
    stall_timeout: Duration,
    cpu_only: bool,
}

impl CommandCapability {
    /// Resolve `command` on PATH.
    pub fn new(
        command: &str,
        work_dir: impl Into<PathBuf>,
        stall_timeout: Duration,
    ) -> WorkerResult<Self> {
        let program = which::which(command)
            .map_err(|e| WorkerError::CommandNotFound(format!("{}: {}", command, e)))?;

        Ok(Self {
            program,
            prefix_args: Vec::new(),
            work_dir: work_dir.into(),
            stall_timeout,
            cpu_only: false,
        })
    }

    pub fn from_config(config: &WorkerConfig) -> WorkerResult<Self> {
        Ok(Self::new(&config.command, config.work_dir.clone(), config.stall_timeout)?
            .with_prefix_args(config.command_prefix_args.clone())
            .with_cpu_only(config.cpu_only))
    }

    /// Encode transcodes with libx264 unless the job names a codec.
    pub fn with_cpu_only(mut self, cpu_only: bool) -> Self {
        self.cpu_only = cpu_only;
        self
    }

    pub fn with_prefix_args(mut self, args: Vec<String>) -> Self {
        self.prefix_args = args;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Where the job's artifact is written.
    ///
    /// Transcodes produce one file; segmentation produces a directory of parts.
    pub fn output_path(&self, job_id: &JobId, payload: &JobPayload) -> PathBuf {
        match payload.operation {
            Operation::Transcode => {
                let container = param(payload, "container", DEFAULT_CONTAINER);
                self.work_dir.join(format!("{}.{}", job_id, container))
            }
            Operation::Segment => self.work_dir.join(job_id.as_str()),
        }
    }

    /// Build the argument list for a job.
    pub fn build_args(&self, job_id: &JobId, payload: &JobPayload) -> Result<Vec<String>, String> {
        for (key, value) in &payload.params {
            if value.starts_with('-') {
                return Err(format!("parameter '{}' must not start with '-'", key));
            }
        }

        let input = resolve_input(&payload.input_ref)?;
        let output = self.output_path(job_id, payload);

        let mut args = self.prefix_args.clone();
        args.extend(["-y", "-v", "error", "-progress", "pipe:2"].map(String::from));

        if let Some(hwaccel) = payload.params.get("hwaccel").filter(|_| !self.cpu_only) {
            args.push("-hwaccel".to_string());
            args.push(hwaccel.clone());
        }
        args.push("-i".to_string());
        args.push(input);

        match payload.operation {
            Operation::Transcode if self.cpu_only && !payload.params.contains_key("codec") => {
                args.push("-c:v".to_string());
                args.push(CPU_VIDEO_CODEC.to_string());
                args.push("-preset".to_string());
                args.push(param(payload, "preset", CPU_PRESET).to_string());
                args.push("-crf".to_string());
                args.push(CPU_CRF.to_string());
                args.push("-c:a".to_string());
                args.push(param(payload, "audio_codec", DEFAULT_AUDIO_CODEC).to_string());
                args.push(output.to_string_lossy().to_string());
            }
            Operation::Transcode => {
                args.push("-c:v".to_string());
                args.push(param(payload, "codec", DEFAULT_VIDEO_CODEC).to_string());
                args.push("-b:v".to_string());
                args.push(param(payload, "bitrate", DEFAULT_BITRATE).to_string());
                if let Some(preset) = payload.params.get("preset") {
                    args.push("-preset".to_string());
                    args.push(preset.clone());
                }
                args.push("-c:a".to_string());
                args.push(param(payload, "audio_codec", DEFAULT_AUDIO_CODEC).to_string());
                args.push(output.to_string_lossy().to_string());
            }
            Operation::Segment => {
                let container = param(payload, "container", DEFAULT_CONTAINER);
                args.extend(["-c", "copy", "-map", "0", "-f", "segment"].map(String::from));
                args.push("-segment_time".to_string());
                args.push(param(payload, "segment_seconds", DEFAULT_SEGMENT_SECONDS).to_string());
                args.push("-reset_timestamps".to_string());
                args.push("1".to_string());
                args.push(
                    output
                        .join(format!("segment_%03d.{}", container))
                        .to_string_lossy()
                        .to_string(),
                );
            }
        }

        Ok(args)
    }

    async fn wait(
        &self,
        child: &mut Child,
        cancel: &mut watch::Receiver<bool>,
        last_progress: &watch::Receiver<Instant>,
    ) -> Result<std::process::ExitStatus, String> {
        let check_every = (self.stall_timeout / 4).max(Duration::from_millis(10));
        let mut stall_check = tokio::time::interval(check_every);
        let mut cancel_open = true;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return status.map_err(|e| format!("failed to wait for process: {}", e));
                }
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    } else if *cancel.borrow() {
                        info!("Command cancelled, killing process");
                        let _ = child.kill().await;
                        return Err("cancelled".to_string());
                    }
                }
                _ = stall_check.tick() => {
                    let idle = last_progress.borrow().elapsed();
                    if idle > self.stall_timeout {
                        warn!(idle_secs = idle.as_secs(), "Command stalled, killing process");
                        let _ = child.kill().await;
                        return Err(format!("no progress for {}s", idle.as_secs()));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl WorkerCapability for CommandCapability {
    async fn execute(
        &self,
        job_id: &JobId,
        payload: &JobPayload,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<String, String> {
        if *cancel.borrow() {
            return Err("cancelled".to_string());
        }

        let args = self.build_args(job_id, payload)?;
        let output = self.output_path(job_id, payload);
        let dir = match payload.operation {
            Operation::Transcode => self.work_dir.clone(),
            Operation::Segment => output.clone(),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;

        debug!("Running {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start {}: {}", self.program.display(), e))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| "stderr not captured".to_string())?;

        let (progress_tx, progress_rx) = watch::channel(Instant::now());
        let job = job_id.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut current = Progress::default();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(progress) = parse_progress_line(&line, &mut current) {
                    let _ = progress_tx.send(Instant::now());
                    debug!(
                        job_id = %job,
                        out_time_ms = progress.out_time_ms,
                        frame = progress.frame,
                        speed = progress.speed,
                        "Progress"
                    );
                } else if !line.contains('=') && !line.trim().is_empty() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail.into_iter().collect::<Vec<_>>()
        });

        let status = match self.wait(&mut child, &mut cancel, &progress_rx).await {
            Ok(status) => status,
            Err(detail) => {
                reader.abort();
                return Err(detail);
            }
        };

        // Orphaned grandchildren can hold the pipe open
        let tail = match tokio::time::timeout(Duration::from_secs(1), reader).await {
            Ok(Ok(tail)) => tail,
            _ => Vec::new(),
        };

        if status.success() {
            Ok(output.to_string_lossy().to_string())
        } else {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let mut detail = format!("{} exited with status {}", self.name(), code);
            if !tail.is_empty() {
                detail.push_str(": ");
                detail.push_str(&tail.join(" | "));
            }
            Err(detail)
        }
    }

    fn name(&self) -> &str {
        self.program
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("command")
    }
}

fn param<'a>(payload: &'a JobPayload, key: &str, default: &'a str) -> &'a str {
    payload.params.get(key).map(String::as_str).unwrap_or(default)
}

/// Map an input reference to something the program can open.
fn resolve_input(input_ref: &str) -> Result<String, String> {
    if let Some(path) = input_ref.strip_prefix("file://") {
        return Ok(path.to_string());
    }
    if input_ref.starts_with("http://") || input_ref.starts_with("https://") || input_ref.starts_with('/') {
        return Ok(input_ref.to_string());
    }
    Err(format!("unsupported input reference '{}'", input_ref))
}

/// Parse one line of `-progress` output into the running block.
///
/// Returns the block when its terminating `progress=` line is seen.
fn parse_progress_line(line: &str, current: &mut Progress) -> Option<Progress> {
    let (key, value) = line.trim().split_once('=')?;

    match key {
        "out_time_us" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "frame" => {
            if let Ok(frame) = value.parse() {
                current.frame = frame;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            current.is_complete = value == "end";
            return Some(current.clone());
        }
        _ => {}
    }

    None
}
