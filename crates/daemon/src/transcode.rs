use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::config::VideoEncoder;
use crate::error::ToolError;
use crate::ffprobe::MediaInfo;
use crate::language;
use crate::policy::{AudioConversion, AudioPlan, CleanupPlan, StagePlan, VideoPlan};

/// Number of stderr lines kept in a failure message
const STDERR_TAIL: usize = 20;

/// One stage invocation: read `input`, write `output`.
#[derive(Debug, Clone, Copy)]
pub struct TranscodeRequest<'a> {
    pub job_id: &'a str,
    pub input: &'a Path,
    pub output: &'a Path,
    pub stage: &'a StagePlan,
    pub info: &'a MediaInfo,
}

/// External transcoding tool. Re-invoking with the same request must be safe.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, request: &TranscodeRequest<'_>) -> Result<(), ToolError>;
}

/// Track title for a converted stream, e.g. `English 5.1 (AC3)`.
pub fn track_title(conversion: &AudioConversion) -> String {
    let layout = match conversion.output_channels() {
        1 => "Mono".to_string(),
        2 => "Stereo".to_string(),
        6 => "5.1".to_string(),
        8 => "7.1".to_string(),
        n => format!("{n}ch"),
    };
    let name = conversion
        .language
        .as_deref()
        .and_then(language::display_name);
    match name {
        Some(name) => format!("{} {} ({})", name, layout, conversion.target.label()),
        None => format!("{} ({})", layout, conversion.target.label()),
    }
}

/// ffmpeg invocation for the `ffmpeg` binary found on PATH or configured.
pub struct FfmpegTranscoder {
    ffmpeg_bin: PathBuf,
    timeout_secs: u64,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            timeout_secs,
        }
    }

    /// Full argument list for a stage, output path last.
    pub fn build_args(request: &TranscodeRequest<'_>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-loglevel".into(),
            "warning".into(),
            "-y".into(),
            "-analyzeduration".into(),
            "10M".into(),
            "-probesize".into(),
            "10M".into(),
            "-i".into(),
            request.input.display().to_string(),
        ];

        match request.stage {
            StagePlan::Audio(plan) => audio_args(&mut args, plan, request.info),
            StagePlan::Video(plan) => video_args(&mut args, plan, request.info),
            StagePlan::Cleanup(plan) => cleanup_args(&mut args, plan),
        }

        args.push(request.output.display().to_string());
        args
    }

    /// Spawn ffmpeg, drain its output, enforce the timeout.
    async fn execute(&self, job_id: &str, args: Vec<String>) -> Result<(), ToolError> {
        let cmd_str = format!("{} {}", self.ffmpeg_bin.display(), args.join(" "));
        debug!("Job {}: executing {}", job_id, cmd_str);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: self.ffmpeg_bin.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_handle = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(_)) = lines.next_line().await {}
            }
        });

        let stderr_handle = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail.join("\n")
        });

        let status = if self.timeout_secs > 0 {
            match timeout(Duration::from_secs(self.timeout_secs), child.wait()).await {
                Ok(result) => result.map_err(|e| ToolError::io("failed to wait for ffmpeg", e))?,
                Err(_) => {
                    // Timeout occurred - kill the process
                    child
                        .kill()
                        .await
                        .map_err(|e| ToolError::io("failed to kill stuck ffmpeg", e))?;
                    return Err(ToolError::Timeout {
                        secs: self.timeout_secs,
                    });
                }
            }
        } else {
            child
                .wait()
                .await
                .map_err(|e| ToolError::io("failed to wait for ffmpeg", e))?
        };

        let _ = stdout_handle.await;
        let stderr = stderr_handle.await.unwrap_or_default();

        if !status.success() {
            return Err(ToolError::Failed {
                exit_code: status.code().unwrap_or(-1),
                stderr,
            });
        }

        info!("Job {}: ffmpeg finished", job_id);
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, request: &TranscodeRequest<'_>) -> Result<(), ToolError> {
        let args = Self::build_args(request);
        self.execute(request.job_id, args).await
    }
}

fn push_all(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

fn audio_args(args: &mut Vec<String>, plan: &AudioPlan, info: &MediaInfo) {
    push_all(args, &["-map", "0:v?"]);
    for stream in &info.audio {
        let converted = plan.conversions.iter().any(|c| c.stream_index == stream.index);
        let copies = if converted && plan.keep_original { 2 } else { 1 };
        for _ in 0..copies {
            args.push("-map".into());
            args.push(format!("0:{}", stream.index));
        }
    }
    push_all(
        args,
        &[
            "-map", "0:s?", "-map", "0:t?", "-map_chapters", "0", "-c:v", "copy", "-c:s", "copy",
            "-c:t", "copy",
        ],
    );

    let mut out = 0usize;
    for stream in &info.audio {
        match plan.conversions.iter().find(|c| c.stream_index == stream.index) {
            Some(conversion) => {
                if plan.keep_original {
                    args.push(format!("-c:a:{out}"));
                    args.push("copy".into());
                    out += 1;
                }
                args.push(format!("-c:a:{out}"));
                args.push(conversion.target.ffmpeg_encoder().into());
                args.push(format!("-b:a:{out}"));
                args.push(format!("{}k", conversion.bitrate_kbps));
                if let Some(channels) = conversion.downmix {
                    args.push(format!("-ac:a:{out}"));
                    args.push(channels.to_string());
                }
                args.push(format!("-metadata:s:a:{out}"));
                args.push(format!("title={}", track_title(conversion)));
                if plan.keep_original {
                    // The converted track becomes the default one.
                    args.push(format!("-disposition:a:{out}"));
                    args.push("default".into());
                    args.push(format!("-disposition:a:{}", out - 1));
                    args.push("0".into());
                }
                out += 1;
            }
            None => {
                args.push(format!("-c:a:{out}"));
                args.push("copy".into());
                out += 1;
            }
        }
    }
}

fn video_args(args: &mut Vec<String>, plan: &VideoPlan, info: &MediaInfo) {
    // Output video index of the stream being re-encoded; cover art is copied.
    let out_index = info
        .video
        .iter()
        .position(|v| v.index == plan.stream_index)
        .unwrap_or(0);

    push_all(args, &["-map", "0", "-map_chapters", "0", "-c", "copy"]);
    args.push(format!("-c:v:{out_index}"));
    args.push(plan.encoder.ffmpeg_codec().into());
    args.push(format!("-pix_fmt:v:{out_index}"));
    args.push(plan.pix_fmt.clone());

    match plan.encoder {
        VideoEncoder::Hevc => {
            args.push(format!("-profile:v:{out_index}"));
            args.push(plan.profile.clone());
            args.push(format!("-level:v:{out_index}"));
            args.push(plan.level.clone());
            push_all(args, &["-preset", plan.preset.as_str()]);
            if let Some(ref tune) = plan.tune {
                push_all(args, &["-tune", tune.as_str()]);
            }
            let x265_params = [
                format!("crf={}", plan.crf),
                format!("vbv-maxrate={}", plan.maxrate_kbps),
                format!("vbv-bufsize={}", plan.bufsize_kbps),
                "ref=4".to_string(),
                "bframes=6".to_string(),
                "open-gop=0".to_string(),
                "keyint=240".to_string(),
                "min-keyint=24".to_string(),
                "scenecut=40".to_string(),
            ];
            args.push("-x265-params".into());
            args.push(x265_params.join(":"));
        }
        VideoEncoder::Av1 => {
            args.push("-crf".into());
            args.push(plan.crf.to_string());
            push_all(args, &["-preset", plan.preset.as_str()]);
            args.push("-svtav1-params".into());
            args.push(format!("mbr={}:keyint=240", plan.maxrate_kbps));
        }
    }

    if let Some(ref framerate) = plan.framerate {
        push_all(args, &["-fps_mode", "cfr", "-r", framerate.as_str()]);
    }
}

fn cleanup_args(args: &mut Vec<String>, plan: &CleanupPlan) {
    for index in &plan.keep_streams {
        args.push("-map".into());
        args.push(format!("0:{index}"));
    }
    push_all(args, &["-map_chapters", "0", "-c", "copy"]);
}
