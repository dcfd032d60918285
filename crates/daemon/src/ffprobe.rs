use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::ProbeError;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub bit_rate: Option<String>,
    pub size: Option<String>,
    pub duration: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: u32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub profile: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub channels: Option<u32>,
    pub channel_layout: Option<String>,
    pub tags: Option<HashMap<String, String>>,
    pub bit_rate: Option<String>,
    pub disposition: Option<HashMap<String, i32>>,
    pub pix_fmt: Option<String>,
    pub bits_per_raw_sample: Option<String>,
}

impl FFProbeStream {
    fn tag(&self, key: &str) -> Option<&str> {
        let tags = self.tags.as_ref()?;
        tags.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    fn flag(&self, key: &str) -> bool {
        self.disposition
            .as_ref()
            .and_then(|d| d.get(key))
            .is_some_and(|v| *v == 1)
    }

    fn title_lower(&self) -> String {
        self.tag("title").unwrap_or_default().to_lowercase()
    }

    /// Stream bitrate, falling back to the Matroska `BPS` statistics tag.
    pub fn bitrate_bps(&self) -> Option<u64> {
        self.bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u64>().ok())
            .or_else(|| {
                self.tag("BPS")
                    .or_else(|| self.tag("BPS-eng"))
                    .and_then(|b| b.trim().parse::<u64>().ok())
            })
            .filter(|b| *b > 0)
    }

    /// Detect bit depth from the pixel format, then `bits_per_raw_sample`.
    pub fn detect_bit_depth(&self) -> u8 {
        if let Some(ref pix_fmt) = self.pix_fmt {
            let fmt = pix_fmt.to_lowercase();
            if fmt.contains("p12") || fmt.ends_with("12le") || fmt.ends_with("12be") {
                return 12;
            }
            if fmt.contains("p10") || fmt.ends_with("10le") || fmt.ends_with("10be") {
                return 10;
            }
        }
        self.bits_per_raw_sample
            .as_deref()
            .and_then(|b| b.parse::<u8>().ok())
            .filter(|b| *b > 0)
            .unwrap_or(8)
    }

    fn is_commentary(&self) -> bool {
        self.flag("comment") || self.title_lower().contains("commentary")
    }

    fn is_audio_description(&self) -> bool {
        let title = self.title_lower();
        self.flag("visual_impaired") || title.contains("description") || title.contains("descriptive")
    }

    fn is_sdh(&self) -> bool {
        if self.flag("hearing_impaired") {
            return true;
        }
        let title = self.title_lower();
        title.contains("sdh")
            || title.contains("hearing")
            || title.contains("impaired")
            || title.split(|c: char| !c.is_alphanumeric()).any(|w| w == "cc")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStream {
    pub index: u32,
    pub codec: String,
    pub bit_depth: u8,
    pub profile: Option<String>,
    pub pix_fmt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Embedded cover art, not a playable track
    pub attached_pic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioStream {
    pub index: u32,
    pub codec: String,
    pub profile: Option<String>,
    pub channels: u32,
    pub language: Option<String>,
    pub title: Option<String>,
    pub bitrate_bps: Option<u64>,
    pub default: bool,
    pub forced: bool,
    pub commentary: bool,
    pub audio_description: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleStream {
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub forced: bool,
    pub sdh: bool,
    pub commentary: bool,
}

/// Structured description of one media file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub format_name: Option<String>,
    pub size_bytes: Option<u64>,
    pub duration_secs: Option<f64>,
    pub video: Vec<VideoStream>,
    pub audio: Vec<AudioStream>,
    pub subtitles: Vec<SubtitleStream>,
    /// Attachment stream indices (fonts for styled subtitles)
    pub attachments: Vec<u32>,
    /// Data and unknown streams
    pub other: Vec<u32>,
}

impl MediaInfo {
    pub fn from_probe(path: &Path, data: FFProbeData) -> Self {
        let mut info = MediaInfo {
            path: path.to_path_buf(),
            ..Default::default()
        };

        if let Some(format) = data.format {
            info.format_name = format.format_name;
            info.size_bytes = format.size.and_then(|s| s.parse().ok());
            info.duration_secs = format.duration.and_then(|d| d.parse().ok());
        }

        for stream in data.streams {
            let codec = stream
                .codec_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string())
                .to_lowercase();
            let language = stream.tag("language").map(|l| l.to_lowercase());
            let title = stream.tag("title").map(str::to_string);

            match stream.codec_type.as_deref() {
                Some("video") => info.video.push(VideoStream {
                    index: stream.index,
                    bit_depth: stream.detect_bit_depth(),
                    attached_pic: stream.flag("attached_pic"),
                    codec,
                    profile: stream.profile.clone(),
                    pix_fmt: stream.pix_fmt.clone(),
                    width: stream.width,
                    height: stream.height,
                }),
                Some("audio") => info.audio.push(AudioStream {
                    index: stream.index,
                    channels: stream.channels.unwrap_or(0),
                    bitrate_bps: stream.bitrate_bps(),
                    default: stream.flag("default"),
                    forced: stream.flag("forced"),
                    commentary: stream.is_commentary(),
                    audio_description: stream.is_audio_description(),
                    profile: stream.profile.clone(),
                    codec,
                    language,
                    title,
                }),
                Some("subtitle") => info.subtitles.push(SubtitleStream {
                    index: stream.index,
                    forced: stream.flag("forced"),
                    sdh: stream.is_sdh(),
                    commentary: stream.is_commentary(),
                    codec,
                    language,
                    title,
                }),
                Some("attachment") => info.attachments.push(stream.index),
                _ => info.other.push(stream.index),
            }
        }

        info
    }

    /// The first real video track, skipping cover art.
    pub fn primary_video(&self) -> Option<&VideoStream> {
        self.video.iter().find(|v| !v.attached_pic)
    }
}

/// Describes a media file without mutating it.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

/// `ffprobe` subprocess adapter.
pub struct FfprobeCli {
    ffprobe_bin: PathBuf,
    timeout_secs: u64,
}

impl FfprobeCli {
    pub fn new(ffprobe_bin: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
            timeout_secs,
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeCli {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        // Verify file exists before trying to probe
        if !path.exists() {
            return Err(ProbeError::Missing(path.to_path_buf()));
        }

        debug!("Executing ffprobe for: {}", path.display());

        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(path)
            .kill_on_drop(true);

        let run = cmd.output();
        let output = if self.timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(self.timeout_secs), run).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ProbeError::Timeout {
                        path: path.to_path_buf(),
                        secs: self.timeout_secs,
                    })
                }
            }
        } else {
            run.await
        };
        let output = output.map_err(|source| ProbeError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let data: FFProbeData =
            serde_json::from_slice(&output.stdout).map_err(|source| ProbeError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(MediaInfo::from_probe(path, data))
    }
}
