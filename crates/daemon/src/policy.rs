//! Conversion policy: a pure mapping from a classified file and the
//! configuration to the stages that must run, with resolved parameters.

use std::collections::BTreeSet;
use std::fmt;

use crate::classifier::ContentProfile;
use crate::config::{AudioConfig, CleanupConfig, RemuxConfig, VideoConfig, VideoEncoder};
use crate::error::PolicyError;
use crate::job::{JobKind, Stage};
use crate::language::{self, UNDEFINED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Ac3,
    Eac3,
}

impl AudioCodec {
    pub fn ffmpeg_encoder(self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Ac3 => "ac3",
            AudioCodec::Eac3 => "eac3",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AudioCodec::Aac => "AAC",
            AudioCodec::Ac3 => "AC3",
            AudioCodec::Eac3 => "EAC3",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_encoder())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConversion {
    pub stream_index: u32,
    pub source_codec: String,
    pub channels: u32,
    /// Channel count forced on the output when the encoder cannot carry the source layout.
    pub downmix: Option<u32>,
    pub target: AudioCodec,
    pub bitrate_kbps: u32,
    pub language: Option<String>,
    pub source_title: Option<String>,
}

impl AudioConversion {
    pub fn output_channels(&self) -> u32 {
        self.downmix.unwrap_or(self.channels)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioPlan {
    pub conversions: Vec<AudioConversion>,
    /// Copy the source track next to the converted one
    pub keep_original: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoPlan {
    pub stream_index: u32,
    pub source_codec: String,
    pub source_bit_depth: u8,
    pub encoder: VideoEncoder,
    pub anime: bool,
    pub crf: u8,
    pub preset: String,
    pub tune: Option<String>,
    pub framerate: Option<String>,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub pix_fmt: String,
    pub profile: String,
    pub level: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupPlan {
    pub keep_languages: BTreeSet<String>,
    /// Input stream indices to map, in container order
    pub keep_streams: Vec<u32>,
    pub removed_audio: Vec<u32>,
    pub removed_subtitles: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StagePlan {
    Audio(AudioPlan),
    Video(VideoPlan),
    Cleanup(CleanupPlan),
}

impl StagePlan {
    pub fn stage(&self) -> Stage {
        match self {
            StagePlan::Audio(_) => Stage::Audio,
            StagePlan::Video(_) => Stage::Video,
            StagePlan::Cleanup(_) => Stage::Cleanup,
        }
    }

    /// One-line summary for logs and the job result.
    pub fn describe(&self) -> String {
        match self {
            StagePlan::Audio(plan) => {
                let parts: Vec<String> = plan
                    .conversions
                    .iter()
                    .map(|c| {
                        let downmix = c
                            .downmix
                            .map(|n| format!(" {n}ch"))
                            .unwrap_or_default();
                        format!(
                            "#{} {} {}ch -> {}{} {}k",
                            c.stream_index,
                            c.source_codec,
                            c.channels,
                            c.target,
                            downmix,
                            c.bitrate_kbps
                        )
                    })
                    .collect();
                format!("audio: {}", parts.join(", "))
            }
            StagePlan::Video(plan) => format!(
                "video: #{} {} {}-bit -> {} crf {} preset {}{}",
                plan.stream_index,
                plan.source_codec,
                plan.source_bit_depth,
                plan.encoder.probe_name(),
                plan.crf,
                plan.preset,
                if plan.anime { " (anime)" } else { "" }
            ),
            StagePlan::Cleanup(plan) => format!(
                "cleanup: removed {} audio, {} subtitle streams (keep {})",
                plan.removed_audio.len(),
                plan.removed_subtitles.len(),
                plan.keep_languages.iter().cloned().collect::<Vec<_>>().join(",")
            ),
        }
    }
}

/// Ordered stage requests for one file. Empty means nothing to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionPlan {
    stages: Vec<StagePlan>,
}

impl ConversionPlan {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn stages(&self) -> &[StagePlan] {
        &self.stages
    }

    pub fn stage_kinds(&self) -> Vec<Stage> {
        self.stages.iter().map(StagePlan::stage).collect()
    }

    pub fn get(&self, stage: Stage) -> Option<&StagePlan> {
        self.stages.iter().find(|s| s.stage() == stage)
    }
}

/// Compute the plan for a job.
///
/// The anime-only content filter is checked once, before any stage logic, and
/// empties the plan for non-anime files.
pub fn plan(
    profile: &ContentProfile,
    kind: JobKind,
    cfg: &RemuxConfig,
) -> Result<ConversionPlan, PolicyError> {
    if cfg.content_filter.anime_only && !profile.is_anime {
        return Ok(ConversionPlan::default());
    }

    let mut stages = Vec::new();
    for stage in Stage::ORDER {
        if !kind.includes(stage) {
            continue;
        }
        if let Some(stage_plan) = plan_stage(stage, profile, cfg)? {
            stages.push(stage_plan);
        }
    }
    Ok(ConversionPlan { stages })
}

/// Eligibility and parameters for a single stage, without the content filter.
pub fn plan_stage(
    stage: Stage,
    profile: &ContentProfile,
    cfg: &RemuxConfig,
) -> Result<Option<StagePlan>, PolicyError> {
    Ok(match stage {
        Stage::Audio => plan_audio(profile, &cfg.audio)?.map(StagePlan::Audio),
        Stage::Video => plan_video(profile, &cfg.video).map(StagePlan::Video),
        Stage::Cleanup => plan_cleanup(profile, &cfg.cleanup).map(StagePlan::Cleanup),
    })
}

fn must_convert(codec: &str, cfg: &AudioConfig) -> bool {
    let codec = codec.to_lowercase();
    cfg.convert_codecs
        .iter()
        .any(|c| !c.is_empty() && codec.starts_with(&c.to_lowercase()))
}

/// ffmpeg's ac3 and eac3 encoders stop at 5.1.
pub const MAX_DOLBY_CHANNELS: u32 = 6;

/// Target codec and bitrate for a stream with `channels` channels.
///
/// The bitrate is `min(source, cap)`, or the cap when the source bitrate is unknown.
pub fn audio_target(
    channels: u32,
    source_bitrate_bps: Option<u64>,
    cfg: &AudioConfig,
) -> (AudioCodec, u32) {
    let (codec, cap) = match channels {
        0..=2 => (AudioCodec::Aac, cfg.aac_stereo_bitrate),
        3..=6 if cfg.prefer_ac3 => (AudioCodec::Ac3, cfg.ac3_bitrate),
        _ => (AudioCodec::Eac3, cfg.eac3_bitrate),
    };
    let bitrate = source_bitrate_bps
        .map(|bps| (bps / 1000).min(u64::from(u32::MAX)) as u32)
        .filter(|kbps| *kbps > 0)
        .map_or(cap, |kbps| kbps.min(cap));
    (codec, bitrate)
}

fn plan_audio(profile: &ContentProfile, cfg: &AudioConfig) -> Result<Option<AudioPlan>, PolicyError> {
    if !cfg.enabled {
        return Ok(None);
    }

    let mut conversions = Vec::new();
    for stream in profile.info.audio.iter().filter(|a| must_convert(&a.codec, cfg)) {
        if stream.channels == 0 {
            return Err(PolicyError::InvalidAudioStream {
                index: stream.index,
                codec: stream.codec.clone(),
                channels: stream.channels,
            });
        }
        let (target, bitrate_kbps) = audio_target(stream.channels, stream.bitrate_bps, cfg);
        if bitrate_kbps == 0 {
            return Err(PolicyError::ZeroBitrateCap {
                codec: target.to_string(),
            });
        }
        conversions.push(AudioConversion {
            stream_index: stream.index,
            source_codec: stream.codec.clone(),
            channels: stream.channels,
            downmix: (stream.channels > MAX_DOLBY_CHANNELS).then_some(MAX_DOLBY_CHANNELS),
            target,
            bitrate_kbps,
            language: stream.language.clone(),
            source_title: stream.title.clone(),
        });
    }

    if conversions.is_empty() {
        return Ok(None);
    }
    Ok(Some(AudioPlan {
        conversions,
        keep_original: cfg.keep_original,
    }))
}

fn is_legacy_codec(codec: &str, legacy: &str) -> bool {
    let codec = codec.to_lowercase();
    let legacy = legacy.to_lowercase();
    if codec == legacy {
        return true;
    }
    // ffprobe says h264; containers and configs sometimes say avc
    let avc = ["h264", "avc", "avc1"];
    avc.contains(&codec.as_str()) && avc.contains(&legacy.as_str())
}

fn plan_video(profile: &ContentProfile, cfg: &VideoConfig) -> Option<VideoPlan> {
    if !cfg.enabled {
        return None;
    }
    let video = profile.info.primary_video()?;
    if video.codec == cfg.encoder.probe_name() || !is_legacy_codec(&video.codec, &cfg.legacy_codec) {
        return None;
    }
    let eligible = if video.bit_depth >= 10 {
        cfg.convert_10bit
    } else {
        cfg.convert_8bit
    };
    if !eligible {
        return None;
    }

    let tables = cfg.tables();
    let preset = if profile.is_anime {
        &tables.anime
    } else {
        &tables.live_action
    };

    Some(VideoPlan {
        stream_index: video.index,
        source_codec: video.codec.clone(),
        source_bit_depth: video.bit_depth,
        encoder: cfg.encoder,
        anime: profile.is_anime,
        crf: preset.crf,
        preset: preset.preset.clone(),
        tune: preset.tune.clone(),
        framerate: preset.framerate.clone(),
        maxrate_kbps: cfg.maxrate_kbps,
        bufsize_kbps: cfg.bufsize_kbps,
        pix_fmt: cfg.pix_fmt.clone(),
        profile: cfg.profile.clone(),
        level: cfg.level.clone(),
    })
}

/// Languages the cleanup stage preserves.
pub fn keep_list(original_language: &str, cfg: &CleanupConfig) -> BTreeSet<String> {
    let mut keep = BTreeSet::new();
    let mut add = |code: String| {
        if code != UNDEFINED {
            if let Some(alt) = language::alternate_code(&code) {
                keep.insert(alt.to_string());
            }
            keep.insert(code);
        }
    };

    for lang in &cfg.always_keep {
        add(language::normalize_language_code(lang));
    }
    if cfg.keep_original {
        add(language::normalize_language_code(original_language));
    }
    if cfg.keep_undefined {
        keep.insert(UNDEFINED.to_string());
    }
    keep
}

fn language_kept(tag: Option<&str>, keep: &BTreeSet<String>) -> bool {
    if language::is_undefined(tag) {
        return keep.contains(UNDEFINED);
    }
    let tag = tag.unwrap_or_default().trim().to_lowercase();
    keep.contains(&tag) || keep.contains(&language::normalize_language_code(&tag))
}

fn plan_cleanup(profile: &ContentProfile, cfg: &CleanupConfig) -> Option<CleanupPlan> {
    if !cfg.enabled {
        return None;
    }
    let keep_languages = keep_list(&profile.original_language, cfg);
    let info = &profile.info;

    let mut removed_audio: Vec<u32> = if cfg.clean_audio {
        info.audio
            .iter()
            .filter(|a| {
                let kept = if a.forced {
                    true
                } else if a.commentary {
                    cfg.keep_commentary
                } else if language_kept(a.language.as_deref(), &keep_languages) {
                    true
                } else {
                    a.audio_description && cfg.keep_audio_description
                };
                !kept
            })
            .map(|a| a.index)
            .collect()
    } else {
        Vec::new()
    };
    // Never strip every audio track.
    if removed_audio.len() == info.audio.len() {
        removed_audio.clear();
    }

    let removed_subtitles: Vec<u32> = if cfg.clean_subtitles {
        info.subtitles
            .iter()
            .filter(|s| {
                let kept = if s.forced || s.sdh {
                    true
                } else if s.commentary {
                    cfg.keep_commentary
                } else {
                    language_kept(s.language.as_deref(), &keep_languages)
                };
                !kept
            })
            .map(|s| s.index)
            .collect()
    } else {
        Vec::new()
    };

    if removed_audio.is_empty() && removed_subtitles.is_empty() {
        return None;
    }

    let mut keep_streams: Vec<u32> = info.video.iter().map(|v| v.index).collect();
    keep_streams.extend(
        info.audio
            .iter()
            .map(|a| a.index)
            .filter(|i| !removed_audio.contains(i)),
    );
    keep_streams.extend(
        info.subtitles
            .iter()
            .map(|s| s.index)
            .filter(|i| !removed_subtitles.contains(i)),
    );
    keep_streams.extend(info.attachments.iter().copied());
    // Data streams (timecodes, chapters as tracks) carry no language.
    keep_streams.extend(info.other.iter().copied());
    keep_streams.sort_unstable();

    Some(CleanupPlan {
        keep_languages,
        keep_streams,
        removed_audio,
        removed_subtitles,
    })
}
