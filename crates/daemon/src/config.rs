use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Configuration for the remux daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemuxConfig {
    /// Library root directories to scan for media files and sweep for orphans
    pub library_roots: Vec<PathBuf>,
    /// Global gate applied before any per-stage logic
    pub content_filter: ContentFilterConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub cleanup: CleanupConfig,
    pub classifier: ClassifierConfig,
    pub processing: ProcessingConfig,
    pub sonarr: ArrConfig,
    pub radarr: ArrConfig,
    /// Container path prefixes reported by the media managers, mapped to host paths
    pub path_mappings: Vec<PathMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFilterConfig {
    /// When set, non-anime files get an empty plan
    pub anime_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// Source codecs that must be converted (matched by prefix, e.g. `dts` covers `dts-hd`)
    pub convert_codecs: Vec<String>,
    /// Cap for 1-2 channel streams (AAC), in kbps
    pub aac_stereo_bitrate: u32,
    /// Cap for 3-6 channel streams (AC3), in kbps
    pub ac3_bitrate: u32,
    /// Cap for 7+ channel streams (E-AC3), in kbps
    pub eac3_bitrate: u32,
    /// Use AC3 for 3-6 channels; E-AC3 otherwise
    pub prefer_ac3: bool,
    /// Keep the source track next to the converted one
    pub keep_original: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            convert_codecs: vec!["dts".to_string(), "truehd".to_string()],
            aac_stereo_bitrate: 320,
            ac3_bitrate: 640,
            eac3_bitrate: 1536,
            prefer_ac3: true,
            keep_original: false,
        }
    }
}

/// Target encoder family for the video stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoEncoder {
    Hevc,
    Av1,
}

impl VideoEncoder {
    pub fn ffmpeg_codec(self) -> &'static str {
        match self {
            VideoEncoder::Hevc => "libx265",
            VideoEncoder::Av1 => "libsvtav1",
        }
    }

    /// Codec name ffprobe reports for an already converted stream
    pub fn probe_name(self) -> &'static str {
        match self {
            VideoEncoder::Hevc => "hevc",
            VideoEncoder::Av1 => "av1",
        }
    }
}

/// Quality and speed settings for one content type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderPreset {
    pub crf: u8,
    pub preset: String,
    #[serde(default)]
    pub tune: Option<String>,
    #[serde(default)]
    pub framerate: Option<String>,
}

/// Anime and live-action presets for one encoder family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderTables {
    pub anime: EncoderPreset,
    pub live_action: EncoderPreset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub enabled: bool,
    pub encoder: VideoEncoder,
    /// Source codec whose 10-bit profile breaks playback on common clients
    pub legacy_codec: String,
    pub convert_10bit: bool,
    pub convert_8bit: bool,
    pub hevc: EncoderTables,
    pub av1: EncoderTables,
    /// Streaming bitrate ceiling, in kbps
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub level: String,
    pub profile: String,
    pub pix_fmt: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            encoder: VideoEncoder::Hevc,
            legacy_codec: "h264".to_string(),
            convert_10bit: true,
            convert_8bit: false,
            hevc: EncoderTables {
                anime: EncoderPreset {
                    crf: 19,
                    preset: "slow".to_string(),
                    tune: Some("animation".to_string()),
                    framerate: Some("24000/1001".to_string()),
                },
                live_action: EncoderPreset {
                    crf: 22,
                    preset: "medium".to_string(),
                    tune: None,
                    framerate: None,
                },
            },
            av1: EncoderTables {
                anime: EncoderPreset {
                    crf: 28,
                    preset: "6".to_string(),
                    tune: None,
                    framerate: Some("24000/1001".to_string()),
                },
                live_action: EncoderPreset {
                    crf: 30,
                    preset: "8".to_string(),
                    tune: None,
                    framerate: None,
                },
            },
            maxrate_kbps: 5000,
            bufsize_kbps: 10000,
            level: "4.1".to_string(),
            profile: "main10".to_string(),
            pix_fmt: "yuv420p10le".to_string(),
        }
    }
}

impl VideoConfig {
    pub fn tables(&self) -> &EncoderTables {
        match self.encoder {
            VideoEncoder::Hevc => &self.hevc,
            VideoEncoder::Av1 => &self.av1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub clean_audio: bool,
    pub clean_subtitles: bool,
    /// Languages kept regardless of the original language
    pub always_keep: Vec<String>,
    /// Add the detected original language to the keep-list
    pub keep_original: bool,
    /// Keep streams tagged `und` or untagged
    pub keep_undefined: bool,
    pub keep_commentary: bool,
    pub keep_audio_description: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            clean_audio: true,
            clean_subtitles: true,
            always_keep: vec!["eng".to_string()],
            keep_original: true,
            keep_undefined: false,
            keep_commentary: true,
            keep_audio_description: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Path segments marking an anime library (case-insensitive)
    pub anime_paths: Vec<String>,
    /// Genres that are decisive on their own
    pub anime_genres: Vec<String>,
    /// Animation studios matched against sidecar studio tags
    pub anime_studios: Vec<String>,
    /// Verdict when no rule is decisive
    pub fallback_is_anime: bool,
    pub default_language: String,
    pub use_sidecar: bool,
    pub use_manager_lookup: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let studios = [
            "Studio Ghibli",
            "Toei Animation",
            "Madhouse",
            "Sunrise",
            "Bones",
            "Production I.G",
            "Kyoto Animation",
            "MAPPA",
            "Wit Studio",
            "A-1 Pictures",
            "ufotable",
            "Shaft",
            "Trigger",
            "CloverWorks",
            "David Production",
            "Pierrot",
            "J.C.Staff",
            "Studio Deen",
            "OLM",
            "TMS Entertainment",
            "Gainax",
            "Science SARU",
            "P.A. Works",
            "Lerche",
            "Silver Link",
        ];
        Self {
            anime_paths: vec!["anime".to_string()],
            anime_genres: vec!["anime".to_string()],
            anime_studios: studios.iter().map(|s| s.to_string()).collect(),
            fallback_is_anime: false,
            default_language: "eng".to_string(),
            use_sidecar: true,
            use_manager_lookup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of parallel workers
    pub workers: usize,
    /// Directory where job state JSON files are stored
    pub job_state_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    /// Per-invocation ffmpeg timeout in seconds (0 = none)
    pub job_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Extra attempts for transient tool failures
    pub tool_retries: u32,
    /// Base backoff in seconds, doubled per attempt
    pub retry_backoff_secs: u64,
    /// Idle workers re-check the store at this interval
    pub poll_interval_secs: u64,
    /// Terminal jobs older than this are purged by housekeeping
    pub retention_days: u32,
    /// Seconds a scanned file must keep a stable size before it is enqueued
    pub scan_settle_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            job_state_dir: PathBuf::from("/var/lib/remuxd/jobs"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            job_timeout_secs: 7200,
            probe_timeout_secs: 60,
            tool_retries: 2,
            retry_backoff_secs: 5,
            poll_interval_secs: 30,
            retention_days: 30,
            scan_settle_secs: 10,
        }
    }
}

/// Sonarr or Radarr connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrConfig {
    pub enabled: bool,
    pub url: String,
    pub api_key: String,
    /// Ask the manager to rename files after a mutating job
    pub trigger_rename: bool,
    /// Upper bound on waiting for the refresh command before renaming
    pub rename_wait_secs: u64,
}

impl Default for ArrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_key: String::new(),
            trigger_rename: true,
            rename_wait_secs: 30,
        }
    }
}

impl ArrConfig {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.url.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub container: String,
    pub host: String,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl RemuxConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            library_roots: vec![PathBuf::from("/media")],
            content_filter: ContentFilterConfig::default(),
            audio: AudioConfig::default(),
            video: VideoConfig::default(),
            cleanup: CleanupConfig::default(),
            classifier: ClassifierConfig::default(),
            processing: ProcessingConfig::default(),
            sonarr: ArrConfig::default(),
            radarr: ArrConfig::default(),
            path_mappings: Vec::new(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                config = if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?
                } else {
                    serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?
                };
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `REMUXCODE_WORKERS`, `SONARR_*` and `RADARR_*` overrides.
    ///
    /// Takes a lookup function so tests don't touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("REMUXCODE_WORKERS") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.processing.workers = n,
                _ => warn!("Ignoring invalid REMUXCODE_WORKERS value: {}", raw),
            }
        }

        for (prefix, arr) in [("SONARR", &mut self.sonarr), ("RADARR", &mut self.radarr)] {
            if let Some(url) = lookup(&format!("{prefix}_URL")) {
                arr.url = url;
                arr.enabled = true;
            }
            if let Some(key) = lookup(&format!("{prefix}_API_KEY")) {
                arr.api_key = key;
            }
        }
    }

    /// Translate a container path reported by a media manager to a host path.
    pub fn translate_path(&self, path: &str) -> PathBuf {
        translate_path(&self.path_mappings, path)
    }
}

/// Map a container path to a host path.
///
/// The longest matching container prefix wins; unmatched paths pass through.
pub fn translate_path(mappings: &[PathMapping], path: &str) -> PathBuf {
    let best = mappings
        .iter()
        .filter(|m| {
            let prefix = m.container.trim_end_matches('/');
            !prefix.is_empty()
                && path.starts_with(prefix)
                && matches!(path[prefix.len()..].chars().next(), None | Some('/'))
        })
        .max_by_key(|m| m.container.trim_end_matches('/').len());

    match best {
        Some(mapping) => {
            let prefix_len = mapping.container.trim_end_matches('/').len();
            let rest = path[prefix_len..].trim_start_matches('/');
            if rest.is_empty() {
                PathBuf::from(&mapping.host)
            } else {
                Path::new(&mapping.host).join(rest)
            }
        }
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = RemuxConfig::load_config(Some(Path::new("/nonexistent/remuxd.toml"))).unwrap();
        assert_eq!(config.audio.aac_stereo_bitrate, 320);
        assert_eq!(config.audio.ac3_bitrate, 640);
        assert_eq!(config.audio.eac3_bitrate, 1536);
        assert!(!config.content_filter.anime_only);
        assert_eq!(config.cleanup.always_keep, vec!["eng".to_string()]);
    }

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remuxd.toml");
        std::fs::write(
            &path,
            r#"
library_roots = ["/data/media"]

[content_filter]
anime_only = true

[video]
encoder = "av1"

[processing]
workers = 3
"#,
        )
        .unwrap();

        let config = RemuxConfig::load_config(Some(&path)).unwrap();
        assert!(config.content_filter.anime_only);
        assert_eq!(config.video.encoder, VideoEncoder::Av1);
        assert_eq!(config.video.tables().anime.crf, 28);
        assert_eq!(config.video.legacy_codec, "h264");
        assert_eq!(config.processing.ffprobe_bin, PathBuf::from("ffprobe"));
        assert_eq!(config.library_roots, vec![PathBuf::from("/data/media")]);
    }

    #[test]
    fn test_json_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remuxd.json");
        std::fs::write(&path, r#"{"audio": {"prefer_ac3": false}}"#).unwrap();

        let config = RemuxConfig::load_config(Some(&path)).unwrap();
        assert!(!config.audio.prefer_ac3);
        assert!(config.audio.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("REMUXCODE_WORKERS", "4"),
            ("SONARR_URL", "http://sonarr:8989"),
            ("SONARR_API_KEY", "abc"),
        ]
        .into_iter()
        .collect();

        let mut config = RemuxConfig::default_config();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.processing.workers, 4);
        assert!(config.sonarr.is_usable());
        assert!(!config.radarr.is_usable());
    }

    #[test]
    fn test_invalid_worker_override_is_ignored() {
        let mut config = RemuxConfig::default_config();
        config.apply_env_overrides(|k| (k == "REMUXCODE_WORKERS").then(|| "zero".to_string()));
        assert_eq!(config.processing.workers, 1);
    }

    #[test]
    fn test_translate_path_longest_prefix() {
        let mut config = RemuxConfig::default_config();
        config.path_mappings = vec![
            PathMapping {
                container: "/tv".to_string(),
                host: "/mnt/media/tv".to_string(),
            },
            PathMapping {
                container: "/tv/anime".to_string(),
                host: "/mnt/anime".to_string(),
            },
        ];
        assert_eq!(
            config.translate_path("/tv/anime/Show/S01E01.mkv"),
            PathBuf::from("/mnt/anime/Show/S01E01.mkv")
        );
        assert_eq!(
            config.translate_path("/tv/Other/S01E01.mkv"),
            PathBuf::from("/mnt/media/tv/Other/S01E01.mkv")
        );
        assert_eq!(
            config.translate_path("/movies/a.mkv"),
            PathBuf::from("/movies/a.mkv")
        );
        assert_eq!(
            config.translate_path("/tvshows/a.mkv"),
            PathBuf::from("/tvshows/a.mkv")
        );
    }
}
