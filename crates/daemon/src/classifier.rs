use std::fmt;
use std::path::Path;

use log::debug;

use crate::config::ClassifierConfig;
use crate::ffprobe::MediaInfo;
use crate::language::{self, UNDEFINED};
use crate::manager::ManagerMetadata;
use crate::sidecar::SidecarMetadata;

/// Everything the classifier may look at for one file.
#[derive(Debug, Clone, Copy)]
pub struct Evidence<'a> {
    pub path: &'a Path,
    pub sidecar: Option<&'a SidecarMetadata>,
    pub manager: Option<&'a ManagerMetadata>,
}

/// The signal that decided the anime verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnimeSignal {
    PathMarker(String),
    SidecarGenre(String),
    ManagerGenre(String),
    Studio(String),
    /// No rule was decisive; the configured fallback applied.
    Fallback,
}

impl fmt::Display for AnimeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnimeSignal::PathMarker(m) => write!(f, "path marker '{m}'"),
            AnimeSignal::SidecarGenre(g) => write!(f, "sidecar genre '{g}'"),
            AnimeSignal::ManagerGenre(g) => write!(f, "manager genre '{g}'"),
            AnimeSignal::Studio(s) => write!(f, "studio '{s}'"),
            AnimeSignal::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageSource {
    Sidecar,
    Manager,
    Path,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub is_anime: bool,
    pub anime_signal: AnimeSignal,
    pub original_language: String,
    pub language_source: LanguageSource,
}

/// Probe output plus classification verdicts, recomputed for every run.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentProfile {
    pub info: MediaInfo,
    pub is_anime: bool,
    pub original_language: String,
    pub anime_signal: AnimeSignal,
    pub language_source: LanguageSource,
}

impl ContentProfile {
    pub fn new(info: MediaInfo, classification: Classification) -> Self {
        Self {
            info,
            is_anime: classification.is_anime,
            original_language: classification.original_language,
            anime_signal: classification.anime_signal,
            language_source: classification.language_source,
        }
    }
}

type AnimeRule = fn(&Evidence<'_>, &ClassifierConfig) -> Option<AnimeSignal>;

/// Evaluated in order; the first decisive rule wins.
const ANIME_RULES: [AnimeRule; 4] = [path_marker, sidecar_genre, manager_genre, studio_match];

fn eq_any(value: &str, list: &[String]) -> Option<String> {
    list.iter()
        .find(|item| item.eq_ignore_ascii_case(value.trim()))
        .map(|item| item.to_lowercase())
}

fn path_marker(evidence: &Evidence<'_>, cfg: &ClassifierConfig) -> Option<AnimeSignal> {
    let lower = evidence.path.to_string_lossy().to_lowercase().replace('\\', "/");
    // The file name itself is not a library marker.
    let dirs = lower.rsplit_once('/').map(|(dirs, _)| dirs).unwrap_or("");

    // Markers may span directories, e.g. `animation/japanese`.
    cfg.anime_paths
        .iter()
        .map(|m| m.replace('\\', "/").trim_matches('/').to_lowercase())
        .find(|m| !m.is_empty() && dirs.contains(m.as_str()))
        .map(AnimeSignal::PathMarker)
}

fn sidecar_genre(evidence: &Evidence<'_>, cfg: &ClassifierConfig) -> Option<AnimeSignal> {
    let sidecar = evidence.sidecar?;
    if let Some(genre) = sidecar.genres.iter().find_map(|g| eq_any(g, &cfg.anime_genres)) {
        return Some(AnimeSignal::SidecarGenre(genre));
    }
    let animation = sidecar.genres.iter().any(|g| g.eq_ignore_ascii_case("animation"));
    (animation && sidecar.has_japanese_origin())
        .then(|| AnimeSignal::SidecarGenre("animation".to_string()))
}

fn manager_genre(evidence: &Evidence<'_>, cfg: &ClassifierConfig) -> Option<AnimeSignal> {
    let meta = evidence.manager?;
    if let Some(kind) = meta.content_type.as_deref().and_then(|t| eq_any(t, &cfg.anime_genres)) {
        return Some(AnimeSignal::ManagerGenre(kind));
    }
    if let Some(genre) = meta.genres.iter().find_map(|g| eq_any(g, &cfg.anime_genres)) {
        return Some(AnimeSignal::ManagerGenre(genre));
    }
    let animation = meta.genres.iter().any(|g| g.eq_ignore_ascii_case("animation"));
    let japanese = meta
        .original_language
        .as_deref()
        .is_some_and(|l| language::normalize_language_code(l) == "jpn");
    (animation && japanese).then(|| AnimeSignal::ManagerGenre("animation".to_string()))
}

fn studio_match(evidence: &Evidence<'_>, cfg: &ClassifierConfig) -> Option<AnimeSignal> {
    let sidecar = evidence.sidecar?;
    sidecar.studios.iter().find_map(|studio| {
        let studio_lower = studio.to_lowercase();
        cfg.anime_studios
            .iter()
            .find(|known| !known.is_empty() && studio_lower.contains(&known.to_lowercase()))
            .map(|known| AnimeSignal::Studio(known.clone()))
    })
}

pub fn classify_anime(evidence: &Evidence<'_>, cfg: &ClassifierConfig) -> (bool, AnimeSignal) {
    match ANIME_RULES.iter().find_map(|rule| rule(evidence, cfg)) {
        Some(signal) => (true, signal),
        None => (cfg.fallback_is_anime, AnimeSignal::Fallback),
    }
}

fn known_language(raw: Option<&str>) -> Option<String> {
    raw.map(language::normalize_language_code)
        .filter(|code| code != UNDEFINED)
}

/// Sidecar, then manager, then path heuristic, then the configured default.
pub fn detect_original_language(
    evidence: &Evidence<'_>,
    cfg: &ClassifierConfig,
) -> (String, LanguageSource) {
    if let Some(code) = known_language(evidence.sidecar.and_then(|s| s.language.as_deref())) {
        return (code, LanguageSource::Sidecar);
    }
    if let Some(code) = known_language(evidence.manager.and_then(|m| m.original_language.as_deref())) {
        return (code, LanguageSource::Manager);
    }
    if let Some(code) = language::language_from_path(evidence.path, &cfg.anime_paths) {
        return (code.to_string(), LanguageSource::Path);
    }
    (
        language::normalize_language_code(&cfg.default_language),
        LanguageSource::Default,
    )
}

pub fn classify(evidence: &Evidence<'_>, cfg: &ClassifierConfig) -> Classification {
    let (is_anime, anime_signal) = classify_anime(evidence, cfg);
    let (original_language, language_source) = detect_original_language(evidence, cfg);
    debug!(
        "Classified {}: anime={} ({}), language={} ({:?})",
        evidence.path.display(),
        is_anime,
        anime_signal,
        original_language,
        language_source
    );
    Classification {
        is_anime,
        anime_signal,
        original_language,
        language_source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MediaType;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn cfg() -> ClassifierConfig {
        ClassifierConfig::default()
    }

    fn sidecar(genres: &[&str], studios: &[&str]) -> SidecarMetadata {
        SidecarMetadata {
            genres: genres.iter().map(|s| s.to_string()).collect(),
            studios: studios.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn manager(content_type: Option<&str>, genres: &[&str], lang: Option<&str>) -> ManagerMetadata {
        ManagerMetadata {
            media_type: MediaType::Series,
            title: "Show".to_string(),
            path: PathBuf::from("/tv/Show"),
            genres: genres.iter().map(|s| s.to_string()).collect(),
            original_language: lang.map(str::to_string),
            content_type: content_type.map(str::to_string),
        }
    }

    #[test]
    fn test_path_marker_wins_first() {
        let sc = sidecar(&["Drama"], &[]);
        let ev = Evidence {
            path: Path::new("/media/Anime/Show/S01E01.mkv"),
            sidecar: Some(&sc),
            manager: None,
        };
        assert_eq!(
            classify_anime(&ev, &cfg()),
            (true, AnimeSignal::PathMarker("anime".to_string()))
        );
    }

    #[test]
    fn test_file_name_is_not_a_marker() {
        let ev = Evidence {
            path: Path::new("/media/movies/Anime Documentary (2020).mkv"),
            sidecar: None,
            manager: None,
        };
        assert_eq!(classify_anime(&ev, &cfg()), (false, AnimeSignal::Fallback));
    }

    #[test]
    fn test_marker_spanning_directories() {
        let mut c = cfg();
        c.anime_paths = vec!["Animation/Japanese/".to_string()];
        let ev = Evidence {
            path: Path::new("/media/animation/japanese/Show/S01E01.mkv"),
            sidecar: None,
            manager: None,
        };
        assert_eq!(
            classify_anime(&ev, &c),
            (true, AnimeSignal::PathMarker("animation/japanese".to_string()))
        );

        let elsewhere = Evidence {
            path: Path::new("/media/animation/western/Show/S01E01.mkv"),
            ..ev
        };
        assert_eq!(classify_anime(&elsewhere, &c), (false, AnimeSignal::Fallback));
    }

    #[test]
    fn test_sidecar_genre_before_manager() {
        let sc = sidecar(&["Anime"], &[]);
        let mm = manager(Some("anime"), &[], None);
        let ev = Evidence {
            path: Path::new("/media/tv/Show/S01E01.mkv"),
            sidecar: Some(&sc),
            manager: Some(&mm),
        };
        assert_eq!(
            classify_anime(&ev, &cfg()).1,
            AnimeSignal::SidecarGenre("anime".to_string())
        );
    }

    #[test]
    fn test_animation_needs_japanese_origin() {
        let mut sc = sidecar(&["Animation"], &[]);
        let ev = Evidence {
            path: Path::new("/media/movies/Toy Story/Toy Story.mkv"),
            sidecar: Some(&sc),
            manager: None,
        };
        assert!(!classify_anime(&ev, &cfg()).0);

        sc.countries.push("Japan".to_string());
        let ev = Evidence {
            path: Path::new("/media/movies/Spirited Away/Spirited Away.mkv"),
            sidecar: Some(&sc),
            manager: None,
        };
        assert!(classify_anime(&ev, &cfg()).0);
    }

    #[test]
    fn test_manager_series_type() {
        let mm = manager(Some("anime"), &["Action"], None);
        let ev = Evidence {
            path: Path::new("/media/tv/Show/S01E01.mkv"),
            sidecar: None,
            manager: Some(&mm),
        };
        assert_eq!(
            classify_anime(&ev, &cfg()).1,
            AnimeSignal::ManagerGenre("anime".to_string())
        );
    }

    #[test]
    fn test_studio_match() {
        let sc = sidecar(&["Drama"], &["Kyoto Animation Co., Ltd."]);
        let ev = Evidence {
            path: Path::new("/media/movies/Film/Film.mkv"),
            sidecar: Some(&sc),
            manager: None,
        };
        assert_eq!(
            classify_anime(&ev, &cfg()).1,
            AnimeSignal::Studio("Kyoto Animation".to_string())
        );
    }

    #[test]
    fn test_fallback_is_configurable() {
        let mut c = cfg();
        c.fallback_is_anime = true;
        let ev = Evidence {
            path: Path::new("/media/movies/Film/Film.mkv"),
            sidecar: None,
            manager: None,
        };
        assert_eq!(classify_anime(&ev, &c), (true, AnimeSignal::Fallback));
    }

    #[test]
    fn test_language_precedence() {
        let mut sc = sidecar(&[], &[]);
        sc.language = Some("French".to_string());
        let mm = manager(None, &[], Some("Japanese"));
        let path = Path::new("/media/anime/Show/S01E01.mkv");

        let ev = Evidence { path, sidecar: Some(&sc), manager: Some(&mm) };
        assert_eq!(
            detect_original_language(&ev, &cfg()),
            ("fre".to_string(), LanguageSource::Sidecar)
        );

        let ev = Evidence { path, sidecar: None, manager: Some(&mm) };
        assert_eq!(
            detect_original_language(&ev, &cfg()),
            ("jpn".to_string(), LanguageSource::Manager)
        );

        let ev = Evidence { path, sidecar: None, manager: None };
        assert_eq!(
            detect_original_language(&ev, &cfg()),
            ("jpn".to_string(), LanguageSource::Path)
        );

        let ev = Evidence { path: Path::new("/media/tv/Show/S01E01.mkv"), sidecar: None, manager: None };
        assert_eq!(
            detect_original_language(&ev, &cfg()),
            ("eng".to_string(), LanguageSource::Default)
        );
    }

    #[test]
    fn test_unknown_sidecar_language_falls_through() {
        let mut sc = sidecar(&[], &[]);
        sc.language = Some("Klingon".to_string());
        let mm = manager(None, &[], Some("Korean"));
        let ev = Evidence {
            path: Path::new("/media/tv/Show/S01E01.mkv"),
            sidecar: Some(&sc),
            manager: Some(&mm),
        };
        assert_eq!(
            detect_original_language(&ev, &cfg()),
            ("kor".to_string(), LanguageSource::Manager)
        );
    }

    // Strategy for genre lists that never contain an anime signal
    fn plain_genres() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(
            prop_oneof![
                Just("Drama".to_string()),
                Just("Comedy".to_string()),
                Just("Action".to_string()),
                Just("Documentary".to_string()),
            ],
            0..4,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// A library marker decides the verdict whatever the other sources say.
        #[test]
        fn prop_path_marker_is_decisive(genres in plain_genres(), fallback in any::<bool>()) {
            let mut c = cfg();
            c.fallback_is_anime = fallback;
            let sc = SidecarMetadata { genres, ..Default::default() };
            let ev = Evidence {
                path: Path::new("/data/anime/Show/Season 01/S01E01.mkv"),
                sidecar: Some(&sc),
                manager: None,
            };
            let (is_anime, signal) = classify_anime(&ev, &c);
            prop_assert!(is_anime);
            prop_assert_eq!(signal, AnimeSignal::PathMarker("anime".to_string()));
        }

        /// Without any decisive signal the configured fallback is returned.
        #[test]
        fn prop_no_signal_uses_fallback(genres in plain_genres(), fallback in any::<bool>()) {
            let mut c = cfg();
            c.fallback_is_anime = fallback;
            let sc = SidecarMetadata { genres, ..Default::default() };
            let mm = manager(Some("standard"), &[], Some("English"));
            let ev = Evidence {
                path: Path::new("/data/tv/Show/Season 01/S01E01.mkv"),
                sidecar: Some(&sc),
                manager: Some(&mm),
            };
            prop_assert_eq!(classify_anime(&ev, &c), (fallback, AnimeSignal::Fallback));
        }

        /// Classification is a pure function of its inputs.
        #[test]
        fn prop_classify_is_deterministic(genres in plain_genres(), anime_dir in any::<bool>()) {
            let path = if anime_dir {
                PathBuf::from("/data/anime/Show/S01E01.mkv")
            } else {
                PathBuf::from("/data/tv/Show/S01E01.mkv")
            };
            let sc = SidecarMetadata { genres, ..Default::default() };
            let ev = Evidence { path: &path, sidecar: Some(&sc), manager: None };
            prop_assert_eq!(classify(&ev, &cfg()), classify(&ev, &cfg()));
        }
    }
}
