//! ISO 639 language code normalization.
//!
//! Canonical codes are ISO 639-2/B (`fre`, `ger`, `chi`), which is what most
//! Matroska muxers write. `und` means unknown.

use std::path::Path;

pub const UNDEFINED: &str = "und";

/// (canonical code, ISO 639-1 code, English name, terminology alternate)
const LANGUAGES: &[(&str, &str, &str, Option<&str>)] = &[
    ("jpn", "ja", "japanese", None),
    ("eng", "en", "english", None),
    ("kor", "ko", "korean", None),
    ("chi", "zh", "chinese", Some("zho")),
    ("spa", "es", "spanish", None),
    ("fre", "fr", "french", Some("fra")),
    ("ger", "de", "german", Some("deu")),
    ("ita", "it", "italian", None),
    ("por", "pt", "portuguese", None),
    ("rus", "ru", "russian", None),
    ("ara", "ar", "arabic", None),
    ("hin", "hi", "hindi", None),
    ("tha", "th", "thai", None),
    ("vie", "vi", "vietnamese", None),
    ("pol", "pl", "polish", None),
    ("dut", "nl", "dutch", Some("nld")),
    ("swe", "sv", "swedish", None),
    ("nor", "no", "norwegian", None),
    ("dan", "da", "danish", None),
    ("fin", "fi", "finnish", None),
    ("cze", "cs", "czech", Some("ces")),
    ("hun", "hu", "hungarian", None),
    ("tur", "tr", "turkish", None),
    ("gre", "el", "greek", Some("ell")),
    ("heb", "he", "hebrew", None),
];

/// Map a language name, ISO 639-1 code or ISO 639-2 code to the canonical code.
pub fn normalize_language_code(raw: &str) -> String {
    let lang = raw.trim().to_ascii_lowercase();
    if lang.is_empty() {
        return UNDEFINED.to_string();
    }
    if matches!(lang.as_str(), "mandarin" | "cantonese") {
        return "chi".to_string();
    }
    LANGUAGES
        .iter()
        .find(|(code, short, name, alt)| {
            lang == *code || lang == *short || lang == *name || Some(lang.as_str()) == *alt
        })
        .map(|(code, ..)| code.to_string())
        .unwrap_or_else(|| UNDEFINED.to_string())
}

/// The other ISO 639-2 spelling of a canonical code, if it has one.
pub fn alternate_code(code: &str) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|(canonical, ..)| *canonical == code)
        .and_then(|(.., alt)| *alt)
}

/// Capitalized English name for track titles, e.g. `English`.
pub fn display_name(code: &str) -> Option<String> {
    let canonical = normalize_language_code(code);
    LANGUAGES
        .iter()
        .find(|(c, ..)| *c == canonical)
        .map(|(_, _, name, _)| {
            let mut chars = name.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
}

/// Whether a stream tag is missing or `und`.
pub fn is_undefined(tag: Option<&str>) -> bool {
    match tag {
        None => true,
        Some(t) => {
            let t = t.trim();
            t.is_empty() || t.eq_ignore_ascii_case(UNDEFINED)
        }
    }
}

/// Guess the original language from library folder naming.
///
/// `anime_markers` are the configured anime path segments.
pub fn language_from_path(path: &Path, anime_markers: &[String]) -> Option<&'static str> {
    let lower = path.to_string_lossy().to_lowercase().replace('\\', "/");
    let segments: Vec<&str> = lower.split('/').collect();
    let has_segment = |needle: &str| segments.iter().any(|s| s.contains(needle));

    if anime_markers.iter().any(|m| {
        let marker = m.replace('\\', "/").trim_matches('/').to_lowercase();
        !marker.is_empty() && lower.contains(&marker)
    }) {
        return Some("jpn");
    }
    if has_segment("korean") || has_segment("k-drama") || has_segment("kdrama") {
        return Some("kor");
    }
    if has_segment("chinese") || has_segment("c-drama") || has_segment("mandarin") {
        return Some("chi");
    }
    if has_segment("spanish") || has_segment("telenovela") {
        return Some("spa");
    }
    None
}
