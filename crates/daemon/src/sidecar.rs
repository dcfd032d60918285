use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Check if a skip marker (.remuxskip) exists for a file
pub fn has_skip_marker(file_path: &Path) -> bool {
    skip_marker_path(file_path).exists()
}

/// Get the path to the skip marker file for a given media file
pub fn skip_marker_path(file_path: &Path) -> PathBuf {
    let mut path = file_path.to_path_buf();
    path.set_extension("remuxskip");
    path
}

/// Metadata read from a Kodi-style NFO next to the media.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarMetadata {
    pub genres: Vec<String>,
    pub studios: Vec<String>,
    pub countries: Vec<String>,
    pub original_title: Option<String>,
    /// First of `language`, `originallanguage`, `original_language`
    pub language: Option<String>,
}

impl SidecarMetadata {
    /// Country tag or original title points at a Japanese production.
    pub fn has_japanese_origin(&self) -> bool {
        self.countries.iter().any(|c| c.eq_ignore_ascii_case("japan"))
            || self.original_title.as_deref().is_some_and(contains_japanese_script)
    }
}

/// Hiragana, katakana or CJK ideographs.
pub fn contains_japanese_script(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c as u32,
            0x3040..=0x309F | 0x30A0..=0x30FF | 0x4E00..=0x9FFF)
    })
}

/// Whether the path sits in a TV library layout.
pub fn is_tv_path(file_path: &Path) -> bool {
    let lower = file_path.to_string_lossy().to_lowercase();
    ["/shows/", "/tv/", "/series/"].iter().any(|m| lower.contains(m)) || lower.contains("season")
}

/// Locate the NFO describing a media file.
///
/// TV episodes use `tvshow.nfo` in the show directory (the season folder's
/// parent). Movies use `<stem>.nfo`, then `movie.nfo`.
pub fn find_nfo(file_path: &Path) -> Option<PathBuf> {
    let parent = file_path.parent()?;

    let candidates: Vec<PathBuf> = if is_tv_path(file_path) {
        let mut c = vec![parent.join("tvshow.nfo")];
        if let Some(show_dir) = parent.parent() {
            c.insert(0, show_dir.join("tvshow.nfo"));
        }
        c
    } else {
        let mut c = Vec::new();
        if let Some(stem) = file_path.file_stem() {
            c.push(parent.join(format!("{}.nfo", stem.to_string_lossy())));
        }
        c.push(parent.join("movie.nfo"));
        c
    };

    candidates.into_iter().find(|p| p.is_file())
}

/// Read and parse the NFO for a media file. A missing or malformed NFO yields
/// `None`; classification never fails on sidecar problems.
pub fn read_sidecar(file_path: &Path) -> Option<SidecarMetadata> {
    let nfo = find_nfo(file_path)?;
    let content = match fs::read_to_string(&nfo) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read {}: {}", nfo.display(), e);
            return None;
        }
    };
    match parse_nfo(&content) {
        Ok(meta) => {
            debug!("Read sidecar metadata from {}", nfo.display());
            Some(meta)
        }
        Err(e) => {
            warn!("Ignoring malformed NFO {}: {}", nfo.display(), e);
            None
        }
    }
}

pub fn parse_nfo(xml: &str) -> Result<SidecarMetadata, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut meta = SidecarMetadata::default();
    let mut current: Option<Vec<u8>> = None;
    let mut depth = 0usize;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => {
                depth += 1;
                // Only direct children of the root element; nested <actor><name> etc. are ignored.
                current = (depth == 2).then(|| e.local_name().as_ref().to_ascii_lowercase());
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                current = None;
            }
            Event::Text(e) => {
                let Some(tag) = current.as_deref() else {
                    continue;
                };
                let value = e.unescape()?.trim().to_string();
                if value.is_empty() {
                    continue;
                }
                match tag {
                    b"genre" => meta.genres.push(value),
                    b"studio" => meta.studios.push(value),
                    b"country" => meta.countries.push(value),
                    b"originaltitle" => {
                        meta.original_title.get_or_insert(value);
                    }
                    b"language" | b"originallanguage" | b"original_language" => {
                        meta.language.get_or_insert(value);
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TVSHOW_NFO: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<tvshow>
    <title>Frieren</title>
    <originaltitle>葬送のフリーレン</originaltitle>
    <genre>Animation</genre>
    <genre>Fantasy &amp; Adventure</genre>
    <studio>Madhouse</studio>
    <country>Japan</country>
    <actor>
        <name>Atsumi Tanezaki</name>
        <genre>ignored</genre>
    </actor>
</tvshow>"#;

    #[test]
    fn test_parse_tvshow_nfo() {
        let meta = parse_nfo(TVSHOW_NFO).unwrap();
        assert_eq!(meta.genres, vec!["Animation", "Fantasy & Adventure"]);
        assert_eq!(meta.studios, vec!["Madhouse"]);
        assert_eq!(meta.countries, vec!["Japan"]);
        assert!(meta.has_japanese_origin());
        assert!(meta.language.is_none());
    }

    #[test]
    fn test_parse_language_field() {
        let meta = parse_nfo(
            "<movie><title>Amélie</title><originallanguage>fr</originallanguage><language>French</language></movie>",
        )
        .unwrap();
        assert_eq!(meta.language.as_deref(), Some("fr"));
        assert!(!meta.has_japanese_origin());
    }

    #[test]
    fn test_malformed_nfo_is_error() {
        assert!(parse_nfo("<movie><genre>Drama</movie>").is_err());
    }

    #[test]
    fn test_japanese_script() {
        assert!(contains_japanese_script("進撃の巨人"));
        assert!(contains_japanese_script("カウボーイビバップ"));
        assert!(!contains_japanese_script("Cowboy Bebop"));
    }

    #[test]
    fn test_find_tvshow_nfo_in_show_dir() {
        let dir = TempDir::new().unwrap();
        let season = dir.path().join("tv/Show/Season 01");
        fs::create_dir_all(&season).unwrap();
        fs::write(dir.path().join("tv/Show/tvshow.nfo"), TVSHOW_NFO).unwrap();
        let episode = season.join("Show - S01E01.mkv");

        let meta = read_sidecar(&episode).unwrap();
        assert_eq!(meta.studios, vec!["Madhouse"]);
    }

    #[test]
    fn test_find_movie_nfo_prefers_stem() {
        let dir = TempDir::new().unwrap();
        let movie_dir = dir.path().join("movies/Film (2001)");
        fs::create_dir_all(&movie_dir).unwrap();
        fs::write(movie_dir.join("movie.nfo"), "<movie><genre>Drama</genre></movie>").unwrap();
        fs::write(movie_dir.join("Film (2001).nfo"), "<movie><genre>Anime</genre></movie>").unwrap();

        let meta = read_sidecar(&movie_dir.join("Film (2001).mkv")).unwrap();
        assert_eq!(meta.genres, vec!["Anime"]);
    }

    #[test]
    fn test_skip_marker() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.mkv");
        assert!(!has_skip_marker(&file));
        fs::write(skip_marker_path(&file), "").unwrap();
        assert!(has_skip_marker(&file));
    }
}
