use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{translate_path, ArrConfig, PathMapping, RemuxConfig};
use crate::error::LookupError;
use crate::sidecar::is_tv_path;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Series,
}

/// What a media manager knows about one file.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerMetadata {
    pub media_type: MediaType,
    pub title: String,
    /// Host path of the media file
    pub path: PathBuf,
    pub genres: Vec<String>,
    pub original_language: Option<String>,
    /// Series type for TV (`anime`, `standard`, `daily`)
    pub content_type: Option<String>,
}

/// Identifier of an item in one of the media managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ExternalId {
    Movie(u64),
    #[serde(rename = "episodefile")]
    EpisodeFile(u64),
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalId::Movie(id) => write!(f, "movie:{}", id),
            ExternalId::EpisodeFile(id) => write!(f, "episodefile:{}", id),
        }
    }
}

impl FromStr for ExternalId {
    type Err = String;

    /// Accepts `movie:<id>` and `episodefile:<id>` (or `episode:<id>`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <kind>:<id>, got '{}'", s))?;
        let id: u64 = id
            .trim()
            .parse()
            .map_err(|_| format!("invalid id in '{}'", s))?;
        match kind.trim().to_ascii_lowercase().as_str() {
            "movie" => Ok(ExternalId::Movie(id)),
            "episodefile" | "episode" => Ok(ExternalId::EpisodeFile(id)),
            other => Err(format!("unknown id kind '{}'", other)),
        }
    }
}

/// Metadata lookups and rename triggers against Sonarr/Radarr style managers.
#[async_trait]
pub trait MediaManager: Send + Sync {
    /// Whether any manager is reachable at all.
    fn is_configured(&self) -> bool;

    async fn lookup_metadata(&self, id: &ExternalId) -> Result<ManagerMetadata, LookupError>;

    /// Find the movie or series owning a host path. `Ok(None)` when no manager tracks it.
    async fn lookup_by_path(&self, path: &Path) -> Result<Option<ManagerMetadata>, LookupError>;

    /// Refresh the owning item and ask the manager to rename its files.
    async fn trigger_rename(&self, path: &Path) -> Result<(), LookupError>;
}

/// Used when neither manager is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullManager;

#[async_trait]
impl MediaManager for NullManager {
    fn is_configured(&self) -> bool {
        false
    }

    async fn lookup_metadata(&self, _id: &ExternalId) -> Result<ManagerMetadata, LookupError> {
        Err(LookupError::NotConfigured("media manager"))
    }

    async fn lookup_by_path(&self, _path: &Path) -> Result<Option<ManagerMetadata>, LookupError> {
        Ok(None)
    }

    async fn trigger_rename(&self, _path: &Path) -> Result<(), LookupError> {
        Ok(())
    }
}

/// Build the manager client described by the configuration.
pub fn from_config(config: &RemuxConfig) -> anyhow::Result<Arc<dyn MediaManager>> {
    if !config.sonarr.is_usable() && !config.radarr.is_usable() {
        debug!("No media manager configured");
        return Ok(Arc::new(NullManager));
    }
    Ok(Arc::new(ArrClient::new(config)?))
}

// ---- wire types ----

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArrLanguage {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadarrMovieFile {
    id: u64,
    path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RadarrMovie {
    id: u64,
    title: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    original_language: Option<ArrLanguage>,
    #[serde(default)]
    movie_file: Option<RadarrMovieFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SonarrSeries {
    id: u64,
    title: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    original_language: Option<ArrLanguage>,
    #[serde(default)]
    series_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SonarrEpisodeFile {
    id: u64,
    series_id: u64,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResource {
    id: u64,
    #[serde(default)]
    status: String,
}

impl CommandResource {
    fn is_finished(&self) -> bool {
        matches!(
            self.status.as_str(),
            "completed" | "failed" | "aborted" | "cancelled" | "orphaned"
        )
    }
}

fn language_name(lang: &Option<ArrLanguage>) -> Option<String> {
    lang.as_ref()
        .map(|l| l.name.trim().to_string())
        .filter(|n| !n.is_empty() && !n.eq_ignore_ascii_case("unknown"))
}

fn movie_metadata(movie: RadarrMovie, file_path: PathBuf) -> ManagerMetadata {
    ManagerMetadata {
        media_type: MediaType::Movie,
        original_language: language_name(&movie.original_language),
        title: movie.title,
        path: file_path,
        genres: movie.genres,
        content_type: None,
    }
}

fn series_metadata(series: SonarrSeries, file_path: PathBuf) -> ManagerMetadata {
    ManagerMetadata {
        media_type: MediaType::Series,
        original_language: language_name(&series.original_language),
        title: series.title,
        path: file_path,
        genres: series.genres,
        content_type: series.series_type,
    }
}

/// Pick the item whose (translated) root directory contains `file`.
/// The deepest root wins when libraries are nested.
fn owner_of<'a, T>(
    items: &'a [T],
    file: &Path,
    mappings: &[PathMapping],
    root_of: impl Fn(&T) -> Option<&str>,
) -> Option<&'a T> {
    items
        .iter()
        .filter_map(|item| {
            let root = translate_path(mappings, root_of(item)?);
            file.starts_with(&root).then_some((item, root.components().count()))
        })
        .max_by_key(|(_, depth)| *depth)
        .map(|(item, _)| item)
}

#[derive(Debug, Clone)]
struct ArrEndpoint {
    name: &'static str,
    base_url: String,
    api_key: String,
    trigger_rename: bool,
    rename_wait: Duration,
}

impl ArrEndpoint {
    fn from_config(name: &'static str, cfg: &ArrConfig) -> Option<Self> {
        cfg.is_usable().then(|| Self {
            name,
            base_url: cfg.url.trim().trim_end_matches('/').to_string(),
            api_key: cfg.api_key.trim().to_string(),
            trigger_rename: cfg.trigger_rename,
            rename_wait: Duration::from_secs(cfg.rename_wait_secs),
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/api/v3/{}", self.base_url, resource.trim_start_matches('/'))
    }
}

/// HTTP client for the Sonarr and Radarr v3 APIs.
pub struct ArrClient {
    client: reqwest::Client,
    sonarr: Option<ArrEndpoint>,
    radarr: Option<ArrEndpoint>,
    mappings: Vec<PathMapping>,
}

impl ArrClient {
    pub fn new(config: &RemuxConfig) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LookupError::Request {
                context: "building HTTP client".to_string(),
                source: e,
            })?;
        Ok(Self {
            client,
            sonarr: ArrEndpoint::from_config("sonarr", &config.sonarr),
            radarr: ArrEndpoint::from_config("radarr", &config.radarr),
            mappings: config.path_mappings.clone(),
        })
    }

    fn sonarr(&self) -> Result<&ArrEndpoint, LookupError> {
        self.sonarr.as_ref().ok_or(LookupError::NotConfigured("sonarr"))
    }

    fn radarr(&self) -> Result<&ArrEndpoint, LookupError> {
        self.radarr.as_ref().ok_or(LookupError::NotConfigured("radarr"))
    }

    fn host_path(&self, path: &str) -> PathBuf {
        translate_path(&self.mappings, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &ArrEndpoint,
        resource: &str,
    ) -> Result<T, LookupError> {
        let url = endpoint.url(resource);
        let context = format!("{} GET {}", endpoint.name, resource);
        let response = self
            .client
            .get(&url)
            .header("X-Api-Key", &endpoint.api_key)
            .send()
            .await
            .map_err(|e| LookupError::Request {
                context: context.clone(),
                source: e,
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LookupError::NotFound(format!("{} {}", endpoint.name, resource)));
        }

        response
            .error_for_status()
            .map_err(|e| LookupError::Request {
                context: context.clone(),
                source: e,
            })?
            .json::<T>()
            .await
            .map_err(|e| LookupError::Request { context, source: e })
    }

    async fn post_command(
        &self,
        endpoint: &ArrEndpoint,
        body: serde_json::Value,
    ) -> Result<CommandResource, LookupError> {
        let context = format!("{} POST command", endpoint.name);
        self.client
            .post(endpoint.url("command"))
            .header("X-Api-Key", &endpoint.api_key)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LookupError::Request {
                context: context.clone(),
                source: e,
            })?
            .json::<CommandResource>()
            .await
            .map_err(|e| LookupError::Request { context, source: e })
    }

    /// Poll a command until it finishes or the endpoint's wait budget runs out.
    async fn wait_for_command(&self, endpoint: &ArrEndpoint, command: CommandResource) {
        let deadline = tokio::time::Instant::now() + endpoint.rename_wait;
        let mut current = command;
        while !current.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} command {} still '{}' after {}s, renaming anyway",
                    endpoint.name,
                    current.id,
                    current.status,
                    endpoint.rename_wait.as_secs()
                );
                return;
            }
            tokio::time::sleep(COMMAND_POLL_INTERVAL).await;
            match self
                .get_json::<CommandResource>(endpoint, &format!("command/{}", current.id))
                .await
            {
                Ok(next) => current = next,
                Err(e) => {
                    warn!("Failed to poll {} command {}: {}", endpoint.name, current.id, e);
                    return;
                }
            }
        }
        debug!("{} command {} {}", endpoint.name, current.id, current.status);
    }

    async fn find_movie(&self, path: &Path) -> Result<Option<RadarrMovie>, LookupError> {
        let endpoint = self.radarr()?;
        let movies: Vec<RadarrMovie> = self.get_json(endpoint, "movie").await?;
        Ok(owner_of(&movies, path, &self.mappings, |m| m.path.as_deref()).cloned())
    }

    async fn find_series(&self, path: &Path) -> Result<Option<SonarrSeries>, LookupError> {
        let endpoint = self.sonarr()?;
        let series: Vec<SonarrSeries> = self.get_json(endpoint, "series").await?;
        Ok(owner_of(&series, path, &self.mappings, |s| s.path.as_deref()).cloned())
    }

    /// Managers to try for a path, most likely first.
    fn lookup_order(&self, path: &Path) -> Vec<MediaType> {
        let mut order = if is_tv_path(path) {
            vec![MediaType::Series, MediaType::Movie]
        } else {
            vec![MediaType::Movie, MediaType::Series]
        };
        order.retain(|t| match t {
            MediaType::Series => self.sonarr.is_some(),
            MediaType::Movie => self.radarr.is_some(),
        });
        order
    }

    async fn rename_movie(&self, movie: &RadarrMovie) -> Result<(), LookupError> {
        let endpoint = self.radarr()?;
        if !endpoint.trigger_rename {
            return Ok(());
        }
        let refresh = self
            .post_command(endpoint, json!({ "name": "RefreshMovie", "movieIds": [movie.id] }))
            .await?;
        self.wait_for_command(endpoint, refresh).await;
        self.post_command(endpoint, json!({ "name": "RenameMovie", "movieIds": [movie.id] }))
            .await?;
        info!("Requested rename for movie '{}'", movie.title);
        Ok(())
    }

    async fn rename_episode(&self, series: &SonarrSeries, path: &Path) -> Result<(), LookupError> {
        let endpoint = self.sonarr()?;
        if !endpoint.trigger_rename {
            return Ok(());
        }
        let refresh = self
            .post_command(endpoint, json!({ "name": "RefreshSeries", "seriesId": series.id }))
            .await?;
        self.wait_for_command(endpoint, refresh).await;

        let files: Vec<SonarrEpisodeFile> = self
            .get_json(endpoint, &format!("episodefile?seriesId={}", series.id))
            .await?;
        let file_id = files
            .iter()
            .find(|f| f.path.as_deref().map(|p| self.host_path(p)).as_deref() == Some(path))
            .map(|f| f.id);

        let body = match file_id {
            Some(id) => json!({ "name": "RenameFiles", "seriesId": series.id, "files": [id] }),
            None => json!({ "name": "RenameSeries", "seriesIds": [series.id] }),
        };
        self.post_command(endpoint, body).await?;
        info!("Requested rename for series '{}'", series.title);
        Ok(())
    }
}

#[async_trait]
impl MediaManager for ArrClient {
    fn is_configured(&self) -> bool {
        self.sonarr.is_some() || self.radarr.is_some()
    }

    async fn lookup_metadata(&self, id: &ExternalId) -> Result<ManagerMetadata, LookupError> {
        match *id {
            ExternalId::Movie(movie_id) => {
                let endpoint = self.radarr()?;
                let movie: RadarrMovie = self.get_json(endpoint, &format!("movie/{}", movie_id)).await?;
                let path = movie
                    .movie_file
                    .as_ref()
                    .and_then(|f| f.path.as_deref())
                    .map(|p| self.host_path(p))
                    .ok_or_else(|| LookupError::NoFile(id.to_string()))?;
                Ok(movie_metadata(movie, path))
            }
            ExternalId::EpisodeFile(file_id) => {
                let endpoint = self.sonarr()?;
                let file: SonarrEpisodeFile = self
                    .get_json(endpoint, &format!("episodefile/{}", file_id))
                    .await?;
                let path = file
                    .path
                    .as_deref()
                    .map(|p| self.host_path(p))
                    .ok_or_else(|| LookupError::NoFile(id.to_string()))?;
                let series: SonarrSeries = self
                    .get_json(endpoint, &format!("series/{}", file.series_id))
                    .await?;
                Ok(series_metadata(series, path))
            }
        }
    }

    async fn lookup_by_path(&self, path: &Path) -> Result<Option<ManagerMetadata>, LookupError> {
        for media_type in self.lookup_order(path) {
            match media_type {
                MediaType::Series => {
                    if let Some(series) = self.find_series(path).await? {
                        return Ok(Some(series_metadata(series, path.to_path_buf())));
                    }
                }
                MediaType::Movie => {
                    if let Some(movie) = self.find_movie(path).await? {
                        return Ok(Some(movie_metadata(movie, path.to_path_buf())));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn trigger_rename(&self, path: &Path) -> Result<(), LookupError> {
        for media_type in self.lookup_order(path) {
            match media_type {
                MediaType::Series => {
                    if let Some(series) = self.find_series(path).await? {
                        return self.rename_episode(&series, path).await;
                    }
                }
                MediaType::Movie => {
                    if let Some(movie) = self.find_movie(path).await? {
                        return self.rename_movie(&movie).await;
                    }
                }
            }
        }
        debug!("No media manager owns {}, skipping rename", path.display());
        Ok(())
    }
}
