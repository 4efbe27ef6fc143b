use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;

use common::{url_escape, MediaType, MetadataBundle};
use library::PLACEHOLDER_OVERVIEW_PREFIX;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::MetadataSettings;

const PLACEHOLDER_POSTER_BASE: &str = "https://placehold.co/400x600/1a1a1a/ffffff?text=";
const MAX_CAST: usize = 10;

#[derive(Clone, Debug)]
pub struct TmdbSource {
    pub api_key: String,
    pub base_url: String,
    pub image_base_url: String,
    pub languages: Vec<String>,
    pub timeout: Duration,
}

/// What a lookup is asked about. `file_name` only feeds the placeholder text.
#[derive(Clone, Debug)]
pub struct LookupRequest<'a> {
    pub title: &'a str,
    pub year: Option<i32>,
    pub external_id: Option<&'a str>,
    pub kind: MediaType,
    pub file_name: Option<&'a str>,
}

/// Turns titles into descriptive metadata. Never fails: every error path ends
/// in the filename-derived placeholder bundle.
#[derive(Clone, Debug)]
pub struct MetadataResolver {
    client: Client,
    source: Option<TmdbSource>,
}

impl MetadataResolver {
    pub fn new(client: Client, settings: &MetadataSettings) -> Self {
        let api_key = settings.api_key.trim();
        let source = if settings.enabled && !api_key.is_empty() {
            Some(TmdbSource {
                api_key: api_key.to_string(),
                base_url: settings.base_url.trim().trim_end_matches('/').to_string(),
                image_base_url: settings.image_base_url.trim().trim_end_matches('/').to_string(),
                languages: settings.languages.clone(),
                timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            })
        } else {
            None
        };
        Self { client, source }
    }

    pub fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    pub async fn resolve(&self, request: &LookupRequest<'_>) -> MetadataBundle {
        let source = match &self.source {
            Some(source) => source,
            None => return placeholder_bundle(request),
        };
        match lookup(&self.client, source, request).await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                debug!("No metadata match for {:?}", request.title);
                placeholder_bundle(request)
            }
            Err(err) => {
                warn!("Metadata lookup failed for {:?}: {}", request.title, err);
                placeholder_bundle(request)
            }
        }
    }

    /// Episode listing of one season of the series the provider knows as
    /// `tmdb_id`. Errors are returned, not replaced by a placeholder.
    pub async fn fetch_season(
        &self,
        tmdb_id: u64,
        season_number: u32,
    ) -> Result<Vec<SeasonEpisode>, String> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| "metadata provider not configured".to_string())?;
        let url = format!(
            "{}/tv/{}/season/{}?api_key={}&language={}",
            source.base_url,
            tmdb_id,
            season_number,
            url_escape(&source.api_key),
            url_escape(primary_language(source))
        );
        let response = get_json::<SeasonResponse>(&self.client, source, &url).await?;
        Ok(season_episodes(source, response))
    }
}

/// One episode of a provider season listing.
#[derive(Clone, Debug, PartialEq)]
pub struct SeasonEpisode {
    pub episode_number: u32,
    pub title: Option<String>,
    pub overview: Option<String>,
    pub still_url: Option<String>,
}

pub fn placeholder_bundle(request: &LookupRequest<'_>) -> MetadataBundle {
    MetadataBundle {
        title: request.title.to_string(),
        year: request.year,
        overview: Some(placeholder_overview(
            request.file_name.unwrap_or(request.title),
        )),
        poster_url: Some(placeholder_poster(request.title)),
        backdrop_url: None,
        genres: Vec::new(),
        cast: Vec::new(),
        tmdb_id: None,
        placeholder: true,
    }
}

pub fn placeholder_poster(title: &str) -> String {
    format!("{}{}", PLACEHOLDER_POSTER_BASE, url_escape(title))
}

pub fn placeholder_overview(file_name: &str) -> String {
    format!("{}{}", PLACEHOLDER_OVERVIEW_PREFIX, file_name)
}

#[derive(Clone, Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Clone, Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    movie_results: Vec<SearchHit>,
    #[serde(default)]
    tv_results: Vec<SearchHit>,
}

#[derive(Clone, Debug, Deserialize)]
struct SearchHit {
    id: u64,
    title: Option<String>,
    name: Option<String>,
    overview: Option<String>,
    poster_path: Option<String>,
    backdrop_path: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    #[serde(default)]
    popularity: f64,
}

impl SearchHit {
    fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("")
    }

    fn year(&self) -> Option<i32> {
        let date = self
            .release_date
            .as_deref()
            .or(self.first_air_date.as_deref())?;
        date.get(..4)?.parse().ok()
    }
}

#[derive(Clone, Debug, Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    genres: Vec<Genre>,
    credits: Option<Credits>,
    /// Series report cast across all seasons here instead of `credits`.
    aggregate_credits: Option<Credits>,
}

#[derive(Clone, Debug, Deserialize)]
struct SeasonResponse {
    #[serde(default)]
    episodes: Vec<SeasonEpisodeHit>,
}

#[derive(Clone, Debug, Deserialize)]
struct SeasonEpisodeHit {
    episode_number: u32,
    name: Option<String>,
    overview: Option<String>,
    still_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct Genre {
    name: String,
}

#[derive(Clone, Debug, Deserialize)]
struct Credits {
    #[serde(default)]
    cast: Vec<CastMember>,
}

#[derive(Clone, Debug, Deserialize)]
struct CastMember {
    name: String,
    #[serde(default)]
    order: Option<u32>,
}

async fn lookup(
    client: &Client,
    source: &TmdbSource,
    request: &LookupRequest<'_>,
) -> Result<Option<MetadataBundle>, String> {
    let mut hit = match request.external_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(external_id) => find_by_external_id(client, source, external_id, request.kind).await?,
        None => None,
    };
    if hit.is_none() {
        let hits = search_all_languages(client, source, request).await?;
        hit = rank_hits(hits, request.title).into_iter().next();
    }
    let hit = match hit {
        Some(hit) => hit,
        None => return Ok(None),
    };

    let mut bundle = MetadataBundle {
        title: clean_text(Some(hit.display_title().to_string()))
            .unwrap_or_else(|| request.title.to_string()),
        year: hit.year().or(request.year),
        overview: clean_text(hit.overview.clone()),
        poster_url: image_url(source, "w500", hit.poster_path.as_deref()),
        backdrop_url: image_url(source, "original", hit.backdrop_path.as_deref()),
        genres: Vec::new(),
        cast: Vec::new(),
        tmdb_id: Some(hit.id),
        placeholder: false,
    };

    // details only add to what search found; a failure keeps the search data
    match fetch_details(client, source, hit.id, request.kind).await {
        Ok(details) => {
            bundle.genres = collect_genres(&details.genres);
            bundle.cast = collect_cast(details.aggregate_credits.or(details.credits));
        }
        Err(err) => debug!("Details lookup failed for tmdb {}: {}", hit.id, err),
    }
    Ok(Some(bundle))
}

async fn search_all_languages(
    client: &Client,
    source: &TmdbSource,
    request: &LookupRequest<'_>,
) -> Result<Vec<SearchHit>, String> {
    let (endpoint, year_param) = match request.kind {
        MediaType::Movie => ("search/movie", "year"),
        MediaType::Series => ("search/tv", "first_air_date_year"),
    };
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    let mut last_error = None;
    let mut any_ok = false;
    for language in &source.languages {
        let mut url = format!(
            "{}/{}?api_key={}&query={}&language={}&include_adult=false",
            source.base_url,
            endpoint,
            url_escape(&source.api_key),
            url_escape(request.title),
            url_escape(language)
        );
        if let Some(year) = request.year {
            url.push_str(&format!("&{}={}", year_param, year));
        }
        match get_json::<SearchResponse>(client, source, &url).await {
            Ok(response) => {
                any_ok = true;
                for hit in response.results {
                    if seen.insert(hit.id) {
                        merged.push(hit);
                    }
                }
            }
            Err(err) => last_error = Some(err),
        }
    }
    match (any_ok, last_error) {
        (false, Some(err)) => Err(err),
        _ => Ok(merged),
    }
}

async fn find_by_external_id(
    client: &Client,
    source: &TmdbSource,
    external_id: &str,
    kind: MediaType,
) -> Result<Option<SearchHit>, String> {
    let url = format!(
        "{}/find/{}?api_key={}&external_source=imdb_id&language={}",
        source.base_url,
        url_escape(external_id),
        url_escape(&source.api_key),
        url_escape(primary_language(source))
    );
    let response = get_json::<FindResponse>(client, source, &url).await?;
    let hits = match kind {
        MediaType::Movie => response.movie_results,
        MediaType::Series => response.tv_results,
    };
    Ok(hits.into_iter().next())
}

async fn fetch_details(
    client: &Client,
    source: &TmdbSource,
    tmdb_id: u64,
    kind: MediaType,
) -> Result<DetailsResponse, String> {
    let (endpoint, credits) = match kind {
        MediaType::Movie => ("movie", "credits"),
        MediaType::Series => ("tv", "aggregate_credits"),
    };
    let url = format!(
        "{}/{}/{}?api_key={}&language={}&append_to_response={}",
        source.base_url,
        endpoint,
        tmdb_id,
        url_escape(&source.api_key),
        url_escape(primary_language(source)),
        credits
    );
    get_json(client, source, &url).await
}

fn primary_language(source: &TmdbSource) -> &str {
    source
        .languages
        .first()
        .map(String::as_str)
        .unwrap_or("en-US")
}

/// Episodes in number order, duplicates dropped.
fn season_episodes(source: &TmdbSource, response: SeasonResponse) -> Vec<SeasonEpisode> {
    let mut seen = HashSet::new();
    let mut episodes: Vec<SeasonEpisode> = response
        .episodes
        .into_iter()
        .filter(|hit| hit.episode_number > 0 && seen.insert(hit.episode_number))
        .map(|hit| SeasonEpisode {
            episode_number: hit.episode_number,
            title: clean_text(hit.name),
            overview: clean_text(hit.overview),
            still_url: image_url(source, "w300", hit.still_path.as_deref()),
        })
        .collect();
    episodes.sort_by_key(|episode| episode.episode_number);
    episodes
}

async fn get_json<T: for<'de> Deserialize<'de>>(
    client: &Client,
    source: &TmdbSource,
    url: &str,
) -> Result<T, String> {
    let response = client
        .get(url)
        .timeout(source.timeout)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("http {}", response.status()));
    }
    response.json::<T>().await.map_err(|err| err.to_string())
}

/// Hits whose title contains the query come first, then higher popularity.
fn rank_hits(mut hits: Vec<SearchHit>, query: &str) -> Vec<SearchHit> {
    let query = query.trim().to_lowercase();
    hits.sort_by(|a, b| {
        let a_match = a.display_title().to_lowercase().contains(&query);
        let b_match = b.display_title().to_lowercase().contains(&query);
        b_match
            .cmp(&a_match)
            .then_with(|| {
                b.popularity
                    .partial_cmp(&a.popularity)
                    .unwrap_or(Ordering::Equal)
            })
    });
    hits
}

fn image_url(source: &TmdbSource, size: &str, path: Option<&str>) -> Option<String> {
    let path = path.map(str::trim).filter(|path| !path.is_empty())?;
    Some(format!("{}/{}{}", source.image_base_url, size, path))
}

fn collect_genres(genres: &[Genre]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for genre in genres {
        let name = genre.name.trim();
        if name.is_empty() {
            continue;
        }
        if !out.iter().any(|existing| existing.eq_ignore_ascii_case(name)) {
            out.push(name.to_string());
        }
    }
    out
}

fn collect_cast(credits: Option<Credits>) -> Vec<String> {
    let mut cast = match credits {
        Some(credits) => credits.cast,
        None => return Vec::new(),
    };
    cast.sort_by_key(|member| member.order.unwrap_or(u32::MAX));
    cast.into_iter()
        .map(|member| member.name.trim().to_string())
        .filter(|name| !name.is_empty())
        .take(MAX_CAST)
        .collect()
}

fn clean_text(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
