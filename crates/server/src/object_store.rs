use std::time::Duration;

use async_trait::async_trait;
use common::{url_escape, url_escape_path, StorageLocator};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::ObjectStoreSettings;

/// Lifetime of every signed playback URL handed to clients.
pub const PLAYBACK_URL_TTL: Duration = Duration::from_secs(3 * 60 * 60);

const LISTING_URL_TTL: Duration = Duration::from_secs(60);
const MAX_PRESIGN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object in the bucket, across all listing pages.
    async fn list_all(&self, bucket: &str) -> Result<Vec<ObjectEntry>, ObjectStoreError>;

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError>;
}

/// Signs a `store:` locator. `None` covers both a malformed locator and a
/// backend failure; callers treat it as "no URL available".
pub async fn presign_locator(
    store: &dyn ObjectStore,
    storage_path: &str,
    ttl: Duration,
) -> Option<String> {
    let (bucket, key) = match StorageLocator::parse(storage_path) {
        Ok(StorageLocator::Remote { bucket, key }) => (bucket, key),
        Ok(StorageLocator::Local(_)) => return None,
        Err(err) => {
            warn!("{}", err);
            return None;
        }
    };
    match store.presign_get(&bucket, &key, ttl).await {
        Ok(url) => Some(url),
        Err(err) => {
            warn!("Presign failed for {}: {}", storage_path, err);
            None
        }
    }
}

#[derive(Debug)]
pub enum ObjectStoreError {
    Http(reqwest::Error),
    Status(u16, String),
    Xml(String),
    Config(String),
    InvalidTtl(u64),
}

impl std::fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectStoreError::Http(err) => write!(f, "http error: {}", err),
            ObjectStoreError::Status(code, body) => write!(f, "http {}: {}", code, body),
            ObjectStoreError::Xml(message) => write!(f, "listing parse error: {}", message),
            ObjectStoreError::Config(message) => write!(f, "object store config: {}", message),
            ObjectStoreError::InvalidTtl(secs) => write!(f, "invalid presign ttl: {}s", secs),
        }
    }
}

impl std::error::Error for ObjectStoreError {}

impl From<reqwest::Error> for ObjectStoreError {
    fn from(err: reqwest::Error) -> Self {
        ObjectStoreError::Http(err)
    }
}

/// S3-compatible gateway. Every request, including listing, goes out as a
/// SigV4 query-signed GET, so no header signing is needed.
#[derive(Clone, Debug)]
pub struct S3Gateway {
    client: Client,
    scheme: String,
    host: String,
    region: String,
    access_key: String,
    secret_key: String,
    path_style: bool,
    timeout: Duration,
}

impl S3Gateway {
    pub fn new(client: Client, settings: &ObjectStoreSettings) -> Result<Self, ObjectStoreError> {
        if !settings.is_configured() {
            return Err(ObjectStoreError::Config(
                "endpoint, access_key and secret_key are required".to_string(),
            ));
        }
        let endpoint = settings.endpoint.trim().trim_end_matches('/');
        let (scheme, host) = match endpoint.split_once("://") {
            Some((scheme, host)) => (scheme.to_string(), host.to_string()),
            None => ("https".to_string(), endpoint.to_string()),
        };
        if host.is_empty() || host.contains('/') {
            return Err(ObjectStoreError::Config(format!(
                "endpoint must be scheme://host[:port], got {}",
                settings.endpoint
            )));
        }
        let region = settings.region.trim();
        Ok(Self {
            client,
            scheme,
            host,
            region: if region.is_empty() {
                "us-east-1".to_string()
            } else {
                region.to_string()
            },
            access_key: settings.access_key.trim().to_string(),
            secret_key: settings.secret_key.trim().to_string(),
            path_style: settings.path_style,
            timeout: settings.timeout(),
        })
    }

    fn presign_at(
        &self,
        bucket: &str,
        key: &str,
        extra_query: &[(&str, &str)],
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Result<String, ObjectStoreError> {
        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 || ttl > MAX_PRESIGN_TTL {
            return Err(ObjectStoreError::InvalidTtl(ttl_secs));
        }

        let (host, path) = if self.path_style {
            let mut path = format!("/{}", bucket);
            if !key.is_empty() {
                path.push('/');
                path.push_str(key);
            }
            (self.host.clone(), path)
        } else {
            (format!("{}.{}", bucket, self.host), format!("/{}", key))
        };
        let canonical_uri = url_escape_path(&path);

        let amz_date = now
            .format(format_description!(
                "[year][month][day]T[hour][minute][second]Z"
            ))
            .map_err(|err| ObjectStoreError::Config(err.to_string()))?;
        let date = &amz_date[..8];
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let credential = format!("{}/{}", self.access_key, scope);
        let expires = ttl_secs.to_string();

        let mut params: Vec<(String, String)> = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            ("X-Amz-Credential".to_string(), credential),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        for (name, value) in extra_query {
            params.push((name.to_string(), value.to_string()));
        }
        let mut encoded: Vec<(String, String)> = params
            .iter()
            .map(|(name, value)| (url_escape(name), url_escape(value)))
            .collect();
        encoded.sort();
        let canonical_query = encoded
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            canonical_uri, canonical_query, host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = [self.region.as_str(), "s3", "aws4_request"].iter().try_fold(
            hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes())?,
            |key, part| hmac_sha256(&key, part.as_bytes()),
        )?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        Ok(format!(
            "{}://{}{}?{}&X-Amz-Signature={}",
            self.scheme, host, canonical_uri, canonical_query, signature
        ))
    }

    async fn list_page(
        &self,
        bucket: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, ObjectStoreError> {
        let mut query = vec![("list-type", "2")];
        if let Some(token) = continuation {
            query.push(("continuation-token", token));
        }
        let url = self.presign_at(bucket, "", &query, LISTING_URL_TTL, OffsetDateTime::now_utc())?;
        let response = self.client.get(&url).timeout(self.timeout).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ObjectStoreError::Status(status.as_u16(), truncate(&body, 200)));
        }
        parse_list_page(&body)
    }
}

#[async_trait]
impl ObjectStore for S3Gateway {
    async fn list_all(&self, bucket: &str) -> Result<Vec<ObjectEntry>, ObjectStoreError> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self.list_page(bucket, continuation.as_deref()).await?;
            debug!(
                "Listed {} objects from bucket {} (truncated: {})",
                page.entries.len(),
                bucket,
                page.next_token.is_some()
            );
            entries.extend(page.entries);
            match page.next_token {
                Some(token) if continuation.as_deref() != Some(token.as_str()) => {
                    continuation = Some(token)
                }
                _ => break,
            }
        }
        Ok(entries)
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(ObjectStoreError::Config("bucket and key are required".to_string()));
        }
        self.presign_at(bucket, key, &[], ttl, OffsetDateTime::now_utc())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ObjectStoreError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| ObjectStoreError::Config(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[derive(Debug, Default)]
struct ListPage {
    entries: Vec<ObjectEntry>,
    next_token: Option<String>,
}

fn parse_list_page(xml: &str) -> Result<ListPage, ObjectStoreError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut truncated = false;
    let mut current: Option<ObjectEntry> = None;
    let mut current_tag = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if current_tag == "Contents" {
                    current = Some(ObjectEntry {
                        key: String::new(),
                        size: 0,
                        last_modified: None,
                    });
                }
            }
            Ok(Event::End(ref e)) => {
                if e.local_name().as_ref() == b"Contents" {
                    if let Some(entry) = current.take() {
                        if !entry.key.is_empty() {
                            page.entries.push(entry);
                        }
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| ObjectStoreError::Xml(err.to_string()))?
                    .to_string();
                match (current.as_mut(), current_tag.as_str()) {
                    (Some(entry), "Key") => entry.key = text,
                    (Some(entry), "Size") => entry.size = text.parse().unwrap_or(0),
                    (Some(entry), "LastModified") => entry.last_modified = Some(text),
                    (None, "IsTruncated") => truncated = text.eq_ignore_ascii_case("true"),
                    (None, "NextContinuationToken") => page.next_token = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(ObjectStoreError::Xml(err.to_string())),
            _ => {}
        }
    }

    if !truncated {
        page.next_token = None;
    }
    Ok(page)
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
