//! WBI request signing.
//!
//! Certain live-room REST endpoints only answer requests whose query string carries a
//! `wts` timestamp and a `w_rid` digest. The digest is an MD5 over the sorted,
//! sanitised query concatenated with a "mixin key" derived from two rotating key
//! fragments published by the navigation endpoint.

use async_trait::async_trait;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{BliveError, Result};

pub const NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";

/// How long a derived key stays valid before it is fetched again.
pub const KEY_TTL: Duration = Duration::from_secs(12 * 60 * 60);

const MIXIN_KEY_ENC_TAB: [usize; 32] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13,
];

/// Source of the two raw key fragments (`img_key`, `sub_key`).
#[async_trait]
pub trait WbiKeyFetcher: Send + Sync {
    async fn fetch_keys(&self) -> Result<(String, String)>;
}

/// Fetches key fragments from the navigation endpoint.
#[derive(Clone)]
pub struct HttpWbiKeyFetcher {
    client: Client,
}

impl HttpWbiKeyFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WbiKeyFetcher for HttpWbiKeyFetcher {
    async fn fetch_keys(&self) -> Result<(String, String)> {
        let json: Value = self
            .client
            .get(NAV_URL)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_nav_keys(&json)
    }
}

/// Extract `(img_key, sub_key)` from a navigation response.
pub(crate) fn parse_nav_keys(json: &Value) -> Result<(String, String)> {
    let wbi_img = json
        .get("data")
        .and_then(|d| d.get("wbi_img"))
        .ok_or_else(|| BliveError::resolver("Navigation response has no wbi_img"))?;

    let key_of = |field: &str| {
        wbi_img
            .get(field)
            .and_then(Value::as_str)
            .and_then(take_filename)
            .ok_or_else(|| BliveError::resolver(format!("Navigation response has no {field}")))
    };

    Ok((key_of("img_url")?, key_of("sub_url")?))
}

fn take_filename(url: &str) -> Option<String> {
    url.rsplit_once('/')
        .and_then(|(_, s)| s.rsplit_once('.'))
        .map(|(s, _)| s.to_string())
        .filter(|s| !s.is_empty())
}

/// Interleave the concatenated fragments through the permutation table.
fn get_mixin_key(orig: &[u8]) -> String {
    MIXIN_KEY_ENC_TAB
        .iter()
        .filter_map(|&i| orig.get(i))
        .map(|&b| b as char)
        .collect()
}

fn get_url_encoded(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => encoded.push(c),
            // Stripped before hashing, never encoded.
            '!' | '\'' | '(' | ')' | '*' => {}
            _ => {
                let mut buf = [0; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    encoded.push_str(&format!("%{b:02X}"));
                }
            }
        }
    }
    encoded
}

/// Sign `params` with an already derived mixin key and a fixed timestamp.
///
/// Returns the full query string, ending in `&w_rid=<md5>`.
pub fn sign_with_key(params: &[(&str, String)], mixin_key: &str, timestamp: u64) -> String {
    let mut params: Vec<(&str, String)> = params.to_vec();
    params.push(("wts", timestamp.to_string()));
    params.sort_by(|a, b| a.0.cmp(b.0));

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", get_url_encoded(k), get_url_encoded(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Md5::new();
    hasher.update(query.as_bytes());
    hasher.update(mixin_key.as_bytes());
    let w_rid = format!("{:x}", hasher.finalize());

    format!("{query}&w_rid={w_rid}")
}

#[derive(Clone, Debug)]
struct CachedKey {
    mixin_key: String,
    created_at: Instant,
}

/// Caches the derived mixin key and signs query parameters with it.
pub struct WbiSigner {
    fetcher: Arc<dyn WbiKeyFetcher>,
    cached: Mutex<Option<CachedKey>>,
    refresh_lock: tokio::sync::Mutex<()>,
    ttl: Duration,
}

impl WbiSigner {
    pub fn new(fetcher: Arc<dyn WbiKeyFetcher>) -> Self {
        Self {
            fetcher,
            cached: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            ttl: KEY_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn fresh_key(&self) -> Option<String> {
        self.cached
            .lock()
            .as_ref()
            .filter(|k| k.created_at.elapsed() < self.ttl)
            .map(|k| k.mixin_key.clone())
    }

    /// Return the cached key, fetching a new one when absent or expired.
    pub async fn get_key(&self) -> Result<String> {
        if let Some(key) = self.fresh_key() {
            return Ok(key);
        }

        // Only one caller refreshes; the others wait and reuse its result.
        let _guard = self.refresh_lock.lock().await;
        if let Some(key) = self.fresh_key() {
            return Ok(key);
        }

        let (img_key, sub_key) = self.fetcher.fetch_keys().await?;
        let mixin_key = get_mixin_key(format!("{img_key}{sub_key}").as_bytes());
        if mixin_key.len() != MIXIN_KEY_ENC_TAB.len() {
            return Err(BliveError::resolver(format!(
                "WBI key fragments too short ({} bytes)",
                img_key.len() + sub_key.len()
            )));
        }

        info!("Refreshed WBI key");
        *self.cached.lock() = Some(CachedKey {
            mixin_key: mixin_key.clone(),
            created_at: Instant::now(),
        });
        Ok(mixin_key)
    }

    /// Drop the cached key so the next [`get_key`](Self::get_key) refetches.
    pub fn reset(&self) {
        debug!("Resetting cached WBI key");
        self.cached.lock().take();
    }

    /// Sign `params` with the current key and wall-clock time.
    pub async fn sign(&self, params: &[(&str, String)]) -> Result<String> {
        let key = self.get_key().await?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| BliveError::other("SystemTime before UNIX EPOCH!"))?
            .as_secs();
        Ok(sign_with_key(params, &key, now))
    }
}

/// Signers keyed by a caller-chosen id, typically one per session.
#[derive(Default)]
pub struct WbiSignerCache {
    signers: Mutex<HashMap<String, Arc<WbiSigner>>>,
}

impl WbiSignerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the signer for `id`, creating it with `fetcher` if absent.
    pub fn get_or_create(
        &self,
        id: &str,
        fetcher: impl FnOnce() -> Arc<dyn WbiKeyFetcher>,
    ) -> Arc<WbiSigner> {
        self.signers
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(WbiSigner::new(fetcher())))
            .clone()
    }

    /// Remove the signer for `id`. Returns whether one existed.
    pub fn evict(&self, id: &str) -> bool {
        self.signers.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.signers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.lock().is_empty()
    }
}
