//! Turning a room number into everything needed to open the gateway socket.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::SET_COOKIE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::error::{BliveError, Result};
use crate::http::generate_fake_buvid3;
use crate::wbi::{NAV_URL, WbiSigner};

pub const ROOM_INFO_URL: &str = "https://api.live.bilibili.com/room/v1/Room/get_info";
pub const DANMU_INFO_URL: &str = "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo";
pub const HOME_URL: &str = "https://www.bilibili.com/";

pub static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?:\/\/(?:www\.)?(?:live\.)?bilibili\.com\/(\d+)").unwrap());

/// Room number from either a bare id or a live room URL.
pub fn parse_room_id(input: &str) -> Option<u64> {
    let input = input.trim();
    let id: u64 = match URL_REGEX.captures(input) {
        Some(caps) => caps.get(1)?.as_str().parse().ok()?,
        None => input.parse().ok()?,
    };
    (id > 0).then_some(id)
}

pub const FALLBACK_HOST: &str = "broadcastlv.chat.bilibili.com";
pub const FALLBACK_PORT: u16 = 443;

/// Response code for a request signed with an outdated WBI key.
pub const STALE_SIGNATURE_CODE: i64 = -352;

/// One candidate gateway server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostServer {
    pub host: String,
    pub wss_port: u16,
}

impl HostServer {
    pub fn fallback() -> Self {
        Self {
            host: FALLBACK_HOST.to_string(),
            wss_port: FALLBACK_PORT,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("wss://{}:{}/sub", self.host, self.wss_port)
    }
}

/// Connection parameters for one subscription. Immutable once resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSession {
    /// Canonical (long) room id.
    pub room_id: u64,
    /// Uid of the streamer.
    pub owner_uid: u64,
    /// Uid of the logged-in caller, 0 when anonymous.
    pub uid: u64,
    pub buvid: String,
    pub hosts: Vec<HostServer>,
    /// One-time gateway token.
    pub token: String,
}

impl RoomSession {
    /// Hosts to try in order, never empty.
    pub fn candidate_hosts(&self) -> Vec<HostServer> {
        if self.hosts.is_empty() {
            vec![HostServer::fallback()]
        } else {
            self.hosts.clone()
        }
    }
}

/// Resolves a room into a [`RoomSession`].
#[async_trait]
pub trait RoomResolver: Send + Sync {
    async fn resolve(&self, room_id: u64) -> Result<RoomSession>;
}

/// Resolver backed by the public web APIs.
pub struct BilibiliRoomResolver {
    client: Client,
    signer: Arc<WbiSigner>,
}

impl BilibiliRoomResolver {
    pub fn new(client: Client, signer: Arc<WbiSigner>) -> Self {
        Self { client, signer }
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        debug!(url, "GET");
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Canonical room id and owner uid.
    pub async fn room_info(&self, room_id: u64) -> Result<(u64, u64)> {
        let json = self
            .get_json(&format!("{ROOM_INFO_URL}?room_id={room_id}"))
            .await?;
        parse_room_info(&json)
    }

    /// Uid of the caller according to the session cookie.
    pub async fn self_uid(&self) -> Result<u64> {
        Ok(parse_nav_uid(&self.get_json(NAV_URL).await?))
    }

    /// `buvid3` handed out by the landing page.
    pub async fn buvid3(&self) -> Result<Option<String>> {
        let response = self.client.get(HOME_URL).send().await?;
        Ok(parse_buvid3(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        ))
    }

    /// Gateway hosts and token, retrying once with fresh keys on a stale signature.
    pub async fn load_host_servers(&self, room_id: u64) -> Result<(Vec<HostServer>, String)> {
        retry_on_stale_signature(&self.signer, || self.fetch_danmu_info(room_id)).await
    }

    async fn fetch_danmu_info(&self, room_id: u64) -> Result<(Vec<HostServer>, String)> {
        let query = self
            .signer
            .sign(&[("id", room_id.to_string()), ("type", "0".to_string())])
            .await?;
        let json = self.get_json(&format!("{DANMU_INFO_URL}?{query}")).await?;
        parse_danmu_info(&json)
    }
}

#[async_trait]
impl RoomResolver for BilibiliRoomResolver {
    async fn resolve(&self, room_id: u64) -> Result<RoomSession> {
        assemble_session(
            room_id,
            self.room_info(room_id),
            |canonical| self.load_host_servers(canonical),
            self.self_uid(),
            self.buvid3(),
        )
        .await
    }
}

/// Run the lookups of one room concurrently and combine them.
///
/// The host list waits for the canonical id. Every lookup except the host
/// list fails soft: the input id with owner 0, uid 0, or a synthetic buvid.
pub(crate) async fn assemble_session<RoomInfo, Hosts, HostsFut, SelfUid, Buvid>(
    room_id: u64,
    room_info: RoomInfo,
    load_hosts: Hosts,
    self_uid: SelfUid,
    buvid: Buvid,
) -> Result<RoomSession>
where
    RoomInfo: Future<Output = Result<(u64, u64)>>,
    Hosts: FnOnce(u64) -> HostsFut,
    HostsFut: Future<Output = Result<(Vec<HostServer>, String)>>,
    SelfUid: Future<Output = Result<u64>>,
    Buvid: Future<Output = Result<Option<String>>>,
{
    let room_and_hosts = async {
        let (canonical, owner_uid) = match room_info.await {
            Ok(info) => info,
            Err(e) => {
                warn!(room_id, "Failed to resolve room info: {}", e);
                (room_id, 0)
            }
        };
        let hosts = load_hosts(canonical).await;
        (canonical, owner_uid, hosts)
    };

    let uid = async {
        self_uid.await.unwrap_or_else(|e| {
            warn!("Failed to resolve own uid: {}", e);
            0
        })
    };

    let buvid = async {
        match buvid.await {
            Ok(Some(buvid)) => buvid,
            Ok(None) => generate_fake_buvid3(),
            Err(e) => {
                warn!("Failed to fetch buvid3: {}", e);
                generate_fake_buvid3()
            }
        }
    };

    let ((room_id, owner_uid, hosts), uid, buvid) = tokio::join!(room_and_hosts, uid, buvid);
    let (hosts, token) = hosts?;

    info!(room_id, owner_uid, uid, hosts = hosts.len(), "Resolved room");
    Ok(RoomSession {
        room_id,
        owner_uid,
        uid,
        buvid,
        hosts,
        token,
    })
}

/// Run `call`; if it reports a stale signature, reset the signer and run it exactly once more.
pub async fn retry_on_stale_signature<T, F, Fut>(signer: &WbiSigner, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Err(BliveError::StaleSignature { code }) => {
            warn!(code, "Signature rejected, refreshing WBI key and retrying");
            signer.reset();
            call().await.map_err(|e| match e {
                BliveError::StaleSignature { code } => BliveError::resolver(format!(
                    "Signature still rejected after key refresh (code {code})"
                )),
                other => other,
            })
        }
        other => other,
    }
}

fn api_error(json: &Value, what: &str) -> Option<BliveError> {
    let code = json.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code == 0 {
        return None;
    }
    if code == STALE_SIGNATURE_CODE {
        return Some(BliveError::StaleSignature { code });
    }
    let message = json
        .get("message")
        .or_else(|| json.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    Some(BliveError::resolver(format!(
        "{what} returned code {code}: {message}"
    )))
}

pub(crate) fn parse_room_info(json: &Value) -> Result<(u64, u64)> {
    if let Some(e) = api_error(json, "Room info") {
        return Err(e);
    }
    let data = json
        .get("data")
        .ok_or_else(|| BliveError::resolver("Missing data in room info"))?;
    let room_id = data
        .get("room_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| BliveError::resolver("Missing room_id in room info"))?;
    let owner_uid = data.get("uid").and_then(Value::as_u64).unwrap_or(0);
    Ok((room_id, owner_uid))
}

pub(crate) fn parse_nav_uid(json: &Value) -> u64 {
    let data = json.get("data");
    let logged_in = data
        .and_then(|d| d.get("isLogin"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !logged_in {
        return 0;
    }
    data.and_then(|d| d.get("mid"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

pub(crate) fn parse_buvid3<'a>(set_cookies: impl Iterator<Item = &'a str>) -> Option<String> {
    set_cookies
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == "buvid3" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

pub(crate) fn parse_danmu_info(json: &Value) -> Result<(Vec<HostServer>, String)> {
    if let Some(e) = api_error(json, "getDanmuInfo") {
        return Err(e);
    }
    let data = json
        .get("data")
        .ok_or_else(|| BliveError::resolver("Missing data in getDanmuInfo"))?;

    let token = data
        .get("token")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let hosts = data
        .get("host_list")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|h| {
                    Some(HostServer {
                        host: h.get("host")?.as_str()?.to_string(),
                        wss_port: u16::try_from(h.get("wss_port")?.as_u64()?).ok()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok((hosts, token))
}
