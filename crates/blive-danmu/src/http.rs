use reqwest::Client;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use rustls::ClientConfig;
use rustls_platform_verifier::BuilderVerifierExt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::error::{BliveError, Result};

pub const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

pub const LIVE_REFERER: &str = "https://live.bilibili.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Install the process-wide rustls crypto provider used by the WebSocket transport.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the HTTP client used for every REST call of one session.
///
/// `sessdata` is the raw value of the `SESSDATA` cookie; when present it is sent on
/// every request so the platform does not mask user names.
pub fn build_client(sessdata: Option<&str>) -> Result<Client> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BliveError::other(format!("Failed to configure TLS versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| BliveError::other(format!("Failed to load platform verifier: {e}")))?
        .with_no_client_auth();

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_UA));
    headers.insert(REFERER, HeaderValue::from_static(LIVE_REFERER));
    if let Some(value) = sessdata.map(str::trim).filter(|s| !s.is_empty()) {
        let cookie = HeaderValue::from_str(&format!("SESSDATA={value}"))
            .map_err(|e| BliveError::other(format!("Invalid SESSDATA value: {e}")))?;
        headers.insert(COOKIE, cookie);
    }

    Ok(Client::builder()
        .use_preconfigured_tls(tls_config)
        .default_headers(headers)
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

/// Generates a fake BUVID3 identifier.
///
/// Used when the landing page does not hand out a real one. The format is
/// `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXXinfoc` with uppercase hex digits.
pub fn generate_fake_buvid3() -> String {
    let u = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!(
        "{}-{}-{}-{}-{}infoc",
        &u[0..8],
        &u[8..12],
        &u[12..16],
        &u[16..20],
        &u[20..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_buvid3_shape() {
        let buvid = generate_fake_buvid3();
        assert!(buvid.ends_with("infoc"));
        let parts: Vec<&str> = buvid.trim_end_matches("infoc").split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(
            parts
                .iter()
                .all(|p| p.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()))
        );
    }
}
