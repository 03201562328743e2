//! Text fetch for remote modules, with an optional origin allowlist.
//!
//! Security model:
//! - No allowlist: any http(s) URL can be fetched
//! - With an allowlist, only URLs matching allowed origins can be fetched and
//!   redirects are only followed if they stay within the same origin
//! - Non-2xx responses are failures, never module source

use anyhow::{anyhow, Error};
use reqwest::Client;
use url::Url;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// Configuration for fetch allowlist
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://unpkg.com"), empty = unrestricted
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
}

impl FetchConfig {
    pub fn is_restricted(&self) -> bool {
        !self.allowed_origins.is_empty()
    }

    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if !self.is_restricted() {
            return true;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == allowed.trim_end_matches('/'))
    }
}

/// Body of a successful fetch and the URL it was finally served from.
#[derive(Debug, Clone)]
pub struct FetchedText {
    pub url: Url,
    pub body: String,
}

/// Client used for module fetches. Redirects are handled by [`fetch_text`].
pub fn module_client() -> Result<Client, Error> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))
}

/// GET `raw_url` as text, following same-origin redirects.
pub async fn fetch_text(client: &Client, raw_url: &str, config: &FetchConfig) -> Result<FetchedText, Error> {
    let url = Url::parse(raw_url).map_err(|e| anyhow!("Invalid URL '{}': {}", raw_url, e))?;
    do_fetch(client, url, config, 0).await
}

/// Internal fetch implementation (called recursively for redirects)
async fn do_fetch(client: &Client, url: Url, config: &FetchConfig, hops: usize) -> Result<FetchedText, Error> {
    if !config.is_origin_allowed(&url) {
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
            url.origin().ascii_serialization(),
            config.allowed_origins
        ));
    }

    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| anyhow!("Fetch failed: {}", e))?;

    let status = response.status();

    // Handle redirects manually - only allow same-origin when restricted
    if status.is_redirection() {
        let location = response
            .headers()
            .get("location")
            .ok_or_else(|| anyhow!("Redirect {} from '{}' without a location", status.as_u16(), url))?;
        let location_str = location.to_str().map_err(|_| anyhow!("Invalid redirect location"))?;
        let redirect_url = url
            .join(location_str)
            .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

        if config.is_restricted() && redirect_url.origin() != url.origin() {
            return Err(anyhow!(
                "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                redirect_url.origin().ascii_serialization(),
                url.origin().ascii_serialization()
            ));
        }

        if hops >= MAX_REDIRECTS {
            return Err(anyhow!("Too many redirects while fetching '{}'", url));
        }

        return Box::pin(do_fetch(client, redirect_url, config, hops + 1)).await;
    }

    if !status.is_success() {
        return Err(anyhow!(
            "HTTP {} {} for '{}'",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown"),
            url
        ));
    }

    let final_url = response.url().clone();
    let body = response
        .text()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

    Ok(FetchedText { url: final_url, body })
}
