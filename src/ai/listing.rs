//! Listing input for the generator: either fetched from a listing page or
//! typed in by the host.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Upper bound on page text handed to the model
const MAX_DIGEST_CHARS: usize = 6000;
const MAX_PHOTOS: usize = 12;
/// Listing pages larger than this are cut off while reading
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const MAX_REDIRECTS: usize = 10;

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .dns_resolver(Arc::new(PublicResolver))
        .redirect(reqwest::redirect::Policy::custom(|attempt| {
            let target = check_url_target(attempt.url());
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            match target {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e.to_string()),
            }
        }))
        .user_agent(concat!("Mozilla/5.0 (compatible; roomy-backend/", env!("CARGO_PKG_VERSION"), ")"))
        .build()
        .unwrap_or_default()
});

lazy_static::lazy_static! {
    static ref META_TAG: Regex = Regex::new(r"(?is)<meta\b[^>]*>").unwrap();
    static ref ATTRIBUTE: Regex =
        Regex::new(r#"(?is)([a-z][a-z0-9:_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap();
    static ref TITLE_TAG: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
    static ref NOISE: Regex =
        Regex::new(r"(?is)<(script|style|noscript|svg)\b.*?</(script|style|noscript|svg)>").unwrap();
    static ref BLANK_LINES: Regex = Regex::new(r"\n{3,}").unwrap();
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid listing url: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Fetch(String),
    #[error("listing page returned http {0}")]
    Status(u16),
    #[error("listing page has no usable content")]
    Empty,
    #[error("listing page is larger than {0} bytes")]
    TooLarge(usize),
    #[error("refusing to fetch non-public address {0}")]
    Blocked(String),
}

/// What the generator knows about the property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingDetails {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub address: String,
    pub check_in: Option<String>,
    pub check_out: Option<String>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub house_rules: Vec<String>,
    #[serde(default)]
    pub photos: Vec<String>,
    pub source_url: Option<String>,
    /// Markdown digest of the fetched page
    pub page_text: Option<String>,
}

/// Accept only absolute http(s) URLs whose host is not a local or private
/// address literal.
pub fn parse_listing_url(raw: &str) -> Result<Url, ListingError> {
    let url = Url::parse(raw.trim()).map_err(|e| ListingError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => {
            check_url_target(&url)?;
            Ok(url)
        }
        other => Err(ListingError::InvalidUrl(format!("unsupported scheme {}", other))),
    }
}

/// Checks that need no DNS: scheme, `localhost` names and IP literals.
/// Also applied to every redirect hop.
fn check_url_target(url: &Url) -> Result<(), ListingError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ListingError::InvalidUrl(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    match url.host() {
        Some(url::Host::Ipv4(ip)) if !is_public_ip(IpAddr::V4(ip)) => {
            Err(ListingError::Blocked(ip.to_string()))
        }
        Some(url::Host::Ipv6(ip)) if !is_public_ip(IpAddr::V6(ip)) => {
            Err(ListingError::Blocked(ip.to_string()))
        }
        Some(url::Host::Domain(name)) => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            if name == "localhost" || name.ends_with(".localhost") {
                Err(ListingError::Blocked(name))
            } else {
                Ok(())
            }
        }
        Some(_) => Ok(()),
        None => Err(ListingError::InvalidUrl("missing host".to_string())),
    }
}

/// False for loopback, private, link-local, unspecified and other
/// non-routable ranges.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_public_v4(v4);
            }
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        || (a == 100 && (64..128).contains(&b)))
}

/// DNS resolver for the listing client that drops non-public addresses, so
/// a public name cannot point the fetch at an internal host.
struct PublicResolver;

impl reqwest::dns::Resolve for PublicResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        Box::pin(resolve_public(name.as_str().to_string()))
    }
}

async fn resolve_public(
    host: String,
) -> Result<reqwest::dns::Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .filter(|addr| is_public_ip(addr.ip()))
        .collect();
    if addrs.is_empty() {
        return Err(Box::new(ListingError::Blocked(host)));
    }
    Ok(Box::new(addrs.into_iter()))
}

/// Resolve the listing host up front so a blocked target is reported as
/// such rather than as a generic fetch failure.
async fn ensure_public_host(url: &Url) -> Result<(), ListingError> {
    let Some(url::Host::Domain(name)) = url.host() else {
        return Ok(());
    };
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name, port))
        .await
        .map_err(|e| ListingError::Fetch(e.to_string()))?
        .collect();
    match addrs.iter().find(|addr| !is_public_ip(addr.ip())) {
        Some(addr) => Err(ListingError::Blocked(addr.ip().to_string())),
        None => Ok(()),
    }
}

pub async fn fetch_listing(url: &Url) -> Result<ListingDetails, ListingError> {
    check_url_target(url)?;
    ensure_public_host(url).await?;

    let res = HTTP_CLIENT
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| ListingError::Fetch(e.to_string()))?;

    if !res.status().is_success() {
        return Err(ListingError::Status(res.status().as_u16()));
    }
    if res
        .content_length()
        .is_some_and(|len| len > MAX_BODY_BYTES as u64)
    {
        return Err(ListingError::TooLarge(MAX_BODY_BYTES));
    }

    let (html, truncated) = read_text_limited(res, MAX_BODY_BYTES).await?;
    if truncated {
        tracing::debug!(url = %url, "Listing page truncated at {} bytes", MAX_BODY_BYTES);
    }

    let details = parse_listing_html(&html, url);
    if details.title.is_empty() && details.page_text.as_deref().unwrap_or("").is_empty() {
        return Err(ListingError::Empty);
    }

    tracing::debug!(
        url = %url,
        title = %details.title,
        photos = details.photos.len(),
        "Listing page parsed"
    );
    Ok(details)
}

/// Read at most `limit` bytes of the body. The flag reports whether the
/// rest was dropped.
async fn read_text_limited(
    mut res: reqwest::Response,
    limit: usize,
) -> Result<(String, bool), ListingError> {
    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = res
        .chunk()
        .await
        .map_err(|e| ListingError::Fetch(e.to_string()))?
    {
        if append_capped(&mut out, &chunk, limit) {
            return Ok((String::from_utf8_lossy(&out).into_owned(), true));
        }
    }
    Ok((String::from_utf8_lossy(&out).into_owned(), false))
}

/// Append up to the cap. Returns true once the cap is hit.
fn append_capped(out: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    if out.len() + chunk.len() > limit {
        let remaining = limit.saturating_sub(out.len());
        out.extend_from_slice(&chunk[..remaining]);
        return true;
    }
    out.extend_from_slice(chunk);
    false
}

/// Pull listing fields out of a page's `<title>`, OpenGraph and meta tags,
/// plus a markdown digest of the body.
pub fn parse_listing_html(html: &str, url: &Url) -> ListingDetails {
    let mut meta: HashMap<String, String> = HashMap::new();
    let mut photos: Vec<String> = Vec::new();

    for tag in META_TAG.find_iter(html) {
        let attrs = attributes(tag.as_str());
        let key = attrs
            .get("property")
            .or_else(|| attrs.get("name"))
            .map(|k| k.to_ascii_lowercase());
        let (Some(key), Some(content)) = (key, attrs.get("content")) else {
            continue;
        };
        let content = decode_entities(content.trim());
        if content.is_empty() {
            continue;
        }
        if key == "og:image" {
            if let Ok(resolved) = url.join(&content) {
                let resolved = resolved.to_string();
                if !photos.contains(&resolved) && photos.len() < MAX_PHOTOS {
                    photos.push(resolved);
                }
            }
            continue;
        }
        meta.entry(key).or_insert(content);
    }

    let title_tag = TITLE_TAG
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str().trim()))
        .unwrap_or_default();

    let title = Some(pick(&meta, &["og:title", "twitter:title"]))
        .filter(|t| !t.is_empty())
        .unwrap_or(title_tag);

    ListingDetails {
        title,
        description: pick(&meta, &["og:description", "description", "twitter:description"]),
        address: pick(
            &meta,
            &[
                "og:street-address",
                "business:contact_data:street_address",
                "place:location:address",
                "address",
            ],
        ),
        photos,
        source_url: Some(url.to_string()),
        page_text: Some(page_digest(html)).filter(|t| !t.is_empty()),
        ..Default::default()
    }
}

/// First non-empty value among `keys`.
fn pick(meta: &HashMap<String, String>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| meta.get(*k).cloned())
        .unwrap_or_default()
}

fn attributes(tag: &str) -> HashMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .filter_map(|c| {
            let name = c.get(1)?.as_str().to_ascii_lowercase();
            let value = c.get(2).or_else(|| c.get(3))?.as_str().to_string();
            Some((name, value))
        })
        .collect()
}

fn decode_entities(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Markdown rendering of the page body without scripts and styles.
pub fn page_digest(html: &str) -> String {
    let cleaned = NOISE.replace_all(html, "");
    let markdown = html2md::parse_html(&cleaned);
    let collapsed = BLANK_LINES.replace_all(markdown.trim(), "\n\n");
    collapsed.chars().take(MAX_DIGEST_CHARS).collect()
}
