use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::ID;

pub type Result<T> = std::result::Result<T, MagnetError>;

#[derive(Debug, thiserror::Error)]
pub enum MagnetError {

    #[error("invalid magnet uri: {0}")]
    BadMagnet(String),

    #[error("invalid tracker url: {0}")]
    InvalidUrl(String),

    #[error("unsupported tracker scheme {scheme:?} in {url}")]
    UnsupportedScheme {
        scheme: String,
        url: String,
    },

}

// Hostname must look like conservative DNS: label characters only, no edge
// dots or hyphens. IPv6 literals come through url's Host::Ipv6 and skip this.
static HOST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?$").expect("static pattern"));

// host:port embedded after an http:// fragment inside a mangled UDP url.
static EMBEDDED_HTTP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"http://([^:/]+):(\d{1,5})").expect("static pattern"));

// Fallback: host:port after any slash or encoded slash.
static EMBEDDED_HOST_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:%2F|/)([A-Za-z0-9][A-Za-z0-9.-]*[A-Za-z0-9]|[A-Za-z0-9]):(\d{1,5})")
        .expect("static pattern")
});

// Keep error messages bounded; mangled magnet input can be arbitrarily long.
fn preview(s: &str) -> String {
    if s.len() <= 200 {
        s.to_string()
    } else {
        let mut end = 200;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

// Canonicalizes a raw tracker URL from a torrent or magnet link. Rejects
// anything that is not plain http/https/udp with a plausible host; mangled
// UDP urls (double-encoded, udp:/ typo, pasted http:// inside) are repaired
// first because they are common in the wild.
pub fn normalize_tracker_url(raw: &str) -> Result<Url> {

    if raw.trim().is_empty() {
        return Err(MagnetError::InvalidUrl("empty url".to_string()));
    }

    // Some magnet links double- or triple-encode tracker parameters.
    let mut url = raw.trim().to_string();
    for _ in 0..3 {
        match urlencoding::decode(&url) {
            Ok(decoded) if decoded != url => {
                if decoded.contains("://") || decoded.starts_with("udp:") || decoded.starts_with("http") {
                    url = decoded.into_owned();
                } else {
                    break;
                }
            }
            _ => break,
        }
    }

    let is_udp = url.starts_with("udp:");

    if is_udp && url.contains("http://") {
        url = repair_embedded_http(&url)?;
    } else if url.starts_with("udp://") {
        // Already well-formed.
    } else if let Some(rest) = url.strip_prefix("udp:/") {
        url = format!("udp://{}", rest);
    } else if let Some(rest) = url.strip_prefix("udp:") {
        url = format!("udp://{}", rest);
    }

    let mut parsed = Url::parse(&url).map_err(|e| {
        MagnetError::InvalidUrl(format!("{}: {}", e, preview(&url)))
    })?;

    match parsed.scheme() {
        "http" | "https" | "udp" => {}
        other => {
            return Err(MagnetError::UnsupportedScheme {
                scheme: other.to_string(),
                url: preview(&url),
            })
        }
    }

    match parsed.host() {
        Some(url::Host::Domain(host)) => {
            if !HOST_PATTERN.is_match(host) || host.contains("..") {
                return Err(MagnetError::InvalidUrl(format!("implausible host {:?}", host)));
            }
        }
        Some(url::Host::Ipv4(_)) | Some(url::Host::Ipv6(_)) => {}
        None => return Err(MagnetError::InvalidUrl(format!("missing host: {}", preview(&url)))),
    }

    // BEP 15 addresses a socket, not a resource; whatever path survived the
    // repairs above is noise.
    if parsed.scheme() == "udp" {
        parsed.set_path("");
        parsed.set_query(None);
        parsed.set_fragment(None);
    }

    Ok(parsed)
}

// Extracts host:port from things like udp:/%25http://2Ftracker.example.org:1337/announce.
fn repair_embedded_http(url: &str) -> Result<String> {

    let captured = EMBEDDED_HTTP
        .captures(url)
        .and_then(|c| {
            let host = decode_mangled_host(c.get(1).expect("group").as_str());
            HOST_PATTERN.is_match(&host).then(|| (host, c.get(2).expect("group").as_str().to_string()))
        })
        .or_else(|| {
            EMBEDDED_HOST_PORT.captures(url).map(|c| {
                let host = decode_mangled_host(c.get(1).expect("group").as_str());
                (host, c.get(2).expect("group").as_str().to_string())
            })
        });

    match captured {
        Some((host, port)) if HOST_PATTERN.is_match(&host) => {
            let repaired = format!("udp://{}:{}", host, port);
            tracing::warn!("repaired malformed udp tracker url: {} -> {}", preview(url), repaired);
            Ok(repaired)
        }
        _ => Err(MagnetError::InvalidUrl(format!(
            "cannot extract host from mangled udp url: {}",
            preview(url)
        ))),
    }
}

// "2Ftracker.example.org" is "%2Ftracker.example.org" with the percent lost;
// decode the stray escape and drop the leading slash it stood for.
fn decode_mangled_host(host: &str) -> String {
    if (host.starts_with("2F") || host.starts_with("2f")) && host.len() > 2 {
        host[2..].to_string()
    } else {
        host.to_string()
    }
}

// A parsed magnet link: the metadata-less skeleton of a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {

    pub info_hash: ID,

    pub display_name: Option<String>,

    pub trackers: Vec<Url>,

    // xs= acceptable sources, kept verbatim.
    pub sources: Vec<String>,

}

impl MagnetLink {

    pub fn parse(uri: &str) -> Result<Self> {

        let parsed = Url::parse(uri)
            .map_err(|e| MagnetError::BadMagnet(format!("{}: {}", e, preview(uri))))?;
        if parsed.scheme() != "magnet" {
            return Err(MagnetError::BadMagnet(format!("not a magnet uri: {}", preview(uri))));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<Url> = Vec::new();
        let mut sources = Vec::new();
        let mut rejected = 0usize;

        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if info_hash.is_none() {
                        if let Some(encoded) = value.strip_prefix("urn:btih:") {
                            info_hash = Some(decode_info_hash(encoded, uri)?);
                        }
                    }
                }
                "dn" => display_name = Some(value.replace('+', " ")),
                "tr" => match normalize_tracker_url(&value) {
                    Ok(url) => trackers.push(url),
                    Err(e) => {
                        rejected += 1;
                        tracing::debug!("dropping tracker from magnet: {}", e);
                    }
                },
                "xs" => sources.push(value.into_owned()),
                _ => {}
            }
        }

        if rejected > 0 {
            tracing::warn!("dropped {} malformed tracker(s) from magnet link", rejected);
        }

        trackers.dedup();

        match info_hash {
            Some(info_hash) => Ok(Self { info_hash, display_name, trackers, sources }),
            None => Err(MagnetError::BadMagnet(format!(
                "missing xt=urn:btih: {}",
                preview(uri)
            ))),
        }
    }

    // The canonical uri for this skeleton; parse(to_uri(m)) == m.
    pub fn to_uri(&self) -> String {

        let mut uri = format!("magnet:?xt=urn:btih:{}", hex::encode(self.info_hash));
        if let Some(name) = &self.display_name {
            uri.push_str("&dn=");
            uri.push_str(&urlencoding::encode(name));
        }
        for tracker in &self.trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(tracker.as_str()));
        }
        for source in &self.sources {
            uri.push_str("&xs=");
            uri.push_str(&urlencoding::encode(source));
        }
        uri
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn decode_info_hash(encoded: &str, uri: &str) -> Result<ID> {
    match encoded.len() {
        40 => {
            let bytes = hex::decode(encoded)
                .map_err(|_| MagnetError::BadMagnet(format!("invalid hex infohash: {}", preview(uri))))?;
            Ok(bytes.try_into().expect("40 hex chars decode to 20 bytes"))
        }
        32 => {
            let bytes = data_encoding::BASE32
                .decode(encoded.to_ascii_uppercase().as_bytes())
                .map_err(|_| MagnetError::BadMagnet(format!("invalid base32 infohash: {}", preview(uri))))?;
            bytes.try_into().map_err(|_| {
                MagnetError::BadMagnet(format!("base32 infohash has wrong length: {}", preview(uri)))
            })
        }
        n => Err(MagnetError::BadMagnet(format!(
            "infohash must be 40 hex or 32 base32 chars, got {}: {}",
            n,
            preview(uri)
        ))),
    }
}
