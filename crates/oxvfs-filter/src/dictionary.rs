//! SDCH dictionary store.
//!
//! Dictionaries are keyed by their server hash and carry the scoping rules
//! from their header (domain, path, ports, expiry). A dictionary is only
//! handed out for URLs those rules admit.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Largest dictionary accepted, header included.
pub const MAX_DICTIONARY_SIZE: usize = 1_000_000;

/// Number of dictionaries kept at once.
pub const MAX_DICTIONARY_COUNT: usize = 20;

/// Lifetime of a dictionary without a `max-age` header.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Length of the server hash that prefixes an SDCH response.
pub const SERVER_HASH_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdchError {
    #[error("dictionary header is not terminated by an empty line")]
    MissingHeaderTerminator,

    #[error("malformed dictionary header line '{0}'")]
    BadHeaderLine(String),

    #[error("dictionary has no Domain attribute")]
    MissingDomain,

    #[error("dictionary domain '{0}' is a top level domain")]
    TopLevelDomain(String),

    #[error("dictionary domain '{domain}' does not match host '{host}'")]
    DomainMismatch { domain: String, host: String },

    #[error("dictionary host '{host}' is too far below domain '{domain}'")]
    HostTooDeep { domain: String, host: String },

    #[error("dictionary URL port {0} is not in the Port list")]
    PortMismatch(u16),

    #[error("unsupported dictionary format version '{0}'")]
    UnsupportedFormatVersion(String),

    #[error("dictionary of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    #[error("dictionary limit of {} reached", MAX_DICTIONARY_COUNT)]
    TooManyDictionaries,

    #[error("dictionary {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("dictionaries cannot be served over '{0}'")]
    UnsupportedScheme(String),

    #[error("SDCH is not enabled for '{0}'")]
    DomainNotSupported(String),
}

/// A registered dictionary.
#[derive(Debug)]
pub struct Dictionary {
    payload: Arc<[u8]>,
    client_hash: String,
    server_hash: String,
    url: Url,
    domain: String,
    path: String,
    ports: BTreeSet<u16>,
    expires_at: Instant,
}

impl Dictionary {
    /// Dictionary body, without the header.
    pub fn payload(&self) -> Arc<[u8]> {
        Arc::clone(&self.payload)
    }

    /// Hash a client advertises in `Avail-Dictionary`.
    pub fn client_hash(&self) -> &str {
        &self.client_hash
    }

    /// Hash a server writes in front of an SDCH response.
    pub fn server_hash(&self) -> &str {
        &self.server_hash
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().copied()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Whether content for `url` may be decoded with this dictionary.
    fn can_use(&self, url: &Url) -> bool {
        if !domain_match(url, &self.domain) {
            debug!(url = %url, domain = %self.domain, "dictionary domain does not match");
            return false;
        }
        if !self.port_matches(url) {
            debug!(url = %url, "dictionary port list does not match");
            return false;
        }
        if !self.path.is_empty() && !path_match(url.path(), &self.path) {
            debug!(url = %url, path = %self.path, "dictionary path does not match");
            return false;
        }
        url.scheme() == "http"
    }

    fn can_advertise(&self, url: &Url, now: Instant) -> bool {
        domain_match(url, &self.domain)
            && self.port_matches(url)
            && (self.path.is_empty() || path_match(url.path(), &self.path))
            && url.scheme() != "https"
            && !self.is_expired(now)
    }

    fn port_matches(&self, url: &Url) -> bool {
        self.ports.is_empty()
            || url
                .port_or_known_default()
                .is_some_and(|port| self.ports.contains(&port))
    }
}

/// Client and server hashes of a dictionary text.
pub fn dictionary_hashes(text: &[u8]) -> (String, String) {
    let digest = Sha256::digest(text);
    (
        URL_SAFE_NO_PAD.encode(&digest[..6]),
        URL_SAFE_NO_PAD.encode(&digest[6..12]),
    )
}

/// Host of `url` equals `domain` or sits below it.
fn domain_match(url: &Url, domain: &str) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(&domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

/// RFC 2965 path-match.
fn path_match(path: &str, restriction: &str) -> bool {
    if path == restriction {
        return true;
    }
    if restriction.is_empty() || !path.starts_with(restriction) {
        return false;
    }
    restriction.ends_with('/') || path.as_bytes()[restriction.len()] == b'/'
}

/// Approximates a registry lookup: a registrable domain has an interior dot.
fn is_top_level_domain(domain: &str) -> bool {
    !domain.trim_start_matches('.').trim_end_matches('.').contains('.')
}

#[derive(Debug, Default)]
struct ParsedHeader {
    domain: String,
    path: String,
    ports: BTreeSet<u16>,
    max_age: Option<i64>,
}

fn parse_header(header: &str) -> Result<ParsedHeader, SdchError> {
    let mut parsed = ParsedHeader::default();
    for line in header.split('\n') {
        let Some((name, value)) = line.split_once(':') else {
            return Err(SdchError::BadHeaderLine(line.to_string()));
        };
        let value = value.trim_start_matches([' ', '\t']).trim_end_matches('\r');
        if value.is_empty() {
            continue;
        }
        match name.trim().to_ascii_lowercase().as_str() {
            "domain" => parsed.domain = value.to_string(),
            "path" => parsed.path = value.to_string(),
            "format-version" if value != "1.0" => {
                return Err(SdchError::UnsupportedFormatVersion(value.to_string()));
            }
            "max-age" => parsed.max_age = value.parse().ok(),
            "port" => {
                if let Ok(port) = value.parse() {
                    parsed.ports.insert(port);
                }
            }
            _ => {}
        }
    }
    Ok(parsed)
}

#[derive(Debug, Default)]
struct ManagerState {
    dictionaries: BTreeMap<String, Arc<Dictionary>>,
    blacklist: HashSet<String>,
    supported_domain: Option<String>,
}

impl ManagerState {
    fn is_in_supported_domain(&self, url: &Url) -> bool {
        if self.is_blacklisted(url) {
            return false;
        }
        self.supported_domain
            .as_deref()
            .is_none_or(|domain| domain_match(url, domain))
    }

    fn is_blacklisted(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.blacklist.contains(&host.to_ascii_lowercase()))
    }
}

/// Process-local set of SDCH dictionaries and blacklisted domains.
#[derive(Debug, Default)]
pub struct SdchManager {
    state: Mutex<ManagerState>,
}

impl SdchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict SDCH to hosts under `domain`, or lift the restriction.
    pub fn set_supported_domain(&self, domain: Option<&str>) {
        self.state.lock().supported_domain = domain.map(str::to_ascii_lowercase);
    }

    pub fn is_in_supported_domain(&self, url: &Url) -> bool {
        self.state.lock().is_in_supported_domain(url)
    }

    /// Stop using SDCH for the host of `url`.
    pub fn blacklist_domain(&self, url: &Url) {
        if let Some(host) = url.host_str() {
            info!(host, "SDCH disabled for domain");
            self.state.lock().blacklist.insert(host.to_ascii_lowercase());
        }
    }

    pub fn is_blacklisted(&self, url: &Url) -> bool {
        self.state.lock().is_blacklisted(url)
    }

    pub fn clear_blacklist(&self) {
        self.state.lock().blacklist.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().dictionaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a dictionary fetched from `dictionary_url`.
    ///
    /// Returns the server hash under which it was stored.
    pub fn add_dictionary(&self, text: &[u8], dictionary_url: &Url) -> Result<String, SdchError> {
        let (client_hash, server_hash) = dictionary_hashes(text);
        let mut state = self.state.lock();
        if state.dictionaries.contains_key(&server_hash) {
            return Err(SdchError::AlreadyLoaded(server_hash));
        }

        let header_end = text
            .windows(2)
            .position(|w| w == b"\n\n")
            .ok_or(SdchError::MissingHeaderTerminator)?;
        let header = std::str::from_utf8(&text[..header_end]).map_err(|_| {
            SdchError::BadHeaderLine(String::from_utf8_lossy(&text[..header_end]).into_owned())
        })?;
        let parsed = parse_header(header)?;

        let scheme = dictionary_url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(SdchError::UnsupportedScheme(scheme.to_string()));
        }
        if !state.is_in_supported_domain(dictionary_url) {
            return Err(SdchError::DomainNotSupported(
                dictionary_url.host_str().unwrap_or_default().to_string(),
            ));
        }
        check_domain(&parsed, dictionary_url)?;

        if text.len() > MAX_DICTIONARY_SIZE {
            return Err(SdchError::TooLarge(text.len()));
        }
        if state.dictionaries.len() >= MAX_DICTIONARY_COUNT {
            return Err(SdchError::TooManyDictionaries);
        }

        let now = Instant::now();
        let expires_at = match parsed.max_age {
            Some(secs) if secs <= 0 => now,
            Some(secs) => now
                .checked_add(Duration::from_secs(secs.unsigned_abs()))
                .unwrap_or(now + DEFAULT_EXPIRY),
            None => now + DEFAULT_EXPIRY,
        };
        let dictionary = Dictionary {
            payload: Arc::from(&text[header_end + 2..]),
            client_hash,
            server_hash: server_hash.clone(),
            url: dictionary_url.clone(),
            domain: parsed.domain,
            path: parsed.path,
            ports: parsed.ports,
            expires_at,
        };
        debug!(
            server_hash = %server_hash,
            domain = %dictionary.domain,
            bytes = text.len(),
            "SDCH dictionary added"
        );
        state
            .dictionaries
            .insert(server_hash.clone(), Arc::new(dictionary));
        Ok(server_hash)
    }

    /// Dictionary for `server_hash`, if it may be used to decode `url`.
    pub fn get_dictionary(&self, server_hash: &str, url: &Url) -> Option<Arc<Dictionary>> {
        let state = self.state.lock();
        if !state.is_in_supported_domain(url) {
            return None;
        }
        let dictionary = state.dictionaries.get(server_hash)?;
        if dictionary.is_expired(Instant::now()) || !dictionary.can_use(url) {
            return None;
        }
        Some(Arc::clone(dictionary))
    }

    /// Comma-separated client hashes to advertise for a request to `url`.
    pub fn avail_dictionary_list(&self, url: &Url) -> String {
        let state = self.state.lock();
        if !state.is_in_supported_domain(url) {
            return String::new();
        }
        let now = Instant::now();
        state
            .dictionaries
            .values()
            .filter(|d| d.can_advertise(url, now))
            .map(|d| d.client_hash.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether a page at `referring_url` may make us fetch `dictionary_url`.
    pub fn can_fetch_dictionary(&self, referring_url: &Url, dictionary_url: &Url) -> bool {
        if referring_url.host_str() != dictionary_url.host_str() {
            return false;
        }
        if referring_url.scheme() != "http" {
            return false;
        }
        self.is_in_supported_domain(dictionary_url)
    }
}

fn check_domain(parsed: &ParsedHeader, dictionary_url: &Url) -> Result<(), SdchError> {
    let domain = parsed.domain.to_ascii_lowercase();
    if domain.is_empty() {
        return Err(SdchError::MissingDomain);
    }
    if is_top_level_domain(&domain) {
        return Err(SdchError::TopLevelDomain(domain));
    }
    let host = dictionary_url.host_str().unwrap_or_default().to_ascii_lowercase();
    if !domain_match(dictionary_url, &domain) {
        return Err(SdchError::DomainMismatch { domain, host });
    }
    // The part of the host in front of the domain may not contain a dot
    let bare = domain.trim_start_matches('.');
    if let Some(prefix) = host.strip_suffix(bare)
        && prefix.trim_end_matches('.').contains('.')
    {
        return Err(SdchError::HostTooDeep { domain, host });
    }
    if let Some(port) = dictionary_url.port_or_known_default()
        && !parsed.ports.is_empty()
        && !parsed.ports.contains(&port)
    {
        return Err(SdchError::PortMismatch(port));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn text(header: &str, body: &str) -> Vec<u8> {
        format!("{header}\n\n{body}").into_bytes()
    }

    #[test]
    fn test_hashes_are_url_safe_and_eight_chars() {
        let (client, server) = dictionary_hashes(b"Domain: example.com\n\nbody");
        assert_eq!(client.len(), 8);
        assert_eq!(server.len(), 8);
        assert_ne!(client, server);
        assert!(
            server
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        );
    }

    #[test]
    fn test_domain_and_path_matching() {
        assert!(domain_match(&url("http://example.com/"), "example.com"));
        assert!(domain_match(&url("http://www.example.com/"), ".example.com"));
        assert!(!domain_match(&url("http://badexample.com/"), "example.com"));
        assert!(path_match("/a/b", "/a"));
        assert!(path_match("/a/b", "/a/"));
        assert!(!path_match("/ab", "/a"));
        assert!(!path_match("/", "/a"));
    }

    #[test]
    fn test_add_and_lookup() {
        let manager = SdchManager::new();
        let dict_url = url("http://www.example.com/dict");
        let hash = manager
            .add_dictionary(&text("Domain: example.com\nPath: /docs", "shared words"), &dict_url)
            .unwrap();

        let dict = manager
            .get_dictionary(&hash, &url("http://www.example.com/docs/page"))
            .unwrap();
        assert_eq!(&*dict.payload(), b"shared words");
        assert_eq!(dict.server_hash(), hash);

        assert!(manager.get_dictionary(&hash, &url("http://www.other.com/docs")).is_none());
        assert!(manager.get_dictionary(&hash, &url("http://www.example.com/other")).is_none());
        assert!(manager.get_dictionary(&hash, &url("https://www.example.com/docs")).is_none());

        let advertised = manager.avail_dictionary_list(&url("http://example.com/docs/x"));
        assert_eq!(advertised, dict.client_hash());
    }

    #[test]
    fn test_registration_rules() {
        let manager = SdchManager::new();
        let dict_url = url("http://a.example.com/d");

        assert_eq!(
            manager.add_dictionary(b"Domain: example.com\nno terminator", &dict_url),
            Err(SdchError::MissingHeaderTerminator)
        );
        assert_eq!(
            manager.add_dictionary(&text("Path: /", "x"), &dict_url),
            Err(SdchError::MissingDomain)
        );
        assert!(matches!(
            manager.add_dictionary(&text("Domain: com", "x"), &dict_url),
            Err(SdchError::TopLevelDomain(_))
        ));
        assert!(matches!(
            manager.add_dictionary(&text("Domain: other.org", "x"), &dict_url),
            Err(SdchError::DomainMismatch { .. })
        ));
        assert!(matches!(
            manager.add_dictionary(&text("Domain: example.com", "x"), &url("http://b.a.example.com/d")),
            Err(SdchError::HostTooDeep { .. })
        ));
        assert_eq!(
            manager.add_dictionary(&text("Domain: example.com\nPort: 8080", "x"), &dict_url),
            Err(SdchError::PortMismatch(80))
        );
        assert!(matches!(
            manager.add_dictionary(&text("Domain: example.com\nFormat-Version: 2.0", "x"), &dict_url),
            Err(SdchError::UnsupportedFormatVersion(_))
        ));
        assert!(matches!(
            manager.add_dictionary(&text("Domain: example.com", "x"), &url("ftp://a.example.com/d")),
            Err(SdchError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            manager.add_dictionary(&text("bogus line", "x"), &dict_url),
            Err(SdchError::BadHeaderLine(_))
        ));

        let ok = text("Domain: example.com", "x");
        manager.add_dictionary(&ok, &dict_url).unwrap();
        assert!(matches!(
            manager.add_dictionary(&ok, &dict_url),
            Err(SdchError::AlreadyLoaded(_))
        ));
    }

    #[test]
    fn test_size_and_count_limits() {
        let manager = SdchManager::new();
        let dict_url = url("http://example.com/d");
        let big = text("Domain: example.com", &"x".repeat(MAX_DICTIONARY_SIZE));
        assert!(matches!(
            manager.add_dictionary(&big, &dict_url),
            Err(SdchError::TooLarge(_))
        ));

        for i in 0..MAX_DICTIONARY_COUNT {
            manager
                .add_dictionary(&text("Domain: example.com", &i.to_string()), &dict_url)
                .unwrap();
        }
        assert_eq!(manager.len(), MAX_DICTIONARY_COUNT);
        assert_eq!(
            manager.add_dictionary(&text("Domain: example.com", "one more"), &dict_url),
            Err(SdchError::TooManyDictionaries)
        );
    }

    #[test]
    fn test_expired_dictionary_is_not_used() {
        let manager = SdchManager::new();
        let dict_url = url("http://example.com/d");
        let hash = manager
            .add_dictionary(&text("Domain: example.com\nMax-Age: 0", "x"), &dict_url)
            .unwrap();
        assert!(manager.get_dictionary(&hash, &dict_url).is_none());
        assert!(manager.avail_dictionary_list(&dict_url).is_empty());
    }

    #[test]
    fn test_blacklist_and_supported_domain() {
        let manager = SdchManager::new();
        let page = url("http://example.com/page");
        let hash = manager
            .add_dictionary(&text("Domain: example.com", "x"), &url("http://example.com/d"))
            .unwrap();

        manager.blacklist_domain(&page);
        assert!(manager.is_blacklisted(&page));
        assert!(manager.get_dictionary(&hash, &page).is_none());
        manager.clear_blacklist();
        assert!(manager.get_dictionary(&hash, &page).is_some());

        manager.set_supported_domain(Some("other.org"));
        assert!(!manager.is_in_supported_domain(&page));
        assert!(manager.get_dictionary(&hash, &page).is_none());
        manager.set_supported_domain(None);
        assert!(manager.is_in_supported_domain(&page));
    }

    #[test]
    fn test_can_fetch_dictionary() {
        let manager = SdchManager::new();
        let page = url("http://example.com/page");
        assert!(manager.can_fetch_dictionary(&page, &url("http://example.com/dict")));
        assert!(!manager.can_fetch_dictionary(&page, &url("http://cdn.example.com/dict")));
        assert!(!manager.can_fetch_dictionary(
            &url("https://example.com/page"),
            &url("https://example.com/dict")
        ));
    }
}
