//! Two-tier script and resource cache.
//!
//! The [`ScriptCache`] combines:
//! - a **volatile index** of compiled scripts held in memory for the life of
//!   the process, guarded by a single reader/writer lock
//! - a **durable store** of raw fetched bytes on disk, one file per resource
//!   under `<dir>/http/<sha256(url)>`
//!
//! Freshness for both tiers comes from the response that produced the entry
//! (see [`parse_expiration`]) and is never recomputed. Stale entries are
//! evicted lazily, on the lookup that discovers them.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use regex::Regex;
use rhai::AST;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use capsule_common::CacheError;

static MAX_AGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"max-age=(\d+)").expect("max-age pattern is valid"));

/// Response headers: header name (looked up case-insensitively) to values in
/// arrival order.
pub type Headers = BTreeMap<String, Vec<String>>;

/// The parts of an HTTP response that decide and describe a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Final URL of the response (after redirects).
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
}

/// A fetched resource persisted on disk.
///
/// Written once per key and only ever replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableEntry {
    /// Resolved URL of the resource.
    pub url: String,
    /// Response body.
    pub body: Vec<u8>,
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// Instant after which the entry must not be served.
    pub expires: DateTime<Utc>,
}

impl DurableEntry {
    /// Returns `true` if the entry is stale at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    /// Response metadata recorded with the entry.
    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
        }
    }
}

/// Where a compiled script came from, which decides its expiry.
#[derive(Debug, Clone, Copy)]
pub enum ScriptOrigin<'a> {
    /// Recompiled from a durable entry; its stored expiry is inherited.
    Stored(&'a DurableEntry),
    /// Compiled from a fresh network response; expiry is computed from its
    /// headers and the raw bytes are written to the durable tier too.
    Fetched {
        /// The response body the script was compiled from.
        body: &'a [u8],
        /// The response metadata.
        meta: &'a ResponseMeta,
    },
}

/// Result of a [`ScriptCache::get_cached_script`] lookup.
#[derive(Debug)]
pub enum CacheLookup {
    /// An unexpired compiled script.
    Script(AST),
    /// No compiled script, but the raw resource is on disk.
    Durable(DurableEntry),
    /// Nothing usable in either tier.
    Miss,
}

struct ScriptEntry {
    script: AST,
    expires: DateTime<Utc>,
}

/// Shared two-tier cache.
///
/// One instance is shared by reference between a root runtime context and
/// every context copied from it.
pub struct ScriptCache {
    dir: PathBuf,
    scripts: RwLock<HashMap<String, ScriptEntry>>,
}

impl ScriptCache {
    /// Create a cache rooted at `dir`. Nothing is touched on disk until the
    /// first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            scripts: RwLock::new(HashMap::new()),
        }
    }

    /// The cache root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the durable entry for `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join("http").join(cache_key(key))
    }

    /// Persist a fetched resource if its headers make it cacheable.
    ///
    /// A response without a usable `Cache-Control: max-age` or `Expires`
    /// header is not written.
    pub fn cache_data(&self, key: &str, body: &[u8], meta: &ResponseMeta) -> Result<(), CacheError> {
        let Some(expires) = parse_expiration(&meta.headers, Utc::now()) else {
            debug!(key = %key, "Response not cacheable");
            return Ok(());
        };

        self.write_entry(
            key,
            &DurableEntry {
                url: meta.url.clone(),
                body: body.to_vec(),
                status: meta.status,
                headers: meta.headers.clone(),
                expires,
            },
        )
    }

    /// Read the durable entry for `key`.
    ///
    /// Missing, unreadable, corrupt, and expired entries are all reported as
    /// errors; an expired entry is removed from disk.
    pub fn cached_entry(&self, key: &str) -> Result<DurableEntry, CacheError> {
        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::not_found(key));
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Failed to read cache entry");
                return Err(e.into());
            }
        };

        let entry: DurableEntry = bincode::deserialize(&bytes).map_err(|e| {
            debug!(key = %key, error = %e, "Corrupt cache entry");
            CacheError::Decode(e.to_string())
        })?;

        if entry.is_expired_at(Utc::now()) {
            debug!(key = %key, expires = %entry.expires, "Evicting stale cache entry");
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(key = %key, error = %e, "Failed to remove stale cache entry");
            }
            return Err(CacheError::Expired { key: key.to_string() });
        }

        Ok(entry)
    }

    /// Record a compiled script in the volatile index.
    ///
    /// The expiry is inherited from a stored entry or computed from the
    /// response headers. A script without an expiry is not cached. Scripts
    /// compiled from a network response also have their raw bytes persisted.
    pub fn cache_script(&self, key: &str, script: AST, origin: ScriptOrigin<'_>) -> Result<(), CacheError> {
        let expires = match origin {
            ScriptOrigin::Stored(entry) => Some(entry.expires),
            ScriptOrigin::Fetched { meta, .. } => parse_expiration(&meta.headers, Utc::now()),
        };
        let Some(expires) = expires else {
            debug!(key = %key, "Script not cacheable");
            return Ok(());
        };

        self.scripts
            .write()
            .insert(key.to_string(), ScriptEntry { script, expires });

        match origin {
            ScriptOrigin::Stored(_) => Ok(()),
            ScriptOrigin::Fetched { body, meta } => self.write_entry(
                key,
                &DurableEntry {
                    url: meta.url.clone(),
                    body: body.to_vec(),
                    status: meta.status,
                    headers: meta.headers.clone(),
                    expires,
                },
            ),
        }
    }

    /// Look up `key`, volatile tier first.
    ///
    /// A stale compiled script is evicted and reported as a miss without
    /// consulting the disk, since the durable copy shares its expiry.
    pub fn get_cached_script(&self, key: &str) -> CacheLookup {
        let now = Utc::now();
        let fresh = {
            let scripts = self.scripts.read();
            scripts
                .get(key)
                .map(|entry| (entry.expires > now).then(|| entry.script.clone()))
        };

        match fresh {
            Some(Some(script)) => return CacheLookup::Script(script),
            Some(None) => {
                let mut scripts = self.scripts.write();
                // Another thread may have refreshed the entry in between.
                if scripts.get(key).is_some_and(|entry| entry.expires <= now) {
                    scripts.remove(key);
                    debug!(key = %key, "Evicted stale script");
                }
                return CacheLookup::Miss;
            }
            None => {}
        }

        match self.cached_entry(key) {
            Ok(entry) => CacheLookup::Durable(entry),
            Err(e) => {
                if !e.is_miss() {
                    debug!(key = %key, error = %e, "Ignoring unusable cache entry");
                }
                CacheLookup::Miss
            }
        }
    }

    /// Number of compiled scripts currently indexed, stale ones included.
    pub fn script_count(&self) -> usize {
        self.scripts.read().len()
    }

    fn write_entry(&self, key: &str, entry: &DurableEntry) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(entry).map_err(|e| CacheError::Encode(e.to_string()))?;
        std::fs::write(&path, bytes)?;

        debug!(key = %key, path = %path.display(), expires = %entry.expires, "Cache entry written");
        Ok(())
    }
}

impl std::fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCache")
            .field("dir", &self.dir)
            .field("scripts", &self.script_count())
            .finish()
    }
}

/// Hex-encoded SHA-256 digest of a resource identifier.
pub fn cache_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Compute when a response stops being fresh.
///
/// `Cache-Control: max-age=N` (first match, N > 0) wins; otherwise an
/// RFC 1123 `Expires` header is used verbatim. `None` means not cacheable.
pub fn parse_expiration(headers: &Headers, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let max_age = header_value(headers, "cache-control")
        .and_then(|value| MAX_AGE_RE.captures(value))
        .and_then(|caps| caps[1].parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .and_then(TimeDelta::try_seconds)
        .and_then(|age| now.checked_add_signed(age));

    max_age.or_else(|| {
        header_value(headers, "expires")
            .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
            .map(|expires| expires.with_timezone(&Utc))
    })
}

/// First value of a header, matched case-insensitively.
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers
                .entry((*name).to_string())
                .or_default()
                .push((*value).to_string());
        }
        headers
    }

    fn meta(url: &str, pairs: &[(&str, &str)]) -> ResponseMeta {
        ResponseMeta {
            url: url.to_string(),
            status: 200,
            headers: headers(pairs),
        }
    }

    fn compile(source: &str) -> AST {
        rhai::Engine::new().compile(source).unwrap()
    }

    #[test]
    fn test_cache_key_is_hex_sha256() {
        let key = cache_key("https://example.com/a.rhai");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, cache_key("https://example.com/a.rhai"));
        assert_ne!(key, cache_key("https://example.com/b.rhai"));
    }

    #[test]
    fn test_parse_expiration_max_age() {
        let now = Utc::now();
        let expires = parse_expiration(&headers(&[("Cache-Control", "public, max-age=120")]), now);
        assert_eq!(expires, Some(now + TimeDelta::seconds(120)));
    }

    #[test]
    fn test_parse_expiration_expires_header() {
        let now = Utc::now();
        let expires = parse_expiration(
            &headers(&[("Expires", "Wed, 21 Oct 2037 07:28:00 GMT")]),
            now,
        )
        .unwrap();
        assert_eq!(expires.to_rfc3339(), "2037-10-21T07:28:00+00:00");
    }

    #[test]
    fn test_parse_expiration_not_cacheable() {
        assert_eq!(parse_expiration(&Headers::new(), Utc::now()), None);
        assert_eq!(
            parse_expiration(&headers(&[("Cache-Control", "no-cache")]), Utc::now()),
            None
        );
        assert_eq!(
            parse_expiration(&headers(&[("Expires", "not a date")]), Utc::now()),
            None
        );
    }

    #[test]
    fn test_parse_expiration_ignores_non_positive_max_age() {
        let now = Utc::now();
        let with_expires = |cache_control: &str| {
            headers(&[
                ("cache-control", cache_control),
                ("expires", "Wed, 21 Oct 2037 07:28:00 GMT"),
            ])
        };

        let zero = parse_expiration(&with_expires("max-age=0"), now).unwrap();
        assert_eq!(zero.to_rfc3339(), "2037-10-21T07:28:00+00:00");

        let negative = parse_expiration(&with_expires("max-age=-30"), now).unwrap();
        assert_eq!(negative.to_rfc3339(), "2037-10-21T07:28:00+00:00");

        assert_eq!(parse_expiration(&headers(&[("cache-control", "max-age=0")]), now), None);
    }

    #[test]
    fn test_header_value_case_insensitive() {
        let headers = headers(&[("content-type", "text/plain"), ("content-type", "charset=utf-8")]);
        assert_eq!(header_value(&headers, "Content-Type"), Some("text/plain"));
        assert_eq!(header_value(&headers, "expires"), None);
    }

    #[test]
    fn test_cache_data_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScriptCache::new(dir.path());
        let meta = ResponseMeta {
            url: "https://example.com/final".into(),
            status: 203,
            headers: headers(&[
                ("cache-control", "max-age=300"),
                ("set-cookie", "a=1"),
                ("set-cookie", "b=2"),
            ]),
        };

        cache
            .cache_data("https://example.com/start", b"body bytes", &meta)
            .unwrap();
        assert!(cache.entry_path("https://example.com/start").exists());

        let entry = cache.cached_entry("https://example.com/start").unwrap();
        assert_eq!(entry.url, "https://example.com/final");
        assert_eq!(entry.body, b"body bytes");
        assert_eq!(entry.status, 203);
        assert_eq!(entry.headers, meta.headers);
        assert_eq!(entry.meta(), meta);

        let again = cache.cached_entry("https://example.com/start").unwrap();
        assert_eq!(again.expires, entry.expires);
    }

    #[test]
    fn test_cache_data_skips_uncacheable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScriptCache::new(dir.path());

        cache
            .cache_data("https://example.com/x", b"x", &meta("https://example.com/x", &[]))
            .unwrap();

        assert!(!cache.entry_path("https://example.com/x").exists());
        assert!(matches!(
            cache.cached_entry("https://example.com/x"),
            Err(CacheError::NotFound { .. })
        ));
    }

    #[test]
    fn test_cached_entry_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScriptCache::new(dir.path());
        let path = cache.entry_path("https://example.com/bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"\x01\x02garbage").unwrap();

        assert!(matches!(
            cache.cached_entry("https://example.com/bad"),
            Err(CacheError::Decode(_))
        ));
        assert!(matches!(
            cache.get_cached_script("https://example.com/bad"),
            CacheLookup::Miss
        ));
    }

    #[test]
    fn test_cached_entry_expired_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScriptCache::new(dir.path());
        let stale = meta("https://example.com/old", &[("expires", "Mon, 01 Jan 2001 00:00:00 GMT")]);

        cache.cache_data("https://example.com/old", b"old", &stale).unwrap();
        let path = cache.entry_path("https://example.com/old");
        assert!(path.exists());

        assert!(matches!(
            cache.cached_entry("https://example.com/old"),
            Err(CacheError::Expired { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_cache_script_fetched_populates_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScriptCache::new(dir.path());
        let source = b"fn answer() { 42 }";
        let meta = meta("https://example.com/s.rhai", &[("cache-control", "max-age=60")]);

        cache
            .cache_script(
                "https://example.com/s.rhai",
                compile("fn answer() { 42 }"),
                ScriptOrigin::Fetched { body: source, meta: &meta },
            )
            .unwrap();

        assert_eq!(cache.script_count(), 1);
        assert!(matches!(
            cache.get_cached_script("https://example.com/s.rhai"),
            CacheLookup::Script(_)
        ));
        let entry = cache.cached_entry("https://example.com/s.rhai").unwrap();
        assert_eq!(entry.body, source);
    }

    #[test]
    fn test_cache_script_stored_inherits_expiry_without_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScriptCache::new(dir.path());
        let entry = DurableEntry {
            url: "https://example.com/t.rhai".into(),
            body: b"let x = 1;".to_vec(),
            status: 200,
            headers: Headers::new(),
            expires: Utc::now() + TimeDelta::minutes(5),
        };

        cache
            .cache_script(&entry.url, compile("let x = 1;"), ScriptOrigin::Stored(&entry))
            .unwrap();

        assert!(matches!(cache.get_cached_script(&entry.url), CacheLookup::Script(_)));
        // Durable tier is left alone for stored origins.
        assert!(!cache.entry_path(&entry.url).exists());
    }

    #[test]
    fn test_cache_script_uncacheable_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScriptCache::new(dir.path());
        let meta = meta("https://example.com/n.rhai", &[("cache-control", "no-store")]);

        cache
            .cache_script(
                "https://example.com/n.rhai",
                compile("1"),
                ScriptOrigin::Fetched { body: b"1", meta: &meta },
            )
            .unwrap();

        assert_eq!(cache.script_count(), 0);
        assert!(!cache.entry_path("https://example.com/n.rhai").exists());
    }

    #[test]
    fn test_stale_script_is_evicted_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScriptCache::new(dir.path());
        let entry = DurableEntry {
            url: "https://example.com/stale.rhai".into(),
            body: b"1".to_vec(),
            status: 200,
            headers: Headers::new(),
            expires: Utc::now() - TimeDelta::seconds(1),
        };

        cache
            .cache_script(&entry.url, compile("1"), ScriptOrigin::Stored(&entry))
            .unwrap();
        assert_eq!(cache.script_count(), 1);

        assert!(matches!(cache.get_cached_script(&entry.url), CacheLookup::Miss));
        assert_eq!(cache.script_count(), 0);
    }

    #[test]
    fn test_lookup_falls_through_to_durable_tier() {
        let dir = tempfile::tempdir().unwrap();
        let meta = meta("https://example.com/d.rhai", &[("cache-control", "max-age=60")]);
        ScriptCache::new(dir.path())
            .cache_data("https://example.com/d.rhai", b"let y = 2;", &meta)
            .unwrap();

        // A fresh process sees only the disk.
        let cache = ScriptCache::new(dir.path());
        match cache.get_cached_script("https://example.com/d.rhai") {
            CacheLookup::Durable(entry) => assert_eq!(entry.body, b"let y = 2;"),
            other => panic!("expected durable entry, got {other:?}"),
        }
        assert!(matches!(
            cache.get_cached_script("https://example.com/none.rhai"),
            CacheLookup::Miss
        ));
    }
}
