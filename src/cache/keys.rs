//! Cache key construction.
//!
//! Response-cache keys encode method, path, the normalized query string and
//! any configured vary headers. Domain keys used by business code live in
//! `CacheKeys` so invalidation patterns stay in one place.

use std::time::Duration;

use axum::http::{HeaderMap, Method};
use url::form_urlencoded;

/// Build the response-cache key for a request.
///
/// Layout: `{prefix}{METHOD}:{path}:{query}` followed by
/// `:{header}:{value}` for every vary header present on the request.
pub fn response_key(
    prefix: &str,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    vary: &[String],
) -> String {
    let mut key = format!(
        "{prefix}{method}:{path}:{}",
        normalize_query(query.unwrap_or(""))
    );

    for name in vary {
        let value = headers
            .get(name.as_str())
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty());
        if let Some(value) = value {
            key.push(':');
            key.push_str(&name.to_ascii_lowercase());
            key.push(':');
            key.push_str(value);
        }
    }

    key
}

/// Sort query pairs so parameter order does not fragment the cache.
pub fn normalize_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort();

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Keys for domain objects cached by request handlers.
pub struct CacheKeys;

impl CacheKeys {
    pub fn agent_config(location_id: &str) -> String {
        format!("agent:config:{location_id}")
    }

    pub fn user(user_id: &str) -> String {
        format!("user:{user_id}")
    }

    pub fn org(org_id: &str) -> String {
        format!("org:{org_id}")
    }

    pub fn location(location_id: &str) -> String {
        format!("location:{location_id}")
    }

    pub fn calendar_availability(location_id: &str, date: &str) -> String {
        format!("calendar:availability:{location_id}:{date}")
    }

    pub fn voices(locale: Option<&str>) -> String {
        match locale {
            Some(locale) => format!("elevenlabs:voices:{locale}"),
            None => "elevenlabs:voices:all".to_string(),
        }
    }

    /// Pattern matching every agent config belonging to an organization.
    pub fn agent_config_by_org(org_id: &str) -> String {
        format!("agent:config:org:{org_id}:*")
    }

    /// Pattern matching every location belonging to an organization.
    pub fn location_by_org(org_id: &str) -> String {
        format!("location:org:{org_id}:*")
    }
}

/// Default lifetimes for domain keys.
pub struct CacheTtl;

impl CacheTtl {
    pub const AGENT_CONFIG: Duration = Duration::from_secs(5 * 60);
    pub const USER: Duration = Duration::from_secs(10 * 60);
    pub const ORG: Duration = Duration::from_secs(10 * 60);
    pub const LOCATION: Duration = Duration::from_secs(10 * 60);
    pub const CALENDAR_AVAILABILITY: Duration = Duration::from_secs(60);
    pub const VOICES: Duration = Duration::from_secs(60 * 60);
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn key_without_query_or_vary() {
        let key = response_key(
            "http:cache:",
            &Method::GET,
            "/api/health",
            None,
            &HeaderMap::new(),
            &[],
        );
        assert_eq!(key, "http:cache:GET:/api/health:");
    }

    #[test]
    fn query_order_does_not_change_key() {
        let headers = HeaderMap::new();
        let a = response_key("p:", &Method::GET, "/v", Some("b=2&a=1"), &headers, &[]);
        let b = response_key("p:", &Method::GET, "/v", Some("a=1&b=2"), &headers, &[]);
        assert_eq!(a, b);
        assert_eq!(a, "p:GET:/v:a=1&b=2");
    }

    #[test]
    fn different_queries_produce_different_keys() {
        let headers = HeaderMap::new();
        let a = response_key("p:", &Method::GET, "/v", Some("page=1"), &headers, &[]);
        let b = response_key("p:", &Method::GET, "/v", Some("page=2"), &headers, &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn vary_headers_are_appended_when_present() {
        let mut headers = HeaderMap::new();
        headers.insert("accept-language", HeaderValue::from_static("de-CH"));
        let vary = vec!["Accept-Language".to_string(), "x-tenant".to_string()];

        let key = response_key("p:", &Method::GET, "/v", None, &headers, &vary);
        assert_eq!(key, "p:GET:/v::accept-language:de-CH");
    }

    #[test]
    fn domain_keys_match_their_patterns() {
        assert_eq!(CacheKeys::agent_config("loc-1"), "agent:config:loc-1");
        assert_eq!(CacheKeys::voices(None), "elevenlabs:voices:all");
        assert_eq!(CacheKeys::voices(Some("de")), "elevenlabs:voices:de");
        assert_eq!(
            CacheKeys::calendar_availability("loc-1", "2026-10-17"),
            "calendar:availability:loc-1:2026-10-17"
        );

        let pattern = crate::util::Glob::new(&CacheKeys::agent_config_by_org("org-9")).unwrap();
        assert!(pattern.is_match("agent:config:org:org-9:loc-1"));
        assert!(!pattern.is_match("agent:config:org:org-10:loc-1"));
    }
}
