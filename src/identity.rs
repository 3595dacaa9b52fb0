//! Client identity resolution.
//!
//! Every limiting decision is partitioned by a client key derived from
//! request headers. Authenticated callers are keyed by credential so one
//! user behind a NAT does not starve others; anonymous callers fall back to
//! IP plus a User-Agent fingerprint.

use axum::http::HeaderMap;

use crate::rules::KeyPolicy;

/// How many token characters survive into an `auth:` key.
const TOKEN_KEY_LEN: usize = 10;

/// Resolve the client key for a request under the given policy.
///
/// Infallible by design: a key is always produced, even for requests with no
/// usable headers.
pub fn resolve(policy: KeyPolicy, headers: &HeaderMap) -> String {
    match policy {
        KeyPolicy::AuthOrIp => client_key(headers),
        KeyPolicy::IpOnly => format!("ip:{}", client_ip(headers)),
    }
}

/// Default key derivation: `auth:<token prefix>` for Bearer-authenticated
/// requests, `ip:<addr>:<fingerprint>` otherwise.
pub fn client_key(headers: &HeaderMap) -> String {
    if let Some(token) = bearer_token(headers) {
        let prefix: String = token.chars().take(TOKEN_KEY_LEN).collect();
        return format!("auth:{prefix}");
    }
    let ip = client_ip(headers);
    let agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    format!("ip:{}:{}", ip, fingerprint(agent))
}

/// Whether the request carries a Bearer credential at all.
pub fn is_authenticated(headers: &HeaderMap) -> bool {
    bearer_token(headers).is_some()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// Client IP from proxy headers: first entry of `x-forwarded-for`, then
/// `x-real-ip`, then a fixed placeholder.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}

/// Deterministic, non-cryptographic fingerprint of an arbitrary string,
/// rendered in base 36. The empty string maps to a fixed value, never null.
pub fn fingerprint(input: &str) -> String {
    let mut hash: u32 = 0;
    for byte in input.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
    }
    to_base36(hash)
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = String::new();
    while n > 0 {
        out.insert(0, DIGITS[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_token_wins_over_ip() {
        let map = headers(&[
            ("authorization", "Bearer abcdefghijklmnop"),
            ("x-forwarded-for", "192.168.1.1"),
        ]);
        assert_eq!(client_key(&map), "auth:abcdefghij");
    }

    #[test]
    fn anonymous_key_uses_forwarded_ip_and_fingerprint() {
        let map = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("user-agent", "curl/8.0"),
        ]);
        let key = client_key(&map);
        assert!(key.starts_with("ip:203.0.113.7:"));
        assert_eq!(key, client_key(&map));
    }

    #[test]
    fn real_ip_fallback() {
        let map = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&map), "198.51.100.2");
    }

    #[test]
    fn missing_headers_still_produce_a_key() {
        let map = HeaderMap::new();
        assert_eq!(client_key(&map), format!("ip:unknown:{}", fingerprint("")));
    }

    #[test]
    fn empty_user_agent_hashes_to_fixed_value() {
        assert_eq!(fingerprint(""), "0");
    }

    #[test]
    fn fingerprint_is_stable_and_distinguishes_agents() {
        assert_eq!(fingerprint("Mozilla/5.0"), fingerprint("Mozilla/5.0"));
        assert_ne!(fingerprint("Mozilla/5.0"), fingerprint("curl/8.0"));
    }

    #[test]
    fn ip_only_policy_skips_fingerprint() {
        let map = headers(&[("x-forwarded-for", "203.0.113.7")]);
        assert_eq!(resolve(KeyPolicy::IpOnly, &map), "ip:203.0.113.7");
    }
}
