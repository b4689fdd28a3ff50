//! Connection persistence rules for HTTP/1.x responses.

use http::header::{HeaderMap, HeaderName, CONNECTION};
use http::Version;

/// Non-standard `Proxy-Connection` header, still sent by some clients and servers.
pub static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

const CLOSE: &str = "close";
const KEEP_ALIVE: &str = "keep-alive";

/// Whether any value of `name` carries `token` in its comma-separated list,
/// compared case-insensitively.
fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Decide whether a connection must be closed once the current exchange ends.
///
/// - `Connection: close` closes.
/// - HTTP/1.0 (and older) closes unless `Connection: keep-alive` is present.
/// - `Proxy-Connection: close` closes, whatever the version.
/// - Otherwise HTTP/1.1 connections persist.
pub fn should_close_connection(version: Version, headers: &HeaderMap) -> bool {
    if has_token(headers, &CONNECTION, CLOSE) {
        return true;
    }

    if (version == Version::HTTP_10 || version == Version::HTTP_09)
        && !has_token(headers, &CONNECTION, KEEP_ALIVE)
    {
        return true;
    }

    has_token(headers, &PROXY_CONNECTION, CLOSE)
}
