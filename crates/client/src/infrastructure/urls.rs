//! URL derivation for the chat backend.
//!
//! The websocket endpoint lives on the same host as the HTTP API, so its base
//! is computed from the configured API base instead of being configured twice:
//!
//! - `http://host:3000/api/` → `ws://host:3000`
//! - `https://host/api/` → `wss://host`

use url::Url;

/// Path of the chat socket endpoint, relative to the transport base.
pub const SOCKET_PATH: &str = "/ws";

/// Path of the history endpoint, relative to the API base.
pub const HISTORY_PATH: &str = "chat/messages";

/// Derive the websocket base from the HTTP API base URL.
pub fn transport_base(api_base_url: &str) -> String {
    let trimmed = api_base_url.trim();
    let without_api = trimmed
        .strip_suffix("/api/")
        .or_else(|| trimmed.strip_suffix("/api"))
        .unwrap_or(trimmed);
    let without_api = without_api.trim_end_matches('/');

    if let Some(rest) = without_api.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = without_api.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        without_api.to_string()
    }
}

/// Handshake URL for a chat path: `<ws base>/ws?chatPath=<path>`.
pub fn socket_url(api_base_url: &str, chat_path: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(&format!("{}{}", transport_base(api_base_url), SOCKET_PATH))?;
    url.query_pairs_mut().append_pair("chatPath", chat_path);
    Ok(url.into())
}

/// History URL: `<api base>chat/messages?chatPath=<path>&limit=<limit>`.
pub fn history_url(api_base_url: &str, chat_path: &str, limit: u32) -> Result<Url, url::ParseError> {
    let base = api_base_url.trim();
    let base = if base.ends_with('/') {
        Url::parse(base)?
    } else {
        Url::parse(&format!("{base}/"))?
    };

    let mut url = base.join(HISTORY_PATH)?;
    url.query_pairs_mut()
        .append_pair("chatPath", chat_path)
        .append_pair("limit", &limit.to_string());
    Ok(url)
}
