use crate::peer::types::ServerConfig;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

pub const KEY_SEPARATOR: char = '_';

/// Key shared by both participants: the two identities sorted and joined,
/// so either side derives the same record id on its own. Only unique for
/// identities that pass [`is_valid_identity`].
pub fn session_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}{KEY_SEPARATOR}{hi}")
}

/// Non-empty and free of the key separator, so no two pairs share a key.
pub fn is_valid_identity(id: &str) -> bool {
    !id.trim().is_empty() && !id.contains(KEY_SEPARATOR)
}

/// Prefix an ICE server url with its scheme when the user left it out.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
