//! Secret handling utilities.
//!
//! Re-exports secrecy types and keeps credentials out of log lines.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Connection URL with any `user:password@` part masked, safe to log.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => format!("{scheme}://{rest}"),
    }
}
