//! Filename helpers for target names coming from the outside world.
//!
//! Target names end up in lock, fragment and artifact file names, so anything
//! a filesystem would reject is replaced before it gets there.

use sha2::{Digest, Sha256};

/// Characters rejected by at least one mainstream filesystem.
const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Device names Windows refuses as file stems.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make `name` safe to embed in a file name on every platform.
///
/// Runs of control or forbidden characters collapse into one `_`, leading
/// and trailing dots/spaces are trimmed, reserved device names get a `_`
/// prefix, and an empty result becomes `unnamed`.
///
/// ```
/// use live_rec::utils::filename::sanitize_component;
///
/// assert_eq!(sanitize_component("a/b"), "a_b");
/// assert_eq!(sanitize_component("  "), "unnamed");
/// assert_eq!(sanitize_component("nul"), "_nul");
/// ```
pub fn sanitize_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_control() || FORBIDDEN.contains(&c) {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if RESERVED_STEMS
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
    {
        return format!("_{trimmed}");
    }

    trimmed.to_string()
}

/// Marks a key that carries a digest of the raw name.
const DIGEST_SEPARATOR: char = '~';

/// File-name key for a target name; distinct names get distinct keys.
///
/// A name that [`sanitize_component`] leaves alone is its own key. Any other
/// name is sanitized and suffixed with `~` and a digest of the raw name, so
/// `a/b` and `a_b` never share a lock or fragment directory.
///
/// ```
/// use live_rec::utils::filename::target_key;
///
/// assert_eq!(target_key("alice"), "alice");
/// assert_ne!(target_key("a/b"), target_key("a_b"));
/// assert!(target_key("a/b").starts_with("a_b~"));
/// ```
pub fn target_key(name: &str) -> String {
    let sanitized = sanitize_component(name);
    if sanitized == name && !name.contains(DIGEST_SEPARATOR) {
        return sanitized;
    }
    let digest = Sha256::digest(name.as_bytes());
    format!("{sanitized}{DIGEST_SEPARATOR}{}", hex::encode(&digest[..6]))
}
