//! # Prefix Formatter Module
//!
//! Template-driven sender prefixes for both relay directions, plus the text
//! helpers shared by the translators (byte-accurate truncation, quoted-line
//! stripping, reaction-quote abbreviation).
//!
//! Mesh → Matrix templates may use `{long}`, `{short}`, `{mesh}` and the
//! truncated forms `{longN}` / `{meshN}` for N in 1..=20. Matrix → mesh
//! templates may use `{display}`, `{user}`, `{username}`, `{server}` and
//! `{displayN}`. A template referencing an unknown variable logs a warning
//! and falls back to the built-in default.

use log::warn;

use crate::config::Config;

/// Default prefix for messages relayed mesh → Matrix.
pub const DEFAULT_MATRIX_PREFIX: &str = "[{long}/{mesh}]: ";
/// Default prefix for messages relayed Matrix → mesh.
pub const DEFAULT_MESHTASTIC_PREFIX: &str = "{display5}[M]: ";

/// Maximum payload bytes for a single text packet on current firmware.
pub const MAX_MESSAGE_BYTES: usize = 227;

/// Maximum characters quoted back when describing a reaction.
const QUOTE_ABBREV_CHARS: usize = 40;

/// Largest supported `{varN}` truncation length.
const MAX_TRUNC_LEN: usize = 20;

/// Render `template`, resolving `{var}` tokens through `lookup`.
///
/// `lookup` receives the bare variable name; truncated forms (`long3`,
/// `display5`, ...) are resolved here by splitting the trailing digits.
/// Returns `Err` with the offending token for unknown variables or
/// unbalanced braces.
fn render_template(
    template: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| "unbalanced '{'".to_string())?;
        let name = &after[..close];
        out.push_str(&resolve_var(name, lookup).ok_or_else(|| name.to_string())?);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve_var(name: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(value) = lookup(name) {
        return Some(value);
    }
    // Truncated form: base name followed by a length, e.g. "long4".
    let digits_at = name.find(|c: char| c.is_ascii_digit())?;
    let (base, digits) = name.split_at(digits_at);
    let n: usize = digits.parse().ok()?;
    if n == 0 || n > MAX_TRUNC_LEN {
        return None;
    }
    let value = lookup(base)?;
    Some(value.chars().take(n).collect())
}

/// Prefix for a message relayed from the mesh into Matrix.
pub fn get_matrix_prefix(
    config: &Config,
    longname: &str,
    shortname: &str,
    meshnet_name: &str,
) -> String {
    if !config.matrix.prefix_enabled {
        return String::new();
    }
    let format = config
        .matrix
        .prefix_format
        .as_deref()
        .unwrap_or(DEFAULT_MATRIX_PREFIX);

    let lookup = |name: &str| -> Option<String> {
        match name {
            "long" => Some(longname.to_string()),
            "short" => Some(shortname.to_string()),
            "mesh" => Some(meshnet_name.to_string()),
            _ => None,
        }
    };

    match render_template(format, &lookup) {
        Ok(prefix) => prefix,
        Err(token) => {
            warn!(
                "Invalid matrix prefix_format '{}': unknown variable '{}'. Using default format.",
                format, token
            );
            render_template(DEFAULT_MATRIX_PREFIX, &lookup).unwrap_or_default()
        }
    }
}

/// Prefix for a message relayed from Matrix onto the mesh.
pub fn get_meshtastic_prefix(
    config: &Config,
    display_name: &str,
    user_id: Option<&str>,
) -> String {
    if !config.meshtastic.prefix_enabled {
        return String::new();
    }
    let format = config
        .meshtastic
        .prefix_format
        .as_deref()
        .unwrap_or(DEFAULT_MESHTASTIC_PREFIX);

    // Split @username:server into its halves when a user id is available.
    let (username, server) = match user_id {
        Some(id) if id.starts_with('@') && id.contains(':') => {
            let rest = &id[1..];
            let (user, srv) = rest.split_once(':').unwrap_or((rest, ""));
            (user.to_string(), srv.to_string())
        }
        _ => (String::new(), String::new()),
    };

    let lookup = |name: &str| -> Option<String> {
        match name {
            "display" => Some(display_name.to_string()),
            "user" => Some(user_id.unwrap_or("").to_string()),
            "username" => Some(username.clone()),
            "server" => Some(server.clone()),
            _ => None,
        }
    };

    match render_template(format, &lookup) {
        Ok(prefix) => prefix,
        Err(token) => {
            warn!(
                "Invalid prefix_format '{}': unknown variable '{}'. Using default format.",
                format, token
            );
            render_template(DEFAULT_MESHTASTIC_PREFIX, &lookup).unwrap_or_default()
        }
    }
}

/// Truncate `text` to at most `max` UTF-8 bytes without splitting a code point.
pub fn truncate_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Truncate to the single-packet payload limit.
pub fn truncate_message(text: &str) -> &str {
    truncate_bytes(text, MAX_MESSAGE_BYTES)
}

/// Remove `>`-quoted lines, joining what remains with spaces.
pub fn strip_quoted_lines(text: &str) -> String {
    let filtered: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect();
    filtered.join(" ").trim().to_string()
}

/// Abbreviate a quoted original for a reaction description: drop quoted
/// lines, flatten newlines, cut at 40 characters with an ellipsis.
pub fn abbreviate_quote(text: &str) -> String {
    let flattened = strip_quoted_lines(text).replace(['\n', '\r'], " ");
    if flattened.chars().count() > QUOTE_ABBREV_CHARS {
        let cut: String = flattened.chars().take(QUOTE_ABBREV_CHARS).collect();
        format!("{}...", cut)
    } else {
        flattened
    }
}
