//! Path to resource address parsing.
//!
//! A resolvable path looks like `:mod1/:mod2/some/resource:`. Leading
//! segments that start with [`MODIFIER_PREFIX`] are modifiers handed to the
//! backend, the trailing [`TERMINAL_MARKER`] asks for the resource to be
//! resolved. A `:nop` segment is accepted anywhere among the modifiers and
//! never reaches the backend.

use crate::error::{Result, RfsError};

pub const MODIFIER_PREFIX: char = ':';
pub const TERMINAL_MARKER: char = ':';
pub const NOP_MODIFIER: &str = ":nop";
pub const SEPARATOR: char = '/';

/// Backend-facing identity of a resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceAddress {
    pub address: String,
    /// Modifier names in path order, without the prefix.
    pub modifiers: Vec<String>,
}

impl ResourceAddress {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut rest = normalize(raw);
        if rest.is_empty() {
            return Err(RfsError::malformed(raw));
        }

        let mut modifiers = Vec::new();
        while rest.starts_with(MODIFIER_PREFIX) {
            // a modifier without a following segment is taken literally
            let Some((head, tail)) = rest.split_once(SEPARATOR) else {
                break;
            };
            if head != NOP_MODIFIER {
                modifiers.push(head[MODIFIER_PREFIX.len_utf8()..].to_string());
            }
            rest = tail;
        }

        let address = rest.strip_suffix(TERMINAL_MARKER).unwrap_or(rest);
        if address.is_empty() {
            return Err(RfsError::malformed(raw));
        }

        Ok(Self {
            address: address.to_string(),
            modifiers,
        })
    }

    /// Canonical terminal path for this address, `:nop` tokens excluded.
    pub fn to_path(&self) -> String {
        let mut path = String::new();
        for modifier in &self.modifiers {
            path.push(MODIFIER_PREFIX);
            path.push_str(modifier);
            path.push(SEPARATOR);
        }
        path.push_str(&self.address);
        path.push(TERMINAL_MARKER);
        path
    }
}

/// Strips the leading separators the kernel side may leave on a path.
pub fn normalize(raw: &str) -> &str {
    raw.trim_start_matches(SEPARATOR)
}

/// Whether looking up `raw` should trigger a resolution.
pub fn is_terminal(raw: &str) -> bool {
    normalize(raw).ends_with(TERMINAL_MARKER)
}

/// Cache key of a path: the normalized path, with the terminal marker added
/// when missing so that `host/page` and `host/page:` name the same entry.
pub fn cache_key(raw: &str) -> String {
    let path = normalize(raw);
    if path.ends_with(TERMINAL_MARKER) {
        path.to_string()
    } else {
        format!("{path}{TERMINAL_MARKER}")
    }
}
