//! AN-004: Filesystem-safe names derived from card titles.
//!
//! Titles are user text. Before one becomes a directory or file name it is
//! slugged and suffixed with a BLAKE3 prefix of the raw title, so distinct
//! titles never share a path and no title can escape its parent directory.

use super::error::{AncileError, Result};

const MAX_SLUG_LEN: usize = 48;
const HASH_PREFIX_LEN: usize = 12;

/// Map a title to a path segment: `<slug>-<12 hex>`.
pub fn safe_name(title: &str) -> Result<String> {
    if title.trim().is_empty() {
        return Err(AncileError::InvalidName("title must not be empty".to_string()));
    }

    let mut slug: String = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    // No hidden files, no "." or ".." segments
    slug = slug.trim_start_matches('.').to_string();
    slug.truncate(MAX_SLUG_LEN);
    if slug.is_empty() {
        slug.push('_');
    }

    let digest = blake3::hash(title.as_bytes()).to_hex();
    Ok(format!("{}-{}", slug, &digest[..HASH_PREFIX_LEN]))
}

/// Trim a user-supplied name, rejecting blanks.
pub fn clean_name(raw: &str, what: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AncileError::InvalidName(format!("{} must not be empty", what)));
    }
    Ok(name.to_string())
}
