//! Canonical song identity.
//!
//! A song's identity is a signed 64-bit fingerprint computed from the
//! normalised artist and title. The fingerprint is a pure function of its
//! inputs and stable across processes, so independently running monitors
//! resolve the same observation to the same row.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static NO_PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());
#[allow(clippy::unwrap_used)]
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalise an observed `(artist, title)` pair into the form used both as
/// the catalog search query and as the fingerprint input.
///
/// Lowercases, joins with a single space, folds `" - "` separators, then
/// blanks out anything matched by the station's `blank` filter.
#[must_use]
pub fn normalise(artist: &str, title: &str, blank: Option<&Regex>) -> String {
    let normalised = format!("{artist} {title}").to_lowercase().replace(" - ", " ");
    match blank {
        Some(re) => re.replace_all(&normalised, "").into_owned(),
        None => normalised,
    }
}

/// Fingerprint a normalised artist+title string.
///
/// Strips everything that is not a Unicode word character or whitespace,
/// collapses whitespace runs, and takes the first 8 bytes of the SHA-256
/// digest as a little-endian signed integer.
#[must_use]
pub fn song_key(normalised: &str) -> i64 {
    let stripped = NO_PUNCTUATION.replace_all(normalised, "");
    let collapsed = SPACES.replace_all(&stripped, " ");
    let digest = Sha256::digest(collapsed.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_le_bytes(prefix)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(artist: &str, title: &str) -> i64 {
        song_key(&normalise(artist, title, None))
    }

    #[test]
    fn fingerprint_ignores_case_and_dash_separator() {
        assert_eq!(key("The Beatles", "Hey - Jude"), key("the beatles", "hey jude"));
    }

    #[test]
    fn fingerprint_matches_reference_digest() {
        let digest = Sha256::digest(b"a b");
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        assert_eq!(key("A", "B"), i64::from_le_bytes(prefix));
    }

    #[test]
    fn fingerprint_strips_punctuation() {
        assert_eq!(key("AC/DC", "T.N.T."), key("ACDC", "TNT"));
    }

    #[test]
    fn fingerprint_collapses_whitespace() {
        assert_eq!(key("Daft  Punk", "One\tMore Time"), key("Daft Punk", "One More Time"));
    }

    #[test]
    fn fingerprint_keeps_unicode_word_characters() {
        assert_ne!(key("Björk", "Jóga"), key("Bjrk", "Jga"));
        assert_eq!(key("Björk", "Jóga"), key("björk", "jóga"));
    }

    #[test]
    fn blank_filter_applies_before_fingerprint() {
        let blank = Regex::new(r" \(live\)").unwrap();
        let normalised = normalise("A", "T (live)", Some(&blank));
        assert_eq!(normalised, "a t");
        assert_eq!(song_key(&normalised), key("A", "T"));
    }

    #[test]
    fn normalise_is_used_verbatim_as_search_query() {
        assert_eq!(normalise("The Beatles", "Hey - Jude", None), "the beatles hey jude");
    }
}
