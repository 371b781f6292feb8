//! Query fingerprinting and class checksums.
//!
//! A fingerprint is the normalized form of a query: literals collapse to
//! `?`, value lists to a single placeholder, whitespace to single spaces,
//! everything lowercased. Queries sharing a fingerprint belong to the
//! same class.
//!
//! The class id is the uppercase of the *last* 16 hex digits of the
//! fingerprint's md5 — the same historical scheme `pt-query-digest`
//! uses, which keeps ids comparable across toolchains.

use regex::Regex;

/// Compiled normalization patterns. Build once per worker, not per query.
pub struct Fingerprinter {
    comments: Regex,
    strings: Regex,
    numbers: Regex,
    value_lists: Regex,
    multi_values: Regex,
    whitespace: Regex,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Fingerprinter {
            comments: Regex::new(r"(?s)/\*.*?\*/|--[^\n]*|#[^\n]*").expect("static regex"),
            // Single- or double-quoted strings, tolerating backslash
            // escapes.
            strings: Regex::new(r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#).expect("static regex"),
            numbers: Regex::new(r"\b\d+(\.\d+)?\b").expect("static regex"),
            value_lists: Regex::new(r"\(\s*\?(\s*,\s*\?)*\s*\)").expect("static regex"),
            multi_values: Regex::new(r"(?i)(values\s*\(\?\+\))(\s*,\s*\(\?\+\))+").expect("static regex"),
            whitespace: Regex::new(r"\s+").expect("static regex"),
        }
    }

    /// Normalizes one query to its fingerprint.
    pub fn fingerprint(&self, query: &str) -> String {
        let q = self.comments.replace_all(query, " ");
        let q = self.strings.replace_all(&q, "?");
        let q = self.numbers.replace_all(&q, "?");
        let q = self.value_lists.replace_all(&q, "(?+)");
        let q = q.to_lowercase();
        let q = self.multi_values.replace_all(&q, "$1");
        let q = self.whitespace.replace_all(&q, " ");
        q.trim().to_string()
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Class id for a fingerprint: uppercase last 16 hex digits of its md5.
pub fn checksum(fingerprint: &str) -> String {
    let digest = format!("{:x}", md5::compute(fingerprint.as_bytes()));
    digest[16..32].to_uppercase()
}
