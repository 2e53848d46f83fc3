//! Header normalization.
//!
//! Maps human-authored spreadsheet headers to canonical identifiers: an
//! explicit dictionary entry wins, otherwise the header is transliterated to
//! lowercase ASCII with runs of other characters collapsed to `_`. Collisions
//! within one run get `_2`, `_3`, ... suffixes.

use std::{
    collections::{BTreeMap, HashSet},
    fs::File,
    io::BufReader,
    path::Path,
};

use anyhow::{Context, Result};
use unicode_normalization::UnicodeNormalization;

/// Header text to canonical identifier overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderDictionary {
    entries: BTreeMap<String, String>,
}

impl HeaderDictionary {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Loads a JSON object of `{"Original header": "identifier"}` pairs.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening column map {path:?}"))?;
        let entries: BTreeMap<String, String> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing column map {path:?}"))?;
        Ok(Self { entries })
    }

    /// Returns a dictionary where `overrides` replace entries of `self`.
    pub fn merged_with(&self, overrides: &HeaderDictionary) -> HeaderDictionary {
        let mut entries = self.entries.clone();
        entries.extend(
            overrides
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        HeaderDictionary { entries }
    }

    pub fn lookup(&self, header: &str) -> Option<&str> {
        self.entries
            .get(header)
            .or_else(|| self.entries.get(header.trim()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderDictionary {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnEntry {
    pub source: String,
    pub canonical: String,
}

/// Ordered source header to canonical identifier assignment for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    entries: Vec<ColumnEntry>,
}

impl ColumnMapping {
    pub fn entries(&self) -> &[ColumnEntry] {
        &self.entries
    }

    pub fn canonical_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.canonical.clone()).collect()
    }

    pub fn position(&self, canonical: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.canonical == canonical)
    }

    pub fn contains(&self, canonical: &str) -> bool {
        self.position(canonical).is_some()
    }
}

/// NFKD-decomposes, drops non-ASCII, lowercases and collapses every run of
/// characters outside `[a-z0-9]` into one underscore, trimmed at both ends.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.nfkd().filter(char::is_ascii) {
        let lowered = ch.to_ascii_lowercase();
        if lowered.is_ascii_lowercase() || lowered.is_ascii_digit() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(lowered);
        } else {
            pending_separator = true;
        }
    }
    slug
}

pub fn normalize(headers: &[String], dictionary: &HeaderDictionary) -> ColumnMapping {
    let mut seen: HashSet<String> = HashSet::with_capacity(headers.len());
    let mut entries = Vec::with_capacity(headers.len());
    for header in headers {
        let base = dictionary
            .lookup(header)
            .map(str::to_string)
            .unwrap_or_else(|| slugify(header));
        let mut candidate = base.clone();
        let mut suffix = 2usize;
        while seen.contains(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        seen.insert(candidate.clone());
        entries.push(ColumnEntry {
            source: header.clone(),
            canonical: candidate,
        });
    }
    ColumnMapping { entries }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn slugify_strips_diacritics_and_punctuation() {
        assert_eq!(slugify("Énergie"), "energie");
        assert_eq!(slugify("  Nbre Panneau / String "), "nbre_panneau_string");
        assert_eq!(slugify("# SWO"), "swo");
        assert_eq!(slugify("Capacité Totale (Batt.)"), "capacite_totale_batt");
        assert_eq!(slugify("a€b"), "ab");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn collisions_receive_numeric_suffixes() {
        let mapping = normalize(&headers(&["A B", "a-b", "a_b"]), &HeaderDictionary::default());
        assert_eq!(mapping.canonical_names(), vec!["a_b", "a_b_2", "a_b_3"]);
    }

    #[test]
    fn dictionary_entries_take_precedence() {
        let dictionary: HeaderDictionary = [("Site", "hts_sn_id"), ("# SWO", "swo")]
            .into_iter()
            .collect();
        let mapping = normalize(&headers(&["# SWO", "Site", "Date Création"]), &dictionary);
        assert_eq!(mapping.canonical_names(), vec!["swo", "hts_sn_id", "date_creation"]);
        assert_eq!(mapping.entries()[1].source, "Site");
    }

    #[test]
    fn overrides_replace_defaults() {
        let defaults: HeaderDictionary = [("SITE", "hts_sn_id")].into_iter().collect();
        let overrides: HeaderDictionary = [("SITE", "site_code")].into_iter().collect();
        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.lookup("SITE"), Some("site_code"));
    }
}
