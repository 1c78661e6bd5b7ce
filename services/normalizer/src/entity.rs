//! Entity Key Normalizer
//!
//! Districts and schools are spelled differently across years and exports
//! ("DENVER COUNTY 1" vs "Denver County 1", "Jefferson County R - 1").
//! Keys are deterministic: trim, collapse whitespace, unify dashes, case-fold.
//! Numbered suffixes such as "County 1" or "RE-1" are part of the identity and
//! are never stripped.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Stable join key for a district or school.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    name: String,
    code: Option<String>,
}

impl EntityKey {
    pub fn new(raw_name: &str, code: Option<&str>) -> Self {
        Self {
            name: normalize(raw_name),
            code: code.map(normalize_code).filter(|c| !c.is_empty()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}#{}", self.name, code),
            None => f.write_str(&self.name),
        }
    }
}

/// Numeric codes lose their leading zeros: a CSV keeps `0880` as text while a
/// workbook stores it as the number 880.
fn normalize_code(raw: &str) -> String {
    let code = raw.trim();
    if !code.is_empty() && code.bytes().all(|b| b.is_ascii_digit()) {
        match code.trim_start_matches('0') {
            "" => "0".to_string(),
            stripped => stripped.to_string(),
        }
    } else {
        code.to_string()
    }
}

/// Trim and collapse runs of whitespace (including line breaks) to one space.
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Display form: whitespace-collapsed, original casing.
pub fn display_form(raw: &str) -> String {
    collapse_whitespace(raw)
}

/// Canonical key text for an entity name.
pub fn normalize(raw_name: &str) -> String {
    let unified: String = collapse_whitespace(raw_name)
        .chars()
        .map(|c| match c {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2212}' => '-',
            other => other,
        })
        .collect();

    // "R - 1" and "R -1" both become "R-1"
    let tightened = unified.replace(" - ", "-").replace(" -", "-").replace("- ", "-");

    tightened
        .to_lowercase()
        .trim_end_matches(['.', ',', ';', ':'])
        .trim_end()
        .to_string()
}

/// Resolves raw names to keys: exact spelling first, then case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    exact: HashMap<(String, Option<String>), EntityKey>,
    folded: BTreeSet<EntityKey>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key for `raw_name`, registering a new entity when nothing matches.
    pub fn resolve(&mut self, raw_name: &str, code: Option<&str>) -> EntityKey {
        let spelled = (display_form(raw_name), code.map(str::to_string));
        if let Some(key) = self.exact.get(&spelled) {
            return key.clone();
        }

        // Case-insensitive phase: the folded key is the canonical one.
        let key = EntityKey::new(raw_name, code);
        self.folded.insert(key.clone());
        self.exact.insert(spelled, key.clone());
        key
    }

    /// Lookup without registering.
    pub fn lookup(&self, raw_name: &str, code: Option<&str>) -> Option<EntityKey> {
        let spelled = (display_form(raw_name), code.map(str::to_string));
        if let Some(key) = self.exact.get(&spelled) {
            return Some(key.clone());
        }
        let key = EntityKey::new(raw_name, code);
        self.folded.contains(&key).then_some(key)
    }

    /// Number of distinct entity keys.
    pub fn len(&self) -> usize {
        self.folded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folded.is_empty()
    }
}
