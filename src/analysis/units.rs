//! Measurement unit vocabulary and fuzzy matching
//!
//! Units printed on a dial ("psi", "kg/cm²", "bar") come back from OCR with
//! dropped or swapped characters, so recognized text is matched against a
//! controlled vocabulary with a combined score: full similarity, best
//! substring similarity, a penalty per character of length difference and a
//! bonus for equal lengths.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::Path;
use strsim::normalized_levenshtein;
use tracing::{debug, info};

/// Remove parenthesized annotations, drop spaces and fold case
pub fn normalize_unit(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('(') {
        match rest[open..].find(')') {
            Some(close) => {
                out.push_str(&rest[..open]);
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Similarity in `[0, 100]`
fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 100.0;
    }
    normalized_levenshtein(a, b) * 100.0
}

/// Best [`ratio`] of the shorter string against every equal-length window of
/// the longer one
fn partial_ratio(a: &str, b: &str) -> f64 {
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let long_chars: Vec<char> = long.chars().collect();
    let n = short.chars().count();
    if n == 0 {
        return if long_chars.is_empty() { 100.0 } else { 0.0 };
    }

    long_chars
        .windows(n)
        .map(|w| ratio(short, &w.iter().collect::<String>()))
        .fold(0.0, f64::max)
}

/// Combined match score of recognized `text` against a vocabulary `unit`
///
/// Similarity is normalized Levenshtein, which is stricter than
/// matching-block (Ratcliff/Obershelp) similarity when characters are
/// missing or substituted: "kg" against "kg/cm2" scores 93.3 here where the block
/// measure gives 110. The accept floor of 80 still separates single-letter
/// slips and truncations from digits and unrelated labels.
pub fn match_score(text: &str, unit: &str) -> f64 {
    let a = normalize_unit(text);
    let b = normalize_unit(unit);
    let len_a = a.chars().count() as f64;
    let len_b = b.chars().count() as f64;

    let mut score = ratio(&a, &b) + partial_ratio(&a, &b) - 10.0 * (len_a - len_b).abs();
    if len_a == len_b {
        score += 20.0;
    }
    score
}

/// Known measurement units
#[derive(Debug, Clone, Default)]
pub struct UnitVocabulary {
    units: BTreeSet<String>,
    min_score: f64,
}

impl UnitVocabulary {
    pub fn new<I, S>(units: I, min_score: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let units = units
            .into_iter()
            .map(|u| strip_annotation(u.as_ref()))
            .filter(|u| !u.is_empty())
            .collect();
        Self { units, min_score }
    }

    /// Load every `.txt` file in `dir`, one unit per line
    pub fn load_dir(dir: &Path, min_score: f64) -> Result<Self> {
        let mut units = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read units directory {:?}", dir))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read units file {:?}", path))?;
            units.extend(content.lines().map(str::to_string));
        }

        let vocabulary = Self::new(units, min_score);
        info!("Loaded {} units from {:?}", vocabulary.len(), dir);
        Ok(vocabulary)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Best vocabulary entry for `text` with its score, if above the floor
    pub fn best_match(&self, text: &str) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for unit in &self.units {
            let score = match_score(text, unit);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((unit.as_str(), score));
            }
        }
        best.filter(|(_, score)| *score > self.min_score)
    }

    /// Highest-scoring unit across all texts recognized in a region
    pub fn detect<'a, I>(&self, texts: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut best: Option<(&str, f64)> = None;
        for text in texts {
            if let Some((unit, score)) = self.best_match(text) {
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((unit, score));
                }
            }
        }
        if let Some((unit, score)) = best {
            debug!("Detected unit {:?} (score {:.1})", unit, score);
        }
        best.map(|(unit, _)| unit.to_string())
    }
}

/// Vocabulary lines keep their spelling but lose parenthesized notes
fn strip_annotation(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}
