//! Content quality signals
//!
//! Pure functions over normalized text. The score is a weighted blend of
//! length, printable ratio, token diversity and repetition, mapped onto
//! 0..100.

use std::collections::HashMap;

/// Window length for repetition detection
const REPEAT_WINDOW: usize = 100;
/// Analysis cap; longer documents are sampled from the front
const MAX_ANALYZED_CHARS: usize = 20_000;
/// Length at which the length signal saturates
const FULL_LENGTH: f64 = 2000.0;

/// Raw signals computed from one document
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySignals {
    pub length: usize,
    pub printable_ratio: f64,
    pub distinct_token_ratio: f64,
    pub repetition_ratio: f64,
    pub language: Option<String>,
}

/// Compute signals for a normalized document
pub fn analyze(text: &str) -> QualitySignals {
    let chars: Vec<char> = text.chars().take(MAX_ANALYZED_CHARS).collect();
    let length = text.chars().count();

    let printable_ratio = if chars.is_empty() {
        0.0
    } else {
        let printable = chars.iter().filter(|c| !c.is_control() || **c == '\n' || **c == '\t').count();
        printable as f64 / chars.len() as f64
    };

    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let distinct_token_ratio = if tokens.is_empty() {
        0.0
    } else {
        let distinct: std::collections::HashSet<&str> = tokens.iter().map(String::as_str).collect();
        distinct.len() as f64 / tokens.len() as f64
    };

    QualitySignals {
        length,
        printable_ratio,
        distinct_token_ratio,
        repetition_ratio: repetition_ratio(&chars),
        language: detect_language(&chars),
    }
}

/// Largest fraction of the text covered by any repeated window
fn repetition_ratio(chars: &[char]) -> f64 {
    if chars.len() < REPEAT_WINDOW * 2 {
        return 0.0;
    }

    let mut counts: HashMap<u64, usize> = HashMap::new();
    let mut max_count = 0usize;
    for window in chars.windows(REPEAT_WINDOW) {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        window.hash(&mut hasher);
        let count = counts.entry(hasher.finish()).or_insert(0);
        *count += 1;
        max_count = max_count.max(*count);
    }

    if max_count <= 1 {
        return 0.0;
    }
    ((max_count * REPEAT_WINDOW) as f64 / chars.len() as f64).min(1.0)
}

/// Script-counting language heuristic
fn detect_language(chars: &[char]) -> Option<String> {
    let mut latin = 0usize;
    let mut han = 0usize;
    let mut kana = 0usize;
    let mut hangul = 0usize;
    let mut cyrillic = 0usize;
    let mut letters = 0usize;

    for &c in chars {
        if !c.is_alphabetic() {
            continue;
        }
        letters += 1;
        match c as u32 {
            0x0041..=0x024F => latin += 1,
            0x0400..=0x04FF => cyrillic += 1,
            0x3040..=0x30FF => kana += 1,
            0x3400..=0x9FFF => han += 1,
            0xAC00..=0xD7AF => hangul += 1,
            _ => {}
        }
    }

    if letters < 10 {
        return None;
    }
    let dominant = |n: usize| n * 2 > letters;
    if kana > letters / 10 {
        Some("ja".to_string())
    } else if dominant(hangul) {
        Some("ko".to_string())
    } else if dominant(han) {
        Some("zh".to_string())
    } else if dominant(cyrillic) {
        Some("ru".to_string())
    } else if dominant(latin) {
        Some("en".to_string())
    } else {
        None
    }
}

/// Weighted blend of the signals, 0..100
pub fn quality_score(signals: &QualitySignals) -> f64 {
    let length_factor = (signals.length as f64 / FULL_LENGTH).min(1.0);
    let score = 30.0 * length_factor
        + 20.0 * signals.printable_ratio
        + 25.0 * signals.distinct_token_ratio
        + 25.0 * (1.0 - signals.repetition_ratio);
    score.clamp(0.0, 100.0)
}
