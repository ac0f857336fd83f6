//! Trigger detection and the anti-spam heuristic.
//!
//! Both functions are pure: they keep no state between calls and only look at
//! the message text.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

const SVO_PATTERN: &str = "[сСsScC][вВvVB8][оОoO0]+";
const ZOV_PATTERN: &str = "[зЗzZ3][оОoO0]+[8вВvVB]";

lazy_static! {
    static ref SVO: Regex = case_insensitive(SVO_PATTERN, false);
    static ref ZOV: Regex = case_insensitive(ZOV_PATTERN, false);
    static ref SVO_WORD: Regex = case_insensitive(SVO_PATTERN, true);
    static ref ZOV_WORD: Regex = case_insensitive(ZOV_PATTERN, true);
}

fn case_insensitive(pattern: &str, whole: bool) -> Regex {
    let source = if whole {
        format!("(?i)^{pattern}$")
    } else {
        format!("(?i){pattern}")
    };
    Regex::new(&source).expect("trigger patterns are valid regular expressions")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Svo,
    Zov,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 2] = [TriggerKind::Svo, TriggerKind::Zov];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Svo => "svo",
            TriggerKind::Zov => "zov",
        }
    }

    fn regex(self) -> &'static Regex {
        match self {
            TriggerKind::Svo => &SVO,
            TriggerKind::Zov => &ZOV,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Start of the match, in code points.
    pub position: usize,
    pub quote: String,
    /// Match length, in code points.
    pub length: usize,
}

/// Finds every match of both families, ordered by start position.
///
/// Matches never overlap within a family. When a match of each family
/// starts at the same position, the `svo` match comes first.
pub fn find_triggers(text: &str) -> Vec<Trigger> {
    let mut triggers = Vec::new();
    for kind in TriggerKind::ALL {
        for m in kind.regex().find_iter(text) {
            let quote = m.as_str();
            triggers.push(Trigger {
                kind,
                position: text[..m.start()].chars().count(),
                quote: quote.to_string(),
                length: quote.chars().count(),
            });
        }
    }
    // Stable: ties keep family order.
    triggers.sort_by_key(|t| t.position);
    triggers
}

/// Step-function spam policy over the message length in code points.
pub fn is_spam(match_count: usize, matched_len: usize, text_len: usize) -> bool {
    let more_than = |max: usize| match_count > max;
    let mass_exceeds = |coef: f64| coef * matched_len as f64 > text_len as f64;

    match text_len {
        1..=10 => more_than(1),
        11..=20 => more_than(2),
        21..=30 => more_than(3),
        31..=50 => mass_exceeds(2.3),
        51..=100 => more_than(7) && mass_exceeds(3.3),
        101..=250 => more_than(10) && mass_exceeds(5.3),
        251..=1000 => more_than(15) && mass_exceeds(11.0),
        _ => more_than(30) && mass_exceeds(25.0),
    }
}

/// Whether a message reads like prose rather than trigger spam.
///
/// Needs at least five words unrelated to either pattern, at most two words
/// that are whole matches and at most two more that merely contain one.
pub fn is_ai_respondable(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < 5 {
        return false;
    }

    let mut exact = 0;
    let mut containing = 0;
    let mut normal = 0;
    for word in words {
        let word = word.to_lowercase();
        if SVO_WORD.is_match(&word) || ZOV_WORD.is_match(&word) {
            exact += 1;
        } else if SVO.is_match(&word) || ZOV.is_match(&word) {
            containing += 1;
        } else {
            normal += 1;
        }
    }

    normal >= 5 && exact <= 2 && containing <= 2
}
