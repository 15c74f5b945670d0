//! Tolerant parsing of the advisor's two-part response.
//!
//! The advisor is asked for `<reasoning>` prose followed by a `<decision>`
//! block holding a fenced JSON array, but real responses deviate: zero-width
//! characters, full-width CJK punctuation, missing tags, prose after the
//! closing fence, naked arrays. Every repair lives in this module and the
//! parse is total: the worst case is the raw text as reasoning plus an
//! empty decision list, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::types::Decision;

static RE_REASONING_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<reasoning>(.*?)</reasoning>").unwrap());
static RE_DECISION_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<decision>(.*?)</decision>").unwrap());
static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```json\s*(\[\s*\{.*?\}\s*\])\s*```").unwrap());
static RE_JSON_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[\s*\{.*?\}\s*\]").unwrap());
static RE_ARRAY_HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[\s*\{").unwrap());
static RE_ARRAY_OPEN_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[\s+\{").unwrap());

/// Strip zero-width code points and the BOM.
pub fn remove_invisible(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
        .collect()
}

/// Fold full-width punctuation and curly quotes to their ASCII forms so the
/// JSON parser has a chance.
pub fn fold_fullwidth(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            '，' => ',',
            '：' => ':',
            '［' | '【' => '[',
            '］' | '】' => ']',
            '｛' => '{',
            '｝' => '}',
            '、' => ',',
            '\u{3000}' => ' ',
            other => other,
        })
        .collect()
}

/// Compact a leading `[ {` to `[{`.
fn compact_array_open(s: &str) -> String {
    RE_ARRAY_OPEN_SPACE.replace(s.trim(), "[{").into_owned()
}

/// Extract the chain-of-thought prose. Priority: the `<reasoning>` tag,
/// then everything before `<decision>` or the first json fence, then the
/// whole content.
fn extract_reasoning(raw: &str) -> String {
    if let Some(m) = RE_REASONING_TAG.captures(raw) {
        return m[1].trim().to_string();
    }
    if let Some(idx) = raw.find("<decision>") {
        if idx > 0 {
            return raw[..idx].trim().to_string();
        }
    }
    if let Some(idx) = raw.find("```json") {
        if idx > 0 {
            return raw[..idx].trim().to_string();
        }
    }
    raw.trim().to_string()
}

/// Pull the decision JSON array text out of the (already sanitized)
/// content, or None when nothing array-shaped is present.
fn extract_decision_json(sanitized: &str) -> Option<String> {
    let body = match RE_DECISION_TAG.captures(sanitized) {
        Some(m) => m[1].trim().to_string(),
        None => sanitized.to_string(),
    };
    // Sanitize again: tags sometimes wrap still-dirty content pasted from
    // another model turn.
    let body = fold_fullwidth(&body);

    let json = if let Some(m) = RE_JSON_FENCE.captures(&body) {
        m[1].trim().to_string()
    } else {
        RE_JSON_ARRAY.find(&body)?.as_str().trim().to_string()
    };

    let json = compact_array_open(&json);
    Some(fold_fullwidth(&json))
}

/// Parse the raw assistant content into (reasoning, decisions).
///
/// Never fails: unparseable decision sections yield an empty list and the
/// best-effort reasoning string.
pub fn parse_response(raw: &str) -> (String, Vec<Decision>) {
    let mut reasoning = extract_reasoning(raw);

    let sanitized = fold_fullwidth(&remove_invisible(raw));
    let sanitized = sanitized.trim();

    let decisions = match extract_decision_json(sanitized) {
        Some(json) => {
            if RE_ARRAY_HEAD.is_match(&json) {
                match serde_json::from_str::<Vec<Decision>>(&json) {
                    Ok(ds) => ds,
                    Err(e) => {
                        warn!(error = %e, content = %json, "decision JSON failed to deserialize");
                        Vec::new()
                    }
                }
            } else {
                warn!(content = %json, "decision body does not open with [{{");
                Vec::new()
            }
        }
        None => Vec::new(),
    };

    if decisions.is_empty() && reasoning.is_empty() {
        reasoning = "Failed to parse advisor response.".to_string();
    }

    (reasoning, decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DecisionAction;

    const WELL_FORMED: &str = r#"<reasoning>
BTC is coiling under resistance with rising OI.
</reasoning>
<decision>
```json
[{"symbol": "BTCUSDT", "action": "open_long", "leverage": 10,
  "position_size_usd": 500, "stop_loss": 19500, "take_profit": 21000,
  "confidence": 72, "reasoning": "breakout setup"}]
```
</decision>"#;

    #[test]
    fn parses_well_formed_response() {
        let (reasoning, decisions) = parse_response(WELL_FORMED);
        assert!(reasoning.contains("coiling under resistance"));
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, DecisionAction::OpenLong);
        assert_eq!(decisions[0].position_size_usd, 500.0);
    }

    #[test]
    fn strips_zero_width_and_bom() {
        let dirty = format!("\u{FEFF}{}\u{200B}", WELL_FORMED);
        let (_, decisions) = parse_response(&dirty);
        assert_eq!(decisions.len(), 1);
    }

    #[test]
    fn folds_fullwidth_punctuation() {
        // Spec seed scenario 5: full-width commas, curly quotes, trailing
        // prose after the fence.
        let raw = "<reasoning>watching flows</reasoning>\n<decision>\n```json\n[{\u{201C}symbol\u{201D}\u{FF1A}\u{201C}ETHUSDT\u{201D}\u{FF0C}\u{201C}action\u{201D}\u{FF1A}\u{201C}close_long\u{201D}}]\n```\n</decision>\nI will keep monitoring the market.";
        let (reasoning, decisions) = parse_response(raw);
        assert_eq!(reasoning, "watching flows");
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "ETHUSDT");
        assert_eq!(decisions[0].action, DecisionAction::CloseLong);
    }

    #[test]
    fn fullwidth_brackets_fold() {
        assert_eq!(fold_fullwidth("［｛：，｝］【】、\u{3000}"), "[{:,}][], ");
    }

    #[test]
    fn missing_tags_fall_back_to_fence() {
        let raw = "Thinking about the regime first.\n```json\n[{\"symbol\":\"BTCUSDT\",\"action\":\"wait\"}]\n```";
        let (reasoning, decisions) = parse_response(raw);
        assert_eq!(reasoning, "Thinking about the regime first.");
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, DecisionAction::Wait);
    }

    #[test]
    fn naked_array_without_fence() {
        let raw = "No strong edge today.\n<decision>[ {\"symbol\":\"SOLUSDT\",\"action\":\"hold\"} ]</decision>";
        let (_, decisions) = parse_response(raw);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action, DecisionAction::Hold);
    }

    #[test]
    fn compacts_spaced_array_open() {
        assert_eq!(compact_array_open("[ \n {\"a\":1}]"), "[{\"a\":1}]");
        assert_eq!(compact_array_open("[{\"a\":1}]"), "[{\"a\":1}]");
    }

    #[test]
    fn unparseable_body_keeps_reasoning() {
        let raw = "<reasoning>chop, no trade</reasoning>\n<decision>not json at all</decision>";
        let (reasoning, decisions) = parse_response(raw);
        assert_eq!(reasoning, "chop, no trade");
        assert!(decisions.is_empty());
    }

    #[test]
    fn empty_input_yields_placeholder_reasoning() {
        let (reasoning, decisions) = parse_response("");
        assert!(decisions.is_empty());
        assert!(!reasoning.is_empty());
    }

    #[test]
    fn plain_prose_becomes_reasoning() {
        let raw = "Market is untradeable, sitting out this cycle.";
        let (reasoning, decisions) = parse_response(raw);
        assert_eq!(reasoning, raw);
        assert!(decisions.is_empty());
    }

    #[test]
    fn array_of_non_objects_is_rejected() {
        let raw = "<decision>[1, 2, 3]</decision>";
        let (_, decisions) = parse_response(raw);
        assert!(decisions.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"<decision>[{"symbol":"BTCUSDT","action":"wait","galaxy_brain_score":11}]</decision>"#;
        let (_, decisions) = parse_response(raw);
        assert_eq!(decisions.len(), 1);
    }

    #[test]
    fn multiple_decisions_keep_order() {
        let raw = r#"<decision>[
            {"symbol":"BTCUSDT","action":"close_long"},
            {"symbol":"ETHUSDT","action":"open_short","stop_loss":2100,"take_profit":1900,"position_size_usd":300}
        ]</decision>"#;
        let (_, decisions) = parse_response(raw);
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].symbol, "BTCUSDT");
        assert_eq!(decisions[1].action, DecisionAction::OpenShort);
    }
}
