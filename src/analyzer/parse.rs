use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Fields recovered from a reasoning reply before context filtering. Any
/// subset may be present; the analyzer decides what is usable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedVerdict {
    pub score: Option<f64>,
    pub reason: Option<String>,
    pub policy_ids: Vec<i32>,
    pub subpolicy_ids: Vec<i32>,
    pub compliance_ids: Vec<i32>,
}

impl ParsedVerdict {
    fn is_vacant(&self) -> bool {
        self.score.is_none()
            && self.reason.is_none()
            && self.policy_ids.is_empty()
            && self.subpolicy_ids.is_empty()
            && self.compliance_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// The reply was (or contained) a well-formed JSON object with a score.
    Parsed(ParsedVerdict),
    /// Only fragments were recovered, by JSON extraction or prose scraping.
    PartiallyParsed(ParsedVerdict),
    Unparseable,
}

/// Three-stage tolerant parse of a reasoning reply: strict JSON first, then
/// JSON extracted from fenced blocks or balanced braces, then key/value
/// scraping of prose. Models drift; discarding a recoverable verdict costs a
/// repeat reasoning call on the next run.
pub fn parse_reply(reply: &str) -> ParseOutcome {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return ParseOutcome::Unparseable;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            let verdict = extract_verdict(&value);
            if !verdict.is_vacant() {
                return classify(verdict);
            }
        }
    }

    if let Some(embedded) = fenced_json(trimmed).or_else(|| balanced_object(trimmed)) {
        if let Ok(value) = serde_json::from_str::<Value>(&embedded) {
            let verdict = extract_verdict(&value);
            if !verdict.is_vacant() {
                return classify(verdict);
            }
        }
    }

    let scraped = scrape_prose(trimmed);
    if scraped.is_vacant() {
        ParseOutcome::Unparseable
    } else {
        ParseOutcome::PartiallyParsed(scraped)
    }
}

fn classify(verdict: ParsedVerdict) -> ParseOutcome {
    if verdict.score.is_some() && verdict.reason.is_some() {
        ParseOutcome::Parsed(verdict)
    } else {
        ParseOutcome::PartiallyParsed(verdict)
    }
}

fn extract_verdict(value: &Value) -> ParsedVerdict {
    let score = pick(value, &["relevance_score", "score", "relevance"])
        .and_then(number_like);
    let reason = pick(value, &["reason", "relevance_reason", "explanation", "justification"])
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    ParsedVerdict {
        score,
        reason,
        policy_ids: ids_from(value, &["matched_policies", "matched_policy_ids", "policy_ids"]),
        subpolicy_ids: ids_from(
            value,
            &["matched_subpolicies", "matched_subpolicy_ids", "subpolicy_ids"],
        ),
        compliance_ids: ids_from(
            value,
            &["matched_compliances", "matched_compliance_ids", "compliance_ids"],
        ),
    }
}

fn pick<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(k))
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn ids_from(value: &Value, keys: &[&str]) -> Vec<i32> {
    let Some(array) = pick(value, keys).and_then(Value::as_array) else {
        return Vec::new();
    };
    array.iter().filter_map(id_like).collect()
}

/// Id elements tolerate plain ints, numeric strings, and wrapper objects
/// keyed any of the ways models echo the prompt tags back.
fn id_like(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => ["ComplianceId", "compliance_id", "PolicyId", "SubPolicyId", "id"]
            .iter()
            .find_map(|k| map.get(*k))
            .and_then(id_like),
        _ => None,
    }
}

static FENCED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("static regex")
});

fn fenced_json(text: &str) -> Option<String> {
    FENCED.captures(text).map(|c| c[1].to_string())
}

/// First balanced top-level JSON object in the text, string-aware so braces
/// inside quoted reasons do not break the depth count.
fn balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

static SCORE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:relevance[_ ]score|score)"?\s*[:=]\s*"?([0-9]*\.?[0-9]+)"#)
        .expect("static regex")
});
static REASON_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:reason|explanation)"?\s*[:=]\s*"?([^"\n]+)"#)
        .expect("static regex")
});
static COMPLIANCE_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)matched[_ ]compliance(?:s|_ids)?\D*\[([^\]]*)\]")
        .expect("static regex")
});
static POLICY_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)matched[_ ]polic(?:ies|y_ids)\D*\[([^\]]*)\]")
        .expect("static regex")
});
static SUBPOLICY_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)matched[_ ]subpolic(?:ies|y_ids)\D*\[([^\]]*)\]")
        .expect("static regex")
});

fn scrape_prose(text: &str) -> ParsedVerdict {
    let score = SCORE_LINE
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok());
    let reason = REASON_LINE
        .captures(text)
        .map(|c| c[1].trim().trim_end_matches(&[',', '"', '}'][..]).trim().to_string())
        .filter(|s| !s.is_empty());

    ParsedVerdict {
        score,
        reason,
        policy_ids: scrape_ids(&POLICY_LIST, text),
        subpolicy_ids: scrape_ids(&SUBPOLICY_LIST, text),
        compliance_ids: scrape_ids(&COMPLIANCE_LIST, text),
    }
}

fn scrape_ids(pattern: &Regex, text: &str) -> Vec<i32> {
    pattern
        .captures(text)
        .map(|c| {
            c[1].split(',')
                .filter_map(|part| part.trim().trim_matches('"').parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_parses() {
        let reply = r#"{"relevance_score": 0.85, "reason": "Covers rotation.",
            "matched_compliances": [30, 31]}"#;
        match parse_reply(reply) {
            ParseOutcome::Parsed(v) => {
                assert_eq!(v.score, Some(0.85));
                assert_eq!(v.compliance_ids, vec![30, 31]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn fenced_block_is_extracted() {
        let reply = "Here is my assessment:\n```json\n{\"relevance_score\": 0.7, \
            \"reason\": \"Related policy.\", \"matched_compliances\": []}\n```\nDone.";
        assert!(matches!(parse_reply(reply), ParseOutcome::Parsed(_)));
    }

    #[test]
    fn balanced_object_survives_braces_in_strings() {
        let reply = "Sure. {\"relevance_score\": 0.6, \"reason\": \"see {section 4}\", \
            \"matched_compliances\": [30]} hope that helps";
        match parse_reply(reply) {
            ParseOutcome::Parsed(v) => assert_eq!(v.reason.as_deref(), Some("see {section 4}")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn id_shapes_are_tolerated() {
        let reply = r#"{"relevance_score": "0.9", "reason": "ok",
            "matched_compliances": [1, "2", {"ComplianceId": 3}, {"id": "4"}]}"#;
        match parse_reply(reply) {
            ParseOutcome::Parsed(v) => {
                assert_eq!(v.score, Some(0.9));
                assert_eq!(v.compliance_ids, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn prose_is_scraped_as_partial() {
        let reply = "The relevance_score: 0.75 because reason: strong overlap.\n\
            matched_compliances: [30, 31]";
        match parse_reply(reply) {
            ParseOutcome::PartiallyParsed(v) => {
                assert_eq!(v.score, Some(0.75));
                assert_eq!(v.compliance_ids, vec![30, 31]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn json_without_reason_is_partial() {
        let reply = r#"{"relevance_score": 0.5, "matched_compliances": []}"#;
        assert!(matches!(parse_reply(reply), ParseOutcome::PartiallyParsed(_)));
    }

    #[test]
    fn garbage_is_unparseable() {
        assert_eq!(parse_reply("I cannot help with that."), ParseOutcome::Unparseable);
        assert_eq!(parse_reply(""), ParseOutcome::Unparseable);
    }
}
