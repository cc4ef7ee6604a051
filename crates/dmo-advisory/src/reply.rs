//! Turning free-form service replies into an [`Assessment`]
//!
//! Replies arrive in a handful of envelope shapes and the assessment itself
//! may be bare JSON, JSON inside a fenced block, or JSON embedded in prose.
//! Anything unparseable is kept as the narrative of a cautious assessment.

use dmo_core::advisory::{Assessment, Recommendation, RiskLevel};
use serde_json::Value;

/// Pull the reply text out of a message response envelope.
///
/// Checks `response`, `message`, `content`, `text`, then the first of
/// `choices` (`message.content` or `text`). Falls back to the raw body.
pub(crate) fn extract_text(body: &Value) -> String {
    for field in ["response", "message", "content", "text"] {
        if let Some(value) = body.get(field) {
            return as_text(value);
        }
    }
    if let Some(choice) = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        if let Some(message) = choice.get("message") {
            return message.get("content").map(as_text).unwrap_or_default();
        }
        if let Some(text) = choice.get("text") {
            return as_text(text);
        }
    }
    body.to_string()
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// First JSON object found in `text`
pub(crate) fn find_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    let (start, end) = (trimmed.find('{')?, trimmed.rfind('}')?);
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Interpret a reply. Missing or unknown fields degrade to `MEDIUM` risk
/// and a `DENY` recommendation; the narrative falls back to the raw text.
pub(crate) fn parse_assessment(text: &str) -> Assessment {
    let Some(json) = find_json(text) else {
        tracing::warn!("Advisory reply carried no JSON; treating it as narrative only");
        return cautious(text);
    };

    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| json.get(*n).and_then(Value::as_str))
            .map(str::trim)
            .map(str::to_ascii_uppercase)
    };
    let risk_level = match field(&["risk_level", "risk"]).as_deref() {
        Some("LOW") => RiskLevel::Low,
        Some("HIGH") => RiskLevel::High,
        _ => RiskLevel::Medium,
    };
    let recommendation = match field(&["recommendation", "decision"]).as_deref() {
        Some("APPROVE") => Recommendation::Approve,
        _ => Recommendation::Deny,
    };
    let narrative = ["narrative", "summary", "reasoning"]
        .iter()
        .find_map(|n| json.get(*n).and_then(Value::as_str))
        .map_or_else(|| text.trim().to_string(), str::to_string);

    Assessment {
        risk_level,
        recommendation,
        narrative,
    }
}

fn cautious(text: &str) -> Assessment {
    Assessment {
        risk_level: RiskLevel::Medium,
        recommendation: Recommendation::Deny,
        narrative: text.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_extract_text_envelopes() {
        assert_eq!(extract_text(&json!({"response": "a"})), "a");
        assert_eq!(extract_text(&json!({"content": "c", "text": "t"})), "c");
        assert_eq!(
            extract_text(&json!({"choices": [{"message": {"content": "m"}}]})),
            "m"
        );
        assert_eq!(extract_text(&json!({"choices": [{"text": "t"}]})), "t");
        assert_eq!(extract_text(&json!({"other": 1})), r#"{"other":1}"#);
    }

    #[test]
    fn test_parse_bare_json() {
        let a = parse_assessment(
            r#"{"risk_level": "low", "recommendation": "APPROVE", "narrative": "fine"}"#,
        );
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert_eq!(a.recommendation, Recommendation::Approve);
        assert_eq!(a.narrative, "fine");
    }

    #[test]
    fn test_parse_fenced_json() {
        let reply = "Here is my view:\n```json\n{\"risk_level\": \"HIGH\", \"recommendation\": \"DENY\", \"narrative\": \"orders has rows\"}\n```\nThanks.";
        let a = parse_assessment(reply);
        assert_eq!(a.risk_level, RiskLevel::High);
        assert_eq!(a.recommendation, Recommendation::Deny);
        assert_eq!(a.narrative, "orders has rows");
    }

    #[test]
    fn test_parse_embedded_json() {
        let reply = r#"Assessment follows {"risk": "LOW", "decision": "approve"} end"#;
        let a = parse_assessment(reply);
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert_eq!(a.recommendation, Recommendation::Approve);
        // No narrative field: the whole reply is kept
        assert_eq!(a.narrative, reply);
    }

    #[test]
    fn test_unparseable_reply_is_cautious() {
        let a = parse_assessment("  Looks fine to me.  ");
        assert_eq!(a.risk_level, RiskLevel::Medium);
        assert_eq!(a.recommendation, Recommendation::Deny);
        assert_eq!(a.narrative, "Looks fine to me.");
    }

    #[test]
    fn test_unknown_values_degrade() {
        let a = parse_assessment(r#"{"risk_level": "SEVERE", "recommendation": "MAYBE"}"#);
        assert_eq!(a.risk_level, RiskLevel::Medium);
        assert_eq!(a.recommendation, Recommendation::Deny);
    }
}
