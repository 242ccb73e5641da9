use serde_json::Value;

use crate::error::{Error, Result};

/// Extracts the JSON payload from a model reply.
///
/// Models are asked for bare JSON but routinely wrap it in markdown fences
/// or lead with prose; parsing tries the raw text first, then a ```json
/// fence, then the outermost brace span.
pub struct ResponseParser;

impl ResponseParser {
    pub fn new() -> Self {
        Self
    }

    pub fn extract_json(&self, text: &str) -> Result<Value> {
        let trimmed = text.trim();

        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Ok(value);
        }

        if let Some(fenced) = self.extract_fenced(trimmed) {
            if let Ok(value) = serde_json::from_str::<Value>(&fenced) {
                return Ok(value);
            }
        }

        if let Some(span) = self.extract_brace_span(trimmed) {
            if let Ok(value) = serde_json::from_str::<Value>(span) {
                return Ok(value);
            }
        }

        Err(Error::Parse(format!(
            "response is not valid JSON: {}",
            preview(trimmed)
        )))
    }

    fn extract_fenced(&self, text: &str) -> Option<String> {
        let start = text.find("```json").map(|pos| pos + 7).or_else(|| {
            // Plain fence without a language tag.
            text.find("```").map(|pos| pos + 3)
        })?;
        let rest = &text[start..];
        let end = rest.find("```")?;
        Some(rest[..end].trim().to_string())
    }

    fn extract_brace_span<'a>(&self, text: &'a str) -> Option<&'a str> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end > start {
            Some(&text[start..=end])
        } else {
            None
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(120)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let parser = ResponseParser::new();
        let value = parser.extract_json(r#"{"headline": "Markets rallied"}"#).unwrap();
        assert_eq!(value["headline"], "Markets rallied");
    }

    #[test]
    fn parses_fenced_json() {
        let parser = ResponseParser::new();
        let reply = "Here is the report:\n```json\n{\"period\": \"2025-Q2\"}\n```\nDone.";
        let value = parser.extract_json(reply).unwrap();
        assert_eq!(value["period"], "2025-Q2");
    }

    #[test]
    fn parses_fence_without_language_tag() {
        let parser = ResponseParser::new();
        let reply = "```\n{\"period\": \"2025-Q1\"}\n```";
        let value = parser.extract_json(reply).unwrap();
        assert_eq!(value["period"], "2025-Q1");
    }

    #[test]
    fn recovers_json_embedded_in_prose() {
        let parser = ResponseParser::new();
        let reply = "Sure! {\"headline\": \"Rates held\", \"sources\": []} hope that helps";
        let value = parser.extract_json(reply).unwrap();
        assert_eq!(value["headline"], "Rates held");
    }

    #[test]
    fn rejects_non_json_reply() {
        let parser = ResponseParser::new();
        let result = parser.extract_json("I cannot produce a report right now.");
        assert!(matches!(result, Err(Error::Parse(_))));
    }
}
