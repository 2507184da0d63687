//! Tolerant extraction of structured outputs from model text.
//!
//! Generation responses embed a JSON array of moment objects somewhere in a
//! prose answer; refinement responses embed a single JSON object. The
//! scanners below find balanced candidates and take the first one that
//! parses, dropping invalid entries rather than failing the stage.

use serde_json::Value;
use tracing::debug;

use super::types::{MomentCandidate, RefinementWindow};
use crate::{Error, Result};

/// Extract the first well-formed moment array from model output.
///
/// Entries missing fields or with `start_time >= end_time` are dropped. An
/// empty array is a valid zero-moment answer.
pub fn extract_moment_array(text: &str) -> Result<Vec<MomentCandidate>> {
    for span in balanced_spans(text, '[', ']') {
        let Ok(value) = serde_json::from_str::<Value>(span) else {
            continue;
        };
        let Some(items) = value.as_array() else {
            continue;
        };
        // An array of scalars in surrounding prose (e.g. a citation) is not
        // the moment list; keep scanning.
        if !items.is_empty() && !items.iter().any(|item| item.is_object()) {
            continue;
        }

        let mut moments = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<MomentCandidate>(item.clone()) {
                Ok(candidate) if candidate.start_time < candidate.end_time => {
                    moments.push(candidate);
                }
                Ok(candidate) => {
                    debug!(
                        start = candidate.start_time,
                        end = candidate.end_time,
                        "Dropping moment with inverted window"
                    );
                }
                Err(e) => {
                    debug!(error = %e, "Dropping malformed moment entry");
                }
            }
        }
        return Ok(moments);
    }

    Err(Error::InferenceParse(
        "no JSON moment array found in model output".to_string(),
    ))
}

/// Parse a refinement response: the first JSON object carrying a valid
/// `{start_time, end_time}` window.
pub fn parse_refinement(text: &str) -> Result<RefinementWindow> {
    for span in balanced_spans(text, '{', '}') {
        let Ok(window) = serde_json::from_str::<RefinementWindow>(span) else {
            continue;
        };
        if window.start_time >= window.end_time {
            return Err(Error::InferenceParse(format!(
                "refinement window inverted: [{}, {}]",
                window.start_time, window.end_time
            )));
        }
        return Ok(window);
    }

    Err(Error::InferenceParse(
        "no JSON refinement object found in model output".to_string(),
    ))
}

/// Spans of `text` starting at each `open` and ending at the matching
/// `close`, respecting JSON string literals and escapes.
fn balanced_spans(text: &str, open: char, close: char) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();

    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(open) {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;

        for (idx, &byte) in bytes.iter().enumerate().skip(start) {
            let ch = byte as char;
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                c if c == open && !in_string => depth += 1,
                c if c == close && !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        spans.push(&text[start..=idx]);
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_array_from_prose() {
        let text = r#"Sure! Here are the best moments:
[
  {"start_time": 12.5, "end_time": 45.0, "title": "Opening rally"},
  {"start_time": 60.0, "end_time": 75.5, "title": "Crowd reaction"}
]
Let me know if you need more."#;
        let moments = extract_moment_array(text).unwrap();
        assert_eq!(moments.len(), 2);
        assert_eq!(moments[0].title, "Opening rally");
        assert_eq!(moments[1].start_time, 60.0);
    }

    #[test]
    fn test_reparse_yields_equal_lists() {
        let text = r#"[{"start_time": 1.0, "end_time": 2.0, "title": "a"}]"#;
        assert_eq!(
            extract_moment_array(text).unwrap(),
            extract_moment_array(text).unwrap()
        );
    }

    #[test]
    fn test_invalid_entries_dropped_not_fatal() {
        let text = r#"[
  {"start_time": 5.0, "end_time": 3.0, "title": "inverted"},
  {"start_time": 1.0, "title": "missing end"},
  {"start_time": 1.0, "end_time": 2.0, "title": "valid"}
]"#;
        let moments = extract_moment_array(text).unwrap();
        assert_eq!(moments.len(), 1);
        assert_eq!(moments[0].title, "valid");
    }

    #[test]
    fn test_empty_array_is_zero_moments() {
        assert!(extract_moment_array("The video has no highlights: []").unwrap().is_empty());
    }

    #[test]
    fn test_scalar_array_in_prose_is_skipped() {
        let text = r#"As noted in [1, 2], the moments are
[{"start_time": 1.0, "end_time": 2.0, "title": "t"}]"#;
        let moments = extract_moment_array(text).unwrap();
        assert_eq!(moments.len(), 1);
    }

    #[test]
    fn test_no_array_is_parse_error() {
        let err = extract_moment_array("I could not find any moments.").unwrap_err();
        assert!(matches!(err, Error::InferenceParse(_)));
    }

    #[test]
    fn test_brackets_inside_strings_do_not_confuse_scanner() {
        let text = r#"[{"start_time": 1.0, "end_time": 2.0, "title": "goal [replay]"}]"#;
        let moments = extract_moment_array(text).unwrap();
        assert_eq!(moments[0].title, "goal [replay]");
    }

    #[test]
    fn test_parse_refinement_object() {
        let window =
            parse_refinement(r#"Refined: {"start_time": 13.25, "end_time": 44.75}"#).unwrap();
        assert_eq!(window.start_time, 13.25);
        assert_eq!(window.end_time, 44.75);
    }

    #[test]
    fn test_parse_refinement_inverted_window_fails() {
        let err = parse_refinement(r#"{"start_time": 50.0, "end_time": 10.0}"#).unwrap_err();
        assert!(matches!(err, Error::InferenceParse(_)));
    }

    #[test]
    fn test_parse_refinement_skips_non_matching_objects() {
        let text = r#"{"note": "ok"} then {"start_time": 1.0, "end_time": 2.0}"#;
        let window = parse_refinement(text).unwrap();
        assert_eq!(window.start_time, 1.0);
    }

    #[test]
    fn test_parse_refinement_without_object_fails() {
        assert!(matches!(
            parse_refinement("no json here"),
            Err(Error::InferenceParse(_))
        ));
    }
}
