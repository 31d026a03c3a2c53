//! Tagged-section extraction from model responses.
//!
//! Phases require sections like `<narrative>...</narrative>` to appear exactly
//! once.  Missing or duplicated sections are recorded on the validation result
//! so the retry loop can ask the model to regenerate in-format.

use crate::validation::TurnValidation;

/// Extract the content of `<name>...</name>`, recording missing/duplicate
/// errors on `validation`.
///
/// A duplicated opening tag is an error but the first occurrence's content is
/// still returned, so downstream checks can keep collecting their own errors
/// in the same attempt.
pub fn find_section<'a>(
    text: &'a str,
    name: &str,
    validation: &mut TurnValidation,
) -> Option<&'a str> {
    let start_tag = format!("<{name}>");
    let end_tag = format!("</{name}>");
    let start = text.find(&start_tag);

    if let Some(start) = start {
        let body_offset = start + start_tag.len();
        if text[body_offset..].contains(&start_tag) {
            validation.push(format!(
                "The tag \"{name}\" appears multiple times in the answer"
            ));
        }
        if let Some(end) = text[body_offset..].find(&end_tag) {
            return Some(text[body_offset..body_offset + end].trim());
        }
    }
    validation.push(format!("Failed to find \"{name}\" section in the answer"));
    None
}

/// Like [`find_section`], without recording errors.
pub fn find_section_quiet<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let mut scratch = TurnValidation::ok();
    find_section(text, name, &mut scratch)
}

/// Streaming-tolerant variant: returns the section content even when the
/// closing tag hasn't arrived yet (everything after the opening tag).
pub fn find_partial_section<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    if let Some(full) = find_section_quiet(text, name) {
        return Some(full);
    }
    let start_tag = format!("<{name}>");
    let start = text.find(&start_tag)?;
    let body = &text[start + start_tag.len()..];
    match body.find(&format!("</{name}>")) {
        Some(end) => Some(&body[..end]),
        None => Some(body),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_section_content_trimmed() {
        let mut v = TurnValidation::ok();
        let text = "<scene>\n  a dark cave\n</scene>";
        assert_eq!(find_section(text, "scene", &mut v), Some("a dark cave"));
        assert!(v.is_success());
    }

    #[test]
    fn missing_section_records_error() {
        let mut v = TurnValidation::ok();
        assert_eq!(find_section("no tags here", "scene", &mut v), None);
        assert!(v.errors[0].contains("scene"));
    }

    #[test]
    fn unclosed_section_records_error() {
        let mut v = TurnValidation::ok();
        assert_eq!(find_section("<scene>never closed", "scene", &mut v), None);
        assert!(v.is_failed());
    }

    #[test]
    fn duplicate_section_records_error_but_returns_first() {
        let mut v = TurnValidation::ok();
        let text = "<scene>one</scene><scene>two</scene>";
        assert_eq!(find_section(text, "scene", &mut v), Some("one"));
        assert!(v.errors[0].contains("multiple times"));
    }

    #[test]
    fn partial_section_returns_streamed_prefix() {
        let text = "<response><narrative>The door creaks";
        assert_eq!(
            find_partial_section(text, "narrative"),
            Some("The door creaks")
        );
    }

    #[test]
    fn partial_section_prefers_complete_content() {
        let text = "<narrative>done</narrative> trailing";
        assert_eq!(find_partial_section(text, "narrative"), Some("done"));
    }

    #[test]
    fn partial_section_absent_tag_is_none() {
        assert_eq!(find_partial_section("plain text", "narrative"), None);
    }

    #[test]
    fn similarly_named_tags_do_not_collide() {
        let mut v = TurnValidation::ok();
        let text = "<notes>inner</notes><note>x</note>";
        assert_eq!(find_section(text, "notes", &mut v), Some("inner"));
        assert!(v.is_success());
    }
}
