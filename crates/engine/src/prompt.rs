//! Prompt template loading and `{{PARAM}}` substitution.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Source of prompt template text, keyed by template name.
pub trait PromptSource: Send + Sync {
    fn load(&self, name: &str) -> Result<String>;
}

/// Loads templates from files under a root directory.
pub struct FilePrompts {
    root: PathBuf,
}

impl FilePrompts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PromptSource for FilePrompts {
    fn load(&self, name: &str) -> Result<String> {
        let path = self.root.join(name);
        fs::read_to_string(&path).with_context(|| format!("reading prompt {}", path.display()))
    }
}

/// Replace every `{{NAME}}` placeholder with its parameter value.
///
/// Unknown placeholders are left intact so a missing parameter is visible in
/// the prompt rather than silently blanked.
pub fn substitute(template: &str, parameters: &BTreeMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = &after[..end];
                match parameters.get(name) {
                    Some(value) if !value.is_empty() => output.push_str(value),
                    _ => {
                        output.push_str("{{");
                        output.push_str(name);
                        output.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                output.push_str("{{");
                rest = after;
            }
        }
    }
    output.push_str(rest);
    output
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let result = substitute(
            "Turn {{TURN_NUMBER}}: {{BACKSTORY}}",
            &params(&[("TURN_NUMBER", "4"), ("BACKSTORY", "a quiet village")]),
        );
        assert_eq!(result, "Turn 4: a quiet village");
    }

    #[test]
    fn unknown_placeholders_stay_intact() {
        let result = substitute("Hello {{WHO}}", &params(&[]));
        assert_eq!(result, "Hello {{WHO}}");
    }

    #[test]
    fn empty_value_counts_as_unknown() {
        let result = substitute("{{X}}", &params(&[("X", "")]));
        assert_eq!(result, "{{X}}");
    }

    #[test]
    fn unterminated_placeholder_passes_through() {
        let result = substitute("broken {{OOPS", &params(&[("OOPS", "x")]));
        assert_eq!(result, "broken {{OOPS");
    }

    #[test]
    fn repeated_placeholder_substitutes_every_occurrence() {
        let result = substitute("{{A}} and {{A}}", &params(&[("A", "one")]));
        assert_eq!(result, "one and one");
    }

    #[test]
    fn file_prompts_load_from_root() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("greeting.txt"), "hello {{NAME}}").unwrap();
        let prompts = FilePrompts::new(dir.path());
        assert_eq!(prompts.load("greeting.txt").unwrap(), "hello {{NAME}}");
        assert!(prompts.load("missing.txt").is_err());
    }
}
