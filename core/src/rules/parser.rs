//! Parsing of rule files: markdown with a YAML frontmatter block.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use regex_lite::Regex;
use tracing::warn;

use crate::error::DataAgentErr;
use crate::error::Result;
use crate::rules::models::Rule;
use crate::rules::models::RuleInclusion;
use crate::rules::models::RuleScope;

/// Rule files larger than this are rejected outright.
pub const MAX_RULE_FILE_SIZE: u64 = 1024 * 1024;

/// Split `content` into `(frontmatter_yaml, body)`. The file must start
/// with a `---` line and contain a closing `---` line.
pub fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let newline = rest.find('\n')?;
    if !rest[..newline].trim().is_empty() {
        return None;
    }
    let after_open = &rest[newline + 1..];
    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &after_open[..offset];
            let body = &after_open[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

pub struct RuleParser {
    file_reference: Regex,
}

impl Default for RuleParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleParser {
    #[expect(clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            file_reference: Regex::new(r"#\[\[file:([^\]]+)\]\]").expect("static regex"),
        }
    }

    /// Parse a rule file. Returns `Ok(None)` when the file does not exist.
    pub fn parse_file(&self, file_path: &Path, scope: RuleScope) -> Result<Option<Rule>> {
        if !file_path.exists() {
            return Ok(None);
        }
        let size = std::fs::metadata(file_path)?.len();
        if size > MAX_RULE_FILE_SIZE {
            return Err(DataAgentErr::RuleParse(format!(
                "rule file exceeds size limit ({size} > {MAX_RULE_FILE_SIZE}): {}",
                file_path.display()
            )));
        }
        let content = std::fs::read_to_string(file_path).map_err(|e| {
            DataAgentErr::RuleParse(format!("failed to read rule file {}: {e}", file_path.display()))
        })?;
        self.parse_content(&content, scope, Some(file_path.display().to_string()))
            .map(Some)
    }

    /// Parse rule content. `name` and `description` are required; the
    /// remaining frontmatter keys clamp or default with a warning.
    pub fn parse_content(
        &self,
        content: &str,
        scope: RuleScope,
        source_path: Option<String>,
    ) -> Result<Rule> {
        let Some((frontmatter, body)) = split_frontmatter(content) else {
            return Err(DataAgentErr::RuleParse(
                "missing or invalid YAML frontmatter; rule files must start with '---' followed by YAML metadata"
                    .to_string(),
            ));
        };

        let metadata: BTreeMap<String, serde_yaml::Value> = if frontmatter.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_str(frontmatter).map_err(|e| {
                DataAgentErr::RuleParse(format!("invalid YAML frontmatter: {e}"))
            })?
        };

        let name = required_string(&metadata, "name")?;
        let description = required_string(&metadata, "description")?;

        let inclusion = match metadata.get("inclusion").map(yaml_to_string) {
            None => RuleInclusion::Always,
            Some(raw) => RuleInclusion::parse(&raw).unwrap_or_else(|| {
                warn!("invalid inclusion mode '{raw}', defaulting to 'always'");
                RuleInclusion::Always
            }),
        };

        let priority = parse_priority(metadata.get("priority"));
        let override_lower = parse_bool(metadata.get("override"), false);
        let enabled = parse_bool(metadata.get("enabled"), true);
        let file_match_pattern = metadata.get("fileMatchPattern").map(yaml_to_string);

        let mut rule = Rule::new(name, description, body.trim().to_string(), scope);
        rule.inclusion = inclusion;
        rule.priority = priority;
        rule.override_lower = override_lower;
        rule.enabled = enabled;
        rule.file_match_pattern = file_match_pattern;
        rule.source_path = source_path;
        rule.metadata = metadata;
        Ok(rule)
    }

    /// Replace `#[[file:PATH]]` references with the referenced file's
    /// body. References resolving outside `allowed_dirs` (or missing,
    /// oversized, unreadable files) become literal placeholders.
    pub fn resolve_file_references(
        &self,
        content: &str,
        base_path: &Path,
        allowed_dirs: &[PathBuf],
    ) -> String {
        let mut out = String::with_capacity(content.len());
        let mut last = 0;
        for caps in self.file_reference.captures_iter(content) {
            #[expect(clippy::expect_used)]
            let full = caps.get(0).expect("capture 0 always present");
            #[expect(clippy::expect_used)]
            let raw = caps.get(1).expect("capture 1 in pattern").as_str().trim();
            out.push_str(&content[last..full.start()]);
            out.push_str(&self.resolve_one_reference(raw, base_path, allowed_dirs));
            last = full.end();
        }
        out.push_str(&content[last..]);
        out
    }

    fn resolve_one_reference(&self, raw: &str, base_path: &Path, allowed_dirs: &[PathBuf]) -> String {
        let referenced = Path::new(raw);
        let full_path = if referenced.is_absolute() {
            referenced.to_path_buf()
        } else {
            base_path.join(referenced)
        };

        if !is_safe_path(&full_path, allowed_dirs) {
            warn!("file reference blocked (outside allowed dirs): {raw}");
            return format!("[File reference blocked: {raw}]");
        }
        if !full_path.exists() {
            warn!("referenced file not found: {raw}");
            return format!("[File not found: {raw}]");
        }
        if std::fs::metadata(&full_path).map(|m| m.len()).unwrap_or(u64::MAX) > MAX_RULE_FILE_SIZE {
            warn!("referenced file too large: {raw}");
            return format!("[File too large: {raw}]");
        }
        match std::fs::read_to_string(&full_path) {
            Ok(body) => body,
            Err(e) => {
                warn!("error reading referenced file {raw}: {e}");
                format!("[Error reading file: {raw}]")
            }
        }
    }

    /// Validate content without constructing a rule. Returns
    /// `(valid, errors, warnings)`.
    pub fn validate_content(&self, content: &str) -> (bool, Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let Some((frontmatter, body)) = split_frontmatter(content) else {
            errors.push("Missing or invalid YAML frontmatter".to_string());
            return (false, errors, warnings);
        };

        let metadata: BTreeMap<String, serde_yaml::Value> = if frontmatter.trim().is_empty() {
            BTreeMap::new()
        } else {
            match serde_yaml::from_str(frontmatter) {
                Ok(m) => m,
                Err(e) => {
                    errors.push(format!("Invalid YAML frontmatter: {e}"));
                    return (false, errors, warnings);
                }
            }
        };

        for field in ["name", "description"] {
            let missing = metadata
                .get(field)
                .map(yaml_to_string)
                .map(|v| v.is_empty())
                .unwrap_or(true);
            if missing {
                errors.push(format!("Missing required field: {field}"));
            }
        }

        if let Some(inclusion) = metadata.get("inclusion").map(yaml_to_string) {
            if RuleInclusion::parse(&inclusion).is_none() {
                warnings.push(format!("Unknown inclusion mode: {inclusion}"));
            }
        }

        if let Some(priority) = metadata.get("priority") {
            match yaml_to_i64(priority) {
                Some(p) if (1..=100).contains(&p) => {}
                Some(p) => warnings.push(format!("Priority {p} out of range (1-100)")),
                None => warnings.push(format!(
                    "Invalid priority value: {}",
                    yaml_to_string(priority)
                )),
            }
        }

        if body.len() > 50_000 {
            warnings.push("Rule content is very large, may impact performance".to_string());
        }

        (errors.is_empty(), errors, warnings)
    }

    /// Render a rule back into file form.
    pub fn generate_rule_file(&self, rule: &Rule) -> String {
        let mut lines = vec![
            "---".to_string(),
            format!("name: {}", rule.name),
            format!("description: {}", rule.description),
            format!("inclusion: {}", rule.inclusion.as_str()),
        ];
        if let Some(pattern) = &rule.file_match_pattern {
            lines.push(format!("fileMatchPattern: {pattern}"));
        }
        if rule.priority != 50 {
            lines.push(format!("priority: {}", rule.priority));
        }
        if rule.override_lower {
            lines.push("override: true".to_string());
        }
        if !rule.enabled {
            lines.push("enabled: false".to_string());
        }
        lines.push("---".to_string());
        lines.push(String::new());
        lines.push(rule.content.clone());
        lines.join("\n")
    }
}

fn required_string(
    metadata: &BTreeMap<String, serde_yaml::Value>,
    key: &str,
) -> Result<String> {
    let value = metadata.get(key).map(yaml_to_string).unwrap_or_default();
    if value.is_empty() {
        return Err(DataAgentErr::RuleParse(format!(
            "missing required field: {key}"
        )));
    }
    Ok(value)
}

fn yaml_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn yaml_to_i64(value: &serde_yaml::Value) -> Option<i64> {
    match value {
        serde_yaml::Value::Number(n) => n.as_i64(),
        serde_yaml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_priority(value: Option<&serde_yaml::Value>) -> u8 {
    let Some(value) = value else {
        return 50;
    };
    match yaml_to_i64(value) {
        Some(p) if (1..=100).contains(&p) => p as u8,
        Some(p) => {
            warn!("priority {p} out of range, clamping to 1-100");
            p.clamp(1, 100) as u8
        }
        None => {
            warn!("invalid priority value '{}', defaulting to 50", yaml_to_string(value));
            50
        }
    }
}

fn parse_bool(value: Option<&serde_yaml::Value>, default: bool) -> bool {
    match value {
        None => default,
        Some(serde_yaml::Value::Bool(b)) => *b,
        Some(other) => matches!(
            yaml_to_string(other).to_lowercase().as_str(),
            "true" | "yes" | "1" | "on"
        ),
    }
}

fn is_safe_path(path: &Path, allowed_dirs: &[PathBuf]) -> bool {
    let Ok(resolved) = path.canonicalize() else {
        return false;
    };
    allowed_dirs.iter().any(|allowed| {
        allowed
            .canonicalize()
            .map(|a| resolved.starts_with(a))
            .unwrap_or(false)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const VALID_RULE: &str = "---\nname: coding-standards\ndescription: Rust coding standards\ninclusion: always\npriority: 60\n---\n\n# Coding Standards\n\nPrefer iterators over index loops.\n";

    #[test]
    fn parses_a_valid_rule() {
        let parser = RuleParser::new();
        let rule = parser
            .parse_content(VALID_RULE, RuleScope::User, None)
            .unwrap();
        assert_eq!(rule.name, "coding-standards");
        assert_eq!(rule.description, "Rust coding standards");
        assert_eq!(rule.priority, 60);
        assert_eq!(rule.inclusion, RuleInclusion::Always);
        assert!(rule.content.starts_with("# Coding Standards"));
    }

    #[test]
    fn missing_frontmatter_fails() {
        let parser = RuleParser::new();
        let err = parser
            .parse_content("just markdown, no frontmatter", RuleScope::User, None)
            .unwrap_err();
        assert!(err.to_string().contains("frontmatter"));
    }

    #[test]
    fn missing_name_fails() {
        let parser = RuleParser::new();
        let err = parser
            .parse_content("---\ndescription: d\n---\nbody", RuleScope::User, None)
            .unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn invalid_inclusion_defaults_to_always() {
        let parser = RuleParser::new();
        let rule = parser
            .parse_content(
                "---\nname: n\ndescription: d\ninclusion: sometimes\n---\nbody",
                RuleScope::User,
                None,
            )
            .unwrap();
        assert_eq!(rule.inclusion, RuleInclusion::Always);
    }

    #[test]
    fn out_of_range_priority_is_clamped() {
        let parser = RuleParser::new();
        let rule = parser
            .parse_content(
                "---\nname: n\ndescription: d\npriority: 250\n---\nbody",
                RuleScope::User,
                None,
            )
            .unwrap();
        assert_eq!(rule.priority, 100);

        let rule = parser
            .parse_content(
                "---\nname: n\ndescription: d\npriority: nonsense\n---\nbody",
                RuleScope::User,
                None,
            )
            .unwrap();
        assert_eq!(rule.priority, 50);
    }

    #[test]
    fn boolean_fields_accept_yaml_and_string_forms() {
        let parser = RuleParser::new();
        let rule = parser
            .parse_content(
                "---\nname: n\ndescription: d\noverride: \"yes\"\nenabled: false\n---\nbody",
                RuleScope::User,
                None,
            )
            .unwrap();
        assert!(rule.override_lower);
        assert!(!rule.enabled);
    }

    #[test]
    fn oversized_file_is_rejected() {
        let parser = RuleParser::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.md");
        let mut content = String::from("---\nname: n\ndescription: d\n---\n");
        content.push_str(&"x".repeat(MAX_RULE_FILE_SIZE as usize + 1));
        std::fs::write(&path, content).unwrap();
        assert!(parser.parse_file(&path, RuleScope::User).is_err());
    }

    #[test]
    fn file_reference_resolves_inside_allowed_dirs() {
        let parser = RuleParser::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ref.md"), "referenced body").unwrap();
        let resolved = parser.resolve_file_references(
            "before #[[file:ref.md]] after",
            dir.path(),
            &[dir.path().to_path_buf()],
        );
        assert_eq!(resolved, "before referenced body after");
    }

    #[test]
    fn file_reference_outside_allowed_dirs_is_blocked() {
        let parser = RuleParser::new();
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.md"), "secret").unwrap();
        let reference = format!("#[[file:{}]]", outside.path().join("secret.md").display());
        let resolved =
            parser.resolve_file_references(&reference, dir.path(), &[dir.path().to_path_buf()]);
        assert!(resolved.starts_with("[File reference blocked:"));
    }

    #[test]
    fn missing_reference_becomes_placeholder() {
        let parser = RuleParser::new();
        let dir = tempfile::tempdir().unwrap();
        let resolved = parser.resolve_file_references(
            "#[[file:nope.md]]",
            dir.path(),
            &[dir.path().to_path_buf()],
        );
        assert_eq!(resolved, "[File not found: nope.md]");
    }

    #[test]
    fn validate_content_reports_errors_and_warnings() {
        let parser = RuleParser::new();

        let (valid, errors, _) = parser.validate_content("no frontmatter");
        assert!(!valid);
        assert_eq!(errors, vec!["Missing or invalid YAML frontmatter"]);

        let (valid, errors, warnings) = parser.validate_content(
            "---\nname: n\ndescription: d\ninclusion: weird\npriority: 400\n---\nbody",
        );
        assert!(valid);
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn generated_file_round_trips() {
        let parser = RuleParser::new();
        let mut rule = Rule::new("fmt", "formatting", "Run rustfmt.", RuleScope::Project);
        rule.priority = 70;
        rule.override_lower = true;
        let text = parser.generate_rule_file(&rule);
        let parsed = parser
            .parse_content(&text, RuleScope::Project, None)
            .unwrap();
        assert_eq!(parsed.name, "fmt");
        assert_eq!(parsed.priority, 70);
        assert!(parsed.override_lower);
        assert_eq!(parsed.content, "Run rustfmt.");
    }
}
