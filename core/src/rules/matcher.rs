//! Matching rules against request context.

use std::path::Path;

use regex_lite::Regex;
use wildmatch::WildMatch;

use crate::rules::models::Rule;
use crate::rules::models::RuleInclusion;
use crate::rules::models::RuleMatch;

/// Context a rule set is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Files referenced by the current request.
    pub current_files: Vec<String>,
    pub user_query: String,
    pub session_id: String,
    pub assistant_id: String,
    /// Rule names referenced with `@rulename` tokens.
    pub manual_rules: Vec<String>,
}

pub struct RuleMatcher {
    manual_reference: Regex,
    backtick_file: Regex,
    file_prefix: Regex,
    path_prefix: Regex,
}

impl Default for RuleMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleMatcher {
    #[expect(clippy::expect_used)]
    pub fn new() -> Self {
        Self {
            manual_reference: Regex::new(r"@(\w[\w\-]*)").expect("static regex"),
            backtick_file: Regex::new(r"`([^`]+\.\w+)`").expect("static regex"),
            file_prefix: Regex::new(r"file:([^\s]+)").expect("static regex"),
            path_prefix: Regex::new(r"path:([^\s]+)").expect("static regex"),
        }
    }

    /// Evaluate every rule against `context`. Returns matched rules with
    /// reasons and skipped rules as `(name, reason)` pairs.
    pub fn match_rules(
        &self,
        rules: &[Rule],
        context: &MatchContext,
    ) -> (Vec<RuleMatch>, Vec<(String, String)>) {
        let mut matched = Vec::new();
        let mut skipped = Vec::new();

        for rule in rules {
            if !rule.enabled {
                skipped.push((rule.name.clone(), "disabled".to_string()));
                continue;
            }
            match rule.inclusion {
                RuleInclusion::Always => matched.push(RuleMatch {
                    rule: rule.clone(),
                    match_reason: "inclusion is 'always'".to_string(),
                    matched_files: Vec::new(),
                }),
                RuleInclusion::Manual => {
                    if context.manual_rules.iter().any(|n| n == &rule.name) {
                        matched.push(RuleMatch {
                            rule: rule.clone(),
                            match_reason: format!("manually referenced as @{}", rule.name),
                            matched_files: Vec::new(),
                        });
                    } else {
                        skipped.push((rule.name.clone(), "not manually referenced".to_string()));
                    }
                }
                RuleInclusion::FileMatch => {
                    let Some(pattern) = rule.file_match_pattern.as_deref() else {
                        skipped.push((
                            rule.name.clone(),
                            "fileMatch rule has no fileMatchPattern".to_string(),
                        ));
                        continue;
                    };
                    let files = self.match_files(pattern, &context.current_files);
                    if files.is_empty() {
                        skipped.push((
                            rule.name.clone(),
                            format!("no current file matches '{pattern}'"),
                        ));
                    } else {
                        matched.push(RuleMatch {
                            rule: rule.clone(),
                            match_reason: format!("files match '{pattern}'"),
                            matched_files: files,
                        });
                    }
                }
            }
        }

        (matched, skipped)
    }

    /// Files matching `pattern`, checked against both the full path and
    /// the bare file name.
    pub fn match_files(&self, pattern: &str, files: &[String]) -> Vec<String> {
        let glob = WildMatch::new(pattern);
        files
            .iter()
            .filter(|file| {
                if glob.matches(file) {
                    return true;
                }
                Path::new(file)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| glob.matches(name))
            })
            .cloned()
            .collect()
    }

    /// `@rulename` tokens in free text.
    pub fn extract_manual_references(&self, text: &str) -> Vec<String> {
        self.manual_reference
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }

    /// File paths referenced in free text: backticked paths with an
    /// extension, plus `file:` and `path:` prefixes.
    pub fn extract_file_references(&self, text: &str) -> Vec<String> {
        let mut files = Vec::new();
        for regex in [&self.backtick_file, &self.file_prefix, &self.path_prefix] {
            files.extend(
                regex
                    .captures_iter(text)
                    .filter_map(|c| c.get(1).map(|m| m.as_str().to_string())),
            );
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::rules::models::RuleScope;

    fn rule(name: &str, inclusion: RuleInclusion, pattern: Option<&str>) -> Rule {
        let mut rule = Rule::new(name, "test rule", "content", RuleScope::User);
        rule.inclusion = inclusion;
        rule.file_match_pattern = pattern.map(str::to_string);
        rule
    }

    #[test]
    fn always_rules_match_any_context() {
        let matcher = RuleMatcher::new();
        let rules = vec![rule("a", RuleInclusion::Always, None)];
        let (matched, skipped) = matcher.match_rules(&rules, &MatchContext::default());
        assert_eq!(matched.len(), 1);
        assert!(matched[0].match_reason.contains("always"));
        assert!(skipped.is_empty());
    }

    #[test]
    fn disabled_rules_are_skipped_with_reason() {
        let matcher = RuleMatcher::new();
        let mut r = rule("off", RuleInclusion::Always, None);
        r.enabled = false;
        let (matched, skipped) = matcher.match_rules(&[r], &MatchContext::default());
        assert!(matched.is_empty());
        assert_eq!(skipped, vec![("off".to_string(), "disabled".to_string())]);
    }

    #[test]
    fn manual_rules_require_a_reference() {
        let matcher = RuleMatcher::new();
        let rules = vec![rule("my-rule", RuleInclusion::Manual, None)];

        let (matched, _) = matcher.match_rules(&rules, &MatchContext::default());
        assert!(matched.is_empty());

        let context = MatchContext {
            manual_rules: vec!["my-rule".to_string()],
            ..Default::default()
        };
        let (matched, _) = matcher.match_rules(&rules, &context);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn file_match_checks_full_path_and_file_name() {
        let matcher = RuleMatcher::new();
        let files = vec!["src/main.py".to_string(), "test.js".to_string()];
        assert_eq!(matcher.match_files("*.py", &files), vec!["src/main.py"]);
        assert_eq!(matcher.match_files("src/*.py", &files), vec!["src/main.py"]);
        assert!(matcher.match_files("*.ts", &files).is_empty());
    }

    #[test]
    fn file_match_rule_matches_iff_some_file_matches() {
        let matcher = RuleMatcher::new();
        let rules = vec![rule("py", RuleInclusion::FileMatch, Some("*.py"))];

        let context = MatchContext {
            current_files: vec!["main.py".to_string(), "test.js".to_string()],
            ..Default::default()
        };
        let (matched, _) = matcher.match_rules(&rules, &context);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].matched_files, vec!["main.py"]);

        let context = MatchContext {
            current_files: vec!["main.js".to_string()],
            ..Default::default()
        };
        let (matched, skipped) = matcher.match_rules(&rules, &context);
        assert!(matched.is_empty());
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn recursive_patterns_cross_directories() {
        let matcher = RuleMatcher::new();
        let files = vec![
            "src/utils/helper.py".to_string(),
            "test/main.py".to_string(),
        ];
        let matched = matcher.match_files("src/**/*.py", &files);
        assert_eq!(matched, vec!["src/utils/helper.py"]);
    }

    #[test]
    fn extracts_manual_references() {
        let matcher = RuleMatcher::new();
        let refs = matcher
            .extract_manual_references("Please use @coding-standards and @security-review here.");
        assert_eq!(refs, vec!["coding-standards", "security-review"]);
    }

    #[test]
    fn extracts_file_references() {
        let matcher = RuleMatcher::new();
        let files = matcher.extract_file_references(
            "Check `src/main.py` and file:docs/spec.md plus path:notes/todo.txt",
        );
        assert!(files.contains(&"src/main.py".to_string()));
        assert!(files.contains(&"docs/spec.md".to_string()));
        assert!(files.contains(&"notes/todo.txt".to_string()));
    }
}
