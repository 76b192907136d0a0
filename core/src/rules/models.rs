use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Rule scope levels, lowest to highest merge priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Global,
    User,
    Project,
    /// Runtime-only rules attached to one conversation.
    Session,
}

impl RuleScope {
    /// Merge rank; higher wins for same-named rules.
    pub fn rank(self) -> u8 {
        match self {
            RuleScope::Global => 0,
            RuleScope::User => 1,
            RuleScope::Project => 2,
            RuleScope::Session => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleScope::Global => "global",
            RuleScope::User => "user",
            RuleScope::Project => "project",
            RuleScope::Session => "session",
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a rule is included in the system prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum RuleInclusion {
    #[default]
    #[serde(rename = "always")]
    Always,
    #[serde(rename = "fileMatch")]
    FileMatch,
    #[serde(rename = "manual")]
    Manual,
}

impl RuleInclusion {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "always" => Some(RuleInclusion::Always),
            "fileMatch" => Some(RuleInclusion::FileMatch),
            "manual" => Some(RuleInclusion::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleInclusion::Always => "always",
            RuleInclusion::FileMatch => "fileMatch",
            RuleInclusion::Manual => "manual",
        }
    }
}

/// A single agent rule. Identity (equality and hashing) is
/// `(name, scope)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rule {
    pub name: String,
    pub description: String,
    /// Markdown body after the frontmatter.
    pub content: String,
    pub scope: RuleScope,
    pub inclusion: RuleInclusion,
    pub file_match_pattern: Option<String>,
    /// 1..=100; higher sorts first within a scope.
    pub priority: u8,
    /// Lets a lower-scope rule win a same-name collision.
    pub override_lower: bool,
    pub enabled: bool,
    pub source_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, serde_yaml::Value>,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
        scope: RuleScope,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: description.into(),
            content: content.into(),
            scope,
            inclusion: RuleInclusion::Always,
            file_match_pattern: None,
            priority: 50,
            override_lower: false,
            enabled: true,
            source_path: None,
            created_at: now,
            updated_at: now,
            metadata: BTreeMap::new(),
        }
    }

    /// Cache key for a rule within a store.
    pub fn cache_key(scope: RuleScope, name: &str) -> String {
        format!("{scope}:{name}")
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.scope == other.scope
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.scope.hash(state);
    }
}

/// A rule that matched the request context, with the reason it matched.
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    pub rule: Rule,
    pub match_reason: String,
    pub matched_files: Vec<String>,
}

/// Per-request debug trace of rule evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RuleEvaluationTrace {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub evaluated_rules: Vec<String>,
    pub matched_rules: Vec<RuleMatch>,
    /// `(rule_name, reason)`
    pub skipped_rules: Vec<(String, String)>,
    /// `(winner, loser, reason)`
    pub conflicts: Vec<(String, String, String)>,
    pub final_rules: Vec<String>,
    pub total_content_size: usize,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scope_rank_is_strictly_increasing() {
        assert!(RuleScope::Global.rank() < RuleScope::User.rank());
        assert!(RuleScope::User.rank() < RuleScope::Project.rank());
        assert!(RuleScope::Project.rank() < RuleScope::Session.rank());
    }

    #[test]
    fn identity_is_name_and_scope() {
        let mut a = Rule::new("style", "d", "content a", RuleScope::User);
        let b = Rule::new("style", "other", "content b", RuleScope::User);
        a.priority = 90;
        assert_eq!(a, b);

        let c = Rule::new("style", "d", "content a", RuleScope::Project);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn inclusion_wire_names() {
        assert_eq!(RuleInclusion::parse("fileMatch"), Some(RuleInclusion::FileMatch));
        assert_eq!(RuleInclusion::parse("bogus"), None);
        assert_eq!(RuleInclusion::FileMatch.as_str(), "fileMatch");
    }
}
