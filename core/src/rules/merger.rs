//! Merging matched rules into the final ordered list.
//!
//! Same-named rules across scopes collapse to one winner: the higher
//! scope, unless a lower-scope rule carries `override: true`. Either way
//! the collision is recorded as a conflict. The final list is ordered by
//! (scope rank desc, rule priority desc, name asc) and trimmed from the
//! low-priority end until the total content fits the size budget.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::rules::models::Rule;
use crate::rules::models::RuleMatch;

pub const DEFAULT_MAX_CONTENT_SIZE: usize = 100_000;

/// A same-name collision across scopes, as reported by
/// [`RuleMerger::detect_conflicts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleConflictGroup {
    pub name: String,
    pub scopes: Vec<String>,
}

pub struct RuleMerger {
    max_content_size: usize,
}

impl Default for RuleMerger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTENT_SIZE)
    }
}

impl RuleMerger {
    pub fn new(max_content_size: usize) -> Self {
        Self { max_content_size }
    }

    /// Produce the final ordered rule list and the conflicts encountered
    /// as `(winner, loser, reason)` triples.
    pub fn merge_rules(
        &self,
        matches: &[RuleMatch],
    ) -> (Vec<Rule>, Vec<(String, String, String)>) {
        let mut conflicts = Vec::new();
        let mut by_name: HashMap<String, Rule> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for m in matches {
            let candidate = &m.rule;
            match by_name.get(&candidate.name) {
                None => {
                    order.push(candidate.name.clone());
                    by_name.insert(candidate.name.clone(), candidate.clone());
                }
                Some(current) => {
                    let (winner, loser, reason) = pick_winner(current, candidate);
                    conflicts.push((
                        format!("{}:{}", winner.scope, winner.name),
                        format!("{}:{}", loser.scope, loser.name),
                        reason,
                    ));
                    let winner = winner.clone();
                    by_name.insert(candidate.name.clone(), winner);
                }
            }
        }

        let mut final_rules: Vec<Rule> = order
            .into_iter()
            .filter_map(|name| by_name.remove(&name))
            .collect();

        final_rules.sort_by(|a, b| {
            b.scope
                .rank()
                .cmp(&a.scope.rank())
                .then(b.priority.cmp(&a.priority))
                .then(a.name.cmp(&b.name))
        });

        // Trim whole rules from the low-priority end until under budget.
        let mut total: usize = final_rules.iter().map(|r| r.content.len()).sum();
        while total > self.max_content_size {
            match final_rules.pop() {
                Some(dropped) => {
                    debug!(
                        "dropping rule '{}' to fit content budget ({total} > {})",
                        dropped.name, self.max_content_size
                    );
                    total -= dropped.content.len();
                }
                None => break,
            }
        }

        (final_rules, conflicts)
    }

    /// Render the merged rules as a system prompt section.
    pub fn build_prompt_section(&self, rules: &[Rule]) -> String {
        if rules.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Agent Rules\n");
        for rule in rules {
            out.push_str(&format!("\n### {}\n\n{}\n", rule.name, rule.content));
        }
        out
    }

    /// Same-name groups across scopes, regardless of override flags.
    pub fn detect_conflicts(&self, rules: &[Rule]) -> Vec<RuleConflictGroup> {
        let mut scopes_by_name: HashMap<&str, Vec<String>> = HashMap::new();
        let mut order = Vec::new();
        for rule in rules {
            let entry = scopes_by_name.entry(&rule.name).or_insert_with(|| {
                order.push(rule.name.clone());
                Vec::new()
            });
            entry.push(rule.scope.to_string());
        }
        order
            .into_iter()
            .filter_map(|name| {
                let scopes = scopes_by_name.remove(name.as_str())?;
                (scopes.len() > 1).then_some(RuleConflictGroup { name, scopes })
            })
            .collect()
    }
}

/// Resolve a same-name collision between the current winner and a new
/// candidate.
fn pick_winner<'a>(current: &'a Rule, candidate: &'a Rule) -> (&'a Rule, &'a Rule, String) {
    let (higher, lower) = if candidate.scope.rank() > current.scope.rank() {
        (candidate, current)
    } else {
        (current, candidate)
    };
    if lower.override_lower {
        (
            lower,
            higher,
            format!(
                "'{}' scope overrides '{}' via override flag",
                lower.scope, higher.scope
            ),
        )
    } else {
        (
            higher,
            lower,
            format!("'{}' scope outranks '{}'", higher.scope, lower.scope),
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::rules::models::RuleScope;

    fn matched(name: &str, scope: RuleScope, priority: u8, content: &str) -> RuleMatch {
        let mut rule = Rule::new(name, "test rule", content, scope);
        rule.priority = priority;
        RuleMatch {
            rule,
            match_reason: "test".to_string(),
            matched_files: Vec::new(),
        }
    }

    #[test]
    fn distinct_names_all_survive() {
        let merger = RuleMerger::default();
        let matches = vec![
            matched("a", RuleScope::User, 50, "x"),
            matched("b", RuleScope::User, 50, "y"),
        ];
        let (rules, conflicts) = merger.merge_rules(&matches);
        assert_eq!(rules.len(), 2);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn higher_scope_wins_name_collisions() {
        let merger = RuleMerger::default();
        let matches = vec![
            matched("shared", RuleScope::Global, 50, "global"),
            matched("shared", RuleScope::User, 50, "user"),
            matched("shared", RuleScope::Project, 50, "project"),
        ];
        let (rules, conflicts) = merger.merge_rules(&matches);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].scope, RuleScope::Project);
        assert_eq!(conflicts.len(), 2);
    }

    #[test]
    fn override_flag_beats_scope_rank() {
        let merger = RuleMerger::default();
        let mut lower = matched("shared", RuleScope::User, 50, "user override");
        lower.rule.override_lower = true;
        let matches = vec![
            matched("shared", RuleScope::Project, 50, "project"),
            lower,
        ];
        let (rules, conflicts) = merger.merge_rules(&matches);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].content, "user override");
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].2.contains("override"));
    }

    #[test]
    fn ordering_is_scope_then_priority_then_name() {
        let merger = RuleMerger::default();
        let matches = vec![
            matched("bravo", RuleScope::User, 80, "1"),
            matched("alpha", RuleScope::User, 80, "2"),
            matched("low", RuleScope::User, 30, "3"),
            matched("proj", RuleScope::Project, 10, "4"),
        ];
        let (rules, _) = merger.merge_rules(&matches);
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["proj", "alpha", "bravo", "low"]);
    }

    #[test]
    fn size_budget_trims_lowest_priority_first() {
        let merger = RuleMerger::new(25);
        let matches = vec![
            matched("high", RuleScope::User, 90, &"h".repeat(10)),
            matched("mid", RuleScope::User, 60, &"m".repeat(10)),
            matched("low", RuleScope::User, 30, &"l".repeat(10)),
        ];
        let (rules, _) = merger.merge_rules(&matches);
        let total: usize = rules.iter().map(|r| r.content.len()).sum();
        assert!(total <= 25);
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid"]);
    }

    #[test]
    fn prompt_section_rendering() {
        let merger = RuleMerger::default();
        assert_eq!(merger.build_prompt_section(&[]), "");

        let (rules, _) = merger.merge_rules(&[matched("fmt", RuleScope::User, 50, "Run rustfmt.")]);
        let section = merger.build_prompt_section(&rules);
        assert!(section.contains("## Agent Rules"));
        assert!(section.contains("### fmt"));
        assert!(section.contains("Run rustfmt."));
    }

    #[test]
    fn detect_conflicts_groups_same_names() {
        let merger = RuleMerger::default();
        let rules = vec![
            Rule::new("shared", "d", "x", RuleScope::Global),
            Rule::new("shared", "d", "y", RuleScope::User),
            Rule::new("unique", "d", "z", RuleScope::User),
        ];
        let conflicts = merger.detect_conflicts(&rules);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].name, "shared");
        assert!(conflicts[0].scopes.contains(&"global".to_string()));
        assert!(conflicts[0].scopes.contains(&"user".to_string()));
    }
}
