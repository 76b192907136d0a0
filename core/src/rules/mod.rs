//! Per-user, per-scope agent rules: markdown files with YAML frontmatter
//! that are matched against request context, merged by priority, and
//! injected into the system prompt.

mod matcher;
mod merger;
mod middleware;
mod models;
mod parser;
mod store;

pub use matcher::MatchContext;
pub use matcher::RuleMatcher;
pub use merger::RuleConflictGroup;
pub use merger::RuleMerger;
pub use middleware::RulesMiddleware;
pub use models::Rule;
pub use models::RuleEvaluationTrace;
pub use models::RuleInclusion;
pub use models::RuleMatch;
pub use models::RuleScope;
pub use parser::MAX_RULE_FILE_SIZE;
pub use parser::RuleParser;
pub use parser::split_frontmatter;
pub use store::FileRuleStore;
pub use store::MemoryRuleStore;
pub use store::RuleStore;
