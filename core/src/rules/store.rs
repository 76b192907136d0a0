// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Rule storage: a file-backed store over one directory per scope, and an
//! in-memory store for tests and session-scoped rules.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::DataAgentErr;
use crate::error::Result;
use crate::rules::models::Rule;
use crate::rules::models::RuleScope;
use crate::rules::parser::RuleParser;

/// Unscoped lookups search scopes from highest to lowest.
const LOOKUP_ORDER: [RuleScope; 3] = [RuleScope::Project, RuleScope::User, RuleScope::Global];

pub trait RuleStore: Send + Sync {
    fn list_rules(&self, scope: Option<RuleScope>) -> Vec<Rule>;

    /// Unscoped lookups search project > user > global.
    fn get_rule(&self, name: &str, scope: Option<RuleScope>) -> Option<Rule>;

    fn save_rule(&self, rule: &Rule) -> Result<()>;

    fn delete_rule(&self, name: &str, scope: RuleScope) -> Result<bool>;

    /// Refresh from the underlying storage, picking up external changes.
    /// A single malformed file is logged and omitted, never fatal.
    fn reload(&self) -> Result<()>;

    fn rule_exists(&self, name: &str, scope: Option<RuleScope>) -> bool {
        self.get_rule(name, scope).is_some()
    }
}

/// Stores rules as markdown files in one directory per scope.
pub struct FileRuleStore {
    global_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
    parser: RuleParser,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    cache: HashMap<String, Rule>,
    loaded: bool,
}

impl FileRuleStore {
    pub fn new(
        global_dir: Option<PathBuf>,
        user_dir: Option<PathBuf>,
        project_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            global_dir,
            user_dir,
            project_dir,
            parser: RuleParser::new(),
            state: Mutex::new(CacheState::default()),
        }
    }

    fn dir_for_scope(&self, scope: RuleScope) -> Option<&PathBuf> {
        match scope {
            RuleScope::Global => self.global_dir.as_ref(),
            RuleScope::User => self.user_dir.as_ref(),
            RuleScope::Project => self.project_dir.as_ref(),
            RuleScope::Session => None,
        }
    }

    pub fn rule_path(&self, name: &str, scope: RuleScope) -> Option<PathBuf> {
        self.dir_for_scope(scope).map(|d| d.join(format!("{name}.md")))
    }

    fn ensure_loaded(&self) {
        let loaded = self.state.lock().unwrap().loaded;
        if !loaded {
            if let Err(e) = self.reload() {
                error!("failed to load rules: {e}");
            }
        }
    }

    fn load_rules_from_dir(&self, dir: &Path, scope: RuleScope) -> Vec<Rule> {
        let mut rules = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return rules;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            match self.parser.parse_file(&path, scope) {
                Ok(Some(rule)) => rules.push(rule),
                Ok(None) => {}
                Err(e) => warn!("failed to parse rule file {}: {e}", path.display()),
            }
        }
        rules
    }
}

impl RuleStore for FileRuleStore {
    fn list_rules(&self, scope: Option<RuleScope>) -> Vec<Rule> {
        self.ensure_loaded();
        let state = self.state.lock().unwrap();
        let mut rules: Vec<Rule> = state
            .cache
            .values()
            .filter(|r| scope.is_none_or(|s| r.scope == s))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name).then(a.scope.cmp(&b.scope)));
        rules
    }

    fn get_rule(&self, name: &str, scope: Option<RuleScope>) -> Option<Rule> {
        self.ensure_loaded();
        let state = self.state.lock().unwrap();
        match scope {
            Some(scope) => state.cache.get(&Rule::cache_key(scope, name)).cloned(),
            None => LOOKUP_ORDER
                .iter()
                .find_map(|s| state.cache.get(&Rule::cache_key(*s, name)).cloned()),
        }
    }

    fn save_rule(&self, rule: &Rule) -> Result<()> {
        let Some(dir) = self.dir_for_scope(rule.scope) else {
            return Err(DataAgentErr::ScopeNotConfigured(rule.scope.to_string()));
        };
        std::fs::create_dir_all(dir)?;
        let file_path = dir.join(format!("{}.md", rule.name));
        std::fs::write(&file_path, self.parser.generate_rule_file(rule))?;
        info!("saved rule '{}' to {}", rule.name, file_path.display());

        let mut saved = rule.clone();
        saved.source_path = Some(file_path.display().to_string());
        self.state
            .lock()
            .unwrap()
            .cache
            .insert(Rule::cache_key(rule.scope, &rule.name), saved);
        Ok(())
    }

    fn delete_rule(&self, name: &str, scope: RuleScope) -> Result<bool> {
        let Some(dir) = self.dir_for_scope(scope) else {
            return Ok(false);
        };
        let file_path = dir.join(format!("{name}.md"));
        if !file_path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&file_path)?;
        info!("deleted rule '{name}' from {}", file_path.display());
        self.state
            .lock()
            .unwrap()
            .cache
            .remove(&Rule::cache_key(scope, name));
        Ok(true)
    }

    fn reload(&self) -> Result<()> {
        let scope_dirs = [
            (RuleScope::Global, self.global_dir.clone()),
            (RuleScope::User, self.user_dir.clone()),
            (RuleScope::Project, self.project_dir.clone()),
        ];
        let mut cache = HashMap::new();
        for (scope, dir) in scope_dirs {
            let Some(dir) = dir else { continue };
            if !dir.exists() {
                continue;
            }
            for rule in self.load_rules_from_dir(&dir, scope) {
                cache.insert(Rule::cache_key(scope, &rule.name), rule);
            }
        }
        let mut state = self.state.lock().unwrap();
        debug!("loaded {} rules", cache.len());
        state.cache = cache;
        state.loaded = true;
        Ok(())
    }
}

/// In-memory rule storage, used in tests and for session-scoped rules.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: Mutex<HashMap<String, Rule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.rules.lock().unwrap().clear();
    }
}

impl RuleStore for MemoryRuleStore {
    fn list_rules(&self, scope: Option<RuleScope>) -> Vec<Rule> {
        let rules = self.rules.lock().unwrap();
        let mut out: Vec<Rule> = rules
            .values()
            .filter(|r| scope.is_none_or(|s| r.scope == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.scope.cmp(&b.scope)));
        out
    }

    fn get_rule(&self, name: &str, scope: Option<RuleScope>) -> Option<Rule> {
        let rules = self.rules.lock().unwrap();
        match scope {
            Some(scope) => rules.get(&Rule::cache_key(scope, name)).cloned(),
            None => LOOKUP_ORDER
                .iter()
                .find_map(|s| rules.get(&Rule::cache_key(*s, name)).cloned()),
        }
    }

    fn save_rule(&self, rule: &Rule) -> Result<()> {
        self.rules
            .lock()
            .unwrap()
            .insert(Rule::cache_key(rule.scope, &rule.name), rule.clone());
        Ok(())
    }

    fn delete_rule(&self, name: &str, scope: RuleScope) -> Result<bool> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .remove(&Rule::cache_key(scope, name))
            .is_some())
    }

    fn reload(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write_rule(dir: &Path, name: &str, body: &str) {
        std::fs::write(
            dir.join(format!("{name}.md")),
            format!("---\nname: {name}\ndescription: test rule\n---\n{body}"),
        )
        .unwrap();
    }

    #[test]
    fn loads_rules_from_all_configured_scopes() {
        let global = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_rule(global.path(), "base", "global body");
        write_rule(user.path(), "style", "user body");

        let store = FileRuleStore::new(
            Some(global.path().to_path_buf()),
            Some(user.path().to_path_buf()),
            None,
        );
        let all = store.list_rules(None);
        assert_eq!(all.len(), 2);
        assert_eq!(store.list_rules(Some(RuleScope::User)).len(), 1);
    }

    #[test]
    fn unscoped_lookup_prefers_higher_scope() {
        let global = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        for dir in [global.path(), user.path(), project.path()] {
            write_rule(dir, "shared", "body");
        }
        let store = FileRuleStore::new(
            Some(global.path().to_path_buf()),
            Some(user.path().to_path_buf()),
            Some(project.path().to_path_buf()),
        );
        let rule = store.get_rule("shared", None).unwrap();
        assert_eq!(rule.scope, RuleScope::Project);
        let user_rule = store.get_rule("shared", Some(RuleScope::User)).unwrap();
        assert_eq!(user_rule.scope, RuleScope::User);
    }

    #[test]
    fn save_requires_a_configured_scope_dir() {
        let user = tempfile::tempdir().unwrap();
        let store = FileRuleStore::new(None, Some(user.path().to_path_buf()), None);

        let rule = Rule::new("fmt", "formatting", "body", RuleScope::Project);
        assert!(store.save_rule(&rule).is_err());

        let rule = Rule::new("fmt", "formatting", "body", RuleScope::User);
        store.save_rule(&rule).unwrap();
        assert!(user.path().join("fmt.md").exists());
        assert!(store.rule_exists("fmt", Some(RuleScope::User)));
    }

    #[test]
    fn delete_removes_file_and_cache_entry() {
        let user = tempfile::tempdir().unwrap();
        let store = FileRuleStore::new(None, Some(user.path().to_path_buf()), None);
        store
            .save_rule(&Rule::new("tmp", "d", "body", RuleScope::User))
            .unwrap();
        assert!(store.delete_rule("tmp", RuleScope::User).unwrap());
        assert!(!store.delete_rule("tmp", RuleScope::User).unwrap());
        assert!(store.get_rule("tmp", None).is_none());
    }

    #[test]
    fn malformed_file_does_not_block_reload() {
        let user = tempfile::tempdir().unwrap();
        write_rule(user.path(), "good", "body");
        std::fs::write(user.path().join("bad.md"), "no frontmatter here").unwrap();

        let store = FileRuleStore::new(None, Some(user.path().to_path_buf()), None);
        store.reload().unwrap();
        let rules = store.list_rules(None);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "good");
    }

    #[test]
    fn reload_picks_up_external_changes() {
        let user = tempfile::tempdir().unwrap();
        let store = FileRuleStore::new(None, Some(user.path().to_path_buf()), None);
        assert!(store.list_rules(None).is_empty());

        write_rule(user.path(), "late", "body");
        store.reload().unwrap();
        assert_eq!(store.list_rules(None).len(), 1);
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryRuleStore::new();
        store
            .save_rule(&Rule::new("a", "d", "body", RuleScope::Session))
            .unwrap();
        assert!(store.get_rule("a", Some(RuleScope::Session)).is_some());
        assert!(store.delete_rule("a", RuleScope::Session).unwrap());
        assert!(store.get_rule("a", Some(RuleScope::Session)).is_none());
    }
}
