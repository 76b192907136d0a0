//! Skill discovery: `<agent_root>/<agent_id>/skills/<skill>/SKILL.md`
//! descriptors with YAML frontmatter requiring `name` and `description`.
//! Skills are surfaced to the model by name and description only; the
//! full instructions are read on demand through file tools.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::middleware::Middleware;
use crate::middleware::ModelRequest;
use crate::rules::split_frontmatter;
use crate::workspace::sanitize_user_id;

const MAX_SKILL_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const SKILL_FILE: &str = "SKILL.md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillMetadata {
    pub name: String,
    pub description: String,
    /// Absolute path to the SKILL.md, handed to the model for on-demand
    /// reading.
    pub path: String,
    pub source: String,
}

/// Parse one SKILL.md. Malformed or oversized files are skipped.
fn parse_skill_metadata(path: &Path, source: &str) -> Option<SkillMetadata> {
    let size = std::fs::metadata(path).ok()?.len();
    if size > MAX_SKILL_FILE_SIZE {
        debug!("skipping oversized skill file: {}", path.display());
        return None;
    }
    let content = std::fs::read_to_string(path).ok()?;
    let (frontmatter, _body) = split_frontmatter(&content)?;
    let metadata: std::collections::BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(frontmatter).ok()?;
    let name = metadata.get("name")?.as_str()?.to_string();
    let description = metadata.get("description")?.as_str()?.to_string();
    if name.is_empty() || description.is_empty() {
        return None;
    }
    Some(SkillMetadata {
        name,
        description,
        path: path.display().to_string(),
        source: source.to_string(),
    })
}

/// List every skill under one skills directory.
pub fn list_skills_from_dir(skills_dir: &Path, source: &str) -> Vec<SkillMetadata> {
    let Ok(entries) = std::fs::read_dir(skills_dir) else {
        return Vec::new();
    };
    let mut skills: Vec<SkillMetadata> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| parse_skill_metadata(&e.path().join(SKILL_FILE), source))
        .collect();
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Skills of one agent: `<agent_root>/<agent_id>/skills/`.
pub fn list_agent_skills(agent_root: &Path, agent_id: &str) -> Vec<SkillMetadata> {
    let skills_dir = agent_root.join(sanitize_user_id(agent_id)).join("skills");
    list_skills_from_dir(&skills_dir, "agent")
}

/// Surfaces discovered skills in the system prompt.
pub struct SkillsMiddleware {
    agent_root: Arc<PathBuf>,
}

impl SkillsMiddleware {
    pub fn new(agent_root: impl Into<PathBuf>) -> Self {
        Self {
            agent_root: Arc::new(agent_root.into()),
        }
    }
}

impl Middleware for SkillsMiddleware {
    fn name(&self) -> &'static str {
        "skills"
    }

    fn wrap_model_call(&self, request: ModelRequest) -> ModelRequest {
        if request.state.assistant_id.is_empty() {
            return request;
        }
        let skills = list_agent_skills(&self.agent_root, &request.state.assistant_id);
        if skills.is_empty() {
            return request;
        }
        let mut section = String::from(
            "## Skills\n\nSpecialized skills are available. Read a skill's SKILL.md with\nread_file when its description matches the task.\n\n",
        );
        for skill in &skills {
            section.push_str(&format!(
                "- **{}**: {} ({})\n",
                skill.name, skill.description, skill.path
            ));
        }
        request.append_system_prompt(&section)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::middleware::AgentState;

    fn write_skill(root: &Path, agent: &str, skill: &str, frontmatter: &str) {
        let dir = root.join(agent).join("skills").join(skill);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SKILL_FILE), frontmatter).unwrap();
    }

    #[test]
    fn discovers_valid_skills_and_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            dir.path(),
            "helper",
            "web-research",
            "---\nname: web-research\ndescription: Research topics on the web\n---\nSteps...",
        );
        write_skill(dir.path(), "helper", "broken", "no frontmatter at all");
        write_skill(
            dir.path(),
            "helper",
            "nameless",
            "---\ndescription: missing name\n---\nbody",
        );

        let skills = list_agent_skills(dir.path(), "helper");
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "web-research");
        assert!(skills[0].path.ends_with("SKILL.md"));
    }

    #[test]
    fn skills_of_other_agents_are_not_visible() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            dir.path(),
            "other",
            "secret",
            "---\nname: secret\ndescription: private skill\n---\nbody",
        );
        assert!(list_agent_skills(dir.path(), "helper").is_empty());
    }

    #[test]
    fn middleware_lists_skills_in_prompt() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(
            dir.path(),
            "helper",
            "sql",
            "---\nname: sql\ndescription: Write and tune SQL queries\n---\nbody",
        );
        let mw = SkillsMiddleware::new(dir.path());
        let request = ModelRequest {
            system_prompt: None,
            messages: vec![],
            state: AgentState {
                session_id: "s1".to_string(),
                assistant_id: "helper".to_string(),
            },
        };
        let out = mw.wrap_model_call(request);
        let prompt = out.system_prompt.unwrap();
        assert!(prompt.contains("## Skills"));
        assert!(prompt.contains("**sql**"));
    }

    #[test]
    fn agent_without_skills_leaves_prompt_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mw = SkillsMiddleware::new(dir.path());
        let request = ModelRequest {
            system_prompt: Some("base".to_string()),
            messages: vec![],
            state: AgentState {
                session_id: "s1".to_string(),
                assistant_id: "helper".to_string(),
            },
        };
        let out = mw.wrap_model_call(request);
        assert_eq!(out.system_prompt.as_deref(), Some("base"));
    }
}
