use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".planrun";

#[derive(Debug, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_merge_plan_updates")]
    pub merge_plan_updates: bool,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,
}

/// Approval section with operator-extended allowlist binaries.
///
/// ```toml
/// [approval]
/// allow = ["jq", "yq"]
/// ```
#[derive(Debug, Deserialize, Default)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub allow: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the API key; never the key itself.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
    #[serde(default = "default_max_consecutive_nudges")]
    pub max_consecutive_nudges: u32,
    #[serde(default = "default_subagent_max_passes")]
    pub subagent_max_passes: u32,
    #[serde(default = "default_subagent_max_depth")]
    pub subagent_max_depth: u32,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_merge_plan_updates() -> bool {
    true
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_passes() -> u32 {
    40
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_api_key_env() -> String {
    "PLANRUN_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    180
}

fn default_max_plan_steps() -> usize {
    64
}

fn default_max_consecutive_nudges() -> u32 {
    3
}

fn default_subagent_max_passes() -> u32 {
    10
}

fn default_subagent_max_depth() -> u32 {
    2
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            merge_plan_updates: default_merge_plan_updates(),
            auto_approve: false,
            shell: default_shell(),
            timeout_secs: default_timeout_secs(),
            max_passes: default_max_passes(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_plan_steps: default_max_plan_steps(),
            max_consecutive_nudges: default_max_consecutive_nudges(),
            subagent_max_passes: default_subagent_max_passes(),
            subagent_max_depth: default_subagent_max_depth(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub limits: Limits,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.planrun/config.toml` file and load
    /// it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    /// Directory that holds this project's runtime state (snapshot, logs,
    /// usage db), next to wherever the config was found or under `start`.
    pub fn state_dir(config_path: Option<&Path>, start: &Path) -> PathBuf {
        config_path
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| start.join(CONFIG_DIR))
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.defaults.model, "gpt-4o-mini");
        assert!(config.defaults.merge_plan_updates);
        assert!(!config.defaults.auto_approve);
        assert_eq!(config.defaults.shell, "/bin/sh");
        assert_eq!(config.defaults.timeout_secs, 120);
        assert_eq!(config.defaults.max_passes, 40);
        assert!(config.approval.allow.is_empty());
        assert_eq!(config.llm.api_key_env, "PLANRUN_API_KEY");
        assert_eq!(config.limits.max_plan_steps, 64);
        assert_eq!(config.limits.max_consecutive_nudges, 3);
        assert_eq!(config.limits.subagent_max_passes, 10);
        assert_eq!(config.limits.subagent_max_depth, 2);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[defaults]
model = "local-llama"
merge_plan_updates = false
auto_approve = true
shell = "/bin/bash"
timeout_secs = 45
max_passes = 12

[approval]
allow = ["jq"]

[llm]
endpoint = "http://localhost:8080/v1/chat/completions"
api_key_env = "LLAMA_KEY"
request_timeout_secs = 30

[limits]
max_plan_steps = 16
max_consecutive_nudges = 2
subagent_max_passes = 5
subagent_max_depth = 1
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.model, "local-llama");
        assert!(!config.defaults.merge_plan_updates);
        assert!(config.defaults.auto_approve);
        assert_eq!(config.defaults.shell, "/bin/bash");
        assert_eq!(config.defaults.timeout_secs, 45);
        assert_eq!(config.defaults.max_passes, 12);
        assert_eq!(config.approval.allow, vec!["jq"]);
        assert_eq!(config.llm.api_key_env, "LLAMA_KEY");
        assert_eq!(config.llm.request_timeout_secs, 30);
        assert_eq!(config.limits.max_plan_steps, 16);
        assert_eq!(config.limits.subagent_max_depth, 1);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[defaults]
model = "deepseek-chat"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.defaults.model, "deepseek-chat");
        assert!(config.defaults.merge_plan_updates);
        assert_eq!(config.limits.max_plan_steps, 64);
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".planrun");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[defaults]
auto_approve = true
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert!(config.defaults.auto_approve);
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.defaults.model, "gpt-4o-mini");
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".planrun");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("config.toml"),
            r#"
[defaults]
model = "nested"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("src").join("deep").join("nested");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.defaults.model, "nested");
    }

    #[test]
    fn state_dir_follows_the_config_location() {
        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join(".planrun").join("config.toml");
        assert_eq!(
            ProjectConfig::state_dir(Some(&config_path), Path::new("/elsewhere")),
            tmp.path().join(".planrun")
        );
        assert_eq!(
            ProjectConfig::state_dir(None, tmp.path()),
            tmp.path().join(".planrun")
        );
    }
}
