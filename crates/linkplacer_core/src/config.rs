use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "linkplacer/0.1";
pub const DEFAULT_SITE_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub placement: PlacementSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub server: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PlacementSection {
    #[serde(default)]
    pub excluded_article_types: Vec<String>,
    #[serde(default)]
    pub valid_content_areas: Vec<String>,
}

impl ToolConfig {
    /// Wiki API URL, `WIKI_API_URL` taking precedence over the config file.
    pub fn api_url(&self) -> Option<String> {
        env_override("WIKI_API_URL").or_else(|| self.wiki.api_url.clone())
    }

    /// Request user agent, `WIKI_USER_AGENT` taking precedence.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Public site base URL, configured or derived from the API URL.
    pub fn site_server(&self) -> Option<String> {
        if let Some(ref server) = self.site.server {
            return Some(server.trim_end_matches('/').to_string());
        }
        self.api_url().and_then(|api| derive_site_url(&api))
    }

    pub fn site_language(&self) -> &str {
        self.site
            .language
            .as_deref()
            .unwrap_or(DEFAULT_SITE_LANGUAGE)
    }

    pub fn excluded_article_types(&self) -> &[String] {
        &self.placement.excluded_article_types
    }

    pub fn valid_content_areas(&self) -> &[String] {
        &self.placement.valid_content_areas
    }
}

// Set-but-blank variables behave as unset.
fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Read the TOML config at `config_path`. A missing file loads as the
/// defaulted config; a malformed one is an error.
pub fn load_config(config_path: &Path) -> Result<ToolConfig> {
    if !config_path.exists() {
        return Ok(ToolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", config_path.display()))
}

#[derive(Debug, Clone, Default)]
pub struct ToolConfigPatch {
    pub set_api_url: Option<String>,
    pub set_server: Option<String>,
    pub set_language: Option<String>,
}

/// Apply the patch to the config file, touching only the keys it names and
/// leaving every other section as written. Returns `true` when the file
/// changed.
pub fn patch_config(config_path: &Path, patch: &ToolConfigPatch) -> Result<bool> {
    let mut edits: Vec<(&str, &str, &str)> = Vec::new();
    if let Some(api_url) = patch.set_api_url.as_deref() {
        if api_url.trim().is_empty() {
            bail!("api_url cannot be empty");
        }
        edits.push(("wiki", "api_url", api_url));
    }
    if let Some(server) = patch.set_server.as_deref() {
        edits.push(("site", "server", server));
    }
    if let Some(language) = patch.set_language.as_deref() {
        edits.push(("site", "language", language));
    }
    if edits.is_empty() {
        return Ok(false);
    }

    let mut root = read_raw_config(config_path)?;
    let original = root.clone();
    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!("top-level TOML must be a table in {}", config_path.display())
    })?;
    for (section, key, value) in edits {
        section_table(root_table, section, config_path)?
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    if root == original {
        return Ok(false);
    }
    write_raw_config(config_path, &root)?;
    Ok(true)
}

fn read_raw_config(config_path: &Path) -> Result<Value> {
    if !config_path.exists() {
        return Ok(Value::Table(toml::map::Map::new()));
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", config_path.display()))
}

fn write_raw_config(config_path: &Path, root: &Value) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = toml::to_string_pretty(root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))
}

fn section_table<'a>(
    root_table: &'a mut toml::map::Map<String, Value>,
    name: &str,
    config_path: &Path,
) -> Result<&'a mut toml::map::Map<String, Value>> {
    root_table
        .entry(name.to_string())
        .or_insert_with(|| Value::Table(toml::map::Map::new()))
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[{name}] must be a table in {}", config_path.display()))
}

/// Derive the public site base URL from an API URL by stripping `/w/api.php`
/// or `/api.php`. The longer suffix is tried first so a `/w` script path does
/// not survive into the derived URL.
pub fn derive_site_url(api_url: &str) -> Option<String> {
    let trimmed = api_url.trim();
    let stripped = trimmed
        .strip_suffix("/w/api.php")
        .or_else(|| trimmed.strip_suffix("/api.php"))
        .unwrap_or(trimmed);
    let base = stripped.trim_end_matches('/');
    if base.is_empty() {
        None
    } else {
        Some(base.to_string())
    }
}
