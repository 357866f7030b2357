use crate::job::ToolSelection;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// How a declared parameter is rendered into the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Text,
    Number,
    Boolean,
    Multiline,
    Password,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub default: Option<String>,
    /// Literal flag emitted when a boolean parameter is true / false.
    #[serde(default)]
    pub cli_true: Option<String>,
    #[serde(default)]
    pub cli_false: Option<String>,
    /// Per-line format for multiline parameters, e.g. `-H {value}`.
    #[serde(default)]
    pub cli_format: Option<String>,
}

/// Declarative template describing how to invoke one external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub name: String,
    pub command_template: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Command must be interpreted by a shell instead of executed as
    /// a literal argument vector.
    #[serde(default)]
    pub needs_shell: bool,
    /// Informational only; surfaced in listings, never enforced.
    #[serde(default)]
    pub dangerous: bool,
    #[serde(default)]
    pub description: String,
}

/// A named preset: a tool list plus per-tool parameter and extra-arg
/// overrides, expanded into selections at job creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub tools: Vec<String>,
    #[serde(default)]
    pub params_override: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    tools: Vec<ToolDefinition>,
    #[serde(default)]
    profiles: Vec<ProfileDefinition>,
}

/// Static, read-only mapping from tool id to definition (plus named
/// profiles), loaded once before any job starts.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tools: BTreeMap<String, ToolDefinition>,
    profiles: BTreeMap<String, ProfileDefinition>,
}

impl Catalog {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read tool catalog {}", path.display()))?;
        let file: CatalogFile = serde_yaml::from_str(&contents)
            .with_context(|| format!("invalid tool catalog {}", path.display()))?;
        Self::from_parts(file.tools, file.profiles)
    }

    pub fn from_definitions(definitions: Vec<ToolDefinition>) -> Result<Self> {
        Self::from_parts(definitions, Vec::new())
    }

    pub fn from_parts(
        definitions: Vec<ToolDefinition>,
        profiles: Vec<ProfileDefinition>,
    ) -> Result<Self> {
        if definitions.is_empty() {
            bail!("tool catalog must contain at least one tool");
        }

        let mut tools = BTreeMap::new();
        for def in definitions {
            validate_definition(&def)?;
            if tools.insert(def.id.clone(), def.clone()).is_some() {
                bail!("duplicate tool id '{}' in catalog", def.id);
            }
        }

        let mut profile_map = BTreeMap::new();
        for profile in profiles {
            if profile.id.is_empty() {
                bail!("profile id cannot be empty");
            }
            if profile.tools.is_empty() {
                bail!("profile '{}' lists no tools", profile.id);
            }
            if profile_map
                .insert(profile.id.clone(), profile.clone())
                .is_some()
            {
                bail!("duplicate profile id '{}' in catalog", profile.id);
            }
        }

        Ok(Self {
            tools,
            profiles: profile_map,
        })
    }

    pub fn get(&self, id: &str) -> Option<&ToolDefinition> {
        self.tools.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn profile(&self, id: &str) -> Option<&ProfileDefinition> {
        self.profiles.get(id)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ProfileDefinition> {
        self.profiles.values()
    }

    /// Expands a profile into one selection per listed tool, carrying
    /// the profile's per-tool parameter and extra-arg overrides. A
    /// profile tool missing from the catalog is skipped with a
    /// warning; a profile that expands to nothing is an error.
    pub fn expand_profile(&self, profile_id: &str) -> Result<Vec<ToolSelection>> {
        let profile = self
            .profile(profile_id)
            .with_context(|| format!("no profile with id '{profile_id}' in the catalog"))?;

        let mut selections = Vec::new();
        for tool_id in &profile.tools {
            if self.get(tool_id).is_none() {
                warn!("tool '{tool_id}' from profile '{profile_id}' is not in the catalog, skipping");
                continue;
            }
            let mut selection = ToolSelection::new(tool_id.clone());
            if let Some(overrides) = profile.params_override.get(tool_id) {
                selection.params = overrides.clone();
            }
            if let Some(extra) = profile.extra_args.get(tool_id) {
                selection.extra_args = extra.clone();
            }
            selections.push(selection);
        }

        if selections.is_empty() {
            bail!("profile '{profile_id}' expands to no usable tools");
        }
        Ok(selections)
    }
}

fn validate_definition(def: &ToolDefinition) -> Result<()> {
    if def.id.is_empty() {
        bail!("tool id cannot be empty");
    }
    if def.name.is_empty() {
        bail!("tool '{}' display name cannot be empty", def.id);
    }
    if def.command_template.trim().is_empty() {
        bail!("tool '{}' command template cannot be empty", def.id);
    }
    if let Some(timeout) = def.timeout_secs {
        if timeout == 0 {
            bail!("tool '{}' timeout must be greater than 0", def.id);
        }
    }
    for param in &def.params {
        if param.name.is_empty() {
            bail!("tool '{}' has a parameter with an empty name", def.id);
        }
        if param.kind == ParamKind::Boolean && param.cli_true.is_none() && param.cli_false.is_none()
        {
            bail!(
                "boolean parameter '{}' of tool '{}' needs cli_true or cli_false",
                param.name,
                def.id
            );
        }
    }
    Ok(())
}
