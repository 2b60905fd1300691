use relay_shared::{AgentMetadata, Channel, ModelTier};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const MAX_CALL_TIMEOUT_SECS: u64 = 300;
const MAX_NAME_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 1000;

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

/// Optional protocol methods the subprocess implements. Disabled hooks fall
/// back to the trait defaults without a round-trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct HookFlags {
    #[serde(default)]
    pub validate_input: bool,
    #[serde(default)]
    pub post_process: bool,
    #[serde(default)]
    pub health_check: bool,
}

/// One `[[agents]]` entry of a descriptor file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub model_tier: Option<ModelTier>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Defaults to the directory containing the descriptor file.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub hooks: HookFlags,

    /// Descriptor file this entry came from.
    #[serde(skip)]
    pub source: PathBuf,
    /// File stem of `source`.
    #[serde(skip)]
    pub namespace: String,
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    agents: Vec<AgentDescriptor>,
}

impl AgentDescriptor {
    fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("agent name must not be empty");
        }
        if self.name.len() > MAX_NAME_LEN {
            anyhow::bail!("agent name exceeds {} chars", MAX_NAME_LEN);
        }
        if self.description.len() > MAX_DESCRIPTION_LEN {
            anyhow::bail!("description of '{}' exceeds {} chars", self.name, MAX_DESCRIPTION_LEN);
        }
        if self.command.trim().is_empty() {
            anyhow::bail!("agent '{}' has an empty command", self.name);
        }
        if self.call_timeout_secs == 0 || self.call_timeout_secs > MAX_CALL_TIMEOUT_SECS {
            anyhow::bail!(
                "call_timeout_secs of '{}' must be between 1 and {} (got {})",
                self.name,
                MAX_CALL_TIMEOUT_SECS,
                self.call_timeout_secs
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        match &self.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.source_dir().join(dir),
            None => self.source_dir(),
        }
    }

    fn source_dir(&self) -> PathBuf {
        match self.source.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Metadata advertised for this entry. No channels means every channel.
    #[must_use]
    pub fn metadata(&self) -> AgentMetadata {
        let channels: Vec<Channel> = if self.channels.is_empty() {
            Channel::ALL.to_vec()
        } else {
            self.channels.clone()
        };
        let mut tags = self.tags.clone();
        if !tags.iter().any(|t| t == "subprocess") {
            tags.push("subprocess".to_string());
        }

        AgentMetadata::new(&self.name, &self.version, &self.description)
            .with_capabilities(self.capabilities.iter().cloned())
            .with_tier(self.model_tier.unwrap_or(ModelTier::Standard))
            .with_channels(channels)
            .with_tags(tags)
    }
}

/// Parses one descriptor file. Any invalid entry rejects the whole file.
pub fn parse_descriptor(path: &Path, contents: &str) -> anyhow::Result<Vec<AgentDescriptor>> {
    let file: DescriptorFile = toml::from_str(contents)
        .map_err(|e| anyhow::anyhow!("Invalid descriptor {}: {}", path.display(), e))?;

    let namespace = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let mut agents = Vec::with_capacity(file.agents.len());
    for mut agent in file.agents {
        agent
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid descriptor {}: {}", path.display(), e))?;
        if !seen.insert(agent.name.clone()) {
            anyhow::bail!("Invalid descriptor {}: duplicate agent '{}'", path.display(), agent.name);
        }
        agent.source = path.to_path_buf();
        agent.namespace = namespace.clone();
        agents.push(agent);
    }
    Ok(agents)
}

pub fn read_descriptor(path: &Path) -> anyhow::Result<Vec<AgentDescriptor>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read descriptor {}: {}", path.display(), e))?;
    parse_descriptor(path, &contents)
}
