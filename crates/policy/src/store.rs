use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::definition::{placeholders, NotifyTrigger, ToolBackend, ToolDefinition};
use crate::schema::{ArgsSchema, Pattern, PropType, PropertySpec};

/// Argument keys the engine claims for itself. Policies may not declare
/// properties under these names.
pub const CONFIRM_ARG_KEY: &str = "_confirm";

pub const DEFAULT_TIMEOUT_SEC: u64 = 30;
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10_000;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("cannot read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("policy file {path} is not valid YAML: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },
}

impl PolicyError {
    fn invalid(reason: impl Into<String>) -> Self {
        PolicyError::Invalid { reason: reason.into() }
    }
}

/// Global knobs from the policy file's `config` section, with defaults
/// filled in.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub default_timeout_sec: u64,
    pub output_truncate_limit: usize,
    pub security: SecurityConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_timeout_sec: DEFAULT_TIMEOUT_SEC,
            output_truncate_limit: DEFAULT_OUTPUT_LIMIT_BYTES,
            security: SecurityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub enable_path_validation: bool,
    pub allowed_paths: Vec<PathBuf>,
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<u8>,
}

/// One fully validated policy document. Immutable once built; reloads
/// produce a fresh `Policy` rather than mutating this one.
#[derive(Debug, Default)]
pub struct Policy {
    config: PolicyConfig,
    tools: BTreeMap<String, ToolDefinition>,
}

impl Policy {
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| PolicyError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&text, path)
    }

    /// Parses and validates a policy document from YAML text.
    /// `origin` only labels parse errors.
    pub fn from_yaml_str(text: &str) -> Result<Self, PolicyError> {
        Self::parse(text, Path::new("<inline>"))
    }

    fn parse(text: &str, origin: &Path) -> Result<Self, PolicyError> {
        let root: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|source| PolicyError::Yaml { path: origin.to_path_buf(), source })?;
        let mapping = root
            .as_mapping()
            .ok_or_else(|| PolicyError::invalid("policy root must be a YAML mapping"))?;

        for key in mapping.keys() {
            match key.as_str() {
                Some("config") | Some("tools") => {}
                Some(other) => {
                    return Err(PolicyError::invalid(format!(
                        "unknown top-level section '{other}'"
                    )))
                }
                None => return Err(PolicyError::invalid("top-level keys must be strings")),
            }
        }

        let config = match root.get("config") {
            Some(value) => build_config(
                serde_yaml::from_value::<RawConfig>(value.clone())
                    .map_err(|e| PolicyError::invalid(format!("config section: {e}")))?,
            )?,
            None => PolicyConfig::default(),
        };

        let tools_value = root
            .get("tools")
            .ok_or_else(|| PolicyError::invalid("missing required 'tools' section"))?;
        let tools_mapping = tools_value
            .as_mapping()
            .ok_or_else(|| PolicyError::invalid("'tools' must be a mapping of name to tool"))?;

        let mut tools = BTreeMap::new();
        for (key, value) in tools_mapping {
            let name = key
                .as_str()
                .ok_or_else(|| PolicyError::invalid("tool names must be strings"))?;
            let raw = serde_yaml::from_value::<RawTool>(value.clone())
                .map_err(|e| PolicyError::invalid(format!("tool '{name}': {e}")))?;
            let def = build_tool(name, raw)?;
            tools.insert(name.to_string(), def);
        }

        Ok(Policy { config, tools })
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Tools in name order.
    pub fn tools(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

/// Owns the active policy and the path it came from. Readers take cheap
/// `Arc` snapshots; a reload builds the replacement off to the side and
/// swaps it in only when the whole file validated.
#[derive(Debug)]
pub struct PolicyStore {
    path: PathBuf,
    active: RwLock<Arc<Policy>>,
}

impl PolicyStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PolicyError> {
        let path = path.into();
        let policy = Policy::from_file(&path)?;
        info!(path = %path.display(), tools = policy.tool_count(), "policy loaded");
        Ok(Self { path, active: RwLock::new(Arc::new(policy)) })
    }

    /// Re-reads the policy file. On any error the previously active
    /// policy stays in place untouched. Returns the new tool count.
    pub fn reload(&self) -> Result<usize, PolicyError> {
        let staged = match Policy::from_file(&self.path) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "policy reload failed, keeping active policy");
                return Err(e);
            }
        };
        let count = staged.tool_count();
        *self.active.write() = Arc::new(staged);
        info!(path = %self.path.display(), tools = count, "policy reloaded");
        Ok(count)
    }

    /// The policy as of this instant. In-flight requests keep the
    /// snapshot they started with even if a reload lands mid-request.
    pub fn snapshot(&self) -> Arc<Policy> {
        self.active.read().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    default_timeout_sec: Option<u64>,
    output_truncate_limit: Option<usize>,
    #[serde(default)]
    security: RawSecurity,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawSecurity {
    #[serde(default)]
    enable_path_validation: bool,
    #[serde(default)]
    allowed_paths: Vec<PathBuf>,
    max_memory_mb: Option<u64>,
    max_cpu_percent: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTool {
    description: String,
    #[serde(default)]
    args_schema: RawArgsSchema,
    command: Option<Vec<String>>,
    handler: Option<String>,
    #[serde(default)]
    mutates: bool,
    #[serde(default)]
    requires_confirm: bool,
    timeout_sec: Option<u64>,
    max_output_bytes: Option<usize>,
    #[serde(default)]
    notify: Vec<NotifyTrigger>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawArgsSchema {
    #[serde(rename = "type")]
    schema_type: Option<String>,
    #[serde(default)]
    properties: BTreeMap<String, RawProperty>,
    #[serde(default)]
    required: Vec<String>,
    #[serde(default = "default_additional", alias = "additionalProperties")]
    additional_properties: bool,
}

fn default_additional() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProperty {
    #[serde(rename = "type")]
    prop_type: PropType,
    description: Option<String>,
    #[serde(rename = "enum")]
    enum_values: Option<Vec<serde_json::Value>>,
    pattern: Option<String>,
    #[serde(alias = "minLength")]
    min_length: Option<usize>,
    #[serde(alias = "maxLength")]
    max_length: Option<usize>,
}

fn build_config(raw: RawConfig) -> Result<PolicyConfig, PolicyError> {
    if raw.default_timeout_sec == Some(0) {
        return Err(PolicyError::invalid("config: default_timeout_sec must be positive"));
    }
    if raw.output_truncate_limit == Some(0) {
        return Err(PolicyError::invalid("config: output_truncate_limit must be positive"));
    }
    if raw.security.max_memory_mb == Some(0) {
        return Err(PolicyError::invalid("config: max_memory_mb must be positive"));
    }
    if let Some(pct) = raw.security.max_cpu_percent {
        if pct == 0 || pct > 100 {
            return Err(PolicyError::invalid("config: max_cpu_percent must be 1-100"));
        }
    }
    Ok(PolicyConfig {
        default_timeout_sec: raw.default_timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SEC),
        output_truncate_limit: raw.output_truncate_limit.unwrap_or(DEFAULT_OUTPUT_LIMIT_BYTES),
        security: SecurityConfig {
            enable_path_validation: raw.security.enable_path_validation,
            allowed_paths: raw.security.allowed_paths,
            max_memory_mb: raw.security.max_memory_mb,
            max_cpu_percent: raw.security.max_cpu_percent,
        },
    })
}

fn build_tool(name: &str, raw: RawTool) -> Result<ToolDefinition, PolicyError> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PolicyError::invalid(format!(
            "tool name '{name}' must be non-empty and contain no whitespace"
        )));
    }

    let backend = match (raw.command, raw.handler) {
        (Some(command), None) => {
            if command.is_empty() {
                return Err(PolicyError::invalid(format!(
                    "tool '{name}': command must have at least one element"
                )));
            }
            ToolBackend::Command(command)
        }
        (None, Some(handler)) => {
            if handler.is_empty() {
                return Err(PolicyError::invalid(format!(
                    "tool '{name}': handler name must be non-empty"
                )));
            }
            ToolBackend::Builtin(handler)
        }
        (Some(_), Some(_)) => {
            return Err(PolicyError::invalid(format!(
                "tool '{name}': 'command' and 'handler' are mutually exclusive"
            )))
        }
        (None, None) => {
            return Err(PolicyError::invalid(format!(
                "tool '{name}': either 'command' or 'handler' is required"
            )))
        }
    };

    if raw.timeout_sec == Some(0) {
        return Err(PolicyError::invalid(format!("tool '{name}': timeout_sec must be positive")));
    }
    if raw.max_output_bytes == Some(0) {
        return Err(PolicyError::invalid(format!(
            "tool '{name}': max_output_bytes must be positive"
        )));
    }

    let args_schema = build_schema(name, raw.args_schema)?;

    if let ToolBackend::Command(template) = &backend {
        for element in template {
            for placeholder in placeholders(element) {
                if !args_schema.properties.contains_key(&placeholder) {
                    return Err(PolicyError::invalid(format!(
                        "tool '{name}': command references undeclared argument '{{{placeholder}}}'"
                    )));
                }
            }
        }
    }

    Ok(ToolDefinition {
        name: name.to_string(),
        description: raw.description,
        args_schema,
        backend,
        mutates: raw.mutates,
        requires_confirm: raw.requires_confirm,
        timeout_sec: raw.timeout_sec,
        max_output_bytes: raw.max_output_bytes,
        notify: raw.notify.into_iter().collect::<BTreeSet<_>>(),
    })
}

fn build_schema(tool: &str, raw: RawArgsSchema) -> Result<ArgsSchema, PolicyError> {
    if let Some(schema_type) = &raw.schema_type {
        if schema_type != "object" {
            return Err(PolicyError::invalid(format!(
                "tool '{tool}': args_schema type must be 'object', got '{schema_type}'"
            )));
        }
    }

    let mut properties = BTreeMap::new();
    for (prop_name, raw_prop) in raw.properties {
        if prop_name == CONFIRM_ARG_KEY {
            return Err(PolicyError::invalid(format!(
                "tool '{tool}': argument name '{CONFIRM_ARG_KEY}' is reserved"
            )));
        }
        if let (Some(min), Some(max)) = (raw_prop.min_length, raw_prop.max_length) {
            if min > max {
                return Err(PolicyError::invalid(format!(
                    "tool '{tool}': property '{prop_name}': min_length exceeds max_length"
                )));
            }
        }
        if let Some(values) = &raw_prop.enum_values {
            if values.is_empty() {
                return Err(PolicyError::invalid(format!(
                    "tool '{tool}': property '{prop_name}': enum must not be empty"
                )));
            }
            for value in values {
                if !raw_prop.prop_type.matches(value) {
                    return Err(PolicyError::invalid(format!(
                        "tool '{tool}': property '{prop_name}': enum value {value} is not a {}",
                        raw_prop.prop_type.name()
                    )));
                }
            }
        }
        let pattern = match raw_prop.pattern {
            Some(source) => {
                let regex = Regex::new(&source).map_err(|e| {
                    PolicyError::invalid(format!(
                        "tool '{tool}': property '{prop_name}': invalid pattern: {e}"
                    ))
                })?;
                Some(Pattern { source, regex })
            }
            None => None,
        };
        properties.insert(
            prop_name,
            PropertySpec {
                prop_type: raw_prop.prop_type,
                description: raw_prop.description,
                enum_values: raw_prop.enum_values,
                pattern,
                min_length: raw_prop.min_length,
                max_length: raw_prop.max_length,
            },
        );
    }

    for required in &raw.required {
        if !properties.contains_key(required) {
            return Err(PolicyError::invalid(format!(
                "tool '{tool}': required argument '{required}' is not declared in properties"
            )));
        }
    }

    Ok(ArgsSchema {
        properties,
        required: raw.required,
        additional_properties: raw.additional_properties,
    })
}
