//! Command specifications: how a caller describes what a session should run.
//!
//! Callers send a loosely-typed [`SpecParts`] (every field optional, as it
//! arrives over HTTP or from CLI flags). It is validated once into a
//! [`CommandSpec`] whose [`CommandSource`] has exactly one active case, and
//! later resolved against the prebaked catalog into a [`ResolvedCommand`].
//!
//! Commands stay argument vectors all the way to the spawn. A raw command
//! line is split with shell quoting rules but never run through a shell.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::prebaked::PrebakedCatalog;
use crate::errors::ProgenyError;

/// Tool configuration overrides, passed to the instance as JSON.
pub type ToolConfig = BTreeMap<String, Value>;

/// Config keys the manager owns. Callers may never set them.
pub const RESERVED_CONFIG_KEYS: &[&str] = &["port"];

/// What to run, exactly one of three shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandSource {
    /// A raw recipe command line, e.g. `textcat.manual db data.jsonl --label A`.
    Raw(String),
    /// A named prebaked project from the catalog.
    Prebaked(String),
    /// An explicit recipe invocation.
    Recipe {
        recipe: String,
        args: Vec<String>,
        kwargs: BTreeMap<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub source: CommandSource,
    pub config: ToolConfig,
}

/// Unvalidated spec input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecParts {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub prebaked: Option<String>,
    #[serde(default)]
    pub recipe: Option<String>,
    #[serde(default)]
    pub recipe_args: Option<Vec<String>>,
    #[serde(default)]
    pub recipe_kwargs: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub config: Option<ToolConfig>,
}

impl SpecParts {
    pub fn into_spec(self) -> Result<CommandSpec, ProgenyError> {
        let recipe_form = self.recipe.is_some()
            || self.recipe_args.is_some()
            || self.recipe_kwargs.is_some();
        let forms: Vec<&str> = [
            (self.command.is_some(), "command"),
            (self.prebaked.is_some(), "prebaked"),
            (recipe_form, "recipe"),
        ]
        .into_iter()
        .filter_map(|(given, name)| given.then_some(name))
        .collect();

        if forms.len() > 1 {
            return Err(ProgenyError::AmbiguousSpec(format!(
                "got {}; supply only one",
                forms.join(" and ")
            )));
        }

        let config = self.config.unwrap_or_default();
        check_reserved_keys(&config)?;

        let source = if let Some(command) = self.command {
            CommandSource::Raw(command)
        } else if let Some(name) = self.prebaked {
            CommandSource::Prebaked(name)
        } else if recipe_form {
            let recipe = self.recipe.ok_or_else(|| {
                ProgenyError::IncompleteSpec("recipe arguments given without a recipe".into())
            })?;
            CommandSource::Recipe {
                recipe,
                args: self.recipe_args.unwrap_or_default(),
                kwargs: self.recipe_kwargs.unwrap_or_default(),
            }
        } else {
            return Err(ProgenyError::IncompleteSpec(
                "one of command, prebaked or recipe is required".into(),
            ));
        };

        let spec = CommandSpec { source, config };
        spec.validate()?;
        Ok(spec)
    }
}

/// Fully resolved command: recipe arguments and the merged tool config.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    /// Arguments passed to the tool, starting with the recipe name.
    pub args: Vec<String>,
    pub config: ToolConfig,
}

impl CommandSpec {
    pub fn raw(command: impl Into<String>) -> Self {
        Self {
            source: CommandSource::Raw(command.into()),
            config: ToolConfig::new(),
        }
    }

    pub fn prebaked(name: impl Into<String>) -> Self {
        Self {
            source: CommandSource::Prebaked(name.into()),
            config: ToolConfig::new(),
        }
    }

    pub fn recipe(
        recipe: impl Into<String>,
        args: Vec<String>,
        kwargs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            source: CommandSource::Recipe {
                recipe: recipe.into(),
                args,
                kwargs,
            },
            config: ToolConfig::new(),
        }
    }

    pub fn with_config(mut self, config: ToolConfig) -> Self {
        self.config = config;
        self
    }

    /// Structural checks that do not need the catalog.
    pub fn validate(&self) -> Result<(), ProgenyError> {
        match &self.source {
            CommandSource::Raw(command) => split_command(command).map(|_| ()),
            CommandSource::Prebaked(name) if name.trim().is_empty() => {
                Err(ProgenyError::IncompleteSpec("prebaked project name is empty".into()))
            }
            CommandSource::Recipe { recipe, .. } if recipe.trim().is_empty() => {
                Err(ProgenyError::IncompleteSpec("recipe name is empty".into()))
            }
            CommandSource::Recipe { args, kwargs, .. } if args.is_empty() && kwargs.is_empty() => {
                Err(ProgenyError::IncompleteSpec(
                    "recipe needs recipe_args or recipe_kwargs".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Resolve into concrete tool arguments and merged config.
    ///
    /// Prebaked config sits underneath caller config; the merged result must
    /// not contain a reserved key.
    pub fn resolve(&self, catalog: &PrebakedCatalog) -> Result<ResolvedCommand, ProgenyError> {
        self.validate()?;
        check_reserved_keys(&self.config)?;

        let (args, mut config) = match &self.source {
            CommandSource::Raw(command) => (split_command(command)?, ToolConfig::new()),
            CommandSource::Recipe {
                recipe,
                args,
                kwargs,
            } => (recipe_argv(recipe, args, kwargs), ToolConfig::new()),
            CommandSource::Prebaked(name) => {
                let project = catalog.get(name).ok_or_else(|| {
                    ProgenyError::IncompleteSpec(format!("unknown prebaked project '{}'", name))
                })?;
                (project.args.clone(), project.config.clone())
            }
        };

        config.extend(self.config.clone());
        check_reserved_keys(&config)?;
        Ok(ResolvedCommand { args, config })
    }
}

pub fn check_reserved_keys(config: &ToolConfig) -> Result<(), ProgenyError> {
    for key in RESERVED_CONFIG_KEYS {
        if config.contains_key(*key) {
            return Err(ProgenyError::ReservedConfigKey {
                key: (*key).to_string(),
            });
        }
    }
    Ok(())
}

/// Split a raw command line into arguments using shell quoting rules.
/// Nothing is expanded: `$(...)` and backquotes stay literal text.
pub fn split_command(command: &str) -> Result<Vec<String>, ProgenyError> {
    let args = shell_words::split(command)
        .map_err(|e| ProgenyError::MalformedCommand(format!("{}: {}", e, command)))?;
    if args.is_empty() {
        return Err(ProgenyError::IncompleteSpec("command is empty".into()));
    }
    Ok(args)
}

/// Quote an argument vector back into a single line for display and the registry.
pub fn display_command(argv: &[String]) -> String {
    shell_words::join(argv)
}

/// Build `recipe arg1 arg2 --key value --flag`.
///
/// Keys without a leading `--` get one. `true` becomes a bare flag,
/// `false` and `null` are omitted. Every value stays a single argument.
pub fn recipe_argv(recipe: &str, args: &[String], kwargs: &BTreeMap<String, Value>) -> Vec<String> {
    let mut parts = vec![recipe.to_string()];
    parts.extend(args.iter().cloned());
    for (key, value) in kwargs {
        let flag = if key.starts_with("--") {
            key.clone()
        } else {
            format!("--{}", key)
        };
        match value {
            Value::Bool(true) => parts.push(flag),
            Value::Bool(false) | Value::Null => {}
            Value::String(s) => {
                parts.push(flag);
                parts.push(s.clone());
            }
            other => {
                parts.push(flag);
                parts.push(other.to_string());
            }
        }
    }
    parts
}

/// Parse a `key=value` override. The value is read as JSON when it parses,
/// otherwise kept as a plain string.
pub fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
