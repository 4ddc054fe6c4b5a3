//! Prebaked projects and recipe discovery.
//!
//! A prebaked project is a YAML file naming a ready-made command:
//!
//! ```yaml
//! name: news-headlines
//! recipe: textcat.manual
//! recipe_args: [news_db, headlines.jsonl]
//! recipe_kwargs:
//!   label: POLITICS,SPORTS
//! config:
//!   batch_size: 5
//! ```
//!
//! or, instead of the recipe triple, `command: "textcat.manual news_db headlines.jsonl"`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::command::{CommandSource, SpecParts, ToolConfig, display_command, recipe_argv, split_command};

/// Files whose name matches this are helpers, not recipes.
pub const DEFAULT_RECIPE_EXCLUDE: &str = "^(_|loader).*";

#[derive(Debug, Clone, PartialEq)]
pub struct PrebakedProject {
    pub name: String,
    /// Recipe arguments, starting with the recipe name.
    pub args: Vec<String>,
    pub config: ToolConfig,
    pub source: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PrebakedDescriptor {
    name: Option<String>,
    command: Option<String>,
    recipe: Option<String>,
    recipe_args: Option<Vec<String>>,
    recipe_kwargs: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    config: ToolConfig,
}

impl PrebakedProject {
    /// Parse one descriptor. Returns a reason string when the document is
    /// YAML but not a usable prebaked project.
    pub fn parse(content: &str, source: &Path) -> std::result::Result<Self, String> {
        let descriptor: PrebakedDescriptor =
            serde_yaml::from_str(content).map_err(|e| format!("not a prebaked YAML file: {}", e))?;

        let name = descriptor
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| "missing 'name'".to_string())?;

        let parts = SpecParts {
            command: descriptor.command,
            prebaked: None,
            recipe: descriptor.recipe,
            recipe_args: descriptor.recipe_args,
            recipe_kwargs: descriptor.recipe_kwargs,
            config: None,
        };
        let spec = parts.into_spec().map_err(|e| e.to_string())?;
        let args = match spec.source {
            CommandSource::Raw(command) => split_command(&command).map_err(|e| e.to_string())?,
            CommandSource::Recipe {
                recipe,
                args,
                kwargs,
            } => recipe_argv(&recipe, &args, &kwargs),
            CommandSource::Prebaked(_) => return Err("prebaked projects cannot nest".into()),
        };

        Ok(Self {
            name,
            args,
            config: descriptor.config,
            source: source.to_path_buf(),
        })
    }

    /// The recipe arguments quoted into one line.
    pub fn command(&self) -> String {
        display_command(&self.args)
    }
}

/// All prebaked projects found under a directory, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PrebakedCatalog {
    projects: BTreeMap<String, PrebakedProject>,
}

impl PrebakedCatalog {
    /// Walk `dir` and load every file that parses as a prebaked project.
    /// Files that do not are skipped with a warning.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut catalog = Self::default();
        if !dir.exists() {
            warn!(dir = %dir.display(), "Prebaked directory does not exist");
            return Ok(catalog);
        }
        info!(dir = %dir.display(), "Looking for prebaked projects");

        let mut files: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        for path in files {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unreadable prebaked file");
                    continue;
                }
            };
            match PrebakedProject::parse(&content, &path) {
                Ok(project) => catalog.insert(project),
                Err(reason) => {
                    warn!(file = %path.display(), %reason, "Not a prebaked project file");
                }
            }
        }

        info!(
            count = catalog.len(),
            names = ?catalog.names(),
            "Prebaked projects loaded"
        );
        Ok(catalog)
    }

    /// Add a project. The first project registered under a name wins.
    pub fn insert(&mut self, project: PrebakedProject) {
        if let Some(existing) = self.projects.get(&project.name) {
            warn!(
                name = %project.name,
                kept = %existing.source.display(),
                ignored = %project.source.display(),
                "Duplicate prebaked project name"
            );
            return;
        }
        self.projects.insert(project.name.clone(), project);
    }

    pub fn get(&self, name: &str) -> Option<&PrebakedProject> {
        self.projects.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.projects.keys().cloned().collect()
    }

    pub fn projects(&self) -> impl Iterator<Item = &PrebakedProject> {
        self.projects.values()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

/// A recipe file is any `.py` file whose name does not match `exclude`.
pub fn is_recipe(file_name: &str, exclude: Option<&Regex>) -> bool {
    if !file_name.ends_with(".py") {
        return false;
    }
    exclude.is_none_or(|pattern| !pattern.is_match(file_name))
}

/// Collect custom recipe files under `dir`, sorted by path.
pub fn discover_recipes(dir: &Path, exclude: Option<&str>) -> Result<Vec<PathBuf>> {
    let exclude = exclude
        .map(Regex::new)
        .transpose()
        .context("Invalid recipe exclude pattern")?;

    if !dir.exists() {
        warn!(dir = %dir.display(), "Recipe directory does not exist");
        return Ok(Vec::new());
    }
    info!(dir = %dir.display(), "Looking for recipes");

    let mut recipes: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_recipe(&entry.file_name().to_string_lossy(), exclude.as_ref()))
        .map(|entry| entry.into_path())
        .collect();
    recipes.sort();

    info!(count = recipes.len(), "Recipe files found");
    Ok(recipes)
}
