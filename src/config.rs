//! Project configuration from `config/spindle.toml`.
//!
//! Every field has a default so a project with no config file still
//! builds. Regex rewrites are compiled once at load time; a pattern that
//! fails to compile aborts startup rather than silently dropping the rule.
//!
//! # Example
//!
//! ```toml
//! domain = "https://example.com"
//! port = 3011
//! draft_marker = "_"
//! tag_path = "tag"
//!
//! image_quality = 85
//! image_max_size = 1600
//! image_format = "webp"
//! image_rewrite_extensions = ["jpg", "png"]
//!
//! [dates]
//! short = "MMM D"
//! long = "MMMM D, YYYY"
//!
//! [[rewrites]]
//! pattern = '\[(.+?)\]\((.+?)\)'
//! template = '<a href="$2">$1</a>'
//! ```

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Markup source extension.
pub const EXTENSION: &str = "x";

pub const SOURCE_DIR: &str = "source";
pub const CONFIG_DIR: &str = "config";
pub const CONFIG_FILE: &str = "config/spindle.toml";
/// Optional markup file whose top-level declarations seed the bottom
/// scope frame of every page.
pub const GLOBAL_DECLS: &str = "config/spindle.x";
pub const TEMPLATE_DIR: &str = "config/templates";
pub const PARTIAL_DIR: &str = "config/partials";
pub const PLATE_DIR: &str = "config/plates";
pub const SCRIPT_DIR: &str = "config/scripts";
pub const DEFAULT_OUTPUT: &str = "public";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    Parse(String, toml::de::Error),
}

/// Target codec for image rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCodec {
    Png,
    #[serde(alias = "jpeg")]
    Jpg,
    Webp,
}

impl ImageCodec {
    pub fn extension(self) -> &'static str {
        match self {
            ImageCodec::Png => "png",
            ImageCodec::Jpg => "jpg",
            ImageCodec::Webp => "webp",
        }
    }
}

/// A user-supplied pattern/template pair applied to final page output.
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    pub template: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Domain used for absolute URL assembly and the sitemap.
    pub domain: String,

    /// Dev server port.
    pub port: u16,

    /// Output directory, overridable by `build [public-dir]`.
    pub output: String,

    /// Prefix on a base name that marks the file as a draft.
    pub draft_marker: String,

    /// Leading path segment for taginator output pages.
    pub tag_path: String,

    /// Default quality for generated images.
    pub image_quality: u8,

    /// Default bound on the longest image dimension; 0 leaves images
    /// unscaled.
    pub image_max_size: u32,

    /// Codec every rewritten image converges on, when set.
    pub image_format: Option<ImageCodec>,

    /// Source extensions that trigger image rewriting during asset
    /// dispatch.
    pub image_rewrite_extensions: Vec<String>,

    /// Named date formats usable as `%{date:name}`.
    pub dates: HashMap<String, String>,

    /// Regex rewrites applied to final page text before write.
    pub rewrites: Vec<RewriteRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: String::new(),
            port: 3011,
            output: DEFAULT_OUTPUT.to_owned(),
            draft_marker: "_".to_owned(),
            tag_path: "tag".to_owned(),
            image_quality: 90,
            image_max_size: 0,
            image_format: None,
            image_rewrite_extensions: Vec::new(),
            dates: HashMap::new(),
            rewrites: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(origin.to_owned(), e))
    }

    /// Load `config/spindle.toml` relative to `root`, falling back to
    /// defaults when the file does not exist.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::from_str(&content, &path.display().to_string())
    }

    /// Compile the rewrite rules. Called once per build.
    pub fn compile_rewrites(&self) -> Result<Vec<(Regex, String)>> {
        self.rewrites
            .iter()
            .map(|rule| {
                let re = Regex::new(&rule.pattern)
                    .with_context(|| format!("bad rewrite pattern {:?}", rule.pattern))?;
                Ok((re, rule.template.clone()))
            })
            .collect()
    }

    /// Look up a named date format; the unnamed default is ISO.
    pub fn date_format(&self, name: Option<&str>) -> Option<&str> {
        match name {
            Some(name) => self.dates.get(name).map(String::as_str),
            None => Some("YYYY-MM-DD"),
        }
    }
}

/// Apply compiled rewrite rules to rendered page text.
pub fn apply_rewrites(rules: &[(Regex, String)], input: String) -> String {
    let mut text = input;
    for (re, template) in rules {
        text = re.replace_all(&text, template.as_str()).into_owned();
    }
    text
}
