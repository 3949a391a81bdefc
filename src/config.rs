//! Purpose: Resolve plugin options from defaults and an optional JSON config.
//! Exports: `PluginOptions`, `IdFilter`, `DEFAULT_OUTPUT`, `DEFAULT_INCLUDE`, `DEFAULT_EXCLUDE`.
//! Role: Single place where user-facing option names (camelCase) map onto typed values.
//! Invariants: Options are validated once at load; a loaded `PluginOptions` is always usable.
//! Invariants: `transformRules` keeps the declaration order of the config file.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::de::{self, Deserializer, MapAccess, Visitor};

use crate::error::{Error, ErrorKind};
use crate::transcode::TransformRules;

pub const DEFAULT_OUTPUT: &str = "src/css/uno.css";
pub const DEFAULT_INCLUDE: &[&str] = &[r"\.(ux|[jt]sx|html)($|\?)"];
pub const DEFAULT_EXCLUDE: &[&str] = &[r"[\\/]node_modules[\\/]", r"[\\/]\.git[\\/]"];

static DEFAULT_FILTER: LazyLock<IdFilter> = LazyLock::new(|| {
    IdFilter::new(DEFAULT_INCLUDE, DEFAULT_EXCLUDE).expect("default filter patterns compile")
});

/// Include/exclude regexes over module ids.
#[derive(Clone, Debug)]
pub struct IdFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl IdFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, Error> {
        Ok(Self {
            include: compile_all(include, "include")?,
            exclude: compile_all(exclude, "exclude")?,
        })
    }

    /// An empty include list admits every id not excluded.
    pub fn matches(&self, id: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(id));
        included && !self.exclude.iter().any(|re| re.is_match(id))
    }
}

impl Default for IdFilter {
    fn default() -> Self {
        DEFAULT_FILTER.clone()
    }
}

fn compile_all<S: AsRef<str>>(patterns: &[S], option: &str) -> Result<Vec<Regex>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern.as_ref()).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid `{option}` pattern {:?}", pattern.as_ref()))
                    .with_source(err)
            })
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct PluginOptions {
    /// Stylesheet that carries the all-layers placeholder.
    pub uno_css_output: PathBuf,
    pub transform_rules: TransformRules,
    pub filter: IdFilter,
    /// Project root; relative paths and build asset paths are resolved against it.
    pub root: PathBuf,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            uno_css_output: PathBuf::from(DEFAULT_OUTPUT),
            transform_rules: TransformRules::default(),
            filter: IdFilter::default(),
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawOptions {
    uno_css_output: Option<PathBuf>,
    transform_rules: Option<OrderedRules>,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    root: Option<PathBuf>,
}

/// `{ ".": "-d-", ... }` with entry order kept.
#[derive(Debug, Default)]
struct OrderedRules(Vec<(String, String)>);

impl<'de> Deserialize<'de> for OrderedRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RulesVisitor;

        impl<'de> Visitor<'de> for RulesVisitor {
            type Value = OrderedRules;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping single characters to replacement strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut rules = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, String>()? {
                    if key.chars().count() != 1 {
                        return Err(de::Error::custom(format!(
                            "transform rule key {key:?} must be a single character"
                        )));
                    }
                    rules.push((key, value));
                }
                Ok(OrderedRules(rules))
            }
        }

        deserializer.deserialize_map(RulesVisitor)
    }
}

impl PluginOptions {
    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let raw: RawOptions = serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid options: {err}"))
                .with_source(err)
        })?;
        Self::from_raw(raw)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read config")
                .with_path(path)
                .with_source(err)
        })?;
        Self::from_json_str(&text).map_err(|err| err.with_path(path))
    }

    fn from_raw(raw: RawOptions) -> Result<Self, Error> {
        let mut options = Self::default();
        if let Some(output) = raw.uno_css_output {
            options.uno_css_output = output;
        }
        if let Some(rules) = raw.transform_rules {
            options.transform_rules = TransformRules::from_pairs(rules.0)?;
        }
        if raw.include.is_some() || raw.exclude.is_some() {
            let include = match raw.include {
                Some(include) => include,
                None => DEFAULT_INCLUDE.iter().map(|s| s.to_string()).collect(),
            };
            let exclude = match raw.exclude {
                Some(exclude) => exclude,
                None => DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect(),
            };
            options.filter = IdFilter::new(&include, &exclude)?;
        }
        if let Some(root) = raw.root {
            options.root = root;
        }
        Ok(options)
    }

    /// Output stylesheet path, resolved against `root` when relative.
    pub fn output_path(&self) -> PathBuf {
        self.root.join(&self.uno_css_output)
    }
}
