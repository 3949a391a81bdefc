//! Purpose: Substitute resolved layer CSS into emitted assets and fix up class-list literals.
//! Exports: `HostAdapter`, `AssetOutput`, `RewriteContext`, `AssetRewrite`, `FinalizeReport`,
//! `rewrite_asset`, `finalize_assets`, `ALL_ASSETS`.
//! Role: Pure text surgery run once per build after generation; no token or task state here.
//! Invariants: Pass 1 locates spans with the placeholder grammar; pass 2 splices strings.
//! Invariants: Tuple-array spans are resolved before object-map matching runs, so a span is
//! serialized by exactly one adapter.
//! Invariants: Only assets holding a hash or layer placeholder are rewritten; class lists in
//! any other asset (vendor chunks included) are left byte-identical.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind};
use crate::generator::{GeneratedCss, JsonStyle, StyleParser};
use crate::layers::{LAYER_MARK_ALL, strip_hash_placeholders};
use crate::transcode::{TransformRules, transcode_class_lists};

/// Bundler name for the "all assets" aggregate; never a real file.
pub const ALL_ASSETS: &str = "*";

static OBJECT_MAP_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r##""#--unocss--"\s*:\s*\{\s*"layer"\s*:\s*"([^"]*)"\s*\}"##)
        .expect("object-map placeholder pattern compiles")
});

static TUPLE_ARRAY_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r##"\[\s*\[\s*\[\s*\d+\s*,\s*"#?--unocss--"\s*\]\s*\]\s*,\s*\{\s*"layer"\s*:\s*"([^"]*)"\s*\}\s*\]"##,
    )
    .expect("tuple-array placeholder pattern compiles")
});

/// Serialized form of resolved CSS, chosen by which placeholder shape matched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostAdapter {
    /// Object body without braces, spliced into the surrounding style object.
    ObjectMap,
    /// Comma-joined `[[[0, "<class>"]], <declarations>]` entries.
    TupleArray,
}

impl HostAdapter {
    /// Resolution order.
    pub const ALL: [HostAdapter; 2] = [HostAdapter::TupleArray, HostAdapter::ObjectMap];

    pub fn pattern(self) -> &'static Regex {
        match self {
            HostAdapter::ObjectMap => &OBJECT_MAP_PLACEHOLDER,
            HostAdapter::TupleArray => &TUPLE_ARRAY_PLACEHOLDER,
        }
    }

    pub fn serialize(self, style: &JsonStyle) -> Result<String, Error> {
        match self {
            HostAdapter::ObjectMap => {
                let json = to_json(style)?;
                Ok(json
                    .strip_prefix('{')
                    .and_then(|body| body.strip_suffix('}'))
                    .unwrap_or(&json)
                    .to_string())
            }
            HostAdapter::TupleArray => {
                let mut entries = Vec::with_capacity(style.len());
                for (selector, declarations) in style {
                    let class = selector.strip_prefix('.').unwrap_or(selector);
                    entries.push(format!(
                        "[[[0, {}]], {}]",
                        to_json(class)?,
                        to_json(declarations)?
                    ));
                }
                Ok(entries.join(","))
            }
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to serialize style")
            .with_source(err)
    })
}

/// The bundler's set of emitted assets.
pub trait AssetOutput {
    fn asset_names(&self) -> Vec<String>;
    fn source(&self, name: &str) -> Option<Cow<'_, str>>;
    fn replace(&mut self, name: &str, content: String);
}

impl AssetOutput for BTreeMap<String, String> {
    fn asset_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn source(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(|content| Cow::Borrowed(content.as_str()))
    }

    fn replace(&mut self, name: &str, content: String) {
        self.insert(name.to_string(), content);
    }
}

/// Everything finalize needs besides the asset text.
pub struct RewriteContext<'a> {
    pub styles: &'a dyn GeneratedCss,
    pub entry_layers: &'a [String],
    pub parser: &'a dyn StyleParser,
    pub rules: &'a TransformRules,
    pub root: &'a Path,
}

impl RewriteContext<'_> {
    fn layer_css(&self, layer: &str) -> String {
        if layer == LAYER_MARK_ALL {
            self.styles.layers(None, self.entry_layers)
        } else {
            self.styles.layer(layer).unwrap_or_default()
        }
    }

    fn resolve(&self, layer: &str, adapter: HostAdapter, asset: &str) -> Result<String, Error> {
        let css = self.layer_css(layer);
        let file_path = self.root.join("build").join(asset);
        let style = self.parser.parse(&css, &file_path).map_err(|err| {
            let err = err.with_layer(layer);
            if err.css().is_some() {
                err
            } else {
                err.with_css(css.clone())
            }
        })?;
        adapter.serialize(&style)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AssetRewrite {
    pub code: String,
    pub layers_resolved: usize,
    pub hashes_stripped: usize,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FinalizeReport {
    pub tokens: usize,
    pub assets_rewritten: Vec<String>,
    pub layers_resolved: usize,
}

impl FinalizeReport {
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "tokens": self.tokens,
            "assets_rewritten": self.assets_rewritten,
            "layers_resolved": self.layers_resolved,
        })
    }
}

/// Rewrites one asset. `None` when it holds no placeholder or its text did not change.
pub fn rewrite_asset(
    name: &str,
    code: &str,
    ctx: &RewriteContext<'_>,
) -> Result<Option<AssetRewrite>, Error> {
    let (stripped, hashes_stripped) = strip_hash_placeholders(code);
    let mut current = stripped.into_owned();
    let mut layers_resolved = 0;
    for adapter in HostAdapter::ALL {
        let (next, resolved) = substitute(&current, adapter, |layer| {
            ctx.resolve(layer, adapter, name)
        })?;
        if resolved > 0 {
            layers_resolved += resolved;
            current = next;
        }
    }
    if hashes_stripped == 0 && layers_resolved == 0 {
        return Ok(None);
    }
    let transcoded = match transcode_class_lists(&current, ctx.rules) {
        Cow::Owned(transcoded) => Some(transcoded),
        Cow::Borrowed(_) => None,
    };
    if let Some(transcoded) = transcoded {
        current = transcoded;
    }

    if current == code {
        return Ok(None);
    }
    Ok(Some(AssetRewrite {
        code: current,
        layers_resolved,
        hashes_stripped,
    }))
}

fn substitute<F>(code: &str, adapter: HostAdapter, mut resolve: F) -> Result<(String, usize), Error>
where
    F: FnMut(&str) -> Result<String, Error>,
{
    let mut out = String::new();
    let mut cursor = 0;
    let mut count = 0;
    for caps in adapter.pattern().captures_iter(code) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() < cursor {
            continue;
        }
        let layer = caps
            .get(1)
            .map(|layer| layer.as_str())
            .filter(|layer| !layer.is_empty())
            .unwrap_or(LAYER_MARK_ALL);
        let body = resolve(layer)?;
        let end = if body.is_empty() {
            absorb_separator(code, whole.end())
        } else {
            whole.end()
        };
        out.push_str(&code[cursor..whole.start()]);
        out.push_str(&body);
        cursor = end;
        count += 1;
    }
    if count == 0 {
        return Ok((String::new(), 0));
    }
    out.push_str(&code[cursor..]);
    Ok((out, count))
}

/// Extends an emptied span over one following `,` so `{<empty>, "a": ...}` stays valid.
fn absorb_separator(code: &str, end: usize) -> usize {
    let rest = &code[end..];
    let trimmed = rest.trim_start();
    match trimmed.strip_prefix(',') {
        Some(after) => code.len() - after.trim_start().len(),
        None => end,
    }
}

/// Runs [`rewrite_asset`] over every asset and replaces the ones that changed.
pub fn finalize_assets<A>(assets: &mut A, ctx: &RewriteContext<'_>) -> Result<FinalizeReport, Error>
where
    A: AssetOutput + ?Sized,
{
    let mut report = FinalizeReport::default();
    for name in assets.asset_names() {
        if name == ALL_ASSETS {
            continue;
        }
        let rewrite = {
            let Some(code) = assets.source(&name) else {
                continue;
            };
            rewrite_asset(&name, &code, ctx)?
        };
        if let Some(rewrite) = rewrite {
            debug!(
                asset = %name,
                layers = rewrite.layers_resolved,
                hashes = rewrite.hashes_stripped,
                "rewrote asset"
            );
            report.layers_resolved += rewrite.layers_resolved;
            assets.replace(&name, rewrite.code);
            report.assets_rewritten.push(name);
        }
    }
    info!(
        assets = report.assets_rewritten.len(),
        layers = report.layers_resolved,
        "placeholders resolved"
    );
    Ok(report)
}
