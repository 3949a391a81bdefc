//! Purpose: Boundaries to the utility-style engine and to the CSS-to-style-object compiler.
//! Exports: `StyleGenerator`, `GenerateOptions`, `GeneratedCss`, `LayeredCss`, `StyleParser`,
//! `FlatCssParser`, `JsonStyle`.
//! Role: The pipeline decides when and where CSS lands; these traits decide what it contains.
//! Invariants: `generate` is called once per build, after every extraction has settled.
//! Invariants: Parsed styles keep rule and declaration order (serde_json `preserve_order`).
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::warn;

use crate::error::{Error, ErrorKind};
use crate::layers::LAYER_MARK_ALL;
use crate::tokens::{FrozenTokens, TokenSet};

/// Selector → declaration object, as the quickapp runtime consumes it.
pub type JsonStyle = Map<String, Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GenerateOptions {
    pub minify: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self { minify: true }
    }
}

/// Utility-class engine: discovers tokens in source and renders CSS for a token set.
#[async_trait]
pub trait StyleGenerator: Send + Sync {
    /// Adds every utility token found in `code` to `tokens`, attributed to `id`.
    async fn extract(&self, code: &str, id: &str, tokens: &TokenSet) -> Result<(), Error>;

    async fn generate(
        &self,
        tokens: &FrozenTokens,
        options: GenerateOptions,
    ) -> Result<Box<dyn GeneratedCss>, Error>;
}

/// Result of one generation, queryable per layer.
pub trait GeneratedCss: Send + Sync {
    fn layer(&self, name: &str) -> Option<String>;

    /// CSS for the all-layers request: `base_layers` (every layer when `None`) united with
    /// `entry_layers`, concatenated with entry layers first in the order given.
    ///
    /// A layer that is also imported through its own `uno:<layer>.css` entry therefore shows
    /// up twice in the bundle: once here and once at its own placeholder. UnoCSS proper leaves
    /// separately imported layers out of the all-layers block.
    fn layers(&self, base_layers: Option<&[String]>, entry_layers: &[String]) -> String;

    fn layer_names(&self) -> Vec<String>;
}

/// Converts CSS text into the runtime's style-object form.
pub trait StyleParser: Send + Sync {
    fn parse(&self, css: &str, file_path: &Path) -> Result<JsonStyle, Error>;
}

static LAYER_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/\*\s*layer:\s*([^*\s]+)\s*\*/").expect("layer comment pattern compiles")
});

/// Ordered layer → CSS table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LayeredCss {
    layers: Vec<(String, String)>,
}

impl LayeredCss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends CSS to a layer, creating it at the end of the order on first use.
    pub fn push(&mut self, layer: impl Into<String>, css: &str) {
        let layer = layer.into();
        match self.layers.iter_mut().find(|(name, _)| *name == layer) {
            Some((_, existing)) => existing.push_str(css),
            None => self.layers.push((layer, css.to_string())),
        }
    }

    /// Splits stylesheet text on `/* layer: <name> */` markers. Text before the first marker
    /// belongs to `default`.
    pub fn from_css_text(text: &str) -> Self {
        let mut out = Self::new();
        let mut current = "default".to_string();
        let mut cursor = 0;
        for caps in LAYER_COMMENT.captures_iter(text) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let chunk = text[cursor..whole.start()].trim();
            if !chunk.is_empty() {
                out.push(current.clone(), chunk);
            }
            current = name.as_str().to_string();
            cursor = whole.end();
        }
        let tail = text[cursor..].trim();
        if !tail.is_empty() {
            out.push(current, tail);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl GeneratedCss for LayeredCss {
    fn layer(&self, name: &str) -> Option<String> {
        self.layers
            .iter()
            .find(|(layer, _)| layer == name)
            .map(|(_, css)| css.clone())
    }

    fn layers(&self, base_layers: Option<&[String]>, entry_layers: &[String]) -> String {
        let base: Vec<&str> = match base_layers {
            Some(base) => base.iter().map(String::as_str).collect(),
            None => self.layers.iter().map(|(name, _)| name.as_str()).collect(),
        };
        let mut order: Vec<&str> = Vec::new();
        for layer in entry_layers.iter().map(String::as_str).chain(base) {
            if layer != LAYER_MARK_ALL && !order.contains(&layer) {
                order.push(layer);
            }
        }
        order
            .into_iter()
            .filter_map(|name| self.layers.iter().find(|(layer, _)| layer == name))
            .map(|(_, css)| css.as_str())
            .collect()
    }

    fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Parser for flat (non-nested) minified CSS, the shape utility engines emit.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlatCssParser;

impl StyleParser for FlatCssParser {
    fn parse(&self, css: &str, file_path: &Path) -> Result<JsonStyle, Error> {
        parse_flat_css(css).map_err(|err| err.with_css(css).with_path(file_path))
    }
}

fn parse_flat_css(css: &str) -> Result<JsonStyle, Error> {
    let text = strip_comments(css);
    let bytes = text.as_bytes();
    let mut style = JsonStyle::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if bytes[i] == b'@' {
            i = skip_at_rule(&text, i)?;
            continue;
        }

        let open = find_top_level(bytes, i, b'{').ok_or_else(|| {
            parse_error(format!("selector without a block near offset {i}"))
        })?;
        let selector = text[i..open].trim();
        if selector.is_empty() || selector.contains('}') {
            return Err(parse_error(format!("empty or malformed selector at offset {i}")));
        }
        let close = find_top_level(bytes, open + 1, b'}')
            .ok_or_else(|| parse_error(format!("unterminated block for `{selector}`")))?;
        let body = &text[open + 1..close];
        if body.contains('{') {
            return Err(parse_error(format!("nested block inside `{selector}`")));
        }
        let declarations = parse_declarations(body, selector)?;

        for single in split_top_level(selector, b',') {
            let single = single.trim();
            if single.is_empty() {
                continue;
            }
            let entry = style
                .entry(single.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(existing) = entry {
                for (prop, value) in &declarations {
                    existing.insert(prop.clone(), value.clone());
                }
            }
        }
        i = close + 1;
    }
    Ok(style)
}

fn parse_declarations(body: &str, selector: &str) -> Result<Map<String, Value>, Error> {
    let mut out = Map::new();
    for declaration in split_top_level(body, b';') {
        let declaration = declaration.trim();
        if declaration.is_empty() {
            continue;
        }
        let Some((prop, value)) = declaration.split_once(':') else {
            return Err(parse_error(format!(
                "declaration `{declaration}` in `{selector}` has no value"
            )));
        };
        let prop = prop.trim();
        if prop.is_empty() {
            return Err(parse_error(format!("empty property name in `{selector}`")));
        }
        out.insert(camel_case(prop), Value::String(value.trim().to_string()));
    }
    Ok(out)
}

fn skip_at_rule(text: &str, start: usize) -> Result<usize, Error> {
    let bytes = text.as_bytes();
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b';' => {
                warn!(rule = %text[start..i].trim(), "skipping at-rule statement");
                return Ok(i + 1);
            }
            b'{' => {
                let mut depth = 0usize;
                while i < bytes.len() {
                    match bytes[i] {
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                let head = text[start..].split('{').next().unwrap_or("").trim();
                                warn!(rule = %head, "skipping at-rule block");
                                return Ok(i + 1);
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                return Err(parse_error("unterminated at-rule block"));
            }
            _ => i += 1,
        }
    }
    Err(parse_error("unterminated at-rule"))
}

/// Index of `needle` outside quotes and parentheses.
fn find_top_level(bytes: &[u8], start: usize, needle: u8) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                _ if b == needle && depth == 0 => return Some(i),
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn split_top_level(text: &str, separator: u8) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(at) = find_top_level(bytes, start, separator) {
        parts.push(&text[start..at]);
        start = at + 1;
    }
    parts.push(&text[start..]);
    parts
}

fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(open) = rest.find("/*") {
        out.push_str(&rest[..open]);
        match rest[open + 2..].find("*/") {
            Some(close) => rest = &rest[open + 2 + close + 2..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn camel_case(prop: &str) -> String {
    if prop.starts_with("--") {
        return prop.to_string();
    }
    let mut out = String::with_capacity(prop.len());
    let mut upper = false;
    for ch in prop.chars() {
        if ch == '-' {
            upper = true;
            continue;
        }
        if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn parse_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::StyleParse).with_message(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(css: &str) -> Result<JsonStyle, Error> {
        FlatCssParser.parse(css, Path::new("build/app.js"))
    }

    #[test]
    fn parses_flat_rules_in_order() {
        let style = parse(".flex{display:flex}.w-1-d-5{width:1.5px;background-color:#fff}")
            .expect("parse");
        let keys: Vec<&String> = style.keys().collect();
        assert_eq!(keys, vec![".flex", ".w-1-d-5"]);
        assert_eq!(
            Value::Object(style),
            json!({
                ".flex": {"display": "flex"},
                ".w-1-d-5": {"width": "1.5px", "backgroundColor": "#fff"}
            })
        );
    }

    #[test]
    fn merges_repeated_and_grouped_selectors() {
        let style = parse(".a,.b{color:red}.a{margin:0}").expect("parse");
        assert_eq!(style[".a"], json!({"color": "red", "margin": "0"}));
        assert_eq!(style[".b"], json!({"color": "red"}));
    }

    #[test]
    fn keeps_semicolons_inside_urls_and_custom_properties() {
        let style =
            parse(r#".bg{background-image:url("data:image/png;base64,AAA");--un-x:1}"#)
                .expect("parse");
        assert_eq!(
            style[".bg"],
            json!({"backgroundImage": "url(\"data:image/png;base64,AAA\")", "--un-x": "1"})
        );
    }

    #[test]
    fn skips_comments_and_at_rules() {
        let style = parse("/* layer: default */@media (min-width:640px){.sm{color:red}}.a{color:blue}")
            .expect("parse");
        assert_eq!(Value::Object(style), json!({".a": {"color": "blue"}}));
    }

    #[test]
    fn malformed_css_carries_source_text() {
        let css = ".a{color:red";
        let err = parse(css).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StyleParse);
        assert_eq!(err.css(), Some(css));
        assert_eq!(err.path(), Some(Path::new("build/app.js")));

        let err = parse(".a{color}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StyleParse);
    }

    #[test]
    fn empty_css_is_an_empty_style() {
        assert!(parse("").expect("parse").is_empty());
        assert!(parse("  \n").expect("parse").is_empty());
    }

    #[test]
    fn camel_cases_vendor_prefixes() {
        assert_eq!(camel_case("background-color"), "backgroundColor");
        assert_eq!(camel_case("-webkit-box-flex"), "WebkitBoxFlex");
        assert_eq!(camel_case("color"), "color");
    }

    #[test]
    fn layered_css_splits_on_layer_comments() {
        let css = LayeredCss::from_css_text(
            "/* layer: preflights */*{margin:0}\n/* layer: components */.btn{color:red}\n/* layer: default */.flex{display:flex}",
        );
        assert_eq!(
            css.layer_names(),
            vec!["preflights", "components", "default"]
        );
        assert_eq!(css.layer("components").as_deref(), Some(".btn{color:red}"));
        assert_eq!(css.layer("missing"), None);
    }

    #[test]
    fn all_layers_put_entry_layers_first() {
        let mut css = LayeredCss::new();
        css.push("preflights", "p{}");
        css.push("default", ".d{}");
        css.push("components", ".c{}");

        assert_eq!(css.layers(None, &[]), "p{}.d{}.c{}");
        let entries = vec!["components".to_string(), LAYER_MARK_ALL.to_string()];
        assert_eq!(css.layers(None, &entries), ".c{}p{}.d{}");
        let base = vec!["default".to_string()];
        assert_eq!(css.layers(Some(base.as_slice()), &entries), ".c{}.d{}");
    }

    #[test]
    fn separately_imported_layer_is_repeated_in_all_layers() {
        let mut css = LayeredCss::new();
        css.push("default", ".d{}");
        css.push("components", ".c{}");
        let entries = vec!["components".to_string()];
        let all = css.layers(None, &entries);
        let own = css.layer("components").expect("components");
        assert_eq!(all, ".c{}.d{}");
        assert!(all.contains(&own));
    }
}
