//! Purpose: Source rewrites applied to a module before its tokens are extracted.
//! Exports: `SourceTransformer`, `Enforce`, `Fragment`, `FragmentLocation`, `Fragments`,
//! `FragmentParser`, `UxFragmentParser`, `DirectiveExpander`, `StyleDirectivesTransformer`,
//! `AttributifyExtractor`, `AttributifyTransformer`, `ClassListTransformer`.
//! Role: Pluggable pre/post passes; the plugin runs only `Pre` ones inside its transform hook.
//! Invariants: A transformer returns `None` when it leaves the code untouched.
//! Invariants: Fragment locations are byte offsets into the exact text handed to the parser.
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::config::{DEFAULT_EXCLUDE, IdFilter};
use crate::error::{Error, ErrorKind};
use crate::layers::is_css_id;
use crate::transcode::{TransformRules, transcode_class_lists};

/// Phase a transformer asks to run in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Enforce {
    Pre,
    #[default]
    Normal,
    Post,
}

impl Enforce {
    pub fn as_str(self) -> &'static str {
        match self {
            Enforce::Pre => "pre",
            Enforce::Normal => "normal",
            Enforce::Post => "post",
        }
    }
}

#[async_trait]
pub trait SourceTransformer: Send + Sync {
    fn name(&self) -> &str;

    fn enforce(&self) -> Enforce {
        Enforce::Normal
    }

    fn id_filter(&self, id: &str) -> bool;

    async fn transform(&self, code: &str, id: &str) -> Result<Option<String>, Error>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentLocation {
    pub start: usize,
    pub end: usize,
    /// 1-based.
    pub line: usize,
    /// 1-based, in characters.
    pub column: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
    pub content: String,
    pub attrs: BTreeMap<String, String>,
    pub location: FragmentLocation,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Fragments {
    pub import: Vec<Fragment>,
    pub template: Vec<Fragment>,
    pub style: Vec<Fragment>,
    pub script: Vec<Fragment>,
}

/// Splits a single-file component into its sections.
pub trait FragmentParser: Send + Sync {
    fn parse_fragments(&self, code: &str, id: &str) -> Result<Fragments, Error>;
}

// One top-level <template> per file; it may nest other tags, so its match is greedy.
static TEMPLATE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<template(\s[^>]*)?>(.*)</template\s*>").expect("template pattern compiles")
});

static STYLE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<style(\s[^>]*)?>(.*?)</style\s*>").expect("style pattern compiles")
});

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<script(\s[^>]*)?>(.*?)</script\s*>").expect("script pattern compiles")
});

static IMPORT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<import(\s[^>]*?)?/?>(?:\s*</import\s*>)?").expect("import pattern compiles")
});

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][\w:.-]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/]+)))?"#)
        .expect("attribute pattern compiles")
});

/// Regex-based reader for quickapp `.ux` files.
#[derive(Clone, Copy, Debug, Default)]
pub struct UxFragmentParser;

impl UxFragmentParser {
    fn collect(pattern: &Regex, code: &str) -> Vec<Fragment> {
        pattern
            .captures_iter(code)
            .filter_map(|caps| {
                let attrs = caps.get(1).map(|m| parse_attrs(m.as_str())).unwrap_or_default();
                let body = caps.get(2)?;
                Some(Fragment {
                    content: body.as_str().to_string(),
                    attrs,
                    location: locate(code, body.start(), body.end()),
                })
            })
            .collect()
    }
}

impl FragmentParser for UxFragmentParser {
    fn parse_fragments(&self, code: &str, _id: &str) -> Result<Fragments, Error> {
        let import = IMPORT_TAG
            .captures_iter(code)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some(Fragment {
                    content: String::new(),
                    attrs: caps.get(1).map(|m| parse_attrs(m.as_str())).unwrap_or_default(),
                    location: locate(code, whole.start(), whole.end()),
                })
            })
            .collect();
        Ok(Fragments {
            import,
            template: Self::collect(&TEMPLATE_BLOCK, code),
            style: Self::collect(&STYLE_BLOCK, code),
            script: Self::collect(&SCRIPT_BLOCK, code),
        })
    }
}

fn parse_attrs(text: &str) -> BTreeMap<String, String> {
    ATTRIBUTE
        .captures_iter(text)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_string();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Some((name, value))
        })
        .collect()
}

fn locate(code: &str, start: usize, end: usize) -> FragmentLocation {
    let before = &code[..start];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    let column = code[line_start..start].chars().count() + 1;
    FragmentLocation {
        start,
        end,
        line,
        column,
    }
}

/// Expands `@apply`-style directives inside one stylesheet to plain CSS.
#[async_trait]
pub trait DirectiveExpander: Send + Sync {
    async fn expand(&self, css: &str, id: &str) -> Result<String, Error>;
}

/// Runs a [`DirectiveExpander`] over CSS modules and the `<style>` blocks of `.ux` files.
pub struct StyleDirectivesTransformer {
    parser: Arc<dyn FragmentParser>,
    expander: Arc<dyn DirectiveExpander>,
    enforce: Enforce,
}

impl StyleDirectivesTransformer {
    pub fn new(parser: Arc<dyn FragmentParser>, expander: Arc<dyn DirectiveExpander>) -> Self {
        Self {
            parser,
            expander,
            enforce: Enforce::Pre,
        }
    }

    pub fn with_enforce(mut self, enforce: Enforce) -> Self {
        self.enforce = enforce;
        self
    }
}

#[async_trait]
impl SourceTransformer for StyleDirectivesTransformer {
    fn name(&self) -> &str {
        "css-directive"
    }

    fn enforce(&self) -> Enforce {
        self.enforce
    }

    fn id_filter(&self, id: &str) -> bool {
        is_css_id(id) || id.contains(".ux")
    }

    async fn transform(&self, code: &str, id: &str) -> Result<Option<String>, Error> {
        if is_css_id(id) {
            let expanded = self.expander.expand(code, id).await?;
            return Ok((expanded != code).then_some(expanded));
        }

        let fragments = self.parser.parse_fragments(code, id)?;
        let mut replacements = Vec::with_capacity(fragments.style.len());
        for fragment in &fragments.style {
            let expanded = self.expander.expand(&fragment.content, id).await?;
            if expanded != fragment.content {
                replacements.push((fragment.location, expanded));
            }
        }
        if replacements.is_empty() {
            return Ok(None);
        }

        for (location, _) in &replacements {
            let in_bounds = location.start <= location.end
                && location.end <= code.len()
                && code.is_char_boundary(location.start)
                && code.is_char_boundary(location.end);
            if !in_bounds {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "style fragment {}..{} is outside the {}-byte source",
                        location.start,
                        location.end,
                        code.len()
                    ))
                    .with_module(id)
                    .with_hint("The fragment parser must report byte offsets into the code it was given."));
            }
        }

        // Splice back to front so earlier offsets stay valid.
        replacements.sort_by_key(|(location, _)| std::cmp::Reverse(location.start));
        let mut out = code.to_string();
        for (location, expanded) in replacements {
            out.replace_range(location.start..location.end, &expanded);
        }
        Ok(Some(out))
    }
}

/// Moves attributify-mode utilities (`<div flex p-1>`) into the `class` attribute.
#[async_trait]
pub trait AttributifyExtractor: Send + Sync {
    async fn extract(&self, code: &str, id: &str) -> Result<String, Error>;
}

const ATTRIBUTIFY_INCLUDE: &[&str] = &[r"\.ux$", r"\.ux\?ux"];

static ATTRIBUTIFY_FILTER: LazyLock<IdFilter> = LazyLock::new(|| {
    IdFilter::new(ATTRIBUTIFY_INCLUDE, DEFAULT_EXCLUDE).expect("attributify filter compiles")
});

/// Runs an [`AttributifyExtractor`] over `.ux` sources before tokens are extracted.
pub struct AttributifyTransformer {
    extractor: Arc<dyn AttributifyExtractor>,
    filter: IdFilter,
}

impl AttributifyTransformer {
    pub fn new(extractor: Arc<dyn AttributifyExtractor>) -> Self {
        Self {
            extractor,
            filter: ATTRIBUTIFY_FILTER.clone(),
        }
    }

    pub fn with_filter(mut self, filter: IdFilter) -> Self {
        self.filter = filter;
        self
    }
}

#[async_trait]
impl SourceTransformer for AttributifyTransformer {
    fn name(&self) -> &str {
        "transformer-applet-attributify"
    }

    fn enforce(&self) -> Enforce {
        Enforce::Pre
    }

    fn id_filter(&self, id: &str) -> bool {
        self.filter.matches(id)
    }

    async fn transform(&self, code: &str, id: &str) -> Result<Option<String>, Error> {
        let rewritten = self.extractor.extract(code, id).await?;
        Ok((rewritten != code).then_some(rewritten))
    }
}

const CLASS_LIST_INCLUDE: &[&str] = &[r"\.[jt]sx?$", r"\.ux$", r"\.ux\?ux"];

static CLASS_LIST_FILTER: LazyLock<IdFilter> = LazyLock::new(|| {
    IdFilter::new(CLASS_LIST_INCLUDE, DEFAULT_EXCLUDE).expect("class list filter compiles")
});

/// Rewrites class-list literals of compiled templates with the transform rules.
pub struct ClassListTransformer {
    rules: TransformRules,
    filter: IdFilter,
}

impl ClassListTransformer {
    pub fn new(rules: TransformRules) -> Self {
        Self {
            rules,
            filter: CLASS_LIST_FILTER.clone(),
        }
    }

    pub fn with_filter(mut self, filter: IdFilter) -> Self {
        self.filter = filter;
        self
    }
}

#[async_trait]
impl SourceTransformer for ClassListTransformer {
    fn name(&self) -> &str {
        "transformer-applet-class"
    }

    fn enforce(&self) -> Enforce {
        Enforce::Post
    }

    fn id_filter(&self, id: &str) -> bool {
        self.filter.matches(id)
    }

    async fn transform(&self, code: &str, _id: &str) -> Result<Option<String>, Error> {
        Ok(match transcode_class_lists(code, &self.rules) {
            std::borrow::Cow::Owned(rewritten) => Some(rewritten),
            std::borrow::Cow::Borrowed(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const UX: &str = "<import name=\"card\" src=\"./card.ux\"></import>\n<template>\n  <div class=\"p-2\"><text>hi</text></div>\n</template>\n<style lang=\"less\">\n.a { @apply p-2; }\n</style>\n<script>\nexport default {}\n</script>\n";

    /// Replaces `@apply x;` with `--applied: x;`.
    struct ApplyExpander;

    #[async_trait]
    impl DirectiveExpander for ApplyExpander {
        async fn expand(&self, css: &str, _id: &str) -> Result<String, Error> {
            if css.contains("@bad") {
                return Err(Error::new(ErrorKind::Generation).with_message("unknown utility"));
            }
            Ok(css.replace("@apply ", "--applied: "))
        }
    }

    fn directives() -> StyleDirectivesTransformer {
        StyleDirectivesTransformer::new(Arc::new(UxFragmentParser), Arc::new(ApplyExpander))
    }

    #[test]
    fn parses_ux_sections_with_locations() {
        let fragments = UxFragmentParser.parse_fragments(UX, "a.ux").expect("parse");
        assert_eq!(fragments.import.len(), 1);
        assert_eq!(fragments.import[0].attrs.get("name").map(String::as_str), Some("card"));
        assert_eq!(fragments.import[0].location.line, 1);

        assert_eq!(fragments.template.len(), 1);
        assert!(fragments.template[0].content.contains("<text>hi</text>"));

        assert_eq!(fragments.style.len(), 1);
        let style = &fragments.style[0];
        assert_eq!(style.content, "\n.a { @apply p-2; }\n");
        assert_eq!(style.attrs.get("lang").map(String::as_str), Some("less"));
        assert_eq!(&UX[style.location.start..style.location.end], style.content);
        assert_eq!(style.location.line, 5);
        assert_eq!(style.location.column, 20);

        assert_eq!(fragments.script.len(), 1);
        assert_eq!(fragments.script[0].content.trim(), "export default {}");
    }

    #[tokio::test]
    async fn expands_style_blocks_in_place() {
        let out = directives()
            .transform(UX, "src/a.ux")
            .await
            .expect("transform")
            .expect("changed");
        assert!(out.contains(".a { --applied: p-2; }"));
        assert!(out.contains("<text>hi</text>"));
        assert!(out.ends_with("</script>\n"));
    }

    #[tokio::test]
    async fn expands_every_style_block() {
        let code = "<style>.a{@apply m-1;}</style><template><div/></template><style>.b{@apply m-2;}</style>";
        let out = directives()
            .transform(code, "b.ux")
            .await
            .expect("transform")
            .expect("changed");
        assert_eq!(
            out,
            "<style>.a{--applied: m-1;}</style><template><div/></template><style>.b{--applied: m-2;}</style>"
        );
    }

    #[tokio::test]
    async fn css_modules_are_expanded_whole() {
        let transformer = directives();
        assert!(transformer.id_filter("src/a.css"));
        assert!(transformer.id_filter("src/a.ux?uxType=page"));
        assert!(!transformer.id_filter("src/a.js"));
        let out = transformer
            .transform(".b { @apply m-1; }", "src/a.css")
            .await
            .expect("transform");
        assert_eq!(out.as_deref(), Some(".b { --applied: m-1; }"));
    }

    #[tokio::test]
    async fn untouched_code_reports_none() {
        let out = directives()
            .transform("<style>.a{color:red}</style>", "a.ux")
            .await
            .expect("transform");
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn expander_errors_propagate() {
        let err = directives()
            .transform("<style>.a{@bad x;}</style>", "a.ux")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generation);
    }

    struct OffsetParser;

    impl FragmentParser for OffsetParser {
        fn parse_fragments(&self, _code: &str, _id: &str) -> Result<Fragments, Error> {
            Ok(Fragments {
                style: vec![Fragment {
                    content: "@apply p-1;".to_string(),
                    attrs: BTreeMap::new(),
                    location: FragmentLocation {
                        start: 4,
                        end: 400,
                        line: 1,
                        column: 5,
                    },
                }],
                ..Fragments::default()
            })
        }
    }

    #[tokio::test]
    async fn fragment_outside_the_source_is_an_error() {
        let transformer = StyleDirectivesTransformer::new(Arc::new(OffsetParser), Arc::new(ApplyExpander));
        let err = transformer
            .transform("<style>@apply p-1;</style>", "broken.ux")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.module(), Some("broken.ux"));
    }

    /// Turns bare attributes of a tag into its class list.
    struct BareAttributes;

    #[async_trait]
    impl AttributifyExtractor for BareAttributes {
        async fn extract(&self, code: &str, _id: &str) -> Result<String, Error> {
            static BARE: LazyLock<Regex> =
                LazyLock::new(|| Regex::new(r"<(\w+)\s+([\w\s-]+?)\s*>").expect("bare pattern"));
            Ok(BARE.replace_all(code, "<$1 class=\"$2\">").into_owned())
        }
    }

    #[tokio::test]
    async fn attributify_runs_pre_on_ux_sources() {
        let transformer = AttributifyTransformer::new(Arc::new(BareAttributes));
        assert_eq!(transformer.enforce(), Enforce::Pre);
        assert!(transformer.id_filter("/proj/src/pages/index.ux"));
        assert!(transformer.id_filter("/proj/src/pages/index.ux?uxType=page&ux"));
        assert!(!transformer.id_filter("/proj/src/app.js"));
        assert!(!transformer.id_filter("/proj/node_modules/lib/card.ux"));
        assert!(!transformer.id_filter("/proj/.git/x.ux"));

        let out = transformer
            .transform("<template><div flex p-1></div></template>", "a.ux")
            .await
            .expect("transform");
        assert_eq!(
            out.as_deref(),
            Some("<template><div class=\"flex p-1\"></div></template>")
        );
        let out = transformer
            .transform("<template><div></div></template>", "a.ux")
            .await
            .expect("transform");
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn class_list_transformer_runs_post() {
        let transformer = ClassListTransformer::new(TransformRules::default());
        assert_eq!(transformer.enforce(), Enforce::Post);
        assert!(transformer.id_filter("src/page.ux"));
        assert!(transformer.id_filter("src/page.tsx"));
        assert!(!transformer.id_filter("node_modules/x/page.js"));
        let out = transformer
            .transform(r#"{"classList": ["w-1.5", "flex"]}"#, "src/page.js")
            .await
            .expect("transform");
        assert_eq!(out.as_deref(), Some(r#"{"classList": ["w-1-d-5", "flex"]}"#));
    }
}
