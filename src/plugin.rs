//! Purpose: Bundler-facing hooks that tie transcoding, extraction and finalize into one build.
//! Exports: `QuickappPlugin`, `BootstrapOutcome`, `ensure_stylesheet`, `PLUGIN_NAME`.
//! Role: One instance per build; owns every piece of per-build state (tokens, entries, hashes).
//! Invariants: `transform` never waits on extraction; `optimize_assets` is the only join point.
//! Invariants: The output stylesheet is created or prepended, never overwritten.
//! Invariants: Only `Pre` transformers run; others are dropped with a warning at construction.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::PluginOptions;
use crate::error::{Error, ErrorKind};
use crate::finalize::{AssetOutput, FinalizeReport, RewriteContext, finalize_assets};
use crate::generator::{GenerateOptions, StyleGenerator, StyleParser};
use crate::layers::{
    self, EntrySet, LAYER_MARK_ALL, ModuleRecord, get_path, hash_placeholder, is_css_id,
    is_resolved_id, layer_for_id, layer_placeholder,
};
use crate::tokens::{ExtractionScheduler, TokenSet};
use crate::transformers::{Enforce, SourceTransformer};

pub const PLUGIN_NAME: &str = "unocss:quickapp";

const HASH_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootstrapOutcome {
    Created,
    Prepended,
    Unchanged,
}

impl BootstrapOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapOutcome::Created => "created",
            BootstrapOutcome::Prepended => "prepended",
            BootstrapOutcome::Unchanged => "unchanged",
        }
    }
}

/// Makes sure `path` exists and carries the all-layers placeholder.
///
/// A missing file is created holding exactly the placeholder. An existing file without it gets
/// the placeholder on a line of its own in front of the original content.
pub fn ensure_stylesheet(path: &Path) -> Result<BootstrapOutcome, Error> {
    let placeholder = layer_placeholder(LAYER_MARK_ALL);
    let io_err = |message: &str, err: std::io::Error| {
        Error::new(ErrorKind::Io)
            .with_message(message.to_string())
            .with_path(path)
            .with_source(err)
    };

    if !path.exists() {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| io_err("failed to create stylesheet directory", err))?;
        }
        std::fs::write(path, &placeholder)
            .map_err(|err| io_err("failed to create stylesheet", err))?;
        return Ok(BootstrapOutcome::Created);
    }

    let existing =
        std::fs::read_to_string(path).map_err(|err| io_err("failed to read stylesheet", err))?;
    if existing.contains(&placeholder) {
        return Ok(BootstrapOutcome::Unchanged);
    }
    std::fs::write(path, format!("{placeholder}\n{existing}"))
        .map_err(|err| io_err("failed to update stylesheet", err))?;
    Ok(BootstrapOutcome::Prepended)
}

fn short_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hex = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Hashes are keyed by the resolved virtual path, whichever alias recorded them.
fn hash_key(id: &str) -> String {
    match layers::resolve_id(id) {
        Some(resolved) => get_path(&resolved).to_string(),
        None => get_path(id).to_string(),
    }
}

pub struct QuickappPlugin {
    options: PluginOptions,
    generator: Arc<dyn StyleGenerator>,
    parser: Arc<dyn StyleParser>,
    transformers: Vec<Arc<dyn SourceTransformer>>,
    scheduler: ExtractionScheduler,
    entries: EntrySet,
    records: Mutex<BTreeMap<String, ModuleRecord>>,
    hashes: Mutex<BTreeMap<String, String>>,
}

impl QuickappPlugin {
    pub fn new(
        options: PluginOptions,
        generator: Arc<dyn StyleGenerator>,
        parser: Arc<dyn StyleParser>,
    ) -> Self {
        let scheduler = ExtractionScheduler::new(Arc::clone(&generator), TokenSet::new());
        Self {
            options,
            generator,
            parser,
            transformers: Vec::new(),
            scheduler,
            entries: EntrySet::new(),
            records: Mutex::new(BTreeMap::new()),
            hashes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers source transformers. Only `Pre` ones are kept.
    pub fn with_transformers(mut self, transformers: Vec<Arc<dyn SourceTransformer>>) -> Self {
        let (pre, skipped): (Vec<_>, Vec<_>) = transformers
            .into_iter()
            .partition(|transformer| transformer.enforce() == Enforce::Pre);
        if !skipped.is_empty() {
            let names: Vec<String> = skipped
                .iter()
                .map(|t| format!("{} ({})", t.name(), t.enforce().as_str()))
                .collect();
            warn!(
                plugin = PLUGIN_NAME,
                skipped = %names.join(", "),
                "only pre transformers are supported; skipping the rest"
            );
        }
        self.transformers.extend(pre);
        self
    }

    pub fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    pub fn tokens(&self) -> &TokenSet {
        self.scheduler.tokens()
    }

    pub fn entries(&self) -> &EntrySet {
        &self.entries
    }

    pub fn transformer_names(&self) -> Vec<&str> {
        self.transformers.iter().map(|t| t.name()).collect()
    }

    /// Runs before any module: prepares the output stylesheet.
    pub fn build_start(&self) -> Result<BootstrapOutcome, Error> {
        let path = self.options.output_path();
        let outcome = ensure_stylesheet(&path)?;
        debug!(path = %path.display(), outcome = outcome.as_str(), "output stylesheet ready");
        Ok(outcome)
    }

    pub fn transform_include(&self, id: &str) -> bool {
        self.options.filter.matches(id)
            && !get_path(id).ends_with(".html")
            && !is_resolved_id(id)
    }

    /// Applies `Pre` transformers and schedules extraction of the result.
    ///
    /// Returns the rewritten code, or `None` when no transformer changed it.
    pub async fn transform(&self, code: &str, id: &str) -> Result<Option<String>, Error> {
        if !self.transform_include(id) {
            return Ok(None);
        }

        let mut rewritten: Option<String> = None;
        for transformer in &self.transformers {
            if !transformer.id_filter(id) {
                continue;
            }
            let input = rewritten.as_deref().unwrap_or(code);
            let output = transformer.transform(input, id).await?;
            if let Some(next) = output {
                debug!(module = %id, transformer = transformer.name(), "source transformed");
                rewritten = Some(next);
            }
        }

        if !is_css_id(id) {
            let final_code = rewritten.clone().unwrap_or_else(|| code.to_string());
            self.scheduler.schedule(final_code, id.to_string())?;
        }
        Ok(rewritten)
    }

    /// Maps a virtual stylesheet request to its resolved id, keeping any query.
    ///
    /// Already-resolved ids and unrelated ids are declined with `None`. Every id seen is
    /// recorded; ids that are not virtual stylesheets keep themselves as the resolved path
    /// and carry no layer.
    pub fn resolve_id(&self, id: &str) -> Option<String> {
        let resolved = match layers::resolve_id(id) {
            Some(entry) if entry != id => {
                if self.entries.add(&entry) {
                    debug!(id, entry = %entry, "registered stylesheet entry");
                }
                Some(match id.split_once('?') {
                    Some((_, query)) => format!("{entry}?{query}"),
                    None => entry,
                })
            }
            _ => None,
        };
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.to_string())
            .or_insert_with(|| ModuleRecord::new(id, resolved.as_deref().unwrap_or(id)));
        resolved
    }

    pub fn module_record(&self, id: &str) -> Option<ModuleRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn load_include(&self, id: &str) -> bool {
        layer_for_id(id).is_some()
    }

    /// Placeholder content for a virtual stylesheet, or `None` when `id` is not one.
    pub fn load(&self, id: &str) -> Option<String> {
        let layer = layer_for_id(id)?;
        let hash = self
            .hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&hash_key(id))
            .cloned();
        let mut content = String::new();
        if let Some(hash) = hash {
            content.push_str(&hash_placeholder(&hash));
        }
        content.push_str(&layer_placeholder(&layer));
        Some(content)
    }

    /// Records a short content hash for a virtual stylesheet; returns it.
    pub fn record_hash(&self, id: &str, content: &str) -> String {
        let hash = short_hash(content);
        self.hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash_key(id), hash.clone());
        hash
    }

    /// The finalize barrier: drains extraction, generates once and rewrites every asset.
    ///
    /// Runs at most once; a second call fails with [`ErrorKind::Closed`].
    pub async fn optimize_assets<A>(&self, assets: &mut A) -> Result<FinalizeReport, Error>
    where
        A: AssetOutput + ?Sized,
    {
        let tokens = self.scheduler.drain().await?;
        let styles = self
            .generator
            .generate(&tokens, GenerateOptions { minify: true })
            .await?;
        let entry_layers = self.entries.layers();
        let ctx = RewriteContext {
            styles: styles.as_ref(),
            entry_layers: &entry_layers,
            parser: self.parser.as_ref(),
            rules: &self.options.transform_rules,
            root: &self.options.root,
        };
        let mut report = finalize_assets(assets, &ctx)?;
        report.tokens = tokens.len();
        info!(
            plugin = PLUGIN_NAME,
            tokens = report.tokens,
            extractions = self.scheduler.scheduled(),
            "finalize complete"
        );
        Ok(report)
    }
}
