//! Purpose: Deferred utility-CSS pipeline for quickapp bundles.
//! Exports: `plugin` (bundler hooks), `finalize`, `layers`, `tokens`, `transcode`, `generator`,
//! `transformers`, `config`, `error`, plus the commonly used types re-exported at the root.
//! Role: Library backing the `unocss-quickapp` CLI and bundler integrations.
//! Invariants: Per-build state lives in one `QuickappPlugin`; nothing is process-global.
//! Invariants: Modules prefer explicit inputs/outputs over hidden state.
pub mod config;
pub mod error;
pub mod finalize;
pub mod generator;
pub mod layers;
pub mod plugin;
pub mod tokens;
pub mod transcode;
pub mod transformers;

pub use config::{IdFilter, PluginOptions};
pub use error::{Error, ErrorKind, to_exit_code};
pub use finalize::{
    AssetOutput, FinalizeReport, HostAdapter, RewriteContext, finalize_assets, rewrite_asset,
};
pub use generator::{
    FlatCssParser, GenerateOptions, GeneratedCss, JsonStyle, LayeredCss, StyleGenerator,
    StyleParser,
};
pub use layers::{EntrySet, LAYER_MARK_ALL, ModuleRecord, hash_placeholder, layer_placeholder};
pub use plugin::{BootstrapOutcome, PLUGIN_NAME, QuickappPlugin, ensure_stylesheet};
pub use tokens::{ExtractionScheduler, FrozenTokens, TokenSet};
pub use transcode::{TransformRules, locate_class_list_literals, transcode_class_lists};
pub use transformers::{
    AttributifyExtractor, AttributifyTransformer, ClassListTransformer, DirectiveExpander,
    Enforce, FragmentParser, SourceTransformer, StyleDirectivesTransformer, UxFragmentParser,
};
