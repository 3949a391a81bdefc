//! Purpose: Hold top-level CLI command dispatch for `unocss-quickapp`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command prints exactly one JSON document on success.
//! Invariants: Files are only written when their content changed.

use super::*;

use unocss_quickapp::{
    FlatCssParser, LayeredCss, RewriteContext, ensure_stylesheet, finalize_assets,
    transcode_class_lists,
};

pub(super) fn dispatch_command(
    command: Command,
    options: PluginOptions,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Bootstrap { output } => {
            let path = match output {
                Some(output) => options.root.join(output),
                None => options.output_path(),
            };
            let outcome = ensure_stylesheet(&path)?;
            emit_json(json!({
                "bootstrap": {
                    "path": path.display().to_string(),
                    "outcome": outcome.as_str(),
                }
            }));
            Ok(RunOutcome::ok())
        }
        Command::Escape { selectors } => {
            let escaped: Vec<String> = selectors
                .iter()
                .map(|selector| options.transform_rules.escape_selector(selector).into_owned())
                .collect();
            emit_json(json!({ "escaped": escaped }));
            Ok(RunOutcome::ok())
        }
        Command::Transcode { check, files } => {
            let mut reports = Vec::with_capacity(files.len());
            let mut pending = false;
            for path in &files {
                let text = read_text(path)?;
                let rewritten = transcode_class_lists(&text, &options.transform_rules);
                let changed = rewritten != text;
                if changed && !check {
                    write_text(path, &rewritten)?;
                }
                pending |= changed;
                reports.push(json!({
                    "path": path.display().to_string(),
                    "changed": changed,
                }));
            }
            emit_json(json!({ "files": reports, "check": check }));
            if check && pending {
                return Ok(RunOutcome::with_code(1));
            }
            Ok(RunOutcome::ok())
        }
        Command::Finalize { css, assets } => {
            let styles = LayeredCss::from_css_text(&read_text(&css)?);
            let mut output = read_assets(&assets)?;
            let parser = FlatCssParser;
            let ctx = RewriteContext {
                styles: &styles,
                entry_layers: &[],
                parser: &parser,
                rules: &options.transform_rules,
                root: &options.root,
            };
            let report = finalize_assets(&mut output, &ctx)?;
            for name in &report.assets_rewritten {
                if let Some(content) = output.get(name) {
                    write_text(Path::new(name), content)?;
                }
            }
            emit_json(json!({ "finalize": report.to_json() }));
            Ok(RunOutcome::ok())
        }
    }
}
