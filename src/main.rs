//! Purpose: `unocss-quickapp` CLI entry point.
//! Role: Binary crate root; parses args, loads options, runs commands, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout (pretty when stdout is a terminal).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
#![allow(clippy::result_large_err)]
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use unocss_quickapp::{Error, ErrorKind, PluginOptions, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    let mut options = match &cli.config {
        Some(path) => PluginOptions::from_json_file(path)?,
        None => PluginOptions::default(),
    };
    if let Some(root) = cli.root {
        options.root = root;
    }

    command_dispatch::dispatch_command(cli.command, options).map_err(add_io_hint)
}

fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let replacement = arg.to_str().and_then(|value| match value {
                "---help" => Some("--help"),
                "---version" => Some("--version"),
                _ => None,
            });
            replacement.map(OsString::from).unwrap_or(arg)
        })
        .collect()
}

#[derive(Parser)]
#[command(
    name = "unocss-quickapp",
    version,
    about = "Deferred utility CSS for quickapp bundles",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Virtual stylesheets are emitted as placeholders; finalize swaps them for real CSS.

Mental model:
  - `bootstrap` puts the all-layers placeholder into the output stylesheet
  - `finalize` resolves placeholders in emitted assets from generated CSS
  - `transcode` rewrites selector-unsafe characters in class-list literals
"#,
    after_help = r#"EXAMPLES
  $ unocss-quickapp bootstrap
  $ unocss-quickapp escape 'w-1.5' 'hover:bg-[#fff]'
  $ unocss-quickapp transcode --check build/pages/index.js
  $ unocss-quickapp finalize --css uno.generated.css build/app.js build/pages/index.js

CONFIG
  --config takes a JSON file with any of: unoCssOutput, transformRules, include, exclude, root."#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(long, help = "JSON options file", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long, help = "Project root (overrides `root` from --config)", value_hint = ValueHint::DirPath)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Ensure the output stylesheet carries the all-layers placeholder")]
    Bootstrap {
        #[arg(long, help = "Stylesheet path (default: unoCssOutput)", value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
    },
    #[command(about = "Print selectors with unsafe characters replaced")]
    Escape {
        #[arg(required = true, help = "Selectors to escape")]
        selectors: Vec<String>,
    },
    #[command(
        about = "Rewrite class-list literals in files",
        long_about = "Rewrite class-list literals in files.\n\nWith --check nothing is written and the exit code is 1 when any file would change."
    )]
    Transcode {
        #[arg(long, help = "Report only; do not write")]
        check: bool,
        #[arg(required = true, help = "Files to rewrite", value_hint = ValueHint::FilePath)]
        files: Vec<PathBuf>,
    },
    #[command(about = "Resolve placeholders in emitted assets from generated CSS")]
    Finalize {
        #[arg(long, help = "Generated CSS, split into layers by `/* layer: <name> */`", value_hint = ValueHint::FilePath)]
        css: PathBuf,
        #[arg(required = true, help = "Emitted assets to rewrite in place", value_hint = ValueHint::FilePath)]
        assets: Vec<PathBuf>,
    },
}

fn read_text(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read file")
            .with_path(path)
            .with_source(err)
    })
}

fn write_text(path: &Path, content: &str) -> Result<(), Error> {
    std::fs::write(path, content).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write file")
            .with_path(path)
            .with_source(err)
    })
}

/// Reads each asset into an output set keyed by its path as given.
fn read_assets(paths: &[PathBuf]) -> Result<BTreeMap<String, String>, Error> {
    let mut assets = BTreeMap::new();
    for path in paths {
        assets.insert(path.display().to_string(), read_text(path)?);
    }
    Ok(assets)
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Extraction => "token extraction failed".to_string(),
        ErrorKind::Generation => "css generation failed".to_string(),
        ErrorKind::StyleParse => "generated css could not be parsed".to_string(),
        ErrorKind::Closed => "build already finalized".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(module) = err.module() {
        inner.insert("module".to_string(), json!(module));
    }
    if let Some(layer) = err.layer() {
        inner.insert("layer".to_string(), json!(layer));
    }
    if let Some(css) = err.css() {
        inner.insert("css".to_string(), json!(css));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(module) = err.module() {
        lines.push(format!("module: {module}"));
    }
    if let Some(layer) = err.layer() {
        lines.push(format!("layer: {layer}"));
    }
    if let Some(css) = err.css() {
        lines.push(format!("css: {css}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    match err.path() {
        Some(_) => err.with_hint("Check that the path exists and is writable."),
        None => err,
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let subcommand = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .and_then(|usage| {
            let tokens: Vec<&str> = usage.split_whitespace().collect();
            let pos = tokens.iter().position(|t| *t == "unocss-quickapp")?;
            tokens
                .get(pos + 1)
                .filter(|token| !token.starts_with(['-', '<', '[']))
                .map(|token| token.to_string())
        });
    match subcommand {
        Some(subcommand) => format!("Try `unocss-quickapp {subcommand} --help`."),
        None => "Try `unocss-quickapp --help`.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_json_carries_build_context() {
        let err = Error::new(ErrorKind::StyleParse)
            .with_message("unbalanced braces")
            .with_layer("components")
            .with_css(".a{color:red");
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "StyleParse");
        assert_eq!(value["error"]["layer"], "components");
        assert_eq!(value["error"]["css"], ".a{color:red");
        assert!(value["error"].get("hint").is_none());
    }

    #[test]
    fn error_message_falls_back_to_kind() {
        let err = Error::new(ErrorKind::Closed);
        assert_eq!(error_message(&err), "build already finalized");
        assert!(error_text(&err).starts_with("error: build already finalized"));
    }

    #[test]
    fn io_errors_with_a_path_get_a_hint() {
        let err = add_io_hint(Error::new(ErrorKind::Io).with_path("/nope"));
        assert!(err.hint().is_some());
        let err = add_io_hint(Error::new(ErrorKind::Usage).with_path("/nope"));
        assert!(err.hint().is_none());
    }

    #[test]
    fn normalize_args_maps_triple_dash_help() {
        let args = normalize_args(vec![OsString::from("unocss-quickapp"), OsString::from("---help")]);
        assert_eq!(args[1], OsString::from("--help"));
    }
}
