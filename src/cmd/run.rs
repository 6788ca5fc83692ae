/*!
`run.rs`

The single `sqlhop` command: layer the arguments, resolve an execution
context, dispatch the module and print a summary.

Exit codes:
  0  at least one target executed (or the catalogue was printed)
  1  nothing executed (every target skipped or failed)
  2  arguments could not be parsed or resolved; no connection was attempted

JSON Output Shape (--json, one object per line):
  {"level":"status","message":"Executing 'info' on sql01"}
  {"level":"result","target":"sql01","query":"server","columns":[..],"rows":[[..]]}
  {"level":"summary","module":"info","mode":"Standard","executed":1,"skipped":0,"failed":0,"elapsed_ms":12}
*/

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::cmd::args::{ParsedArguments, env_defaults, load_config_file};
use crate::cmd::context::{ExecutionContext, resolve};
use crate::cmd::dispatch::{self, RunSummary};
use crate::cmd::format::{Role, StyleOptions, TableOpts, box_header, color, emoji, table};
use crate::cmd::modules::{Catalogue, QueryRunner};
use crate::cmd::report::{ConsoleReporter, JsonReporter, Reporter};
use crate::sql::{PlanConnector, TdsConnector};
use crate::utils::logging::{LogLevel, current_log_level, set_log_level};
use crate::utils::mask_secret;
use crate::{log_debug, log_info};

/// CLI arguments for `sqlhop [OPTIONS] <TOKENS>...`
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Defaults file: YAML or JSON object of argument keys (e.g. `host: sql01`)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the query each target would receive instead of connecting
    #[arg(long)]
    pub plan: bool,

    /// Output JSON lines instead of human-readable text
    #[arg(long)]
    pub json: bool,

    /// Disable color and emoji
    #[arg(long)]
    pub plain: bool,

    /// Slash-style arguments, e.g. /m:info /h:sql01 /l:SQL02
    #[arg(value_name = "TOKENS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub tokens: Vec<String>,
}

/// Entry point; returns the process exit code.
pub fn execute_run(args: RunArgs) -> Result<i32> {
    let style = if args.plain {
        StyleOptions::plain()
    } else {
        StyleOptions::detect()
    };
    let mut reporter: Box<dyn Reporter> = if args.json {
        Box::new(JsonReporter)
    } else {
        Box::new(ConsoleReporter::new(style.clone()))
    };
    let catalogue = Catalogue::builtin();

    let merged = match layered(&args) {
        Ok(merged) => merged,
        Err(e) => {
            reporter.error(&format!("{e:#}"));
            return Ok(2);
        }
    };
    raise_log_level(&merged);
    for (key, value) in merged.sorted() {
        log_debug!("argument /{key} = '{}'", mask_secret(key, value));
    }

    if args.tokens.is_empty() || merged.has("help") {
        print_catalogue(&catalogue, args.json, &style);
        return Ok(0);
    }

    let ctx = match resolve(&merged, &catalogue) {
        Ok(ctx) => ctx,
        Err(e) => {
            reporter.error(&e.to_string());
            return Ok(2);
        }
    };
    log_info!(
        "module '{}' in {:?} mode, {} target host(s)",
        ctx.module_name(),
        ctx.mode,
        ctx.primary_hosts.len()
    );
    log_debug!("connection settings: {:?}", masked_settings(&ctx));

    let summary = if args.plan {
        dispatch::run(&ctx, &mut PlanConnector, &mut QueryRunner, reporter.as_mut())
    } else {
        let mut connector = TdsConnector::new(ctx.settings.clone())?;
        dispatch::run(&ctx, &mut connector, &mut QueryRunner, reporter.as_mut())
    };

    print_summary(&ctx, &summary, args.json, &style);
    Ok(if summary.executed == 0 { 1 } else { 0 })
}

/// Environment < config file < command line.
fn layered(args: &RunArgs) -> Result<ParsedArguments> {
    let mut merged = env_defaults()?;
    if let Some(path) = &args.config {
        merged = load_config_file(path)?.over(merged)?;
    }
    let cli = ParsedArguments::parse(&args.tokens)?;
    Ok(cli.over(merged)?)
}

/// `/debug` selects Trace, `/verbose` Debug; `-q` is never overridden.
fn raise_log_level(args: &ParsedArguments) {
    let current = current_log_level();
    if current == LogLevel::Error {
        return;
    }
    let wanted = if args.has("debug") {
        LogLevel::Trace
    } else if args.has("verbose") {
        LogLevel::Debug
    } else {
        return;
    };
    if wanted > current {
        set_log_level(wanted);
    }
}

fn masked_settings(ctx: &ExecutionContext<'_>) -> crate::sql::ConnectionSettings {
    let mut settings = ctx.settings.clone();
    settings.password = settings
        .password
        .as_deref()
        .map(|pw| mask_secret("password", pw).into_owned());
    settings
}

fn print_catalogue(catalogue: &Catalogue, json: bool, style: &StyleOptions) {
    if json {
        let modules: Vec<serde_json::Value> = catalogue
            .iter()
            .map(|m| {
                serde_json::json!({
                    "name": m.name,
                    "flag": m.family.flag(),
                    "standard": m.counts.standard().to_string(),
                    "impersonation": m.counts.impersonation().to_string(),
                    "linked": m.counts.linked().to_string(),
                    "summary": m.summary,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({ "level": "catalogue", "count": modules.len(), "modules": modules })
        );
        return;
    }

    let rows: Vec<Vec<String>> = catalogue
        .iter()
        .map(|m| {
            vec![
                format!("/{}:{}", m.family.flag(), m.name),
                m.counts.standard().to_string(),
                m.counts.impersonation().to_string(),
                m.counts.linked().to_string(),
                m.summary.to_string(),
            ]
        })
        .collect();
    println!(
        "{}",
        box_header(
            &format!("{} Modules ({})", emoji("list", style), rows.len()),
            Some("operands: /command then /option"),
            style
        )
    );
    println!(
        "{}",
        table(
            &["MODULE", "STD", "IMP", "LINK", "DESCRIPTION"],
            &rows,
            TableOpts::default(),
            style
        )
    );
    println!(
        "\n{}",
        color(
            Role::Dim,
            "targets: /host:a,b  /iuser:login  /link:srv  /link:a,b /chain   ('-' = not supported)",
            style
        )
    );
}

fn print_summary(ctx: &ExecutionContext<'_>, summary: &RunSummary, json: bool, style: &StyleOptions) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "level": "summary",
                "module": ctx.module_name(),
                "mode": format!("{:?}", ctx.mode),
                "executed": summary.executed,
                "skipped": summary.skipped,
                "failed": summary.failed,
                "elapsed_ms": summary.elapsed_ms,
            })
        );
        return;
    }
    let (glyph, role) = if summary.executed == 0 {
        ("error", Role::Error)
    } else if summary.skipped + summary.failed > 0 {
        ("warn", Role::Warning)
    } else {
        ("success", Role::Success)
    };
    let title = format!("{} '{}' done", emoji(glyph, style), ctx.module_name());
    let detail = format!(
        "{} executed • {} skipped • {} failed • {} {} ms",
        summary.executed,
        summary.skipped,
        summary.failed,
        emoji("clock", style),
        summary.elapsed_ms
    );
    println!("{}", box_header(&title, Some(detail.as_str()), style));
    if summary.executed == 0 {
        eprintln!("{}", color(role, "nothing was executed", style));
    }
}
