use anyhow::Result;
use clap::Parser;

mod cmd;
mod query;
mod sql;
mod utils;

use cmd::RunArgs;

/// sqlhop - SQL Server module runner over direct, impersonated, linked and
/// chained routes.
///
/// Arguments use the slash grammar `/key[:value]` (keys case-insensitive):
///   /module:<name> (/m)    SQL module       /sccm:<name> (/s)   SCCM module
///   /host:a,b      (/h)    target hosts     /link:x,y    (/l)   linked servers
///   /iuser:<login> (/i)    impersonate      /chain              nest /link hops
///   /command (/c) /option (/o)              module operands
///   /username (/u) /password (/p) /domain (/d) /auth (/a) local|windows|wintoken
///   /database /port /timeout (/t)           connection settings
///   /verbose (/v) /debug                    more logging (queries shown)
///
/// Defaults can come from SQLHOP_ARGS (shell-style) and --config (YAML/JSON);
/// command-line tokens win.
///
/// Examples:
///   sqlhop /m:info /h:sql01,sql02
///   sqlhop /m:whoami /h:sql01 /i:sa
///   sqlhop /m:query /c:"SELECT SYSTEM_USER" /h:sql01 /l:SQL02
///   sqlhop --plan /m:query /c:"SELECT 1" /h:sql01 /l:SQL02,SQL03 /chain
///   sqlhop /help
#[derive(Parser, Debug)]
#[command(
    name = "sqlhop",
    version,
    author,
    about = "sqlhop - run SQL Server modules through impersonation and linked-server chains"
)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence all non-error output
    #[arg(short, long)]
    quiet: bool,

    #[command(flatten)]
    run: RunArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = utils::derive_level(cli.verbose, cli.quiet);
    utils::init_logging(level);

    match cmd::execute_run(cli.run) {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            crate::log_error!("{e:#}");
            std::process::exit(1);
        }
    }
}
