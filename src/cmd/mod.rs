/*!
Command layer for `sqlhop`.

Layout:
  src/cmd/
    mod.rs       (this file)
    args.rs      slash-token parsing and argument layering
    context.rs   ParsedArguments -> ExecutionContext
    modules.rs   module catalogue + QueryRunner
    dispatch.rs  per-mode target walk, RunSummary
    report.rs    Reporter sink (console / JSON)
    format.rs    box / table / color primitives for console output
    run.rs       RunArgs + execute_run (the binary's entry point)

Conventions:
  - The command exposes one public `execute_*` function returning
    `anyhow::Result`.
  - Component failures are typed (`thiserror`); only `run.rs` turns them
    into exit codes.
*/

pub mod args;
pub mod context;
pub mod dispatch;
pub mod format;
pub mod modules;
pub mod report;
pub mod run;

pub use run::{RunArgs, execute_run};
