/*!
`dispatch.rs`

Walks the targets of an `ExecutionContext` in user order and runs the module
once per target.

Per mode:
  Standard / Impersonation : connect to each primary host; failures are warned and skipped
  Linked                   : one connection to the primary; one execution per link
  Chained                  : one connection; a single execution over the whole chain

Nothing escapes `run`: connection and module failures go to the reporter
and the loop carries on.
*/

use std::time::Instant;

use crate::cmd::context::{ExecutionContext, Mode};
use crate::cmd::report::Reporter;
use crate::query::{Route, chain_sequence};
use crate::sql::Connector;

/// Module business logic invoked once per target.
pub trait Execute<S> {
    fn execute(
        &mut self,
        ctx: &ExecutionContext<'_>,
        session: &mut S,
        host: &str,
        route: &Route,
        reporter: &mut dyn Reporter,
    ) -> anyhow::Result<()>;
}

/// Outcome counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
}

pub fn run<C, E>(
    ctx: &ExecutionContext<'_>,
    connector: &mut C,
    module: &mut E,
    reporter: &mut dyn Reporter,
) -> RunSummary
where
    C: Connector,
    E: Execute<C::Session>,
{
    let started = Instant::now();
    let mut summary = RunSummary::default();
    match ctx.mode {
        Mode::Standard | Mode::Impersonation => {
            run_hosts(ctx, connector, module, reporter, &mut summary)
        }
        Mode::Linked => run_links(ctx, connector, module, reporter, &mut summary),
        Mode::Chained => run_chain(ctx, connector, module, reporter, &mut summary),
    }
    summary.elapsed_ms = started.elapsed().as_millis();
    summary
}

fn counter(idx: usize, total: usize) -> String {
    if total > 1 {
        format!("({}/{total}) ", idx + 1)
    } else {
        String::new()
    }
}

fn run_hosts<C, E>(
    ctx: &ExecutionContext<'_>,
    connector: &mut C,
    module: &mut E,
    reporter: &mut dyn Reporter,
    summary: &mut RunSummary,
) where
    C: Connector,
    E: Execute<C::Session>,
{
    let total = ctx.primary_hosts.len();
    for (idx, host) in ctx.primary_hosts.iter().enumerate() {
        let mut session = match connector.connect(host) {
            Ok(session) => session,
            Err(failure) => {
                reporter.warning(&failure.to_string());
                summary.skipped += 1;
                continue;
            }
        };

        let route = match &ctx.impersonate_user {
            Some(user) => {
                reporter.status(&format!(
                    "{}Executing '{}' on {host} as {user}",
                    counter(idx, total),
                    ctx.module_name()
                ));
                Route::Impersonate(user.clone())
            }
            None => {
                reporter.status(&format!(
                    "{}Executing '{}' on {host}",
                    counter(idx, total),
                    ctx.module_name()
                ));
                Route::Direct
            }
        };
        invoke(ctx, module, &mut session, host, &route, reporter, summary);
    }
}

fn run_links<C, E>(
    ctx: &ExecutionContext<'_>,
    connector: &mut C,
    module: &mut E,
    reporter: &mut dyn Reporter,
    summary: &mut RunSummary,
) where
    C: Connector,
    E: Execute<C::Session>,
{
    let Some((primary, mut session)) = connect_primary(ctx, connector, reporter, summary) else {
        return;
    };
    let links = ctx.links();
    for (idx, link) in links.iter().enumerate() {
        reporter.status(&format!(
            "{}Executing '{}' on {link} via {primary}",
            counter(idx, links.len()),
            ctx.module_name()
        ));
        let route = Route::Linked(link.clone());
        invoke(ctx, module, &mut session, primary, &route, reporter, summary);
    }
}

fn run_chain<C, E>(
    ctx: &ExecutionContext<'_>,
    connector: &mut C,
    module: &mut E,
    reporter: &mut dyn Reporter,
    summary: &mut RunSummary,
) where
    C: Connector,
    E: Execute<C::Session>,
{
    let Some((primary, mut session)) = connect_primary(ctx, connector, reporter, summary) else {
        return;
    };
    let mut path = vec![primary.as_str()];
    path.extend(ctx.links().iter().map(String::as_str));
    reporter.status(&format!(
        "Executing '{}' through {}",
        ctx.module_name(),
        path.join(" -> ")
    ));
    let route = Route::Chain(chain_sequence(ctx.links()));
    invoke(ctx, module, &mut session, primary, &route, reporter, summary);
}

/// Linked and chained runs reuse one connection to the single primary host.
fn connect_primary<'a, C: Connector>(
    ctx: &'a ExecutionContext<'_>,
    connector: &mut C,
    reporter: &mut dyn Reporter,
    summary: &mut RunSummary,
) -> Option<(&'a String, C::Session)> {
    let primary = ctx.primary_hosts.first()?;
    match connector.connect(primary) {
        Ok(session) => Some((primary, session)),
        Err(failure) => {
            reporter.warning(&failure.to_string());
            summary.skipped += 1;
            None
        }
    }
}

fn invoke<S, E: Execute<S>>(
    ctx: &ExecutionContext<'_>,
    module: &mut E,
    session: &mut S,
    host: &str,
    route: &Route,
    reporter: &mut dyn Reporter,
    summary: &mut RunSummary,
) {
    match module.execute(ctx, session, host, route, reporter) {
        Ok(()) => summary.executed += 1,
        Err(e) => {
            let target = route.final_hop().unwrap_or(host);
            reporter.error(&format!("'{}' failed on {target}: {e:#}", ctx.module_name()));
            summary.failed += 1;
        }
    }
}
