/*!
`modules.rs`

Built-in module catalogue and the query runner that executes it.

Each module declares how many operands (`/command`, then `/option`) it needs
per execution mode, and builds a `QueryBook` from those operands. The runner
shapes the book for the active route and sends every query over the session.

Families:
  Sql  (/module) : counts for standard, impersonation and linked execution
  Sccm (/sccm)   : counts for standard and impersonation; never linked
*/

use std::fmt;

use anyhow::Context;

use crate::cmd::context::ExecutionContext;
use crate::cmd::dispatch::Execute;
use crate::cmd::report::Reporter;
use crate::log_trace;
use crate::query::{QueryBook, Route};
use crate::sql::Session;

/// Operand keys in the order modules consume them.
pub const OPERAND_KEYS: [&str; 2] = ["command", "option"];

/// Operand requirement for one execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Unsupported,
    Required(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgCounts {
    Triple {
        standard: Slot,
        impersonation: Slot,
        linked: Slot,
    },
    Pair {
        standard: Slot,
        impersonation: Slot,
    },
}

impl ArgCounts {
    const fn triple(standard: usize, impersonation: Option<usize>, linked: Option<usize>) -> Self {
        ArgCounts::Triple {
            standard: Slot::Required(standard),
            impersonation: slot(impersonation),
            linked: slot(linked),
        }
    }

    const fn pair(standard: usize, impersonation: usize) -> Self {
        ArgCounts::Pair {
            standard: Slot::Required(standard),
            impersonation: Slot::Required(impersonation),
        }
    }

    pub fn standard(&self) -> Slot {
        match self {
            ArgCounts::Triple { standard, .. } | ArgCounts::Pair { standard, .. } => *standard,
        }
    }

    pub fn impersonation(&self) -> Slot {
        match self {
            ArgCounts::Triple { impersonation, .. } | ArgCounts::Pair { impersonation, .. } => {
                *impersonation
            }
        }
    }

    pub fn linked(&self) -> Slot {
        match self {
            ArgCounts::Triple { linked, .. } => *linked,
            ArgCounts::Pair { .. } => Slot::Unsupported,
        }
    }
}

const fn slot(n: Option<usize>) -> Slot {
    match n {
        Some(n) => Slot::Required(n),
        None => Slot::Unsupported,
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Unsupported => f.write_str("-"),
            Slot::Required(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Sql,
    Sccm,
}

impl Family {
    /// Argument key that selects a module of this family.
    pub fn flag(&self) -> &'static str {
        match self {
            Family::Sql => "module",
            Family::Sccm => "sccm",
        }
    }
}

/// Operand values taken from the arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Operands {
    pub command: Option<String>,
    pub option: Option<String>,
}

impl Operands {
    fn command(&self) -> &str {
        self.command.as_deref().unwrap_or_default()
    }

    fn option(&self) -> &str {
        self.option.as_deref().unwrap_or_default()
    }
}

pub struct ModuleDef {
    pub name: &'static str,
    pub family: Family,
    pub counts: ArgCounts,
    pub summary: &'static str,
    build: fn(&Operands) -> QueryBook,
}

impl ModuleDef {
    const fn sql(
        name: &'static str,
        counts: ArgCounts,
        summary: &'static str,
        build: fn(&Operands) -> QueryBook,
    ) -> Self {
        Self {
            name,
            family: Family::Sql,
            counts,
            summary,
            build,
        }
    }

    const fn sccm(
        name: &'static str,
        counts: ArgCounts,
        summary: &'static str,
        build: fn(&Operands) -> QueryBook,
    ) -> Self {
        Self {
            name,
            family: Family::Sccm,
            counts,
            summary,
            build,
        }
    }

    pub fn queries(&self, operands: &Operands) -> QueryBook {
        (self.build)(operands)
    }
}

impl fmt::Debug for ModuleDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDef")
            .field("name", &self.name)
            .field("family", &self.family)
            .field("counts", &self.counts)
            .finish()
    }
}

/* ---- Catalogue ---- */

pub struct Catalogue {
    modules: Vec<ModuleDef>,
}

impl Catalogue {
    pub fn builtin() -> Self {
        Self {
            modules: vec![
                ModuleDef::sql("info", ArgCounts::triple(0, Some(0), Some(0)), "Server name, version and service", info),
                ModuleDef::sql("whoami", ArgCounts::triple(0, Some(0), Some(0)), "Current login, mapped user and roles", whoami),
                ModuleDef::sql("databases", ArgCounts::triple(0, Some(0), Some(0)), "Databases on the server", databases),
                ModuleDef::sql("tables", ArgCounts::triple(1, Some(1), Some(1)), "Tables in database /command", tables),
                ModuleDef::sql("users", ArgCounts::triple(0, Some(0), Some(0)), "Server principals", users),
                ModuleDef::sql("links", ArgCounts::triple(0, Some(0), Some(0)), "Linked servers", links),
                ModuleDef::sql("impersonate", ArgCounts::triple(0, None, Some(0)), "Logins that can be impersonated", impersonate),
                ModuleDef::sql("query", ArgCounts::triple(1, Some(1), Some(1)), "Run /command and show its rows", query),
                ModuleDef::sql("exec", ArgCounts::triple(1, Some(1), Some(1)), "Run /command as a statement (no rows)", exec),
                ModuleDef::sql("rpcstatus", ArgCounts::triple(0, Some(0), Some(0)), "RPC out / data access per server", rpc_status),
                ModuleDef::sql("enablerpc", ArgCounts::triple(1, Some(1), None), "Enable RPC out for linked server /command", enable_rpc),
                ModuleDef::sql("search", ArgCounts::triple(2, Some(2), Some(2)), "Columns in database /command matching /option", search),
                ModuleDef::sccm("sites", ArgCounts::pair(0, 0), "SCCM sites", sccm_sites),
                ModuleDef::sccm("admins", ArgCounts::pair(0, 0), "SCCM administrative users", sccm_admins),
                ModuleDef::sccm("devices", ArgCounts::pair(0, 0), "SCCM managed devices", sccm_devices),
                ModuleDef::sccm("device", ArgCounts::pair(1, 1), "SCCM device named /command", sccm_device),
            ],
        }
    }

    pub fn find(&self, family: Family, name: &str) -> Option<&ModuleDef> {
        self.modules
            .iter()
            .find(|m| m.family == family && m.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDef> {
        self.modules.iter()
    }
}

/* ---- Query Builders ---- */

/// Quote an identifier with brackets.
fn bracket(ident: &str) -> String {
    format!("[{}]", ident.replace(']', "]]"))
}

/// Body of a string literal (quotes doubled, delimiters not included).
fn literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn book(entries: &[(&str, String)]) -> QueryBook {
    entries
        .iter()
        .map(|(name, q)| (name.to_string(), q.clone()))
        .collect()
}

fn info(_: &Operands) -> QueryBook {
    book(&[(
        "server",
        "SELECT @@SERVERNAME AS server_name, \
         CAST(SERVERPROPERTY('ProductVersion') AS nvarchar(128)) AS version, \
         CAST(SERVERPROPERTY('Edition') AS nvarchar(128)) AS edition, \
         DEFAULT_DOMAIN() AS domain, @@SERVICENAME AS service, \
         CAST(SERVERPROPERTY('IsClustered') AS int) AS clustered"
            .to_string(),
    )])
}

fn whoami(_: &Operands) -> QueryBook {
    book(&[
        (
            "login",
            "SELECT SYSTEM_USER AS login, USER_NAME() AS mapped_user".to_string(),
        ),
        (
            "roles",
            "SELECT IS_SRVROLEMEMBER('sysadmin') AS sysadmin, \
             IS_SRVROLEMEMBER('securityadmin') AS securityadmin, \
             IS_SRVROLEMEMBER('public') AS public_role"
                .to_string(),
        ),
    ])
}

fn databases(_: &Operands) -> QueryBook {
    book(&[(
        "databases",
        "SELECT CAST(database_id AS int) AS id, name, SUSER_SNAME(owner_sid) AS owner, \
         is_trustworthy_on AS trustworthy FROM sys.databases"
            .to_string(),
    )])
}

fn tables(ops: &Operands) -> QueryBook {
    book(&[(
        "tables",
        format!(
            "SELECT TABLE_SCHEMA AS table_schema, TABLE_NAME AS table_name \
             FROM {}.INFORMATION_SCHEMA.TABLES ORDER BY TABLE_SCHEMA, TABLE_NAME",
            bracket(ops.command())
        ),
    )])
}

fn users(_: &Operands) -> QueryBook {
    book(&[(
        "principals",
        "SELECT name, type_desc, is_disabled FROM sys.server_principals \
         WHERE type IN ('S', 'U', 'G') ORDER BY name"
            .to_string(),
    )])
}

fn links(_: &Operands) -> QueryBook {
    book(&[(
        "links",
        "SELECT name, provider, data_source, is_rpc_out_enabled AS rpc_out \
         FROM sys.servers WHERE is_linked = 1"
            .to_string(),
    )])
}

fn impersonate(_: &Operands) -> QueryBook {
    book(&[(
        "impersonatable",
        "SELECT DISTINCT b.name AS login FROM sys.server_permissions a \
         INNER JOIN sys.server_principals b ON a.grantor_principal_id = b.principal_id \
         WHERE a.permission_name = 'IMPERSONATE'"
            .to_string(),
    )])
}

fn query(ops: &Operands) -> QueryBook {
    book(&[("query", ops.command().to_string())])
}

fn exec(ops: &Operands) -> QueryBook {
    book(&[("rpc_exec", ops.command().to_string())])
}

fn rpc_status(_: &Operands) -> QueryBook {
    book(&[(
        "servers",
        "SELECT name, is_rpc_out_enabled AS rpc_out, is_data_access_enabled AS data_access \
         FROM sys.servers"
            .to_string(),
    )])
}

fn enable_rpc(ops: &Operands) -> QueryBook {
    book(&[(
        "rpc_enable",
        format!(
            "EXEC sp_serveroption '{}', 'rpc out', 'true'",
            literal(ops.command())
        ),
    )])
}

fn search(ops: &Operands) -> QueryBook {
    book(&[(
        "columns",
        format!(
            "SELECT TABLE_SCHEMA AS table_schema, TABLE_NAME AS table_name, \
             COLUMN_NAME AS column_name FROM {}.INFORMATION_SCHEMA.COLUMNS \
             WHERE COLUMN_NAME LIKE '%{}%'",
            bracket(ops.command()),
            literal(ops.option())
        ),
    )])
}

fn sccm_sites(_: &Operands) -> QueryBook {
    book(&[(
        "sites",
        "SELECT SiteCode, SiteName, ServerName, Version FROM v_Site".to_string(),
    )])
}

fn sccm_admins(_: &Operands) -> QueryBook {
    book(&[(
        "admins",
        "SELECT AdminID, LogonName, DisplayName, IsGroup FROM RBAC_Admins".to_string(),
    )])
}

fn sccm_devices(_: &Operands) -> QueryBook {
    book(&[(
        "devices",
        "SELECT ResourceID, Name0 AS name, User_Name0 AS last_user, \
         Operating_System_Name_and0 AS os FROM v_R_System"
            .to_string(),
    )])
}

fn sccm_device(ops: &Operands) -> QueryBook {
    book(&[(
        "device",
        format!(
            "SELECT ResourceID, Name0 AS name, User_Name0 AS last_user, \
             Operating_System_Name_and0 AS os FROM v_R_System WHERE Name0 = '{}'",
            literal(ops.command())
        ),
    )])
}

/* ---- Runner ---- */

/// Executes a catalogue module: build, shape for the route, send, report.
#[derive(Debug, Default)]
pub struct QueryRunner;

impl<S: Session> Execute<S> for QueryRunner {
    fn execute(
        &mut self,
        ctx: &ExecutionContext<'_>,
        session: &mut S,
        host: &str,
        route: &Route,
        reporter: &mut dyn Reporter,
    ) -> anyhow::Result<()> {
        let target = route.final_hop().unwrap_or(host);
        let book = route.shape(ctx.module.queries(&ctx.operands));
        for (name, sql) in book {
            reporter.debug(&format!("{name}: {sql}"));
            log_trace!("sending '{name}' to {host} ({route})");
            let rows = session
                .run(&sql)
                .with_context(|| format!("query '{name}' failed"))?;
            reporter.result(target, &name, &rows);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::args::ParsedArguments;
    use crate::cmd::context::resolve;
    use crate::cmd::dispatch;
    use crate::cmd::report::testing::RecordingReporter;
    use crate::sql::{PLAN_COLUMN, PlanConnector};

    #[test]
    fn names_unique_per_family() {
        let catalogue = Catalogue::builtin();
        let mut seen = std::collections::HashSet::new();
        for m in catalogue.iter() {
            assert!(seen.insert((m.family, m.name)), "duplicate module {}", m.name);
        }
    }

    #[test]
    fn sccm_never_linked() {
        let catalogue = Catalogue::builtin();
        for m in catalogue.iter().filter(|m| m.family == Family::Sccm) {
            assert_eq!(m.counts.linked(), Slot::Unsupported);
        }
    }

    #[test]
    fn find_is_case_insensitive_and_family_scoped() {
        let catalogue = Catalogue::builtin();
        assert!(catalogue.find(Family::Sql, "INFO").is_some());
        assert!(catalogue.find(Family::Sccm, "info").is_none());
    }

    #[test]
    fn operands_are_escaped() {
        let ops = Operands {
            command: Some("we]ird".into()),
            option: Some("pa'ss".into()),
        };
        let q = search(&ops);
        assert!(q[0].1.contains("[we]]ird].INFORMATION_SCHEMA.COLUMNS"));
        assert!(q[0].1.contains("LIKE '%pa''ss%'"));
    }

    #[test]
    fn rpc_modules_use_rpc_prefix() {
        let ops = Operands {
            command: Some("SQL02".into()),
            option: None,
        };
        assert!(crate::query::is_rpc(&enable_rpc(&ops)[0].0));
        assert!(crate::query::is_rpc(&exec(&ops)[0].0));
    }

    fn plan(tokens: &[&str]) -> RecordingReporter {
        let args = ParsedArguments::parse(tokens).unwrap();
        let catalogue = Catalogue::builtin();
        let ctx = resolve(&args, &catalogue).unwrap();
        let mut reporter = RecordingReporter::default();
        let summary = dispatch::run(&ctx, &mut PlanConnector, &mut QueryRunner, &mut reporter);
        assert_eq!(summary.failed, 0);
        reporter
    }

    fn planned(reporter: &RecordingReporter) -> Vec<(String, String)> {
        reporter
            .results()
            .into_iter()
            .map(|(target, _, rows)| {
                assert_eq!(rows.columns, vec![PLAN_COLUMN]);
                (target.to_string(), rows.rows[0][0].clone())
            })
            .collect()
    }

    #[test]
    fn plan_direct_queries_in_host_order() {
        let reporter = plan(&["/m:query", "/c:SELECT 'x'", "/h:b,a"]);
        assert_eq!(
            planned(&reporter),
            vec![
                ("b".to_string(), "SELECT 'x'".to_string()),
                ("a".to_string(), "SELECT 'x'".to_string())
            ]
        );
    }

    #[test]
    fn plan_impersonated() {
        let reporter = plan(&["/m:query", "/c:SELECT 1", "/i:sa"]);
        assert_eq!(
            planned(&reporter)[0].1,
            "EXECUTE AS LOGIN = 'sa'; SELECT 1"
        );
    }

    #[test]
    fn plan_linked_targets_link_name() {
        let reporter = plan(&["/m:exec", "/c:EXEC sp_who", "/h:sql01", "/l:SQL02"]);
        assert_eq!(
            planned(&reporter),
            vec![(
                "SQL02".to_string(),
                "EXECUTE ('EXEC sp_who') AT SQL02;".to_string()
            )]
        );
    }

    #[test]
    fn plan_chain_nests_once() {
        let reporter = plan(&["/m:query", "/c:SELECT 'x'", "/l:a,b", "/chain"]);
        let out = planned(&reporter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "b");
        assert_eq!(
            out[0].1,
            r#"SELECT * FROM OPENQUERY("a", 'SELECT * FROM OPENQUERY("b", ''SELECT ''''x'''''')')"#
        );
    }
}
