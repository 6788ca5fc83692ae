/*!
`context.rs`

Turns parsed arguments into a validated, immutable `ExecutionContext`.

Checks run in a fixed order and the first failure wins:
  1. /enum                       -> Unsupported (directory enumeration)
  2. /module + /sccm             -> InvalidCombination; neither -> MissingArgument
  3. unknown module              -> ModuleNotFound
  4. /iuser with /link or /chain -> InvalidCombination
  5. /chain without /link        -> InvalidCombination
  6. several hosts with any link -> InvalidCombination
  7. /iuser on a module without an impersonation slot -> Unsupported
  8. /link  on a module without a linked slot         -> Unsupported
  9. mode selection
 10. module operands for the selected mode -> MissingArgument
 11. connection settings         -> InvalidValue / MissingArgument

Combination and cardinality rules do not depend on the module, so they run
before any per-module slot check.

Nothing here touches the network; a failure ends the run before dispatch.
*/

use std::time::Duration;

use thiserror::Error;

use crate::cmd::args::ParsedArguments;
use crate::cmd::modules::{Catalogue, Family, ModuleDef, OPERAND_KEYS, Operands, Slot};
use crate::sql::{self, AuthKind, ConnectionSettings};

/// Host used when no `/host` is given.
pub const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("module '{0}' not found")]
    ModuleNotFound(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("invalid combination: {0}")]
    InvalidCombination(&'static str),
    #[error("missing required argument /{0}")]
    MissingArgument(&'static str),
    #[error("invalid value '{value}' for /{key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standard,
    Impersonation,
    Linked,
    Chained,
}

/// Everything a run needs, derived once from the arguments.
#[derive(Debug, Clone)]
pub struct ExecutionContext<'c> {
    pub mode: Mode,
    pub module: &'c ModuleDef,
    pub primary_hosts: Vec<String>,
    pub linked_hosts: Option<Vec<String>>,
    pub impersonate_user: Option<String>,
    pub operands: Operands,
    pub settings: ConnectionSettings,
}

impl ExecutionContext<'_> {
    pub fn module_name(&self) -> &'static str {
        self.module.name
    }

    pub fn links(&self) -> &[String] {
        self.linked_hosts.as_deref().unwrap_or_default()
    }
}

pub fn resolve<'c>(
    args: &ParsedArguments,
    catalogue: &'c Catalogue,
) -> Result<ExecutionContext<'c>, ResolveError> {
    if args.has("enum") {
        return Err(ResolveError::Unsupported(
            "directory enumeration is not supported".to_string(),
        ));
    }

    let (family, name) = match (args.get("module"), args.get("sccm")) {
        (Some(_), Some(_)) => {
            return Err(ResolveError::InvalidCombination(
                "/module and /sccm cannot be used together",
            ));
        }
        (Some(m), None) => (Family::Sql, m),
        (None, Some(s)) => (Family::Sccm, s),
        (None, None) => return Err(ResolveError::MissingArgument("module")),
    };
    let name = name.trim().to_ascii_lowercase();
    let module = catalogue
        .find(family, &name)
        .ok_or_else(|| ResolveError::ModuleNotFound(name.clone()))?;

    let impersonate_user = non_empty(args, "iuser")?;
    let linked_hosts = list(args, "link")?;
    let chain = args.has("chain");

    if impersonate_user.is_some() && linked_hosts.is_some() {
        return Err(ResolveError::InvalidCombination(
            "/iuser cannot be combined with /link",
        ));
    }
    if impersonate_user.is_some() && chain {
        return Err(ResolveError::InvalidCombination(
            "/iuser cannot be combined with /chain",
        ));
    }
    if chain && linked_hosts.is_none() {
        return Err(ResolveError::InvalidCombination("/chain requires /link"));
    }
    let primary_hosts = list(args, "host")?.unwrap_or_else(|| vec![DEFAULT_HOST.to_string()]);
    // Applies to chains as well; a link is not assumed to exist on every host.
    if primary_hosts.len() > 1 && linked_hosts.is_some() {
        return Err(ResolveError::InvalidCombination(
            "linked servers can only be reached through a single /host",
        ));
    }

    if impersonate_user.is_some() && module.counts.impersonation() == Slot::Unsupported {
        return Err(ResolveError::Unsupported(format!(
            "module '{}' does not support impersonation",
            module.name
        )));
    }
    if linked_hosts.is_some() && module.counts.linked() == Slot::Unsupported {
        return Err(ResolveError::Unsupported(format!(
            "module '{}' does not support linked servers",
            module.name
        )));
    }

    let (mode, slot) = if impersonate_user.is_some() {
        (Mode::Impersonation, module.counts.impersonation())
    } else if let Some(links) = &linked_hosts {
        let mode = if chain && links.len() > 1 {
            Mode::Chained
        } else {
            Mode::Linked
        };
        (mode, module.counts.linked())
    } else {
        (Mode::Standard, module.counts.standard())
    };

    let required_args = match slot {
        Slot::Required(n) => n,
        Slot::Unsupported => {
            return Err(ResolveError::Unsupported(format!(
                "module '{}' does not support this mode",
                module.name
            )));
        }
    };
    let operands = operands(args, required_args)?;
    let settings = settings(args)?;

    Ok(ExecutionContext {
        mode,
        module,
        primary_hosts,
        linked_hosts,
        impersonate_user,
        operands,
        settings,
    })
}

fn non_empty(args: &ParsedArguments, key: &'static str) -> Result<Option<String>, ResolveError> {
    match args.get(key) {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Err(ResolveError::InvalidValue {
            key,
            value: v.to_string(),
            reason: "value cannot be empty".to_string(),
        }),
        Some(v) => Ok(Some(v.trim().to_string())),
    }
}

/// Comma-separated list in user order; empty entries dropped.
fn list(args: &ParsedArguments, key: &'static str) -> Result<Option<Vec<String>>, ResolveError> {
    let Some(raw) = args.get(key) else {
        return Ok(None);
    };
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        return Err(ResolveError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected at least one name".to_string(),
        });
    }
    if key == "host" {
        for item in &items {
            sql::parse_host(item).map_err(|e| ResolveError::InvalidValue {
                key,
                value: item.clone(),
                reason: format!("{e:#}"),
            })?;
        }
    }
    Ok(Some(items))
}

fn operands(args: &ParsedArguments, required: usize) -> Result<Operands, ResolveError> {
    for key in OPERAND_KEYS.iter().take(required) {
        match args.get(key) {
            Some(v) if !v.trim().is_empty() => {}
            _ => return Err(ResolveError::MissingArgument(*key)),
        }
    }
    Ok(Operands {
        command: args.get("command").map(str::to_string),
        option: args.get("option").map(str::to_string),
    })
}

fn settings(args: &ParsedArguments) -> Result<ConnectionSettings, ResolveError> {
    let mut settings = ConnectionSettings::default();

    settings.username = args.get("username").map(str::to_string);
    settings.password = args.get("password").map(str::to_string);
    settings.domain = args.get("domain").map(str::to_string);

    settings.auth = match args.get("auth") {
        Some(raw) => raw.parse().map_err(|reason| ResolveError::InvalidValue {
            key: "auth",
            value: raw.to_string(),
            reason,
        })?,
        None if settings.username.is_some() => AuthKind::Local,
        None => AuthKind::WinToken,
    };
    if matches!(settings.auth, AuthKind::Local | AuthKind::Windows) && settings.username.is_none()
    {
        return Err(ResolveError::MissingArgument("username"));
    }

    if let Some(db) = non_empty(args, "database")? {
        settings.database = db;
    }
    if let Some(raw) = args.get("port") {
        settings.port = raw.trim().parse().map_err(|_| ResolveError::InvalidValue {
            key: "port",
            value: raw.to_string(),
            reason: "expected a port number".to_string(),
        })?;
    }
    if let Some(raw) = args.get("timeout") {
        let secs: u64 = raw.trim().parse().map_err(|_| ResolveError::InvalidValue {
            key: "timeout",
            value: raw.to_string(),
            reason: "expected seconds".to_string(),
        })?;
        settings.timeout = Duration::from_secs(secs);
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_tokens(tokens: &[&str]) -> Result<(Mode, Vec<String>, Option<Vec<String>>), ResolveError> {
        let args = ParsedArguments::parse(tokens).unwrap();
        let catalogue = Catalogue::builtin();
        resolve(&args, &catalogue).map(|ctx| (ctx.mode, ctx.primary_hosts, ctx.linked_hosts))
    }

    #[test]
    fn standard_defaults_to_localhost() {
        let (mode, hosts, links) = resolve_tokens(&["/m:info"]).unwrap();
        assert_eq!(mode, Mode::Standard);
        assert_eq!(hosts, vec![DEFAULT_HOST]);
        assert!(links.is_none());
    }

    #[test]
    fn host_order_preserved() {
        let (_, hosts, _) = resolve_tokens(&["/m:info", "/h:c, a ,b"]).unwrap();
        assert_eq!(hosts, vec!["c", "a", "b"]);
    }

    #[test]
    fn unknown_module() {
        let err = resolve_tokens(&["/m:nope"]).unwrap_err();
        assert_eq!(err, ResolveError::ModuleNotFound("nope".into()));
    }

    #[test]
    fn module_missing() {
        let err = resolve_tokens(&["/h:sql01"]).unwrap_err();
        assert_eq!(err, ResolveError::MissingArgument("module"));
    }

    #[test]
    fn module_and_sccm_conflict() {
        let err = resolve_tokens(&["/m:info", "/s:sites"]).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidCombination(_)));
    }

    #[test]
    fn enum_is_unsupported() {
        let err = resolve_tokens(&["/e:sqlspns"]).unwrap_err();
        assert!(matches!(err, ResolveError::Unsupported(_)));
    }

    #[test]
    fn impersonation_mode() {
        let (mode, _, _) = resolve_tokens(&["/m:whoami", "/i:sa"]).unwrap();
        assert_eq!(mode, Mode::Impersonation);
    }

    #[test]
    fn impersonation_unsupported_by_module() {
        let err = resolve_tokens(&["/m:impersonate", "/i:sa"]).unwrap_err();
        assert_eq!(
            err,
            ResolveError::Unsupported("module 'impersonate' does not support impersonation".into())
        );
    }

    #[test]
    fn linked_unsupported_by_module() {
        let err = resolve_tokens(&["/m:enablerpc", "/c:SQL02", "/l:SQL02"]).unwrap_err();
        assert_eq!(
            err,
            ResolveError::Unsupported("module 'enablerpc' does not support linked servers".into())
        );
    }

    #[test]
    fn sccm_family_has_no_linked_slot() {
        let err = resolve_tokens(&["/s:sites", "/l:SQL02"]).unwrap_err();
        assert!(matches!(err, ResolveError::Unsupported(_)));
    }

    /// `/module:<name>` or `/sccm:<name>` for every catalogue entry.
    fn every_module_selector() -> Vec<String> {
        Catalogue::builtin()
            .iter()
            .map(|m| format!("/{}:{}", m.family.flag(), m.name))
            .collect()
    }

    #[test]
    fn iuser_with_link_conflicts_for_any_module() {
        for selector in every_module_selector() {
            let err = resolve_tokens(&[selector.as_str(), "/c:x", "/o:y", "/i:sa", "/l:SQL02"])
                .unwrap_err();
            assert!(
                matches!(err, ResolveError::InvalidCombination(_)),
                "{selector}: {err}"
            );
        }
    }

    #[test]
    fn iuser_with_chain_conflicts() {
        let err = resolve_tokens(&["/m:info", "/i:sa", "/chain"]).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidCombination(_)));
    }

    #[test]
    fn chain_without_link_conflicts() {
        let err = resolve_tokens(&["/m:info", "/chain"]).unwrap_err();
        assert_eq!(err, ResolveError::InvalidCombination("/chain requires /link"));
    }

    #[test]
    fn two_hosts_one_link_rejected_for_any_module() {
        for selector in every_module_selector() {
            let err = resolve_tokens(&[selector.as_str(), "/c:x", "/o:y", "/h:a,b", "/l:c"])
                .unwrap_err();
            assert!(
                matches!(err, ResolveError::InvalidCombination(_)),
                "{selector}: {err}"
            );
        }
    }

    #[test]
    fn iuser_with_chain_conflicts_before_slot_check() {
        let err = resolve_tokens(&["/m:impersonate", "/i:sa", "/chain"]).unwrap_err();
        assert_eq!(
            err,
            ResolveError::InvalidCombination("/iuser cannot be combined with /chain")
        );
    }

    #[test]
    fn two_hosts_chain_rejected_identically() {
        let plain = resolve_tokens(&["/m:info", "/h:a,b", "/l:c,d"]).unwrap_err();
        let chained = resolve_tokens(&["/m:info", "/h:a,b", "/l:c,d", "/chain"]).unwrap_err();
        assert_eq!(plain, chained);
    }

    #[test]
    fn linked_and_chained_modes() {
        let (mode, _, links) = resolve_tokens(&["/m:info", "/l:a,b"]).unwrap();
        assert_eq!(mode, Mode::Linked);
        assert_eq!(links.unwrap(), vec!["a", "b"]);

        let (mode, _, _) = resolve_tokens(&["/m:info", "/l:a,b", "/chain"]).unwrap();
        assert_eq!(mode, Mode::Chained);
    }

    #[test]
    fn chain_with_single_link_is_linked() {
        let (mode, _, _) = resolve_tokens(&["/m:info", "/l:a", "/chain"]).unwrap();
        assert_eq!(mode, Mode::Linked);
    }

    #[test]
    fn operands_required_per_mode() {
        let err = resolve_tokens(&["/m:query"]).unwrap_err();
        assert_eq!(err, ResolveError::MissingArgument("command"));

        let err = resolve_tokens(&["/m:search", "/c:master"]).unwrap_err();
        assert_eq!(err, ResolveError::MissingArgument("option"));

        assert!(resolve_tokens(&["/m:search", "/c:master", "/o:pass"]).is_ok());
    }

    #[test]
    fn empty_link_value_rejected() {
        let err = resolve_tokens(&["/m:info", "/l:, ,"]).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidValue { key: "link", .. }));
    }

    #[test]
    fn settings_parsed() {
        let args = ParsedArguments::parse([
            "/m:info", "/u:sa", "/p:pw", "/port:1444", "/t:9", "/database:msdb",
        ])
        .unwrap();
        let catalogue = Catalogue::builtin();
        let ctx = resolve(&args, &catalogue).unwrap();
        assert_eq!(ctx.settings.auth, AuthKind::Local);
        assert_eq!(ctx.settings.port, 1444);
        assert_eq!(ctx.settings.timeout, Duration::from_secs(9));
        assert_eq!(ctx.settings.database, "msdb");
    }

    #[test]
    fn bad_port_and_auth() {
        let err = resolve_tokens(&["/m:info", "/port:x"]).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidValue { key: "port", .. }));
        let err = resolve_tokens(&["/m:info", "/a:kerberos"]).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidValue { key: "auth", .. }));
        let err = resolve_tokens(&["/m:info", "/a:local"]).unwrap_err();
        assert_eq!(err, ResolveError::MissingArgument("username"));
    }
}
