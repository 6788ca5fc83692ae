//! SQL Server transport: host parsing, connection settings and sessions.
//!
//! parse_host -> HostSpec { host, port }
//! Connector / Session traits, with two implementations:
//!   TdsConnector  - real TDS login through tiberius (blocking on a private runtime)
//!   PlanConnector - offline; every query comes back as a one-row "planned" result
//!
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use thiserror::Error;
use tiberius::{AuthMethod, Client, ColumnData, Config, Row};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use url::{Host, Url};

use crate::{log_debug, log_trace};

pub const DEFAULT_PORT: u16 = 1433;
pub const DEFAULT_DATABASE: &str = "master";
pub const DEFAULT_TIMEOUT_SECS: u64 = 3;
pub const APPLICATION_NAME: &str = "sqlhop";

/* ---- Host Parsing ---- */

/// A user-supplied host entry: `host` or `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub host: String,
    pub port: Option<u16>,
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.host),
            None => f.write_str(&self.host),
        }
    }
}

/// Parse and validate a host entry.
///
/// Commas separate host entries on the command line, so the SQL Server
/// `host,port` form is not accepted; use `host:port`. Validation is delegated
/// to URL authority parsing, so anything with a path, query or credentials is
/// rejected.
pub fn parse_host(raw: &str) -> Result<HostSpec> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("host is empty");
    }
    if trimmed.contains(',') {
        bail!("invalid host '{trimmed}' (use host:port)");
    }

    let url = Url::parse(&format!("mssql://{trimmed}"))
        .with_context(|| format!("invalid host '{trimmed}'"))?;
    if !url.username().is_empty()
        || url.password().is_some()
        || !(url.path().is_empty() || url.path() == "/")
        || url.query().is_some()
        || url.fragment().is_some()
    {
        bail!("invalid host '{trimmed}' (expected host or host:port)");
    }

    let host = match url.host() {
        Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => bail!("invalid host '{trimmed}' (no host name)"),
    };

    Ok(HostSpec {
        host,
        port: url.port(),
    })
}

/* ---- Settings ---- */

/// How the connecting login authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// SQL Server login (`/username`, `/password`).
    Local,
    /// Domain login with explicit credentials (Windows builds).
    Windows,
    /// Current Windows token (Windows builds).
    WinToken,
}

impl FromStr for AuthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(AuthKind::Local),
            "windows" => Ok(AuthKind::Windows),
            "wintoken" => Ok(AuthKind::WinToken),
            _ => Err("expected local, windows or wintoken".to_string()),
        }
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthKind::Local => "local",
            AuthKind::Windows => "windows",
            AuthKind::WinToken => "wintoken",
        })
    }
}

/// Login settings shared by every host of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub auth: AuthKind,
    pub domain: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub port: u16,
    pub timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            auth: AuthKind::WinToken,
            domain: None,
            username: None,
            password: None,
            database: DEFAULT_DATABASE.to_string(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/* ---- Results ---- */

/// Rows returned by one query, every cell rendered as text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn from_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        let mut out = ResultSet::default();
        for row in rows {
            if out.columns.is_empty() {
                out.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            out.rows
                .push(row.cells().map(|(_, data)| render_cell(data)).collect());
        }
        out
    }
}

fn render_cell(data: &ColumnData<'static>) -> String {
    fn opt<T: fmt::Display>(v: &Option<T>) -> String {
        v.as_ref()
            .map(|x| x.to_string())
            .unwrap_or_else(|| "NULL".to_string())
    }
    match data {
        ColumnData::U8(v) => opt(v),
        ColumnData::I16(v) => opt(v),
        ColumnData::I32(v) => opt(v),
        ColumnData::I64(v) => opt(v),
        ColumnData::F32(v) => opt(v),
        ColumnData::F64(v) => opt(v),
        ColumnData::Bit(v) => opt(v),
        ColumnData::String(v) => v
            .as_deref()
            .map(str::to_string)
            .unwrap_or_else(|| "NULL".to_string()),
        ColumnData::Guid(v) => opt(v),
        ColumnData::Numeric(v) => opt(v),
        ColumnData::Binary(v) => v
            .as_deref()
            .map(|bytes| {
                let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
                format!("0x{hex}")
            })
            .unwrap_or_else(|| "NULL".to_string()),
        other => format!("{other:?}"),
    }
}

/* ---- Connector / Session ---- */

/// Per-host connection failure; reported and skipped, never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unable to connect to {host}: {reason}")]
pub struct ConnectionFailure {
    pub host: String,
    pub reason: String,
}

impl ConnectionFailure {
    pub fn new(host: &str, err: anyhow::Error) -> Self {
        Self {
            host: host.to_string(),
            reason: format!("{err:#}"),
        }
    }
}

/// An open session against one SQL Server.
pub trait Session {
    fn run(&mut self, sql: &str) -> Result<ResultSet>;
}

/// Opens sessions by host entry.
pub trait Connector {
    type Session: Session;

    fn connect(&mut self, host: &str) -> Result<Self::Session, ConnectionFailure>;
}

/* ---- TDS (tiberius) ---- */

pub struct TdsConnector {
    settings: ConnectionSettings,
    runtime: Arc<Runtime>,
}

impl TdsConnector {
    pub fn new(settings: ConnectionSettings) -> Result<Self> {
        let runtime = Runtime::new().context("Failed to create Tokio runtime")?;
        Ok(Self {
            settings,
            runtime: Arc::new(runtime),
        })
    }

    fn config_for(&self, spec: &HostSpec) -> Result<Config> {
        let mut config = Config::new();
        config.host(&spec.host);
        config.port(spec.port.unwrap_or(self.settings.port));
        config.database(&self.settings.database);
        config.application_name(APPLICATION_NAME);
        config.trust_cert();
        config.authentication(auth_method(&self.settings)?);
        Ok(config)
    }
}

impl Connector for TdsConnector {
    type Session = TdsSession;

    fn connect(&mut self, host: &str) -> Result<TdsSession, ConnectionFailure> {
        let spec = parse_host(host).map_err(|e| ConnectionFailure::new(host, e))?;
        log_debug!(
            "connecting to {spec} (auth {}, database {})",
            self.settings.auth,
            self.settings.database
        );
        let config = self
            .config_for(&spec)
            .map_err(|e| ConnectionFailure::new(host, e))?;
        let client = self
            .runtime
            .block_on(open_client(config, self.settings.timeout))
            .map_err(|e| ConnectionFailure::new(host, e))?;
        Ok(TdsSession {
            client,
            runtime: Arc::clone(&self.runtime),
        })
    }
}

async fn open_client(config: Config, timeout: Duration) -> Result<Client<Compat<TcpStream>>> {
    let addr = config.get_addr();
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr.clone()))
        .await
        .with_context(|| format!("timed out after {}s reaching {addr}", timeout.as_secs()))?
        .with_context(|| format!("TCP connect to {addr} failed"))?;
    tcp.set_nodelay(true)?;
    let client = Client::connect(config, tcp.compat_write())
        .await
        .context("login failed")?;
    Ok(client)
}

fn auth_method(settings: &ConnectionSettings) -> Result<AuthMethod> {
    match settings.auth {
        AuthKind::Local => {
            let user = settings
                .username
                .as_deref()
                .context("local authentication requires /username")?;
            let password = settings.password.as_deref().unwrap_or("");
            Ok(AuthMethod::sql_server(user, password))
        }
        AuthKind::Windows => windows_login(settings),
        AuthKind::WinToken => integrated_login(),
    }
}

#[cfg(windows)]
fn windows_login(settings: &ConnectionSettings) -> Result<AuthMethod> {
    let user = settings
        .username
        .as_deref()
        .context("windows authentication requires /username")?;
    let login = match settings.domain.as_deref() {
        Some(domain) if !domain.is_empty() => format!("{domain}\\{user}"),
        _ => user.to_string(),
    };
    Ok(AuthMethod::windows(login, settings.password.as_deref().unwrap_or("")))
}

#[cfg(not(windows))]
fn windows_login(_settings: &ConnectionSettings) -> Result<AuthMethod> {
    bail!("windows authentication is only available on Windows builds")
}

#[cfg(windows)]
fn integrated_login() -> Result<AuthMethod> {
    Ok(AuthMethod::Integrated)
}

#[cfg(not(windows))]
fn integrated_login() -> Result<AuthMethod> {
    bail!("token authentication is only available on Windows builds; use /a:local")
}

pub struct TdsSession {
    client: Client<Compat<TcpStream>>,
    runtime: Arc<Runtime>,
}

impl Session for TdsSession {
    fn run(&mut self, sql: &str) -> Result<ResultSet> {
        let runtime = Arc::clone(&self.runtime);
        runtime.block_on(async {
            let stream = self.client.simple_query(sql).await.context("query failed")?;
            let sets = stream
                .into_results()
                .await
                .context("failed to read query results")?;
            Ok::<_, anyhow::Error>(ResultSet::from_rows(sets.into_iter().flatten()))
        })
    }
}

/* ---- Plan (offline) ---- */

/// Column name of the single column a plan session returns.
pub const PLAN_COLUMN: &str = "planned_query";

/// Never opens a socket; hosts are only validated.
#[derive(Debug, Default)]
pub struct PlanConnector;

impl Connector for PlanConnector {
    type Session = PlanSession;

    fn connect(&mut self, host: &str) -> Result<PlanSession, ConnectionFailure> {
        let spec = parse_host(host).map_err(|e| ConnectionFailure::new(host, e))?;
        Ok(PlanSession { host: spec })
    }
}

#[derive(Debug)]
pub struct PlanSession {
    host: HostSpec,
}

impl Session for PlanSession {
    fn run(&mut self, sql: &str) -> Result<ResultSet> {
        log_trace!("planned for {}: {sql}", self.host);
        Ok(ResultSet {
            columns: vec![PLAN_COLUMN.to_string()],
            rows: vec![vec![sql.to_string()]],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_host() {
        let spec = parse_host("sql01").unwrap();
        assert_eq!(spec.host, "sql01");
        assert_eq!(spec.port, None);
    }

    #[test]
    fn parse_colon_port() {
        let spec = parse_host("sql01.corp.local:1444").unwrap();
        assert_eq!(spec.host, "sql01.corp.local");
        assert_eq!(spec.port, Some(1444));
    }

    #[test]
    fn display_keeps_port() {
        let spec = parse_host("sql01:1444").unwrap();
        assert_eq!(spec.to_string(), "sql01:1444");
    }

    #[test]
    fn parse_ipv4() {
        let spec = parse_host("10.0.0.5").unwrap();
        assert_eq!(spec.host, "10.0.0.5");
    }

    #[test]
    fn reject_empty_and_paths() {
        assert!(parse_host("  ").is_err());
        assert!(parse_host("sql01/db").is_err());
        assert!(parse_host("sql01:notaport").is_err());
        assert!(parse_host("sql01,1444").is_err());
    }

    #[test]
    fn auth_kind_parse() {
        assert_eq!("LOCAL".parse::<AuthKind>(), Ok(AuthKind::Local));
        assert_eq!("wintoken".parse::<AuthKind>(), Ok(AuthKind::WinToken));
        assert!("kerberos".parse::<AuthKind>().is_err());
    }

    #[test]
    fn local_auth_requires_username() {
        let settings = ConnectionSettings {
            auth: AuthKind::Local,
            ..ConnectionSettings::default()
        };
        assert!(auth_method(&settings).is_err());
    }

    #[test]
    fn plan_session_echoes_query() {
        let mut conn = PlanConnector;
        let mut session = conn.connect("sql01:1444").unwrap();
        assert_eq!(session.host.port, Some(1444));
        let rs = session.run("SELECT 1").unwrap();
        assert_eq!(rs.columns, vec![PLAN_COLUMN]);
        assert_eq!(rs.rows, vec![vec!["SELECT 1".to_string()]]);
    }

    #[test]
    fn plan_connector_rejects_bad_host() {
        let mut conn = PlanConnector;
        let err = conn.connect("bad host/x").unwrap_err();
        assert_eq!(err.host, "bad host/x");
    }
}
