//! Query shaping for impersonated, linked and chained execution.
//!
//! Every function here is a pure string transform. Batch forms take a
//! `QueryBook` by value and hand back a new one with the same names, in the
//! same order.
//!
//! Key items:
//!   impersonation_wrap / linked_wrap / chain_wrap / chain_rpc_wrap
//!   impersonation_book / linked_book / chain_book
//!   Route (which transform applies to a given execution)

use std::fmt;

/// Placeholder that heads a chain sequence; stands for the server we are
/// already connected to and is never queried itself.
pub const CHAIN_SENTINEL: &str = "0";

/// Query names carrying this prefix are statements without a result set and
/// are relayed with `EXEC (...) AT` instead of `OPENQUERY`.
pub const RPC_PREFIX: &str = "rpc_";

/// Ordered `(name, query)` list. Names are unique within a book.
pub type QueryBook = Vec<(String, String)>;

/// Whether a query should travel through the rpc (`EXEC ... AT`) form.
pub fn is_rpc(name: &str) -> bool {
    name.starts_with(RPC_PREFIX)
}

/// Prefix a query with a login switch. `user` is inserted verbatim.
pub fn impersonation_wrap(user: &str, query: &str) -> String {
    format!("EXECUTE AS LOGIN = '{user}'; {query}")
}

/// Relay a query through a single linked server.
pub fn linked_wrap(server: &str, query: &str, rpc: bool) -> String {
    let escaped = query.replace('\'', "''");
    if rpc {
        format!("EXECUTE ('{escaped}') AT {server};")
    } else {
        format!("SELECT * FROM OPENQUERY(\"{server}\", '{escaped}')")
    }
}

/// Nest a query through every hop of `chain` using `OPENQUERY`.
///
/// `chain` starts with the sentinel. A literal sitting `depth` levels deep
/// needs each quote written `2^depth` times, so both the delimiters added at
/// a level and the quotes of the innermost query follow that run length.
pub fn chain_wrap(chain: &[String], query: &str, depth: u32) -> String {
    let quotes = "'".repeat(1usize << depth);
    if chain.len() <= 1 {
        return query.replace('\'', &quotes);
    }
    format!(
        "SELECT * FROM OPENQUERY(\"{next}\", {quotes}{inner}{quotes})",
        next = chain[1],
        inner = chain_wrap(&chain[1..], query, depth + 1),
    )
}

/// Nest a statement through every hop of `chain` using `EXEC (...) AT`.
///
/// Folds from the last real hop back to the first. `EXEC` does not stack
/// literal contexts the way `OPENQUERY` does, so each step doubles quotes once.
pub fn chain_rpc_wrap(chain: &[String], query: &str) -> String {
    chain
        .iter()
        .skip(1)
        .rev()
        .fold(query.to_string(), |acc, hop| {
            format!("EXEC ('{}') AT {hop}", acc.replace('\'', "''"))
        })
}

pub fn impersonation_book(user: &str, book: QueryBook) -> QueryBook {
    book.into_iter()
        .map(|(name, query)| {
            let wrapped = impersonation_wrap(user, &query);
            (name, wrapped)
        })
        .collect()
}

pub fn linked_book(server: &str, book: QueryBook) -> QueryBook {
    book.into_iter()
        .map(|(name, query)| {
            let wrapped = linked_wrap(server, &query, is_rpc(&name));
            (name, wrapped)
        })
        .collect()
}

pub fn chain_book(chain: &[String], book: QueryBook) -> QueryBook {
    book.into_iter()
        .map(|(name, query)| {
            let wrapped = if is_rpc(&name) {
                chain_rpc_wrap(chain, &query)
            } else {
                chain_wrap(chain, &query, 0)
            };
            (name, wrapped)
        })
        .collect()
}

/// Build the sentinel-prefixed chain sequence from user-supplied links.
pub fn chain_sequence(links: &[String]) -> Vec<String> {
    std::iter::once(CHAIN_SENTINEL.to_string())
        .chain(links.iter().cloned())
        .collect()
}

/// Delivery path for one module execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Run on the connected server as the connecting login.
    Direct,
    /// Run on the connected server as another login.
    Impersonate(String),
    /// Run on one linked server of the connected server.
    Linked(String),
    /// Run on the last hop of a sentinel-prefixed chain.
    Chain(Vec<String>),
}

impl Route {
    /// Apply the batch transform matching this route.
    pub fn shape(&self, book: QueryBook) -> QueryBook {
        match self {
            Route::Direct => book,
            Route::Impersonate(user) => impersonation_book(user, book),
            Route::Linked(server) => linked_book(server, book),
            Route::Chain(chain) => chain_book(chain, book),
        }
    }

    /// Server the queries finally execute on, if it differs from the
    /// connected one.
    pub fn final_hop(&self) -> Option<&str> {
        match self {
            Route::Linked(server) => Some(server),
            Route::Chain(chain) if chain.len() > 1 => chain.last().map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str("direct"),
            Route::Impersonate(user) => write!(f, "as {user}"),
            Route::Linked(server) => write!(f, "via link {server}"),
            Route::Chain(chain) => {
                let hops: Vec<&str> = chain.iter().skip(1).map(String::as_str).collect();
                write!(f, "via chain {}", hops.join(" -> "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(hops: &[&str]) -> Vec<String> {
        hops.iter().map(|h| h.to_string()).collect()
    }

    fn q(n: usize) -> String {
        "'".repeat(n)
    }

    #[test]
    fn impersonation_prefix() {
        assert_eq!(
            impersonation_wrap("sa", "SELECT SYSTEM_USER;"),
            "EXECUTE AS LOGIN = 'sa'; SELECT SYSTEM_USER;"
        );
    }

    #[test]
    fn impersonation_user_not_escaped() {
        let out = impersonation_wrap("o'brien", "SELECT 1");
        assert!(out.starts_with("EXECUTE AS LOGIN = 'o'brien';"));
    }

    #[test]
    fn linked_openquery_form() {
        assert_eq!(
            linked_wrap("SRV", "SELECT 'x'", false),
            r#"SELECT * FROM OPENQUERY("SRV", 'SELECT ''x''')"#
        );
    }

    #[test]
    fn linked_rpc_form() {
        assert_eq!(
            linked_wrap("SRV", "SELECT 'x'", true),
            "EXECUTE ('SELECT ''x''') AT SRV;"
        );
    }

    #[test]
    fn chain_single_hop_matches_two_level_nesting() {
        let out = chain_wrap(&chain(&["0", "a"]), "SELECT 'x'", 0);
        assert_eq!(out, r#"SELECT * FROM OPENQUERY("a", 'SELECT ''x''')"#);
    }

    #[test]
    fn chain_four_hops_quote_runs_double_per_level() {
        let hops = chain(&["0", "a", "b", "c", "d"]);
        let out = chain_wrap(&hops, "SELECT * FROM SomeTable WHERE 'a'='a'", 0);
        let expected = format!(
            "SELECT * FROM OPENQUERY(\"a\", {q1}SELECT * FROM OPENQUERY(\"b\", {q2}SELECT * FROM OPENQUERY(\"c\", {q4}SELECT * FROM OPENQUERY(\"d\", {q8}SELECT * FROM SomeTable WHERE {q16}a{q16}={q16}a{q16}{q8}){q4}){q2}){q1})",
            q1 = q(1),
            q2 = q(2),
            q4 = q(4),
            q8 = q(8),
            q16 = q(16),
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn chain_without_hops_returns_query() {
        assert_eq!(chain_wrap(&chain(&["0"]), "SELECT 'x'", 0), "SELECT 'x'");
        assert_eq!(chain_wrap(&chain(&["0"]), "SELECT 'x'", 2), "SELECT ''''x''''");
    }

    #[test]
    fn chain_rpc_doubles_once_per_hop() {
        let out = chain_rpc_wrap(&chain(&["0", "a", "b"]), "SELECT 'x'");
        assert_eq!(out, "EXEC ('EXEC (''SELECT ''''x'''''') AT b') AT a");
    }

    #[test]
    fn chain_rpc_sentinel_only_is_identity() {
        assert_eq!(chain_rpc_wrap(&chain(&["0"]), "SELECT 1"), "SELECT 1");
    }

    #[test]
    fn books_keep_names_and_pick_rpc_by_prefix() {
        let book: QueryBook = vec![
            ("rpc_enable".into(), "EXEC sp_who".into()),
            ("version".into(), "SELECT @@VERSION".into()),
        ];
        let out = linked_book("SRV", book);
        assert_eq!(out[0].0, "rpc_enable");
        assert_eq!(out[0].1, "EXECUTE ('EXEC sp_who') AT SRV;");
        assert_eq!(out[1].0, "version");
        assert!(out[1].1.starts_with("SELECT * FROM OPENQUERY(\"SRV\""));
    }

    #[test]
    fn chain_book_uses_rpc_fold_for_rpc_names() {
        let hops = chain(&["0", "a", "b"]);
        let book: QueryBook = vec![("rpc_x".into(), "EXEC sp_who".into())];
        let out = chain_book(&hops, book);
        assert_eq!(out[0].1, "EXEC ('EXEC (''EXEC sp_who'') AT b') AT a");
    }

    #[test]
    fn route_shape_direct_is_identity() {
        let book: QueryBook = vec![("a".into(), "SELECT 'a'".into())];
        assert_eq!(Route::Direct.shape(book.clone()), book);
    }

    #[test]
    fn chain_sequence_prefixes_sentinel() {
        let seq = chain_sequence(&chain(&["a", "b"]));
        assert_eq!(seq, chain(&["0", "a", "b"]));
        assert_eq!(Route::Chain(seq).final_hop(), Some("b"));
    }
}
