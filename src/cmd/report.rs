/*!
`report.rs`

Reporting sink used by the dispatcher and modules.

Two implementations:
  - ConsoleReporter : colored / emoji lines, result sets as tables (format.rs)
  - JsonReporter    : one JSON object per line on stdout

`debug` lines are only emitted when the log level is Debug or higher; console
status lines are dropped under `-q`.
*/

use crate::cmd::format::{Role, StyleOptions, TableOpts, color, emoji, table};
use crate::sql::ResultSet;
use crate::utils::logging::{LogLevel, current_log_level};

/// Side-effecting report sink.
pub trait Reporter {
    fn status(&mut self, text: &str);
    fn warning(&mut self, text: &str);
    fn error(&mut self, text: &str);
    fn debug(&mut self, text: &str);
    /// Indented detail under the previous line.
    fn nested(&mut self, text: &str);
    /// Rows returned by query `name` on `target`.
    fn result(&mut self, target: &str, name: &str, rows: &ResultSet);
}

fn debug_enabled() -> bool {
    current_log_level() >= LogLevel::Debug
}

/* ---- Console ---- */

pub struct ConsoleReporter {
    style: StyleOptions,
}

impl ConsoleReporter {
    pub fn new(style: StyleOptions) -> Self {
        Self { style }
    }
}

impl Reporter for ConsoleReporter {
    fn status(&mut self, text: &str) {
        if current_log_level() == LogLevel::Error {
            return;
        }
        println!(
            "{} {}",
            emoji("spark", &self.style),
            color(Role::Primary, text, &self.style)
        );
    }

    fn warning(&mut self, text: &str) {
        eprintln!(
            "{} {}",
            emoji("warn", &self.style),
            color(Role::Warning, text, &self.style)
        );
    }

    fn error(&mut self, text: &str) {
        eprintln!(
            "{} {}",
            emoji("error", &self.style),
            color(Role::Error, text, &self.style)
        );
    }

    fn debug(&mut self, text: &str) {
        if debug_enabled() {
            println!("{}", color(Role::Dim, format!("[debug] {text}"), &self.style));
        }
    }

    fn nested(&mut self, text: &str) {
        for line in text.lines() {
            println!("    {line}");
        }
    }

    fn result(&mut self, target: &str, name: &str, rows: &ResultSet) {
        println!(
            "  {} {}",
            color(Role::Accent, name, &self.style),
            color(Role::Dim, format!("@ {target}"), &self.style)
        );
        if rows.is_empty() {
            self.nested(&color(Role::Dim, "(no rows)", &self.style));
            return;
        }
        let headers: Vec<&str> = rows.columns.iter().map(String::as_str).collect();
        let rendered = table(
            &headers,
            &rows.rows,
            TableOpts {
                max_width: self.style.term_width.saturating_sub(4),
                ..TableOpts::default()
            },
            &self.style,
        );
        self.nested(&rendered);
    }
}

/* ---- JSON ---- */

#[derive(Debug, Default)]
pub struct JsonReporter;

impl JsonReporter {
    fn line(&self, level: &str, text: &str) {
        println!(
            "{}",
            serde_json::json!({ "level": level, "message": text })
        );
    }
}

impl Reporter for JsonReporter {
    fn status(&mut self, text: &str) {
        self.line("status", text);
    }

    fn warning(&mut self, text: &str) {
        self.line("warning", text);
    }

    fn error(&mut self, text: &str) {
        self.line("error", text);
    }

    fn debug(&mut self, text: &str) {
        if debug_enabled() {
            self.line("debug", text);
        }
    }

    fn nested(&mut self, text: &str) {
        self.line("detail", text);
    }

    fn result(&mut self, target: &str, name: &str, rows: &ResultSet) {
        println!(
            "{}",
            serde_json::json!({
                "level": "result",
                "target": target,
                "query": name,
                "columns": rows.columns,
                "rows": rows.rows,
            })
        );
    }
}
