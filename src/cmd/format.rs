/*!
format.rs

Human output primitives for `sqlhop`: colors, status glyphs, a boxed header
for the module catalogue and run summary, and a column-aligned table for
result sets.

Style is decided once per process:
  - NO_COLOR  (env) or --plain : no ANSI sequences
  - NO_EMOJI  (env) or --plain : no status glyphs
  - COLUMNS   (env)            : width budget, clamped to 40..=220, default 100

Functions return strings; printing is left to the reporter. JSON output
never goes through this module.
*/

use std::borrow::Cow;

/* ---- Style Options ---- */

#[derive(Debug, Clone)]
pub struct StyleOptions {
    pub use_color: bool,
    pub use_emoji: bool,
    pub term_width: usize,
}

impl Default for StyleOptions {
    fn default() -> Self {
        Self::detect()
    }
}

impl StyleOptions {
    pub fn detect() -> Self {
        let width = std::env::var("COLUMNS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .map(|w| w.clamp(40, 220))
            .unwrap_or(100);

        StyleOptions {
            use_color: std::env::var_os("NO_COLOR").is_none(),
            use_emoji: std::env::var_os("NO_EMOJI").is_none(),
            term_width: width,
        }
    }

    /// Same width budget, no color and no glyphs.
    pub fn plain() -> Self {
        StyleOptions {
            use_color: false,
            use_emoji: false,
            ..Self::detect()
        }
    }
}

/* ---- Color / Emoji ---- */

#[derive(Debug, Clone, Copy)]
pub enum Role {
    Primary,
    Secondary,
    Accent,
    Success,
    Warning,
    Error,
    Dim,
}

pub fn color(role: Role, text: impl AsRef<str>, style: &StyleOptions) -> String {
    if !style.use_color {
        return text.as_ref().to_string();
    }
    let code = match role {
        Role::Primary => "38;5;45",
        Role::Secondary => "38;5;250",
        Role::Accent => "38;5;213",
        Role::Success => "38;5;82",
        Role::Warning => "38;5;214",
        Role::Error => "38;5;196",
        Role::Dim => "2",
    };
    format!("\x1b[{code}m{}\x1b[0m", text.as_ref())
}

pub fn emoji(tag: &str, style: &StyleOptions) -> &'static str {
    if !style.use_emoji {
        return "";
    }
    match tag {
        "success" => "✔",
        "error" => "✖",
        "warn" => "⚠",
        "spark" => "✨",
        "list" => "📜",
        "clock" => "⏱",
        _ => "",
    }
}

/* ---- Box Header ---- */

/// One-line title (plus optional subtitle) framed in a light box.
/// Content wider than the terminal is cut with an ellipsis.
pub fn box_header(title: &str, subtitle: Option<&str>, style: &StyleOptions) -> String {
    let plain = match subtitle {
        Some(sub) => format!("{title}  {sub}"),
        None => title.to_string(),
    };
    let max_inner = style.term_width.clamp(20, 200) - 4;
    let shown = truncate_ellipsis(&plain, max_inner);
    let inner = display_width(&shown);

    let styled = match (subtitle, shown == plain) {
        (Some(sub), true) => format!(
            "{}  {}",
            color(Role::Primary, title, style),
            color(Role::Secondary, sub, style)
        ),
        _ => color(Role::Primary, &shown, style),
    };

    let rule = "─".repeat(inner + 2);
    format!("┌{rule}┐\n│ {styled} │\n└{rule}┘")
}

/* ---- Table Rendering ---- */

#[derive(Debug, Clone)]
pub struct TableOpts {
    /// 0 means the terminal width.
    pub max_width: usize,
    pub min_col_width: usize,
    /// Cells equal to this are rendered dim.
    pub null_marker: Option<&'static str>,
}

impl Default for TableOpts {
    fn default() -> Self {
        Self {
            max_width: 0,
            min_col_width: 4,
            null_marker: Some("NULL"),
        }
    }
}

pub fn table(
    headers: &[&str],
    rows: &[Vec<String>],
    opts: TableOpts,
    style: &StyleOptions,
) -> String {
    if headers.is_empty() {
        return String::new();
    }
    let col_count = headers.len();
    let width_limit = if opts.max_width == 0 {
        style.term_width
    } else {
        opts.max_width.min(style.term_width)
    };

    let mut widths: Vec<usize> = headers.iter().map(|h| display_width(h)).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(col_count) {
            widths[i] = widths[i].max(display_width(cell));
        }
    }

    // Shrink the widest columns first until the row fits.
    let total: usize = widths.iter().sum::<usize>() + (col_count - 1) * 2;
    if total > width_limit {
        let mut overflow = total - width_limit;
        let mut ordered: Vec<usize> = (0..col_count).collect();
        ordered.sort_by(|a, b| widths[*b].cmp(&widths[*a]));
        for idx in ordered {
            if overflow == 0 {
                break;
            }
            if widths[idx] > opts.min_col_width {
                let shrink = (widths[idx] - opts.min_col_width).min(overflow);
                widths[idx] -= shrink;
                overflow -= shrink;
            }
        }
    }

    let mut lines = Vec::with_capacity(rows.len() + 2);

    let header: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| color(Role::Accent, fit(h, widths[i]), style))
        .collect();
    lines.push(header.join("  "));

    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    lines.push(color(Role::Dim, sep.join("  "), style));

    for row in rows {
        let cells: Vec<String> = (0..col_count)
            .map(|c| {
                let raw = row.get(c).map(String::as_str).unwrap_or("");
                let cell = fit(raw, widths[c]);
                if opts.null_marker == Some(raw) {
                    color(Role::Dim, cell, style)
                } else {
                    cell
                }
            })
            .collect();
        lines.push(cells.join("  ").trim_end().to_string());
    }

    lines.join("\n")
}

/// Pad to `width`, or cut with an ellipsis when longer.
fn fit(s: &str, width: usize) -> String {
    let shown = truncate_ellipsis(s, width);
    let pad = width.saturating_sub(display_width(&shown));
    format!("{shown}{}", " ".repeat(pad))
}

/* ---- Text Helpers ---- */

/// Cut to `max_chars` visible characters. Line breaks become spaces so a
/// multi-line cell stays on one table row.
pub fn truncate_ellipsis(s: &str, max_chars: usize) -> String {
    let flat: Cow<'_, str> = if s.contains(['\n', '\r']) {
        Cow::Owned(s.replace("\r\n", " ").replace(['\n', '\r'], " "))
    } else {
        Cow::Borrowed(s)
    };
    if max_chars == 0 {
        return String::new();
    }
    if flat.chars().count() <= max_chars {
        return flat.into_owned();
    }
    let mut out: String = flat.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

fn strip_ansi(s: &str) -> Cow<'_, str> {
    if !s.contains('\x1b') {
        return Cow::Borrowed(s);
    }
    let mut buf = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        buf.push(ch);
    }
    Cow::Owned(buf)
}

pub fn display_width(s: &str) -> usize {
    strip_ansi(s).chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(width: usize) -> StyleOptions {
        StyleOptions {
            use_color: false,
            use_emoji: false,
            term_width: width,
        }
    }

    #[test]
    fn box_header_frames_title_and_subtitle() {
        let b = box_header("Summary", Some("2 executed"), &plain(80));
        let lines: Vec<&str> = b.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "│ Summary  2 executed │");
        assert_eq!(display_width(lines[0]), display_width(lines[1]));
    }

    #[test]
    fn box_header_truncates_to_terminal() {
        let long = "x".repeat(100);
        let b = box_header(&long, None, &plain(40));
        assert!(b.lines().all(|l| display_width(l) <= 40));
        assert!(b.contains('…'));
    }

    #[test]
    fn table_aligns_columns() {
        let t = table(
            &["name", "id"],
            &[
                vec!["master".into(), "1".into()],
                vec!["tempdb".into(), "2".into()],
            ],
            TableOpts::default(),
            &plain(80),
        );
        let lines: Vec<&str> = t.lines().collect();
        assert_eq!(lines[0], "name    id");
        assert_eq!(lines[1], "------  --");
        assert_eq!(lines[2], "master  1");
    }

    #[test]
    fn table_shrinks_wide_column() {
        let wide = "y".repeat(200);
        let t = table(
            &["a", "b"],
            &[vec!["x".into(), wide]],
            TableOpts::default(),
            &plain(40),
        );
        assert!(t.lines().all(|l| display_width(l) <= 40));
    }

    #[test]
    fn truncate_flattens_newlines() {
        assert_eq!(truncate_ellipsis("abcdef", 4), "abc…");
        assert_eq!(truncate_ellipsis("a\nb", 10), "a b");
    }

    #[test]
    fn strip_ansi_removes_sequences() {
        assert_eq!(strip_ansi("\x1b[31mRED\x1b[0m"), "RED");
        assert_eq!(display_width("\x1b[2mab\x1b[0m"), 2);
    }
}
