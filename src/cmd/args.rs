/*!
`args.rs`

Slash-style argument parsing for `sqlhop`.

Grammar:
  /key[:value]      key is case-insensitive, value runs to the end of the token
  /flag             value is the empty string (presence is what counts)

Short keys are folded onto their long form through `ALIASES`; the fold runs on
the raw parse and once more on the final layered set so callers only ever see
long-form keys.

Layers (lowest precedence first):
  1. SQLHOP_ARGS environment variable (shell-style split)
  2. --config file (YAML or JSON object)
  3. command-line tokens

Each layer rejects its own duplicates. Higher layers override lower ones
without raising `Duplicate`.
*/

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

/// Environment variable holding default tokens.
pub const ENV_ARGS: &str = "SQLHOP_ARGS";

/// Short key -> canonical key.
pub const ALIASES: &[(&str, &str)] = &[
    ("a", "auth"),
    ("c", "command"),
    ("d", "domain"),
    ("e", "enum"),
    ("h", "host"),
    ("i", "iuser"),
    ("l", "link"),
    ("m", "module"),
    ("o", "option"),
    ("p", "password"),
    ("s", "sccm"),
    ("t", "timeout"),
    ("u", "username"),
    ("v", "verbose"),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("malformed argument '{0}' (expected /key[:value])")]
    Malformed(String),
    #[error("argument '/{0}' was supplied more than once")]
    Duplicate(String),
}

/// Resolve a short key to its long form; long keys pass through.
pub fn canonical_key(key: &str) -> &str {
    ALIASES
        .iter()
        .find(|(short, _)| *short == key)
        .map(|(_, long)| *long)
        .unwrap_or(key)
}

/// Canonical key -> raw value map built once per invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArguments {
    values: HashMap<String, String>,
}

impl ParsedArguments {
    /// Parse `/key[:value]` tokens. Any malformed token fails the whole batch.
    pub fn parse<I, S>(tokens: I) -> Result<Self, ArgumentError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = HashMap::new();
        for token in tokens {
            let token = token.as_ref();
            let Some(body) = token.strip_prefix('/') else {
                return Err(ArgumentError::Malformed(token.to_string()));
            };
            let (key, value) = body.split_once(':').unwrap_or((body, ""));
            let key = key.to_ascii_lowercase();
            if key.is_empty() {
                return Err(ArgumentError::Malformed(token.to_string()));
            }
            if values.contains_key(&key) {
                return Err(ArgumentError::Duplicate(key));
            }
            values.insert(key, value.to_string());
        }
        Self { values }.canonicalize()
    }

    /// Build from already-split key/value pairs (config files). Keys may carry
    /// a leading `/`.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ArgumentError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let tokens: Vec<String> = pairs
            .into_iter()
            .map(|(k, v)| {
                let key = k.trim().trim_start_matches('/').to_string();
                if v.is_empty() {
                    format!("/{key}")
                } else {
                    format!("/{key}:{v}")
                }
            })
            .collect();
        Self::parse(tokens)
    }

    /// Fold short keys onto long keys. Idempotent.
    pub fn canonicalize(self) -> Result<Self, ArgumentError> {
        let mut values = HashMap::with_capacity(self.values.len());
        let mut aliased = Vec::new();
        for (key, value) in self.values {
            if canonical_key(&key) == key {
                values.insert(key, value);
            } else {
                aliased.push((key, value));
            }
        }
        for (short, value) in aliased {
            let long = canonical_key(&short).to_string();
            if values.contains_key(&long) {
                return Err(ArgumentError::Duplicate(long));
            }
            values.insert(long, value);
        }
        Ok(Self { values })
    }

    /// Overlay `self` on top of `defaults`; keys in `self` win.
    pub fn over(self, defaults: ParsedArguments) -> Result<Self, ArgumentError> {
        let mut values = defaults.values;
        values.extend(self.values);
        Self { values }.canonicalize()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Sorted snapshot (stable for display / debug output).
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }
}

/* ---- Default Layers ---- */

/// Parse the `SQLHOP_ARGS` environment variable, if set.
pub fn env_defaults() -> Result<ParsedArguments> {
    match std::env::var(ENV_ARGS) {
        Ok(raw) if !raw.trim().is_empty() => tokens_from_line(&raw)
            .with_context(|| format!("invalid {ENV_ARGS} value")),
        _ => Ok(ParsedArguments::default()),
    }
}

/// Shell-split a line and parse the resulting tokens.
pub fn tokens_from_line(line: &str) -> Result<ParsedArguments> {
    let tokens = shell_words::split(line).context("failed to split argument line")?;
    Ok(ParsedArguments::parse(tokens)?)
}

/// Load defaults from a YAML (`.yaml` / `.yml`) or JSON config file whose root
/// is an object of scalar values. `true` becomes a bare flag, `false` and
/// `null` entries are skipped.
pub fn load_config_file(path: &Path) -> Result<ParsedArguments> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let lower = path.to_string_lossy().to_ascii_lowercase();

    let value: serde_json::Value = if lower.ends_with(".yaml") || lower.ends_with(".yml") {
        let yaml_v: serde_yaml::Value =
            serde_yaml::from_str(&raw).context("failed to parse YAML config file")?;
        serde_json::to_value(yaml_v).context("failed to convert YAML to JSON")?
    } else {
        serde_json::from_str(&raw).context("failed to parse JSON config file")?
    };

    let obj = value
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("config file root must be an object"))?;

    let mut pairs = Vec::with_capacity(obj.len());
    for (k, v) in obj {
        let s = match v {
            serde_json::Value::Null | serde_json::Value::Bool(false) => continue,
            serde_json::Value::Bool(true) => String::new(),
            serde_json::Value::String(sv) => sv.clone(),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|i| match i {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
            other => other.to_string(),
        };
        pairs.push((k.clone(), s));
    }
    ParsedArguments::from_pairs(pairs)
        .with_context(|| format!("invalid entry in config file: {}", path.display()))
}
