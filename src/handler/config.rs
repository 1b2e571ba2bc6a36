//! Textual handler configuration.
//!
//! A configuration is a `;`-separated list of `key=value` entries. A value is either a bare
//! token or a brace-delimited nested configuration:
//!
//! ```text
//! handler=summary;mode=auto;reduction=mincut;bot={handler=call_string;maxrec=2;bot=basic}
//! ```
//!
//! A bare handler name where a nested configuration is expected (`bot=basic`) is shorthand
//! for `bot={handler=basic}`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct HandlerConfig {
    source: String,
    entries: BTreeMap<String, String>,
}

impl HandlerConfig {
    pub fn parse(source: &str) -> Result<Self> {
        let error = |message: String| Error::HandlerInit {
            config: source.to_string(),
            message,
        };

        let mut entries = BTreeMap::new();
        for entry in split_entries(source).map_err(error)? {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| error(format!("entry {:?} is not of the form key=value", entry)))?;
            let key = key.trim();
            let value = value.trim();
            if !is_identifier(key) {
                return Err(error(format!("invalid key {:?}", key)));
            }
            let value = match value.strip_prefix('{') {
                Some(rest) => rest
                    .strip_suffix('}')
                    .ok_or_else(|| error(format!("value of {} has trailing characters after '}}'", key)))?,
                None => value,
            };
            if entries.insert(key.to_string(), value.to_string()).is_some() {
                return Err(error(format!("duplicate key {:?}", key)));
            }
        }
        Ok(Self {
            source: source.to_string(),
            entries,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// The handler name (`handler` key).
    pub fn handler(&self) -> Result<&str> {
        self.require("handler")
    }

    pub fn error(&self, message: impl Into<String>) -> Error {
        Error::HandlerInit {
            config: self.source.clone(),
            message: message.into(),
        }
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| self.error(format!("missing key {:?}", key)))
    }

    /// Rejects keys outside of `valid` (`handler` is always valid).
    pub fn check_keys(&self, valid: &[&str]) -> Result<()> {
        for key in self.keys() {
            if key != "handler" && !valid.contains(&key) {
                let mut valid: Vec<&str> = valid.to_vec();
                valid.insert(0, "handler");
                return Err(self.error(format!("unknown key {:?}, valid keys are: {}", key, valid.join(", "))));
            }
        }
        Ok(())
    }

    /// Parses the value of `key`, or returns `default` if it is absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|e| self.error(format!("invalid value {:?} for {}: {}", value, key, e))),
        }
    }

    /// The value of `key` as a nested configuration, or `default` if it is absent.
    pub fn nested_or(&self, key: &str, default: &str) -> Result<HandlerConfig> {
        let value = self.get(key).unwrap_or(default);
        if value.contains('=') {
            HandlerConfig::parse(value)
        } else {
            HandlerConfig::parse(&format!("handler={}", value))
        }
    }
}

impl PartialEq for HandlerConfig {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for HandlerConfig {}

impl fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerConfig({:?})", self.source)
    }
}

impl fmt::Display for HandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            if value.contains('=') {
                write!(f, "{}={{{}}}", key, value)?;
            } else {
                write!(f, "{}={}", key, value)?;
            }
        }
        Ok(())
    }
}

impl FromStr for HandlerConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        HandlerConfig::parse(s)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits on `;` outside of braces.
fn split_entries(source: &str) -> std::result::Result<Vec<&str>, String> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in source.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced '}}' at column {}", i + 1))?;
            }
            ';' if depth == 0 => {
                entries.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth > 0 {
        return Err("missing closing '}'".to_string());
    }
    entries.push(&source[start..]);
    Ok(entries)
}
