//! Parser for probe definition files.
//!
//! Probe configuration lives in one file per expected item (a process, a
//! log, a package, a certificate domain) in a plain `key=value` format:
//!
//! ```text
//! # a process definition
//! name=clusterd
//! mandatory=true
//! service=clusterd
//!
//! [search]
//! pattern=segfault
//! ```
//!
//! `#` starts a comment, `[section]` opens a named sub-record (a file may
//! hold several sections with the same name), and values may be wrapped in
//! double quotes to keep leading or trailing whitespace.

use crate::error::{Error, Result};
use std::path::Path;

/// One parsed definition file.
#[derive(Debug, Clone, Default)]
pub struct KvFile {
    values: Vec<(String, String)>,
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl KvFile {
    /// Load and parse a definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse definition text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut file = KvFile::default();
        let mut current_section: Option<usize> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| Error::Config(format!(
                    "unterminated section header on line {}: {line:?}",
                    lineno + 1
                )))?;
                file.sections.push((name.trim().to_string(), Vec::new()));
                current_section = Some(file.sections.len() - 1);
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Config(format!(
                    "expected key=value on line {}: {line:?}",
                    lineno + 1
                )));
            };
            let key = key.trim().to_string();
            if key.is_empty() {
                return Err(Error::Config(format!(
                    "empty key on line {}",
                    lineno + 1
                )));
            }
            let value = unquote(value.trim()).to_string();

            match current_section {
                Some(idx) => file.sections[idx].1.push((key, value)),
                None => file.values.push((key, value)),
            }
        }

        Ok(file)
    }

    /// Top-level value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// True when a top-level `key` is present.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Boolean value for `key`; absent keys return `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(is_true).unwrap_or(false)
    }

    /// Integer value for `key`; `Ok(None)` when absent, an error when
    /// present but unparsable.
    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::InvalidValue {
                    field: key.to_string(),
                    message: format!("{raw:?} is not a valid integer"),
                }),
        }
    }

    /// All top-level entries in file order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sections named `name`, in file order.
    pub fn sections<'a>(&'a self, name: &'a str) -> impl Iterator<Item = Section<'a>> + 'a {
        self.sections
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, entries)| Section { entries })
    }
}

/// One `[section]` block inside a definition file.
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    entries: &'a [(String, String)],
}

impl<'a> Section<'a> {
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Boolean convention shared by all definition files.
pub fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "t" | "1" | "on" | "yes"
    )
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
