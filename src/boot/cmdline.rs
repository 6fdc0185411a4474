//! Kernel command line as found in `cmdline.txt`.
//!
//! Parameters are kept in an ordered map so that rewriting is deterministic:
//! existing parameters keep their position, new ones are appended. Repeated
//! keys such as `console=` keep all of their values.

use std::fmt::Display;

use indexmap::IndexMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelCmdline {
    params: IndexMap<String, Vec<Option<String>>>,
}

impl KernelCmdline {
    pub fn parse(input: &str) -> Self {
        let mut params: IndexMap<String, Vec<Option<String>>> = IndexMap::new();
        for token in split_unquoted(input) {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key.to_owned(), Some(value.to_owned())),
                None => (token.to_owned(), None),
            };
            params.entry(key).or_default().push(value);
        }
        Self { params }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Replace all values of `key` with `value`, keeping its position.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.params
            .insert(key.to_owned(), vec![Some(value.into())]);
    }

    pub fn remove(&mut self, key: &str) {
        self.params.shift_remove(key);
    }
}

impl Display for KernelCmdline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (key, values) in &self.params {
            for value in values {
                if !first {
                    f.write_str(" ")?;
                }
                first = false;
                match value {
                    Some(value) => write!(f, "{key}={value}")?,
                    None => f.write_str(key)?,
                }
            }
        }
        Ok(())
    }
}

/// Split on whitespace outside of double quotes.
fn split_unquoted(input: &str) -> impl Iterator<Item = &str> {
    let mut in_quotes = false;
    input
        .split(move |c: char| {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            !in_quotes && c.is_ascii_whitespace()
        })
        .filter(|token| !token.is_empty())
}
