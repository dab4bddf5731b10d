//! Netconf dictionary: `key=value` lines with backslash escapes.
//!
//! Used for network configuration pushed by controllers and for requests
//! forwarded to an attached netconf service. Keys are kept sorted so
//! serialization is deterministic.

use crate::error::{ProtocolError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<String, String>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse a hex-encoded integer value, as used for IDs and flags.
    pub fn get_hex_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|v| {
                u64::from_str_radix(v.trim(), 16)
                    .map_err(|_| ProtocolError::InvalidDictionary(format!("{key} is not hex")))
            })
            .transpose()
    }

    /// Boolean values are `1`/`0` (anything non-zero hex is true).
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.get_hex_u64(key)?.map(|v| v != 0))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::InvalidDictionary("not UTF-8".to_string()))?;
        text.parse()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

fn escape(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            '=' => out.push_str("\\="),
            other => out.push(other),
        }
    }
}

fn unescape_char(c: char) -> char {
    match c {
        '0' => '\0',
        'r' => '\r',
        'n' => '\n',
        other => other,
    }
}

impl FromStr for Dictionary {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let mut dict = Dictionary::new();
        for line in s.split(['\n', '\r']) {
            if line.is_empty() {
                continue;
            }
            let mut key = String::new();
            let mut value = String::new();
            let mut in_value = false;
            let mut escaped = false;
            for c in line.chars() {
                let target = if in_value { &mut value } else { &mut key };
                if escaped {
                    target.push(unescape_char(c));
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '=' && !in_value {
                    in_value = true;
                } else {
                    target.push(c);
                }
            }
            if key.is_empty() {
                return Err(ProtocolError::InvalidDictionary("empty key".to_string()));
            }
            dict.entries.insert(key, value);
        }
        Ok(dict)
    }
}

impl fmt::Display for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (k, v) in &self.entries {
            escape(k, &mut out);
            out.push('=');
            escape(v, &mut out);
            out.push('\n');
        }
        f.write_str(&out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_escaped_values_survive() {
        let mut d = Dictionary::new();
        d.set("meta", "line one\nline=two\\three\r\0");
        d.set("nwid", "8056c2e21c000001");
        let text = d.to_string();
        assert_eq!(text.lines().count(), 2);
        let back: Dictionary = text.parse().unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_hex_and_bool_values() {
        let d: Dictionary = "et=800,806\npb=1\nnwid=ff\n".parse().unwrap();
        assert_eq!(d.get("et"), Some("800,806"));
        assert_eq!(d.get_bool("pb").unwrap(), Some(true));
        assert_eq!(d.get_hex_u64("nwid").unwrap(), Some(0xff));
        assert_eq!(d.get_hex_u64("missing").unwrap(), None);
        assert!(d.get_hex_u64("et").is_err());
    }

    #[test]
    fn test_value_may_be_empty_or_contain_equals() {
        let d: Dictionary = "a=\nb=x=y\n".parse().unwrap();
        assert_eq!(d.get("a"), Some(""));
        assert_eq!(d.get("b"), Some("x=y"));
        assert!("=value\n".parse::<Dictionary>().is_err());
    }
}
