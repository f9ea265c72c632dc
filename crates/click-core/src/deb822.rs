use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{IoResultExt, Result};

/// The first paragraph of a Deb822 control-style file. Field names are
/// case-insensitive and stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deb822Fields {
    fields: BTreeMap<String, String>,
}

impl Deb822Fields {
    pub fn parse(input: &str) -> Self {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        let mut last_key: Option<String> = None;
        for line in input.lines() {
            if line.trim().is_empty() {
                if fields.is_empty() {
                    continue;
                }
                break;
            }
            if line.starts_with('#') {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(value) = last_key.as_ref().and_then(|key| fields.get_mut(key)) {
                    value.push('\n');
                    value.push_str(line.trim());
                }
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                continue;
            }
            let key = key.to_ascii_lowercase();
            fields.insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        }
        Self { fields }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).at_path(path)?;
        Ok(Self::parse(&raw))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `yes` (case-insensitive) is true; anything else, including absence,
    /// is false.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|value| value.eq_ignore_ascii_case("yes"))
    }
}
