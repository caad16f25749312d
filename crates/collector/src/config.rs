//! The collector configuration file.
//!
//! A small tree-shaped format, hand-parsed: objects, lists, strings,
//! integers, booleans and null, in the familiar brace/bracket syntax.
//! String values used as paths may contain `{keyword}` templates that are
//! substituted from a sibling `parameters` object; nested or unbalanced
//! braces are malformed.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Object(BTreeMap<String, ConfigValue>),
    List(Vec<ConfigValue>),
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl ConfigValue {
    pub fn parse(text: &str) -> Result<ConfigValue> {
        let mut parser = Parser {
            bytes: text.as_bytes(),
            pos: 0,
        };
        let value = parser.value()?;
        parser.skip_whitespace();
        if parser.pos != parser.bytes.len() {
            bail!("trailing characters at offset {}", parser.pos);
        }
        Ok(value)
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn string_items(&self) -> Vec<String> {
        match self {
            ConfigValue::List(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_whitespace(&mut self) {
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Result<u8> {
        self.skip_whitespace();
        self.bytes
            .get(self.pos)
            .copied()
            .context("unexpected end of config")
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek()? != byte {
            bail!(
                "expected '{}' at offset {}",
                byte as char,
                self.pos
            );
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self) -> Result<ConfigValue> {
        match self.peek()? {
            b'{' => self.object(),
            b'[' => self.list(),
            b'"' => Ok(ConfigValue::Str(self.string()?)),
            b't' | b'f' | b'n' => self.keyword(),
            b'-' | b'0'..=b'9' => self.integer(),
            other => bail!("unexpected '{}' at offset {}", other as char, self.pos),
        }
    }

    fn object(&mut self) -> Result<ConfigValue> {
        self.expect(b'{')?;
        let mut map = BTreeMap::new();
        if self.peek()? == b'}' {
            self.pos += 1;
            return Ok(ConfigValue::Object(map));
        }
        loop {
            self.skip_whitespace();
            let key = self.string()?;
            self.expect(b':')?;
            let value = self.value()?;
            if map.insert(key.clone(), value).is_some() {
                bail!("duplicate key \"{key}\"");
            }
            match self.peek()? {
                b',' => self.pos += 1,
                b'}' => {
                    self.pos += 1;
                    return Ok(ConfigValue::Object(map));
                }
                other => bail!("expected ',' or '}}', got '{}'", other as char),
            }
        }
    }

    fn list(&mut self) -> Result<ConfigValue> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        if self.peek()? == b']' {
            self.pos += 1;
            return Ok(ConfigValue::List(items));
        }
        loop {
            items.push(self.value()?);
            match self.peek()? {
                b',' => self.pos += 1,
                b']' => {
                    self.pos += 1;
                    return Ok(ConfigValue::List(items));
                }
                other => bail!("expected ',' or ']', got '{}'", other as char),
            }
        }
    }

    fn string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            let byte = *self
                .bytes
                .get(self.pos)
                .context("unterminated string")?;
            self.pos += 1;
            match byte {
                b'"' => return Ok(out),
                b'\\' => {
                    let escape = *self
                        .bytes
                        .get(self.pos)
                        .context("unterminated escape")?;
                    self.pos += 1;
                    out.push(match escape {
                        b'"' => '"',
                        b'\\' => '\\',
                        b'/' => '/',
                        b'n' => '\n',
                        b't' => '\t',
                        other => bail!("unsupported escape '\\{}'", other as char),
                    });
                }
                other => out.push(other as char),
            }
        }
    }

    fn keyword(&mut self) -> Result<ConfigValue> {
        for (text, value) in [
            ("true", ConfigValue::Bool(true)),
            ("false", ConfigValue::Bool(false)),
            ("null", ConfigValue::Null),
        ] {
            if self.bytes[self.pos..].starts_with(text.as_bytes()) {
                self.pos += text.len();
                return Ok(value);
            }
        }
        bail!("unknown keyword at offset {}", self.pos);
    }

    fn integer(&mut self) -> Result<ConfigValue> {
        let start = self.pos;
        if self.bytes.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit())
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        let value: i64 = text
            .parse()
            .with_context(|| format!("bad integer \"{text}\""))?;
        Ok(ConfigValue::Int(value))
    }
}

/// Substitutes `{keyword}` occurrences in `template` from the string values
/// of `parameters`. Nested and unbalanced braces are rejected, as are
/// unknown keywords.
pub fn expand_template(template: &str, parameters: &ConfigValue) -> Result<String> {
    let mut out = String::new();
    let mut keyword: Option<String> = None;
    for c in template.chars() {
        match (c, keyword.as_mut()) {
            ('{', None) => keyword = Some(String::new()),
            ('{', Some(_)) => bail!("nested '{{' in template \"{template}\""),
            ('}', Some(name)) => {
                let value = parameters
                    .get(name)
                    .and_then(ConfigValue::as_str)
                    .with_context(|| format!("no parameter \"{name}\""))?;
                out.push_str(value);
                keyword = None;
            }
            ('}', None) => bail!("unbalanced '}}' in template \"{template}\""),
            (c, Some(name)) => name.push(c),
            (c, None) => out.push(c),
        }
    }
    if keyword.is_some() {
        bail!("unbalanced '{{' in template \"{template}\"");
    }
    Ok(out)
}

/// Top-level collector settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub providers: Vec<String>,
    /// Report destinations, after template expansion.
    pub destinations: Vec<String>,
    /// Registry keys whose values are harvested into the trace.
    pub registry_keys: Vec<String>,
    pub buffer_size: u32,
    pub batch_only: bool,
}

impl Default for CollectorConfig {
    fn default() -> CollectorConfig {
        CollectorConfig {
            providers: Vec::new(),
            destinations: Vec::new(),
            registry_keys: Vec::new(),
            buffer_size: crate::service::DEFAULT_BUFFER_SIZE,
            batch_only: false,
        }
    }
}

impl CollectorConfig {
    pub fn from_text(text: &str) -> Result<CollectorConfig> {
        let root = ConfigValue::parse(text)?;
        let mut config = CollectorConfig::default();
        if let Some(providers) = root.get("providers") {
            config.providers = providers.string_items();
        }
        if let Some(keys) = root.get("registry_keys") {
            config.registry_keys = keys.string_items();
        }
        if let Some(size) = root.get("buffer_size").and_then(ConfigValue::as_int) {
            config.buffer_size = u32::try_from(size).context("buffer_size out of range")?;
        }
        if let Some(batch) = root.get("batch_only").and_then(ConfigValue::as_bool) {
            config.batch_only = batch;
        }
        let empty = ConfigValue::Object(BTreeMap::new());
        let parameters = root.get("parameters").unwrap_or(&empty);
        if let Some(destinations) = root.get("destinations") {
            for template in destinations.string_items() {
                config.destinations.push(expand_template(&template, parameters)?);
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = r#"{
        "providers": ["chrome.dll", "target.dll"],
        "destinations": ["{root}\\traces\\{name}.bin"],
        "registry_keys": ["HKLM\\Software\\Tracing"],
        "buffer_size": 65536,
        "batch_only": true,
        "parameters": { "root": "C:\\data", "name": "run1" }
    }"#;

    #[test]
    fn full_config_parses() {
        let config = CollectorConfig::from_text(TEXT).unwrap();
        assert_eq!(config.providers, vec!["chrome.dll", "target.dll"]);
        assert_eq!(config.destinations, vec!["C:\\data\\traces\\run1.bin"]);
        assert_eq!(config.registry_keys.len(), 1);
        assert_eq!(config.buffer_size, 65536);
        assert!(config.batch_only);
    }

    #[test]
    fn value_tree_round_trips_types() {
        let value = ConfigValue::parse(r#"{"a": [1, -2, true, null], "b": "x"}"#).unwrap();
        let list = value.get("a").unwrap();
        assert_eq!(
            list,
            &ConfigValue::List(vec![
                ConfigValue::Int(1),
                ConfigValue::Int(-2),
                ConfigValue::Bool(true),
                ConfigValue::Null,
            ])
        );
        assert_eq!(value.get("b").unwrap().as_str(), Some("x"));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(ConfigValue::parse("{").is_err());
        assert!(ConfigValue::parse(r#"{"a": 1,}"#).is_err());
        assert!(ConfigValue::parse(r#"{"a": 1} extra"#).is_err());
        assert!(ConfigValue::parse(r#"{"a": 1, "a": 2}"#).is_err());
    }

    #[test]
    fn template_expansion() {
        let params = ConfigValue::parse(r#"{"pid": "123"}"#).unwrap();
        assert_eq!(expand_template("t-{pid}.bin", &params).unwrap(), "t-123.bin");
        assert!(expand_template("t-{pid", &params).is_err());
        assert!(expand_template("t-pid}", &params).is_err());
        assert!(expand_template("t-{{pid}}", &params).is_err());
        assert!(expand_template("t-{other}", &params).is_err());
    }
}
