//! Ordered operator parameter sets and their XML form.

use crate::types::{SarError, SarResult};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;
use std::str::FromStr;

const ROOT_TAG: &str = "parameters";

/// String key/value parameters in insertion order.
///
/// Operators read them through the typed getters, which fall back to a
/// default when the key is absent and report a configuration error when the
/// value does not parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterMap {
    entries: Vec<(String, String)>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ParameterMap::set`]
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or overwrite; an overwritten key keeps its original position.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get_str(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed value of `key`, or `default` when the key is absent.
    pub fn get_or<T: FromStr>(&self, operator: &str, key: &str, default: T) -> SarResult<T> {
        match self.get_str(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                SarError::config(operator, format!("Cannot parse parameter {}='{}'", key, raw))
            }),
        }
    }

    /// Parsed value of `key` when present
    pub fn get_opt<T: FromStr>(&self, operator: &str, key: &str) -> SarResult<Option<T>> {
        match self.get_str(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                SarError::config(operator, format!("Cannot parse parameter {}='{}'", key, raw))
            }),
        }
    }

    /// Boolean accepting `true/false`, `yes/no` and `1/0`
    pub fn get_bool(&self, operator: &str, key: &str, default: bool) -> SarResult<bool> {
        match self.get_str(key).map(|s| s.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if v == "true" || v == "yes" || v == "1" => Ok(true),
            Some(v) if v == "false" || v == "no" || v == "0" => Ok(false),
            Some(v) => Err(SarError::config(
                operator,
                format!("Parameter {} expects a boolean, got '{}'", key, v),
            )),
        }
    }

    /// Comma separated list; empty when the key is absent
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_str(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Comma separated numeric list
    pub fn get_f64_list(&self, operator: &str, key: &str) -> SarResult<Option<Vec<f64>>> {
        if !self.contains(key) {
            return Ok(None);
        }
        self.get_list(key)
            .iter()
            .map(|s| {
                s.parse::<f64>().map_err(|_| {
                    SarError::config(operator, format!("Parameter {} has non-numeric entry '{}'", key, s))
                })
            })
            .collect::<SarResult<Vec<f64>>>()
            .map(Some)
    }

    /// Parse `<parameters><key>value</key>...</parameters>`.
    pub fn from_xml(xml: &str) -> SarResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut params = ParameterMap::new();
        let mut buf = Vec::new();
        let mut depth = 0usize;
        let mut current_key: Option<String> = None;
        let mut text = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    depth += 1;
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match depth {
                        1 if tag != ROOT_TAG => {
                            return Err(SarError::XmlParsing(format!(
                                "Expected <{}> root element, found <{}>",
                                ROOT_TAG, tag
                            )))
                        }
                        2 => {
                            current_key = Some(tag);
                            text.clear();
                        }
                        d if d > 2 => {
                            return Err(SarError::XmlParsing(format!(
                                "Nested element <{}> inside a parameter value",
                                tag
                            )))
                        }
                        _ => {}
                    }
                }
                Ok(Event::Empty(ref e)) => {
                    if depth == 1 {
                        let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                        params.set(&tag, "");
                    }
                }
                Ok(Event::Text(ref e)) => {
                    if current_key.is_some() {
                        let value = e
                            .unescape()
                            .map_err(|e| SarError::XmlParsing(e.to_string()))?;
                        text.push_str(&value);
                    }
                }
                Ok(Event::End(_)) => {
                    if depth == 2 {
                        if let Some(key) = current_key.take() {
                            params.set(&key, &text);
                        }
                    }
                    depth = depth.saturating_sub(1);
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(SarError::XmlParsing(e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        Ok(params)
    }

    pub fn to_xml(&self) -> SarResult<String> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        let xml_err = |e: quick_xml::Error| SarError::XmlParsing(e.to_string());

        writer
            .write_event(Event::Start(BytesStart::new(ROOT_TAG)))
            .map_err(xml_err)?;
        for (key, value) in &self.entries {
            writer
                .write_event(Event::Start(BytesStart::new(key.as_str())))
                .map_err(xml_err)?;
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .map_err(xml_err)?;
            writer
                .write_event(Event::End(BytesEnd::new(key.as_str())))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(ROOT_TAG)))
            .map_err(xml_err)?;

        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| SarError::XmlParsing(e.to_string()))
    }
}
