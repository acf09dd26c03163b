// src/models/rules.rs

//! Declarative extraction rules attached to a Source.

use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{FieldMap, TrackedField};

/// Selector rule for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldRule {
    /// CSS selector; the first matching element is used
    pub selector: String,

    /// What to read from the element: "text" (default), "html", or an attribute name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,

    /// Optional regex applied to the trimmed raw value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    /// Capture group to keep; defaults to 1 when the regex has groups, else 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
}

impl FieldRule {
    pub fn validate(&self, field: TrackedField) -> Result<()> {
        if self.selector.trim().is_empty() {
            return Err(AppError::validation(format!("{field}: selector is empty")));
        }
        Selector::parse(&self.selector)
            .map_err(|e| AppError::selector(&self.selector, format!("{field}: {e:?}")))?;
        if let Some(attr) = &self.attr {
            if attr.trim().is_empty() {
                return Err(AppError::validation(format!("{field}: attr is empty")));
            }
        }
        match &self.regex {
            Some(pattern) => check_group(field, pattern, self.group),
            None if self.group.is_some() => Err(AppError::validation(format!(
                "{field}: group given without regex"
            ))),
            None => Ok(()),
        }
    }
}

/// Regex rule over raw page text for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegexRule {
    pub pattern: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
}

impl RegexRule {
    pub fn validate(&self, field: TrackedField) -> Result<()> {
        check_group(field, &self.pattern, self.group)
    }
}

fn check_group(field: TrackedField, pattern: &str, group: Option<usize>) -> Result<()> {
    let re = Regex::new(pattern)
        .map_err(|e| AppError::validation(format!("{field}: invalid regex '{pattern}': {e}")))?;
    if let Some(group) = group {
        // captures_len counts the implicit whole-match group
        if group >= re.captures_len() {
            return Err(AppError::validation(format!(
                "{field}: group {group} does not exist in '{pattern}'"
            )));
        }
    }
    Ok(())
}

/// Per-field selector rules, as written by operators or drafted by AI.
pub type RuleTemplate = FieldMap<FieldRule>;

/// Per-field regex rules.
pub type RegexTemplate = FieldMap<RegexRule>;

impl RuleTemplate {
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(AppError::validation("rule template defines no fields"));
        }
        self.iter().try_for_each(|(field, rule)| rule.validate(field))
    }

    /// Overlay `draft` onto this template; fields the draft defines win.
    pub fn merged_with(&self, draft: &RuleTemplate) -> RuleTemplate {
        let mut merged = draft.clone();
        merged.fill_from(self.clone());
        merged
    }
}

impl RegexTemplate {
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(AppError::validation("regex template defines no fields"));
        }
        self.iter().try_for_each(|(field, rule)| rule.validate(field))
    }
}

/// How the extractor treats a Source's pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionConfig {
    /// Embedded structured data, then the built-in date patterns.
    #[default]
    StructuredData,

    /// As `StructuredData`, with selector rules filling the remaining fields.
    Selector { template: RuleTemplate },

    /// Only the given regex rules over the raw page text.
    RegexOnly { rules: RegexTemplate },
}

impl ExtractionConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            ExtractionConfig::StructuredData => Ok(()),
            ExtractionConfig::Selector { template } => template.validate(),
            ExtractionConfig::RegexOnly { rules } => rules.validate(),
        }
    }

    pub fn template(&self) -> Option<&RuleTemplate> {
        match self {
            ExtractionConfig::Selector { template } => Some(template),
            _ => None,
        }
    }
}
