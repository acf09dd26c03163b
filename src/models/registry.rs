// src/models/registry.rs

//! Source, series and link catalog loaded from `registry.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{EventSeries, NewLink, Source};
use crate::storage::SyncStore;

/// Everything an operator registers up front.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub sources: Vec<Source>,

    #[serde(default)]
    pub series: Vec<EventSeries>,

    #[serde(default)]
    pub links: Vec<NewLink>,
}

/// Counts of rows written by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub sources: usize,
    pub series: usize,
    pub links: usize,
}

impl Registry {
    /// Load a registry from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Check every source and the references between entries.
    pub fn validate(&self) -> Result<()> {
        let mut source_ids = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !source_ids.insert(source.id.as_str()) {
                return Err(AppError::validation(format!("duplicate source id '{}'", source.id)));
            }
        }

        let mut series_ids = HashSet::new();
        let mut names = HashSet::new();
        for series in &self.series {
            if !series_ids.insert(series.id.as_str()) {
                return Err(AppError::validation(format!("duplicate series id '{}'", series.id)));
            }
            if !names.insert(series.canonical_name.trim()) {
                return Err(AppError::validation(format!(
                    "duplicate series name '{}'",
                    series.canonical_name
                )));
            }
        }

        let mut bindings = HashSet::new();
        for link in &self.links {
            if !series_ids.contains(link.series_id.as_str()) {
                return Err(AppError::validation(format!(
                    "link {} references unknown series '{}'",
                    link.url, link.series_id
                )));
            }
            if !source_ids.contains(link.source_id.as_str()) {
                return Err(AppError::validation(format!(
                    "link {} references unknown source '{}'",
                    link.url, link.source_id
                )));
            }
            if !crate::utils::is_http_url(&link.url) {
                return Err(AppError::validation(format!("link url '{}' is not http(s)", link.url)));
            }
            if !bindings.insert((link.series_id.as_str(), link.source_id.as_str())) {
                return Err(AppError::validation(format!(
                    "more than one link for series '{}' and source '{}'",
                    link.series_id, link.source_id
                )));
            }
        }
        Ok(())
    }

    /// Validate, then upsert everything into `store`.
    pub async fn import(&self, store: &dyn SyncStore) -> Result<ImportSummary> {
        self.validate()?;
        let now = Utc::now();

        for source in &self.sources {
            store.upsert_source(source).await?;
        }
        for series in &self.series {
            store.upsert_series(series).await?;
        }
        for link in &self.links {
            let stored = store.upsert_link(link, now).await?;
            log::debug!("Link {} -> {}", stored.id, stored.url);
        }

        let summary = ImportSummary {
            sources: self.sources.len(),
            series: self.series.len(),
            links: self.links.len(),
        };
        log::info!(
            "Imported {} source(s), {} series, {} link(s)",
            summary.sources,
            summary.series,
            summary.links
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionConfig, SourceType};
    use crate::storage::LocalStore;
    use tempfile::TempDir;

    const REGISTRY: &str = r#"
[[sources]]
id = "tokyo-official"
name = "Tokyo Marathon official site"
type = "official"
strategy = "HTML"
priority = 95
min_interval_secs = 3600

[sources.extraction]
kind = "selector"

[sources.extraction.template.registrationStatus]
selector = "p.entry-status"

[[sources]]
id = "runnet"
name = "RUNNET"
type = "platform"
priority = 10

[[series]]
id = "tokyo-marathon"
canonical_name = "Tokyo Marathon"

[[links]]
series = "tokyo-marathon"
source = "tokyo-official"
url = "https://www.marathon.tokyo/"
primary = true

[[links]]
series = "tokyo-marathon"
source = "runnet"
url = "https://runnet.jp/entry/tokyo"
"#;

    #[test]
    fn parses_registry() {
        let registry = Registry::parse(REGISTRY).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.sources[0].source_type, SourceType::Official);
        assert!(matches!(
            registry.sources[0].extraction,
            ExtractionConfig::Selector { .. }
        ));
        assert_eq!(registry.sources[1].extraction, ExtractionConfig::StructuredData);
        assert!(registry.links[0].is_primary);
        assert!(!registry.links[1].is_primary);
        registry.validate().unwrap();
    }

    #[test]
    fn rejects_dangling_link() {
        let mut registry = Registry::parse(REGISTRY).unwrap();
        registry.links[1].source_id = "missing".into();
        assert!(registry.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_binding() {
        let mut registry = Registry::parse(REGISTRY).unwrap();
        let mut dup = registry.links[0].clone();
        dup.url = "https://www.marathon.tokyo/en/".into();
        registry.links.push(dup);
        assert!(registry.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_priority() {
        let mut registry = Registry::parse(REGISTRY).unwrap();
        registry.sources[1].priority = -1;
        assert!(registry.validate().is_err());
    }

    #[tokio::test]
    async fn reimport_does_not_duplicate_links() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let registry = Registry::parse(REGISTRY).unwrap();

        registry.import(&store).await.unwrap();
        let mut link = store.get_link(1).await.unwrap().unwrap();
        link.last_hash = Some("seen".into());
        store.record_check(&link).await.unwrap();

        let summary = registry.import(&store).await.unwrap();
        assert_eq!(summary.links, 2);
        assert!(store.get_link(3).await.unwrap().is_none());
        assert_eq!(
            store.get_link(1).await.unwrap().unwrap().last_hash.as_deref(),
            Some("seen")
        );
    }
}
