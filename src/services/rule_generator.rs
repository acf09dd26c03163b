// src/services/rule_generator.rs

//! AI-drafted selector templates.
//!
//! A draft is never written into a Source by generation itself. Operators
//! preview it against an archived snapshot and then apply it explicitly.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_json::{Value, json};

use crate::error::{AppError, Result};
use crate::models::{AiConfig, EditionFields, ExtractionConfig, RawSnapshot, RuleTemplate, Source};
use crate::services::extractor::Extractor;
use crate::storage::SyncStore;
use crate::utils::truncate_graphemes;

const SYSTEM_PROMPT: &str = "You write CSS selector rules that extract race event facts from \
HTML. Reply with JSON only. For each field you can locate, give a selector for the first \
matching element, what to read from it (\"text\", \"html\" or an attribute name), and an \
optional regex with the capture group holding the value. Use null for fields the page does \
not contain. raceDate is the race day, registrationStatus is whether entry is open, \
registrationUrl is the entry page link.";

static SCRIPT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b([^>]*)>.*?</script>").ok());

static NOISE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style>|<!--.*?-->").ok());

static BLANKS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s{2,}").ok());

/// Strict JSON schema the provider must answer with.
pub fn template_schema() -> Value {
    let rule = json!({
        "type": ["object", "null"],
        "additionalProperties": false,
        "required": ["selector", "attr", "regex", "group"],
        "properties": {
            "selector": { "type": "string" },
            "attr": { "type": ["string", "null"] },
            "regex": { "type": ["string", "null"] },
            "group": { "type": ["integer", "null"] }
        }
    });
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["raceDate", "registrationStatus", "registrationUrl"],
        "properties": {
            "raceDate": rule,
            "registrationStatus": rule,
            "registrationUrl": rule
        }
    })
}

/// A model endpoint that answers one prompt.
#[async_trait]
pub trait RuleProvider: Send + Sync {
    async fn complete(&self, system: &str, user: &str, schema: &Value) -> Result<String>;
}

/// OpenAI-compatible chat completions provider.
pub struct OpenAiRuleProvider {
    client: reqwest::Client,
    config: AiConfig,
}

impl OpenAiRuleProvider {
    pub fn new(client: reqwest::Client, config: AiConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl RuleProvider for OpenAiRuleProvider {
    async fn complete(&self, system: &str, user: &str, schema: &Value) -> Result<String> {
        let api_key = self
            .config
            .credentials()
            .ok_or_else(|| AppError::config("AI credentials are not configured"))?;
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": "rule_template", "strict": true, "schema": schema }
            }
        });

        log::debug!("Rule generation request to {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::ai(format!(
                "provider returned HTTP {}: {}",
                status.as_u16(),
                truncate_graphemes(&text, 300)
            )));
        }

        let reply: Value = response.json().await?;
        reply["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AppError::ai("missing choices[0].message.content"))
    }
}

/// Drafts, previews and applies selector templates.
pub struct RuleGenerator {
    config: AiConfig,
    provider: Arc<dyn RuleProvider>,
}

impl RuleGenerator {
    pub fn new(config: AiConfig, provider: Arc<dyn RuleProvider>) -> Self {
        Self { config, provider }
    }

    /// Ask the provider for a draft template for this snapshot's page.
    ///
    /// Fails with a configuration error, before any request, unless the
    /// feature is enabled and credentials resolve.
    pub async fn generate(&self, snapshot: &RawSnapshot) -> Result<RuleTemplate> {
        if !self.config.enabled {
            return Err(AppError::config("AI rule generation is disabled (ai.enabled = false)"));
        }
        if self.config.credentials().is_none() {
            return Err(AppError::config(format!(
                "AI rule generation needs ai.api_key or ${}",
                self.config.api_key_env
            )));
        }
        if snapshot.body.trim().is_empty() {
            return Err(AppError::validation(format!("snapshot {} has no body", snapshot.id)));
        }

        let snippet = page_snippet(&snapshot.body, self.config.max_snippet_chars);
        let user = format!("Page URL: {}\n\nHTML:\n{}", snapshot.url, snippet);
        log::info!(
            "Requesting rule draft for snapshot {} ({} chars)",
            snapshot.id,
            snippet.chars().count()
        );

        let reply = self
            .provider
            .complete(SYSTEM_PROMPT, &user, &template_schema())
            .await?;
        parse_template(&reply)
    }

    /// Apply a template to an archived snapshot without touching any Source.
    pub fn preview(&self, template: &RuleTemplate, snapshot: &RawSnapshot) -> Result<EditionFields> {
        template.validate()?;
        Ok(Extractor.preview(&snapshot.body, &snapshot.url, template))
    }

    /// Merge a reviewed template into a Source's selector rules.
    pub async fn apply(
        &self,
        store: &dyn SyncStore,
        source_id: &str,
        template: &RuleTemplate,
    ) -> Result<Source> {
        template.validate()?;
        let mut source = store
            .get_source(source_id)
            .await?
            .ok_or_else(|| AppError::not_found("source", source_id))?;

        source.extraction = match &source.extraction {
            ExtractionConfig::Selector { template: current } => ExtractionConfig::Selector {
                template: current.merged_with(template),
            },
            ExtractionConfig::RegexOnly { .. } => {
                log::warn!("Source {} switches from regex_only to selector rules", source_id);
                ExtractionConfig::Selector {
                    template: template.clone(),
                }
            }
            ExtractionConfig::StructuredData => ExtractionConfig::Selector {
                template: template.clone(),
            },
        };

        store.upsert_source(&source).await?;
        log::info!("Applied rule template to source {}", source_id);
        Ok(source)
    }
}

/// Page text sent to the provider: scripts, styles and comments removed,
/// whitespace collapsed, capped at `max_chars` graphemes.
pub fn page_snippet(body: &str, max_chars: usize) -> String {
    let mut text = body.to_string();
    if let Some(re) = SCRIPT.as_ref() {
        // JSON-LD blocks are often the best hint for the model.
        text = re
            .replace_all(&text, |caps: &Captures<'_>| {
                if caps[1].contains("ld+json") {
                    caps[0].to_string()
                } else {
                    " ".to_string()
                }
            })
            .into_owned();
    }
    if let Some(re) = NOISE.as_ref() {
        text = re.replace_all(&text, " ").into_owned();
    }
    if let Some(re) = BLANKS.as_ref() {
        text = re.replace_all(text.trim(), " ").into_owned();
    }
    truncate_graphemes(text.trim(), max_chars).to_string()
}

/// Parse and validate a provider reply as a rule template.
pub fn parse_template(reply: &str) -> Result<RuleTemplate> {
    let json = strip_code_fence(reply);
    let template: RuleTemplate = serde_json::from_str(json)
        .map_err(|e| AppError::ai(format!("reply is not a rule template: {e}")))?;
    template
        .validate()
        .map_err(|e| AppError::ai(format!("generated template rejected: {e}")))?;
    Ok(template)
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldRule, NewSnapshot, SourceType};
    use crate::storage::LocalStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ScriptedProvider {
        reply: String,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RuleProvider for ScriptedProvider {
        async fn complete(&self, _system: &str, user: &str, _schema: &Value) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(user.contains("Page URL"));
            Ok(self.reply.clone())
        }
    }

    const GOOD_REPLY: &str = r#"```json
{"raceDate":{"selector":"span.date","attr":"text","regex":"(\\d{4}/\\d{2}/\\d{2})","group":1},
 "registrationStatus":null,
 "registrationUrl":{"selector":"a.entry","attr":"href","regex":null,"group":null}}
```"#;

    fn enabled() -> AiConfig {
        AiConfig {
            enabled: true,
            api_key: Some("test-key".into()),
            ..Default::default()
        }
    }

    fn snapshot() -> RawSnapshot {
        RawSnapshot::from_new(
            3,
            NewSnapshot {
                link_id: 1,
                series_id: "tokyo".into(),
                source_id: "platform".into(),
                url: "https://race.example.com/2026/".into(),
                http_status: 200,
                content_type: Some("text/html".into()),
                body: r#"<div><span class="date">Race day 2026/03/07</span>
                    <a class="entry" href="/entry">Enter</a></div>"#
                    .into(),
                truncated: false,
                content_hash: "h".into(),
                fetched_at: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn disabled_generation_never_calls_provider() {
        let provider = ScriptedProvider::new(GOOD_REPLY);
        let generator = RuleGenerator::new(AiConfig::default(), provider.clone());

        let err = generator.generate(&snapshot()).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_credentials_never_call_provider() {
        let provider = ScriptedProvider::new(GOOD_REPLY);
        let config = AiConfig {
            enabled: true,
            api_key: None,
            api_key_env: "EDITION_SYNC_TEST_UNSET_KEY".into(),
            ..Default::default()
        };
        let generator = RuleGenerator::new(config, provider.clone());

        let err = generator.generate(&snapshot()).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fenced_reply_becomes_template() {
        let provider = ScriptedProvider::new(GOOD_REPLY);
        let generator = RuleGenerator::new(enabled(), provider.clone());

        let template = generator.generate(&snapshot()).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(template.race_date.as_ref().unwrap().selector, "span.date");
        assert!(template.registration_status.is_none());

        let preview = generator.preview(&template, &snapshot()).unwrap();
        assert_eq!(preview.race_date.as_deref(), Some("2026-03-07"));
        assert_eq!(
            preview.registration_url.as_deref(),
            Some("https://race.example.com/entry")
        );
    }

    #[test]
    fn invalid_replies_are_rejected() {
        assert!(matches!(parse_template("not json"), Err(AppError::Ai(_))));
        assert!(matches!(
            parse_template(r#"{"raceDate":{"selector":"[[","attr":null,"regex":null,"group":null}}"#),
            Err(AppError::Ai(_))
        ));
        assert!(matches!(
            parse_template(r#"{"raceDay":{"selector":"p"}}"#),
            Err(AppError::Ai(_))
        ));
        assert!(matches!(
            parse_template(r#"{"raceDate":{"selector":"p","regex":"(\\d+)","group":2}}"#),
            Err(AppError::Ai(_))
        ));
        assert!(matches!(parse_template("{}"), Err(AppError::Ai(_))));
    }

    #[test]
    fn snippet_drops_scripts_but_keeps_json_ld() {
        let body = r#"<html><script>var x = 1;</script>
            <script type="application/ld+json">{"@type":"Event"}</script>
            <style>p { color: red }</style><!-- note --><p>2026年3月7日</p></html>"#;
        let snippet = page_snippet(body, 10_000);
        assert!(!snippet.contains("var x"));
        assert!(!snippet.contains("color"));
        assert!(!snippet.contains("note"));
        assert!(snippet.contains("ld+json"));
        assert!(snippet.contains("2026年3月7日"));

        assert_eq!(page_snippet("2026年3月7日", 5), "2026年");
    }

    #[tokio::test]
    async fn apply_merges_into_existing_rules() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let mut source = Source::new("platform", "Platform", SourceType::Platform);
        source.extraction = ExtractionConfig::Selector {
            template: RuleTemplate {
                registration_status: Some(FieldRule {
                    selector: "p.status".into(),
                    attr: None,
                    regex: None,
                    group: None,
                }),
                race_date: Some(FieldRule {
                    selector: "p.old".into(),
                    attr: None,
                    regex: None,
                    group: None,
                }),
                ..Default::default()
            },
        };
        store.upsert_source(&source).await.unwrap();

        let generator = RuleGenerator::new(enabled(), ScriptedProvider::new(GOOD_REPLY));
        let draft = parse_template(GOOD_REPLY).unwrap();
        let updated = generator.apply(&store, "platform", &draft).await.unwrap();

        let template = updated.extraction.template().unwrap();
        assert_eq!(template.race_date.as_ref().unwrap().selector, "span.date");
        assert_eq!(
            template.registration_status.as_ref().unwrap().selector,
            "p.status"
        );
        assert!(template.registration_url.is_some());

        let stored = store.get_source("platform").await.unwrap().unwrap();
        assert_eq!(stored.extraction, updated.extraction);
    }

    #[tokio::test]
    async fn apply_rejects_unknown_source() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path());
        let generator = RuleGenerator::new(enabled(), ScriptedProvider::new(GOOD_REPLY));
        let draft = parse_template(GOOD_REPLY).unwrap();
        let err = generator.apply(&store, "nope", &draft).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }
}
