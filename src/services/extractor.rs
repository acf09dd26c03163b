// src/services/extractor.rs

//! Structured field extraction from fetched pages.
//!
//! Stages run in decreasing confidence and each only fills fields the
//! previous ones left empty:
//!
//! 1. schema.org Event blocks embedded as JSON-LD
//! 2. date patterns found anywhere in the raw text
//! 3. the Source's declarative selector rules
//!
//! A `regex_only` Source skips all of that and applies its own patterns.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

use crate::models::{
    EditionFields, ExtractionConfig, ExtractionMethod, FieldMap, FieldRule, RegexRule,
    RuleTemplate, TrackedField,
};
use crate::utils::resolve;

static ISO_DATE_EXACT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})$").ok());

static ISO_DATE_IN_TEXT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)((\d{4})-(\d{1,2})-(\d{1,2}))(?:\D|$)").ok());

static CJK_DATE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"((\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日)").ok()
});

static JSON_LD: LazyLock<Option<Selector>> =
    LazyLock::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).ok());

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M%:z", "%Y-%m-%d %H:%M:%S%:z"];

const NAIVE_DATE_FORMATS: &[&str] = &["%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y", "%Y%m%d"];

/// Normalize a calendar value to `YYYY-MM-DD`.
///
/// Accepts ISO dates and datetimes, localized `2026年3月7日` text, and a
/// handful of English formats. Values with an offset are converted to UTC
/// before taking the calendar date. Impossible dates yield `None`.
pub fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(caps) = ISO_DATE_EXACT.as_ref()?.captures(raw) {
        return ymd(&caps[1], &caps[2], &caps[3]);
    }
    if let Some(caps) = CJK_DATE.as_ref()?.captures(raw) {
        return ymd(&caps[2], &caps[3], &caps[4]);
    }

    let date = DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
        .or_else(|| {
            OFFSET_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| DateTime::parse_from_str(raw, fmt).ok())
        })
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .or_else(|| {
            NAIVE_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.and_utc().date_naive())
        })
        .or_else(|| {
            NAIVE_DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        })?;

    Some(date.format("%Y-%m-%d").to_string())
}

/// Build a date from components; out-of-range values are rejected.
fn ymd(year: &str, month: &str, day: &str) -> Option<String> {
    let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
    Some(date.format("%Y-%m-%d").to_string())
}

/// Year of a normalized `YYYY-MM-DD` date.
pub fn date_year(date: &str) -> Option<i32> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .map(|d| chrono::Datelike::year(&d))
}

/// Earliest valid ISO or localized date in free text.
pub fn find_date_in_text(text: &str) -> Option<String> {
    let patterns = [ISO_DATE_IN_TEXT.as_ref()?, CJK_DATE.as_ref()?];
    let mut best: Option<(usize, String)> = None;

    for re in patterns {
        for caps in re.captures_iter(text) {
            let Some(date) = ymd(&caps[2], &caps[3], &caps[4]) else {
                continue;
            };
            let start = caps.get(1).map_or(0, |m| m.start());
            if best.as_ref().is_none_or(|(s, _)| start < *s) {
                best = Some((start, date));
            }
            break;
        }
    }
    best.map(|(_, date)| date)
}

/// Facts taken from an embedded schema.org Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredEvent {
    pub start_date: String,
    pub url: Option<String>,
    pub registration_status: Option<String>,
}

/// First Event block with a usable `startDate`, found depth-first.
pub fn find_structured_event(document: &Html) -> Option<StructuredEvent> {
    let roots: Vec<Value> = document
        .select(JSON_LD.as_ref()?)
        .filter_map(|script| {
            let text: String = script.text().collect();
            serde_json::from_str(text.trim()).ok()
        })
        .collect();

    let mut stack: Vec<&Value> = roots.iter().collect();
    while let Some(value) = stack.pop() {
        match value {
            Value::Array(items) => stack.extend(items.iter()),
            Value::Object(map) => {
                if is_event(map) {
                    let start_date = map
                        .get("startDate")
                        .and_then(Value::as_str)
                        .and_then(normalize_date);
                    if let Some(start_date) = start_date {
                        return Some(StructuredEvent {
                            start_date,
                            url: map.get("url").and_then(Value::as_str).map(str::to_string),
                            registration_status: offer_availability(map),
                        });
                    }
                }
                stack.extend(map.values());
            }
            _ => {}
        }
    }
    None
}

fn is_event(map: &Map<String, Value>) -> bool {
    let is_event_type = |t: &str| t.ends_with("Event");
    match map.get("@type") {
        Some(Value::String(t)) => is_event_type(t),
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).any(is_event_type),
        _ => false,
    }
}

/// Map `offers.availability` onto a registration status.
fn offer_availability(event: &Map<String, Value>) -> Option<String> {
    let offers = event.get("offers")?;
    let offer = match offers {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let availability = offer.get("availability")?.as_str()?;
    let kind = availability.rsplit('/').next().unwrap_or(availability);
    let status = match kind {
        "InStock" | "LimitedAvailability" | "OnlineOnly" => "open",
        "SoldOut" | "OutOfStock" | "Discontinued" => "closed",
        "PreOrder" | "PreSale" => "upcoming",
        _ => return None,
    };
    Some(status.to_string())
}

/// Apply one selector rule. Any mismatch yields `None`.
pub fn apply_rule(document: &Html, rule: &FieldRule) -> Option<String> {
    let selector = Selector::parse(&rule.selector).ok()?;
    let element = document.select(&selector).next()?;
    let raw = read_element(element, rule.attr.as_deref())?;
    let value = match &rule.regex {
        Some(pattern) => capture(pattern, rule.group, raw.trim())?,
        None => raw,
    };
    non_empty(&value)
}

fn read_element(element: ElementRef<'_>, attr: Option<&str>) -> Option<String> {
    match attr.map(str::trim) {
        None | Some("text") => {
            let text: String = element.text().collect();
            Some(text.split_whitespace().collect::<Vec<_>>().join(" "))
        }
        Some("html") => Some(element.inner_html()),
        Some(name) => element.value().attr(name).map(str::to_string),
    }
}

/// Apply one regex rule over raw text.
pub fn apply_regex_rule(text: &str, rule: &RegexRule) -> Option<String> {
    capture(&rule.pattern, rule.group, text).and_then(|v| non_empty(&v))
}

fn capture(pattern: &str, group: Option<usize>, text: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(text)?;
    let group = group.unwrap_or(if re.captures_len() > 1 { 1 } else { 0 });
    caps.get(group).map(|m| m.as_str().to_string())
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Extracted values with the stage that produced each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub fields: EditionFields,
    pub methods: FieldMap<ExtractionMethod>,
}

impl Extraction {
    fn offer(&mut self, field: TrackedField, value: Option<String>, method: ExtractionMethod) {
        if self.fields.get(field).is_some() {
            return;
        }
        if let Some(value) = value {
            self.fields.set(field, Some(value));
            self.methods.set(field, Some(method));
        }
    }

    pub fn race_date(&self) -> Option<&str> {
        self.fields.race_date.as_deref()
    }
}

/// Stateless page extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Extractor;

impl Extractor {
    /// Extract fields from a page body fetched from `page_url`.
    pub fn extract(&self, body: &str, page_url: &str, config: &ExtractionConfig) -> Extraction {
        let mut extraction = Extraction::default();

        if let ExtractionConfig::RegexOnly { rules } = config {
            for (field, rule) in rules.iter() {
                let value = apply_regex_rule(body, rule).and_then(|v| finish(field, v, page_url));
                extraction.offer(field, value, ExtractionMethod::Regex);
            }
            return extraction;
        }

        let document = Html::parse_document(body);

        if let Some(event) = find_structured_event(&document) {
            extraction.offer(
                TrackedField::RaceDate,
                Some(event.start_date),
                ExtractionMethod::StructuredData,
            );
            extraction.offer(
                TrackedField::RegistrationUrl,
                event.url.and_then(|u| finish(TrackedField::RegistrationUrl, u, page_url)),
                ExtractionMethod::StructuredData,
            );
            extraction.offer(
                TrackedField::RegistrationStatus,
                event.registration_status,
                ExtractionMethod::StructuredData,
            );
        }

        extraction.offer(
            TrackedField::RaceDate,
            find_date_in_text(body),
            ExtractionMethod::Regex,
        );

        if let Some(template) = config.template() {
            for (field, value) in Self::apply_template(&document, template, page_url).iter() {
                extraction.offer(field, Some(value.clone()), ExtractionMethod::Rule);
            }
        }

        extraction
    }

    /// Apply only a rule template, as used for previews.
    pub fn preview(&self, body: &str, page_url: &str, template: &RuleTemplate) -> EditionFields {
        let document = Html::parse_document(body);
        Self::apply_template(&document, template, page_url)
    }

    fn apply_template(document: &Html, template: &RuleTemplate, page_url: &str) -> EditionFields {
        let mut fields = EditionFields::default();
        for (field, rule) in template.iter() {
            let value = apply_rule(document, rule).and_then(|v| finish(field, v, page_url));
            fields.set(field, value);
        }
        fields
    }
}

/// Field-specific cleanup of a raw extracted value.
fn finish(field: TrackedField, value: String, page_url: &str) -> Option<String> {
    match field {
        TrackedField::RaceDate => normalize_date(&value),
        TrackedField::RegistrationUrl => {
            Some(resolve(page_url, value.trim()).unwrap_or_else(|| value.trim().to_string()))
        }
        TrackedField::RegistrationStatus => non_empty(&value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RegexTemplate;

    const PAGE_URL: &str = "https://race.example.com/2026/";

    #[test]
    fn normalizes_iso_and_localized_dates() {
        assert_eq!(normalize_date("2026-03-07").as_deref(), Some("2026-03-07"));
        assert_eq!(normalize_date("2026年3月7日").as_deref(), Some("2026-03-07"));
        assert_eq!(normalize_date("2026 年 3 月 7 日").as_deref(), Some("2026-03-07"));
        assert_eq!(normalize_date("2026/3/7").as_deref(), Some("2026-03-07"));
    }

    #[test]
    fn rejects_impossible_dates() {
        assert_eq!(normalize_date("2026-02-30"), None);
        assert_eq!(normalize_date("2026年2月30日"), None);
        assert_eq!(normalize_date("2026-13-01"), None);
        assert_eq!(normalize_date(""), None);
        assert_eq!(normalize_date("soon"), None);
    }

    #[test]
    fn datetimes_use_utc_calendar_day() {
        assert_eq!(
            normalize_date("2026-03-07T09:00:00+09:00").as_deref(),
            Some("2026-03-07")
        );
        assert_eq!(
            normalize_date("2026-03-07T01:00:00+09:00").as_deref(),
            Some("2026-03-06")
        );
        assert_eq!(normalize_date("2026-03-07T08:30").as_deref(), Some("2026-03-07"));
    }

    #[test]
    fn parses_english_calendar_values() {
        assert_eq!(normalize_date("March 7, 2026").as_deref(), Some("2026-03-07"));
        assert_eq!(normalize_date("7 Mar 2026").as_deref(), Some("2026-03-07"));
    }

    #[test]
    fn finds_earliest_valid_date_in_text() {
        let text = "Entry opens 2025年9月1日. Race day: 2026-03-01";
        assert_eq!(find_date_in_text(text).as_deref(), Some("2025-09-01"));

        let text = "Bad 2026-02-30 then good 2026-03-07";
        assert_eq!(find_date_in_text(text).as_deref(), Some("2026-03-07"));

        assert_eq!(find_date_in_text("no dates here"), None);
    }

    #[test]
    fn finds_event_nested_in_graph() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@type":"WebSite","name":"x"}</script>
            <script type="application/ld+json">
            {"@context":"https://schema.org","@graph":[
                {"@type":"Organization","name":"Org"},
                {"@type":"SportsEvent","startDate":"2026-03-07T09:10:00+09:00",
                 "url":"https://race.example.com/entry",
                 "offers":{"availability":"https://schema.org/InStock"}}
            ]}
            </script></head><body></body></html>"#;
        let event = find_structured_event(&Html::parse_document(html)).unwrap();
        assert_eq!(event.start_date, "2026-03-07");
        assert_eq!(event.url.as_deref(), Some("https://race.example.com/entry"));
        assert_eq!(event.registration_status.as_deref(), Some("open"));
    }

    #[test]
    fn skips_events_without_usable_start_date() {
        let html = r#"<script type="application/ld+json">
            [{"@type":"Event","startDate":"TBD"},{"@type":["Thing","Event"],"startDate":"2026-10-04"}]
            </script>"#;
        let event = find_structured_event(&Html::parse_document(html)).unwrap();
        assert_eq!(event.start_date, "2026-10-04");
    }

    #[test]
    fn malformed_json_ld_is_ignored() {
        let html = r#"<script type="application/ld+json">{not json</script>"#;
        assert!(find_structured_event(&Html::parse_document(html)).is_none());
    }

    #[test]
    fn rule_reads_attribute_and_applies_regex() {
        let html = Html::parse_document(
            r#"<div class="info"><span class="date">Race day: 2026/03/07 (Sat)</span>
               <a class="entry" href="/entry">Enter</a></div>"#,
        );
        let date_rule = FieldRule {
            selector: "span.date".into(),
            attr: Some("text".into()),
            regex: Some(r"(\d{4}/\d{2}/\d{2})".into()),
            group: None,
        };
        assert_eq!(apply_rule(&html, &date_rule).as_deref(), Some("2026/03/07"));

        let href_rule = FieldRule {
            selector: "a.entry".into(),
            attr: Some("href".into()),
            regex: None,
            group: None,
        };
        assert_eq!(apply_rule(&html, &href_rule).as_deref(), Some("/entry"));
    }

    #[test]
    fn unmatched_rule_yields_none() {
        let html = Html::parse_document("<p>nothing</p>");
        let rule = FieldRule {
            selector: "span.date".into(),
            attr: None,
            regex: None,
            group: None,
        };
        assert_eq!(apply_rule(&html, &rule), None);

        let broken = FieldRule {
            selector: "[[".into(),
            attr: None,
            regex: Some("(".into()),
            group: None,
        };
        assert_eq!(apply_rule(&html, &broken), None);
    }

    #[test]
    fn structured_data_beats_text_and_rules() {
        let body = r#"<html><head><script type="application/ld+json">
            {"@type":"Event","startDate":"2026-03-07","url":"entry.html"}
            </script></head><body><p>Updated 2025-12-01</p>
            <span class="status">Closed</span></body></html>"#;
        let config = ExtractionConfig::Selector {
            template: RuleTemplate {
                race_date: Some(FieldRule {
                    selector: "p".into(),
                    attr: None,
                    regex: None,
                    group: None,
                }),
                registration_status: Some(FieldRule {
                    selector: "span.status".into(),
                    attr: None,
                    regex: None,
                    group: None,
                }),
                ..Default::default()
            },
        };
        let extraction = Extractor.extract(body, PAGE_URL, &config);
        assert_eq!(extraction.race_date(), Some("2026-03-07"));
        assert_eq!(
            extraction.methods.race_date,
            Some(ExtractionMethod::StructuredData)
        );
        assert_eq!(
            extraction.fields.registration_url.as_deref(),
            Some("https://race.example.com/2026/entry.html")
        );
        assert_eq!(extraction.fields.registration_status.as_deref(), Some("Closed"));
        assert_eq!(
            extraction.methods.registration_status,
            Some(ExtractionMethod::Rule)
        );
    }

    #[test]
    fn falls_back_to_text_date() {
        let body = "<html><body><h1>大会概要</h1><p>開催日 2026年3月7日（土）</p></body></html>";
        let extraction = Extractor.extract(body, PAGE_URL, &ExtractionConfig::StructuredData);
        assert_eq!(extraction.race_date(), Some("2026-03-07"));
        assert_eq!(extraction.methods.race_date, Some(ExtractionMethod::Regex));
    }

    #[test]
    fn rules_fill_what_automatic_stages_miss() {
        let body = r#"<div><time datetime="2026-11-15">Nov 15</time></div>"#;
        let config = ExtractionConfig::Selector {
            template: RuleTemplate {
                race_date: Some(FieldRule {
                    selector: "time".into(),
                    attr: Some("datetime".into()),
                    regex: None,
                    group: None,
                }),
                ..Default::default()
            },
        };
        // The attribute value is not in the text stream, but the text date pattern
        // still scans the raw markup first.
        let extraction = Extractor.extract(body, PAGE_URL, &config);
        assert_eq!(extraction.race_date(), Some("2026-11-15"));

        let body = r#"<div><time data-day="15" data-when="Nov 15, 2026">soon</time></div>"#;
        let config = ExtractionConfig::Selector {
            template: RuleTemplate {
                race_date: Some(FieldRule {
                    selector: "time".into(),
                    attr: Some("data-when".into()),
                    regex: None,
                    group: None,
                }),
                ..Default::default()
            },
        };
        let extraction = Extractor.extract(body, PAGE_URL, &config);
        assert_eq!(extraction.race_date(), Some("2026-11-15"));
        assert_eq!(extraction.methods.race_date, Some(ExtractionMethod::Rule));
    }

    #[test]
    fn regex_only_ignores_structured_data() {
        let body = r#"<script type="application/ld+json">{"@type":"Event","startDate":"2026-03-07"}</script>
            <p>Race: 08.03.2026</p>"#;
        let config = ExtractionConfig::RegexOnly {
            rules: RegexTemplate {
                race_date: Some(RegexRule {
                    pattern: r"Race: (\d{2})\.(\d{2})\.(\d{4})".into(),
                    group: Some(0),
                }),
                ..Default::default()
            },
        };
        // Group 0 is "Race: 08.03.2026", which does not normalize.
        assert_eq!(Extractor.extract(body, PAGE_URL, &config).race_date(), None);

        let config = ExtractionConfig::RegexOnly {
            rules: RegexTemplate {
                registration_status: Some(RegexRule {
                    pattern: r"Entries (open|closed)".into(),
                    group: None,
                }),
                ..Default::default()
            },
        };
        let extraction = Extractor.extract("Entries closed today", PAGE_URL, &config);
        assert_eq!(extraction.fields.registration_status.as_deref(), Some("closed"));
        assert_eq!(extraction.race_date(), None);
    }

    #[test]
    fn year_of_normalized_date() {
        assert_eq!(date_year("2026-03-07"), Some(2026));
        assert_eq!(date_year("bogus"), None);
    }
}
