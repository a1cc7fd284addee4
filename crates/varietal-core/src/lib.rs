//! Core domain model for the variety catalog: discovered links, extracted
//! records and the persisted snapshot document.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "varietal-core";

/// `scraped_at` and the query layer's `*_at` fields use this layout.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Discovered but not yet visited catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantLinkRef {
    pub display_name: String,
    pub url: String,
    pub slug: String,
}

impl VariantLinkRef {
    pub fn new(display_name: impl Into<String>, url: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let slug = slugify(&display_name);
        Self {
            display_name,
            url: url.into(),
            slug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    #[serde(default)]
    pub alt: String,
}

/// Fully extracted variety page. Values are kept as the raw strings found on
/// the page; no unit conversion happens here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarietyRecord {
    pub name: String,
    pub url: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub characteristics: BTreeMap<String, String>,
    #[serde(default)]
    pub growing_info: BTreeMap<String, String>,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub raw_text: String,
    /// `raw_text` with one line per block element. Label values end at a line
    /// break, so re-extraction reads labels from here when it is present.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub block_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScrapingStats {
    #[serde(default)]
    pub total_time_seconds: f64,
    #[serde(default)]
    pub workers_used: usize,
    #[serde(default)]
    pub avg_time_per_variety: f64,
    #[serde(default)]
    pub failed_count: usize,
}

impl ScrapingStats {
    /// Average is taken over successful pages only and is 0 when none succeeded.
    pub fn compute(
        elapsed: Duration,
        workers_used: usize,
        succeeded: usize,
        failed: usize,
    ) -> Self {
        let total = elapsed.as_secs_f64();
        let avg = if succeeded == 0 {
            0.0
        } else {
            total / succeeded as f64
        };
        Self {
            total_time_seconds: round2(total),
            workers_used,
            avg_time_per_variety: round2(avg),
            failed_count: failed,
        }
    }
}

/// One complete harvest result. Replaces the previous document wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub varieties: Vec<VarietyRecord>,
    pub total_count: usize,
    pub scraped_at: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub scraping_stats: ScrapingStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SnapshotDocument {
    pub fn new(
        source: impl Into<String>,
        varieties: Vec<VarietyRecord>,
        stats: ScrapingStats,
    ) -> Self {
        Self {
            total_count: varieties.len(),
            varieties,
            scraped_at: now_timestamp(),
            source: source.into(),
            scraping_stats: stats,
            note: None,
        }
    }

    /// Valid outcome for a catalog that yielded no links.
    pub fn empty(source: impl Into<String>, workers_used: usize, note: impl Into<String>) -> Self {
        let mut doc = Self::new(
            source,
            Vec::new(),
            ScrapingStats {
                workers_used,
                ..ScrapingStats::default()
            },
        );
        doc.note = Some(note.into());
        doc
    }

    pub fn sort_by_slug(&mut self) {
        self.varieties.sort_by(|a, b| a.slug.cmp(&b.slug));
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn format_timestamp(at: DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Local::now())
}

/// Lower-cases and collapses every run of characters outside `[a-z0-9_-]`
/// into one `-`, trimming dashes at both ends. Idempotent.
pub fn slugify(display_name: &str) -> String {
    let lowered = display_name.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut in_run = false;
    for ch in lowered.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-' {
            slug.push(ch);
            in_run = false;
        } else if !in_run {
            slug.push('-');
            in_run = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Makes slugs unique in discovery order: the first keeps its slug, later
/// collisions get `-2`, `-3`, ... Empty slugs become `variety`.
pub fn disambiguate_slugs(links: &mut [VariantLinkRef]) {
    let mut seen: HashSet<String> = HashSet::with_capacity(links.len());
    for link in links.iter_mut() {
        if link.slug.is_empty() {
            link.slug = "variety".to_string();
        }
        if seen.insert(link.slug.clone()) {
            continue;
        }
        let base = link.slug.clone();
        let mut suffix = 2usize;
        loop {
            let candidate = format!("{base}-{suffix}");
            if seen.insert(candidate.clone()) {
                link.slug = candidate;
                break;
            }
            suffix += 1;
        }
    }
}

const REQUIRED_DOCUMENT_FIELDS: [&str; 3] = ["varieties", "total_count", "scraped_at"];
const REQUIRED_RECORD_FIELDS: [&str; 3] = ["name", "url", "slug"];

/// Checks the fields downstream consumers depend on. Returns the first problem found.
pub fn check_compatibility(value: &JsonValue) -> Result<(), String> {
    let Some(object) = value.as_object() else {
        return Err("document is not a JSON object".to_string());
    };
    let missing = REQUIRED_DOCUMENT_FIELDS
        .iter()
        .filter(|field| !object.contains_key(**field))
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(format!("missing fields: {}", missing.join(", ")));
    }

    let Some(varieties) = object.get("varieties").and_then(JsonValue::as_array) else {
        return Err("`varieties` is not an array".to_string());
    };
    let Some(total_count) = object.get("total_count").and_then(JsonValue::as_u64) else {
        return Err("`total_count` is not a non-negative integer".to_string());
    };
    if total_count as usize != varieties.len() {
        return Err(format!(
            "total_count={} but varieties has {} entries",
            total_count,
            varieties.len()
        ));
    }

    for (idx, variety) in varieties.iter().enumerate() {
        for field in REQUIRED_RECORD_FIELDS {
            let present = variety
                .get(field)
                .and_then(JsonValue::as_str)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false);
            if !present {
                return Err(format!("variety #{idx} is missing `{field}`"));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(slug: &str) -> VarietyRecord {
        VarietyRecord {
            name: slug.to_uppercase(),
            url: format!("https://example.test/tomato-varieties/{slug}"),
            slug: slug.to_string(),
            page_title: None,
            description: String::new(),
            characteristics: BTreeMap::new(),
            growing_info: BTreeMap::new(),
            images: Vec::new(),
            raw_text: String::new(),
            block_text: String::new(),
        }
    }

    #[test]
    fn slugify_collapses_runs_and_trims() {
        assert_eq!(slugify("Mr. Stripey"), "mr-stripey");
        assert_eq!(slugify("  A Grappoli D'Inverno "), "a-grappoli-d-inverno");
        assert_eq!(slugify("Cherokee Purple (heirloom)"), "cherokee-purple-heirloom");
        assert_eq!(slugify("Big_Boy-2"), "big_boy-2");
        assert_eq!(slugify("Brandywine, Sudduth's Strain"), "brandywine-sudduth-s-strain");
    }

    #[test]
    fn slugify_is_idempotent() {
        for name in ["Mr. Stripey", "Ça Va!", "--Odd--Name--", "Green Zebra", "Éva Purple Ball"] {
            let once = slugify(name);
            assert_eq!(slugify(&once), once, "not idempotent for {name:?}");
        }
    }

    #[test]
    fn colliding_slugs_get_numeric_suffixes() {
        let mut links = vec![
            VariantLinkRef::new("Green Zebra", "https://example.test/a"),
            VariantLinkRef::new("Green  Zebra!", "https://example.test/b"),
            VariantLinkRef::new("green-zebra", "https://example.test/c"),
            VariantLinkRef::new("???", "https://example.test/d"),
        ];
        disambiguate_slugs(&mut links);
        let slugs = links.iter().map(|l| l.slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, vec!["green-zebra", "green-zebra-2", "green-zebra-3", "variety"]);
    }

    #[test]
    fn average_is_zero_without_successes() {
        let stats = ScrapingStats::compute(Duration::from_millis(4_321), 8, 0, 12);
        assert_eq!(stats.avg_time_per_variety, 0.0);
        assert_eq!(stats.total_time_seconds, 4.32);
        assert_eq!(stats.failed_count, 12);
        assert!(stats.avg_time_per_variety.is_finite());
    }

    #[test]
    fn average_divides_by_successful_pages() {
        let stats = ScrapingStats::compute(Duration::from_secs(10), 4, 4, 1);
        assert_eq!(stats.avg_time_per_variety, 2.5);
        assert_eq!(stats.workers_used, 4);
    }

    #[test]
    fn snapshot_total_count_tracks_varieties() {
        let doc = SnapshotDocument::new(
            "https://example.test/tomato-varieties/",
            vec![record("b"), record("a")],
            ScrapingStats::default(),
        );
        assert_eq!(doc.total_count, doc.varieties.len());
        let value = serde_json::to_value(&doc).unwrap();
        assert!(check_compatibility(&value).is_ok());
        assert!(value.get("note").is_none());
        assert_eq!(value["scraped_at"].as_str().unwrap().len(), 19);
    }

    #[test]
    fn sort_by_slug_orders_records() {
        let mut doc = SnapshotDocument::new(
            "src",
            vec![record("c"), record("a"), record("b")],
            ScrapingStats::default(),
        );
        doc.sort_by_slug();
        let slugs = doc.varieties.iter().map(|v| v.slug.as_str()).collect::<Vec<_>>();
        assert_eq!(slugs, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_snapshot_carries_note() {
        let doc = SnapshotDocument::empty("src", 8, "no variety links discovered");
        assert_eq!(doc.total_count, 0);
        assert_eq!(doc.scraping_stats.workers_used, 8);
        assert_eq!(doc.note.as_deref(), Some("no variety links discovered"));
    }

    #[test]
    fn compatibility_reports_missing_and_drifting_fields() {
        let missing = serde_json::json!({ "varieties": [] });
        assert_eq!(
            check_compatibility(&missing).unwrap_err(),
            "missing fields: total_count, scraped_at"
        );

        let drift = serde_json::json!({
            "varieties": [{ "name": "A", "url": "u", "slug": "a" }],
            "total_count": 2,
            "scraped_at": "2026-01-01 00:00:00"
        });
        assert!(check_compatibility(&drift).unwrap_err().contains("total_count=2"));

        let no_slug = serde_json::json!({
            "varieties": [{ "name": "A", "url": "u", "slug": "" }],
            "total_count": 1,
            "scraped_at": "2026-01-01 00:00:00"
        });
        assert_eq!(check_compatibility(&no_slug).unwrap_err(), "variety #0 is missing `slug`");
    }

    #[test]
    fn older_documents_without_stats_still_deserialize() {
        let value = serde_json::json!({
            "varieties": [{ "name": "A", "url": "u", "slug": "a" }],
            "total_count": 1,
            "scraped_at": "2026-01-01 00:00:00"
        });
        let doc: SnapshotDocument = serde_json::from_value(value).unwrap();
        assert_eq!(doc.varieties[0].description, "");
        assert_eq!(doc.scraping_stats, ScrapingStats::default());
    }
}
