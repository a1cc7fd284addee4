use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;
use varietal_core::{SnapshotDocument, VarietyRecord};

/// How many times each key occurs across `maps`.
pub fn key_frequencies<'a>(
    maps: impl IntoIterator<Item = &'a BTreeMap<String, String>>,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for map in maps {
        for key in map.keys() {
            *counts.entry(key.clone()).or_insert(0) += 1;
        }
    }
    counts
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RichestRecord {
    pub name: String,
    pub characteristics: usize,
    pub growing_info: usize,
}

/// Coverage summary of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub total: usize,
    pub failed_count: usize,
    pub with_characteristics: usize,
    pub with_growing_info: usize,
    pub with_images: usize,
    pub with_description: usize,
    pub top_characteristics: Vec<(String, usize)>,
    pub top_growing_info: Vec<(String, usize)>,
    pub richest: Option<RichestRecord>,
}

impl QualityReport {
    pub fn from_document(document: &SnapshotDocument, top_n: usize) -> Self {
        let varieties = &document.varieties;
        let count = |pred: fn(&VarietyRecord) -> bool| varieties.iter().filter(|v| pred(v)).count();

        // first record wins ties
        let richest = varieties
            .iter()
            .map(|v| (v.characteristics.len() + v.growing_info.len(), v))
            .filter(|(score, _)| *score > 0)
            .fold(None::<(usize, &VarietyRecord)>, |best, (score, v)| match best {
                Some((best_score, _)) if best_score >= score => best,
                _ => Some((score, v)),
            })
            .map(|(_, v)| RichestRecord {
                name: v.name.clone(),
                characteristics: v.characteristics.len(),
                growing_info: v.growing_info.len(),
            });

        Self {
            total: varieties.len(),
            failed_count: document.scraping_stats.failed_count,
            with_characteristics: count(|v| !v.characteristics.is_empty()),
            with_growing_info: count(|v| !v.growing_info.is_empty()),
            with_images: count(|v| !v.images.is_empty()),
            with_description: count(|v| !v.description.trim().is_empty()),
            top_characteristics: top_keys(
                key_frequencies(varieties.iter().map(|v| &v.characteristics)),
                top_n,
            ),
            top_growing_info: top_keys(
                key_frequencies(varieties.iter().map(|v| &v.growing_info)),
                top_n,
            ),
            richest,
        }
    }

    pub fn percent(&self, count: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            count as f64 * 100.0 / self.total as f64
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "records: {} ({} failed pages)", self.total, self.failed_count);
        for (label, count) in [
            ("with characteristics", self.with_characteristics),
            ("with growing info", self.with_growing_info),
            ("with images", self.with_images),
            ("with description", self.with_description),
        ] {
            let _ = writeln!(
                out,
                "  {label}: {count}/{} ({:.1}%)",
                self.total,
                self.percent(count)
            );
        }
        for (heading, keys) in [
            ("characteristic keys", &self.top_characteristics),
            ("growing info keys", &self.top_growing_info),
        ] {
            let _ = writeln!(out, "most common {heading}:");
            for (key, count) in keys {
                let _ = writeln!(out, "  {key}: {count} ({:.1}%)", self.percent(*count));
            }
        }
        if let Some(richest) = &self.richest {
            let _ = writeln!(
                out,
                "richest record: {} ({} characteristics, {} growing info)",
                richest.name, richest.characteristics, richest.growing_info
            );
        }
        out
    }
}

fn top_keys(counts: BTreeMap<String, usize>, top_n: usize) -> Vec<(String, usize)> {
    let mut keys = counts.into_iter().collect::<Vec<_>>();
    // stable: equal counts stay alphabetical
    keys.sort_by(|a, b| b.1.cmp(&a.1));
    keys.truncate(top_n);
    keys
}
