use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};
use url::Url;
use varietal_core::VariantLinkRef;
use varietal_storage::PageSource;

use crate::{element_text, select_region, static_selector, DiscoveryError, ANCHOR};

static REGION_SELECTORS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    ["main", "div.content", "div#content"]
        .into_iter()
        .map(static_selector)
        .collect()
});

static CONTAINERS: LazyLock<Selector> =
    LazyLock::new(|| static_selector("ul, ol, div, table, section"));

static WORD_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9\s\-'.]+$").expect("word-like link text pattern")
});

const SKIP_TERMS: &[&str] = &[
    "home", "contact", "about", "search", "menu", "login", "register", "privacy", "terms",
    "sitemap", "rss", "feed", "mailto:", "tel:", "javascript:", "#", "pdf", ".pdf",
    "universitywide", "new brunswick", "school of", "experiment station", "rutgers", "njaes",
    "extension", "faculty", "staff", "directory", "programs", "research", "news", "events",
    "calendar", "publications", "resources", "links", "sebs", "agricultural",
    "biological sciences", "environmental", "new jersey",
];

const FALLBACK_EXCLUDED_TERMS: &[&str] =
    &["university", "rutgers", "new jersey", "school", "extension"];

const NON_PAGE_PREFIXES: &[&str] = &["mailto:", "tel:", "javascript:", "#"];

const BLOCKED_EXTENSIONS: &[&str] = &[".jpg", ".png", ".gif", ".pdf", ".doc", ".docx"];

fn owned(terms: &[&str]) -> Vec<String> {
    terms.iter().map(|t| t.to_string()).collect()
}

/// Knobs for the two discovery passes. Terms are matched lower-case.
#[derive(Debug, Clone)]
pub struct DiscoveryRules {
    /// A container qualifies when its text mentions one of these...
    pub container_terms: Vec<String>,
    /// ...or holds more than this many links.
    pub container_min_links: usize,
    pub min_text_len: usize,
    pub max_text_len: usize,
    /// Denylist checked against both link text and raw href.
    pub skip_terms: Vec<String>,
    pub blocked_extensions: Vec<String>,
    /// An accepted URL contains one of these or sits under the catalog root.
    pub url_terms: Vec<String>,
    pub fallback_enabled: bool,
    pub fallback_max_text_len: usize,
    pub fallback_excluded_terms: Vec<String>,
    pub fallback_href_term: String,
}

impl Default for DiscoveryRules {
    fn default() -> Self {
        Self {
            container_terms: owned(&["varieties", "tomato"]),
            container_min_links: 3,
            min_text_len: 3,
            max_text_len: 50,
            skip_terms: owned(SKIP_TERMS),
            blocked_extensions: owned(BLOCKED_EXTENSIONS),
            url_terms: owned(&["tomato", "varieties"]),
            fallback_enabled: true,
            fallback_max_text_len: 40,
            fallback_excluded_terms: owned(FALLBACK_EXCLUDED_TERMS),
            fallback_href_term: "varieties".to_string(),
        }
    }
}

/// Fetch the catalog root and list its variety links. Never fails: fetch or
/// parse problems are logged and yield an empty list.
pub async fn discover(
    source: &dyn PageSource,
    catalog_root_url: &str,
    timeout: Duration,
    rules: &DiscoveryRules,
) -> Vec<VariantLinkRef> {
    match try_discover(source, catalog_root_url, timeout, rules).await {
        Ok(links) => links,
        Err(err) => {
            warn!(url = catalog_root_url, error = %err, "catalog discovery failed");
            Vec::new()
        }
    }
}

pub async fn try_discover(
    source: &dyn PageSource,
    catalog_root_url: &str,
    timeout: Duration,
    rules: &DiscoveryRules,
) -> Result<Vec<VariantLinkRef>, DiscoveryError> {
    let root = Url::parse(catalog_root_url).map_err(|err| DiscoveryError::InvalidRoot {
        url: catalog_root_url.to_string(),
        reason: err.to_string(),
    })?;
    info!(url = %root, "fetching catalog root");
    let html = source.fetch_text(root.as_str(), timeout).await?;
    let links = links_from_html(&root, &html, rules);
    info!(count = links.len(), "discovered variety links");
    if let Some(first) = links.first() {
        debug!(name = %first.display_name, url = %first.url, "first discovered link");
    }
    Ok(links)
}

/// Both discovery passes over an already-fetched catalog page.
pub fn links_from_html(root: &Url, html: &str, rules: &DiscoveryRules) -> Vec<VariantLinkRef> {
    let document = Html::parse_document(html);
    let region = select_region(&document, &REGION_SELECTORS);

    let mut collector = LinkCollector::new(root);
    for container in candidate_containers(region, rules) {
        for anchor in container.select(&ANCHOR) {
            collector.consider_primary(anchor, rules);
        }
    }

    if collector.links.is_empty() && rules.fallback_enabled {
        debug!("container pass found nothing; scanning every link on the page");
        for anchor in document.select(&ANCHOR) {
            collector.consider_fallback(anchor, rules);
        }
    }

    collector.links
}

fn candidate_containers<'a>(region: ElementRef<'a>, rules: &DiscoveryRules) -> Vec<ElementRef<'a>> {
    let containers = region
        .select(&CONTAINERS)
        .filter(|container| {
            let text = container.text().collect::<String>().to_lowercase();
            rules.container_terms.iter().any(|term| text.contains(term.as_str()))
                || container.select(&ANCHOR).count() > rules.container_min_links
        })
        .collect::<Vec<_>>();
    if containers.is_empty() {
        vec![region]
    } else {
        containers
    }
}

struct LinkCollector<'r> {
    root: &'r Url,
    seen: HashSet<String>,
    links: Vec<VariantLinkRef>,
}

impl<'r> LinkCollector<'r> {
    fn new(root: &'r Url) -> Self {
        Self {
            root,
            seen: HashSet::new(),
            links: Vec::new(),
        }
    }

    fn consider_primary(&mut self, anchor: ElementRef<'_>, rules: &DiscoveryRules) {
        let href = anchor.value().attr("href").unwrap_or_default().trim();
        let text = element_text(anchor);
        let text_len = text.chars().count();
        if text_len < rules.min_text_len || text_len > rules.max_text_len {
            return;
        }

        let text_lower = text.to_lowercase();
        let href_lower = href.to_lowercase();
        if rules
            .skip_terms
            .iter()
            .any(|term| text_lower.contains(term.as_str()) || href_lower.contains(term.as_str()))
        {
            return;
        }
        if NON_PAGE_PREFIXES.iter().any(|p| href_lower.starts_with(p))
            || rules
                .blocked_extensions
                .iter()
                .any(|ext| href_lower.ends_with(ext.as_str()))
        {
            return;
        }

        let Ok(resolved) = self.root.join(href) else {
            return;
        };
        let resolved_lower = resolved.as_str().to_lowercase();
        let in_scope = rules
            .url_terms
            .iter()
            .any(|term| resolved_lower.contains(term.as_str()))
            || resolved.as_str().starts_with(self.root.as_str());
        if in_scope {
            self.push(text, resolved);
        }
    }

    fn consider_fallback(&mut self, anchor: ElementRef<'_>, rules: &DiscoveryRules) {
        let href = anchor.value().attr("href").unwrap_or_default().trim();
        let text = element_text(anchor);
        let text_len = text.chars().count();
        if text_len < rules.min_text_len
            || text_len > rules.fallback_max_text_len
            || !WORD_LIKE.is_match(&text)
        {
            return;
        }
        let text_lower = text.to_lowercase();
        if rules
            .fallback_excluded_terms
            .iter()
            .any(|term| text_lower.contains(term.as_str()))
            || !href.to_lowercase().contains(&rules.fallback_href_term)
        {
            return;
        }
        if let Ok(resolved) = self.root.join(href) {
            self.push(text, resolved);
        }
    }

    fn push(&mut self, display_name: String, url: Url) {
        if url == *self.root || !self.seen.insert(url.to_string()) {
            return;
        }
        self.links.push(VariantLinkRef::new(display_name, url.to_string()));
    }
}
