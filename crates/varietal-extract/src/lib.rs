//! Catalog link discovery and variety page extraction.
//!
//! Both halves are heuristic: the catalog site has no structural contract, so
//! discovery tries a container-based pass before a looser fallback, and page
//! extraction runs independent strategies over one parsed [`PageContext`].

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use varietal_storage::FetchError;

mod discovery;
mod page;

pub use discovery::{discover, links_from_html, try_discover, DiscoveryRules};
pub use page::{
    extract_from_html, extract_variety, reextract_text_fields, ExtractorSet, PageContext,
    CHARACTERISTIC_LABELS, CONTENT_SELECTORS, GROWING_INFO_ALIASES,
};

pub const CRATE_NAME: &str = "varietal-extract";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid catalog root url {url}: {reason}")]
    InvalidRoot { url: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("fetching {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("extracting {url} failed: {reason}")]
    Parse { url: String, reason: String },
}

impl ExtractionError {
    pub fn url(&self) -> &str {
        match self {
            Self::Network { url, .. } | Self::Parse { url, .. } => url,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

pub(crate) fn static_selector(css: &'static str) -> Selector {
    Selector::parse(css).unwrap_or_else(|err| panic!("invalid built-in selector {css:?}: {err}"))
}

pub(crate) static ANCHOR: LazyLock<Selector> = LazyLock::new(|| static_selector("a[href]"));

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible text of an element with whitespace collapsed.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

/// First match of `selectors` in order, else `<body>`, else the document root.
pub(crate) fn select_region<'a>(document: &'a Html, selectors: &[Selector]) -> ElementRef<'a> {
    static BODY: LazyLock<Selector> = LazyLock::new(|| static_selector("body"));
    selectors
        .iter()
        .find_map(|sel| document.select(sel).next())
        .or_else(|| document.select(&BODY).next())
        .unwrap_or_else(|| document.root_element())
}
