use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use url::Url;
use varietal_core::{ImageRef, VarietyRecord};
use varietal_storage::PageSource;

use crate::{collapse_whitespace, element_text, select_region, static_selector, ExtractionError};

/// Tried in order to find the main content of a variety page.
pub const CONTENT_SELECTORS: [&str; 8] = [
    "main",
    ".main-content",
    "#main-content",
    ".content",
    "#content",
    "article",
    ".article",
    ".post-content",
];

/// `<Label>: value` facts looked for in the page text.
pub const CHARACTERISTIC_LABELS: [&str; 14] = [
    "Tomato Type",
    "Breed",
    "Origin",
    "Season",
    "Leaf Type",
    "Plant Type",
    "Plant Height",
    "Fruit Size",
    "Fruit Shape",
    "Skin Color",
    "Flesh Color",
    "Taste",
    "Comments",
    "Days to Maturity",
];

/// Characteristic key -> growing_info key.
pub const GROWING_INFO_ALIASES: [(&str, &str); 6] = [
    ("plant type", "plant_type"),
    ("plant height", "plant_height"),
    ("fruit size", "fruit_size"),
    ("fruit shape", "fruit_shape"),
    ("days to maturity", "days_to_maturity"),
    ("season", "season"),
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "head"];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main",
    "nav", "ol", "p", "pre", "section", "table", "tbody", "thead", "tfoot", "tr", "ul",
];

const PLACEHOLDER_VALUES: &[&str] = &["n/a", "-"];

static CONTENT: LazyLock<Vec<Selector>> =
    LazyLock::new(|| CONTENT_SELECTORS.into_iter().map(static_selector).collect());
static TITLE: LazyLock<Selector> = LazyLock::new(|| static_selector("title"));
static TABLE_ROWS: LazyLock<Selector> = LazyLock::new(|| static_selector("table tr"));
static PARAGRAPHS: LazyLock<Selector> = LazyLock::new(|| static_selector("p"));
static IMAGES: LazyLock<Selector> = LazyLock::new(|| static_selector("img[src]"));

static LABEL_PATTERNS: LazyLock<Vec<(String, Regex)>> = LazyLock::new(|| {
    CHARACTERISTIC_LABELS
        .iter()
        .map(|label| {
            let pattern = format!(r"(?im)\b{}\s*:\s*([^\n\r]+)", regex::escape(label));
            (
                label.to_lowercase(),
                Regex::new(&pattern).expect("characteristic label pattern"),
            )
        })
        .collect()
});

/// Any known label; cuts a value short when labels share one line.
static ANY_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives = CHARACTERISTIC_LABELS
        .iter()
        .map(|label| regex::escape(label))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{alternatives})\s*:")).expect("label boundary pattern")
});

static DAYS_TO_MATURITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*days?\s*(?:to\s*)?(?:maturity|harvest)").expect("maturity pattern")
});

static FRUIT_WEIGHT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:\.\d+)?\s*(?:ounces?|oz|pounds?|lbs?|grams?|g)\b").expect("weight pattern")
});

/// Which extraction strategies run. All are on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractorSet {
    pub tables: bool,
    pub labels: bool,
    pub derived: bool,
    pub aliases: bool,
    pub description: bool,
    pub images: bool,
}

impl Default for ExtractorSet {
    fn default() -> Self {
        Self {
            tables: true,
            labels: true,
            derived: true,
            aliases: true,
            description: true,
            images: true,
        }
    }
}

/// One parsed page plus its flattened text. Extractors only read from it.
pub struct PageContext<'a> {
    pub page_url: &'a Url,
    pub document: &'a Html,
    pub region: ElementRef<'a>,
    /// Whitespace-normalized text of the region on one line.
    pub raw_text: String,
    /// Same text with one line per block element.
    pub block_text: String,
}

impl<'a> PageContext<'a> {
    pub fn new(page_url: &'a Url, document: &'a Html) -> Self {
        let region = select_region(document, &CONTENT);
        let mut flat = Flattened::default();
        flat.walk(region);
        flat.break_line();
        Self {
            page_url,
            document,
            region,
            raw_text: collapse_whitespace(&flat.pieces.join(" ")),
            block_text: flat.lines.join("\n"),
        }
    }

    pub fn page_title(&self) -> Option<String> {
        self.document
            .select(&TITLE)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
    }

    /// Two-cell rows: lower-cased first cell -> second cell.
    pub fn table_characteristics(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for row in self.region.select(&TABLE_ROWS) {
            let cells = row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|cell| matches!(cell.value().name(), "td" | "th"))
                .collect::<Vec<_>>();
            let [label, value] = cells.as_slice() else {
                continue;
            };
            let key = element_text(*label).to_lowercase();
            let value = element_text(*value);
            if !key.is_empty() && !value.is_empty() {
                out.insert(key, value);
            }
        }
        out
    }

    pub fn label_characteristics(&self) -> BTreeMap<String, String> {
        label_characteristics(&self.block_text)
    }

    pub fn derived_growing_info(&self) -> BTreeMap<String, String> {
        derived_growing_info(&self.raw_text)
    }

    /// First three non-empty paragraphs of the region.
    pub fn description(&self) -> String {
        self.region
            .select(&PARAGRAPHS)
            .map(element_text)
            .filter(|p| !p.is_empty())
            .take(3)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn images(&self) -> Vec<ImageRef> {
        self.region
            .select(&IMAGES)
            .filter_map(|img| {
                let src = img.value().attr("src")?.trim();
                if src.is_empty() {
                    return None;
                }
                let url = self.page_url.join(src).ok()?;
                Some(ImageRef {
                    url: url.to_string(),
                    alt: img.value().attr("alt").unwrap_or_default().to_string(),
                })
            })
            .collect()
    }
}

#[derive(Default)]
struct Flattened {
    pieces: Vec<String>,
    lines: Vec<String>,
    current: String,
}

impl Flattened {
    fn walk(&mut self, element: ElementRef<'_>) {
        for child in element.children() {
            if let Some(child_el) = ElementRef::wrap(child) {
                let name = child_el.value().name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    self.break_line();
                }
                self.walk(child_el);
                if block {
                    self.break_line();
                }
            } else if let Node::Text(text) = child.value() {
                let piece = collapse_whitespace(text);
                if piece.is_empty() {
                    continue;
                }
                if !self.current.is_empty() {
                    self.current.push(' ');
                }
                self.current.push_str(&piece);
                self.pieces.push(piece);
            }
        }
    }

    fn break_line(&mut self) {
        if !self.current.is_empty() {
            self.lines.push(std::mem::take(&mut self.current));
        }
    }
}

/// `<Label>: value` pairs keyed by the lower-cased label. Placeholder values are dropped.
fn label_characteristics(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, pattern) in LABEL_PATTERNS.iter() {
        let Some(captures) = pattern.captures(text) else {
            continue;
        };
        let mut value = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        if let Some(next_label) = ANY_LABEL.find(value) {
            value = &value[..next_label.start()];
        }
        let value = collapse_whitespace(value);
        if value.is_empty()
            || PLACEHOLDER_VALUES
                .iter()
                .any(|p| value.eq_ignore_ascii_case(p))
        {
            continue;
        }
        out.insert(key.clone(), value);
    }
    out
}

fn derived_growing_info(raw_text: &str) -> BTreeMap<String, String> {
    let text = raw_text.to_lowercase();
    let mut out = BTreeMap::new();

    if let Some(days) = DAYS_TO_MATURITY.captures(&text).and_then(|c| c.get(1)) {
        out.insert("days_to_maturity".to_string(), days.as_str().to_string());
    }

    if text.contains("indeterminate") {
        out.insert("plant_type".to_string(), "indeterminate".to_string());
    } else if text.contains("determinate") {
        out.insert("plant_type".to_string(), "determinate".to_string());
    }

    if let Some(weight) = FRUIT_WEIGHT.find(&text) {
        out.insert("fruit_weight".to_string(), weight.as_str().to_string());
    }

    out
}

fn apply_aliases(
    characteristics: &BTreeMap<String, String>,
    growing_info: &mut BTreeMap<String, String>,
) {
    for (characteristic, growing_key) in GROWING_INFO_ALIASES {
        if let Some(value) = characteristics.get(characteristic) {
            growing_info.insert(growing_key.to_string(), value.clone());
        }
    }
}

/// Build a record from fetched HTML. `slug` is left empty for the caller to fill.
pub fn extract_from_html(
    page_url: &str,
    display_name: &str,
    html: &str,
    extractors: ExtractorSet,
) -> Result<VarietyRecord, ExtractionError> {
    let url = Url::parse(page_url).map_err(|err| ExtractionError::Parse {
        url: page_url.to_string(),
        reason: format!("invalid page url: {err}"),
    })?;
    let document = Html::parse_document(html);
    let ctx = PageContext::new(&url, &document);

    let mut characteristics = if extractors.tables {
        ctx.table_characteristics()
    } else {
        BTreeMap::new()
    };
    if extractors.labels {
        for (key, value) in ctx.label_characteristics() {
            characteristics.entry(key).or_insert(value);
        }
    }

    let mut growing_info = if extractors.derived {
        ctx.derived_growing_info()
    } else {
        BTreeMap::new()
    };
    if extractors.aliases {
        apply_aliases(&characteristics, &mut growing_info);
    }

    Ok(VarietyRecord {
        name: display_name.to_string(),
        url: page_url.to_string(),
        slug: String::new(),
        page_title: ctx.page_title(),
        description: if extractors.description {
            ctx.description()
        } else {
            String::new()
        },
        characteristics,
        growing_info,
        images: if extractors.images { ctx.images() } else { Vec::new() },
        raw_text: ctx.raw_text,
        block_text: ctx.block_text,
    })
}

/// Fetch one variety page and extract it. Never panics on page content.
pub async fn extract_variety(
    source: &dyn PageSource,
    page_url: &str,
    display_name: &str,
    timeout: Duration,
    extractors: ExtractorSet,
) -> Result<VarietyRecord, ExtractionError> {
    let html = source
        .fetch_text(page_url, timeout)
        .await
        .map_err(|source| ExtractionError::Network {
            url: page_url.to_string(),
            source,
        })?;
    extract_from_html(page_url, display_name, &html, extractors)
}

/// Re-run the text strategies over a record's retained page text. Existing
/// characteristics win over re-extracted ones; growing info is rebuilt.
///
/// Labels read `block_text` so a value stops at the end of its block. Records
/// from snapshots written without it fall back to the flat `raw_text`.
pub fn reextract_text_fields(record: &mut VarietyRecord, extractors: ExtractorSet) {
    if extractors.labels {
        let text = if record.block_text.is_empty() {
            &record.raw_text
        } else {
            &record.block_text
        };
        for (key, value) in label_characteristics(text) {
            record.characteristics.entry(key).or_insert(value);
        }
    }
    let mut growing_info = if extractors.derived {
        derived_growing_info(&record.raw_text)
    } else {
        BTreeMap::new()
    };
    if extractors.aliases {
        apply_aliases(&record.characteristics, &mut growing_info);
    }
    record.growing_info = growing_info;
}

#[cfg(test)]
mod tests {
    use super::*;
    use varietal_storage::StaticPages;

    const PAGE_URL: &str = "https://njaes.example.edu/tomato-varieties/a-grappoli-d-inverno/";

    const VARIETY_PAGE: &str = r#"
        <html>
          <head><title> A Grappoli D'Inverno | Tomato Varieties </title>
            <script>var tracking = "Origin: Nowhere";</script></head>
          <body>
            <nav>Home Tomato Varieties</nav>
            <main>
              <h1>A Grappoli D'Inverno</h1>
              <p>A cherry version of <em>Green Zebra</em>.</p>
              <p>   </p>
              <p>Winter grape type.</p>
              <p>Stores well.</p>
              <p>Fourth paragraph is ignored.</p>
              <table>
                <tr><th>Plant Type</th><td>Indeterminate</td></tr>
                <tr><td>Origin</td><td> Italy </td></tr>
                <tr><td>Only one cell</td></tr>
                <tr><td></td><td>orphan</td></tr>
              </table>
              <div class="facts">
                Tomato Type: Heirloom<br>
                Plant Type: Semi-Determinate<br>
                Fruit Size: 1 oz.<br>
                Skin Color: N/A<br>
                Comments:   Roma/grape   (winter grape).<br>
              </div>
              <img src="/images/grappoli.jpg" alt="Cluster on the vine">
              <img src="thumb.png">
              <img src="  ">
            </main>
          </body>
        </html>
    "#;

    fn extract(html: &str) -> VarietyRecord {
        extract_from_html(PAGE_URL, "A Grappoli D'Inverno", html, ExtractorSet::default()).unwrap()
    }

    #[test]
    fn table_rows_become_lowercase_characteristics() {
        let record = extract(VARIETY_PAGE);
        assert_eq!(record.characteristics["plant type"], "Indeterminate");
        assert_eq!(record.characteristics["origin"], "Italy");
        assert!(!record.characteristics.contains_key("only one cell"));
        assert!(record.characteristics.keys().all(|k| *k == k.to_lowercase()));
    }

    #[test]
    fn label_lines_complement_but_do_not_override_tables() {
        let record = extract(VARIETY_PAGE);
        assert_eq!(record.characteristics["tomato type"], "Heirloom");
        assert_eq!(record.characteristics["comments"], "Roma/grape (winter grape).");
        assert_eq!(record.characteristics["fruit size"], "1 oz.");
        assert!(!record.characteristics.contains_key("skin color"));
        // table value wins over "Semi-Determinate"
        assert_eq!(record.characteristics["plant type"], "Indeterminate");
    }

    #[test]
    fn growing_info_combines_patterns_and_aliases() {
        let record = extract(VARIETY_PAGE);
        assert_eq!(record.growing_info["plant_type"], "Indeterminate");
        assert_eq!(record.growing_info["fruit_size"], "1 oz.");
        assert_eq!(record.growing_info["fruit_weight"], "1 oz");
        assert!(!record.growing_info.contains_key("days_to_maturity"));
    }

    #[test]
    fn description_title_and_images() {
        let record = extract(VARIETY_PAGE);
        assert_eq!(
            record.description,
            "A cherry version of Green Zebra. Winter grape type. Stores well."
        );
        assert_eq!(
            record.page_title.as_deref(),
            Some("A Grappoli D'Inverno | Tomato Varieties")
        );
        assert_eq!(
            record.images,
            vec![
                ImageRef {
                    url: "https://njaes.example.edu/images/grappoli.jpg".to_string(),
                    alt: "Cluster on the vine".to_string(),
                },
                ImageRef {
                    url: "https://njaes.example.edu/tomato-varieties/a-grappoli-d-inverno/thumb.png"
                        .to_string(),
                    alt: String::new(),
                },
            ]
        );
        assert_eq!(record.slug, "");
        assert_eq!(record.name, "A Grappoli D'Inverno");
    }

    #[test]
    fn raw_text_is_flat_and_limited_to_the_content_region() {
        let record = extract(VARIETY_PAGE);
        assert!(record
            .raw_text
            .starts_with("A Grappoli D'Inverno A cherry version of Green Zebra ."));
        assert!(!record.raw_text.contains("Home Tomato Varieties"));
        assert!(!record.raw_text.contains("tracking"));
        assert!(!record.raw_text.contains('\n'));
        assert!(!record.raw_text.contains("  "));
    }

    #[test]
    fn adjacent_blocks_keep_word_boundaries() {
        let record = extract("<main><div>Red</div><div>Ripe</div><span>Sweet</span></main>");
        assert_eq!(record.raw_text, "Red Ripe Sweet");
    }

    #[test]
    fn days_to_maturity_label_feeds_growing_info() {
        let record = extract("<body><p>Days to Maturity: 75</p></body>");
        assert_eq!(record.characteristics["days to maturity"], "75");
        assert_eq!(record.growing_info["days_to_maturity"], "75");
    }

    #[test]
    fn derived_patterns_read_free_text() {
        let record = extract(
            "<article><p>Ready in 68 days to harvest. Fruits weigh about 2.5 oz each. \
             A vigorous indeterminate vine.</p></article>",
        );
        assert_eq!(record.growing_info["days_to_maturity"], "68");
        assert_eq!(record.growing_info["fruit_weight"], "2.5 oz");
        assert_eq!(record.growing_info["plant_type"], "indeterminate");

        let determinate = extract("<main><p>Compact determinate bush.</p></main>");
        assert_eq!(determinate.growing_info["plant_type"], "determinate");
    }

    #[test]
    fn labels_on_one_line_are_split_at_the_next_label() {
        let record = extract("<main><p>Origin: Russia Season: Early Leaf Type: Potato</p></main>");
        assert_eq!(record.characteristics["origin"], "Russia");
        assert_eq!(record.characteristics["season"], "Early");
        assert_eq!(record.characteristics["leaf type"], "Potato");
        assert_eq!(record.growing_info["season"], "Early");
    }

    #[test]
    fn bare_pages_still_produce_a_record() {
        let record = extract("<html><body></body></html>");
        assert!(record.characteristics.is_empty());
        assert!(record.growing_info.is_empty());
        assert_eq!(record.description, "");
        assert_eq!(record.raw_text, "");
    }

    #[test]
    fn strategies_can_be_switched_off() {
        let only_tables = ExtractorSet {
            labels: false,
            derived: false,
            aliases: false,
            description: false,
            images: false,
            ..ExtractorSet::default()
        };
        let record = extract_from_html(PAGE_URL, "x", VARIETY_PAGE, only_tables).unwrap();
        assert_eq!(record.characteristics.len(), 2);
        assert!(record.growing_info.is_empty());
        assert!(record.images.is_empty());
        assert_eq!(record.description, "");
    }

    #[test]
    fn invalid_page_url_is_a_parse_failure() {
        let err = extract_from_html("relative/page", "x", "<p></p>", ExtractorSet::default())
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Parse { .. }));
        assert_eq!(err.url(), "relative/page");
    }

    #[test]
    fn retained_raw_text_can_be_reextracted() {
        let mut record = extract(VARIETY_PAGE);
        record.characteristics.clear();
        record.growing_info.clear();

        reextract_text_fields(&mut record, ExtractorSet::default());
        assert_eq!(record.characteristics["tomato type"], "Heirloom");
        assert_eq!(record.characteristics["plant type"], "Semi-Determinate");
        assert_eq!(record.growing_info["plant_type"], "Semi-Determinate");
        assert_eq!(record.growing_info["fruit_weight"], "1 oz");
    }

    #[test]
    fn reextraction_keeps_label_values_within_their_block() {
        let html = "<main><p>Days to Maturity: 75</p><p>Great for sauce and canning.</p></main>";
        let mut record = extract_from_html(PAGE_URL, "x", html, ExtractorSet::default()).unwrap();
        assert_eq!(record.characteristics["days to maturity"], "75");
        assert_eq!(record.block_text, "Days to Maturity: 75\nGreat for sauce and canning.");

        record.characteristics.clear();
        record.growing_info.clear();
        reextract_text_fields(&mut record, ExtractorSet::default());
        assert_eq!(record.characteristics["days to maturity"], "75");
        assert_eq!(record.growing_info["days_to_maturity"], "75");
    }

    #[test]
    fn records_without_block_text_reextract_from_raw_text() {
        let mut record = extract(VARIETY_PAGE);
        record.block_text.clear();
        record.characteristics.clear();

        reextract_text_fields(&mut record, ExtractorSet::default());
        assert_eq!(record.characteristics["tomato type"], "Heirloom");
        assert_eq!(record.characteristics["fruit size"], "1 oz.");
    }

    #[tokio::test]
    async fn fetch_failures_are_network_errors() {
        let pages = StaticPages::new();
        let err = extract_variety(
            &pages,
            PAGE_URL,
            "x",
            Duration::from_secs(15),
            ExtractorSet::default(),
        )
        .await
        .unwrap_err();
        assert!(err.is_network());
        assert_eq!(err.url(), PAGE_URL);
    }

    #[tokio::test]
    async fn fetched_pages_are_extracted() {
        let pages = StaticPages::new().with_page(PAGE_URL, VARIETY_PAGE);
        let record = extract_variety(
            &pages,
            PAGE_URL,
            "A Grappoli",
            Duration::from_secs(15),
            ExtractorSet::default(),
        )
        .await
        .unwrap();
        assert_eq!(record.url, PAGE_URL);
        assert_eq!(record.characteristics["origin"], "Italy");
    }
}
