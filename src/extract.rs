use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use crate::error::ScrapeError;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static TABLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").unwrap());
static THEAD_TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("thead tr").unwrap());
static TBODY_TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tbody tr").unwrap());
static TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static TH_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").unwrap());
static TD_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static ANCHOR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());

/// Header synthesized for a row-label column that has no real header of its
/// own (e.g. the "Particulars" column of a financial statement).
pub const CATEGORY_HEADER: &str = "Category";

/// Payload of one extracted fragment: a flat key/value mapping for list
/// fragments, or an ordered row sequence for table-shaped fragments.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentData {
    Items(BTreeMap<String, String>),
    Rows(Vec<BTreeMap<String, String>>),
}

impl FragmentData {
    pub fn is_empty(&self) -> bool {
        match self {
            FragmentData::Items(m) => m.is_empty(),
            FragmentData::Rows(r) => r.is_empty(),
        }
    }

    /// JSON form: `{}`-style object for Items, array of objects for Rows.
    /// Empty fragments serialize to empty containers, never to null.
    pub fn to_json(&self) -> Value {
        fn object(map: &BTreeMap<String, String>) -> Value {
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )
        }
        match self {
            FragmentData::Items(m) => object(m),
            FragmentData::Rows(rows) => Value::Array(rows.iter().map(object).collect()),
        }
    }
}

enum FragmentShape {
    /// A `<table>` (or a container holding one). Headers come from
    /// `thead tr th`, falling back to the first `tr`; body rows from
    /// `tbody tr`, falling back to every `tr` after the header.
    Table { container: Selector, label_column: bool },
    /// Key/value pairs inside repeating list items.
    List {
        container: Selector,
        item: Selector,
        key: Selector,
        value: Selector,
    },
    /// A list of document links: each item becomes `{label_key: text, "url": href}`.
    DocumentLinks {
        container: Selector,
        item: Selector,
        label: Option<Selector>,
        label_key: String,
    },
}

/// One named, independently extractable region of a page. Selectors are
/// validated at construction, so extraction itself cannot fail on bad config.
pub struct FragmentDescriptor {
    name: String,
    shape: FragmentShape,
}

fn parse_selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::Config(format!("bad selector '{}': {}", css, e)))
}

impl FragmentDescriptor {
    pub fn table(name: &str, container: &str, label_column: bool) -> Result<Self, ScrapeError> {
        Ok(Self {
            name: name.to_string(),
            shape: FragmentShape::Table {
                container: parse_selector(container)?,
                label_column,
            },
        })
    }

    pub fn list(
        name: &str,
        container: &str,
        item: &str,
        key: &str,
        value: &str,
    ) -> Result<Self, ScrapeError> {
        Ok(Self {
            name: name.to_string(),
            shape: FragmentShape::List {
                container: parse_selector(container)?,
                item: parse_selector(item)?,
                key: parse_selector(key)?,
                value: parse_selector(value)?,
            },
        })
    }

    pub fn document_links(
        name: &str,
        container: &str,
        item: &str,
        label: Option<&str>,
        label_key: &str,
    ) -> Result<Self, ScrapeError> {
        Ok(Self {
            name: name.to_string(),
            shape: FragmentShape::DocumentLinks {
                container: parse_selector(container)?,
                item: parse_selector(item)?,
                label: label.map(parse_selector).transpose()?,
                label_key: label_key.to_string(),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run this descriptor against a parsed page. An absent container is
    /// structural absence, not an error: the result is an empty fragment.
    pub fn extract(&self, doc: &Html) -> FragmentData {
        match &self.shape {
            FragmentShape::Table {
                container,
                label_column,
            } => extract_table(doc, container, *label_column),
            FragmentShape::List {
                container,
                item,
                key,
                value,
            } => extract_list(doc, container, item, key, value),
            FragmentShape::DocumentLinks {
                container,
                item,
                label,
                label_key,
            } => extract_document_links(doc, container, item, label.as_ref(), label_key),
        }
    }
}

/// Plain text of a node: markup stripped, surrounding whitespace trimmed,
/// interior runs collapsed to single spaces.
fn node_text(el: ElementRef) -> String {
    let raw: String = el.text().collect();
    WS_RE.replace_all(raw.trim(), " ").into_owned()
}

fn extract_table(doc: &Html, container: &Selector, label_column: bool) -> FragmentData {
    let Some(region) = doc.select(container).next() else {
        return FragmentData::Rows(Vec::new());
    };
    let table = if region.value().name() == "table" {
        region
    } else {
        match region.select(&TABLE_SEL).next() {
            Some(t) => t,
            None => return FragmentData::Rows(Vec::new()),
        }
    };

    let header_row = table
        .select(&THEAD_TR_SEL)
        .next()
        .or_else(|| table.select(&TR_SEL).next());
    let Some(header_row) = header_row else {
        return FragmentData::Rows(Vec::new());
    };
    let headers: Vec<String> = header_row.select(&TH_SEL).map(node_text).collect();
    if headers.is_empty() {
        return FragmentData::Rows(Vec::new());
    }

    let mut body: Vec<ElementRef> = table.select(&TBODY_TR_SEL).collect();
    if body.is_empty() {
        body = table.select(&TR_SEL).skip(1).collect();
    }

    let rows = body
        .into_iter()
        .filter_map(|tr| {
            let cells: Vec<String> = tr.select(&TD_SEL).map(node_text).collect();
            map_row(&headers, &cells, label_column)
        })
        .collect();
    FragmentData::Rows(rows)
}

/// Map one row's cells onto the header list. Arity mismatches drop the row;
/// a dropped row never shifts its neighbours. With `label_column` the first
/// cell is recorded under the synthetic `Category` header, whether the label
/// column carries its own header cell or not.
fn map_row(
    headers: &[String],
    cells: &[String],
    label_column: bool,
) -> Option<BTreeMap<String, String>> {
    if cells.is_empty() {
        return None;
    }
    let mut row = BTreeMap::new();
    if label_column {
        if cells.len() == headers.len() {
            // First header names the label column; replace it with Category.
            row.insert(CATEGORY_HEADER.to_string(), cells[0].clone());
            for (h, c) in headers[1..].iter().zip(&cells[1..]) {
                row.insert(h.clone(), c.clone());
            }
        } else if cells.len() == headers.len() + 1 {
            // Label column has no header cell at all.
            row.insert(CATEGORY_HEADER.to_string(), cells[0].clone());
            for (h, c) in headers.iter().zip(&cells[1..]) {
                row.insert(h.clone(), c.clone());
            }
        } else {
            return None;
        }
    } else {
        if cells.len() != headers.len() {
            return None;
        }
        for (h, c) in headers.iter().zip(cells) {
            row.insert(h.clone(), c.clone());
        }
    }
    Some(row)
}

fn extract_list(
    doc: &Html,
    container: &Selector,
    item: &Selector,
    key: &Selector,
    value: &Selector,
) -> FragmentData {
    let Some(region) = doc.select(container).next() else {
        return FragmentData::Items(BTreeMap::new());
    };
    let mut items = BTreeMap::new();
    for li in region.select(item) {
        let Some(k) = li.select(key).next().map(node_text) else {
            continue;
        };
        let Some(v) = li.select(value).next().map(node_text) else {
            continue;
        };
        if k.is_empty() {
            continue;
        }
        // Duplicate keys within one list: last occurrence wins.
        items.insert(k, v);
    }
    FragmentData::Items(items)
}

fn extract_document_links(
    doc: &Html,
    container: &Selector,
    item: &Selector,
    label: Option<&Selector>,
    label_key: &str,
) -> FragmentData {
    let Some(region) = doc.select(container).next() else {
        return FragmentData::Rows(Vec::new());
    };
    let mut rows = Vec::new();
    for li in region.select(item) {
        let Some(anchor) = li.select(&ANCHOR_SEL).next() else {
            continue;
        };
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let text = match label {
            Some(sel) => match li.select(sel).next() {
                Some(el) => node_text(el),
                None => continue,
            },
            None => node_text(anchor),
        };
        let mut row = BTreeMap::new();
        row.insert(label_key.to_string(), text);
        row.insert("url".to_string(), href.trim().to_string());
        rows.push(row);
    }
    FragmentData::Rows(rows)
}

// ── Fragment set ──

/// Fragments extracted from a second, script-rendered fetch of the page.
pub struct RenderedLeg {
    pub wait_selector: String,
    pub timeout: Duration,
    pub fragments: Vec<FragmentDescriptor>,
}

/// The configured set of fragments for one scrape target, split by the fetch
/// profile each leg needs.
pub struct FragmentSet {
    pub static_fragments: Vec<FragmentDescriptor>,
    pub rendered: Option<RenderedLeg>,
}

impl FragmentSet {
    /// The screener.in company-page set: top ratios, shareholding and
    /// financial-statement tables, report/rating document lists from the
    /// static page, plus the script-populated peer-comparison table.
    pub fn screener_default() -> Result<Self, ScrapeError> {
        let static_fragments = vec![
            FragmentDescriptor::list(
                "stock_details",
                "ul#top-ratios",
                "li",
                "span.name",
                "span.value",
            )?,
            FragmentDescriptor::table("shareholder_data", "div#quarterly-shp", true)?,
            FragmentDescriptor::table("profit_loss", "section#profit-loss", true)?,
            FragmentDescriptor::table("balance_sheet", "section#balance-sheet", true)?,
            FragmentDescriptor::table("quarterly_results", "section#quarters", true)?,
            FragmentDescriptor::table("shareholding", "section#shareholding", true)?,
            FragmentDescriptor::table("cash_flow", "section#cash-flow", true)?,
            FragmentDescriptor::table("ratios", "section#ratios", true)?,
            FragmentDescriptor::document_links(
                "annual_reports",
                "div.documents.annual-reports",
                "li",
                None,
                "year",
            )?,
            FragmentDescriptor::document_links(
                "credit_ratings",
                "div.documents.credit-ratings",
                "li",
                Some("div.ink-600.smaller"),
                "date",
            )?,
        ];
        let rendered = Some(RenderedLeg {
            wait_selector: "#peers table".to_string(),
            timeout: Duration::from_secs(10),
            fragments: vec![FragmentDescriptor::table("peers", "section#peers", false)?],
        });
        let set = FragmentSet {
            static_fragments,
            rendered,
        };
        set.validate()?;
        Ok(set)
    }

    /// Drop the rendered leg (static-only operation).
    pub fn without_rendered(mut self) -> Self {
        self.rendered = None;
        self
    }

    /// Fragment names must be disjoint across the whole set, and must not
    /// shadow the reserved `symbol` key of the merged document. Checked once
    /// at startup so a bad set never fails per symbol.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        let mut seen = std::collections::BTreeSet::new();
        for desc in self.all_fragments() {
            if desc.name() == "symbol" {
                return Err(ScrapeError::Config(
                    "fragment name 'symbol' is reserved".to_string(),
                ));
            }
            if !seen.insert(desc.name().to_string()) {
                return Err(ScrapeError::Config(format!(
                    "duplicate fragment name '{}'",
                    desc.name()
                )));
            }
        }
        if self.all_fragments().next().is_none() {
            return Err(ScrapeError::Config("empty fragment set".to_string()));
        }
        Ok(())
    }

    pub fn all_fragments(&self) -> impl Iterator<Item = &FragmentDescriptor> {
        self.static_fragments
            .iter()
            .chain(self.rendered.iter().flat_map(|leg| leg.fragments.iter()))
    }

    pub fn rendered_names(&self) -> Vec<String> {
        self.rendered
            .iter()
            .flat_map(|leg| leg.fragments.iter().map(|d| d.name().to_string()))
            .collect()
    }

    pub fn static_names(&self) -> Vec<String> {
        self.static_fragments
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn table_desc(container: &str, label_column: bool) -> FragmentDescriptor {
        FragmentDescriptor::table("t", container, label_column).unwrap()
    }

    #[test]
    fn list_items_become_flat_mapping() {
        let html = Html::parse_document(
            r#"<ul id="top-ratios">
                <li><span class="name">P/E</span><span class="value">24.3</span></li>
                <li><span class="name">ROE</span><span class="value">18%</span></li>
            </ul>"#,
        );
        let desc =
            FragmentDescriptor::list("d", "ul#top-ratios", "li", "span.name", "span.value")
                .unwrap();
        let FragmentData::Items(items) = desc.extract(&html) else {
            panic!("expected items");
        };
        assert_eq!(items.get("P/E").map(String::as_str), Some("24.3"));
        assert_eq!(items.get("ROE").map(String::as_str), Some("18%"));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn list_item_missing_value_is_skipped() {
        let html = Html::parse_document(
            r#"<ul id="r">
                <li><span class="name">P/E</span></li>
                <li><span class="name">ROE</span><span class="value">18%</span></li>
            </ul>"#,
        );
        let desc =
            FragmentDescriptor::list("d", "ul#r", "li", "span.name", "span.value").unwrap();
        let FragmentData::Items(items) = desc.extract(&html) else {
            panic!("expected items");
        };
        assert_eq!(items.len(), 1);
        assert!(items.contains_key("ROE"));
    }

    #[test]
    fn duplicate_list_keys_last_wins() {
        let html = Html::parse_document(
            r#"<ul id="r">
                <li><span class="name">P/E</span><span class="value">10</span></li>
                <li><span class="name">P/E</span><span class="value">24.3</span></li>
            </ul>"#,
        );
        let desc =
            FragmentDescriptor::list("d", "ul#r", "li", "span.name", "span.value").unwrap();
        let FragmentData::Items(items) = desc.extract(&html) else {
            panic!("expected items");
        };
        assert_eq!(items.get("P/E").map(String::as_str), Some("24.3"));
    }

    #[test]
    fn label_column_synthesizes_category() {
        let html = Html::parse_document(
            r#"<section id="profit-loss"><table>
                <thead><tr><th>Particulars</th><th>Mar-23</th><th>Mar-24</th></tr></thead>
                <tbody><tr><td>Sales</td><td>100</td><td>120</td></tr></tbody>
            </table></section>"#,
        );
        let FragmentData::Rows(rows) = table_desc("section#profit-loss", true).extract(&html)
        else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("Category").map(String::as_str), Some("Sales"));
        assert_eq!(rows[0].get("Mar-23").map(String::as_str), Some("100"));
        assert_eq!(rows[0].get("Mar-24").map(String::as_str), Some("120"));
        assert!(!rows[0].contains_key("Particulars"));
    }

    #[test]
    fn unheaded_label_column_also_maps_to_category() {
        // Two headers, three cells: the leading cell is the row label.
        let html = Html::parse_document(
            r#"<div id="t"><table>
                <thead><tr><th>Mar-23</th><th>Mar-24</th></tr></thead>
                <tbody><tr><td>Sales</td><td>100</td><td>120</td></tr></tbody>
            </table></div>"#,
        );
        let FragmentData::Rows(rows) = table_desc("div#t", true).extract(&html) else {
            panic!("expected rows");
        };
        assert_eq!(rows[0].get("Category").map(String::as_str), Some("Sales"));
        assert_eq!(rows[0].get("Mar-24").map(String::as_str), Some("120"));
    }

    #[test]
    fn arity_mismatch_drops_row_keeps_rest() {
        let html = Html::parse_document(
            r#"<div id="t"><table>
                <thead><tr><th>Name</th><th>CMP</th></tr></thead>
                <tbody>
                    <tr><td>Alpha</td><td>10</td></tr>
                    <tr><td>lone cell</td></tr>
                    <tr><td>Beta</td><td>20</td></tr>
                </tbody>
            </table></div>"#,
        );
        let FragmentData::Rows(rows) = table_desc("div#t", false).extract(&html) else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Name").map(String::as_str), Some("Alpha"));
        assert_eq!(rows[1].get("Name").map(String::as_str), Some("Beta"));
    }

    #[test]
    fn absent_container_yields_empty_not_error() {
        let html = Html::parse_document("<html><body><p>no tables here</p></body></html>");
        let data = table_desc("section#peers", false).extract(&html);
        assert!(data.is_empty());
        assert!(matches!(data, FragmentData::Rows(ref r) if r.is_empty()));
    }

    #[test]
    fn headerless_table_yields_empty() {
        let html = Html::parse_document(
            r#"<div id="t"><table><tbody><tr><td>1</td></tr></tbody></table></div>"#,
        );
        assert!(table_desc("div#t", false).extract(&html).is_empty());
    }

    #[test]
    fn text_is_trimmed_and_collapsed() {
        let html = Html::parse_document(
            r#"<ul id="r"><li>
                <span class="name">  Market
                    Cap </span><span class="value"> 1,000  <b>Cr.</b> </span>
            </li></ul>"#,
        );
        let desc =
            FragmentDescriptor::list("d", "ul#r", "li", "span.name", "span.value").unwrap();
        let FragmentData::Items(items) = desc.extract(&html) else {
            panic!("expected items");
        };
        assert_eq!(
            items.get("Market Cap").map(String::as_str),
            Some("1,000 Cr.")
        );
    }

    #[test]
    fn document_links_extract_label_and_href() {
        let html = Html::parse_document(
            r#"<div class="documents annual-reports flex-column"><ul>
                <li><a href="/report/2024.pdf">Financial Year 2024</a></li>
                <li><span>no anchor</span></li>
            </ul></div>"#,
        );
        let desc = FragmentDescriptor::document_links(
            "annual_reports",
            "div.documents.annual-reports",
            "li",
            None,
            "year",
        )
        .unwrap();
        let FragmentData::Rows(rows) = desc.extract(&html) else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("year").map(String::as_str),
            Some("Financial Year 2024")
        );
        assert_eq!(rows[0].get("url").map(String::as_str), Some("/report/2024.pdf"));
    }

    #[test]
    fn default_set_validates() {
        let set = FragmentSet::screener_default().unwrap();
        assert!(set.validate().is_ok());
        assert!(set.rendered_names().contains(&"peers".to_string()));
    }

    #[test]
    fn duplicate_fragment_names_rejected() {
        let set = FragmentSet {
            static_fragments: vec![
                FragmentDescriptor::table("dup", "div#a", false).unwrap(),
                FragmentDescriptor::table("dup", "div#b", false).unwrap(),
            ],
            rendered: None,
        };
        assert!(set.validate().is_err());
    }

    #[test]
    fn reserved_symbol_name_rejected() {
        let set = FragmentSet {
            static_fragments: vec![FragmentDescriptor::table("symbol", "div#a", false).unwrap()],
            rendered: None,
        };
        assert!(set.validate().is_err());
    }
}
