use std::sync::LazyLock;

use indexmap::IndexMap;
use scraper::{ElementRef, Html, Selector};

use crate::store::{DecisionRecord, ReviewOutcome};

const SUBJECT_HEADING: &str = "II. BAŞVURU KONUSU";

static DECISION_TEXT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("span.kararHtml").unwrap());
static DETAILS_TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div#KararDetaylari table").unwrap());
static RESULTS_TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.table-responsive").unwrap());
static HEADING: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h4").unwrap());
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());

/// Parse a decision page. Sections that are missing come back empty.
pub fn parse_decision(link: &str, html: &str) -> DecisionRecord {
    let doc = Html::parse_document(html);
    DecisionRecord {
        link: link.to_string(),
        full_text: decision_text(&doc),
        metadata: metadata(&doc),
        subject_summary: subject_summary(&doc),
        review_outcomes: review_outcomes(&doc),
    }
}

fn element_text(el: ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn decision_text(doc: &Html) -> String {
    doc.select(&DECISION_TEXT)
        .next()
        .map(element_text)
        .unwrap_or_default()
}

/// Two-cell rows of the identity table as label -> value.
fn metadata(doc: &Html) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    let Some(table) = doc.select(&DETAILS_TABLE).next() else {
        return out;
    };
    for row in table.select(&ROW) {
        let cells: Vec<ElementRef> = row.select(&CELL).collect();
        if let [key, value] = cells.as_slice() {
            out.insert(element_text(*key), element_text(*value));
        }
    }
    out
}

/// Text node right after the first `<br>` that follows the subject heading.
fn subject_summary(doc: &Html) -> String {
    let Some(heading) = doc
        .select(&HEADING)
        .find(|h| element_text(*h) == SUBJECT_HEADING)
    else {
        return String::new();
    };

    let br = doc
        .root_element()
        .descendants()
        .skip_while(|n| n.id() != heading.id())
        .skip(1)
        .find(|n| n.value().as_element().is_some_and(|e| e.name() == "br"));

    let Some(next) = br.and_then(|br| br.next_sibling()) else {
        return String::new();
    };
    if let Some(text) = next.value().as_text() {
        return text.trim().to_string();
    }
    ElementRef::wrap(next).map(element_text).unwrap_or_default()
}

fn review_outcomes(doc: &Html) -> Vec<ReviewOutcome> {
    let Some(table) = doc.select(&RESULTS_TABLE).next() else {
        return Vec::new();
    };
    table
        .select(&ROW)
        .filter_map(|row| {
            let cells: Vec<String> = row.select(&CELL).map(element_text).collect();
            ReviewOutcome::from_cells(&cells)
        })
        .collect()
}
