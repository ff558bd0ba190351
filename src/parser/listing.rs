use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

static CONTAINER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.karargoruntulemealani.col-sm-12").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Whether the page carries the results container at all. A 200 page
/// without it (maintenance notice, changed layout) has no usable links.
pub fn has_results(html: &str) -> bool {
    Html::parse_document(html).select(&CONTAINER).next().is_some()
}

/// Decision URLs on a listing page, in listing order.
///
/// Only anchors inside the results container count. Hrefs carrying a query
/// string (pagination, sorting) are dropped, the rest are resolved against
/// `root` and kept if they stay on the same origin.
pub fn extract_links(html: &str, root: &Url) -> Vec<String> {
    let doc = Html::parse_document(html);
    let Some(container) = doc.select(&CONTAINER).next() else {
        return Vec::new();
    };

    container
        .select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| !href.contains('?'))
        .filter_map(|href| root.join(href).ok())
        .filter(|url| url.origin() == root.origin())
        .map(String::from)
        .collect()
}
