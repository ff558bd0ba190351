use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Settings;
use crate::error::StoreError;
use crate::fetch::Fetch;
use crate::parser::{decision, listing};
use crate::store::{
    self, Dataset, DecisionRecord, RunState, StoreHandle, StoreReport, StoreWriter,
};

/// Outcome of one listing page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageReport {
    pub page: u32,
    pub listing_fetched: bool,
    pub has_results: bool,
    pub links: usize,
    pub scraped: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PageReport {
    /// A page counts as done once its results listing was read and no
    /// decision fetch failed.
    pub fn is_complete(&self) -> bool {
        self.listing_fetched && self.has_results && self.failed == 0
    }
}

/// Stats returned after a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub resume_page: u32,
    pub pages: usize,
    pub pages_incomplete: usize,
    pub scraped: usize,
    pub skipped: usize,
    pub failed: usize,
    pub store: StoreReport,
    pub elapsed: Duration,
}

/// Which pages a run should visit.
#[derive(Debug, Clone, PartialEq)]
pub struct PagePlan {
    pub resume_page: u32,
    pub pages: Vec<u32>,
}

/// Prefer the persisted run state; fall back to the record-count estimate
/// when there is none.
pub fn plan_pages(
    record_count: usize,
    state: &RunState,
    total_pages: u32,
    page_size: usize,
) -> PagePlan {
    if state.completed_pages.is_empty() {
        let resume_page = store::resume_page(record_count, page_size);
        return PagePlan {
            resume_page,
            pages: (resume_page..=total_pages).collect(),
        };
    }

    let resume_page = state.first_incomplete();
    PagePlan {
        resume_page,
        pages: (resume_page..=total_pages)
            .filter(|p| !state.is_completed(*p))
            .collect(),
    }
}

/// Drives one listing page at a time. Cheap to clone into page tasks.
pub struct PageScraper<F> {
    fetcher: Arc<F>,
    store: StoreHandle,
    root: Url,
    settings: Arc<Settings>,
}

impl<F> Clone for PageScraper<F> {
    fn clone(&self) -> Self {
        PageScraper {
            fetcher: Arc::clone(&self.fetcher),
            store: self.store.clone(),
            root: self.root.clone(),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<F: Fetch> PageScraper<F> {
    pub fn new(fetcher: Arc<F>, store: StoreHandle, root: Url, settings: Arc<Settings>) -> Self {
        PageScraper {
            fetcher,
            store,
            root,
            settings,
        }
    }

    /// Fetch a listing page and store every decision on it that is not
    /// already in the dataset, pausing between decisions.
    pub async fn scrape_page(&self, page: u32) -> Result<PageReport, StoreError> {
        let url = self.settings.listing_url(page);
        info!("Scraping page {}...", page);

        let mut report = PageReport {
            page,
            ..Default::default()
        };
        let html = self.fetcher.fetch(&url).await;
        if html.is_empty() {
            return Ok(report);
        }
        report.listing_fetched = true;
        if !listing::has_results(&html) {
            warn!("No results container on page {}; will retry next run", page);
            return Ok(report);
        }
        report.has_results = true;

        let links = listing::extract_links(&html, &self.root);
        report.links = links.len();

        for link in links {
            if self.store.contains(&link).await? {
                info!("Decision already exists: {}", link);
                report.skipped += 1;
                continue;
            }

            match self.scrape_decision(&link).await {
                Some(record) => {
                    if record.is_empty() {
                        warn!("No decision content found at {}", link);
                    }
                    if self.store.append(record).await? {
                        info!("Scraped decision from {}", link);
                        report.scraped += 1;
                    } else {
                        // another page task got there first
                        report.skipped += 1;
                    }
                }
                None => report.failed += 1,
            }
            self.pause().await;
        }

        if report.is_complete() {
            self.store.page_done(page).await?;
        }
        debug!(
            page = report.page,
            links = report.links,
            scraped = report.scraped,
            skipped = report.skipped,
            failed = report.failed,
            "page finished"
        );
        Ok(report)
    }

    async fn scrape_decision(&self, link: &str) -> Option<DecisionRecord> {
        let html = self.fetcher.fetch(link).await;
        if html.is_empty() {
            return None;
        }
        Some(decision::parse_decision(link, &html))
    }

    async fn pause(&self) {
        let delay = pacing_delay(self.settings.min_delay_ms, self.settings.max_delay_ms);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Uniform random delay in `[min_ms, max_ms]`.
fn pacing_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// Scrape every planned page under the concurrency cap, then flush the store.
pub async fn run<F: Fetch + 'static>(settings: Settings, fetcher: F) -> Result<RunSummary> {
    let t0 = Instant::now();
    let root = Url::parse(&settings.root_url).context("Invalid root_url")?;

    let dataset = Dataset::load(&settings.data_file);
    let mut state = RunState::load(&settings.state_file);
    if dataset.is_empty() && !state.completed_pages.is_empty() {
        warn!(
            "Run state lists {} completed pages but the dataset is empty; starting over",
            state.completed_pages.len()
        );
        state = RunState::default();
    }

    let plan = plan_pages(dataset.len(), &state, settings.total_pages, settings.page_size);
    println!("Starting scraping from page {}", plan.resume_page);
    info!(
        records = dataset.len(),
        pages = plan.pages.len(),
        concurrency = settings.concurrency,
        "run planned"
    );

    let (store, writer) = StoreWriter::new(
        dataset,
        settings.data_file.clone(),
        state,
        settings.state_file.clone(),
    )
    .spawn();

    let semaphore = Arc::new(Semaphore::new(settings.concurrency));
    let settings = Arc::new(settings);
    let scraper = PageScraper::new(Arc::new(fetcher), store, root, Arc::clone(&settings));

    let pb = ProgressBar::new(plan.pages.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} pages ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let mut tasks = JoinSet::new();
    for page in plan.pages.iter().copied() {
        let scraper = scraper.clone();
        let sem = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = sem.acquire().await.context("Semaphore closed")?;
            scraper
                .scrape_page(page)
                .await
                .with_context(|| format!("Page {} failed", page))
        });
    }

    // Drop our handle so the writer stops once every page task is done
    drop(scraper);

    let mut summary = RunSummary {
        resume_page: plan.resume_page,
        ..Default::default()
    };
    while let Some(joined) = tasks.join_next().await {
        let report = joined.context("Page task panicked")??;
        summary.pages += 1;
        summary.scraped += report.scraped;
        summary.skipped += report.skipped;
        summary.failed += report.failed;
        if !report.is_complete() {
            summary.pages_incomplete += 1;
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    summary.store = writer.await.context("Store writer panicked")??;
    summary.elapsed = t0.elapsed();
    info!(
        appended = summary.store.appended,
        duplicates = summary.store.duplicates,
        writes = summary.store.dataset_writes,
        "Scraped {} decisions over {} pages ({} skipped, {} failed)",
        summary.scraped,
        summary.pages,
        summary.skipped,
        summary.failed
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const ROOT: &str = "https://aym.test";

    /// Serves canned documents by URL; anything unknown fetches as empty.
    struct FixtureFetcher {
        pages: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl FixtureFetcher {
        fn new(pages: &[(&str, String)]) -> Self {
            FixtureFetcher {
                pages: pages
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Fetch for FixtureFetcher {
        async fn fetch(&self, url: &str) -> String {
            self.calls.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().unwrap_or_default()
        }
    }

    fn settings(dir: &Path, total_pages: u32) -> Settings {
        Settings {
            root_url: ROOT.into(),
            total_pages,
            concurrency: 2,
            page_size: 10,
            data_file: dir.join("Output").join("aym_kararlar.json"),
            state_file: dir.join("Output").join("scrape_state.json"),
            log_file: dir.join("Output").join("scraping_log.txt"),
            min_delay_ms: 0,
            max_delay_ms: 0,
            request_timeout_secs: 1,
            max_retries: 0,
            backoff_base_ms: 0,
            accept_invalid_certs: false,
        }
    }

    fn listing(hrefs: &[&str]) -> String {
        let anchors: String = hrefs
            .iter()
            .map(|h| format!("<a href=\"{}\">karar</a>", h))
            .collect();
        format!(
            "<html><body><div class=\"karargoruntulemealani col-sm-12\">{}</div></body></html>",
            anchors
        )
    }

    fn decision(text: &str) -> String {
        format!("<html><body><span class=\"kararHtml\">{}</span></body></html>", text)
    }

    fn existing(link: &str) -> Dataset {
        let mut ds = Dataset::default();
        ds.append(DecisionRecord {
            link: link.to_string(),
            full_text: "önceden".into(),
            ..Default::default()
        });
        ds
    }

    fn two_page_site() -> FixtureFetcher {
        FixtureFetcher::new(&[
            (
                "https://aym.test/?page=1",
                listing(&["/BB/2020/1", "/BB/2020/2", "/?page=2"]),
            ),
            ("https://aym.test/?page=2", listing(&["/BB/2019/9"])),
            ("https://aym.test/BB/2020/1", decision("birinci karar")),
            ("https://aym.test/BB/2020/2", decision("ikinci karar")),
            ("https://aym.test/BB/2019/9", decision("eski karar")),
        ])
    }

    #[test]
    fn plan_falls_back_to_record_count() {
        let state = RunState::default();
        let plan = plan_pages(25, &state, 5, 10);
        assert_eq!(plan.resume_page, 3);
        assert_eq!(plan.pages, vec![3, 4, 5]);

        let plan = plan_pages(0, &state, 2, 10);
        assert_eq!(plan.resume_page, 1);
        assert_eq!(plan.pages, vec![1, 2]);
    }

    #[test]
    fn plan_uses_run_state_and_skips_completed() {
        let mut state = RunState::default();
        for p in [1, 2, 4] {
            state.mark_completed(p);
        }
        let plan = plan_pages(999, &state, 5, 10);
        assert_eq!(plan.resume_page, 3);
        assert_eq!(plan.pages, vec![3, 5]);
    }

    #[test]
    fn pacing_delay_stays_in_range() {
        for _ in 0..50 {
            let d = pacing_delay(1000, 2000);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(2000));
        }
        assert_eq!(pacing_delay(0, 0), Duration::ZERO);
    }

    #[tokio::test]
    async fn full_run_scrapes_only_new_decisions() {
        let dir = TempDir::new().unwrap();
        let s = settings(dir.path(), 2);
        existing("https://aym.test/BB/2019/9").save(&s.data_file).unwrap();

        let summary = run(s.clone(), two_page_site()).await.unwrap();

        assert_eq!(summary.resume_page, 1);
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.scraped, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.store.appended, 2);
        assert_eq!(summary.store.dataset_writes, 2);

        let ds = Dataset::load(&s.data_file);
        assert_eq!(ds.len(), 3);
        assert!(ds.exists("https://aym.test/BB/2020/1"));
        assert!(ds.exists("https://aym.test/BB/2020/2"));
        let texts: Vec<&str> = ds.records.iter().map(|r| r.full_text.as_str()).collect();
        assert!(texts.contains(&"birinci karar"));

        let state = RunState::load(&s.state_file);
        assert_eq!(state.first_incomplete(), 3);
    }

    #[tokio::test]
    async fn decisions_within_a_page_keep_listing_order() {
        let dir = TempDir::new().unwrap();
        let s = settings(dir.path(), 1);
        run(s.clone(), two_page_site()).await.unwrap();

        let links: Vec<String> = Dataset::load(&s.data_file)
            .records
            .into_iter()
            .map(|r| r.link)
            .collect();
        assert_eq!(links, ["https://aym.test/BB/2020/1", "https://aym.test/BB/2020/2"]);
    }

    #[tokio::test]
    async fn second_run_resumes_past_completed_pages() {
        let dir = TempDir::new().unwrap();
        let s = settings(dir.path(), 2);
        run(s.clone(), two_page_site()).await.unwrap();

        let fetcher = two_page_site();
        let summary = run(s.clone(), fetcher).await.unwrap();
        assert_eq!(summary.resume_page, 3);
        assert_eq!(summary.pages, 0);
        assert_eq!(summary.store.dataset_writes, 0);
        assert_eq!(Dataset::load(&s.data_file).len(), 3);
    }

    #[tokio::test]
    async fn failed_decision_leaves_page_incomplete() {
        let dir = TempDir::new().unwrap();
        let s = settings(dir.path(), 1);
        let fetcher = FixtureFetcher::new(&[
            ("https://aym.test/?page=1", listing(&["/BB/2020/1", "/BB/2020/404"])),
            ("https://aym.test/BB/2020/1", decision("birinci karar")),
        ]);

        let summary = run(s.clone(), fetcher).await.unwrap();
        assert_eq!(summary.scraped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pages_incomplete, 1);
        assert!(RunState::load(&s.state_file).completed_pages.is_empty());
    }

    #[tokio::test]
    async fn unreachable_listing_scrapes_nothing() {
        let dir = TempDir::new().unwrap();
        let s = settings(dir.path(), 1);
        let fetcher = FixtureFetcher::new(&[]);
        let summary = run(s.clone(), fetcher).await.unwrap();
        assert_eq!(summary.scraped, 0);
        assert_eq!(summary.pages_incomplete, 1);
        // an empty dataset is still written out
        assert!(Dataset::load(&s.data_file).is_empty());
        assert!(std::fs::read_to_string(&s.data_file)
            .unwrap()
            .contains("\"Kararlar\": []"));
    }

    #[tokio::test]
    async fn listing_without_results_is_not_marked_done() {
        let dir = TempDir::new().unwrap();
        let s = settings(dir.path(), 2);
        existing("https://aym.test/BB/2019/9").save(&s.data_file).unwrap();
        let fetcher = FixtureFetcher::new(&[
            (
                "https://aym.test/?page=1",
                "<html><body><h1>Bakım çalışması</h1></body></html>".to_string(),
            ),
            ("https://aym.test/?page=2", listing(&["/BB/2019/9"])),
        ]);

        let summary = run(s.clone(), fetcher).await.unwrap();
        assert_eq!(summary.pages_incomplete, 1);

        let state = RunState::load(&s.state_file);
        assert!(!state.is_completed(1));
        assert!(state.is_completed(2));
        let plan = plan_pages(1, &state, 2, 10);
        assert_eq!(plan.pages, vec![1]);
    }

    #[tokio::test]
    async fn existing_decisions_are_not_refetched() {
        let dir = TempDir::new().unwrap();
        let s = settings(dir.path(), 2);
        existing("https://aym.test/BB/2019/9").save(&s.data_file).unwrap();
        let fetcher = Arc::new(two_page_site());

        let dataset = Dataset::load(&s.data_file);
        let (store, writer) = StoreWriter::new(
            dataset,
            s.data_file.clone(),
            RunState::default(),
            s.state_file.clone(),
        )
        .spawn();
        let scraper = PageScraper::new(
            Arc::clone(&fetcher),
            store,
            Url::parse(ROOT).unwrap(),
            Arc::new(s),
        );
        let report = scraper.scrape_page(2).await.unwrap();
        drop(scraper);
        writer.await.unwrap().unwrap();

        assert_eq!(report.skipped, 1);
        assert!(report.is_complete());
        let calls = fetcher.calls.lock().unwrap();
        assert_eq!(*calls, ["https://aym.test/?page=2"]);
    }
}
