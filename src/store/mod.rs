pub mod writer;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::StoreError;

pub use writer::{StoreHandle, StoreReport, StoreWriter};

// ── Records ──

/// One scraped decision. Field names on disk follow the court site's
/// Turkish labels so existing consumers of the JSON keep working.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(rename = "Kararın Bağlantı Linki")]
    pub link: String,
    #[serde(rename = "Karar Metni", default)]
    pub full_text: String,
    #[serde(rename = "Karar Bilgileri", default)]
    pub metadata: IndexMap<String, String>,
    #[serde(rename = "Başvuru Konusu", default)]
    pub subject_summary: String,
    #[serde(rename = "İnceleme Sonuçları", default)]
    pub review_outcomes: Vec<ReviewOutcome>,
}

impl DecisionRecord {
    /// True when nothing beyond the link was extracted.
    pub fn is_empty(&self) -> bool {
        self.full_text.is_empty()
            && self.metadata.is_empty()
            && self.subject_summary.is_empty()
            && self.review_outcomes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    #[serde(rename = "Hak", default)]
    pub right: String,
    #[serde(rename = "Müdahale İddiası", default)]
    pub interference_claim: String,
    #[serde(rename = "Sonuç", default)]
    pub result: String,
    #[serde(rename = "Giderim", default)]
    pub remedy: String,
}

impl ReviewOutcome {
    /// Map table cells positionally. `None` for a row without cells.
    pub fn from_cells(cells: &[String]) -> Option<Self> {
        if cells.is_empty() {
            return None;
        }
        let cell = |i: usize| cells.get(i).cloned().unwrap_or_default();
        Some(ReviewOutcome {
            right: cell(0),
            interference_claim: cell(1),
            result: cell(2),
            remedy: cell(3),
        })
    }
}

// ── Dataset ──

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(rename = "Kararlar", default)]
    pub records: Vec<DecisionRecord>,
}

impl Dataset {
    /// Load the dataset, starting fresh if the file is missing or unreadable.
    pub fn load(path: &Path) -> Self {
        load_lenient(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json_atomic(path, self)
    }

    pub fn exists(&self, link: &str) -> bool {
        self.records.iter().any(|r| r.link == link)
    }

    /// Append a record unless its link is already present.
    pub fn append(&mut self, record: DecisionRecord) -> bool {
        if self.exists(&record.link) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Review outcome `result` values with their counts, most frequent first.
    pub fn outcome_counts(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for outcome in self.records.iter().flat_map(|r| &r.review_outcomes) {
            *counts.entry(outcome.result.as_str()).or_default() += 1;
        }
        let mut counts: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }
}

/// Page to resume from when only the record count is known.
pub fn resume_page(record_count: usize, page_size: usize) -> u32 {
    (record_count / page_size.max(1)) as u32 + 1
}

// ── Run state ──

/// Listing pages whose decisions were all handled, persisted beside the dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub completed_pages: BTreeSet<u32>,
}

impl RunState {
    pub fn load(path: &Path) -> Self {
        load_lenient(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json_atomic(path, self)
    }

    /// Returns false if the page was already recorded.
    pub fn mark_completed(&mut self, page: u32) -> bool {
        self.completed_pages.insert(page)
    }

    pub fn is_completed(&self, page: u32) -> bool {
        self.completed_pages.contains(&page)
    }

    /// Lowest page number (from 1) not yet completed.
    pub fn first_incomplete(&self) -> u32 {
        let mut page = 1;
        while self.completed_pages.contains(&page) {
            page += 1;
        }
        page
    }
}

// ── File I/O ──

fn load_lenient<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            error!(
                "Error loading data from {}: {}. Initializing empty data.",
                path.display(),
                e
            );
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            error!(
                "Error loading data from {}: {}. Initializing empty data.",
                path.display(),
                e
            );
            None
        }
    }
}

/// Pretty JSON with 4-space indent, written to `<path>.tmp` then renamed over `path`.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;

    let tmp = tmp_path(path);
    fs::write(&tmp, &buf).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
