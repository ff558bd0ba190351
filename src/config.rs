use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::SettingsError;

pub const ROOT_URL: &str = "https://kararlarbilgibankasi.anayasa.gov.tr";
pub const DEFAULT_LOG_FILE: &str = "Output/scraping_log.txt";
const DEFAULT_CONFIG_NAME: &str = "scraper";
const ENV_PREFIX: &str = "AYM";

/// Runtime settings. Layered as defaults < `scraper.toml` (or `--config`)
/// < `AYM_*` environment variables < CLI flags.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub root_url: String,
    pub total_pages: u32,
    pub concurrency: usize,
    /// Decisions per listing page, used by the record-count resume fallback.
    pub page_size: usize,
    pub data_file: PathBuf,
    pub state_file: PathBuf,
    pub log_file: PathBuf,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub accept_invalid_certs: bool,
}

impl Settings {
    pub fn load(config_path: Option<&Path>) -> Result<Self, SettingsError> {
        let file = match config_path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let settings: Settings = Config::builder()
            .set_default("root_url", ROOT_URL)?
            .set_default("total_pages", 1410_i64)?
            .set_default("concurrency", 20_i64)?
            .set_default("page_size", 10_i64)?
            .set_default("data_file", "Output/aym_kararlar.json")?
            .set_default("state_file", "Output/scrape_state.json")?
            .set_default("log_file", DEFAULT_LOG_FILE)?
            .set_default("min_delay_ms", 1000_i64)?
            .set_default("max_delay_ms", 2000_i64)?
            .set_default("request_timeout_secs", 30_i64)?
            .set_default("max_retries", 3_i64)?
            .set_default("backoff_base_ms", 2000_i64)?
            .set_default("accept_invalid_certs", false)?
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.total_pages == 0 {
            return Err(SettingsError::Invalid("total_pages must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(SettingsError::Invalid("concurrency must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(SettingsError::Invalid("page_size must be at least 1".into()));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(SettingsError::Invalid(format!(
                "min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        if url::Url::parse(&self.root_url).is_err() {
            return Err(SettingsError::Invalid(format!(
                "root_url is not a valid URL: {}",
                self.root_url
            )));
        }
        Ok(())
    }

    pub fn listing_url(&self, page: u32) -> String {
        format!("{}/?page={}", self.root_url.trim_end_matches('/'), page)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
