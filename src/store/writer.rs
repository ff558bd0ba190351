use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{Dataset, DecisionRecord, RunState};
use crate::error::StoreError;

const WRITER_BUFFER: usize = 64;

enum StoreCommand {
    Contains {
        link: String,
        reply: oneshot::Sender<bool>,
    },
    Append {
        record: DecisionRecord,
        reply: oneshot::Sender<bool>,
    },
    PageDone {
        page: u32,
    },
}

/// Counters reported once the writer shuts down.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreReport {
    pub appended: usize,
    pub duplicates: usize,
    pub dataset_writes: usize,
    pub total_records: usize,
}

/// Cloneable front end to the writer task. Page tasks only ever talk to
/// the dataset through this.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub async fn contains(&self, link: &str) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Contains {
            link: link.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::WriterClosed)
    }

    /// Returns false if another task already stored this link.
    pub async fn append(&self, record: DecisionRecord) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Append { record, reply }).await?;
        rx.await.map_err(|_| StoreError::WriterClosed)
    }

    pub async fn page_done(&self, page: u32) -> Result<(), StoreError> {
        self.send(StoreCommand::PageDone { page }).await
    }

    async fn send(&self, cmd: StoreCommand) -> Result<(), StoreError> {
        self.tx.send(cmd).await.map_err(|_| StoreError::WriterClosed)
    }
}

/// Sole owner of the dataset and run state. Every accepted append is
/// persisted before the reply goes out.
pub struct StoreWriter {
    dataset: Dataset,
    data_path: PathBuf,
    state: RunState,
    state_path: PathBuf,
    dirty: bool,
    report: StoreReport,
}

impl StoreWriter {
    pub fn new(
        dataset: Dataset,
        data_path: PathBuf,
        state: RunState,
        state_path: PathBuf,
    ) -> Self {
        StoreWriter {
            dataset,
            data_path,
            state,
            state_path,
            dirty: false,
            report: StoreReport::default(),
        }
    }

    /// Start the writer task. It exits once every handle has been dropped.
    pub fn spawn(self) -> (StoreHandle, JoinHandle<Result<StoreReport, StoreError>>) {
        let (tx, rx) = mpsc::channel(WRITER_BUFFER);
        let task = tokio::spawn(self.serve(rx));
        (StoreHandle { tx }, task)
    }

    async fn serve(
        mut self,
        mut rx: mpsc::Receiver<StoreCommand>,
    ) -> Result<StoreReport, StoreError> {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                StoreCommand::Contains { link, reply } => {
                    let _ = reply.send(self.dataset.exists(&link));
                }
                StoreCommand::Append { record, reply } => {
                    let accepted = self.append(record);
                    let _ = reply.send(accepted);
                }
                StoreCommand::PageDone { page } => self.page_done(page),
            }
        }
        self.finish()
    }

    fn append(&mut self, record: DecisionRecord) -> bool {
        if !self.dataset.append(record) {
            self.report.duplicates += 1;
            return false;
        }
        self.report.appended += 1;
        self.dirty = true;
        self.persist_dataset();
        true
    }

    fn persist_dataset(&mut self) {
        match self.dataset.save(&self.data_path) {
            Ok(()) => {
                self.dirty = false;
                self.report.dataset_writes += 1;
            }
            Err(e) => error!("Error saving data to {}: {}", self.data_path.display(), e),
        }
    }

    fn page_done(&mut self, page: u32) {
        if !self.state.mark_completed(page) {
            return;
        }
        debug!(page, "page completed");
        if let Err(e) = self.state.save(&self.state_path) {
            error!("Error saving run state to {}: {}", self.state_path.display(), e);
        }
    }

    /// Final save: rewrites the dataset if an earlier write failed, and
    /// always leaves an output file behind even when nothing was appended.
    fn finish(mut self) -> Result<StoreReport, StoreError> {
        if self.dirty || !self.data_path.exists() {
            self.dataset.save(&self.data_path)?;
            self.report.dataset_writes += 1;
        }
        self.report.total_records = self.dataset.len();
        Ok(self.report)
    }
}
