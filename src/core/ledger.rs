//! Append-only run ledger with file-based persistence.
//!
//! Every attempted operation, its outcome, and any healing action is
//! recorded as one JSONL line. The ledger is the source of truth for the
//! self-improver and for health reporting; it survives restarts and
//! tolerates concurrent appends from parallel pipeline stages.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{HealingEvent, Operation, OperationKind, OperationStatus};

/// Types of ledger records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    /// A stage began work on an operation
    OperationStarted,

    /// One adapter invocation succeeded
    AttemptSucceeded,

    /// One adapter invocation failed
    AttemptFailed,

    /// A healing strategy was applied and resolved
    HealingApplied,

    /// The operation reached a terminal status
    OperationCompleted,
}

/// One line in the append-only ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Unique identifier for this record
    pub id: Uuid,

    /// When this record was written
    pub timestamp: DateTime<Utc>,

    /// The pipeline run this record belongs to
    pub run_id: Uuid,

    /// The operation this record belongs to
    pub operation_id: Uuid,

    /// Content unit the operation works on
    pub unit_id: String,

    /// Niche of the content unit, when known
    pub niche: Option<String>,

    /// Component assigned at the time of the record
    pub component: String,

    /// What the operation does
    pub kind: OperationKind,

    /// Attempt count at the time of the record
    pub attempt: u32,

    /// Record type
    pub event_type: LedgerEventType,

    /// Operation status at the time of the record
    pub status: OperationStatus,

    /// Healing action, for `HealingApplied` records
    pub healing: Option<HealingEvent>,

    /// Error message, for failed attempts
    pub error: Option<String>,
}

impl LedgerRecord {
    /// Create a record snapshotting the operation's current state
    pub fn new(run_id: Uuid, op: &Operation, event_type: LedgerEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            operation_id: op.id,
            unit_id: op.unit_id.clone(),
            niche: None,
            component: op.component.clone(),
            kind: op.kind,
            attempt: op.attempts,
            event_type,
            status: op.status,
            healing: None,
            error: None,
        }
    }

    pub fn with_niche(mut self, niche: Option<&str>) -> Self {
        self.niche = niche.map(|n| n.to_string());
        self
    }

    pub fn with_healing(mut self, healing: HealingEvent) -> Self {
        self.healing = Some(healing);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// File-backed append-only ledger (JSONL)
pub struct RunLedger {
    /// Path to the records.jsonl file
    records_path: PathBuf,

    /// Serializes appends so concurrent stage tasks cannot interleave lines
    write_guard: Mutex<()>,
}

impl RunLedger {
    /// Create or open the ledger in a directory
    pub async fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create ledger directory: {}", dir.display()))?;

        Ok(Self {
            records_path: dir.join("records.jsonl"),
            write_guard: Mutex::new(()),
        })
    }

    /// Path to the records file
    pub fn records_path(&self) -> &Path {
        &self.records_path
    }

    /// Append a record to the log
    pub async fn append(&self, record: &LedgerRecord) -> Result<()> {
        let _guard = self.write_guard.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.records_path)
            .await
            .with_context(|| {
                format!("Failed to open ledger file: {}", self.records_path.display())
            })?;

        let json = serde_json::to_string(record).context("Failed to serialize ledger record")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write ledger record")?;
        file.flush().await.context("Failed to flush ledger record")?;

        Ok(())
    }

    /// Replay all records in append order
    pub async fn replay(&self) -> Result<Vec<LedgerRecord>> {
        if !self.records_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.records_path)
            .await
            .with_context(|| {
                format!("Failed to open ledger file: {}", self.records_path.display())
            })?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: LedgerRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse ledger record: {}", line))?;
            records.push(record);
        }

        Ok(records)
    }

    /// Records filtered by component and/or time range, in append order
    pub async fn query(
        &self,
        component: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<LedgerRecord>> {
        let records = self.replay().await?;

        Ok(records
            .into_iter()
            .filter(|r| component.map_or(true, |c| r.component == c))
            .filter(|r| since.map_or(true, |s| r.timestamp >= s))
            .filter(|r| until.map_or(true, |u| r.timestamp <= u))
            .collect())
    }

    /// Full history of one operation, in append order
    pub async fn operation_history(&self, operation_id: Uuid) -> Result<Vec<LedgerRecord>> {
        let records = self.replay().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.operation_id == operation_id)
            .collect())
    }
}
