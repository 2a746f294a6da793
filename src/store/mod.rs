// =============================================================================
// Findings Store — SQLite persistence for findings, agents, and councils
// =============================================================================
//
// Tables: findings, agent_status, uncertainty_events, council_results,
// council_voting_stats, deals. WAL mode for concurrent reads during writes.
//
// Transactional contract: a run's findings are inserted in one transaction,
// and the triple-confirmation gate's write-back (finding update + council
// result row + voting-stat bump) commits or rolls back as a unit. Every
// storage failure surfaces as the single `StoreError::Unavailable` kind so
// callers never partially commit on I/O errors.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::{FindingDraft, Severity, Verdict};

// =============================================================================
// Error kind
// =============================================================================

/// The single storage error kind. All SQLite and I/O failures map here.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Records
// =============================================================================

/// A persisted finding, including the analysis fields the gate writes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingRecord {
    pub id: i64,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub confidence: f64,
    pub metadata: serde_json::Value,
    pub symbol: Option<String>,
    pub market_type: Option<String>,

    pub consensus_action: Option<Verdict>,
    pub consensus_confidence: Option<f64>,
    pub llm_votes: Option<serde_json::Value>,
    pub llm_disagreement: bool,
    pub auto_analyzed: bool,
    pub ta_regime: Option<String>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub alerted: bool,

    pub ta_council: Option<String>,
    pub fund_council: Option<String>,
    pub real_estate_council: Option<String>,
}

impl FindingRecord {
    /// JSON payload handed to the LLM council prompt.
    pub fn to_prompt_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "agent_name": self.agent_name,
            "title": self.title,
            "description": self.description,
            "severity": self.severity,
            "confidence": self.confidence,
            "symbol": self.symbol,
            "market_type": self.market_type,
            "metadata": self.metadata,
        })
    }
}

/// Gate write-back applied to a finding in one transaction.
#[derive(Debug, Clone)]
pub struct FindingAnalysis {
    pub consensus_action: Verdict,
    pub consensus_confidence: f64,
    pub llm_votes: serde_json::Value,
    pub llm_disagreement: bool,
    pub ta_regime: Option<String>,
    /// Mean council confidence before TA blending; stored on the council row.
    pub council_agreement: f64,
    /// Disagreement score in [0,1] stored on the council row.
    pub council_uncertainty: f64,
}

/// Runtime status row for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusRecord {
    pub agent_name: String,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub schedule_interval: i64,
}

/// Per (agent, regime) council voting counters used for fail-first learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilVotingStat {
    pub agent_name: String,
    pub regime: String,
    pub votes_act: i64,
    pub votes_watch: i64,
    pub votes_ignore: i64,
    pub first_failure_ts: Option<DateTime<Utc>>,
    pub last_ignore_ts: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl CouncilVotingStat {
    pub fn total_votes(&self) -> i64 {
        self.votes_act + self.votes_watch + self.votes_ignore
    }

    pub fn ignore_rate(&self) -> f64 {
        let total = self.total_votes();
        if total == 0 {
            0.0
        } else {
            self.votes_ignore as f64 / total as f64
        }
    }
}

/// A persisted uncertainty-council outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyEventRecord {
    #[serde(default)]
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub score: f64,
    pub spike: bool,
    pub disagreement: f64,
    pub votes: serde_json::Value,
    pub active_regime: Option<String>,
    pub regime_confidence: Option<f64>,
    pub cadence_multiplier: f64,
    pub decay_multiplier: f64,
}

// =============================================================================
// Store
// =============================================================================

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS findings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'medium',
    confidence REAL NOT NULL DEFAULT 0.5,
    metadata TEXT,
    symbol TEXT,
    market_type TEXT,
    consensus_action TEXT,
    consensus_confidence REAL,
    llm_votes TEXT,
    llm_disagreement INTEGER NOT NULL DEFAULT 0,
    auto_analyzed INTEGER NOT NULL DEFAULT 0,
    ta_regime TEXT,
    analyzed_at TEXT,
    alerted INTEGER NOT NULL DEFAULT 0,
    ta_council TEXT,
    fund_council TEXT,
    real_estate_council TEXT
);
CREATE INDEX IF NOT EXISTS idx_findings_ts ON findings(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_findings_agent ON findings(agent_name, timestamp DESC);

CREATE TABLE IF NOT EXISTS agent_status (
    agent_name TEXT PRIMARY KEY,
    is_active INTEGER NOT NULL DEFAULT 0,
    last_run TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    schedule_interval INTEGER NOT NULL DEFAULT 60
);

CREATE TABLE IF NOT EXISTS uncertainty_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    label TEXT NOT NULL,
    score REAL NOT NULL,
    spike INTEGER NOT NULL DEFAULT 0,
    disagreement REAL NOT NULL DEFAULT 0,
    votes TEXT,
    active_regime TEXT,
    regime_confidence REAL,
    cadence_multiplier REAL NOT NULL DEFAULT 1.0,
    decay_multiplier REAL NOT NULL DEFAULT 1.0
);
CREATE INDEX IF NOT EXISTS idx_uncertainty_ts ON uncertainty_events(timestamp DESC);

CREATE TABLE IF NOT EXISTS council_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    finding_id INTEGER NOT NULL,
    agent_name TEXT NOT NULL,
    consensus TEXT NOT NULL,
    agreement REAL NOT NULL,
    uncertainty REAL NOT NULL,
    raw_votes TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_council_agent ON council_results(agent_name, created_at DESC);

CREATE TABLE IF NOT EXISTS council_voting_stats (
    agent_name TEXT NOT NULL,
    regime TEXT NOT NULL,
    votes_act INTEGER NOT NULL DEFAULT 0,
    votes_watch INTEGER NOT NULL DEFAULT 0,
    votes_ignore INTEGER NOT NULL DEFAULT 0,
    first_failure_ts TEXT,
    last_ignore_ts TEXT,
    last_updated TEXT,
    PRIMARY KEY (agent_name, regime)
);

CREATE TABLE IF NOT EXISTS deals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    finding_id INTEGER NOT NULL UNIQUE,
    source_agent TEXT NOT NULL,
    reference TEXT NOT NULL,
    stage TEXT NOT NULL DEFAULT 'screened',
    deal_metadata TEXT,
    created_at TEXT NOT NULL
);
"#;

/// SQLite-backed store shared across the runtime via `Arc`.
pub struct FindingsStore {
    conn: Mutex<Connection>,
}

impl FindingsStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = %path.display(), "findings store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Findings ────────────────────────────────────────────────────────

    /// Insert a batch of drafts from one agent run in a single transaction.
    /// Returns the new ids in the order the drafts were produced.
    pub fn insert_findings(
        &self,
        agent_name: &str,
        drafts: &[FindingDraft],
    ) -> StoreResult<Vec<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            tx.execute(
                "INSERT INTO findings
                   (agent_name, timestamp, title, description, severity,
                    confidence, metadata, symbol, market_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    agent_name,
                    now,
                    draft.title,
                    draft.description,
                    draft.severity.to_string(),
                    draft.confidence.clamp(0.0, 1.0),
                    serde_json::to_string(&draft.metadata).unwrap_or_default(),
                    draft.symbol,
                    draft.market_type,
                ],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(ids)
    }

    pub fn get_finding(&self, id: i64) -> StoreResult<Option<FindingRecord>> {
        let conn = self.conn.lock();
        let rec = conn
            .query_row(
                "SELECT * FROM findings WHERE id = ?1",
                params![id],
                row_to_finding,
            )
            .optional()?;
        Ok(rec)
    }

    /// Most recent findings, newest first.
    pub fn recent_findings(&self, limit: usize) -> StoreResult<Vec<FindingRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM findings ORDER BY timestamp DESC, id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_finding)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// (agent, timestamp) pairs of the most recent findings, oldest first.
    /// Feeds the redundancy correlation over binary firing vectors.
    pub fn recent_firings(&self, limit: usize) -> StoreResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT agent_name, timestamp FROM findings
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Apply the gate's analysis in one transaction: update the finding,
    /// insert the council-result audit row, and bump the per-(agent, regime)
    /// voting counters.
    pub fn apply_analysis(
        &self,
        finding_id: i64,
        agent_name: &str,
        regime: &str,
        analysis: &FindingAnalysis,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "UPDATE findings SET
               consensus_action = ?1, consensus_confidence = ?2, llm_votes = ?3,
               llm_disagreement = ?4, auto_analyzed = 1, ta_regime = ?5,
               analyzed_at = ?6
             WHERE id = ?7",
            params![
                analysis.consensus_action.to_string(),
                analysis.consensus_confidence,
                serde_json::to_string(&analysis.llm_votes).unwrap_or_default(),
                analysis.llm_disagreement as i64,
                analysis.ta_regime,
                now,
                finding_id,
            ],
        )?;

        tx.execute(
            "INSERT INTO council_results
               (finding_id, agent_name, consensus, agreement, uncertainty,
                raw_votes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                finding_id,
                agent_name,
                analysis.consensus_action.to_string(),
                analysis.council_agreement,
                analysis.council_uncertainty,
                serde_json::to_string(&analysis.llm_votes).unwrap_or_default(),
                now,
            ],
        )?;

        tx.execute(
            "INSERT INTO council_voting_stats (agent_name, regime, last_updated)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_name, regime) DO UPDATE SET last_updated = ?3",
            params![agent_name, regime, now],
        )?;
        match analysis.consensus_action {
            Verdict::Act => tx.execute(
                "UPDATE council_voting_stats SET votes_act = votes_act + 1
                 WHERE agent_name = ?1 AND regime = ?2",
                params![agent_name, regime],
            )?,
            Verdict::Watch => tx.execute(
                "UPDATE council_voting_stats SET votes_watch = votes_watch + 1
                 WHERE agent_name = ?1 AND regime = ?2",
                params![agent_name, regime],
            )?,
            Verdict::Ignore => tx.execute(
                "UPDATE council_voting_stats SET
                   votes_ignore = votes_ignore + 1,
                   last_ignore_ts = ?3,
                   first_failure_ts = COALESCE(first_failure_ts, ?3)
                 WHERE agent_name = ?1 AND regime = ?2",
                params![agent_name, regime, now],
            )?,
        };

        tx.commit()?;
        Ok(())
    }

    /// Set `alerted = 1`. Called only after the notifier reports success.
    pub fn mark_alerted(&self, finding_id: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE findings SET alerted = 1 WHERE id = ?1",
            params![finding_id],
        )?;
        Ok(())
    }

    /// Backfill the optional per-council verdict columns.
    pub fn set_council_backfill(
        &self,
        finding_id: i64,
        ta: Option<&str>,
        fund: Option<&str>,
        real_estate: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE findings SET
               ta_council = COALESCE(?1, ta_council),
               fund_council = COALESCE(?2, fund_council),
               real_estate_council = COALESCE(?3, real_estate_council)
             WHERE id = ?4",
            params![ta, fund, real_estate, finding_id],
        )?;
        Ok(())
    }

    // ── Agent status ────────────────────────────────────────────────────

    /// Create the status row for a newly registered agent if it does not
    /// exist yet; always updates the configured interval.
    pub fn ensure_agent(&self, agent_name: &str, interval_minutes: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_status (agent_name, schedule_interval)
             VALUES (?1, ?2)
             ON CONFLICT(agent_name) DO UPDATE SET schedule_interval = ?2",
            params![agent_name, interval_minutes],
        )?;
        Ok(())
    }

    pub fn set_agent_active(&self, agent_name: &str, active: bool) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_status SET is_active = ?2 WHERE agent_name = ?1",
            params![agent_name, active as i64],
        )?;
        Ok(())
    }

    pub fn set_agent_interval(&self, agent_name: &str, interval_minutes: i64) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_status SET schedule_interval = ?2 WHERE agent_name = ?1",
            params![agent_name, interval_minutes],
        )?;
        Ok(())
    }

    /// Record a successful run: bump the counter, clear the last error.
    pub fn record_run_ok(&self, agent_name: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_status SET
               last_run = ?2, run_count = run_count + 1, last_error = NULL
             WHERE agent_name = ?1",
            params![agent_name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record a failed run; the error message is truncated to 500 chars.
    pub fn record_run_error(&self, agent_name: &str, error: &str) -> StoreResult<()> {
        let truncated: String = error.chars().take(500).collect();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_status SET
               last_run = ?2, error_count = error_count + 1, last_error = ?3
             WHERE agent_name = ?1",
            params![agent_name, Utc::now().to_rfc3339(), truncated],
        )?;
        Ok(())
    }

    pub fn agent_statuses(&self) -> StoreResult<Vec<AgentStatusRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM agent_status ORDER BY agent_name ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AgentStatusRecord {
                    agent_name: row.get("agent_name")?,
                    is_active: row.get::<_, i64>("is_active")? != 0,
                    last_run: parse_ts_opt(row.get::<_, Option<String>>("last_run")?),
                    run_count: row.get("run_count")?,
                    error_count: row.get("error_count")?,
                    last_error: row.get("last_error")?,
                    schedule_interval: row.get("schedule_interval")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Uncertainty events ──────────────────────────────────────────────

    pub fn insert_uncertainty_event(&self, rec: &UncertaintyEventRecord) -> StoreResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO uncertainty_events
               (timestamp, label, score, spike, disagreement, votes,
                active_regime, regime_confidence, cadence_multiplier,
                decay_multiplier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rec.timestamp.to_rfc3339(),
                rec.label,
                rec.score,
                rec.spike as i64,
                rec.disagreement,
                serde_json::to_string(&rec.votes).unwrap_or_default(),
                rec.active_regime,
                rec.regime_confidence,
                rec.cadence_multiplier,
                rec.decay_multiplier,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Uncertainty events newer than `since`, oldest first.
    pub fn uncertainty_events_since(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<UncertaintyEventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM uncertainty_events WHERE timestamp >= ?1
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], row_to_uncertainty)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest_uncertainty_event(&self) -> StoreResult<Option<UncertaintyEventRecord>> {
        let conn = self.conn.lock();
        let rec = conn
            .query_row(
                "SELECT * FROM uncertainty_events ORDER BY timestamp DESC, id DESC LIMIT 1",
                [],
                row_to_uncertainty,
            )
            .optional()?;
        Ok(rec)
    }

    // ── Council stats ───────────────────────────────────────────────────

    pub fn voting_stat(
        &self,
        agent_name: &str,
        regime: &str,
    ) -> StoreResult<Option<CouncilVotingStat>> {
        let conn = self.conn.lock();
        let rec = conn
            .query_row(
                "SELECT * FROM council_voting_stats
                 WHERE agent_name = ?1 AND regime = ?2",
                params![agent_name, regime],
                row_to_voting_stat,
            )
            .optional()?;
        Ok(rec)
    }

    /// Mean council uncertainty per agent since `since`, from the audit rows.
    pub fn agent_uncertainty_averages(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<HashMap<String, f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT agent_name, AVG(uncertainty) FROM council_results
             WHERE created_at >= ?1 GROUP BY agent_name",
        )?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().collect())
    }

    // ── Deals ───────────────────────────────────────────────────────────

    /// Create one deal per finding; idempotent on `finding_id`. Returns true
    /// when a new deal row was created.
    pub fn insert_deal_if_absent(
        &self,
        finding_id: i64,
        source_agent: &str,
        reference: &str,
        metadata: &serde_json::Value,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO deals
               (finding_id, source_agent, reference, deal_metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                finding_id,
                source_agent,
                reference,
                serde_json::to_string(metadata).unwrap_or_default(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn deal_count(&self) -> StoreResult<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM deals", [], |r| r.get(0))?;
        Ok(count)
    }
}

// =============================================================================
// Row mappers
// =============================================================================

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn parse_json_opt(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_finding(row: &Row<'_>) -> rusqlite::Result<FindingRecord> {
    Ok(FindingRecord {
        id: row.get("id")?,
        agent_name: row.get("agent_name")?,
        timestamp: parse_ts(row.get("timestamp")?),
        title: row.get("title")?,
        description: row.get("description")?,
        severity: Severity::parse(&row.get::<_, String>("severity")?),
        confidence: row.get("confidence")?,
        metadata: parse_json_opt(row.get::<_, Option<String>>("metadata")?)
            .unwrap_or(serde_json::Value::Null),
        symbol: row.get("symbol")?,
        market_type: row.get("market_type")?,
        consensus_action: row
            .get::<_, Option<String>>("consensus_action")?
            .map(|s| Verdict::parse(&s)),
        consensus_confidence: row.get("consensus_confidence")?,
        llm_votes: parse_json_opt(row.get::<_, Option<String>>("llm_votes")?),
        llm_disagreement: row.get::<_, i64>("llm_disagreement")? != 0,
        auto_analyzed: row.get::<_, i64>("auto_analyzed")? != 0,
        ta_regime: row.get("ta_regime")?,
        analyzed_at: parse_ts_opt(row.get::<_, Option<String>>("analyzed_at")?),
        alerted: row.get::<_, i64>("alerted")? != 0,
        ta_council: row.get("ta_council")?,
        fund_council: row.get("fund_council")?,
        real_estate_council: row.get("real_estate_council")?,
    })
}

fn row_to_uncertainty(row: &Row<'_>) -> rusqlite::Result<UncertaintyEventRecord> {
    Ok(UncertaintyEventRecord {
        id: row.get("id")?,
        timestamp: parse_ts(row.get("timestamp")?),
        label: row.get("label")?,
        score: row.get("score")?,
        spike: row.get::<_, i64>("spike")? != 0,
        disagreement: row.get("disagreement")?,
        votes: parse_json_opt(row.get::<_, Option<String>>("votes")?)
            .unwrap_or(serde_json::Value::Null),
        active_regime: row.get("active_regime")?,
        regime_confidence: row.get("regime_confidence")?,
        cadence_multiplier: row.get("cadence_multiplier")?,
        decay_multiplier: row.get("decay_multiplier")?,
    })
}

fn row_to_voting_stat(row: &Row<'_>) -> rusqlite::Result<CouncilVotingStat> {
    Ok(CouncilVotingStat {
        agent_name: row.get("agent_name")?,
        regime: row.get("regime")?,
        votes_act: row.get("votes_act")?,
        votes_watch: row.get("votes_watch")?,
        votes_ignore: row.get("votes_ignore")?,
        first_failure_ts: parse_ts_opt(row.get::<_, Option<String>>("first_failure_ts")?),
        last_ignore_ts: parse_ts_opt(row.get::<_, Option<String>>("last_ignore_ts")?),
        last_updated: parse_ts_opt(row.get::<_, Option<String>>("last_updated")?),
    })
}
