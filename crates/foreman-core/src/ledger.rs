use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use foreman_config::{BudgetsConfig, TierPricing, TokenBudget};
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::task::Tier;

/// A single model-call cost record. Append-only; rows are never mutated.
#[derive(Debug, Clone)]
pub struct CostLogEntry {
    pub task_id: String,
    pub timestamp: String,
    pub tier: Tier,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl CostLogEntry {
    /// Build an entry stamped with the current UTC time.
    pub fn now(
        task_id: &str,
        tier: Tier,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            tier,
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }
}

/// USD cost of a call given actual token counts.
pub fn call_cost(input_tokens: u64, output_tokens: u64, pricing: &TierPricing) -> f64 {
    let input = (input_tokens as f64 / 1_000_000.0) * pricing.input;
    let output = (output_tokens as f64 / 1_000_000.0) * pricing.output;
    input + output
}

/// Worst-case USD cost of the next call, from the tier's token budget.
/// Used for the pre-call ceiling check, where actual usage is unknown.
pub fn estimate_call_cost(budget: &TokenBudget, pricing: &TierPricing) -> f64 {
    call_cost(budget.max_input, budget.max_output, pricing)
}

/// Which ceiling a proposed call would break.
#[derive(Debug, Clone, PartialEq)]
pub enum Breach {
    PerTask { spent: f64, ceiling: f64 },
    Daily { spent: f64, ceiling: f64 },
    Monthly { spent: f64, ceiling: f64 },
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Breach::PerTask { spent, ceiling } => {
                write!(f, "task budget (${ceiling:.2}) reached; spent ${spent:.4} so far")
            }
            Breach::Daily { spent, ceiling } => {
                write!(f, "daily budget (${ceiling:.2}) reached; spent ${spent:.4} today")
            }
            Breach::Monthly { spent, ceiling } => {
                write!(f, "monthly budget (${ceiling:.2}) reached; spent ${spent:.4} this month")
            }
        }
    }
}

/// Per-day spend row for reports.
#[derive(Debug, Serialize)]
pub struct DaySpend {
    pub day: String,
    pub calls: u64,
    pub cost_usd: f64,
}

/// Per-task spend row for reports.
#[derive(Debug, Serialize)]
pub struct TaskSpend {
    pub task_id: String,
    pub calls: u64,
    pub cost_usd: f64,
}

/// SQLite-backed cost log. Day and month aggregation prefix-matches the
/// ISO-8601 timestamp column rather than relying on a rollup job.
pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cost_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                task_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cost_timestamp ON cost_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_cost_task ON cost_log(task_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("ledger lock poisoned: {e}"))
    }

    pub fn append(&self, entry: &CostLogEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO cost_log (timestamp, task_id, tier, model, input_tokens, output_tokens, cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.timestamp,
                entry.task_id,
                entry.tier.as_str(),
                entry.model,
                entry.input_tokens as i64,
                entry.output_tokens as i64,
                entry.cost_usd,
            ],
        )?;
        Ok(())
    }

    pub fn task_total(&self, task_id: &str) -> Result<f64> {
        let conn = self.lock_conn()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0) FROM cost_log WHERE task_id = ?1",
            [task_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Spend for any ISO-8601 timestamp prefix ("2026-08-06" for a UTC day,
    /// "2026-08" for a month).
    pub fn prefix_total(&self, prefix: &str) -> Result<f64> {
        let conn = self.lock_conn()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0) FROM cost_log WHERE timestamp LIKE ?1",
            [format!("{prefix}%")],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn daily_report(&self, limit: usize) -> Result<Vec<DaySpend>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT substr(timestamp, 1, 10) AS day, COUNT(*), SUM(cost_usd)
             FROM cost_log GROUP BY day ORDER BY day DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(DaySpend {
                    day: row.get(0)?,
                    calls: row.get::<_, i64>(1)? as u64,
                    cost_usd: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn task_report(&self, limit: usize) -> Result<Vec<TaskSpend>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, COUNT(*), SUM(cost_usd)
             FROM cost_log GROUP BY task_id ORDER BY MAX(timestamp) DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(TaskSpend {
                    task_id: row.get(0)?,
                    calls: row.get::<_, i64>(1)? as u64,
                    cost_usd: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Ceiling check for a proposed call. `None` means the call may be
    /// issued; the estimate must already include the worst case.
    fn check(&self, task_id: &str, estimated_usd: f64, ceilings: &BudgetsConfig) -> Result<Option<Breach>> {
        let task_spent = self.task_total(task_id)?;
        if task_spent + estimated_usd > ceilings.per_task_usd {
            return Ok(Some(Breach::PerTask {
                spent: task_spent,
                ceiling: ceilings.per_task_usd,
            }));
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let day_spent = self.prefix_total(&today)?;
        if day_spent + estimated_usd > ceilings.daily_usd {
            return Ok(Some(Breach::Daily {
                spent: day_spent,
                ceiling: ceilings.daily_usd,
            }));
        }

        let month = Utc::now().format("%Y-%m").to_string();
        let month_spent = self.prefix_total(&month)?;
        if month_spent + estimated_usd > ceilings.monthly_usd {
            return Ok(Some(Breach::Monthly {
                spent: month_spent,
                ceiling: ceilings.monthly_usd,
            }));
        }

        Ok(None)
    }
}

/// Spend aggregation scopes exposed on the service handle.
#[derive(Debug, Clone)]
pub enum SpendScope {
    Task(String),
    Today,
    ThisMonth,
}

enum LedgerRequest {
    Record {
        entry: CostLogEntry,
        reply: oneshot::Sender<Result<()>>,
    },
    Check {
        task_id: String,
        estimated_usd: f64,
        reply: oneshot::Sender<Result<Option<Breach>>>,
    },
    Spent {
        scope: SpendScope,
        reply: oneshot::Sender<Result<f64>>,
    },
    DailyReport {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<DaySpend>>>,
    },
    TaskReport {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<TaskSpend>>>,
    },
}

/// Handle to the single-writer ledger service. All tasks submit appends and
/// checks through one serialized channel, so aggregate updates cannot race.
#[derive(Clone)]
pub struct Ledger {
    tx: mpsc::Sender<LedgerRequest>,
}

impl Ledger {
    /// Move the store into a service task and return the shared handle.
    pub fn spawn(store: LedgerStore, ceilings: BudgetsConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<LedgerRequest>(64);

        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                match req {
                    LedgerRequest::Record { entry, reply } => {
                        let _ = reply.send(store.append(&entry));
                    }
                    LedgerRequest::Check {
                        task_id,
                        estimated_usd,
                        reply,
                    } => {
                        let _ = reply.send(store.check(&task_id, estimated_usd, &ceilings));
                    }
                    LedgerRequest::Spent { scope, reply } => {
                        let result = match scope {
                            SpendScope::Task(id) => store.task_total(&id),
                            SpendScope::Today => {
                                store.prefix_total(&Utc::now().format("%Y-%m-%d").to_string())
                            }
                            SpendScope::ThisMonth => {
                                store.prefix_total(&Utc::now().format("%Y-%m").to_string())
                            }
                        };
                        let _ = reply.send(result);
                    }
                    LedgerRequest::DailyReport { limit, reply } => {
                        let _ = reply.send(store.daily_report(limit));
                    }
                    LedgerRequest::TaskReport { limit, reply } => {
                        let _ = reply.send(store.task_report(limit));
                    }
                }
            }
        });

        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerRequest,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("ledger service stopped"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("ledger service dropped request"))?
    }

    /// Append a cost record. An error here means the spend was not durably
    /// recorded and the caller must treat the step as failed.
    pub async fn record(&self, entry: CostLogEntry) -> Result<()> {
        self.request(|reply| LedgerRequest::Record { entry, reply }).await
    }

    /// Would a call with the given estimated cost breach any ceiling?
    pub async fn check(&self, task_id: &str, estimated_usd: f64) -> Result<Option<Breach>> {
        let task_id = task_id.to_string();
        self.request(|reply| LedgerRequest::Check {
            task_id,
            estimated_usd,
            reply,
        })
        .await
    }

    pub async fn spent(&self, scope: SpendScope) -> Result<f64> {
        self.request(|reply| LedgerRequest::Spent { scope, reply }).await
    }

    pub async fn daily_report(&self, limit: usize) -> Result<Vec<DaySpend>> {
        self.request(|reply| LedgerRequest::DailyReport { limit, reply }).await
    }

    pub async fn task_report(&self, limit: usize) -> Result<Vec<TaskSpend>> {
        self.request(|reply| LedgerRequest::TaskReport { limit, reply }).await
    }
}
