//! SQLite cycle journal.
//!
//! Records every rebalance cycle and the orders it produced:
//! - one `cycles` row per cycle with timing, counts and the abort reason
//! - one `orders` row per executed, failed or skipped action
//!
//! The last successful cycle's finish time lets a restarted process honour the
//! rebalance interval instead of trading immediately.

use crate::strategy::{ActionStatus, CycleReport, OrderOutcome, ReconciliationAction};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

/// A journaled cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRow {
    pub id: i64,
    pub number: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reversed: bool,
    pub interrupted: bool,
    pub scored: i64,
    pub skipped: i64,
    pub opened: i64,
    pub closed: i64,
    pub kept: i64,
    pub failed: i64,
    pub error: Option<String>,
}

/// A journaled order or skipped action.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRow {
    pub cycle_id: i64,
    pub symbol: String,
    pub action: String,
    pub side: String,
    pub quantity: Option<String>,
    pub outcome: String,
    pub order_id: Option<String>,
    pub detail: Option<String>,
}

/// SQLite-backed cycle journal.
pub struct CycleJournal {
    conn: Connection,
}

impl CycleJournal {
    /// Open (or create) the journal, creating parent directories as needed.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let journal = Self { conn };
        journal.init_schema()?;

        info!("Cycle journal initialized at {:?}", path);
        Ok(journal)
    }

    /// Journal that lives only as long as the connection.
    pub fn in_memory() -> Result<Self> {
        let journal = Self {
            conn: Connection::open_in_memory()?,
        };
        journal.init_schema()?;
        Ok(journal)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                number INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                reversed INTEGER NOT NULL,
                interrupted INTEGER NOT NULL,
                scored INTEGER NOT NULL,
                skipped INTEGER NOT NULL,
                opened INTEGER NOT NULL,
                closed INTEGER NOT NULL,
                kept INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id INTEGER NOT NULL REFERENCES cycles(id),
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT,
                outcome TEXT NOT NULL,
                order_id TEXT,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_orders_cycle ON orders(cycle_id);
            "#,
        )?;

        debug!("Journal schema initialized");
        Ok(())
    }

    /// Record a cycle and its order outcomes in one transaction. Returns the cycle id.
    pub fn record(&self, report: &CycleReport) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO cycles (number, started_at, finished_at, reversed, interrupted,
                                scored, skipped, opened, closed, kept, failed, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                report.number as i64,
                report.started_at.to_rfc3339(),
                report.finished_at.to_rfc3339(),
                report.reversed,
                report.interrupted,
                report.scored() as i64,
                report.skipped() as i64,
                report.opened() as i64,
                report.closed() as i64,
                report.kept() as i64,
                report.failed() as i64,
                report.error,
            ],
        )?;
        let cycle_id = tx.last_insert_rowid();

        for record in &report.context.execution.records {
            let (action, side) = match &record.action {
                ReconciliationAction::Open { side, .. } => ("OPEN", side),
                ReconciliationAction::Close { side, .. } => ("CLOSE", side),
            };

            let (quantity, outcome, order_id, detail) = match &record.status {
                ActionStatus::Submitted { quantity, outcome } => {
                    let quantity = Some(quantity.to_string());
                    match outcome {
                        OrderOutcome::Placed(receipt) => {
                            (quantity, "placed", Some(receipt.order_id.clone()), None)
                        }
                        OrderOutcome::Rejected(reason) => {
                            (quantity, "rejected", None, Some(reason.clone()))
                        }
                        OrderOutcome::Unknown(reason) => {
                            (quantity, "unknown", None, Some(reason.clone()))
                        }
                    }
                }
                ActionStatus::Skipped(reason) => (None, "skipped", None, Some(reason.clone())),
            };

            tx.execute(
                r#"
                INSERT INTO orders (cycle_id, symbol, action, side, quantity, outcome, order_id, detail)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    cycle_id,
                    record.action.instrument().symbol(),
                    action,
                    side.to_string(),
                    quantity,
                    outcome,
                    order_id,
                    detail,
                ],
            )?;
        }

        for pending in &report.context.execution.unexecuted {
            let (action, side) = match pending {
                ReconciliationAction::Open { side, .. } => ("OPEN", side),
                ReconciliationAction::Close { side, .. } => ("CLOSE", side),
            };
            tx.execute(
                r#"
                INSERT INTO orders (cycle_id, symbol, action, side, outcome, detail)
                VALUES (?1, ?2, ?3, ?4, 'unexecuted', 'shutdown requested')
                "#,
                params![cycle_id, pending.instrument().symbol(), action, side.to_string()],
            )?;
        }

        tx.commit()?;
        debug!(cycle_id, "Cycle journaled");
        Ok(cycle_id)
    }

    /// Finish time of the most recent cycle that completed without error or interruption.
    pub fn last_success(&self) -> Result<Option<DateTime<Utc>>> {
        let finished: Option<String> = self
            .conn
            .query_row(
                r#"
                SELECT finished_at FROM cycles
                WHERE error IS NULL AND interrupted = 0
                ORDER BY id DESC LIMIT 1
                "#,
                [],
                |row| row.get(0),
            )
            .optional()?;

        finished.map(|s| parse_time(&s)).transpose()
    }

    /// Most recent cycles, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<CycleRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, number, started_at, finished_at, reversed, interrupted,
                   scored, skipped, opened, closed, kept, failed, error
            FROM cycles ORDER BY id DESC LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, bool>(5)?,
                [
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, i64>(11)?,
                ],
                row.get::<_, Option<String>>(12)?,
            ))
        })?;

        let mut cycles = Vec::new();
        for row in rows {
            let (id, number, started, finished, reversed, interrupted, counts, error) = row?;
            let [scored, skipped, opened, closed, kept, failed] = counts;
            cycles.push(CycleRow {
                id,
                number,
                started_at: parse_time(&started)?,
                finished_at: parse_time(&finished)?,
                reversed,
                interrupted,
                scored,
                skipped,
                opened,
                closed,
                kept,
                failed,
                error,
            });
        }

        Ok(cycles)
    }

    /// Orders recorded for one cycle, in execution order.
    pub fn orders_for(&self, cycle_id: i64) -> Result<Vec<OrderRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT cycle_id, symbol, action, side, quantity, outcome, order_id, detail
            FROM orders WHERE cycle_id = ?1 ORDER BY id
            "#,
        )?;

        let rows = stmt
            .query_map(params![cycle_id], |row| {
                Ok(OrderRow {
                    cycle_id: row.get(0)?,
                    symbol: row.get(1)?,
                    action: row.get(2)?,
                    side: row.get(3)?,
                    quantity: row.get(4)?,
                    outcome: row.get(5)?,
                    order_id: row.get(6)?,
                    detail: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp {:?}", s))?
        .with_timezone(&Utc))
}
