//! SQLite event store for the vault ledger.
//!
//! Persists vault history to survive restarts:
//! - Append-only ledger events, from which VaultState and the strategy table
//!   are rebuilt
//! - Periodic metric snapshots

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::vault::{VaultEvent, VaultMetrics};

/// A stored metrics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_capital: Decimal,
    pub idle: Decimal,
    pub share_price: Decimal,
    pub weighted_yield: Decimal,
}

/// SQLite-backed append-only event store.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open the store, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Event store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Ledger events, in apply order
            CREATE TABLE IF NOT EXISTS vault_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON vault_events(kind);

            -- Metric snapshots
            CREATE TABLE IF NOT EXISTS metric_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                total_capital TEXT NOT NULL,
                idle TEXT NOT NULL,
                share_price TEXT NOT NULL,
                weighted_yield TEXT NOT NULL,
                strategy_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON metric_snapshots(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Append events in one transaction. Returns the number written.
    pub fn append(&self, events: &[VaultEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        for event in events {
            let payload = serde_json::to_string(event).context("Failed to encode event")?;
            tx.execute(
                "INSERT INTO vault_events (timestamp, kind, payload) VALUES (?1, ?2, ?3)",
                params![event.timestamp.to_rfc3339(), event.kind.name(), payload],
            )?;
        }
        tx.commit()?;
        debug!(count = events.len(), "Events appended");
        Ok(events.len())
    }

    /// Every stored event in apply order.
    pub fn load_events(&self) -> Result<Vec<VaultEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, payload FROM vault_events ORDER BY seq ASC")?;
        let rows = stmt.query_map([], |row| {
            let seq: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            Ok((seq, payload))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, payload) = row?;
            let event: VaultEvent = serde_json::from_str(&payload)
                .with_context(|| format!("Corrupt event payload at seq {}", seq))?;
            events.push(event);
        }
        Ok(events)
    }

    /// The most recent `limit` events, newest first.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<VaultEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM vault_events ORDER BY seq DESC LIMIT ?1")?;
        let events = stmt
            .query_map([limit], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|payload| serde_json::from_str(&payload).ok())
            .collect();
        Ok(events)
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM vault_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Record a metrics snapshot.
    pub fn record_snapshot(&self, metrics: &VaultMetrics) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO metric_snapshots (timestamp, total_capital, idle, share_price,
                                          weighted_yield, strategy_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                Utc::now().to_rfc3339(),
                metrics.total_capital.to_string(),
                metrics.idle.to_string(),
                metrics.share_price.to_string(),
                metrics.weighted_yield.to_string(),
                metrics.allocations.len(),
            ],
        )?;
        Ok(())
    }

    /// Recent snapshots, newest first.
    pub fn recent_snapshots(&self, limit: usize) -> Result<Vec<MetricSnapshot>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, total_capital, idle, share_price, weighted_yield
            FROM metric_snapshots
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let snapshots = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(0)?;
                let total_capital: String = row.get(1)?;
                let idle: String = row.get(2)?;
                let share_price: String = row.get(3)?;
                let weighted_yield: String = row.get(4)?;
                Ok(MetricSnapshot {
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    total_capital: Decimal::from_str(&total_capital).unwrap_or_default(),
                    idle: Decimal::from_str(&idle).unwrap_or_default(),
                    share_price: Decimal::from_str(&share_price).unwrap_or_default(),
                    weighted_yield: Decimal::from_str(&weighted_yield).unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(snapshots)
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing event store");
        self.conn.execute_batch(
            r#"
            DELETE FROM vault_events;
            DELETE FROM metric_snapshots;
            "#,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyId;
    use crate::vault::VaultEventKind;
    use rust_decimal_macros::dec;

    fn sample_events() -> Vec<VaultEvent> {
        let now = Utc::now();
        vec![
            VaultEvent::new(
                VaultEventKind::Deposited {
                    depositor: "alice".to_string(),
                    amount: dec!(1000),
                    shares: dec!(1000),
                },
                now,
            ),
            VaultEvent::new(
                VaultEventKind::Deployed {
                    strategy_id: StrategyId::new("aave"),
                    amount: dec!(400),
                },
                now,
            ),
            VaultEvent::new(VaultEventKind::Rebalanced, now),
        ]
    }

    #[test]
    fn test_append_and_load_in_order() {
        let store = EventStore::new(":memory:").unwrap();
        let events = sample_events();

        assert_eq!(store.append(&events).unwrap(), 3);
        assert_eq!(store.event_count().unwrap(), 3);

        let loaded = store.load_events().unwrap();
        assert_eq!(loaded, events);

        let recent = store.recent_events(1).unwrap();
        assert_eq!(recent[0].kind, VaultEventKind::Rebalanced);
    }

    #[test]
    fn test_snapshots_newest_first() {
        let store = EventStore::new(":memory:").unwrap();
        let mut metrics = VaultMetrics {
            total_capital: dec!(1000),
            total_shares: dec!(1000),
            idle: dec!(100),
            share_price: dec!(1),
            allocations: Vec::new(),
            pending_yield: Decimal::ZERO,
            weighted_yield: dec!(0.07),
            written_off: Decimal::ZERO,
            emergency: false,
            halted: false,
            paused: false,
            last_rebalance: None,
        };
        store.record_snapshot(&metrics).unwrap();
        metrics.total_capital = dec!(1010);
        store.record_snapshot(&metrics).unwrap();

        let snapshots = store.recent_snapshots(10).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].total_capital, dec!(1010));
        assert_eq!(snapshots[1].weighted_yield, dec!(0.07));
    }

    #[test]
    fn test_clear_all() {
        let store = EventStore::new(":memory:").unwrap();
        store.append(&sample_events()).unwrap();
        store.clear_all().unwrap();
        assert_eq!(store.event_count().unwrap(), 0);
    }
}
