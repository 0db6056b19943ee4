//! In-memory aggregate repository
//!
//! Two ordered tables (1s and 10s windows) keyed on
//! `(timestamp, signal_name)`, which makes the unique-key upsert and the
//! (timestamp asc, signal asc) query ordering fall out of the map itself.

use super::{AggregateRepository, AggregateRow, Window};
use crate::types::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

type Table = BTreeMap<(i64, String), AggregateRow>;

#[derive(Default)]
struct Tables {
    one_second: Table,
    ten_seconds: Table,
}

impl Tables {
    fn table_mut(&mut self, window: Window) -> &mut Table {
        match window {
            Window::OneSecond => &mut self.one_second,
            Window::TenSeconds => &mut self.ten_seconds,
        }
    }

    fn table(&self, window: Window) -> &Table {
        match window {
            Window::OneSecond => &self.one_second,
            Window::TenSeconds => &self.ten_seconds,
        }
    }
}

/// In-memory implementation of [`AggregateRepository`]
pub struct MemoryAggregateRepository {
    tables: Mutex<Tables>,
}

impl MemoryAggregateRepository {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Total rows across both tables (used by tests and introspection)
    pub async fn row_count(&self) -> usize {
        let tables = self.tables.lock().await;
        tables.one_second.len() + tables.ten_seconds.len()
    }
}

impl Default for MemoryAggregateRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregateRepository for MemoryAggregateRepository {
    async fn upsert_batch(&self, rows: Vec<(Window, AggregateRow)>) -> Result<()> {
        // One lock acquisition for the whole batch keeps the flush atomic
        let mut tables = self.tables.lock().await;
        for (window, row) in rows {
            tables
                .table_mut(window)
                .insert((row.timestamp, row.signal_name.clone()), row);
        }
        Ok(())
    }

    async fn range_query(
        &self,
        window: Window,
        signals: &[String],
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<AggregateRow>> {
        let tables = self.tables.lock().await;
        let rows = tables
            .table(window)
            .range((from_ms, String::new())..=(to_ms, String::from("\u{10FFFF}")))
            .filter(|((_, signal), _)| signals.iter().any(|s| s == signal))
            .map(|(_, row)| row.clone())
            .collect();
        Ok(rows)
    }

    async fn latest(&self, signal: &str) -> Result<Option<AggregateRow>> {
        let tables = self.tables.lock().await;
        // Prefer the finer table on timestamp ties
        let fine = newest_for(tables.table(Window::OneSecond), signal);
        let coarse = newest_for(tables.table(Window::TenSeconds), signal);
        Ok(match (fine, coarse) {
            (Some(f), Some(c)) if c.timestamp > f.timestamp => Some(c),
            (Some(f), _) => Some(f),
            (None, c) => c,
        })
    }

    async fn delete_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut removed = 0u64;
        for window in [Window::OneSecond, Window::TenSeconds] {
            let table = tables.table_mut(window);
            let before = table.len();
            table.retain(|(ts, _), _| *ts >= cutoff_ms);
            removed += (before - table.len()) as u64;
        }
        Ok(removed)
    }

    async fn reclaim(&self) -> Result<()> {
        // BTreeMaps release nodes on removal; nothing further to compact.
        // A database-backed repository would vacuum here.
        Ok(())
    }
}

fn newest_for(table: &Table, signal: &str) -> Option<AggregateRow> {
    table
        .iter()
        .rev()
        .find(|((_, s), _)| s == signal)
        .map(|(_, row)| row.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ts: i64, signal: &str, value: f64) -> AggregateRow {
        AggregateRow {
            timestamp: ts,
            signal_name: signal.to_string(),
            last_value: value,
            first_value: value,
            avg_value: value,
            max_value: value,
            min_value: value,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_on_key_collision() {
        let repo = MemoryAggregateRepository::new();
        repo.upsert_batch(vec![(Window::OneSecond, row(1000, "S", 1.0))])
            .await
            .unwrap();
        repo.upsert_batch(vec![(Window::OneSecond, row(1000, "S", 2.0))])
            .await
            .unwrap();

        assert_eq!(repo.row_count().await, 1);
        let rows = repo
            .range_query(Window::OneSecond, &["S".to_string()], 0, 2000)
            .await
            .unwrap();
        assert_eq!(rows[0].last_value, 2.0);
    }

    #[tokio::test]
    async fn test_range_bounds_inclusive() {
        let repo = MemoryAggregateRepository::new();
        repo.upsert_batch(vec![
            (Window::OneSecond, row(1000, "S", 1.0)),
            (Window::OneSecond, row(2000, "S", 2.0)),
            (Window::OneSecond, row(3000, "S", 3.0)),
        ])
        .await
        .unwrap();

        let rows = repo
            .range_query(Window::OneSecond, &["S".to_string()], 1000, 2000)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_latest_prefers_newest_across_windows() {
        let repo = MemoryAggregateRepository::new();
        repo.upsert_batch(vec![
            (Window::OneSecond, row(1000, "S", 1.0)),
            (Window::TenSeconds, row(10_000, "S", 5.0)),
        ])
        .await
        .unwrap();

        let latest = repo.latest("S").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, 10_000);
        assert_eq!(latest.last_value, 5.0);
        assert!(repo.latest("Missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_older_than() {
        let repo = MemoryAggregateRepository::new();
        repo.upsert_batch(vec![
            (Window::OneSecond, row(1000, "S", 1.0)),
            (Window::TenSeconds, row(0, "S", 1.0)),
            (Window::OneSecond, row(5000, "S", 2.0)),
        ])
        .await
        .unwrap();

        let removed = repo.delete_older_than(5000).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.row_count().await, 1);
        repo.reclaim().await.unwrap();
    }
}
