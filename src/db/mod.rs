//! SQLite trade journal.
//!
//! The in-memory trade history only lives as long as the process; every
//! executed trade is also appended here so `history` can show past sessions.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{Direction, TradeRecord};

/// Journal backed by a SQLite connection pool.
pub struct TradeJournal {
    pool: SqlitePool,
}

/// Journal row. Decimals are stored as text to keep exact values.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: i64,
    pub exchange: String,
    pub order_id: String,
    pub symbol: String,
    pub direction: String,
    pub size: String,
    pub entry_price: String,
    pub liquidation_price: String,
    pub executed_at: String,
}

impl StoredTrade {
    pub fn to_record(&self) -> Result<TradeRecord> {
        let decimal = |field: &str, value: &str| {
            Decimal::from_str(value).with_context(|| format!("Invalid {} '{}' in journal row {}", field, value, self.id))
        };

        Ok(TradeRecord {
            timestamp: DateTime::parse_from_rfc3339(&self.executed_at)
                .with_context(|| format!("Invalid timestamp in journal row {}", self.id))?
                .with_timezone(&Utc),
            symbol: self.symbol.clone(),
            direction: Direction::from_str(&self.direction)?,
            size: decimal("size", &self.size)?,
            entry_price: decimal("entry_price", &self.entry_price)?,
            liquidation_price: decimal("liquidation_price", &self.liquidation_price)?,
        })
    }
}

impl TradeJournal {
    /// Connect and create the schema if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to database {}", database_url))?;

        let journal = Self { pool };
        journal.run_migrations().await?;

        Ok(journal)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                exchange TEXT NOT NULL,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                size TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                liquidation_price TEXT NOT NULL,
                executed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create trades table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_executed_at ON trades(executed_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Append an executed trade and return its row id.
    pub async fn record_trade(&self, exchange: &str, order_id: &str, record: &TradeRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades
                (exchange, order_id, symbol, direction, size, entry_price, liquidation_price, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(exchange)
        .bind(order_id)
        .bind(&record.symbol)
        .bind(record.direction.as_str())
        .bind(record.size.to_string())
        .bind(record.entry_price.to_string())
        .bind(record.liquidation_price.to_string())
        .bind(record.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to record trade")?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent trades first.
    pub async fn recent_trades(&self, limit: u32) -> Result<Vec<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>("SELECT * FROM trades ORDER BY executed_at DESC, id DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to load trades")
    }

    pub async fn trade_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
