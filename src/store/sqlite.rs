use std::str::FromStr;

use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use tracing::warn;

use crate::error::StoreError;
use crate::model::{AlarmRecord, Condition, ExchangeKind};
use crate::store::AlarmStore;

type AlarmRow = (i64, i64, i64, String, String);
type ConditionRow = (
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

pub struct SqliteAlarmStore {
    pool: SqlitePool,
}

impl SqliteAlarmStore {
    /// Open (or create) the alarm database and run migrations.
    pub async fn open(database_url: &str) -> Result<Self, Report<StoreError>> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .change_context(StoreError::Migration)
            .attach_with(|| format!("database url: {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StoreError::Migration)
            .attach_with(|| format!("database url: {database_url}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StoreError::Migration)?;

        Ok(Self { pool })
    }
}

impl AlarmStore for SqliteAlarmStore {
    fn select_enabled_alarms(
        &self,
    ) -> BoxFuture<'_, Result<Vec<AlarmRecord>, Report<StoreError>>> {
        Box::pin(async move {
            let rows: Vec<AlarmRow> = sqlx::query_as(
                "SELECT alarm_id, channel_id, exchange_id, base_symbol, quote_symbol \
                 FROM alarm \
                 WHERE is_enabled = 1 \
                 ORDER BY alarm_id",
            )
            .fetch_all(&self.pool)
            .await
            .change_context(StoreError::Query)?;

            let records = rows
                .into_iter()
                .filter_map(
                    |(alarm_id, channel_id, exchange_id, base_symbol, quote_symbol)| {
                        let Some(exchange) = ExchangeKind::from_id(exchange_id) else {
                            warn!(alarm_id, exchange_id, "skipping alarm with unknown exchange id");
                            return None;
                        };
                        Some(AlarmRecord {
                            alarm_id,
                            channel_id,
                            exchange,
                            base_symbol,
                            quote_symbol,
                        })
                    },
                )
                .collect();
            Ok(records)
        })
    }

    fn select_condition(
        &self,
        alarm_id: i64,
    ) -> BoxFuture<'_, Result<Condition, Report<StoreError>>> {
        Box::pin(async move {
            let row: Option<ConditionRow> = sqlx::query_as(
                "SELECT whale, tick, rsi, bollinger_band \
                 FROM condition \
                 WHERE alarm_id = ? \
                 ORDER BY condition_id DESC \
                 LIMIT 1",
            )
            .bind(alarm_id)
            .fetch_optional(&self.pool)
            .await
            .change_context(StoreError::Query)?;

            let Some((whale, tick, rsi, bollinger_band)) = row else {
                return Err(Report::new(StoreError::MalformedCondition { alarm_id })
                    .attach("no condition row"));
            };

            Ok(Condition {
                whale: parse_field(alarm_id, whale)?,
                tick: parse_field(alarm_id, tick)?,
                rsi: parse_field(alarm_id, rsi)?,
                bollinger_band: parse_field(alarm_id, bollinger_band)?,
            })
        })
    }
}

fn parse_field<T: serde::de::DeserializeOwned>(
    alarm_id: i64,
    column: Option<String>,
) -> Result<Option<T>, Report<StoreError>> {
    match column {
        None => Ok(None),
        Some(json) => serde_json::from_str(&json)
            .map(Some)
            .change_context(StoreError::MalformedCondition { alarm_id })
            .attach_with(|| format!("column value: {json}")),
    }
}
