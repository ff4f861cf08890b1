//! PostgreSQL implementation of [`DestinationStore`]

use anyhow::{Context, Result};
use async_trait::async_trait;
use objsweep_common::RecordValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

use crate::config::{validate_identifier, DatabaseConfig};
use crate::store::DestinationStore;

/// PostgreSQL caps a single statement at 65535 bind parameters
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Clone)]
pub struct PgDestination {
    pool: PgPool,
}

impl PgDestination {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(config.connect_options())
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to postgres://{}@{}:{}/{}",
                    config.user, config.host, config.port, config.name
                )
            })?;

        info!(
            host = %config.host,
            database = %config.name,
            max_connections = config.max_connections,
            "Database connection pool created"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Rows per INSERT so that one statement stays under the parameter limit
fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

#[async_trait]
impl DestinationStore for PgDestination {
    #[instrument(skip(self))]
    async fn distinct_values(&self, table: &str, column: &str, limit: i64) -> Result<Vec<String>> {
        validate_identifier(table)?;
        validate_identifier(column)?;

        let sql = format!(
            "SELECT DISTINCT {column}::text FROM {table} LIMIT $1",
            column = column,
            table = table
        );

        let values: Vec<Option<String>> = sqlx::query_scalar(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to load distinct {} from {}", column, table))?;

        Ok(values.into_iter().flatten().collect())
    }

    #[instrument(skip(self, columns, rows), fields(rows = rows.len()))]
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<RecordValue>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }

        let header = format!("INSERT INTO {} ({}) ", table, columns.join(", "));
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut inserted = 0u64;

        for chunk in rows.chunks(rows_per_statement(columns.len())) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(&header);

            query_builder.push_values(chunk, |mut b, row| {
                for value in row {
                    match value {
                        // Untyped NULL lets PostgreSQL infer the column type
                        RecordValue::Null => {
                            b.push("NULL");
                        },
                        RecordValue::Text(text) => {
                            b.push_bind(text.clone());
                        },
                        RecordValue::Integer(number) => {
                            b.push_bind(*number);
                        },
                        RecordValue::Float(number) => {
                            b.push_bind(*number);
                        },
                        RecordValue::Bool(flag) => {
                            b.push_bind(*flag);
                        },
                        RecordValue::Timestamp(at) => {
                            b.push_bind(*at);
                        },
                    }
                }
            });

            let result = query_builder
                .build()
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert {} rows into {}", chunk.len(), table))?;

            inserted += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit batch")?;

        debug!(table, inserted, "Committed insert");
        Ok(inserted)
    }
}
