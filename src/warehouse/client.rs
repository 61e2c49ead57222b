use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    config::WarehouseConfig,
    error::{IntegrationError, MandiResult},
    warehouse::WarehouseTable,
};

/// One column of a warehouse table, as introspected from
/// `system.columns` (ordered by position).
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

#[derive(Debug, Deserialize)]
struct ColumnsResponse {
    data: Vec<ColumnMeta>,
}

/// Thin ClickHouse client over the HTTP interface.
///
/// Inserts ship as `JSONEachRow`, metadata queries as `FORMAT JSON`.
/// When the configured port is the native TCP port the client talks to
/// the HTTP companion port instead; both paths therefore insert
/// identical row counts by construction.
#[derive(Debug, Clone)]
pub struct ClickHouseClient {
    http: reqwest::Client,
    config: WarehouseConfig,
}

impl ClickHouseClient {
    pub fn new(config: WarehouseConfig) -> MandiResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| IntegrationError::Connect(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn base_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("user", self.config.user.clone()),
            ("password", self.config.password.clone()),
            ("database", self.config.database.clone()),
        ]
    }

    /// Connection test; `SELECT 1` round trip.
    pub async fn ping(&self) -> MandiResult<()> {
        let response = self
            .http
            .get(self.config.http_url())
            .query(&self.base_query())
            .query(&[("query", "SELECT 1")])
            .send()
            .await
            .map_err(|e| IntegrationError::Connect(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(IntegrationError::Connect(format!("HTTP {}", response.status())).into())
        }
    }

    /// Ordered column list and types for a table.
    #[tracing::instrument(skip_all, fields(table = %table))]
    pub async fn columns(&self, table: WarehouseTable) -> MandiResult<Vec<ColumnMeta>> {
        let query = format!(
            "SELECT name, type FROM system.columns \
             WHERE database = '{}' AND table = '{}' \
             ORDER BY position FORMAT JSON",
            self.config.database,
            table.as_str()
        );

        let response = self
            .http
            .get(self.config.http_url())
            .query(&self.base_query())
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| IntegrationError::Introspection {
                table: table.to_string(),
                msg: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(IntegrationError::Introspection {
                table: table.to_string(),
                msg: format!("HTTP {}", response.status()),
            }
            .into());
        }

        let parsed: ColumnsResponse =
            response
                .json()
                .await
                .map_err(|e| IntegrationError::Introspection {
                    table: table.to_string(),
                    msg: e.to_string(),
                })?;

        if parsed.data.is_empty() {
            return Err(IntegrationError::Introspection {
                table: table.to_string(),
                msg: "table has no columns in system.columns".to_string(),
            }
            .into());
        }
        Ok(parsed.data)
    }

    /// Insert one batch of rows, already aligned to the table's column
    /// order and coerced to warehouse types.
    #[tracing::instrument(skip_all, fields(table = %table, rows = rows.len()))]
    pub async fn insert_batch(
        &self,
        table: WarehouseTable,
        rows: &[Map<String, Value>],
    ) -> MandiResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row).map_err(|e| {
                IntegrationError::Insert {
                    table: table.to_string(),
                    msg: e.to_string(),
                }
            })?);
            body.push('\n');
        }

        let query = format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            self.config.database,
            table.as_str()
        );

        let response = self
            .http
            .post(self.config.http_url())
            .query(&self.base_query())
            .query(&[("query", query)])
            .body(body)
            .send()
            .await
            .map_err(|e| IntegrationError::Insert {
                table: table.to_string(),
                msg: e.to_string(),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            Err(IntegrationError::Insert {
                table: table.to_string(),
                msg: format!("HTTP {status}: {detail}"),
            }
            .into())
        }
    }
}
