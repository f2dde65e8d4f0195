use crate::crypto;
use crate::error::TransferError;
use crate::executor::{
    DestinationWriter, RowCursor, SessionFactory, SourceReader, TransferSession,
};
use crate::fk::{
    build_disable_script, build_enable_script, ConstraintCatalog, ForeignKeyConstraint,
    DISCOVER_CONSTRAINTS_SQL,
};
use crate::mapper::ColumnBinding;
use crate::models::{AuthMode, ConnectionSide, ImportJob, ResolvedEndpoint};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use deadpool_tiberius::{Manager, Pool};
use futures::TryStreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tiberius::{AuthMethod, QueryItem};
use tokio::sync::mpsc;

/// Rows buffered between the reader task and the batching loop. One batch
/// worth keeps the source streaming without holding the result set in memory.
const CURSOR_BUFFER_ROWS: usize = 1_000;

/// SQL Server caps a single VALUES table constructor at this many rows, so
/// larger batches are written as consecutive statements.
const MAX_ROWS_PER_INSERT: usize = 1_000;

/// Translates a driver error, keeping the server error number so the retry
/// policy can classify transient codes.
pub fn map_db_error(err: tiberius::error::Error) -> TransferError {
    match &err {
        tiberius::error::Error::Server(token) => {
            TransferError::database(Some(token.code()), token.message().to_string())
        }
        tiberius::error::Error::Io { .. } | tiberius::error::Error::Routing { .. } => {
            TransferError::Connection(err.to_string())
        }
        _ => TransferError::database(None, err.to_string()),
    }
}

/// Builds a connection pool for one resolved endpoint. Windows-integrated
/// authentication is not available off-domain, so it is rejected up front.
pub fn create_pool(endpoint: &ResolvedEndpoint, max_size: usize) -> Result<Pool, TransferError> {
    if endpoint.auth_mode == AuthMode::Windows {
        return Err(TransferError::Connection(format!(
            "data source {} requests Windows authentication, which is not supported",
            endpoint.host
        )));
    }

    Manager::new()
        .host(&endpoint.host)
        .port(endpoint.port)
        .authentication(AuthMethod::sql_server(
            &endpoint.username,
            &endpoint.password,
        ))
        .database(&endpoint.database)
        .trust_cert()
        .max_size(max_size)
        .create_pool()
        .map_err(|e| TransferError::Connection(e.to_string()))
}

/// Cheap liveness check; used to fail a session open fast and to verify a
/// connection before constraint re-enable DDL is sent over it.
async fn probe(pool: &Pool, label: &str) -> Result<(), TransferError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| TransferError::Connection(e.to_string()))?;
    conn.simple_query("SELECT 1")
        .await
        .map_err(map_db_error)?
        .into_row()
        .await
        .map_err(map_db_error)?;
    log::debug!("Connection probe succeeded for {}", label);
    Ok(())
}

/// Splits a `host,port` server reference; a bare host gets the default port.
pub fn parse_server_address(raw: &str) -> (String, u16) {
    let trimmed = raw.trim();
    if let Some((host, port)) = trimmed.split_once(',') {
        if let Ok(port) = port.trim().parse::<u16>() {
            return (host.trim().to_string(), port);
        }
    }
    (trimmed.to_string(), 1433)
}

fn column_value(row: &tiberius::Row, i: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<i64, _>(i) {
        serde_json::json!(v)
    } else if let Ok(Some(v)) = row.try_get::<i32, _>(i) {
        serde_json::json!(v)
    } else if let Ok(Some(v)) = row.try_get::<i16, _>(i) {
        serde_json::json!(v)
    } else if let Ok(Some(v)) = row.try_get::<u8, _>(i) {
        serde_json::json!(v)
    } else if let Ok(Some(v)) = row.try_get::<f64, _>(i) {
        serde_json::json!(v)
    } else if let Ok(Some(v)) = row.try_get::<f32, _>(i) {
        serde_json::json!(v)
    } else if let Ok(Some(v)) = row.try_get::<bool, _>(i) {
        serde_json::json!(v)
    } else if let Ok(Some(v)) = row.try_get::<NaiveDateTime, _>(i) {
        serde_json::json!(v.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
    } else if let Ok(Some(v)) = row.try_get::<NaiveDate, _>(i) {
        serde_json::json!(v.format("%Y-%m-%d").to_string())
    } else if let Ok(Some(v)) = row.try_get::<NaiveTime, _>(i) {
        serde_json::json!(v.format("%H:%M:%S%.3f").to_string())
    } else if let Ok(Some(v)) = row.try_get::<uuid::Uuid, _>(i) {
        serde_json::json!(v.to_string())
    } else if let Ok(Some(v)) = row.try_get::<&str, _>(i) {
        serde_json::json!(v)
    } else if let Ok(Some(v)) = row.try_get::<&[u8], _>(i) {
        serde_json::json!(format!("0x{}", hex::encode(v)))
    } else {
        Value::Null
    }
}

fn row_values(row: &tiberius::Row) -> Vec<Value> {
    (0..row.len()).map(|i| column_value(row, i)).collect()
}

fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Renders one value as a T-SQL literal for the generated INSERT. Strings go
/// through N'' quoting; the server converts them to the column's type.
fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("N'{}'", s.replace('\'', "''")),
        other => format!("N'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Multi-row INSERT for one chunk, column order taken from the bindings.
fn build_insert_statement(
    table: &str,
    bindings: &[ColumnBinding],
    rows: &[Vec<Value>],
) -> Result<String, TransferError> {
    let columns = bindings
        .iter()
        .map(|b| quote_identifier(&b.target_column))
        .collect::<Vec<String>>()
        .join(", ");

    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut literals = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let value = row.get(binding.source_ordinal).ok_or_else(|| {
                TransferError::Internal(format!(
                    "source row has {} columns but binding expects ordinal {}",
                    row.len(),
                    binding.source_ordinal
                ))
            })?;
            literals.push(sql_literal(value));
        }
        tuples.push(format!("({})", literals.join(", ")));
    }

    Ok(format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        columns,
        tuples.join(", ")
    ))
}

/// Looks up the stored data-source row for one side of a job and yields a
/// credentialed endpoint, decrypting the password on the way out.
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(
        &self,
        job_id: i64,
        side: ConnectionSide,
    ) -> Result<ResolvedEndpoint, TransferError>;
}

pub struct MssqlConnectionResolver {
    pool: Pool,
    key: Vec<u8>,
}

impl MssqlConnectionResolver {
    pub fn new(pool: Pool, key: Vec<u8>) -> Self {
        MssqlConnectionResolver { pool, key }
    }
}

#[async_trait]
impl ConnectionResolver for MssqlConnectionResolver {
    async fn resolve(
        &self,
        job_id: i64,
        side: ConnectionSide,
    ) -> Result<ResolvedEndpoint, TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let row = conn
            .query(
                "SELECT ds.ServerName, ds.DatabaseName, ds.UserName, ds.Password, ds.IsWindowsAuth \
                 FROM ImportData i \
                 JOIN DataSource ds ON ds.Id = \
                     CASE WHEN @P2 = 1 THEN i.FromConnectionId ELSE i.ToConnectionId END \
                 WHERE i.Id = @P1",
                &[&(job_id as i32), &(side == ConnectionSide::Source)],
            )
            .await
            .map_err(map_db_error)?
            .into_row()
            .await
            .map_err(map_db_error)?
            .ok_or_else(|| {
                TransferError::Definition(format!(
                    "no {} data source configured for import job {}",
                    side.as_str(),
                    job_id
                ))
            })?;

        let text = |name: &str| -> Result<String, TransferError> {
            Ok(row
                .try_get::<&str, _>(name)
                .map_err(map_db_error)?
                .unwrap_or_default()
                .to_string())
        };

        let (host, port) = parse_server_address(&text("ServerName")?);
        let windows_auth = row
            .try_get::<bool, _>("IsWindowsAuth")
            .map_err(map_db_error)?
            .unwrap_or(false);
        let password = crypto::decrypt(&self.key, &text("Password")?)
            .map_err(|e| TransferError::Definition(format!(
                "could not decrypt password for the {} data source of job {}: {}",
                side.as_str(),
                job_id,
                e
            )))?;

        Ok(ResolvedEndpoint {
            host,
            port,
            database: text("DatabaseName")?,
            auth_mode: if windows_auth {
                AuthMode::Windows
            } else {
                AuthMode::SqlPassword
            },
            username: text("UserName")?,
            password,
        })
    }
}

pub struct MssqlSourceReader {
    pool: Pool,
}

#[async_trait]
impl SourceReader for MssqlSourceReader {
    async fn open_cursor(&self, query: &str) -> Result<RowCursor, TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let (tx, rx) = mpsc::channel(CURSOR_BUFFER_ROWS);
        let query = query.to_string();

        // The query stream borrows the connection, so the reader task owns
        // both and feeds rows through the bounded channel. A dropped receiver
        // ends the task early.
        tokio::spawn(async move {
            let mut stream = match conn.query(&query, &[]).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(map_db_error(e))).await;
                    return;
                }
            };

            loop {
                match stream.try_next().await {
                    Ok(Some(QueryItem::Row(row))) => {
                        if tx.send(Ok(row_values(&row))).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(QueryItem::Metadata(_))) => {}
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(map_db_error(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(RowCursor::from_receiver(rx))
    }
}

pub struct MssqlDestinationWriter {
    write_pool: Pool,
    management_pool: Pool,
    command_timeout: Duration,
}

impl MssqlDestinationWriter {
    async fn run_command(&self, pool: &Pool, sql: &str) -> Result<(), TransferError> {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let secs = self.command_timeout.as_secs();
        tokio::time::timeout(self.command_timeout, conn.execute(sql, &[]))
            .await
            .map_err(|_| TransferError::Timeout(secs))?
            .map_err(map_db_error)?;
        Ok(())
    }
}

#[async_trait]
impl DestinationWriter for MssqlDestinationWriter {
    async fn execute_command(&self, sql: &str) -> Result<(), TransferError> {
        self.run_command(&self.management_pool, sql).await
    }

    async fn bulk_load(
        &self,
        table: &str,
        bindings: &[ColumnBinding],
        rows: &[Vec<Value>],
    ) -> Result<usize, TransferError> {
        if rows.is_empty() {
            return Ok(0);
        }

        for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
            let statement = build_insert_statement(table, bindings, chunk)?;
            self.run_command(&self.write_pool, &statement).await?;
        }
        Ok(rows.len())
    }
}

pub struct MssqlConstraintCatalog {
    pool: Pool,
    command_timeout: Duration,
}

impl MssqlConstraintCatalog {
    async fn run_script(&self, script: &str) -> Result<(), TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let secs = self.command_timeout.as_secs();
        tokio::time::timeout(self.command_timeout, conn.execute(script, &[]))
            .await
            .map_err(|_| TransferError::Timeout(secs))?
            .map_err(map_db_error)?;
        Ok(())
    }
}

#[async_trait]
impl ConstraintCatalog for MssqlConstraintCatalog {
    async fn discover(&self, table: &str) -> Result<Vec<ForeignKeyConstraint>, TransferError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransferError::Connection(e.to_string()))?;
        let rows = conn
            .query(DISCOVER_CONSTRAINTS_SQL, &[&table])
            .await
            .map_err(map_db_error)?
            .into_first_result()
            .await
            .map_err(map_db_error)?;

        let mut constraints = Vec::with_capacity(rows.len());
        for row in rows {
            constraints.push(ForeignKeyConstraint {
                schema: row
                    .try_get::<&str, _>("SchemaName")
                    .map_err(map_db_error)?
                    .unwrap_or_default()
                    .to_string(),
                table: row
                    .try_get::<&str, _>("TableName")
                    .map_err(map_db_error)?
                    .unwrap_or_default()
                    .to_string(),
                name: row
                    .try_get::<&str, _>("ConstraintName")
                    .map_err(map_db_error)?
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(constraints)
    }

    async fn disable(&self, constraints: &[ForeignKeyConstraint]) -> Result<(), TransferError> {
        if constraints.is_empty() {
            return Ok(());
        }
        self.run_script(&build_disable_script(constraints)).await
    }

    async fn enable(&self, constraints: &[ForeignKeyConstraint]) -> Result<(), TransferError> {
        if constraints.is_empty() {
            return Ok(());
        }
        // The copy may have poisoned the previous connection, so verify one
        // is alive before sending the re-enable DDL.
        if let Err(err) = probe(&self.pool, "destination management").await {
            log::warn!("Management connection probe failed before constraint re-enable: {}", err);
            probe(&self.pool, "destination management (retry)").await?;
        }
        self.run_script(&build_enable_script(constraints)).await
    }
}

/// Opens the three per-job connections: source read, destination write and
/// destination management. Endpoints come from the resolver, failures are
/// fatal for the run.
pub struct MssqlSessionFactory {
    resolver: Arc<dyn ConnectionResolver>,
    command_timeout: Duration,
}

impl MssqlSessionFactory {
    pub fn new(resolver: Arc<dyn ConnectionResolver>, command_timeout: Duration) -> Self {
        MssqlSessionFactory {
            resolver,
            command_timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for MssqlSessionFactory {
    async fn open(&self, job: &ImportJob) -> Result<TransferSession, TransferError> {
        let source = self
            .resolver
            .resolve(job.id, ConnectionSide::Source)
            .await?;
        let destination = self
            .resolver
            .resolve(job.id, ConnectionSide::Destination)
            .await?;

        let source_pool = create_pool(&source, 1)?;
        let write_pool = create_pool(&destination, 1)?;
        let management_pool = create_pool(&destination, 1)?;

        // Pools connect lazily; probe now so an unreachable endpoint fails
        // the job before any destructive step runs.
        probe(&source_pool, "source").await?;
        probe(&write_pool, "destination write").await?;
        probe(&management_pool, "destination management").await?;

        Ok(TransferSession {
            source: Box::new(MssqlSourceReader { pool: source_pool }),
            destination: Box::new(MssqlDestinationWriter {
                write_pool,
                management_pool: management_pool.clone(),
                command_timeout: self.command_timeout,
            }),
            constraints: Box::new(MssqlConstraintCatalog {
                pool: management_pool,
                command_timeout: self.command_timeout,
            }),
        })
    }
}

#[cfg(test)]
mod tests;
