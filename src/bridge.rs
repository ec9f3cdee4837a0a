//! Boundary dispatcher.
//!
//! One method per shell-facing operation. Every failure internal to an
//! operation is converted into a `success: false` response value here;
//! nothing thrown crosses the boundary. The serve loop carries the
//! operations over newline-delimited JSON envelopes on stdin/stdout.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::{ConnectionManager, Connector};
use crate::errors::NormalizedError;
use crate::protocol::{
    CollectionsResponse, ConnectParams, ConnectResponse, DisconnectResponse,
    ExecuteJsQueryParams, QueryResponse,
};
use crate::sandbox;

/// A request envelope: `{"id"?, "op", "params"?}`. The optional id is echoed
/// back so the shell can correlate responses.
#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    id: Option<Value>,
    op: String,
    #[serde(default)]
    params: Option<Value>,
}

pub struct Bridge {
    manager: ConnectionManager,
    query_timeout: Duration,
}

impl Bridge {
    pub fn new(connector: Arc<dyn Connector>, query_timeout: Duration) -> Self {
        Self {
            manager: ConnectionManager::new(connector),
            query_timeout,
        }
    }

    pub async fn connect(&self, params: ConnectParams) -> ConnectResponse {
        let path = Path::new(params.service_account_path());
        let database_id = params.database_id().map(str::to_owned);
        match self.manager.connect(path, database_id).await {
            Ok(info) => ConnectResponse::ok(info.project_id, info.database_id),
            Err(e) => {
                tracing::warn!("Connect failed ({:?}): {}", e.kind, e.message);
                ConnectResponse::err(e.message)
            }
        }
    }

    pub async fn disconnect(&self) -> DisconnectResponse {
        self.manager.disconnect().await;
        DisconnectResponse::ok()
    }

    pub async fn get_collections(&self) -> CollectionsResponse {
        match tokio::time::timeout(self.query_timeout, self.manager.get_collections()).await {
            Ok(Ok(collections)) => CollectionsResponse::ok(collections),
            Ok(Err(e)) => {
                tracing::warn!("Collection listing failed ({:?}): {}", e.kind, e.message);
                CollectionsResponse::err(e.message)
            }
            Err(_) => CollectionsResponse::err(self.timeout_error().message),
        }
    }

    pub async fn execute_js_query(&self, params: ExecuteJsQueryParams) -> QueryResponse {
        // The connection check comes first; the script source is not touched
        // while disconnected.
        let Some(db) = self.manager.handle().await else {
            return QueryResponse::err(NormalizedError::not_connected().message);
        };

        tracing::info!(
            "Executing query script (collection hint: '{}')",
            params.collection_path
        );
        match tokio::time::timeout(self.query_timeout, sandbox::execute(db, params.js_query)).await
        {
            Ok(Ok(documents)) => QueryResponse::ok(documents),
            Ok(Err(e)) => {
                tracing::warn!("Query failed ({:?}): {}", e.kind, e.message);
                QueryResponse::err(e.message)
            }
            Err(_) => QueryResponse::err(self.timeout_error().message),
        }
    }

    fn timeout_error(&self) -> NormalizedError {
        NormalizedError::timeout(self.query_timeout.as_secs())
    }

    /// Serve the line protocol until the input side closes. Malformed lines
    /// and unknown operations produce error responses; the loop never dies
    /// on bad input.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = self.dispatch(line).await;
            let mut payload = serde_json::to_string(&response)?;
            payload.push('\n');
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    async fn dispatch(&self, line: &str) -> Value {
        let envelope: RequestEnvelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => return error_value(None, format!("Malformed request: {e}")),
        };
        let id = envelope.id;
        let params = envelope.params.unwrap_or(Value::Null);

        let body = match envelope.op.as_str() {
            "connect" => match serde_json::from_value::<ConnectParams>(params) {
                Ok(p) => to_value(self.connect(p).await),
                Err(e) => return error_value(id, format!("Invalid connect parameters: {e}")),
            },
            "disconnect" => to_value(self.disconnect().await),
            "getCollections" => to_value(self.get_collections().await),
            "executeJsQuery" => match serde_json::from_value::<ExecuteJsQueryParams>(params) {
                Ok(p) => to_value(self.execute_js_query(p).await),
                Err(e) => {
                    return error_value(id, format!("Invalid executeJsQuery parameters: {e}"));
                }
            },
            other => return error_value(id, format!("Unknown operation '{other}'")),
        };
        attach_id(id, body)
    }
}

fn to_value<T: Serialize>(response: T) -> Value {
    serde_json::to_value(response).unwrap_or_else(|e| {
        json!({ "success": false, "error": format!("Failed to encode response: {e}") })
    })
}

fn attach_id(id: Option<Value>, mut body: Value) -> Value {
    if let (Some(id), Value::Object(map)) = (id, &mut body) {
        map.insert("id".to_string(), id);
    }
    body
}

fn error_value(id: Option<Value>, message: String) -> Value {
    attach_id(id, json!({ "success": false, "error": message }))
}
