//! Wire types for the shell-facing boundary.
//! Every response carries a `success` discriminant; failures travel as
//! values, never as exceptions across the boundary.

use serde::{Deserialize, Serialize};

use crate::query::DocumentRecord;

/// Parameters for the connect operation. Accepts the structured request or,
/// for backward compatibility, a bare path string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConnectParams {
    /// Legacy form: just the service account path.
    Path(String),
    #[serde(rename_all = "camelCase")]
    Request {
        /// Path to the service account key file.
        service_account_path: String,
        /// Named database to connect to; omit for the default database.
        #[serde(default)]
        database_id: Option<String>,
    },
}

impl ConnectParams {
    pub fn service_account_path(&self) -> &str {
        match self {
            Self::Path(path) => path,
            Self::Request {
                service_account_path,
                ..
            } => service_account_path,
        }
    }

    pub fn database_id(&self) -> Option<&str> {
        match self {
            Self::Path(_) => None,
            Self::Request { database_id, .. } => database_id.as_deref(),
        }
    }
}

/// Parameters for the executeJsQuery operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJsQueryParams {
    /// Collection the shell is currently browsing. Advisory only: the
    /// script's `db` binding spans the whole database.
    pub collection_path: String,
    /// Author-supplied script; must define `fn run()`.
    pub js_query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Present only when the connect request named a database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResponse {
    pub fn ok(project_id: String, database_id: Option<String>) -> Self {
        Self {
            success: true,
            project_id: Some(project_id),
            database_id,
            error: None,
        }
    }

    pub fn err(message: String) -> Self {
        Self {
            success: false,
            project_id: None,
            database_id: None,
            error: Some(message),
        }
    }
}

/// Disconnect always succeeds, even when there was nothing to tear down.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

impl DisconnectResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionsResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionsResponse {
    pub fn ok(collections: Vec<String>) -> Self {
        Self {
            success: true,
            collections: Some(collections),
            error: None,
        }
    }

    pub fn err(message: String) -> Self {
        Self {
            success: false,
            collections: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<DocumentRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    pub fn ok(documents: Vec<DocumentRecord>) -> Self {
        Self {
            success: true,
            documents: Some(documents),
            error: None,
        }
    }

    pub fn err(message: String) -> Self {
        Self {
            success: false,
            documents: None,
            error: Some(message),
        }
    }
}
