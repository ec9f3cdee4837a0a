//! Firestore REST backend and Google service-account authentication.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::connection::{AdminHandle, Connector, DatabaseHandle};
use crate::credentials::ServiceAccountCredential;
use crate::query::{self, DocumentSnapshot, QuerySpec};

const FIRESTORE_ENDPOINT: &str = "https://firestore.googleapis.com/v1";
const TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// OAuth2 access tokens via the signed-JWT service account flow.
struct GoogleAuth {
    client: reqwest::Client,
    client_email: String,
    signing_key: EncodingKey,
    token_uri: String,
    cached: Mutex<Option<CachedToken>>,
}

impl GoogleAuth {
    fn new(client: reqwest::Client, credential: &ServiceAccountCredential) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(credential.private_key.as_bytes())
            .context("Service account private key is not a valid RSA PEM")?;
        Ok(Self {
            client,
            client_email: credential.client_email.clone(),
            signing_key,
            token_uri: credential.token_uri.clone(),
            cached: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Utc::now()
        {
            return Ok(token.token.clone());
        }

        let minted = self.mint().await?;
        let token = minted.token.clone();
        *cached = Some(minted);
        Ok(token)
    }

    async fn mint(&self) -> Result<CachedToken> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.client_email,
            scope: TOKEN_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .context("Failed to sign service account JWT")?;

        tracing::debug!("Requesting access token for {}", self.client_email);
        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .context("Token request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Token exchange failed ({status}): {body}");
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Malformed token response")?;
        let lifetime = (token.expires_in - TOKEN_EXPIRY_MARGIN_SECS).max(0);
        Ok(CachedToken {
            token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        })
    }

    async fn clear(&self) {
        self.cached.lock().await.take();
    }
}

/// The admin side of a REST connection: identity, auth, and teardown.
pub struct FirestoreAdmin {
    project_id: String,
    auth: GoogleAuth,
    closed: AtomicBool,
}

impl FirestoreAdmin {
    async fn bearer_token(&self) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            bail!("Connection has been closed");
        }
        self.auth.access_token().await
    }
}

#[async_trait]
impl AdminHandle for FirestoreAdmin {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.auth.clear().await;
        tracing::debug!("Shut down connection to project '{}'", self.project_id);
        Ok(())
    }
}

/// One Firestore database reached over REST v1.
pub struct FirestoreDatabase {
    admin: Arc<FirestoreAdmin>,
    client: reqwest::Client,
    /// `projects/{project}/databases/{database}/documents`
    documents_root: String,
}

impl FirestoreDatabase {
    fn new(admin: Arc<FirestoreAdmin>, client: reqwest::Client, database_id: &str) -> Self {
        let documents_root = format!(
            "projects/{}/databases/{}/documents",
            admin.project_id(),
            database_id
        );
        Self {
            admin,
            client,
            documents_root,
        }
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value> {
        let token = self.admin.bearer_token().await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .context("Firestore request failed")?;
        decode_response(response).await
    }
}

async fn decode_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .context("Failed to read Firestore response")?;
    if status.is_success() {
        return serde_json::from_str(&body).context("Firestore returned a malformed JSON body");
    }
    Err(remote_error(status, &body))
}

/// Reconstruct the client-library error surface (`"STATUS: message"`) from
/// the REST error envelope so the normalizer's pattern table applies.
fn remote_error(status: reqwest::StatusCode, body: &str) -> anyhow::Error {
    if let Ok(envelope) = serde_json::from_str::<Value>(body)
        && let Some(error) = envelope.get("error")
    {
        let code = error.get("status").and_then(Value::as_str).unwrap_or("UNKNOWN");
        let message = error.get("message").and_then(Value::as_str).unwrap_or(body);
        return anyhow!("{code}: {message}");
    }
    anyhow!("HTTP {status}: {body}")
}

/// A NOT_FOUND that names the document is "no such document" — a valid empty
/// read — as opposed to "no such database".
fn is_missing_document(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|envelope| {
            let message = envelope.get("error")?.get("message")?.as_str()?;
            Some(message.starts_with("Document \""))
        })
        .unwrap_or(false)
}

#[async_trait]
impl DatabaseHandle for FirestoreDatabase {
    async fn list_root_collections(&self) -> Result<Vec<String>> {
        let url = format!("{FIRESTORE_ENDPOINT}/{}:listCollectionIds", self.documents_root);
        let mut collections = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let body = match &page_token {
                Some(token) => json!({ "pageToken": token }),
                None => json!({}),
            };
            let response = self.post(&url, body).await?;
            if let Some(ids) = response.get("collectionIds").and_then(Value::as_array) {
                collections.extend(ids.iter().filter_map(Value::as_str).map(str::to_owned));
            }
            page_token = response
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_owned);
            if page_token.is_none() {
                break;
            }
        }

        Ok(collections)
    }

    async fn run_query(&self, spec: &QuerySpec) -> Result<Vec<DocumentSnapshot>> {
        let (parent, _) = query::split_collection_path(&spec.collection_path)?;
        let parent_path = match parent {
            Some(p) => format!("{}/{p}", self.documents_root),
            None => self.documents_root.clone(),
        };
        let url = format!("{FIRESTORE_ENDPOINT}/{parent_path}:runQuery");
        let body = json!({ "structuredQuery": spec.to_structured_query()? });

        tracing::debug!("Running structured query on '{}'", spec.collection_path);
        let response = self.post(&url, body).await?;

        // runQuery streams; over plain JSON that arrives as an array of
        // result elements, not all of which carry a document.
        let items = response
            .as_array()
            .context("Unexpected runQuery response shape")?;
        let mut snapshots = Vec::new();
        for item in items {
            if let Some(doc) = item.get("document") {
                snapshots.push(query::decode_document(doc, &self.documents_root)?);
            }
        }
        Ok(snapshots)
    }

    async fn get_document(&self, path: &str) -> Result<DocumentSnapshot> {
        query::validate_document_path(path)?;
        let url = format!("{FIRESTORE_ENDPOINT}/{}/{path}", self.documents_root);
        let token = self.admin.bearer_token().await?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .context("Firestore request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            if is_missing_document(&body) {
                return Ok(DocumentSnapshot::missing(path));
            }
            return Err(remote_error(reqwest::StatusCode::NOT_FOUND, &body));
        }

        let doc = decode_response(response).await?;
        query::decode_document(&doc, &self.documents_root)
    }
}

/// Production [`Connector`]: one shared HTTP client, handles built per
/// connect. No eager probe call — the first remote operation surfaces auth
/// or connectivity problems.
pub struct RestConnector {
    client: reqwest::Client,
}

impl RestConnector {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for RestConnector {
    async fn establish(
        &self,
        credential: &ServiceAccountCredential,
        database_id: Option<&str>,
    ) -> Result<(Arc<dyn AdminHandle>, Arc<dyn DatabaseHandle>)> {
        let database_id = database_id.unwrap_or(DEFAULT_DATABASE_ID);
        let auth = GoogleAuth::new(self.client.clone(), credential)?;
        let admin = Arc::new(FirestoreAdmin {
            project_id: credential.project_id.clone(),
            auth,
            closed: AtomicBool::new(false),
        });
        let db = Arc::new(FirestoreDatabase::new(
            admin.clone(),
            self.client.clone(),
            database_id,
        ));
        tracing::info!(
            "Initialized connection to project '{}', database '{}'",
            credential.project_id,
            database_id
        );
        Ok((admin, db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_uses_google_envelope() {
        let body = r#"{"error":{"code":403,"message":"insufficient permissions","status":"PERMISSION_DENIED"}}"#;
        let e = remote_error(reqwest::StatusCode::FORBIDDEN, body);
        assert_eq!(e.to_string(), "PERMISSION_DENIED: insufficient permissions");
    }

    #[test]
    fn test_remote_error_falls_back_to_raw_body() {
        let e = remote_error(reqwest::StatusCode::BAD_GATEWAY, "<html>upstream error</html>");
        let msg = e.to_string();
        assert!(msg.contains("502"));
        assert!(msg.contains("upstream error"));
    }

    #[test]
    fn test_is_missing_document() {
        let missing = r#"{"error":{"code":404,"message":"Document \"projects/p/databases/(default)/documents/users/ghost\" not found.","status":"NOT_FOUND"}}"#;
        assert!(is_missing_document(missing));

        let missing_db = r#"{"error":{"code":404,"message":"The database (default) does not exist for project p","status":"NOT_FOUND"}}"#;
        assert!(!is_missing_document(missing_db));

        assert!(!is_missing_document("not json"));
    }
}
