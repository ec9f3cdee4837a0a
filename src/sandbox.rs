//! Sandboxed execution of user-authored query scripts.
//!
//! Each execution builds a fresh scripting engine whose only reachable
//! bindings are the live database handle (`db`) and the Firestore native
//! value constructors (`FieldValue`, `Timestamp`, `Filter`, `GeoPoint`).
//! Host state — filesystem, network, imports — is not registered and so not
//! reachable. This guards the trusted author against accidental over-reach;
//! it is not a hardened security boundary.
//!
//! The author's source must define `fn run()`. Its result, a document or
//! query snapshot, is serialized into plain [`DocumentRecord`]s.

use chrono::{DateTime, TimeZone, Utc};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::connection::DatabaseHandle;
use crate::errors::{ErrorKind, NormalizedError, error_chain, normalize_remote};
use crate::query::{
    self, Direction, DocumentRecord, DocumentSnapshot, Filter, FilterOp, QuerySpec, QueryValue,
};

/// Engine limits bounding runaway author code.
const MAX_OPERATIONS: u64 = 5_000_000;
const MAX_CALL_DEPTH: usize = 64;
const MAX_EXPR_DEPTH: usize = 64;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

fn runtime_err(message: impl Into<String>) -> Box<EvalAltResult> {
    message.into().into()
}

/// Run the author's script against `db` and return the serialized result
/// documents. Compile errors, unknown identifiers, author-code failures and
/// remote rejections all come back as normalized error values; nothing
/// propagates to the caller.
pub async fn execute(
    db: Arc<dyn DatabaseHandle>,
    source: String,
) -> Result<Vec<DocumentRecord>, NormalizedError> {
    let rt = Handle::current();
    let outcome = tokio::task::spawn_blocking(move || run_script(db, rt, &source))
        .await
        .map_err(|e| {
            NormalizedError::new(ErrorKind::Unknown, format!("Query execution aborted: {e}"))
        })?;
    outcome.map_err(|raw| normalize_remote(&raw))
}

fn run_script(
    db: Arc<dyn DatabaseHandle>,
    rt: Handle,
    source: &str,
) -> Result<Vec<DocumentRecord>, String> {
    let engine = build_engine(ScriptDb { db, rt });

    let ast = engine
        .compile(source)
        .map_err(|e| format!("Script compile error: {e}"))?;

    let mut scope = Scope::new();
    let result: Dynamic = engine
        .call_fn(&mut scope, &ast, "run", ())
        .map_err(|e| e.to_string())?;

    serialize_result(result)
}

/// Normalize the script's return value: a query snapshot becomes its
/// documents, a document snapshot becomes zero or one record.
fn serialize_result(result: Dynamic) -> Result<Vec<DocumentRecord>, String> {
    if result.is::<ScriptQuerySnapshot>() {
        let snapshot = result.cast::<ScriptQuerySnapshot>();
        return Ok(snapshot.docs.iter().map(DocumentSnapshot::to_record).collect());
    }
    if result.is::<ScriptDocSnapshot>() {
        let snapshot = result.cast::<ScriptDocSnapshot>();
        return Ok(if snapshot.snapshot.exists {
            vec![snapshot.snapshot.to_record()]
        } else {
            Vec::new()
        });
    }
    Err(format!(
        "run() must return a document or query snapshot, got {}",
        friendly_type_name(&result)
    ))
}

fn friendly_type_name(value: &Dynamic) -> String {
    if value.is::<ScriptQuery>() {
        return "a query (missing .get()?)".to_string();
    }
    if value.is::<ScriptDocRef>() {
        return "a document reference (missing .get()?)".to_string();
    }
    value.type_name().to_string()
}

fn build_engine(db: ScriptDb) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(MAX_CALL_DEPTH);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
    engine.disable_symbol("import");

    // Ambient bindings, resolved on lookup. They behave as read-only: there
    // is nothing to assign to.
    engine.on_var(move |name, _index, _context| {
        Ok(match name {
            "db" => Some(Dynamic::from(db.clone())),
            "FieldValue" => Some(Dynamic::from(FieldValueNamespace)),
            "Timestamp" => Some(Dynamic::from(TimestampNamespace)),
            "Filter" => Some(Dynamic::from(FilterNamespace)),
            _ => None,
        })
    });

    engine
        .register_type_with_name::<ScriptDb>("Database")
        .register_fn("collection", ScriptDb::collection)
        .register_fn("doc", ScriptDb::doc);

    engine
        .register_type_with_name::<ScriptQuery>("Query")
        .register_fn("where", ScriptQuery::where_field)
        .register_fn("where", ScriptQuery::where_filter)
        .register_fn("orderBy", ScriptQuery::order_by)
        .register_fn("orderBy", ScriptQuery::order_by_dir)
        .register_fn("limit", ScriptQuery::limit)
        .register_fn("doc", ScriptQuery::doc)
        .register_fn("get", ScriptQuery::get);

    engine
        .register_type_with_name::<ScriptDocRef>("DocumentReference")
        .register_get("path", |r: &mut ScriptDocRef| r.path.clone())
        .register_fn("collection", ScriptDocRef::collection)
        .register_fn("get", ScriptDocRef::get);

    engine
        .register_type_with_name::<ScriptDocSnapshot>("DocumentSnapshot")
        .register_get("id", |s: &mut ScriptDocSnapshot| s.snapshot.id.clone())
        .register_get("path", |s: &mut ScriptDocSnapshot| s.snapshot.path.clone())
        .register_get("exists", |s: &mut ScriptDocSnapshot| s.snapshot.exists)
        .register_fn("data", ScriptDocSnapshot::data);

    engine
        .register_type_with_name::<ScriptQuerySnapshot>("QuerySnapshot")
        .register_get("docs", ScriptQuerySnapshot::docs)
        .register_get("size", |s: &mut ScriptQuerySnapshot| s.docs.len() as i64)
        .register_get("empty", |s: &mut ScriptQuerySnapshot| s.docs.is_empty());

    engine
        .register_type_with_name::<ScriptFilter>("Filter")
        .register_type_with_name::<ScriptTimestamp>("Timestamp")
        .register_type_with_name::<ScriptGeoPoint>("GeoPoint")
        .register_type_with_name::<ScriptServerTimestamp>("ServerTimestamp");

    engine
        .register_type_with_name::<FieldValueNamespace>("FieldValueNamespace")
        .register_fn("serverTimestamp", |_: &mut FieldValueNamespace| {
            ScriptServerTimestamp
        });

    engine
        .register_type_with_name::<TimestampNamespace>("TimestampNamespace")
        .register_fn("now", |_: &mut TimestampNamespace| ScriptTimestamp {
            at: Utc::now(),
        })
        .register_fn("fromMillis", TimestampNamespace::from_millis)
        .register_fn("parse", TimestampNamespace::parse);

    engine
        .register_type_with_name::<FilterNamespace>("FilterNamespace")
        .register_fn("where", FilterNamespace::where_field)
        .register_fn("and", FilterNamespace::and)
        .register_fn("or", FilterNamespace::or);

    engine.register_fn("GeoPoint", |lat: f64, lng: f64| geo_point(lat, lng));
    engine.register_fn("GeoPoint", |lat: i64, lng: i64| {
        geo_point(lat as f64, lng as f64)
    });
    engine.register_fn("GeoPoint", |lat: i64, lng: f64| geo_point(lat as f64, lng));
    engine.register_fn("GeoPoint", |lat: f64, lng: i64| geo_point(lat, lng as f64));

    engine
}

#[derive(Clone)]
struct ScriptDb {
    db: Arc<dyn DatabaseHandle>,
    rt: Handle,
}

impl ScriptDb {
    fn collection(&mut self, path: &str) -> ScriptResult<ScriptQuery> {
        query::split_collection_path(path).map_err(|e| runtime_err(e.to_string()))?;
        Ok(ScriptQuery {
            db: self.db.clone(),
            rt: self.rt.clone(),
            spec: QuerySpec {
                collection_path: path.to_string(),
                ..QuerySpec::default()
            },
        })
    }

    fn doc(&mut self, path: &str) -> ScriptResult<ScriptDocRef> {
        query::validate_document_path(path).map_err(|e| runtime_err(e.to_string()))?;
        Ok(ScriptDocRef {
            db: self.db.clone(),
            rt: self.rt.clone(),
            path: path.to_string(),
        })
    }
}

#[derive(Clone)]
struct ScriptQuery {
    db: Arc<dyn DatabaseHandle>,
    rt: Handle,
    spec: QuerySpec,
}

impl ScriptQuery {
    fn with_filter(&self, filter: Filter) -> Self {
        let combined = match self.spec.filter.clone() {
            None => filter,
            // Successive where() calls conjoin, as in the client library.
            Some(Filter::And(mut children)) => {
                children.push(filter);
                Filter::And(children)
            }
            Some(existing) => Filter::And(vec![existing, filter]),
        };
        let mut next = self.clone();
        next.spec.filter = Some(combined);
        next
    }

    fn where_field(&mut self, field: &str, op: &str, value: Dynamic) -> ScriptResult<Self> {
        Ok(self.with_filter(build_field_filter(field, op, value)?))
    }

    fn where_filter(&mut self, filter: ScriptFilter) -> Self {
        self.with_filter(filter.filter)
    }

    fn order_by(&mut self, field: &str) -> Self {
        let mut next = self.clone();
        next.spec.order_by.push((field.to_string(), Direction::Ascending));
        next
    }

    fn order_by_dir(&mut self, field: &str, direction: &str) -> ScriptResult<Self> {
        let direction = Direction::parse(direction).map_err(|e| runtime_err(e.to_string()))?;
        let mut next = self.clone();
        next.spec.order_by.push((field.to_string(), direction));
        Ok(next)
    }

    fn limit(&mut self, n: i64) -> ScriptResult<Self> {
        if n < 0 {
            return Err(runtime_err(format!("limit({n}) is negative")));
        }
        let mut next = self.clone();
        next.spec.limit = Some(n);
        Ok(next)
    }

    fn doc(&mut self, id: &str) -> ScriptResult<ScriptDocRef> {
        if id.is_empty() || id.contains('/') {
            return Err(runtime_err(format!("Invalid document id '{id}'")));
        }
        Ok(ScriptDocRef {
            db: self.db.clone(),
            rt: self.rt.clone(),
            path: format!("{}/{id}", self.spec.collection_path),
        })
    }

    fn get(&mut self) -> ScriptResult<ScriptQuerySnapshot> {
        let db = self.db.clone();
        let spec = self.spec.clone();
        let docs = self
            .rt
            .block_on(async move { db.run_query(&spec).await })
            .map_err(|e| runtime_err(error_chain(&e)))?;
        Ok(ScriptQuerySnapshot { docs })
    }
}

#[derive(Clone)]
struct ScriptDocRef {
    db: Arc<dyn DatabaseHandle>,
    rt: Handle,
    path: String,
}

impl ScriptDocRef {
    fn collection(&mut self, id: &str) -> ScriptResult<ScriptQuery> {
        if id.is_empty() || id.contains('/') {
            return Err(runtime_err(format!("Invalid collection id '{id}'")));
        }
        Ok(ScriptQuery {
            db: self.db.clone(),
            rt: self.rt.clone(),
            spec: QuerySpec {
                collection_path: format!("{}/{id}", self.path),
                ..QuerySpec::default()
            },
        })
    }

    fn get(&mut self) -> ScriptResult<ScriptDocSnapshot> {
        let db = self.db.clone();
        let path = self.path.clone();
        let snapshot = self
            .rt
            .block_on(async move { db.get_document(&path).await })
            .map_err(|e| runtime_err(error_chain(&e)))?;
        Ok(ScriptDocSnapshot { snapshot })
    }
}

#[derive(Clone)]
struct ScriptDocSnapshot {
    snapshot: DocumentSnapshot,
}

impl ScriptDocSnapshot {
    fn data(&mut self) -> ScriptResult<Dynamic> {
        rhai::serde::to_dynamic(Value::Object(self.snapshot.data.clone()))
    }
}

#[derive(Clone)]
struct ScriptQuerySnapshot {
    docs: Vec<DocumentSnapshot>,
}

impl ScriptQuerySnapshot {
    fn docs(&mut self) -> Array {
        self.docs
            .iter()
            .map(|snapshot| {
                Dynamic::from(ScriptDocSnapshot {
                    snapshot: snapshot.clone(),
                })
            })
            .collect()
    }
}

#[derive(Clone)]
struct ScriptFilter {
    filter: Filter,
}

#[derive(Clone, Copy)]
struct ScriptTimestamp {
    at: DateTime<Utc>,
}

#[derive(Clone, Copy)]
struct ScriptGeoPoint {
    latitude: f64,
    longitude: f64,
}

#[derive(Clone, Copy)]
struct ScriptServerTimestamp;

#[derive(Clone, Copy)]
struct FieldValueNamespace;

#[derive(Clone, Copy)]
struct TimestampNamespace;

impl TimestampNamespace {
    fn from_millis(&mut self, millis: i64) -> ScriptResult<ScriptTimestamp> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(|at| ScriptTimestamp { at })
            .ok_or_else(|| runtime_err(format!("Timestamp out of range: {millis}")))
    }

    fn parse(&mut self, text: &str) -> ScriptResult<ScriptTimestamp> {
        DateTime::parse_from_rfc3339(text)
            .map(|at| ScriptTimestamp {
                at: at.with_timezone(&Utc),
            })
            .map_err(|e| runtime_err(format!("Invalid timestamp '{text}': {e}")))
    }
}

#[derive(Clone, Copy)]
struct FilterNamespace;

impl FilterNamespace {
    fn where_field(&mut self, field: &str, op: &str, value: Dynamic) -> ScriptResult<ScriptFilter> {
        Ok(ScriptFilter {
            filter: build_field_filter(field, op, value)?,
        })
    }

    fn and(&mut self, filters: Array) -> ScriptResult<ScriptFilter> {
        Ok(ScriptFilter {
            filter: Filter::And(cast_filters(filters)?),
        })
    }

    fn or(&mut self, filters: Array) -> ScriptResult<ScriptFilter> {
        Ok(ScriptFilter {
            filter: Filter::Or(cast_filters(filters)?),
        })
    }
}

fn cast_filters(filters: Array) -> ScriptResult<Vec<Filter>> {
    filters
        .into_iter()
        .map(|item| {
            item.try_cast::<ScriptFilter>()
                .map(|f| f.filter)
                .ok_or_else(|| runtime_err("Filter.and/or expects an array of filters"))
        })
        .collect()
}

fn build_field_filter(field: &str, op: &str, value: Dynamic) -> ScriptResult<Filter> {
    if field.is_empty() {
        return Err(runtime_err("Filter field path is empty"));
    }
    let op = FilterOp::parse(op).map_err(|e| runtime_err(e.to_string()))?;
    let value = filter_value(value)?;
    Ok(Filter::Field {
        field: field.to_string(),
        op,
        value,
    })
}

fn geo_point(latitude: f64, longitude: f64) -> ScriptResult<ScriptGeoPoint> {
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(runtime_err(format!(
            "GeoPoint({latitude}, {longitude}) is out of range"
        )));
    }
    Ok(ScriptGeoPoint {
        latitude,
        longitude,
    })
}

/// Convert a script value into a filter operand. Native constructor results
/// are mapped first; everything else must be plain data.
fn filter_value(value: Dynamic) -> ScriptResult<QueryValue> {
    if value.is::<ScriptServerTimestamp>() {
        return Err(runtime_err(
            "serverTimestamp is a write sentinel and cannot be used in a query filter",
        ));
    }
    if value.is::<ScriptTimestamp>() {
        let ts = value.cast::<ScriptTimestamp>();
        return Ok(QueryValue::Timestamp(ts.at));
    }
    if value.is::<ScriptGeoPoint>() {
        let point = value.cast::<ScriptGeoPoint>();
        return Ok(QueryValue::GeoPoint {
            latitude: point.latitude,
            longitude: point.longitude,
        });
    }
    let json: Value = rhai::serde::from_dynamic(&value)
        .map_err(|e| runtime_err(format!("Unsupported filter value: {e}")))?;
    Ok(QueryValue::Json(json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testutil::{FakeDatabase, snapshot};
    use serde_json::json;

    fn users_db() -> Arc<FakeDatabase> {
        Arc::new(FakeDatabase {
            snapshots: vec![
                snapshot("doc1", "users", json!({"name": "Ada", "age": 36})),
                snapshot("doc2", "users", json!({"name": "Grace", "age": 45})),
            ],
            ..FakeDatabase::default()
        })
    }

    async fn run(db: Arc<FakeDatabase>, source: &str) -> Result<Vec<DocumentRecord>, NormalizedError> {
        execute(db, source.to_string()).await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_collection_get_returns_records() {
        let db = users_db();
        let records = run(
            db,
            r#"fn run() { db.collection("users").get() }"#,
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "doc1");
        assert_eq!(records[0].path, "users/doc1");
        assert_eq!(records[0].data["name"], "Ada");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_query_chain_builds_spec() {
        let db = users_db();
        run(
            db.clone(),
            r#"fn run() {
                db.collection("users")
                    .where("age", ">=", 40)
                    .orderBy("age", "desc")
                    .limit(10)
                    .get()
            }"#,
        )
        .await
        .unwrap();

        let spec = db.last_query.lock().unwrap().clone().unwrap();
        assert_eq!(spec.collection_path, "users");
        assert_eq!(
            spec.filter,
            Some(Filter::Field {
                field: "age".to_string(),
                op: FilterOp::GreaterThanOrEqual,
                value: QueryValue::Json(json!(40)),
            })
        );
        assert_eq!(spec.order_by, vec![("age".to_string(), Direction::Descending)]);
        assert_eq!(spec.limit, Some(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_successive_wheres_conjoin() {
        let db = users_db();
        run(
            db.clone(),
            r#"fn run() {
                db.collection("users").where("a", "==", 1).where("b", "==", 2).get()
            }"#,
        )
        .await
        .unwrap();

        let spec = db.last_query.lock().unwrap().clone().unwrap();
        match spec.filter.unwrap() {
            Filter::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_filter_namespace_or() {
        let db = users_db();
        run(
            db.clone(),
            r#"fn run() {
                let f = Filter.or([
                    Filter.where("name", "==", "Ada"),
                    Filter.where("name", "==", "Grace")
                ]);
                db.collection("users").where(f).get()
            }"#,
        )
        .await
        .unwrap();

        let spec = db.last_query.lock().unwrap().clone().unwrap();
        match spec.filter.unwrap() {
            Filter::Or(children) => assert_eq!(children.len(), 2),
            other => panic!("expected disjunction, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_native_values_in_filters() {
        let db = users_db();
        run(
            db.clone(),
            r#"fn run() {
                db.collection("events")
                    .where("at", ">", Timestamp.fromMillis(1700000000000))
                    .where("where", "==", GeoPoint(52.5, 13.4))
                    .get()
            }"#,
        )
        .await
        .unwrap();

        let spec = db.last_query.lock().unwrap().clone().unwrap();
        let Some(Filter::And(children)) = spec.filter else {
            panic!("expected conjunction");
        };
        assert_eq!(
            children[0],
            Filter::Field {
                field: "at".to_string(),
                op: FilterOp::GreaterThan,
                value: QueryValue::Timestamp(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()),
            }
        );
        assert_eq!(
            children[1],
            Filter::Field {
                field: "where".to_string(),
                op: FilterOp::Equal,
                value: QueryValue::GeoPoint {
                    latitude: 52.5,
                    longitude: 13.4
                },
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_doc_get_returns_single_record() {
        let db = users_db();
        let records = run(
            db,
            r#"fn run() { db.collection("users").doc("doc2").get() }"#,
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "doc2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_doc_yields_no_records() {
        let db = users_db();
        let records = run(db, r#"fn run() { db.doc("users/ghost").get() }"#)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_can_read_snapshot_fields() {
        let db = users_db();
        let records = run(
            db,
            r#"fn run() {
                let snap = db.collection("users").get();
                if snap.empty || snap.size < 1 {
                    throw "expected documents";
                }
                let first = snap.docs[0];
                if first.data().name != "Ada" {
                    throw "unexpected first document";
                }
                snap
            }"#,
        )
        .await
        .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_syntax_error_is_caught() {
        let db = users_db();
        let err = run(db, "fn run( {").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(err.message.contains("compile"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_run_function() {
        let db = users_db();
        let err = run(db, "fn main() { 1 }").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(err.message.contains("run"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_identifier_is_caught() {
        let db = users_db();
        let err = run(db, "fn run() { nonsense.get() }").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_snapshot_return_is_rejected() {
        let db = users_db();
        let err = run(db.clone(), "fn run() { 42 }").await.unwrap_err();
        assert!(err.message.contains("must return"));

        let err = run(db, r#"fn run() { db.collection("users") }"#)
            .await
            .unwrap_err();
        assert!(err.message.contains("missing .get()"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_server_timestamp_rejected_in_filter() {
        let db = users_db();
        let err = run(
            db,
            r#"fn run() {
                db.collection("users").where("at", "==", FieldValue.serverTimestamp()).get()
            }"#,
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("serverTimestamp"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_binding_rebinding_fails() {
        let db = users_db();
        // `db` resolves through the sandbox, not the scope; there is no
        // variable to assign to.
        let err = run(db, "fn run() { db = 42; }").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remote_error_is_normalized() {
        let db = Arc::new(FakeDatabase {
            fail_with: Some("PERMISSION_DENIED: insufficient permissions".to_string()),
            ..FakeDatabase::default()
        });
        let err = run(db, r#"fn run() { db.collection("users").get() }"#)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert!(err.message.contains("Permission denied"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_operator_is_reported() {
        let db = users_db();
        let err = run(
            db,
            r#"fn run() { db.collection("users").where("a", "=", 1).get() }"#,
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("Unsupported filter operator"));
    }
}
