//! Query model and Firestore wire-format translation.
//!
//! A [`QuerySpec`] is the structured form a sandbox script builds up; it
//! encodes to the REST `structuredQuery` shape. Documents come back as
//! [`DocumentSnapshot`]s and cross the boundary as plain [`DocumentRecord`]s.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};

/// A value usable in a query filter: plain JSON or one of the client
/// library's native types.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Json(Value),
    Timestamp(DateTime<Utc>),
    GeoPoint { latitude: f64, longitude: f64 },
    /// Write-side sentinel; rejected when encoding a filter.
    ServerTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    NotIn,
    ArrayContainsAny,
}

impl FilterOp {
    /// Parse the operator strings the Firestore client APIs use.
    pub fn parse(op: &str) -> Result<Self> {
        Ok(match op {
            "==" => Self::Equal,
            "!=" => Self::NotEqual,
            "<" => Self::LessThan,
            "<=" => Self::LessThanOrEqual,
            ">" => Self::GreaterThan,
            ">=" => Self::GreaterThanOrEqual,
            "array-contains" => Self::ArrayContains,
            "in" => Self::In,
            "not-in" => Self::NotIn,
            "array-contains-any" => Self::ArrayContainsAny,
            _ => bail!(
                "Unsupported filter operator '{op}'. Expected one of: \
                 ==, !=, <, <=, >, >=, array-contains, in, not-in, array-contains-any"
            ),
        })
    }

    fn wire_name(self) -> &'static str {
        match self {
            Self::Equal => "EQUAL",
            Self::NotEqual => "NOT_EQUAL",
            Self::LessThan => "LESS_THAN",
            Self::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Self::GreaterThan => "GREATER_THAN",
            Self::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Self::ArrayContains => "ARRAY_CONTAINS",
            Self::In => "IN",
            Self::NotIn => "NOT_IN",
            Self::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Field {
        field: String,
        op: FilterOp,
        value: QueryValue,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn parse(dir: &str) -> Result<Self> {
        Ok(match dir {
            "asc" | "ascending" => Self::Ascending,
            "desc" | "descending" => Self::Descending,
            _ => bail!("Unsupported sort direction '{dir}'. Expected 'asc' or 'desc'"),
        })
    }

    fn wire_name(self) -> &'static str {
        match self {
            Self::Ascending => "ASCENDING",
            Self::Descending => "DESCENDING",
        }
    }
}

/// A structured read over one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub collection_path: String,
    pub filter: Option<Filter>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<i64>,
}

impl QuerySpec {
    /// Encode as the REST `structuredQuery` value. The collection path's
    /// parent segments go into the request URL, not the query body.
    pub fn to_structured_query(&self) -> Result<Value> {
        let (_, collection_id) = split_collection_path(&self.collection_path)?;

        let mut query = Map::new();
        query.insert("from".into(), json!([{ "collectionId": collection_id }]));
        if let Some(filter) = &self.filter {
            query.insert("where".into(), encode_filter(filter)?);
        }
        if !self.order_by.is_empty() {
            let order: Vec<Value> = self
                .order_by
                .iter()
                .map(|(field, direction)| {
                    json!({
                        "field": { "fieldPath": field },
                        "direction": direction.wire_name(),
                    })
                })
                .collect();
            query.insert("orderBy".into(), Value::Array(order));
        }
        if let Some(limit) = self.limit {
            query.insert("limit".into(), json!(limit));
        }
        Ok(Value::Object(query))
    }
}

/// Split a collection path into its parent document path and collection id.
/// `"users"` has no parent; `"users/u1/orders"` lives under `"users/u1"`.
/// Collection paths always have an odd number of segments.
pub fn split_collection_path(path: &str) -> Result<(Option<String>, String)> {
    let segments: Vec<&str> = path.split('/').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        bail!("Invalid collection path '{path}'");
    }
    if segments.len() % 2 == 0 {
        bail!("'{path}' is not a collection path (document paths have an even number of segments)");
    }
    let collection_id = (*segments.last().unwrap_or(&path)).to_string();
    let parent = if segments.len() > 1 {
        Some(segments[..segments.len() - 1].join("/"))
    } else {
        None
    };
    Ok((parent, collection_id))
}

/// Validate a document path: non-empty segments, even count.
pub fn validate_document_path(path: &str) -> Result<()> {
    let segments: Vec<&str> = path.split('/').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        bail!("Invalid document path '{path}'");
    }
    if segments.len() % 2 != 0 {
        bail!("'{path}' is not a document path (collection paths have an odd number of segments)");
    }
    Ok(())
}

fn encode_filter(filter: &Filter) -> Result<Value> {
    match filter {
        Filter::Field { field, op, value } => {
            // Null comparisons use a unary filter on the wire.
            if let QueryValue::Json(Value::Null) = value {
                let unary_op = match op {
                    FilterOp::Equal => "IS_NULL",
                    FilterOp::NotEqual => "IS_NOT_NULL",
                    _ => bail!("Null can only be compared with == or !="),
                };
                return Ok(json!({
                    "unaryFilter": { "field": { "fieldPath": field }, "op": unary_op }
                }));
            }
            Ok(json!({
                "fieldFilter": {
                    "field": { "fieldPath": field },
                    "op": op.wire_name(),
                    "value": encode_value(value)?,
                }
            }))
        }
        Filter::And(children) | Filter::Or(children) => {
            let op = if matches!(filter, Filter::And(_)) { "AND" } else { "OR" };
            let encoded: Vec<Value> = children.iter().map(encode_filter).collect::<Result<_>>()?;
            Ok(json!({ "compositeFilter": { "op": op, "filters": encoded } }))
        }
    }
}

pub fn encode_value(value: &QueryValue) -> Result<Value> {
    match value {
        QueryValue::Json(v) => encode_json_value(v),
        QueryValue::Timestamp(at) => Ok(json!({
            "timestampValue": at.to_rfc3339_opts(SecondsFormat::Micros, true)
        })),
        QueryValue::GeoPoint { latitude, longitude } => Ok(json!({
            "geoPointValue": { "latitude": latitude, "longitude": longitude }
        })),
        QueryValue::ServerTimestamp => {
            bail!("serverTimestamp is a write sentinel and cannot be used in a query filter")
        }
    }
}

fn encode_json_value(v: &Value) -> Result<Value> {
    Ok(match v {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!({ "integerValue": i.to_string() })
            } else if let Some(f) = n.as_f64() {
                json!({ "doubleValue": f })
            } else {
                bail!("Unrepresentable number in filter value: {n}")
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_json_value).collect::<Result<_>>()?;
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(fields) => {
            let mut encoded = Map::new();
            for (key, value) in fields {
                encoded.insert(key.clone(), encode_json_value(value)?);
            }
            json!({ "mapValue": { "fields": encoded } })
        }
    })
}

/// A point-in-time read of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub id: String,
    pub path: String,
    pub exists: bool,
    pub data: Map<String, Value>,
}

impl DocumentSnapshot {
    pub fn missing(path: &str) -> Self {
        let id = path.rsplit('/').next().unwrap_or(path).to_string();
        Self {
            id,
            path: path.to_string(),
            exists: false,
            data: Map::new(),
        }
    }

    /// Copy the snapshot into a plain record. The record owns its data and
    /// shares nothing with the snapshot afterwards.
    pub fn to_record(&self) -> DocumentRecord {
        DocumentRecord {
            id: self.id.clone(),
            path: self.path.clone(),
            data: self.data.clone(),
        }
    }
}

/// The serialized document shape handed across the boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub path: String,
    pub data: Map<String, Value>,
}

/// Decode a REST document resource. `documents_root` is the
/// `projects/{p}/databases/{d}/documents` prefix stripped from the full
/// resource name to obtain the relative path.
pub fn decode_document(doc: &Value, documents_root: &str) -> Result<DocumentSnapshot> {
    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .context("Document response is missing 'name'")?;
    let path = name
        .strip_prefix(documents_root)
        .map(|p| p.trim_start_matches('/'))
        .unwrap_or(name)
        .to_string();
    let id = path.rsplit('/').next().unwrap_or(&path).to_string();

    let mut data = Map::new();
    if let Some(Value::Object(fields)) = doc.get("fields") {
        for (key, value) in fields {
            data.insert(key.clone(), decode_value(value)?);
        }
    }

    Ok(DocumentSnapshot {
        id,
        path,
        exists: true,
        data,
    })
}

/// Decode a single Firestore value into plain JSON. Timestamps, references
/// and bytes stay as strings; geo points become `{latitude, longitude}`.
pub fn decode_value(v: &Value) -> Result<Value> {
    let Value::Object(obj) = v else {
        bail!("Malformed Firestore value: {v}");
    };
    let (kind, inner) = obj.iter().next().context("Empty Firestore value")?;
    Ok(match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" | "doubleValue" | "timestampValue" | "stringValue" | "referenceValue"
        | "bytesValue" | "geoPointValue" => inner.clone(),
        "integerValue" => match inner {
            // The wire encodes 64-bit integers as strings.
            Value::String(s) => {
                let n: i64 = s
                    .parse()
                    .with_context(|| format!("Malformed integerValue '{s}'"))?;
                Value::Number(n.into())
            }
            other => other.clone(),
        },
        "arrayValue" => {
            let items = inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect::<Result<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            Value::Array(items)
        }
        "mapValue" => {
            let mut decoded = Map::new();
            if let Some(Value::Object(fields)) = inner.get("fields") {
                for (key, value) in fields {
                    decoded.insert(key.clone(), decode_value(value)?);
                }
            }
            Value::Object(decoded)
        }
        other => bail!("Unsupported Firestore value kind '{other}'"),
    })
}
