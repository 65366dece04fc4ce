//! Raw response to flat record normalization
//!
//! One declarative [`Normalizer`] covers every handler: it unwraps an optional
//! envelope key, splits the payload into records according to a
//! [`RecordShape`], then injects context fields (the subject id, a request
//! parameter, a constant) into every record that lacks them. Injection is what
//! guarantees each record carries its full composite key even when the
//! upstream only reports it once, at the top level.

use crate::error::NormalizeError;
use crate::model::{FlatRecord, NormalizeContext, RawResponse};
use serde_json::{Map, Value};

/// Envelope key unwrapped when a handler does not name one.
pub const DEFAULT_ENVELOPE: &str = "data";

/// How the (unwrapped) payload maps onto records.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordShape {
    /// One object is one record; an array holds one object per record.
    Objects,

    /// An array of scalars, each stored under `field`.
    Scalars { field: String },

    /// Parallel arrays, one record per index.
    ///
    /// `columns` maps payload keys to record fields. When `status_key` is set
    /// and its value is anything other than `"ok"`, the payload holds no data.
    Columnar {
        status_key: Option<String>,
        columns: Vec<(String, String)>,
    },
}

/// A field filled in from context when a record lacks it or holds null.
#[derive(Debug, Clone, PartialEq)]
pub enum Injection {
    SubjectId { field: String },
    Param { param: String, field: String },
    Constant { field: String, value: Value },
}

impl Injection {
    pub fn subject(field: impl Into<String>) -> Self {
        Injection::SubjectId { field: field.into() }
    }

    pub fn param(param: impl Into<String>, field: impl Into<String>) -> Self {
        Injection::Param {
            param: param.into(),
            field: field.into(),
        }
    }

    pub fn constant(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Injection::Constant {
            field: field.into(),
            value: value.into(),
        }
    }

    fn field(&self) -> &str {
        match self {
            Injection::SubjectId { field }
            | Injection::Param { field, .. }
            | Injection::Constant { field, .. } => field,
        }
    }

    fn value(&self, ctx: &NormalizeContext<'_>) -> Option<Value> {
        match self {
            Injection::SubjectId { .. } => Some(Value::String(ctx.subject_id.to_string())),
            Injection::Param { param, .. } => ctx.params.get(param).filter(|v| !v.is_null()).cloned(),
            Injection::Constant { value, .. } => Some(value.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalizer {
    envelope: Option<String>,
    shape: RecordShape,
    injections: Vec<Injection>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            envelope: Some(DEFAULT_ENVELOPE.to_string()),
            shape: RecordShape::Objects,
            injections: Vec::new(),
        }
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelope(mut self, key: impl Into<String>) -> Self {
        self.envelope = Some(key.into());
        self
    }

    /// Never unwrap, even if the payload happens to contain `data`.
    pub fn no_envelope(mut self) -> Self {
        self.envelope = None;
        self
    }

    pub fn shape(mut self, shape: RecordShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn scalars(self, field: impl Into<String>) -> Self {
        self.shape(RecordShape::Scalars { field: field.into() })
    }

    pub fn columnar<I, K, F>(self, status_key: Option<&str>, columns: I) -> Self
    where
        I: IntoIterator<Item = (K, F)>,
        K: Into<String>,
        F: Into<String>,
    {
        self.shape(RecordShape::Columnar {
            status_key: status_key.map(str::to_string),
            columns: columns.into_iter().map(|(k, f)| (k.into(), f.into())).collect(),
        })
    }

    pub fn inject(mut self, injection: Injection) -> Self {
        self.injections.push(injection);
        self
    }

    pub fn inject_subject(self, field: impl Into<String>) -> Self {
        self.inject(Injection::subject(field))
    }

    pub fn inject_param(self, param: impl Into<String>, field: impl Into<String>) -> Self {
        self.inject(Injection::param(param, field))
    }

    /// Turn a raw response into records.
    ///
    /// Null, empty arrays and empty objects yield no records.
    pub fn normalize(
        &self,
        raw: &RawResponse,
        ctx: &NormalizeContext<'_>,
    ) -> Result<Vec<FlatRecord>, NormalizeError> {
        let payload = self.unwrap_envelope(raw);

        let mut records = match &self.shape {
            RecordShape::Objects => objects(payload)?,
            RecordShape::Scalars { field } => scalars(payload, field)?,
            RecordShape::Columnar {
                status_key,
                columns,
            } => columnar(payload, status_key.as_deref(), columns)?,
        };

        for record in &mut records {
            self.apply_injections(record, ctx);
        }

        Ok(records)
    }

    fn unwrap_envelope<'r>(&self, raw: &'r RawResponse) -> &'r Value {
        match (&self.envelope, raw) {
            (Some(key), Value::Object(map)) => map.get(key).unwrap_or(raw),
            _ => raw,
        }
    }

    fn apply_injections(&self, record: &mut FlatRecord, ctx: &NormalizeContext<'_>) {
        for injection in &self.injections {
            let field = injection.field();
            if record.get(field).is_some_and(|v| !v.is_null()) {
                continue;
            }
            if let Some(value) = injection.value(ctx) {
                record.insert(field.to_string(), value);
            }
        }
    }
}

fn kind(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

fn objects(payload: &Value) -> Result<Vec<FlatRecord>, NormalizeError> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        Value::Object(map) => Ok(vec![map.clone()]),
        Value::Array(items) => items
            .iter()
            .filter(|item| !item.is_null())
            .map(|item| match item {
                Value::Object(map) => Ok(map.clone()),
                other => Err(NormalizeError::UnexpectedShape {
                    expected: "array of objects",
                    found: format!("array containing {}", kind(other)),
                }),
            })
            .collect(),
        other => Err(NormalizeError::UnexpectedShape {
            expected: "object or array of objects",
            found: kind(other),
        }),
    }
}

fn scalars(payload: &Value, field: &str) -> Result<Vec<FlatRecord>, NormalizeError> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .filter(|item| !item.is_null())
            .map(|item| match item {
                Value::Array(_) | Value::Object(_) => Err(NormalizeError::UnexpectedShape {
                    expected: "array of scalars",
                    found: format!("array containing {}", kind(item)),
                }),
                scalar => {
                    let mut record = Map::new();
                    record.insert(field.to_string(), scalar.clone());
                    Ok(record)
                },
            })
            .collect(),
        other => Err(NormalizeError::UnexpectedShape {
            expected: "array of scalars",
            found: kind(other),
        }),
    }
}

fn columnar(
    payload: &Value,
    status_key: Option<&str>,
    columns: &[(String, String)],
) -> Result<Vec<FlatRecord>, NormalizeError> {
    let map = match payload {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        other => {
            return Err(NormalizeError::UnexpectedShape {
                expected: "object of parallel arrays",
                found: kind(other),
            })
        },
    };

    if let Some(status_key) = status_key {
        if map.get(status_key).and_then(Value::as_str) != Some("ok") {
            return Ok(Vec::new());
        }
    }

    let mut arrays = Vec::with_capacity(columns.len());
    for (key, field) in columns {
        match map.get(key) {
            None | Some(Value::Null) => continue,
            Some(Value::Array(values)) => arrays.push((field.as_str(), key.as_str(), values)),
            Some(other) => {
                return Err(NormalizeError::UnexpectedShape {
                    expected: "array column",
                    found: format!("{} for '{}'", kind(other), key),
                })
            },
        }
    }

    let Some(len) = arrays.first().map(|(_, _, values)| values.len()) else {
        return Ok(Vec::new());
    };

    if let Some((_, key, values)) = arrays.iter().find(|(_, _, values)| values.len() != len) {
        return Err(NormalizeError::RaggedColumns {
            column: key.to_string(),
            expected: len,
            found: values.len(),
        });
    }

    Ok((0..len)
        .map(|i| {
            arrays
                .iter()
                .map(|(field, _, values)| (field.to_string(), values[i].clone()))
                .collect()
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use finhub_common::types::Params;
    use serde_json::json;

    fn ctx<'a>(subject_id: &'a str, params: &'a Params) -> NormalizeContext<'a> {
        NormalizeContext { subject_id, params }
    }

    #[test]
    fn test_single_object_is_one_record() {
        let params = Params::new();
        let records = Normalizer::new()
            .inject_subject("ticker")
            .normalize(&json!({"ticker": "AAPL", "name": "Apple Inc"}), &ctx("AAPL", &params))
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["name"], "Apple Inc");
    }

    #[test]
    fn test_envelope_unwrapped_and_subject_injected() {
        let params = Params::new();
        let raw = json!({"data": [{"period": "2024-Q1"}, {"period": "2024-Q2"}], "symbol": "AAPL"});

        let records = Normalizer::new()
            .inject_subject("symbol")
            .normalize(&raw, &ctx("AAPL", &params))
            .unwrap();

        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record["symbol"], "AAPL");
        }
        assert_eq!(records[1]["period"], "2024-Q2");
    }

    #[test]
    fn test_injection_does_not_override_present_values() {
        let params = Params::new();
        let raw = json!([{"symbol": "BRK.B", "v": 1}, {"symbol": null, "v": 2}]);

        let records = Normalizer::new()
            .inject_subject("symbol")
            .normalize(&raw, &ctx("BRK-B", &params))
            .unwrap();

        assert_eq!(records[0]["symbol"], "BRK.B");
        assert_eq!(records[1]["symbol"], "BRK-B");
    }

    #[test]
    fn test_param_and_constant_injection() {
        let mut params = Params::new();
        params.insert("freq".into(), json!("quarterly"));

        let records = Normalizer::new()
            .inject_param("freq", "freq")
            .inject_param("missing", "absent")
            .inject(Injection::constant("source", "finnhub"))
            .normalize(&json!({"data": [{"period": "2024-03-31"}]}), &ctx("MSFT", &params))
            .unwrap();

        assert_eq!(records[0]["freq"], "quarterly");
        assert_eq!(records[0]["source"], "finnhub");
        assert!(!records[0].contains_key("absent"));
    }

    #[test]
    fn test_empty_responses_yield_no_records() {
        let params = Params::new();
        let normalizer = Normalizer::new().inject_subject("symbol");
        for raw in [json!(null), json!([]), json!({}), json!({"data": []}), json!({"data": null})] {
            assert!(normalizer.normalize(&raw, &ctx("AAPL", &params)).unwrap().is_empty());
        }
    }

    #[test]
    fn test_custom_envelope() {
        let params = Params::new();
        let raw = json!({"earningsCalendar": [{"symbol": "AAPL", "date": "2024-05-02"}]});
        let records = Normalizer::new()
            .envelope("earningsCalendar")
            .normalize(&raw, &ctx("AAPL", &params))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["date"], "2024-05-02");
    }

    #[test]
    fn test_no_envelope_keeps_data_field() {
        let params = Params::new();
        let raw = json!({"data": "payload", "id": 1});
        let records = Normalizer::new()
            .no_envelope()
            .normalize(&raw, &ctx("X", &params))
            .unwrap();
        assert_eq!(records[0]["data"], "payload");
    }

    #[test]
    fn test_scalars_become_records() {
        let params = Params::new();
        let records = Normalizer::new()
            .scalars("peer")
            .inject_subject("symbol")
            .normalize(&json!(["MSFT", "GOOGL"]), &ctx("AAPL", &params))
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["peer"], "MSFT");
        assert_eq!(records[1]["symbol"], "AAPL");
    }

    #[test]
    fn test_columnar_candles() {
        let mut params = Params::new();
        params.insert("resolution".into(), json!("D"));
        let normalizer = Normalizer::new()
            .columnar(Some("s"), [("t", "timestamp"), ("c", "close"), ("v", "volume")])
            .inject_subject("symbol")
            .inject_param("resolution", "resolution");

        let raw = json!({"s": "ok", "t": [1, 2], "c": [10.5, 11.0], "v": [100, 200]});
        let records = normalizer.normalize(&raw, &ctx("AAPL", &params)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["timestamp"], 2);
        assert_eq!(records[1]["close"], 11.0);
        assert_eq!(records[0]["resolution"], "D");

        let no_data = normalizer.normalize(&json!({"s": "no_data"}), &ctx("AAPL", &params)).unwrap();
        assert!(no_data.is_empty());
    }

    #[test]
    fn test_ragged_columns_rejected() {
        let params = Params::new();
        let err = Normalizer::new()
            .columnar(None, [("t", "timestamp"), ("c", "close")])
            .normalize(&json!({"t": [1, 2], "c": [1.0]}), &ctx("AAPL", &params))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::RaggedColumns { .. }));
    }

    #[test]
    fn test_unexpected_shape() {
        let params = Params::new();
        let err = Normalizer::new()
            .normalize(&json!("rate limited"), &ctx("AAPL", &params))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::UnexpectedShape { .. }));

        let err = Normalizer::new()
            .normalize(&json!([1, 2]), &ctx("AAPL", &params))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::UnexpectedShape { .. }));
    }
}
