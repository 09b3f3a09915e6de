//! Prometheus range queries
//!
//! One `GET /api/v1/query_range` call per report. The returned series are
//! pivoted into rows: one row per distinct timestamp, one column per series,
//! columns ordered by the canonical series key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::{PipelineError, PipelineResult};
use crate::record::Value;

const QUERY_RANGE_PATH: &str = "/api/v1/query_range";
const TIME_COLUMN: &str = "time";

/// A fully resolved range query
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsQuery {
    pub endpoint: Url,
    pub user: String,
    pub password: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub step: Duration,
    pub query: String,
    pub timeout: Option<Duration>,
}

impl MetricsQuery {
    /// Endpoint without credentials, for log lines
    pub fn describe(&self) -> String {
        let mut url = self.endpoint.clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.to_string()
    }

    /// Request URL with the query parameters filled in
    pub fn request_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(QUERY_RANGE_PATH);

        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !matches!(k.as_ref(), "query" | "start" | "end" | "step"))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("query", &self.query)
            .append_pair("start", &self.start.timestamp().to_string())
            .append_pair("end", &self.end.timestamp().to_string())
            .append_pair("step", &format!("{}s", self.step.as_secs()));
        url
    }

    fn authorization(&self) -> Option<String> {
        if self.user.is_empty() && self.password.is_empty() {
            return None;
        }
        let credentials = format!("{}:{}", self.user, self.password);
        Some(format!("Basic {}", STANDARD.encode(credentials)))
    }
}

#[derive(Debug, Deserialize)]
struct QueryRangeResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryRangeData>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryRangeData {
    #[serde(default)]
    result: Vec<Series>,
}

/// One time series of a range query result
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    /// `[unix seconds, "value"]` samples
    #[serde(default)]
    pub values: Vec<(f64, String)>,
}

/// Pivoted result: `time` plus one column per series
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PivotTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Samples whose value did not parse and were left blank
    pub bad_samples: usize,
}

/// Canonical series key: labels sorted by name, `name:value` joined by `|`
pub fn series_key(metric: &BTreeMap<String, String>) -> String {
    if metric.is_empty() {
        return "{}".to_string();
    }
    metric
        .iter()
        .map(|(name, value)| format!("{}:{}", name, value))
        .collect::<Vec<_>>()
        .join("|")
}

/// Pivot series into rows ordered by ascending timestamp. Series sharing a
/// key are merged.
pub fn pivot(series: Vec<Series>) -> PivotTable {
    let mut columns: BTreeMap<String, BTreeMap<i64, String>> = BTreeMap::new();
    let mut times: BTreeSet<i64> = BTreeSet::new();
    let mut bad_samples = 0;

    for s in series {
        let key = series_key(&s.metric);
        let column = columns.entry(key.clone()).or_default();
        for (ts, raw) in s.values {
            let millis = (ts * 1000.0).round() as i64;
            times.insert(millis);
            match raw.trim().parse::<f64>() {
                Ok(v) => {
                    column.insert(millis, Value::Float(v).to_string());
                }
                Err(e) => {
                    bad_samples += 1;
                    let err = PipelineError::row_decode(format!(
                        "series {} at {}: value '{}': {}",
                        key, ts, raw, e
                    ));
                    warn!(kind = err.kind(), "{}", err);
                }
            }
        }
    }

    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push(TIME_COLUMN.to_string());
    header.extend(columns.keys().cloned());

    let rows = times
        .into_iter()
        .map(|millis| {
            let mut row = Vec::with_capacity(header.len());
            row.push(render_time(millis));
            row.extend(
                columns
                    .values()
                    .map(|column| column.get(&millis).cloned().unwrap_or_default()),
            );
            row
        })
        .collect();

    PivotTable {
        header,
        rows,
        bad_samples,
    }
}

fn render_time(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| millis.to_string())
}

/// Issue the range query and return the series it produced
pub fn fetch(query: &MetricsQuery) -> PipelineResult<Vec<Series>> {
    let url = query.request_url();
    debug!(url = %query.describe(), "querying metrics endpoint");

    let mut builder = ureq::AgentBuilder::new();
    if let Some(timeout) = query.timeout {
        builder = builder.timeout(timeout);
    }
    let agent = builder.build();

    let mut request = agent.get(url.as_str());
    if let Some(auth) = query.authorization() {
        request = request.set("Authorization", &auth);
    }

    let body = match request.call() {
        Ok(response) => response
            .into_string()
            .map_err(|e| PipelineError::connection(query.describe(), e))?,
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            return Err(PipelineError::statement(format!(
                "HTTP {}: {}",
                code,
                error_message(&body)
            )));
        }
        Err(ureq::Error::Transport(e)) => {
            return Err(PipelineError::connection(query.describe(), e));
        }
    };

    let response: QueryRangeResponse = serde_json::from_str(&body)
        .map_err(|e| PipelineError::statement(format!("malformed response: {}", e)))?;
    if response.status != "success" {
        return Err(PipelineError::statement(format!(
            "query status {}: {}",
            response.status,
            response_error(&response)
        )));
    }

    Ok(response.data.map(|d| d.result).unwrap_or_default())
}

/// Fetch and pivot in one step
pub fn run(query: &MetricsQuery) -> PipelineResult<PivotTable> {
    fetch(query).map(pivot)
}

fn response_error(response: &QueryRangeResponse) -> String {
    match (&response.error_type, &response.error) {
        (Some(kind), Some(msg)) => format!("{}: {}", kind, msg),
        (None, Some(msg)) => msg.clone(),
        (Some(kind), None) => kind.clone(),
        (None, None) => "no error message".to_string(),
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<QueryRangeResponse>(body) {
        Ok(response) => response_error(&response),
        Err(_) => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn series(pairs: &[(&str, &str)], values: &[(f64, &str)]) -> Series {
        Series {
            metric: labels(pairs),
            values: values.iter().map(|(t, v)| (*t, v.to_string())).collect(),
        }
    }

    fn query() -> MetricsQuery {
        MetricsQuery {
            endpoint: Url::parse("http://prom.local:9090/ignored?dedup=true").unwrap(),
            user: String::new(),
            password: String::new(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            step: Duration::from_secs(300),
            query: "up{job=\"node\"}".to_string(),
            timeout: None,
        }
    }

    #[test]
    fn test_series_key_sorts_labels() {
        let key = series_key(&labels(&[("job", "node"), ("instance", "a:9100")]));
        assert_eq!(key, "instance:a:9100|job:node");
        assert_eq!(series_key(&BTreeMap::new()), "{}");
    }

    #[test]
    fn test_pivot_fills_missing_samples_with_blanks() {
        let table = pivot(vec![
            series(&[("__name__", "b")], &[(1000.0, "3")]),
            series(&[("__name__", "a")], &[(1000.0, "1"), (1060.0, "2")]),
        ]);

        assert_eq!(table.header, vec!["time", "__name__:a", "__name__:b"]);
        assert_eq!(
            table.rows,
            vec![
                vec!["1970-01-01T00:16:40Z".to_string(), "1".into(), "3".into()],
                vec!["1970-01-01T00:17:40Z".to_string(), "2".into(), "".into()],
            ]
        );
        assert_eq!(table.bad_samples, 0);
    }

    #[test]
    fn test_pivot_sorts_timestamps() {
        let table = pivot(vec![series(
            &[("x", "1")],
            &[(30.0, "3"), (10.0, "1"), (20.0, "2.5")],
        )]);
        let values: Vec<&str> = table.rows.iter().map(|r| r[1].as_str()).collect();
        assert_eq!(values, vec!["1", "2.5", "3"]);
    }

    #[test]
    fn test_pivot_merges_series_with_same_key() {
        let table = pivot(vec![
            series(&[("x", "1")], &[(10.0, "1")]),
            series(&[("x", "1")], &[(20.0, "2")]),
        ]);
        assert_eq!(table.header.len(), 2);
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn test_pivot_leaves_bad_sample_blank() {
        let table = pivot(vec![series(&[], &[(10.0, "oops"), (20.0, "4")])]);
        assert_eq!(table.header, vec!["time", "{}"]);
        assert_eq!(table.rows[0][1], "");
        assert_eq!(table.rows[1][1], "4");
        assert_eq!(table.bad_samples, 1);
    }

    #[test]
    fn test_pivot_of_nothing_has_only_time_column() {
        let table = pivot(Vec::new());
        assert_eq!(table.header, vec!["time"]);
        assert!(table.rows.is_empty());
    }

    #[test]
    fn test_request_url_parameters() {
        let url = query().request_url();
        assert_eq!(url.path(), "/api/v1/query_range");

        let pairs: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["query"], "up{job=\"node\"}");
        assert_eq!(pairs["start"], "1704067200");
        assert_eq!(pairs["end"], "1704070800");
        assert_eq!(pairs["step"], "300s");
        assert_eq!(pairs["dedup"], "true");
    }

    #[test]
    fn test_basic_auth_only_with_credentials() {
        let mut q = query();
        assert_eq!(q.authorization(), None);

        q.user = "admin".into();
        q.password = "secret".into();
        assert_eq!(q.authorization().as_deref(), Some("Basic YWRtaW46c2VjcmV0"));
    }

    #[test]
    fn test_error_message_prefers_json_error() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        assert_eq!(error_message(body), "bad_data: parse error");
        assert_eq!(error_message("  gateway timeout \n"), "gateway timeout");
    }

    #[test]
    fn test_decode_response_values() {
        let body = r#"{"status":"success","data":{"resultType":"matrix","result":[
            {"metric":{"job":"node"},"values":[[1435781430.781,"1"],[1435781445.781,"0"]]}
        ]}}"#;
        let response: QueryRangeResponse = serde_json::from_str(body).unwrap();
        let result = response.data.unwrap().result;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].values[0], (1435781430.781, "1".to_string()));

        let table = pivot(result);
        assert_eq!(table.rows[0][0], "2015-07-01T20:10:30.781Z");
    }
}
