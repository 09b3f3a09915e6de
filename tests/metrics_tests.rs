mod common;
use common::*;

use mailts::config::load_config;
use mailts::report::{run_reports, ReportState, RunSummary};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const TWO_SERIES: &str = r#"{
  "status": "success",
  "data": {
    "resultType": "matrix",
    "result": [
      {"metric": {"job": "node", "instance": "b"}, "values": [[1704067200, "1"], [1704067260, "2"]]},
      {"metric": {"job": "node", "instance": "a"}, "values": [[1704067260, "0.25"]]}
    ]
  }
}"#;

fn metrics_config(dir: &Path, url: &str, extra_connection: &str, out: &Path) -> std::path::PathBuf {
    write_config(
        dir,
        &format!(
            r#"
query:
  - name: load
    connection:
      driver: prometheus
      url: "{url}"
      start: "2024-01-01T00:00:00Z"
      end: "2024-01-01T00:01:00Z"
      step: 1m
{extra}
    statement: 'up{{job="node"}}'
    timeout: 5s
    output:
      csv:
        - filename: "{out}"
"#,
            url = url,
            extra = extra_connection,
            out = out.display()
        ),
    )
}

fn run(config: &Path) -> RunSummary {
    let loaded = load_config(config).unwrap();
    assert!(loaded.rejected.is_empty(), "{:?}", loaded.rejected);
    run_reports(loaded.reports, Arc::new(RecordingMailer::default())).unwrap()
}

#[test]
fn test_series_are_pivoted_by_timestamp() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("metrics.csv");
    let (url, server) = serve_http(200, TWO_SERIES.to_string(), 1);
    let config = metrics_config(dir.path(), &url, "", &out);

    let summary = run(&config);
    let outcome = &summary.reports[0];
    assert_eq!(outcome.state, ReportState::Done);
    assert_eq!(outcome.rows_emitted, 2);
    assert_eq!(outcome.items_ok, 1);

    assert_eq!(
        std::fs::read_to_string(&out).unwrap(),
        "time,instance:a|job:node,instance:b|job:node\n\
         2024-01-01T00:00:00Z,,1\n\
         2024-01-01T00:01:00Z,0.25,2\n"
    );

    let requests = server.join().unwrap();
    let request_line = requests[0].lines().next().unwrap();
    assert!(request_line.starts_with("GET /api/v1/query_range?"));
    assert!(request_line.contains("start=1704067200"));
    assert!(request_line.contains("end=1704067260"));
    assert!(request_line.contains("step=60s"));
    assert!(!requests[0].to_ascii_lowercase().contains("authorization:"));
}

#[test]
fn test_credentials_are_sent_as_basic_auth() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("auth.csv");
    let (url, server) = serve_http(200, TWO_SERIES.to_string(), 1);
    let config = metrics_config(
        dir.path(),
        &url,
        "      user: admin\n      password: secret",
        &out,
    );

    run(&config);
    let requests = server.join().unwrap();
    // base64("admin:secret")
    assert!(requests[0].contains("Basic YWRtaW46c2VjcmV0"));
}

#[test]
fn test_error_status_fails_the_report_without_rows() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("bad.csv");
    let body = r#"{"status":"error","errorType":"bad_data","error":"parse error at char 3"}"#;
    let (url, server) = serve_http(400, body.to_string(), 1);
    let config = metrics_config(dir.path(), &url, "", &out);

    let summary = run(&config);
    server.join().unwrap();
    let outcome = &summary.reports[0];
    assert_eq!(outcome.state, ReportState::Done);
    assert_eq!(outcome.items_failed, 1);
    assert_eq!(outcome.rows_emitted, 0);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "");
}

#[test]
fn test_unreachable_endpoint_is_recovered() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("down.csv");
    let url = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };
    let config = metrics_config(dir.path(), &url, "", &out);

    let summary = run(&config);
    assert_eq!(summary.reports[0].items_failed, 1);
    assert_eq!(summary.reports[0].workers_completed, 1);
}
