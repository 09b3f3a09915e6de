//! Report configuration
//!
//! Loading is two-phase. Parsing the YAML document is all-or-nothing; each
//! report is then resolved on its own into an immutable [`ReportSpec`], and a
//! report that fails resolution is rejected without affecting the others.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{PipelineError, PipelineResult};
use crate::mail::EmailSpec;
use crate::partition::RangeSpec;
use crate::sink::SinkDescriptor;
use crate::source::metrics::MetricsQuery;
use crate::timespec::parse_time_expression;

const DEFAULT_DELIMITER: u8 = b',';
const DEFAULT_POSTGRES_PORT: u16 = 5432;
const DEFAULT_SHEET: &str = "Sheet1";
const HEADER_TRIM: &[char] = &[' ', '\t', '\r', '\n'];

/// The configuration document as written
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub query: Vec<ReportConfig>,
    /// Cron expression used with `--use-cron`
    #[serde(default)]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub name: Option<String>,
    pub connection: ConnectionConfig,
    #[serde(alias = "query")]
    pub statement: String,
    pub range: Option<RangeConfig>,
    pub header: Vec<String>,
    pub delimiter: String,
    /// Per work item deadline, e.g. `30s`
    pub timeout: Option<String>,
    pub output: Option<OutputConfig>,
    pub email: Option<EmailSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde(alias = "type")]
    pub driver: String,
    pub host: String,
    pub port: Option<PortValue>,
    pub database: String,
    pub user: String,
    pub password: String,
    pub url: String,
    pub start: String,
    pub end: String,
    pub step: String,
}

/// Ports are accepted both as numbers and as strings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeConfig {
    pub start: i64,
    pub stepsize: i64,
    pub steps: i64,
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    #[serde(default)]
    pub bindvar_start: String,
    #[serde(default)]
    pub bindvar_end: String,
    #[serde(default)]
    pub single_header: bool,
}

fn default_parallel() -> usize {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub csv: Vec<FileOutput>,
    pub xls: Vec<SheetOutput>,
    pub screen: Vec<ScreenOutput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileOutput {
    pub filename: String,
    pub mail: bool,
    pub temporary: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SheetOutput {
    pub filename: String,
    pub sheetname: String,
    pub mail: bool,
    pub temporary: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScreenOutput {
    pub filename: String,
    pub mail: bool,
}

/// Relational drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbDriver {
    Postgres,
    Sqlite,
}

/// Relational connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConnection {
    pub driver: DbDriver,
    pub host: String,
    pub port: u16,
    /// Database name, or the file path for sqlite
    pub database: String,
    pub user: String,
    pub password: String,
}

impl DbConnection {
    /// Connection target without credentials
    pub fn describe(&self) -> String {
        match self.driver {
            DbDriver::Postgres => format!(
                "postgres://{}@{}:{}/{}",
                self.user, self.host, self.port, self.database
            ),
            DbDriver::Sqlite => format!("sqlite://{}", self.database),
        }
    }
}

/// Where a report's rows come from
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    Relational {
        connection: DbConnection,
        statement: String,
        range: Option<RangeSpec>,
        timeout: Option<Duration>,
    },
    Metrics(MetricsQuery),
}

impl SourceSpec {
    pub fn describe(&self) -> String {
        match self {
            SourceSpec::Relational { connection, .. } => connection.describe(),
            SourceSpec::Metrics(query) => query.describe(),
        }
    }

    pub fn range(&self) -> Option<&RangeSpec> {
        match self {
            SourceSpec::Relational { range, .. } => range.as_ref(),
            SourceSpec::Metrics(_) => None,
        }
    }
}

/// One fully resolved report
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSpec {
    pub name: String,
    pub source: SourceSpec,
    /// Configured header override
    pub header: Option<Vec<String>>,
    pub delimiter: u8,
    pub outputs: Vec<SinkDescriptor>,
    pub email: EmailSpec,
}

/// Result of loading a configuration file
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub reports: Vec<ReportSpec>,
    /// Reports that failed resolution, by name
    pub rejected: Vec<(String, PipelineError)>,
    pub schedule: Option<String>,
}

/// Read, parse and resolve a configuration file
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    load_config_at(path, Local::now())
}

/// [`load_config`] with an explicit instant for placeholders and relative
/// times
pub fn load_config_at(path: &Path, now: DateTime<Local>) -> Result<LoadedConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read configuration {}", path.display()))?;
    let document = parse_document(&text)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    Ok(resolve(document, now))
}

pub fn parse_document(text: &str) -> Result<ConfigDocument> {
    // an empty file deserializes to null
    if text.trim().is_empty() {
        return Ok(ConfigDocument::default());
    }
    Ok(serde_yaml::from_str(text)?)
}

/// Resolve every report of a parsed document
pub fn resolve(document: ConfigDocument, now: DateTime<Local>) -> LoadedConfig {
    let mut loaded = LoadedConfig {
        schedule: document.schedule.filter(|s| !s.trim().is_empty()),
        ..LoadedConfig::default()
    };

    for (idx, report) in document.query.into_iter().enumerate() {
        let name = report
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("report-{}", idx + 1));
        match resolve_report(name.clone(), report, now) {
            Ok(spec) => loaded.reports.push(spec),
            Err(err) => loaded.rejected.push((name, err)),
        }
    }
    loaded
}

fn resolve_report(name: String, report: ReportConfig, now: DateTime<Local>) -> PipelineResult<ReportSpec> {
    let delimiter = parse_delimiter(&report.delimiter)?;
    let header = resolve_header(&report.header, delimiter);
    let timeout = report.timeout.as_deref().map(parse_timeout).transpose()?;

    let statement = report.statement.trim().to_string();
    if statement.is_empty() {
        return Err(PipelineError::config("statement is empty"));
    }

    let source = resolve_source(&report.connection, statement, report.range.as_ref(), timeout, now)?;
    let outputs = resolve_outputs(report.output.as_ref(), now)?;

    Ok(ReportSpec {
        name,
        source,
        header,
        delimiter,
        outputs,
        email: report.email.unwrap_or_default(),
    })
}

fn parse_delimiter(value: &str) -> PipelineResult<u8> {
    if value.is_empty() {
        return Ok(DEFAULT_DELIMITER);
    }
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c as u8),
        _ => Err(PipelineError::config(format!(
            "delimiter must be a single ASCII character, got '{}'",
            value
        ))),
    }
}

/// A single header entry is split on the delimiter; several entries are
/// taken as they are
fn resolve_header(header: &[String], delimiter: u8) -> Option<Vec<String>> {
    match header {
        [] => None,
        [single] => Some(
            single
                .trim_matches(HEADER_TRIM)
                .split(char::from(delimiter))
                .map(str::to_string)
                .collect(),
        ),
        many => Some(many.to_vec()),
    }
}

fn parse_timeout(value: &str) -> PipelineResult<Duration> {
    let timeout = humantime::parse_duration(value.trim())
        .map_err(|e| PipelineError::config(format!("invalid timeout '{}': {}", value, e)))?;
    if timeout.is_zero() {
        return Err(PipelineError::config("timeout must be positive"));
    }
    Ok(timeout)
}

fn required<'a>(value: &'a str, field: &str, driver: &str) -> PipelineResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PipelineError::config(format!(
            "connection.{} is required for driver '{}'",
            field, driver
        )));
    }
    Ok(value)
}

fn resolve_port(port: Option<&PortValue>) -> PipelineResult<u16> {
    fn invalid(shown: impl std::fmt::Display) -> PipelineError {
        PipelineError::config(format!("invalid connection.port '{}'", shown))
    }
    match port {
        None => Ok(DEFAULT_POSTGRES_PORT),
        Some(PortValue::Number(n)) => u16::try_from(*n).map_err(|_| invalid(n)),
        Some(PortValue::Text(s)) if s.trim().is_empty() => Ok(DEFAULT_POSTGRES_PORT),
        Some(PortValue::Text(s)) => s.trim().parse().map_err(|_| invalid(s)),
    }
}

fn resolve_range(range: &RangeConfig) -> PipelineResult<RangeSpec> {
    RangeSpec::new(
        range.start,
        range.stepsize,
        range.steps,
        range.parallel,
        range.bindvar_start.trim(),
        range.bindvar_end.trim(),
    )
    .map(|spec| spec.with_single_header(range.single_header))
}

fn resolve_source(
    connection: &ConnectionConfig,
    statement: String,
    range: Option<&RangeConfig>,
    timeout: Option<Duration>,
    now: DateTime<Local>,
) -> PipelineResult<SourceSpec> {
    let driver = connection.driver.trim().to_ascii_lowercase();
    match driver.as_str() {
        "postgres" | "postgresql" | "pq" => {
            let connection = DbConnection {
                driver: DbDriver::Postgres,
                host: required(&connection.host, "host", &driver)?.to_string(),
                port: resolve_port(connection.port.as_ref())?,
                database: required(&connection.database, "database", &driver)?.to_string(),
                user: required(&connection.user, "user", &driver)?.to_string(),
                password: connection.password.clone(),
            };
            Ok(SourceSpec::Relational {
                connection,
                statement,
                range: range.map(resolve_range).transpose()?,
                timeout,
            })
        }
        "sqlite" | "sqlite3" => {
            let connection = DbConnection {
                driver: DbDriver::Sqlite,
                host: String::new(),
                port: 0,
                database: required(&connection.database, "database", &driver)?.to_string(),
                user: String::new(),
                password: String::new(),
            };
            Ok(SourceSpec::Relational {
                connection,
                statement,
                range: range.map(resolve_range).transpose()?,
                timeout,
            })
        }
        "prometheus" | "metrics" => {
            if range.is_some() {
                return Err(PipelineError::config(
                    "range partitioning is only supported for relational sources",
                ));
            }
            resolve_metrics(connection, statement, timeout, now, &driver).map(SourceSpec::Metrics)
        }
        "" => Err(PipelineError::config("connection.driver is required")),
        other => Err(PipelineError::config(format!("unsupported driver '{}'", other))),
    }
}

fn resolve_metrics(
    connection: &ConnectionConfig,
    query: String,
    timeout: Option<Duration>,
    now: DateTime<Local>,
    driver: &str,
) -> PipelineResult<MetricsQuery> {
    let raw_url = required(&connection.url, "url", driver)?;
    let endpoint = Url::parse(raw_url)
        .map_err(|e| PipelineError::config(format!("invalid connection.url '{}': {}", raw_url, e)))?;

    let start = parse_time_expression(required(&connection.start, "start", driver)?, now)
        .map_err(|e| PipelineError::config(format!("connection.start: {}", e)))?;
    let end = parse_time_expression(required(&connection.end, "end", driver)?, now)
        .map_err(|e| PipelineError::config(format!("connection.end: {}", e)))?;
    if end < start {
        return Err(PipelineError::config("connection.end is before connection.start"));
    }

    let raw_step = required(&connection.step, "step", driver)?;
    let step = humantime::parse_duration(raw_step)
        .map_err(|e| PipelineError::config(format!("invalid connection.step '{}': {}", raw_step, e)))?;
    if step.as_secs() == 0 {
        return Err(PipelineError::config("connection.step must be at least 1s"));
    }

    Ok(MetricsQuery {
        endpoint,
        user: connection.user.clone(),
        password: connection.password.clone(),
        start,
        end,
        step,
        query,
        timeout,
    })
}

fn resolve_outputs(output: Option<&OutputConfig>, now: DateTime<Local>) -> PipelineResult<Vec<SinkDescriptor>> {
    let Some(output) = output else {
        return Ok(vec![SinkDescriptor::console("STDOUT")]);
    };

    let mut outputs = Vec::new();
    for csv in &output.csv {
        let filename = substitute_placeholders(required_filename(&csv.filename, "csv")?, now);
        outputs.push(
            SinkDescriptor::delimited(filename)
                .with_temporary(csv.temporary)
                .with_mail(csv.mail),
        );
    }
    for xls in &output.xls {
        let filename = substitute_placeholders(required_filename(&xls.filename, "xls")?, now);
        let sheet = match xls.sheetname.trim() {
            "" => DEFAULT_SHEET.to_string(),
            name => substitute_placeholders(name, now),
        };
        outputs.push(
            SinkDescriptor::spreadsheet(filename, sheet)
                .with_temporary(xls.temporary)
                .with_mail(xls.mail),
        );
    }
    for screen in &output.screen {
        outputs.push(SinkDescriptor::console(&screen.filename));
    }

    if outputs.is_empty() {
        outputs.push(SinkDescriptor::console("STDOUT"));
    }
    Ok(outputs)
}

fn required_filename<'a>(filename: &'a str, kind: &str) -> PipelineResult<&'a str> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(PipelineError::config(format!("{} output needs a filename", kind)));
    }
    Ok(filename)
}

/// Replace `{DATE}`, `{TIME}`, `{DATETIME}` and `{TIMESTAMP}` with parts of
/// `now`
pub fn substitute_placeholders(template: &str, now: DateTime<Local>) -> String {
    let stamp = now.format("%Y%m%d%H%M%S").to_string();
    template
        .replace("{DATETIME}", &stamp)
        .replace("{TIMESTAMP}", &stamp)
        .replace("{DATE}", &stamp[..8])
        .replace("{TIME}", &stamp[8..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ConsoleStream, SinkKind};
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 2, 29, 13, 5, 9).unwrap()
    }

    fn load(yaml: &str) -> LoadedConfig {
        resolve(parse_document(yaml).unwrap(), now())
    }

    #[test]
    fn test_full_postgres_report() {
        let loaded = load(
            r#"
query:
  - name: orders
    connection:
      driver: postgres
      host: db.local
      port: "6543"
      database: shop
      user: report
      password: secret
    statement: "select * from orders where id between :lo and :hi"
    range:
      start: 1
      stepsize: 100
      steps: 10
      parallel: 4
      bindvar_start: lo
      bindvar_end: hi
    header: ["id;total"]
    delimiter: ";"
    timeout: 30s
    output:
      csv:
        - filename: "orders_{DATE}.csv"
          mail: true
          temporary: true
      xls:
        - filename: "orders_{DATETIME}.xlsx"
          sheetname: "S{TIME}"
      screen:
        - filename: stderr
    email:
      to: [ops@example.com]
      subject: Orders
"#,
        );

        assert!(loaded.rejected.is_empty(), "{:?}", loaded.rejected);
        let report = &loaded.reports[0];
        assert_eq!(report.name, "orders");
        assert_eq!(report.delimiter, b';');
        assert_eq!(report.header, Some(vec!["id".to_string(), "total".to_string()]));

        match &report.source {
            SourceSpec::Relational {
                connection,
                range,
                timeout,
                statement,
            } => {
                assert_eq!(connection.driver, DbDriver::Postgres);
                assert_eq!(connection.port, 6543);
                assert_eq!(connection.describe(), "postgres://report@db.local:6543/shop");
                assert!(statement.contains(":lo"));
                let range = range.as_ref().unwrap();
                assert_eq!((range.start, range.step_size, range.steps), (1, 100, 10));
                assert_eq!(range.parallelism, 4);
                assert!(!range.single_header);
                assert_eq!(*timeout, Some(Duration::from_secs(30)));
            }
            other => panic!("unexpected source {:?}", other),
        }

        assert_eq!(report.outputs.len(), 3);
        let csv = &report.outputs[0];
        assert_eq!(csv.path, PathBuf::from("orders_20240229.csv"));
        assert!(csv.mail && csv.temporary);
        let xls = &report.outputs[1];
        assert_eq!(xls.path, PathBuf::from("orders_20240229130509.xlsx"));
        assert_eq!(
            xls.kind,
            SinkKind::Spreadsheet {
                sheet: "S130509".into()
            }
        );
        assert_eq!(report.outputs[2].kind, SinkKind::Console(ConsoleStream::Stderr));
        assert_eq!(report.email.to, vec!["ops@example.com"]);
        assert_eq!(report.email.subject, "Orders");
    }

    #[test]
    fn test_defaults() {
        let loaded = load(
            r#"
query:
  - connection: {type: pq, host: h, database: d, user: u, port: 5433}
    query: select 1
"#,
        );
        let report = &loaded.reports[0];
        assert_eq!(report.name, "report-1");
        assert_eq!(report.delimiter, b',');
        assert_eq!(report.header, None);
        assert_eq!(report.outputs, vec![SinkDescriptor::console("STDOUT")]);
        assert_eq!(report.email, EmailSpec::default());
        match &report.source {
            SourceSpec::Relational {
                connection,
                range,
                timeout,
                ..
            } => {
                assert_eq!(connection.port, 5433);
                assert!(range.is_none());
                assert!(timeout.is_none());
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_bad_report_is_rejected_alone() {
        let loaded = load(
            r#"
query:
  - name: good
    connection: {driver: sqlite, database: /tmp/x.db}
    statement: select 1
  - name: bad-range
    connection: {driver: sqlite, database: /tmp/x.db}
    statement: select 1
    range: {start: 0, stepsize: 0, steps: 3, bindvar_start: a, bindvar_end: b}
  - name: mysql
    connection: {driver: mysql, host: h}
    statement: select 1
  - name: no-host
    connection: {driver: postgres, database: d, user: u}
    statement: select 1
  - name: wide-delimiter
    connection: {driver: sqlite, database: /tmp/x.db}
    statement: select 1
    delimiter: ";;"
"#,
        );

        assert_eq!(loaded.reports.len(), 1);
        assert_eq!(loaded.reports[0].name, "good");
        let rejected: Vec<&str> = loaded.rejected.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(rejected, vec!["bad-range", "mysql", "no-host", "wide-delimiter"]);
        assert!(loaded.rejected.iter().all(|(_, e)| e.kind() == "config"));
        assert!(loaded.rejected[1].1.to_string().contains("unsupported driver 'mysql'"));
    }

    #[test]
    fn test_metrics_report() {
        let loaded = load(
            r#"
schedule: "0 6 * * *"
query:
  - name: load
    connection:
      driver: prometheus
      url: http://prom:9090
      user: admin
      password: pw
      start: 2024-02-28T00:00:00Z
      end: now
      step: 5m
    statement: node_load1
"#,
        );

        assert_eq!(loaded.schedule.as_deref(), Some("0 6 * * *"));
        match &loaded.reports[0].source {
            SourceSpec::Metrics(query) => {
                assert_eq!(query.query, "node_load1");
                assert_eq!(query.step, Duration::from_secs(300));
                assert_eq!(query.start, Utc.with_ymd_and_hms(2024, 2, 28, 0, 0, 0).unwrap());
                assert_eq!(query.end, now());
                assert_eq!(query.user, "admin");
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_metrics_rejects_range_and_bad_step() {
        let loaded = load(
            r#"
query:
  - name: ranged
    connection: {driver: metrics, url: "http://p", start: -1h, end: now, step: 1m}
    statement: up
    range: {start: 0, stepsize: 1, steps: 1, bindvar_start: a, bindvar_end: b}
  - name: tiny-step
    connection: {driver: metrics, url: "http://p", start: -1h, end: now, step: 10ms}
    statement: up
  - name: backwards
    connection: {driver: metrics, url: "http://p", start: now, end: -1h, step: 1m}
    statement: up
"#,
        );
        assert!(loaded.reports.is_empty());
        assert_eq!(loaded.rejected.len(), 3);
    }

    #[test]
    fn test_header_entries() {
        assert_eq!(
            resolve_header(&[" a,b ,c\r\n".to_string()], b','),
            Some(vec!["a".to_string(), "b ".to_string(), "c".to_string()])
        );
        assert_eq!(
            resolve_header(&["x,y".to_string(), "z".to_string()], b','),
            Some(vec!["x,y".to_string(), "z".to_string()])
        );
        assert_eq!(resolve_header(&[], b','), None);
    }

    #[test]
    fn test_single_header_flag() {
        let loaded = load(
            r#"
query:
  - connection: {driver: sqlite, database: a.db}
    statement: select 1
    range: {start: 0, stepsize: 5, steps: 2, parallel: 2, bindvar_start: a, bindvar_end: b, single_header: true}
"#,
        );
        let range = loaded.reports[0].source.range().unwrap();
        assert!(range.single_header);
        assert_eq!(range.parallelism, 2);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            substitute_placeholders("r_{DATE}_{TIME}_{DATETIME}_{TIMESTAMP}", now()),
            "r_20240229_130509_20240229130509_20240229130509"
        );
        assert_eq!(substitute_placeholders("plain.csv", now()), "plain.csv");
    }

    #[test]
    fn test_empty_outputs_fall_back_to_stdout() {
        let loaded = load(
            r#"
query:
  - connection: {driver: sqlite, database: a.db}
    statement: select 1
    output: {csv: []}
"#,
        );
        assert_eq!(loaded.reports[0].outputs, vec![SinkDescriptor::console("STDOUT")]);
    }

    #[test]
    fn test_parse_failure_is_an_error() {
        assert!(parse_document("query: [unclosed").is_err());
        assert!(parse_document("query: 5").is_err());
        assert!(parse_document("").unwrap().query.is_empty());
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mailts.yml");
        fs::write(
            &path,
            "query:\n  - connection: {driver: sqlite, database: a.db}\n    statement: select 1\n",
        )
        .unwrap();
        assert_eq!(load_config(&path).unwrap().reports.len(), 1);

        let err = load_config(&dir.path().join("missing.yml")).unwrap_err();
        assert!(format!("{:#}", err).contains("cannot read configuration"));
    }
}
