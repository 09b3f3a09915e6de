use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::fallible_iterator::FallibleIterator;
use postgres::types::{FromSql, Type};
use postgres::{Client, Config, NoTls, Row};
use rust_decimal::Decimal;
use std::error::Error;
use std::fmt::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{rewrite_named_binds, Binding, Connector, RowHandler, Session};
use crate::config::DbConnection;
use crate::error::{PipelineError, PipelineResult};
use crate::record::{Columns, Value};

/// PostgreSQL connector; every worker gets its own client
pub struct PostgresConnector {
    config: Config,
    target: String,
}

impl PostgresConnector {
    pub fn new(connection: &DbConnection) -> Self {
        let mut config = Config::new();
        config
            .host(&connection.host)
            .port(connection.port)
            .dbname(&connection.database)
            .user(&connection.user)
            .application_name("mailts");
        if !connection.password.is_empty() {
            config.password(&connection.password);
        }

        Self {
            config,
            target: connection.describe(),
        }
    }
}

impl Connector for PostgresConnector {
    fn describe(&self) -> String {
        self.target.clone()
    }

    fn connect(&self) -> PipelineResult<Box<dyn Session>> {
        let client = self
            .config
            .connect(NoTls)
            .map_err(|e| PipelineError::connection(&self.target, e))?;
        Ok(Box::new(PostgresSession {
            client,
            statement_timeout: None,
        }))
    }
}

struct PostgresSession {
    client: Client,
    statement_timeout: Option<Duration>,
}

impl PostgresSession {
    fn apply_deadline(&mut self, deadline: Option<Duration>) -> PipelineResult<()> {
        if self.statement_timeout == deadline {
            return Ok(());
        }
        let millis = deadline.map_or(0, |d| d.as_millis().max(1));
        self.client
            .batch_execute(&format!("SET statement_timeout = {}", millis))
            .map_err(PipelineError::statement)?;
        debug!(statement_timeout_ms = millis as u64, "applied statement timeout");
        self.statement_timeout = deadline;
        Ok(())
    }
}

impl Session for PostgresSession {
    fn execute(
        &mut self,
        statement: &str,
        binds: &[Binding<'_>],
        deadline: Option<Duration>,
        on_row: &mut RowHandler<'_>,
    ) -> PipelineResult<()> {
        self.apply_deadline(deadline)?;

        let (sql, names) = rewrite_named_binds(statement);
        let params = names
            .iter()
            .map(|name| {
                binds
                    .iter()
                    .find(|(bind, _)| bind == name)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| {
                        PipelineError::statement(format!("no value for bind variable :{}", name))
                    })
            })
            .collect::<PipelineResult<Vec<i64>>>()?;

        let prepared = self
            .client
            .prepare_typed(&sql, &vec![Type::INT8; params.len()])
            .map_err(PipelineError::statement)?;
        let columns: Columns = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>()
            .into();

        let mut rows = self
            .client
            .query_raw(&prepared, params)
            .map_err(PipelineError::statement)?;

        while let Some(row) = rows.next().map_err(PipelineError::statement)? {
            if on_row(&columns, decode_row(&row)).is_break() {
                break;
            }
        }
        Ok(())
    }
}

fn decode_row(row: &Row) -> PipelineResult<Vec<Value>> {
    (0..row.len())
        .map(|idx| {
            decode_value(row, idx).map_err(|e| {
                PipelineError::row_decode(format!(
                    "column {} ({}): {}",
                    row.columns()[idx].name(),
                    row.columns()[idx].type_().name(),
                    e
                ))
            })
        })
        .collect()
}

fn decode_value(row: &Row, idx: usize) -> Result<Value, postgres::Error> {
    fn opt<T>(value: Option<T>, wrap: impl FnOnce(T) -> Value) -> Value {
        value.map_or(Value::Null, wrap)
    }
    fn text<T: ToString>(value: T) -> Value {
        Value::Text(value.to_string())
    }

    let ty = row.columns()[idx].type_();
    let value = match ty.name() {
        "bool" => opt(row.try_get::<_, Option<bool>>(idx)?, Value::Bool),
        "int2" => opt(row.try_get::<_, Option<i16>>(idx)?, |v| Value::Int(v.into())),
        "int4" => opt(row.try_get::<_, Option<i32>>(idx)?, |v| Value::Int(v.into())),
        "int8" => opt(row.try_get::<_, Option<i64>>(idx)?, Value::Int),
        "oid" => opt(row.try_get::<_, Option<u32>>(idx)?, |v| Value::Int(v.into())),
        "float4" => opt(row.try_get::<_, Option<f32>>(idx)?, Value::Float32),
        "float8" => opt(row.try_get::<_, Option<f64>>(idx)?, Value::Float),
        "numeric" => opt(row.try_get::<_, Option<Numeric>>(idx)?, |n| Value::Text(n.0)),
        "timestamp" => opt(
            row.try_get::<_, Option<NaiveDateTime>>(idx)?,
            Value::Timestamp,
        ),
        "timestamptz" => opt(
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?,
            Value::TimestampTz,
        ),
        "date" => opt(row.try_get::<_, Option<NaiveDate>>(idx)?, Value::Date),
        "time" => opt(row.try_get::<_, Option<NaiveTime>>(idx)?, |t| {
            Value::Text(t.format("%H:%M:%S%.f").to_string())
        }),
        "interval" => opt(row.try_get::<_, Option<Interval>>(idx)?, text),
        "uuid" => opt(row.try_get::<_, Option<Uuid>>(idx)?, text),
        "json" | "jsonb" => opt(row.try_get::<_, Option<serde_json::Value>>(idx)?, text),
        "inet" | "cidr" => opt(row.try_get::<_, Option<Inet>>(idx)?, text),
        "bytea" => opt(row.try_get::<_, Option<Vec<u8>>>(idx)?, Value::Bytes),
        _ if <String as FromSql>::accepts(ty) => {
            opt(row.try_get::<_, Option<String>>(idx)?, Value::Text)
        }
        _ => opt(row.try_get::<_, Option<RawValue>>(idx)?, text),
    };
    Ok(value)
}

type DecodeResult<T> = Result<T, Box<dyn Error + Sync + Send>>;

fn be_bytes<const N: usize>(raw: &[u8], at: usize) -> DecodeResult<[u8; N]> {
    raw.get(at..at + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| format!("value truncated at byte {}", at).into())
}

/// NUMERIC rendered exactly, NaN and infinities included
#[derive(Debug, PartialEq)]
struct Numeric(String);

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        let sign = u16::from_be_bytes(be_bytes(raw, 4)?);
        if !matches!(sign, NUMERIC_NAN | NUMERIC_PINF | NUMERIC_NINF) {
            if let Ok(decimal) = Decimal::from_sql(ty, raw) {
                return Ok(Numeric(decimal.to_string()));
            }
        }
        // special values and more than 28 significant digits
        numeric_text(raw).map(Numeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Binary NUMERIC: ndigits, weight, sign, dscale, then base-10000 digits
fn numeric_text(raw: &[u8]) -> DecodeResult<String> {
    let ndigits = u16::from_be_bytes(be_bytes(raw, 0)?) as usize;
    let weight = i16::from_be_bytes(be_bytes(raw, 2)?) as i32;
    let sign = u16::from_be_bytes(be_bytes(raw, 4)?);
    let dscale = u16::from_be_bytes(be_bytes(raw, 6)?) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".into()),
        NUMERIC_PINF => return Ok("Infinity".into()),
        NUMERIC_NINF => return Ok("-Infinity".into()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| be_bytes(raw, 8 + 2 * i).map(u16::from_be_bytes))
        .collect::<DecodeResult<Vec<u16>>>()?;
    let group = |pos: i32| -> u16 {
        usize::try_from(pos)
            .ok()
            .and_then(|pos| digits.get(pos).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        write!(out, "{}", group(0))?;
        for pos in 1..=weight {
            write!(out, "{:04}", group(pos))?;
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            write!(fraction, "{:04}", group(pos))?;
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// INTERVAL in the server's default output style
#[derive(Debug, PartialEq)]
struct Interval {
    micros: i64,
    days: i32,
    months: i32,
}

impl<'a> FromSql<'a> for Interval {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        Ok(Interval {
            micros: i64::from_be_bytes(be_bytes(raw, 0)?),
            days: i32::from_be_bytes(be_bytes(raw, 8)?),
            months: i32::from_be_bytes(be_bytes(raw, 12)?),
        })
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INTERVAL
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        let mut negative_seen = false;
        let fields = [
            (i64::from(self.months / 12), "year"),
            (i64::from(self.months % 12), "mon"),
            (i64::from(self.days), "day"),
        ];
        for (value, unit) in fields {
            if value == 0 {
                continue;
            }
            let plus = if negative_seen && value > 0 { "+" } else { "" };
            let plural = if value == 1 { "" } else { "s" };
            parts.push(format!("{}{} {}{}", plus, value, unit, plural));
            negative_seen |= value < 0;
        }

        if self.micros != 0 || parts.is_empty() {
            let sign = if self.micros < 0 {
                "-"
            } else if negative_seen {
                "+"
            } else {
                ""
            };
            let total = self.micros.unsigned_abs();
            let secs = total / 1_000_000;
            let mut clock = format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                secs / 3600,
                secs / 60 % 60,
                secs % 60
            );
            let frac = total % 1_000_000;
            if frac != 0 {
                clock.push_str(format!(".{:06}", frac).trim_end_matches('0'));
            }
            parts.push(clock);
        }
        f.write_str(&parts.join(" "))
    }
}

/// INET and CIDR; the prefix length is shown unless it covers the address
#[derive(Debug, PartialEq)]
struct Inet {
    addr: IpAddr,
    bits: u8,
    cidr: bool,
}

impl<'a> FromSql<'a> for Inet {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        let [family, bits, cidr, len] = be_bytes::<4>(raw, 0)?;
        let addr = match (family, len) {
            (2, 4) => IpAddr::V4(Ipv4Addr::from(be_bytes::<4>(raw, 4)?)),
            (3, 16) => IpAddr::V6(Ipv6Addr::from(be_bytes::<16>(raw, 4)?)),
            _ => return Err(format!("unknown address family {}", family).into()),
        };
        Ok(Inet {
            addr,
            bits,
            cidr: cidr != 0,
        })
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INET || *ty == Type::CIDR
    }
}

impl fmt::Display for Inet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = if self.addr.is_ipv4() { 32 } else { 128 };
        if self.cidr || self.bits != full {
            write!(f, "{}/{}", self.addr, self.bits)
        } else {
            write!(f, "{}", self.addr)
        }
    }
}

/// Undecoded wire value of any other type. Enums arrive as their label
/// and are shown as text, binary encodings are shown as hex.
#[derive(Debug, PartialEq)]
struct RawValue(Vec<u8>);

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if !s.chars().any(|c| c.is_control() && !c.is_whitespace()) => f.write_str(s),
            _ => f.write_str(&hex::encode(&self.0)),
        }
    }
}

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}
