// tests/common/mod.rs
// Shared test utilities for integration tests
#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;

use mailts::error::PipelineResult;
use mailts::mail::{Mailer, OutgoingMail};

/// Run the built binary in `cwd`, returning stdout, stderr and exit code
pub fn run_mailts(args: &[&str], cwd: &Path) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_mailts"))
        .args(args)
        .current_dir(cwd)
        .env_remove("MAILTS_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("Failed to execute mailts");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

/// Write `yaml` to `<dir>/config.yml`
pub fn write_config(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("config.yml");
    fs::write(&path, yaml).expect("Failed to write config");
    path
}

/// SQLite database with `events(id, label, amount)` holding ids `0..rows`
pub fn create_events_db(path: &Path, rows: i64) {
    let conn = rusqlite::Connection::open(path).expect("Failed to create database");
    conn.execute_batch(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, label TEXT, amount REAL);",
    )
    .expect("Failed to create table");
    let mut insert = conn
        .prepare("INSERT INTO events (id, label, amount) VALUES (?1, ?2, ?3)")
        .expect("Failed to prepare insert");
    for id in 0..rows {
        insert
            .execute(rusqlite::params![id, format!("event-{}", id), id as f64 / 2.0])
            .expect("Failed to insert row");
    }
}

/// Data lines of a delimited file, with every line equal to `header` removed
pub fn data_lines(path: &Path, header: &str) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e))
        .lines()
        .filter(|line| *line != header)
        .map(str::to_string)
        .collect()
}

/// Records mails instead of delivering them
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<OutgoingMail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap().clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, mail: &OutgoingMail) -> PipelineResult<()> {
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

/// Serve `requests` HTTP requests with `status` and `body`; returns the base
/// URL and a handle yielding the raw request lines
pub fn serve_http(
    status: u16,
    body: String,
    requests: usize,
) -> (String, thread::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind stub server");
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let mut seen = Vec::new();
        for stream in listener.incoming().take(requests) {
            let mut stream = stream.unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut request = vec![request_line.trim_end().to_string()];
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line.trim_end().is_empty() {
                    break;
                }
                request.push(line.trim_end().to_string());
            }
            seen.push(request.join("\n"));

            let reason = if status < 400 { "OK" } else { "Error" };
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
        }
        seen
    });

    (format!("http://{}", addr), handle)
}
