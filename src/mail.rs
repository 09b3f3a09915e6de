//! Report delivery by email
//!
//! One multipart message per report carrying every mail-flagged file as an
//! attachment. Nothing is sent when no attachment could be collected.

use chrono::{DateTime, Local};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{Message, SmtpTransport, Transport};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};

const DEFAULT_SERVER: &str = "localhost:25";
const DEFAULT_FROM: &str = "noreply@localhost.localdomain";
const DEFAULT_TO: &str = "to@localhost.localdomain";
const SENDER_NAME: &str = "Mail TS";
const DEFAULT_BODY: &str = "Hi,\r\n\r\nhere is your requested timeseries report!\r\n\r\nBr\r\nMail TS";
const SMTP_PORT: u16 = 25;
const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Email parameters of a report; empty fields fall back to defaults at send
/// time
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EmailSpec {
    pub server: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
    pub path: PathBuf,
    /// File name shown to the recipient
    pub filename: String,
    pub content: Vec<u8>,
}

/// A composed message with defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub server: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MailAttachment>,
}

impl OutgoingMail {
    /// Compose the report message. Unreadable files are logged and skipped;
    /// returns `None` when no attachment remains.
    pub fn compose(spec: &EmailSpec, paths: &[PathBuf], now: DateTime<Local>) -> Option<Self> {
        let attachments: Vec<MailAttachment> =
            paths.iter().filter_map(|path| read_attachment(path)).collect();
        if attachments.is_empty() {
            return None;
        }

        Some(Self {
            server: or_default(&spec.server, DEFAULT_SERVER),
            from: or_default(&spec.from, DEFAULT_FROM),
            to: if spec.to.is_empty() {
                vec![DEFAULT_TO.to_string()]
            } else {
                spec.to.clone()
            },
            cc: spec.cc.clone(),
            subject: if spec.subject.is_empty() {
                format!("{} - {}", SENDER_NAME, now.format("%Y%m%d%H%M%S"))
            } else {
                spec.subject.clone()
            },
            body: or_default(&spec.body, DEFAULT_BODY),
            attachments,
        })
    }

    /// Build the MIME message: text body plus one octet-stream part per file
    pub fn to_message(&self) -> PipelineResult<Message> {
        let mut builder = Message::builder()
            .from(sender(&self.from)?)
            .subject(self.subject.clone());
        for to in &self.to {
            builder = builder.to(mailbox(to)?);
        }
        for cc in &self.cc {
            builder = builder.cc(mailbox(cc)?);
        }

        let octet_stream = ContentType::parse("application/octet-stream")
            .map_err(|e| PipelineError::delivery(format!("content type: {}", e)))?;
        let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(self.body.clone()));
        for attachment in &self.attachments {
            parts = parts.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), octet_stream.clone()),
            );
        }

        builder
            .multipart(parts)
            .map_err(|e| PipelineError::delivery(format!("cannot build message: {}", e)))
    }
}

fn or_default(value: &str, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn read_attachment(path: &Path) -> Option<MailAttachment> {
    match fs::read(path) {
        Ok(content) => Some(MailAttachment {
            path: path.to_path_buf(),
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            content,
        }),
        Err(e) => {
            let err = PipelineError::delivery(format!(
                "skipping attachment {}: {}",
                path.display(),
                e
            ));
            warn!(kind = err.kind(), "{}", err);
            None
        }
    }
}

fn mailbox(address: &str) -> PipelineResult<Mailbox> {
    address
        .trim()
        .parse()
        .map_err(|e| PipelineError::delivery(format!("invalid address '{}': {}", address, e)))
}

/// Sender mailbox; a bare address gets the default display name
fn sender(address: &str) -> PipelineResult<Mailbox> {
    let parsed = mailbox(address)?;
    Ok(match parsed.name {
        Some(_) => parsed,
        None => Mailbox::new(Some(SENDER_NAME.to_string()), parsed.email),
    })
}

/// Split `host[:port]`, defaulting to the SMTP port
fn split_server(server: &str) -> PipelineResult<(String, u16)> {
    match server.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| PipelineError::delivery(format!("invalid SMTP port in '{}'", server)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((server.to_string(), SMTP_PORT)),
    }
}

/// Delivers composed report messages
pub trait Mailer: Send + Sync {
    fn send(&self, mail: &OutgoingMail) -> PipelineResult<()>;
}

/// Plain SMTP relay delivery without authentication
#[derive(Debug, Default)]
pub struct SmtpMailer;

impl Mailer for SmtpMailer {
    fn send(&self, mail: &OutgoingMail) -> PipelineResult<()> {
        let message = mail.to_message()?;
        let (host, port) = split_server(&mail.server)?;

        let transport = SmtpTransport::builder_dangerous(host.as_str())
            .port(port)
            .timeout(Some(SMTP_TIMEOUT))
            .build();
        transport.send(&message).map_err(|e| {
            PipelineError::delivery(format!(
                "cannot send email to {} via {}: {}",
                mail.to.join(","),
                mail.server,
                e
            ))
        })?;

        debug!(server = %mail.server, attachments = mail.attachments.len(), "email sent");
        Ok(())
    }
}
