//! Access logging for upgrade requests

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// One line per inbound upgrade request, written once its outcome is known
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub country: String,
    pub method: String,
    pub path: String,
    pub route: String,
    pub status: u16,
    /// Backend that accepted the handshake, if any
    pub backend: Option<String>,
    pub attempts: usize,
    pub user_agent: String,
    pub duration_ms: u64,
}

impl Default for AccessLogEntry {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            client_ip: "-".to_string(),
            country: "unknown".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            route: "-".to_string(),
            status: 0,
            backend: None,
            attempts: 0,
            user_agent: String::new(),
            duration_ms: 0,
        }
    }
}

/// Log format type
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LogFormat {
    /// Apache Common Log Format with the backend appended
    #[default]
    Common,
    /// Common + country + User-Agent
    Combined,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "combined" => LogFormat::Combined,
            "json" => LogFormat::Json,
            _ => LogFormat::Common,
        })
    }
}

/// Access logger that appends to a file
#[derive(Clone)]
pub struct AccessLogger {
    writer: Arc<Mutex<BufWriter<File>>>,
    format: LogFormat,
}

impl AccessLogger {
    pub fn new<P: AsRef<Path>>(path: P, format: LogFormat) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
            format,
        })
    }

    pub fn log(&self, entry: &AccessLogEntry) {
        let line = match self.format {
            LogFormat::Common => format_common(entry),
            LogFormat::Combined => format_combined(entry),
            LogFormat::Json => format_json(entry),
        };

        let mut writer = self.writer.lock();
        let _ = writeln!(writer, "{}", line);
        let _ = writer.flush();
    }
}

/// 198.51.100.7 - - [10/Oct/2026:13:55:36 +0000] "GET /matchmaker/ HTTP/1.1" 101 yolk.best 1
fn format_common(entry: &AccessLogEntry) -> String {
    let timestamp = entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z");
    format!(
        "{} - - [{}] \"{} {} HTTP/1.1\" {} {} {}",
        entry.client_ip,
        timestamp,
        entry.method,
        entry.path,
        entry.status,
        entry.backend.as_deref().unwrap_or("-"),
        entry.attempts
    )
}

fn format_combined(entry: &AccessLogEntry) -> String {
    format!(
        "{} {} \"{}\" {}ms",
        format_common(entry),
        entry.country,
        entry.user_agent.replace('"', "'"),
        entry.duration_ms
    )
}

fn format_json(entry: &AccessLogEntry) -> String {
    serde_json::json!({
        "timestamp": entry.timestamp.to_rfc3339(),
        "client_ip": entry.client_ip,
        "country": entry.country,
        "method": entry.method,
        "path": entry.path,
        "route": entry.route,
        "status": entry.status,
        "backend": entry.backend,
        "attempts": entry.attempts,
        "user_agent": entry.user_agent,
        "duration_ms": entry.duration_ms,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    fn make_test_entry() -> AccessLogEntry {
        AccessLogEntry {
            client_ip: "198.51.100.7".to_string(),
            country: "NL".to_string(),
            path: "/matchmaker/".to_string(),
            route: "matchmaker".to_string(),
            status: 101,
            backend: Some("yolk.best".to_string()),
            attempts: 3,
            user_agent: "Mozilla/5.0 \"quoted\"".to_string(),
            duration_ms: 42,
            ..Default::default()
        }
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("common".parse::<LogFormat>().unwrap(), LogFormat::Common);
        assert_eq!("combined".parse::<LogFormat>().unwrap(), LogFormat::Combined);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("unknown".parse::<LogFormat>().unwrap(), LogFormat::Common);
    }

    #[test]
    fn test_format_common() {
        let line = format_common(&make_test_entry());
        assert!(line.starts_with("198.51.100.7 - - ["));
        assert!(line.ends_with("\"GET /matchmaker/ HTTP/1.1\" 101 yolk.best 3"));

        let failed = AccessLogEntry {
            status: 503,
            backend: None,
            ..make_test_entry()
        };
        assert!(format_common(&failed).ends_with("503 - 3"));
    }

    #[test]
    fn test_format_combined() {
        let line = format_combined(&make_test_entry());
        assert!(line.contains(" NL \"Mozilla/5.0 'quoted'\" 42ms"));
    }

    #[test]
    fn test_format_json() {
        let line = format_json(&make_test_entry());
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], 101);
        assert_eq!(value["backend"], "yolk.best");
        assert_eq!(value["route"], "matchmaker");
        assert_eq!(value["user_agent"], "Mozilla/5.0 \"quoted\"");

        let failed = AccessLogEntry {
            backend: None,
            ..make_test_entry()
        };
        let value: serde_json::Value = serde_json::from_str(&format_json(&failed)).unwrap();
        assert!(value["backend"].is_null());
    }

    #[test]
    fn test_logger_write() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_owned();

        {
            let logger = AccessLogger::new(&path, LogFormat::Common).unwrap();
            logger.log(&make_test_entry());
            logger.log(&make_test_entry());
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("GET /matchmaker/"));
    }
}
