//! HTTP Exchange Logger
//!
//! Appends a summary of every upload request to a file when enabled via environment variable.
//! Set `CLOUDSWEEP_HTTP_LOG=1` or `CLOUDSWEEP_HTTP_LOG=true` to enable.
//! Payload bytes are never written, only their length.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use reqwest::header::HeaderMap;
use tracing::warn;

/// Environment variable to control HTTP logging
const ENV_HTTP_LOG: &str = "CLOUDSWEEP_HTTP_LOG";

/// Log file name
pub const LOG_FILE_NAME: &str = "http_requests.log";

/// Maximum response body size to log (4KB)
const MAX_BODY_SIZE: usize = 4096;

/// Sensitive headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "apikey",
    "set-cookie",
    "cookie",
    "x-api-key",
    "proxy-authorization",
];

/// Global mutex for thread-safe log writing
static LOG_MUTEX: Mutex<()> = Mutex::new(());

/// Check if HTTP logging is enabled
pub fn is_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var(ENV_HTTP_LOG)
            .map(|v| parse_flag(&v))
            .unwrap_or(false)
    })
}

/// Parse a boolean-ish environment value
pub fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v == "1" || v == "true" || v == "yes" || v == "on"
}

/// One upload request as seen by the log
pub struct ExchangeLog<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub headers: Vec<(String, String)>,
    pub body_len: u64,
}

/// Outcome of the exchange
pub enum ExchangeResult<'a> {
    Response {
        status: u16,
        headers: &'a HeaderMap,
        body: Option<&'a str>,
    },
    Error(&'a str),
}

/// Collect request headers in log form, masking credentials
pub fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = value.to_str().unwrap_or("<binary>");
            (name.to_string(), mask_sensitive_header(name.as_str(), value))
        })
        .collect()
}

/// Append one exchange to `<log_dir>/http_requests.log`
pub fn log_exchange(
    log_dir: &Path,
    request: &ExchangeLog<'_>,
    result: ExchangeResult<'_>,
    duration_ms: u64,
) {
    if !is_enabled() {
        return;
    }

    let content = format_exchange(request, &result, duration_ms);
    let path = log_dir.join(LOG_FILE_NAME);
    if let Err(e) = write_log(&path, &content) {
        warn!("Failed to write HTTP log: {}", e);
    }
}

/// Render an exchange into its log block
pub fn format_exchange(
    request: &ExchangeLog<'_>,
    result: &ExchangeResult<'_>,
    duration_ms: u64,
) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let separator = "=".repeat(80);

    let mut out = String::new();
    out.push_str(&format!(
        "\n{}\n[{}] {} {}\n{}\n",
        separator, timestamp, request.method, request.url, separator
    ));

    out.push_str("\n--- Request Headers ---\n");
    for (name, value) in &request.headers {
        out.push_str(&format!("{}: {}\n", name, mask_sensitive_header(name, value)));
    }
    out.push_str(&format!("\n--- Request Body ---\n<{} bytes>\n", request.body_len));

    match result {
        ExchangeResult::Response {
            status,
            headers,
            body,
        } => {
            out.push_str(&format!("\n--- Response ({}ms) ---\n", duration_ms));
            out.push_str(&format!("Status: {}\n", status));
            for (name, value) in collect_headers(headers) {
                out.push_str(&format!("{}: {}\n", name, value));
            }
            if let Some(body) = body.filter(|b| !b.is_empty()) {
                out.push_str("\n--- Response Body ---\n");
                out.push_str(&truncate_utf8_safe(body, MAX_BODY_SIZE));
                out.push('\n');
            }
        }
        ExchangeResult::Error(err) => {
            out.push_str(&format!("\n--- Error ({}ms) ---\n", duration_ms));
            out.push_str(err);
            out.push('\n');
        }
    }

    out
}

/// Write log content to file (thread-safe)
fn write_log(path: &PathBuf, content: &str) -> std::io::Result<()> {
    // Acquire lock to prevent interleaved writes from concurrent transfers
    let _guard = LOG_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Check if a header is sensitive and should be masked
pub fn is_sensitive_header(name: &str) -> bool {
    let name_lower = name.to_lowercase();
    SENSITIVE_HEADERS.iter().any(|h| name_lower == *h)
}

fn mask_sensitive_header(name: &str, value: &str) -> String {
    if is_sensitive_header(name) {
        mask_token(value)
    } else {
        value.to_string()
    }
}

/// Mask a credential, keeping four characters at each end of long values
pub fn mask_token(value: &str) -> String {
    let (prefix, token) = match value.strip_prefix("Bearer ") {
        Some(token) => ("Bearer ", token),
        None => ("", value),
    };

    let chars: Vec<char> = token.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}...{}", prefix, head, tail)
    } else {
        format!("{}****", prefix)
    }
}

/// Truncate string at UTF-8 character boundary (safe for multi-byte chars)
pub fn truncate_utf8_safe(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...\n[truncated, total {} bytes]", &s[..end], s.len())
}
