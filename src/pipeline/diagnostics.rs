//! Producer diagnostic stream scanning.
//!
//! The producer reports its state as free-form log lines on stderr. This
//! is a best-effort heuristic contract: a line mentioning authentication or
//! a connection means the producer is ready, a line with a login URL means a
//! human has to act.

use std::borrow::Cow;
use std::io::{self, BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead};

use super::readiness::ReadinessGate;

/// Consecutive read errors tolerated before a diagnostic stream is abandoned.
///
/// Readers drain until EOF. Once a reader drops its end, the child's next
/// write to stderr raises SIGPIPE.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 50;

/// Pause after a failed diagnostic read.
const READ_ERROR_PAUSE: Duration = Duration::from_millis(20);

/// What a single diagnostic line signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineScan {
    /// Line reports successful authentication/connection.
    pub ready: bool,
    /// Line carries a login URL the user must open.
    pub login_required: bool,
}

/// Classify one diagnostic line (case-insensitive).
#[must_use]
pub fn scan_line(line: &str) -> LineScan {
    let lower = line.to_lowercase();
    LineScan {
        ready: lower.contains("authenticated") || lower.contains("connected"),
        login_required: lower.contains("login") && lower.contains("http"),
    }
}

/// Spawn a thread that logs every line of `stream` under `tag`.
///
/// When `gate` is given, lines are also scanned: the first readiness line
/// latches it and login prompts are raised as warnings. The thread exits at
/// end of stream.
pub(crate) fn spawn_reader<R>(
    stream: R,
    tag: &'static str,
    gate: Option<ReadinessGate>,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{tag}-stderr"))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut raw = Vec::with_capacity(256);
            let mut errors = 0;
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        errors = 0;
                        let line = decode_line(&raw);
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        log::debug!("[{}] {}", tag, line);
                        if let Some(gate) = &gate {
                            handle_line(line, gate);
                        }
                    }
                    Err(e) => {
                        errors += 1;
                        log::warn!("[{}] Diagnostic stream read error: {}", tag, e);
                        if errors >= MAX_CONSECUTIVE_READ_ERRORS {
                            break;
                        }
                        thread::sleep(READ_ERROR_PAUSE);
                    }
                }
            }
            log::debug!("[{}] Diagnostic stream closed", tag);
        })
}

/// Async counterpart of [`spawn_reader`] for streams that only get logged.
pub(crate) fn spawn_async_reader<R>(stream: R, tag: &'static str) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stream);
        let mut raw = Vec::with_capacity(256);
        let mut errors = 0;
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    errors = 0;
                    let line = decode_line(&raw);
                    let line = line.trim();
                    if !line.is_empty() {
                        log::debug!("[{}] {}", tag, line);
                    }
                }
                Err(e) => {
                    errors += 1;
                    log::warn!("[{}] Diagnostic stream read error: {}", tag, e);
                    if errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        break;
                    }
                    tokio::time::sleep(READ_ERROR_PAUSE).await;
                }
            }
        }
        log::debug!("[{}] Diagnostic stream closed", tag);
    })
}

/// Invalid UTF-8 is replaced, never fatal.
fn decode_line(raw: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(raw)
}

fn handle_line(line: &str, gate: &ReadinessGate) {
    let scan = scan_line(line);
    if scan.ready && gate.latch() {
        log::info!("[Pipeline] Producer authenticated, audio pipeline ready");
    }
    if scan.login_required {
        log::warn!("[Pipeline] ACTION REQUIRED: open the login URL to authorize playback: {}", line);
    }
}
