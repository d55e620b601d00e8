use crate::ping::{PingOutcome, TIMESTAMP_FORMAT};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use thiserror::Error;

pub const DEFAULT_FILE_NAME: &str = "claude-answers.txt";

/// Read size when walking the log backwards for `tail`.
const TAIL_CHUNK: u64 = 8 * 1024;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\] Q: (.*?) \| A: (.*)$")
        .expect("log line pattern is valid")
});

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One outcome as it appears in the answers file:
/// `[<timestamp>] Q: <question> | A: <answer-or-error-summary>`.
///
/// `\`, `|` and line breaks inside the question or answer are backslash
/// escaped so every line parses back unambiguously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: NaiveDateTime,
    pub question: String,
    pub answer: String,
}

impl LogLine {
    pub fn from_outcome(outcome: &PingOutcome) -> Self {
        Self {
            timestamp: outcome.timestamp,
            question: outcome.question.clone(),
            answer: outcome.answer_or_summary(),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let caps = LINE_RE.captures(line.trim_end_matches(['\r', '\n']))?;
        let timestamp = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            timestamp,
            question: unescape(&caps[2]),
            answer: unescape(&caps[3]),
        })
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Q: {} | A: {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            escape(&self.question),
            escape(&self.answer)
        )
    }
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Append-only answers file plus a bounded in-memory copy for display.
///
/// Only [`AnswerLog::append`] touches the file, and never rewrites it.
#[derive(Clone)]
pub struct AnswerLog {
    path: PathBuf,
    display: Arc<Mutex<VecDeque<String>>>,
    display_capacity: usize,
}

impl AnswerLog {
    pub fn new(path: PathBuf, display_capacity: usize) -> Self {
        Self {
            path,
            display: Arc::new(Mutex::new(VecDeque::new())),
            display_capacity: display_capacity.max(1),
        }
    }

    pub fn log_file_path(&self) -> &Path {
        &self.path
    }

    /// Writes one line and syncs it to disk before returning.
    pub fn append(&self, outcome: &PingOutcome) -> Result<LogLine, LogError> {
        let line = LogLine::from_outcome(outcome);
        let text = line.to_string();
        self.write_line(&text).map_err(|source| LogError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.push_display(text);
        Ok(line)
    }

    fn write_line(&self, text: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // Single write so concurrent appenders never interleave within a line.
        file.write_all(format!("{text}\n").as_bytes())?;
        file.flush()?;
        file.sync_data()
    }

    /// Last `n` lines of the file as written, oldest first.
    pub fn tail_lines(&self, n: usize) -> Result<Vec<String>, LogError> {
        read_tail(&self.path, n, |_| true).map_err(|source| LogError::Read {
            path: self.path.clone(),
            source,
        })
    }

    /// Last `n` entries in the log format, oldest first. Other lines are
    /// skipped and do not count towards `n`.
    pub fn tail(&self, n: usize) -> Result<Vec<LogLine>, LogError> {
        let lines = read_tail(&self.path, n, |line| LogLine::parse(line).is_some()).map_err(|source| {
            LogError::Read {
                path: self.path.clone(),
                source,
            }
        })?;
        Ok(lines.iter().filter_map(|line| LogLine::parse(line)).collect())
    }

    /// Fills the display buffer from the end of the existing file.
    pub fn load_display(&self) -> Result<usize, LogError> {
        let lines = self.tail_lines(self.display_capacity)?;
        let count = lines.len();
        let mut display = self.display.lock().unwrap_or_else(PoisonError::into_inner);
        display.clear();
        display.extend(lines);
        Ok(count)
    }

    pub fn display_lines(&self) -> Vec<String> {
        let display = self.display.lock().unwrap_or_else(PoisonError::into_inner);
        display.iter().cloned().collect()
    }

    /// Empties the in-memory display copy. The file is left untouched.
    pub fn clear_display_buffer(&self) {
        self.display
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push_display(&self, text: String) {
        let mut display = self.display.lock().unwrap_or_else(PoisonError::into_inner);
        display.push_back(text);
        while display.len() > self.display_capacity {
            display.pop_front();
        }
    }
}

/// Reads backwards from the end of the file until `n` non-blank lines
/// accepted by `keep` are collected. Memory stays proportional to those
/// lines plus one partial line, whatever the file size.
fn read_tail(path: &Path, n: usize, keep: impl Fn(&str) -> bool) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut pos = file.metadata()?.len();
    // Bytes whose first line may have started before `pos`.
    let mut pending: Vec<u8> = Vec::new();
    // Newest first.
    let mut found: Vec<String> = Vec::new();
    while pos > 0 && found.len() < n {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&pending);
        pending = chunk;

        let boundary = if pos == 0 {
            Some(0)
        } else {
            pending.iter().position(|&b| b == b'\n').map(|i| i + 1)
        };
        if let Some(start) = boundary {
            let complete = pending.split_off(start);
            let text = String::from_utf8_lossy(&complete);
            for line in text.lines().rev() {
                if found.len() == n {
                    break;
                }
                if !line.trim().is_empty() && keep(line) {
                    found.push(line.to_string());
                }
            }
        }
    }
    found.reverse();
    Ok(found)
}
