use chrono::{Local, NaiveDateTime, Timelike};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Answers and error details longer than this are cut and marked with `...`.
pub const MAX_ANSWER_CHARS: usize = 500;
const TRUNCATION_MARKER: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Model {
    Haiku,
    #[default]
    Sonnet,
    Opus,
}

impl Model {
    /// Value passed to the tool's `--model` flag.
    pub fn as_flag(self) -> &'static str {
        match self {
            Model::Haiku => "haiku",
            Model::Sonnet => "sonnet",
            Model::Opus => "opus",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "haiku" => Ok(Model::Haiku),
            "sonnet" => Ok(Model::Sonnet),
            "opus" => Ok(Model::Opus),
            other => Err(format!(
                "unknown model '{other}' (expected haiku, sonnet or opus)"
            )),
        }
    }
}

/// One request to the external tool, frozen at fire time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRequest {
    pub model: Model,
    /// The question as logged.
    pub prompt: String,
    /// Appended to `prompt` in the text actually sent to the tool.
    pub instruction: Option<String>,
    pub timeout: Duration,
}

impl PingRequest {
    pub fn full_prompt(&self) -> String {
        match self.instruction.as_deref().map(str::trim) {
            Some(instruction) if !instruction.is_empty() => {
                format!("{} {}", self.prompt.trim(), instruction)
            }
            _ => self.prompt.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingErrorKind {
    ToolNotFound,
    Timeout,
    ExternalToolError,
}

impl fmt::Display for PingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PingErrorKind::ToolNotFound => "tool not found",
            PingErrorKind::Timeout => "timeout",
            PingErrorKind::ExternalToolError => "external tool error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingError {
    pub kind: PingErrorKind,
    pub detail: String,
}

impl PingError {
    pub fn new(kind: PingErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Text written into the `A:` field of the log for a failed cycle.
    pub fn summary(&self) -> String {
        match self.kind {
            PingErrorKind::Timeout => "TIMEOUT".to_string(),
            PingErrorKind::ToolNotFound => format!("ERROR: {}", self.detail),
            PingErrorKind::ExternalToolError => format!("FAIL: {}", self.detail),
        }
    }
}

/// Terminal result of one cycle. Either an answer or an error, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingOutcome {
    pub timestamp: NaiveDateTime,
    pub model: Model,
    pub question: String,
    pub result: Result<String, PingError>,
}

impl PingOutcome {
    pub fn success(request: &PingRequest, answer: impl Into<String>) -> Self {
        Self::captured(request, Ok(answer.into()))
    }

    pub fn failure(request: &PingRequest, kind: PingErrorKind, detail: impl Into<String>) -> Self {
        Self::captured(request, Err(PingError::new(kind, detail)))
    }

    fn captured(request: &PingRequest, result: Result<String, PingError>) -> Self {
        Self {
            timestamp: now_seconds(),
            model: request.model,
            question: request.prompt.clone(),
            result,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn answer(&self) -> Option<&str> {
        self.result.as_ref().ok().map(String::as_str)
    }

    pub fn error(&self) -> Option<&PingError> {
        self.result.as_ref().err()
    }

    /// The `A:` field: the answer, or the error summary.
    pub fn answer_or_summary(&self) -> String {
        match &self.result {
            Ok(answer) => answer.clone(),
            Err(err) => err.summary(),
        }
    }
}

/// Local wall-clock time with sub-second precision dropped, so it survives
/// a trip through the log format unchanged.
pub fn now_seconds() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Cleans raw tool output into a single bounded log-safe line.
///
/// ANSI escapes are stripped, every whitespace run containing a line break
/// becomes one space, and the result is capped at [`MAX_ANSWER_CHARS`].
pub fn normalize_output(raw: &[u8]) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    let text = String::from_utf8_lossy(&stripped);
    truncate_chars(&collapse_line_breaks(text.trim()), MAX_ANSWER_CHARS)
}

fn collapse_line_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending = String::new();
    let mut broke = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            pending.push(ch);
            broke |= ch == '\n' || ch == '\r';
        } else {
            if broke {
                out.push(' ');
            } else {
                out.push_str(&pending);
            }
            pending.clear();
            broke = false;
            out.push(ch);
        }
    }
    out
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PingRequest {
        PingRequest {
            model: Model::Haiku,
            prompt: "Name any color".into(),
            instruction: Some("Respond with exactly one word.".into()),
            timeout: Duration::from_secs(120),
        }
    }

    #[test]
    fn model_parses_case_insensitively() {
        assert_eq!("Opus".parse::<Model>().unwrap(), Model::Opus);
        assert_eq!(" haiku ".parse::<Model>().unwrap(), Model::Haiku);
        assert!("gpt".parse::<Model>().is_err());
        assert_eq!(Model::Sonnet.as_flag(), "sonnet");
    }

    #[test]
    fn full_prompt_appends_instruction() {
        let req = request();
        assert_eq!(
            req.full_prompt(),
            "Name any color Respond with exactly one word."
        );
        let bare = PingRequest {
            instruction: None,
            ..request()
        };
        assert_eq!(bare.full_prompt(), "Name any color");
    }

    #[test]
    fn outcome_holds_exactly_one_of_answer_or_error() {
        let ok = PingOutcome::success(&request(), "Blue");
        assert_eq!(ok.answer(), Some("Blue"));
        assert!(ok.error().is_none());
        assert_eq!(ok.question, "Name any color");
        assert_eq!(ok.timestamp.nanosecond(), 0);

        let failed = PingOutcome::failure(&request(), PingErrorKind::Timeout, "120s");
        assert!(failed.answer().is_none());
        assert_eq!(failed.error().unwrap().kind, PingErrorKind::Timeout);
        assert_eq!(failed.answer_or_summary(), "TIMEOUT");
    }

    #[test]
    fn error_summaries() {
        let missing = PingError::new(PingErrorKind::ToolNotFound, "claude not found");
        assert_eq!(missing.summary(), "ERROR: claude not found");
        let failed = PingError::new(PingErrorKind::ExternalToolError, "exit code 2");
        assert_eq!(failed.summary(), "FAIL: exit code 2");
        assert_ne!(missing.summary(), failed.summary());
    }

    #[test]
    fn normalize_collapses_line_breaks_and_strips_ansi() {
        assert_eq!(normalize_output(b"  Blue\n"), "Blue");
        assert_eq!(normalize_output(b"one\n\n  two\r\nthree"), "one two three");
        assert_eq!(normalize_output(b"keep  inner  spaces"), "keep  inner  spaces");
        assert_eq!(normalize_output(b"\x1b[32mGreen\x1b[0m"), "Green");
    }

    #[test]
    fn normalize_caps_length() {
        let long = "x".repeat(MAX_ANSWER_CHARS + 50);
        let out = normalize_output(long.as_bytes());
        assert_eq!(out.chars().count(), MAX_ANSWER_CHARS + 3);
        assert!(out.ends_with("..."));

        let exact = "y".repeat(MAX_ANSWER_CHARS);
        assert_eq!(normalize_output(exact.as_bytes()), exact);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé...");
        assert_eq!(truncate_chars("héllo", 5), "héllo");
    }
}
