use crate::answer_log::DEFAULT_FILE_NAME;
use crate::ping::Model;
use crate::prompts::{DEFAULT_INSTRUCTION, DEFAULT_PROMPTS};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TOOL: &str = "claude";
pub const DEFAULT_INTERVAL_SECS: u64 = 15 * 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_DISPLAY_LINES: usize = 200;

/// Interval presets offered by the controller, in seconds.
pub const INTERVAL_PRESETS: [u64; 4] = [300, 900, 1800, 3600];

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub tool: String,
    pub tool_args: Vec<String>,
    pub model: Model,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub fire_on_start: bool,
    pub answers_path: PathBuf,
    pub display_lines: usize,
    pub prompts: Vec<String>,
    pub instruction: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tool: DEFAULT_TOOL.to_string(),
            tool_args: Vec::new(),
            model: Model::default(),
            interval_secs: DEFAULT_INTERVAL_SECS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            fire_on_start: true,
            answers_path: PathBuf::from(DEFAULT_FILE_NAME),
            display_lines: DEFAULT_DISPLAY_LINES,
            prompts: DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
            instruction: Some(DEFAULT_INSTRUCTION.to_string()),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawConfig {
    tool: RawTool,
    schedule: RawSchedule,
    log: RawLog,
    prompts: RawPrompts,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawTool {
    command: Option<String>,
    args: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawSchedule {
    model: Option<String>,
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
    fire_on_start: Option<bool>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawLog {
    answers_path: Option<String>,
    display_lines: Option<usize>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawPrompts {
    list: Option<Vec<String>>,
    instruction: Option<String>,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PINGKEEPER_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pingkeeper")
        .join("config.json")
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::load_from(&config_path())?;
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads the JSON file at `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw: RawConfig = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config at {}", path.display()))?;
            serde_json::from_str(&content)
                .map_err(|e| anyhow!("failed to parse config at {}: {e}", path.display()))?
        } else {
            RawConfig::default()
        };
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(command) = raw.tool.command {
            cfg.tool = command;
        }
        if let Some(args) = raw.tool.args {
            cfg.tool_args = args;
        }
        if let Some(model) = raw.schedule.model {
            cfg.model = model.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(secs) = raw.schedule.interval_secs {
            cfg.interval_secs = secs;
        }
        if let Some(secs) = raw.schedule.timeout_secs {
            cfg.timeout_secs = secs;
        }
        if let Some(fire) = raw.schedule.fire_on_start {
            cfg.fire_on_start = fire;
        }
        if let Some(path) = raw.log.answers_path {
            cfg.answers_path = PathBuf::from(path);
        }
        if let Some(lines) = raw.log.display_lines {
            cfg.display_lines = lines;
        }
        if let Some(list) = raw.prompts.list {
            cfg.prompts = list;
        }
        if let Some(instruction) = raw.prompts.instruction {
            cfg.instruction = normalize_instruction(instruction);
        }
        Ok(cfg)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(tool) = var("PINGKEEPER_TOOL") {
            self.tool = tool;
        }
        if let Some(model) = var("PINGKEEPER_MODEL") {
            self.model = model.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(secs) = var("PINGKEEPER_INTERVAL_SECS") {
            self.interval_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("invalid PINGKEEPER_INTERVAL_SECS '{secs}'"))?;
        }
        if let Some(secs) = var("PINGKEEPER_TIMEOUT_SECS") {
            self.timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("invalid PINGKEEPER_TIMEOUT_SECS '{secs}'"))?;
        }
        if let Some(path) = var("PINGKEEPER_ANSWERS_PATH") {
            self.answers_path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tool.trim().is_empty() {
            return Err(anyhow!("tool.command must not be empty"));
        }
        if self.interval_secs == 0 {
            return Err(anyhow!("schedule.intervalSecs must be positive"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("schedule.timeoutSecs must be positive"));
        }
        if self.prompts.iter().all(|p| p.trim().is_empty()) {
            return Err(anyhow!("prompts.list must contain at least one prompt"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn normalize_instruction(instruction: String) -> Option<String> {
    let trimmed = instruction.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
