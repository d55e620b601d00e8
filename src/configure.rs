use crate::config::{DEFAULT_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS, DEFAULT_TOOL, INTERVAL_PRESETS};
use crate::ping::Model;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

pub fn run() -> Result<()> {
    let path = crate::config::config_path();
    let mut root = load_config_value(&path)?;
    let mut dirty = false;

    println!("pingkeeper configure");
    println!("Config path: {}", path.display());
    println!();

    loop {
        println!("Menu:");
        println!("1. Configure assistant command");
        println!("2. Configure model");
        println!("3. Configure schedule (interval, timeout)");
        println!("4. Configure answers file");
        println!("5. Show config path");
        println!("6. Save and exit");
        println!("7. Exit without saving");
        print!("Select an option: ");
        io::stdout().flush().ok();

        let choice = read_line()?.trim().to_string();
        println!();

        match choice.as_str() {
            "1" => {
                dirty |= configure_tool(&mut root)?;
            }
            "2" => {
                dirty |= configure_model(&mut root)?;
            }
            "3" => {
                dirty |= configure_schedule(&mut root)?;
            }
            "4" => {
                dirty |= configure_log(&mut root)?;
            }
            "5" => {
                println!("Config path: {}", path.display());
            }
            "6" => {
                if dirty {
                    save_config_value(&path, &root)?;
                    println!("Saved.");
                } else {
                    println!("No changes to save.");
                }
                break;
            }
            "7" | "q" | "Q" => {
                if dirty {
                    println!("Exited without saving.");
                }
                break;
            }
            _ => {
                println!("Invalid option.");
            }
        }
        println!();
    }

    Ok(())
}

fn configure_tool(root: &mut Value) -> Result<bool> {
    let current_command = get_str_at(root, &["tool", "command"])
        .unwrap_or(DEFAULT_TOOL)
        .to_string();
    let current_args = get_array_at(root, &["tool", "args"]).join(" ");

    let command = prompt_with_current("Assistant command", &current_command)?;
    if command.trim().is_empty() {
        println!("Command must not be empty.");
        return Ok(false);
    }
    let args = prompt_with_current(
        "Extra arguments before -p (space separated, '-' for none)",
        &current_args,
    )?;
    let args: Vec<Value> = if args.trim() == "-" {
        Vec::new()
    } else {
        args.split_whitespace()
            .map(|s| Value::String(s.to_string()))
            .collect()
    };

    set_path(root, &["tool", "command"], Value::String(command.trim().to_string()))?;
    set_path(root, &["tool", "args"], Value::Array(args))?;
    Ok(true)
}

fn configure_model(root: &mut Value) -> Result<bool> {
    let current = get_str_at(root, &["schedule", "model"])
        .unwrap_or(Model::default().as_flag())
        .to_string();
    let raw = prompt_with_current("Model (haiku/sonnet/opus)", &current)?;
    let model: Model = match raw.parse() {
        Ok(model) => model,
        Err(e) => {
            println!("{e}");
            return Ok(false);
        }
    };
    set_path(
        root,
        &["schedule", "model"],
        Value::String(model.as_flag().to_string()),
    )?;
    Ok(true)
}

fn configure_schedule(root: &mut Value) -> Result<bool> {
    let current_interval =
        get_u64_at(root, &["schedule", "intervalSecs"]).unwrap_or(DEFAULT_INTERVAL_SECS);
    let current_timeout =
        get_u64_at(root, &["schedule", "timeoutSecs"]).unwrap_or(DEFAULT_TIMEOUT_SECS);
    let current_fire = get_bool_at(root, &["schedule", "fireOnStart"]).unwrap_or(true);

    let presets: Vec<String> = INTERVAL_PRESETS.iter().map(|s| s.to_string()).collect();
    let interval_raw = prompt_with_current(
        &format!("Interval in seconds (e.g. {})", presets.join(", ")),
        &current_interval.to_string(),
    )?;
    let interval = match interval_raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => secs,
        _ => {
            println!("Interval must be a positive number of seconds.");
            return Ok(false);
        }
    };
    let timeout_raw =
        prompt_with_current("Reply timeout in seconds", &current_timeout.to_string())?;
    let timeout = match timeout_raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => secs,
        _ => {
            println!("Timeout must be a positive number of seconds.");
            return Ok(false);
        }
    };
    let fire_raw = prompt_with_current(
        "Ping immediately on start (true/false)",
        if current_fire { "true" } else { "false" },
    )?;
    let fire = parse_bool_input(&fire_raw).unwrap_or(current_fire);

    set_path(root, &["schedule", "intervalSecs"], Value::from(interval))?;
    set_path(root, &["schedule", "timeoutSecs"], Value::from(timeout))?;
    set_path(root, &["schedule", "fireOnStart"], Value::Bool(fire))?;
    Ok(true)
}

fn configure_log(root: &mut Value) -> Result<bool> {
    let current = get_str_at(root, &["log", "answersPath"])
        .unwrap_or(crate::answer_log::DEFAULT_FILE_NAME)
        .to_string();
    let path = prompt_with_current("Answers file", &current)?;
    if path.trim().is_empty() {
        println!("Path must not be empty.");
        return Ok(false);
    }
    set_path(
        root,
        &["log", "answersPath"],
        Value::String(path.trim().to_string()),
    )?;
    Ok(true)
}

fn load_config_value(path: &PathBuf) -> Result<Value> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&content)
            .map_err(|e| anyhow!("failed to parse config at {}: {e}", path.display()))?;
        if !parsed.is_object() {
            return Err(anyhow!(
                "invalid config at {}: root must be a JSON object",
                path.display()
            ));
        }
        Ok(parsed)
    } else {
        Ok(Value::Object(Map::new()))
    }
}

fn save_config_value(path: &PathBuf, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content)?;
    Ok(())
}

fn prompt_with_current(label: &str, current: &str) -> Result<String> {
    if current.trim().is_empty() {
        print!("{label}: ");
    } else {
        print!("{label} [{current}]: ");
    }
    io::stdout().flush().ok();
    let input = read_line()?.trim().to_string();
    if input.is_empty() && !current.trim().is_empty() {
        Ok(current.to_string())
    } else {
        Ok(input)
    }
}

fn read_line() -> Result<String> {
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    Ok(buf)
}

fn set_path(value: &mut Value, path: &[&str], new_value: Value) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    if !value.is_object() {
        return Err(anyhow!("invalid config: root must be a JSON object"));
    }
    let mut cur = value;
    for (idx, key) in path[..path.len() - 1].iter().enumerate() {
        let obj = cur.as_object_mut().ok_or_else(|| {
            anyhow!("invalid config: '{}' must be an object", path[..idx].join("."))
        })?;
        cur = obj
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !cur.is_object() {
            return Err(anyhow!(
                "invalid config: '{}' must be an object",
                path[..=idx].join(".")
            ));
        }
    }
    let obj = cur.as_object_mut().ok_or_else(|| {
        anyhow!(
            "invalid config: '{}' must be an object",
            path[..path.len() - 1].join(".")
        )
    })?;
    obj.insert(path[path.len() - 1].to_string(), new_value);
    Ok(())
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn get_str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    lookup(value, path)?.as_str()
}

fn get_array_at(value: &Value, path: &[&str]) -> Vec<String> {
    match lookup(value, path).and_then(Value::as_array) {
        Some(arr) => arr
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        None => Vec::new(),
    }
}

fn get_bool_at(value: &Value, path: &[&str]) -> Option<bool> {
    lookup(value, path)?.as_bool()
}

fn get_u64_at(value: &Value, path: &[&str]) -> Option<u64> {
    lookup(value, path)?.as_u64()
}

fn parse_bool_input(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn set_path_creates_nested_objects() {
        let mut root = json!({});
        set_path(&mut root, &["schedule", "intervalSecs"], Value::from(300u64)).unwrap();
        set_path(&mut root, &["schedule", "model"], Value::String("opus".into())).unwrap();
        assert_eq!(
            root,
            json!({ "schedule": { "intervalSecs": 300, "model": "opus" } })
        );
        assert_eq!(get_u64_at(&root, &["schedule", "intervalSecs"]), Some(300));
        assert_eq!(get_str_at(&root, &["schedule", "model"]), Some("opus"));
        assert_eq!(get_bool_at(&root, &["schedule", "fireOnStart"]), None);
    }

    #[test]
    fn set_path_refuses_to_overwrite_scalars() {
        let mut root = json!({ "tool": "claude" });
        let err = set_path(&mut root, &["tool", "command"], Value::String("x".into()))
            .unwrap_err();
        assert!(err.to_string().contains("'tool' must be an object"));
    }

    #[test]
    fn array_lookup_skips_non_strings() {
        let root = json!({ "tool": { "args": ["a", 1, "b"] } });
        assert_eq!(get_array_at(&root, &["tool", "args"]), vec!["a", "b"]);
        assert!(get_array_at(&root, &["tool", "missing"]).is_empty());
    }

    #[test]
    fn bool_input_variants() {
        assert_eq!(parse_bool_input(" Yes "), Some(true));
        assert_eq!(parse_bool_input("0"), Some(false));
        assert_eq!(parse_bool_input("maybe"), None);
    }

    #[test]
    fn saved_values_load_back_as_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut root = load_config_value(&path).unwrap();
        set_path(&mut root, &["schedule", "model"], Value::String("haiku".into())).unwrap();
        set_path(&mut root, &["schedule", "intervalSecs"], Value::from(1800u64)).unwrap();
        set_path(&mut root, &["log", "answersPath"], Value::String("a.txt".into())).unwrap();
        save_config_value(&path, &root).unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.model, Model::Haiku);
        assert_eq!(cfg.interval_secs, 1800);
        assert_eq!(cfg.answers_path, PathBuf::from("a.txt"));
    }

    #[test]
    fn non_object_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "[1, 2]").unwrap();
        assert!(load_config_value(&path).is_err());
    }
}
