use crate::answer_log::{AnswerLog, LogLine};
use crate::bus::{BusHandle, MessageBus, SchedulerEvent};
use crate::config::{AppConfig, INTERVAL_PRESETS};
use crate::invoker::{Invoke, Invoker};
use crate::ping::{Model, PingErrorKind, PingOutcome};
use crate::scheduler::types::{Phase, ScheduleConfig, ScheduleSnapshot};
use crate::scheduler::{Scheduler, SchedulerSettings};
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEFAULT_TAIL: usize = 20;

/// Extra time granted to an in-flight ping on shutdown, beyond its own timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Now,
    Interval(Duration),
    Model(Model),
    Timeout(Duration),
    Status,
    Tail(usize),
    Show,
    Clear,
    Path,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let mut parts = input.split_whitespace();
    let Some(word) = parts.next() else {
        return Err("empty command".to_string());
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments for '{word}'"));
    }

    let need = |what: &str| arg.ok_or_else(|| format!("usage: {word} <{what}>"));
    let bare = |command: Command| match arg {
        None => Ok(command),
        Some(extra) => Err(format!("'{word}' takes no argument (got '{extra}')")),
    };
    match word.to_ascii_lowercase().as_str() {
        "start" => bare(Command::Start),
        "stop" => bare(Command::Stop),
        "now" | "ping" => bare(Command::Now),
        "interval" => Ok(Command::Interval(parse_duration(need("secs|Nm|Nh")?)?)),
        "model" => Ok(Command::Model(need("haiku|sonnet|opus")?.parse()?)),
        "timeout" => Ok(Command::Timeout(parse_duration(need("secs|Nm")?)?)),
        "status" => bare(Command::Status),
        "tail" => match arg {
            Some(n) => n
                .parse()
                .map(Command::Tail)
                .map_err(|_| format!("invalid line count '{n}'")),
            None => Ok(Command::Tail(DEFAULT_TAIL)),
        },
        "show" => bare(Command::Show),
        "clear" => bare(Command::Clear),
        "path" => bare(Command::Path),
        "help" | "?" => bare(Command::Help),
        "quit" | "exit" | "q" => bare(Command::Quit),
        other => Err(format!("unknown command '{other}' (try 'help')")),
    }
}

/// Accepts plain seconds or a number suffixed with `s`, `m` or `h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim().to_ascii_lowercase();
    let (digits, unit) = match input.char_indices().last() {
        Some((idx, 's')) => (&input[..idx], 1),
        Some((idx, 'm')) => (&input[..idx], 60),
        Some((idx, 'h')) => (&input[..idx], 3600),
        _ => (input.as_str(), 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;
    let secs = value
        .checked_mul(unit)
        .ok_or_else(|| format!("duration '{input}' is too large"))?;
    if secs == 0 {
        return Err("duration must be positive".to_string());
    }
    Ok(Duration::from_secs(secs))
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn format_countdown(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

pub fn format_status(snap: &ScheduleSnapshot) -> String {
    let mut out = format!(
        "{} | model: {} | every {} | timeout {} | pings: {}",
        snap.phase,
        snap.model,
        format_duration(snap.interval),
        format_duration(snap.timeout),
        snap.pings
    );
    if let Some(next) = snap.next_fire_in {
        out.push_str(&format!(" | next: {}", format_countdown(next)));
    }
    if snap.in_flight {
        out.push_str(" | pinging...");
    }
    out
}

fn print_help() {
    let presets: Vec<String> = INTERVAL_PRESETS
        .iter()
        .map(|s| format_duration(Duration::from_secs(*s)))
        .collect();
    println!("Commands:");
    println!("  start | stop            start or stop the timer");
    println!("  now                     ping immediately");
    println!(
        "  interval <secs|Nm|Nh>   change the interval (presets: {})",
        presets.join(", ")
    );
    println!("  model <haiku|sonnet|opus>");
    println!("  timeout <secs|Nm>       reply timeout for later pings");
    println!("  status                  show scheduler state");
    println!("  tail [n]                last n lines of the answers file");
    println!("  show | clear            show or clear the on-screen log");
    println!("  path                    answers file location");
    println!("  quit");
}

fn render_outcome(outcome: &PingOutcome, logged: Option<&LogLine>) {
    match logged {
        Some(line) => println!("{line}"),
        None => println!("{} (not saved)", LogLine::from_outcome(outcome)),
    }
    if let Some(err) = outcome.error() {
        if err.kind == PingErrorKind::ToolNotFound {
            println!(
                "hint: install the assistant CLI and make sure it is on PATH, \
                 or set tool.command in the config (PINGKEEPER_TOOL)"
            );
        }
    }
}

fn render_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::Outcome { outcome, logged } => render_outcome(outcome, logged.as_ref()),
        SchedulerEvent::LogWriteFailed { error } => eprintln!("warning: {error}"),
    }
}

fn execute<I: Invoke>(scheduler: &Scheduler<I>, command: Command) -> Flow {
    match command {
        Command::Start => {
            let snap = scheduler.snapshot();
            let config = ScheduleConfig {
                interval: snap.interval,
                model: snap.model,
            };
            match scheduler.start(config) {
                Ok(()) => println!("Started (every {}).", format_duration(snap.interval)),
                Err(e) => println!("{e}."),
            }
        }
        Command::Stop => {
            if scheduler.stop() {
                if scheduler.snapshot().phase == Phase::Stopping {
                    println!("Stopping after the current ping.");
                } else {
                    println!("Stopped.");
                }
            } else {
                println!("Not running.");
            }
        }
        Command::Now => match scheduler.trigger_now() {
            Ok(()) => println!("Pinging..."),
            Err(e) => println!("Rejected: {e}."),
        },
        Command::Interval(interval) => match scheduler.set_interval(interval) {
            Ok(()) => println!("Interval set to {}.", format_duration(interval)),
            Err(e) => println!("{e}."),
        },
        Command::Model(model) => {
            scheduler.set_model(model);
            println!("Model set to {model}.");
        }
        Command::Timeout(timeout) => match scheduler.set_timeout(timeout) {
            Ok(()) => println!("Timeout set to {}.", format_duration(timeout)),
            Err(e) => println!("{e}."),
        },
        Command::Status => println!("{}", format_status(&scheduler.snapshot())),
        Command::Tail(n) => match scheduler.log().tail(n) {
            Ok(lines) if lines.is_empty() => println!("No answers yet."),
            Ok(lines) => lines.iter().for_each(|line| println!("{line}")),
            Err(e) => println!("Error: {e}"),
        },
        Command::Show => {
            for line in scheduler.log().display_lines() {
                println!("{line}");
            }
        }
        Command::Clear => {
            scheduler.log().clear_display_buffer();
            println!("Display cleared (answers file untouched).");
        }
        Command::Path => println!("{}", scheduler.log().log_file_path().display()),
        Command::Help => print_help(),
        Command::Quit => return Flow::Quit,
    }
    Flow::Continue
}

/// Interactive controller: reads commands from stdin and prints every
/// outcome the scheduler delivers. Runs until `quit` or Ctrl-C; a closed
/// stdin leaves the scheduler running unattended.
pub async fn run(cfg: AppConfig, paused: bool) -> Result<()> {
    let log = AnswerLog::new(cfg.answers_path.clone(), cfg.display_lines);
    match log.load_display() {
        Ok(count) => info!(count, "loaded previous answers"),
        Err(e) => warn!("could not read previous answers: {}", e),
    }

    let (bus, handle) = MessageBus::new();
    let invoker = Invoker::new(cfg.tool.clone(), cfg.tool_args.clone());
    let settings = SchedulerSettings::from_config(&cfg);
    info!(tool = %invoker.tool(), prompts = settings.prompts.len(), "controller ready");
    let scheduler = Scheduler::new(invoker, log, bus, settings);

    println!("pingkeeper: answers go to {}", cfg.answers_path.display());
    for line in scheduler.log().display_lines() {
        println!("{line}");
    }
    if !paused {
        scheduler.start(ScheduleConfig {
            interval: cfg.interval(),
            model: cfg.model,
        })?;
    }
    println!("{}", format_status(&scheduler.snapshot()));
    println!("Type 'help' for commands.");

    let stdin = BufReader::new(tokio::io::stdin());
    control(&scheduler, &handle, stdin, forward_interrupts()).await
}

/// Turns every Ctrl-C into a message, so the controller can tell the first
/// interrupt from the next one.
fn forward_interrupts() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {}", e);
                break;
            }
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}

async fn control<I, R>(
    scheduler: &Scheduler<I>,
    handle: &BusHandle,
    input: R,
    mut interrupts: mpsc::Receiver<()>,
) -> Result<()>
where
    I: Invoke,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut input_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&line) {
                        Ok(command) => {
                            if execute(scheduler, command) == Flow::Quit {
                                break;
                            }
                        }
                        Err(e) => println!("{e}"),
                    }
                }
                None => {
                    input_open = false;
                    info!("stdin closed, running until interrupted");
                }
            },
            event = handle.next_event() => match event {
                Some(event) => render_event(&event),
                None => break,
            },
            Some(()) = interrupts.recv() => break,
        }
    }

    shutdown(scheduler, handle, &mut interrupts).await;
    Ok(())
}

async fn shutdown<I: Invoke>(
    scheduler: &Scheduler<I>,
    handle: &BusHandle,
    interrupts: &mut mpsc::Receiver<()>,
) {
    scheduler.stop();
    let snap = scheduler.snapshot();
    if snap.in_flight {
        println!("Waiting for the current ping to finish (Ctrl-C again to abandon it)...");
        let limit = snap.timeout + SHUTDOWN_GRACE;
        tokio::select! {
            finished = tokio::time::timeout(limit, scheduler.wait_idle()) => {
                if finished.is_err() {
                    warn!("gave up waiting for the in-flight ping");
                }
            }
            Some(()) = interrupts.recv() => warn!("in-flight ping abandoned"),
        }
    }
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), handle.next_event()).await
    {
        render_event(&event);
    }
    info!("bye");
}

/// One cycle outside the scheduler: invoke, record, print.
pub async fn run_once(cfg: AppConfig) -> Result<()> {
    let log = AnswerLog::new(cfg.answers_path.clone(), cfg.display_lines);
    let invoker = Invoker::new(cfg.tool.clone(), cfg.tool_args.clone());
    let request = SchedulerSettings::from_config(&cfg).build_request();

    let outcome = invoker.invoke(request).await;
    let line = log.append(&outcome)?;
    render_outcome(&outcome, Some(&line));
    if outcome.is_success() {
        return Ok(());
    }
    match outcome.error() {
        Some(err) => Err(anyhow!("ping failed ({}): {}", err.kind, err.detail)),
        None => Err(anyhow!("ping failed")),
    }
}

pub fn print_tail(cfg: &AppConfig, lines: usize) -> Result<()> {
    let log = AnswerLog::new(cfg.answers_path.clone(), lines.max(1));
    let tail = log.tail_lines(lines)?;
    if tail.is_empty() {
        println!("No answers in {}.", log.log_file_path().display());
    }
    for line in tail {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ping::PingRequest;
    use crate::prompts::PromptBook;
    use std::future::Future;
    use tempfile::TempDir;
    use tokio::time::{self, Instant};

    /// Answers at once, or never when `hang` is set.
    struct CannedInvoker {
        hang: bool,
    }

    impl Invoke for CannedInvoker {
        fn invoke(&self, request: PingRequest) -> impl Future<Output = PingOutcome> + Send {
            let hang = self.hang;
            async move {
                if hang {
                    std::future::pending::<()>().await;
                }
                PingOutcome::success(&request, "Blue")
            }
        }
    }

    fn started_scheduler(hang: bool) -> (TempDir, Scheduler<CannedInvoker>, BusHandle) {
        let dir = TempDir::new().unwrap();
        let log = AnswerLog::new(dir.path().join("answers.txt"), 20);
        let (bus, handle) = MessageBus::new();
        let settings = SchedulerSettings {
            model: Model::Haiku,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
            fire_on_start: true,
            prompts: PromptBook::fixed("Name any color"),
            instruction: None,
        };
        let scheduler = Scheduler::new(CannedInvoker { hang }, log, bus, settings);
        scheduler
            .start(ScheduleConfig {
                interval: Duration::from_secs(60),
                model: Model::Haiku,
            })
            .unwrap();
        (dir, scheduler, handle)
    }

    /// Delivers one interrupt after each of `delays`, measured from the previous one.
    fn interrupts_after(delays: Vec<Duration>) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for delay in delays {
                time::sleep(delay).await;
                if tx.send(()).await.is_err() {
                    break;
                }
            }
            // Keep the channel open so a closed sender is not mistaken for Ctrl-C.
            std::future::pending::<()>().await;
        });
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn closed_input_keeps_scheduler_running() {
        let (_dir, scheduler, handle) = started_scheduler(false);
        let interrupts = interrupts_after(vec![Duration::from_secs(150)]);

        let started = Instant::now();
        let input = BufReader::new(tokio::io::empty());
        control(&scheduler, &handle, input, interrupts).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(150));
        let answers = scheduler.log().tail(10).unwrap();
        assert_eq!(answers.len(), 3);
        assert!(answers.iter().all(|line| line.answer == "Blue"));
        assert_eq!(scheduler.snapshot().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_command_stops_the_scheduler() {
        let (_dir, scheduler, handle) = started_scheduler(false);
        let interrupts = interrupts_after(Vec::new());

        let started = Instant::now();
        control(&scheduler, &handle, &b"status\nquit\n"[..], interrupts)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(scheduler.snapshot().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn second_interrupt_abandons_in_flight_ping() {
        let (_dir, scheduler, handle) = started_scheduler(true);
        let interrupts =
            interrupts_after(vec![Duration::from_secs(10), Duration::from_secs(10)]);

        let started = Instant::now();
        let input = BufReader::new(tokio::io::empty());
        control(&scheduler, &handle, input, interrupts).await.unwrap();

        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(20));
        assert!(waited < Duration::from_secs(120));
        let snap = scheduler.snapshot();
        assert!(snap.in_flight);
        assert_eq!(snap.phase, Phase::Stopping);
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command("start"), Ok(Command::Start));
        assert_eq!(parse_command("  STOP "), Ok(Command::Stop));
        assert_eq!(parse_command("now"), Ok(Command::Now));
        assert_eq!(parse_command("q"), Ok(Command::Quit));
        assert_eq!(parse_command("tail"), Ok(Command::Tail(DEFAULT_TAIL)));
        assert_eq!(parse_command("tail 5"), Ok(Command::Tail(5)));
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(
            parse_command("interval 15m"),
            Ok(Command::Interval(Duration::from_secs(900)))
        );
        assert_eq!(parse_command("model Opus"), Ok(Command::Model(Model::Opus)));
        assert_eq!(
            parse_command("timeout 90"),
            Ok(Command::Timeout(Duration::from_secs(90)))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command("").is_err());
        assert!(parse_command("interval").unwrap_err().contains("usage"));
        assert!(parse_command("model gpt").unwrap_err().contains("unknown model"));
        assert!(parse_command("tail x").is_err());
        assert!(parse_command("start now").is_err());
        assert!(parse_command("stop now").unwrap_err().contains("takes no argument"));
        assert!(parse_command("status please").is_err());
        assert!(parse_command("quit 1").is_err());
        assert!(parse_command("dance").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("300"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("45s"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("1H"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("-5").is_err());

        assert_eq!(format_duration(Duration::from_secs(900)), "15m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
    }

    #[test]
    fn status_line() {
        let snap = ScheduleSnapshot {
            phase: Phase::Running,
            model: Model::Sonnet,
            interval: Duration::from_secs(900),
            timeout: Duration::from_secs(120),
            in_flight: true,
            pings: 7,
            next_fire_in: Some(Duration::from_secs(272)),
        };
        assert_eq!(
            format_status(&snap),
            "running | model: sonnet | every 15m | timeout 2m | pings: 7 | next: 04:32 | pinging..."
        );

        let idle = ScheduleSnapshot {
            phase: Phase::Idle,
            in_flight: false,
            next_fire_in: None,
            ..snap
        };
        assert_eq!(
            format_status(&idle),
            "idle | model: sonnet | every 15m | timeout 2m | pings: 7"
        );
    }
}
