use crate::ping::{normalize_output, PingErrorKind, PingOutcome, PingRequest};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Per-stream cap on captured tool output; replies are cut far shorter later.
const MAX_CAPTURE_BYTES: u64 = 64 * 1024;

/// Runs one request against the assistant CLI and classifies the result.
///
/// Implementations never fail: every way a cycle can go wrong is encoded in
/// the returned [`PingOutcome`].
pub trait Invoke: Send + Sync + 'static {
    fn invoke(&self, request: PingRequest) -> impl Future<Output = PingOutcome> + Send;
}

#[derive(Clone, Debug)]
pub struct Invoker {
    tool: String,
    tool_args: Vec<String>,
}

impl Invoker {
    pub fn new(tool: impl Into<String>, tool_args: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            tool_args,
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    fn resolve(&self) -> Option<PathBuf> {
        which::which(&self.tool).ok()
    }

    fn command(&self, exe: &Path, request: &PingRequest) -> Command {
        let mut cmd = Command::new(exe);
        cmd.args(&self.tool_args)
            .arg("-p")
            .arg(request.full_prompt())
            .arg("--model")
            .arg(request.model.as_flag())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn not_found(&self, request: &PingRequest) -> PingOutcome {
        PingOutcome::failure(
            request,
            PingErrorKind::ToolNotFound,
            format!("{} not found", self.tool),
        )
    }
}

impl Invoke for Invoker {
    fn invoke(&self, request: PingRequest) -> impl Future<Output = PingOutcome> + Send {
        async move {
            info!(model = %request.model, question = %request.prompt, "asking");

            let Some(exe) = self.resolve() else {
                warn!(tool = %self.tool, "command not found");
                return self.not_found(&request);
            };

            let mut child = match self.command(&exe, &request).spawn() {
                Ok(child) => child,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    warn!(tool = %exe.display(), "command vanished before launch");
                    return self.not_found(&request);
                }
                Err(err) => {
                    warn!(tool = %exe.display(), "failed to launch: {}", err);
                    return PingOutcome::failure(
                        &request,
                        PingErrorKind::ToolNotFound,
                        format!("failed to start {}: {err}", self.tool),
                    );
                }
            };
            let mut group = ProcessGroupGuard::new(child.id());

            let read_stdout = drain(child.stdout.take());
            let read_stderr = drain(child.stderr.take());
            let run = async {
                let (status, out, err) = tokio::join!(child.wait(), read_stdout, read_stderr);
                (status, out, err)
            };

            let outcome = match tokio::time::timeout(request.timeout, run).await {
                Ok((Ok(status), out, err)) => {
                    group.finished();
                    classify(&request, status, &out, &err)
                }
                Ok((Err(err), _, _)) => {
                    warn!("failed waiting for {}: {}", self.tool, err);
                    PingOutcome::failure(&request, PingErrorKind::ExternalToolError, err.to_string())
                }
                Err(_) => {
                    warn!(
                        timeout_secs = request.timeout.as_secs(),
                        "timed out waiting for reply"
                    );
                    group.kill();
                    let _ = child.kill().await;
                    PingOutcome::failure(
                        &request,
                        PingErrorKind::Timeout,
                        format!("no reply within {} seconds", request.timeout.as_secs()),
                    )
                }
            };

            if let Some(answer) = outcome.answer() {
                info!(question = %outcome.question, "reply: {}", answer);
            } else if let Some(err) = outcome.error() {
                warn!(question = %outcome.question, kind = %err.kind, "{}", err.detail);
            }
            outcome
        }
    }
}

fn classify(request: &PingRequest, status: ExitStatus, out: &[u8], err: &[u8]) -> PingOutcome {
    if status.success() {
        return PingOutcome::success(request, normalize_output(out));
    }

    let stderr = normalize_output(err);
    let stdout = normalize_output(out);
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        match status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    };
    debug!(status = %status, "tool exited unsuccessfully");
    PingOutcome::failure(request, PingErrorKind::ExternalToolError, detail)
}

/// Keeps the first [`MAX_CAPTURE_BYTES`] of a stream and discards the rest,
/// still reading to the end so the child never blocks on a full pipe.
async fn drain<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut stream) = stream else {
        return buf;
    };
    let read = async {
        (&mut stream)
            .take(MAX_CAPTURE_BYTES)
            .read_to_end(&mut buf)
            .await?;
        tokio::io::copy(&mut stream, &mut tokio::io::sink()).await
    };
    match read.await {
        Ok(0) => {}
        Ok(skipped) => debug!(skipped, "tool output over capture limit"),
        Err(err) => debug!("failed to read tool output: {}", err),
    }
    buf
}

/// Kills the child's whole process tree when dropped.
///
/// On unix the child leads its own process group, so stray descendants are
/// signalled on every exit path, including when the invoking task itself is
/// cancelled mid-wait.
struct ProcessGroupGuard {
    pid: Option<u32>,
    finished: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            finished: false,
        }
    }

    fn finished(&mut self) {
        self.finished = true;
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        if let Some(pid) = self.pid {
            // SAFETY: killpg only sends a signal. The group id is the pid of a
            // child spawned with `process_group(0)`.
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    #[cfg(windows)]
    fn kill(&mut self) {
        if let Some(pid) = self.pid.take() {
            let _ = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .output();
        }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        // Windows pids are recycled eagerly, so only signal a tree still running.
        if self.finished && cfg!(windows) {
            return;
        }
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ping::Model;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> Invoker {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        Invoker::new("sh", vec![path.display().to_string()])
    }

    fn request(timeout: Duration) -> PingRequest {
        PingRequest {
            model: Model::Haiku,
            prompt: "Name any color".into(),
            instruction: Some("Respond with exactly one word.".into()),
            timeout,
        }
    }

    #[tokio::test]
    async fn successful_reply_is_trimmed() {
        let dir = TempDir::new().unwrap();
        let invoker = script(&dir, "ok.sh", "echo '  Blue'\n");
        let outcome = invoker.invoke(request(Duration::from_secs(10))).await;
        assert_eq!(outcome.answer(), Some("Blue"));
        assert_eq!(outcome.question, "Name any color");
        assert_eq!(outcome.model, Model::Haiku);
    }

    #[tokio::test]
    async fn passes_prompt_and_model_flags() {
        let dir = TempDir::new().unwrap();
        let invoker = script(&dir, "args.sh", "echo \"$1\"; echo \"$2\"; echo \"$3\" \"$4\"\n");
        let outcome = invoker.invoke(request(Duration::from_secs(10))).await;
        assert_eq!(
            outcome.answer(),
            Some("-p Name any color Respond with exactly one word. --model haiku")
        );
    }

    #[tokio::test]
    async fn no_stdin_is_attached() {
        let dir = TempDir::new().unwrap();
        let invoker = script(&dir, "stdin.sh", "cat; echo done\n");
        let outcome = invoker.invoke(request(Duration::from_secs(10))).await;
        assert_eq!(outcome.answer(), Some("done"));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let invoker = script(&dir, "fail.sh", "echo partial; echo 'rate limited' >&2; exit 1\n");
        let outcome = invoker.invoke(request(Duration::from_secs(10))).await;
        let err = outcome.error().unwrap();
        assert_eq!(err.kind, PingErrorKind::ExternalToolError);
        assert_eq!(err.detail, "rate limited");
    }

    #[tokio::test]
    async fn nonzero_exit_falls_back_to_stdout_then_code() {
        let dir = TempDir::new().unwrap();
        let invoker = script(&dir, "stdout.sh", "echo 'login required'; exit 1\n");
        let outcome = invoker.invoke(request(Duration::from_secs(10))).await;
        assert_eq!(outcome.error().unwrap().detail, "login required");

        let invoker = script(&dir, "silent.sh", "exit 3\n");
        let outcome = invoker.invoke(request(Duration::from_secs(10))).await;
        assert_eq!(outcome.error().unwrap().detail, "exit code 3");
        assert_eq!(outcome.answer_or_summary(), "FAIL: exit code 3");
    }

    #[tokio::test]
    async fn capture_is_capped_but_stream_is_consumed() {
        let big = vec![b'x'; MAX_CAPTURE_BYTES as usize * 3];
        let mut reader: &[u8] = &big;
        let captured = drain(Some(&mut reader)).await;
        assert_eq!(captured.len(), MAX_CAPTURE_BYTES as usize);
        assert!(reader.is_empty());
        assert!(drain(None::<&[u8]>).await.is_empty());
    }

    #[tokio::test]
    async fn huge_output_still_yields_bounded_reply() {
        let dir = TempDir::new().unwrap();
        let invoker = script(
            &dir,
            "flood.sh",
            "i=0; while [ $i -lt 4000 ]; do echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx'; i=$((i+1)); done\n",
        );
        let outcome = invoker.invoke(request(Duration::from_secs(30))).await;
        let answer = outcome.answer().unwrap();
        assert!(answer.ends_with("..."));
        assert_eq!(answer.chars().count(), crate::ping::MAX_ANSWER_CHARS + 3);
    }

    #[tokio::test]
    async fn missing_tool_is_reported_without_spawning() {
        let invoker = Invoker::new("pingkeeper-definitely-missing-tool", vec![]);
        let started = Instant::now();
        let outcome = invoker.invoke(request(Duration::from_secs(10))).await;
        let err = outcome.error().unwrap();
        assert_eq!(err.kind, PingErrorKind::ToolNotFound);
        assert_eq!(err.detail, "pingkeeper-definitely-missing-tool not found");
        assert_eq!(err.summary(), "ERROR: pingkeeper-definitely-missing-tool not found");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn timeout_kills_child_and_descendants() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let body = format!(
            "sleep 30 &\necho $! > '{}'\nwait\n",
            pid_file.display()
        );
        let invoker = script(&dir, "hang.sh", &body);

        let started = Instant::now();
        let outcome = invoker.invoke(request(Duration::from_secs(1))).await;
        assert_eq!(outcome.error().unwrap().kind, PingErrorKind::Timeout);
        assert_eq!(outcome.answer_or_summary(), "TIMEOUT");
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if !is_running(pid) {
                break;
            }
            assert!(Instant::now() < deadline, "grandchild {pid} survived timeout");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Zombies count as gone: an orphan waits on whatever reaper the host has.
    fn is_running(pid: libc::pid_t) -> bool {
        // SAFETY: signal 0 only probes for existence.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .and_then(|(_, rest)| rest.chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => true,
        }
    }
}
