//! Request/response bridge to an out-of-process worker, and a supervisor
//! that runs a batch of trials against it
//!
//! The wire format is one JSON object per line. A request is
//! `{"cmd": ..., "data": ...}`; the worker answers every request exactly
//! once with `{"ok": value}` or `{"error": message}`. Only one request is in
//! flight at a time, which `&mut self` on [`WorkerChannel::request`] enforces.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::error::BridgeError;
use crate::logger::read_jsonl;

#[derive(Debug, Serialize)]
struct Request<'a> {
    cmd: &'a str,
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Response {
    Ok(Value),
    Error(String),
}

/// One worker process, spoken to one request at a time
#[async_trait]
pub trait WorkerChannel: Send {
    /// Send `cmd` and wait for its single response
    async fn request(&mut self, cmd: &str, data: Value) -> Result<Value, BridgeError>;

    /// Terminate the worker; it is not used again
    async fn kill(&mut self);

    async fn reset(&mut self, config_file: &str) -> Result<Value, BridgeError> {
        self.request("reset", json!({ "config_file": config_file })).await
    }

    async fn action(&mut self, action: Value) -> Result<Value, BridgeError> {
        self.request("action", json!({ "action": action })).await
    }

    async fn get_prompt(&mut self, task: &str) -> Result<String, BridgeError> {
        match self.request("get_prompt", json!({ "task": task })).await? {
            Value::String(prompt) => Ok(prompt),
            other => Err(BridgeError::Malformed(format!("expected a prompt string, got {}", other))),
        }
    }

    async fn end(&mut self, answer: &str) -> Result<Value, BridgeError> {
        self.request("end", json!({ "answer": answer })).await
    }

    async fn score(&mut self) -> Result<Value, BridgeError> {
        self.request("score", Value::Null).await
    }

    async fn save_trace(&mut self, path: &str) -> Result<Value, BridgeError> {
        self.request("save_trace", json!({ "path": path })).await
    }

    async fn ping(&mut self) -> Result<Value, BridgeError> {
        self.request("ping", Value::Null).await
    }

    /// Ask the worker to exit, then make sure it has
    async fn stop(&mut self) {
        if let Err(e) = self.request("stop", Value::Null).await {
            debug!(error = %e, "Worker did not acknowledge stop");
        }
        self.kill().await;
    }
}

/// A worker running as a child process, spoken to over its stdin and stdout
pub struct ProcessWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    timeout: Duration,
}

impl ProcessWorker {
    pub fn spawn(command: &mut Command, timeout: Duration) -> Result<Self, BridgeError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BridgeError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::BrokenPipe("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::BrokenPipe("worker stdout unavailable".into()))?;
        info!(pid = ?child.id(), "Spawned worker");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            timeout,
        })
    }

    async fn exchange(&mut self, line: Vec<u8>) -> Result<String, BridgeError> {
        let broken = |e: std::io::Error| BridgeError::BrokenPipe(e.to_string());
        self.stdin.write_all(&line).await.map_err(broken)?;
        self.stdin.flush().await.map_err(broken)?;
        self.stdout
            .next_line()
            .await
            .map_err(broken)?
            .ok_or_else(|| BridgeError::BrokenPipe("worker closed its output".into()))
    }
}

#[async_trait]
impl WorkerChannel for ProcessWorker {
    async fn request(&mut self, cmd: &str, data: Value) -> Result<Value, BridgeError> {
        let mut line = serde_json::to_vec(&Request { cmd, data })
            .map_err(|e| BridgeError::Malformed(e.to_string()))?;
        line.push(b'\n');

        let timeout = self.timeout;
        let reply = tokio::time::timeout(timeout, self.exchange(line))
            .await
            .map_err(|_| BridgeError::Timeout(timeout))??;

        match serde_json::from_str::<Response>(&reply) {
            Ok(Response::Ok(value)) => Ok(value),
            Ok(Response::Error(message)) => Err(BridgeError::Remote(message)),
            Err(e) => Err(BridgeError::Malformed(format!("{}: {}", e, reply))),
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Worker already gone");
        }
    }
}

/// Starts fresh workers
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self) -> Result<Box<dyn WorkerChannel>, BridgeError>;
}

/// Spawns a [`ProcessWorker`] running a fixed command line
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Per-request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl WorkerSpawner for CommandSpawner {
    async fn spawn(&self) -> Result<Box<dyn WorkerChannel>, BridgeError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        Ok(Box::new(ProcessWorker::spawn(&mut command, self.timeout)?))
    }
}

/// One unit of work driven through a worker
#[async_trait]
pub trait Trial: Send + Sync {
    /// Run trial `id` and return the fields of its result row.
    ///
    /// A [`BridgeError`] anywhere in the returned error chain that is fatal
    /// makes the supervisor replace the worker.
    async fn run(&self, id: u64, worker: &mut dyn WorkerChannel) -> anyhow::Result<Map<String, Value>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub respawns: usize,
}

/// Runs trials one after another against a worker, replacing the worker
/// whenever it faults, and records results as JSON lines
pub struct TrialSupervisor<S> {
    spawner: S,
    results_path: PathBuf,
    trial_timeout: Duration,
}

impl<S: WorkerSpawner> TrialSupervisor<S> {
    pub fn new(spawner: S, results_path: impl Into<PathBuf>) -> Self {
        Self {
            spawner,
            results_path: results_path.into(),
            trial_timeout: Duration::from_secs(600),
        }
    }

    pub fn trial_timeout(mut self, timeout: Duration) -> Self {
        self.trial_timeout = timeout;
        self
    }

    /// Ids already present in the results file
    pub async fn completed_ids(&self) -> anyhow::Result<HashSet<u64>> {
        if !tokio::fs::try_exists(&self.results_path).await? {
            return Ok(HashSet::new());
        }
        let rows: Vec<Value> = read_jsonl(&self.results_path).await?;
        Ok(rows.iter().filter_map(|row| row.get("id").and_then(Value::as_u64)).collect())
    }

    pub async fn run<T: Trial + ?Sized>(
        &self,
        ids: impl IntoIterator<Item = u64>,
        trial: &T,
    ) -> anyhow::Result<SupervisorReport> {
        let done = self.completed_ids().await?;
        if let Some(dir) = self.results_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut results = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.results_path)
            .await?;

        let mut report = SupervisorReport::default();
        let mut worker = self.spawner.spawn().await?;

        for id in ids {
            if done.contains(&id) {
                report.skipped += 1;
                continue;
            }

            let outcome = tokio::time::timeout(self.trial_timeout, trial.run(id, worker.as_mut())).await;
            let respawn = match outcome {
                Ok(Ok(record)) => {
                    let mut row = Map::new();
                    row.insert("id".into(), json!(id));
                    row.extend(record);
                    let mut line = serde_json::to_vec(&row)?;
                    line.push(b'\n');
                    results.write_all(&line).await?;
                    results.flush().await?;
                    report.completed += 1;
                    info!(trial = id, "Trial complete");
                    false
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    let fatal = e.chain().any(|cause| {
                        cause
                            .downcast_ref::<BridgeError>()
                            .is_some_and(BridgeError::is_fatal)
                    });
                    error!(trial = id, error = %e, fatal, "Trial failed");
                    fatal
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(trial = id, timeout = ?self.trial_timeout, "Trial timed out");
                    true
                }
            };

            if respawn {
                worker.kill().await;
                worker = self.spawner.spawn().await?;
                report.respawns += 1;
                warn!(trial = id, respawns = report.respawns, "Respawned worker");
            }
        }

        worker.stop().await;
        info!(
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            respawns = report.respawns,
            "Trials finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Answers `score` with a canned result per call; everything else is
    /// echoed back
    struct FakeWorker {
        scores: Arc<Mutex<VecDeque<Result<Value, BridgeError>>>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WorkerChannel for FakeWorker {
        async fn request(&mut self, cmd: &str, data: Value) -> Result<Value, BridgeError> {
            self.log.lock().push(cmd.to_string());
            match cmd {
                "score" => self.scores.lock().pop_front().unwrap_or(Ok(json!(1))),
                _ => Ok(data),
            }
        }

        async fn kill(&mut self) {
            self.log.lock().push("kill".into());
        }
    }

    #[derive(Clone, Default)]
    struct FakeSpawner {
        spawned: Arc<AtomicUsize>,
        scores: Arc<Mutex<VecDeque<Result<Value, BridgeError>>>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WorkerSpawner for FakeSpawner {
        async fn spawn(&self) -> Result<Box<dyn WorkerChannel>, BridgeError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeWorker {
                scores: Arc::clone(&self.scores),
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct ScoreTrial {
        slow: Option<u64>,
    }

    #[async_trait]
    impl Trial for ScoreTrial {
        async fn run(&self, id: u64, worker: &mut dyn WorkerChannel) -> anyhow::Result<Map<String, Value>> {
            if self.slow == Some(id) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            worker.reset(&format!("config/{}.json", id)).await?;
            let score = worker.score().await?;
            let mut row = Map::new();
            row.insert("score".into(), score);
            Ok(row)
        }
    }

    async fn ids_in(path: &std::path::Path) -> Vec<u64> {
        let rows: Vec<Value> = read_jsonl(path).await.unwrap();
        rows.iter().map(|r| r["id"].as_u64().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_malformed_response_respawns_once_and_continues() {
        let tmp = TempDir::new().unwrap();
        let results = tmp.path().join("results.jsonl");
        let spawner = FakeSpawner::default();
        spawner.scores.lock().extend([
            Ok(json!(1)),
            Err(BridgeError::Malformed("could not decode".into())),
            Ok(json!(0)),
        ]);

        let report = TrialSupervisor::new(spawner.clone(), &results)
            .run(1..=3, &ScoreTrial { slow: None })
            .await
            .unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.respawns, 1);
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
        assert_eq!(ids_in(&results).await, vec![1, 3]);
        let log = spawner.log.lock();
        assert_eq!(log.iter().filter(|c| *c == "stop").count(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_skips_without_respawn() {
        let tmp = TempDir::new().unwrap();
        let results = tmp.path().join("results.jsonl");
        let spawner = FakeSpawner::default();
        spawner.scores.lock().push_back(Err(BridgeError::Remote("evaluator crashed".into())));

        let report = TrialSupervisor::new(spawner.clone(), &results)
            .run([7, 8], &ScoreTrial { slow: None })
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.respawns, 0);
        assert_eq!(ids_in(&results).await, vec![8]);
    }

    #[tokio::test]
    async fn test_completed_trials_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let results = tmp.path().join("results.jsonl");
        std::fs::write(&results, "{\"id\": 1, \"score\": 1}\n").unwrap();
        let spawner = FakeSpawner::default();

        let report = TrialSupervisor::new(spawner, &results)
            .run(1..=2, &ScoreTrial { slow: None })
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(ids_in(&results).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_trial_timeout_respawns() {
        let tmp = TempDir::new().unwrap();
        let results = tmp.path().join("results.jsonl");
        let spawner = FakeSpawner::default();

        let report = TrialSupervisor::new(spawner.clone(), &results)
            .trial_timeout(Duration::from_millis(100))
            .run(1..=2, &ScoreTrial { slow: Some(1) })
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.respawns, 1);
        assert_eq!(ids_in(&results).await, vec![2]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_round_trip() {
        let script = r#"while read line; do
            case "$line" in
                *'"ping"'*) echo '{"ok": "pong"}' ;;
                *'"stop"'*) echo '{"ok": null}'; exit 0 ;;
                *) echo '{"error": "Unknown command"}' ;;
            esac
        done"#;
        let spawner = CommandSpawner::new("sh").arg("-c").arg(script);
        let mut worker = spawner.spawn().await.unwrap();

        assert_eq!(worker.ping().await.unwrap(), json!("pong"));
        let err = worker.score().await.unwrap_err();
        assert!(matches!(err, BridgeError::Remote(ref m) if m == "Unknown command"));
        assert!(!err.is_fatal());
        worker.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_faults_are_fatal() {
        let mut silent = CommandSpawner::new("sh")
            .arg("-c")
            .arg("read line; sleep 30")
            .timeout(Duration::from_millis(200))
            .spawn()
            .await
            .unwrap();
        let err = silent.ping().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert!(err.is_fatal());
        silent.kill().await;

        let mut garbled = CommandSpawner::new("sh")
            .arg("-c")
            .arg("read line; echo not-json")
            .spawn()
            .await
            .unwrap();
        assert!(matches!(garbled.ping().await, Err(BridgeError::Malformed(_))));

        let mut gone = CommandSpawner::new("sh").arg("-c").arg("exit 0").spawn().await.unwrap();
        assert!(matches!(gone.ping().await, Err(BridgeError::BrokenPipe(_))));
    }
}
