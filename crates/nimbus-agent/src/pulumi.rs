//! Provisioning engine backed by the `pulumi` CLI
//!
//! Programs are written as the project's `index.js` and loaded by Pulumi's
//! own nodejs runtime. Engine events are read from the JSON-lines event log
//! `pulumi up --event-log` writes while the update runs.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::engine::{
    EngineError, EngineEvent, EngineResult, OutputMap, OutputValue, Stack, StackHandle,
    StackSpec, StackSummary, Workspace,
};

/// Default CLI binary, resolved through PATH
pub const PULUMI_BIN: &str = "pulumi";

const PROJECT_FILE: &str = "Pulumi.yaml";
const PACKAGE_FILE: &str = "package.json";
const PROGRAM_FILE: &str = "index.js";

/// How often the event log is polled while an update runs
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Placeholder `stack output --json` prints for secrets
const SECRET_PLACEHOLDER: &str = "[secret]";

/// Packages generated programs may require
const PROGRAM_DEPENDENCIES: &[(&str, &str)] = &[
    ("@pulumi/pulumi", "^3.0.0"),
    ("@pulumi/aws", "^6.0.0"),
    ("@pulumi/awsx", "^2.0.0"),
    ("@pulumi/eks", "^2.0.0"),
];

/// Runs one CLI binary inside the project directory
#[derive(Debug, Clone)]
struct CliRunner {
    binary: PathBuf,
    work_dir: PathBuf,
}

impl CliRunner {
    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(&self.work_dir)
            .env("PULUMI_SKIP_UPDATE_CHECK", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary.display(), args.join(" "))
    }

    fn spawn_error(&self, source: std::io::Error) -> EngineError {
        EngineError::Spawn {
            program: self.binary.display().to_string(),
            source,
        }
    }

    /// Run to completion and return stdout.
    async fn run(&self, args: &[&str]) -> EngineResult<String> {
        tracing::debug!("Running {}", self.describe(args));
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(EngineError::Command {
                command: self.describe(args),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// A Pulumi project directory holding one or more stacks
#[derive(Debug, Clone)]
pub struct PulumiWorkspace {
    work_dir: PathBuf,
}

impl PulumiWorkspace {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn runner(&self) -> CliRunner {
        CliRunner {
            binary: PathBuf::from(PULUMI_BIN),
            work_dir: self.work_dir.clone(),
        }
    }

    /// Write the project files the nodejs runtime needs.
    async fn prepare_project(&self, project_name: &str) -> EngineResult<()> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        tokio::fs::write(
            self.work_dir.join(PROJECT_FILE),
            render_project_file(project_name),
        )
        .await?;

        let package = self.work_dir.join(PACKAGE_FILE);
        if !tokio::fs::try_exists(&package).await? {
            tokio::fs::write(&package, render_package_file(project_name)?).await?;
        }

        let program = self.work_dir.join(PROGRAM_FILE);
        if !tokio::fs::try_exists(&program).await? {
            tokio::fs::write(&program, "").await?;
        }

        let modules = self.work_dir.join("node_modules");
        if !tokio::fs::try_exists(&modules).await? {
            tracing::info!("Installing program dependencies in {}", self.work_dir.display());
            let npm = CliRunner {
                binary: PathBuf::from("npm"),
                ..self.runner()
            };
            npm.run(&["install", "--no-audit", "--no-fund"]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Workspace for PulumiWorkspace {
    async fn create_or_select_stack(&self, spec: &StackSpec) -> EngineResult<StackHandle> {
        self.prepare_project(&spec.project_name).await?;

        let runner = self.runner();
        runner
            .run(&["stack", "select", "--create", spec.stack_name.as_str()])
            .await?;

        Ok(Arc::new(PulumiStack {
            name: spec.stack_name.clone(),
            runner,
        }))
    }
}

/// One stack of a [`PulumiWorkspace`]
#[derive(Debug)]
pub struct PulumiStack {
    name: String,
    runner: CliRunner,
}

impl PulumiStack {
    async fn run(&self, args: &[&str]) -> EngineResult<String> {
        let mut full = args.to_vec();
        full.extend(["--stack", self.name.as_str()]);
        self.runner.run(&full).await
    }

    fn event_log_path(&self) -> PathBuf {
        self.runner
            .work_dir
            .join(format!(".nimbus-events-{}.jsonl", self.name))
    }
}

#[async_trait]
impl Stack for PulumiStack {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_program(&self, program: &str) -> EngineResult<()> {
        tokio::fs::write(self.runner.work_dir.join(PROGRAM_FILE), program).await?;
        Ok(())
    }

    async fn set_config(&self, key: &str, value: &str) -> EngineResult<()> {
        self.run(&["config", "set", key, value]).await?;
        Ok(())
    }

    async fn up(&self, events: mpsc::UnboundedSender<EngineEvent>) -> EngineResult<OutputMap> {
        let log_path = self.event_log_path();
        match tokio::fs::remove_file(&log_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let log_arg = log_path.to_string_lossy().into_owned();
        let args = [
            "up",
            "--yes",
            "--skip-preview",
            "--non-interactive",
            "--event-log",
            log_arg.as_str(),
            "--stack",
            self.name.as_str(),
        ];
        tracing::debug!("Running {}", self.runner.describe(&args));

        let mut child = self
            .runner
            .command(&args)
            .spawn()
            .map_err(|e| self.runner.spawn_error(e))?;

        // Both pipes are drained so the child never blocks on a full buffer.
        let stdout = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf).await;
                buf
            })
        });
        let stderr = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut tail = EventLogTail::new(log_path.clone());
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = tokio::time::sleep(EVENT_POLL_INTERVAL) => tail.drain(&events).await,
            }
        };
        tail.drain(&events).await;
        tail.finish(&events);

        if let Some(task) = stdout {
            if let Ok(out) = task.await {
                tracing::debug!("pulumi up output:\n{}", out);
            }
        }
        let stderr = match stderr {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(EngineError::Command {
                command: self.runner.describe(&args),
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        let _ = tokio::fs::remove_file(&log_path).await;
        self.outputs().await
    }

    async fn cancel(&self) -> EngineResult<()> {
        self.run(&["cancel", "--yes"]).await?;
        Ok(())
    }

    async fn outputs(&self) -> EngineResult<OutputMap> {
        let masked = self.run(&["stack", "output", "--json"]).await?;
        let revealed = self
            .run(&["stack", "output", "--json", "--show-secrets"])
            .await?;
        parse_outputs(&masked, &revealed)
    }

    async fn export_stack(&self) -> EngineResult<serde_json::Value> {
        let exported = self.run(&["stack", "export"]).await?;
        Ok(serde_json::from_str(&exported)?)
    }

    async fn destroy(&self) -> EngineResult<()> {
        self.run(&["destroy", "--yes", "--skip-preview", "--non-interactive"])
            .await?;
        Ok(())
    }

    async fn summary(&self) -> EngineResult<StackSummary> {
        let listing = self.runner.run(&["stack", "ls", "--json"]).await?;
        parse_stack_list(&listing, &self.name)
    }
}

/// Follows a JSON-lines file that another process is appending to.
#[derive(Debug)]
struct EventLogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl EventLogTail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// Forward every complete line appended since the last call.
    async fn drain(&mut self, events: &mpsc::UnboundedSender<EngineEvent>) {
        let appended = match self.read_appended().await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::debug!("Failed to read event log {}: {}", self.path.display(), e);
                return;
            }
        };
        self.partial.extend_from_slice(&appended);
        for line in take_complete_lines(&mut self.partial) {
            forward_line(&line, events);
        }
    }

    /// Forward a trailing line the engine did not terminate.
    fn finish(&mut self, events: &mpsc::UnboundedSender<EngineEvent>) {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            forward_line(&String::from_utf8_lossy(&rest), events);
        }
    }

    async fn read_appended(&mut self) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;
        Ok(buf)
    }
}

/// Split off every newline-terminated line, leaving any unterminated tail in
/// `buf`.
fn take_complete_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let Some(last_nl) = buf.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let rest = buf.split_off(last_nl + 1);
    let complete = std::mem::replace(buf, rest);
    complete
        .split(|&b| b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim_end_matches('\r').to_string())
        .filter(|line| !line.trim().is_empty())
        .collect()
}

fn forward_line(line: &str, events: &mpsc::UnboundedSender<EngineEvent>) {
    match EngineEvent::from_json_line(line) {
        Ok(event) => {
            let _ = events.send(event);
        }
        Err(e) => tracing::debug!("Skipping unreadable event log line: {}", e),
    }
}

/// Render `Pulumi.yaml` for a nodejs project whose entry point is
/// `index.js`.
pub fn render_project_file(project_name: &str) -> String {
    format!(
        "name: {}\nruntime: nodejs\nmain: {}\ndescription: Infrastructure managed by nimbus\n",
        project_name, PROGRAM_FILE
    )
}

fn render_package_file(project_name: &str) -> EngineResult<String> {
    let dependencies: serde_json::Map<String, serde_json::Value> = PROGRAM_DEPENDENCIES
        .iter()
        .map(|(name, version)| (name.to_string(), serde_json::Value::from(*version)))
        .collect();
    let package = serde_json::json!({
        "name": project_name,
        "main": PROGRAM_FILE,
        "dependencies": dependencies,
    });
    Ok(serde_json::to_string_pretty(&package)?)
}

/// Combine `stack output --json` with and without `--show-secrets`: values
/// come from the revealed listing, secrecy from the masked one.
pub fn parse_outputs(masked: &str, revealed: &str) -> EngineResult<OutputMap> {
    let masked: serde_json::Map<String, serde_json::Value> = serde_json::from_str(masked)?;
    let revealed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(revealed)?;

    Ok(revealed
        .into_iter()
        .map(|(name, value)| {
            let secret = masked
                .get(&name)
                .and_then(|v| v.as_str())
                .is_some_and(|v| v == SECRET_PLACEHOLDER);
            (name, OutputValue { value, secret })
        })
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackListEntry {
    name: String,
    #[serde(default)]
    url: Option<String>,
}

/// Find `stack` in `stack ls --json` output. Backends may qualify names
/// with an organization and project (`org/project/dev`).
pub fn parse_stack_list(listing: &str, stack: &str) -> EngineResult<StackSummary> {
    let entries: Vec<StackListEntry> = serde_json::from_str(listing)?;
    let entry = entries
        .into_iter()
        .find(|e| e.name == stack || e.name.rsplit('/').next() == Some(stack))
        .ok_or_else(|| EngineError::Other(format!("stack {} not found", stack)))?;

    Ok(StackSummary {
        name: entry.name,
        url: entry.url.filter(|u| !u.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_project_file() {
        let yaml = render_project_file("nimbus");
        assert!(yaml.starts_with("name: nimbus\n"));
        assert!(yaml.contains("runtime: nodejs\n"));
        assert!(yaml.contains("main: index.js\n"));
    }

    #[test]
    fn test_package_file_lists_pulumi_packages() {
        let package: serde_json::Value =
            serde_json::from_str(&render_package_file("nimbus").unwrap()).unwrap();
        assert_eq!(package["name"], "nimbus");
        assert!(package["dependencies"]["@pulumi/aws"].is_string());
        assert!(package["dependencies"]["@pulumi/awsx"].is_string());
    }

    #[test]
    fn test_parse_outputs_marks_secrets() {
        let masked = r#"{"bucketName": "site-123", "dbPassword": "[secret]", "ports": [80, 443]}"#;
        let revealed = r#"{"bucketName": "site-123", "dbPassword": "hunter2", "ports": [80, 443]}"#;

        let outputs = parse_outputs(masked, revealed).unwrap();
        assert_eq!(outputs["bucketName"], OutputValue::plain("site-123"));
        assert_eq!(outputs["dbPassword"].display_value(), "hunter2");
        assert!(outputs["dbPassword"].secret);
        assert_eq!(outputs["ports"].display_value(), "[80,443]");
    }

    #[test]
    fn test_parse_outputs_empty_stack() {
        assert!(parse_outputs("{}", "{}").unwrap().is_empty());
    }

    #[test]
    fn test_parse_stack_list() {
        let listing = r#"[
            {"name": "prod", "current": false, "resourceCount": 40},
            {"name": "acme/nimbus/dev", "current": true, "url": "https://app.pulumi.com/acme/nimbus/dev", "resourceCount": 7}
        ]"#;
        let summary = parse_stack_list(listing, "dev").unwrap();
        assert_eq!(summary.name, "acme/nimbus/dev");
        assert_eq!(
            summary.url.as_deref(),
            Some("https://app.pulumi.com/acme/nimbus/dev")
        );
    }

    #[test]
    fn test_parse_stack_list_missing_stack() {
        assert!(parse_stack_list(r#"[{"name": "prod"}]"#, "dev").is_err());
    }

    #[test]
    fn test_take_complete_lines_keeps_partial_tail() {
        let mut buf = b"{\"a\":1}\r\n\n{\"b\":2}\n{\"c\"".to_vec();
        let lines = take_complete_lines(&mut buf);
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(buf, b"{\"c\"".to_vec());

        let mut none = b"no newline yet".to_vec();
        assert!(take_complete_lines(&mut none).is_empty());
        assert_eq!(none, b"no newline yet".to_vec());
    }

    #[tokio::test]
    async fn test_event_log_tail_follows_appends() {
        let path = std::env::temp_dir().join(format!("nimbus-tail-{}.jsonl", uuid::Uuid::new_v4()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tail = EventLogTail::new(path.clone());

        // Missing file is not an error
        tail.drain(&tx).await;
        assert!(rx.try_recv().is_err());

        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"{\"preludeEvent\":{}}\n{\"cancel").await.unwrap();
        file.flush().await.unwrap();
        tail.drain(&tx).await;
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Prelude);
        assert!(rx.try_recv().is_err());

        file.write_all(b"Event\":{}}\n").await.unwrap();
        file.flush().await.unwrap();
        tail.drain(&tx).await;
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Cancel);

        file.write_all(b"{\"summaryEvent\":{}}").await.unwrap();
        file.flush().await.unwrap();
        tail.drain(&tx).await;
        tail.finish(&tx);
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Summary);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
