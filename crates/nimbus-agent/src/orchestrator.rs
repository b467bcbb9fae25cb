//! Deployment orchestration: one synchronize cycle against the engine

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::{
    classify::{Classification, Diagnostic, classify},
    engine::{EngineError, EngineEvent, OutputMap, StackHandle, StackSpec, Workspace},
    error::{Error, Result},
    events::SessionEvent,
};

/// A failed synchronize: the engine error plus every diagnostic collected
/// before it.
#[derive(Error, Debug)]
#[error("deployment failed: {source}")]
pub struct DeploymentFailure {
    pub diagnostics: Vec<Diagnostic>,
    #[source]
    pub source: EngineError,
}

/// Outputs on success, diagnostics on failure, never both
pub type DeploymentResult = std::result::Result<OutputMap, DeploymentFailure>;

/// Drives synchronize cycles against a single stack
#[derive(Clone)]
pub struct Deployer {
    stack: StackHandle,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Deployer {
    /// Wrap an already prepared stack
    pub fn new(stack: StackHandle, event_tx: broadcast::Sender<SessionEvent>) -> Self {
        Self { stack, event_tx }
    }

    /// Select or create the stack, point it at the target region, clear any
    /// operation left behind by an earlier crashed run, and deploy the empty
    /// program as a clean baseline.
    pub async fn initialize(
        workspace: &dyn Workspace,
        spec: &StackSpec,
        event_tx: broadcast::Sender<SessionEvent>,
        verbose: bool,
    ) -> Result<Self> {
        let stack = workspace
            .create_or_select_stack(spec)
            .await
            .map_err(Error::Initialization)?;
        stack
            .set_config(&spec.region_key, &spec.region)
            .await
            .map_err(Error::Initialization)?;

        // Stale locks must not block startup.
        if let Err(e) = stack.cancel().await {
            tracing::debug!("Ignoring cancel failure on stack {}: {}", stack.name(), e);
        }

        let deployer = Self::new(stack, event_tx);
        if let Err(failure) = deployer.synchronize("", verbose).await {
            for d in &failure.diagnostics {
                tracing::error!("Baseline deployment: {}", d.message);
            }
            return Err(Error::Initialization(failure.source));
        }
        Ok(deployer)
    }

    /// The stack this deployer drives
    pub fn stack(&self) -> &StackHandle {
        &self.stack
    }

    /// Deploy `program` and classify the engine's events as they arrive.
    pub async fn synchronize(&self, program: &str, verbose: bool) -> DeploymentResult {
        if let Err(source) = self.stack.set_program(program).await {
            return Err(DeploymentFailure {
                diagnostics: Vec::new(),
                source,
            });
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut diagnostics = Vec::new();

        let result = {
            let up = self.stack.up(tx);
            tokio::pin!(up);
            loop {
                tokio::select! {
                    biased;
                    Some(event) = rx.recv() => self.handle_event(event, &mut diagnostics, verbose),
                    result = &mut up => break result,
                }
            }
        };

        // Events the engine sent right before finishing.
        while let Ok(event) = rx.try_recv() {
            self.handle_event(event, &mut diagnostics, verbose);
        }

        match result {
            Ok(outputs) => {
                if !diagnostics.is_empty() {
                    tracing::debug!(
                        "Deployment succeeded despite {} error diagnostics",
                        diagnostics.len()
                    );
                }
                Ok(outputs)
            }
            Err(source) => Err(DeploymentFailure {
                diagnostics,
                source,
            }),
        }
    }

    fn handle_event(&self, event: EngineEvent, diagnostics: &mut Vec<Diagnostic>, verbose: bool) {
        match classify(&event) {
            Classification::Diagnostic(d) => {
                tracing::debug!("Diagnostic: {}", d.message);
                let _ = self.event_tx.send(SessionEvent::Diagnostic(d.clone()));
                diagnostics.push(d);
            }
            Classification::Progress(notice) => {
                tracing::info!("{}", notice);
                let _ = self.event_tx.send(SessionEvent::Progress(notice));
            }
            Classification::Ignored => {
                if let (true, EngineEvent::Diagnostic(payload)) = (verbose, &event) {
                    let _ = self.event_tx.send(SessionEvent::Log(format!(
                        "{}: {}",
                        payload.severity,
                        payload.message.trim_end()
                    )));
                }
            }
            Classification::Unrecognized => {
                let raw = match &event {
                    EngineEvent::Unrecognized(raw) => {
                        serde_json::to_string_pretty(raw).unwrap_or_default()
                    }
                    other => format!("{:?}", other),
                };
                tracing::warn!("Unhandled engine event: {}", raw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        DiagnosticPayload, EngineResult, OutputValue, Stack, StackSummary, StepMetadata,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Stack double that replays scripted events and a scripted result.
    struct ScriptedStack {
        events: Vec<EngineEvent>,
        fail_up: bool,
        fail_cancel: bool,
        programs: Mutex<Vec<String>>,
        config: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedStack {
        fn new(events: Vec<EngineEvent>, fail_up: bool) -> Self {
            Self {
                events,
                fail_up,
                fail_cancel: false,
                programs: Mutex::new(Vec::new()),
                config: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Stack for ScriptedStack {
        fn name(&self) -> &str {
            "dev"
        }
        async fn set_program(&self, program: &str) -> EngineResult<()> {
            self.programs.lock().unwrap().push(program.to_string());
            Ok(())
        }
        async fn set_config(&self, key: &str, value: &str) -> EngineResult<()> {
            self.config
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
            Ok(())
        }
        async fn up(&self, events: mpsc::UnboundedSender<EngineEvent>) -> EngineResult<OutputMap> {
            for event in &self.events {
                let _ = events.send(event.clone());
                tokio::task::yield_now().await;
            }
            if self.fail_up {
                return Err(EngineError::Other("update failed".into()));
            }
            let mut outputs = OutputMap::new();
            outputs.insert("vpcId".into(), OutputValue::plain("vpc-0abc"));
            Ok(outputs)
        }
        async fn cancel(&self) -> EngineResult<()> {
            if self.fail_cancel {
                Err(EngineError::Other("no update in progress".into()))
            } else {
                Ok(())
            }
        }
        async fn outputs(&self) -> EngineResult<OutputMap> {
            Ok(OutputMap::new())
        }
        async fn export_stack(&self) -> EngineResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        async fn destroy(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn summary(&self) -> EngineResult<StackSummary> {
            Ok(StackSummary::default())
        }
    }

    struct SingleStackWorkspace(Arc<ScriptedStack>);

    #[async_trait]
    impl Workspace for SingleStackWorkspace {
        async fn create_or_select_stack(&self, _spec: &StackSpec) -> EngineResult<StackHandle> {
            Ok(self.0.clone())
        }
    }

    fn error_event(message: &str) -> EngineEvent {
        EngineEvent::Diagnostic(DiagnosticPayload {
            urn: None,
            message: message.into(),
            severity: "error".into(),
        })
    }

    fn step(op: &str, name: &str) -> StepMetadata {
        StepMetadata {
            op: op.into(),
            urn: format!("urn:pulumi:dev::nimbus::aws:ec2/subnet:Subnet::{}", name),
            resource_type: "aws:ec2/subnet:Subnet".into(),
        }
    }

    fn deployer(stack: ScriptedStack) -> (Deployer, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (Deployer::new(Arc::new(stack), tx), rx)
    }

    #[tokio::test]
    async fn test_success_returns_outputs() {
        let (deployer, _rx) = deployer(ScriptedStack::new(vec![EngineEvent::Prelude], false));
        let outputs = deployer.synchronize("exports.a = 1;", false).await.unwrap();
        assert_eq!(outputs["vpcId"].value, "vpc-0abc");
    }

    #[tokio::test]
    async fn test_program_is_set_before_up() {
        let stack = Arc::new(ScriptedStack::new(vec![], false));
        let (tx, _rx) = broadcast::channel(8);
        let deployer = Deployer::new(stack.clone(), tx);
        deployer.synchronize("exports.b = 2;", false).await.unwrap();
        assert_eq!(*stack.programs.lock().unwrap(), vec!["exports.b = 2;".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_carries_diagnostics_without_wrapper() {
        let events = vec![
            EngineEvent::Prelude,
            error_event("subnet CIDR overlaps"),
            error_event("One or more errors occurred"),
            error_event("subnet CIDR overlaps"),
            error_event("One or more errors occurred: see above"),
            EngineEvent::Summary,
        ];
        let (deployer, _rx) = deployer(ScriptedStack::new(events, true));
        let failure = deployer.synchronize("broken", false).await.unwrap_err();

        let messages: Vec<&str> = failure
            .diagnostics
            .iter()
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(messages, vec!["subnet CIDR overlaps", "subnet CIDR overlaps"]);
        assert!(matches!(failure.source, EngineError::Other(_)));
    }

    #[tokio::test]
    async fn test_progress_notices_are_broadcast() {
        let events = vec![
            EngineEvent::ResourcePre(step("create", "private-1")),
            EngineEvent::ResourcePre(step("same", "private-0")),
            EngineEvent::ResourceOutputs(step("create", "private-1")),
        ];
        let (deployer, mut rx) = deployer(ScriptedStack::new(events, false));
        deployer.synchronize("p", false).await.unwrap();

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Progress(n) = event {
                lines.push(n.to_string());
            }
        }
        assert_eq!(
            lines,
            vec![
                "create aws:ec2/subnet:Subnet private-1 ...".to_string(),
                "created private-1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unrecognized_events_do_not_fail() {
        let events = vec![EngineEvent::Unrecognized(
            serde_json::json!({"stdoutEvent": {"message": "hi"}}),
        )];
        let (deployer, _rx) = deployer(ScriptedStack::new(events, false));
        assert!(deployer.synchronize("p", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_verbose_surfaces_ignored_diagnostics() {
        let events = vec![EngineEvent::Diagnostic(DiagnosticPayload {
            urn: None,
            message: "warning: deprecated\n".into(),
            severity: "warning".into(),
        })];
        let (deployer, mut rx) = deployer(ScriptedStack::new(events, false));
        deployer.synchronize("p", true).await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::Log("warning: warning: deprecated".into())
        );
    }

    #[tokio::test]
    async fn test_initialize_swallows_cancel_errors() {
        let mut stack = ScriptedStack::new(vec![], false);
        stack.fail_cancel = true;
        let stack = Arc::new(stack);
        let workspace = SingleStackWorkspace(stack.clone());
        let (tx, _rx) = broadcast::channel(8);

        let deployer = Deployer::initialize(&workspace, &StackSpec::default(), tx, false)
            .await
            .unwrap();

        assert_eq!(deployer.stack().name(), "dev");
        assert_eq!(
            *stack.config.lock().unwrap(),
            vec![("aws:region".to_string(), "us-west-2".to_string())]
        );
        // Baseline deploy of the empty program
        assert_eq!(*stack.programs.lock().unwrap(), vec![String::new()]);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_baseline_fails() {
        let stack = Arc::new(ScriptedStack::new(vec![error_event("no credentials")], true));
        let workspace = SingleStackWorkspace(stack);
        let (tx, _rx) = broadcast::channel(8);

        let result = Deployer::initialize(&workspace, &StackSpec::default(), tx, false).await;
        assert!(matches!(result, Err(Error::Initialization(_))));
    }
}
