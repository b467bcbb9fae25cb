//! The instruction → program → deployment loop

use std::sync::Arc;

use nimbus_ai::{CompletionRequest, LlmProvider, ModelConfig, TokenCallback, collect_completion};
use tokio::sync::broadcast;

use crate::{
    classify::Diagnostic,
    conversation::ConversationState,
    engine::{OutputMap, StackHandle, StackSpec, Workspace},
    error::{Error, Result},
    events::{SessionEvent, TurnPhase},
    extract::ProgramResponse,
    orchestrator::{Deployer, DeploymentFailure},
    prompt::{PromptRequest, PromptTarget, clean_title, render_prompt, render_title_prompt},
};

/// Instruction sent to ask the model to repair the last failed deployment
pub const FIX_ERRORS_INSTRUCTION: &str = "Fix the errors";

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Model used for generation and titles
    pub model: ModelConfig,
    /// Language and cloud the program targets
    pub target: PromptTarget,
    /// Stack programs are deployed to
    pub stack: StackSpec,
    /// Deploy every generated program. When off, programs are only generated.
    pub auto_deploy: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            target: PromptTarget::default(),
            stack: StackSpec::default(),
            auto_deploy: true,
        }
    }
}

impl SessionConfig {
    /// Point both the prompt and the stack config at `region`
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        let region = region.into();
        self.target.region = region.clone();
        self.stack.region = region;
        self
    }
}

/// How a turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    /// The answer had no program; state is unchanged
    NoProgram,
    /// A program was produced but not deployed
    Generated { program: String },
    /// The program deployed
    Deployed { program: String, outputs: OutputMap },
    /// The program was attempted and failed
    Failed {
        program: String,
        failure: DeploymentFailure,
    },
}

/// Result of one `interact` call
#[derive(Debug)]
pub struct TurnResult {
    /// Full model answer
    pub text: String,
    pub outcome: TurnOutcome,
}

impl TurnResult {
    pub fn failed(&self) -> bool {
        matches!(self.outcome, TurnOutcome::Failed { .. })
    }

    /// Program produced this turn, if any
    pub fn program(&self) -> Option<&str> {
        match &self.outcome {
            TurnOutcome::NoProgram => None,
            TurnOutcome::Generated { program }
            | TurnOutcome::Deployed { program, .. }
            | TurnOutcome::Failed { program, .. } => Some(program),
        }
    }

    pub fn outputs(&self) -> Option<&OutputMap> {
        match &self.outcome {
            TurnOutcome::Deployed { outputs, .. } => Some(outputs),
            _ => None,
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match &self.outcome {
            TurnOutcome::Failed { failure, .. } => &failure.diagnostics,
            _ => &[],
        }
    }
}

/// One operator conversation bound to a model and, optionally, a stack.
///
/// Turns are strictly sequential: `interact` takes `&mut self`.
pub struct Session {
    config: SessionConfig,
    state: ConversationState,
    provider: Arc<dyn LlmProvider>,
    deployer: Option<Deployer>,
    event_tx: broadcast::Sender<SessionEvent>,
    phase: TurnPhase,
}

impl Session {
    /// Create a session without a stack. Programs are generated but never
    /// deployed until one is attached.
    pub fn new(config: SessionConfig, provider: Arc<dyn LlmProvider>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            state: ConversationState::default(),
            provider,
            deployer: None,
            event_tx,
            phase: TurnPhase::Idle,
        }
    }

    /// Create a session and, when auto-deploy is on, prepare its stack.
    ///
    /// Fails with [`Error::Initialization`] if the stack cannot be selected,
    /// configured or baselined. A session is never handed out half ready.
    pub async fn connect(
        config: SessionConfig,
        provider: Arc<dyn LlmProvider>,
        workspace: &dyn Workspace,
    ) -> Result<Self> {
        let mut session = Self::new(config, provider);
        if session.config.auto_deploy {
            tracing::info!(
                "Preparing stack {} in {}",
                session.config.stack.stack_name,
                session.config.stack.region
            );
            let deployer = Deployer::initialize(
                workspace,
                &session.config.stack,
                session.event_tx.clone(),
                session.state.verbose,
            )
            .await?;
            session.deployer = Some(deployer);
        }
        Ok(session)
    }

    /// Use an already prepared stack for deployments
    pub fn attach_stack(&mut self, stack: StackHandle) {
        self.deployer = Some(Deployer::new(stack, self.event_tx.clone()));
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Current program
    pub fn program(&self) -> &str {
        &self.state.program
    }

    /// Diagnostics of the last failed deployment
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.state.diagnostics
    }

    pub fn verbose(&self) -> bool {
        self.state.verbose
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.state.verbose = verbose;
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// The stack programs are deployed to
    pub fn stack(&self) -> Result<&StackHandle> {
        self.deployer
            .as_ref()
            .map(Deployer::stack)
            .ok_or(Error::NotDeployed)
    }

    /// Run one turn: generate a program for `instruction`, adopt it, and
    /// deploy it when auto-deploy is on.
    ///
    /// `on_token` sees every completion delta as it arrives. Model errors
    /// are returned as `Err` and leave state untouched; deployment failures
    /// are an ordinary [`TurnOutcome::Failed`].
    pub async fn interact(
        &mut self,
        instruction: &str,
        on_token: Option<TokenCallback<'_>>,
    ) -> Result<TurnResult> {
        self.set_phase(TurnPhase::Generating);
        let response = match self.generate(instruction, on_token).await {
            Ok(response) => response,
            Err(e) => {
                self.set_phase(TurnPhase::Idle);
                return Err(e);
            }
        };

        self.set_phase(TurnPhase::Extracting);
        let ProgramResponse { text, program } = response;
        let Some(program) = program else {
            tracing::debug!("Answer had no code block; keeping current program");
            self.set_phase(TurnPhase::Idle);
            return Ok(TurnResult {
                text,
                outcome: TurnOutcome::NoProgram,
            });
        };

        // Adopted before deploying so a failed attempt is what the repair
        // prompt shows.
        self.state.program = program.clone();

        let deployer = match (&self.deployer, self.config.auto_deploy) {
            (Some(deployer), true) => deployer.clone(),
            (None, true) => {
                tracing::debug!("Auto-deploy is on but no stack is attached; not deploying");
                self.set_phase(TurnPhase::Idle);
                return Ok(TurnResult {
                    text,
                    outcome: TurnOutcome::Generated { program },
                });
            }
            (_, false) => {
                self.set_phase(TurnPhase::Idle);
                return Ok(TurnResult {
                    text,
                    outcome: TurnOutcome::Generated { program },
                });
            }
        };

        self.set_phase(TurnPhase::Deploying);
        let outcome = match deployer.synchronize(&program, self.state.verbose).await {
            Ok(outputs) => {
                self.state.diagnostics.clear();
                self.set_phase(TurnPhase::Succeeded);
                TurnOutcome::Deployed { program, outputs }
            }
            Err(failure) => {
                tracing::warn!(
                    "Deployment failed with {} diagnostics: {}",
                    failure.diagnostics.len(),
                    failure.source
                );
                self.state.diagnostics = failure.diagnostics.clone();
                self.set_phase(TurnPhase::Failed);
                TurnOutcome::Failed { program, failure }
            }
        };
        self.set_phase(TurnPhase::Idle);

        Ok(TurnResult { text, outcome })
    }

    /// Ask the model for a short title describing `program`. Does not touch
    /// conversation state.
    pub async fn generate_title(&self, program: &str) -> Result<String> {
        let request = CompletionRequest::user(render_title_prompt(program));
        let answer = self.provider.complete(&self.config.model, &request).await?;
        Ok(clean_title(&answer))
    }

    async fn generate(
        &self,
        instruction: &str,
        mut on_token: Option<TokenCallback<'_>>,
    ) -> Result<ProgramResponse> {
        let request = PromptRequest::for_turn(&self.config.target, &self.state, instruction);
        let prompt = render_prompt(&request);
        self.log(format!("Prompt:\n{}", prompt));

        let tokens = self
            .provider
            .stream(&self.config.model, &CompletionRequest::user(prompt))
            .await?;

        let event_tx = self.event_tx.clone();
        let mut forward = |delta: &str| {
            let _ = event_tx.send(SessionEvent::Token(delta.to_string()));
            if let Some(cb) = on_token.as_deref_mut() {
                cb(delta);
            }
        };
        let callback: TokenCallback<'_> = &mut forward;
        let text = collect_completion(tokens, Some(callback)).await?;

        self.log(format!("Response:\n{}", text));
        Ok(ProgramResponse::from_text(text))
    }

    fn log(&self, message: String) {
        tracing::debug!("{}", message);
        if self.state.verbose {
            let _ = self.event_tx.send(SessionEvent::Log(message));
        }
    }

    fn set_phase(&mut self, phase: TurnPhase) {
        self.phase = phase;
        let _ = self.event_tx.send(SessionEvent::Phase(phase));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::INITIAL_PROGRAM;
    use crate::engine::{
        DiagnosticPayload, EngineError, EngineEvent, EngineResult, OutputValue, Stack,
        StackSummary,
    };
    use async_trait::async_trait;
    use nimbus_ai::{TokenStream, stream::text_stream};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// A mock provider that replays canned answers and records prompts.
    struct MockProvider {
        answers: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockProvider {
        fn new(answers: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn stream(
            &self,
            _model: &ModelConfig,
            request: &CompletionRequest,
        ) -> nimbus_ai::Result<TokenStream> {
            self.prompts.lock().unwrap().push(request.text());
            let answer = {
                let mut answers = self.answers.lock().unwrap();
                if answers.is_empty() {
                    return Err(nimbus_ai::Error::Sse("no more answers".into()));
                }
                answers.remove(0)
            };
            // Split into a few deltas to exercise token forwarding
            let deltas = answer
                .split_inclusive(' ')
                .map(str::to_string)
                .collect::<Vec<_>>();
            Ok(text_stream(deltas))
        }
    }

    /// A stack that fails any program containing "broken".
    struct MockStack {
        deployed: Mutex<Vec<String>>,
        program: Mutex<String>,
    }

    impl MockStack {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                deployed: Mutex::new(Vec::new()),
                program: Mutex::new(String::new()),
            })
        }
    }

    #[async_trait]
    impl Stack for MockStack {
        fn name(&self) -> &str {
            "dev"
        }
        async fn set_program(&self, program: &str) -> EngineResult<()> {
            *self.program.lock().unwrap() = program.to_string();
            Ok(())
        }
        async fn set_config(&self, _key: &str, _value: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn up(&self, events: mpsc::UnboundedSender<EngineEvent>) -> EngineResult<OutputMap> {
            let program = self.program.lock().unwrap().clone();
            self.deployed.lock().unwrap().push(program.clone());
            if program.contains("broken") {
                let _ = events.send(EngineEvent::Diagnostic(DiagnosticPayload {
                    urn: None,
                    message: "BucketAlreadyExists".into(),
                    severity: "error".into(),
                }));
                return Err(EngineError::Other("update failed".into()));
            }
            let mut outputs = OutputMap::new();
            outputs.insert("bucketName".into(), OutputValue::plain("site-1234"));
            Ok(outputs)
        }
        async fn cancel(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn outputs(&self) -> EngineResult<OutputMap> {
            Ok(OutputMap::new())
        }
        async fn export_stack(&self) -> EngineResult<serde_json::Value> {
            Ok(serde_json::json!({"version": 3}))
        }
        async fn destroy(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn summary(&self) -> EngineResult<StackSummary> {
            Ok(StackSummary::default())
        }
    }

    struct MockWorkspace {
        stack: Arc<MockStack>,
        fail: bool,
    }

    #[async_trait]
    impl Workspace for MockWorkspace {
        async fn create_or_select_stack(&self, _spec: &StackSpec) -> EngineResult<StackHandle> {
            if self.fail {
                return Err(EngineError::Other("not logged in".into()));
            }
            Ok(self.stack.clone())
        }
    }

    fn deployed_session(answers: &[&str]) -> (Session, Arc<MockProvider>, Arc<MockStack>) {
        let provider = MockProvider::new(answers);
        let stack = MockStack::new();
        let mut session = Session::new(SessionConfig::default(), provider.clone());
        session.attach_stack(stack.clone());
        (session, provider, stack)
    }

    const GOOD: &str = "A bucket.\n```javascript\nconst b = new aws.s3.Bucket(\"site\");\n```\n";
    const BROKEN: &str = "A bucket.\n```javascript\nbroken();\n```\n";

    #[tokio::test]
    async fn test_no_program_leaves_state_unchanged() {
        let (mut session, _provider, stack) =
            deployed_session(&[BROKEN, "Which region should the VPC live in?"]);

        let result = session.interact("a bucket", None).await.unwrap();
        assert!(result.failed());
        let diagnostics = session.diagnostics().to_vec();
        assert_eq!(diagnostics.len(), 1);

        let result = session.interact("make a vpc", None).await.unwrap();

        assert!(matches!(result.outcome, TurnOutcome::NoProgram));
        assert_eq!(result.text, "Which region should the VPC live in?");
        assert_eq!(session.program(), "broken();\n");
        assert_eq!(session.diagnostics(), diagnostics.as_slice());
        assert_eq!(
            session.diagnostics()[0].to_json(),
            r#"{"severity":"error","message":"BucketAlreadyExists"}"#
        );
        // Only the first turn reached the stack
        assert_eq!(stack.deployed.lock().unwrap().len(), 1);
        assert_eq!(session.phase(), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_auto_deploy_without_stack_only_generates() {
        let provider = MockProvider::new(&[GOOD]);
        let mut session = Session::new(SessionConfig::default(), provider);
        assert!(session.config().auto_deploy);

        let result = session.interact("a website bucket", None).await.unwrap();

        assert!(matches!(result.outcome, TurnOutcome::Generated { .. }));
        assert_eq!(session.program(), "const b = new aws.s3.Bucket(\"site\");\n");
        assert!(matches!(session.stack(), Err(Error::NotDeployed)));
        assert_eq!(session.phase(), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_successful_deploy_adopts_program() {
        let (mut session, _provider, stack) = deployed_session(&[GOOD]);

        let result = session.interact("a website bucket", None).await.unwrap();

        let outputs = result.outputs().unwrap();
        assert_eq!(outputs["bucketName"].display_value(), "site-1234");
        assert_eq!(session.program(), "const b = new aws.s3.Bucket(\"site\");\n");
        assert_eq!(
            *stack.deployed.lock().unwrap(),
            vec!["const b = new aws.s3.Bucket(\"site\");\n".to_string()]
        );
        assert!(session.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deploy_keeps_attempted_program() {
        let (mut session, provider, _stack) = deployed_session(&[BROKEN, GOOD]);

        let result = session.interact("a bucket", None).await.unwrap();
        assert!(result.failed());
        assert_eq!(result.diagnostics().len(), 1);
        assert_eq!(session.program(), "broken();\n");
        assert!(session.state().needs_repair());

        // The repair prompt carries the failed program and its diagnostics
        let result = session.interact(FIX_ERRORS_INSTRUCTION, None).await.unwrap();
        let prompt = provider.last_prompt();
        assert!(prompt.contains("```javascript\nbroken();\n\n```"));
        assert!(prompt.contains(r#"{"severity":"error","message":"BucketAlreadyExists"}"#));
        assert!(prompt.ends_with("Instructions:\nFix the errors\n"));

        // Success clears the diagnostics again
        assert!(!result.failed());
        assert!(session.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn test_model_error_keeps_state() {
        let (mut session, _provider, _stack) = deployed_session(&[]);

        let err = session.interact("anything", None).await.unwrap_err();
        assert!(matches!(err, Error::Ai(_)));
        assert_eq!(session.program(), INITIAL_PROGRAM);
        assert_eq!(session.phase(), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_tokens_reach_callback_in_order() {
        let (mut session, _provider, _stack) = deployed_session(&[GOOD]);

        let mut seen = String::new();
        let mut on_token = |delta: &str| seen.push_str(delta);
        let callback: TokenCallback<'_> = &mut on_token;
        let result = session.interact("bucket", Some(callback)).await.unwrap();

        assert_eq!(seen, GOOD);
        assert_eq!(result.text, GOOD);
    }

    #[tokio::test]
    async fn test_without_auto_deploy_program_is_only_generated() {
        let provider = MockProvider::new(&[GOOD]);
        let stack = MockStack::new();
        let config = SessionConfig {
            auto_deploy: false,
            ..Default::default()
        };
        let workspace = MockWorkspace {
            stack: stack.clone(),
            fail: false,
        };

        let mut session = Session::connect(config, provider, &workspace).await.unwrap();
        assert!(matches!(session.stack(), Err(Error::NotDeployed)));

        let result = session.interact("bucket", None).await.unwrap();
        assert!(matches!(result.outcome, TurnOutcome::Generated { .. }));
        assert_eq!(session.program(), "const b = new aws.s3.Bucket(\"site\");\n");
        assert!(stack.deployed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_deploys_empty_baseline() {
        let stack = MockStack::new();
        let workspace = MockWorkspace {
            stack: stack.clone(),
            fail: false,
        };

        let session = Session::connect(SessionConfig::default(), MockProvider::new(&[]), &workspace)
            .await
            .unwrap();

        assert!(session.stack().is_ok());
        assert_eq!(*stack.deployed.lock().unwrap(), vec![String::new()]);
    }

    #[tokio::test]
    async fn test_connect_failure_is_initialization_error() {
        let workspace = MockWorkspace {
            stack: MockStack::new(),
            fail: true,
        };
        let result =
            Session::connect(SessionConfig::default(), MockProvider::new(&[]), &workspace).await;
        assert!(matches!(result, Err(Error::Initialization(_))));
    }

    #[tokio::test]
    async fn test_generate_title_is_stateless() {
        let (session, _provider, _stack) = deployed_session(&["\"S3 Website Hosting Setup\""]);

        let title = session.generate_title(GOOD).await.unwrap();

        assert_eq!(title, "S3 Website Hosting Setup");
        assert_eq!(session.program(), INITIAL_PROGRAM);
    }

    #[tokio::test]
    async fn test_phases_are_broadcast() {
        let (mut session, _provider, _stack) = deployed_session(&[GOOD]);
        let mut rx = session.subscribe();

        session.interact("bucket", None).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Phase(p) = event {
                phases.push(p);
            }
        }
        assert_eq!(
            phases,
            vec![
                TurnPhase::Generating,
                TurnPhase::Extracting,
                TurnPhase::Deploying,
                TurnPhase::Succeeded,
                TurnPhase::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_verbose_logs_prompt_and_response() {
        let (mut session, _provider, _stack) = deployed_session(&[GOOD]);
        session.set_verbose(true);
        let mut rx = session.subscribe();

        session.interact("bucket", None).await.unwrap();

        let logs: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                SessionEvent::Log(line) => Some(line),
                _ => None,
            })
            .collect();
        assert!(logs[0].starts_with("Prompt:\nYou are nimbus"));
        assert!(logs[1].starts_with("Response:\nA bucket."));
    }

    #[test]
    fn test_region_applies_to_prompt_and_stack() {
        let config = SessionConfig::default().with_region("eu-west-1");
        assert_eq!(config.target.region, "eu-west-1");
        assert_eq!(config.stack.region, "eu-west-1");
    }
}
