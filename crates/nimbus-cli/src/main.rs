//! nimbus - conversational cloud infrastructure CLI

mod commands;
mod config;
mod utils;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nimbus_agent::{
    FIX_ERRORS_INSTRUCTION, PulumiWorkspace, Session, SessionEvent, TurnOutcome, TurnResult,
};
use nimbus_ai::{TokenCallback, providers::openai::OpenAIProvider};
use tracing_subscriber::EnvFilter;

use crate::commands::CommandResult;
use crate::utils::ThinkingLine;

/// nimbus - build and deploy cloud infrastructure by describing it
#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model to use (default: gpt-4)
    #[arg(short, long)]
    model: Option<String>,

    /// Sampling temperature (default: 0)
    #[arg(short, long)]
    temperature: Option<f32>,

    /// Stack to deploy to (default: dev)
    #[arg(long)]
    stack: Option<String>,

    /// Pulumi project name (default: nimbus)
    #[arg(long)]
    project: Option<String>,

    /// Region resources are created in (default: us-west-2)
    #[arg(long)]
    region: Option<String>,

    /// Generate programs without deploying them
    #[arg(long)]
    no_deploy: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Run a single instruction and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Ask the model to fix failed deployments up to this many times per instruction
    #[arg(long, default_value_t = 0)]
    max_repairs: usize,

    /// Pulumi project directory
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let filter = if args.verbose {
        EnvFilter::new("nimbus=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    // Initialize config and exit
    if args.init_config {
        let path = config::Config::init().context("failed to create config file")?;
        println!("Config file created at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let cfg = config::Config::load();
    let overrides = config::Overrides {
        model: args.model.clone(),
        temperature: args.temperature,
        stack: args.stack.clone(),
        project: args.project.clone(),
        region: args.region.clone(),
        no_deploy: args.no_deploy,
        work_dir: args.work_dir.clone(),
    };
    let settings = cfg
        .resolve(&overrides, |name| std::env::var(name).ok())
        .context("invalid configuration")?;

    let Some(api_key) = settings.api_key else {
        eprintln!("Error: No API key found");
        eprintln!();
        eprintln!("Set your API key with: export {}=your-key", config::API_KEY_ENV_VAR);
        eprintln!("Or add it to config file: nimbus --init-config");
        std::process::exit(1);
    };
    let provider = Arc::new(OpenAIProvider::new(api_key));

    let mut session = if settings.session.auto_deploy {
        let workspace = PulumiWorkspace::new(&settings.work_dir);
        eprintln!("Preparing stack (this can take a minute)...");
        Session::connect(settings.session, provider, &workspace)
            .await
            .context("failed to prepare the stack")?
    } else {
        Session::new(settings.session, provider)
    };
    session.set_verbose(args.verbose);

    let printer = spawn_event_printer(&session);

    let result = match args.command {
        Some(command) => run_turn(&mut session, &command, args.max_repairs).await,
        None => run_interactive(&mut session, args.max_repairs).await,
    };

    printer.abort();
    result
}

/// Print progress notices and verbose echoes while turns run.
fn spawn_event_printer(session: &Session) -> tokio::task::JoinHandle<()> {
    let mut receiver = session.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(SessionEvent::Progress(notice)) => println!("{}", notice),
                Ok(SessionEvent::Log(message)) => eprintln!("{}", message),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event printer skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn run_interactive(session: &mut Session, max_repairs: usize) -> anyhow::Result<()> {
    println!("Welcome to nimbus.");
    println!();
    if let Ok(stack) = session.stack() {
        match stack.summary().await {
            Ok(summary) => match summary.url {
                Some(url) => println!("Your stack: {}/resources", url),
                None => println!("Your stack: {}", summary.name),
            },
            Err(e) => tracing::warn!("Could not read stack summary: {}", e),
        }
        println!();
    }
    println!("What cloud infrastructure do you want to build today?");

    loop {
        print!("\n> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(result) = commands::execute_command(input, session).await {
            match result {
                Ok(CommandResult::Message(msg)) => println!("{}", msg),
                Ok(CommandResult::Notice(msg)) => eprintln!("{}", msg),
                Ok(CommandResult::OpenUrl(url)) => {
                    if let Err(e) = utils::open_url(&url) {
                        eprintln!("error: failed to open {}: {}", url, e);
                    }
                }
                Ok(CommandResult::Unknown(line)) => {
                    println!("Unknown command: {}", line);
                    println!("Type !help for available commands.");
                }
                Ok(CommandResult::Quit) => {
                    if let Ok(stack) = session.stack() {
                        println!("destroying stack...");
                        stack.destroy().await.context("failed to destroy stack")?;
                    }
                    println!("done. Goodbye!");
                    break;
                }
                Err(e) => eprintln!("error: {}", e),
            }
            continue;
        }

        run_turn(session, input, max_repairs).await?;
    }

    Ok(())
}

/// Run one instruction, then re-issue the repair instruction while the
/// deployment keeps failing, at most `max_repairs` times.
async fn run_turn(session: &mut Session, instruction: &str, max_repairs: usize) -> anyhow::Result<()> {
    let Some(mut result) = interact_with_progress(session, instruction).await else {
        return Ok(());
    };
    print_result(&result);

    let mut repairs = 0;
    while result.failed() && repairs < max_repairs {
        repairs += 1;
        eprintln!("Repairing ({}/{})...", repairs, max_repairs);
        match interact_with_progress(session, FIX_ERRORS_INSTRUCTION).await {
            Some(next) => result = next,
            None => return Ok(()),
        }
        print_result(&result);
    }

    if result.failed() {
        eprintln!("Reply \"{}\" to ask for a repair.", FIX_ERRORS_INSTRUCTION);
    }
    Ok(())
}

/// One turn with the live "Thinking..." line. Model failures are reported
/// and yield `None`.
async fn interact_with_progress(session: &mut Session, instruction: &str) -> Option<TurnResult> {
    let mut line = ThinkingLine::default();
    let mut stdout = io::stdout();
    let mut on_token = |delta: &str| {
        let _ = write!(stdout, "{}", line.push(delta));
        let _ = stdout.flush();
    };
    let callback: TokenCallback<'_> = &mut on_token;

    let result = session.interact(instruction, Some(callback)).await;
    print!("{}", ThinkingLine::CLEAR);
    let _ = io::stdout().flush();

    match result {
        Ok(result) => Some(result),
        Err(e) => {
            eprintln!("error: {}", e);
            None
        }
    }
}

fn print_result(result: &TurnResult) {
    match &result.outcome {
        TurnOutcome::Failed { failure, .. } => {
            if failure.diagnostics.is_empty() {
                eprintln!("error: {}", failure.source);
            }
            for diagnostic in &failure.diagnostics {
                eprintln!("error: {}", diagnostic.to_json());
            }
        }
        TurnOutcome::Deployed { outputs, .. } => print!("{}", utils::format_outputs(outputs)),
        TurnOutcome::Generated { program } => println!("{}", program),
        TurnOutcome::NoProgram => eprintln!("error: {}", result.text),
    }
}
