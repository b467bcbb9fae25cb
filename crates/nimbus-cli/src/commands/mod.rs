//! Operator commands for interactive mode

mod open;
mod stack;

pub use open::OpenCommand;
pub use stack::StackCommand;

use nimbus_agent::Session;

/// Result of executing an operator command
#[derive(Debug, PartialEq)]
pub enum CommandResult {
    /// Show a message on stdout
    Message(String),
    /// Show a notice on stderr
    Notice(String),
    /// Open a URL in the browser
    OpenUrl(String),
    /// Tear down the stack (if any) and exit
    Quit,
    /// Unknown command, with the full input line
    Unknown(String),
}

/// Parse and execute an operator command. Returns `None` for lines that are
/// not commands.
pub async fn execute_command(
    input: &str,
    session: &mut Session,
) -> Option<nimbus_agent::Result<CommandResult>> {
    let input = input.trim();
    let rest = input.strip_prefix('!')?;

    let mut parts = rest.split_whitespace();
    let command = parts.next().unwrap_or("").to_lowercase();
    let arg = parts.next();

    Some(match command.as_str() {
        "quit" | "exit" => Ok(CommandResult::Quit),

        "program" => Ok(CommandResult::Message(session.program().to_string())),

        "stack" => StackCommand::execute(session).await,

        "verbose" => {
            let on = arg != Some("off");
            session.set_verbose(on);
            Ok(CommandResult::Notice(format!(
                "Verbose mode {}.",
                if on { "on" } else { "off" }
            )))
        }

        "open" => OpenCommand::execute(arg, session).await,

        "help" | "?" => Ok(CommandResult::Message(help_message())),

        _ => Ok(CommandResult::Unknown(input.to_string())),
    })
}

fn help_message() -> String {
    r#"Available commands:
  !program             Show the current program
  !stack               Show the resources in the stack
  !verbose [off]       Echo prompts and model responses (or stop)
  !open <output|url>   Open a stack output or URL in the browser
  !help                Show this help message
  !quit                Destroy the stack and exit

Anything else is sent to the model as an instruction."#
        .to_string()
}
