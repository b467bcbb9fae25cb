//! !open command - open a stack output or URL in the browser

use super::CommandResult;
use nimbus_agent::{OutputMap, Session};

pub struct OpenCommand;

impl OpenCommand {
    pub async fn execute(
        arg: Option<&str>,
        session: &Session,
    ) -> nimbus_agent::Result<CommandResult> {
        let Some(target) = arg else {
            return Ok(CommandResult::Notice("Usage: !open <output>".to_string()));
        };

        if is_url(target) {
            return Ok(CommandResult::OpenUrl(target.to_string()));
        }

        let outputs = session.stack()?.outputs().await?;
        Ok(resolve_output(target, &outputs))
    }
}

fn is_url(target: &str) -> bool {
    target.starts_with("http")
}

/// Look up a stack output by name
fn resolve_output(name: &str, outputs: &OutputMap) -> CommandResult {
    match outputs.get(name) {
        Some(output) => CommandResult::OpenUrl(output.display_value()),
        None => CommandResult::Notice(format!("No stack output named '{}'", name)),
    }
}
