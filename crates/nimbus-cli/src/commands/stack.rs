//! !stack command - show the resources in the deployed stack

use super::CommandResult;
use nimbus_agent::Session;

pub struct StackCommand;

impl StackCommand {
    pub async fn execute(session: &Session) -> nimbus_agent::Result<CommandResult> {
        let exported = session.stack()?.export_stack().await?;
        Ok(CommandResult::Message(format_resources(&exported)))
    }
}

/// Pretty-print `deployment.resources` of an exported stack
fn format_resources(exported: &serde_json::Value) -> String {
    match exported.pointer("/deployment/resources") {
        Some(resources) => {
            serde_json::to_string_pretty(resources).unwrap_or_else(|_| resources.to_string())
        }
        None => "[]".to_string(),
    }
}
