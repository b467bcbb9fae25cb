//! Prompt rendering
//!
//! Everything here is pure: the same request always renders the same text.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::conversation::ConversationState;

/// What kind of program to generate and where it will run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTarget {
    /// Language name as shown to the model (e.g. "JavaScript")
    pub lang: String,
    /// Fence tag for the language (e.g. "javascript")
    pub langcode: String,
    /// Cloud provider (e.g. "AWS")
    pub cloud: String,
    /// Region resources are created in
    pub region: String,
}

impl Default for PromptTarget {
    fn default() -> Self {
        Self {
            lang: "JavaScript".to_string(),
            langcode: "javascript".to_string(),
            cloud: "AWS".to_string(),
            region: "us-west-2".to_string(),
        }
    }
}

/// Inputs of one rendered prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub target: PromptTarget,
    /// Current program, verbatim
    pub program: String,
    /// Diagnostics of the previous attempt, one rendered string each
    pub errors: Vec<String>,
    /// Outputs of the previous deployment
    pub outputs: BTreeMap<String, String>,
    pub instructions: String,
}

impl PromptRequest {
    /// Build the request for the next turn from conversation state.
    ///
    /// Outputs of the previous deployment are not passed back to the model yet.
    pub fn for_turn(target: &PromptTarget, state: &ConversationState, instructions: &str) -> Self {
        Self {
            target: target.clone(),
            program: state.program.clone(),
            errors: state.diagnostics.iter().map(|d| d.to_json()).collect(),
            outputs: BTreeMap::new(),
            instructions: instructions.to_string(),
        }
    }
}

/// Render the program-generation prompt.
pub fn render_prompt(req: &PromptRequest) -> String {
    let t = &req.target;
    let mut out = String::new();

    let _ = writeln!(
        out,
        "You are nimbus, an AI agent that builds and deploys Cloud Infrastructure written in Pulumi {}.",
        t.lang
    );
    let _ = writeln!(
        out,
        "Generate a description of the Pulumi program you will define, followed by a single Pulumi {} program in response to each of my Instructions.",
        t.lang
    );
    out.push_str("I will then deploy that program for you and let you know if there were errors.\n");
    out.push_str("You should modify the current program based on my instructions.\n");
    out.push_str("You should not start from scratch unless asked.\n");
    let _ = writeln!(
        out,
        "You are creating infrastructure in the {} `{}` region.",
        t.cloud, t.region
    );
    out.push_str("Always include stack exports in the program.\n");
    out.push_str("Do not use the local filesystem.  Do not use Pulumi config.\n");
    out.push_str("If you can:\n");
    out.push_str("* Use \"@pulumi/awsx\" for ECS, and Fargate and API Gateway\n");
    out.push_str("* Use \"@pulumi/eks\" for EKS.\n");
    out.push_str("* Use aws.lambda.CallbackFunction for lambdas and serverless functions.\n");
    out.push('\n');

    out.push_str("Current Program:\n");
    let _ = writeln!(out, "```{}", t.langcode);
    // Always newline-terminated, even when the program already ends in one
    out.push_str(&req.program);
    out.push_str("\n```\n\n");

    out.push_str("Errors:\n");
    out.push_str(&req.errors.join("\n"));
    out.push_str("\n\n");

    out.push_str("Stack Outputs:\n");
    let outputs: Vec<String> = req
        .outputs
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect();
    out.push_str(&outputs.join("\n"));
    out.push_str("\n\n");

    out.push_str("Instructions:\n");
    out.push_str(&req.instructions);
    out.push('\n');
    out
}

/// Render the one-shot prompt asking for a short program title.
pub fn render_title_prompt(program: &str) -> String {
    format!(
        "Generate a short title (at most 5 words, Title Case, no quotes, no trailing punctuation) \
         describing the cloud infrastructure the following Pulumi program deploys. \
         Respond with the title only.\n\n```\n{}\n```\n",
        program.trim_end()
    )
}

/// Clean up a title answer: first non-empty line, without surrounding quotes
/// or trailing period.
pub fn clean_title(answer: &str) -> String {
    answer
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .trim_start_matches(|c: char| c == '"' || c == '\'' || c == '#' || c.is_whitespace())
        .trim_end_matches(|c: char| c == '"' || c == '\'' || c == '.')
        .trim()
        .to_string()
}
