//! Pulling the program out of a markdown answer

const FENCE: &str = "```";

/// The model's answer for one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramResponse {
    /// Full raw model text
    pub text: String,
    /// Program body, or `None` when the answer has no fenced block
    pub program: Option<String>,
}

impl ProgramResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let program = extract_code_block(&text);
        Self { text, program }
    }
}

/// Return the body of the first fenced code block in `text`.
///
/// The body starts after the line holding the opening fence (so a language
/// tag is skipped) and stops at the next fence, or at the end of the text if
/// the block is never closed. `None` means there was no fence at all, which is
/// different from an empty block.
pub fn extract_code_block(text: &str) -> Option<String> {
    let fence = text.find(FENCE)?;
    let start = match text[fence..].find('\n') {
        Some(nl) => fence + nl + 1,
        None => return Some(String::new()),
    };
    let end = text[start..]
        .find(FENCE)
        .map(|i| start + i)
        .unwrap_or(text.len());
    Some(text[start..end].to_string())
}
