//! Shared utilities

use nimbus_agent::OutputMap;

/// Characters of streamed text kept on the progress line
const THINKING_TAIL: usize = 60;

const THINKING_DOTS: [&str; 4] = [".  ", ".. ", "...", "   "];

/// Single-line "Thinking..." indicator that shows the tail of the streamed
/// answer, redrawn in place with `\r`.
#[derive(Debug, Default)]
pub struct ThinkingLine {
    tail: String,
    ticks: usize,
}

impl ThinkingLine {
    /// Erases the line
    pub const CLEAR: &'static str = "\r\x1b[2K\r";

    /// Add a delta and render the updated line.
    pub fn push(&mut self, delta: &str) -> String {
        let flat: String = delta
            .chars()
            .map(|c| if matches!(c, '\n' | '\t' | '\r') { ' ' } else { c })
            .collect();
        self.tail.push_str(&flat);
        self.tail = last_chars(&self.tail, THINKING_TAIL).to_string();

        let dots = THINKING_DOTS[(self.ticks / 3) % THINKING_DOTS.len()];
        self.ticks += 1;
        format!("\rThinking{}  {}", dots, self.tail)
    }
}

/// The last `n` characters of `s`, on char boundaries
pub fn last_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Render stack outputs the way the REPL prints them. Empty when there are
/// none.
pub fn format_outputs(outputs: &OutputMap) -> String {
    if outputs.is_empty() {
        return String::new();
    }
    let mut text = String::from("Stack Outputs:\n");
    for (name, output) in outputs {
        text.push_str(&format!("  {}: {}\n", name, output.display_value()));
    }
    text
}

/// Open a URL in the system browser
pub fn open_url(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    std::process::Command::new("open").arg(url).spawn()?;
    #[cfg(target_os = "linux")]
    std::process::Command::new("xdg-open").arg(url).spawn()?;
    #[cfg(target_os = "windows")]
    std::process::Command::new("cmd")
        .args(["/C", "start", url])
        .spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_agent::OutputValue;

    #[test]
    fn test_thinking_line_flattens_whitespace() {
        let mut line = ThinkingLine::default();
        assert_eq!(line.push("Here\nis\ta\rVPC"), "\rThinking.    Here is a VPC");
    }

    #[test]
    fn test_thinking_line_keeps_last_sixty_chars() {
        let mut line = ThinkingLine::default();
        let rendered = line.push(&"x".repeat(100));
        assert_eq!(rendered, format!("\rThinking.    {}", "x".repeat(60)));
    }

    #[test]
    fn test_thinking_dots_advance_every_three_deltas() {
        let mut line = ThinkingLine::default();
        let dots: Vec<String> = (0..13)
            .map(|_| line.push("a")[9..12].to_string())
            .collect();
        assert_eq!(
            dots,
            vec![
                ".  ", ".  ", ".  ", ".. ", ".. ", ".. ", "...", "...", "...", "   ", "   ",
                "   ", ".  "
            ]
        );
    }

    #[test]
    fn test_last_chars_multibyte() {
        assert_eq!(last_chars("héllo wörld", 5), "wörld");
        assert_eq!(last_chars("abc", 10), "abc");
    }

    #[test]
    fn test_format_outputs() {
        let mut outputs = OutputMap::new();
        outputs.insert("vpcId".into(), OutputValue::plain("vpc-0abc"));
        outputs.insert("subnetIds".into(), OutputValue::plain(serde_json::json!(["subnet-1"])));

        assert_eq!(
            format_outputs(&outputs),
            "Stack Outputs:\n  subnetIds: [\"subnet-1\"]\n  vpcId: vpc-0abc\n"
        );
        assert_eq!(format_outputs(&OutputMap::new()), "");
    }
}
