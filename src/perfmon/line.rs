//! Counter-definition line grammar.
//!
//! Definition files hold one directive per line. `#` starts a trailing
//! comment, blank lines are ignored, and only `pmc:` lines carry counters.
//! The `gpu:`, `range:` and `kernel:` trailer lines are accepted but carry
//! nothing for the planner.

/// Directive prefix for a counter-sampling line.
pub const PMC_PREFIX: &str = "pmc:";

/// Trailer appended after the `pmc:` lines of every emitted definition file.
pub const TRAILER: &str = "gpu:\nrange:\nkernel:\n";

/// A single `pmc:` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmcLine {
    /// Comment-stripped, trimmed text of the whole line.
    pub text: String,
    /// Counter tokens in the order they appear.
    pub counters: Vec<String>,
}

/// Strip a trailing comment and surrounding whitespace.
pub fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or_default().trim()
}

/// Parse one raw line. Returns `None` for blank, comment-only and
/// non-`pmc:` lines.
pub fn parse_line(line: &str) -> Option<PmcLine> {
    let text = strip_comment(line);
    if text.is_empty() {
        return None;
    }

    let rest = text.strip_prefix(PMC_PREFIX)?;
    Some(PmcLine {
        text: text.to_string(),
        counters: rest.split_whitespace().map(str::to_string).collect(),
    })
}

/// Parse every `pmc:` directive out of a file's content, in order.
pub fn parse_lines(content: &str) -> Vec<PmcLine> {
    content.lines().filter_map(parse_line).collect()
}

/// Render a definition file body for the given directive lines.
///
/// Each line is emitted verbatim, followed by a blank line and the trailer.
pub fn render_definition(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(TRAILER);
    out
}

/// Render a `pmc:` directive for a list of counters.
pub fn render_pmc(counters: &[String]) -> String {
    if counters.is_empty() {
        PMC_PREFIX.to_string()
    } else {
        format!("{PMC_PREFIX} {}", counters.join(" "))
    }
}
