//! Metadata extractor: a stateless parser over PTY output chunks producing
//! a [`MetadataPatch`] per chunk. Each rule in §4.5 of the spec is
//! implemented as its own matcher, tried in priority order; a later rule
//! only fills fields an earlier rule left unset.

use once_cell::sync::Lazy;
use regex::Regex;
use termmesh_core::types::MetadataPatch;

const SPINNER_GLYPHS: &[char] = &['⠐', '⠂', '✳', '✶', '✻', '✽', '✢', '·', '⠈', '⠁', '⠃'];

static MODEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(opus|sonnet|haiku)[- ]?(\d+(?:[.-]\d+)*)").expect("valid regex")
});
static CONTEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("valid regex"));

/// OSC title escape, kind-A form: `ESC]0;<spinner><title>BEL`.
static OSC_TITLE_A_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\]0;(.)(.*?)\x07").expect("valid regex"));
/// OSC title escape, kind-B form: `ESC]2;<title>BEL`.
static OSC_TITLE_B_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\]2;(.*?)\x07").expect("valid regex"));
/// Dim-text prompt: `ESC[2m<text>ESC[22m`.
static DIM_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[2m(.*?)\x1b\[22m").expect("valid regex"));
/// kind-B input prompt: `❯ ESC[39m<input>`.
static INPUT_PROMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x{276F}\x1b\[39m([^\x1b\r\n]*)").expect("valid regex"));
/// CSI sequence: `ESC[...<letter>`.
static CSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid"));
/// OSC sequence: `ESC]...BEL`.
static OSC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\].*?\x07").expect("valid"));

/// Strips CSI and OSC escape sequences and carriage returns, leaving plain
/// text suitable for the text-only rules (§4.5 point 4 onward).
pub fn strip_ansi(chunk: &str) -> String {
    let no_csi = CSI_RE.replace_all(chunk, "");
    let no_osc = OSC_RE.replace_all(&no_csi, "");
    no_osc.replace('\r', "")
}

/// Parses one chunk of raw PTY output into a metadata patch, per the
/// priority-ordered rules of §4.5. `chunk` must be valid UTF-8 text (the
/// PTY session layer replaces invalid sequences before calling in).
pub fn extract(chunk: &str) -> MetadataPatch {
    let mut patch = MetadataPatch::default();

    // Rule 1: OSC window title, kind-A.
    if let Some(caps) = OSC_TITLE_A_RE.captures(chunk) {
        let glyph = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let title = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let title = title.strip_prefix(' ').unwrap_or(title);
        if glyph.chars().next().map(|c| SPINNER_GLYPHS.contains(&c)) == Some(true) {
            if title == "Claude Code" {
                patch.waiting_for_input = Some(true);
            } else if title.chars().count() > 2 && title.chars().count() < 80 {
                patch.last_message = Some(title.to_string());
                patch.waiting_for_input = Some(false);
            }
        }
    }

    // Rule 2: OSC window title, kind-B.
    if patch.model.is_none() {
        if let Some(caps) = OSC_TITLE_B_RE.captures(chunk) {
            let title = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if title == "GitHub Copilot" {
                patch.model = Some(title.to_string());
            }
        }
    }

    // Rule 3: dim text prompt, kind-A.
    if patch.last_message.is_none() && patch.waiting_for_input.is_none() {
        if let Some(caps) = DIM_TEXT_RE.captures(chunk) {
            let text = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if text.starts_with("Type @") {
                patch.waiting_for_input = Some(true);
            } else {
                let len = text.chars().count();
                if len > 2 && len < 100 && !text.starts_with('─') {
                    patch.last_message = Some(text.to_string());
                }
            }
        }
    }

    // Rule 4: model / context on the stripped text.
    let stripped = strip_ansi(chunk);
    if patch.model.is_none() {
        if let Some(caps) = MODEL_RE.captures(&stripped) {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let version = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let capitalized = capitalize(name);
            let dotted = version.replace('-', ".");
            patch.model = Some(format!("{capitalized} {dotted}"));
        }
    }
    if patch.context_used.is_none() {
        if let Some(caps) = CONTEXT_RE.captures(&stripped) {
            let n = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            patch.context_used = Some(format!("{n}%"));
        }
    }

    // Rule 5: kind-B input prompt.
    if patch.last_message.is_none() && patch.waiting_for_input.is_none() {
        if let Some(caps) = INPUT_PROMPT_RE.captures(chunk) {
            let input = caps.get(1).map(|m| m.as_str()).unwrap_or_default().trim();
            if !input.is_empty() && !input.starts_with("Type @") {
                patch.last_message = Some(input.to_string());
            } else if input.is_empty() {
                patch.waiting_for_input = Some(true);
            }
        } else if chunk.contains('\u{276F}') {
            patch.waiting_for_input = Some(true);
        }
    }

    // Rule 6: fallback "thinking" — matched against stripped text per the
    // resolved Open Question, case-insensitively.
    if patch.last_message.is_none() && stripped.to_lowercase().contains("thinking") {
        patch.last_message = Some("Thinking...".to_string());
        patch.waiting_for_input = Some(false);
    }

    patch
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osc_title_sets_last_message() {
        let patch = extract("\x1b]0;✳ Refactoring module\x07");
        assert_eq!(patch.last_message.as_deref(), Some("Refactoring module"));
        assert_eq!(patch.waiting_for_input, Some(false));
    }

    #[test]
    fn osc_title_claude_code_sets_waiting() {
        let patch = extract("\x1b]0;✳ Claude Code\x07");
        assert_eq!(patch.waiting_for_input, Some(true));
        assert!(patch.last_message.is_none());
    }

    #[test]
    fn osc_title_kind_b_sets_model() {
        let patch = extract("\x1b]2;GitHub Copilot\x07");
        assert_eq!(patch.model.as_deref(), Some("GitHub Copilot"));
    }

    #[test]
    fn dim_text_type_at_sets_waiting() {
        let patch = extract("\x1b[2mType @ to add a file\x1b[22m");
        assert_eq!(patch.waiting_for_input, Some(true));
    }

    #[test]
    fn model_and_context_extracted_from_stripped_text() {
        let patch = extract("using sonnet-4.5 model, 42% context used\x1b[0m");
        assert_eq!(patch.model.as_deref(), Some("Sonnet 4.5"));
        assert_eq!(patch.context_used.as_deref(), Some("42%"));
    }

    #[test]
    fn thinking_fallback_only_when_nothing_else_matched() {
        let patch = extract("still thinking about it");
        assert_eq!(patch.last_message.as_deref(), Some("Thinking..."));
        assert_eq!(patch.waiting_for_input, Some(false));
    }

    #[test]
    fn thinking_fallback_does_not_override_earlier_rule() {
        let patch = extract("\x1b]0;✳ thinking hard\x07");
        assert_eq!(patch.last_message.as_deref(), Some("thinking hard"));
    }

    #[test]
    fn strip_ansi_removes_csi_and_osc_and_cr() {
        let stripped = strip_ansi("\x1b[31mred\x1b[0m\r\n\x1b]0;title\x07plain");
        assert_eq!(stripped, "red\nplain");
    }
}
