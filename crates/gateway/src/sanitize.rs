//! Terminal output sanitization.
//!
//! Raw PTY output is full of escape sequences that only make sense to a
//! terminal emulator. [`sanitize`] turns it into plain text suitable for
//! logs. Clients normally receive raw bytes: stripping cursor movement
//! corrupts what a real terminal renders, so forwarding sanitized text is an
//! explicit [`OutputMode`] rather than the default.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How output is forwarded to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// PTY output is forwarded as decoded text without modification.
    #[default]
    Raw,
    /// PTY output is passed through a [`StreamSanitizer`] first.
    Sanitized,
}

/// Longest escape sequence held back waiting for its terminator.
const MAX_PENDING_ESCAPE: usize = 1024;

/// OSC sequences: ESC ] ... terminated by BEL or ESC \.
static OSC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").expect("OSC pattern is valid")
});

/// CSI sequences: ESC [ parameter bytes, intermediate bytes, final byte.
///
/// Covers SGR colors, cursor movement, bracketed paste (`ESC[?2004h`),
/// screen clears (`ESC[2J`, `ESC[H`) and line clears (`ESC[K`).
static CSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").expect("CSI pattern is valid")
});

/// Two-byte escapes such as keypad mode (`ESC=`, `ESC>`) and charset
/// selection (`ESC(B`).
static SHORT_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:[()][0-9A-Za-z]|[=>78cDEHMZ])").expect("escape pattern is valid")
});

/// Remaining C0 controls except tab and newline, plus DEL.
static CONTROL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").expect("control pattern is valid")
});

/// Decodes raw PTY bytes and strips terminal control sequences.
///
/// Invalid UTF-8 is replaced, never rejected.
pub fn sanitize(bytes: &[u8]) -> String {
    sanitize_str(&String::from_utf8_lossy(bytes))
}

/// Strips terminal control sequences from decoded text.
pub fn sanitize_str(text: &str) -> String {
    let text = OSC.replace_all(text, "");
    let text = CSI.replace_all(&text, "");
    let text = SHORT_ESCAPE.replace_all(&text, "");
    let text = text.replace("\r\n", "\n").replace('\r', "");
    CONTROL.replace_all(&text, "").into_owned()
}

/// Sanitizes output that arrives in chunks.
///
/// A read can end in the middle of an escape sequence. The incomplete tail
/// is held back until the next chunk completes it, so no half of a sequence
/// leaks through as text.
#[derive(Debug, Default)]
pub struct StreamSanitizer {
    pending: String,
}

impl StreamSanitizer {
    /// Sanitizes `text` after any held-back tail.
    pub fn push(&mut self, text: &str) -> String {
        self.pending.push_str(text);
        let cut = incomplete_escape_start(&self.pending);
        let tail = self.pending.split_off(cut);
        let ready = std::mem::replace(&mut self.pending, tail);
        sanitize_str(&ready)
    }

    /// Flushes the held-back tail at end of stream.
    pub fn finish(&mut self) -> String {
        sanitize_str(&std::mem::take(&mut self.pending))
    }
}

/// Byte offset where an unterminated escape sequence at the end of `text`
/// begins, or `text.len()` if there is none.
fn incomplete_escape_start(text: &str) -> usize {
    let start = match unterminated_osc(text) {
        Some(start) => start,
        None => match text.rfind('\x1b') {
            Some(esc) if is_escape_prefix(&text[esc + 1..]) => esc,
            _ => return text.len(),
        },
    };

    if text.len() - start > MAX_PENDING_ESCAPE {
        text.len()
    } else {
        start
    }
}

/// Start of a trailing `ESC ]` sequence with no BEL or `ESC \` yet.
fn unterminated_osc(text: &str) -> Option<usize> {
    let start = text.rfind("\x1b]")?;
    let body = &text[start + 2..];
    let terminated = body.contains('\x07') || body.contains("\x1b\\");
    (!terminated).then_some(start)
}

/// Whether the bytes after an ESC could still grow into a sequence.
fn is_escape_prefix(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        None => true,
        Some('[') => chars.all(|c| matches!(c, '0'..='?' | ' '..='/')),
        Some('(' | ')') => chars.next().is_none(),
        Some(_) => false,
    }
}
