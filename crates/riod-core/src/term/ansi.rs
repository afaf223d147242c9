//! ANSI escape stripping for terminal `stdout` capture.
//!
//! PTY output arrives in arbitrary chunks, so a sequence (or a multi-byte
//! UTF-8 character) can be split across reads. The stripper carries the
//! incomplete tail forward and only emits text it has fully decoded.
//! Removed: OSC sequences, CSI sequences, two-byte/charset escapes, stray
//! ESC bytes, and carriage returns.

use once_cell::sync::Lazy;
use regex::Regex;

static OSC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());
static CSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());
static ESC_SEQ_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b[ -/]*[0-~]").unwrap());
static STRAY_ESC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b").unwrap());

/// Strip escapes from already-complete text.
pub fn strip_ansi(text: &str) -> String {
    let pass = OSC_RE.replace_all(text, "");
    let pass = CSI_RE.replace_all(&pass, "");
    let pass = ESC_SEQ_RE.replace_all(&pass, "");
    let pass = STRAY_ESC_RE.replace_all(&pass, "");
    pass.replace('\r', "")
}

/// Never carry more than this; past it the tail is flushed as-is
/// (binary spew guard).
const MAX_CARRY: usize = 2048;

#[derive(Default)]
pub struct AnsiStripper {
    carry: Vec<u8>,
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk, returning the stripped text that is safe to emit.
    pub fn feed(&mut self, data: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(data);

        let mut keep = incomplete_escape_suffix(&buf);
        if keep > MAX_CARRY {
            keep = 0;
        }
        if keep == 0 {
            keep = incomplete_utf8_suffix(&buf);
        }

        let ready = buf.len() - keep;
        self.carry = buf.split_off(ready);
        strip_ansi(&String::from_utf8_lossy(&buf))
    }

    /// Drain whatever is still carried (terminal teardown).
    pub fn flush(&mut self) -> String {
        let rest = std::mem::take(&mut self.carry);
        strip_ansi(&String::from_utf8_lossy(&rest))
    }
}

/// Length of an incomplete escape sequence at the end of `buf`, or 0.
fn incomplete_escape_suffix(buf: &[u8]) -> usize {
    let Some(pos) = buf.iter().rposition(|&b| b == 0x1b) else {
        return 0;
    };
    let seq = &buf[pos..];
    if escape_complete(seq) {
        0
    } else {
        buf.len() - pos
    }
}

fn escape_complete(seq: &[u8]) -> bool {
    if seq.len() < 2 {
        return false;
    }
    match seq[1] {
        // CSI: params/intermediates then a final byte 0x40..=0x7e.
        b'[' => seq[2..].iter().any(|&b| (0x40..=0x7e).contains(&b)),
        // OSC: runs to BEL (the ESC \ form ends at a later ESC, which
        // would then be the rposition hit instead).
        b']' => seq[2..].contains(&0x07),
        // Charset / intermediate forms: ESC, intermediates, final byte.
        0x20..=0x2f => seq[2..].iter().any(|&b| (0x30..=0x7e).contains(&b)),
        // Two-byte escape.
        _ => true,
    }
}

/// Bytes of an incomplete UTF-8 character at the end of `buf`, or 0.
fn incomplete_utf8_suffix(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=3.min(len) {
        let b = buf[len - back];
        if b & 0b1100_0000 == 0b1100_0000 {
            // Lead byte this many positions from the end; incomplete when
            // the expected continuation bytes are missing.
            let expected = if b & 0b1110_0000 == 0b1100_0000 {
                2
            } else if b & 0b1111_0000 == 0b1110_0000 {
                3
            } else {
                4
            };
            return if expected > back { back } else { 0 };
        }
        if b & 0b1100_0000 != 0b1000_0000 {
            return 0; // ASCII or invalid; nothing to carry.
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_colors_and_cursor_moves() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m plain"), "red plain");
        assert_eq!(strip_ansi("a\x1b[2J\x1b[Hb"), "ab");
    }

    #[test]
    fn strips_osc_titles() {
        assert_eq!(strip_ansi("\x1b]0;my title\x07hello"), "hello");
        assert_eq!(strip_ansi("\x1b]8;;http://x\x1b\\link"), "link");
    }

    #[test]
    fn strips_charset_and_stray_escapes() {
        assert_eq!(strip_ansi("\x1b(Bok"), "ok");
        assert_eq!(strip_ansi("tail\x1b"), "tail");
    }

    #[test]
    fn removes_carriage_returns() {
        assert_eq!(strip_ansi("progress\rdone\r\n"), "done\n");
    }

    #[test]
    fn split_sequence_across_chunks() {
        let mut s = AnsiStripper::new();
        let first = s.feed(b"hello \x1b[3");
        assert_eq!(first, "hello ");
        let second = s.feed(b"1mred\x1b[0m");
        assert_eq!(second, "red");
    }

    #[test]
    fn split_utf8_across_chunks() {
        let mut s = AnsiStripper::new();
        let bytes = "héllo".as_bytes();
        let first = s.feed(&bytes[..2]); // splits the two-byte é
        let second = s.feed(&bytes[2..]);
        assert_eq!(format!("{first}{second}"), "héllo");
    }

    #[test]
    fn flush_drains_carry() {
        let mut s = AnsiStripper::new();
        assert_eq!(s.feed(b"x\x1b["), "x");
        assert_eq!(s.flush(), "");
    }
}
