//! Terminal output sanitisation before it reaches a chat.

use std::sync::LazyLock;

use regex::Regex;

/// CSI sequences: cursor movement, colours, erase. Both the `ESC [` and
/// the single-character C1 introducer.
static CSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\x1b\[|\x{9b})[0-?]*[ -/]*[@-~]").expect("valid CSI regex")
});

/// OSC sequences (window titles, hyperlinks), BEL or ST terminated.
/// Unterminated ones run to the next escape or end of input.
static OSC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?").expect("valid OSC regex")
});

/// Remaining escapes: charset selection and single-char Fe/Fp forms.
static OTHER_ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:[()*+][0-9A-Za-z]|[0-~])").expect("valid escape regex")
});

/// C0 and C1 control characters other than `\t` and `\n`.
static CONTROL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0b-\x1f\x7f\x{80}-\x{9f}]").expect("valid control regex")
});

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid newline regex"));

/// Strip ANSI escape sequences only.
pub fn strip_ansi(input: &str) -> String {
    let out = OSC.replace_all(input, "");
    let out = CSI.replace_all(&out, "");
    OTHER_ESCAPES.replace_all(&out, "").into_owned()
}

/// Make engine output safe for a chat message.
///
/// Strips escapes and control characters, normalises line endings,
/// collapses 3+ newlines to 2, and trims. Idempotent.
pub fn clean_output(input: &str) -> String {
    let out = strip_ansi(input).replace("\r\n", "\n");
    let out = CONTROL.replace_all(&out, "");
    let out = BLANK_RUNS.replace_all(&out, "\n\n");
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_colour_and_cursor_codes() {
        let raw = "\x1b[1;32mok\x1b[0m \x1b[2K\x1b[1Gdone\x1b[?25h";
        assert_eq!(clean_output(raw), "ok done");
    }

    #[test]
    fn strips_osc_sequences() {
        let raw = "\x1b]0;window title\x07hello \x1b]8;;https://x.dev\x1b\\link\x1b]8;;\x1b\\";
        assert_eq!(clean_output(raw), "hello link");
    }

    #[test]
    fn strips_other_escape_forms() {
        assert_eq!(clean_output("\x1b(Bplain\x1b7saved\x1b8"), "plainsaved");
    }

    #[test]
    fn strips_control_chars_but_keeps_tabs() {
        assert_eq!(clean_output("a\x07b\x08c\td\r\ne\rf"), "abc\td\nef");
    }

    #[test]
    fn strips_c1_controls_and_single_char_csi() {
        assert_eq!(clean_output("a\u{9b}31mb\u{9b}0m\u{85}c\u{90}"), "abc");
        assert_eq!(clean_output("naïve café"), "naïve café");
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(clean_output("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(clean_output("a\n\n\nb\n\nc"), "a\n\nb\n\nc");
        assert_eq!(clean_output("\n\n  x  \n\n\n"), "x");
    }

    #[test]
    fn control_removal_cannot_leave_long_runs() {
        assert_eq!(clean_output("a\n\x01\n\x02\n\x03\nb"), "a\n\nb");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let samples = [
            "\x1b[31merror\x1b[0m\n\n\n\n\x1b]0;t\x07next",
            "plain text",
            "  \r\n\r\n\r\n\r\nspaced\t\x1b[Kend  ",
            "\x1b]unterminated osc",
            "",
        ];
        for raw in samples {
            let once = clean_output(raw);
            assert_eq!(clean_output(&once), once, "{raw:?}");
            assert!(!once.contains('\x1b'));
            assert!(!once.contains("\n\n\n"));
        }
    }
}
