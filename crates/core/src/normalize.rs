use regex::Regex;
use std::sync::OnceLock;

fn hyphen_break() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-\s*\n\s*").expect("static pattern"))
}

fn space_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r" {2,}").expect("static pattern"))
}

fn newline_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{2,}").expect("static pattern"))
}

/// Clean text extracted from a PDF page.
///
/// Joins words split by a line-end hyphen, turns lone line breaks into
/// spaces, squeezes repeated spaces, keeps paragraph breaks as exactly one
/// blank line, and trims the result.
pub fn normalize(raw: &str) -> String {
    let text = raw.replace('\r', "");
    let text = hyphen_break().replace_all(&text, "");
    let text = join_single_newlines(&text);
    let text = space_run().replace_all(&text, " ");
    let text = newline_run().replace_all(&text, "\n\n");
    text.trim().to_string()
}

fn join_single_newlines(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut joined = String::with_capacity(text.len());

    for (index, &c) in chars.iter().enumerate() {
        if c != '\n' {
            joined.push(c);
            continue;
        }

        let prev_is_newline = index > 0 && chars[index - 1] == '\n';
        let next_is_newline = chars.get(index + 1) == Some(&'\n');
        if prev_is_newline || next_is_newline {
            joined.push('\n');
        } else {
            joined.push(' ');
        }
    }

    joined
}
