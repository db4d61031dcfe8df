//! ADC string escaping: space, backslash and newline are backslash-escaped
//! so that parameters can be split on unescaped spaces.

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('s') => out.push(' '),
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a space-separated, ADC-escaped token line, honoring escaped spaces.
pub fn split_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push('\\');
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ' ' => {
                if !current.is_empty() {
                    tokens.push(unescape(&current));
                    current.clear();
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        tokens.push(unescape(&current));
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_unescape_round_trips() {
        let s = "hello world\\with\\slashes\nand newline";
        assert_eq!(unescape(&escape(s)), s);
    }

    #[test]
    fn split_tokens_honors_escaped_spaces() {
        let line = r"CINF ID12345 NIJohn\sDoe";
        let tokens = split_tokens(line);
        assert_eq!(tokens, vec!["CINF", "ID12345", "NIJohn Doe"]);
    }
}
