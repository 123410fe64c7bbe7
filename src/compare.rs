use std::borrow::Cow;

use memchr::memchr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CompareMode {
    /// Byte equality after line ending normalization.
    Exact,
    /// Ignores trailing whitespace on every line and trailing blank lines.
    #[default]
    IgnoreTrailing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareResult {
    pub accepted: bool,
    pub diagnostic: Option<String>,
}

/// Turns `\r\n` and lone `\r` into `\n`. Borrows when there is no `\r`.
pub fn normalize_line_endings(data: &[u8]) -> Cow<'_, [u8]> {
    let first = match memchr(b'\r', data) {
        None => return Cow::Borrowed(data),
        Some(pos) => pos,
    };

    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..first]);

    let mut iter = data[first..].iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b == b'\r' {
            if iter.peek() == Some(&b'\n') {
                iter.next();
            }
            out.push(b'\n');
        } else {
            out.push(b);
        }
    }
    Cow::Owned(out)
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b' ' | b'\t' | b'\r' | b'\n'] = line {
        line = rest;
    }
    line
}

fn significant_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = data.split(|&b| b == b'\n').map(trim_line_end).collect();
    while lines.last().map_or(false, |l| l.is_empty()) {
        lines.pop();
    }
    lines
}

fn first_mismatch(actual: &[u8], expected: &[u8]) -> String {
    let fmt_byte = |b: Option<&u8>| match b {
        Some(b) => b.to_string(),
        None => "EOF".to_owned(),
    };

    let pos = actual
        .iter()
        .zip(expected)
        .position(|(a, e)| a != e)
        .unwrap_or_else(|| actual.len().min(expected.len()));

    if pos == actual.len() && pos == expected.len() {
        return "Output mismatch".to_owned();
    }

    format!(
        "Output mismatch at byte {}: expected {}, received {}",
        pos + 1,
        fmt_byte(expected.get(pos)),
        fmt_byte(actual.get(pos)),
    )
}

/// Compares the program's output with the expected answer.
pub fn compare(actual: &[u8], expected: &[u8], mode: CompareMode) -> CompareResult {
    let actual = normalize_line_endings(actual);
    let expected = normalize_line_endings(expected);

    let accepted = match mode {
        CompareMode::Exact => actual == expected,
        CompareMode::IgnoreTrailing => significant_lines(&actual) == significant_lines(&expected),
    };

    let diagnostic = (!accepted).then(|| first_mismatch(&actual, &expected));
    CompareResult {
        accepted,
        diagnostic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use CompareMode::{Exact, IgnoreTrailing};

    #[test]
    fn normalize() {
        assert_eq!(&*normalize_line_endings(b"a\r\nb\rc\n"), b"a\nb\nc\n");
        assert_eq!(&*normalize_line_endings(b"\r\r\n"), b"\n\n");
        assert!(matches!(normalize_line_endings(b"a\nb"), Cow::Borrowed(_)));
    }

    #[test]
    fn normalize_is_idempotent() {
        let inputs: &[&[u8]] = &[b"", b"\r", b"\r\n\r", b"x\r\r\ny\n", b"\n\r\n\n"];
        for input in inputs {
            let once = normalize_line_endings(input).into_owned();
            let twice = normalize_line_endings(&once).into_owned();
            assert_eq!(once, twice);
            assert!(!once.contains(&b'\r'));
        }
    }

    #[test]
    fn identical_is_accepted() {
        let inputs: &[&[u8]] = &[b"", b"1 2 3\n", b"\0\xff\r\n", b"  \n\n"];
        for input in inputs {
            for mode in [Exact, IgnoreTrailing] {
                let ret = compare(input, input, mode);
                assert!(ret.accepted);
                assert_eq!(ret.diagnostic, None);
            }
        }
    }

    #[test]
    fn trailing_whitespace() {
        assert!(compare(b"3", b"3\n", IgnoreTrailing).accepted);
        assert!(!compare(b"3", b"3\n", Exact).accepted);
        assert!(compare(b"1 2  \t\n3\n\n\n", b"1 2\n3", IgnoreTrailing).accepted);
        assert!(compare(b"1\r\n2\r\n", b"1\n2\n", Exact).accepted);
    }

    #[test]
    fn inner_blank_lines_matter() {
        assert!(!compare(b"1\n\n2\n", b"1\n2\n", IgnoreTrailing).accepted);
        assert!(!compare(b" 1\n", b"1\n", IgnoreTrailing).accepted);
    }

    #[test]
    fn mismatch_position() {
        let ret = compare(b"12\n", b"13\n", Exact);
        assert_eq!(
            ret.diagnostic.as_deref(),
            Some("Output mismatch at byte 2: expected 51, received 50")
        );

        let ret = compare(b"1", b"1 2", IgnoreTrailing);
        assert_eq!(
            ret.diagnostic.as_deref(),
            Some("Output mismatch at byte 2: expected 32, received EOF")
        );

        let ret = compare(b"1\n2", b"1\n", Exact);
        assert_eq!(
            ret.diagnostic.as_deref(),
            Some("Output mismatch at byte 3: expected EOF, received 50")
        );
    }
}
