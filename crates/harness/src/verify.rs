//! Output verification against `out` / `error` pragmas
//!
//! Each stream is checked on its own. Without any pragma of the matching
//! kind the stream must be empty. Otherwise every pragma argument must occur
//! in the stream, each match starting no earlier than the end of the
//! previous one. An empty argument matches at the cursor, so it only puts
//! the stream into ignore mode.
//!
//! The exit code is deliberately not consulted here: a failing program is
//! only noticed through an expected `error` substring.

use serde::{Deserialize, Serialize};

use crate::pragma::{Pragma, PragmaKind, Pragmas};
use crate::process::ExecutionResult;

/// Longest excerpt of a stream quoted in a diagnostic
const EXCERPT_LIMIT: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub failing_reason: Option<String>,
}

impl VerificationOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            failing_reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            failing_reason: Some(reason.into()),
        }
    }
}

/// Which captured stream a check applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    fn pragma_kind(self) -> PragmaKind {
        match self {
            Stream::Stdout => PragmaKind::Out,
            Stream::Stderr => PragmaKind::Error,
        }
    }
}

/// Verify both streams of `result`. Pure; repeated calls give the same outcome.
pub fn verify(result: &ExecutionResult, pragmas: &Pragmas) -> VerificationOutcome {
    let failures: Vec<String> = [
        (Stream::Stdout, result.stdout.as_slice()),
        (Stream::Stderr, result.stderr.as_slice()),
    ]
    .into_iter()
    .filter_map(|(stream, content)| verify_stream(stream, content, pragmas).err())
    .collect();

    if failures.is_empty() {
        VerificationOutcome::pass()
    } else if result.output_truncated {
        VerificationOutcome::fail(format!(
            "{}\n(output capture incomplete: a pipe stayed open after the process exited)",
            failures.join("\n")
        ))
    } else {
        VerificationOutcome::fail(failures.join("\n"))
    }
}

/// Check one stream against the pragmas of its kind
pub fn verify_stream(stream: Stream, content: &[u8], pragmas: &Pragmas) -> Result<(), String> {
    let expected: Vec<&Pragma> = pragmas.of_kind(stream.pragma_kind()).collect();

    if expected.is_empty() {
        if content.is_empty() {
            return Ok(());
        }
        return Err(format!(
            "unexpected {} output (no '#pragma {}' declared):\n{}",
            stream.name(),
            stream.pragma_kind(),
            excerpt(content)
        ));
    }

    let mut cursor = 0;
    for pragma in expected {
        let needle = pragma.argument.as_bytes();
        match find(&content[cursor..], needle) {
            Some(pos) => cursor += pos + needle.len(),
            None => {
                let detail = if find(content, needle).is_some() {
                    "found only out of order"
                } else {
                    "not found"
                };
                return Err(format!(
                    "{}: expected '{}' (line {}) {} in:\n{}",
                    stream.name(),
                    pragma.argument,
                    pragma.line,
                    detail,
                    excerpt(content)
                ));
            }
        }
    }

    Ok(())
}

/// Position of the first occurrence of `needle` in `haystack`; the empty needle matches at 0
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn excerpt(content: &[u8]) -> String {
    let text = String::from_utf8_lossy(content);
    if text.len() <= EXCERPT_LIMIT {
        return text.into_owned();
    }
    let mut end = EXCERPT_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &text[..end], content.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            exit_code: Some(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn pragmas(text: &str) -> Pragmas {
        Pragmas::parse(text).unwrap()
    }

    #[test]
    fn test_silent_program_without_pragmas_passes() {
        assert!(verify(&result("", ""), &pragmas("")).passed);
    }

    #[test]
    fn test_any_byte_without_pragma_fails() {
        let outcome = verify(&result(" ", ""), &pragmas(""));
        assert!(!outcome.passed);
        assert!(outcome.failing_reason.unwrap().contains("unexpected stdout"));

        let outcome = verify(&result("", "x"), &pragmas("#pragma out\n"));
        assert!(!outcome.passed);
        assert!(outcome.failing_reason.unwrap().contains("unexpected stderr"));
    }

    #[test]
    fn test_hello_out_with_extra_output_passes() {
        let out = "Hello Out.\nSome other unimportant stuff.\n";
        assert!(verify(&result(out, ""), &pragmas("#pragma out Hello Out.\n")).passed);
    }

    #[test]
    fn test_unexpected_stderr_fails_even_if_stdout_matches() {
        let out = "Hello Out.\nSome other unimportant stuff.\n";
        let err = "Traceback (most recent call last):\nNameError: name 'x' is not defined\n";
        let outcome = verify(&result(out, err), &pragmas("#pragma out Hello Out.\n"));
        assert!(!outcome.passed);
        assert!(outcome.failing_reason.unwrap().contains("NameError"));
    }

    #[test]
    fn test_error_pragma_requires_literal_substring() {
        let p = pragmas("#pragma error assertion is always true, perhaps remove parentheses?\n");

        let matching = "SyntaxWarning: assertion is always true, perhaps remove parentheses?\n";
        assert!(verify(&result("", matching), &p).passed);

        let unrelated = "ZeroDivisionError: integer division or modulo by zero\n";
        let outcome = verify(&result("", unrelated), &p);
        assert!(!outcome.passed);
        assert!(outcome.failing_reason.unwrap().contains("not found"));
    }

    #[test]
    fn test_out_of_order_fails() {
        let p = pragmas("#pragma out Roses are red.\n#pragma out Violets are blue.\n#pragma out Sugar is sweet.\n");

        let ordered = "Roses are red.\nViolets are blue.\nSugar is sweet.\n";
        assert!(verify(&result(ordered, ""), &p).passed);

        let permuted = "Roses are red.\nSugar is sweet.\nViolets are blue.\n";
        let outcome = verify(&result(permuted, ""), &p);
        assert!(!outcome.passed);
        let reason = outcome.failing_reason.unwrap();
        assert!(reason.contains("Sugar is sweet."));
        assert!(reason.contains("out of order"));
    }

    #[test]
    fn test_matches_may_not_overlap() {
        let p = pragmas("#pragma out abab\n#pragma out ab\n");
        assert!(!verify(&result("abab", ""), &p).passed);
        assert!(verify(&result("ababab", ""), &p).passed);
    }

    #[test]
    fn test_repeated_expectation_needs_repeated_output() {
        let p = pragmas("#pragma out ping\n#pragma out ping\n");
        assert!(!verify(&result("ping\n", ""), &p).passed);
        assert!(verify(&result("ping\nping\n", ""), &p).passed);
    }

    #[test]
    fn test_empty_argument_ignores_stream() {
        let p = pragmas("#pragma out\n");
        assert!(verify(&result("anything at all\n\x01\x02", ""), &p).passed);
        assert!(verify(&result("", ""), &p).passed);
    }

    #[test]
    fn test_empty_argument_mixed_with_expectations() {
        let p = pragmas("#pragma out\n#pragma out needle\n");
        assert!(verify(&result("hay needle hay", ""), &p).passed);
        assert!(!verify(&result("hay hay", ""), &p).passed);
    }

    #[test]
    fn test_trailing_whitespace_in_argument_is_significant() {
        let p = pragmas("#pragma out done \n");
        assert!(!verify(&result("done\n", ""), &p).passed);
        assert!(verify(&result("done \n", ""), &p).passed);
    }

    #[test]
    fn test_incomplete_capture_is_mentioned_on_failure() {
        let mut r = result("partial", "");
        r.output_truncated = true;
        let reason = verify(&r, &pragmas("#pragma out partial output\n"))
            .failing_reason
            .unwrap();
        assert!(reason.contains("capture incomplete"));

        assert!(verify(&r, &pragmas("#pragma out partial\n")).passed);
    }

    #[test]
    fn test_exit_code_is_not_consulted() {
        let mut r = result("", "");
        r.exit_code = Some(1);
        assert!(verify(&r, &pragmas("")).passed);
    }

    #[test]
    fn test_verification_is_idempotent() {
        let r = result("b a", "");
        let p = pragmas("#pragma out a\n#pragma out b\n");
        assert_eq!(verify(&r, &p), verify(&r, &p));
    }

    #[test]
    fn test_binary_output_is_handled() {
        let r = ExecutionResult {
            stdout: vec![0xff, 0xfe, b'o', b'k'],
            ..Default::default()
        };
        assert!(verify(&r, &pragmas("#pragma out ok\n")).passed);
    }

    #[test]
    fn test_long_output_is_truncated_in_diagnostic() {
        let long = "x".repeat(EXCERPT_LIMIT * 2);
        let outcome = verify(&result(&long, ""), &pragmas(""));
        let reason = outcome.failing_reason.unwrap();
        assert!(reason.len() < long.len());
        assert!(reason.contains("bytes total"));
    }
}
