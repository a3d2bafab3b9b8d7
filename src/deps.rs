//! The dependency extractor: runs the compiler's dependency-listing mode on
//! one source file and parses the make-style rule it prints, yielding the
//! derived artifact name and the transitive set of files the source includes.

use std::fmt;
use std::process::Command;

#[derive(Debug, PartialEq)]
pub struct SourceDeps {
    /// Artifact file name the rule derives, e.g. "spooky.o".
    pub target: String,
    /// Every path the source depends on, the source itself included, in rule
    /// order with duplicates removed.
    pub deps: Vec<String>,
}

/// A malformed dependency rule, with the byte offset of the problem.
#[derive(Debug)]
pub struct RuleError {
    pub msg: String,
    pub ofs: usize,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset {}: {}", self.ofs, self.msg)
    }
}

#[derive(Debug)]
pub enum ExtractError {
    /// The dependency tool exited nonzero or could not be run.
    ToolFailed { source: String, detail: String },
    /// The tool's output wasn't a single `target: prereq ...` rule.
    BadRule { source: String, err: RuleError },
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::ToolFailed { source, detail } => {
                write!(f, "dependency extraction failed for {}: {}", source, detail)
            }
            ExtractError::BadRule { source, err } => {
                write!(f, "bad dependency rule for {}: {}", source, err)
            }
        }
    }
}
impl std::error::Error for ExtractError {}

/// Scans rule output byte by byte; reads past the end yield 0.
struct Scanner<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Scanner<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Scanner { buf, ofs: 0 }
    }

    fn peek(&self) -> u8 {
        self.buf.get(self.ofs).copied().unwrap_or(0)
    }

    fn read(&mut self) -> u8 {
        let c = self.peek();
        self.ofs += 1;
        c
    }

    fn back(&mut self) {
        self.ofs -= 1;
    }

    fn error<T>(&self, msg: impl Into<String>) -> Result<T, RuleError> {
        Err(RuleError {
            msg: msg.into(),
            ofs: self.ofs,
        })
    }
}

/// Skip spaces and backslash-newline continuations.
fn skip_spaces(scanner: &mut Scanner) -> Result<(), RuleError> {
    loop {
        match scanner.read() {
            b' ' | b'\t' => {}
            b'\\' => match scanner.read() {
                b'\n' => {}
                b'\r' => {
                    if scanner.read() != b'\n' {
                        return scanner.error("invalid backslash escape");
                    }
                }
                _ => return scanner.error("invalid backslash escape"),
            },
            _ => {
                scanner.back();
                break;
            }
        }
    }
    Ok(())
}

fn read_path<'a>(scanner: &mut Scanner<'a>) -> Result<Option<&'a str>, RuleError> {
    skip_spaces(scanner)?;
    let start = scanner.ofs;
    loop {
        match scanner.read() {
            0 | b' ' | b'\t' | b':' | b'\n' | b'\r' => {
                scanner.back();
                break;
            }
            _ => {}
        }
    }
    let end = scanner.ofs;
    if end == start {
        return Ok(None);
    }
    match std::str::from_utf8(&scanner.buf[start..end]) {
        Ok(path) => Ok(Some(path)),
        Err(_) => scanner.error("non-utf8 path"),
    }
}

/// Parse a single `target: prereq prereq ...` rule, joining backslash-newline
/// continuations. Prerequisites come back deduplicated, in rule order.
pub fn parse_rule(buf: &[u8]) -> Result<SourceDeps, RuleError> {
    let mut scanner = Scanner::new(buf);
    let target = match read_path(&mut scanner)? {
        None => return scanner.error("expected target"),
        Some(t) => t.to_string(),
    };
    if scanner.read() != b':' {
        scanner.back();
        return scanner.error("expected ':' after target");
    }
    let mut deps: Vec<String> = Vec::new();
    loop {
        match read_path(&mut scanner)? {
            None => break,
            Some(path) => {
                if !deps.iter().any(|d| d == path) {
                    deps.push(path.to_string());
                }
            }
        }
    }
    // Only trailing whitespace may remain; a second rule is malformed.
    loop {
        match scanner.read() {
            b'\n' | b'\r' | b' ' | b'\t' => {}
            0 => break,
            _ => {
                scanner.back();
                return scanner.error("trailing garbage after rule");
            }
        }
    }
    Ok(SourceDeps { target, deps })
}

/// Run `tool`'s dependency-listing mode on `source` and parse the result.
/// Read-only with respect to the filesystem and the graph; safe to run in
/// parallel across sources.
pub fn extract(
    source: &str,
    include_dir: &str,
    quiet: bool,
    tool: &str,
) -> Result<SourceDeps, ExtractError> {
    let tool_failed = |detail: String| ExtractError::ToolFailed {
        source: source.to_string(),
        detail,
    };
    if !quiet {
        println!("{} -MM -I{} {}", tool, include_dir, source);
    }
    let out = Command::new(tool)
        .arg("-MM")
        .arg(format!("-I{}", include_dir))
        .arg(source)
        .output()
        .map_err(|err| tool_failed(format!("spawn {}: {}", tool, err)))?;
    if !out.status.success() {
        return Err(tool_failed(format!(
            "{}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim_end()
        )));
    }
    parse_rule(&out.stdout).map_err(|err| ExtractError::BadRule {
        source: source.to_string(),
        err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_line_rule() {
        let rule = parse_rule(b"spooky.o: src/spooky.c inc/spooky.h\n").unwrap();
        assert_eq!(rule.target, "spooky.o");
        assert_eq!(rule.deps, vec!["src/spooky.c", "inc/spooky.h"]);
    }

    #[test]
    fn parse_joins_continuations() {
        let rule = parse_rule(b"a.o: src/a.c \\\n inc/a.h \\\r\n inc/b.h\n").unwrap();
        assert_eq!(rule.target, "a.o");
        assert_eq!(rule.deps, vec!["src/a.c", "inc/a.h", "inc/b.h"]);
    }

    #[test]
    fn parse_deduplicates_in_order() {
        let rule = parse_rule(b"a.o: a.c h.h a.c g.h h.h\n").unwrap();
        assert_eq!(rule.deps, vec!["a.c", "h.h", "g.h"]);
    }

    #[test]
    fn parse_rule_without_deps() {
        let rule = parse_rule(b"a.o: \n").unwrap();
        assert_eq!(rule.deps, Vec::<String>::new());
    }

    #[test]
    fn parse_missing_colon() {
        assert!(parse_rule(b"a.o a.c\n").is_err());
    }

    #[test]
    fn parse_rejects_second_rule() {
        assert!(parse_rule(b"a.o: a.c\nb.o: b.c\n").is_err());
    }

    #[test]
    fn parse_bad_escape() {
        assert!(parse_rule(b"a.o: a.c \\x\n").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn extract_tool_nonzero_exit() {
        match extract("a.c", "inc", true, "false") {
            Err(ExtractError::ToolFailed { source, .. }) => assert_eq!(source, "a.c"),
            other => panic!("expected ToolFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn extract_malformed_output() {
        // `echo` succeeds but prints its arguments, not a rule.
        match extract("a.c", "inc", true, "echo") {
            Err(ExtractError::BadRule { source, .. }) => assert_eq!(source, "a.c"),
            other => panic!("expected BadRule, got {:?}", other),
        }
    }
}
