//! Quote-aware tokenizer backing the command safety gate.
//!
//! Unlike an AST parser this never rejects input it cannot fully understand by
//! panicking: anything ambiguous is treated as a policy violation (fail closed).

use thiserror::Error;

const FORBIDDEN_EXECUTABLES: &[&str] = &[
    "rm", "dd", "mkfs", "shutdown", "reboot", "halt", "poweroff", "kill", "pkill", "del", "erase",
];

const WRAPPER_EXECUTABLES: &[&str] = &["sudo", "command", "nohup", "time"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("too many pipes: {found} > {max}")]
    TooManyPipes { found: usize, max: usize },
    #[error("forbidden executable: {0}")]
    ForbiddenExecutable(String),
    #[error("git push is not permitted")]
    GitPush,
}

/// One `;`/`&&`/`||`/`&`/newline-delimited segment of a command string, plus the
/// pipe-joined sub-commands within it.
#[derive(Debug, Clone)]
struct Segment {
    tokens: Vec<String>,
}

/// Validate `cmd` against the command safety gate. Returns `Ok(())` when the
/// command has no forbidden top-level executable, no `git push`, and at most
/// `max_pipes` pipe operators. Does not sandbox the command — that is the
/// external executor's job.
pub fn check_command(cmd: &str, max_pipes: usize) -> Result<(), GateError> {
    if cmd.trim().is_empty() {
        return Err(GateError::EmptyCommand);
    }

    let tokens = tokenize(cmd);
    if tokens.is_empty() {
        return Err(GateError::EmptyCommand);
    }

    let pipe_count = tokens.iter().filter(|t| t.kind == TokenKind::Pipe).count();
    if pipe_count > max_pipes {
        return Err(GateError::TooManyPipes { found: pipe_count, max: max_pipes });
    }

    for segment in split_segments(&tokens) {
        check_segment(&segment)?;
    }

    Ok(())
}

fn check_segment(segment: &Segment) -> Result<(), GateError> {
    // A segment may itself contain pipe-joined sub-commands; each sub-command's
    // leading executable is checked independently.
    let mut sub = Vec::new();
    for tok in &segment.tokens {
        if tok == "|" {
            check_sub_command(&sub)?;
            sub.clear();
        } else {
            sub.push(tok.clone());
        }
    }
    check_sub_command(&sub)
}

fn check_sub_command(tokens: &[String]) -> Result<(), GateError> {
    let mut idx = 0;

    // Skip leading KEY=VALUE assignments.
    while idx < tokens.len() && is_assignment(&tokens[idx]) {
        idx += 1;
    }
    if idx >= tokens.len() {
        return Ok(());
    }

    let exe_token = &tokens[idx];
    let exe = basename(exe_token).to_ascii_lowercase();

    if WRAPPER_EXECUTABLES.contains(&exe.as_str()) {
        idx += 1;
        while idx < tokens.len() && tokens[idx].starts_with('-') {
            idx += 1;
        }
        return check_sub_command(&tokens[idx..]);
    }

    if exe == "env" {
        idx += 1;
        // `env` additionally skips its own flags and K=V arguments.
        while idx < tokens.len() && (tokens[idx].starts_with('-') || is_assignment(&tokens[idx])) {
            idx += 1;
        }
        return check_sub_command(&tokens[idx..]);
    }

    if FORBIDDEN_EXECUTABLES.contains(&exe.as_str()) {
        return Err(GateError::ForbiddenExecutable(exe));
    }

    if exe == "git" {
        for tok in &tokens[idx + 1..] {
            if tok.starts_with('-') {
                continue;
            }
            if tok == "push" {
                return Err(GateError::GitPush);
            }
            break;
        }
    }

    Ok(())
}

fn is_assignment(token: &str) -> bool {
    match token.find('=') {
        Some(pos) if pos > 0 => {
            let name = &token[..pos];
            name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        }
        _ => false,
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn split_segments(tokens: &[Token]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    for tok in tokens {
        match tok.kind {
            TokenKind::Separator => {
                if !current.is_empty() {
                    segments.push(Segment { tokens: std::mem::take(&mut current) });
                }
            }
            TokenKind::Pipe => current.push("|".to_string()),
            TokenKind::Word => current.push(tok.text.clone()),
        }
    }
    if !current.is_empty() {
        segments.push(Segment { tokens: current });
    }
    segments
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Pipe,
    Separator,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    text: String,
}

/// Quote/escape-aware tokenizer: splits on whitespace and on the chaining
/// operators `;`, `&&`, `||`, `&`, `|`, and newlines, while honoring single
/// quotes, double quotes, and backslash escapes the way a POSIX shell would.
fn tokenize(cmd: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let chars: Vec<char> = cmd.chars().collect();
    let mut i = 0;

    macro_rules! flush_word {
        () => {
            if !word.is_empty() {
                tokens.push(Token { kind: TokenKind::Word, text: std::mem::take(&mut word) });
            }
        };
    }

    while i < chars.len() {
        let c = chars[i];

        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                word.push(c);
            }
            i += 1;
            continue;
        }

        if in_double {
            if c == '\\' && i + 1 < chars.len() && matches!(chars[i + 1], '"' | '\\' | '$') {
                word.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_double = false;
            } else {
                word.push(c);
            }
            i += 1;
            continue;
        }

        match c {
            '\'' => {
                in_single = true;
                i += 1;
            }
            '"' => {
                in_double = true;
                i += 1;
            }
            '\\' if i + 1 < chars.len() => {
                word.push(chars[i + 1]);
                i += 2;
            }
            ' ' | '\t' => {
                flush_word!();
                i += 1;
            }
            '\n' | ';' => {
                flush_word!();
                tokens.push(Token { kind: TokenKind::Separator, text: c.to_string() });
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                flush_word!();
                tokens.push(Token { kind: TokenKind::Separator, text: "&&".to_string() });
                i += 2;
            }
            '&' => {
                flush_word!();
                tokens.push(Token { kind: TokenKind::Separator, text: "&".to_string() });
                i += 1;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                flush_word!();
                tokens.push(Token { kind: TokenKind::Separator, text: "||".to_string() });
                i += 2;
            }
            '|' => {
                flush_word!();
                tokens.push(Token { kind: TokenKind::Pipe, text: "|".to_string() });
                i += 1;
            }
            _ => {
                word.push(c);
                i += 1;
            }
        }
    }
    flush_word!();
    tokens
}
