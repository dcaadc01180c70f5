//! Structural security validation of generated modeling scripts
//!
//! Scripts produced by the AI collaborator are Python source destined
//! for the CAD kernel. Before execution they are tokenized and walked
//! structurally against a fixed policy: an import whitelist, call and
//! attribute deny lists, a nesting-depth cap, a node-count cap and a
//! lambda ban, all under a parse-time budget. Parsed code is never
//! evaluated here.

use std::collections::HashSet;
use std::time::Instant;

use once_cell::sync::Lazy;

/// Script policy errors
#[derive(Debug, thiserror::Error)]
pub enum ScriptPolicyError {
    #[error("Script too large: {0} bytes (max {MAX_SCRIPT_LEN})")]
    ScriptTooLarge(usize),

    #[error("Script validation timed out")]
    ParseTimeout,

    #[error("Security violations: {0:?}")]
    Violations(Vec<String>),
}

/// Maximum accepted script size in bytes
pub const MAX_SCRIPT_LEN: usize = 50_000;

/// Parse-time budget in milliseconds
const MAX_PARSE_MILLIS: u128 = 2_000;

/// Maximum structural nesting depth
const MAX_DEPTH: usize = 100;

/// Maximum number of structural nodes (tokens)
const MAX_NODES: usize = 10_000;

/// Modules a script may import
static ALLOWED_IMPORTS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "FreeCAD", "App", "Part", "PartDesign", "Sketcher", "Draft", "Import", "Mesh", "math",
        "numpy", "Base", "Vector",
    ]
    .into_iter()
    .collect()
});

/// Names that must never be called or referenced
static FORBIDDEN_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "__import__",
        "exec",
        "eval",
        "compile",
        "execfile",
        "open",
        "file",
        "input",
        "raw_input",
        "reload",
        "os",
        "subprocess",
        "sys",
        "importlib",
        "getattr",
        "setattr",
        "delattr",
        "hasattr",
        "globals",
        "locals",
        "vars",
        "dir",
        "__builtins__",
        "help",
        "memoryview",
        "bytearray",
    ]
    .into_iter()
    .collect()
});

/// Dunder attributes that must never be accessed
static FORBIDDEN_DUNDERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "__dict__",
        "__class__",
        "__bases__",
        "__base__",
        "__subclasses__",
        "__import__",
        "__builtins__",
        "__code__",
        "__globals__",
        "__annotations__",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    /// `.name` attribute access
    Attribute(String),
    Keyword(String),
    OpenBracket,
    CloseBracket,
    Other(char),
}

/// Tokenize a Python script, stripping strings and comments. Structure
/// (brackets) is preserved for depth accounting.
fn tokenize(script: &str, deadline: Instant) -> Result<Vec<Token>, ScriptPolicyError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = script.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if Instant::now() >= deadline {
            return Err(ScriptPolicyError::ParseTimeout);
        }

        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                // Triple-quoted or single-line string; contents ignored.
                let quote = c;
                let triple = i + 2 < chars.len() && chars[i + 1] == quote && chars[i + 2] == quote;
                if triple {
                    i += 3;
                    while i + 2 < chars.len()
                        && !(chars[i] == quote && chars[i + 1] == quote && chars[i + 2] == quote)
                    {
                        i += 1;
                    }
                    i = (i + 3).min(chars.len());
                } else {
                    i += 1;
                    while i < chars.len() && chars[i] != quote && chars[i] != '\n' {
                        if chars[i] == '\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                    i = (i + 1).min(chars.len());
                }
            }
            '(' | '[' | '{' => {
                tokens.push(Token::OpenBracket);
                i += 1;
            }
            ')' | ']' | '}' => {
                tokens.push(Token::CloseBracket);
                i += 1;
            }
            '.' => {
                let mut j = i + 1;
                let mut name = String::new();
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                    name.push(chars[j]);
                    j += 1;
                }
                if !name.is_empty() {
                    tokens.push(Token::Attribute(name));
                }
                i = j.max(i + 1);
            }
            _ if c.is_alphabetic() || c == '_' => {
                let mut j = i;
                let mut name = String::new();
                while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                    name.push(chars[j]);
                    j += 1;
                }
                i = j;

                match name.as_str() {
                    "import" | "from" | "lambda" | "as" | "def" | "class" => {
                        tokens.push(Token::Keyword(name))
                    }
                    _ => tokens.push(Token::Identifier(name)),
                }
            }
            _ if c.is_whitespace() => i += 1,
            _ => {
                tokens.push(Token::Other(c));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// Validate a script against the policy. Returns the full violation
/// list on failure; an empty result means the script may be executed.
pub fn validate_script(script: &str) -> Result<(), ScriptPolicyError> {
    if script.len() > MAX_SCRIPT_LEN {
        return Err(ScriptPolicyError::ScriptTooLarge(script.len()));
    }

    let deadline = Instant::now() + std::time::Duration::from_millis(MAX_PARSE_MILLIS as u64);
    let tokens = tokenize(script, deadline)?;

    let mut violations = Vec::new();

    if tokens.len() > MAX_NODES {
        violations.push(format!(
            "script has {} nodes (max {})",
            tokens.len(),
            MAX_NODES
        ));
    }

    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    let mut index = 0;
    // `from X import Y` names imported members, not modules; the module
    // was already validated at the `from` keyword.
    let mut in_from_clause = false;

    while index < tokens.len() {
        match &tokens[index] {
            Token::OpenBracket => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            Token::CloseBracket => depth = depth.saturating_sub(1),
            Token::Keyword(keyword) if keyword == "lambda" => {
                violations.push("lambda expressions are not allowed".to_string());
            }
            Token::Keyword(keyword) if keyword == "import" && in_from_clause => {
                in_from_clause = false;
            }
            Token::Keyword(keyword) if keyword == "import" => {
                // `import X[, Y]` - every module must be whitelisted.
                let mut j = index + 1;
                while j < tokens.len() {
                    match &tokens[j] {
                        Token::Identifier(module) => {
                            if !ALLOWED_IMPORTS.contains(module.as_str()) {
                                violations.push(format!("forbidden import: {}", module));
                            }
                            j += 1;
                            // Skip `as alias` and submodule attributes.
                            while j < tokens.len() {
                                match &tokens[j] {
                                    Token::Attribute(_) => j += 1,
                                    Token::Keyword(kw) if kw == "as" => j += 2,
                                    _ => break,
                                }
                            }
                            if matches!(tokens.get(j), Some(Token::Other(','))) {
                                j += 1;
                                continue;
                            }
                            break;
                        }
                        _ => break,
                    }
                }
            }
            Token::Keyword(keyword) if keyword == "from" => {
                // `from X import ...` - the source module must be
                // whitelisted.
                in_from_clause = true;
                if let Some(Token::Identifier(module)) = tokens.get(index + 1) {
                    if !ALLOWED_IMPORTS.contains(module.as_str()) {
                        violations.push(format!("forbidden import: {}", module));
                    }
                }
            }
            Token::Identifier(name) => {
                if FORBIDDEN_NAMES.contains(name.as_str()) {
                    violations.push(format!("forbidden name: {}", name));
                }
            }
            Token::Attribute(name) => {
                if FORBIDDEN_DUNDERS.contains(name.as_str()) {
                    violations.push(format!("forbidden attribute: {}", name));
                } else if FORBIDDEN_NAMES.contains(name.as_str()) {
                    violations.push(format!("forbidden attribute: {}", name));
                }
            }
            _ => {}
        }
        index += 1;
    }

    if max_depth > MAX_DEPTH {
        violations.push(format!("nesting depth {} exceeds {}", max_depth, MAX_DEPTH));
    }

    if violations.is_empty() {
        Ok(())
    } else {
        log::warn!("Script rejected with {} violations", violations.len());
        Err(ScriptPolicyError::Violations(violations))
    }
}
