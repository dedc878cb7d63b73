//! Static validation of untrusted scripts before any execution.
//!
//! Three layers, all run without executing a single script instruction:
//! a real syntax check (the source is compiled to a function, never
//! called), a token-level pass for disallowed and undeclared globals, and
//! heuristics that produce warnings for code that will likely trip a
//! resource limit at runtime.

mod scan;

use crate::diagnostics::{Span, ValidationError, ValidationResult};
use mlua::{Lua, StdLib};
use regex::Regex;
use scan::{scan, Token, STRING_TOKEN};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Globals the sandbox actually provides. Anything else is either blocked
/// or undeclared.
const ALLOWED_GLOBALS: &[&str] = &[
    "search", "json", "string", "table", "math", "pairs", "ipairs", "next", "select", "type",
    "tostring", "tonumber", "error", "assert", "pcall", "xpcall",
];

const KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Names that are never available inside the sandbox, with a hint for each.
const BLOCKED_GLOBALS: &[(&str, &str)] = &[
    ("io", "File access is not available; query stored data with search(collection, text, limit)."),
    ("os", "System access is not available inside scripts."),
    ("debug", "The debug library is not available inside scripts."),
    ("coroutine", "Coroutines are not available inside scripts."),
    ("package", "Module loading is not available; scripts are self-contained."),
    ("require", "Module loading is not available; scripts are self-contained."),
    ("load", "Dynamic code loading is not available inside scripts."),
    ("loadstring", "Dynamic code loading is not available inside scripts."),
    ("loadfile", "File access is not available inside scripts."),
    ("dofile", "File access is not available inside scripts."),
    ("collectgarbage", "Garbage collection control is not available inside scripts."),
    ("rawget", "Raw table access is not available inside scripts."),
    ("rawset", "Raw table access is not available inside scripts."),
    ("rawequal", "Raw table access is not available inside scripts."),
    ("rawlen", "Raw table access is not available inside scripts."),
    ("setmetatable", "Metatable manipulation is not available inside scripts."),
    ("getmetatable", "Metatable manipulation is not available inside scripts."),
    ("print", "Scripts cannot print; return a value instead."),
    ("getfenv", "Environment manipulation is not available inside scripts."),
    ("setfenv", "Environment manipulation is not available inside scripts."),
];

pub struct Validator {
    strict_loops: bool,
}

impl Validator {
    pub fn new(strict_loops: bool) -> Self {
        Self { strict_loops }
    }

    /// Validates `source` and returns every problem found, never just the
    /// first one, so a caller can fix a whole batch per round trip. The
    /// only exception is a syntax error: token-level checks on code that
    /// does not parse produce noise, so syntax failures return alone.
    pub fn validate(&self, source: &str) -> ValidationResult {
        if source.trim().is_empty() {
            return ValidationResult::new(Vec::new(), vec![ValidationError::missing_return()]);
        }

        if let Some(err) = check_syntax(source) {
            return ValidationResult::new(vec![err], Vec::new());
        }

        let tokens = scan(source);
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        check_globals(&tokens, &mut errors);
        check_unbounded_loops(&tokens, &mut warnings);

        if !tokens.iter().any(|t| t.text == "return") {
            warnings.push(ValidationError::missing_return());
        }

        if self.strict_loops {
            // Loop warnings become hard failures
            for w in warnings.drain(..).collect::<Vec<_>>() {
                if matches!(w.kind, crate::diagnostics::ValidationKind::UnboundedLoopHeuristic) {
                    errors.push(w);
                } else {
                    warnings.push(w);
                }
            }
        }

        ValidationResult::new(errors, warnings)
    }
}

// ── syntax ──────────────────────────────────────────────────────────────

/// Compiles the source into a function without calling it. A throwaway VM
/// keeps parser state away from any execution VM.
fn check_syntax(source: &str) -> Option<ValidationError> {
    let lua = match Lua::new_with(StdLib::NONE, mlua::LuaOptions::default()) {
        Ok(lua) => lua,
        Err(e) => {
            return Some(ValidationError::syntax(
                format!("validator could not be initialized: {e}"),
                None,
                "Retry the request.".to_string(),
            ))
        }
    };

    // Drop the compiled function immediately; only the compile result
    // matters, and it must not outlive the VM
    let compiled = lua.load(source).set_name("script").into_function().map(|_| ());
    match compiled {
        Ok(()) => None,
        Err(mlua::Error::SyntaxError { message, .. }) => {
            let line = extract_line(&message);
            let suggestion = suggest_syntax_fix(&message);
            Some(ValidationError::syntax(strip_chunk_prefix(&message), line, suggestion))
        }
        Err(e) => Some(ValidationError::syntax(
            e.to_string(),
            None,
            "Check Lua syntax near the reported line.".to_string(),
        )),
    }
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":(\d+):").unwrap())
}

fn extract_line(message: &str) -> Option<usize> {
    line_regex()
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Drops the `[string "script"]:N:` prefix Lua puts on parser messages.
fn strip_chunk_prefix(message: &str) -> String {
    match message.rfind("]:") {
        Some(idx) => {
            let rest = &message[idx + 2..];
            match rest.find(": ") {
                Some(colon) => rest[colon + 2..].to_string(),
                None => rest.to_string(),
            }
        }
        None => message.to_string(),
    }
}

/// Maps common parser messages to an actionable hint.
fn suggest_syntax_fix(message: &str) -> String {
    if message.contains("'end' expected") {
        "Add a matching 'end' for each 'if', 'for', 'while', and 'function' block.".to_string()
    } else if message.contains("'then' expected") {
        "Follow the 'if' condition with 'then'.".to_string()
    } else if message.contains("'do' expected") {
        "Follow the 'for' or 'while' header with 'do'.".to_string()
    } else if message.contains("unfinished string") {
        "Close the string literal with a matching quote.".to_string()
    } else if message.contains("unexpected symbol near '='") {
        "Use '==' for comparison; a single '=' is assignment only.".to_string()
    } else if message.contains("')' expected") || message.contains("unexpected symbol near ')'") {
        "Check for unbalanced parentheses.".to_string()
    } else if message.contains("unexpected symbol near <eof>") || message.contains("near <eof>") {
        "The script ends mid-statement; complete the last statement.".to_string()
    } else {
        "Check Lua syntax near the reported line.".to_string()
    }
}

// ── globals ─────────────────────────────────────────────────────────────

/// Collects declared names, then flags blocked and undeclared globals.
///
/// Scope tracking is deliberately flat and permissive: a name declared
/// anywhere in the script counts everywhere. That trades a few missed
/// out-of-scope uses (which fail at runtime as nil errors) for zero false
/// positives on valid code.
fn check_globals(tokens: &[Token], errors: &mut Vec<ValidationError>) {
    let blocked: std::collections::HashMap<&str, &str> = BLOCKED_GLOBALS.iter().copied().collect();
    let allowed: HashSet<&str> = ALLOWED_GLOBALS.iter().copied().collect();
    let keywords: HashSet<&str> = KEYWORDS.iter().copied().collect();

    let declared = collect_declarations(tokens, &keywords);

    let mut reported: HashSet<&str> = HashSet::new();
    for (i, token) in tokens.iter().enumerate() {
        if !is_identifier(&token.text) || keywords.contains(token.text.as_str()) {
            continue;
        }
        // Field access, method call, labels, and goto targets are not
        // global reads
        if let Some(prev) = i.checked_sub(1).map(|p| tokens[p].text.as_str()) {
            if matches!(prev, "." | ":" | "::" | "goto") {
                continue;
            }
        }
        let name = token.text.as_str();
        if declared.contains(name) || reported.contains(name) {
            continue;
        }
        let span = Span {
            line: token.line,
            col: token.col,
        };
        if let Some(hint) = blocked.get(name) {
            errors.push(ValidationError::disallowed(name, span, *hint));
            reported.insert(name);
        } else if !allowed.contains(name) {
            let did_you_mean = closest_name(name, &allowed, &declared);
            errors.push(ValidationError::undeclared_global(name, span, did_you_mean.as_deref()));
            reported.insert(name);
        }
    }
}

/// Names introduced by `local`, `for`, function names/parameters, and
/// top-level assignment.
fn collect_declarations<'a>(
    tokens: &'a [Token],
    keywords: &HashSet<&str>,
) -> HashSet<&'a str> {
    let mut declared: HashSet<&str> = HashSet::new();
    let ident_at = |i: usize| -> Option<&str> {
        tokens.get(i).map(|t| t.text.as_str()).filter(|text| {
            is_identifier(text) && !keywords.contains(text)
        })
    };

    for (i, token) in tokens.iter().enumerate() {
        match token.text.as_str() {
            "local" => {
                if tokens.get(i + 1).map(|t| t.text.as_str()) == Some("function") {
                    if let Some(name) = ident_at(i + 2) {
                        declared.insert(name);
                    }
                    continue;
                }
                let mut j = i + 1;
                while let Some(name) = ident_at(j) {
                    declared.insert(name);
                    if tokens.get(j + 1).map(|t| t.text.as_str()) == Some(",") {
                        j += 2;
                    } else {
                        break;
                    }
                }
            }
            "for" => {
                let mut j = i + 1;
                while let Some(name) = ident_at(j) {
                    declared.insert(name);
                    if tokens.get(j + 1).map(|t| t.text.as_str()) == Some(",") {
                        j += 2;
                    } else {
                        break;
                    }
                }
            }
            "function" => {
                let mut j = i + 1;
                if let Some(name) = ident_at(j) {
                    declared.insert(name);
                    j += 1;
                    // Skip a dotted/method name; the base is the declaration
                    while matches!(tokens.get(j).map(|t| t.text.as_str()), Some(".") | Some(":")) {
                        j += 2;
                    }
                }
                if tokens.get(j).map(|t| t.text.as_str()) == Some("(") {
                    j += 1;
                    while let Some(t) = tokens.get(j) {
                        match t.text.as_str() {
                            ")" => break,
                            "," | "..." => {}
                            text if is_identifier(text) && !keywords.contains(text) => {
                                declared.insert(&t.text);
                            }
                            _ => break,
                        }
                        j += 1;
                    }
                }
            }
            text if is_identifier(text) && !keywords.contains(text) => {
                // `name =` (not `==`) with no field prefix writes a global
                let prev = i.checked_sub(1).map(|p| tokens[p].text.as_str());
                let next = tokens.get(i + 1).map(|t| t.text.as_str());
                if next == Some("=") && !matches!(prev, Some(".") | Some(":") | Some("[")) {
                    declared.insert(text);
                }
            }
            _ => {}
        }
    }
    declared
}

fn is_identifier(text: &str) -> bool {
    text != STRING_TOKEN
        && text
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Nearest known name within edit distance 2, for did-you-mean hints.
fn closest_name(name: &str, allowed: &HashSet<&str>, declared: &HashSet<&str>) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for candidate in allowed.iter().chain(declared.iter()) {
        let d = levenshtein(name, candidate);
        if d > 0 && d <= 2 {
            match best {
                Some((bd, bc)) if (d, *candidate) >= (bd, bc) => {}
                _ => best = Some((d, *candidate)),
            }
        }
    }
    best.map(|(_, c)| c.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { prev } else { prev + 1 };
            prev = row[j + 1];
            row[j + 1] = cost.min(row[j] + 1).min(prev + 1);
        }
    }
    row[b.len()]
}

// ── loop heuristics ─────────────────────────────────────────────────────

const BLOCK_OPENERS: &[&str] = &["do", "function", "if", "repeat"];

/// Flags `while true do` and `repeat ... until false` loops whose body
/// contains neither `break` nor `return`. The scan is purely syntactic, so
/// this stays a warning: the loop may still be bounded by error() or a
/// host call failure.
fn check_unbounded_loops(tokens: &[Token], warnings: &mut Vec<ValidationError>) {
    for (i, token) in tokens.iter().enumerate() {
        let span = Span {
            line: token.line,
            col: token.col,
        };
        match token.text.as_str() {
            "while"
                if tokens.get(i + 1).map(|t| t.text.as_str()) == Some("true")
                    && tokens.get(i + 2).map(|t| t.text.as_str()) == Some("do") =>
            {
                if !body_has_exit(tokens, i + 2) {
                    warnings.push(ValidationError::unbounded_loop(span));
                }
            }
            "repeat" => {
                if let Some((until_idx, has_exit)) = repeat_body(tokens, i) {
                    let always = tokens.get(until_idx + 1).map(|t| t.text.as_str()) == Some("false");
                    if always && !has_exit {
                        warnings.push(ValidationError::unbounded_loop(span));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Walks the block opened at `opener_idx` and reports whether `break` or
/// `return` appears anywhere inside it.
fn body_has_exit(tokens: &[Token], opener_idx: usize) -> bool {
    let mut depth = 0usize;
    for token in &tokens[opener_idx..] {
        match token.text.as_str() {
            t if BLOCK_OPENERS.contains(&t) => depth += 1,
            "end" | "until" => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return false;
                }
            }
            "break" | "return" => return true,
            _ => {}
        }
    }
    false
}

/// Finds the `until` matching the `repeat` at `repeat_idx` and whether the
/// body can exit early.
fn repeat_body(tokens: &[Token], repeat_idx: usize) -> Option<(usize, bool)> {
    let mut depth = 0usize;
    let mut has_exit = false;
    for (offset, token) in tokens[repeat_idx..].iter().enumerate() {
        match token.text.as_str() {
            t if BLOCK_OPENERS.contains(&t) => depth += 1,
            "end" => depth = depth.saturating_sub(1),
            "until" => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some((repeat_idx + offset, has_exit));
                }
            }
            "break" => has_exit = true,
            "return" if depth == 1 => has_exit = true,
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ValidationKind;

    fn validate(source: &str) -> ValidationResult {
        Validator::new(false).validate(source)
    }

    #[test]
    fn test_valid_script_passes() {
        let result = validate(
            r#"
            local hits = search("memories", "coding preferences", 5)
            local out = {}
            for i, hit in ipairs(hits) do
                out[i] = hit.content
            end
            return json.encode(out)
            "#,
        );
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_syntax_error_reports_line_and_suggestion() {
        let result = validate("local x = 1\nif x  return x end");
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        let err = &result.errors[0];
        assert_eq!(err.kind, ValidationKind::SyntaxError);
        assert_eq!(err.location.as_ref().map(|s| s.line), Some(2));
        assert!(!err.suggestion.is_empty());
    }

    #[test]
    fn test_blocked_global_flagged() {
        let result = validate("return io.open('/etc/passwd')");
        assert!(!result.valid);
        assert_eq!(result.errors[0].kind, ValidationKind::DisallowedConstruct);
        assert!(result.errors[0].message.contains("io"));
    }

    #[test]
    fn test_blocked_name_in_string_not_flagged() {
        let result = validate("return search('memories', 'io.open and os.date', 3)");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_blocked_name_in_comment_not_flagged() {
        let result = validate("-- os.execute would be bad\nreturn 1");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_field_named_like_blocked_global_ok() {
        let result = validate("local t = {}\nt.io = 1\nreturn t.io");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_undeclared_global_with_did_you_mean() {
        let result = validate("return serch('memories', 'x', 1)");
        assert!(!result.valid);
        let err = &result.errors[0];
        assert_eq!(err.kind, ValidationKind::UndeclaredGlobal);
        assert!(err.suggestion.contains("search"), "{}", err.suggestion);
    }

    #[test]
    fn test_xpcall_permitted() {
        let result = validate(
            "local ok, v = xpcall(function() error('x') end, tostring)\nreturn v",
        );
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_local_declarations_tracked() {
        let result = validate(
            "local a, b = 1, 2\nlocal function helper(x) return x + a end\nreturn helper(b)",
        );
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_global_assignment_declares() {
        let result = validate("total = 0\nfor i = 1, 10 do total = total + i end\nreturn total");
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_all_errors_reported_together() {
        let result = validate("print(undeclared_one)\nreturn undeclared_two");
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 3);
    }

    #[test]
    fn test_unbounded_while_warns() {
        let result = validate("while true do local x = 1 end");
        assert!(result.valid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.kind == ValidationKind::UnboundedLoopHeuristic));
    }

    #[test]
    fn test_while_true_with_break_no_warning() {
        let result = validate("local n = 0\nwhile true do n = n + 1 if n > 3 then break end end\nreturn n");
        assert!(result.valid, "{:?}", result.errors);
        assert!(!result
            .warnings
            .iter()
            .any(|w| w.kind == ValidationKind::UnboundedLoopHeuristic));
    }

    #[test]
    fn test_repeat_until_false_warns() {
        let result = validate("repeat local x = 1 until false");
        assert!(result
            .warnings
            .iter()
            .any(|w| w.kind == ValidationKind::UnboundedLoopHeuristic));
    }

    #[test]
    fn test_missing_return_warns() {
        let result = validate("local x = 1");
        assert!(result.valid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.kind == ValidationKind::MissingReturn));
    }

    #[test]
    fn test_empty_script_valid_with_warning() {
        let result = validate("   \n  ");
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_strict_loops_escalates() {
        let result = Validator::new(true).validate("while true do local x = 1 end");
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| e.kind == ValidationKind::UnboundedLoopHeuristic));
    }
}
