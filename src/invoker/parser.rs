//! Layered parsing of raw model output
//!
//! The inference service returns free text that may be clean JSON, JSON
//! wrapped in prose or markdown fences, or truncated mid-payload. Three
//! ordered strategies: strict parse, balanced-bracket extraction, repair.
//! Always returns a tagged outcome, never panics.

use serde_json::Value;

#[derive(Debug)]
pub enum ParseOutcome {
    Parsed(Value),
    PartiallyParsed(Value, Vec<String>),
    Failed(String),
}

/// Run the strategies in order and return the first success.
pub fn parse_response(raw: &str) -> ParseOutcome {
    // Strategy 1: strict parse after stripping markdown fences.
    let cleaned = strip_fences(raw);
    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return ParseOutcome::Parsed(value);
    }

    // Strategy 2: extract a balanced JSON payload embedded in prose.
    if let Some(value) = extract_embedded(raw) {
        return ParseOutcome::Parsed(value);
    }

    // Strategy 3: best-effort repair of truncation defects.
    if let Some((value, notes)) = repair(raw) {
        return ParseOutcome::PartiallyParsed(value, notes);
    }

    ParseOutcome::Failed(format!(
        "no strategy produced valid JSON (response length {})",
        raw.len()
    ))
}

/// Strip a surrounding ```json ... ``` fence, if present.
fn strip_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Scan for the first balanced `{...}` or `[...]` that parses as JSON.
/// String contents and escapes are respected, so braces inside prose
/// quotes do not confuse the scanner.
fn extract_embedded(raw: &str) -> Option<Value> {
    let bytes = raw.as_bytes();
    let mut start = 0;

    while let Some(offset) = raw[start..].find(['{', '[']) {
        let open = start + offset;
        if let Some(end) = find_balanced_end(bytes, open) {
            let candidate = &raw[open..=end];
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                // A bare scalar would also parse; only accept containers.
                if value.is_object() || value.is_array() {
                    return Some(value);
                }
            }
        }
        start = open + 1;
    }
    None
}

/// Index of the byte closing the bracket opened at `open`, or None when
/// the text ends before it balances.
fn find_balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Repair common truncation/escaping defects: unterminated strings,
/// unbalanced brackets, trailing commas. Returns the repaired value and
/// notes describing every fix applied.
fn repair(raw: &str) -> Option<(Value, Vec<String>)> {
    let cleaned = strip_fences(raw);
    let open = cleaned.find(['{', '['])?;
    let fragment = &cleaned[open..];

    let mut out = String::with_capacity(fragment.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in fragment.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                stack.pop();
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    let mut notes = Vec::new();

    if in_string {
        // A trailing backslash would escape our closing quote.
        if escaped {
            out.pop();
        }
        out.push('"');
        notes.push("closed unterminated string".to_string());
    }

    // Drop a dangling comma or colon left by mid-element truncation.
    loop {
        let trimmed = out.trim_end();
        match trimmed.chars().last() {
            Some(',') | Some(':') => {
                let cut = trimmed.len() - 1;
                out.truncate(cut);
                notes.push("removed dangling separator".to_string());
            }
            _ => break,
        }
    }

    if !stack.is_empty() {
        notes.push(format!("closed {} unbalanced bracket(s)", stack.len()));
        while let Some(close) = stack.pop() {
            out.push(close);
        }
    }

    if notes.is_empty() {
        // Nothing was repaired, so this would just repeat strategy 1/2.
        return None;
    }

    serde_json::from_str::<Value>(&out)
        .ok()
        .map(|value| (value, notes))
}
