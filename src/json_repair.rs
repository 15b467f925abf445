//! C1 — JSON repairer.
//!
//! Single-pass stack scanner that closes open strings/objects/arrays/literals
//! left dangling by a truncated or lightly malformed model response
//! (spec.md §4.1). Never panics; `repair()` returns `None` on the first
//! unexpected character in a value-expecting position, and the caller treats
//! the enclosing block as opaque text.

/// States of the repair state machine. The stack's top entry is always the
/// active state; container states (`ObjectX`/`ArrayX`) get pushed/popped as
/// their brackets nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Root,
    Finish,
    InsideString,
    InsideStringEscape,
    InsideNumber,
    InsideLiteral,
    ObjectStart,
    ObjectAfterKey,
    ObjectBeforeValue,
    ObjectAfterValue,
    ObjectAfterComma,
    ArrayStart,
    ArrayAfterValue,
    ArrayAfterComma,
}

/// Attempt to repair `raw` into valid JSON text. Returns `None` if the input
/// cannot be salvaged (an unexpected character appeared where a value was
/// expected). The returned string, if any, always parses with
/// `serde_json::from_str`.
pub fn repair(raw: &str) -> Option<String> {
    // Stage 1: strip a leading/trailing markdown code fence.
    let stripped = strip_code_fence(raw);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Stage 2: fast path — already valid JSON.
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }

    // Stage 3: strip trailing commas before `}` / `]`, retry.
    let no_trailing_commas = strip_trailing_commas(trimmed);
    if serde_json::from_str::<serde_json::Value>(&no_trailing_commas).is_ok() {
        return Some(no_trailing_commas);
    }

    // Stage 4: state-machine repair.
    state_machine_repair(&no_trailing_commas)
}

fn strip_code_fence(raw: &str) -> &str {
    let s = raw.trim();
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    let s = s.strip_suffix("```").unwrap_or(s);
    s
}

fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    let mut escape = false;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == ',' {
            // Look ahead past whitespace for a closing bracket.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue; // drop the comma
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

fn is_literal_start(c: char) -> bool {
    c == 't' || c == 'f' || c == 'n'
}

fn state_machine_repair(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len() + 8);
    let mut stack: Vec<State> = vec![State::Root];
    let mut literal_buf = String::new();
    let mut number_buf = String::new();

    for c in s.chars() {
        let state = *stack.last().unwrap();
        match state {
            State::Root => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                match c {
                    '{' => {
                        stack.pop();
                        stack.push(State::Finish);
                        stack.push(State::ObjectStart);
                        out.push(c);
                    }
                    '[' => {
                        stack.pop();
                        stack.push(State::Finish);
                        stack.push(State::ArrayStart);
                        out.push(c);
                    }
                    '"' => {
                        stack.pop();
                        stack.push(State::Finish);
                        stack.push(State::InsideString);
                        out.push(c);
                    }
                    '-' | '0'..='9' => {
                        stack.pop();
                        stack.push(State::Finish);
                        stack.push(State::InsideNumber);
                        number_buf.clear();
                        number_buf.push(c);
                        out.push(c);
                    }
                    c if is_literal_start(c) => {
                        stack.pop();
                        stack.push(State::Finish);
                        stack.push(State::InsideLiteral);
                        literal_buf.clear();
                        literal_buf.push(c);
                    }
                    _ => return None,
                }
            }
            State::Finish => {
                // Extra content past a valid root value is dropped.
                break;
            }
            State::InsideString => match c {
                '\\' => {
                    stack.push(State::InsideStringEscape);
                    out.push(c);
                }
                '"' => {
                    stack.pop();
                    out.push(c);
                }
                _ => out.push(c),
            },
            State::InsideStringEscape => {
                out.push(c);
                stack.pop();
            }
            State::InsideNumber => {
                if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '+' || c == '-' {
                    number_buf.push(c);
                    out.push(c);
                } else {
                    pop_finished_value(&mut stack);
                    // Re-dispatch this char against the resumed state.
                    if !dispatch_after_value(&mut stack, &mut out, c) {
                        return None;
                    }
                }
            }
            State::InsideLiteral => {
                literal_buf.push(c);
                let candidates = ["true", "false", "null"];
                if candidates.iter().any(|lit| lit == &literal_buf) {
                    out.push_str(&literal_buf);
                    literal_buf.clear();
                    pop_finished_value(&mut stack);
                } else if !candidates.iter().any(|lit| lit.starts_with(&literal_buf)) {
                    return None;
                }
                // else: still a valid partial prefix, keep accumulating.
            }
            State::ObjectStart => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                if c == '}' {
                    stack.pop();
                    out.push(c);
                    pop_finished_value(&mut stack);
                    continue;
                }
                if c == '"' {
                    stack.pop();
                    stack.push(State::ObjectAfterKey);
                    stack.push(State::InsideString);
                    out.push(c);
                    continue;
                }
                return None;
            }
            State::ObjectAfterKey => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                if c == ':' {
                    stack.pop();
                    stack.push(State::ObjectBeforeValue);
                    out.push(c);
                    continue;
                }
                return None;
            }
            State::ObjectBeforeValue => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                stack.pop();
                stack.push(State::ObjectAfterValue);
                if !push_value_start(&mut stack, &mut out, c, &mut number_buf, &mut literal_buf) {
                    return None;
                }
            }
            State::ObjectAfterValue => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                if c == ',' {
                    stack.pop();
                    stack.push(State::ObjectAfterComma);
                    out.push(c);
                    continue;
                }
                if c == '}' {
                    stack.pop();
                    out.push(c);
                    pop_finished_value(&mut stack);
                    continue;
                }
                return None;
            }
            State::ObjectAfterComma => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                if c == '"' {
                    stack.pop();
                    stack.push(State::ObjectAfterKey);
                    stack.push(State::InsideString);
                    out.push(c);
                    continue;
                }
                // Trailing comma inside object already stripped in stage 3;
                // if we still land here, treat a close brace as "drop comma".
                if c == '}' {
                    stack.pop();
                    out.push(c);
                    pop_finished_value(&mut stack);
                    continue;
                }
                return None;
            }
            State::ArrayStart => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                if c == ']' {
                    stack.pop();
                    out.push(c);
                    pop_finished_value(&mut stack);
                    continue;
                }
                stack.pop();
                stack.push(State::ArrayAfterValue);
                if !push_value_start(&mut stack, &mut out, c, &mut number_buf, &mut literal_buf) {
                    return None;
                }
            }
            State::ArrayAfterValue => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                if c == ',' {
                    stack.pop();
                    stack.push(State::ArrayAfterComma);
                    out.push(c);
                    continue;
                }
                if c == ']' {
                    stack.pop();
                    out.push(c);
                    pop_finished_value(&mut stack);
                    continue;
                }
                return None;
            }
            State::ArrayAfterComma => {
                if c.is_whitespace() {
                    out.push(c);
                    continue;
                }
                if c == ']' {
                    // Trailing comma in array -> null]
                    out.push_str("null");
                    stack.pop();
                    out.push(c);
                    pop_finished_value(&mut stack);
                    continue;
                }
                stack.pop();
                stack.push(State::ArrayAfterValue);
                if !push_value_start(&mut stack, &mut out, c, &mut number_buf, &mut literal_buf) {
                    return None;
                }
            }
        }
    }

    // End of input: close everything still open.
    close_open_states(&mut stack, &mut out, &literal_buf);

    let result = out;
    if serde_json::from_str::<serde_json::Value>(&result).is_ok() {
        Some(result)
    } else {
        None
    }
}

/// When a number or literal value completes because a terminator character
/// arrived, pop its state (and the number/literal wrapper) so the next
/// dispatch sees the containing object/array state.
fn pop_finished_value(stack: &mut Vec<State>) {
    if matches!(stack.last(), Some(State::InsideNumber) | Some(State::InsideLiteral)) {
        stack.pop();
    }
}

/// After a number finishes on a non-digit terminator, re-dispatch that
/// terminator against the now-exposed container state (object/array/root).
fn dispatch_after_value(stack: &mut Vec<State>, out: &mut String, c: char) -> bool {
    match stack.last().copied() {
        Some(State::ObjectAfterValue) => match c {
            _ if c.is_whitespace() => {
                out.push(c);
                true
            }
            ',' => {
                stack.pop();
                stack.push(State::ObjectAfterComma);
                out.push(c);
                true
            }
            '}' => {
                stack.pop();
                out.push(c);
                pop_finished_value(stack);
                true
            }
            _ => false,
        },
        Some(State::ArrayAfterValue) => match c {
            _ if c.is_whitespace() => {
                out.push(c);
                true
            }
            ',' => {
                stack.pop();
                stack.push(State::ArrayAfterComma);
                out.push(c);
                true
            }
            ']' => {
                stack.pop();
                out.push(c);
                pop_finished_value(stack);
                true
            }
            _ => false,
        },
        Some(State::Finish) => {
            // A root-level number finished; any further non-whitespace content
            // is dropped (extra content past a valid root value).
            true
        }
        _ => false,
    }
}

/// Begin scanning a new value at the current position; pushes the
/// appropriate inner state onto the stack.
fn push_value_start(
    stack: &mut Vec<State>,
    out: &mut String,
    c: char,
    number_buf: &mut String,
    literal_buf: &mut String,
) -> bool {
    match c {
        '{' => {
            stack.push(State::ObjectStart);
            out.push(c);
            true
        }
        '[' => {
            stack.push(State::ArrayStart);
            out.push(c);
            true
        }
        '"' => {
            stack.push(State::InsideString);
            out.push(c);
            true
        }
        '-' | '0'..='9' => {
            stack.push(State::InsideNumber);
            number_buf.clear();
            number_buf.push(c);
            out.push(c);
            true
        }
        c if is_literal_start(c) => {
            stack.push(State::InsideLiteral);
            literal_buf.clear();
            literal_buf.push(c);
            true
        }
        _ => false,
    }
}

/// Close every open state left on the stack at end-of-input, per spec.md's
/// closing rules.
fn close_open_states(stack: &mut Vec<State>, out: &mut String, literal_buf: &str) {
    while let Some(state) = stack.pop() {
        match state {
            State::Root | State::Finish => {}
            State::InsideString => out.push('"'),
            State::InsideStringEscape => out.push('"'),
            State::InsideNumber => {
                // Drop a dangling trailing '.' / exponent punctuation.
                while out.ends_with('.')
                    || out.ends_with('e')
                    || out.ends_with('E')
                    || out.ends_with('+')
                    || out.ends_with('-')
                {
                    out.pop();
                }
            }
            State::InsideLiteral => {
                let completed = ["true", "false", "null"]
                    .into_iter()
                    .find(|lit| lit.starts_with(literal_buf));
                if let Some(lit) = completed {
                    out.push_str(lit);
                }
            }
            State::ObjectStart => out.push('}'),
            State::ObjectAfterKey => {
                // Key without colon or value.
                out.push_str(": null}");
            }
            State::ObjectBeforeValue => out.push_str("null}"),
            State::ObjectAfterValue => out.push('}'),
            State::ObjectAfterComma => {
                // Trailing comma with nothing after it: drop it.
                while out.ends_with(',') || out.ends_with(|c: char| c.is_whitespace()) {
                    out.pop();
                }
                out.push('}');
            }
            State::ArrayStart => out.push(']'),
            State::ArrayAfterValue => out.push(']'),
            State::ArrayAfterComma => {
                out.push_str("null]");
            }
        }
    }
}
