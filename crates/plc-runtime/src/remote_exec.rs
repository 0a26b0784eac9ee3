//! `RemoteExec` script evaluation.
//!
//! Scripts are a tiny assignment language, one statement per line:
//!
//! ```text
//! # comment
//! greeting = "state is " + status()
//! log(greeting)
//! returnVal = count + 1
//! ```
//!
//! Expressions are literals (strings, integers, floats, `true`, `false`,
//! `None`), names (script variables and call keyword arguments),
//! `status()`, `digest()` and `+`. The script's result is the final value of
//! `returnVal`.

#![allow(missing_docs)]

use std::fmt;

use indexmap::IndexMap;

use crate::controller::PlcState;

/// Result code of a script that ran to completion.
pub const EXEC_OK: i32 = 0;
/// Result code of a failed script.
pub const EXEC_FAILED: i32 = -1;

const RETURN_NAME: &str = "returnVal";

/// What a script may observe or do.
pub trait ExecContext {
    fn status(&self) -> PlcState;
    fn digest(&self) -> Option<String>;
    fn log(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Run `script` and return `(code, message)` the way `RemoteExec` replies.
pub fn run_script(
    script: &str,
    kwargs: &IndexMap<String, String>,
    context: &dyn ExecContext,
) -> (i32, Option<String>) {
    let mut scope: IndexMap<String, ScriptValue> = kwargs
        .iter()
        .map(|(name, value)| (name.clone(), ScriptValue::Text(value.clone())))
        .collect();
    for (index, raw) in script.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Err(err) = execute_line(line, &mut scope, context) {
            return (
                EXEC_FAILED,
                Some(format!(
                    "RemoteExec script failed!\n\nLine {}: {err}\n\t{line}",
                    index + 1
                )),
            );
        }
    }
    let result = scope
        .get(RETURN_NAME)
        .filter(|value| **value != ScriptValue::None)
        .map(ToString::to_string);
    (EXEC_OK, result)
}

fn execute_line(
    line: &str,
    scope: &mut IndexMap<String, ScriptValue>,
    context: &dyn ExecContext,
) -> Result<(), String> {
    if let Some(argument) = line
        .strip_prefix("log(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let value = evaluate(argument, scope, context)?;
        context.log(&value.to_string());
        return Ok(());
    }
    let Some((target, expression)) = split_assignment(line) else {
        return Err("invalid syntax".to_string());
    };
    let target = target.trim();
    if !is_identifier(target) {
        return Err(format!("cannot assign to '{target}'"));
    }
    let value = evaluate(expression, scope, context)?;
    scope.insert(target.to_string(), value);
    Ok(())
}

/// Split at the first `=` outside a string literal.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let mut quote = None;
    for (pos, ch) in line.char_indices() {
        match (quote, ch) {
            (None, '"' | '\'') => quote = Some(ch),
            (Some(open), _) if ch == open => quote = None,
            (None, '=') => return Some((&line[..pos], &line[pos + 1..])),
            _ => {}
        }
    }
    None
}

/// Split at every `+` outside a string literal.
fn split_terms(expression: &str) -> Result<Vec<&str>, String> {
    let mut terms = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (pos, ch) in expression.char_indices() {
        match (quote, ch) {
            (None, '"' | '\'') => quote = Some(ch),
            (Some(open), _) if ch == open => quote = None,
            (None, '+') => {
                terms.push(&expression[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    terms.push(&expression[start..]);
    Ok(terms)
}

fn evaluate(
    expression: &str,
    scope: &IndexMap<String, ScriptValue>,
    context: &dyn ExecContext,
) -> Result<ScriptValue, String> {
    let mut terms = split_terms(expression)?.into_iter();
    let first = terms.next().unwrap_or_default();
    let mut value = term(first, scope, context)?;
    for next in terms {
        value = add(value, term(next, scope, context)?)?;
    }
    Ok(value)
}

fn term(
    text: &str,
    scope: &IndexMap<String, ScriptValue>,
    context: &dyn ExecContext,
) -> Result<ScriptValue, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("invalid syntax".to_string());
    }
    if let Some(literal) = string_literal(text) {
        return Ok(ScriptValue::Text(literal.to_string()));
    }
    match text {
        "True" | "true" => return Ok(ScriptValue::Bool(true)),
        "False" | "false" => return Ok(ScriptValue::Bool(false)),
        "None" => return Ok(ScriptValue::None),
        "status()" => return Ok(ScriptValue::Text(context.status().name().to_string())),
        "digest()" => {
            return Ok(context
                .digest()
                .map_or(ScriptValue::None, ScriptValue::Text))
        }
        _ => {}
    }
    if let Ok(value) = text.parse::<i64>() {
        return Ok(ScriptValue::Int(value));
    }
    if let Ok(value) = text.parse::<f64>() {
        return Ok(ScriptValue::Float(value));
    }
    if is_identifier(text) {
        return scope
            .get(text)
            .cloned()
            .ok_or_else(|| format!("name '{text}' is not defined"));
    }
    if text.ends_with(')') {
        let name = text.split('(').next().unwrap_or(text);
        return Err(format!("unknown function '{name}'"));
    }
    Err("invalid syntax".to_string())
}

fn string_literal(text: &str) -> Option<&str> {
    let quote = text.chars().next().filter(|ch| matches!(ch, '"' | '\''))?;
    let inner = text.strip_prefix(quote)?.strip_suffix(quote)?;
    (!inner.contains(quote)).then_some(inner)
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[allow(clippy::cast_precision_loss)]
fn add(left: ScriptValue, right: ScriptValue) -> Result<ScriptValue, String> {
    use ScriptValue::{Float, Int, Text};
    match (left, right) {
        (Int(a), Int(b)) => a
            .checked_add(b)
            .map(Int)
            .ok_or_else(|| "integer overflow".to_string()),
        (Int(a), Float(b)) => Ok(Float(a as f64 + b)),
        (Float(a), Int(b)) => Ok(Float(a + b as f64)),
        (Float(a), Float(b)) => Ok(Float(a + b)),
        (Text(a), other) => Ok(Text(format!("{a}{other}"))),
        (other, Text(b)) => Ok(Text(format!("{other}{b}"))),
        (a, b) => Err(format!("unsupported operand types for +: {a:?} and {b:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        logs: RefCell<Vec<String>>,
    }

    impl ExecContext for Recorder {
        fn status(&self) -> PlcState {
            PlcState::Stopped
        }
        fn digest(&self) -> Option<String> {
            Some("abc".into())
        }
        fn log(&self, message: &str) {
            self.logs.borrow_mut().push(message.to_string());
        }
    }

    fn kwargs(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn returns_return_val() {
        let ctx = Recorder::default();
        let script = "# greet\nmsg = \"hi \" + who\nreturnVal = msg + \" \" + status()\n";
        let (code, value) = run_script(script, &kwargs(&[("who", "bob")]), &ctx);
        assert_eq!(code, EXEC_OK);
        assert_eq!(value.as_deref(), Some("hi bob Stopped"));
    }

    #[test]
    fn without_return_val_result_is_none() {
        let ctx = Recorder::default();
        let (code, value) = run_script("x = 1 + 2\nlog(x)\nlog(digest())", &IndexMap::new(), &ctx);
        assert_eq!(code, EXEC_OK);
        assert_eq!(value, None);
        assert_eq!(*ctx.logs.borrow(), vec!["3".to_string(), "abc".to_string()]);
    }

    #[test]
    fn failure_reports_line_and_source() {
        let ctx = Recorder::default();
        let (code, value) = run_script("a = 1\n\nb = missing + 1\n", &IndexMap::new(), &ctx);
        assert_eq!(code, EXEC_FAILED);
        assert_eq!(
            value.unwrap(),
            "RemoteExec script failed!\n\nLine 3: name 'missing' is not defined\n\tb = missing + 1"
        );
    }

    #[test]
    fn plus_inside_strings_is_literal() {
        let ctx = Recorder::default();
        let (_, value) = run_script("returnVal = 'a+b' + \"=c\"", &IndexMap::new(), &ctx);
        assert_eq!(value.as_deref(), Some("a+b=c"));
    }

    #[test]
    fn rejects_unknown_functions() {
        let ctx = Recorder::default();
        let (code, value) = run_script("import os", &IndexMap::new(), &ctx);
        assert_eq!(code, EXEC_FAILED);
        assert!(value.unwrap().contains("invalid syntax"));
        let (code, _) = run_script("x = open('f')", &IndexMap::new(), &ctx);
        assert_eq!(code, EXEC_FAILED);
    }
}
