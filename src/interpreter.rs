// src/interpreter.rs
use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::model::{Code, Lang, PlaceholderLabel, PlaceholderValues};

/// Words user code may not mention as a standalone identifier.
pub const FORBIDDEN_WORDS: [&str; 17] = [
    "os",
    "sys",
    "subprocess",
    "shutil",
    "socket",
    "requests",
    "urllib",
    "ctypes",
    "multiprocessing",
    "threading",
    "eval",
    "exec",
    "open",
    "__import__",
    "getattr",
    "setattr",
    "delattr",
];

pub const ENTRY_POINT: &str = "__user_function";

/// Exit code of a generated script that ran out of memory.
pub const MEMORY_ERROR_EXIT_CODE: i32 = 139;

const PYTHON_INDENT: &str = "    ";

static FORBIDDEN_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    FORBIDDEN_WORDS
        .iter()
        .map(|word| {
            let pattern = format!(r"\b{}\b", regex::escape(word));
            (*word, Regex::new(&pattern).expect("denylist patterns are valid"))
        })
        .collect()
});

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
pub enum InterpreterIssue {
    #[error("forbidden imports or keywords detected: {}", detected.join(", "))]
    ForbiddenImports { detected: Vec<String> },

    #[error("invalid variables: {0}")]
    Variables(String),

    #[error("code written in {actual} can't be interpreted as {expected}")]
    Language { expected: Lang, actual: Lang },
}

/// Turns a code body plus bound call arguments into a runnable script.
pub trait CodeInterpreter: Send + Sync {
    fn lang(&self) -> Lang;

    fn to_executable_code(
        &self,
        code: &Code,
        call_args: &[PlaceholderLabel],
        values: &PlaceholderValues,
    ) -> Result<String, InterpreterIssue>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonInterpreter;

impl CodeInterpreter for PythonInterpreter {
    fn lang(&self) -> Lang {
        Lang::Python
    }

    fn to_executable_code(
        &self,
        code: &Code,
        call_args: &[PlaceholderLabel],
        values: &PlaceholderValues,
    ) -> Result<String, InterpreterIssue> {
        if code.lang != Lang::Python {
            return Err(InterpreterIssue::Language { expected: Lang::Python, actual: code.lang });
        }

        check_forbidden(&code.source)?;

        let mut script = String::new();
        script.push_str("import time\n");
        declare_variables(&mut script, call_args, values)?;
        script.push('\n');
        define_function(&mut script, call_args, &code.source);
        define_main_guard(&mut script, call_args);
        Ok(script)
    }
}

/// Lists every denylisted word that occurs as a whole identifier.
pub fn detect_forbidden(source: &str) -> Vec<String> {
    FORBIDDEN_PATTERNS
        .iter()
        .filter(|(_, pattern)| pattern.is_match(source))
        .map(|(word, _)| word.to_string())
        .collect()
}

fn check_forbidden(source: &str) -> Result<(), InterpreterIssue> {
    let detected = detect_forbidden(source);
    if detected.is_empty() {
        Ok(())
    } else {
        Err(InterpreterIssue::ForbiddenImports { detected })
    }
}

fn declare_variables(
    script: &mut String,
    call_args: &[PlaceholderLabel],
    values: &PlaceholderValues,
) -> Result<(), InterpreterIssue> {
    let mut names = HashSet::with_capacity(call_args.len());
    for label in call_args {
        if !names.insert(label.name.as_str()) {
            return Err(InterpreterIssue::Variables(format!(
                "variable names should be unique, '{}' repeats",
                label.name
            )));
        }
    }

    for label in call_args {
        if !IDENTIFIER.is_match(&label.name)
            || FORBIDDEN_WORDS.contains(&label.name.as_str())
            || label.name == ENTRY_POINT
        {
            return Err(InterpreterIssue::Variables(format!(
                "'{}' is not a valid variable name",
                label.name
            )));
        }

        let value = values.get(&label.identifier).ok_or_else(|| {
            InterpreterIssue::Variables(format!(
                "variable definition missing for {} ({})",
                label.name, label.identifier
            ))
        })?;

        script.push_str(&format!("{} = {}\n", label.name, value.literal()));
    }
    Ok(())
}

fn define_function(script: &mut String, call_args: &[PlaceholderLabel], body: &str) {
    script.push_str(&format!("def {}({}):\n", ENTRY_POINT, args_line(call_args)));
    let mut wrote_line = false;
    for line in body.lines() {
        script.push_str(PYTHON_INDENT);
        script.push_str(line);
        script.push('\n');
        wrote_line |= !line.trim().is_empty();
    }
    if !wrote_line {
        script.push_str(PYTHON_INDENT);
        script.push_str("pass\n");
    }
}

fn define_main_guard(script: &mut String, call_args: &[PlaceholderLabel]) {
    let indent2 = PYTHON_INDENT.repeat(2);
    script.push('\n');
    script.push_str("if __name__ == \"__main__\":\n");
    script.push_str(&format!("{}try:\n", PYTHON_INDENT));
    script.push_str(&format!("{}print({}({}))\n", indent2, ENTRY_POINT, args_line(call_args)));
    script.push_str(&format!("{}except MemoryError:\n", PYTHON_INDENT));
    script.push_str(&format!("{}raise SystemExit({})\n", indent2, MEMORY_ERROR_EXIT_CODE));
}

fn args_line(call_args: &[PlaceholderLabel]) -> String {
    call_args.iter().map(|label| label.name.as_str()).collect::<Vec<_>>().join(", ")
}
