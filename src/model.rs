// src/model.rs
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::config::render_template;
use crate::errors::{Result, SandboxError};
use crate::interpreter::InterpreterIssue;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Python,
    JavaScript,
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lang::Python => write!(f, "python"),
            Lang::JavaScript => write!(f, "javascript"),
        }
    }
}

/// What a piece of code is declared to print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Str,
    Bool,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Str => write!(f, "str"),
            OutputKind::Bool => write!(f, "bool"),
        }
    }
}

/// Parsed stdout of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Output {
    Str(String),
    Bool(bool),
}

impl Output {
    pub fn kind(&self) -> OutputKind {
        match self {
            Output::Str(_) => OutputKind::Str,
            Output::Bool(_) => OutputKind::Bool,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Output::Str(value) => value.clone(),
            Output::Bool(true) => "True".to_string(),
            Output::Bool(false) => "False".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PlaceholderIdentifier {
    P1,
    P2,
    P3,
    P4,
    P5,
    P6,
    P7,
    P8,
    P9,
    P10,
}

impl PlaceholderIdentifier {
    pub const ALL: [PlaceholderIdentifier; 10] = [
        PlaceholderIdentifier::P1,
        PlaceholderIdentifier::P2,
        PlaceholderIdentifier::P3,
        PlaceholderIdentifier::P4,
        PlaceholderIdentifier::P5,
        PlaceholderIdentifier::P6,
        PlaceholderIdentifier::P7,
        PlaceholderIdentifier::P8,
        PlaceholderIdentifier::P9,
        PlaceholderIdentifier::P10,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceholderIdentifier::P1 => "P_1",
            PlaceholderIdentifier::P2 => "P_2",
            PlaceholderIdentifier::P3 => "P_3",
            PlaceholderIdentifier::P4 => "P_4",
            PlaceholderIdentifier::P5 => "P_5",
            PlaceholderIdentifier::P6 => "P_6",
            PlaceholderIdentifier::P7 => "P_7",
            PlaceholderIdentifier::P8 => "P_8",
            PlaceholderIdentifier::P9 => "P_9",
            PlaceholderIdentifier::P10 => "P_10",
        }
    }
}

impl fmt::Display for PlaceholderIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaceholderIdentifier {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        PlaceholderIdentifier::ALL
            .into_iter()
            .find(|identifier| identifier.as_str() == s)
            .ok_or_else(|| SandboxError::InvalidDefinition(format!("unknown placeholder '{}'", s)))
    }
}

// Serialized as the plain string so identifiers work as TOML/JSON map keys.
impl Serialize for PlaceholderIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PlaceholderIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A named parameter of the generated entry point, bound to a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaceholderLabel {
    pub identifier: PlaceholderIdentifier,
    pub name: String,
}

impl PlaceholderLabel {
    pub fn new(identifier: PlaceholderIdentifier, name: impl Into<String>) -> Self {
        Self { identifier, name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlaceholderValue {
    Int32(i32),
    Str(String),
}

impl PlaceholderValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PlaceholderValue::Int32(_) => "i32",
            PlaceholderValue::Str(_) => "str",
        }
    }

    /// Source-literal form: decimal integers, double-quoted strings with
    /// backslash escapes.
    pub fn literal(&self) -> String {
        match self {
            PlaceholderValue::Int32(value) => value.to_string(),
            PlaceholderValue::Str(value) => {
                let mut literal = String::with_capacity(value.len() + 2);
                literal.push('"');
                for ch in value.chars() {
                    match ch {
                        '\\' => literal.push_str("\\\\"),
                        '"' => literal.push_str("\\\""),
                        '\n' => literal.push_str("\\n"),
                        '\r' => literal.push_str("\\r"),
                        '\t' => literal.push_str("\\t"),
                        '\0' => literal.push_str("\\x00"),
                        other => literal.push(other),
                    }
                }
                literal.push('"');
                literal
            }
        }
    }
}

impl PartialOrd for PlaceholderValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (PlaceholderValue::Int32(a), PlaceholderValue::Int32(b)) => Some(a.cmp(b)),
            (PlaceholderValue::Str(a), PlaceholderValue::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for PlaceholderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceholderValue::Int32(value) => write!(f, "{}", value),
            PlaceholderValue::Str(value) => write!(f, "{}", value),
        }
    }
}

/// How a placeholder gets its value on each evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DefinitionRepr", into = "DefinitionRepr")]
pub enum PlaceholderDefinition {
    Value(PlaceholderValue),
    I32Range { start: i32, end: i32 },
    RandomOneOf(Vec<PlaceholderValue>),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DefinitionRepr {
    Value { value: PlaceholderValue },
    I32Range { start: i32, end: i32 },
    RandomOneOf { options: Vec<PlaceholderValue> },
}

impl TryFrom<DefinitionRepr> for PlaceholderDefinition {
    type Error = SandboxError;

    fn try_from(repr: DefinitionRepr) -> Result<Self> {
        match repr {
            DefinitionRepr::Value { value } => Ok(PlaceholderDefinition::value(value)),
            DefinitionRepr::I32Range { start, end } => PlaceholderDefinition::i32_range(start, end),
            DefinitionRepr::RandomOneOf { options } => PlaceholderDefinition::random_one_of(options),
        }
    }
}

impl From<PlaceholderDefinition> for DefinitionRepr {
    fn from(definition: PlaceholderDefinition) -> Self {
        match definition {
            PlaceholderDefinition::Value(value) => DefinitionRepr::Value { value },
            PlaceholderDefinition::I32Range { start, end } => DefinitionRepr::I32Range { start, end },
            PlaceholderDefinition::RandomOneOf(options) => DefinitionRepr::RandomOneOf { options },
        }
    }
}

impl PlaceholderDefinition {
    pub fn value(value: PlaceholderValue) -> Self {
        PlaceholderDefinition::Value(value)
    }

    pub fn i32_range(start: i32, end: i32) -> Result<Self> {
        if start > end {
            return Err(SandboxError::InvalidDefinition(format!(
                "range start {} is greater than end {}",
                start, end
            )));
        }
        Ok(PlaceholderDefinition::I32Range { start, end })
    }

    /// Options must be non-empty and of a single value type.
    pub fn random_one_of(options: Vec<PlaceholderValue>) -> Result<Self> {
        let Some(first) = options.first() else {
            return Err(SandboxError::InvalidDefinition("options can't be empty".to_string()));
        };
        if let Some(other) = options.iter().find(|o| o.type_name() != first.type_name()) {
            return Err(SandboxError::InvalidDefinition(format!(
                "mixed option types: {} and {}",
                first.type_name(),
                other.type_name()
            )));
        }
        Ok(PlaceholderDefinition::RandomOneOf(options))
    }

    /// Random definitions draw a fresh value on every call. Definitions
    /// built around the checked constructors (an inverted range, no
    /// options) are reported instead of drawn from.
    pub fn evaluate(&self) -> std::result::Result<PlaceholderValue, InterpreterIssue> {
        let mut rng = rand::thread_rng();
        match self {
            PlaceholderDefinition::Value(value) => Ok(value.clone()),
            PlaceholderDefinition::I32Range { start, end } if start > end => Err(
                InterpreterIssue::Variables(format!("range start {} is greater than end {}", start, end)),
            ),
            PlaceholderDefinition::I32Range { start, end } => {
                Ok(PlaceholderValue::Int32(rng.gen_range(*start..=*end)))
            }
            PlaceholderDefinition::RandomOneOf(options) if options.is_empty() => Err(
                InterpreterIssue::Variables("random choice has no options".to_string()),
            ),
            PlaceholderDefinition::RandomOneOf(options) => {
                Ok(options[rng.gen_range(0..options.len())].clone())
            }
        }
    }
}

pub type PlaceholderDefinitions = HashMap<PlaceholderIdentifier, PlaceholderDefinition>;
pub type PlaceholderValues = HashMap<PlaceholderIdentifier, PlaceholderValue>;

/// Draws one value for every definition.
pub fn resolve_all(
    definitions: &PlaceholderDefinitions,
) -> std::result::Result<PlaceholderValues, InterpreterIssue> {
    definitions
        .iter()
        .map(|(identifier, definition)| match definition.evaluate() {
            Ok(value) => Ok((*identifier, value)),
            Err(InterpreterIssue::Variables(reason)) => {
                Err(InterpreterIssue::Variables(format!("{}: {}", identifier, reason)))
            }
            Err(other) => Err(other),
        })
        .collect()
}

/// Pins already drawn values as constant definitions.
pub fn fixed(values: &PlaceholderValues) -> PlaceholderDefinitions {
    values
        .iter()
        .map(|(identifier, value)| (*identifier, PlaceholderDefinition::value(value.clone())))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Code {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub source: String,
    #[serde(default = "default_lang")]
    pub lang: Lang,
    #[serde(default)]
    pub output: OutputKind,
}

fn default_lang() -> Lang {
    Lang::Python
}

impl Code {
    pub fn new(source: impl Into<String>, lang: Lang, output: OutputKind) -> Self {
        Self { id: Uuid::new_v4(), source: source.into(), lang, output }
    }

    pub fn python(source: impl Into<String>, output: OutputKind) -> Self {
        Self::new(source, Lang::Python, output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    Correct,
    Incorrect,
}

/// One candidate implementation of a question; correctness is the author's tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variant {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub code: Code,
    pub kind: VariantKind,
}

impl Variant {
    pub fn correct(code: Code) -> Self {
        Self { id: Uuid::new_v4(), code, kind: VariantKind::Correct }
    }

    pub fn incorrect(code: Code) -> Self {
        Self { id: Uuid::new_v4(), code, kind: VariantKind::Incorrect }
    }

    pub fn is_correct(&self) -> bool {
        self.kind == VariantKind::Correct
    }
}

/// Display format plus the code snippet shown to the test taker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FormatAndCodeRepr")]
pub struct FormatAndCode {
    format: String,
    code: String,
}

#[derive(Deserialize)]
struct FormatAndCodeRepr {
    format: String,
    code: String,
}

impl TryFrom<FormatAndCodeRepr> for FormatAndCode {
    type Error = SandboxError;

    fn try_from(repr: FormatAndCodeRepr) -> Result<Self> {
        FormatAndCode::new(repr.format, repr.code)
    }
}

impl FormatAndCode {
    pub fn new(format: impl Into<String>, code: impl Into<String>) -> Result<Self> {
        let (format, code) = (format.into(), code.into());
        if format.trim().is_empty() || code.trim().is_empty() {
            return Err(SandboxError::InvalidDefinition(
                "format and code can't be blank".to_string(),
            ));
        }
        Ok(Self { format, code })
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Replaces `{{name}}` / `{{P_n}}` tokens in the code with the literal
    /// of the resolved value.
    pub fn reformatted(&self, call_args: &[PlaceholderLabel], values: &PlaceholderValues) -> Self {
        let mut bindings = serde_json::Map::new();
        for (identifier, value) in values {
            bindings.insert(identifier.to_string(), value.literal().into());
        }
        for label in call_args {
            if let Some(value) = values.get(&label.identifier) {
                bindings.insert(label.name.clone(), value.literal().into());
            }
        }
        Self {
            format: self.format.clone(),
            code: render_template(&self.code, &serde_json::Value::Object(bindings)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "default_lang")]
    pub lang: Lang,
    pub body: String,
    pub format_and_code: FormatAndCode,
    #[serde(default)]
    pub placeholder_definitions: PlaceholderDefinitions,
    #[serde(default)]
    pub call_args: Vec<PlaceholderLabel>,
    #[serde(default)]
    pub additional_check: Option<Code>,
    pub correct_variants: Vec<Variant>,
    #[serde(default)]
    pub incorrect_variants: Vec<Variant>,
}

impl Question {
    /// Correct variants first, then incorrect ones.
    pub fn variants(&self) -> impl Iterator<Item = &Variant> {
        self.correct_variants.iter().chain(self.incorrect_variants.iter())
    }

    pub fn validate(&self) -> Result<()> {
        if self.correct_variants.is_empty() {
            return Err(SandboxError::InvalidDefinition(format!(
                "question {} has no correct variant",
                self.id
            )));
        }
        let mistagged = self
            .correct_variants
            .iter()
            .any(|v| !v.is_correct())
            || self.incorrect_variants.iter().any(Variant::is_correct);
        if mistagged {
            return Err(SandboxError::InvalidDefinition(format!(
                "question {} has variants in the wrong bucket",
                self.id
            )));
        }
        if let Some(check) = &self.additional_check {
            if check.output != OutputKind::Bool {
                return Err(SandboxError::InvalidDefinition(format!(
                    "additional check of question {} must return bool",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    pub variant_id: Uuid,
    pub text: String,
    pub executor_task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionMetadata {
    pub question_id: Uuid,
    pub text: String,
    pub format_and_code: FormatAndCode,
    pub correct_answers: Vec<Answer>,
    pub incorrect_answers: Vec<Answer>,
    pub executed_at: DateTime<Utc>,
}

impl QuestionMetadata {
    pub fn answers(&self) -> impl Iterator<Item = &Answer> {
        self.correct_answers.iter().chain(self.incorrect_answers.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestModel {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestModelMetadata {
    pub id: Uuid,
    pub name: String,
    pub questions: Vec<QuestionMetadata>,
}

impl TestModelMetadata {
    /// Answer texts that occur more than once anywhere in the test.
    pub fn duplicate_answers(&self) -> Vec<String> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for answer in self.questions.iter().flat_map(QuestionMetadata::answers) {
            *seen.entry(answer.text.as_str()).or_default() += 1;
        }
        let mut duplicates: Vec<String> = seen
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(text, _)| text.to_string())
            .collect();
        duplicates.sort();
        duplicates
    }

    pub fn is_unique(&self) -> bool {
        self.duplicate_answers().is_empty()
    }
}
