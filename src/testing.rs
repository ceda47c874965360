// src/testing.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::listeners::Listener;
use crate::model::{
    Code, FormatAndCode, Lang, Output, OutputKind, PlaceholderDefinition, PlaceholderDefinitions,
    PlaceholderIdentifier, PlaceholderLabel, PlaceholderValue, Question, Variant,
};
use crate::sandbox::{CodeExecutor, ExecutionResult, ExecutionTask};
use crate::task::{GroupId, IdGenerator, Task};

/// In-memory executor answering by code source; unknown sources echo
/// themselves back as string output.
#[derive(Default)]
pub struct ScriptedExecutor {
    outcomes: HashMap<String, ExecutionResult>,
    ids: IdGenerator,
    pub submissions: Mutex<Vec<(String, PlaceholderDefinitions)>>,
    pub closed: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: &str, outcome: ExecutionResult) -> Self {
        self.outcomes.insert(source.to_string(), outcome);
        self
    }

    pub fn submitted(&self) -> Vec<(String, PlaceholderDefinitions)> {
        self.submissions.lock().unwrap().clone()
    }
}

impl CodeExecutor for ScriptedExecutor {
    fn lang(&self) -> Lang {
        Lang::Python
    }

    fn submit(
        &self,
        _group: GroupId,
        code: &Code,
        _call_args: &[PlaceholderLabel],
        definitions: &PlaceholderDefinitions,
    ) -> ExecutionTask {
        self.submissions.lock().unwrap().push((code.source.clone(), definitions.clone()));
        let outcome = self
            .outcomes
            .get(&code.source)
            .cloned()
            .unwrap_or_else(|| Ok(Output::Str(code.source.clone())));
        Task::ready(self.ids.next_id(), outcome)
    }

    fn subscribe(&self, _group: GroupId, _listener: Arc<dyn Listener>) {}

    fn unsubscribe(&self, _group: GroupId, _listener: &Arc<dyn Listener>) {}

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn str_code(source: &str) -> Code {
    Code::python(source, OutputKind::Str)
}

/// `a = P_1 (10)`, `c = P_2 (10..=20)`.
pub fn question(correct: &[&str], incorrect: &[&str]) -> Question {
    Question {
        id: Uuid::new_v4(),
        lang: Lang::Python,
        body: "What does the function return?".to_string(),
        format_and_code: FormatAndCode::new("python", "f({{a}}, {{c}})").unwrap(),
        placeholder_definitions: PlaceholderDefinitions::from([
            (PlaceholderIdentifier::P1, PlaceholderDefinition::value(PlaceholderValue::Int32(10))),
            (PlaceholderIdentifier::P2, PlaceholderDefinition::i32_range(10, 20).unwrap()),
        ]),
        call_args: vec![
            PlaceholderLabel::new(PlaceholderIdentifier::P1, "a"),
            PlaceholderLabel::new(PlaceholderIdentifier::P2, "c"),
        ],
        additional_check: None,
        correct_variants: correct.iter().map(|s| Variant::correct(str_code(s))).collect(),
        incorrect_variants: incorrect.iter().map(|s| Variant::incorrect(str_code(s))).collect(),
    }
}
