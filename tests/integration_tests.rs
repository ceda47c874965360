// tests/integration_tests.rs
//
// These run real Python child processes and skip themselves when no
// interpreter can be found (set PYTHON_BIN to point at one).
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use question_sandbox::command::{CommandBuilder, CommandMode, resolve_interpreter};
use question_sandbox::config::{SandboxConfig, load_test_model};
use question_sandbox::interpreter::PythonInterpreter;
use question_sandbox::listeners::Listener;
use question_sandbox::model::{
    Code, FormatAndCode, Lang, Output, OutputKind, PlaceholderDefinition, PlaceholderDefinitions,
    PlaceholderIdentifier, PlaceholderLabel, PlaceholderValue, Question, Variant,
};
use question_sandbox::question::{ConcurrentQuestionExecutor, QuestionExecutor};
use question_sandbox::sandbox::{CodeExecutor, Issue, Sandbox};
use question_sandbox::task::{GroupId, TaskId};
use question_sandbox::test_model::{QuestionExecutors, TestModelExecutor};
use uuid::Uuid;

fn python() -> Option<PathBuf> {
    let base = std::env::current_dir().ok()?;
    let explicit = std::env::var_os("PYTHON_BIN").map(PathBuf::from);
    resolve_interpreter(Lang::Python, &base, explicit.as_deref()).ok()
}

fn sandbox(config: SandboxConfig) -> Option<Sandbox> {
    let Some(binary) = python() else {
        eprintln!("skipping: no python interpreter found");
        return None;
    };
    let commands = CommandBuilder::new(binary, config.mode);
    Some(Sandbox::with_parts(Box::new(PythonInterpreter), commands, config).unwrap())
}

fn a_and_c() -> (Vec<PlaceholderLabel>, PlaceholderDefinitions) {
    let call_args = vec![
        PlaceholderLabel::new(PlaceholderIdentifier::P1, "a"),
        PlaceholderLabel::new(PlaceholderIdentifier::P2, "c"),
    ];
    let definitions = PlaceholderDefinitions::from([
        (PlaceholderIdentifier::P1, PlaceholderDefinition::value(PlaceholderValue::Int32(10))),
        (PlaceholderIdentifier::P2, PlaceholderDefinition::i32_range(10, 20).unwrap()),
    ]);
    (call_args, definitions)
}

fn python_question(correct: &[&str], incorrect: &[&str]) -> Question {
    let (call_args, placeholder_definitions) = a_and_c();
    Question {
        id: Uuid::new_v4(),
        lang: Lang::Python,
        body: "What is returned?".to_string(),
        format_and_code: FormatAndCode::new("python", "f({{a}}, {{c}})").unwrap(),
        placeholder_definitions,
        call_args,
        additional_check: None,
        correct_variants: correct
            .iter()
            .map(|s| Variant::correct(Code::python(*s, OutputKind::Str)))
            .collect(),
        incorrect_variants: incorrect
            .iter()
            .map(|s| Variant::incorrect(Code::python(*s, OutputKind::Str)))
            .collect(),
    }
}

#[test]
fn test_question_should_succeed() {
    let Some(sandbox) = sandbox(SandboxConfig::default()) else { return };
    let executor = ConcurrentQuestionExecutor::new(Arc::new(sandbox), GroupId(1)).unwrap();

    let metadata = executor
        .run(&python_question(&["return \"hi\"", "return a + c"], &[]))
        .unwrap();

    assert_eq!(metadata.correct_answers.len(), 2);
    assert_eq!(metadata.incorrect_answers.len(), 0);
    assert!(metadata.correct_answers.iter().any(|a| a.text == "hi"));
    let sum: i32 = metadata
        .correct_answers
        .iter()
        .find(|a| a.text != "hi")
        .unwrap()
        .text
        .parse()
        .unwrap();
    assert!((20..=30).contains(&sum));
    executor.close();
}

#[test]
fn test_one_failing_variant_fails_question() {
    let Some(sandbox) = sandbox(SandboxConfig::default()) else { return };
    let executor = ConcurrentQuestionExecutor::new(Arc::new(sandbox), GroupId(1)).unwrap();

    let result = executor.run(&python_question(&["return a + c"], &["return a / 0"]));
    match result {
        Err(question_sandbox::question::QuestionIssue::Multiple(issues)) => assert_eq!(issues.len(), 1),
        other => panic!("expected Multiple, got {:?}", other),
    }
}

#[test]
fn test_infinite_loop_is_stopped_within_budget() {
    let config = SandboxConfig { execution_budget: Duration::from_secs(2), ..SandboxConfig::default() };
    let Some(sandbox) = sandbox(config) else { return };

    let code = Code::python("while True:\n    pass", OutputKind::Str);
    let started = Instant::now();
    let task = sandbox.submit(GroupId(1), &code, &[], &PlaceholderDefinitions::new());
    let result = task.get();

    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    assert!(
        matches!(result, Err(Issue::Canceled | Issue::CpuTimeExceeded | Issue::Killed)),
        "got {:?}",
        result
    );
    assert_eq!(sandbox.in_flight(GroupId(1)), 0);
}

#[cfg(unix)]
#[test]
fn test_memory_hog_is_a_memory_violation() {
    let config = SandboxConfig {
        memory_limit_kb: 256 * 1024,
        resource_limits: true,
        ..SandboxConfig::default()
    };
    let Some(sandbox) = sandbox(config) else { return };

    let code = Code::python("x = \"a\" * (4 * 1024 ** 3)\nreturn len(x)", OutputKind::Str);
    let result = sandbox.submit(GroupId(1), &code, &[], &PlaceholderDefinitions::new()).get();
    assert_eq!(result, Err(Issue::MemoryViolation));
}

#[test]
fn test_runtime_error_reports_code_and_stderr() {
    let Some(sandbox) = sandbox(SandboxConfig::default()) else { return };
    let (call_args, definitions) = a_and_c();

    let code = Code::python("return a / 0", OutputKind::Str);
    match sandbox.submit(GroupId(1), &code, &call_args, &definitions).get() {
        Err(Issue::UnexpectedCode { code, stderr }) => {
            assert_eq!(code, 1);
            assert!(stderr.unwrap_or_default().contains("ZeroDivisionError"));
        }
        other => panic!("expected UnexpectedCode, got {:?}", other),
    }
}

#[test]
fn test_bool_output() {
    let Some(sandbox) = sandbox(SandboxConfig::default()) else { return };
    let (call_args, definitions) = a_and_c();

    let code = Code::python("return a < c", OutputKind::Bool);
    let result = sandbox.submit(GroupId(1), &code, &call_args, &definitions).get();
    assert_eq!(result, Ok(Output::Bool(true)));
}

#[test]
fn test_string_literal_survives_python() {
    let Some(sandbox) = sandbox(SandboxConfig::default()) else { return };
    let original = "he said \"hi\"\tthen\\left\nbye";
    let call_args = vec![PlaceholderLabel::new(PlaceholderIdentifier::P1, "s")];
    let definitions = PlaceholderDefinitions::from([(
        PlaceholderIdentifier::P1,
        PlaceholderDefinition::value(PlaceholderValue::Str(original.to_string())),
    )]);

    let code = Code::python("return s", OutputKind::Str);
    let result = sandbox.submit(GroupId(1), &code, &call_args, &definitions).get();
    assert_eq!(result, Ok(Output::Str(original.to_string())));
}

#[test]
fn test_file_mode_runs_from_storage() {
    let dir = tempfile::tempdir().unwrap();
    let config = SandboxConfig {
        mode: CommandMode::File,
        storage_dir: dir.path().to_path_buf(),
        ..SandboxConfig::default()
    };
    let Some(sandbox) = sandbox(config) else { return };
    let (call_args, definitions) = a_and_c();

    let code = Code::python("return a * 2", OutputKind::Str);
    let result = sandbox.submit(GroupId(1), &code, &call_args, &definitions).get();
    assert_eq!(result, Ok(Output::Str("20".into())));
    assert!(dir.path().join("python").is_dir());
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(TaskId, bool)>>,
}

impl Listener for Recorder {
    fn on_success(&self, _group: GroupId, task: TaskId, _output: &Output) {
        self.events.lock().unwrap().push((task, true));
    }

    fn on_error(&self, _group: GroupId, task: TaskId, _issue: &Issue) {
        self.events.lock().unwrap().push((task, false));
    }
}

#[test]
fn test_every_submit_notifies_listener_once() {
    let Some(sandbox) = sandbox(SandboxConfig::default()) else { return };
    let recorder = Arc::new(Recorder::default());
    sandbox.subscribe(GroupId(7), recorder.clone());
    let (call_args, definitions) = a_and_c();

    let ok = sandbox.submit(GroupId(7), &Code::python("return a", OutputKind::Str), &call_args, &definitions);
    let rejected = sandbox.submit(GroupId(7), &Code::python("import os", OutputKind::Str), &call_args, &definitions);
    let crashed = sandbox.submit(GroupId(7), &Code::python("return a / 0", OutputKind::Str), &call_args, &definitions);
    let other_group = sandbox.submit(GroupId(8), &Code::python("return c", OutputKind::Str), &call_args, &definitions);
    for task in [&ok, &rejected, &crashed, &other_group] {
        let _ = task.get();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while recorder.events.lock().unwrap().len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(100));

    let mut events = recorder.events.lock().unwrap().clone();
    events.sort();
    assert_eq!(events, vec![(ok.id(), true), (rejected.id(), false), (crashed.id(), false)]);
}

#[test]
fn test_demo_test_model_runs() {
    let Some(binary) = python() else { return };
    let config = SandboxConfig { python_bin: Some(binary), ..SandboxConfig::default() };
    let model = load_test_model(&PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/arithmetic.toml")).unwrap();

    let sandbox = Arc::new(Sandbox::new(Lang::Python, config).unwrap());
    let python = ConcurrentQuestionExecutor::new(sandbox, GroupId(0)).unwrap();
    let executor = TestModelExecutor::new(QuestionExecutors::new().with(Arc::new(python))).unwrap();

    let metadata = executor.run(&model).unwrap();
    assert_eq!(metadata.questions.len(), 2);
    for question in &metadata.questions {
        assert_eq!(question.correct_answers.len(), 1);
        assert_eq!(question.incorrect_answers.len(), 2);
        assert!(!question.format_and_code.code().contains("{{"));
    }
    executor.close();
}
