// src/validation.rs
use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{Answer, Lang, Question, QuestionMetadata};
use crate::question::QuestionExecutor;
use crate::task::{IdGenerator, TaskId};

pub const VALIDATION_ATTEMPTS: usize = 5;

/// Share of runs allowed to show problems before a question is rejected.
pub const BAD_RUN_FACTOR: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ValidationStatus {
    NotRegistered,
    Submitted(TaskId),
    Success,
    Error(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    #[error("{0} questions are not supported by this validator")]
    UnsupportedLanguage(Lang),

    #[error("Validation is already successful")]
    AlreadyValidated,

    #[error("Validation failed: {0}, fix question")]
    Failed(String),

    #[error("Validator is closed")]
    Closed,
}

/// Tracks per-question validation runs. A question passes when every one
/// of [`VALIDATION_ATTEMPTS`] runs succeeds and few enough of them show
/// answer problems.
pub struct QuestionValidator {
    state: Arc<State>,
    ids: IdGenerator,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

struct State {
    executor: Arc<dyn QuestionExecutor>,
    statuses: Mutex<HashMap<Uuid, ValidationStatus>>,
    attempts: usize,
}

impl QuestionValidator {
    pub fn new(executor: Arc<dyn QuestionExecutor>) -> Result<Self> {
        Self::with_attempts(executor, VALIDATION_ATTEMPTS)
    }

    pub fn with_attempts(executor: Arc<dyn QuestionExecutor>, attempts: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("question-validator")
            .build()?;
        Ok(Self {
            state: Arc::new(State {
                executor,
                statuses: Mutex::new(HashMap::new()),
                attempts: attempts.max(1),
            }),
            ids: IdGenerator::default(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
        })
    }

    /// Starts validating `question` unless a validation is already known.
    /// Returns the id of the running validation.
    pub fn validate(&self, id: Uuid, question: Question) -> std::result::Result<TaskId, ValidationIssue> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ValidationIssue::Closed);
        }
        if question.lang != self.state.executor.lang() {
            return Err(ValidationIssue::UnsupportedLanguage(question.lang));
        }

        let mut statuses = self.state.statuses();
        match statuses.get(&id) {
            Some(ValidationStatus::Submitted(task_id)) => return Ok(*task_id),
            Some(ValidationStatus::Success) => return Err(ValidationIssue::AlreadyValidated),
            Some(ValidationStatus::Error(message)) => return Err(ValidationIssue::Failed(message.clone())),
            Some(ValidationStatus::NotRegistered) | None => {}
        }

        let task_id = self.ids.next_id();
        statuses.insert(id, ValidationStatus::Submitted(task_id));
        drop(statuses);

        log::info!("Validating question {} as task {}", id, task_id);
        let guard = Unfinished { state: self.state.clone(), id, task_id };
        self.handle.spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| guard.state.run(id, &question)));
            match outcome {
                Ok(status) => guard.state.finish(id, task_id, status),
                Err(_) => {
                    log::error!("Validation of question {} panicked", id);
                    guard.state.finish(id, task_id, ValidationStatus::Error("validation panicked".into()))
                }
            }
        });
        Ok(task_id)
    }

    pub fn status(&self, id: Uuid) -> ValidationStatus {
        self.state
            .statuses()
            .get(&id)
            .cloned()
            .unwrap_or(ValidationStatus::NotRegistered)
    }

    /// Forgets any status of `id`. A validation still running for it
    /// discards its result.
    pub fn invalidate(&self, id: Uuid) -> ValidationStatus {
        let previous = self.state.statuses().remove(&id).unwrap_or(ValidationStatus::NotRegistered);
        log::info!("Invalidated question {}, previous status {:?}", id, previous);
        previous
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().unwrap_or_else(PoisonError::into_inner).take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for QuestionValidator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Marks a validation that was dropped before recording a result.
struct Unfinished {
    state: Arc<State>,
    id: Uuid,
    task_id: TaskId,
}

impl Drop for Unfinished {
    fn drop(&mut self) {
        self.state.finish(self.id, self.task_id, ValidationStatus::Error("validation was canceled".into()));
    }
}

impl State {
    fn statuses(&self) -> MutexGuard<'_, HashMap<Uuid, ValidationStatus>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, id: Uuid, question: &Question) -> ValidationStatus {
        let mut runs = Vec::with_capacity(self.attempts);
        for attempt in 0..self.attempts {
            match self.executor.run(question) {
                Ok(metadata) => runs.push(metadata),
                Err(issue) => {
                    log::warn!("Failed to validate question {} on attempt {}: {}", id, attempt + 1, issue);
                    return ValidationStatus::Error(issue.to_string());
                }
            }
        }

        let (bad_runs, problems) = review(&runs);
        let bad_factor = bad_runs as f64 / runs.len() as f64;
        if bad_factor > BAD_RUN_FACTOR {
            log::warn!("Question {} has problematic answers: {:?}", id, problems);
            return ValidationStatus::Error(problems.into_iter().collect::<Vec<_>>().join(".\n"));
        }
        ValidationStatus::Success
    }

    /// Records a terminal status unless the validation was invalidated or
    /// already finished.
    fn finish(&self, id: Uuid, task_id: TaskId, status: ValidationStatus) {
        let mut statuses = self.statuses();
        if statuses.get(&id) != Some(&ValidationStatus::Submitted(task_id)) {
            return;
        }
        match &status {
            ValidationStatus::Success => log::info!("Question {} successfully validated", id),
            other => log::debug!("Question {} finished validation with {:?}", id, other),
        }
        statuses.insert(id, status);
    }
}

/// Counts runs with answer problems and collects the distinct problems.
fn review(runs: &[QuestionMetadata]) -> (usize, BTreeSet<String>) {
    let mut problems = BTreeSet::new();
    let mut bad_runs = 0;
    for metadata in runs {
        let found = problems_of(metadata);
        if !found.is_empty() {
            bad_runs += 1;
            problems.extend(found);
        }
    }
    (bad_runs, problems)
}

fn problems_of(metadata: &QuestionMetadata) -> Vec<String> {
    let mut problems = Vec::new();
    if metadata.correct_answers.is_empty() {
        problems.push(format!("No correct answers were returned for question {}", metadata.question_id));
    }
    if metadata.incorrect_answers.is_empty() {
        problems.push(format!("No incorrect answers were returned for question {}", metadata.question_id));
    }

    for answer in metadata.answers() {
        if answer.text.is_empty() {
            problems.push(format!("Answer of variant {} is empty", answer.variant_id));
        }
        for (bucket, answers) in [("correct", &metadata.correct_answers), ("incorrect", &metadata.incorrect_answers)] {
            let same = same_text(answer, answers);
            if !same.is_empty() {
                problems.push(format!(
                    "Answer of variant {} is same as {} answers of variants {}",
                    answer.variant_id,
                    bucket,
                    same.join(", ")
                ));
            }
        }
    }
    problems
}

fn same_text(answer: &Answer, others: &[Answer]) -> Vec<String> {
    others
        .iter()
        .filter(|other| other.text == answer.text && other.variant_id != answer.variant_id)
        .map(|other| other.variant_id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use chrono::Utc;

    use crate::model::Output;
    use crate::question::{ConcurrentQuestionExecutor, QuestionResult, QuestionTask};
    use crate::task::{GroupId, Task};
    use crate::testing::{ScriptedExecutor, question};

    /// Answers every variant with its own index after a delay.
    struct Slow {
        delay: Duration,
        runs: AtomicUsize,
    }

    impl Slow {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self { delay, runs: AtomicUsize::new(0) })
        }
    }

    impl QuestionExecutor for Slow {
        fn lang(&self) -> Lang {
            Lang::Python
        }

        fn run(&self, question: &Question) -> QuestionResult {
            std::thread::sleep(self.delay);
            let run = self.runs.fetch_add(1, Ordering::SeqCst) as u64;
            let answer = |i: usize, v: &crate::model::Variant| Answer {
                variant_id: v.id,
                text: format!("{}", i),
                executor_task_id: TaskId(run),
            };
            Ok(QuestionMetadata {
                question_id: question.id,
                text: question.body.clone(),
                format_and_code: question.format_and_code.clone(),
                correct_answers: question.correct_variants.iter().enumerate().map(|(i, v)| answer(i, v)).collect(),
                incorrect_answers: question
                    .incorrect_variants
                    .iter()
                    .enumerate()
                    .map(|(i, v)| answer(i + 100, v))
                    .collect(),
                executed_at: Utc::now(),
            })
        }

        fn submit(&self, question: Question) -> QuestionTask {
            Task::ready(TaskId(0), self.run(&question))
        }

        fn close(&self) {}
    }

    fn wait_for_terminal(validator: &QuestionValidator, id: Uuid) -> ValidationStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = validator.status(id);
            if !matches!(status, ValidationStatus::Submitted(_)) || Instant::now() > deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn scripted_validator(scripted: ScriptedExecutor) -> QuestionValidator {
        let questions = ConcurrentQuestionExecutor::new(Arc::new(scripted), GroupId(9)).unwrap();
        QuestionValidator::new(Arc::new(questions)).unwrap()
    }

    #[test]
    fn test_unknown_question_is_not_registered() {
        let validator = QuestionValidator::new(Slow::new(Duration::ZERO)).unwrap();
        assert_eq!(validator.status(Uuid::new_v4()), ValidationStatus::NotRegistered);
    }

    #[test]
    fn test_successful_validation_runs_every_attempt() {
        let slow = Slow::new(Duration::ZERO);
        let validator = QuestionValidator::new(slow.clone()).unwrap();
        let q = question(&["return 1"], &["return 2"]);
        let id = q.id;

        validator.validate(id, q.clone()).unwrap();
        assert_eq!(wait_for_terminal(&validator, id), ValidationStatus::Success);
        assert_eq!(slow.runs.load(Ordering::SeqCst), VALIDATION_ATTEMPTS);
        assert_eq!(validator.validate(id, q), Err(ValidationIssue::AlreadyValidated));
    }

    #[test]
    fn test_validate_is_idempotent_while_submitted() {
        let validator = QuestionValidator::new(Slow::new(Duration::from_millis(100))).unwrap();
        let q = question(&["return 1"], &["return 2"]);

        let first = validator.validate(q.id, q.clone()).unwrap();
        let second = validator.validate(q.id, q.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(validator.status(q.id), ValidationStatus::Submitted(first));
    }

    #[test]
    fn test_invalidated_run_discards_result() {
        let validator = QuestionValidator::new(Slow::new(Duration::from_millis(50))).unwrap();
        let q = question(&["return 1"], &["return 2"]);

        let first = validator.validate(q.id, q.clone()).unwrap();
        assert_eq!(validator.invalidate(q.id), ValidationStatus::Submitted(first));
        assert_eq!(validator.status(q.id), ValidationStatus::NotRegistered);

        let second = validator.validate(q.id, q.clone()).unwrap();
        assert_ne!(first, second);
        assert_eq!(wait_for_terminal(&validator, q.id), ValidationStatus::Success);
    }

    #[test]
    fn test_execution_failure_is_recorded() {
        let scripted = ScriptedExecutor::new().with("boom", Err(crate::sandbox::Issue::Killed));
        let validator = scripted_validator(scripted);
        let q = question(&["return 1"], &["boom"]);

        validator.validate(q.id, q.clone()).unwrap();
        match wait_for_terminal(&validator, q.id) {
            ValidationStatus::Error(message) => assert!(message.contains("killed"), "{}", message),
            other => panic!("expected Error, got {:?}", other),
        }
        assert!(matches!(validator.validate(q.id, q), Err(ValidationIssue::Failed(_))));
    }

    #[test]
    fn test_colliding_answers_fail_quality_gate() {
        let scripted = ScriptedExecutor::new()
            .with("return 1", Ok(Output::Str("same".into())))
            .with("return 2", Ok(Output::Str("same".into())));
        let validator = scripted_validator(scripted);
        let q = question(&["return 1"], &["return 2"]);

        validator.validate(q.id, q.clone()).unwrap();
        match wait_for_terminal(&validator, q.id) {
            ValidationStatus::Error(message) => assert!(message.contains("is same as"), "{}", message),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_incorrect_answers_fail_quality_gate() {
        let validator = QuestionValidator::new(Slow::new(Duration::ZERO)).unwrap();
        let q = question(&["return 1"], &[]);

        validator.validate(q.id, q.clone()).unwrap();
        match wait_for_terminal(&validator, q.id) {
            ValidationStatus::Error(message) => assert!(message.contains("No incorrect answers")),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_other_language_and_after_close() {
        let validator = QuestionValidator::new(Slow::new(Duration::ZERO)).unwrap();
        let mut q = question(&["return 1"], &["return 2"]);
        q.lang = Lang::JavaScript;
        assert_eq!(
            validator.validate(q.id, q.clone()),
            Err(ValidationIssue::UnsupportedLanguage(Lang::JavaScript))
        );

        validator.close();
        q.lang = Lang::Python;
        assert_eq!(validator.validate(q.id, q), Err(ValidationIssue::Closed));
    }

    #[test]
    fn test_review_tolerates_few_bad_runs() {
        let slow = Slow::new(Duration::ZERO);
        let good = slow.run(&question(&["a"], &["b"])).unwrap();
        let mut bad = good.clone();
        bad.incorrect_answers.clear();

        let runs = vec![good.clone(), good.clone(), good.clone(), good.clone(), bad.clone()];
        let (bad_runs, problems) = review(&runs);
        assert_eq!(bad_runs, 1);
        assert_eq!(problems.len(), 1);
        assert!((bad_runs as f64 / runs.len() as f64) <= BAD_RUN_FACTOR);

        let (bad_runs, _) = review(&[good, bad.clone(), bad]);
        assert_eq!(bad_runs, 2);
    }
}
