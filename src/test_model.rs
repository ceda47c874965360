// src/test_model.rs
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::errors::Result;
use crate::model::{Lang, TestModel, TestModelMetadata};
use crate::question::{QuestionExecutor, QuestionIssue, QuestionTask};
use crate::task::{Completion, IdGenerator, Task};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TestModelIssue {
    #[error("{} question issue(s): {}", .0.len(), join(.0))]
    OfQuestion(Vec<QuestionIssue>),
}

fn join(issues: &[QuestionIssue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

pub type TestModelResult = std::result::Result<TestModelMetadata, TestModelIssue>;
pub type TestModelTask = Task<TestModelResult>;

/// Question executors keyed by the language they run.
#[derive(Default, Clone)]
pub struct QuestionExecutors {
    by_lang: HashMap<Lang, Arc<dyn QuestionExecutor>>,
}

impl QuestionExecutors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` under its own language, replacing any previous one.
    pub fn with(mut self, executor: Arc<dyn QuestionExecutor>) -> Self {
        self.by_lang.insert(executor.lang(), executor);
        self
    }

    pub fn get(&self, lang: Lang) -> Option<&Arc<dyn QuestionExecutor>> {
        self.by_lang.get(&lang)
    }

    pub fn langs(&self) -> impl Iterator<Item = Lang> + '_ {
        self.by_lang.keys().copied()
    }
}

/// Runs every question of a test on the executor registered for its language.
pub struct TestModelExecutor {
    executors: Arc<QuestionExecutors>,
    ids: IdGenerator,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

impl TestModelExecutor {
    pub fn new(executors: QuestionExecutors) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("test-model-executor")
            .build()?;
        Ok(Self {
            executors: Arc::new(executors),
            ids: IdGenerator::default(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
        })
    }

    /// Blocks until every question has finished.
    ///
    /// # Panics
    ///
    /// When a question's language has no registered executor. That is a
    /// wiring mistake, not something a test author can fix.
    pub fn run(&self, model: &TestModel) -> TestModelResult {
        run_all(&self.executors, model)
    }

    pub fn submit(&self, model: TestModel) -> TestModelTask {
        let task_id = self.ids.next_id();
        if self.closed.load(Ordering::SeqCst) {
            return Task::ready(task_id, Err(TestModelIssue::OfQuestion(vec![QuestionIssue::Canceled])));
        }

        let completion = Completion::new();
        let guard = CancelOnDrop(completion.clone());
        let executors = self.executors.clone();
        self.handle.spawn_blocking(move || {
            match catch_unwind(AssertUnwindSafe(|| run_all(&executors, &model))) {
                Ok(result) => guard.0.complete(result),
                Err(_) => guard.0.break_with(format!("run of test {} panicked", model.id)),
            };
        });
        Task::new(task_id, completion)
    }

    /// Shuts down orchestration and every registered question executor.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().unwrap_or_else(PoisonError::into_inner).take() {
            runtime.shutdown_background();
        }
        for lang in self.executors.langs() {
            if let Some(executor) = self.executors.get(lang) {
                log::debug!("Closing {} question executor", lang);
                executor.close();
            }
        }
    }
}

impl Drop for TestModelExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

struct CancelOnDrop(Arc<Completion<TestModelResult>>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.complete(Err(TestModelIssue::OfQuestion(vec![QuestionIssue::Canceled])));
    }
}

fn run_all(executors: &QuestionExecutors, model: &TestModel) -> TestModelResult {
    let tasks: Vec<QuestionTask> = model
        .questions
        .iter()
        .map(|question| {
            let executor = executors.get(question.lang).unwrap_or_else(|| {
                panic!("no question executor registered for {}", question.lang)
            });
            executor.submit(question.clone())
        })
        .collect();

    let mut issues: Vec<QuestionIssue> = Vec::new();
    let mut questions = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.get() {
            Ok(metadata) => questions.push(metadata),
            Err(issue) => {
                if !issues.contains(&issue) {
                    issues.push(issue);
                }
            }
        }
    }

    if !issues.is_empty() {
        log::warn!("Test {} failed with {} distinct issue(s)", model.id, issues.len());
        return Err(TestModelIssue::OfQuestion(issues));
    }

    log::info!("Test {} ran {} question(s)", model.id, questions.len());
    Ok(TestModelMetadata { id: model.id, name: model.name.clone(), questions })
}
