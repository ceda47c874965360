// src/question.rs
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::errors::Result;
use crate::model::{Answer, Lang, Output, Question, QuestionMetadata, Variant, fixed, resolve_all};
use crate::sandbox::{CodeExecutor, ExecutionTask, Issue};
use crate::task::{Completion, GroupId, IdGenerator, Task};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuestionIssue {
    #[error("{} issue(s): {}", .0.len(), join(.0))]
    Multiple(Vec<QuestionIssue>),

    #[error("variant {} failed: {underlying}", variant.id)]
    VariantExecution { variant: Variant, underlying: Issue },

    #[error("additional check failed: {reason}")]
    AdditionalCheck { reason: String },

    #[error("question run was canceled before it started")]
    Canceled,
}

fn join(issues: &[QuestionIssue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

pub type QuestionResult = std::result::Result<QuestionMetadata, QuestionIssue>;
pub type QuestionTask = Task<QuestionResult>;

/// Runs every variant of a question and assembles its metadata.
pub trait QuestionExecutor: Send + Sync {
    fn lang(&self) -> Lang;

    /// Blocks until all variants have finished.
    fn run(&self, question: &Question) -> QuestionResult;

    /// Runs the question on a background thread.
    fn submit(&self, question: Question) -> QuestionTask;

    fn close(&self);
}

/// Fans all variants of a question out to a [`CodeExecutor`] at once and
/// joins them. Any failed variant fails the whole run.
pub struct ConcurrentQuestionExecutor {
    core: Arc<Core>,
    ids: IdGenerator,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

struct Core {
    code_executor: Arc<dyn CodeExecutor>,
    group: GroupId,
}

impl ConcurrentQuestionExecutor {
    pub fn new(code_executor: Arc<dyn CodeExecutor>, group: GroupId) -> Result<Self> {
        // Run threads mostly block on task results, so they live in the
        // growable blocking pool.
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("question-executor")
            .build()?;
        Ok(Self {
            core: Arc::new(Core { code_executor, group }),
            ids: IdGenerator::default(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn group(&self) -> GroupId {
        self.core.group
    }
}

impl QuestionExecutor for ConcurrentQuestionExecutor {
    fn lang(&self) -> Lang {
        self.core.code_executor.lang()
    }

    fn run(&self, question: &Question) -> QuestionResult {
        self.core.run(question)
    }

    fn submit(&self, question: Question) -> QuestionTask {
        let task_id = self.ids.next_id();
        if self.closed.load(Ordering::SeqCst) {
            return Task::ready(task_id, Err(QuestionIssue::Canceled));
        }

        let completion = Completion::new();
        let guard = CancelOnDrop(completion.clone());
        let core = self.core.clone();
        self.handle.spawn_blocking(move || {
            match catch_unwind(AssertUnwindSafe(|| core.run(&question))) {
                Ok(result) => guard.0.complete(result),
                Err(_) => guard.0.break_with(format!("run of question {} panicked", question.id)),
            };
        });
        Task::new(task_id, completion)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().unwrap_or_else(PoisonError::into_inner).take() {
            runtime.shutdown_background();
        }
        self.core.code_executor.close();
    }
}

impl Drop for ConcurrentQuestionExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolves a submitted run that never got to start.
struct CancelOnDrop(Arc<Completion<QuestionResult>>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.complete(Err(QuestionIssue::Canceled));
    }
}

impl Core {
    fn run(&self, question: &Question) -> QuestionResult {
        // One draw per run: every variant sees the same inputs.
        let values = match resolve_all(&question.placeholder_definitions) {
            Ok(values) => values,
            Err(cause) => {
                log::warn!("Question {} has unusable placeholders: {}", question.id, cause);
                let issues = question
                    .variants()
                    .map(|variant| QuestionIssue::VariantExecution {
                        variant: variant.clone(),
                        underlying: Issue::Interpretation(cause.clone()),
                    })
                    .collect();
                return Err(QuestionIssue::Multiple(issues));
            }
        };
        let definitions = fixed(&values);

        let submitted: Vec<(&Variant, ExecutionTask)> = question
            .variants()
            .map(|variant| {
                let task = self.code_executor.submit(
                    self.group,
                    &variant.code,
                    &question.call_args,
                    &definitions,
                );
                (variant, task)
            })
            .collect();
        let check = question.additional_check.as_ref().map(|code| {
            self.code_executor.submit(self.group, code, &question.call_args, &definitions)
        });

        let mut issues = Vec::new();
        let mut correct = Vec::new();
        let mut incorrect = Vec::new();
        for (variant, task) in submitted {
            match task.get() {
                Ok(output) => {
                    let answer = Answer {
                        variant_id: variant.id,
                        text: output.text(),
                        executor_task_id: task.id(),
                    };
                    if variant.is_correct() {
                        correct.push(answer);
                    } else {
                        incorrect.push(answer);
                    }
                }
                Err(underlying) => issues.push(QuestionIssue::VariantExecution {
                    variant: variant.clone(),
                    underlying,
                }),
            }
        }

        if let Some(task) = check {
            match task.get() {
                Ok(Output::Bool(true)) => {}
                Ok(other) => issues.push(QuestionIssue::AdditionalCheck {
                    reason: format!("check returned {}", other.text()),
                }),
                Err(issue) => issues.push(QuestionIssue::AdditionalCheck { reason: issue.to_string() }),
            }
        }

        if !issues.is_empty() {
            log::warn!("Question {} failed with {} issue(s)", question.id, issues.len());
            return Err(QuestionIssue::Multiple(issues));
        }

        Ok(QuestionMetadata {
            question_id: question.id,
            text: question.body.clone(),
            format_and_code: question.format_and_code.reformatted(&question.call_args, &values),
            correct_answers: correct,
            incorrect_answers: incorrect,
            executed_at: Utc::now(),
        })
    }
}
