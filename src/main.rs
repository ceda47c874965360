// src/main.rs
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use question_sandbox::banner;
use question_sandbox::config::{SandboxConfig, load_test_model};
use question_sandbox::errors::Result;
use question_sandbox::model::Lang;
use question_sandbox::question::ConcurrentQuestionExecutor;
use question_sandbox::sandbox::Sandbox;
use question_sandbox::task::GroupId;
use question_sandbox::test_model::{QuestionExecutors, TestModelExecutor};

fn main() -> ExitCode {
    // Print the startup banner
    banner::print_banner();

    let dotenv = dotenvy::dotenv();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    if let Err(e) = dotenv {
        log::warn!("⚠️  Could not load .env file: {}", e);
    }

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("Usage: question-sandbox <test-model.toml>");
        return ExitCode::from(2);
    };

    match run(&path) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Runs every question of the test at `path`; `Ok(false)` when any failed.
fn run(path: &Path) -> Result<bool> {
    let config = SandboxConfig::from_env()?;
    let model = load_test_model(path)?;
    log::info!("Loaded test '{}' with {} question(s)", model.name, model.questions.len());

    let sandbox = Arc::new(Sandbox::new(Lang::Python, config)?);
    let python = ConcurrentQuestionExecutor::new(sandbox, GroupId(0))?;
    let executor = TestModelExecutor::new(QuestionExecutors::new().with(Arc::new(python)))?;

    let result = executor.run(&model);
    executor.close();

    match result {
        Ok(metadata) => {
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            let duplicates = metadata.duplicate_answers();
            if !duplicates.is_empty() {
                log::warn!("⚠️  Answers repeat across the test: {:?}", duplicates);
            }
            Ok(true)
        }
        Err(issue) => {
            log::error!("Test '{}' failed: {}", model.name, issue);
            Ok(false)
        }
    }
}
