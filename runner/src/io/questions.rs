//! Blocking question/answer channel between a session and an external
//! operator.
//!
//! A session appends a question and polls for its answer by id; the
//! operator answers asynchronously via `rlm-runner respond`. The supervisor
//! never interprets question text.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One operator question (`.rlm/state/questions.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: u32,
    pub text: String,
    pub answer: Option<String>,
}

/// Load all questions. A missing file means none were asked.
pub fn load_questions(path: &Path) -> Result<Vec<Question>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read questions {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse questions {}", path.display()))
}

fn store_questions(path: &Path, questions: &[Question]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("questions path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(questions)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp questions {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace questions {}", path.display()))?;
    Ok(())
}

/// Append a new question and return its id.
pub fn ask(path: &Path, text: &str) -> Result<u32> {
    let mut questions = load_questions(path)?;
    let id = questions.iter().map(|q| q.id).max().unwrap_or(0) + 1;
    questions.push(Question {
        id,
        text: text.to_string(),
        answer: None,
    });
    store_questions(path, &questions)?;
    debug!(id, "question asked");
    Ok(id)
}

/// Record the operator's answer for `id`.
pub fn respond(path: &Path, id: u32, answer: &str) -> Result<()> {
    let mut questions = load_questions(path)?;
    let question = questions
        .iter_mut()
        .find(|q| q.id == id)
        .ok_or_else(|| anyhow!("no question with id {id}"))?;
    if question.answer.is_some() {
        return Err(anyhow!("question {id} already answered"));
    }
    question.answer = Some(answer.to_string());
    store_questions(path, &questions)?;
    Ok(())
}

/// Questions still waiting for an answer.
pub fn open_questions(path: &Path) -> Result<Vec<Question>> {
    Ok(load_questions(path)?
        .into_iter()
        .filter(|q| q.answer.is_none())
        .collect())
}

/// Ask a question and block until the operator answers it.
///
/// This is the session-facing half of the channel (`ask --wait`): the call
/// returns only once `rlm-runner respond` has recorded an answer, or when
/// `timeout` elapses.
pub fn ask_and_wait(
    path: &Path,
    text: &str,
    poll: Duration,
    timeout: Option<Duration>,
) -> Result<String> {
    let id = ask(path, text)?;
    debug!(id, "blocking on operator answer");
    wait_for_answer(path, id, poll, timeout)
}

/// Block until `id` is answered, polling every `poll` interval.
///
/// Returns an error if `timeout` elapses first.
pub fn wait_for_answer(
    path: &Path,
    id: u32,
    poll: Duration,
    timeout: Option<Duration>,
) -> Result<String> {
    let start = Instant::now();
    loop {
        let questions = load_questions(path)?;
        let question = questions
            .iter()
            .find(|q| q.id == id)
            .ok_or_else(|| anyhow!("no question with id {id}"))?;
        if let Some(answer) = &question.answer {
            return Ok(answer.clone());
        }
        if let Some(limit) = timeout
            && start.elapsed() >= limit
        {
            return Err(anyhow!("question {id} unanswered after {limit:?}"));
        }
        thread::sleep(poll);
    }
}
