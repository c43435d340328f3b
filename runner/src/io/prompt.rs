//! Prompt rendering for the attempt worker and sub-worker calls.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

const SUBWORKER_TEMPLATE: &str = include_str!("prompts/subworker.md");
const ATTEMPT_TEMPLATE: &str = include_str!("prompts/attempt.md");

/// Inputs for the sub-worker chunk prompt.
#[derive(Debug, Clone)]
pub struct SubWorkerPromptInputs<'a> {
    pub query: &'a str,
    pub chunk_id: u32,
    pub chunk_start: usize,
    pub chunk_end: usize,
    pub chunk_text: &'a str,
}

/// Inputs for the attempt kickoff prompt.
#[derive(Debug, Clone)]
pub struct AttemptPromptInputs<'a> {
    pub seq: u32,
    pub goal: &'a str,
    pub plan: &'a str,
    pub rules: &'a str,
    /// Excerpt of the last verification output, set on rollover.
    pub failure: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("subworker", SUBWORKER_TEMPLATE)
            .expect("subworker template should be valid");
        env.add_template("attempt", ATTEMPT_TEMPLATE)
            .expect("attempt template should be valid");
        Self { env }
    }
}

/// Render the prompt handed to a dispatched sub-worker.
pub fn render_subworker_prompt(inputs: &SubWorkerPromptInputs<'_>) -> Result<String> {
    let engine = PromptEngine::new();
    let template = engine.env.get_template("subworker").context("get template")?;
    let rendered = template
        .render(context! {
            query => inputs.query.trim(),
            chunk_id => inputs.chunk_id,
            chunk_start => inputs.chunk_start,
            chunk_end => inputs.chunk_end,
            chunk_text => inputs.chunk_text,
        })
        .context("render subworker prompt")?;
    Ok(rendered)
}

/// Render the prompt fed to the attempt worker on stdin.
pub fn render_attempt_prompt(inputs: &AttemptPromptInputs<'_>) -> Result<String> {
    let engine = PromptEngine::new();
    let template = engine.env.get_template("attempt").context("get template")?;
    let rendered = template
        .render(context! {
            seq => inputs.seq,
            goal => inputs.goal.trim(),
            plan => inputs.plan.trim(),
            rules => inputs.rules.trim(),
            failure => inputs.failure.map(str::trim).filter(|s| !s.is_empty()),
        })
        .context("render attempt prompt")?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subworker_prompt_carries_query_and_chunk() {
        let rendered = render_subworker_prompt(&SubWorkerPromptInputs {
            query: "where is the config parsed",
            chunk_id: 2,
            chunk_start: 100,
            chunk_end: 200,
            chunk_text: "let cfg = parse();",
        })
        .expect("render");
        assert!(rendered.contains("where is the config parsed"));
        assert!(rendered.contains("id: 2"));
        assert!(rendered.contains("let cfg = parse();"));
    }

    #[test]
    fn attempt_prompt_includes_failure_only_on_rollover() {
        let base = AttemptPromptInputs {
            seq: 1,
            goal: "goal",
            plan: "plan",
            rules: "rules",
            failure: None,
        };
        let first = render_attempt_prompt(&base).expect("render");
        assert!(!first.contains("Previous verification output"));

        let retry = AttemptPromptInputs {
            seq: 2,
            failure: Some("assertion failed"),
            ..base
        };
        let second = render_attempt_prompt(&retry).expect("render");
        assert!(second.contains("assertion failed"));
    }
}
