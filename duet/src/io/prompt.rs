//! Prompt rendering for triggered workers.
//!
//! Templates are human-authored files under `.duet/prompts/<tier>.md`,
//! rendered with minijinja and written to `.duet/context/prompt.md` before
//! each launch. Unknown template variables are an error rather than blanks.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, UndefinedBehavior, context};
use tracing::debug;

use crate::core::step_id::StepId;
use crate::core::types::{Agent, Phase, PromptTier};
use crate::io::atomic::write_atomic;
use crate::io::layout::DuetPaths;

/// Placeholder written for every tier by `duet init`.
pub const PLACEHOLDER_TEMPLATE: &str = include_str!("prompts/placeholder.md");

/// Values exposed to prompt templates.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub step: &'a StepId,
    pub phase: Phase,
    pub round: u32,
    pub agent: Agent,
    pub tier: PromptTier,
    pub owner_mandate: bool,
}

/// Render `template` for one worker launch.
pub fn render_prompt(
    template: &str,
    paths: &DuetPaths,
    inputs: &PromptInputs<'_>,
) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    let template = env
        .template_from_str(template)
        .map_err(|err| anyhow!("invalid {} prompt template: {err}", inputs.tier))?;
    template
        .render(context! {
            step => inputs.step.as_str(),
            phase => inputs.phase.as_str(),
            round => inputs.round,
            agent => inputs.agent.as_str(),
            tier => inputs.tier.as_str(),
            owner_mandate => inputs.owner_mandate,
            flag_path => paths.flag_path.display().to_string(),
            flag_schema_path => paths.flag_schema_path.display().to_string(),
        })
        .map_err(|err| anyhow!("render {} prompt: {err}", inputs.tier))
}

/// Render the tier's template and write it where the watchdog will read it.
pub fn write_prompt(paths: &DuetPaths, inputs: &PromptInputs<'_>) -> Result<PathBuf> {
    let template_path = paths.prompt_path(inputs.tier);
    let template = fs::read_to_string(&template_path)
        .with_context(|| format!("read prompt template {}", template_path.display()))?;
    let rendered = render_prompt(&template, paths, inputs)?;
    let out = paths.rendered_prompt_path();
    write_atomic(&out, &rendered)?;
    debug!(tier = %inputs.tier, path = %out.display(), bytes = rendered.len(), "prompt rendered");
    Ok(out)
}
