// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stateless policy functions.
//!
//! - [`is_long_task_intent`] and [`parse_control_intent`] classify chat text
//! - [`evaluate_risk`] decides whether a new task starts as a draft
//! - [`PathPolicy`] guards the files an agent touched
//! - [`build_prompt`] and [`parse_state`] implement the agent turn contract

mod intent;
mod paths;
mod prompt;
mod risk;

pub use intent::{is_long_task_intent, parse_control_intent, ControlIntent};
pub use paths::{validate_changed_paths, PathPolicy, PathPolicyMode, PathViolation};
pub use prompt::{
    build_prompt, parse_state, prompt_digest, AgentState, PromptContext, DEFAULT_BLOCK_REASON,
};
pub use risk::{
    evaluate_risk, RiskDecision, RiskReason, MAX_UNREVIEWED_MINUTES, MAX_UNREVIEWED_STEPS,
};
