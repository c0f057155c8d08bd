// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

/// When options are offered they come as exactly three choices; fewer reads
/// like an afterthought and more overwhelms a quick decision.
const REQUIRED_OPTION_COUNT: usize = 3;

fn parse_options(value: Option<&Value>) -> Result<Option<Vec<String>>, String> {
    let Some(arr) = value.and_then(|v| v.as_array()) else {
        return Ok(None);
    };
    let options: Vec<String> = arr
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if options.len() != arr.len() {
        return Err("options must all be strings".into());
    }
    if options.len() != REQUIRED_OPTION_COUNT {
        return Err(format!(
            "options must contain exactly {REQUIRED_OPTION_COUNT} entries, got {}",
            options.len()
        ));
    }
    Ok(Some(options))
}

// ─── ask_user ─────────────────────────────────────────────────────────────────

/// Ask the user one question, optionally with three fixed choices.
pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a single question and wait for their answer. When \
         'options' is given it must hold exactly three choices; the user may \
         still answer in free text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask"
                },
                "options": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 3,
                    "maxItems": 3,
                    "description": "Exactly three choices (optional)"
                }
            },
            "required": ["question"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(question) = call.args.get("question").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'question'");
        };
        let options = match parse_options(call.args.get("options")) {
            Ok(o) => o,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        debug!(question, "ask_user tool");

        // One prompt at a time, even when the model asks in parallel.
        let _guard = ctx.ask_lock.lock().await;
        match ctx.ui.ask(question, options.as_deref()).await {
            Ok(answer) => ToolOutput::ok(&call.id, format!("Q: {question}\nA: {answer}")),
            Err(e) => ToolOutput::needs_input(
                &call.id,
                format!("the question could not be answered non-interactively: {e}"),
            ),
        }
    }
}

// ─── ask_user_multiple ────────────────────────────────────────────────────────

/// Ask several questions in one batched prompt.
///
/// The user's single response is stored once and attached to every question;
/// splitting it back into per-question answers is left to the model.
pub struct AskUserMultipleTool;

#[async_trait]
impl Tool for AskUserMultipleTool {
    fn name(&self) -> &str {
        "ask_user_multiple"
    }

    fn description(&self) -> &str {
        "Ask the user several questions at once. The questions are shown \
         together and the user answers in one message, which is attached to \
         every question in the result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": { "type": "string" },
                            "options": {
                                "type": "array",
                                "items": { "type": "string" },
                                "minItems": 3,
                                "maxItems": 3
                            }
                        },
                        "required": ["question"],
                        "additionalProperties": false
                    },
                    "minItems": 1,
                    "description": "Questions to ask together"
                }
            },
            "required": ["questions"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        let Some(items) = call.args.get("questions").and_then(|v| v.as_array()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'questions'");
        };
        if items.is_empty() {
            return ToolOutput::err(&call.id, "questions array must not be empty");
        }

        let mut questions: Vec<String> = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let Some(q) = item.get("question").and_then(|v| v.as_str()) else {
                return ToolOutput::err(&call.id, format!("question {} missing 'question'", i + 1));
            };
            let options = match parse_options(item.get("options")) {
                Ok(o) => o,
                Err(e) => return ToolOutput::err(&call.id, format!("question {}: {e}", i + 1)),
            };
            match options {
                Some(opts) => questions.push(format!("{}. {q}  [{}]", i + 1, opts.join(" / "))),
                None => questions.push(format!("{}. {q}", i + 1)),
            }
        }

        let combined = format!(
            "Please answer the following questions in one message:\n{}",
            questions.join("\n")
        );

        debug!(count = items.len(), "ask_user_multiple tool");

        let _guard = ctx.ask_lock.lock().await;
        match ctx.ui.ask(&combined, None).await {
            Ok(answer) => {
                // The one response is attached to every question.
                let body = questions
                    .iter()
                    .map(|q| format!("Q: {q}\nA: {answer}"))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                ToolOutput::ok(&call.id, body)
            }
            Err(e) => ToolOutput::needs_input(
                &call.id,
                format!("the questions could not be answered non-interactively: {e}"),
            ),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use runa_session::{Authorizer, HeadlessInteraction, ScriptedInteraction, Session};

    fn ctx_with_answers(answers: Vec<&str>) -> (ToolContext, Arc<ScriptedInteraction>) {
        let session = Arc::new(Session::new("/tmp"));
        let ui = Arc::new(ScriptedInteraction::new(
            answers.into_iter().map(String::from).collect(),
        ));
        let auth = Arc::new(Authorizer::new(Arc::clone(&session), ui.clone()));
        (
            ToolContext::new(session, auth, ui.clone() as Arc<dyn runa_session::UserInteraction>),
            ui,
        )
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn single_question_returns_answer() {
        let (ctx, _) = ctx_with_answers(vec!["blue"]);
        let out = AskUserTool
            .execute(&ctx, &call("ask_user", json!({"question": "favourite colour?"})))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("Q: favourite colour?"));
        assert!(out.content.contains("A: blue"));
    }

    #[tokio::test]
    async fn options_must_be_exactly_three() {
        let (ctx, _) = ctx_with_answers(vec!["x"]);
        let out = AskUserTool
            .execute(
                &ctx,
                &call(
                    "ask_user",
                    json!({"question": "pick", "options": ["a", "b"]}),
                ),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("exactly 3"));

        let ok = AskUserTool
            .execute(
                &ctx,
                &call(
                    "ask_user",
                    json!({"question": "pick", "options": ["a", "b", "c"]}),
                ),
            )
            .await;
        assert!(!ok.is_error, "{}", ok.content);
    }

    #[tokio::test]
    async fn headless_ask_signals_requires_input() {
        let session = Arc::new(Session::new("/tmp"));
        let ui = Arc::new(HeadlessInteraction);
        let auth = Arc::new(Authorizer::new(Arc::clone(&session), ui.clone()));
        let ctx = ToolContext::new(session, auth, ui);
        let out = AskUserTool
            .execute(&ctx, &call("ask_user", json!({"question": "anyone there?"})))
            .await;
        assert!(out.is_error);
        assert!(out.requires_input);
    }

    #[tokio::test]
    async fn multiple_attaches_one_answer_to_each_question() {
        let (ctx, ui) = ctx_with_answers(vec!["1) Rust 2) tokio"]);
        let out = AskUserMultipleTool
            .execute(
                &ctx,
                &call(
                    "ask_user_multiple",
                    json!({"questions": [
                        {"question": "language?"},
                        {"question": "runtime?"}
                    ]}),
                ),
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        // One prompt was issued for both questions.
        assert_eq!(ui.questions_asked().len(), 1);
        // The single response appears under both questions.
        assert_eq!(out.content.matches("A: 1) Rust 2) tokio").count(), 2);
    }

    #[tokio::test]
    async fn multiple_with_empty_list_is_error() {
        let (ctx, _) = ctx_with_answers(vec![]);
        let out = AskUserMultipleTool
            .execute(&ctx, &call("ask_user_multiple", json!({"questions": []})))
            .await;
        assert!(out.is_error);
    }
}
