//! The command-driven scheduler.
//!
//! A single consumer drains the command queue and spawns one task per
//! command. Per-call transitions stay strictly sequential because a
//! call's next command is only enqueued once the previous handler
//! finished; commands for different calls interleave freely.
//!
//! Call lifecycle: `StartCall → (GenerateStep → ExecuteCode?)* →
//! Finalize | FailCall`. Bridge commands arrive concurrently while an
//! execute is in flight. This is the only component that mutates call
//! transcripts or spends budget.

use crate::call::CallState;
use crate::extract::{extract_code_block, extract_final};
use crate::model::{GenerateRequest, ModelService};
use crate::prompt::{build_extract_prompt, build_repl_prompt, truncate_execution_output};
use crate::runtime::RlmRuntime;
use crate::tools::ToolRegistry;
use crate::validate::OutputValidator;
use rlm_common::{
    BridgeRequestId, BudgetResource, CallId, PartialResult, RlmCommand, RlmError, RlmEvent,
    TranscriptEntry, WarningCode,
};
use rlm_sandbox::{CallHandle, SandboxFactory, SandboxInstance};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info};

pub struct Scheduler {
    runtime: Arc<RlmRuntime>,
    model: Arc<dyn ModelService>,
    factory: Arc<dyn SandboxFactory>,
    tools: Arc<ToolRegistry>,
    validator: Option<Arc<dyn OutputValidator>>,
}

impl Scheduler {
    pub fn new(
        runtime: Arc<RlmRuntime>,
        model: Arc<dyn ModelService>,
        factory: Arc<dyn SandboxFactory>,
        tools: Arc<ToolRegistry>,
        validator: Option<Arc<dyn OutputValidator>>,
    ) -> Self {
        Self {
            runtime,
            model,
            factory,
            tools,
            validator,
        }
    }

    /// Consume commands until cancellation or queue closure.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<RlmCommand>) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.runtime.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    debug!(tag = command.tag(), call_id = %command.call_id(), "dispatch");
                    let scheduler = Arc::clone(&self);
                    tasks.spawn(async move { scheduler.handle(command).await });
                    while tasks.try_join_next().is_some() {}
                }
            }
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    async fn handle(&self, command: RlmCommand) {
        match command {
            RlmCommand::StartCall {
                call_id,
                depth,
                query,
                context,
                reply,
            } => self.start_call(call_id, depth, query, context, reply).await,
            RlmCommand::GenerateStep { call_id } => self.generate_step(call_id).await,
            RlmCommand::ExecuteCode { call_id, code } => self.execute_code(call_id, code).await,
            RlmCommand::HandleBridgeCall {
                call_id,
                bridge_request_id,
                method,
                args,
            } => {
                self.bridge_call(call_id, bridge_request_id, method, args)
                    .await
            }
            RlmCommand::Finalize { call_id, payload } => self.finalize(call_id, payload).await,
            RlmCommand::FailCall { call_id, error } => self.fail_call(call_id, error).await,
        }
    }

    fn stale(&self, call_id: CallId, command_tag: &str) {
        self.runtime.warn(
            WarningCode::StaleCommandDropped,
            "command references a closed call, dropping",
            Some(call_id),
            Some(command_tag),
        );
    }

    async fn start_call(
        &self,
        call_id: CallId,
        depth: u32,
        query: String,
        context: String,
        reply: Option<oneshot::Sender<Result<String, RlmError>>>,
    ) {
        let handle = CallHandle {
            call_id,
            depth,
            tools: self.tools.descriptors(),
        };
        let sandbox: Arc<dyn SandboxInstance> = match self.factory.create(handle).await {
            Ok(sandbox) => Arc::from(sandbox),
            Err(err) => {
                self.runtime.emit(RlmEvent::CallFailed {
                    call_id,
                    error: err.to_string(),
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
                return;
            }
        };

        for (name, value) in [
            ("query", serde_json::json!(query)),
            ("context", serde_json::json!(context)),
        ] {
            if let Err(err) = sandbox.set_variable(name, value).await {
                self.runtime.warn(
                    WarningCode::VariableSyncFailed,
                    format!("failed to seed {name}: {err}"),
                    Some(call_id),
                    None,
                );
            }
        }

        self.runtime.insert_call(
            call_id,
            CallState::new(depth, query.clone(), context, sandbox, reply),
        );
        info!(call_id = %call_id, depth, "call started");
        self.runtime.emit(RlmEvent::CallStarted {
            call_id,
            depth,
            query,
        });

        if let Err(err) = self.runtime.enqueue(RlmCommand::GenerateStep { call_id }) {
            self.fail_call(call_id, err).await;
        }
    }

    async fn generate_step(&self, call_id: CallId) {
        let Some((depth, query, context, transcript, iteration)) = ({
            let mut states = self
                .runtime
                .call_states
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            states.get_mut(&call_id).map(|state| {
                state.iteration += 1;
                (
                    state.depth,
                    state.query.clone(),
                    state.context.clone(),
                    state.transcript.clone(),
                    state.iteration,
                )
            })
        }) else {
            self.stale(call_id, "GenerateStep");
            return;
        };

        // All budget gates fire before any model call.
        if let Err(err) = self.reserve_step_budget(call_id, &transcript) {
            self.fail_call(call_id, err).await;
            return;
        }

        self.runtime.emit(RlmEvent::IterationStarted {
            call_id,
            iteration,
        });

        let response = {
            let _permit = match self.runtime.llm_semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let request = GenerateRequest {
                messages: build_repl_prompt(&query, &context, &transcript),
                depth,
                is_sub_call: depth > 0,
            };
            self.model.generate_text(request).await
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.fail_call(call_id, err).await;
                return;
            }
        };

        if let Some(tokens) = response.total_tokens {
            self.runtime.budget.record_tokens(tokens);
        }
        self.runtime.emit(RlmEvent::ModelResponse {
            call_id,
            text: response.text.clone(),
            total_tokens: response.total_tokens,
        });

        let final_answer = extract_final(&response.text);
        let code = extract_code_block(&response.text);
        if final_answer.is_some() && code.is_some() {
            self.runtime.warn(
                WarningCode::MixedSubmitAndCode,
                "response carries both a submit directive and a code block, submitting",
                Some(call_id),
                None,
            );
        }

        {
            let mut states = self
                .runtime
                .call_states
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let Some(state) = states.get_mut(&call_id) else {
                self.stale(call_id, "GenerateStep");
                return;
            };
            state.transcript.push(TranscriptEntry {
                assistant_response: response.text,
                execution_output: None,
            });
        }

        let next = if let Some(payload) = final_answer {
            RlmCommand::Finalize { call_id, payload }
        } else if let Some(code) = code {
            RlmCommand::ExecuteCode { call_id, code }
        } else {
            RlmCommand::GenerateStep { call_id }
        };
        if let Err(err) = self.runtime.enqueue(next) {
            self.fail_call(call_id, err).await;
        }
    }

    /// Reserve one iteration and one model call, and verify the token
    /// and time budgets. On exhaustion a partial result is recorded for
    /// the extract fallback before the error is returned.
    fn reserve_step_budget(
        &self,
        call_id: CallId,
        transcript: &[TranscriptEntry],
    ) -> Result<(), RlmError> {
        let budget = &self.runtime.budget;
        let outcome = budget
            .check_time(call_id)
            .and_then(|()| budget.check_tokens(call_id))
            .and_then(|()| budget.try_reserve(BudgetResource::Iterations, call_id))
            .and_then(
                |()| match budget.try_reserve(BudgetResource::LlmCalls, call_id) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        budget.release(BudgetResource::Iterations);
                        Err(err)
                    }
                },
            );
        match outcome {
            Err(RlmError::BudgetExhausted {
                resource,
                call_id,
                remaining,
            }) => {
                self.runtime.record_partial(
                    call_id,
                    PartialResult {
                        reason: resource.into(),
                        transcript: transcript.to_vec(),
                    },
                );
                // Out of iterations means the call never submitted.
                if resource == BudgetResource::Iterations {
                    Err(RlmError::NoFinalAnswer {
                        call_id,
                        max_iterations: self.runtime.config.max_iterations,
                    })
                } else {
                    Err(RlmError::BudgetExhausted {
                        resource,
                        call_id,
                        remaining,
                    })
                }
            }
            other => other,
        }
    }

    async fn execute_code(&self, call_id: CallId, code: String) {
        let Some(sandbox) = self.runtime.sandbox_of(call_id) else {
            self.stale(call_id, "ExecuteCode");
            return;
        };

        self.runtime.emit(RlmEvent::CodeExecutionStarted {
            call_id,
            code: code.clone(),
        });

        let output = match sandbox.execute(&code).await {
            Ok(output) => truncate_execution_output(
                &output,
                self.runtime.config.max_execution_output_chars,
            ),
            // Guest-raised failures feed back to the model; protocol
            // faults fail the call.
            Err(RlmError::ExecutionFailed { message }) => format!("Error: {message}"),
            Err(err) => {
                self.fail_call(call_id, err).await;
                return;
            }
        };

        {
            let mut states = self
                .runtime
                .call_states
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let Some(state) = states.get_mut(&call_id) else {
                self.stale(call_id, "ExecuteCode");
                return;
            };
            match state.transcript.last_mut() {
                Some(entry) if entry.execution_output.is_none() => {
                    entry.execution_output = Some(output.clone());
                }
                _ => state.transcript.push(TranscriptEntry {
                    assistant_response: String::new(),
                    execution_output: Some(output.clone()),
                }),
            }
        }

        self.runtime
            .emit(RlmEvent::CodeExecutionCompleted { call_id, output });

        if let Err(err) = self.runtime.enqueue(RlmCommand::GenerateStep { call_id }) {
            self.fail_call(call_id, err).await;
        }
    }

    async fn bridge_call(
        &self,
        call_id: CallId,
        bridge_request_id: BridgeRequestId,
        method: String,
        args: Vec<serde_json::Value>,
    ) {
        let depth = {
            self.runtime
                .call_states
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&call_id)
                .map(|state| state.depth)
        };
        let Some(depth) = depth else {
            self.stale(call_id, "HandleBridgeCall");
            self.runtime
                .resolve_bridge(bridge_request_id, Err(RlmError::CallStateMissing { call_id }));
            return;
        };

        self.runtime.emit(RlmEvent::BridgeCallReceived {
            call_id,
            method: method.clone(),
        });

        let result = match method.as_str() {
            "llm_query" => self.spawn_sub_call(call_id, depth, &args).await,
            name => match self.tools.get(name) {
                Some(tool) => tool.call(args).await,
                None => Err(RlmError::sandbox(format!("no such bridge method: {name}"))),
            },
        };
        self.runtime.resolve_bridge(bridge_request_id, result);
    }

    /// Recursive `llm_query`: start a child call one level deeper and
    /// wait for its outcome. The shared budget does the global
    /// throttling; only depth is checked here.
    async fn spawn_sub_call(
        &self,
        parent: CallId,
        parent_depth: u32,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, RlmError> {
        let query = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| RlmError::sandbox("llm_query expects a query string"))?
            .to_string();
        let context = args
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let depth = parent_depth + 1;
        if depth > self.runtime.config.max_depth {
            return Err(RlmError::sandbox(format!(
                "recursion depth limit reached ({})",
                self.runtime.config.max_depth
            )));
        }

        let child = CallId::new();
        debug!(parent = %parent, child = %child, depth, "spawning sub-call");
        let (tx, rx) = oneshot::channel();
        self.runtime.enqueue(RlmCommand::StartCall {
            call_id: child,
            depth,
            query,
            context,
            reply: Some(tx),
        })?;
        match rx.await {
            Ok(Ok(answer)) => Ok(serde_json::json!(answer)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RlmError::sandbox("scheduler stopped")),
        }
    }

    async fn finalize(&self, call_id: CallId, payload: String) {
        if let Some(validator) = &self.validator {
            if let Err(err) = validator.validate(&payload) {
                Box::pin(self.fail_call(call_id, err)).await;
                return;
            }
        }

        let Some(mut state) = self.runtime.take_call(call_id) else {
            self.stale(call_id, "Finalize");
            return;
        };
        state.sandbox.shutdown().await;

        info!(call_id = %call_id, "call finalized");
        self.runtime.emit(RlmEvent::CallFinalized {
            call_id,
            answer: payload.clone(),
        });
        if let Some(reply) = state.reply.take() {
            let _ = reply.send(Ok(payload));
        }
    }

    async fn fail_call(&self, call_id: CallId, error: RlmError) {
        let fallback = {
            let mut states = self
                .runtime
                .call_states
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match states.get_mut(&call_id) {
                Some(state) => {
                    if error.is_exhaustion() && !state.extract_attempted {
                        state.extract_attempted = true;
                        Some((state.depth, state.query.clone(), state.transcript.clone()))
                    } else {
                        None
                    }
                }
                None => {
                    self.stale(call_id, "FailCall");
                    return;
                }
            }
        };

        if let Some((depth, query, transcript)) = fallback {
            // Prefer the transcript captured when the budget ran out.
            let transcript = self
                .runtime
                .take_partial(call_id)
                .map(|partial| partial.transcript)
                .unwrap_or(transcript);
            if let Some(answer) = self.extract_fallback(call_id, depth, &query, &transcript).await {
                self.finalize(call_id, answer).await;
                return;
            }
        }

        let Some(mut state) = self.runtime.take_call(call_id) else {
            self.stale(call_id, "FailCall");
            return;
        };
        state.sandbox.shutdown().await;

        info!(call_id = %call_id, error = %error, "call failed");
        self.runtime.emit(RlmEvent::CallFailed {
            call_id,
            error: error.to_string(),
        });
        if let Some(reply) = state.reply.take() {
            let _ = reply.send(Err(error));
        }
    }

    /// Exactly one extra model call when budget or iterations ran out:
    /// a short "answer now" prompt with no tools. Spends one llm-call
    /// unit if available; returns the extracted (or raw) answer.
    async fn extract_fallback(
        &self,
        call_id: CallId,
        depth: u32,
        query: &str,
        transcript: &[TranscriptEntry],
    ) -> Option<String> {
        if self
            .runtime
            .budget
            .try_reserve(BudgetResource::LlmCalls, call_id)
            .is_err()
        {
            return None;
        }

        let response = {
            let _permit = self.runtime.llm_semaphore.acquire().await.ok()?;
            let request = GenerateRequest {
                messages: build_extract_prompt(query, transcript),
                depth,
                is_sub_call: depth > 0,
            };
            self.model.generate_text(request).await
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                debug!(call_id = %call_id, error = %err, "extract fallback model call failed");
                return None;
            }
        };

        if let Some(tokens) = response.total_tokens {
            self.runtime.budget.record_tokens(tokens);
        }
        self.runtime.emit(RlmEvent::ModelResponse {
            call_id,
            text: response.text.clone(),
            total_tokens: response.total_tokens,
        });

        let answer = extract_final(&response.text)
            .unwrap_or_else(|| response.text.trim().to_string());
        if answer.is_empty() {
            None
        } else {
            Some(answer)
        }
    }
}
