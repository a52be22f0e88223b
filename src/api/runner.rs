//! Fluent runner executing a chain step by step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::chain::flow::{FlowMap, LoopBudget, Next, DEFAULT_LOOP_LIMIT};
use crate::chain::{Chain, PromptLookup, PromptStep, Step, StepKind};
use crate::continuation::{Checkpoint, ContinuationStore};
use crate::core::utils::normalize_identifier;
use crate::metering::Scope;
use crate::predictor::{Continuation, FunctionCall, PromptMessage, RunContext};
use crate::prompt_step::{PromptCall, PromptStepExecutor};
use crate::query::QueryExecutor;
use crate::result::{RunResult, StepResult, StepSummary};
use crate::snippet::SnippetExecutor;
use crate::template::resolve;

type StepCallback<'a> = Box<dyn Fn(&StepSummary) + Send + Sync + 'a>;
type PartialCallback<'a> = Box<dyn Fn(&str) + Send + Sync + 'a>;

fn ignore_partial(_: &str) {}

/// Executors and stores shared by every run.
pub struct ChainRunner {
    prompts: PromptStepExecutor,
    snippets: SnippetExecutor,
    queries: QueryExecutor,
    continuations: ContinuationStore,
    lookup: Arc<dyn PromptLookup>,
    loop_limit: u32,
}

impl ChainRunner {
    pub fn new(
        prompts: PromptStepExecutor,
        snippets: SnippetExecutor,
        queries: QueryExecutor,
        continuations: ContinuationStore,
        lookup: Arc<dyn PromptLookup>,
    ) -> Self {
        Self {
            prompts,
            snippets,
            queries,
            continuations,
            lookup,
            loop_limit: DEFAULT_LOOP_LIMIT,
        }
    }

    /// Caps how many times a loop body may be traversed.
    pub fn with_loop_limit(mut self, loop_limit: u32) -> Self {
        self.loop_limit = loop_limit.max(1);
        self
    }

    /// Starts configuring a run of `chain`.
    pub fn chain<'a>(&'a self, chain: &'a Chain) -> ChainRun<'a> {
        ChainRun {
            runner: self,
            chain,
            inputs: HashMap::new(),
            scope: Scope::default(),
            version: String::new(),
            external: false,
            continuation: None,
            on_step: None,
            on_partial: None,
            abort: AbortSignal::new(),
        }
    }
}

/// A fluent builder for one invocation of a chain.
pub struct ChainRun<'a> {
    runner: &'a ChainRunner,
    chain: &'a Chain,
    inputs: HashMap<String, String>,
    scope: Scope,
    version: String,
    external: bool,
    continuation: Option<String>,
    on_step: Option<StepCallback<'a>>,
    on_partial: Option<PartialCallback<'a>>,
    abort: AbortSignal,
}

/// Mutable state of a run in progress.
struct RunState {
    inputs: HashMap<String, String>,
    context: RunContext,
    resume_index: Option<usize>,
    pending: Option<FunctionCall>,
    request_continuation: bool,
}

impl RunState {
    fn clear_resume_point(&mut self) {
        self.resume_index = None;
        self.pending = None;
        self.request_continuation = false;
    }
}

impl<'a> ChainRun<'a> {
    /// Sets the initial inputs, overriding the chain's default vars.
    pub fn inputs(
        mut self,
        inputs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.inputs = inputs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Version of the chain being run; scopes durable continuation ids.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Marks the run as triggered from outside the platform.
    ///
    /// External runs normalize variable names and keep continuations in
    /// the expiring store.
    pub fn external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    /// Resumes from a continuation id returned by an earlier run.
    pub fn continuation(mut self, id: impl Into<String>) -> Self {
        self.continuation = Some(id.into());
        self
    }

    pub fn on_step<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StepSummary) + Send + Sync + 'a,
    {
        self.on_step = Some(Box::new(callback));
        self
    }

    /// Receives streamed model text as it arrives.
    pub fn on_partial<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'a,
    {
        self.on_partial = Some(Box::new(callback));
        self
    }

    pub fn abort(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    fn var_name(&self, name: &str) -> String {
        if self.external {
            normalize_identifier(name)
        } else {
            name.to_string()
        }
    }

    /// Returns a copy of `inputs` with `name` set to `value`.
    fn with_output(
        &self,
        inputs: &HashMap<String, String>,
        name: &str,
        value: &str,
    ) -> HashMap<String, String> {
        let mut next = inputs.clone();
        next.insert(self.var_name(name), value.to_string());
        next
    }

    /// Executes the chain and reports the aggregate result.
    pub async fn run(self) -> RunResult {
        let steps = &self.chain.steps;
        let runner = self.runner;

        let caller: HashMap<String, String> = self
            .inputs
            .iter()
            .map(|(k, v)| (self.var_name(k), v.clone()))
            .collect();
        let resumed = runner
            .continuations
            .load(self.continuation.as_deref(), &caller, self.external)
            .await;
        let mut inputs = resumed.inputs;
        if !resumed.restored {
            // Chain defaults sit under everything, and only when nothing was stored.
            for (name, value) in &self.chain.vars {
                inputs
                    .entry(self.var_name(name))
                    .or_insert_with(|| value.clone());
            }
        }
        let mut state = RunState {
            inputs,
            context: resumed.context,
            resume_index: resumed.resume_index,
            pending: resumed.pending_function_call,
            request_continuation: resumed.request_continuation,
        };

        let flow = FlowMap::new(steps);
        let mut budget = LoopBudget::new(runner.loop_limit);
        let mut index = state.resume_index.unwrap_or(0);
        let mut active = steps
            .get(index)
            .map(|s| s.branch.clone())
            .unwrap_or_default();
        let mut result = RunResult::default();
        let mut paused = false;

        info!(
            steps = steps.len(),
            start = index,
            external = self.external,
            resumed = self.continuation.is_some(),
            "chain run started"
        );

        while index < steps.len() {
            if self.abort.is_aborted() {
                info!(step_index = index, "chain run aborted");
                result.aborted = true;
                break;
            }
            let step = &steps[index];
            if step.branch != active {
                debug!(
                    step_index = index,
                    branch = %step.branch,
                    active = %active,
                    "skipping step"
                );
                index += 1;
                continue;
            }

            let started = Instant::now();
            let (step_result, next_context) = self.dispatch(step, &state).await;
            let elapsed = started.elapsed();
            result.absorb(&step_result, elapsed);

            if let Some(on_step) = &self.on_step {
                on_step(&StepSummary {
                    index,
                    output: step_result.output.clone(),
                    error: step_result.error.clone(),
                    cost: step_result.cost,
                    duration: elapsed,
                    can_loop: flow.can_loop(index),
                });
            }

            if step_result.failed {
                warn!(
                    step_index = index,
                    kind = step.kind.name(),
                    error = step_result.display_text(),
                    "step failed; stopping run"
                );
                state.clear_resume_point();
                break;
            }
            if let Some(context) = next_context {
                state.context = context;
            }
            if let Some(name) = step.output() {
                state.inputs = self.with_output(&state.inputs, name, step_result.display_text());
            }

            if let Some(call) = step_result.interrupt.clone() {
                if self.external {
                    info!(step_index = index, function = %call.name, "pausing for caller");
                    state.resume_index = Some(index);
                    state.pending = Some(call);
                    state.request_continuation = true;
                    paused = true;
                    break;
                }
                // A recovered restart has a resume point but no call to answer.
                if state.resume_index != Some(index) || state.pending.is_none() {
                    debug!(
                        step_index = index,
                        function = %call.name,
                        "re-running step with tool result"
                    );
                    state.resume_index = Some(index);
                    state.pending = Some(call);
                    state.request_continuation = true;
                    continue;
                }
                state.clear_resume_point();
                index += 1;
                continue;
            }
            if state.resume_index == Some(index) {
                state.clear_resume_point();
            }

            match &step.kind {
                StepKind::Branch { branches, .. } => {
                    let label = step_result.display_text();
                    match flow.after_branch(index, label, branches, &mut budget) {
                        Next::Goto { index: next, branch } => {
                            debug!(step_index = index, next, branch = %branch, "branch selected");
                            index = next;
                            active = branch;
                        }
                        Next::End => break,
                    }
                }
                _ => index += 1,
            }
        }

        if self.abort.is_aborted() {
            result.aborted = true;
        }

        let saved = runner
            .continuations
            .save(Checkpoint {
                id: self.continuation.as_deref(),
                resume_index: state.resume_index,
                pending_function_call: state.pending.as_ref(),
                request_continuation: state.request_continuation,
                context: &state.context,
                inputs: &state.inputs,
                owning_version: &self.version,
                externally_triggered: self.external,
                paused,
            })
            .await;
        match saved {
            Ok(id) => result.continuation_id = id,
            Err(e) => {
                warn!(error = %e, "failed to save continuation");
                result.failed = true;
                result.error = Some(format!("Failed to save continuation: {}", e));
            }
        }

        info!(
            steps_executed = result.steps_executed,
            cost = result.cost,
            failed = result.failed,
            paused,
            "chain run finished"
        );
        result.inputs = state.inputs;
        result.context = state.context;
        result
    }

    /// Runs one step. Prompt steps also return the context to carry on.
    async fn dispatch(&self, step: &Step, state: &RunState) -> (StepResult, Option<RunContext>) {
        let runner = self.runner;
        match &step.kind {
            StepKind::Prompt(prompt) => {
                let (result, context) = self.run_prompt(prompt, state).await;
                (result, Some(context))
            }
            StepKind::Snippet { code, .. } => {
                (runner.snippets.run(code, &state.inputs).await, None)
            }
            StepKind::Branch { code, branches } => {
                let result = runner.snippets.run(code, &state.inputs).await;
                (select_label(result, branches), None)
            }
            StepKind::Query {
                query,
                vector_provider,
                index,
                embedding,
                top_k,
                ..
            } => {
                let text = resolve(query, &state.inputs, self.external);
                let result = runner
                    .queries
                    .run(&self.scope, *vector_provider, embedding, index, &text, *top_k)
                    .await;
                (result, None)
            }
        }
    }

    async fn run_prompt(&self, step: &PromptStep, state: &RunState) -> (StepResult, RunContext) {
        let version = match self.runner.lookup.prompt(&step.prompt).await {
            Ok(v) => v,
            Err(e) => return (StepResult::failure(e), state.context.clone()),
        };
        let prompts: Vec<PromptMessage> = version
            .messages
            .iter()
            .map(|m| PromptMessage::new(m.role, resolve(&m.content, &state.inputs, self.external)))
            .collect();
        let on_partial: &(dyn Fn(&str) + Send + Sync) = match &self.on_partial {
            Some(cb) => cb.as_ref(),
            None => &ignore_partial,
        };

        self.runner
            .prompts
            .run(PromptCall {
                scope: &self.scope,
                prompts: &prompts,
                model: &version.model,
                context: &state.context,
                use_previous_context: step.include_context
                    || (state.request_continuation && state.pending.is_some()),
                on_partial,
                abort: &self.abort,
                continuation: state.pending.as_ref().map(|pending| Continuation {
                    pending,
                    inputs: &state.inputs,
                    identifier_casing: self.external,
                }),
            })
            .await
    }
}

/// Turns a branch script result into the selected label.
fn select_label(result: StepResult, branches: &[String]) -> StepResult {
    if result.failed {
        return result;
    }
    let label = match &result.structured {
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => result.display_text().trim().to_string(),
    };
    if branches.iter().any(|b| *b == label) {
        StepResult {
            output: Some(label),
            ..result
        }
    } else {
        StepResult::failure(format!("Branch '{}' is not declared by this step", label))
    }
}
