use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use foreman_config::{Config, TierPricing, TokenBudget};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventKind, TaskEvent};
use crate::checkpoint::{MarkerClassifier, UncertaintyClassifier};
use crate::context::{extract_keywords, ContextBuilder};
use crate::dispatch::ToolDispatcher;
use crate::ledger::{call_cost, estimate_call_cost, Breach, CostLogEntry, Ledger, SpendScope};
use crate::memory::{LongTermItem, MemoryStore};
use crate::provider::{ModelProvider, ToolResultTurn, Turn};
use crate::router::Router;
use crate::task::{Task, TaskStatus, Tier};

/// Signals delivered to a running task loop from the outside.
enum Control {
    Resume(String),
    Cancel,
}

struct TaskHandle {
    control: mpsc::Sender<Control>,
}

/// Counts of live tasks plus current spend, for the status surface.
#[derive(Debug, Clone)]
pub struct StatusSummary {
    pub pending: usize,
    pub running: usize,
    pub checkpoint_wait: usize,
    pub today_usd: f64,
    pub month_usd: f64,
}

impl std::fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Queue: {} | Active: {} | Waiting: {}",
            self.pending, self.running, self.checkpoint_wait
        )?;
        write!(
            f,
            "Today: ${:.4} | Month: ${:.4}",
            self.today_usd, self.month_usd
        )
    }
}

enum Raced<T> {
    Done(T),
    Cancelled,
}

/// Run `fut` to completion unless a cancel signal arrives first. Resume
/// signals received mid-flight are ignored; only one resume transition is
/// ever honored, and only out of a checkpoint.
async fn race_control<T>(
    fut: impl Future<Output = T>,
    control: &mut mpsc::Receiver<Control>,
) -> Raced<T> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Raced::Done(out),
            ctrl = control.recv() => match ctrl {
                Some(Control::Cancel) | None => return Raced::Cancelled,
                Some(Control::Resume(_)) => {
                    warn!("ignoring resume: task is mid-call, not at a checkpoint");
                }
            },
        }
    }
}

enum CheckpointOutcome {
    Resumed(String),
    Cancelled,
    /// Control channel closed; leave the task suspended in the store.
    Closed,
}

fn budget_summary(breach: &Breach, partial: Option<&str>) -> String {
    match partial {
        Some(p) => format!("Task halted: {breach}.\n\nPartial progress:\n{p}"),
        None => format!("Task halted: {breach}. No partial results yet."),
    }
}

fn steps_summary(max_steps: u32, partial: Option<&str>) -> String {
    match partial {
        Some(p) => format!("Step limit ({max_steps}) reached.\n\nPartial progress:\n{p}"),
        None => format!("Step limit ({max_steps}) reached with no partial results."),
    }
}

/// Char-safe excerpt for archived summaries.
fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

/// Drives every task through the state machine:
/// pending -> running -> {running, checkpoint_wait} ->
/// {completed, aborted_budget, aborted_steps, failed, cancelled}.
///
/// Each submitted task runs as its own tokio task; loops never block each
/// other and only contend on the serialized ledger service.
pub struct Orchestrator {
    cfg: Config,
    provider: Arc<dyn ModelProvider>,
    dispatcher: Arc<dyn ToolDispatcher>,
    ledger: Ledger,
    memory: Arc<MemoryStore>,
    router: Router,
    context: ContextBuilder,
    classifier: Arc<dyn UncertaintyClassifier>,
    bus: EventBus,
    tasks: DashMap<String, TaskHandle>,
}

impl Orchestrator {
    pub fn new(
        cfg: Config,
        provider: Arc<dyn ModelProvider>,
        dispatcher: Arc<dyn ToolDispatcher>,
        ledger: Ledger,
        memory: Arc<MemoryStore>,
    ) -> Arc<Self> {
        Self::with_classifier(
            cfg,
            provider,
            dispatcher,
            ledger,
            memory,
            Arc::new(MarkerClassifier::new()),
        )
    }

    pub fn with_classifier(
        cfg: Config,
        provider: Arc<dyn ModelProvider>,
        dispatcher: Arc<dyn ToolDispatcher>,
        ledger: Ledger,
        memory: Arc<MemoryStore>,
        classifier: Arc<dyn UncertaintyClassifier>,
    ) -> Arc<Self> {
        let router = Router::new(provider.clone(), ledger.clone(), cfg.clone());
        let context = ContextBuilder::new(memory.clone(), cfg.memory.clone());
        Arc::new(Self {
            cfg,
            provider,
            dispatcher,
            ledger,
            memory,
            router,
            context,
            classifier,
            bus: EventBus::default(),
            tasks: DashMap::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.bus.subscribe()
    }

    /// Accept a task and start its loop. Returns the task id immediately.
    pub async fn submit(
        self: &Arc<Self>,
        text: &str,
        origin: &str,
        tier_override: Option<Tier>,
    ) -> Result<String> {
        let task = Task::new(text, origin);
        let task_id = task.id.clone();
        self.memory.insert_task(&task)?;

        let (control_tx, control_rx) = mpsc::channel(8);
        self.tasks.insert(task_id.clone(), TaskHandle { control: control_tx });

        info!("[{task_id}] submitted from {origin}");
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_task(task, tier_override, control_rx).await;
        });

        Ok(task_id)
    }

    /// Deliver user input to a task waiting at a checkpoint. A resume sent
    /// to a task that is not waiting is ignored by the loop.
    pub async fn resume(&self, task_id: &str, input: &str) -> Result<()> {
        let control = self
            .tasks
            .get(task_id)
            .map(|h| h.control.clone())
            .ok_or_else(|| anyhow::anyhow!("no active task '{task_id}'"))?;
        control
            .send(Control::Resume(input.to_string()))
            .await
            .map_err(|_| anyhow::anyhow!("task '{task_id}' is no longer running"))
    }

    /// Cancel a task from any state. In-flight model or tool calls are
    /// abandoned best-effort; no further model calls will be issued.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let control = self
            .tasks
            .get(task_id)
            .map(|h| h.control.clone())
            .ok_or_else(|| anyhow::anyhow!("no active task '{task_id}'"))?;
        control
            .send(Control::Cancel)
            .await
            .map_err(|_| anyhow::anyhow!("task '{task_id}' is no longer running"))
    }

    pub async fn status(&self) -> Result<StatusSummary> {
        let active = self.memory.active_tasks()?;
        let count = |status: TaskStatus| {
            active
                .iter()
                .filter(|t| t.status == status.as_str())
                .count()
        };
        Ok(StatusSummary {
            pending: count(TaskStatus::Pending),
            running: count(TaskStatus::Running),
            checkpoint_wait: count(TaskStatus::CheckpointWait),
            today_usd: self.ledger.spent(SpendScope::Today).await?,
            month_usd: self.ledger.spent(SpendScope::ThisMonth).await?,
        })
    }

    /// Fail tasks left non-terminal by a previous process. Call at startup,
    /// before accepting new work.
    pub fn recover_stale(&self) -> Result<Vec<String>> {
        let recovered = self
            .memory
            .recover_stale_tasks("recovered after restart: task was in flight")?;
        for id in &recovered {
            warn!("[{id}] recovered stale task");
        }
        Ok(recovered)
    }

    fn tier_budget(&self, tier: Tier) -> TokenBudget {
        match tier {
            Tier::Fast => self.cfg.tokens.fast,
            Tier::Deep => self.cfg.tokens.deep,
        }
    }

    fn tier_pricing(&self, tier: Tier) -> TierPricing {
        match tier {
            Tier::Fast => self.cfg.pricing.fast,
            Tier::Deep => self.cfg.pricing.deep,
        }
    }

    async fn run_task(
        self: Arc<Self>,
        mut task: Task,
        tier_override: Option<Tier>,
        mut control: mpsc::Receiver<Control>,
    ) {
        let task_id = task.id.clone();
        if let Err(e) = self.drive(&mut task, tier_override, &mut control).await {
            // Unrecoverable model/parse/store error: report verbatim and
            // never retry within this task.
            warn!("[{task_id}] failed: {e:#}");
            if !task.status.is_terminal() {
                task.outcome = Some(format!("{e:#}"));
                if let Err(te) = task.advance(TaskStatus::Failed) {
                    warn!("[{task_id}] {te}");
                    task.status = TaskStatus::Failed;
                }
                if let Err(se) = self.memory.update_task(&task) {
                    warn!("[{task_id}] failed to persist failure: {se:#}");
                }
                if let Err(se) = self.memory.clear_session(&task_id) {
                    warn!("[{task_id}] failed to clear session memory: {se:#}");
                }
                self.bus.emit(&task_id, EventKind::Error, format!("{e:#}"));
            }
        }
        self.tasks.remove(&task_id);
    }

    async fn drive(
        &self,
        task: &mut Task,
        tier_override: Option<Tier>,
        control: &mut mpsc::Receiver<Control>,
    ) -> Result<()> {
        let decision = self
            .router
            .route(&task.id, &task.description.clone(), tier_override)
            .await?;
        task.tier = Some(decision.tier);
        task.description = decision.text;
        task.cost_usd = decision.classification_cost;
        task.advance(TaskStatus::Running)?;
        self.memory.update_task(task)?;
        self.bus.emit(
            &task.id,
            EventKind::Progress,
            format!("routed to {} tier", decision.tier.as_str()),
        );

        let tier = decision.tier;
        let budget = self.tier_budget(tier);
        let pricing = self.tier_pricing(tier);
        let tools = self.dispatcher.schemas();
        let tool_timeout = Duration::from_secs(self.cfg.limits.tool_timeout_secs);
        let max_steps = self.cfg.limits.max_steps;
        let threshold = (max_steps as f64 * self.cfg.limits.checkpoint_ratio).ceil() as u32;
        let mut threshold_fired = false;

        let mut transcript = vec![Turn::User {
            text: task.description.clone(),
        }];
        let mut partial: Option<String> = None;

        loop {
            // Only cancellation is honored while running; a second resume is
            // a no-op.
            loop {
                match control.try_recv() {
                    Ok(Control::Cancel) => {
                        return self
                            .finish(task, TaskStatus::Cancelled, "Task cancelled.".into())
                            .await;
                    }
                    Ok(Control::Resume(_)) => {
                        warn!("[{}] ignoring resume: task already running", task.id);
                    }
                    Err(_) => break,
                }
            }

            // 1. Budget pre-check: a call is never issued if it could breach
            // a ceiling, so recorded spend stays strictly under it.
            let estimated = estimate_call_cost(&budget, &pricing);
            if let Some(breach) = self.ledger.check(&task.id, estimated).await? {
                info!("[{}] {breach}", task.id);
                let summary = budget_summary(&breach, partial.as_deref());
                return self.finish(task, TaskStatus::AbortedBudget, summary).await;
            }

            // 2. Hard step ceiling.
            if task.step >= max_steps {
                let summary = steps_summary(max_steps, partial.as_deref());
                return self.finish(task, TaskStatus::AbortedSteps, summary).await;
            }

            // 3. Threshold checkpoint, once per task: surface a pause before
            // exhaustion so the user can redirect or top up.
            if !threshold_fired && task.step >= threshold {
                threshold_fired = true;
                let question = format!(
                    "Approaching the step limit ({}/{max_steps}). Continue?",
                    task.step
                );
                match self.checkpoint(task, control, question).await? {
                    CheckpointOutcome::Resumed(input) => {
                        transcript.push(Turn::User { text: input });
                        continue;
                    }
                    CheckpointOutcome::Cancelled => {
                        return self
                            .finish(task, TaskStatus::Cancelled, "Task cancelled.".into())
                            .await;
                    }
                    CheckpointOutcome::Closed => return Ok(()),
                }
            }

            // 4. Model call at the assigned tier.
            let prompt = self
                .context
                .build(task, &transcript, &tools, budget.max_input)?;
            let call = self
                .provider
                .call(tier, &prompt, &tools, budget.max_output);
            let response = match race_control(call, control).await {
                Raced::Cancelled => {
                    return self
                        .finish(task, TaskStatus::Cancelled, "Task cancelled.".into())
                        .await;
                }
                Raced::Done(result) => result?,
            };

            // Cost is recorded unconditionally; a failure to record means the
            // spend is not durable and the step must not proceed.
            let cost = call_cost(
                response.usage.input_tokens,
                response.usage.output_tokens,
                &pricing,
            );
            self.ledger
                .record(CostLogEntry::now(
                    &task.id,
                    tier,
                    self.provider.model_name(tier),
                    response.usage.input_tokens,
                    response.usage.output_tokens,
                    cost,
                ))
                .await?;
            task.cost_usd += cost;
            debug!(
                "[{}] step {}: model returned {} tool call(s), {} chars (${cost:.6})",
                task.id,
                task.step + 1,
                response.tool_calls.len(),
                response.text.len()
            );

            if !response.text.is_empty() {
                partial = Some(response.text.clone());
            }

            // 5. Interpret: tool calls, uncertainty, or final answer.
            if response.tool_calls.is_empty() {
                if self.classifier.is_uncertain(&response.text) {
                    transcript.push(Turn::Assistant {
                        text: response.text.clone(),
                        tool_calls: Vec::new(),
                    });
                    match self.checkpoint(task, control, response.text).await? {
                        CheckpointOutcome::Resumed(input) => {
                            transcript.push(Turn::User { text: input });
                            continue;
                        }
                        CheckpointOutcome::Cancelled => {
                            return self
                                .finish(task, TaskStatus::Cancelled, "Task cancelled.".into())
                                .await;
                        }
                        CheckpointOutcome::Closed => return Ok(()),
                    }
                }

                let answer = if response.text.is_empty() {
                    "The task finished without a text answer.".to_string()
                } else {
                    response.text
                };
                return self.finish(task, TaskStatus::Completed, answer).await;
            }

            // 6. Dispatch tool calls sequentially, in request order. Failures
            // are fed back to the model, not fatal to the loop.
            let step_no = task.step + 1;
            transcript.push(Turn::Assistant {
                text: response.text.clone(),
                tool_calls: response.tool_calls.clone(),
            });

            let mut results = Vec::with_capacity(response.tool_calls.len());
            for tc in &response.tool_calls {
                info!("[{}] step {step_no}: {}", task.id, tc.name);
                let invoke = self
                    .dispatcher
                    .invoke(&tc.name, tc.arguments.clone(), tool_timeout);
                let outcome = match race_control(invoke, control).await {
                    Raced::Cancelled => {
                        return self
                            .finish(task, TaskStatus::Cancelled, "Task cancelled.".into())
                            .await;
                    }
                    Raced::Done(outcome) => outcome,
                };
                let result_text = match outcome {
                    Ok(reply) if reply.truncated => {
                        format!("{}\n[output truncated]", reply.content)
                    }
                    Ok(reply) => reply.content,
                    Err(failure) => format!("Error: {failure}"),
                };

                // Exactly one session item per result, tied to this step.
                self.memory
                    .append_session(&task.id, step_no, &format!("[{}] {result_text}", tc.name))?;
                results.push(ToolResultTurn {
                    id: tc.id.clone(),
                    call_id: tc.call_id.clone(),
                    name: tc.name.clone(),
                    content: result_text,
                });
            }

            let result_count = results.len();
            transcript.push(Turn::ToolResults { results });
            task.step = step_no;
            self.memory.update_task(task)?;
            self.bus.emit(
                &task.id,
                EventKind::Progress,
                format!("step {step_no}/{max_steps}: {result_count} tool call(s)"),
            );
        }
    }

    /// Suspend until an external resume or cancel arrives. No timeout; the
    /// task consumes nothing while waiting.
    async fn checkpoint(
        &self,
        task: &mut Task,
        control: &mut mpsc::Receiver<Control>,
        question: String,
    ) -> Result<CheckpointOutcome> {
        task.advance(TaskStatus::CheckpointWait)?;
        self.memory.update_task(task)?;
        self.bus
            .emit(&task.id, EventKind::CheckpointQuestion, question);
        info!("[{}] waiting at checkpoint", task.id);

        match control.recv().await {
            Some(Control::Resume(input)) => {
                task.advance(TaskStatus::Running)?;
                self.memory.update_task(task)?;
                info!("[{}] resumed", task.id);
                Ok(CheckpointOutcome::Resumed(input))
            }
            Some(Control::Cancel) => Ok(CheckpointOutcome::Cancelled),
            None => {
                warn!("[{}] control channel closed at checkpoint", task.id);
                Ok(CheckpointOutcome::Closed)
            }
        }
    }

    /// Enter a terminal state: persist the outcome, archive or discard the
    /// session memory, and emit the final event.
    async fn finish(&self, task: &mut Task, status: TaskStatus, outcome: String) -> Result<()> {
        task.outcome = Some(outcome.clone());
        task.advance(status)?;
        self.memory.update_task(task)?;

        if status == TaskStatus::Completed && self.cfg.memory.archive_on_complete {
            let summary = format!(
                "{}: {}",
                excerpt(&task.description, 200),
                excerpt(&outcome, 300)
            );
            let item = LongTermItem {
                id: format!("task-{}", task.id),
                content: summary,
                tags: extract_keywords(&task.description, 5),
                origin: task.origin.clone(),
                created_at: Utc::now().to_rfc3339(),
            };
            if let Err(e) = self.memory.promote_long_term(&item) {
                warn!("[{}] failed to archive task summary: {e:#}", task.id);
            }
        }
        if let Err(e) = self.memory.clear_session(&task.id) {
            warn!("[{}] failed to clear session memory: {e:#}", task.id);
        }

        let kind = match status {
            TaskStatus::Failed => EventKind::Error,
            _ => EventKind::FinalResult,
        };
        self.bus.emit(&task.id, kind, outcome);
        info!(
            "[{}] finished: {} after {} step(s), ${:.4}",
            task.id,
            status.as_str(),
            task.step,
            task.cost_usd
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchFailure, ToolReply, ToolSchema};
    use crate::ledger::LedgerStore;
    use crate::provider::{ModelResponse, Prompt, TokenUsage, ToolCallRequest};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<ModelResponse, String>>>,
        prompts: Mutex<Vec<Prompt>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<ModelResponse, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        fn prompt(&self, index: usize) -> Prompt {
            self.prompts.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn model_name(&self, tier: Tier) -> &str {
            match tier {
                Tier::Fast => "mock-fast",
                Tier::Deep => "mock-deep",
            }
        }

        async fn call(
            &self,
            _tier: Tier,
            prompt: &Prompt,
            _tools: &[ToolSchema],
            _max_tokens: u64,
        ) -> Result<ModelResponse> {
            self.prompts.lock().unwrap().push(prompt.clone());
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(resp)) => Ok(resp),
                Some(Err(msg)) => anyhow::bail!(msg),
                None => anyhow::bail!("provider script exhausted"),
            }
        }
    }

    struct ScriptedDispatcher {
        script: Mutex<VecDeque<Result<ToolReply, DispatchFailure>>>,
        invoked: Mutex<Vec<String>>,
    }

    impl ScriptedDispatcher {
        fn new(script: Vec<Result<ToolReply, DispatchFailure>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                invoked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolDispatcher for ScriptedDispatcher {
        fn schemas(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: "work".into(),
                description: "Do some work".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }]
        }

        async fn invoke(
            &self,
            name: &str,
            _args: serde_json::Value,
            _timeout: Duration,
        ) -> Result<ToolReply, DispatchFailure> {
            let count = {
                let mut invoked = self.invoked.lock().unwrap();
                invoked.push(name.to_string());
                invoked.len()
            };
            // "hang" parks forever so tests can cancel mid-dispatch.
            if name == "hang" {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(ToolReply {
                content: format!("ok {count}"),
                truncated: false,
            }))
        }
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 12_000,
            output_tokens: 4_000,
        }
    }

    fn final_text(text: &str) -> Result<ModelResponse, String> {
        Ok(ModelResponse {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: usage(),
        })
    }

    fn tool_step(text: &str, names: &[&str]) -> Result<ModelResponse, String> {
        Ok(ModelResponse {
            text: text.into(),
            tool_calls: names
                .iter()
                .enumerate()
                .map(|(i, n)| ToolCallRequest {
                    id: format!("call_{i}"),
                    call_id: None,
                    name: n.to_string(),
                    arguments: serde_json::json!({}),
                })
                .collect(),
            usage: usage(),
        })
    }

    fn reply(content: &str) -> Result<ToolReply, DispatchFailure> {
        Ok(ToolReply {
            content: content.into(),
            truncated: false,
        })
    }

    struct Harness {
        orch: Arc<Orchestrator>,
        provider: Arc<ScriptedProvider>,
        memory: Arc<MemoryStore>,
        ledger: Ledger,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        /// User-turn texts from the prompt of the n-th model call.
        fn prompt_user_turns(&self, call_index: usize) -> Vec<String> {
            self.provider
                .prompt(call_index)
                .turns
                .iter()
                .filter_map(|t| match t {
                    Turn::User { text } => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    fn harness(
        cfg: Config,
        provider_script: Vec<Result<ModelResponse, String>>,
        tool_script: Vec<Result<ToolReply, DispatchFailure>>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let ledger_store = LedgerStore::new(&dir.path().join("ledger.sqlite")).unwrap();
        let ledger = Ledger::spawn(ledger_store, cfg.budgets.clone());
        let memory = Arc::new(MemoryStore::new(&dir.path().join("memory.sqlite")).unwrap());
        let provider = ScriptedProvider::new(provider_script);
        let dispatcher = ScriptedDispatcher::new(tool_script);
        let orch = Orchestrator::new(
            cfg,
            provider.clone(),
            dispatcher,
            ledger.clone(),
            memory.clone(),
        );
        Harness {
            orch,
            provider,
            memory,
            ledger,
            _dir: dir,
        }
    }

    fn roomy_budgets() -> foreman_config::BudgetsConfig {
        foreman_config::BudgetsConfig {
            per_task_usd: 1_000.0,
            daily_usd: 1_000.0,
            monthly_usd: 1_000.0,
        }
    }

    async fn next_event_of(
        rx: &mut broadcast::Receiver<TaskEvent>,
        kinds: &[EventKind],
    ) -> TaskEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event bus closed");
            if kinds.contains(&event.kind) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn budget_precheck_blocks_before_breach() {
        let mut cfg = Config::default();
        cfg.budgets.per_task_usd = 0.75;
        cfg.budgets.daily_usd = 1_000.0;
        cfg.budgets.monthly_usd = 1_000.0;
        // Estimated and actual cost per Deep call: 12k*25/1M + 4k*50/1M = $0.50
        cfg.pricing.deep = TierPricing {
            input: 25.0,
            output: 50.0,
        };

        let h = harness(
            cfg,
            vec![
                tool_step("Found three result files so far.", &["work"]),
                final_text("should never be reached"),
            ],
            vec![reply("listing")],
        );
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("scan the results directory", "user:1", Some(Tier::Deep))
            .await
            .unwrap();

        let event = next_event_of(&mut rx, &[EventKind::FinalResult, EventKind::Error]).await;
        assert_eq!(event.kind, EventKind::FinalResult);
        assert!(event.payload.contains("budget"));
        assert!(event.payload.contains("Found three result files so far."));

        // The second call was never issued, and recorded spend stays at or
        // under the ceiling.
        assert_eq!(h.provider.calls(), 1);
        let spent = h
            .ledger
            .spent(SpendScope::Task(task_id.clone()))
            .await
            .unwrap();
        assert!((spent - 0.50).abs() < 1e-9);
        assert!(spent <= 0.75);

        let rec = h.memory.get_task(&task_id).unwrap().unwrap();
        assert_eq!(rec.status, "aborted_budget");
    }

    #[tokio::test]
    async fn session_items_follow_tool_call_order() {
        let mut cfg = Config::default();
        cfg.budgets = roomy_budgets();

        let h = harness(
            cfg,
            vec![
                tool_step("", &["alpha", "beta", "gamma"]),
                final_text("I'm not sure which file you want next."),
            ],
            vec![reply("one"), reply("two"), reply("three")],
        );
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("inspect the files", "user:1", Some(Tier::Deep))
            .await
            .unwrap();

        // The uncertainty checkpoint holds the task open so session memory
        // is still inspectable.
        next_event_of(&mut rx, &[EventKind::CheckpointQuestion]).await;

        let items = h.memory.session_items(&task_id).unwrap();
        let contents: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["[alpha] one", "[beta] two", "[gamma] three"]);
        assert!(items.iter().all(|i| i.step == 1));

        h.orch.cancel(&task_id).await.unwrap();
        let event = next_event_of(&mut rx, &[EventKind::FinalResult]).await;
        assert!(event.payload.contains("cancelled"));
    }

    #[tokio::test]
    async fn second_resume_is_a_noop() {
        let mut cfg = Config::default();
        cfg.budgets = roomy_budgets();

        let h = harness(
            cfg,
            vec![
                final_text("Should I proceed with option A?"),
                final_text("Done."),
            ],
            Vec::new(),
        );
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("pick an option", "user:1", Some(Tier::Deep))
            .await
            .unwrap();

        let question = next_event_of(&mut rx, &[EventKind::CheckpointQuestion]).await;
        assert!(question.payload.contains("option A"));
        let rec = h.memory.get_task(&task_id).unwrap().unwrap();
        assert_eq!(rec.status, "checkpoint_wait");

        h.orch.resume(&task_id, "go ahead").await.unwrap();
        // Second resume: either rejected (task already gone) or ignored.
        let _ = h.orch.resume(&task_id, "go ahead").await;

        let event = next_event_of(&mut rx, &[EventKind::FinalResult, EventKind::Error]).await;
        assert_eq!(event.payload, "Done.");

        // Only one resume transition was honored: the second model call saw
        // exactly one resume turn.
        assert_eq!(h.provider.calls(), 2);
        let resume_turns = h
            .prompt_user_turns(1)
            .iter()
            .filter(|t| t.as_str() == "go ahead")
            .count();
        assert_eq!(resume_turns, 1);
    }

    #[tokio::test]
    async fn checkpoint_at_70_percent_of_step_ceiling() {
        let mut cfg = Config::default();
        cfg.budgets = roomy_budgets();
        assert_eq!(cfg.limits.max_steps, 10);

        let script = (0..7).map(|_| tool_step("", &["work"])).collect();
        let h = harness(cfg, script, Vec::new());
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("long multi-step job", "user:1", Some(Tier::Deep))
            .await
            .unwrap();

        let question = next_event_of(&mut rx, &[EventKind::CheckpointQuestion]).await;
        assert!(question.payload.contains("7/10"));
        assert_eq!(h.provider.calls(), 7);

        let rec = h.memory.get_task(&task_id).unwrap().unwrap();
        assert_eq!(rec.status, "checkpoint_wait");
        assert_eq!(rec.steps, 7);

        // Suspended: no further model calls until an external signal.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.provider.calls(), 7);

        h.orch.cancel(&task_id).await.unwrap();
        next_event_of(&mut rx, &[EventKind::FinalResult]).await;
        let rec = h.memory.get_task(&task_id).unwrap().unwrap();
        assert_eq!(rec.status, "cancelled");
        assert_eq!(h.provider.calls(), 7);
    }

    #[tokio::test]
    async fn tool_failure_feeds_back_and_increments_step() {
        let mut cfg = Config::default();
        cfg.budgets = roomy_budgets();

        let h = harness(
            cfg,
            vec![tool_step("", &["work"]), final_text("Recovered.")],
            vec![Err(DispatchFailure::Failed {
                tool: "work".into(),
                reason: "exploded".into(),
            })],
        );
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("fragile job", "user:1", Some(Tier::Deep))
            .await
            .unwrap();

        let event = next_event_of(&mut rx, &[EventKind::FinalResult, EventKind::Error]).await;
        assert_eq!(event.kind, EventKind::FinalResult);
        assert_eq!(event.payload, "Recovered.");

        // The loop kept running: the failure went back into the transcript
        // and the step counter moved by exactly one.
        assert_eq!(h.provider.calls(), 2);
        let second_prompt = h.provider.prompt(1);
        let failure_fed_back = second_prompt.turns.iter().any(|t| match t {
            Turn::ToolResults { results } => results
                .iter()
                .any(|r| r.content.contains("Error:") && r.content.contains("exploded")),
            _ => false,
        });
        assert!(failure_fed_back);

        let rec = h.memory.get_task(&task_id).unwrap().unwrap();
        assert_eq!(rec.status, "completed");
        assert_eq!(rec.steps, 1);
    }

    #[tokio::test]
    async fn model_failure_reports_error_verbatim() {
        let mut cfg = Config::default();
        cfg.budgets = roomy_budgets();

        let h = harness(cfg, vec![Err("upstream timed out".into())], Vec::new());
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("doomed job", "user:1", Some(Tier::Deep))
            .await
            .unwrap();

        let event = next_event_of(&mut rx, &[EventKind::FinalResult, EventKind::Error]).await;
        assert_eq!(event.kind, EventKind::Error);
        assert!(event.payload.contains("upstream timed out"));

        let rec = h.memory.get_task(&task_id).unwrap().unwrap();
        assert_eq!(rec.status, "failed");
    }

    #[tokio::test]
    async fn completed_task_archives_summary_and_clears_session() {
        let mut cfg = Config::default();
        cfg.budgets = roomy_budgets();
        assert!(cfg.memory.archive_on_complete);

        let h = harness(
            cfg,
            vec![
                tool_step("", &["work"]),
                final_text("Wrote the summary to notes.md."),
            ],
            vec![reply("file contents")],
        );
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("summarize experiment logs", "user:1", Some(Tier::Deep))
            .await
            .unwrap();

        next_event_of(&mut rx, &[EventKind::FinalResult]).await;

        assert!(h.memory.session_items(&task_id).unwrap().is_empty());
        let archived = h
            .memory
            .search_long_term(&["summarize".to_string()], 5)
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, format!("task-{task_id}"));
        assert!(archived[0].content.contains("notes.md"));
    }

    #[tokio::test]
    async fn cancel_while_running_stops_the_loop() {
        let mut cfg = Config::default();
        cfg.budgets = roomy_budgets();

        // The dispatch never returns; cancellation is the only way out.
        let script = vec![tool_step("", &["hang"])];
        let h = harness(cfg, script, Vec::new());
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("spinning job", "user:1", Some(Tier::Deep))
            .await
            .unwrap();

        next_event_of(&mut rx, &[EventKind::Progress]).await;
        h.orch.cancel(&task_id).await.unwrap();

        let event = next_event_of(&mut rx, &[EventKind::FinalResult, EventKind::Error]).await;
        assert!(event.payload.contains("cancelled"));
        let rec = h.memory.get_task(&task_id).unwrap().unwrap();
        assert_eq!(rec.status, "cancelled");
    }

    #[tokio::test]
    async fn status_counts_active_tasks_and_spend() {
        let mut cfg = Config::default();
        cfg.budgets = roomy_budgets();

        let h = harness(
            cfg,
            vec![final_text("Which approach do you prefer?")],
            Vec::new(),
        );
        let mut rx = h.orch.subscribe();
        let task_id = h
            .orch
            .submit("ambiguous job", "user:1", Some(Tier::Deep))
            .await
            .unwrap();
        next_event_of(&mut rx, &[EventKind::CheckpointQuestion]).await;

        let status = h.orch.status().await.unwrap();
        assert_eq!(status.checkpoint_wait, 1);
        assert!(status.today_usd > 0.0);

        h.orch.cancel(&task_id).await.unwrap();
        next_event_of(&mut rx, &[EventKind::FinalResult]).await;
        let status = h.orch.status().await.unwrap();
        assert_eq!(status.checkpoint_wait, 0);
    }

    #[tokio::test]
    async fn stale_tasks_recovered_at_startup() {
        let cfg = Config::default();
        let h = harness(cfg, Vec::new(), Vec::new());

        let task = Task::new("left behind by a crash", "user:1");
        h.memory.insert_task(&task).unwrap();

        let recovered = h.orch.recover_stale().unwrap();
        assert_eq!(recovered, vec![task.id.clone()]);
        let rec = h.memory.get_task(&task.id).unwrap().unwrap();
        assert_eq!(rec.status, "failed");
    }
}
