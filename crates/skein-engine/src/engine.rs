//! The execution engine: a continuation-passing state machine with
//! externalized state.
//!
//! No in-memory call stack represents "where an activation is" across a
//! deferred step — the activation store does. Any engine instance can pick
//! up a continuation, which is what lets callbacks land on a different
//! process than the one that started the activation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use skein_core::config::{CompletionPolicy, EngineConfig};
use skein_core::definition::{OutputMode, SkillDefinition};
use skein_core::error::{Result, SkeinError};
use skein_core::event::{EventBus, LifecycleEvent};
use skein_core::plan::{NodeKind, Plan, PlanNode, PlanState, StateKind};
use skein_core::traits::{ActivationStore, ResourceCatalog, SecretStore};
use skein_core::types::*;
use skein_plan::{properties, routing, PlanCache};

use crate::actions::ProviderFactory;
use crate::callback;
use crate::lock::ActivationLocks;
use crate::queue::{self, Job};
use crate::retry;

/// Messages carrying this output name are an explicit no-op sink: the
/// engine drops them without touching the plan.
pub const IGNORE_OUTPUT: &str = "ignore";

/// A request to run an agent (or a single skill) to completion.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    pub project_id: String,
    /// Agent definition name, or skill name for `invoke_skill`.
    pub name: String,
    pub entry_point: Option<String>,
    pub payload: serde_json::Value,
    pub properties: HashMap<String, serde_json::Value>,
    pub headers: HashMap<String, String>,
    pub token: Option<String>,
    /// Caller-supplied activation id; generated when absent.
    pub request_id: Option<RequestId>,
    pub session_id: Option<String>,
    /// Best-effort POST target for the terminal result.
    pub callback_url: Option<String>,
    /// Synchronous callers block for the terminal response; asynchronous
    /// callers get the activation id back immediately.
    pub synchronous: bool,
    pub parent: Option<ParentLink>,
}

#[derive(Debug, Clone)]
pub enum InvokeReply {
    /// Terminal result of a synchronous invocation (or of one that failed
    /// before execution began — the id stays attached either way).
    Completed {
        request_id: RequestId,
        status: ActivationStatus,
        response: serde_json::Value,
    },
    /// Asynchronous invocation accepted; poll or register a callback.
    Accepted { request_id: RequestId },
}

impl InvokeReply {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Completed { request_id, .. } => request_id,
            Self::Accepted { request_id } => request_id,
        }
    }
}

type Waiter = oneshot::Sender<(ActivationStatus, serde_json::Value)>;

pub struct Engine {
    weak: Weak<Engine>,
    config: EngineConfig,
    catalog: Arc<dyn ResourceCatalog>,
    store: Arc<dyn ActivationStore>,
    secrets: Arc<dyn SecretStore>,
    events: Arc<EventBus>,
    plans: PlanCache,
    providers: ProviderFactory,
    locks: ActivationLocks,
    http: reqwest::Client,
    waiters: Mutex<HashMap<String, Waiter>>,
    queue_tx: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
}

impl Engine {
    /// Build the engine and start its work queue. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn ResourceCatalog>,
        store: Arc<dyn ActivationStore>,
        secrets: Arc<dyn SecretStore>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let http = reqwest::Client::new();

        let engine = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            providers: ProviderFactory::new(http.clone(), store.clone(), queue_tx.clone()),
            config,
            catalog,
            store,
            secrets,
            events,
            plans: PlanCache::new(),
            locks: ActivationLocks::new(),
            http,
            waiters: Mutex::new(HashMap::new()),
            queue_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(queue::run(engine.clone(), queue_rx));
        engine
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Replace the built-in provider for a runtime kind.
    pub fn register_provider(&self, provider: Arc<dyn skein_core::traits::ActionProvider>) {
        self.providers.register(provider);
    }

    /// Stop accepting queued work. In-flight synchronous calls finish
    /// cooperatively.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    /// Current state of an activation, for status polling.
    pub async fn activation(&self, request_id: &RequestId) -> Result<Option<Activation>> {
        self.store.get(request_id).await
    }

    // ---------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------

    /// Invoke a named agent. The PENDING activation is created before the
    /// definition is even looked up, so every failure after this point is
    /// queryable under the returned id.
    pub async fn invoke_agent(&self, request: InvokeRequest) -> Result<InvokeReply> {
        let request_id = request.request_id.clone().unwrap_or_default();
        self.create_activation(&request, &request_id).await?;

        let definition = match self.catalog.agent(&request.project_id, &request.name).await? {
            Some(definition) => definition,
            None => {
                return self
                    .fail_invoke(&request_id, SkeinError::DefinitionNotFound(request.name.clone()))
                    .await
            }
        };
        let entry_point = request
            .entry_point
            .clone()
            .or_else(|| definition.inputs.first().map(|s| s.name.clone()))
            .unwrap_or_default();

        let plan = match self
            .plans
            .get_or_compile(self.catalog.as_ref(), &definition, &entry_point)
            .await
        {
            Ok(plan) => plan,
            Err(e) => return self.fail_invoke(&request_id, e).await,
        };

        self.launch(request, request_id, (*plan).clone()).await
    }

    /// Invoke a single skill directly, through a synthetic one-step plan.
    /// Request properties act as the reference-level override layer.
    pub async fn invoke_skill(&self, request: InvokeRequest) -> Result<InvokeReply> {
        let request_id = request.request_id.clone().unwrap_or_default();
        self.create_activation(&request, &request_id).await?;

        let skill = match self.catalog.skill(&request.project_id, &request.name).await? {
            Some(skill) => skill,
            None => {
                return self
                    .fail_invoke(&request_id, SkeinError::SkillNotFound(request.name.clone()))
                    .await
            }
        };
        if skill.routing.is_empty() {
            return self
                .fail_invoke(&request_id, SkeinError::MissingAction(skill.name.clone()))
                .await;
        }

        let plan = skill_plan(&request, &skill);
        self.launch(request, request_id, plan).await
    }

    /// Callback re-entry: accept a continuation for a deferred step,
    /// regardless of which process dispatched it or how long ago, provided
    /// the activation is still live.
    pub async fn resume(&self, msg: Continuation) -> Result<()> {
        if !self.store.exists(&msg.request_id).await? {
            return Err(SkeinError::ActivationNotFound(msg.request_id.to_string()));
        }
        self.enqueue(Job::Resume(msg));
        Ok(())
    }

    /// Out-of-band cancellation. Cooperative: in-flight synchronous calls
    /// are not interrupted, but nothing new is dispatched afterwards.
    pub async fn cancel(&self, request_id: &RequestId) -> Result<()> {
        let _guard = self.locks.acquire(request_id).await;
        let Some(activation) = self.store.get(request_id).await? else {
            return Err(SkeinError::ActivationNotFound(request_id.to_string()));
        };
        if activation.status.is_terminal() {
            return Ok(());
        }
        info!(request_id = %request_id, "Activation cancelled");
        self.finalize(
            &activation,
            ActivationStatus::Cancelled,
            serde_json::json!({"cancelled": true}),
        )
        .await
    }

    // ---------------------------------------------------------------
    // Invocation plumbing
    // ---------------------------------------------------------------

    async fn create_activation(
        &self,
        request: &InvokeRequest,
        request_id: &RequestId,
    ) -> Result<()> {
        let mut activation = Activation::new(
            request_id.clone(),
            &request.project_id,
            &request.name,
            request.entry_point.clone().unwrap_or_default(),
            request.payload.clone(),
        );
        activation.callback_url = request.callback_url.clone();
        activation.parent = request.parent.clone();
        self.store.create(&activation).await?;

        self.events.publish(LifecycleEvent::AgentInput {
            request_id: request_id.clone(),
            agent: request.name.clone(),
            payload: request.payload.clone(),
        });
        Ok(())
    }

    async fn launch(
        &self,
        request: InvokeRequest,
        request_id: RequestId,
        plan: Plan,
    ) -> Result<InvokeReply> {
        if request.synchronous && !plan.synchronous {
            return self
                .fail_invoke(&request_id, SkeinError::NotSynchronous(plan.definition.clone()))
                .await;
        }

        self.store
            .merge(
                &request_id,
                ActivationPatch {
                    plan: Some(plan.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let msg = Continuation {
            request_id: request_id.clone(),
            project_id: request.project_id.clone(),
            session_id: Some(
                request
                    .session_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            channel_id: plan.entry_id.clone(),
            output_name: None,
            message_id: None,
            status: None,
            payload: request.payload.clone(),
            properties: request.properties.clone(),
            headers: request.headers.clone(),
            token: request.token.clone(),
        };

        if request.synchronous {
            let rx = self.register_waiter(&request_id);
            if let Err(e) = self.process_message(msg).await {
                return self.fail_invoke(&request_id, e).await;
            }
            match rx.await {
                Ok((status, response)) => Ok(InvokeReply::Completed {
                    request_id,
                    status,
                    response,
                }),
                Err(_) => Err(SkeinError::Store(
                    "synchronous invocation finished without a result".into(),
                )),
            }
        } else {
            self.enqueue(Job::Process(msg));
            debug!(request_id = %request_id, agent = %request.name, "Invocation accepted");
            Ok(InvokeReply::Accepted { request_id })
        }
    }

    /// Finalize an activation that failed before (or instead of) running.
    /// The failure stays attached to the activation id for the caller.
    async fn fail_invoke(&self, request_id: &RequestId, err: SkeinError) -> Result<InvokeReply> {
        warn!(request_id = %request_id, error = %err, "Invocation failed");
        let response = serde_json::json!({"error": err.to_string()});
        if let Some(activation) = self.store.get(request_id).await? {
            self.finalize(&activation, ActivationStatus::Error, response.clone())
                .await?;
        }
        Ok(InvokeReply::Completed {
            request_id: request_id.clone(),
            status: ActivationStatus::Error,
            response,
        })
    }

    // ---------------------------------------------------------------
    // Continuation processing
    // ---------------------------------------------------------------

    /// Walk every plan edge leaving the message's channel. This is the
    /// fan-out point: zero, one, or many edges process concurrently.
    /// Boxed because synchronous steps recurse back in.
    pub(crate) fn process_message(&self, msg: Continuation) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(activation) = self.store.get(&msg.request_id).await? else {
                return Ok(());
            };
            if activation.status.is_terminal() {
                return Ok(());
            }
            let Some(plan) = activation.plan else {
                return Ok(());
            };

            // A silenced branch traverses no further edges, but its transit
            // may have been the last one holding completion open.
            if msg.output_name.as_deref() == Some(IGNORE_OUTPUT) {
                return self.try_finalize(&plan, &msg).await;
            }

            let states: Vec<PlanState> = plan
                .states_from(&msg.channel_id, msg.output_name.as_deref())
                .cloned()
                .collect();
            if states.is_empty() {
                debug!(
                    request_id = %msg.request_id,
                    channel_id = %msg.channel_id,
                    output_name = ?msg.output_name,
                    "No downstream edges for message"
                );
                // Dead-ended branches settle like silenced ones.
                return self.try_finalize(&plan, &msg).await;
            }

            let steps = states.iter().map(|state| self.step(&plan, &msg, state));
            let results = join_all(steps).await;

            for (state, result) in states.iter().zip(results) {
                if let Err(e) = result {
                    error!(
                        request_id = %msg.request_id,
                        from = %state.from,
                        to = %state.to,
                        error = %e,
                        "Step processing failed"
                    );
                    // Convert into a terminal decision rather than leaving
                    // the activation stranded mid-flight.
                    if let Err(e) = self.handle_error(&plan, &msg, Some(e.to_string())).await {
                        error!(request_id = %msg.request_id, error = %e, "Error path failed");
                    }
                }
            }
            Ok(())
        })
    }

    async fn step(&self, plan: &Plan, msg: &Continuation, state: &PlanState) -> Result<()> {
        match state.kind {
            StateKind::Skill => self.invoke_state(plan, msg, state).await,
            StateKind::Output => self.handle_output(plan, msg, state).await,
        }
    }

    /// Run one skill edge: transit STARTED, dispatch through the routing
    /// resolver, then either recurse (synchronous result), return and wait
    /// for a callback (deferred), or enter the error path.
    async fn invoke_state(&self, plan: &Plan, msg: &Continuation, state: &PlanState) -> Result<()> {
        // Nothing new is dispatched once the activation went terminal
        // (cancellation is cooperative, it does not interrupt this branch's
        // siblings mid-call).
        match self.store.get(&msg.request_id).await? {
            Some(activation) if !activation.status.is_terminal() => {}
            _ => return Ok(()),
        }

        let skill_name = state.skill.clone().unwrap_or_default();
        let transit = Transit::started(&state.from, &state.to, msg.message_id.clone(), &skill_name);
        self.store.put_transit(&msg.request_id, &transit).await?;
        self.store
            .increment(&msg.request_id, &format!("sent:{}", state.to))
            .await?;
        self.events.publish(LifecycleEvent::SkillInput {
            request_id: msg.request_id.clone(),
            channel_id: state.to.clone(),
            skill: skill_name.clone(),
        });

        let outcome = match self.dispatch_skill(plan, msg, state, &skill_name).await {
            Ok(outcome) => outcome,
            Err(e) => ActionOutcome::failed(e.to_string()),
        };

        if outcome.success && outcome.is_async {
            debug!(
                request_id = %msg.request_id,
                channel_id = %state.to,
                skill = %skill_name,
                "Step deferred, awaiting callback"
            );
            return Ok(());
        }

        if outcome.success {
            self.store
                .put_transit(
                    &msg.request_id,
                    &transit.clone().finish(TransitStatus::Complete),
                )
                .await?;
            self.store
                .increment(&msg.request_id, &format!("done:{}", state.to))
                .await?;
            self.events.publish(LifecycleEvent::SkillOutput {
                request_id: msg.request_id.clone(),
                channel_id: state.to.clone(),
                skill: skill_name,
                success: true,
            });

            let next = msg.advance(
                &state.to,
                outcome.output_name.clone(),
                outcome.payload.clone().unwrap_or(serde_json::Value::Null),
            );
            return self.process_message(next).await;
        }

        let error = outcome
            .error
            .clone()
            .unwrap_or_else(|| "action failed".to_string());

        if outcome.target_missing && self.config.retry.enabled {
            let attempts = self.store.increment(&msg.request_id, "attempts").await? as u32;
            if attempts <= self.config.retry.max_attempts {
                self.store
                    .merge(
                        &msg.request_id,
                        ActivationPatch {
                            status: Some(ActivationStatus::Retry),
                            attempts: Some(attempts),
                            ..Default::default()
                        },
                    )
                    .await?;
                warn!(
                    request_id = %msg.request_id,
                    channel_id = %state.to,
                    attempts,
                    error = %error,
                    "Target missing, retrying step"
                );
                self.schedule_retry(msg.clone(), state.clone(), attempts);
                return Ok(());
            }
        }

        self.store
            .put_transit(&msg.request_id, &transit.finish(TransitStatus::Error))
            .await?;
        self.store
            .increment(&msg.request_id, &format!("error:{}", state.to))
            .await?;
        self.events.publish(LifecycleEvent::SkillOutput {
            request_id: msg.request_id.clone(),
            channel_id: state.to.clone(),
            skill: skill_name.clone(),
            success: false,
        });
        warn!(
            request_id = %msg.request_id,
            channel_id = %state.to,
            skill = %skill_name,
            error = %error,
            "Skill step failed"
        );
        self.handle_error(plan, msg, Some(error)).await
    }

    async fn dispatch_skill(
        &self,
        plan: &Plan,
        msg: &Continuation,
        state: &PlanState,
        skill_name: &str,
    ) -> Result<ActionOutcome> {
        let skill = self
            .catalog
            .skill(&msg.project_id, skill_name)
            .await?
            .ok_or_else(|| SkeinError::SkillNotFound(skill_name.to_string()))?;

        let overrides = plan
            .node(&state.to)
            .map(|n| n.properties.clone())
            .unwrap_or_default();
        let merged = properties::merge_properties(&skill, &overrides);
        let merged = properties::resolve_secure(self.secrets.as_ref(), &msg.project_id, merged).await?;

        let route = routing::resolve_route(&skill, &merged, &msg.payload)?;
        let provider = self.providers.provider(route.runtime);

        let invocation = ActionInvocation {
            request_id: msg.request_id.clone(),
            project_id: msg.project_id.clone(),
            skill: skill_name.to_string(),
            action: route.action,
            output_name: route.output_name,
            channel_id: state.to.clone(),
            message_id: msg.message_id.clone(),
            properties: merged,
            payload: msg.payload.clone(),
            headers: msg.headers.clone(),
            token: msg.token.clone(),
        };
        provider.invoke(invocation).await
    }

    fn schedule_retry(&self, msg: Continuation, state: PlanState, attempts: u32) {
        let wait = retry::backoff(&self.config.retry, attempts.saturating_sub(1));
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(engine) = weak.upgrade() else { return };
            let _ = engine
                .store
                .merge(&msg.request_id, ActivationPatch::status(ActivationStatus::Pending))
                .await;
            let Ok(Some(activation)) = engine.store.get(&msg.request_id).await else {
                return;
            };
            let Some(plan) = activation.plan else { return };
            if let Err(e) = engine.invoke_state(&plan, &msg, &state).await {
                warn!(request_id = %msg.request_id, error = %e, "Retry dispatch failed");
            }
        });
    }

    // ---------------------------------------------------------------
    // Fan-in and completion
    // ---------------------------------------------------------------

    /// A payload arrived at the plan output. Record the arrival, then try
    /// to win the completion race.
    async fn handle_output(&self, plan: &Plan, msg: &Continuation, state: &PlanState) -> Result<()> {
        let name = plan
            .node(&state.to)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| state.to.clone());
        let transit = Transit::started(&state.from, &state.to, msg.message_id.clone(), &name)
            .finish(TransitStatus::Complete);
        self.store.put_transit(&msg.request_id, &transit).await?;

        self.store
            .append(
                &msg.request_id,
                &format!("arrivals:{}", state.to),
                msg.payload.clone(),
            )
            .await?;
        self.store
            .increment(&msg.request_id, &format!("received:{}", state.to))
            .await?;

        self.try_finalize(plan, msg).await
    }

    /// Failure path, mirroring `handle_output`: the error arrives at the
    /// plan output as an error payload so aggregation and the completion
    /// predicate see the branch as settled.
    async fn handle_error(&self, plan: &Plan, msg: &Continuation, error: Option<String>) -> Result<()> {
        let payload = serde_json::json!({
            "error": error.unwrap_or_else(|| "step failed".to_string()),
        });
        self.store
            .append(
                &msg.request_id,
                &format!("arrivals:{}", plan.output_id),
                payload,
            )
            .await?;
        self.store
            .increment(&msg.request_id, &format!("received:{}", plan.output_id))
            .await?;

        self.try_finalize(plan, msg).await
    }

    /// The completion decision, guarded by the per-activation lock.
    /// Exactly one caller wins; everyone else leaves without side effects.
    async fn try_finalize(&self, plan: &Plan, msg: &Continuation) -> Result<()> {
        let guard = self.locks.acquire(&msg.request_id).await;

        // A concurrent holder may have finalized and cleaned up already;
        // this caller lost the race and must not re-finalize or re-notify.
        let Some(activation) = self.store.get(&msg.request_id).await? else {
            return Ok(());
        };
        if activation.status.is_terminal() {
            return Ok(());
        }

        let transits = self.store.transits(&msg.request_id).await?;
        if transits.iter().any(|t| !t.status.is_terminal()) {
            return Ok(());
        }

        let errors = transits
            .iter()
            .filter(|t| t.status == TransitStatus::Error)
            .count() as i64;
        let done = transits
            .iter()
            .filter(|t| t.status == TransitStatus::Complete)
            .count() as i64;
        let output_id = plan.output_id.clone();
        let received = self
            .store
            .counter(&msg.request_id, &format!("received:{}", output_id))
            .await?;

        // A failing branch cannot deliver everything it would have, so the
        // expected-arrivals gate only applies to clean runs. A clean run
        // must have delivered at least one arrival to the output: settled
        // transits alone say nothing about a join still holding arrivals
        // upstream.
        if errors == 0 {
            let expected = plan
                .node(&output_id)
                .and_then(|n| n.properties.get("expected"))
                .and_then(|v| v.as_i64())
                .unwrap_or(1);
            if received < expected {
                return Ok(());
            }
        }

        // This caller won. Compute the response by aggregation mode.
        let arrivals = self
            .store
            .list(&msg.request_id, &format!("arrivals:{}", output_id))
            .await?;
        let mode = plan
            .node(&output_id)
            .and_then(|n| n.mode)
            .unwrap_or(OutputMode::Single);
        let mut response = match mode {
            OutputMode::Single => arrivals.last().cloned().unwrap_or(serde_json::Value::Null),
            OutputMode::Merge => serde_json::Value::Array(arrivals),
            OutputMode::Stats => serde_json::json!({
                "received": received,
                "done": done,
                "errors": errors,
            }),
        };

        let mut status = if errors > 0 {
            ActivationStatus::Error
        } else {
            ActivationStatus::Complete
        };
        if self.config.completion == CompletionPolicy::Legacy {
            // Backward compatibility: partial transit failure still counts
            // as COMPLETE unless finalize itself faults.
            status = ActivationStatus::Complete;
        }

        // Catch on the failure path, then finally on every path. A failure
        // inside either becomes the terminal error and must not re-enter
        // the error path.
        if status == ActivationStatus::Error {
            if let Some(ref catch) = plan.catch {
                match self.run_completion_skill(msg, catch, &response).await {
                    Ok(rewritten) => response = rewritten,
                    Err(e) => {
                        warn!(request_id = %msg.request_id, skill = %catch, error = %e, "Catch skill failed");
                        response = serde_json::json!({"error": e.to_string()});
                    }
                }
            }
        }
        if let Some(ref finally) = plan.finally {
            match self.run_completion_skill(msg, finally, &response).await {
                Ok(rewritten) => response = rewritten,
                Err(e) => {
                    warn!(request_id = %msg.request_id, skill = %finally, error = %e, "Finally skill failed");
                    status = ActivationStatus::Error;
                    response = serde_json::json!({"error": e.to_string()});
                }
            }
        }

        self.finalize(&activation, status, response).await?;
        drop(guard);
        Ok(())
    }

    /// Run a catch/finally skill synchronously, in-line, against the
    /// response payload. Its output replaces the response.
    async fn run_completion_skill(
        &self,
        msg: &Continuation,
        skill_name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let skill = self
            .catalog
            .skill(&msg.project_id, skill_name)
            .await?
            .ok_or_else(|| SkeinError::SkillNotFound(skill_name.to_string()))?;

        let merged = properties::merge_properties(&skill, &HashMap::new());
        let merged = properties::resolve_secure(self.secrets.as_ref(), &msg.project_id, merged).await?;
        let route = routing::resolve_route(&skill, &merged, payload)?;
        if !route.runtime.is_synchronous() {
            return Err(SkeinError::ActionFailed {
                action: skill_name.to_string(),
                message: "completion skills must be synchronous".into(),
            });
        }

        let provider = self.providers.provider(route.runtime);
        let outcome = provider
            .invoke(ActionInvocation {
                request_id: msg.request_id.clone(),
                project_id: msg.project_id.clone(),
                skill: skill_name.to_string(),
                action: route.action,
                output_name: route.output_name,
                channel_id: format!("completion:{}", skill_name),
                message_id: None,
                properties: merged,
                payload: payload.clone(),
                headers: msg.headers.clone(),
                token: msg.token.clone(),
            })
            .await?;

        if outcome.success {
            Ok(outcome.payload.unwrap_or(serde_json::Value::Null))
        } else {
            Err(SkeinError::ActionFailed {
                action: skill_name.to_string(),
                message: outcome.error.unwrap_or_else(|| "failed".into()),
            })
        }
    }

    /// Commit the terminal result: persist, notify, deliver the callback,
    /// resume a waiting parent, clean up.
    async fn finalize(
        &self,
        activation: &Activation,
        status: ActivationStatus,
        response: serde_json::Value,
    ) -> Result<()> {
        self.store
            .merge(
                &activation.request_id,
                ActivationPatch {
                    status: Some(status),
                    response: Some(response.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            request_id = %activation.request_id,
            agent = %activation.agent,
            status = %status,
            "Activation finished"
        );
        self.events.publish(LifecycleEvent::AgentOutput {
            request_id: activation.request_id.clone(),
            agent: activation.agent.clone(),
            status,
            response: response.clone(),
        });
        self.notify_waiter(&activation.request_id, status, &response);

        if let Some(ref url) = activation.callback_url {
            callback::deliver(
                &self.http,
                url,
                status,
                &response,
                Duration::from_secs(self.config.callback_timeout_secs),
            )
            .await;
        }

        if let Some(ref parent) = activation.parent {
            let resume = Continuation {
                request_id: parent.request_id.clone(),
                project_id: activation.project_id.clone(),
                session_id: None,
                channel_id: parent.channel_id.clone(),
                output_name: Some(parent.output_name.clone()),
                message_id: parent.message_id.clone(),
                status: Some(
                    if status == ActivationStatus::Complete {
                        "complete".to_string()
                    } else {
                        "error".to_string()
                    },
                ),
                payload: response,
                properties: HashMap::new(),
                headers: HashMap::new(),
                token: None,
            };
            self.enqueue(Job::Resume(resume));
        }

        if !self.config.retain_finished {
            self.store.remove(&activation.request_id).await?;
        }
        self.locks.release(&activation.request_id);
        Ok(())
    }

    /// Settle the deferred transit a callback completes, then continue
    /// from its channel (or enter the error path).
    pub(crate) async fn process_resume(&self, msg: Continuation) -> Result<()> {
        let Some(activation) = self.store.get(&msg.request_id).await? else {
            return Ok(());
        };
        if activation.status.is_terminal() {
            return Ok(());
        }
        let Some(plan) = activation.plan.clone() else {
            return Ok(());
        };

        let failed = matches!(msg.status.as_deref(), Some(s) if s.eq_ignore_ascii_case("error"));
        let open: Vec<Transit> = self
            .store
            .transits_to(&msg.request_id, &msg.channel_id)
            .await?
            .into_iter()
            .filter(|t| t.to == msg.channel_id && t.status == TransitStatus::Started)
            .filter(|t| msg.message_id.is_none() || t.message_id == msg.message_id)
            .collect();

        for transit in open {
            let terminal = if failed {
                TransitStatus::Error
            } else {
                TransitStatus::Complete
            };
            let skill = transit.name.clone();
            self.store
                .put_transit(&msg.request_id, &transit.finish(terminal))
                .await?;
            let counter = if failed {
                format!("error:{}", msg.channel_id)
            } else {
                format!("done:{}", msg.channel_id)
            };
            self.store.increment(&msg.request_id, &counter).await?;
            self.events.publish(LifecycleEvent::SkillOutput {
                request_id: msg.request_id.clone(),
                channel_id: msg.channel_id.clone(),
                skill,
                success: !failed,
            });
        }

        if failed {
            let error = msg
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("deferred step at '{}' failed", msg.channel_id));
            self.handle_error(&plan, &msg, Some(error)).await
        } else {
            self.process_message(msg).await
        }
    }

    pub(crate) async fn run_job(&self, job: Job) -> Result<()> {
        match job {
            Job::Invoke(request) => {
                self.invoke_agent(request).await?;
                Ok(())
            }
            Job::Process(msg) => self.process_message(msg).await,
            Job::Resume(msg) => self.process_resume(msg).await,
        }
    }

    fn enqueue(&self, job: Job) {
        // Unbounded send: enqueuing never blocks the caller. Only fails
        // after shutdown, when dropping the job is the right call anyway.
        let _ = self.queue_tx.send(job);
    }

    fn register_waiter(&self, request_id: &RequestId) -> oneshot::Receiver<(ActivationStatus, serde_json::Value)> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.0.clone(), tx);
        rx
    }

    fn notify_waiter(&self, request_id: &RequestId, status: ActivationStatus, response: &serde_json::Value) {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id.0);
        if let Some(tx) = waiter {
            let _ = tx.send((status, response.clone()));
        }
    }
}

/// Synthetic plan for a direct skill invocation: `input → skill → output`,
/// single-mode output.
fn skill_plan(request: &InvokeRequest, skill: &SkillDefinition) -> Plan {
    let ref_id = skill.name.clone();
    let synchronous = routing::is_synchronous(skill);

    let mut nodes = HashMap::new();
    nodes.insert(
        "input".to_string(),
        PlanNode {
            kind: NodeKind::Input,
            name: "input".into(),
            title: None,
            mode: None,
            properties: HashMap::new(),
        },
    );
    nodes.insert(
        ref_id.clone(),
        PlanNode {
            kind: NodeKind::Skill,
            name: skill.name.clone(),
            title: skill.title.clone(),
            mode: None,
            properties: request.properties.clone(),
        },
    );
    nodes.insert(
        "output".to_string(),
        PlanNode {
            kind: NodeKind::Output,
            name: "output".into(),
            title: None,
            mode: Some(OutputMode::Single),
            properties: HashMap::new(),
        },
    );

    Plan {
        project_id: request.project_id.clone(),
        definition: skill.name.clone(),
        entry_point: "input".into(),
        entry_id: "input".into(),
        output_id: "output".into(),
        nodes,
        states: vec![
            PlanState {
                from: "input".into(),
                to: ref_id.clone(),
                from_output: None,
                to_input: None,
                kind: StateKind::Skill,
                skill: Some(skill.name.clone()),
                synchronous,
            },
            PlanState {
                from: ref_id,
                to: "output".into(),
                from_output: None,
                to_input: None,
                kind: StateKind::Output,
                skill: None,
                synchronous: true,
            },
        ],
        synchronous,
        catch: None,
        finally: None,
    }
}
