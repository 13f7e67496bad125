//! Interpreter - Execute Effects using a Provider
//!
//! The Interpreter executes the steps of a Plan as a task graph: a step
//! starts once every step it waits for has succeeded, and independent steps
//! run concurrently up to a parallelism limit. Every confirmed change is
//! recorded through the `StateStore` before the step completes. This is
//! where side effects actually occur.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;

use crate::effect::Effect;
use crate::plan::{Plan, Step};
use crate::provider::{ErrorKind, Provider, ProviderError, ProviderResult};
use crate::resource::{
    ResolveError, Resource, ResourceId, State, Value, argument_hashes, persistable_attributes,
};
use crate::schema::ReplacementPolicy;
use crate::store::{StateChange, StateStore, StoreError};

/// Bounded exponential backoff for transient errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Interpreter configuration
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// If true, skip actual side effects
    pub dry_run: bool,
    /// Maximum number of operations in flight
    pub max_parallelism: usize,
    pub retry: RetryPolicy,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_parallelism: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// Run-level cancellation signal
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop scheduling new operations and stop retrying
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyErrorCause {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Aborted(String),
}

/// A step failed
#[derive(Debug, thiserror::Error)]
#[error("{operation} {id} failed ({kind}, {attempts} attempt(s)): {cause}")]
pub struct ApplyError {
    pub id: ResourceId,
    pub operation: &'static str,
    pub kind: ErrorKind,
    pub attempts: u32,
    #[source]
    pub cause: ApplyErrorCause,
}

impl ApplyError {
    fn new(
        id: &ResourceId,
        operation: &'static str,
        attempts: u32,
        cause: impl Into<ApplyErrorCause>,
    ) -> Self {
        let cause = cause.into();
        let kind = match &cause {
            ApplyErrorCause::Provider(e) => e.kind,
            _ => ErrorKind::Permanent,
        };
        Self {
            id: id.clone(),
            operation,
            kind,
            attempts,
            cause,
        }
    }

    /// Identifier of an object the failed operation left behind
    pub fn partial_identifier(&self) -> Option<&str> {
        match &self.cause {
            ApplyErrorCause::Provider(e) => e.identifier.as_deref(),
            _ => None,
        }
    }
}

/// Why a step did not run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An upstream step failed
    DependencyFailed(ResourceId),
    Cancelled,
    DryRun,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed(id) => write!(f, "dependency {} failed", id),
            SkipReason::Cancelled => write!(f, "cancelled"),
            SkipReason::DryRun => write!(f, "dry-run mode"),
        }
    }
}

/// Result of executing each step
#[derive(Debug)]
pub enum StepOutcome {
    /// Operation confirmed; holds the new record unless the object was deleted
    Succeeded { state: Option<State> },
    /// No-op step
    Unchanged,
    Failed(ApplyError),
    Skipped(SkipReason),
}

#[derive(Debug)]
pub struct StepReport {
    pub id: ResourceId,
    pub operation: &'static str,
    pub outcome: StepOutcome,
}

/// Result of executing the entire Plan
#[derive(Debug, Default)]
pub struct ApplyResult {
    pub steps: Vec<StepReport>,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|s| {
            matches!(
                s.outcome,
                StepOutcome::Succeeded { .. }
                    | StepOutcome::Unchanged
                    | StepOutcome::Skipped(SkipReason::DryRun)
            )
        })
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&StepReport, &ApplyError)> {
        self.steps.iter().filter_map(|s| match &s.outcome {
            StepOutcome::Failed(e) => Some((s, e)),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&StepReport, &SkipReason)> {
        self.steps.iter().filter_map(|s| match &s.outcome {
            StepOutcome::Skipped(reason) => Some((s, reason)),
            _ => None,
        })
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    pub fn failure_count(&self) -> usize {
        self.failed().count()
    }
}

/// Attributes of a completed resource, visible to its dependents
type KnownAttributes = HashMap<String, Value>;

/// Interpreter that executes Effects using a Provider
pub struct Interpreter<P: Provider> {
    provider: Arc<P>,
    config: InterpreterConfig,
    cancel: CancelToken,
}

impl<P: Provider + 'static> Interpreter<P> {
    pub fn new(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<P>) -> Self {
        Self {
            provider,
            config: InterpreterConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Execute a Plan, interpreting all Effects and causing side effects
    pub async fn apply(&self, plan: &Plan, store: Arc<dyn StateStore>) -> ApplyResult {
        let steps = plan.steps();

        if self.config.dry_run {
            let outcomes = steps
                .iter()
                .map(|step| {
                    Some(if step.effect.is_mutating() {
                        StepOutcome::Skipped(SkipReason::DryRun)
                    } else {
                        StepOutcome::Unchanged
                    })
                })
                .collect();
            return build_result(steps, outcomes);
        }

        let binding_ids: HashMap<&str, &ResourceId> = steps
            .iter()
            .filter_map(|s| s.effect.resource())
            .map(|r| (r.binding(), &r.id))
            .collect();

        let mut schedule = Schedule::new(steps);
        let mut tasks: JoinSet<(usize, StepOutcome, Option<KnownAttributes>)> = JoinSet::new();
        let limit = self.config.max_parallelism.max(1);

        loop {
            while tasks.len() < limit {
                let Some(index) = schedule.ready.pop_first() else {
                    break;
                };
                if self.cancel.is_cancelled() {
                    schedule.outcomes[index] = Some(StepOutcome::Skipped(SkipReason::Cancelled));
                    continue;
                }

                let step = &steps[index];
                let (outcome, attributes) = match &step.effect {
                    Effect::NoOp(resource) => {
                        self.unchanged(resource, &schedule.known, store.as_ref()).await
                    }
                    effect => {
                        let resolved = match effect.resource() {
                            Some(resource) => match resolve_resource(resource, &schedule.known) {
                                Ok(resolved) => Some(resolved),
                                Err(e) => {
                                    let error = ApplyError::new(effect.id(), effect.kind(), 0, e);
                                    schedule.finish(steps, index, StepOutcome::Failed(error), None);
                                    continue;
                                }
                            },
                            None => None,
                        };
                        let dependencies = effect
                            .resource()
                            .map(|r| {
                                r.dependency_bindings()
                                    .iter()
                                    .filter_map(|b| binding_ids.get(b.as_str()).map(|id| (*id).clone()))
                                    .collect()
                            })
                            .unwrap_or_default();
                        let task = StepTask {
                            provider: Arc::clone(&self.provider),
                            store: Arc::clone(&store),
                            retry: self.config.retry,
                            cancel: self.cancel.clone(),
                            effect: effect.clone(),
                            resolved,
                            dependencies,
                        };
                        tasks.spawn(async move {
                            let (outcome, attributes) = task.run().await;
                            (index, outcome, attributes)
                        });
                        continue;
                    }
                };
                schedule.finish(steps, index, outcome, attributes);
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((index, outcome, attributes)) => {
                    schedule.finish(steps, index, outcome, attributes)
                }
                Err(e) => log::error!("Apply task aborted: {}", e),
            }
        }

        let outcomes = schedule.settle(steps, self.cancel.is_cancelled());
        build_result(steps, outcomes)
    }

    /// Complete a no-op step: its attributes come from the persisted record
    async fn unchanged(
        &self,
        resource: &Resource,
        known: &HashMap<String, KnownAttributes>,
        store: &dyn StateStore,
    ) -> (StepOutcome, Option<KnownAttributes>) {
        let record = match store.get(&resource.id).await {
            Ok(record) => record,
            Err(e) => {
                return (
                    StepOutcome::Failed(ApplyError::new(&resource.id, "read state", 1, e)),
                    None,
                );
            }
        };
        let mut attributes = resolve_resource(resource, known)
            .map(|r| r.attributes)
            .unwrap_or_default();
        if let Some(record) = record {
            for (k, v) in record.attributes {
                attributes.entry(k).or_insert(v);
            }
        }
        (StepOutcome::Unchanged, Some(attributes))
    }
}

/// Progress of one apply: what finished, what each step still waits for
struct Schedule {
    outcomes: Vec<Option<StepOutcome>>,
    /// Attributes of completed resources, by binding
    known: HashMap<String, KnownAttributes>,
    dependents: Vec<Vec<usize>>,
    waiting: Vec<usize>,
    ready: BTreeSet<usize>,
}

impl Schedule {
    fn new(steps: &[Step]) -> Self {
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (index, step) in steps.iter().enumerate() {
            for &dep in &step.after {
                dependents[dep].push(index);
            }
        }
        let waiting: Vec<usize> = steps.iter().map(|s| s.after.len()).collect();
        let ready = (0..steps.len()).filter(|i| waiting[*i] == 0).collect();
        Self {
            outcomes: steps.iter().map(|_| None).collect(),
            known: HashMap::new(),
            dependents,
            waiting,
            ready,
        }
    }

    /// Record a step's outcome and release its dependents if it succeeded
    fn finish(
        &mut self,
        steps: &[Step],
        index: usize,
        outcome: StepOutcome,
        attributes: Option<KnownAttributes>,
    ) {
        let effect = &steps[index].effect;
        match &outcome {
            StepOutcome::Succeeded { .. } | StepOutcome::Unchanged => {
                if let (Some(resource), Some(attributes)) = (effect.resource(), attributes) {
                    self.known.insert(resource.binding().to_string(), attributes);
                }
                for &dependent in &self.dependents[index] {
                    self.waiting[dependent] -= 1;
                    if self.waiting[dependent] == 0 {
                        self.ready.insert(dependent);
                    }
                }
            }
            StepOutcome::Failed(e) => log::error!("{}", e),
            StepOutcome::Skipped(_) => {}
        }
        self.outcomes[index] = Some(outcome);
    }

    /// Give every step that never started the reason it did not run
    fn settle(mut self, steps: &[Step], cancelled: bool) -> Vec<Option<StepOutcome>> {
        for index in 0..steps.len() {
            if self.outcomes[index].is_some() {
                continue;
            }
            let upstream = steps[index].after.iter().find_map(|&dep| match &self.outcomes[dep] {
                Some(StepOutcome::Failed(_)) => Some(SkipReason::DependencyFailed(
                    steps[dep].effect.id().clone(),
                )),
                Some(StepOutcome::Skipped(reason)) => Some(reason.clone()),
                _ => None,
            });
            self.outcomes[index] = Some(match upstream {
                Some(reason) => StepOutcome::Skipped(reason),
                None if cancelled => StepOutcome::Skipped(SkipReason::Cancelled),
                None => {
                    let effect = &steps[index].effect;
                    StepOutcome::Failed(ApplyError::new(
                        effect.id(),
                        effect.kind(),
                        0,
                        ApplyErrorCause::Aborted("operation did not complete".to_string()),
                    ))
                }
            });
        }
        self.outcomes
    }
}

fn build_result(steps: &[Step], outcomes: Vec<Option<StepOutcome>>) -> ApplyResult {
    let steps = steps
        .iter()
        .zip(outcomes)
        .map(|(step, outcome)| StepReport {
            id: step.effect.id().clone(),
            operation: step.effect.kind(),
            outcome: outcome.unwrap_or(StepOutcome::Skipped(SkipReason::Cancelled)),
        })
        .collect();
    ApplyResult { steps }
}

/// Substitute every reference with attributes of resources completed in this run
fn resolve_resource(
    resource: &Resource,
    known: &HashMap<String, KnownAttributes>,
) -> Result<Resource, ResolveError> {
    let lookup = |binding: &str, attr: &str| -> Result<Option<Value>, ResolveError> {
        known
            .get(binding)
            .and_then(|attrs| attrs.get(attr))
            .cloned()
            .map(Some)
            .ok_or_else(|| ResolveError::Unresolved {
                binding: binding.to_string(),
                attribute: attr.to_string(),
            })
    };

    let mut attributes = HashMap::with_capacity(resource.attributes.len());
    for (key, value) in &resource.attributes {
        let resolved = value.resolve(&lookup)?.ok_or_else(|| {
            let (binding, attribute) = value.references().into_iter().next().unwrap_or_default();
            ResolveError::Unresolved { binding, attribute }
        })?;
        attributes.insert(key.clone(), resolved);
    }
    Ok(Resource {
        id: resource.id.clone(),
        attributes,
        depends_on: resource.depends_on.clone(),
    })
}

/// Copy of a resolved resource with sensitive values exposed, as sent to providers
fn exposed(resource: &Resource) -> Resource {
    Resource {
        id: resource.id.clone(),
        attributes: resource
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.expose()))
            .collect(),
        depends_on: resource.depends_on.clone(),
    }
}

/// A created or updated object
struct Applied {
    record: State,
    attributes: KnownAttributes,
}

/// One mutating step, owned so it can run on its own task
struct StepTask<P> {
    provider: Arc<P>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    cancel: CancelToken,
    effect: Effect,
    resolved: Option<Resource>,
    dependencies: Vec<ResourceId>,
}

impl<P: Provider + 'static> StepTask<P> {
    async fn run(self) -> (StepOutcome, Option<KnownAttributes>) {
        let result = match (&self.effect, &self.resolved) {
            (Effect::Create(_), Some(resolved)) => self.create(resolved).await,
            (Effect::Update { from, .. }, Some(resolved)) => self.update(from, resolved).await,
            (Effect::Replace { from, policy, .. }, Some(resolved)) => {
                self.replace(from, resolved, *policy).await
            }
            (Effect::Delete { from, deposed, .. }, _) => {
                self.delete(from, *deposed).await.map(|()| None)
            }
            (effect, _) => Err(ApplyError::new(
                effect.id(),
                effect.kind(),
                0,
                ApplyErrorCause::Aborted("nothing to execute".to_string()),
            )),
        };

        match result {
            Ok(Some(applied)) => (
                StepOutcome::Succeeded {
                    state: Some(applied.record),
                },
                Some(applied.attributes),
            ),
            Ok(None) => (StepOutcome::Succeeded { state: None }, None),
            Err(e) => (StepOutcome::Failed(e), None),
        }
    }

    fn id(&self) -> &ResourceId {
        self.effect.id()
    }

    async fn create(&self, resolved: &Resource) -> Result<Option<Applied>, ApplyError> {
        let applied = self.create_object(resolved, None).await?;
        self.record(StateChange::Put(applied.record.clone()), "create")
            .await?;
        Ok(Some(applied))
    }

    async fn update(&self, from: &State, resolved: &Resource) -> Result<Option<Applied>, ApplyError> {
        let identifier = self.identifier_of(from, "update")?;
        let request = exposed(resolved);
        log::info!("Updating {}", self.id());
        let result = self
            .with_retry("update", || {
                self.provider.update(self.id(), identifier, from, &request)
            })
            .await;

        match result {
            Ok(returned) => {
                let applied = self.applied(resolved, returned, from.identifier.clone());
                self.record(StateChange::Put(applied.record.clone()), "update")
                    .await?;
                log::info!("Updated {}", self.id());
                Ok(Some(applied))
            }
            Err(e) => {
                self.record_tainted(from.clone()).await;
                Err(e)
            }
        }
    }

    async fn replace(
        &self,
        from: &State,
        resolved: &Resource,
        policy: ReplacementPolicy,
    ) -> Result<Option<Applied>, ApplyError> {
        log::info!("Replacing {} ({})", self.id(), policy);
        match policy {
            ReplacementPolicy::DestroyBeforeCreate => {
                if let Some(identifier) = from.identifier.as_deref() {
                    let deleted = self
                        .with_retry("delete", || self.provider.delete(self.id(), identifier))
                        .await;
                    if let Err(e) = deleted {
                        self.record_tainted(from.clone()).await;
                        return Err(e);
                    }
                }
                self.record(StateChange::Remove(self.id().clone()), "delete")
                    .await?;
                self.create(resolved).await
            }
            ReplacementPolicy::CreateBeforeDestroy => {
                let mut applied = self
                    .create_object(resolved, from.identifier.clone())
                    .await?;
                let Some(old) = from.identifier.clone() else {
                    self.record(StateChange::Put(applied.record.clone()), "create")
                        .await?;
                    return Ok(Some(applied));
                };

                applied.record.deposed = Some(old.clone());
                self.record(StateChange::Put(applied.record.clone()), "create")
                    .await?;
                self.with_retry("delete", || self.provider.delete(self.id(), &old))
                    .await?;
                self.record(
                    StateChange::ClearDeposed {
                        id: self.id().clone(),
                        identifier: old,
                    },
                    "delete",
                )
                .await?;
                applied.record.deposed = None;
                Ok(Some(applied))
            }
        }
    }

    async fn delete(&self, from: &State, deposed: bool) -> Result<(), ApplyError> {
        let target = if deposed {
            from.deposed.as_deref()
        } else {
            from.identifier.as_deref()
        };
        let Some(identifier) = target else {
            if !deposed {
                log::warn!("{} has no recorded identifier, forgetting it", self.id());
                self.record(StateChange::Remove(self.id().clone()), "delete")
                    .await?;
            }
            return Ok(());
        };

        log::info!("Deleting {} ({})", self.id(), identifier);
        let result = self
            .with_retry("delete", || self.provider.delete(self.id(), identifier))
            .await;
        match result {
            Ok(()) => {
                let change = if deposed {
                    StateChange::ClearDeposed {
                        id: self.id().clone(),
                        identifier: identifier.to_string(),
                    }
                } else {
                    StateChange::Remove(self.id().clone())
                };
                self.record(change, "delete").await?;
                log::info!("Deleted {}", self.id());
                Ok(())
            }
            Err(e) => {
                if !deposed {
                    self.record_tainted(from.clone()).await;
                }
                Err(e)
            }
        }
    }

    /// Create the object; a partially created object is recorded as tainted.
    /// `replacing` is the identifier of a live object the new one replaces; it
    /// stays recorded as deposed if the create fails.
    async fn create_object(
        &self,
        resolved: &Resource,
        replacing: Option<String>,
    ) -> Result<Applied, ApplyError> {
        let request = exposed(resolved);
        log::info!("Creating {}", self.id());
        let result = self
            .with_retry("create", || self.provider.create(&request))
            .await;

        match result {
            Ok(returned) => {
                let applied = self.applied(resolved, returned, None);
                log::info!(
                    "Created {} ({})",
                    self.id(),
                    applied.record.identifier.as_deref().unwrap_or("-")
                );
                Ok(applied)
            }
            Err(e) => {
                if let Some(identifier) = e.partial_identifier() {
                    let mut record = State::existing(
                        self.id().clone(),
                        persistable_attributes(&resolved.attributes),
                    )
                    .with_identifier(identifier)
                    .with_argument_hashes(argument_hashes(&resolved.attributes))
                    .with_dependencies(self.dependencies.clone())
                    .with_tainted(true);
                    record.deposed = replacing;
                    if let Err(store_error) = self.store.record(StateChange::Put(record)).await {
                        log::error!(
                            "Failed to record partially created {}: {}",
                            self.id(),
                            store_error
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Build the record and the dependent-visible attributes of a confirmed object.
    /// Attributes that carry sensitive arguments are never persisted.
    fn applied(&self, resolved: &Resource, returned: State, fallback: Option<String>) -> Applied {
        let sensitive: HashSet<&String> = resolved
            .attributes
            .iter()
            .filter(|(_, v)| v.is_sensitive())
            .map(|(k, _)| k)
            .collect();

        let mut persisted = persistable_attributes(&resolved.attributes);
        let mut attributes = resolved.attributes.clone();
        for (k, v) in returned.attributes {
            if sensitive.contains(&k) {
                continue;
            }
            persisted.insert(k.clone(), v.clone());
            attributes.insert(k, v);
        }

        let record = State {
            id: self.id().clone(),
            identifier: returned.identifier.or(fallback),
            attributes: persisted,
            argument_hashes: argument_hashes(&resolved.attributes),
            dependencies: self.dependencies.clone(),
            tainted: false,
            deposed: None,
            exists: true,
        };
        Applied { record, attributes }
    }

    fn identifier_of<'s>(&self, from: &'s State, operation: &'static str) -> Result<&'s str, ApplyError> {
        from.identifier.as_deref().ok_or_else(|| {
            ApplyError::new(
                self.id(),
                operation,
                0,
                ProviderError::new("no identifier recorded for this resource")
                    .for_resource(self.id().clone()),
            )
        })
    }

    async fn record(&self, change: StateChange, operation: &'static str) -> Result<(), ApplyError> {
        self.store
            .record(change)
            .await
            .map_err(|e| ApplyError::new(self.id(), operation, 1, e))
    }

    async fn record_tainted(&self, from: State) {
        log::warn!("Marking {} as tainted", self.id());
        if let Err(e) = self.store.record(StateChange::Put(from.with_tainted(true))).await {
            log::error!("Failed to record tainted {}: {}", self.id(), e);
        }
    }

    /// Call the provider, retrying transient errors with bounded exponential backoff.
    /// An error that names a partially created object is never retried: the
    /// object exists and must be recorded, not created again.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, ApplyError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retry = e.is_transient()
                        && e.identifier.is_none()
                        && attempt < self.retry.max_attempts
                        && !self.cancel.is_cancelled();
                    if !retry {
                        return Err(ApplyError::new(self.id(), operation, attempt, e));
                    }
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "{} {} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation,
                        self.id(),
                        attempt,
                        self.retry.max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
