//! Provider gateway: dispatches a prompt to a backend, correlates the
//! asynchronous reply by id, enforces a wall-clock deadline and falls back
//! along the configured backend order.
//!
//! Each attempt registers a fresh entry in the [`PendingTable`] and spawns a
//! dispatch task that resolves the entry when the transport returns. The
//! caller waits on the entry's channel until the reply, a transport failure
//! or the deadline, whichever comes first. The entry is released by its
//! guard on every one of those paths.

mod pending;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backends::{Backend, BackendId, BackendKind, GatewayConfig, OutboundCall, RawReply, Transport};
use crate::errors::GenerationError;

pub use pending::{PartialSink, PendingGuard, PendingTable, ReplyOutcome};
pub use types::{
    AttemptOutcome, AttemptRecord, CorrelationId, GenerateOptions, GeneratedText, PartialText,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct GatewayPolicy {
    default_timeout: Duration,
    fallback_timeout: Option<Duration>,
    max_attempts: usize,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            fallback_timeout: None,
            max_attempts: 2,
        }
    }
}

/// Summary of a configured backend for the settings UI.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub id: BackendId,
    pub kind: BackendKind,
    pub default_model: String,
}

pub struct ProviderGateway {
    routes: HashMap<BackendId, Arc<dyn Transport>>,
    fallback_order: Vec<BackendId>,
    policy: GatewayPolicy,
    pending: PendingTable,
    models: RwLock<HashMap<BackendId, Vec<String>>>,
}

impl ProviderGateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Build the HTTP backends described by `config`. Cloud entries without
    /// an API key are left out and report `BackendUnavailable` when asked for.
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        config.validate()?;
        // Deadlines are enforced per attempt by the gateway, not the client.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent("Karna-Core/0.1")
            .build()
            .context("failed to construct HTTP client")?;

        let mut builder = Self::builder()
            .default_timeout(config.default_timeout())
            .max_attempts(config.max_attempts)
            .fallback_order(config.fallback_order.clone());
        if let Some(cap) = config.fallback_timeout() {
            builder = builder.fallback_timeout(cap);
        }
        for backend in &config.backends {
            match Backend::from_config(&client, backend) {
                Some(transport) => {
                    builder = builder.backend(backend.id.clone(), transport.into_transport());
                }
                None => warn!(
                    "backend `{}` has no API key configured and will be unavailable",
                    backend.id
                ),
            }
        }
        Ok(builder.build())
    }

    /// Generate text for `prompt`, preferring `preferred` and falling back
    /// along the configured order if it times out or fails.
    pub async fn generate(
        &self,
        prompt: &str,
        preferred: &BackendId,
        options: GenerateOptions,
    ) -> Result<GeneratedText, GenerationError> {
        self.run(prompt, preferred, options, None).await
    }

    /// Same as [`generate`](Self::generate) but forwards streamed fragments
    /// to `partials` as they arrive. Fragments carry the correlation id of
    /// the attempt that produced them, so a consumer can discard text from
    /// an attempt that later failed over.
    pub async fn generate_streaming(
        &self,
        prompt: &str,
        preferred: &BackendId,
        options: GenerateOptions,
        partials: mpsc::UnboundedSender<PartialText>,
    ) -> Result<GeneratedText, GenerationError> {
        self.run(prompt, preferred, options, Some(partials)).await
    }

    /// Model names advertised by a backend. Served from the gateway's cache
    /// unless `refresh` is set or nothing has been fetched yet.
    pub async fn list_models(
        &self,
        backend: &BackendId,
        refresh: bool,
    ) -> Result<Vec<String>, GenerationError> {
        let transport = self.transport(backend)?;
        if !refresh {
            if let Some(cached) = self.cached_models(backend) {
                return Ok(cached);
            }
        }
        let models = transport
            .list_models()
            .await
            .map_err(|err| GenerationError::from_transport(backend, err))?;
        self.models.write().insert(backend.clone(), models.clone());
        Ok(models)
    }

    pub fn backends(&self) -> Vec<BackendInfo> {
        let mut infos: Vec<BackendInfo> = self
            .routes
            .iter()
            .map(|(id, transport)| BackendInfo {
                id: id.clone(),
                kind: transport.kind(),
                default_model: transport.default_model().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn sweep_expired(&self) -> usize {
        self.pending.sweep_expired(Instant::now())
    }

    /// Periodically drop expired entries. The task holds a weak reference and
    /// exits once the gateway is gone.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let gateway = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                let expired = gateway.sweep_expired();
                if expired > 0 {
                    debug!("swept {expired} expired pending request(s)");
                }
            }
        })
    }

    async fn run(
        &self,
        prompt: &str,
        preferred: &BackendId,
        options: GenerateOptions,
        partials: Option<mpsc::UnboundedSender<PartialText>>,
    ) -> Result<GeneratedText, GenerationError> {
        let timeout = self.validate(prompt, &options)?;
        let chain = self.fallback_chain(preferred)?;
        let started = Instant::now();
        let mut attempts = Vec::with_capacity(chain.len());
        let mut last_err = None;

        for (index, backend) in chain.iter().enumerate() {
            let transport = self.transport(backend)?;
            let (model, attempt_timeout) = if index == 0 {
                let model = options
                    .model
                    .clone()
                    .unwrap_or_else(|| transport.default_model().to_string());
                (model, timeout)
            } else {
                info!("falling back to `{backend}`");
                (transport.default_model().to_string(), self.fallback_timeout(timeout))
            };
            let call = CallSpec {
                prompt,
                model,
                system_prompt: options.system_prompt.as_deref(),
                timeout: attempt_timeout,
                partials: partials.clone(),
            };

            let (result, record) = self.attempt(backend, transport, call).await;
            let correlation_id = record.correlation_id;
            let model = record.model.clone();
            attempts.push(record);
            match result {
                Ok(text) => {
                    return Ok(GeneratedText {
                        text,
                        backend: backend.clone(),
                        model,
                        correlation_id,
                        latency_ms: elapsed_ms(started),
                        completed_at: OffsetDateTime::now_utc().unix_timestamp(),
                        attempts,
                    });
                }
                Err(err) if err.triggers_fallback() => {
                    warn!("attempt {correlation_id} on `{backend}` failed: {err}");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(GenerationError::AllBackendsExhausted {
            attempted: chain,
            attempts,
            last: Box::new(last_err.unwrap_or(GenerationError::BackendUnavailable {
                backend: preferred.clone(),
            })),
        })
    }

    async fn attempt(
        &self,
        backend: &BackendId,
        transport: Arc<dyn Transport>,
        call: CallSpec<'_>,
    ) -> (Result<String, GenerationError>, AttemptRecord) {
        let submitted = Instant::now();
        let deadline = submitted + call.timeout;
        let stream = call.partials.is_some();
        let (mut guard, reply) = self.pending.register(backend.clone(), deadline, call.partials);
        let correlation_id = guard.id();

        let outbound = OutboundCall {
            correlation_id,
            prompt: call.prompt.to_string(),
            model: call.model.clone(),
            system_prompt: call.system_prompt.map(str::to_string),
            stream,
        };
        debug!("dispatching {correlation_id} to `{backend}` (model {})", call.model);
        let dispatch = tokio::spawn(dispatch(self.pending.clone(), transport.clone(), outbound));
        guard.attach(dispatch.abort_handle());

        let result = match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(Ok(raw))) => normalize(backend, &*transport, &raw),
            Ok(Ok(Err(err))) => Err(GenerationError::from_transport(backend, err)),
            // A closed channel means the sweeper expired the entry first.
            Ok(Err(_)) | Err(_) => Err(GenerationError::Timeout {
                backend: backend.clone(),
                correlation_id,
                after: call.timeout,
            }),
        };
        drop(guard);

        let outcome = match &result {
            Ok(_) => AttemptOutcome::Resolved,
            Err(GenerationError::Timeout { .. }) => AttemptOutcome::TimedOut,
            Err(err) => AttemptOutcome::Errored {
                message: err.to_string(),
            },
        };
        let record = AttemptRecord {
            backend: backend.clone(),
            correlation_id,
            model: call.model,
            latency_ms: elapsed_ms(submitted),
            outcome,
        };
        (result, record)
    }

    fn validate(&self, prompt: &str, options: &GenerateOptions) -> Result<Duration, GenerationError> {
        if prompt.trim().is_empty() {
            return Err(GenerationError::InvalidRequest(
                "prompt must not be empty".into(),
            ));
        }
        let timeout = options.timeout.unwrap_or(self.policy.default_timeout);
        if timeout.is_zero() {
            return Err(GenerationError::InvalidRequest(
                "timeout must be positive".into(),
            ));
        }
        Ok(timeout)
    }

    /// Preferred backend first, then the configured order, skipping repeats
    /// and backends without a transport, capped at `max_attempts`.
    fn fallback_chain(&self, preferred: &BackendId) -> Result<Vec<BackendId>, GenerationError> {
        if !self.routes.contains_key(preferred) {
            return Err(GenerationError::BackendUnavailable {
                backend: preferred.clone(),
            });
        }
        let mut chain = vec![preferred.clone()];
        for id in &self.fallback_order {
            if chain.len() >= self.policy.max_attempts {
                break;
            }
            if chain.contains(id) {
                continue;
            }
            if !self.routes.contains_key(id) {
                debug!("skipping fallback `{id}`: no transport configured");
                continue;
            }
            chain.push(id.clone());
        }
        Ok(chain)
    }

    fn fallback_timeout(&self, first: Duration) -> Duration {
        self.policy
            .fallback_timeout
            .map_or(first, |cap| cap.min(first))
    }

    fn transport(&self, backend: &BackendId) -> Result<Arc<dyn Transport>, GenerationError> {
        self.routes
            .get(backend)
            .cloned()
            .ok_or_else(|| GenerationError::BackendUnavailable {
                backend: backend.clone(),
            })
    }

    fn cached_models(&self, backend: &BackendId) -> Option<Vec<String>> {
        self.models.read().get(backend).cloned()
    }
}

struct CallSpec<'a> {
    prompt: &'a str,
    model: String,
    system_prompt: Option<&'a str>,
    timeout: Duration,
    partials: Option<mpsc::UnboundedSender<PartialText>>,
}

async fn dispatch(table: PendingTable, transport: Arc<dyn Transport>, call: OutboundCall) {
    let sink = table.sink(call.correlation_id);
    let outcome = transport.send(&call, &sink).await;
    if !table.resolve(&call.correlation_id, outcome) {
        debug!("late reply for {} discarded", call.correlation_id);
    }
}

fn normalize(
    backend: &BackendId,
    transport: &dyn Transport,
    raw: &RawReply,
) -> Result<String, GenerationError> {
    let text = transport
        .extract_text(&raw.body)
        .ok_or_else(|| GenerationError::ProviderError {
            backend: backend.clone(),
            status: None,
            message: "reply body did not contain generated text".into(),
        })?;
    if text.trim().is_empty() {
        return Err(GenerationError::ProviderError {
            backend: backend.clone(),
            status: None,
            message: "backend returned an empty completion".into(),
        });
    }
    Ok(text)
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Default)]
pub struct GatewayBuilder {
    routes: HashMap<BackendId, Arc<dyn Transport>>,
    fallback_order: Vec<BackendId>,
    policy: GatewayPolicy,
}

impl GatewayBuilder {
    pub fn backend(mut self, id: impl Into<BackendId>, transport: Arc<dyn Transport>) -> Self {
        self.routes.insert(id.into(), transport);
        self
    }

    pub fn fallback_order(mut self, order: Vec<BackendId>) -> Self {
        self.fallback_order = order;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.policy.default_timeout = timeout;
        self
    }

    pub fn fallback_timeout(mut self, timeout: Duration) -> Self {
        self.policy.fallback_timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.policy.max_attempts = attempts.max(1);
        self
    }

    pub fn build(self) -> ProviderGateway {
        ProviderGateway {
            routes: self.routes,
            fallback_order: self.fallback_order,
            policy: self.policy,
            pending: PendingTable::new(),
            models: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    enum Script {
        Reply(Value),
        ReplyAfter(Duration, Value),
        Silent,
        Fail(TransportError),
        Echo(Duration),
        Stream(Vec<&'static str>),
    }

    struct Scripted {
        kind: BackendKind,
        model: &'static str,
        script: Script,
        calls: Mutex<Vec<OutboundCall>>,
    }

    impl Scripted {
        fn local(script: Script) -> Arc<Self> {
            Arc::new(Self {
                kind: BackendKind::Local,
                model: "llama3",
                script,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn cloud(script: Script) -> Arc<Self> {
            Arc::new(Self {
                kind: BackendKind::Cloud,
                model: "gemini-1.5-flash",
                script,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_ids(&self) -> Vec<CorrelationId> {
            self.calls.lock().iter().map(|c| c.correlation_id).collect()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn default_model(&self) -> &str {
            self.model
        }

        async fn send(
            &self,
            call: &OutboundCall,
            partials: &PartialSink,
        ) -> Result<RawReply, TransportError> {
            self.calls.lock().push(call.clone());
            match &self.script {
                Script::Reply(body) => Ok(RawReply { body: body.clone() }),
                Script::ReplyAfter(delay, body) => {
                    tokio::time::sleep(*delay).await;
                    Ok(RawReply { body: body.clone() })
                }
                Script::Silent => std::future::pending().await,
                Script::Fail(err) => Err(err.clone()),
                Script::Echo(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(RawReply {
                        body: json!({ "response": call.prompt }),
                    })
                }
                Script::Stream(chunks) => {
                    for chunk in chunks {
                        partials.emit(chunk);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok(RawReply {
                        body: json!({ "response": chunks.concat(), "done": true }),
                    })
                }
            }
        }

        fn extract_text(&self, body: &Value) -> Option<String> {
            match self.kind {
                BackendKind::Local => body.get("response").and_then(Value::as_str).map(str::to_string),
                BackendKind::Cloud => body
                    .pointer("/candidates/0/content/parts/0/text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }

        async fn list_models(&self) -> Result<Vec<String>, TransportError> {
            self.calls.lock().push(OutboundCall {
                correlation_id: CorrelationId::new(),
                prompt: String::new(),
                model: String::new(),
                system_prompt: None,
                stream: false,
            });
            Ok(vec![self.model.to_string()])
        }
    }

    fn gateway(local: Arc<Scripted>, cloud: Arc<Scripted>) -> ProviderGateway {
        ProviderGateway::builder()
            .backend("local", local)
            .backend("cloud", cloud)
            .fallback_order(vec![BackendId::from("local"), BackendId::from("cloud")])
            .build()
    }

    fn cloud_reply(text: &str) -> Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    }

    #[tokio::test(start_paused = true)]
    async fn reachable_preferred_backend_answers_without_fallback() {
        let local = Scripted::local(Script::Reply(
            json!({ "response": "Hi there", "model": "llama3", "done": true }),
        ));
        let cloud = Scripted::cloud(Script::Reply(cloud_reply("unused")));
        let gw = gateway(local.clone(), cloud.clone());

        let out = gw
            .generate("Hello", &BackendId::from("local"), GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(out.text, "Hi there");
        assert_eq!(out.backend, BackendId::from("local"));
        assert_eq!(out.model, "llama3");
        assert!(!out.fell_back());
        assert!(cloud.call_ids().is_empty());
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_local_falls_back_to_cloud_with_fresh_id() {
        let local = Scripted::local(Script::Silent);
        let cloud = Scripted::cloud(Script::Reply(cloud_reply("Hello from the cloud")));
        let gw = gateway(local.clone(), cloud.clone());

        let out = gw
            .generate(
                "Hello",
                &BackendId::from("local"),
                GenerateOptions::default().with_timeout(Duration::from_millis(30_000)),
            )
            .await
            .unwrap();
        assert_eq!(out.backend, BackendId::from("cloud"));
        assert_eq!(out.text, "Hello from the cloud");
        assert_eq!(out.attempts.len(), 2);
        assert_eq!(out.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert_ne!(out.attempts[0].correlation_id, out.attempts[1].correlation_id);
        assert_eq!(local.call_ids().len(), 1);
        assert_eq!(cloud.call_ids(), vec![out.correlation_id]);
        assert!(out.latency() >= Duration::from_secs(30));
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn both_failing_exhausts_without_leaking_entries() {
        let local = Scripted::local(Script::Silent);
        let cloud = Scripted::cloud(Script::Fail(TransportError::Status {
            status: 503,
            body: "unavailable".into(),
        }));
        let gw = gateway(local.clone(), cloud.clone());

        let err = gw
            .generate(
                "Hello",
                &BackendId::from("local"),
                GenerateOptions::default().with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        match err {
            GenerationError::AllBackendsExhausted { attempted, last, .. } => {
                assert_eq!(attempted, vec![BackendId::from("local"), BackendId::from("cloud")]);
                assert!(matches!(*last, GenerationError::ProviderError { status: Some(503), .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(local.call_ids().len(), 1);
        assert_eq!(cloud.call_ids().len(), 1);
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_body_triggers_fallback() {
        let local = Scripted::local(Script::Reply(json!({ "done": true })));
        let cloud = Scripted::cloud(Script::Reply(cloud_reply("recovered")));
        let gw = gateway(local, cloud);

        let out = gw
            .generate("Hello", &BackendId::from("local"), GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(out.text, "recovered");
        assert!(matches!(
            out.attempts[0].outcome,
            AttemptOutcome::Errored { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_never_cross_resolve() {
        let local = Scripted::local(Script::Echo(Duration::from_millis(50)));
        let gw = Arc::new(
            ProviderGateway::builder()
                .backend("local", local)
                .build(),
        );
        let local_id = BackendId::from("local");

        let calls = (0..8).map(|i| {
            let gw = gw.clone();
            let id = local_id.clone();
            tokio::spawn(async move {
                let prompt = format!("prompt {i}");
                let out = gw.generate(&prompt, &id, GenerateOptions::default()).await.unwrap();
                (prompt, out)
            })
        });
        let mut seen = std::collections::HashSet::new();
        for call in calls.collect::<Vec<_>>() {
            let (prompt, out) = call.await.unwrap();
            assert_eq!(out.text, prompt);
            assert!(seen.insert(out.correlation_id));
        }
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout_is_discarded() {
        let local = Scripted::local(Script::Silent);
        let gw = ProviderGateway::builder().backend("local", local).build();

        let err = gw
            .generate(
                "Hello",
                &BackendId::from("local"),
                GenerateOptions::default().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        let GenerationError::AllBackendsExhausted { last, attempted, .. } = err else {
            panic!("expected exhaustion");
        };
        assert_eq!(attempted, vec![BackendId::from("local")]);
        let GenerationError::Timeout { correlation_id, .. } = *last else {
            panic!("expected timeout");
        };
        let late = Ok(RawReply {
            body: json!({ "response": "too late" }),
        });
        assert!(!gw.pending().resolve(&correlation_id, late));
        assert!(!gw.pending().sink(correlation_id).emit("too late"));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_slower_than_deadline_times_out() {
        let local = Scripted::local(Script::ReplyAfter(
            Duration::from_secs(2),
            json!({ "response": "slow" }),
        ));
        let gw = ProviderGateway::builder()
            .backend("local", local)
            .default_timeout(Duration::from_secs(1))
            .build();
        let err = gw
            .generate("Hello", &BackendId::from("local"), GenerateOptions::default())
            .await
            .unwrap_err();
        let GenerationError::AllBackendsExhausted { last, .. } = err else {
            panic!("expected exhaustion");
        };
        assert!(matches!(*last, GenerationError::Timeout { after, .. } if after == Duration::from_secs(1)));
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_deadline_is_capped() {
        let local = Scripted::local(Script::Silent);
        let cloud = Scripted::cloud(Script::Silent);
        let gw = ProviderGateway::builder()
            .backend("local", local)
            .backend("cloud", cloud)
            .fallback_order(vec![BackendId::from("cloud")])
            .fallback_timeout(Duration::from_secs(5))
            .build();

        let started = Instant::now();
        let err = gw
            .generate(
                "Hello",
                &BackendId::from("local"),
                GenerateOptions::default().with_timeout(Duration::from_secs(20)),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(25) && elapsed < Duration::from_secs(26));
        let GenerationError::AllBackendsExhausted { attempts, last, .. } = err else {
            panic!("expected exhaustion");
        };
        assert!(matches!(
            *last,
            GenerationError::Timeout { ref backend, after, .. }
                if backend.as_str() == "cloud" && after == Duration::from_secs(5)
        ));
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::TimedOut);
        assert_eq!(attempts[1].outcome, AttemptOutcome::TimedOut);
        assert!(attempts[1].latency_ms >= 5_000 && attempts[1].latency_ms < 6_000);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_dispatch() {
        let local = Scripted::local(Script::Reply(json!({ "response": "x" })));
        let gw = ProviderGateway::builder().backend("local", local.clone()).build();
        let id = BackendId::from("local");

        let err = gw.generate("   ", &id, GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::InvalidRequest(_)));

        let err = gw
            .generate("Hello", &id, GenerateOptions::default().with_timeout(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::InvalidRequest(_)));

        let err = gw
            .generate("Hello", &BackendId::from("cloud"), GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::BackendUnavailable { .. }));
        assert!(local.call_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn model_override_applies_to_preferred_backend_only() {
        let local = Scripted::local(Script::Fail(TransportError::Connect("refused".into())));
        let cloud = Scripted::cloud(Script::Reply(cloud_reply("ok")));
        let gw = gateway(local.clone(), cloud.clone());

        let out = gw
            .generate(
                "Hello",
                &BackendId::from("local"),
                GenerateOptions::default()
                    .with_model("mistral")
                    .with_system_prompt("Be brief"),
            )
            .await
            .unwrap();
        assert_eq!(local.calls.lock()[0].model, "mistral");
        assert_eq!(cloud.calls.lock()[0].model, "gemini-1.5-flash");
        assert_eq!(cloud.calls.lock()[0].system_prompt.as_deref(), Some("Be brief"));
        assert_eq!(out.model, "gemini-1.5-flash");
    }

    #[tokio::test(start_paused = true)]
    async fn max_attempts_limits_fallback_chain() {
        let first = Scripted::local(Script::Fail(TransportError::Connect("refused".into())));
        let second = Scripted::local(Script::Fail(TransportError::Connect("refused".into())));
        let third = Scripted::local(Script::Reply(json!({ "response": "never" })));
        let gw = ProviderGateway::builder()
            .backend("a", first)
            .backend("b", second)
            .backend("c", third.clone())
            .fallback_order(vec!["a".into(), "b".into(), "c".into()])
            .build();

        let err = gw
            .generate("Hello", &BackendId::from("a"), GenerateOptions::default())
            .await
            .unwrap_err();
        match err {
            GenerationError::AllBackendsExhausted { attempted, .. } => {
                assert_eq!(attempted, vec![BackendId::from("a"), BackendId::from("b")]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(third.call_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_delivers_partials_before_result() {
        let local = Scripted::local(Script::Stream(vec!["Hi", " there"]));
        let gw = ProviderGateway::builder().backend("local", local).build();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let out = gw
            .generate_streaming("Hello", &BackendId::from("local"), GenerateOptions::default(), tx)
            .await
            .unwrap();
        assert_eq!(out.text, "Hi there");

        let mut fragments = Vec::new();
        while let Ok(partial) = rx.try_recv() {
            assert_eq!(partial.correlation_id, out.correlation_id);
            fragments.push(partial.text);
        }
        assert_eq!(fragments, vec!["Hi", " there"]);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_does_not_extend_deadline() {
        let local = Scripted::local(Script::Stream(vec!["a"; 50]));
        let gw = ProviderGateway::builder().backend("local", local).build();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = gw
            .generate_streaming(
                "Hello",
                &BackendId::from("local"),
                GenerateOptions::default().with_timeout(Duration::from_millis(100)),
                tx,
            )
            .await
            .unwrap_err();
        let GenerationError::AllBackendsExhausted { last, .. } = err else {
            panic!("expected exhaustion");
        };
        assert!(matches!(*last, GenerationError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_releases_its_entry() {
        let local = Scripted::local(Script::Silent);
        let gw = Arc::new(ProviderGateway::builder().backend("local", local).build());

        let task = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.generate("Hello", &BackendId::from("local"), GenerateOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gw.pending_count(), 1);
        task.abort();
        let _ = task.await;
        assert_eq!(gw.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_leaked_entries() {
        let gw = Arc::new(ProviderGateway::builder().build());
        let (guard, _rx) = gw.pending().register(
            BackendId::from("local"),
            Instant::now() + Duration::from_millis(50),
            None,
        );
        std::mem::forget(guard);
        let sweeper = gw.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gw.pending_count(), 0);
        sweeper.abort();
    }

    #[tokio::test]
    async fn model_list_is_cached_until_refresh() {
        let local = Scripted::local(Script::Reply(json!({})));
        let gw = ProviderGateway::builder().backend("local", local.clone()).build();
        let id = BackendId::from("local");

        assert_eq!(gw.list_models(&id, false).await.unwrap(), vec!["llama3"]);
        gw.list_models(&id, false).await.unwrap();
        assert_eq!(local.call_ids().len(), 1);
        gw.list_models(&id, true).await.unwrap();
        assert_eq!(local.call_ids().len(), 2);
        assert_eq!(gw.backends()[0].kind, BackendKind::Local);
    }
}
