//! Adapter orchestrator: owns the watch subscriptions, fans notifications
//! through translate → deliver → report, and coordinates graceful shutdown.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use kubespout_core::{DeliveryOutcome, LifecycleNotification, ResourceDescriptor};
use kubespout_sink::SinkClient;
use kubespout_stats::{ReportArgs, StatsReporter};
use kubespout_translate::Translator;
use kubespout_watch::WatchSource;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// A descriptor could not be resolved; the adapter never reached Running.
    #[error("adapter startup failed: {0}")]
    Startup(#[source] anyhow::Error),
    /// A watch source failed permanently while Running, forcing shutdown.
    #[error("watch source failed: {0}")]
    WatchSource(#[source] anyhow::Error),
}

/// Orchestrator-level redelivery policy layered over the single-attempt
/// delivery client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(200) }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Namespace scope for every subscription; `None` watches cluster-wide.
    pub namespace: Option<String>,
    pub importer_name: String,
    /// Capacity of the shared notification queue.
    pub queue_cap: usize,
    /// Concurrent in-flight deliveries.
    pub max_inflight: usize,
    /// How long Draining waits for in-flight deliveries.
    pub drain_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            importer_name: String::new(),
            queue_cap: 2048,
            max_inflight: 64,
            drain_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterState {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterState::Idle => "idle",
            AdapterState::Starting => "starting",
            AdapterState::Running => "running",
            AdapterState::Draining => "draining",
            AdapterState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct Adapter {
    source: Arc<dyn WatchSource>,
    sink: Arc<SinkClient>,
    reporter: Arc<StatsReporter>,
    translator: Translator,
    descriptors: Vec<Arc<ResourceDescriptor>>,
    opts: AdapterOptions,
}

impl Adapter {
    pub fn new(
        source: Arc<dyn WatchSource>,
        sink: Arc<SinkClient>,
        reporter: Arc<StatsReporter>,
        translator: Translator,
        descriptors: Vec<Arc<ResourceDescriptor>>,
        opts: AdapterOptions,
    ) -> Self {
        Self { source, sink, reporter, translator, descriptors, opts }
    }

    /// Run until the stop signal fires or a watch source fails permanently.
    /// In-flight deliveries are awaited up to the drain grace period.
    pub async fn start(self, mut stop: watch::Receiver<bool>) -> Result<(), AdapterError> {
        let mut state = AdapterState::Idle;
        transition(&mut state, AdapterState::Starting);

        // All descriptors must resolve before anything is watched; a partial
        // adapter never runs.
        self.source
            .resolve(&self.descriptors)
            .await
            .map_err(AdapterError::Startup)?;

        let (tx, mut rx) = mpsc::channel::<LifecycleNotification>(self.opts.queue_cap);
        let mut watchers: JoinSet<anyhow::Result<()>> = JoinSet::new();
        for descriptor in &self.descriptors {
            let source = Arc::clone(&self.source);
            let descriptor = Arc::clone(descriptor);
            let namespace = self.opts.namespace.clone();
            let tx = tx.clone();
            watchers.spawn(async move { source.subscribe(descriptor, namespace, tx).await });
        }
        drop(tx);
        transition(&mut state, AdapterState::Running);

        let inflight = Arc::new(Semaphore::new(self.opts.max_inflight));
        let mut deliveries: JoinSet<()> = JoinSet::new();
        let mut fault: Option<anyhow::Error> = None;

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("stop signal received");
                    break;
                }
                maybe = rx.recv() => match maybe {
                    Some(notification) => {
                        // Translation happens inline so per-object arrival
                        // order is preserved into the translator; delivery
                        // fans out so one slow sink response cannot stall
                        // unrelated kinds.
                        let event = self.translator.translate(&notification);
                        let args = ReportArgs {
                            namespace: notification.namespace.clone(),
                            event_type: event.ty.clone(),
                            event_source: event.source.clone(),
                            importer_name: self.opts.importer_name.clone(),
                        };
                        let permit = match Arc::clone(&inflight).acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => break,
                        };
                        let sink = Arc::clone(&self.sink);
                        let reporter = Arc::clone(&self.reporter);
                        let retry = self.opts.retry.clone();
                        deliveries.spawn(async move {
                            deliver_event(sink, reporter, event, args, retry).await;
                            drop(permit);
                        });
                    }
                    None => {
                        info!("all watch subscriptions ended");
                        break;
                    }
                },
                Some(joined) = watchers.join_next() => {
                    match joined {
                        Ok(Ok(())) => debug!("watch subscription ended cleanly"),
                        Ok(Err(e)) => {
                            error!(error = %e, "watch source failed permanently; shutting down");
                            fault = Some(e);
                            break;
                        }
                        Err(e) if e.is_panic() => {
                            fault = Some(anyhow::anyhow!("watch task panicked"));
                            break;
                        }
                        Err(_) => {}
                    }
                }
            }
        }

        transition(&mut state, AdapterState::Draining);
        // Cancel the sources first: no new notifications once drain begins.
        watchers.abort_all();
        while watchers.join_next().await.is_some() {}
        drop(rx);

        let drained = timeout(self.opts.drain_grace, async {
            while deliveries.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = deliveries.len(),
                grace_secs = self.opts.drain_grace.as_secs(),
                "drain grace elapsed; abandoning remaining deliveries"
            );
            deliveries.abort_all();
        }

        transition(&mut state, AdapterState::Stopped);
        match fault {
            Some(e) => Err(AdapterError::WatchSource(e)),
            None => Ok(()),
        }
    }
}

fn transition(state: &mut AdapterState, next: AdapterState) {
    info!(from = %state, to = %next, "adapter state change");
    *state = next;
}

/// Deliver one event with bounded exponential backoff, then report the final
/// outcome. Dispatch time is recorded per attempt that yielded a response.
async fn deliver_event(
    sink: Arc<SinkClient>,
    reporter: Arc<StatsReporter>,
    event: kubespout_core::CanonicalEvent,
    args: ReportArgs,
    retry: RetryPolicy,
) {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        let t0 = Instant::now();
        let result = sink.deliver(&event).await;
        let elapsed = t0.elapsed();
        attempt += 1;
        match result {
            Ok(code) => {
                report(&reporter, &args, Some(code), elapsed, DeliveryOutcome::success(code));
                debug!(id = %event.id, code, attempt, "event delivered");
                return;
            }
            Err(e) if attempt >= max_attempts => {
                let outcome = match e.status() {
                    Some(code) => DeliveryOutcome::rejected(code),
                    None => DeliveryOutcome::transport_failure(),
                };
                report(&reporter, &args, e.status(), elapsed, outcome);
                error!(id = %event.id, error = %e, attempts = attempt, "dropping event");
                return;
            }
            Err(e) => {
                if let Some(code) = e.status() {
                    if let Err(err) = reporter.report_event_dispatch_time(&args, code, elapsed) {
                        warn!(error = %err, "stats report failed");
                    }
                }
                let delay = retry.base_delay * 2u32.saturating_pow(attempt - 1);
                warn!(id = %event.id, error = %e, attempt, delay_ms = delay.as_millis() as u64, "delivery failed; backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn report(
    reporter: &StatsReporter,
    args: &ReportArgs,
    code: Option<u16>,
    elapsed: Duration,
    outcome: DeliveryOutcome,
) {
    if let Some(code) = code {
        if let Err(e) = reporter.report_event_dispatch_time(args, code, elapsed) {
            warn!(error = %e, "stats report failed");
        }
    }
    if let Err(e) = reporter.report_event_count(args, &outcome) {
        warn!(error = %e, "stats report failed");
    }
}
