#![forbid(unsafe_code)]

//! End-to-end orchestrator flow against a scripted watch source and a live
//! mock sink: translate → deliver → report, fault handling, drain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use prometheus::Registry;
use tokio::sync::{mpsc, watch, Mutex};

use kubespout_adapter::{Adapter, AdapterError, AdapterOptions, RetryPolicy};
use kubespout_core::{
    build_descriptors, LifecycleKind, LifecycleNotification, Mode, ResourceDescriptor,
};
use kubespout_sink::SinkClient;
use kubespout_stats::{ReportArgs, StatsReporter, IMPORTER_RESOURCE_GROUP};
use kubespout_translate::Translator;
use kubespout_watch::WatchSource;

// ---- scripted watch source ----

#[derive(Clone)]
enum Step {
    Emit { kind: LifecycleKind, ns: &'static str, name: &'static str, rv: &'static str },
    Sleep(u64),
    Fail(&'static str),
    /// Emit one object repeatedly (fresh resourceVersion each time) until the
    /// consumer goes away.
    Flood { every_ms: u64 },
}

struct ScriptedSource {
    scripts: HashMap<String, Vec<Step>>,
    resolve_ok: bool,
    subscribed: AtomicBool,
}

impl ScriptedSource {
    fn new(scripts: Vec<(&Arc<ResourceDescriptor>, Vec<Step>)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts.into_iter().map(|(d, s)| (d.gvk_key(), s)).collect(),
            resolve_ok: true,
            subscribed: AtomicBool::new(false),
        })
    }

    fn failing_resolve() -> Arc<Self> {
        Arc::new(Self {
            scripts: HashMap::new(),
            resolve_ok: false,
            subscribed: AtomicBool::new(false),
        })
    }

    fn notification(
        descriptor: &Arc<ResourceDescriptor>,
        kind: LifecycleKind,
        ns: &str,
        name: &str,
        rv: &str,
    ) -> LifecycleNotification {
        let resource = serde_json::json!({
            "apiVersion": descriptor.api_version(),
            "kind": descriptor.kind,
            "metadata": { "namespace": ns, "name": name, "resourceVersion": rv },
        });
        LifecycleNotification {
            kind,
            resource,
            descriptor: Arc::clone(descriptor),
            namespace: ns.to_string(),
            name: name.to_string(),
            resource_version: rv.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
impl WatchSource for ScriptedSource {
    async fn resolve(&self, descriptors: &[Arc<ResourceDescriptor>]) -> anyhow::Result<()> {
        if self.resolve_ok {
            Ok(())
        } else {
            anyhow::bail!("GVK not found: {}", descriptors[0].gvk_key())
        }
    }

    async fn subscribe(
        &self,
        descriptor: Arc<ResourceDescriptor>,
        _namespace: Option<String>,
        tx: mpsc::Sender<LifecycleNotification>,
    ) -> anyhow::Result<()> {
        self.subscribed.store(true, Ordering::SeqCst);
        let steps = self.scripts.get(&descriptor.gvk_key()).cloned().unwrap_or_default();
        for step in steps {
            match step {
                Step::Emit { kind, ns, name, rv } => {
                    let n = Self::notification(&descriptor, kind, ns, name, rv);
                    if tx.send(n).await.is_err() {
                        return Ok(());
                    }
                }
                Step::Sleep(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                Step::Fail(msg) => anyhow::bail!("{msg}"),
                Step::Flood { every_ms } => {
                    let mut rv = 0u64;
                    loop {
                        rv += 1;
                        let version = rv.to_string();
                        let n = Self::notification(
                            &descriptor,
                            LifecycleKind::Updated,
                            "flood",
                            "obj",
                            &version,
                        );
                        if tx.send(n).await.is_err() {
                            return Ok(());
                        }
                        tokio::time::sleep(Duration::from_millis(every_ms)).await;
                    }
                }
            }
        }
        // Keep the subscription open like a real watch; end when cancelled.
        park_until_cancelled(tx).await;
        Ok(())
    }
}

/// Park until the consumer closes the channel (subscription cancellation).
async fn park_until_cancelled(tx: mpsc::Sender<LifecycleNotification>) {
    tx.closed().await;
}

// ---- mock sink ----

struct SinkServerState {
    bodies: Mutex<Vec<serde_json::Value>>,
    hits: AtomicUsize,
    respond: Box<dyn Fn(usize) -> u16 + Send + Sync>,
    delay_ms: u64,
}

async fn sink_handler(
    State(state): State<Arc<SinkServerState>>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if state.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(state.delay_ms)).await;
    }
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    state.bodies.lock().await.push(body);
    StatusCode::from_u16((state.respond)(hit)).unwrap()
}

async fn start_sink(
    respond: impl Fn(usize) -> u16 + Send + Sync + 'static,
    delay_ms: u64,
) -> (SocketAddr, Arc<SinkServerState>) {
    let state = Arc::new(SinkServerState {
        bodies: Mutex::new(Vec::new()),
        hits: AtomicUsize::new(0),
        respond: Box::new(respond),
        delay_ms,
    });
    let app = Router::new().route("/", post(sink_handler)).with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

// ---- harness ----

fn reporter() -> (Arc<StatsReporter>, Registry) {
    let registry = Registry::new();
    let reporter = StatsReporter::with_registry(registry.clone()).unwrap();
    (Arc::new(reporter), registry)
}

fn options(importer: &str) -> AdapterOptions {
    AdapterOptions {
        namespace: None,
        importer_name: importer.to_string(),
        drain_grace: Duration::from_secs(5),
        retry: RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(10) },
        ..AdapterOptions::default()
    }
}

fn adapter(
    source: Arc<dyn WatchSource>,
    sink_addr: SocketAddr,
    reporter: Arc<StatsReporter>,
    descriptors: Vec<Arc<ResourceDescriptor>>,
    importer: &str,
) -> Adapter {
    let sink = Arc::new(SinkClient::new(format!("http://{sink_addr}/")).unwrap());
    Adapter::new(
        source,
        sink,
        reporter,
        Translator::new(Mode::Resource, "https://test-cluster"),
        descriptors,
        options(importer),
    )
}

async fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let until = Instant::now() + deadline;
    while !cond() {
        assert!(Instant::now() < until, "condition not met within {deadline:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn counter_value(registry: &Registry, name: &str, want: &[(&str, &str)]) -> f64 {
    for family in registry.gather() {
        if family.get_name() != name {
            continue;
        }
        'metric: for metric in family.get_metric() {
            for (k, v) in want {
                let found = metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == *k && pair.get_value() == *v);
                if !found {
                    continue 'metric;
                }
            }
            return metric.get_counter().get_value();
        }
    }
    0.0
}

fn descriptors() -> Vec<Arc<ResourceDescriptor>> {
    build_descriptors(
        &["v1".into(), "apps/v1".into()],
        &["ConfigMap".into(), "Deployment".into()],
        &[false, false],
    )
    .unwrap()
}

// ---- tests ----

#[tokio::test]
async fn notifications_flow_to_sink_and_stats() {
    let ds = descriptors();
    let source = ScriptedSource::new(vec![
        (
            &ds[0],
            vec![
                Step::Emit { kind: LifecycleKind::Added, ns: "prod", name: "cm", rv: "1" },
                Step::Emit { kind: LifecycleKind::Updated, ns: "prod", name: "cm", rv: "2" },
            ],
        ),
        (
            &ds[1],
            vec![
                Step::Sleep(30),
                Step::Emit { kind: LifecycleKind::Added, ns: "prod", name: "web", rv: "7" },
            ],
        ),
    ]);
    let (addr, sink_state) = start_sink(|_| 202, 0).await;
    let (reporter, registry) = reporter();
    let (stop_tx, stop_rx) = watch::channel(false);

    let a = adapter(source, addr, reporter, ds, "test-importer");
    let handle = tokio::spawn(a.start(stop_rx));

    wait_for(Duration::from_secs(5), || sink_state.hits.load(Ordering::SeqCst) >= 3).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let bodies = sink_state.bodies.lock().await;
    assert_eq!(bodies.len(), 3);
    let mut ids: Vec<&str> = bodies.iter().map(|b| b["id"].as_str().unwrap()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "event ids must be unique");

    let types: Vec<&str> = bodies.iter().map(|b| b["type"].as_str().unwrap()).collect();
    assert!(types.contains(&"io.kubespout.resource.core.configmap.add"));
    assert!(types.contains(&"io.kubespout.resource.core.configmap.update"));
    assert!(types.contains(&"io.kubespout.resource.apps.deployment.add"));

    let delivered = counter_value(
        &registry,
        "event_count",
        &[
            ("namespace_name", "prod"),
            ("importer_name", "test-importer"),
            ("importer_resource_group", IMPORTER_RESOURCE_GROUP),
            ("result", "success"),
            ("response_code", "202"),
            ("response_code_class", "2xx"),
            ("event_type", "io.kubespout.resource.core.configmap.add"),
        ],
    );
    assert_eq!(delivered, 1.0);
}

#[tokio::test]
async fn accepted_deliveries_accumulate_under_exact_tag_set() {
    let ds = descriptors();
    let source = ScriptedSource::new(vec![(
        &ds[0],
        vec![
            Step::Emit { kind: LifecycleKind::Deleted, ns: "testns", name: "cm", rv: "1" },
            Step::Emit { kind: LifecycleKind::Deleted, ns: "testns", name: "cm", rv: "2" },
        ],
    )]);
    let (addr, sink_state) = start_sink(|_| 202, 0).await;
    let (reporter, registry) = reporter();
    let (stop_tx, stop_rx) = watch::channel(false);

    let a = adapter(source, addr, reporter, ds, "test-importer");
    let handle = tokio::spawn(a.start(stop_rx));
    wait_for(Duration::from_secs(5), || sink_state.hits.load(Ordering::SeqCst) >= 2).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let count = counter_value(
        &registry,
        "event_count",
        &[
            ("namespace_name", "testns"),
            ("event_type", "io.kubespout.resource.core.configmap.delete"),
            ("result", "success"),
            ("response_code", "202"),
            ("response_code_class", "2xx"),
        ],
    );
    assert_eq!(count, 2.0);
}

#[tokio::test]
async fn unresolvable_descriptor_fails_startup_before_subscribing() {
    let ds = descriptors();
    let source = ScriptedSource::failing_resolve();
    let probe = Arc::clone(&source);
    let (addr, _sink_state) = start_sink(|_| 202, 0).await;
    let (reporter, _registry) = reporter();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let a = adapter(source, addr, reporter, ds, "test-importer");
    let err = a.start(stop_rx).await.unwrap_err();
    assert!(matches!(err, AdapterError::Startup(_)));
    assert!(!probe.subscribed.load(Ordering::SeqCst), "no watch source may be created");
}

#[tokio::test]
async fn permanent_watch_failure_surfaces_after_other_kinds_deliver() {
    let ds = descriptors();
    let source = ScriptedSource::new(vec![
        (&ds[0], vec![Step::Sleep(100), Step::Fail("watch retries exhausted")]),
        (&ds[1], vec![Step::Emit { kind: LifecycleKind::Added, ns: "prod", name: "web", rv: "1" }]),
    ]);
    let (addr, sink_state) = start_sink(|_| 202, 0).await;
    let (reporter, _registry) = reporter();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let a = adapter(source, addr, reporter, ds, "test-importer");
    let err = a.start(stop_rx).await.unwrap_err();
    assert!(matches!(err, AdapterError::WatchSource(_)));
    // The healthy kind's event went out before the fault forced shutdown.
    assert_eq!(sink_state.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resync_redelivers_with_identical_id() {
    let ds = descriptors();
    // A watch restart re-announces the same object at the same
    // resourceVersion; the sink can deduplicate on the id.
    let source = ScriptedSource::new(vec![(
        &ds[0],
        vec![
            Step::Emit { kind: LifecycleKind::Added, ns: "prod", name: "cm", rv: "5" },
            Step::Emit { kind: LifecycleKind::Added, ns: "prod", name: "cm", rv: "5" },
        ],
    )]);
    let (addr, sink_state) = start_sink(|_| 202, 0).await;
    let (reporter, _registry) = reporter();
    let (stop_tx, stop_rx) = watch::channel(false);

    let a = adapter(source, addr, reporter, ds, "test-importer");
    let handle = tokio::spawn(a.start(stop_rx));
    wait_for(Duration::from_secs(5), || sink_state.hits.load(Ordering::SeqCst) >= 2).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let bodies = sink_state.bodies.lock().await;
    assert_eq!(bodies[0]["id"], bodies[1]["id"]);
}

#[tokio::test]
async fn rejected_deliveries_are_retried_then_succeed() {
    let ds = descriptors();
    let source = ScriptedSource::new(vec![(
        &ds[0],
        vec![Step::Emit { kind: LifecycleKind::Added, ns: "prod", name: "cm", rv: "1" }],
    )]);
    // First two attempts rejected, third accepted.
    let (addr, sink_state) = start_sink(|hit| if hit < 2 { 500 } else { 202 }, 0).await;
    let (reporter, registry) = reporter();
    let (stop_tx, stop_rx) = watch::channel(false);

    let a = adapter(source, addr, reporter, ds, "test-importer");
    let handle = tokio::spawn(a.start(stop_rx));
    wait_for(Duration::from_secs(5), || sink_state.hits.load(Ordering::SeqCst) >= 3).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(sink_state.hits.load(Ordering::SeqCst), 3);
    let success = counter_value(
        &registry,
        "event_count",
        &[("result", "success"), ("response_code", "202")],
    );
    assert_eq!(success, 1.0, "one final success reported for the notification");
    let failure = counter_value(&registry, "event_count", &[("result", "failure")]);
    assert_eq!(failure, 0.0, "intermediate attempts are not counted as outcomes");
}

#[tokio::test]
async fn exhausted_retries_report_failure_with_status_class() {
    let ds = descriptors();
    let source = ScriptedSource::new(vec![(
        &ds[0],
        vec![Step::Emit { kind: LifecycleKind::Added, ns: "prod", name: "cm", rv: "1" }],
    )]);
    let (addr, sink_state) = start_sink(|_| 500, 0).await;
    let (reporter, registry) = reporter();
    let (stop_tx, stop_rx) = watch::channel(false);

    let a = adapter(source, addr, reporter, ds, "test-importer");
    let handle = tokio::spawn(a.start(stop_rx));
    wait_for(Duration::from_secs(5), || sink_state.hits.load(Ordering::SeqCst) >= 3).await;
    // Give the final report a moment to land before stopping.
    wait_for(Duration::from_secs(5), || {
        counter_value(&registry, "event_count", &[("result", "failure")]) >= 1.0
    })
    .await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let failure = counter_value(
        &registry,
        "event_count",
        &[("result", "failure"), ("response_code", "500"), ("response_code_class", "5xx")],
    );
    assert_eq!(failure, 1.0);
}

#[tokio::test]
async fn stop_signal_drains_and_returns_promptly() {
    let ds = descriptors();
    let source = ScriptedSource::new(vec![(&ds[0], vec![Step::Flood { every_ms: 10 }])]);
    let (addr, sink_state) = start_sink(|_| 202, 25).await;
    let (reporter, _registry) = reporter();
    let (stop_tx, stop_rx) = watch::channel(false);

    let a = adapter(source, addr, reporter, ds, "test-importer");
    let handle = tokio::spawn(a.start(stop_rx));
    wait_for(Duration::from_secs(5), || sink_state.hits.load(Ordering::SeqCst) >= 2).await;

    let stop_at = Instant::now();
    stop_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert!(stop_at.elapsed() < Duration::from_secs(5), "drain must respect the grace period");

    // No new notifications after drain: the sink stops receiving.
    let settled = sink_state.hits.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(sink_state.hits.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn report_args_key_by_field_values() {
    // ReportArgs is a plain value object; equality is field-wise.
    let a = ReportArgs {
        namespace: "ns".into(),
        event_type: "t".into(),
        event_source: "s".into(),
        importer_name: "i".into(),
    };
    assert_eq!(a, a.clone());
}
