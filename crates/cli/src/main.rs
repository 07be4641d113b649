use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kubespout_adapter::{Adapter, AdapterOptions};
use kubespout_core::{build_descriptors, Mode};
use kubespout_sink::SinkClient;
use kubespout_stats::StatsReporter;
use kubespout_translate::Translator;
use kubespout_watch::KubeWatchSource;

/// Environment-sourced adapter configuration. The parallel api-version /
/// kind / controller lists must have equal length.
#[derive(Parser, Debug)]
#[command(name = "kubespoutd", version, about = "Kubernetes resource-watch-to-event adapter")]
struct EnvConfig {
    /// Namespace scope for every watch; empty watches cluster-wide.
    #[arg(long, env = "SYSTEM_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Event payload mode: full object snapshots or references only.
    #[arg(long, env = "MODE", default_value = "Resource", value_parser = parse_mode)]
    mode: Mode,

    /// Sink endpoint events are POSTed to.
    #[arg(long = "sink-uri", env = "SINK_URI")]
    sink_uri: String,

    /// apiVersion per watched kind, e.g. "v1" or "apps/v1".
    #[arg(long = "api-version", env = "API_VERSION", value_delimiter = ',', required = true)]
    api_version: Vec<String>,

    #[arg(long, env = "KIND", value_delimiter = ',', required = true)]
    kind: Vec<String>,

    /// Whether owner-controller semantics apply, per watched kind.
    #[arg(long, env = "CONTROLLER", value_delimiter = ',', required = true)]
    controller: Vec<bool>,

    /// Importer identity used as a metrics tag.
    #[arg(long, env = "APISERVERIMPORTER")]
    importer: String,

    /// Base64-encoded JSON logging config; falls back to defaults on parse failure.
    #[arg(long = "logging-config", env = "K_LOGGING_CONFIG")]
    logging_config: Option<String>,

    /// Base64-encoded JSON metrics config.
    #[arg(long = "metrics-config", env = "K_METRICS_CONFIG")]
    metrics_config: Option<String>,

    /// Listen address for the Prometheus text endpoint; overrides the blob.
    #[arg(long = "metrics-addr", env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    Mode::from_str(s).map_err(|e| e.to_string())
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct LoggingConfig {
    #[serde(default = "default_level")]
    level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
struct MetricsConfig {
    address: Option<String>,
}

fn decode_blob<T: serde::de::DeserializeOwned>(blob: &str) -> Result<T> {
    let raw = BASE64.decode(blob).context("decoding base64 blob")?;
    let text = String::from_utf8(raw).context("blob is not utf-8")?;
    serde_json::from_str(&text).context("parsing config blob json")
}

/// Tracing is not up yet here, so the fallback branch reports on stderr.
fn load_logging_config(blob: Option<&str>) -> LoggingConfig {
    match blob {
        None => LoggingConfig::default(),
        Some(b) => match decode_blob(b) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("[ERROR] failed to process logging config: {e:#}; using defaults");
                LoggingConfig::default()
            }
        },
    }
}

fn load_metrics_config(blob: Option<&str>) -> MetricsConfig {
    match blob {
        None => MetricsConfig::default(),
        Some(b) => match decode_blob(b) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "failed to process metrics config; using defaults");
                MetricsConfig::default()
            }
        },
    }
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::from_str(&cfg.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(flag_addr: Option<SocketAddr>, cfg: &MetricsConfig) {
    let addr = match flag_addr {
        Some(a) => Some(a),
        None => match cfg.address.as_deref() {
            Some(raw) => match raw.parse::<SocketAddr>() {
                Ok(a) => Some(a),
                Err(_) => {
                    warn!(addr = %raw, "invalid metrics address; expected host:port");
                    None
                }
            },
            None => None,
        },
    };
    if let Some(addr) = addr {
        kubespout_stats::exporter::serve(addr);
    }
}

fn spawn_signal_handler(stop_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    let _ = stop_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("interrupt received; draining"),
                _ = term.recv() => info!("SIGTERM received; draining"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("interrupt received; draining");
        }
        let _ = stop_tx.send(true);
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvConfig::parse();
    let logging = load_logging_config(env.logging_config.as_deref());
    init_tracing(&logging);
    let metrics = load_metrics_config(env.metrics_config.as_deref());
    init_metrics(env.metrics_addr, &metrics);

    // Fatal before anything is watched: mismatched lists never reach a
    // watch source.
    let descriptors = build_descriptors(&env.api_version, &env.kind, &env.controller)
        .context("assembling watched descriptors")?;

    let reporter =
        Arc::new(StatsReporter::new().context("registering metrics views")?);

    let kube_config = kube::Config::infer().await.context("inferring kube config")?;
    let cluster_url = kube_config.cluster_url.to_string();
    let client = kube::Client::try_from(kube_config).context("building kube client")?;

    let source = Arc::new(KubeWatchSource::new(client));
    let sink = Arc::new(SinkClient::new(&env.sink_uri).context("building sink client")?);
    let translator = Translator::new(env.mode, cluster_url);

    let namespace = if env.namespace.is_empty() { None } else { Some(env.namespace.clone()) };
    let opts = AdapterOptions {
        namespace,
        importer_name: env.importer.clone(),
        ..AdapterOptions::default()
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_signal_handler(stop_tx);

    info!(
        sink = %env.sink_uri,
        kinds = descriptors.len(),
        mode = ?env.mode,
        importer = %env.importer,
        "starting resource watch adapter"
    );
    let adapter = Adapter::new(source, sink, reporter, translator, descriptors, opts);
    if let Err(e) = adapter.start(stop_rx).await {
        warn!(error = %e, "adapter start returned an error");
        return Err(e.into());
    }
    Ok(())
}
