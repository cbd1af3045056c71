//! reconciled: runs a controller over objects loaded from a TOML manifest.
//!
//! Configured from the environment (see `Config::from_env`); stops on Ctrl-C.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use reconcile_rs::config::Config;
use reconcile_rs::engine::{Controller, Reconciler};
use reconcile_rs::model::{ObjectKey, Resource};
use reconcile_rs::source::MemorySource;
use reconcile_rs::telemetry::{TelemetryConfig, init_telemetry};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

/// One `[[object]]` entry of the manifest.
#[derive(Debug, Clone, Deserialize)]
struct ManifestObject {
    namespace: Option<String>,
    name: String,
    #[serde(default)]
    spec: serde_json::Value,
}

impl Resource for ManifestObject {
    fn object_key(&self) -> reconcile_rs::error::Result<ObjectKey> {
        match &self.namespace {
            Some(ns) => ObjectKey::namespaced(ns, &self.name),
            None => ObjectKey::cluster(&self.name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    object: Vec<ManifestObject>,
}

fn load_manifest(path: &Path) -> anyhow::Result<Vec<ManifestObject>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read manifest {}", path.display()))?;
    let manifest: Manifest = toml::from_str(&content)
        .with_context(|| format!("bad manifest {}", path.display()))?;
    Ok(manifest.object)
}

/// Reports the desired state the cache currently holds for each key.
struct ManifestReconciler {
    source: Arc<MemorySource<ManifestObject>>,
}

impl Reconciler for ManifestReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()> {
        match self.source.get(key) {
            Some(obj) => {
                info!(%key, spec = %obj.spec, "desired state observed");
            }
            None => {
                info!(%key, "object gone, nothing to converge");
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "reconciled".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let source = Arc::new(MemorySource::new());
    if let Some(path) = &config.manifest {
        for obj in load_manifest(path)? {
            source.apply(obj)?;
        }
        info!(objects = source.keys().len(), manifest = %path.display(), "manifest loaded");
    }
    source.mark_synced();

    let (dead_tx, mut dead_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(letter) = dead_rx.recv().await {
            match serde_json::to_string(&letter) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::error!("cannot serialize dead letter: {e}"),
            }
        }
    });

    let reconciler = ManifestReconciler {
        source: Arc::clone(&source),
    };
    let controller = Controller::builder("manifest", Arc::clone(&source), reconciler)
        .config(config.controller.clone())
        .dead_letters(dead_tx)
        .build();

    let ctrl = controller.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    controller.run().await?;
    Ok(())
}
