pub mod access;
pub mod backend;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod events;
pub mod lifecycle;
pub mod locks;
pub mod models;
pub mod monitor;
pub mod nodes;
pub mod phi_store;
pub mod pipeline;
pub mod storage;

use std::sync::Arc;
use tracing_subscriber::{self, prelude::*};

use crate::backend::BackendClient;
use crate::config::{Config, ProxyConfiguration, ProxyConfigurationHandle};
use crate::locks::DispatchLockManager;
use crate::monitor::StudyMonitor;
use crate::nodes::NodeRegistry;
use crate::pipeline::{CompletionPipeline, PipelineConfig};
use crate::storage::ProxyStore;

/// Everything the running proxy needs to hand to its protocol adapters,
/// background workers and control-channel client. Assembled once in
/// [`run`] and shared behind `Arc`s; nothing here is mutated in place after
/// startup except through the RCU `ProxyConfigurationHandle` and the
/// `NodeRegistry`'s internal lock.
pub struct ProxyRuntime {
    pub config: Config,
    pub proxy_configuration: ProxyConfigurationHandle,
    pub nodes: Arc<NodeRegistry>,
    pub store: ProxyStore,
    pub backend: Arc<BackendClient>,
    pub monitor: Arc<StudyMonitor>,
    pub pipeline: Arc<CompletionPipeline>,
    pub locks: Arc<DispatchLockManager>,
}

fn init_logging(config: &Config) {
    if config.logging.log_to_file {
        let file_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::fs::File::create(&config.logging.log_file_path).unwrap());

        let stdout_appender = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_appender)
            .with(stdout_appender)
            .try_init()
            .expect("Failed to initialise logging");
    } else {
        tracing_subscriber::fmt()
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

/// Build the runtime's shared services from a loaded [`Config`]. Does not
/// start the DICOM SCP, the study monitor's background tick, or the
/// control-channel client — callers that want those running call `spawn()`
/// on the relevant piece once this returns.
pub fn build_runtime(config: Config) -> ProxyRuntime {
    init_logging(&config);

    tracing::info!(
        "🔧 Starting pacsproxyd '{}' (ae_title={}, port={})",
        config.proxy.id,
        config.proxy.ae_title,
        config.proxy.port
    );

    let proxy_configuration =
        ProxyConfigurationHandle::new(ProxyConfiguration::from_static(&config.proxy, chrono::Utc::now()));

    let store_dir = std::path::PathBuf::from(&config.proxy.store_dir);
    std::fs::create_dir_all(&store_dir).expect("failed to create store_dir");
    let db_path = store_dir.join("proxy.redb");
    let store = ProxyStore::open(&db_path).expect("failed to open proxy database");

    let backend = Arc::new(
        BackendClient::new(config.proxy.resolver_api_url.clone(), config.proxy.proxy_key.clone())
            .expect("failed to build backend HTTP client"),
    );

    let archive_root = std::path::PathBuf::from(&config.proxy.archive_root);
    std::fs::create_dir_all(&archive_root).expect("failed to create archive_root");
    let pipeline = CompletionPipeline::new(
        PipelineConfig {
            archive_root,
            ..PipelineConfig::default()
        },
        store.clone(),
        backend.clone(),
    );

    let monitor = StudyMonitor::with_default_timeout(vec![
        pipeline.clone() as Arc<dyn crate::monitor::CompletionCallback>
    ]);

    ProxyRuntime {
        config,
        proxy_configuration,
        nodes: Arc::new(NodeRegistry::new()),
        store,
        backend,
        monitor,
        pipeline,
        locks: DispatchLockManager::new(),
    }
}
