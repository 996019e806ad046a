use ferrumrepl::{
    persistence::JsonFileDocumentStore, web, InMemorySyncSource, MemoryStorage, MemoryStorageConfig, OpTime,
    OplogEntry, ReplSettings, ReplicationManager, StorageEngine,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Feed the in-process sync source with a steady stream of writes
fn spawn_generator(source: Arc<InMemorySyncSource>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1);
        let mut inc = 0u32;
        let mut next = move || {
            inc += 1;
            OpTime::new(secs, inc, 1)
        };

        let seed = [
            OplogEntry::command(next(), "demo", json!({"create": "events"})),
            OplogEntry::insert(next(), "demo.counters", json!({"_id": "total", "value": 0})),
        ];
        for entry in seed {
            if let Err(e) = source.append(entry) {
                warn!("Failed to seed demo source: {}", e);
            }
        }

        let mut seq = 0u64;
        let mut tick = tokio::time::interval(Duration::from_millis(200));
        loop {
            tick.tick().await;
            seq += 1;
            let mut result = source.append(OplogEntry::insert(next(), "demo.events", json!({"_id": seq, "seq": seq})));
            if result.is_ok() && seq % 5 == 0 {
                result = source.append(OplogEntry::update(next(), "demo.counters", json!("total"), json!({"value": seq})));
            }
            if let Err(e) = result {
                warn!("Demo source rejected write {}: {}", seq, e);
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (INFO by default, RUST_LOG overrides)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    info!("FerrumRepl starting...");

    let settings = match std::env::args().nth(1) {
        Some(path) => match ReplSettings::from_json_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to load settings from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => ReplSettings::default(),
    };
    info!("Using {} writer threads", settings.writer_threads);

    let storage = Arc::new(MemoryStorage::open(MemoryStorageConfig {
        journal_path: settings.journal_path.clone(),
        sync_policy: settings.journal_sync_policy,
        commit_interval: settings.journal_commit_interval(),
        snapshots_enabled: true,
    })?);
    let documents = Arc::new(JsonFileDocumentStore::open(&settings.data_dir)?);
    let source = Arc::new(InMemorySyncSource::with_hosts(&["127.0.0.1:27017"]));
    let generator = spawn_generator(source.clone());

    let manager = Arc::new(ReplicationManager::new(storage.clone(), source, documents));
    if let Err(e) = manager.start_threads(settings.clone()) {
        error!("Failed to start replication: {}", e);
        std::process::exit(1);
    }

    if storage.applied_through().is_none() {
        let (tx, rx) = oneshot::channel();
        manager.start_initial_sync(Box::new(move |result| {
            let _ = tx.send(result);
        }))?;
        match rx.await? {
            Ok(op_time) => info!("Initial sync complete at {}", op_time),
            Err(e) => {
                error!("Initial sync failed: {}", e);
                let manager = manager.clone();
                tokio::task::spawn_blocking(move || manager.shutdown()).await?;
                std::process::exit(1);
            }
        }
    }
    manager.start_steady_state_replication()?;

    let admin_addr = settings.admin_addr.clone();
    let admin_manager = manager.clone();
    let admin_handle = tokio::spawn(async move {
        info!("Starting admin server on {}", admin_addr);
        if let Err(e) = web::run_admin_server(&admin_addr, admin_manager).await {
            error!("Admin server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        _ = admin_handle => error!("Admin server stopped"),
    }

    generator.abort();
    let stopping = manager.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;
    storage.shutdown();
    info!("FerrumRepl stopped");
    Ok(())
}
