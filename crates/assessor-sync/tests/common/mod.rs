#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use assessor_sync::config::{FtpSettings, RetrySettings, SyncConfig};
use assessor_sync::import::EntityCatalog;
use assessor_sync::lock::LockCoordinator;
use assessor_sync::production::MemoryProductionStore;
use assessor_sync::scheduler::StatePaths;
use assessor_sync::staging::MemoryStagingStore;
use assessor_sync::transfer::{FileTransport, RemoteFile, RemoteKind};
use assessor_sync::{CommitEngine, SyncPipeline, SyncScheduler};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const REMOTE_DIR: &str = "/exports";

pub const FIVE_PARCELS: &str = "BC001,123 Main St,12345,residential,active,0.25,150000\n\
                                BC002,45 Oak Ave,12346,residential,active,0.50,210000\n\
                                BC003,broken row\n\
                                BC004,9 Pine Rd,12348,commercial,active,1.75,990000\n\
                                BC005,1 Elm St,12349,residential,inactive,0.10,87000\n";

pub const TWO_PARCELS: &str = "BC101,7 Birch Ln,22345,residential,active,0.30,175000\n\
                               BC102,8 Cedar Ct,22346,residential,active,0.35,182500\n";

#[derive(Default)]
struct ServerState {
    listings: HashMap<String, Vec<RemoteFile>>,
    files: HashMap<String, Vec<u8>>,
    failures_left: HashMap<String, u32>,
    panics_on: Option<String>,
    refuse_login: bool,
    retrievals: Vec<String>,
    connects: u32,
}

/// Scripted file server shared between the test and every run's transport
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    connected: Arc<AtomicBool>,
}

impl FakeServer {
    pub fn new() -> Self {
        let server = Self::default();
        server.state.lock().unwrap().listings.insert(REMOTE_DIR.to_string(), Vec::new());
        server
    }

    pub fn with_file(self, name: &str, day: u32, body: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let path = format!("{}/{}", REMOTE_DIR, name);
            state.listings.entry(REMOTE_DIR.to_string()).or_default().push(RemoteFile {
                name: name.to_string(),
                path: path.clone(),
                size: body.len() as u64,
                modified: Some(Utc.with_ymd_and_hms(2024, 6, day, 8, 0, 0).unwrap()),
                kind: RemoteKind::File,
            });
            state.files.insert(path, body.as_bytes().to_vec());
        }
        self
    }

    /// Fail the next `failures` retrievals of `name`
    pub fn flaky(self, name: &str, failures: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures_left
            .insert(format!("{}/{}", REMOTE_DIR, name), failures);
        self
    }

    pub fn panicking_on(self, name: &str) -> Self {
        self.state.lock().unwrap().panics_on = Some(format!("{}/{}", REMOTE_DIR, name));
        self
    }

    pub fn refusing_login(self) -> Self {
        self.state.lock().unwrap().refuse_login = true;
        self
    }

    pub fn retrievals(&self) -> Vec<String> {
        self.state.lock().unwrap().retrievals.clone()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileTransport for FakeServer {
    async fn connect(&self, settings: &FtpSettings) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.refuse_login {
            anyhow::bail!("530 Login incorrect for {}", settings.username)
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, path: &str) -> anyhow::Result<Vec<RemoteFile>> {
        self.state
            .lock()
            .unwrap()
            .listings
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("550 {}: no such directory", path))
    }

    async fn retrieve(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let panics = {
            let mut state = self.state.lock().unwrap();
            state.retrievals.push(path.to_string());
            if let Some(left) = state.failures_left.get_mut(path) {
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("425 Can't open data connection")
                }
            }
            state.panics_on.as_deref() == Some(path)
        };
        if panics {
            panic!("transport blew up on {}", path);
        }
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("550 {}: not found", path))
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

pub type FakeFactory = Box<dyn Fn() -> FakeServer + Send + Sync>;

pub struct Harness {
    pub dir: TempDir,
    pub config: SyncConfig,
    pub server: FakeServer,
    pub engine: Arc<CommitEngine>,
    pub production: Arc<MemoryProductionStore>,
    pub scheduler: SyncScheduler<SyncPipeline<FakeFactory>>,
}

pub fn test_config(dir: &TempDir) -> SyncConfig {
    let state_dir = dir.path().join("state");
    SyncConfig {
        ftp: FtpSettings {
            host: "ftp.test.invalid".into(),
            username: "county".into(),
            password: "secret".into(),
            ..FtpSettings::default()
        },
        remote_path: REMOTE_DIR.to_string(),
        data_dir: dir.path().join("data"),
        lock_path: state_dir.join("sync.lock"),
        database_url: "sqlite::memory:".into(),
        state_dir,
        retry: RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            attempt_timeout_secs: 5,
        },
        ..SyncConfig::default()
    }
}

pub fn harness(server: FakeServer) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    harness_with(dir, config, server)
}

pub fn harness_with(dir: TempDir, config: SyncConfig, server: FakeServer) -> Harness {
    let production = Arc::new(MemoryProductionStore::new());
    let engine = Arc::new(CommitEngine::new(
        Arc::new(EntityCatalog::builtin()),
        Arc::new(MemoryStagingStore::new()),
        production.clone(),
    ));

    let shared = server.clone();
    let factory: FakeFactory = Box::new(move || shared.clone());
    let pipeline = SyncPipeline::new(config.clone(), engine.clone(), factory);
    let locks = LockCoordinator::file(config.lock_path.clone(), config.lock_stale_after());
    let scheduler = SyncScheduler::new(pipeline, locks, StatePaths::from_config(&config));

    Harness {
        dir,
        config,
        server,
        engine,
        production,
        scheduler,
    }
}
