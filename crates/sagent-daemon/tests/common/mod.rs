//! Shared fixtures: mock host collaborators and a fully wired agent
//! running against scratch directories and an on-disk catalog.
#![allow(dead_code)] // Each test binary uses a different slice of this module.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sagent_core::config::AgentConfig;
use sagent_core::Ports;
use sagent_daemon::Agent;
use sagent_daemon::catalog::Catalog;
use sagent_daemon::host::HostError;
use sagent_daemon::host::engine::ContainerEngine;
use sagent_daemon::host::hpfs::HpfsControl;
use sagent_daemon::host::users::{InstalledUser, UserInstallRequest, UserSetup};
use tempfile::TempDir;

/// Local wrapper so the mock trait impls below land on a type defined in
/// this crate (implementing a foreign trait for a bare `Arc<T>` runs afoul
/// of the orphan rules across the test-binary crate boundary).
pub struct Shared<T>(pub Arc<T>);

impl<T> std::ops::Deref for Shared<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// Port bases used across the scenario tests.
pub const INIT_PORTS: Ports = Ports {
    peer_port: 22861,
    user_port: 26201,
    gp_tcp_port_start: 36525,
    gp_udp_port_start: 39064,
};

pub fn current_username() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .unwrap()
        .unwrap()
        .name
}

/// Recording engine mock with per-operation failure switches.
#[derive(Default)]
pub struct MockEngine {
    pub calls: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub inspect_status: Mutex<String>,
}

impl MockEngine {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_inspect_status(&self, status: &str) {
        *self.inspect_status.lock().unwrap() = status.to_string();
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn failure(op: &str) -> HostError {
        HostError::CommandFailed {
            program: "docker".into(),
            detail: format!("mock {op} failure"),
        }
    }
}

#[async_trait]
impl ContainerEngine for Shared<MockEngine> {
    async fn create(
        &self,
        _username: &str,
        image: &str,
        name: &str,
        _contract_dir: &Path,
        _ports: &Ports,
    ) -> Result<(), HostError> {
        self.record(format!("create {name} {image}"));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(MockEngine::failure("create"));
        }
        Ok(())
    }

    async fn start(&self, _username: &str, name: &str) -> Result<(), HostError> {
        self.record(format!("start {name}"));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(MockEngine::failure("start"));
        }
        Ok(())
    }

    async fn stop(&self, _username: &str, name: &str) -> Result<(), HostError> {
        self.record(format!("stop {name}"));
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(MockEngine::failure("stop"));
        }
        Ok(())
    }

    async fn remove(&self, _username: &str, name: &str) -> Result<(), HostError> {
        self.record(format!("remove {name}"));
        Ok(())
    }

    async fn inspect(&self, _username: &str, name: &str) -> Result<String, HostError> {
        self.record(format!("inspect {name}"));
        Ok(self.inspect_status.lock().unwrap().clone())
    }
}

/// User-setup mock: "installs" the current OS user with a scratch home so
/// the real materializer can transfer ownership unprivileged. Uninstall
/// removes the contract dir the way the real helper does.
pub struct MockUserSetup {
    pub home_root: PathBuf,
    pub calls: Mutex<Vec<String>>,
    pub fail_install: AtomicBool,
    pub fail_uninstall: AtomicBool,
}

impl MockUserSetup {
    pub fn new(home_root: PathBuf) -> Self {
        Self {
            home_root,
            calls: Mutex::new(Vec::new()),
            fail_install: AtomicBool::new(false),
            fail_uninstall: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserSetup for Shared<MockUserSetup> {
    async fn install(&self, request: &UserInstallRequest<'_>) -> Result<InstalledUser, HostError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("install {}", request.container_name));
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(HostError::CommandFailed {
                program: "user install".into(),
                detail: "mock install failure".into(),
            });
        }
        std::fs::create_dir_all(&self.home_root)?;
        Ok(InstalledUser {
            uid: nix::unistd::getuid().as_raw(),
            username: current_username(),
            home_dir: self.home_root.clone(),
        })
    }

    async fn uninstall(
        &self,
        _username: &str,
        _ports: &Ports,
        container_name: &str,
    ) -> Result<(), HostError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("uninstall {container_name}"));
        if self.fail_uninstall.load(Ordering::SeqCst) {
            return Err(HostError::CommandFailed {
                program: "user uninstall".into(),
                detail: "mock uninstall failure".into(),
            });
        }
        let _ = std::fs::remove_dir_all(self.home_root.join(container_name));
        Ok(())
    }
}

/// Recording hpfs mock with failure switches.
#[derive(Default)]
pub struct MockHpfs {
    pub calls: Mutex<Vec<String>>,
    pub fail_conf: AtomicBool,
    pub fail_start: AtomicBool,
}

impl MockHpfs {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HpfsControl for Shared<MockHpfs> {
    async fn update_service_conf(
        &self,
        _username: &str,
        log_level: &str,
        is_full_history: bool,
    ) -> Result<(), HostError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("conf {log_level} {is_full_history}"));
        if self.fail_conf.load(Ordering::SeqCst) {
            return Err(HostError::CommandFailed {
                program: "hpfs".into(),
                detail: "mock conf failure".into(),
            });
        }
        Ok(())
    }

    async fn start(&self, _username: &str) -> Result<(), HostError> {
        self.calls.lock().unwrap().push("start".into());
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(HostError::CommandFailed {
                program: "hpfs".into(),
                detail: "mock start failure".into(),
            });
        }
        Ok(())
    }

    async fn stop(&self, _username: &str) -> Result<(), HostError> {
        self.calls.lock().unwrap().push("stop".into());
        Ok(())
    }
}

/// Writes a minimal contract template with a complete-enough `hp.cfg`.
pub fn write_template(root: &Path) {
    std::fs::create_dir_all(root.join("cfg")).unwrap();
    let config = serde_json::json!({
        "node": {
            "role": "observer",
            "history": "full",
            "history_config": { "max_primary_shards": 4, "max_raw_shards": 4 }
        },
        "contract": { "consensus": { "roundtime": 1000 } },
        "mesh": {},
        "user": {},
        "hpfs": { "log": { "log_level": "inf" } },
        "log": { "log_level": "inf" }
    });
    std::fs::write(
        root.join("cfg/hp.cfg"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
    std::fs::write(root.join("bootstrap_contract"), "#!/bin/true\n").unwrap();
}

/// A wired agent over scratch directories plus handles to its mocks.
pub struct TestHarness {
    pub agent: Agent,
    pub engine: Arc<MockEngine>,
    pub users: Arc<MockUserSetup>,
    pub hpfs: Arc<MockHpfs>,
    pub root: TempDir,
}

pub fn test_config(root: &Path, max_instances: usize) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.paths.data_dir = root.join("data");
    config.paths.contract_template = root.join("template");
    config.hp.init_peer_port = INIT_PORTS.peer_port;
    config.hp.init_user_port = INIT_PORTS.user_port;
    config.hp.init_gp_tcp_port = INIT_PORTS.gp_tcp_port_start;
    config.hp.init_gp_udp_port = INIT_PORTS.gp_udp_port_start;
    config.hp.host_address = "203.0.113.10".into();
    config.system.max_instance_count = max_instances;
    config
}

pub fn harness(max_instances: usize) -> TestHarness {
    let root = tempfile::tempdir().unwrap();
    write_template(&root.path().join("template"));
    std::fs::create_dir_all(root.path().join("data")).unwrap();

    let config = test_config(root.path(), max_instances);
    let catalog = Catalog::open(config.catalog_db_path()).unwrap();

    let engine = Arc::new(MockEngine::default());
    engine.set_inspect_status("running");
    let users = Arc::new(MockUserSetup::new(root.path().join("home")));
    let hpfs = Arc::new(MockHpfs::default());

    let agent = Agent::new(
        config,
        catalog,
        Box::new(Shared(engine.clone())),
        Box::new(Shared(users.clone())),
        Box::new(Shared(hpfs.clone())),
    )
    .unwrap();

    TestHarness {
        agent,
        engine,
        users,
        hpfs,
        root,
    }
}

/// The literal `create` request of the protocol scenarios.
pub fn create_request_json(name: &str) -> Vec<u8> {
    serde_json::json!({
        "type": "create",
        "container_name": name,
        "owner_pubkey": "ed1111111111111111111111111111111111111111111111111111111111111111",
        "contract_id": "3b241101-e2bb-4255-8caf-4136c566a962",
        "image": "repo/app:1",
        "outbound_ipv6": "",
        "outbound_net_interface": "eth0",
        "config": {}
    })
    .to_string()
    .into_bytes()
}
