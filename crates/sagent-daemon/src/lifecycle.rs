//! The instance lifecycle state machine.
//!
//! The [`Agent`] is the only writer of catalog rows and the only caller of
//! host adapters. Each operation runs its side effects in a fixed order
//! (external helpers, then filesystem, then catalog) and records a
//! compensation for every completed step; on failure the stack unwinds in
//! reverse. Compensations are best-effort: their own failures are logged
//! and the original error tag still reaches the client.
//!
//! States: created -> running <-> stopped, destroy from any of them.
//! `exited` is observed through the engine at inspect time, never stored.

use std::path::PathBuf;

use sagent_core::overlay::ConfigOverlay;
use sagent_core::{AgentConfig, InstanceInfo, InstanceStatus, LeaseInfo, Ports, Resources};
use tracing::{error, info, warn};

use crate::catalog::{Catalog, read_lease_list};
use crate::contract::{ContractError, ContractMaterializer};
use crate::host::engine::ContainerEngine;
use crate::host::hpfs::HpfsControl;
use crate::host::users::{UserInstallRequest, UserSetup};
use crate::host::{
    validate_container_name, validate_image_ref, validate_net_interface, validate_outbound_ipv6,
};
use crate::ports::PortAllocator;
use crate::protocol::CreateRequest;

/// Uid the contract process runs as inside the container.
pub const CONTRACT_UID: u32 = 10000;
/// Gid the contract process runs as inside the container. Group zero maps
/// to the instance user's own group on the host, which is what grants the
/// contract its write access to the group-writable contract dir.
pub const CONTRACT_GID: u32 = 0;

/// Every failure a lifecycle operation can answer with. The wire tag of
/// each variant is part of the protocol contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// Catalog read failed.
    DbRead,
    /// Catalog write failed.
    DbWrite,
    /// The user install helper failed.
    UserInstall,
    /// The user uninstall helper failed.
    UserUninstall,
    /// Contract materialization or container creation failed.
    Instance,
    /// The instance config could not be opened.
    ConfRead,
    /// The instance config or hpfs setup was rejected.
    ContainerConf,
    /// The engine could not start the container.
    ContainerStart,
    /// The catalog status update after a start failed.
    ContainerUpdate,
    /// Destroying the container failed.
    ContainerDestroy,
    /// No instance with the given name exists.
    NoContainer,
    /// The instance is not in the state the operation requires.
    DupContainer,
    /// All instance slots are taken.
    MaxAllocReached,
    /// The contract id is not a well-formed UUID.
    ContractIdBadFormat,
    /// The image reference failed validation.
    DockerImageInvalid,
    /// No instance with the given name exists (inspect flavor).
    ContainerNotFound,
    /// An instance with the given name already exists.
    InstanceAlreadyExists,
}

impl LifecycleError {
    /// The wire error tag for this failure.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::DbRead => "db_read_error",
            Self::DbWrite => "db_write_error",
            Self::UserInstall => "user_install_error",
            Self::UserUninstall => "user_uninstall_error",
            Self::Instance => "instance_error",
            Self::ConfRead => "conf_read_error",
            Self::ContainerConf => "container_conf_error",
            Self::ContainerStart => "container_start_error",
            Self::ContainerUpdate => "container_update_error",
            Self::ContainerDestroy => "container_destroy_error",
            Self::NoContainer => "no_container",
            Self::DupContainer => "dup_container",
            Self::MaxAllocReached => "max_alloc_reached",
            Self::ContractIdBadFormat => "contractid_bad_format",
            Self::DockerImageInvalid => "docker_image_invalid",
            Self::ContainerNotFound => "container_not_found",
            Self::InstanceAlreadyExists => "instance_already_exists",
        }
    }
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One recorded undo step. Pushed as the happy path progresses, executed
/// in reverse on failure.
enum Compensation {
    UninstallUser {
        username: String,
        ports: Ports,
        container_name: String,
    },
    RemoveContainer {
        username: String,
        container_name: String,
    },
    StopEngine {
        username: String,
        container_name: String,
    },
    StopHpfs {
        username: String,
    },
}

/// The lifecycle controller.
pub struct Agent {
    config: AgentConfig,
    resources: Resources,
    catalog: Catalog,
    allocator: PortAllocator,
    materializer: ContractMaterializer,
    engine: Box<dyn ContainerEngine>,
    users: Box<dyn UserSetup>,
    hpfs: Box<dyn HpfsControl>,
}

impl Agent {
    /// Wires the controller, derives per-instance quotas and seeds the
    /// port allocator's vacancy list from the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DbRead`] when the vacancy scan cannot
    /// read the catalog.
    pub fn new(
        config: AgentConfig,
        catalog: Catalog,
        engine: Box<dyn ContainerEngine>,
        users: Box<dyn UserSetup>,
        hpfs: Box<dyn HpfsControl>,
    ) -> Result<Self, LifecycleError> {
        let resources = Resources::per_instance(&config.system);
        let init_ports = Ports {
            peer_port: config.hp.init_peer_port,
            user_port: config.hp.init_user_port,
            gp_tcp_port_start: config.hp.init_gp_tcp_port,
            gp_udp_port_start: config.hp.init_gp_udp_port,
        };
        let mut allocator = PortAllocator::new(init_ports);
        let instances = catalog.get_instance_list().map_err(|err| {
            error!(error = %err, "failed to scan catalog for vacant ports");
            LifecycleError::DbRead
        })?;
        allocator.populate_vacancies(&instances);

        let materializer = ContractMaterializer::new(
            config.paths.contract_template.clone(),
            CONTRACT_UID,
            CONTRACT_GID,
        );

        Ok(Self {
            config,
            resources,
            catalog,
            allocator,
            materializer,
            engine,
            users,
            hpfs,
        })
    }

    /// The derived per-instance quota.
    #[must_use]
    pub const fn resources(&self) -> Resources {
        self.resources
    }

    async fn run_compensations(&self, stack: Vec<Compensation>) {
        for step in stack.into_iter().rev() {
            let outcome = match &step {
                Compensation::UninstallUser {
                    username,
                    ports,
                    container_name,
                } => self.users.uninstall(username, ports, container_name).await,
                Compensation::RemoveContainer {
                    username,
                    container_name,
                } => self.engine.remove(username, container_name).await,
                Compensation::StopEngine {
                    username,
                    container_name,
                } => self.engine.stop(username, container_name).await,
                Compensation::StopHpfs { username } => self.hpfs.stop(username).await,
            };
            if let Err(err) = outcome {
                warn!(error = %err, "compensation step failed");
            }
        }
    }

    /// Admits, allocates and materializes a new instance and creates its
    /// container. The instance is left in `created`.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LifecycleError`]; all completed side effects
    /// are compensated before it is returned.
    pub async fn create_instance(
        &mut self,
        request: &CreateRequest,
    ) -> Result<InstanceInfo, LifecycleError> {
        if validate_container_name(&request.container_name).is_err()
            || validate_net_interface(&request.outbound_net_interface).is_err()
            || validate_outbound_ipv6(&request.outbound_ipv6).is_err()
        {
            error!(name = %request.container_name, "rejected create request parameters");
            return Err(LifecycleError::Instance);
        }
        if validate_image_ref(&request.image).is_err() {
            error!(image = %request.image, "rejected image reference");
            return Err(LifecycleError::DockerImageInvalid);
        }

        match self.catalog.get_instance(&request.container_name) {
            Ok(None) => {}
            Ok(Some(_)) => {
                error!(name = %request.container_name, "instance already exists");
                return Err(LifecycleError::InstanceAlreadyExists);
            }
            Err(err) => {
                error!(error = %err, "catalog lookup failed");
                return Err(LifecycleError::DbRead);
            }
        }

        let allocated = self.catalog.allocated_count().map_err(|err| {
            error!(error = %err, "allocated-count query failed");
            LifecycleError::DbRead
        })?;
        if allocated >= self.config.system.max_instance_count {
            error!(allocated, "max instance count reached");
            return Err(LifecycleError::MaxAllocReached);
        }

        if request.contract_id.len() != 36
            || uuid::Uuid::parse_str(&request.contract_id).is_err()
        {
            error!(contract_id = %request.contract_id, "contract id is not a valid uuid");
            return Err(LifecycleError::ContractIdBadFormat);
        }

        info!(
            cpu_us = self.resources.cpu_us,
            mem_kbytes = self.resources.mem_kbytes,
            storage_kbytes = self.resources.storage_kbytes,
            "resources for instance"
        );

        let catalog = &self.catalog;
        let ports = self
            .allocator
            .allocate(|| catalog.max_ports())
            .map_err(|err| {
                error!(error = %err, "max-ports query failed");
                LifecycleError::DbRead
            })?;

        let installed = self
            .users
            .install(&UserInstallRequest {
                resources: self.resources,
                container_name: &request.container_name,
                contract_uid: CONTRACT_UID,
                contract_gid: CONTRACT_GID,
                ports,
                image: &request.image,
                registry_address: &self.config.docker.registry_address,
                outbound_ipv6: &request.outbound_ipv6,
                outbound_net_interface: &request.outbound_net_interface,
            })
            .await
            .map_err(|err| {
                error!(error = %err, "user install failed");
                LifecycleError::UserInstall
            })?;

        let mut compensations = vec![Compensation::UninstallUser {
            username: installed.username.clone(),
            ports,
            container_name: request.container_name.clone(),
        }];

        // Any `--<size>` marker stays on the reference the install helper
        // received; the engine and the catalog see the plain reference.
        let image_name = request
            .image
            .split_once("--")
            .map_or(request.image.as_str(), |(head, _)| head)
            .to_string();

        let materialized = match self.materializer.materialize(
            &installed.username,
            &installed.home_dir,
            &request.container_name,
            &request.owner_pubkey,
            &request.contract_id,
            ports,
        ) {
            Ok(materialized) => materialized,
            Err(err) => {
                error!(owner = %request.owner_pubkey, error = %err, "contract materialization failed");
                self.run_compensations(compensations).await;
                return Err(LifecycleError::Instance);
            }
        };

        if let Err(err) = self
            .engine
            .create(
                &installed.username,
                &image_name,
                &request.container_name,
                &materialized.contract_dir,
                &ports,
            )
            .await
        {
            error!(owner = %request.owner_pubkey, error = %err, "container creation failed");
            self.run_compensations(compensations).await;
            return Err(LifecycleError::Instance);
        }
        compensations.push(Compensation::RemoveContainer {
            username: installed.username.clone(),
            container_name: request.container_name.clone(),
        });

        let info = InstanceInfo {
            container_name: request.container_name.clone(),
            owner_pubkey: request.owner_pubkey.clone(),
            contract_id: request.contract_id.clone(),
            pubkey: materialized.pubkey,
            contract_dir: materialized.contract_dir.to_string_lossy().into_owned(),
            image_name,
            ip: self.config.hp.host_address.clone(),
            username: installed.username.clone(),
            assigned_ports: ports,
            status: InstanceStatus::Created,
        };

        if let Err(err) = self.catalog.insert(&info) {
            error!(owner = %request.owner_pubkey, error = %err, "catalog insert failed");
            self.run_compensations(compensations).await;
            return Err(LifecycleError::DbWrite);
        }

        self.allocator.commit(ports);
        info!(name = %info.container_name, user = %info.username, "instance created");
        Ok(info)
    }

    /// Applies the config overlay and starts a freshly created instance.
    /// Legal only in `created`.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LifecycleError`]; hpfs and engine effects are
    /// compensated in reverse on failure.
    pub async fn initiate_instance(
        &mut self,
        container_name: &str,
        overlay: &ConfigOverlay,
    ) -> Result<(), LifecycleError> {
        let info = self.fetch_instance(container_name)?;
        if info.status != InstanceStatus::Created {
            error!(name = %container_name, status = %info.status, "instance already initiated");
            return Err(LifecycleError::DupContainer);
        }

        let contract_dir = PathBuf::from(&info.contract_dir);
        let settings = self
            .materializer
            .initiate_config(&contract_dir, overlay)
            .map_err(|err| {
                error!(name = %container_name, error = %err, "instance config rejected");
                match err {
                    ContractError::ConfigOpen(_) => LifecycleError::ConfRead,
                    _ => LifecycleError::ContainerConf,
                }
            })?;

        self.spin_up(&info, &settings.log_level, settings.is_full_history)
            .await?;

        info!(name = %container_name, "instance initiated");
        Ok(())
    }

    /// Restarts a stopped instance. Legal only in `stopped`.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LifecycleError`].
    pub async fn start_instance(&mut self, container_name: &str) -> Result<(), LifecycleError> {
        let info = self.fetch_instance(container_name)?;
        if info.status != InstanceStatus::Stopped {
            error!(name = %container_name, status = %info.status, "instance is not stopped");
            return Err(LifecycleError::ContainerStart);
        }

        let contract_dir = PathBuf::from(&info.contract_dir);
        let settings = self.materializer.read_config(&contract_dir).map_err(|err| {
            error!(name = %container_name, error = %err, "instance config unreadable");
            match err {
                ContractError::ConfigOpen(_) => LifecycleError::ConfRead,
                _ => LifecycleError::ContainerConf,
            }
        })?;

        self.spin_up(&info, &settings.log_level, settings.is_full_history)
            .await?;

        info!(name = %container_name, "instance started");
        Ok(())
    }

    /// Shared tail of initiate and start: push hpfs conf, start hpfs,
    /// start the engine, mark the row running. Unwinds on failure.
    async fn spin_up(
        &mut self,
        info: &InstanceInfo,
        hpfs_log_level: &str,
        is_full_history: bool,
    ) -> Result<(), LifecycleError> {
        if let Err(err) = self
            .hpfs
            .update_service_conf(&info.username, hpfs_log_level, is_full_history)
            .await
        {
            error!(name = %info.container_name, error = %err, "hpfs conf update failed");
            return Err(LifecycleError::ContainerConf);
        }
        if let Err(err) = self.hpfs.start(&info.username).await {
            error!(name = %info.container_name, error = %err, "hpfs start failed");
            return Err(LifecycleError::ContainerConf);
        }
        let mut compensations = vec![Compensation::StopHpfs {
            username: info.username.clone(),
        }];

        if let Err(err) = self
            .engine
            .start(&info.username, &info.container_name)
            .await
        {
            error!(name = %info.container_name, error = %err, "container start failed");
            self.run_compensations(compensations).await;
            return Err(LifecycleError::ContainerStart);
        }
        compensations.push(Compensation::StopEngine {
            username: info.username.clone(),
            container_name: info.container_name.clone(),
        });

        if let Err(err) = self
            .catalog
            .update_status(&info.container_name, InstanceStatus::Running)
        {
            error!(name = %info.container_name, error = %err, "status update failed");
            self.run_compensations(compensations).await;
            return Err(LifecycleError::ContainerUpdate);
        }

        Ok(())
    }

    /// Stops a running instance. Legal only in `running`.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LifecycleError`].
    pub async fn stop_instance(&mut self, container_name: &str) -> Result<(), LifecycleError> {
        let info = self.fetch_instance(container_name)?;
        if info.status != InstanceStatus::Running {
            error!(name = %container_name, status = %info.status, "instance is not running");
            return Err(LifecycleError::DupContainer);
        }

        if let Err(err) = self.engine.stop(&info.username, container_name).await {
            error!(name = %container_name, error = %err, "container stop failed");
            return Err(LifecycleError::ContainerUpdate);
        }
        if let Err(err) = self
            .catalog
            .update_status(container_name, InstanceStatus::Stopped)
        {
            error!(name = %container_name, error = %err, "status update failed");
            return Err(LifecycleError::ContainerUpdate);
        }
        if let Err(err) = self.hpfs.stop(&info.username).await {
            error!(name = %container_name, error = %err, "hpfs stop failed");
            return Err(LifecycleError::ContainerUpdate);
        }

        info!(name = %container_name, "instance stopped");
        Ok(())
    }

    /// Destroys an instance from any live state: the uninstall helper
    /// removes the container, the contract dir and the user; then the row
    /// is deleted and the ports return to the vacancy list.
    ///
    /// # Errors
    ///
    /// Returns the mapped [`LifecycleError`].
    pub async fn destroy_instance(&mut self, container_name: &str) -> Result<(), LifecycleError> {
        let info = self.fetch_instance(container_name)?;

        info!(name = %container_name, "destroying instance");
        if let Err(err) = self
            .users
            .uninstall(&info.username, &info.assigned_ports, container_name)
            .await
        {
            error!(name = %container_name, error = %err, "user uninstall failed");
            return Err(LifecycleError::UserUninstall);
        }
        if let Err(err) = self.catalog.delete(container_name) {
            error!(name = %container_name, error = %err, "catalog delete failed");
            return Err(LifecycleError::UserUninstall);
        }

        self.allocator.release(info.assigned_ports);
        info!(name = %container_name, "instance destroyed");
        Ok(())
    }

    /// Fetches one instance record. When the catalog says `running` the
    /// engine is consulted; a container that exited on its own is reported
    /// as `exited` without rewriting the row.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ContainerNotFound`].
    pub async fn inspect_instance(
        &self,
        container_name: &str,
    ) -> Result<InstanceInfo, LifecycleError> {
        let mut info = match self.catalog.get_instance(container_name) {
            Ok(Some(info)) => info,
            Ok(None) | Err(_) => {
                error!(name = %container_name, "no instance with that name");
                return Err(LifecycleError::ContainerNotFound);
            }
        };

        if info.status == InstanceStatus::Running {
            match self.engine.inspect(&info.username, container_name).await {
                Ok(state) if state == "exited" => info.status = InstanceStatus::Exited,
                Ok(_) => {}
                Err(err) => {
                    warn!(name = %container_name, error = %err, "engine inspect failed");
                }
            }
        }
        Ok(info)
    }

    /// All live instances.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::DbRead`].
    pub fn list_instances(&self) -> Result<Vec<InstanceInfo>, LifecycleError> {
        self.catalog.get_instance_list().map_err(|err| {
            error!(error = %err, "instance list query failed");
            LifecycleError::DbRead
        })
    }

    /// The lease rows of the external message board, empty when the
    /// database is absent.
    #[must_use]
    pub fn list_leases(&self) -> Vec<LeaseInfo> {
        read_lease_list(self.config.lease_db_path())
    }

    fn fetch_instance(&self, container_name: &str) -> Result<InstanceInfo, LifecycleError> {
        match self.catalog.get_instance(container_name) {
            Ok(Some(info)) => Ok(info),
            Ok(None) => {
                error!(name = %container_name, "no instance with that name");
                Err(LifecycleError::NoContainer)
            }
            Err(err) => {
                error!(error = %err, "catalog lookup failed");
                Err(LifecycleError::DbRead)
            }
        }
    }
}
