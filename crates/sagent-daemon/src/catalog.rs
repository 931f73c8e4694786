//! Persistent instance catalog backed by `SQLite`.
//!
//! One row per instance at `<data_dir>/sa.sqlite`, plus a read-only view
//! over the message-board lease database. All writes go through the
//! lifecycle controller on the single worker; no multi-statement
//! transactions span host side effects (ordering plus compensations
//! provide atomicity, see the lifecycle module).

use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use sagent_core::{InstanceInfo, InstanceStatus, LeaseInfo, Ports};
use thiserror::Error;
use tracing::warn;

/// Catalog access errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The underlying database failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A row holds a status string the agent does not know.
    #[error("instance `{container_name}` has unknown status `{status}`")]
    UnknownStatus {
        /// The offending row's container name.
        container_name: String,
        /// The unparseable status value.
        status: String,
    },
}

const INSTANCE_COLUMNS: &str = "container_name, owner_pubkey, contract_id, pubkey, \
     contract_dir, image_name, ip, username, peer_port, user_port, \
     gp_tcp_port_start, gp_udp_port_start, status";

/// The instance catalog.
#[derive(Debug)]
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (and if necessary initializes) the catalog database.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Sqlite`] when the file cannot be opened or
    /// the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory catalog. Test seam; the daemon always opens the
    /// on-disk file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Sqlite`] when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS instances (
                container_name TEXT NOT NULL UNIQUE,
                owner_pubkey TEXT NOT NULL,
                contract_id TEXT NOT NULL,
                pubkey TEXT NOT NULL,
                contract_dir TEXT NOT NULL,
                image_name TEXT NOT NULL,
                ip TEXT NOT NULL,
                username TEXT NOT NULL,
                peer_port INTEGER NOT NULL,
                user_port INTEGER NOT NULL,
                gp_tcp_port_start INTEGER NOT NULL,
                gp_udp_port_start INTEGER NOT NULL,
                status TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status)",
            [],
        )?;
        Ok(Self { conn })
    }

    fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<(InstanceInfo, String)> {
        let status_raw: String = row.get(12)?;
        let info = InstanceInfo {
            container_name: row.get(0)?,
            owner_pubkey: row.get(1)?,
            contract_id: row.get(2)?,
            pubkey: row.get(3)?,
            contract_dir: row.get(4)?,
            image_name: row.get(5)?,
            ip: row.get(6)?,
            username: row.get(7)?,
            assigned_ports: Ports {
                peer_port: row.get(8)?,
                user_port: row.get(9)?,
                gp_tcp_port_start: row.get(10)?,
                gp_udp_port_start: row.get(11)?,
            },
            // Patched below once the raw status is validated.
            status: InstanceStatus::Created,
        };
        Ok((info, status_raw))
    }

    fn finish_instance(
        (mut info, status_raw): (InstanceInfo, String),
    ) -> Result<InstanceInfo, CatalogError> {
        info.status =
            InstanceStatus::from_str_opt(&status_raw).ok_or_else(|| CatalogError::UnknownStatus {
                container_name: info.container_name.clone(),
                status: status_raw,
            })?;
        Ok(info)
    }

    /// Fetches one non-destroyed instance by name.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on query failure or a corrupt status
    /// column.
    pub fn get_instance(&self, name: &str) -> Result<Option<InstanceInfo>, CatalogError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {INSTANCE_COLUMNS} FROM instances \
                     WHERE container_name = ?1 AND status != 'destroyed'"
                ),
                params![name],
                Self::row_to_instance,
            )
            .optional()?;
        row.map(Self::finish_instance).transpose()
    }

    /// All non-destroyed instances, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on query failure or a corrupt status
    /// column.
    pub fn get_instance_list(&self) -> Result<Vec<InstanceInfo>, CatalogError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE status != 'destroyed' ORDER BY rowid"
        ))?;
        let rows = stmt.query_map([], Self::row_to_instance)?;
        rows.map(|row| Self::finish_instance(row?)).collect()
    }

    /// Inserts a new instance row.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Sqlite`] on failure, including the
    /// uniqueness violation for a duplicate container name.
    pub fn insert(&self, info: &InstanceInfo) -> Result<(), CatalogError> {
        self.conn.execute(
            "INSERT INTO instances (container_name, owner_pubkey, contract_id, pubkey, \
             contract_dir, image_name, ip, username, peer_port, user_port, \
             gp_tcp_port_start, gp_udp_port_start, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                info.container_name,
                info.owner_pubkey,
                info.contract_id,
                info.pubkey,
                info.contract_dir,
                info.image_name,
                info.ip,
                info.username,
                info.assigned_ports.peer_port,
                info.assigned_ports.user_port,
                info.assigned_ports.gp_tcp_port_start,
                info.assigned_ports.gp_udp_port_start,
                info.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Rewrites the status column of one instance.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Sqlite`] on write failure or when the row
    /// does not exist.
    pub fn update_status(&self, name: &str, status: InstanceStatus) -> Result<(), CatalogError> {
        let changed = self.conn.execute(
            "UPDATE instances SET status = ?2 WHERE container_name = ?1",
            params![name, status.as_str()],
        )?;
        if changed == 0 {
            return Err(CatalogError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
        }
        Ok(())
    }

    /// Removes one instance row (hard delete).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Sqlite`] on write failure.
    pub fn delete(&self, name: &str) -> Result<(), CatalogError> {
        self.conn.execute(
            "DELETE FROM instances WHERE container_name = ?1",
            params![name],
        )?;
        Ok(())
    }

    /// Number of live (non-destroyed) instances.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Sqlite`] on query failure.
    pub fn allocated_count(&self) -> Result<usize, CatalogError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM instances WHERE status != 'destroyed'",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// The port tuple of the row with the highest peer port, or `None`
    /// when the catalog is empty. Destroyed rows still pin the high-water
    /// mark so their ports come back only through the vacancy list.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Sqlite`] on query failure.
    pub fn max_ports(&self) -> Result<Option<Ports>, CatalogError> {
        let ports = self
            .conn
            .query_row(
                "SELECT peer_port, user_port, gp_tcp_port_start, gp_udp_port_start \
                 FROM instances ORDER BY peer_port DESC LIMIT 1",
                [],
                |row| {
                    Ok(Ports {
                        peer_port: row.get(0)?,
                        user_port: row.get(1)?,
                        gp_tcp_port_start: row.get(2)?,
                        gp_udp_port_start: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(ports)
    }
}

/// Reads the lease list from the message-board database.
///
/// The database belongs to an external writer and may not exist yet; any
/// failure is logged and yields an empty list, matching the behavior of a
/// host with no leases sold.
#[must_use]
pub fn read_lease_list(path: impl AsRef<Path>) -> Vec<LeaseInfo> {
    let path = path.as_ref();
    let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => conn,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "lease database unavailable");
            return Vec::new();
        }
    };

    let mut stmt = match conn.prepare(
        "SELECT timestamp, container_name, tenant_xrp_address, created_on_ledger, life_moments \
         FROM leases",
    ) {
        Ok(stmt) => stmt,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "lease table unavailable");
            return Vec::new();
        }
    };

    let rows = stmt.query_map([], |row| {
        Ok(LeaseInfo {
            timestamp: row.get(0)?,
            container_name: row.get(1)?,
            tenant_xrp_address: row.get(2)?,
            created_on_ledger: row.get(3)?,
            life_moments: row.get(4)?,
        })
    });

    match rows {
        Ok(iter) => iter.filter_map(Result::ok).collect(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "lease query failed");
            Vec::new()
        }
    }
}
