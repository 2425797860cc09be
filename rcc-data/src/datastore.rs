// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ownership store: the sole authority on node-to-worker assignment
//!
//! Two implementations sit behind [`OwnershipStore`]: [`PgStore`] over a
//! Postgres `ownership` table, and [`MemStore`], an in-memory stand-in
//! used under `DEBUG=TRUE` and by the test suite.  All mutating
//! operations serialize on a store-wide lock; reads proceed outside it.
//!
//! The store also tracks, in memory only, which workers have recently
//! claimed or heartbeated.  That set approximates the fleet size for the
//! self-monitor policy; the database heartbeat column remains the only
//! authority for ownership expiration.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use rcc_common::api::NodeClass;
use rcc_common::api::NodeInfo;
use slog::Logger;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio_postgres::NoTls;

use crate::config::DbConfig;

/// A worker may monitor the node it runs on only while it is the sole
/// active worker.
pub const SELF_MONITOR_MAX: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] tokio_postgres::Error),
    #[error("{completed} rows completed, {failed} failed: {first_error}")]
    Partial { completed: u64, failed: u64, first_error: String },
}

/// Operations on the ownership registry.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Insert node records, skipping names already present.  Returns the
    /// number of rows newly created.
    async fn upsert_inventory(
        &self,
        nodes: &[NodeInfo],
    ) -> Result<u64, StoreError>;

    /// Remove node records entirely.  Unknown names are a no-op.  Returns
    /// the number of rows deleted.
    async fn delete_inventory(
        &self,
        names: &[String],
    ) -> Result<u64, StoreError>;

    /// Assign up to `want_mountain` mountain-budget nodes (classes
    /// Mountain, then Hill, then Paradise) and `want_river` River nodes to
    /// `worker`.  Returns the records actually assigned.
    async fn claim(
        &self,
        worker: &str,
        want_mountain: u32,
        want_river: u32,
    ) -> Result<Vec<NodeInfo>, StoreError>;

    /// Refresh the heartbeat for every row still owned by `worker`.
    /// Returns the nodes the worker must drop: rows owned by someone else,
    /// plus the worker's own host when the fleet is large enough to
    /// reassign it.
    async fn heartbeat(
        &self,
        worker: &str,
        location: &str,
        nodes: &[NodeInfo],
    ) -> Result<Vec<NodeInfo>, StoreError>;

    /// Clear ownership of `names` where owned by `worker`.  Returns the
    /// number of rows released.
    async fn release(
        &self,
        worker: &str,
        names: &[String],
    ) -> Result<u64, StoreError>;

    /// Clear ownership of every row whose heartbeat is older than
    /// `minutes`, and discard acquiring-worker entries of the same age.
    /// Returns the number of rows expired.
    async fn expire_stale(&self, minutes: u64) -> Result<u64, StoreError>;

    /// Fetch a node record with its current owner filled in.  `None`
    /// means the node is not in the inventory.
    async fn lookup_node(
        &self,
        name: &str,
    ) -> Result<Option<NodeInfo>, StoreError>;

    /// Number of workers that have claimed or heartbeated recently.
    async fn active_worker_count(&self) -> u64;
}

/// Tracks which workers are actively acquiring, keyed by worker id.
#[derive(Default)]
struct AcquiringWorkers {
    workers: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl AcquiringWorkers {
    fn notify(&self, worker: &str) {
        self.workers
            .lock()
            .unwrap()
            .insert(worker.to_string(), Utc::now());
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) {
        self.workers.lock().unwrap().retain(|_, seen| *seen >= cutoff);
    }

    fn count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS ownership (
    node_name VARCHAR( 50 )  PRIMARY KEY NOT NULL CHECK (node_name <> ''),
    node_bmc_name VARCHAR( 50 )  NOT NULL CHECK (node_bmc_name <> ''),
    node_bmc_fqdn VARCHAR( 50 )  NOT NULL CHECK (node_bmc_fqdn <> ''),
    node_class VARCHAR( 50 )  NOT NULL CHECK (node_class <> ''),
    node_nid_number INTEGER  NOT NULL CHECK (node_nid_number <> 0),
    node_role VARCHAR( 50 )  NOT NULL CHECK (node_role <> ''),
    console_pod_id VARCHAR( 50 ),
    last_updated TIMESTAMP,
    heartbeat TIMESTAMP
);";

const NODE_COLUMNS: &str = "node_name, node_bmc_name, node_bmc_fqdn, \
     node_class, node_nid_number, node_role";

/// Postgres-backed store.
pub struct PgStore {
    client: tokio_postgres::Client,
    // serializes all mutating operations
    lock: tokio::sync::Mutex<()>,
    acquiring: AcquiringWorkers,
    log: Logger,
}

impl PgStore {
    /// Connect and create the schema if it does not exist yet.
    pub async fn connect(
        config: &DbConfig,
        log: Logger,
    ) -> Result<PgStore, StoreError> {
        info!(log, "opening database connection";
            "host" => &config.host, "dbname" => &config.dbname);
        let (client, connection) =
            tokio_postgres::connect(&config.connection_string(), NoTls)
                .await?;
        let conn_log = log.clone();
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                warn!(conn_log, "database connection closed";
                    "error" => %error);
            }
        });
        client.batch_execute(CREATE_TABLE).await?;
        Ok(PgStore {
            client,
            lock: tokio::sync::Mutex::new(()),
            acquiring: AcquiringWorkers::default(),
            log,
        })
    }

    fn row_to_node(row: &tokio_postgres::Row) -> Result<NodeInfo, StoreError> {
        let class: String = row.try_get("node_class")?;
        let class = class.parse::<NodeClass>().map_err(|e| {
            StoreError::Partial {
                completed: 0,
                failed: 1,
                first_error: e.to_string(),
            }
        })?;
        Ok(NodeInfo {
            node_name: row.try_get("node_name")?,
            bmc_name: row.try_get("node_bmc_name")?,
            bmc_fqdn: row.try_get("node_bmc_fqdn")?,
            class,
            nid: row.try_get("node_nid_number")?,
            role: row.try_get("node_role")?,
            node_console_name: String::new(),
        })
    }

    // Select up to `limit` unowned rows of one class.
    async fn select_unowned(
        &self,
        class: NodeClass,
        limit: i64,
    ) -> Result<Vec<NodeInfo>, StoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {} FROM ownership \
                     WHERE node_class = $1 AND console_pod_id IS NULL \
                     LIMIT $2",
                    NODE_COLUMNS
                ),
                &[&class.as_str(), &limit],
            )
            .await?;
        rows.iter().map(Self::row_to_node).collect()
    }
}

#[async_trait]
impl OwnershipStore for PgStore {
    async fn upsert_inventory(
        &self,
        nodes: &[NodeInfo],
    ) -> Result<u64, StoreError> {
        // Row-level, not transactional: every insert that can complete
        // does, and errors are reported alongside the count.
        let mut created = 0u64;
        let mut failed = 0u64;
        let mut first_error = None;
        for node in nodes {
            let result = self
                .client
                .execute(
                    "INSERT INTO ownership (node_name, node_bmc_name, \
                     node_bmc_fqdn, node_class, node_nid_number, node_role, \
                     console_pod_id, last_updated, heartbeat) \
                     VALUES ($1, $2, $3, $4, $5, $6, NULL, now(), NULL) \
                     ON CONFLICT (node_name) DO NOTHING",
                    &[
                        &node.node_name,
                        &node.bmc_name,
                        &node.bmc_fqdn,
                        &node.class.as_str(),
                        &node.nid,
                        &node.role,
                    ],
                )
                .await;
            match result {
                Ok(count) => created += count,
                Err(error) => {
                    warn!(self.log, "inventory insert failed";
                        "node" => &node.node_name, "error" => %error);
                    failed += 1;
                    first_error.get_or_insert_with(|| error.to_string());
                }
            }
        }
        match first_error {
            None => Ok(created),
            Some(first_error) => Err(StoreError::Partial {
                completed: created,
                failed,
                first_error,
            }),
        }
    }

    async fn delete_inventory(
        &self,
        names: &[String],
    ) -> Result<u64, StoreError> {
        if names.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.lock().await;
        Ok(self
            .client
            .execute(
                "DELETE FROM ownership WHERE node_name = ANY($1)",
                &[&names],
            )
            .await?)
    }

    async fn claim(
        &self,
        worker: &str,
        want_mountain: u32,
        want_river: u32,
    ) -> Result<Vec<NodeInfo>, StoreError> {
        let _guard = self.lock.lock().await;
        self.acquiring.notify(worker);

        if want_mountain == 0 && want_river == 0 {
            return Ok(Vec::new());
        }

        // The mountain budget is filled class by class: Mountain first,
        // then Hill, then Paradise.
        let mut selected = Vec::new();
        let mut remaining = i64::from(want_mountain);
        for class in
            [NodeClass::Mountain, NodeClass::Hill, NodeClass::Paradise]
        {
            if remaining <= 0 {
                break;
            }
            let batch = self.select_unowned(class, remaining).await?;
            remaining -= batch.len() as i64;
            selected.extend(batch);
        }
        selected.extend(
            self.select_unowned(NodeClass::River, i64::from(want_river))
                .await?,
        );

        if selected.is_empty() {
            return Ok(Vec::new());
        }

        // One serialized update over the union.  A concurrent claim may
        // have taken some of the selected rows; only the rows actually
        // updated are returned to the worker.
        let names: Vec<String> =
            selected.iter().map(|n| n.node_name.clone()).collect();
        let updated = self
            .client
            .query(
                "UPDATE ownership \
                 SET console_pod_id = $1, heartbeat = now() \
                 WHERE node_name = ANY($2) AND console_pod_id IS NULL \
                 RETURNING node_name",
                &[&worker, &names],
            )
            .await?;
        let updated_names: std::collections::BTreeSet<String> = updated
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<_, _>>()?;
        info!(self.log, "claim assigned nodes";
            "worker" => worker, "count" => updated_names.len());
        Ok(selected
            .into_iter()
            .filter(|n| updated_names.contains(&n.node_name))
            .collect())
    }

    async fn heartbeat(
        &self,
        worker: &str,
        location: &str,
        nodes: &[NodeInfo],
    ) -> Result<Vec<NodeInfo>, StoreError> {
        let _guard = self.lock.lock().await;
        self.acquiring.notify(worker);
        let active_workers = self.acquiring.count();

        let mut dropped = Vec::new();
        let mut refreshed = 0u64;
        let mut failed = 0u64;
        let mut first_error = None;
        for node in nodes {
            if !location.is_empty() && node.node_name == location {
                warn!(self.log, "worker is monitoring its own host";
                    "worker" => worker, "node" => &node.node_name);
                if active_workers > SELF_MONITOR_MAX {
                    // enough workers to hand this node to someone else
                    dropped.push(node.clone());
                    continue;
                }
            }
            let result = self
                .client
                .execute(
                    "UPDATE ownership SET heartbeat = now() \
                     WHERE node_name = $1 AND console_pod_id = $2",
                    &[&node.node_name, &worker],
                )
                .await;
            match result {
                Ok(0) => {
                    info!(self.log, "node no longer assigned to worker";
                        "worker" => worker, "node" => &node.node_name);
                    dropped.push(node.clone());
                }
                Ok(count) => refreshed += count,
                Err(error) => {
                    warn!(self.log, "heartbeat update failed";
                        "node" => &node.node_name, "error" => %error);
                    failed += 1;
                    first_error.get_or_insert_with(|| error.to_string());
                }
            }
        }
        match first_error {
            None => Ok(dropped),
            Some(first_error) => Err(StoreError::Partial {
                completed: refreshed,
                failed,
                first_error,
            }),
        }
    }

    async fn release(
        &self,
        worker: &str,
        names: &[String],
    ) -> Result<u64, StoreError> {
        if worker.is_empty() || names.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.lock().await;
        Ok(self
            .client
            .execute(
                "UPDATE ownership \
                 SET console_pod_id = NULL, heartbeat = NULL \
                 WHERE console_pod_id = $1 AND node_name = ANY($2)",
                &[&worker, &names],
            )
            .await?)
    }

    async fn expire_stale(&self, minutes: u64) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().await;
        let expired = self
            .client
            .execute(
                "UPDATE ownership \
                 SET console_pod_id = NULL, heartbeat = NULL \
                 WHERE heartbeat < now()::timestamp - make_interval(mins => $1)",
                &[&(minutes as i32)],
            )
            .await?;
        self.acquiring.prune_older_than(
            Utc::now() - chrono::Duration::minutes(minutes as i64),
        );
        Ok(expired)
    }

    async fn lookup_node(
        &self,
        name: &str,
    ) -> Result<Option<NodeInfo>, StoreError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {}, console_pod_id FROM ownership \
                     WHERE node_name = $1",
                    NODE_COLUMNS
                ),
                &[&name],
            )
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let mut node = Self::row_to_node(row)?;
        let owner: Option<String> = row.try_get("console_pod_id")?;
        node.node_console_name = owner.unwrap_or_default();
        Ok(Some(node))
    }

    async fn active_worker_count(&self) -> u64 {
        self.acquiring.count() as u64
    }
}

/// In-memory store used under `DEBUG=TRUE` and by tests.
#[derive(Default)]
pub struct MemStore {
    rows: tokio::sync::Mutex<BTreeMap<String, MemRow>>,
    acquiring: AcquiringWorkers,
}

#[derive(Clone, Debug)]
struct MemRow {
    info: NodeInfo,
    owner: Option<String>,
    heartbeat: Option<DateTime<Utc>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    /// Test support: rewrite a node's heartbeat timestamp.
    pub async fn backdate_heartbeat(
        &self,
        name: &str,
        heartbeat: DateTime<Utc>,
    ) {
        if let Some(row) = self.rows.lock().await.get_mut(name) {
            row.heartbeat = Some(heartbeat);
        }
    }

    /// Test support: rewrite a worker's last-seen timestamp.
    pub fn backdate_worker(&self, worker: &str, seen: DateTime<Utc>) {
        self.acquiring
            .workers
            .lock()
            .unwrap()
            .insert(worker.to_string(), seen);
    }
}

#[async_trait]
impl OwnershipStore for MemStore {
    async fn upsert_inventory(
        &self,
        nodes: &[NodeInfo],
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut created = 0;
        for node in nodes {
            if rows.contains_key(&node.node_name) {
                continue;
            }
            rows.insert(
                node.node_name.clone(),
                MemRow { info: node.clone(), owner: None, heartbeat: None },
            );
            created += 1;
        }
        Ok(created)
    }

    async fn delete_inventory(
        &self,
        names: &[String],
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        for name in names {
            rows.remove(name);
        }
        Ok((before - rows.len()) as u64)
    }

    async fn claim(
        &self,
        worker: &str,
        want_mountain: u32,
        want_river: u32,
    ) -> Result<Vec<NodeInfo>, StoreError> {
        let mut rows = self.rows.lock().await;
        self.acquiring.notify(worker);

        if want_mountain == 0 && want_river == 0 {
            return Ok(Vec::new());
        }

        let mut selected = Vec::new();
        let mut remaining = want_mountain as usize;
        for class in
            [NodeClass::Mountain, NodeClass::Hill, NodeClass::Paradise]
        {
            if remaining == 0 {
                break;
            }
            let names: Vec<String> = rows
                .values()
                .filter(|r| r.owner.is_none() && r.info.class == class)
                .take(remaining)
                .map(|r| r.info.node_name.clone())
                .collect();
            remaining -= names.len();
            selected.extend(names);
        }
        selected.extend(
            rows.values()
                .filter(|r| {
                    r.owner.is_none() && r.info.class == NodeClass::River
                })
                .take(want_river as usize)
                .map(|r| r.info.node_name.clone()),
        );

        let now = Utc::now();
        let mut assigned = Vec::new();
        for name in selected {
            let row = rows.get_mut(&name).unwrap();
            row.owner = Some(worker.to_string());
            row.heartbeat = Some(now);
            assigned.push(row.info.clone());
        }
        Ok(assigned)
    }

    async fn heartbeat(
        &self,
        worker: &str,
        location: &str,
        nodes: &[NodeInfo],
    ) -> Result<Vec<NodeInfo>, StoreError> {
        let mut rows = self.rows.lock().await;
        self.acquiring.notify(worker);
        let active_workers = self.acquiring.count();

        let mut dropped = Vec::new();
        let now = Utc::now();
        for node in nodes {
            if !location.is_empty()
                && node.node_name == location
                && active_workers > SELF_MONITOR_MAX
            {
                dropped.push(node.clone());
                continue;
            }
            match rows.get_mut(&node.node_name) {
                Some(row) if row.owner.as_deref() == Some(worker) => {
                    row.heartbeat = Some(now);
                }
                _ => dropped.push(node.clone()),
            }
        }
        Ok(dropped)
    }

    async fn release(
        &self,
        worker: &str,
        names: &[String],
    ) -> Result<u64, StoreError> {
        if worker.is_empty() || names.is_empty() {
            return Ok(0);
        }
        let mut rows = self.rows.lock().await;
        let mut released = 0;
        for name in names {
            if let Some(row) = rows.get_mut(name) {
                if row.owner.as_deref() == Some(worker) {
                    row.owner = None;
                    row.heartbeat = None;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn expire_stale(&self, minutes: u64) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes as i64);
        let mut expired = 0;
        for row in rows.values_mut() {
            if let Some(heartbeat) = row.heartbeat {
                if heartbeat < cutoff {
                    row.owner = None;
                    row.heartbeat = None;
                    expired += 1;
                }
            }
        }
        self.acquiring.prune_older_than(cutoff);
        Ok(expired)
    }

    async fn lookup_node(
        &self,
        name: &str,
    ) -> Result<Option<NodeInfo>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(name).map(|row| {
            let mut node = row.info.clone();
            node.node_console_name = row.owner.clone().unwrap_or_default();
            node
        }))
    }

    async fn active_worker_count(&self) -> u64 {
        self.acquiring.count() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(name: &str, class: NodeClass) -> NodeInfo {
        NodeInfo {
            node_name: name.to_string(),
            bmc_name: format!("{}-bmc", name),
            bmc_fqdn: format!("{}-bmc.local", name),
            class,
            nid: 1,
            role: "Compute".to_string(),
            node_console_name: String::new(),
        }
    }

    fn pool(class: NodeClass, count: usize) -> Vec<NodeInfo> {
        (0..count)
            .map(|i| node(&format!("x0c0s{}{:04}", class, i), class))
            .collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemStore::new();
        let nodes = pool(NodeClass::River, 10);
        assert_eq!(store.upsert_inventory(&nodes).await.unwrap(), 10);
        assert_eq!(store.upsert_inventory(&nodes).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claim_respects_budgets_and_class_priority() {
        let store = MemStore::new();
        store
            .upsert_inventory(&pool(NodeClass::Mountain, 2))
            .await
            .unwrap();
        store.upsert_inventory(&pool(NodeClass::Hill, 3)).await.unwrap();
        store
            .upsert_inventory(&pool(NodeClass::Paradise, 5))
            .await
            .unwrap();

        let got = store.claim("w1", 7, 0).await.unwrap();
        assert_eq!(got.len(), 7);
        let count = |class| {
            got.iter().filter(|n| n.class == class).count()
        };
        assert_eq!(count(NodeClass::Mountain), 2);
        assert_eq!(count(NodeClass::Hill), 3);
        assert_eq!(count(NodeClass::Paradise), 2);
    }

    #[tokio::test]
    async fn claim_never_double_assigns() {
        let store = std::sync::Arc::new(MemStore::new());
        store.upsert_inventory(&pool(NodeClass::River, 100)).await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let got = store
                        .claim(&format!("w{}", worker), 0, 7)
                        .await
                        .unwrap();
                    if got.is_empty() {
                        return mine;
                    }
                    mine.extend(got.into_iter().map(|n| n.node_name));
                }
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let total = all.len();
        all.dedup();
        assert_eq!(total, 100, "every node claimed exactly once");
        assert_eq!(all.len(), 100, "no node claimed twice");
        assert_eq!(store.active_worker_count().await, 8);
    }

    #[tokio::test]
    async fn heartbeat_reports_foreign_nodes() {
        let store = MemStore::new();
        store.upsert_inventory(&pool(NodeClass::River, 4)).await.unwrap();
        let mine = store.claim("w1", 0, 2).await.unwrap();
        let theirs = store.claim("w2", 0, 2).await.unwrap();

        let mut all = mine.clone();
        all.extend(theirs.clone());
        let dropped = store.heartbeat("w1", "", &all).await.unwrap();
        let dropped_names: Vec<_> =
            dropped.iter().map(|n| n.node_name.as_str()).collect();
        for node in &theirs {
            assert!(dropped_names.contains(&node.node_name.as_str()));
        }
        for node in &mine {
            assert!(!dropped_names.contains(&node.node_name.as_str()));
        }
    }

    #[tokio::test]
    async fn self_monitor_tolerated_only_when_alone() {
        let store = MemStore::new();
        store.upsert_inventory(&pool(NodeClass::River, 2)).await.unwrap();
        let mine = store.claim("w1", 0, 2).await.unwrap();
        let host = mine[0].node_name.clone();

        // single active worker: the node stays
        let dropped = store.heartbeat("w1", &host, &mine).await.unwrap();
        assert!(dropped.is_empty());

        // a second worker shows up; now the host node must move
        store.claim("w2", 0, 1).await.unwrap();
        let dropped = store.heartbeat("w1", &host, &mine).await.unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].node_name, host);
    }

    #[tokio::test]
    async fn released_nodes_never_reappear_as_drops() {
        let store = MemStore::new();
        store.upsert_inventory(&pool(NodeClass::Hill, 3)).await.unwrap();
        let mine = store.claim("w1", 3, 0).await.unwrap();
        let names: Vec<String> =
            mine.iter().map(|n| n.node_name.clone()).collect();
        assert_eq!(store.release("w1", &names[..1]).await.unwrap(), 1);

        // the released node is no longer reported for this worker at all
        let remaining = &mine[1..];
        let dropped =
            store.heartbeat("w1", "", remaining).await.unwrap();
        assert!(dropped.is_empty());
    }

    #[tokio::test]
    async fn expiration_clears_owners_and_workers() {
        let store = MemStore::new();
        store.upsert_inventory(&pool(NodeClass::River, 6)).await.unwrap();
        let a = store.claim("w1", 0, 3).await.unwrap();
        let b = store.claim("w2", 0, 3).await.unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 3);

        let stale = Utc::now() - chrono::Duration::minutes(10);
        for node in a.iter().chain(b.iter()) {
            store.backdate_heartbeat(&node.node_name, stale).await;
        }
        store.backdate_worker("w1", stale);
        store.backdate_worker("w2", stale);

        assert_eq!(store.expire_stale(3).await.unwrap(), 6);
        assert_eq!(store.active_worker_count().await, 0);
        for node in a.iter().chain(b.iter()) {
            let found =
                store.lookup_node(&node.node_name).await.unwrap().unwrap();
            assert_eq!(found.node_console_name, "");
        }
    }

    #[tokio::test]
    async fn lookup_distinguishes_unknown_from_unowned() {
        let store = MemStore::new();
        store.upsert_inventory(&pool(NodeClass::River, 1)).await.unwrap();
        let name = &pool(NodeClass::River, 1)[0].node_name;

        let unowned = store.lookup_node(name).await.unwrap().unwrap();
        assert_eq!(unowned.node_console_name, "");
        assert!(store.lookup_node("x9z").await.unwrap().is_none());

        store.claim("w9", 0, 1).await.unwrap();
        let owned = store.lookup_node(name).await.unwrap().unwrap();
        assert_eq!(owned.node_console_name, "w9");
    }
}
