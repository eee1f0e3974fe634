//! Instance store and the operations the HTTP layer calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::InstanceError;
use crate::executor::{self, ExecLimits, ExecOutput};
use crate::sandbox;
use crate::validator;

/// One provisioned practice environment.
#[derive(Debug, Clone)]
pub struct Instance {
    id: String,
    flag: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    sandbox_dir: PathBuf,
}

impl Instance {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The secret. Only the flag check and the rendered page read this.
    pub fn flag(&self) -> &str {
        &self.flag
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// The outward view of an instance. Never carries the flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlagCheck {
    pub correct: bool,
}

pub fn flag_for(id: &str) -> String {
    format!("FLAG{{{}-hidden-in-html}}", id)
}

fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Concurrent registry of live instances.
///
/// The store is the only owner of the id -> instance mapping and the only
/// place expiry is decided. Removal happens under the write lock, so when
/// several callers race to expire the same id exactly one of them gets the
/// instance back and runs its cleanup.
#[derive(Clone)]
pub struct InstanceStore {
    instances: Arc<RwLock<HashMap<String, Instance>>>,
    sandbox_root: PathBuf,
    ttl: chrono::Duration,
}

impl InstanceStore {
    pub fn new(sandbox_root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            sandbox_root: sandbox_root.into(),
            ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
        }
    }

    /// Provision and register a fresh instance.
    pub async fn create(&self) -> Result<Instance, InstanceError> {
        let id = new_instance_id();
        let created_at = Utc::now();
        let expires_at = created_at.checked_add_signed(self.ttl).ok_or_else(|| {
            InstanceError::Provision(format!("instance TTL {} is out of range", self.ttl))
        })?;

        let sandbox_dir = tokio::task::spawn_blocking({
            let root = self.sandbox_root.clone();
            let id = id.clone();
            move || sandbox::provision(&root, &id)
        })
        .await
        .map_err(|e| InstanceError::Provision(e.to_string()))?
        .map_err(InstanceError::Provision)?;

        let instance = Instance {
            flag: flag_for(&id),
            id: id.clone(),
            created_at,
            expires_at,
            sandbox_dir,
        };

        self.instances.write().await.insert(id.clone(), instance.clone());
        info!(instance_id = %id, expires_at = %instance.expires_at, "Created instance");
        Ok(instance)
    }

    /// Look up a live instance, expiring it if its TTL has elapsed.
    pub async fn get(&self, id: &str) -> Result<Instance, InstanceError> {
        let instance = self
            .instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(InstanceError::NotFound)?;

        let now = Utc::now();
        if !instance.is_expired_at(now) {
            return Ok(instance);
        }

        if self.remove_expired(id, now).await {
            Err(InstanceError::Expired)
        } else {
            // Someone else already expired or deleted it.
            Err(InstanceError::NotFound)
        }
    }

    /// Remove `id` and its sandbox. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.instances.write().await.remove(id);
        match removed {
            Some(instance) => {
                info!(instance_id = %id, "Deleted instance");
                release(instance).await;
                true
            }
            None => false,
        }
    }

    /// Delete every instance whose TTL has elapsed. Returns how many this
    /// call removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.is_expired_at(now))
            .map(|i| i.id.clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if self.remove_expired(&id, now).await {
                removed += 1;
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Remove `id` only if it is still present and expired as of `now`.
    async fn remove_expired(&self, id: &str, now: DateTime<Utc>) -> bool {
        let removed = {
            let mut instances = self.instances.write().await;
            match instances.get(id) {
                Some(instance) if instance.is_expired_at(now) => instances.remove(id),
                _ => None,
            }
        };
        match removed {
            Some(instance) => {
                info!(instance_id = %id, "Instance expired");
                release(instance).await;
                true
            }
            None => false,
        }
    }
}

async fn release(instance: Instance) {
    let sandbox_dir = instance.sandbox_dir;
    let result = tokio::task::spawn_blocking({
        let sandbox_dir = sandbox_dir.clone();
        move || sandbox::cleanup(&sandbox_dir)
    })
    .await;
    if let Err(e) = result {
        warn!(path = ?sandbox_dir, error = %e, "Sandbox cleanup task failed");
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: InstanceStore,
    pub limits: ExecLimits,
    pub max_command_len: usize,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            store: InstanceStore::new(&config.sandbox_root, config.instance_ttl),
            limits: config.exec_limits(),
            max_command_len: config.max_command_len,
        }
    }

    /// Create a new instance, first evicting anything already expired.
    pub async fn create_instance(&self) -> Result<InstanceStatus, InstanceError> {
        self.store.sweep_expired().await;
        Ok(self.store.create().await?.status())
    }

    pub async fn instance_status(&self, id: &str) -> Result<InstanceStatus, InstanceError> {
        Ok(self.store.get(id).await?.status())
    }

    /// Exact, case-sensitive comparison after trimming the submission.
    pub async fn submit_flag(&self, id: &str, submitted: &str) -> Result<FlagCheck, InstanceError> {
        let instance = self.store.get(id).await?;
        let correct = submitted.trim() == instance.flag();
        info!(instance_id = %id, correct, "Flag submitted");
        Ok(FlagCheck { correct })
    }

    pub async fn run_command(&self, id: &str, raw: &str) -> Result<ExecOutput, InstanceError> {
        let instance = self.store.get(id).await?;
        let command = validator::validate(raw, instance.sandbox_dir(), self.max_command_len)
            .map_err(|e| {
                info!(instance_id = %id, reason = %e, "Command rejected");
                e
            })?;
        Ok(executor::execute(&command, instance.sandbox_dir(), self.limits).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path, ttl: Duration) -> InstanceStore {
        InstanceStore::new(root, ttl)
    }

    fn app(root: &Path, ttl: Duration) -> AppState {
        let config = Config {
            sandbox_root: root.to_path_buf(),
            instance_ttl: ttl,
            ..Config::default()
        };
        AppState::new(&config)
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::from_secs(60));
        assert!(matches!(store.get("nope").await, Err(InstanceError::NotFound)));
    }

    #[tokio::test]
    async fn create_provisions_and_registers() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::from_secs(1200));

        let instance = store.create().await.unwrap();
        assert!(instance.sandbox_dir().join("readme.txt").exists());
        assert_eq!(instance.flag(), format!("FLAG{{{}-hidden-in-html}}", instance.id()));
        assert_eq!(
            instance.expires_at() - instance.created_at(),
            chrono::Duration::minutes(20)
        );
        assert!(instance.id().chars().all(|c| c.is_ascii_alphanumeric()));

        let fetched = store.get(instance.id()).await.unwrap();
        assert_eq!(fetched.expires_at(), instance.expires_at());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::from_secs(60));
        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.sandbox_dir(), b.sandbox_dir());
    }

    #[tokio::test]
    async fn expired_once_then_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::ZERO);
        let instance = store.create().await.unwrap();

        assert!(matches!(store.get(instance.id()).await, Err(InstanceError::Expired)));
        assert!(!instance.sandbox_dir().exists());
        assert!(matches!(store.get(instance.id()).await, Err(InstanceError::NotFound)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn racing_lookups_expire_exactly_once() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::ZERO);
        let instance = store.create().await.unwrap();

        let lookups = (0..8).map(|_| {
            let store = store.clone();
            let id = instance.id().to_string();
            tokio::spawn(async move { store.get(&id).await })
        });
        let mut expired = 0;
        let mut not_found = 0;
        for handle in lookups.collect::<Vec<_>>() {
            match handle.await.unwrap() {
                Err(InstanceError::Expired) => expired += 1,
                Err(InstanceError::NotFound) => not_found += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(expired, 1);
        assert_eq!(not_found, 7);
        assert!(!instance.sandbox_dir().exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::from_secs(60));
        let instance = store.create().await.unwrap();

        assert!(store.delete(instance.id()).await);
        assert!(!instance.sandbox_dir().exists());
        assert!(!store.delete(instance.id()).await);
        assert!(!store.delete("never-existed").await);
        assert!(matches!(store.get(instance.id()).await, Err(InstanceError::NotFound)));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let root = tempfile::tempdir().unwrap();
        let short = store(root.path(), Duration::ZERO);
        let long = InstanceStore {
            ttl: chrono::Duration::minutes(20),
            ..short.clone()
        };

        let stale = short.create().await.unwrap();
        let fresh = long.create().await.unwrap();

        assert_eq!(short.sweep_expired().await, 1);
        assert!(!stale.sandbox_dir().exists());
        assert!(fresh.sandbox_dir().exists());
        assert!(short.get(fresh.id()).await.is_ok());
        assert_eq!(short.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn sweep_survives_missing_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::ZERO);
        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();
        std::fs::remove_dir_all(a.sandbox_dir()).unwrap();

        assert_eq!(store.sweep_expired().await, 2);
        assert!(!b.sandbox_dir().exists());
    }

    #[tokio::test]
    async fn sweep_continues_past_failed_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::ZERO);
        let a = store.create().await.unwrap();
        let b = store.create().await.unwrap();

        // A regular file where the directory was makes remove_dir_all fail.
        std::fs::remove_dir_all(a.sandbox_dir()).unwrap();
        std::fs::write(a.sandbox_dir(), "not a directory").unwrap();

        assert_eq!(store.sweep_expired().await, 2);
        assert!(store.is_empty().await);
        assert!(!b.sandbox_dir().exists());
        assert!(matches!(store.get(a.id()).await, Err(InstanceError::NotFound)));
    }

    #[tokio::test]
    async fn out_of_range_ttl_fails_create() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::from_secs(10_000_000_000_000));

        assert!(matches!(store.create().await, Err(InstanceError::Provision(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn expiry_uses_the_callers_clock_reading() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), Duration::from_secs(60));
        let instance = store.create().await.unwrap();

        let before = instance.expires_at() - chrono::Duration::seconds(1);
        assert!(!store.remove_expired(instance.id(), before).await);
        assert!(instance.sandbox_dir().exists());

        assert!(store.remove_expired(instance.id(), instance.expires_at()).await);
        assert!(!instance.sandbox_dir().exists());
        assert!(!store.remove_expired(instance.id(), instance.expires_at()).await);
    }

    #[tokio::test]
    async fn status_is_stable_and_hides_flag() {
        let root = tempfile::tempdir().unwrap();
        let app = app(root.path(), Duration::from_secs(60));

        let created = app.create_instance().await.unwrap();
        let first = app.instance_status(&created.id).await.unwrap();
        let second = app.instance_status(&created.id).await.unwrap();
        assert_eq!(first, created);
        assert_eq!(first, second);

        let json = serde_json::to_string(&first).unwrap();
        assert!(!json.contains("FLAG{"));
        assert!(json.contains("\"expiresAt\""));
    }

    #[tokio::test]
    async fn flag_check_trims_and_is_case_sensitive() {
        let root = tempfile::tempdir().unwrap();
        let app = app(root.path(), Duration::from_secs(60));
        let id = app.create_instance().await.unwrap().id;
        let flag = flag_for(&id);

        assert!(app.submit_flag(&id, &flag).await.unwrap().correct);
        assert!(app.submit_flag(&id, &format!("  {}\n", flag)).await.unwrap().correct);
        assert!(!app.submit_flag(&id, &flag.to_lowercase()).await.unwrap().correct);
        assert!(!app.submit_flag(&id, "FLAG{wrong}").await.unwrap().correct);
        assert!(!app.submit_flag(&id, "").await.unwrap().correct);
        assert!(matches!(
            app.submit_flag("missing", &flag).await,
            Err(InstanceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn run_command_validates_then_executes() {
        let root = tempfile::tempdir().unwrap();
        let app = app(root.path(), Duration::from_secs(60));
        let id = app.create_instance().await.unwrap().id;

        let output = app.run_command(&id, "cat notes.txt").await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("not stored"));
        assert!(!output.stdout.contains("FLAG{"));

        assert!(matches!(
            app.run_command(&id, "rm -rf /").await,
            Err(InstanceError::Rejected(_))
        ));
        assert!(matches!(
            app.run_command("missing", "pwd").await,
            Err(InstanceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn create_evicts_expired_instances() {
        let root = tempfile::tempdir().unwrap();
        let app = app(root.path(), Duration::ZERO);

        let first = app.create_instance().await.unwrap();
        let _second = app.create_instance().await.unwrap();
        assert_eq!(app.store.len().await, 1);
        assert!(matches!(
            app.instance_status(&first.id).await,
            Err(InstanceError::NotFound)
        ));
    }
}
