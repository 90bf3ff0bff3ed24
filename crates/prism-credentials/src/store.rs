//! In-memory credential store backed by one JSON file per tenant.
//!
//! Lookups never do more I/O than an mtime stat unless the file changed; a
//! filesystem watcher reloads edited files so operators can rotate
//! credentials without a restart. OAuth refreshes are single-flight per
//! tenant: the slot's write lock serializes refreshers and every waiter
//! re-checks expiry once it holds the lock.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use notify::{RecursiveMode, Watcher};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{CredentialError, Result};
use crate::refresh::TokenRefresher;
use crate::types::{CredentialFile, CredentialType, ResolvedCredential, UpstreamAuth};

pub struct CredentialStore {
    dir: PathBuf,
    refresh_lead_ms: i64,
    refresher: TokenRefresher,
    slots: DashMap<String, Arc<TenantSlot>>,
}

struct TenantSlot {
    state: RwLock<SlotState>,
}

struct SlotState {
    file: CredentialFile,
    mtime: Option<SystemTime>,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>, refresh_lead_secs: u64) -> Self {
        Self {
            dir: dir.into(),
            refresh_lead_ms: (refresh_lead_secs as i64) * 1000,
            refresher: TokenRefresher::new(),
            slots: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_refresher(mut self, refresher: TokenRefresher) -> Self {
        self.refresher = refresher;
        self
    }

    /// Load every credential file in the directory. Malformed files are
    /// skipped with a warning; they never evict a previously good copy.
    pub fn scan(&self) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(tenant) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load_file(&path) {
                Ok(state) => {
                    self.slots.insert(
                        tenant.to_string(),
                        Arc::new(TenantSlot {
                            state: RwLock::new(state),
                        }),
                    );
                    loaded += 1;
                }
                Err(e) => warn!(tenant, error = %e, "skipping unreadable credential file"),
            }
        }
        info!(count = loaded, dir = %self.dir.display(), "credential scan complete");
        Ok(loaded)
    }

    /// Watch the credential directory and reload files as they change.
    /// The watcher thread holds the only reference to the OS watcher; it
    /// lives until the process exits.
    pub fn spawn_watcher(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)
            .map_err(|e| CredentialError::Parse(format!("watcher init failed: {e}")))?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| CredentialError::Parse(format!("watch failed: {e}")))?;

        let store = Arc::clone(self);
        std::thread::Builder::new()
            .name("credential-watch".into())
            .spawn(move || {
                let _watcher = watcher;
                for event in rx {
                    let Ok(event) = event else { continue };
                    for path in event.paths {
                        if path.extension().and_then(|e| e.to_str()) == Some("json") {
                            store.reload_path(&path);
                        }
                    }
                }
            })?;
        Ok(())
    }

    /// Resolve a currently valid upstream credential for `tenant`,
    /// transparently refreshing OAuth tokens that are close to expiry.
    pub async fn resolve(&self, tenant: &str) -> Result<ResolvedCredential> {
        let slot = self.slot_for(tenant).await?;
        self.hot_reload_if_changed(tenant, &slot).await;

        // Fast path — read lock, token still fresh (or not OAuth at all).
        {
            let state = slot.state.read().await;
            match resolved_if_fresh(tenant, &state.file, self.refresh_lead_ms) {
                FreshCheck::Ready(resolved) => return Ok(resolved),
                FreshCheck::NeedsRefresh => {}
                FreshCheck::Broken(e) => return Err(e),
            }
        }

        // Slow path — write lock, single-flight refresh. Waiters land here
        // after the in-flight refresh completes and take the fast re-check.
        let mut state = slot.state.write().await;
        match resolved_if_fresh(tenant, &state.file, self.refresh_lead_ms) {
            FreshCheck::Ready(resolved) => return Ok(resolved),
            FreshCheck::NeedsRefresh => {}
            FreshCheck::Broken(e) => return Err(e),
        }

        let tokens = state
            .file
            .oauth
            .clone()
            .ok_or_else(|| CredentialError::Parse(format!("tenant {tenant}: oauth block missing")))?;

        match self.refresher.refresh(&tokens).await {
            Ok(new_tokens) => {
                info!(tenant, "OAuth token refreshed");
                state.file.oauth = Some(new_tokens);
                if let Err(e) = self.persist(tenant, &state.file) {
                    warn!(tenant, error = %e, "failed to persist refreshed credential");
                } else {
                    state.mtime = file_mtime(&self.path_for(tenant));
                }
                let access_token = state
                    .file
                    .oauth
                    .as_ref()
                    .map(|t| t.access_token.clone())
                    .unwrap_or_default();
                Ok(ResolvedCredential {
                    tenant: tenant.to_string(),
                    account_id: state.file.account_id.clone(),
                    auth: UpstreamAuth::OAuth { access_token },
                })
            }
            Err(e) => {
                let now = chrono::Utc::now().timestamp_millis();
                if tokens.expired_at(now) {
                    warn!(tenant, error = %e, "OAuth refresh failed and token is expired");
                    Err(CredentialError::Expired)
                } else {
                    // Old token retained until true expiry.
                    warn!(tenant, error = %e, "OAuth refresh failed; serving remaining token lifetime");
                    Ok(ResolvedCredential {
                        tenant: tenant.to_string(),
                        account_id: state.file.account_id.clone(),
                        auth: UpstreamAuth::OAuth {
                            access_token: tokens.access_token.clone(),
                        },
                    })
                }
            }
        }
    }

    /// Constant-time comparison of a presented client key against the
    /// tenant's configured secret.
    pub async fn validate_client_auth(&self, tenant: &str, presented: &str) -> Result<()> {
        let slot = self.slot_for(tenant).await?;
        self.hot_reload_if_changed(tenant, &slot).await;
        let state = slot.state.read().await;
        let expected = state.file.client_api_key.as_bytes();
        if expected.ct_eq(presented.as_bytes()).into() {
            Ok(())
        } else {
            Err(CredentialError::Forbidden(tenant.to_string()))
        }
    }

    /// Account id for a tenant without touching OAuth state.
    pub async fn account_id(&self, tenant: &str) -> Result<String> {
        let slot = self.slot_for(tenant).await?;
        let state = slot.state.read().await;
        Ok(state.file.account_id.clone())
    }

    pub fn tenant_count(&self) -> usize {
        self.slots.len()
    }

    // --- internals ---------------------------------------------------------

    async fn slot_for(&self, tenant: &str) -> Result<Arc<TenantSlot>> {
        validate_tenant(tenant)?;
        if let Some(slot) = self.slots.get(tenant) {
            return Ok(Arc::clone(&slot));
        }
        // Lazy load covers tenants added after startup on platforms where
        // the watcher misses events.
        let path = self.path_for(tenant);
        let state = self
            .load_file(&path)
            .map_err(|_| CredentialError::UnknownTenant(tenant.to_string()))?;
        let slot = Arc::new(TenantSlot {
            state: RwLock::new(state),
        });
        self.slots.insert(tenant.to_string(), Arc::clone(&slot));
        Ok(slot)
    }

    async fn hot_reload_if_changed(&self, tenant: &str, slot: &TenantSlot) {
        let path = self.path_for(tenant);
        let disk_mtime = file_mtime(&path);
        {
            let state = slot.state.read().await;
            if state.mtime == disk_mtime {
                return;
            }
        }
        match self.load_file(&path) {
            Ok(new_state) => {
                let mut state = slot.state.write().await;
                *state = new_state;
                debug!(tenant, "credential file reloaded");
            }
            Err(e) => warn!(tenant, error = %e, "credential reload failed; keeping cached copy"),
        }
    }

    fn reload_path(&self, path: &Path) {
        let Some(tenant) = path.file_stem().and_then(|s| s.to_str()) else {
            return;
        };
        if !path.exists() {
            self.slots.remove(tenant);
            info!(tenant, "credential file removed");
            return;
        }
        match self.load_file(path) {
            Ok(state) => {
                match self.slots.entry(tenant.to_string()) {
                    dashmap::mapref::entry::Entry::Occupied(entry) => {
                        let slot = Arc::clone(entry.get());
                        // blocking_write is safe here: watcher runs on its own thread.
                        *slot.state.blocking_write() = state;
                    }
                    dashmap::mapref::entry::Entry::Vacant(entry) => {
                        entry.insert(Arc::new(TenantSlot {
                            state: RwLock::new(state),
                        }));
                    }
                }
                debug!(tenant, "credential file (re)loaded from watch event");
            }
            Err(e) => warn!(tenant, error = %e, "ignoring unreadable credential update"),
        }
    }

    fn load_file(&self, path: &Path) -> Result<SlotState> {
        let data = std::fs::read_to_string(path)?;
        let file: CredentialFile =
            serde_json::from_str(&data).map_err(|e| CredentialError::Parse(e.to_string()))?;
        validate_file(&file)?;
        Ok(SlotState {
            file,
            mtime: file_mtime(path),
        })
    }

    fn path_for(&self, tenant: &str) -> PathBuf {
        self.dir.join(format!("{tenant}.json"))
    }

    /// Write-temp-then-rename so a crash mid-write never corrupts the file.
    fn persist(&self, tenant: &str, file: &CredentialFile) -> Result<()> {
        let json =
            serde_json::to_string_pretty(file).map_err(|e| CredentialError::Parse(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(self.path_for(tenant))
            .map_err(|e| CredentialError::Io(e.error))?;
        Ok(())
    }
}

enum FreshCheck {
    Ready(ResolvedCredential),
    NeedsRefresh,
    Broken(CredentialError),
}

fn resolved_if_fresh(tenant: &str, file: &CredentialFile, lead_ms: i64) -> FreshCheck {
    match file.credential_type {
        CredentialType::ApiKey => match &file.api_key {
            Some(key) => FreshCheck::Ready(ResolvedCredential {
                tenant: tenant.to_string(),
                account_id: file.account_id.clone(),
                auth: UpstreamAuth::ApiKey(key.clone()),
            }),
            None => FreshCheck::Broken(CredentialError::Parse(format!(
                "tenant {tenant}: api_key credential without api_key"
            ))),
        },
        CredentialType::Oauth => match &file.oauth {
            Some(tokens) => {
                let now = chrono::Utc::now().timestamp_millis();
                if tokens.fresh_at(now, lead_ms) {
                    FreshCheck::Ready(ResolvedCredential {
                        tenant: tenant.to_string(),
                        account_id: file.account_id.clone(),
                        auth: UpstreamAuth::OAuth {
                            access_token: tokens.access_token.clone(),
                        },
                    })
                } else {
                    FreshCheck::NeedsRefresh
                }
            }
            None => FreshCheck::Broken(CredentialError::Parse(format!(
                "tenant {tenant}: oauth credential without token block"
            ))),
        },
    }
}

/// A tenant name must map to a single filename — reject anything that could
/// escape the credential directory.
fn validate_tenant(tenant: &str) -> Result<()> {
    let bad = tenant.is_empty()
        || tenant.contains('/')
        || tenant.contains('\\')
        || tenant.contains("..")
        || tenant.starts_with('.');
    if bad {
        return Err(CredentialError::InvalidTenant(tenant.to_string()));
    }
    Ok(())
}

fn validate_file(file: &CredentialFile) -> Result<()> {
    match file.credential_type {
        CredentialType::ApiKey if file.api_key.is_none() => Err(CredentialError::Parse(
            "api_key credential missing api_key".to_string(),
        )),
        CredentialType::Oauth if file.oauth.is_none() => Err(CredentialError::Parse(
            "oauth credential missing oauth block".to_string(),
        )),
        _ => Ok(()),
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
