//! The connection: one process' attachment to a silo repository.
//!
//! Opening a connection prepares the repository directories, gates creation
//! through the whole-file create-lock, attaches both shared regions
//! (initializing them on first create), registers a connection-state record
//! under `WriteNoState`, and on first create copies each module's startup
//! datastore to its running file.

use std::time::Duration;

use silo_error::{Result, SiloError};
use silo_shm::{CreateLock, ModuleSpec, RecoveryHooks, ShmConn};
use silo_types::{Datastore, EvpipeId, LockMode, SubOptions};
use tracing::{debug, info, warn};

use crate::config::{check_dirs, SiloConfig};

/// Arena waste threshold above which [`SiloConn::maybe_defrag`] compacts.
pub const DEFAULT_DEFRAG_THRESHOLD: u64 = 4096;

/// One attachment to a silo repository.
pub struct SiloConn {
    config: SiloConfig,
    shm: ShmConn,
    disconnected: bool,
}

impl SiloConn {
    /// Attach to the repository described by `config`, creating it on
    /// first use.
    pub fn open(config: SiloConfig) -> Result<Self> {
        check_dirs(&config)?;

        let create_lock = CreateLock::open(&config.lock_path(), config.file_perm)?;
        create_lock.acquire()?;
        let attached = ShmConn::attach(
            &config.main_shm_path(),
            &config.ext_shm_path(),
            config.file_perm,
        );
        create_lock.release()?;
        let (shm, created) = attached?;

        let mut conn = Self {
            config,
            shm,
            disconnected: false,
        };

        if created {
            conn.remove_leftover_evpipes();
        }

        // Register this process' connection state; the write lock also runs
        // the liveness sweep over whatever a crashed predecessor left.
        conn.shm.lock(LockMode::WriteNoState, false, false)?;
        let registered = conn.shm.conn_state_add().and_then(|()| {
            if created {
                conn.startup_to_running_locked()
            } else {
                Ok(())
            }
        });
        let unlocked = conn.shm.unlock(LockMode::WriteNoState, false, false);
        registered?;
        unlocked?;

        info!(repo = %conn.config.repo_path.display(), created, "connected");
        Ok(conn)
    }

    /// The configuration this connection was opened with.
    #[must_use]
    pub fn config(&self) -> &SiloConfig {
        &self.config
    }

    /// The shared-memory handle (lock sequences, registry reads).
    #[must_use]
    pub fn shm(&self) -> &ShmConn {
        &self.shm
    }

    /// The shared-memory handle, mutable.
    pub fn shm_mut(&mut self) -> &mut ShmConn {
        &mut self.shm
    }

    /// Install the storage-collaborator hooks used by liveness recovery.
    pub fn set_recovery_hooks(&mut self, hooks: Box<dyn RecoveryHooks + Send>) {
        self.shm.set_recovery_hooks(hooks);
    }

    /// Install (or extend) the module set. `tree` is the full descriptor
    /// tree; dependencies of every module are rebuilt from it.
    pub fn install_modules(&mut self, tree: &[ModuleSpec]) -> Result<()> {
        self.shm.lock(LockMode::Write, false, true)?;
        let result = self.shm.add_modules(tree);
        let unlocked = self.shm.unlock(LockMode::Write, false, true);
        result?;
        unlocked
    }

    /// Toggle a module's replay support.
    pub fn update_replay_support(&mut self, module: &str, replay: bool) -> Result<()> {
        self.shm.lock(LockMode::Write, false, false)?;
        let result = self.shm.update_replay_support(module, replay);
        let unlocked = self.shm.unlock(LockMode::Write, false, false);
        result?;
        unlocked
    }

    /// Subscribe to configuration changes of `module` on `ds`. Allocates
    /// and returns the subscription's event-pipe id.
    pub fn subscribe_change(
        &mut self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        opts: SubOptions,
    ) -> Result<EvpipeId> {
        self.shm.lock(LockMode::Write, false, false)?;
        let result: Result<EvpipeId> = (|| {
            let evpipe = self.shm.alloc_evpipe_id()?;
            self.shm.evpipe_add(evpipe)?;
            self.shm
                .change_sub_add(module, ds, xpath, priority, opts, evpipe)?;
            Ok(evpipe)
        })();
        let unlocked = self.shm.unlock(LockMode::Write, false, false);
        let evpipe = result?;
        unlocked?;
        Ok(evpipe)
    }

    /// Remove the change subscription keyed by `(xpath, priority)` and its
    /// event pipe.
    pub fn unsubscribe_change(
        &mut self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        evpipe: EvpipeId,
    ) -> Result<()> {
        self.shm.lock(LockMode::Write, false, false)?;
        let result: Result<()> = (|| {
            self.shm.change_sub_del(module, ds, xpath, priority)?;
            self.shm.evpipe_del(evpipe)
        })();
        let unlocked = self.shm.unlock(LockMode::Write, false, false);
        result?;
        unlocked
    }

    /// Subscribe to operational data requests for an xpath of `module`.
    pub fn subscribe_oper(
        &mut self,
        module: &str,
        xpath: &str,
        opts: SubOptions,
    ) -> Result<EvpipeId> {
        self.shm.lock(LockMode::Write, false, false)?;
        let result: Result<EvpipeId> = (|| {
            let evpipe = self.shm.alloc_evpipe_id()?;
            self.shm.evpipe_add(evpipe)?;
            self.shm.oper_sub_add(module, xpath, opts, evpipe)?;
            Ok(evpipe)
        })();
        let unlocked = self.shm.unlock(LockMode::Write, false, false);
        let evpipe = result?;
        unlocked?;
        Ok(evpipe)
    }

    /// Subscribe to notifications of `module`.
    pub fn subscribe_notif(&mut self, module: &str) -> Result<EvpipeId> {
        self.shm.lock(LockMode::Write, false, false)?;
        let result: Result<EvpipeId> = (|| {
            let evpipe = self.shm.alloc_evpipe_id()?;
            self.shm.evpipe_add(evpipe)?;
            self.shm.notif_sub_add(module, evpipe)?;
            Ok(evpipe)
        })();
        let unlocked = self.shm.unlock(LockMode::Write, false, false);
        let evpipe = result?;
        unlocked?;
        Ok(evpipe)
    }

    /// Subscribe to an RPC, creating its table entry on first use.
    pub fn subscribe_rpc(
        &mut self,
        op_path: &str,
        xpath: &str,
        priority: u32,
        opts: SubOptions,
    ) -> Result<EvpipeId> {
        self.shm.lock(LockMode::Write, false, false)?;
        let result: Result<EvpipeId> = (|| {
            let rpc_off = match self.shm.find_rpc(op_path)? {
                Some(off) => off,
                None => self.shm.add_rpc(op_path)?,
            };
            let evpipe = self.shm.alloc_evpipe_id()?;
            self.shm.evpipe_add(evpipe)?;
            self.shm
                .rpc_sub_add(rpc_off, xpath, priority, opts, evpipe)?;
            Ok(evpipe)
        })();
        let unlocked = self.shm.unlock(LockMode::Write, false, false);
        let evpipe = result?;
        unlocked?;
        Ok(evpipe)
    }

    /// Remove an RPC subscription; the RPC entry goes with its last
    /// subscription.
    pub fn unsubscribe_rpc(
        &mut self,
        op_path: &str,
        xpath: &str,
        priority: u32,
        evpipe: EvpipeId,
    ) -> Result<()> {
        self.shm.lock(LockMode::Write, false, false)?;
        let result: Result<()> = (|| {
            let rpc_off = self
                .shm
                .find_rpc(op_path)?
                .ok_or_else(|| SiloError::RpcNotFound {
                    path: op_path.to_owned(),
                })?;
            let last = self.shm.rpc_sub_del(rpc_off, xpath, priority)?;
            if last {
                self.shm.del_rpc_offset(rpc_off)?;
            }
            self.shm.evpipe_del(evpipe)
        })();
        let unlocked = self.shm.unlock(LockMode::Write, false, false);
        result?;
        unlocked
    }

    /// Compact the arena now.
    pub fn defrag(&mut self) -> Result<()> {
        self.shm.lock(LockMode::Write, true, false)?;
        let result = self.shm.defrag();
        let unlocked = self.shm.unlock(LockMode::Write, true, false);
        result?;
        unlocked
    }

    /// Compact the arena when the wasted tally exceeds `threshold`.
    pub fn maybe_defrag(&mut self, threshold: u64) -> Result<bool> {
        if self.shm.arena().wasted() <= threshold {
            return Ok(false);
        }
        debug!(
            wasted = self.shm.arena().wasted(),
            threshold, "defragmentation triggered"
        );
        self.defrag()?;
        Ok(true)
    }

    /// Copy each installed module's startup datastore to its running file.
    pub fn startup_to_running(&mut self) -> Result<()> {
        self.shm.lock(LockMode::Read, false, false)?;
        let result = self.startup_to_running_locked();
        let unlocked = self.shm.unlock(LockMode::Read, false, false);
        result?;
        unlocked
    }

    fn startup_to_running_locked(&mut self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        for i in 0..self.shm.module_count() {
            let base = silo_shm::layout::module_base(i);
            let name_off = self.shm.module_view(base).name();
            let module = self.shm.arena().str_at(name_off)?.to_owned();

            let startup = self.config.startup_file(&module);
            if !startup.exists() {
                continue;
            }
            let running = self.config.running_file(&module);
            std::fs::copy(&startup, &running).map_err(|e| {
                SiloError::init_failed(format!(
                    "copying <startup> to <running> for \"{module}\" failed: {e}"
                ))
            })?;
            std::fs::set_permissions(
                &running,
                std::fs::Permissions::from_mode(self.config.file_perm),
            )
            .map_err(|e| SiloError::init_failed(format!("chmod of running file failed: {e}")))?;
        }
        info!("datastore copied from <startup> to <running>");
        Ok(())
    }

    /// Remove event-pipe files a previous instance left behind.
    fn remove_leftover_evpipes(&self) {
        let Ok(entries) = std::fs::read_dir(&self.config.repo_path) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("evpipe") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    /// Explicitly detach: unregister the connection state and release the
    /// regions.
    pub fn disconnect(mut self) -> Result<()> {
        self.disconnect_inner()
    }

    fn disconnect_inner(&mut self) -> Result<()> {
        if self.disconnected {
            return Ok(());
        }
        self.disconnected = true;
        self.shm.lock_with_timeout(
            LockMode::WriteNoState,
            false,
            false,
            Duration::from_secs(2),
        )?;
        let removed = self.shm.conn_state_del(self.shm.conn_id(), self.shm.pid());
        let unlocked = self.shm.unlock(LockMode::WriteNoState, false, false);
        removed?;
        unlocked?;
        debug!("disconnected");
        Ok(())
    }
}

impl Drop for SiloConn {
    fn drop(&mut self) {
        if !self.disconnected {
            if let Err(e) = self.disconnect_inner() {
                warn!(error = %e, "disconnect on drop failed");
            }
        }
    }
}
