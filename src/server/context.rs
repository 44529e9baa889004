//! Per-connection server-side session state: account root, client store
//! marker, read/write mode, and the login/authed/finished phase machine.
//!
//! Concurrency: a single account permits at most one write-authed session
//! at a time (advisory lock via [`AccountLocks`]), and any number of
//! read-only sessions. Housekeeping takes the same write lock and never
//! runs concurrently with a writer session.

use crate::store::object_id::ObjectId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Server-side phase machine. Only the listed transitions are legal;
/// anything else is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    Version,
    Login,
    Authed,
    Finished,
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("operation requires phase {required:?}, session is in {actual:?}")]
    WrongPhase { required: Phase, actual: Phase },
    #[error("account {0} is already locked for writing by another session")]
    AlreadyLockedForWrite(ObjectId),
    #[error("account over quota: {used} blocks used against hard limit {hard_limit}")]
    QuotaExceeded { used: u64, hard_limit: u64 },
}

/// Account's block-usage partition and quota, mirroring the data model's
/// `blocksUsed` accumulator.
#[derive(Debug, Clone, Default)]
pub struct AccountInfo {
    pub account_id: u64,
    pub client_store_marker: u64,
    pub blocks_current: u64,
    pub blocks_old: u64,
    pub blocks_deleted: u64,
    pub blocks_directories: u64,
    pub soft_limit: u64,
    pub hard_limit: u64,
}

impl AccountInfo {
    pub fn blocks_used(&self) -> u64 {
        self.blocks_current + self.blocks_old + self.blocks_deleted + self.blocks_directories
    }

    /// The quota gate described in the design: past this point new
    /// uploads are rejected but deletes and metadata mutations continue.
    pub fn storage_limit_exceeded(&self) -> bool {
        let threshold = self.soft_limit + (self.hard_limit.saturating_sub(self.soft_limit)) / 3;
        self.blocks_used() > threshold
    }
}

/// Advisory per-account write lock, shared across all connections in the
/// server process.
#[derive(Default)]
pub struct AccountLocks {
    writers: Mutex<HashMap<ObjectId, bool>>,
}

impl AccountLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire_write(&self, account_id: ObjectId) -> Result<(), ContextError> {
        let mut writers = self.writers.lock().unwrap();
        if *writers.get(&account_id).unwrap_or(&false) {
            return Err(ContextError::AlreadyLockedForWrite(account_id));
        }
        writers.insert(account_id, true);
        Ok(())
    }

    pub fn release_write(&self, account_id: ObjectId) {
        self.writers.lock().unwrap().insert(account_id, false);
    }
}

/// One context per connection.
pub struct StoreContext {
    pub account_id: ObjectId,
    pub read_only: bool,
    pub phase: Phase,
    pub marker: u64,
    locks: Arc<AccountLocks>,
    holding_write_lock: bool,
}

impl StoreContext {
    pub fn new(locks: Arc<AccountLocks>) -> Self {
        Self {
            account_id: 0,
            read_only: true,
            phase: Phase::Initial,
            marker: 0,
            locks,
            holding_write_lock: false,
        }
    }

    pub fn handle_version(&mut self) -> Result<(), ContextError> {
        self.require_phase(Phase::Initial)?;
        self.phase = Phase::Version;
        Ok(())
    }

    pub fn handle_login(
        &mut self,
        account: &mut AccountInfo,
        write_requested: bool,
    ) -> Result<u64, ContextError> {
        self.require_phase(Phase::Version)?;
        if write_requested {
            self.locks.try_acquire_write(account.account_id)?;
            self.holding_write_lock = true;
        }
        self.account_id = account.account_id;
        self.read_only = !write_requested;
        self.marker = account.client_store_marker;
        self.phase = Phase::Authed;
        Ok(self.marker)
    }

    pub fn set_client_store_marker(&mut self, account: &mut AccountInfo, marker: u64) -> Result<(), ContextError> {
        self.require_phase(Phase::Authed)?;
        account.client_store_marker = marker;
        self.marker = marker;
        Ok(())
    }

    pub fn require_authed_for_upload(&self, account: &AccountInfo) -> Result<(), ContextError> {
        self.require_phase(Phase::Authed)?;
        if account.storage_limit_exceeded() {
            return Err(ContextError::QuotaExceeded {
                used: account.blocks_used(),
                hard_limit: account.hard_limit,
            });
        }
        Ok(())
    }

    pub fn finish(&mut self) {
        self.phase = Phase::Finished;
    }

    fn require_phase(&self, required: Phase) -> Result<(), ContextError> {
        if self.phase != required {
            return Err(ContextError::WrongPhase {
                required,
                actual: self.phase,
            });
        }
        Ok(())
    }
}

impl Drop for StoreContext {
    fn drop(&mut self) {
        if self.holding_write_lock {
            self.locks.release_write(self.account_id);
        }
    }
}
