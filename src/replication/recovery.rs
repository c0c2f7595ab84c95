//! Replica initialization: staleness detection and full resync.

use tracing::{info, trace, warn};

use crate::coordination::ephemeral::EphemeralNodeGuard;
use crate::coordination::{parse_number, CoordinationClientExt, CoordinationError, CreateMode};
use crate::error::ReplicationError;

use super::state::ApplierActivity;
use super::worker::ReplicaContext;

/// Digest value written to force the next initialization to resync.
pub const FORCE_AUTO_RECOVERY_DIGEST: &str = "42";

/// Why a replica was declared lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LostReason {
    /// Never initialized (`log_ptr == 0`).
    NewReplica,
    /// Fell behind the retained window.
    OutsideRetainedWindow {
        log_ptr: u64,
        logs_to_keep: u64,
        max_log_ptr: u64,
    },
    /// Local metadata diverged from the stored digest.
    DigestMismatch { local: u64, stored: u64 },
}

/// Inputs of the staleness decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessProbe {
    pub our_log_ptr: u64,
    pub max_log_ptr: u64,
    pub logs_to_keep: u64,
    pub check_consistency: bool,
    pub local_digest: u64,
    pub stored_digest: u64,
}

impl StalenessProbe {
    /// Returns why the replica is lost, or `None` when it can resume from its pointer.
    pub fn lost_reason(&self) -> Option<LostReason> {
        if self.our_log_ptr == 0 {
            return Some(LostReason::NewReplica);
        }
        if self.our_log_ptr.saturating_add(self.logs_to_keep) < self.max_log_ptr {
            return Some(LostReason::OutsideRetainedWindow {
                log_ptr: self.our_log_ptr,
                logs_to_keep: self.logs_to_keep,
                max_log_ptr: self.max_log_ptr,
            });
        }
        if self.check_consistency && self.local_digest != self.stored_digest {
            return Some(LostReason::DigestMismatch {
                local: self.local_digest,
                stored: self.stored_digest,
            });
        }
        None
    }
}

/// Summary of a successful initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub log_ptr: u64,
    pub max_log_ptr: u64,
    pub lost: Option<LostReason>,
    pub unsynced: bool,
}

/// Overwrites the stored digest with the sentinel so the next pass resyncs.
pub(crate) fn invalidate_digest(ctx: &ReplicaContext, failures: u64) -> Result<(), ReplicationError> {
    let client = ctx.client();
    let path = ctx.paths.replica_digest();
    let previous = client.try_get(&path)?;
    warn!(
        entry = %ctx.state.current_task(),
        failures,
        last_error = ?ctx.state.last_failure(),
        previous_digest = ?previous,
        "replica is stuck on the same error, resetting digest to force recovery"
    );
    match client.set(&path, FORCE_AUTO_RECOVERY_DIGEST, None) {
        Ok(_) | Err(CoordinationError::NoNode { .. }) => {}
        Err(err) => return Err(err.into()),
    }
    ctx.state.record(ApplierActivity::DigestInvalidated { failures });
    Ok(())
}

/// Brings the replica to a state from which the applier can resume.
pub(crate) fn initialize_replication(ctx: &ReplicaContext) -> Result<InitReport, ReplicationError> {
    let client = ctx.client();
    let paths = &ctx.paths;
    let active_path = paths.replica_active();

    client.delete_ephemeral_if_content_matches(&active_path, |content| {
        ctx.identity.owns_active_marker(content)
    })?;
    let first_initialization = {
        let mut marker = ctx.active_marker.lock().unwrap();
        match marker.take() {
            Some(mut previous) => {
                previous.set_already_removed();
                false
            }
            None => true,
        }
    };

    let our_log_ptr = client.get_number(&paths.replica_log_ptr())?;
    let max_log_ptr = client.get_number(&paths.max_log_ptr())?;
    let logs_to_keep = client.get_number(&paths.logs_to_keep())?;
    ctx.state.set_logs_to_keep(logs_to_keep);

    let digest_path = paths.replica_digest();
    let local_digest = ctx.metadata.local_digest();
    let stored_digest = match client.try_get(&digest_path)? {
        Some(data) => parse_number(&digest_path, &data)?,
        None => {
            warn!(path = %digest_path, "digest node is missing, creating it");
            client.create(&digest_path, &local_digest.to_string(), CreateMode::Persistent)?;
            local_digest
        }
    };

    trace!(
        our_log_ptr,
        max_log_ptr,
        logs_to_keep,
        local_digest,
        stored_digest,
        "initializing replication"
    );

    let probe = StalenessProbe {
        our_log_ptr,
        max_log_ptr,
        logs_to_keep,
        check_consistency: ctx.settings.check_consistency,
        local_digest,
        stored_digest,
    };
    let lost = probe.lost_reason();
    let log_ptr = match &lost {
        Some(reason) => {
            if *reason != LostReason::NewReplica {
                warn!(
                    our_log_ptr,
                    max_log_ptr,
                    local_digest,
                    stored_digest,
                    ?reason,
                    "replica seems to be lost"
                );
            }
            // Entries committed while the snapshot was taken are already part of it.
            let recovered_log_ptr = ctx
                .metadata
                .recover_lost_replica(client.as_ref(), our_log_ptr, max_log_ptr)?
                .max(max_log_ptr);
            client.set(&paths.replica_log_ptr(), &recovered_log_ptr.to_string(), None)?;
            client.set(
                &digest_path,
                &ctx.metadata.local_digest().to_string(),
                None,
            )?;
            recovered_log_ptr
        }
        None => our_log_ptr,
    };
    ctx.state.reset_log_ptr(log_ptr);

    if !ctx.metadata.check_digest_valid() {
        return Err(ReplicationError::LogicalInconsistency(
            "inconsistent local metadata after initialization".to_string(),
        ));
    }

    let unsynced = if lost.is_some() {
        let new_max_log_ptr = client.get_number(&paths.max_log_ptr())?;
        let gap = new_max_log_ptr.saturating_sub(log_ptr);
        let unsynced = gap > ctx.settings.max_replication_lag_to_enqueue;
        info!(
            log_ptr,
            max_log_ptr = new_max_log_ptr,
            first_initialization,
            unsynced,
            "finishing replica initialization"
        );
        unsynced
    } else {
        false
    };
    ctx.state.set_unsynced_after_recovery(unsynced);

    client.create(
        &active_path,
        &ctx.identity.active_marker(unsynced),
        CreateMode::Ephemeral,
    )?;
    *ctx.active_marker.lock().unwrap() =
        Some(EphemeralNodeGuard::existing(client.clone(), active_path));

    let report = InitReport {
        log_ptr,
        max_log_ptr,
        lost,
        unsynced,
    };
    ctx.state.record(ApplierActivity::Initialized {
        log_ptr,
        lost: report.lost.clone(),
        unsynced,
    });
    Ok(report)
}

/// Clears the unsynced flag once the replica is back within the enqueue lag.
pub(crate) fn refresh_unsynced_flag(ctx: &ReplicaContext) -> Result<(), ReplicationError> {
    if !ctx.state.is_unsynced_after_recovery() {
        return Ok(());
    }
    let client = ctx.client();
    let our_log_ptr = ctx.state.log_ptr();
    let max_log_ptr = client.get_number(&ctx.paths.max_log_ptr())?;
    trace!(our_log_ptr, max_log_ptr, "replica is not fully synced after recovery");
    if our_log_ptr.saturating_add(ctx.settings.max_replication_lag_to_enqueue) < max_log_ptr {
        return Ok(());
    }
    if let Some(marker) = ctx.active_marker.lock().unwrap().as_ref() {
        marker.set_data(&ctx.identity.active_marker(false))?;
    }
    ctx.state.set_unsynced_after_recovery(false);
    ctx.state.record(ApplierActivity::BecameSynced {
        log_ptr: our_log_ptr,
    });
    info!(our_log_ptr, max_log_ptr, "replica became synced after recovery");
    Ok(())
}
