// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod rate_limiter;
pub mod stream;

pub use stream::{MigrationSource, MigrationStream};

#[derive(Error, Debug)]
pub enum MigratableError {
    #[error("Failed to setup migratable component: {0}")]
    Setup(#[source] anyhow::Error),

    #[error("Failed to iterate migratable component: {0}")]
    Iterate(#[source] anyhow::Error),

    #[error("Failed to complete migration for migratable component: {0}")]
    CompleteMigration(#[source] anyhow::Error),

    #[error("Failed to send migratable component state: {0}")]
    MigrateSend(#[source] anyhow::Error),

    #[error("Failed to receive migratable component state: {0}")]
    MigrateReceive(#[source] anyhow::Error),

    #[error("Socket error: {0}")]
    MigrateSocket(#[source] std::io::Error),

    #[error("Failed to start dirty tracking for migratable component: {0}")]
    StartDirtyLog(#[source] anyhow::Error),

    #[error("Failed to stop dirty tracking for migratable component: {0}")]
    StopDirtyLog(#[source] anyhow::Error),

    #[error("Failed to restore migratable component: {0}")]
    Restore(#[source] anyhow::Error),
}

/// Parameters of a migration session, negotiated before setup.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MigrationParams {
    /// Enable block device migration.
    pub blk: bool,
    /// The base image is shared with the destination; unallocated runs
    /// are skipped during the bulk phase. Implies `blk`.
    pub shared: bool,
    /// Elide all-zero chunks during the bulk phase. Implies `blk`.
    pub sparse: bool,
    /// Downtime budget, in seconds, used by the convergence test.
    pub max_downtime: f64,
}

impl Default for MigrationParams {
    fn default() -> Self {
        MigrationParams {
            blk: false,
            shared: false,
            sparse: false,
            max_downtime: 0.03,
        }
    }
}

/// A component whose state can be migrated live, while it keeps running,
/// through repeated convergence passes.
///
/// The migration driver calls the hooks in order `set_params`, `setup`,
/// then `iterate` until it returns true, then `complete`, or `cancel`
/// at any point. On the destination, `load` consumes the stream produced
/// by the source. Any hook returning an error terminates the session;
/// implementations must release their resources on every error path.
pub trait LiveMigratable {
    fn set_params(&mut self, params: &MigrationParams);

    /// Whether the component participates in the migration at all.
    fn is_active(&self) -> bool;

    fn setup(&mut self, f: &mut MigrationStream) -> std::result::Result<(), MigratableError>;

    /// Run one transfer pass. Returns true once the remaining work fits
    /// in the downtime budget.
    fn iterate(&mut self, f: &mut MigrationStream) -> std::result::Result<bool, MigratableError>;

    /// Final synchronous pass, with the source paused.
    fn complete(&mut self, f: &mut MigrationStream) -> std::result::Result<(), MigratableError>;

    fn load(&mut self, f: &mut MigrationSource) -> std::result::Result<(), MigratableError>;

    fn cancel(&mut self);
}
