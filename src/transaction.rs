//! The transactional unit of work wrapped around a single cache call.

use crate::{CacheError, CacheHandle};
use log::debug;

/// What happened to a unit of work that did not fail to commit.
#[derive(Debug, PartialEq)]
pub enum TxOutcome<T> {
    /// The body succeeded and the unit of work was committed.
    Committed(T),
    /// The body failed, the unit of work was rolled back, and the failure is handed back to the
    /// caller for accounting only.
    RolledBack(CacheError),
}

/// Run `body` inside a unit of work on `handle`.
///
/// The unit of work is begun with `force_two_phase` forwarded to the engine. If `body` fails, the
/// unit of work is rolled back and the failure is returned as [`TxOutcome::RolledBack`] rather
/// than as an error. If `begin` or `commit` fails, a rollback is attempted and the failure is
/// returned as [`CacheError::Transaction`].
pub fn with_transaction<T>(
    handle: &mut dyn CacheHandle,
    force_two_phase: bool,
    body: impl FnOnce(&mut dyn CacheHandle) -> Result<T, CacheError>,
) -> Result<TxOutcome<T>, CacheError> {
    handle.begin(force_two_phase).map_err(into_transaction)?;
    match body(&mut *handle) {
        Ok(v) => match handle.commit() {
            Ok(()) => Ok(TxOutcome::Committed(v)),
            Err(e) => {
                // the engine may have cleaned up already, then there is nothing to roll back
                if let Err(re) = handle.rollback() {
                    debug!("Rollback after failed commit also failed: {}", re);
                }
                Err(into_transaction(e))
            }
        },
        Err(e) => {
            if let Err(re) = handle.rollback() {
                debug!("Rollback after failed body also failed: {}", re);
            }
            Ok(TxOutcome::RolledBack(e))
        }
    }
}

fn into_transaction(e: CacheError) -> CacheError {
    match e {
        CacheError::Transaction(_) => e,
        e => CacheError::Transaction(e.to_string()),
    }
}
