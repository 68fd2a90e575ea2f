//! Process- and connection-level configuration of the underlying SQLite engine.
//!
//! These are the two configuration surfaces the embedded engine only exposes
//! through untyped native entry points: the global diagnostic log sink, and the
//! per-connection legacy double-quoted string literal mode. Both are thin
//! forwards; the engine owns all of the resulting state.

use std::ffi::c_int;

use rusqlite::Connection;
use rusqlite::config::DbConfig;

use crate::error::CacheError;

/// Shape of the process-wide diagnostic sink: engine error code plus the
/// formatted message.
pub type LogCallback = fn(c_int, &str);

/// First engine version that understands the DQS db-config verbs.
pub const DQS_TOGGLE_MIN_VERSION: i32 = 3_029_000;

/// Install `callback` as the engine's process-wide diagnostic log sink,
/// replacing any previously registered sink.
///
/// The effect is global: every connection in the process, present and future,
/// reports through this callback, and the engine may invoke it from any
/// thread. The bundled engine accepts reconfiguration at any time, including
/// while connections are open; the swap is not synchronized with in-flight
/// log events, so registering before opening connections is still the
/// predictable order.
///
/// # Errors
///
/// Returns `CacheError::Sqlite` if the engine rejects the configuration.
pub fn register_log_callback(callback: LogCallback) -> Result<(), CacheError> {
    // SAFETY: the callback is a plain fn pointer with no captured state, and
    // sqlite3_config signals misuse through its return code rather than
    // corrupting state.
    unsafe { rusqlite::trace::config_log(Some(callback)) }.map_err(CacheError::Sqlite)
}

/// Remove the process-wide diagnostic log sink, if any.
///
/// # Errors
///
/// Returns `CacheError::Sqlite` under the same conditions as
/// [`register_log_callback`].
pub fn clear_log_callback() -> Result<(), CacheError> {
    // SAFETY: see register_log_callback.
    unsafe { rusqlite::trace::config_log(None) }.map_err(CacheError::Sqlite)
}

/// Whether the linked engine understands the double-quoted string toggles.
///
/// Older engines accept `"text"` as a string literal unconditionally; on those
/// the toggle calls below degrade to no-ops rather than failing.
#[must_use]
pub fn dqs_toggle_supported() -> bool {
    rusqlite::version_number() >= DQS_TOGGLE_MIN_VERSION
}

/// Turn off the legacy acceptance of double-quoted string literals on this
/// connection, for both schema (DDL) and data (DML) statements.
///
/// After this call, `"text"` is only ever resolved as an identifier; using it
/// as a value is a parse error. Idempotent, last call wins.
///
/// # Errors
///
/// Returns `CacheError::Sqlite` if the engine rejects the db-config write.
pub fn disable_double_quoted_strings(conn: &Connection) -> Result<(), CacheError> {
    set_double_quoted_strings(conn, false)
}

/// Re-enable the legacy double-quoted string literal mode on this connection,
/// for both statement classes. Idempotent, last call wins.
///
/// # Errors
///
/// Returns `CacheError::Sqlite` if the engine rejects the db-config write.
pub fn enable_double_quoted_strings(conn: &Connection) -> Result<(), CacheError> {
    set_double_quoted_strings(conn, true)
}

fn set_double_quoted_strings(conn: &Connection, enabled: bool) -> Result<(), CacheError> {
    if !dqs_toggle_supported() {
        return Ok(());
    }
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DDL, enabled)?;
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DML, enabled)?;
    Ok(())
}
