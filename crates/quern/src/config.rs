//! Engine settings backed by the store's `config` table.
//!
//! Two keys are recognised; unknown keys are permitted and preserved for
//! operators to stash their own values. Unparseable values fall back to the
//! built-in defaults rather than failing the caller.

use crate::store::Store;

pub const BACKOFF_BASE_KEY: &str = "backoff_base";
pub const DEFAULT_MAX_RETRIES_KEY: &str = "default_max_retries";

pub const DEFAULT_BACKOFF_BASE: i64 = 2;
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Integer multiplicand for exponential retry delay.
pub async fn backoff_base(store: &dyn Store) -> i64 {
    lookup_i64(store, BACKOFF_BASE_KEY, DEFAULT_BACKOFF_BASE)
        .await
        .max(1)
}

/// `max_retries` applied to submissions that do not specify one.
pub async fn default_max_retries(store: &dyn Store) -> i64 {
    lookup_i64(store, DEFAULT_MAX_RETRIES_KEY, DEFAULT_MAX_RETRIES)
        .await
        .max(0)
}

async fn lookup_i64(store: &dyn Store, key: &str, default: i64) -> i64 {
    match store.get_config(key).await {
        Ok(Some(value)) => value.trim().parse().unwrap_or(default),
        Ok(None) => default,
        Err(err) => {
            tracing::warn!(key, error = %err, "config lookup failed, using default");
            default
        }
    }
}
