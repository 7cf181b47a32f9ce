//! Deterministic cache keys.
//!
//! A key is `{table}_{operation}_{params}` where `params` is the JSON
//! encoding of the query parameters. Parameters are converted to a
//! `serde_json::Value` first, whose object keys are ordered, so two equal
//! parameter sets always encode identically regardless of the map type or
//! field order they came from.

use serde::Serialize;
use serde_json::Value;

/// Build the cache key for one query.
pub fn generate_key<P: Serialize + ?Sized>(table: &str, operation: &str, params: &P) -> String {
    let params = serde_json::to_value(params).unwrap_or(Value::Null);
    format!("{}_{}_{}", table, operation, params)
}

/// True when `key` was produced by [`generate_key`] for `table`.
///
/// The key must start with `{table}_` and continue with a non-empty
/// operation name and valid JSON parameters. Operation names may contain
/// `_`, so every split point is tried. A key of `tour_stops` also belongs to
/// `tour`, since `stops_getAll` is a valid operation name there.
pub fn key_belongs_to(key: &str, table: &str) -> bool {
    let Some(rest) = key.strip_prefix(table).and_then(|r| r.strip_prefix('_')) else {
        return false;
    };
    rest.match_indices('_')
        .any(|(at, _)| at > 0 && serde_json::from_str::<Value>(&rest[at + 1..]).is_ok())
}
