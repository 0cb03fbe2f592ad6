//! Derivation of physical SQL identifiers from logical names.
//!
//! PostgreSQL truncates identifiers beyond 63 bytes, and logical names may
//! contain anything, so every physical name is a mangled, truncated form of
//! the logical name plus an FNV-1a hash suffix that keeps distinct inputs
//! distinct. Collisions within a database bump the hash seed until unique.

/// Hard identifier limit of the backend.
const MAX_IDENTIFIER_LEN: usize = 63;

/// `_<8 hex digits>` appended to every derived name.
const HASH_SUFFIX_LEN: usize = 9;

/// Prefix reserved for backend-internal tables.
pub(crate) const RESERVED_PREFIX: &str = "_ferretdb_";

/// The per-database metadata table.
pub const METADATA_TABLE: &str = "_ferretdb_database_metadata";

/// The default unique index on `_id`, present on every collection.
pub const DEFAULT_INDEX: &str = "_id_";

/// 32-bit FNV-1a over the name; the seed shifts the offset basis so collisions
/// can be re-rolled deterministically.
fn fnv1a(name: &str, seed: u32) -> u32 {
    let mut hash = 2_166_136_261u32.wrapping_add(seed);
    for b in name.bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Lowercases the name and replaces every character outside `[a-z][a-z0-9_]*`
/// with `_`.
fn mangle(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for (i, c) in lowered.chars().enumerate() {
        let ok = if i == 0 {
            c.is_ascii_lowercase()
        } else {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'
        };
        out.push(if ok { c } else { '_' });
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Derives the table name for a collection. Stable for the same inputs, never
/// longer than 63 bytes, never within the reserved prefix.
pub(crate) fn table_name(collection: &str, seed: u32) -> String {
    let mut base = mangle(collection);
    if base.starts_with(RESERVED_PREFIX) {
        base.insert(0, '_');
    }
    base.truncate(MAX_IDENTIFIER_LEN - HASH_SUFFIX_LEN);
    format!("{}_{:08x}", base, fnv1a(collection, seed))
}

/// Derives the backend index name for a collection index:
/// `<tablepart>_<indexpart>_<hex>_idx`, capped at 63 bytes.
pub(crate) fn pg_index_name(collection: &str, index: &str, seed: u32) -> String {
    // "_idx" plus two separators plus the hash.
    let budget = MAX_IDENTIFIER_LEN - HASH_SUFFIX_LEN - 4 - 1;

    let mut table_part = mangle(collection);
    table_part.truncate(budget / 2);
    let mut index_part = mangle(index);
    index_part.truncate(budget - table_part.len() - 1);

    let hash = fnv1a(&format!("{}.{}", collection, index), seed);
    format!("{}_{}_{:08x}_idx", table_part, index_part, hash)
}
