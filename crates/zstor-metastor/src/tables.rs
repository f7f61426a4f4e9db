//! Redb table definitions

use redb::TableDefinition;

// Key: raw object key, Value: bincode-encoded Metadata
pub const METADATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("metadata");
