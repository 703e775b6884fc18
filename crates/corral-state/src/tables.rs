//! redb table definitions for the corral state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Containers are keyed by their unique name, everything else by
//! its owning app or pool.

use redb::TableDefinition;

/// Container records keyed by container name.
pub const CONTAINERS: TableDefinition<&str, &[u8]> = TableDefinition::new("containers");

/// Image records keyed by app name.
pub const IMAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("images");

/// Healing events keyed by event id.
pub const HEALING_EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("healing_events");

/// Autoscale rules keyed by pool name (empty key is the default rule).
pub const AUTOSCALE_RULES: TableDefinition<&str, &[u8]> = TableDefinition::new("autoscale_rules");

/// Last autoscale event per pool; doubles as the exclusive run guard.
pub const AUTOSCALE_EVENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("autoscale_events");
