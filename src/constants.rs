// -
// Store key layout (after namespace stripping)

/// `/servers/{type}/{id}` -> JSON server record
pub(crate) const SERVERS_PREFIX: &str = "/servers";

/// `/certs/private/{type}/{keyName}` -> raw or base64 key bytes
pub(crate) const PRIVATE_KEYS_PREFIX: &str = "/certs/private";

/// `/certs/public/{type}/{keyName}` -> raw key bytes
pub(crate) const PUBLIC_KEYS_PREFIX: &str = "/certs/public";

/// Lease id value meaning "no lease bound"
pub(crate) const NO_LEASE: i64 = 0;

/// Watch callback operation labels
pub(crate) const OP_PUT: &str = "put";
pub(crate) const OP_DELETE: &str = "delete";

/// Capacity of backend -> dispatcher channels
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 256;
pub(crate) const KEEPALIVE_CHANNEL_CAPACITY: usize = 16;
