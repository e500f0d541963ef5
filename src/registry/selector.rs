use rand::seq::SliceRandom;
use rand::Rng;

use crate::ServerRecord;

/// Uniformly picks one `(host, port)` among the servers that publish an
/// http endpoint.
pub fn select_http_endpoint<R: Rng + ?Sized>(
    servers: &[ServerRecord],
    rng: &mut R,
) -> Option<(String, String)> {
    let candidates: Vec<(String, String)> =
        servers.iter().filter_map(|s| s.metadata.http_endpoint()).collect();
    candidates.choose(rng).cloned()
}
