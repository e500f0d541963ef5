use std::thread::available_parallelism;

use tracing::warn;

/// Name of this machine; empty when it can not be determined.
pub fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "hostname unavailable");
            String::new()
        }
    }
}

/// Logical CPUs available to this process, at least 1.
pub fn cpu_count() -> usize {
    available_parallelism().map(|n| n.get()).unwrap_or(1)
}
