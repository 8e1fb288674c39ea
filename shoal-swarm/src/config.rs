use std::time::Duration;

use shoal_storage::DEFAULT_CHUNK_SIZE;

/// Tunables for one download's swarm.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sub-range request size; pieces split into runs of this many bytes.
    pub chunk_size: usize,

    /// How long a connection may deliver nothing before the surrounding
    /// application should consider it snubbed.
    pub snub_timeout: Duration,

    /// Ask the picker to deprioritize a piece an address corrupted.
    pub retaliate_on_bad_data: bool,

    /// Ceiling on in-flight requests per connection.
    pub max_backlog: usize,

    /// Sliding window for per-connection throughput measurement.
    pub rate_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            snub_timeout: Duration::from_secs(30),
            retaliate_on_bad_data: true,
            max_backlog: 50,
            rate_window: Duration::from_secs(20),
        }
    }
}
