//! Default values for configuration

/// Default maximum `_changes` rows per replication batch
pub fn default_change_limit_per_batch() -> usize {
    1000
}

/// Default sub-batch fan-out for bulk-get and force-insert
pub fn default_insert_batch_size() -> usize {
    100
}

/// Default remote request timeout in seconds
pub fn default_request_timeout_secs() -> u64 {
    60
}

/// Default number of times to replay a 429 response
pub fn default_number_of_replays() -> u32 {
    3
}

/// Default initial 429 backoff in milliseconds
pub fn default_initial_backoff_ms() -> u64 {
    250
}

/// Default: honour Retry-After headers from the server
pub fn default_prefer_retry_after() -> bool {
    true
}
