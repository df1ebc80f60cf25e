//! `ConfigFile` to a commented INI string.

use std::path::Path;

use super::file::ConfigFile;
use super::size::format_size;

pub(super) fn to_config_string(config: &ConfigFile) -> String {
    let max_age_days = config
        .disk
        .max_age_days
        .map(|d| d.to_string())
        .unwrap_or_default();

    format!(
        r#"[cache]
; Directory holding the main and small disk caches
directory = {}
; Layout version; entries written under another version are removed
version = {}

[memory]
; Decoded image cache limits
decoded_size = {}
decoded_entries = {}
; Encoded bytes cache limits
encoded_size = {}
encoded_entries = {}
encoded_max_entry_size = {}

[disk]
; Main disk cache limit, and the limits used when free space runs low
max_size = {}
low_space_max_size = {}
very_low_space_max_size = {}
; Disk cache for requests marked as small images
small_max_size = {}
; Entries not accessed for this many days are pruned (empty = never)
max_age_days = {}
; Scan the cache directory at startup instead of on first use
populate_at_startup = {}

[pipeline]
network_threads = {}
decode_threads = {}
storage_read_threads = {}
storage_write_threads = {}
network_timeout_secs = {}
; Concurrent local thumbnail lookups
max_thumbnail_requests = {}
resizing_enabled = {}
; Opt in: let a fetch whose requests were all cancelled finish at low priority
keep_cancelled_fetch_as_low_priority = {}

[logging]
directory = {}
file = {}
"#,
        path_to_string(&config.cache.directory),
        config.cache.version,
        format_size(config.memory.decoded_size),
        config.memory.decoded_entries,
        format_size(config.memory.encoded_size),
        config.memory.encoded_entries,
        format_size(config.memory.encoded_max_entry_size),
        format_size(config.disk.max_size),
        format_size(config.disk.low_space_max_size),
        format_size(config.disk.very_low_space_max_size),
        format_size(config.disk.small_max_size),
        max_age_days,
        config.disk.populate_at_startup,
        config.pipeline.network_threads,
        config.pipeline.decode_threads,
        config.pipeline.storage_read_threads,
        config.pipeline.storage_write_threads,
        config.pipeline.network_timeout_secs,
        config.pipeline.max_thumbnail_requests,
        config.pipeline.resizing_enabled,
        config.pipeline.keep_cancelled_fetch_as_low_priority,
        path_to_string(&config.logging.directory),
        config.logging.file,
    )
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
