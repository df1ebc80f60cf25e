//! `Ini` to `ConfigFile`.

use std::path::PathBuf;
use std::str::FromStr;

use ini::{Ini, Properties};

use super::file::{ConfigFile, ConfigFileError};
use super::size::parse_size;

/// Overlays the values present in `ini` on the defaults.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    if let Some(section) = ini.section(Some("cache")) {
        let values = Section::new("cache", section);
        if let Some(v) = values.non_empty("directory") {
            config.cache.directory = expand_tilde(v);
        }
        if let Some(v) = values.non_empty("version") {
            if v.contains(['/', '\\']) {
                return Err(values.invalid("version", v, "must not contain path separators"));
            }
            config.cache.version = v.to_string();
        }
    }

    if let Some(section) = ini.section(Some("memory")) {
        let values = Section::new("memory", section);
        values.size("decoded_size", &mut config.memory.decoded_size)?;
        values.number("decoded_entries", &mut config.memory.decoded_entries)?;
        values.size("encoded_size", &mut config.memory.encoded_size)?;
        values.number("encoded_entries", &mut config.memory.encoded_entries)?;
        values.size("encoded_max_entry_size", &mut config.memory.encoded_max_entry_size)?;
    }

    if let Some(section) = ini.section(Some("disk")) {
        let values = Section::new("disk", section);
        values.size("max_size", &mut config.disk.max_size)?;
        values.size("low_space_max_size", &mut config.disk.low_space_max_size)?;
        values.size("very_low_space_max_size", &mut config.disk.very_low_space_max_size)?;
        values.size("small_max_size", &mut config.disk.small_max_size)?;
        if let Some(v) = values.get("max_age_days") {
            config.disk.max_age_days = if v.is_empty() {
                None
            } else {
                Some(v.parse().map_err(|_| {
                    values.invalid("max_age_days", v, "must be a whole number of days")
                })?)
            };
        }
        values.flag("populate_at_startup", &mut config.disk.populate_at_startup)?;
    }

    if let Some(section) = ini.section(Some("pipeline")) {
        let values = Section::new("pipeline", section);
        values.threads("network_threads", &mut config.pipeline.network_threads)?;
        values.threads("decode_threads", &mut config.pipeline.decode_threads)?;
        values.threads("storage_read_threads", &mut config.pipeline.storage_read_threads)?;
        values.threads("storage_write_threads", &mut config.pipeline.storage_write_threads)?;
        values.number("network_timeout_secs", &mut config.pipeline.network_timeout_secs)?;
        values.threads("max_thumbnail_requests", &mut config.pipeline.max_thumbnail_requests)?;
        values.flag("resizing_enabled", &mut config.pipeline.resizing_enabled)?;
        values.flag(
            "keep_cancelled_fetch_as_low_priority",
            &mut config.pipeline.keep_cancelled_fetch_as_low_priority,
        )?;
    }

    if let Some(section) = ini.section(Some("logging")) {
        let values = Section::new("logging", section);
        if let Some(v) = values.non_empty("directory") {
            config.logging.directory = expand_tilde(v);
        }
        if let Some(v) = values.non_empty("file") {
            config.logging.file = v.to_string();
        }
    }

    Ok(config)
}

struct Section<'a> {
    name: &'static str,
    properties: &'a Properties,
}

impl<'a> Section<'a> {
    fn new(name: &'static str, properties: &'a Properties) -> Self {
        Self { name, properties }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.properties.get(key).map(str::trim)
    }

    fn non_empty(&self, key: &str) -> Option<&'a str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    fn invalid(&self, key: &str, value: &str, reason: &str) -> ConfigFileError {
        ConfigFileError::InvalidValue {
            section: self.name.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn size(&self, key: &str, target: &mut u64) -> Result<(), ConfigFileError> {
        if let Some(v) = self.non_empty(key) {
            *target = parse_size(v)
                .map_err(|_| self.invalid(key, v, "expected a size like '40MB' or '512KB'"))?;
        }
        Ok(())
    }

    fn number<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), ConfigFileError> {
        if let Some(v) = self.non_empty(key) {
            *target = v
                .parse()
                .map_err(|_| self.invalid(key, v, "must be a non-negative integer"))?;
        }
        Ok(())
    }

    fn threads(&self, key: &str, target: &mut usize) -> Result<(), ConfigFileError> {
        let mut value = *target;
        self.number(key, &mut value)?;
        if value == 0 {
            return Err(self.invalid(key, "0", "must be at least 1"));
        }
        *target = value;
        Ok(())
    }

    fn flag(&self, key: &str, target: &mut bool) -> Result<(), ConfigFileError> {
        if let Some(v) = self.non_empty(key) {
            *target = match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => return Err(self.invalid(key, v, "must be true or false")),
            };
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ConfigFile, ConfigFileError> {
        parse_ini(&Ini::load_from_str(text).unwrap())
    }

    #[test]
    fn test_empty_file_is_defaults() {
        assert_eq!(parse("").unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_sizes_and_flags() {
        let config = parse(
            "[memory]\ndecoded_size = 64MB\nencoded_entries = 100\n\
             [disk]\nmax_size = 150KB\nmax_age_days = 3\npopulate_at_startup = yes\n\
             [pipeline]\nresizing_enabled = off\nnetwork_threads = 8\n",
        )
        .unwrap();
        assert_eq!(config.memory.decoded_size, 64 * 1024 * 1024);
        assert_eq!(config.memory.encoded_entries, 100);
        assert_eq!(config.disk.max_size, 150 * 1024);
        assert_eq!(config.disk.max_age_days, Some(3));
        assert!(config.disk.populate_at_startup);
        assert!(!config.pipeline.resizing_enabled);
        assert_eq!(config.pipeline.network_threads, 8);
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = parse("[disk]\nmax_size = lots\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::InvalidValue { ref section, ref key, .. }
                if section == "disk" && key == "max_size"
        ));
        assert!(parse("[pipeline]\ndecode_threads = 0\n").is_err());
        assert!(parse("[pipeline]\nresizing_enabled = maybe\n").is_err());
        assert!(parse("[cache]\nversion = a/b\n").is_err());
    }

    #[test]
    fn test_tilde_expands_to_home() {
        let config = parse("[cache]\ndirectory = ~/pics\n").unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.cache.directory, home.join("pics"));
        }
    }
}
