//! Typed handling of the hypervisor's `key=value,key=value` option strings.
//!
//! Disk and NIC settings come back as strings such as
//! `local:1001/vm-1001-disk-0.raw,size=8G` where the leading item may be a
//! bare value without a key.

use cloud_core::{CloudError, Result};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigString {
    entries: Vec<(Option<String>, String)>,
}

impl ConfigString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CloudError::Unavailable("empty option string".to_string()));
        }

        let mut entries = Vec::new();
        for item in text.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(CloudError::Unavailable(format!(
                            "malformed option `{item}` in `{text}`"
                        )));
                    }
                    entries.push((Some(key.to_string()), value.trim().to_string()));
                }
                None => entries.push((None, item.to_string())),
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_deref() == Some(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| CloudError::Unavailable(format!("option `{key}` missing in `{self}`")))
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.as_deref() == Some(key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((Some(key.to_string()), value)),
        }
    }

    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.set(key, value.to_string());
        self
    }
}

impl fmt::Display for ConfigString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match key {
                Some(key) => write!(f, "{key}={value}")?,
                None => f.write_str(value)?,
            }
        }
        Ok(())
    }
}

/// Parse a disk size such as `30G`, `512M` or `1T` into whole gigabytes.
pub fn parse_size_gb(size: &str) -> Result<u64> {
    let size = size.trim();
    let malformed = || CloudError::Unavailable(format!("malformed disk size `{size}`"));

    let split = size
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(size.len());
    let (number, unit) = size.split_at(split);
    let number: u64 = number.parse().map_err(|_| malformed())?;

    match unit.to_ascii_uppercase().as_str() {
        "T" => number.checked_mul(1024).ok_or_else(malformed),
        "G" | "" => Ok(number),
        "M" => Ok(number / 1024),
        "K" => Ok(number / (1024 * 1024)),
        _ => Err(malformed()),
    }
}

/// Disk size of a guest config's root disk entry, in GB.
pub fn disk_size_gb(disk_entry: &str) -> Result<u64> {
    let parsed = ConfigString::parse(disk_entry)?;
    parse_size_gb(parsed.require("size")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_disk_string() {
        let disk = ConfigString::parse("local:1001/vm-1001-disk-0.raw,size=8G").unwrap();
        assert_eq!(disk.to_string(), "local:1001/vm-1001-disk-0.raw,size=8G");
        assert_eq!(disk.get("size"), Some("8G"));
        assert_eq!(disk.get("backup"), None);
    }

    #[test]
    fn test_build_preserves_order() {
        let nic = ConfigString::new()
            .with("name", "eth0")
            .with("bridge", "vmbr0")
            .with("tag", 40)
            .with("rate", "12.5");
        assert_eq!(nic.to_string(), "name=eth0,bridge=vmbr0,tag=40,rate=12.5");
    }

    #[test]
    fn test_set_replaces_existing() {
        let mut nic = ConfigString::parse("virtio=02:00:00:00:00:01,bridge=vmbr0").unwrap();
        nic.set("bridge", "vmbr1");
        assert_eq!(nic.to_string(), "virtio=02:00:00:00:00:01,bridge=vmbr1");
    }

    #[test]
    fn test_malformed_strings_are_unavailable() {
        assert!(matches!(ConfigString::parse(""), Err(CloudError::Unavailable(_))));
        assert!(matches!(ConfigString::parse("=x"), Err(CloudError::Unavailable(_))));
        assert!(matches!(disk_size_gb("local:vm-1"), Err(CloudError::Unavailable(_))));
    }

    #[test]
    fn test_sizes() {
        assert_eq!(parse_size_gb("30G").unwrap(), 30);
        assert_eq!(parse_size_gb("2T").unwrap(), 2048);
        assert_eq!(parse_size_gb("2048M").unwrap(), 2);
        assert!(parse_size_gb("lots").is_err());
        assert!(matches!(
            parse_size_gb(&format!("{}T", u64::MAX)),
            Err(CloudError::Unavailable(_))
        ));
        assert_eq!(disk_size_gb("local:vm-1,size=20G").unwrap(), 20);
    }
}
