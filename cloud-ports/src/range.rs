use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive range of external ports tenants may forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn parse(range_str: &str) -> Result<Self> {
        let (start, end) = range_str.trim().split_once('-').ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid port range format: {} (expected START-END, e.g. 16384-32767)",
                range_str
            )
        })?;

        let start: u16 = start
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid start port: {}", start))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid end port: {}", end))?;

        Self::new(start, end)
    }

    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            anyhow::bail!("Invalid range: port 0 cannot be forwarded");
        }
        if start >= end {
            anyhow::bail!(
                "Invalid range: start ({}) must be less than end ({})",
                start,
                end
            );
        }
        Ok(PortRange { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn size(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl TryFrom<String> for PortRange {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PortRange> for String {
    fn from(value: PortRange) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_range() {
        let range = PortRange::parse("16384-32767").unwrap();
        assert_eq!(range.start, 16384);
        assert_eq!(range.end, 32767);
        assert_eq!(range.size(), 16384);
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(PortRange::parse("16384").is_err());
        assert!(PortRange::parse("1-2-3").is_err());
        assert!(PortRange::parse("invalid-range").is_err());
        assert!(PortRange::parse("0-100").is_err());
    }

    #[test]
    fn test_parse_invalid_range() {
        assert!(PortRange::parse("3009-3000").is_err());
        assert!(PortRange::parse("3000-3000").is_err());
    }

    #[test]
    fn test_contains_is_inclusive() {
        let range = PortRange::new(20000, 20010).unwrap();
        assert!(range.contains(20000));
        assert!(range.contains(20010));
        assert!(!range.contains(19999));
        assert!(!range.contains(20011));
        assert_eq!(range.ports().count(), 11);
    }

    #[test]
    fn test_serde_as_string() {
        let range: PortRange = serde_json::from_str("\"20000-20010\"").unwrap();
        assert_eq!(range, PortRange::new(20000, 20010).unwrap());
        assert_eq!(serde_json::to_string(&range).unwrap(), "\"20000-20010\"");
    }
}
