//! Metadata codec.
//!
//! Instance and template records live in the hypervisor's free-text
//! description field as YAML. Encoding goes through ordered maps and sets, so
//! the same record always produces the same text. A blank description means
//! the guest is not managed by the orchestrator; anything else that fails to
//! parse is reported as malformed.

use cloud_core::{CloudError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{Metadata, TemplateMetadata};

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml_ng::to_string(value)
        .map_err(|e| CloudError::Unavailable(format!("cannot serialize metadata: {e}")))
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    if text.trim().is_empty() {
        return Err(CloudError::NotFound(
            "guest has no metadata, not managed by the orchestrator".to_string(),
        ));
    }
    serde_yaml_ng::from_str(text)
        .map_err(|e| CloudError::Unavailable(format!("malformed metadata: {e}")))
}

pub fn encode_metadata(metadata: &Metadata) -> Result<String> {
    encode(metadata)
}

pub fn decode_metadata(text: &str) -> Result<Metadata> {
    decode(text)
}

pub fn encode_template_metadata(metadata: &TemplateMetadata) -> Result<String> {
    encode(metadata)
}

pub fn decode_template_metadata(text: &str) -> Result<TemplateMetadata> {
    decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_is_not_managed() {
        assert!(matches!(decode_metadata("  \n"), Err(CloudError::NotFound(_))));
    }

    #[test]
    fn test_garbage_is_malformed() {
        match decode_metadata("owner: [unterminated") {
            Err(CloudError::Unavailable(reason)) => assert!(reason.starts_with("malformed metadata")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        assert!(matches!(
            decode_metadata("owner: alice\n"),
            Err(CloudError::Unavailable(_))
        ));
    }

    #[test]
    fn test_template_metadata_decodes() {
        let text = "title: Ubuntu 24.04\n\
                    disk_url: https://images.example.org/noble.qcow2\n\
                    disk_sha256sum: abc123\n\
                    disk_format: qcow2\n";
        let meta = decode_template_metadata(text).unwrap();
        assert_eq!(meta.title, "Ubuntu 24.04");
        assert_eq!(meta.disk_format, crate::models::DiskFormat::Qcow2);
        assert!(meta.disk_fallback_url.is_none());
    }
}
