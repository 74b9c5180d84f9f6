//! Template disk artifacts on node storage.
//!
//! A template's disk image lives at
//! `<storage>/template-disks/<template id>.<format>` on the node the instance
//! is cloned on. It is verified with `sha256sum` and, when missing or
//! corrupt, fetched into a sibling `.download` file that is moved into place
//! only after it verifies.

use cloud_core::{shell_quote, CloudError, RemoteShell, Result};
use cloud_provider::Template;
use tracing::{info, warn};

pub const TEMPLATE_DISK_DIR: &str = "template-disks";

pub fn template_disk_path(storage_path: &str, template: &Template) -> String {
    format!(
        "{}/{}/{}.{}",
        storage_path.trim_end_matches('/'),
        TEMPLATE_DISK_DIR,
        template.template_id,
        template.metadata.disk_format.extension()
    )
}

async fn checksum_matches(
    shell: &dyn RemoteShell,
    node: &str,
    path: &str,
    expected: &str,
) -> Result<bool> {
    let output = shell
        .exec(node, &format!("sha256sum {}", shell_quote(path)))
        .await?;
    if !output.success() {
        return Ok(false);
    }
    Ok(output
        .stdout
        .split_whitespace()
        .next()
        .is_some_and(|sum| sum.eq_ignore_ascii_case(expected.trim())))
}

/// Make sure the template's disk image is present and intact on `node`.
/// Returns the artifact path.
pub async fn ensure_template_disk(
    shell: &dyn RemoteShell,
    node: &str,
    storage_path: &str,
    template: &Template,
) -> Result<String> {
    let path = template_disk_path(storage_path, template);
    let expected = &template.metadata.disk_sha256sum;

    if checksum_matches(shell, node, &path, expected).await? {
        return Ok(path);
    }
    info!(node, path = %path, "template disk missing or corrupt, downloading");

    let dir = format!("{}/{}", storage_path.trim_end_matches('/'), TEMPLATE_DISK_DIR);
    shell
        .exec(node, &format!("mkdir -p {}", shell_quote(&dir)))
        .await?
        .check("creating template disk directory")?;

    let download = format!("{path}.download");
    let urls = std::iter::once(&template.metadata.disk_url)
        .chain(template.metadata.disk_fallback_url.as_ref());

    for url in urls {
        let fetched = shell
            .exec(
                node,
                &format!("wget -q -O {} {}", shell_quote(&download), shell_quote(url)),
            )
            .await?;
        if !fetched.success() {
            warn!(node, url = %url, error = %fetched.describe(), "template disk download failed");
            continue;
        }

        if checksum_matches(shell, node, &download, expected).await? {
            shell
                .exec(
                    node,
                    &format!("mv -f {} {}", shell_quote(&download), shell_quote(&path)),
                )
                .await?
                .check("moving template disk into place")?;
            info!(node, path = %path, "template disk ready");
            return Ok(path);
        }
        warn!(node, url = %url, "downloaded template disk failed checksum verification");
    }

    match shell
        .exec(node, &format!("rm -f {}", shell_quote(&download)))
        .await
    {
        Ok(removed) if !removed.success() => {
            warn!(node, error = %removed.describe(), "could not remove partial template disk download");
        }
        Err(err) => warn!(node, error = %err, "could not remove partial template disk download"),
        Ok(_) => {}
    }
    Err(CloudError::Unavailable(format!(
        "template disk for {} could not be downloaded with checksum {}",
        template.template_id, expected
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_provider::mock::RecordingShell;
    use cloud_provider::{DiskFormat, InstanceKind, Specs, TemplateMetadata};

    const SUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn template(fallback: Option<&str>) -> Template {
        Template {
            kind: InstanceKind::Vps,
            node: "pve1".into(),
            id: 900,
            fqdn: "debian12.vps.template.example.org".into(),
            template_id: "debian12".into(),
            specs: Specs {
                cores: 1,
                memory: 1024,
                disk_space: 10,
                swap: 0,
            },
            metadata: TemplateMetadata {
                title: "Debian 12".into(),
                subtitle: String::new(),
                description: String::new(),
                logo_url: String::new(),
                disk_url: "https://images.example.org/debian12.qcow2".into(),
                disk_fallback_url: fallback.map(str::to_string),
                disk_sha256sum: SUM.into(),
                disk_format: DiskFormat::Qcow2,
            },
        }
    }

    const PATH: &str = "/var/lib/vz/template-disks/debian12.qcow2";

    #[tokio::test]
    async fn test_present_disk_is_left_alone() {
        let shell = RecordingShell::new();
        shell.respond(&format!("sha256sum {PATH}"), 0, &format!("{SUM}  {PATH}\n"), "");

        let path = ensure_template_disk(&shell, "pve1", "/var/lib/vz", &template(None))
            .await
            .unwrap();
        assert_eq!(path, PATH);
        assert_eq!(shell.command_lines().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_disk_is_downloaded_and_moved() {
        let shell = RecordingShell::new();
        shell.respond(&format!("sha256sum {PATH}.download"), 0, SUM, "");
        shell.respond(&format!("sha256sum {PATH}"), 1, "", "No such file or directory");

        ensure_template_disk(&shell, "pve1", "/var/lib/vz/", &template(None))
            .await
            .unwrap();

        let lines = shell.command_lines();
        assert!(lines.iter().any(|l| l.starts_with("wget -q -O ") && l.contains("images.example.org")));
        assert_eq!(lines.last().unwrap(), &format!("mv -f {PATH}.download {PATH}"));
    }

    #[tokio::test]
    async fn test_fallback_url_used_after_bad_download() {
        let shell = RecordingShell::new();
        shell.respond("mirror.example.net", 1, "", "404 Not Found");
        shell.respond("sha256sum", 0, "0000  x", "");

        let err = ensure_template_disk(
            &shell,
            "pve1",
            "/var/lib/vz",
            &template(Some("https://mirror.example.net/debian12.qcow2")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CloudError::Unavailable(_)));

        let lines = shell.command_lines();
        assert_eq!(lines.iter().filter(|l| l.starts_with("wget")).count(), 2);
        assert!(!lines.iter().any(|l| l.starts_with("mv -f")));
        assert_eq!(lines.last().unwrap(), &format!("rm -f {PATH}.download"));
    }

    #[tokio::test]
    async fn test_failed_cleanup_keeps_download_error() {
        let shell = RecordingShell::new();
        shell.respond("sha256sum", 0, "0000  x", "");
        shell.respond("rm -f", 1, "", "rm: cannot remove: Permission denied");

        let err = ensure_template_disk(&shell, "pve1", "/var/lib/vz", &template(None))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Unavailable(_)));
        assert!(err.reason().contains("could not be downloaded"));
        assert_eq!(shell.command_lines().last().unwrap(), &format!("rm -f {PATH}.download"));
    }
}
