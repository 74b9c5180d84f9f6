//! Files pushed into guests: cloud-init documents, sshd config and banner.

use cloud_core::{CloudError, Result};
use cloud_provider::NicAllocation;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use tera::{Context, Tera};

pub const BANNER_PATH: &str = "/etc/banner";
pub const SSHD_CONFIG_PATH: &str = "/etc/ssh/sshd_config";
pub const AUTHORIZED_KEYS_PATH: &str = "/root/.ssh/authorized_keys";

const KEYS_BEGIN: &str = "# --- BEGIN PVE ---";
const KEYS_END: &str = "# --- END PVE ---";

static GUEST_TERA: OnceLock<Tera> = OnceLock::new();

fn guest_tera() -> &'static Tera {
    GUEST_TERA.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            ("userdata.yml", include_str!("templates/userdata.yml")),
            ("networkconfig.yml", include_str!("templates/networkconfig.yml")),
            ("sshd_config", include_str!("templates/sshd_config")),
            ("banner", include_str!("templates/banner")),
        ])
        .expect("Failed to add guest templates");
        tera
    })
}

fn render(name: &str, context: &Context) -> Result<String> {
    guest_tera()
        .render(name, context)
        .map_err(|e| CloudError::Unavailable(format!("failed to render {name}: {e}")))
}

/// cloud-init user-data. With `clear_state` the guest wipes its cloud-init
/// state and powers off so the next boot applies everything from scratch.
pub fn render_userdata(fqdn: &str, clear_state: bool) -> Result<String> {
    let mut context = Context::new();
    context.insert("fqdn", fqdn);
    context.insert("clear_state", &clear_state);
    render("userdata.yml", &context)
}

/// netplan v2 network config matching the NIC by MAC address.
pub fn render_network_config(nic: &NicAllocation, nameservers: &[Ipv4Addr]) -> Result<String> {
    let addresses: Vec<String> = nic.addresses.iter().map(|a| a.to_string()).collect();
    let nameservers: Vec<String> = nameservers.iter().map(|ns| ns.to_string()).collect();

    let mut context = Context::new();
    context.insert("macaddress", &nic.macaddress);
    context.insert("gateway4", &nic.gateway4.to_string());
    context.insert("addresses", &addresses);
    context.insert("nameservers", &nameservers);
    render("networkconfig.yml", &context)
}

pub fn render_sshd_config() -> Result<String> {
    let mut context = Context::new();
    context.insert("banner_path", BANNER_PATH);
    render("sshd_config", &context)
}

pub fn render_banner(fqdn: &str, owner: &str) -> Result<String> {
    let mut context = Context::new();
    context.insert("fqdn", fqdn);
    context.insert("owner", owner);
    render("banner", &context)
}

/// authorized_keys body with the managed block markers.
pub fn authorized_keys(public_key: &str) -> String {
    format!("{KEYS_BEGIN}\n{}\n{KEYS_END}\n", public_key.trim())
}

/// Drop every character outside Latin-1; the guest agent file-write rejects them.
pub fn latin1_only(text: &str) -> String {
    text.chars().filter(|c| (*c as u32) <= 0xff).collect()
}
