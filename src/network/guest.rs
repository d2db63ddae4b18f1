//! Guest-side network configuration files.
//!
//! Files are rendered on the host and written straight into the guest
//! image while it is loop-mounted (see [`crate::vmm::disk`]), so guests need
//! no agent or cloud-init to learn their static addresses.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use super::{bridge_address, fleet_subnet, GuestAddresses};
use crate::{Error, Result};

const WIRED_TEMPLATE: &str = "[Match]
Name=enp0s@COUNT@

[Network]
Address=@ADDR@/@PREFIX@
Gateway=@GATEWAY@
DNS=8.8.8.8
";

const IB_TEMPLATE: &str = "[Match]
Name=ib@COUNT@

[Network]
Address=@ADDR@/@PREFIX@
";

const DHCP_TEMPLATE: &str = "[Match]
Name=enp0s@COUNT@

[Network]
DHCP=yes
";

const HOSTS_TEMPLATE: &str = "127.0.0.1 localhost
::1 localhost ip6-localhost ip6-loopback
@ADDR@ cxl-vm
";

/// Prefer IPv4 results from getaddrinfo.
const GAI_CONF: &str = "precedence ::ffff:0:0/96  100
";

/// Template file names looked up in a template directory.
const WIRED_FILE: &str = "20-wired-template.network";
const DHCP_FILE: &str = "30-wired-template.network";
const IB_FILE: &str = "40-wired-template.network";
const HOSTS_FILE: &str = "etc_hosts_template";
const GAI_FILE: &str = "gai.conf";

/// Guest directory a rendered file is installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestDir {
    /// `/etc/systemd/network`
    Network,
    /// `/etc`
    Etc,
}

impl GuestDir {
    pub fn relative(&self) -> &'static str {
        match self {
            GuestDir::Network => "etc/systemd/network",
            GuestDir::Etc => "etc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFile {
    pub name: String,
    pub dir: GuestDir,
    pub contents: String,
}

/// Templates for the injected files. Placeholders are `@ADDR@`, `@COUNT@`,
/// `@PREFIX@` and `@GATEWAY@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestTemplates {
    pub wired: String,
    pub dhcp: String,
    pub ib: String,
    pub hosts: String,
    pub gai: String,
}

impl Default for GuestTemplates {
    fn default() -> Self {
        Self {
            wired: WIRED_TEMPLATE.to_string(),
            dhcp: DHCP_TEMPLATE.to_string(),
            ib: IB_TEMPLATE.to_string(),
            hosts: HOSTS_TEMPLATE.to_string(),
            gai: GAI_CONF.to_string(),
        }
    }
}

impl GuestTemplates {
    /// Built-in templates, with any file present in `dir` taking precedence.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut templates = Self::default();
        let Some(dir) = dir else {
            return Ok(templates);
        };
        let slots: [(&str, &mut String); 5] = [
            (WIRED_FILE, &mut templates.wired),
            (DHCP_FILE, &mut templates.dhcp),
            (IB_FILE, &mut templates.ib),
            (HOSTS_FILE, &mut templates.hosts),
            (GAI_FILE, &mut templates.gai),
        ];
        for (name, slot) in slots {
            let path = dir.join(name);
            if path.exists() {
                *slot = fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("failed reading template {}: {e}", path.display()))
                })?;
            }
        }
        Ok(templates)
    }
}

fn fill(template: &str, addr: Option<Ipv4Addr>, count: usize) -> String {
    let net = fleet_subnet();
    let mut out = template
        .replace("@COUNT@", &count.to_string())
        .replace("@PREFIX@", &net.prefix_len().to_string())
        .replace("@GATEWAY@", &bridge_address().to_string());
    if let Some(addr) = addr {
        out = out.replace("@ADDR@", &addr.to_string());
    }
    out
}

/// Render every file injected into one guest.
///
/// Ethernet NIC `i` gets `<20+10*i>-wired.network`, InfiniBand NIC `i` gets
/// `<40+i>-wired.network`, and the optional user-mode SSH NIC a DHCP file
/// numbered after the Ethernet files.
pub fn render_guest_files(
    templates: &GuestTemplates,
    addrs: &GuestAddresses,
    user_ssh: bool,
) -> Result<Vec<GuestFile>> {
    let Some(last) = addrs.last() else {
        return Err(Error::Config("guest has no statically addressed NIC".into()));
    };

    let mut files = Vec::new();
    for (i, addr) in addrs.ether.iter().enumerate() {
        files.push(GuestFile {
            name: format!("{}-wired.network", 20 + 10 * i),
            dir: GuestDir::Network,
            contents: fill(&templates.wired, Some(*addr), 4 + i),
        });
    }
    for (i, addr) in addrs.ib.iter().enumerate() {
        files.push(GuestFile {
            name: format!("{}-wired.network", 40 + i),
            dir: GuestDir::Network,
            contents: fill(&templates.ib, Some(*addr), i),
        });
    }
    if user_ssh {
        let nics = addrs.ether.len() + addrs.ib.len();
        files.push(GuestFile {
            name: format!("{}-wired.network", 20 + 10 * addrs.ether.len()),
            dir: GuestDir::Network,
            contents: fill(&templates.dhcp, None, 4 + nics),
        });
    }
    files.push(GuestFile {
        name: "hosts".into(),
        dir: GuestDir::Etc,
        contents: fill(&templates.hosts, Some(last), 0),
    });
    files.push(GuestFile {
        name: "gai.conf".into(),
        dir: GuestDir::Etc,
        contents: templates.gai.clone(),
    });
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> GuestAddresses {
        GuestAddresses {
            ether: vec![Ipv4Addr::new(192, 168, 100, 4)],
            ib: vec![Ipv4Addr::new(192, 168, 100, 5)],
        }
    }

    #[test]
    fn test_render_names_and_addresses() {
        let files = render_guest_files(&GuestTemplates::default(), &addrs(), true).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "20-wired.network",
                "40-wired.network",
                "30-wired.network",
                "hosts",
                "gai.conf"
            ]
        );
        assert!(files[0].contents.contains("Address=192.168.100.4/24"));
        assert!(files[0].contents.contains("Gateway=192.168.100.1"));
        assert!(files[0].contents.contains("Name=enp0s4"));
        assert!(files[1].contents.contains("Address=192.168.100.5/24"));
        assert!(files[1].contents.contains("Name=ib0"));
        assert!(files[2].contents.contains("DHCP=yes"));
        assert!(files[2].contents.contains("Name=enp0s6"));
        assert_eq!(files[3].dir, GuestDir::Etc);
        assert!(files[3].contents.contains("192.168.100.5 cxl-vm"));
    }

    #[test]
    fn test_template_dir_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(HOSTS_FILE), "@ADDR@ node\n").unwrap();
        let templates = GuestTemplates::load(Some(dir.path())).unwrap();
        assert_eq!(templates.wired, WIRED_TEMPLATE);
        let only_ether = GuestAddresses {
            ether: vec![Ipv4Addr::new(192, 168, 100, 2)],
            ib: Vec::new(),
        };
        let files = render_guest_files(&templates, &only_ether, false).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[1].contents, "192.168.100.2 node\n");
    }

    #[test]
    fn test_render_without_addresses_fails() {
        let err = render_guest_files(&GuestTemplates::default(), &GuestAddresses::default(), false)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
