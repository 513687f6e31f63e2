use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Immutable configuration for one run of the proxy.
///
/// A reconfiguration requires a `stop` followed by a fresh `start` — see
/// [`crate::control::ControlPlane`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub bind_address: IpAddr,
    pub https_port: u16,
    pub official_base_host: String,
    pub mirror_api_base_url: String,
    pub mirror_direct_base_url: String,
    pub inject_supporter: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            https_port: 443,
            #[cfg(debug_assertions)]
            official_base_host: "cmyui.xyz".to_owned(),
            #[cfg(not(debug_assertions))]
            official_base_host: "ppy.sh".to_owned(),
            mirror_api_base_url: "https://api.nerinyan.moe".to_owned(),
            mirror_direct_base_url: "https://api.nerinyan.moe".to_owned(),
            inject_supporter: true,
        }
    }
}

/// Subdomains the proxy answers for, one per official-upstream role.
const SUBDOMAINS: &[&str] = &["osu", "c", "b", "a"];

impl ProxyConfig {
    /// Every `*.<official_base_host>` hostname the proxy terminates TLS for,
    /// plus the `*.localhost` aliases hosts-file manager must also register.
    ///
    /// This is the full alias list the trust anchor puts in the certificate's
    /// `subjectAltName` and the hosts file manager writes into the hosts
    /// block.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases = Vec::with_capacity(SUBDOMAINS.len() * 2 + 1);
        aliases.push("localhost".to_owned());
        for subdomain in SUBDOMAINS {
            aliases.push(format!("{subdomain}.{}", self.official_base_host));
            aliases.push(format!("{subdomain}.localhost"));
        }
        aliases
    }

    pub fn bancho_host(&self) -> String {
        format!("c.{}", self.official_base_host)
    }

    pub fn osu_host(&self) -> String {
        format!("osu.{}", self.official_base_host)
    }

    pub fn beatmap_host(&self) -> String {
        format!("b.{}", self.official_base_host)
    }

    /// True if `host` is some `*.<official_base_host>` name this proxy
    /// recognizes as belonging to the official upstream (i.e. not the
    /// Bancho host, which is routed separately).
    pub fn is_official_suffix(&self, host: &str) -> bool {
        host.ends_with(&format!(".{}", self.official_base_host)) || host == self.official_base_host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_include_minimum_set() {
        let cfg = ProxyConfig {
            official_base_host: "ppy.sh".to_owned(),
            ..Default::default()
        };
        let aliases = cfg.aliases();
        for required in [
            "osu.ppy.sh",
            "c.ppy.sh",
            "b.ppy.sh",
            "a.ppy.sh",
            "osu.localhost",
            "c.localhost",
            "b.localhost",
            "a.localhost",
        ] {
            assert!(
                aliases.iter().any(|a| a == required),
                "missing alias {required}"
            );
        }
    }

    #[test]
    fn is_official_suffix_matches_subdomains_only() {
        let cfg = ProxyConfig {
            official_base_host: "ppy.sh".to_owned(),
            ..Default::default()
        };
        assert!(cfg.is_official_suffix("osu.ppy.sh"));
        assert!(!cfg.is_official_suffix("evil.com"));
        assert!(!cfg.is_official_suffix("notppy.sh"));
    }
}
