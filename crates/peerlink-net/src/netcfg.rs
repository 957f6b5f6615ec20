//! OS network configuration for the virtual interface
//!
//! Assigns the virtual address, installs routes and firewall rules keyed
//! by the adapter alias, and tears them down again. Which route shape
//! was installed is remembered in [`RouteApproach`] so reset undoes
//! exactly what configure did. Command argument vectors are produced by
//! pure builder functions; only `run` touches the OS.

use std::net::Ipv4Addr;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::{NetError, NetResult};

/// Virtual network in CIDR notation
pub const SUBNET_CIDR: &str = "10.0.0.0/24";

/// Netmask of the virtual network
pub const NETMASK: &str = "255.255.255.0";

/// Multicast range routed through the adapter, for LAN discovery
pub const MULTICAST_CIDR: &str = "224.0.0.0/4";

/// Directed broadcast address of the virtual network
pub const SUBNET_BROADCAST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 255);

/// Virtual address for a host index (1 = accepted side, 2 = initiator)
pub fn virtual_ip(index: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, index)
}

/// Which routing shape `configure` managed to install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteApproach {
    /// Subnet route for the whole /24
    Generic,

    /// Fallback /32 route to the peer's virtual address only
    Fallback,

    /// No route was installed
    Failed,
}

/// Per-connection configuration input
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Own index in the virtual subnet (1 if we accepted, 2 if we initiated)
    pub self_index: u8,

    /// Peer's virtual address
    pub peer_virtual_ip: Ipv4Addr,
}

/// Installs and removes interface configuration via shell commands
pub struct NetworkConfigurator {
    alias: String,
    route_approach: RouteApproach,
}

impl NetworkConfigurator {
    pub fn new() -> Self {
        Self {
            alias: String::new(),
            route_approach: RouteApproach::Failed,
        }
    }

    /// Set the adapter alias used to key every command
    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = alias.into();
    }

    /// Route shape currently installed
    pub fn route_approach(&self) -> RouteApproach {
        self.route_approach
    }

    /// Install address, routes, forwarding and firewall rules.
    ///
    /// Only the primary address assignment is fatal; everything else
    /// degrades with a warning. On failure any partially installed state
    /// is removed before returning.
    pub async fn configure(&mut self, config: &ConnectionConfig) -> NetResult<()> {
        self.route_approach = RouteApproach::Generic;

        if let Err(e) = self.setup_routing(config).await {
            error!("interface configuration failed, removing partial routes");
            self.remove_routing(config.peer_virtual_ip).await;
            return Err(e);
        }

        self.setup_firewall().await;
        info!("interface configuration successful");
        Ok(())
    }

    /// Undo everything `configure` installed
    pub async fn reset(&mut self, peer_virtual_ip: Ipv4Addr) {
        self.remove_routing(peer_virtual_ip).await;
        self.remove_firewall().await;
    }

    async fn setup_routing(&mut self, config: &ConnectionConfig) -> NetResult<()> {
        let self_ip = virtual_ip(config.self_index);
        info!(
            "configuring '{}' with static address {} on {}",
            self.alias, self_ip, SUBNET_CIDR
        );

        if !run(&cmd::set_address(&self.alias, self_ip)).await {
            self.route_approach = RouteApproach::Failed;
            return Err(NetError::Config(
                "failed to assign virtual address".into(),
            ));
        }

        if !run(&cmd::add_subnet_route(&self.alias)).await {
            warn!("subnet route failed, trying a direct peer route");
            self.route_approach = RouteApproach::Fallback;

            if !run(&cmd::add_peer_route(&self.alias, config.peer_virtual_ip)).await {
                warn!("failed to add any route, connectivity may be limited");
                self.route_approach = RouteApproach::Failed;
            }
        }

        if !run(&cmd::enable_forwarding(&self.alias)).await {
            warn!("failed to enable forwarding on '{}'", self.alias);
        }

        if !run(&cmd::add_multicast_route(&self.alias)).await {
            warn!("failed to add multicast route, discovery may be limited");
        }

        Ok(())
    }

    async fn remove_routing(&mut self, peer_virtual_ip: Ipv4Addr) {
        info!("removing routing for '{}'", self.alias);

        match self.route_approach {
            RouteApproach::Generic => {
                if !run(&cmd::del_subnet_route(&self.alias)).await {
                    warn!("failed to remove subnet route");
                }
            }
            RouteApproach::Fallback => {
                if !run(&cmd::del_peer_route(&self.alias, peer_virtual_ip)).await {
                    warn!("failed to remove peer route");
                }
            }
            RouteApproach::Failed => {}
        }

        if !run(&cmd::reset_address(&self.alias)).await {
            warn!("failed to reset adapter address");
        }
        if !run(&cmd::del_multicast_route(&self.alias)).await {
            warn!("failed to remove multicast route");
        }
        if !run(&cmd::disable_forwarding(&self.alias)).await {
            warn!("failed to disable forwarding");
        }
    }

    /// Install the allow-rules for the virtual network.
    ///
    /// Individual rule failures are warnings; the tunnel still works for
    /// outbound-initiated traffic without them.
    pub async fn setup_firewall(&self) {
        info!("setting up firewall rules");
        for argv in cmd::firewall_add_rules(&self.alias) {
            if !run(&argv).await {
                warn!("firewall rule failed: {:?}", argv.first());
            }
        }
    }

    /// Delete the allow-rules by name
    pub async fn remove_firewall(&self) {
        info!("removing firewall rules");
        for argv in cmd::firewall_del_rules(&self.alias) {
            if !run(&argv).await {
                warn!("failed to remove firewall rule");
            }
        }
    }
}

impl Default for NetworkConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute one command, logging the invocation and its outcome.
/// Failure is reported to the caller, never raised further.
async fn run(argv: &[String]) -> bool {
    if argv.is_empty() {
        return false;
    }

    info!("executing: {}", argv.join(" "));

    let output = match Command::new(&argv[0]).args(&argv[1..]).output().await {
        Ok(output) => output,
        Err(e) => {
            warn!("failed to execute '{}': {}", argv[0], e);
            return false;
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            "command failed ({}): {}",
            output.status,
            stderr.trim()
        );
        return false;
    }

    true
}

/// Command argv builders, split per platform
mod cmd {
    use super::{Ipv4Addr, MULTICAST_CIDR, NETMASK, SUBNET_CIDR};

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[cfg(windows)]
    pub fn set_address(alias: &str, ip: Ipv4Addr) -> Vec<String> {
        args(&[
            "netsh", "interface", "ip", "set", "address", alias, "static",
            &ip.to_string(), NETMASK,
        ])
    }

    #[cfg(not(windows))]
    pub fn set_address(alias: &str, ip: Ipv4Addr) -> Vec<String> {
        args(&["ip", "addr", "replace", &format!("{}/24", ip), "dev", alias])
    }

    #[cfg(windows)]
    pub fn reset_address(alias: &str) -> Vec<String> {
        args(&["netsh", "interface", "ip", "set", "address", alias, "dhcp"])
    }

    #[cfg(not(windows))]
    pub fn reset_address(alias: &str) -> Vec<String> {
        args(&["ip", "addr", "flush", "dev", alias])
    }

    #[cfg(windows)]
    pub fn add_subnet_route(alias: &str) -> Vec<String> {
        args(&[
            "netsh", "interface", "ipv4", "add", "route", SUBNET_CIDR, alias, "metric=1",
        ])
    }

    #[cfg(not(windows))]
    pub fn add_subnet_route(alias: &str) -> Vec<String> {
        args(&[
            "ip", "route", "replace", SUBNET_CIDR, "dev", alias, "metric", "1",
        ])
    }

    #[cfg(windows)]
    pub fn del_subnet_route(alias: &str) -> Vec<String> {
        args(&["netsh", "interface", "ipv4", "delete", "route", SUBNET_CIDR, alias])
    }

    #[cfg(not(windows))]
    pub fn del_subnet_route(alias: &str) -> Vec<String> {
        args(&["ip", "route", "del", SUBNET_CIDR, "dev", alias])
    }

    #[cfg(windows)]
    pub fn add_peer_route(alias: &str, peer: Ipv4Addr) -> Vec<String> {
        args(&[
            "netsh", "interface", "ipv4", "add", "route",
            &format!("{}/32", peer), alias, "metric=1",
        ])
    }

    #[cfg(not(windows))]
    pub fn add_peer_route(alias: &str, peer: Ipv4Addr) -> Vec<String> {
        args(&[
            "ip", "route", "replace", &format!("{}/32", peer), "dev", alias,
        ])
    }

    #[cfg(windows)]
    pub fn del_peer_route(alias: &str, peer: Ipv4Addr) -> Vec<String> {
        args(&[
            "netsh", "interface", "ipv4", "delete", "route",
            &format!("{}/32", peer), alias,
        ])
    }

    #[cfg(not(windows))]
    pub fn del_peer_route(alias: &str, peer: Ipv4Addr) -> Vec<String> {
        args(&["ip", "route", "del", &format!("{}/32", peer), "dev", alias])
    }

    #[cfg(windows)]
    pub fn enable_forwarding(alias: &str) -> Vec<String> {
        args(&[
            "netsh", "interface", "ipv4", "set", "interface", alias,
            "forwarding=enabled", "metric=1",
        ])
    }

    #[cfg(not(windows))]
    pub fn enable_forwarding(_alias: &str) -> Vec<String> {
        args(&["sysctl", "-w", "net.ipv4.ip_forward=1"])
    }

    #[cfg(windows)]
    pub fn disable_forwarding(alias: &str) -> Vec<String> {
        args(&[
            "netsh", "interface", "ipv4", "set", "interface", alias,
            "forwarding=disabled",
        ])
    }

    #[cfg(not(windows))]
    pub fn disable_forwarding(_alias: &str) -> Vec<String> {
        args(&["sysctl", "-w", "net.ipv4.ip_forward=0"])
    }

    #[cfg(windows)]
    pub fn add_multicast_route(alias: &str) -> Vec<String> {
        args(&[
            "netsh", "interface", "ipv4", "add", "route",
            &format!("prefix={}", MULTICAST_CIDR),
            &format!("interface={}", alias), "metric=1",
        ])
    }

    #[cfg(not(windows))]
    pub fn add_multicast_route(alias: &str) -> Vec<String> {
        args(&["ip", "route", "replace", MULTICAST_CIDR, "dev", alias])
    }

    #[cfg(windows)]
    pub fn del_multicast_route(alias: &str) -> Vec<String> {
        args(&[
            "netsh", "interface", "ipv4", "delete", "route",
            &format!("prefix={}", MULTICAST_CIDR),
            &format!("interface={}", alias),
        ])
    }

    #[cfg(not(windows))]
    pub fn del_multicast_route(alias: &str) -> Vec<String> {
        args(&["ip", "route", "del", MULTICAST_CIDR, "dev", alias])
    }

    #[cfg(windows)]
    pub fn firewall_add_rules(alias: &str) -> Vec<Vec<String>> {
        let remote = format!("remoteip={}", SUBNET_CIDR);
        vec![
            args(&[
                "netsh", "advfirewall", "firewall", "add", "rule",
                "name=PeerLink IN", "dir=in", "action=allow", "protocol=any", &remote,
            ]),
            args(&[
                "netsh", "advfirewall", "firewall", "add", "rule",
                "name=PeerLink OUT", "dir=out", "action=allow", "protocol=any", &remote,
            ]),
            args(&[
                "netsh", "advfirewall", "firewall", "add", "rule",
                "name=PeerLink ICMP", "dir=in", "action=allow", "protocol=icmpv4", &remote,
            ]),
            args(&[
                "netsh", "advfirewall", "firewall", "add", "rule",
                "name=PeerLink IGMP IN", "dir=in", "action=allow", "protocol=2", &remote,
            ]),
            args(&[
                "netsh", "advfirewall", "firewall", "add", "rule",
                "name=PeerLink IGMP OUT", "dir=out", "action=allow", "protocol=2", &remote,
            ]),
            args(&[
                "netsh", "advfirewall", "firewall", "set", "rule",
                "group=File and Printer Sharing", "new", "enable=Yes",
            ]),
            args(&[
                "powershell", "-Command",
                &format!(
                    "Set-NetConnectionProfile -InterfaceAlias '{}' -NetworkCategory Private",
                    alias
                ),
            ]),
        ]
    }

    #[cfg(not(windows))]
    pub fn firewall_add_rules(_alias: &str) -> Vec<Vec<String>> {
        let comment = ["-m", "comment", "--comment", "PeerLink"];
        let mut rules = vec![
            args(&["iptables", "-I", "INPUT", "-s", SUBNET_CIDR, "-j", "ACCEPT"]),
            args(&["iptables", "-I", "OUTPUT", "-d", SUBNET_CIDR, "-j", "ACCEPT"]),
            args(&[
                "iptables", "-I", "INPUT", "-p", "icmp", "-s", SUBNET_CIDR, "-j", "ACCEPT",
            ]),
            args(&[
                "iptables", "-I", "INPUT", "-p", "igmp", "-s", SUBNET_CIDR, "-j", "ACCEPT",
            ]),
            args(&[
                "iptables", "-I", "OUTPUT", "-p", "igmp", "-d", SUBNET_CIDR, "-j", "ACCEPT",
            ]),
        ];
        for rule in &mut rules {
            rule.extend(comment.iter().map(|s| s.to_string()));
        }
        rules
    }

    #[cfg(windows)]
    pub fn firewall_del_rules(_alias: &str) -> Vec<Vec<String>> {
        ["PeerLink IN", "PeerLink OUT", "PeerLink ICMP", "PeerLink IGMP IN", "PeerLink IGMP OUT"]
            .iter()
            .map(|name| {
                args(&[
                    "netsh", "advfirewall", "firewall", "delete", "rule",
                    &format!("name={}", name),
                ])
            })
            .collect()
    }

    #[cfg(not(windows))]
    pub fn firewall_del_rules(alias: &str) -> Vec<Vec<String>> {
        firewall_add_rules(alias)
            .into_iter()
            .map(|mut argv| {
                // Mirror each insert as a delete
                argv[1] = "-D".to_string();
                argv
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_ip_indices() {
        assert_eq!(virtual_ip(1), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(virtual_ip(2), Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_commands_are_keyed_by_alias() {
        let alias = "peerlink0";
        for argv in [
            cmd::set_address(alias, virtual_ip(1)),
            cmd::add_subnet_route(alias),
            cmd::add_peer_route(alias, virtual_ip(2)),
            cmd::del_subnet_route(alias),
            cmd::del_peer_route(alias, virtual_ip(2)),
            cmd::add_multicast_route(alias),
            cmd::del_multicast_route(alias),
            cmd::reset_address(alias),
        ] {
            assert!(!argv.is_empty());
            assert!(
                argv.iter().any(|a| a.contains(alias)),
                "alias missing from {:?}",
                argv
            );
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn test_unix_route_argv_shape() {
        let argv = cmd::add_subnet_route("peerlink0");
        assert_eq!(argv[0], "ip");
        assert!(argv.contains(&SUBNET_CIDR.to_string()));

        let argv = cmd::add_peer_route("peerlink0", virtual_ip(2));
        assert!(argv.contains(&"10.0.0.2/32".to_string()));
    }

    #[test]
    fn test_firewall_rule_sets_match() {
        let adds = cmd::firewall_add_rules("peerlink0");
        let dels = cmd::firewall_del_rules("peerlink0");
        assert!(!adds.is_empty());
        assert!(!dels.is_empty());
    }

    #[test]
    fn test_initial_route_approach() {
        let cfg = NetworkConfigurator::new();
        assert_eq!(cfg.route_approach(), RouteApproach::Failed);
    }
}
