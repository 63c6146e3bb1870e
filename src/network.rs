//! Guest network allocation: /30 slots, per-instance namespaces and NAT rules
//!
//! Every instance gets one /30 out of the node subnet. Slot `n` puts the
//! gateway at `base + 4n + 1` on a tap device and the guest at
//! `base + 4n + 2`. The tap lives in a network namespace of its own, which
//! the jailer enters, and a veth pair joins that namespace to the host:
//!
//! ```text
//! host                             | netns fcnode-<id>
//! eno1 <-NAT-> fh<id> (veth) <-----> fg<id> (veth) -> fc<id> (tap, gateway/30) -> guest
//! ```
//!
//! The veth pair is unnumbered: proxy ARP on both ends and a /32 route on
//! the host carry the guest address across. Egress is masqueraded out of the
//! service interface and published ports are DNATed from that interface
//! only, never from loopback.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;

use crate::config::NetworkConfig;
use crate::models::{InstanceId, NetworkInfo, PortMapping};
use crate::{Error, Result};

const IPTABLES: &str = "iptables-nft";

/// One iptables rule, appended on setup and deleted on teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl FirewallRule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Full argument list for `iptables -A` (`append`) or `-D`
    pub fn args(&self, append: bool) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            if append { "-A" } else { "-D" }.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }

    pub fn masquerade(guest: Ipv4Addr, iface: &str) -> Self {
        let guest = guest.to_string();
        Self::new("nat", "POSTROUTING", &["-o", iface, "-s", &guest, "-j", "MASQUERADE"])
    }

    pub fn forward_established() -> Self {
        Self::new(
            "filter",
            "FORWARD",
            &["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
        )
    }

    pub fn forward_egress(link: &str, iface: &str) -> Self {
        Self::new("filter", "FORWARD", &["-i", link, "-o", iface, "-j", "ACCEPT"])
    }

    pub fn dnat(iface: &str, host_port: u16, guest: Ipv4Addr, guest_port: u16) -> Self {
        let dport = host_port.to_string();
        let dest = format!("{}:{}", guest, guest_port);
        Self::new(
            "nat",
            "PREROUTING",
            &["-i", iface, "-p", "tcp", "--dport", &dport, "-j", "DNAT", "--to-destination", &dest],
        )
    }

    pub fn forward_published(iface: &str, link: &str, guest: Ipv4Addr, guest_port: u16) -> Self {
        let guest = guest.to_string();
        let dport = guest_port.to_string();
        Self::new(
            "filter",
            "FORWARD",
            &["-i", iface, "-o", link, "-p", "tcp", "-d", &guest, "--dport", &dport, "-j", "ACCEPT"],
        )
    }
}

/// Devices and addresses that make up one guest's network path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestLink {
    pub netns: String,
    pub tap: String,
    /// Host end of the veth pair
    pub host_veth: String,
    /// Namespace end of the veth pair
    pub peer_veth: String,
    pub gateway: Ipv4Addr,
    pub guest: Ipv4Addr,
    /// Uid allowed to attach to the tap without CAP_NET_ADMIN
    pub tap_owner: Option<u32>,
}

impl GuestLink {
    /// Names derived from the instance id; every device name fits IFNAMSIZ
    pub fn for_instance(id: &InstanceId, gateway: Ipv4Addr, guest: Ipv4Addr) -> Self {
        let suffix: String = id.compact().chars().take(12).collect();
        Self {
            netns: format!("fcnode-{}", suffix),
            tap: format!("fc{}", suffix),
            host_veth: format!("fh{}", suffix),
            peer_veth: format!("fg{}", suffix),
            gateway,
            guest,
            tap_owner: None,
        }
    }

    /// Commands that build the link, in order
    pub fn setup_commands(&self) -> Vec<Vec<String>> {
        let ns = self.netns.as_str();
        let tap = self.tap.as_str();
        let host = self.host_veth.as_str();
        let peer = self.peer_veth.as_str();
        let gateway = format!("{}/30", self.gateway);
        let guest = format!("{}/32", self.guest);
        let peer_proxy_arp = format!("net.ipv4.conf.{}.proxy_arp=1", peer);
        let host_proxy_arp = format!("net.ipv4.conf.{}.proxy_arp=1", host);
        let owner = self.tap_owner.map(|uid| uid.to_string());

        let mut tuntap = vec!["ip", "-n", ns, "tuntap", "add", "dev", tap, "mode", "tap"];
        if let Some(owner) = owner.as_deref() {
            tuntap.extend(["user", owner, "group", owner]);
        }

        let commands: Vec<Vec<&str>> = vec![
            vec!["ip", "netns", "add", ns],
            vec!["ip", "link", "add", host, "type", "veth", "peer", "name", peer, "netns", ns],
            tuntap,
            vec!["ip", "-n", ns, "addr", "add", gateway.as_str(), "dev", tap],
            vec!["ip", "-n", ns, "link", "set", "lo", "up"],
            vec!["ip", "-n", ns, "link", "set", tap, "up"],
            vec!["ip", "-n", ns, "link", "set", peer, "up"],
            vec!["ip", "-n", ns, "route", "add", "default", "dev", peer],
            vec!["ip", "netns", "exec", ns, "sysctl", "-q", "-w", "net.ipv4.ip_forward=1"],
            vec!["ip", "netns", "exec", ns, "sysctl", "-q", "-w", peer_proxy_arp.as_str()],
            vec!["ip", "link", "set", host, "up"],
            vec!["sysctl", "-q", "-w", host_proxy_arp.as_str()],
            vec!["ip", "route", "add", guest.as_str(), "dev", host],
        ];

        commands
            .into_iter()
            .map(|c| c.into_iter().map(String::from).collect())
            .collect()
    }

    /// Deleting the namespace takes the tap, both veth ends and the host route with it
    pub fn teardown_command(&self) -> Vec<String> {
        ["ip", "netns", "del", self.netns.as_str()]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

/// Host-level side effects of leasing an address
#[cfg_attr(test, mockall::automock)]
pub trait HostNetwork: Send + Sync {
    /// Create the namespace, tap and veth pair of `link`
    fn create_link(&self, link: &GuestLink) -> Result<()>;
    fn delete_link(&self, link: &GuestLink) -> Result<()>;
    fn append_rule(&self, rule: &FirewallRule) -> Result<()>;
    fn delete_rule(&self, rule: &FirewallRule) -> Result<()>;
}

fn cmd(program: &str, args: &[&str]) -> Result<()> {
    tracing::trace!("Running command: {} {}", program, args.join(" "));

    let output = Command::new(program).args(args).output()?;

    if !output.status.success() {
        return Err(Error::Network(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(())
}

fn run(command: &[String]) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Ok(());
    };
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    cmd(program, &args)
}

/// Runs `ip`, `sysctl` and `iptables-nft` on the host
pub struct CommandNetwork;

impl HostNetwork for CommandNetwork {
    fn create_link(&self, link: &GuestLink) -> Result<()> {
        let mut commands = link.setup_commands().into_iter();

        if let Some(first) = commands.next() {
            run(&first)?;
        }
        for command in commands {
            if let Err(e) = run(&command) {
                let _ = run(&link.teardown_command());
                return Err(e);
            }
        }
        Ok(())
    }

    fn delete_link(&self, link: &GuestLink) -> Result<()> {
        run(&link.teardown_command())
    }

    fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        let args = rule.args(true);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd(IPTABLES, &args)
    }

    fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        let args = rule.args(false);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd(IPTABLES, &args)
    }
}

/// Logs what would be done; for hosts without CAP_NET_ADMIN
pub struct DryRunNetwork;

impl HostNetwork for DryRunNetwork {
    fn create_link(&self, link: &GuestLink) -> Result<()> {
        tracing::info!(netns = %link.netns, tap = %link.tap, gateway = %link.gateway, "dry-run: create link");
        Ok(())
    }

    fn delete_link(&self, link: &GuestLink) -> Result<()> {
        tracing::info!(netns = %link.netns, "dry-run: delete link");
        Ok(())
    }

    fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        tracing::info!("dry-run: {} {}", IPTABLES, rule.args(true).join(" "));
        Ok(())
    }

    fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        tracing::info!("dry-run: {} {}", IPTABLES, rule.args(false).join(" "));
        Ok(())
    }
}

/// Tap device names are capped at 15 bytes by the kernel
pub fn tap_name_for(id: &InstanceId) -> String {
    GuestLink::for_instance(id, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED).tap
}

/// Exclusive claim on one /30 slot and its devices.
///
/// Not `Clone`: handing it back to [`NetworkAllocator::release`] consumes it.
#[derive(Debug)]
pub struct NetworkLease {
    instance: InstanceId,
    info: NetworkInfo,
}

impl NetworkLease {
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn info(&self) -> &NetworkInfo {
        &self.info
    }

    pub fn slot(&self) -> u32 {
        self.info.slot
    }

    pub fn guest_addr(&self) -> Ipv4Addr {
        self.info.guest_addr
    }

    pub fn tap_name(&self) -> &str {
        &self.info.tap_name
    }
}

struct PublishedPort {
    guest_port: u16,
    rules: Vec<FirewallRule>,
}

struct SlotState {
    instance: InstanceId,
    link: GuestLink,
    rules: Vec<FirewallRule>,
    ports: BTreeMap<u16, PublishedPort>,
    releasing: bool,
}

#[derive(Default)]
struct Pool {
    slots: BTreeMap<u32, SlotState>,
    host_ports: HashMap<u16, u32>,
}

/// Owns the node's guest address space and published-port table
pub struct NetworkAllocator {
    config: NetworkConfig,
    host: Arc<dyn HostNetwork>,
    tap_owner_base: Option<u32>,
    pool: Mutex<Pool>,
}

impl NetworkAllocator {
    pub fn new(config: NetworkConfig, host: Arc<dyn HostNetwork>) -> Self {
        Self {
            config,
            host,
            tap_owner_base: None,
            pool: Mutex::new(Pool::default()),
        }
    }

    /// Allocator backed by real host commands, or logging-only when `dry_run`
    pub fn from_config(config: NetworkConfig) -> Self {
        let host: Arc<dyn HostNetwork> = if config.dry_run {
            Arc::new(DryRunNetwork)
        } else {
            Arc::new(CommandNetwork)
        };
        Self::new(config, host)
    }

    /// Give the tap of slot `n` to uid `base + n`, the uid its VM runs as
    pub fn with_tap_owner_base(mut self, base: u32) -> Self {
        self.tap_owner_base = Some(base);
        self
    }

    pub fn capacity(&self) -> usize {
        self.config.slot_count() as usize
    }

    pub fn in_use(&self) -> usize {
        self.pool.lock().slots.len()
    }

    fn slot_addrs(&self, slot: u32) -> (Ipv4Addr, Ipv4Addr) {
        let base = u32::from(self.config.subnet_base) + slot * 4;
        (Ipv4Addr::from(base + 1), Ipv4Addr::from(base + 2))
    }

    /// Claim the lowest free slot for `instance` and set up its link and NAT
    pub fn allocate(&self, instance: &InstanceId) -> Result<NetworkLease> {
        let tap_name = tap_name_for(instance);

        let (slot, link) = {
            let mut pool = self.pool.lock();

            if pool.slots.values().any(|s| s.link.tap == tap_name) {
                return Err(Error::Network(format!("tap name {} already in use", tap_name)));
            }

            let slot = (0..self.config.slot_count())
                .find(|n| !pool.slots.contains_key(n))
                .ok_or(Error::AddressPoolExhausted(pool.slots.len()))?;

            let (gateway, guest) = self.slot_addrs(slot);
            let mut link = GuestLink::for_instance(instance, gateway, guest);
            link.tap_owner = self.tap_owner_base.map(|base| base + slot);

            pool.slots.insert(
                slot,
                SlotState {
                    instance: instance.clone(),
                    link: link.clone(),
                    rules: Vec::new(),
                    ports: BTreeMap::new(),
                    releasing: false,
                },
            );
            (slot, link)
        };
        let (gateway, guest_addr) = (link.gateway, link.guest);

        match self.setup_slot(&link) {
            Ok(rules) => {
                if let Some(state) = self.pool.lock().slots.get_mut(&slot) {
                    state.rules = rules;
                }
            }
            Err(e) => {
                self.pool.lock().slots.remove(&slot);
                tracing::error!(instance = %instance, netns = %link.netns, error = %e, "Network setup failed");
                return Err(e);
            }
        }

        tracing::info!(
            instance = %instance,
            slot,
            guest = %guest_addr,
            netns = %link.netns,
            tap = %link.tap,
            "Network lease allocated"
        );

        Ok(NetworkLease {
            instance: instance.clone(),
            info: NetworkInfo {
                slot,
                guest_addr,
                gateway,
                tap_name: link.tap,
                netns: link.netns,
                host_link: link.host_veth,
                ports: Vec::new(),
            },
        })
    }

    fn setup_slot(&self, link: &GuestLink) -> Result<Vec<FirewallRule>> {
        self.host.create_link(link)?;

        let iface = &self.config.service_interface;
        let wanted = [
            FirewallRule::masquerade(link.guest, iface),
            FirewallRule::forward_established(),
            FirewallRule::forward_egress(&link.host_veth, iface),
        ];

        match self.install_rules(&wanted) {
            Ok(rules) => Ok(rules),
            Err(e) => {
                if let Err(del) = self.host.delete_link(link) {
                    tracing::warn!(netns = %link.netns, error = %del, "Failed to remove link during rollback");
                }
                Err(e)
            }
        }
    }

    /// Append rules in order; on failure delete the ones already appended
    fn install_rules(&self, rules: &[FirewallRule]) -> Result<Vec<FirewallRule>> {
        let mut installed = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Err(e) = self.host.append_rule(rule) {
                self.remove_rules(&installed);
                return Err(e);
            }
            installed.push(rule.clone());
        }
        Ok(installed)
    }

    fn remove_rules(&self, rules: &[FirewallRule]) {
        for rule in rules.iter().rev() {
            if let Err(e) = self.host.delete_rule(rule) {
                tracing::warn!(error = %e, "Failed to delete firewall rule");
            }
        }
    }

    /// Tear down the lease's host state and return the slot to the pool.
    ///
    /// The slot stays reserved until teardown finishes so a concurrent
    /// allocation cannot reuse a gateway address still bound to the old tap.
    pub fn release(&self, lease: NetworkLease) -> Result<()> {
        let (link, rules, port_rules) = {
            let mut pool = self.pool.lock();
            let state = match pool.slots.get_mut(&lease.info.slot) {
                Some(s) if s.instance == lease.instance && !s.releasing => s,
                _ => return Err(Error::LeaseNotAllocated(lease.instance.to_string())),
            };
            state.releasing = true;
            let port_rules: Vec<FirewallRule> = state
                .ports
                .values()
                .flat_map(|p| p.rules.iter().cloned())
                .collect();
            (state.link.clone(), state.rules.clone(), port_rules)
        };

        self.remove_rules(&port_rules);
        self.remove_rules(&rules);
        if let Err(e) = self.host.delete_link(&link) {
            tracing::warn!(netns = %link.netns, error = %e, "Failed to delete link");
        }

        let mut pool = self.pool.lock();
        let slot = lease.info.slot;
        pool.slots.remove(&slot);
        pool.host_ports.retain(|_, s| *s != slot);

        tracing::info!(instance = %lease.instance, slot, netns = %link.netns, "Network lease released");
        Ok(())
    }

    /// Forward `host_port` on the service interface to the guest.
    ///
    /// Returns `Ok(false)` when the exact mapping already exists for this
    /// instance; any other reuse of the host port is `PortInUse`. A lease
    /// released while the rules are going in gets them removed again and
    /// the call fails with `LeaseNotAllocated`.
    pub fn publish_port(
        &self,
        instance: &InstanceId,
        network: &NetworkInfo,
        mapping: PortMapping,
    ) -> Result<bool> {
        if mapping.host_port == 0 || mapping.guest_port == 0 {
            return Err(Error::InvalidArgument("ports must be non-zero".into()));
        }

        let host_link = {
            let mut pool = self.pool.lock();

            if let Some(owner) = pool.host_ports.get(&mapping.host_port).copied() {
                let same = owner == network.slot
                    && pool
                        .slots
                        .get(&owner)
                        .filter(|s| &s.instance == instance)
                        .and_then(|s| s.ports.get(&mapping.host_port))
                        .is_some_and(|p| p.guest_port == mapping.guest_port);
                return if same {
                    Ok(false)
                } else {
                    Err(Error::PortInUse(mapping.host_port))
                };
            }

            let state = match pool.slots.get_mut(&network.slot) {
                Some(s) if &s.instance == instance && !s.releasing => s,
                _ => return Err(Error::LeaseNotAllocated(instance.to_string())),
            };
            state.ports.insert(
                mapping.host_port,
                PublishedPort {
                    guest_port: mapping.guest_port,
                    rules: Vec::new(),
                },
            );
            let host_link = state.link.host_veth.clone();
            pool.host_ports.insert(mapping.host_port, network.slot);
            host_link
        };

        let iface = &self.config.service_interface;
        let wanted = [
            FirewallRule::dnat(iface, mapping.host_port, network.guest_addr, mapping.guest_port),
            FirewallRule::forward_published(iface, &host_link, network.guest_addr, mapping.guest_port),
        ];

        let rules = match self.install_rules(&wanted) {
            Ok(rules) => rules,
            Err(e) => {
                let mut pool = self.pool.lock();
                if let Some(state) = pool
                    .slots
                    .get_mut(&network.slot)
                    .filter(|s| &s.instance == instance)
                {
                    state.ports.remove(&mapping.host_port);
                    pool.host_ports.remove(&mapping.host_port);
                }
                return Err(e);
            }
        };

        // Only a slot still held by this instance may keep the rules
        let orphaned = {
            let mut pool = self.pool.lock();
            match pool
                .slots
                .get_mut(&network.slot)
                .filter(|s| &s.instance == instance && !s.releasing)
                .and_then(|s| s.ports.get_mut(&mapping.host_port))
            {
                Some(port) => {
                    port.rules = rules;
                    None
                }
                None => Some(rules),
            }
        };

        if let Some(rules) = orphaned {
            tracing::warn!(
                instance = %instance,
                host_port = mapping.host_port,
                "Lease released while publishing, removing port rules"
            );
            self.remove_rules(&rules);
            return Err(Error::LeaseNotAllocated(instance.to_string()));
        }

        tracing::info!(
            instance = %instance,
            host_port = mapping.host_port,
            guest_port = mapping.guest_port,
            "Port published"
        );
        Ok(true)
    }

    /// Mappings currently installed for a slot
    pub fn published_ports(&self, slot: u32) -> Vec<PortMapping> {
        self.pool
            .lock()
            .slots
            .get(&slot)
            .map(|s| {
                s.ports
                    .iter()
                    .map(|(host, p)| PortMapping {
                        host_port: *host,
                        guest_port: p.guest_port,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;

    fn small_config() -> NetworkConfig {
        NetworkConfig {
            subnet_base: Ipv4Addr::new(172, 16, 0, 0),
            prefix_len: 28,
            service_interface: "eno1".to_string(),
            dry_run: false,
        }
    }

    fn permissive_host() -> MockHostNetwork {
        let mut host = MockHostNetwork::new();
        host.expect_create_link().returning(|_| Ok(()));
        host.expect_delete_link().returning(|_| Ok(()));
        host.expect_append_rule().returning(|_| Ok(()));
        host.expect_delete_rule().returning(|_| Ok(()));
        host
    }

    fn allocator(host: MockHostNetwork) -> NetworkAllocator {
        NetworkAllocator::new(small_config(), Arc::new(host))
    }

    #[test]
    fn test_first_lease_gets_lowest_slot() {
        let alloc = allocator(permissive_host());
        let lease = alloc.allocate(&InstanceId::generate()).unwrap();

        assert_eq!(lease.slot(), 0);
        assert_eq!(lease.info().gateway, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(lease.guest_addr(), Ipv4Addr::new(172, 16, 0, 2));

        let second = alloc.allocate(&InstanceId::generate()).unwrap();
        assert_eq!(second.slot(), 1);
        assert_eq!(second.guest_addr(), Ipv4Addr::new(172, 16, 0, 6));
    }

    #[test]
    fn test_exhaustion_and_uniqueness() {
        let alloc = allocator(permissive_host());
        let leases: Vec<_> = (0..4)
            .map(|_| alloc.allocate(&InstanceId::generate()).unwrap())
            .collect();

        let addrs: HashSet<_> = leases.iter().map(|l| l.guest_addr()).collect();
        let taps: HashSet<_> = leases.iter().map(|l| l.tap_name().to_string()).collect();
        let namespaces: HashSet<_> = leases.iter().map(|l| l.info().netns.clone()).collect();
        assert_eq!(addrs.len(), 4);
        assert_eq!(taps.len(), 4);
        assert_eq!(namespaces.len(), 4);

        let result = alloc.allocate(&InstanceId::generate());
        assert!(matches!(result, Err(Error::AddressPoolExhausted(4))));
    }

    #[test]
    fn test_release_returns_lowest_slot() {
        let alloc = allocator(permissive_host());
        let a = alloc.allocate(&InstanceId::generate()).unwrap();
        let _b = alloc.allocate(&InstanceId::generate()).unwrap();

        alloc.release(a).unwrap();
        assert_eq!(alloc.in_use(), 1);

        let c = alloc.allocate(&InstanceId::generate()).unwrap();
        assert_eq!(c.slot(), 0);
    }

    #[test]
    fn test_release_of_unallocated_lease() {
        let alloc = allocator(permissive_host());
        let id = InstanceId::generate();
        let link = GuestLink::for_instance(&id, Ipv4Addr::new(172, 16, 0, 9), Ipv4Addr::new(172, 16, 0, 10));
        let forged = NetworkLease {
            instance: id.clone(),
            info: NetworkInfo {
                slot: 2,
                guest_addr: link.guest,
                gateway: link.gateway,
                tap_name: link.tap,
                netns: link.netns,
                host_link: link.host_veth,
                ports: Vec::new(),
            },
        };

        assert!(matches!(alloc.release(forged), Err(Error::LeaseNotAllocated(_))));
    }

    #[test]
    fn test_device_names_derived_from_id() {
        let id = InstanceId::from("3f2a9c0d-1e7b-4c4a-9d1e-000000000000");
        let link = GuestLink::for_instance(&id, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));

        assert_eq!(tap_name_for(&id), "fc3f2a9c0d1e7b");
        assert_eq!(link.tap, "fc3f2a9c0d1e7b");
        assert_eq!(link.host_veth, "fh3f2a9c0d1e7b");
        assert_eq!(link.peer_veth, "fg3f2a9c0d1e7b");
        assert_eq!(link.netns, "fcnode-3f2a9c0d1e7b");
        for name in [&link.tap, &link.host_veth, &link.peer_veth] {
            assert!(name.len() <= 15);
        }
    }

    #[test]
    fn test_link_commands_isolate_tap_in_namespace() {
        let id = InstanceId::from("3f2a9c0d-1e7b-4c4a-9d1e-000000000000");
        let mut link = GuestLink::for_instance(&id, Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 6));
        link.tap_owner = Some(10001);

        let commands: Vec<String> = link.setup_commands().iter().map(|c| c.join(" ")).collect();

        assert_eq!(commands[0], "ip netns add fcnode-3f2a9c0d1e7b");
        assert!(commands.contains(
            &"ip -n fcnode-3f2a9c0d1e7b tuntap add dev fc3f2a9c0d1e7b mode tap user 10001 group 10001".to_string()
        ));
        assert!(commands.contains(&"ip -n fcnode-3f2a9c0d1e7b addr add 10.0.0.5/30 dev fc3f2a9c0d1e7b".to_string()));
        assert_eq!(commands.last().unwrap(), "ip route add 10.0.0.6/32 dev fh3f2a9c0d1e7b");
        // Nothing touches the tap outside the namespace
        assert!(commands
            .iter()
            .filter(|c| c.contains("fc3f2a9c0d1e7b"))
            .all(|c| c.starts_with("ip -n fcnode-3f2a9c0d1e7b")));

        assert_eq!(link.teardown_command().join(" "), "ip netns del fcnode-3f2a9c0d1e7b");
    }

    #[test]
    fn test_tap_owner_follows_slot() {
        let mut host = MockHostNetwork::new();
        host.expect_create_link()
            .withf(|link| link.tap_owner == Some(20000))
            .times(1)
            .returning(|_| Ok(()));
        host.expect_create_link()
            .withf(|link| link.tap_owner == Some(20001))
            .times(1)
            .returning(|_| Ok(()));
        host.expect_append_rule().returning(|_| Ok(()));

        let alloc = NetworkAllocator::new(small_config(), Arc::new(host)).with_tap_owner_base(20000);
        alloc.allocate(&InstanceId::generate()).unwrap();
        alloc.allocate(&InstanceId::generate()).unwrap();
    }

    #[test]
    fn test_partial_setup_rolls_back() {
        let mut host = MockHostNetwork::new();
        host.expect_create_link().times(1).returning(|_| Ok(()));
        let mut appended = 0;
        host.expect_append_rule().times(2).returning(move |_| {
            appended += 1;
            if appended == 2 {
                Err(Error::Network("iptables: no chain".into()))
            } else {
                Ok(())
            }
        });
        host.expect_delete_rule()
            .withf(|rule| rule.chain == "POSTROUTING")
            .times(1)
            .returning(|_| Ok(()));
        host.expect_delete_link().times(1).returning(|_| Ok(()));

        let alloc = allocator(host);
        let result = alloc.allocate(&InstanceId::generate());

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_release_removes_rules_and_link() {
        let mut host = MockHostNetwork::new();
        host.expect_create_link().returning(|_| Ok(()));
        host.expect_append_rule().times(3).returning(|_| Ok(()));
        host.expect_delete_rule().times(3).returning(|_| Ok(()));
        host.expect_delete_link().times(1).returning(|_| Ok(()));

        let alloc = allocator(host);
        let lease = alloc.allocate(&InstanceId::generate()).unwrap();
        alloc.release(lease).unwrap();
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_publish_port_collision() {
        let alloc = allocator(permissive_host());
        let a_id = InstanceId::generate();
        let b_id = InstanceId::generate();
        let a = alloc.allocate(&a_id).unwrap();
        let b = alloc.allocate(&b_id).unwrap();

        let mapping = PortMapping { host_port: 8080, guest_port: 80 };
        assert!(alloc.publish_port(&a_id, a.info(), mapping).unwrap());

        let result = alloc.publish_port(&b_id, b.info(), mapping);
        assert!(matches!(result, Err(Error::PortInUse(8080))));

        let other_guest = PortMapping { host_port: 8080, guest_port: 81 };
        assert!(matches!(
            alloc.publish_port(&a_id, a.info(), other_guest),
            Err(Error::PortInUse(8080))
        ));
    }

    #[test]
    fn test_publish_same_pair_is_idempotent() {
        let mut host = MockHostNetwork::new();
        host.expect_create_link().returning(|_| Ok(()));
        // 3 lease rules + 2 port rules, the repeat adds nothing
        host.expect_append_rule().times(5).returning(|_| Ok(()));

        let alloc = allocator(host);
        let id = InstanceId::generate();
        let lease = alloc.allocate(&id).unwrap();
        let mapping = PortMapping { host_port: 2222, guest_port: 22 };

        assert!(alloc.publish_port(&id, lease.info(), mapping).unwrap());
        assert!(!alloc.publish_port(&id, lease.info(), mapping).unwrap());
        assert_eq!(alloc.published_ports(lease.slot()), vec![mapping]);
    }

    #[test]
    fn test_release_frees_host_ports() {
        let alloc = allocator(permissive_host());
        let a_id = InstanceId::generate();
        let a = alloc.allocate(&a_id).unwrap();
        let mapping = PortMapping { host_port: 9000, guest_port: 9000 };
        alloc.publish_port(&a_id, a.info(), mapping).unwrap();
        alloc.release(a).unwrap();

        let b_id = InstanceId::generate();
        let b = alloc.allocate(&b_id).unwrap();
        assert!(alloc.publish_port(&b_id, b.info(), mapping).unwrap());
    }

    #[test]
    fn test_publish_rejects_zero_ports() {
        let alloc = allocator(permissive_host());
        let id = InstanceId::generate();
        let lease = alloc.allocate(&id).unwrap();
        let result = alloc.publish_port(&id, lease.info(), PortMapping { host_port: 0, guest_port: 80 });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    /// Records live rules and parks the first DNAT append until told to go on
    struct GatedHost {
        live: Mutex<Vec<FirewallRule>>,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        proceed: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl HostNetwork for GatedHost {
        fn create_link(&self, _link: &GuestLink) -> Result<()> {
            Ok(())
        }

        fn delete_link(&self, _link: &GuestLink) -> Result<()> {
            Ok(())
        }

        fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
            if rule.chain == "PREROUTING" {
                let entered = self.entered.lock().take();
                if let Some(entered) = entered {
                    entered.send(()).unwrap();
                    let proceed = self.proceed.lock().take().unwrap();
                    proceed.recv().unwrap();
                }
            }
            self.live.lock().push(rule.clone());
            Ok(())
        }

        fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
            let mut live = self.live.lock();
            if let Some(pos) = live.iter().position(|r| r == rule) {
                live.remove(pos);
            }
            Ok(())
        }
    }

    #[test]
    fn test_release_during_publish_removes_port_rules() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let host = Arc::new(GatedHost {
            live: Mutex::new(Vec::new()),
            entered: Mutex::new(Some(entered_tx)),
            proceed: Mutex::new(Some(proceed_rx)),
        });
        let alloc = Arc::new(NetworkAllocator::new(small_config(), host.clone()));

        let id = InstanceId::generate();
        let lease = alloc.allocate(&id).unwrap();
        let info = lease.info().clone();
        let mapping = PortMapping { host_port: 8080, guest_port: 80 };

        let publisher = {
            let alloc = alloc.clone();
            let id = id.clone();
            std::thread::spawn(move || alloc.publish_port(&id, &info, mapping))
        };

        // Publisher is now between reserving the port and storing its rules
        entered_rx.recv().unwrap();
        alloc.release(lease).unwrap();
        proceed_tx.send(()).unwrap();

        let result = publisher.join().unwrap();
        assert!(matches!(result, Err(Error::LeaseNotAllocated(_))));
        assert_eq!(alloc.in_use(), 0);
        let live = host.live.lock().clone();
        assert!(live.is_empty(), "leftover rules: {:?}", live);

        // The port is free for whoever gets the slot next
        let next_id = InstanceId::generate();
        let next = alloc.allocate(&next_id).unwrap();
        assert_eq!(next.slot(), 0);
        assert!(alloc.publish_port(&next_id, next.info(), mapping).unwrap());
    }

    #[test]
    fn test_rule_args() {
        let rule = FirewallRule::dnat("eno1", 8080, Ipv4Addr::new(172, 16, 0, 2), 80);
        assert_eq!(
            rule.args(true).join(" "),
            "-t nat -A PREROUTING -i eno1 -p tcp --dport 8080 -j DNAT --to-destination 172.16.0.2:80"
        );
        assert!(rule.args(false).contains(&"-D".to_string()));

        let forward = FirewallRule::forward_published("eno1", "fh0123", Ipv4Addr::new(172, 16, 0, 2), 80);
        assert!(forward.args(true).join(" ").contains("-i eno1 -o fh0123"));
    }
}
