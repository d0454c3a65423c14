//! Host route installation.
//!
//! The engine stays platform-agnostic: route manipulation lives behind the
//! [`PlatformOps`] trait, selected once at startup. The Linux implementation
//! relies on the TUN driver having already configured address, netmask and
//! MTU, and only installs the client's split-default routes; Windows sets
//! the interface address with `netsh` and adds whitelist bypass routes via
//! the configured physical gateway.

use crate::error::{VpnError, VpnResult};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::process::Command;

/// Everything the route installer needs to know.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    /// Name of the TUN interface.
    pub tun_name: String,
    /// Virtual address and subnet of this node.
    pub local_addr: Ipv4Net,
    /// True for the server role; the server installs no host routes.
    pub is_server: bool,
    /// Physical default gateway, required for Windows whitelist routes.
    pub default_gateway: Option<Ipv4Addr>,
    /// CIDRs that bypass the tunnel.
    pub whitelist: Vec<Ipv4Net>,
    /// Addresses routed into the tunnel so the engine can drop them.
    pub blacklist: Vec<Ipv4Addr>,
}

/// Platform-specific route operations.
pub trait PlatformOps: Send + Sync {
    /// Install routes at startup. Fatal on failure.
    fn install_routes(&self, plan: &RoutePlan) -> VpnResult<()>;

    /// Undo installed routes at shutdown. Best-effort.
    fn remove_routes(&self, plan: &RoutePlan);
}

/// Select the route installer for the running OS.
pub fn platform() -> VpnResult<Box<dyn PlatformOps>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(LinuxOps))
    }
    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(WindowsOps))
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Err(VpnError::Config(format!(
            "unsupported platform: {}",
            std::env::consts::OS
        )))
    }
}

/// Install routes and remove them again when dropped, including on panic in
/// any pump.
pub struct RouteGuard {
    ops: Box<dyn PlatformOps>,
    plan: RoutePlan,
}

impl RouteGuard {
    /// Install the plan and arm the guard.
    pub fn install(ops: Box<dyn PlatformOps>, plan: RoutePlan) -> VpnResult<Self> {
        ops.install_routes(&plan)?;
        Ok(Self { ops, plan })
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        log::info!("removing installed routes");
        self.ops.remove_routes(&self.plan);
    }
}

/// Route installer for Linux (`ip route`).
pub struct LinuxOps;

impl PlatformOps for LinuxOps {
    fn install_routes(&self, plan: &RoutePlan) -> VpnResult<()> {
        for args in linux_install_cmds(plan) {
            run_cmd("ip", &args)?;
        }
        Ok(())
    }

    fn remove_routes(&self, plan: &RoutePlan) {
        // Client routes die with the interface; nothing to undo.
        let _ = plan;
    }
}

/// Route installer for Windows (`netsh` / `route`).
pub struct WindowsOps;

impl PlatformOps for WindowsOps {
    fn install_routes(&self, plan: &RoutePlan) -> VpnResult<()> {
        for (program, args) in windows_install_cmds(plan)? {
            run_cmd(&program, &args)?;
        }
        Ok(())
    }

    fn remove_routes(&self, plan: &RoutePlan) {
        for (program, args) in windows_remove_cmds(plan) {
            run_cmd_best_effort(&program, &args);
        }
    }
}

/// Command arguments for the Linux route setup. The server installs
/// nothing; the client captures all traffic with the split default.
fn linux_install_cmds(plan: &RoutePlan) -> Vec<Vec<String>> {
    if plan.is_server {
        return Vec::new();
    }
    ["0.0.0.0/1", "128.0.0.0/1"]
        .iter()
        .map(|net| {
            vec![
                "route".into(),
                "add".into(),
                (*net).into(),
                "dev".into(),
                plan.tun_name.clone(),
            ]
        })
        .collect()
}

/// Commands for the Windows route setup.
fn windows_install_cmds(plan: &RoutePlan) -> VpnResult<Vec<(String, Vec<String>)>> {
    let mut cmds: Vec<(String, Vec<String>)> = Vec::new();

    cmds.push((
        "netsh".into(),
        vec![
            "interface".into(),
            "ip".into(),
            "set".into(),
            "address".into(),
            format!("name={}", plan.tun_name),
            "source=static".into(),
            format!("addr={}", plan.local_addr.addr()),
            format!("mask={}", plan.local_addr.netmask()),
            "gateway=none".into(),
        ],
    ));

    if plan.is_server {
        return Ok(cmds);
    }

    // Split default into the tunnel, same trick as on Linux.
    for net in ["0.0.0.0/1", "128.0.0.0/1"] {
        cmds.push((
            "netsh".into(),
            vec![
                "interface".into(),
                "ipv4".into(),
                "add".into(),
                "route".into(),
                format!("prefix={}", net),
                format!("interface={}", plan.tun_name),
                "nexthop=0.0.0.0".into(),
                "store=active".into(),
            ],
        ));
    }

    if !plan.whitelist.is_empty() {
        let gateway = plan.default_gateway.ok_or_else(|| {
            VpnError::Config("'default_gateway' is required for whitelist routes".into())
        })?;
        for net in &plan.whitelist {
            cmds.push((
                "route".into(),
                vec![
                    "add".into(),
                    net.network().to_string(),
                    "mask".into(),
                    net.netmask().to_string(),
                    gateway.to_string(),
                ],
            ));
        }
    }

    // Blacklisted hosts are steered into the tunnel where the engine drops
    // them per packet.
    for ip in &plan.blacklist {
        cmds.push((
            "netsh".into(),
            vec![
                "interface".into(),
                "ipv4".into(),
                "add".into(),
                "route".into(),
                format!("prefix={}/32", ip),
                format!("interface={}", plan.tun_name),
                "nexthop=0.0.0.0".into(),
                "store=active".into(),
            ],
        ));
    }

    Ok(cmds)
}

/// Commands undoing the Windows route setup.
fn windows_remove_cmds(plan: &RoutePlan) -> Vec<(String, Vec<String>)> {
    let mut cmds: Vec<(String, Vec<String>)> = Vec::new();
    if plan.is_server {
        return cmds;
    }

    for net in &plan.whitelist {
        cmds.push((
            "route".into(),
            vec![
                "delete".into(),
                net.network().to_string(),
                "mask".into(),
                net.netmask().to_string(),
            ],
        ));
    }
    for ip in &plan.blacklist {
        cmds.push((
            "netsh".into(),
            vec![
                "interface".into(),
                "ipv4".into(),
                "delete".into(),
                "route".into(),
                format!("prefix={}/32", ip),
                format!("interface={}", plan.tun_name),
                "nexthop=0.0.0.0".into(),
            ],
        ));
    }
    cmds
}

/// Returns true if stderr indicates the route already exists. Handles the
/// iproute2, route.exe and netsh phrasings.
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists")
        || lower.contains("eexist")
        || lower.contains("object already exists")
        || lower.contains("element already exists")
}

fn run_cmd(program: &str, args: &[String]) -> VpnResult<()> {
    log::debug!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| VpnError::Route(format!("failed to run {}: {}", program, e)))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_already_exists_error(&stderr) {
        log::warn!(
            "{} {}: already exists (treating as success)",
            program,
            args.join(" ")
        );
        return Ok(());
    }
    Err(VpnError::Route(format!(
        "{} {} failed: {}",
        program,
        args.join(" "),
        stderr.trim()
    )))
}

fn run_cmd_best_effort(program: &str, args: &[String]) {
    if let Err(e) = run_cmd(program, args) {
        log::warn!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_plan() -> RoutePlan {
        RoutePlan {
            tun_name: "tun9".into(),
            local_addr: "10.0.0.2/24".parse().unwrap(),
            is_server: false,
            default_gateway: Some("192.168.1.1".parse().unwrap()),
            whitelist: vec!["1.2.3.0/24".parse().unwrap()],
            blacklist: vec!["8.8.8.8".parse().unwrap()],
        }
    }

    #[test]
    fn test_linux_client_installs_split_default() {
        let cmds = linux_install_cmds(&client_plan());
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], ["route", "add", "0.0.0.0/1", "dev", "tun9"]);
        assert_eq!(cmds[1], ["route", "add", "128.0.0.0/1", "dev", "tun9"]);
    }

    #[test]
    fn test_linux_server_installs_nothing() {
        let mut plan = client_plan();
        plan.is_server = true;
        assert!(linux_install_cmds(&plan).is_empty());
    }

    #[test]
    fn test_windows_client_cmds() {
        let cmds = windows_install_cmds(&client_plan()).unwrap();
        // address + two split-default + one whitelist + one blacklist
        assert_eq!(cmds.len(), 5);
        assert_eq!(cmds[0].0, "netsh");
        assert!(cmds[0].1.contains(&"addr=10.0.0.2".to_string()));
        assert!(cmds[0].1.contains(&"mask=255.255.255.0".to_string()));
        let whitelist = &cmds[3];
        assert_eq!(whitelist.0, "route");
        assert_eq!(
            whitelist.1,
            ["add", "1.2.3.0", "mask", "255.255.255.0", "192.168.1.1"]
        );
    }

    #[test]
    fn test_windows_whitelist_requires_gateway() {
        let mut plan = client_plan();
        plan.default_gateway = None;
        assert!(windows_install_cmds(&plan).is_err());
    }

    #[test]
    fn test_windows_remove_mirrors_install() {
        let cmds = windows_remove_cmds(&client_plan());
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].1[0], "delete");
    }

    #[test]
    fn test_already_exists_detection() {
        assert!(is_already_exists_error("RTNETLINK answers: File exists"));
        assert!(is_already_exists_error("The object already exists"));
        assert!(!is_already_exists_error("Operation not permitted"));
    }
}
