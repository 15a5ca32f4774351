//! Interface address and route installation shims.
//!
//! Correctness only requires that the interface is up, the assigned host IP
//! is present, and the advertised routes point at the interface; everything
//! else is delegated to the platform tools (`ip`, `ifconfig`, `route`,
//! `netsh`). Output is not parsed beyond detecting "route already exists",
//! which is not an error.

use bauta_core::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use tokio::process::Command;
use tracing::{debug, warn};

/// Install the assigned host address on the interface.
pub async fn assign_address(ifname: &str, addr: &IpNet, gateway: IpAddr) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let _ = gateway;
        run("ip", &["addr", "add", &addr.to_string(), "dev", ifname]).await?;
        run("ip", &["link", "set", "dev", ifname, "up"]).await
    }
    #[cfg(target_os = "macos")]
    {
        run(
            "ifconfig",
            &[
                ifname,
                &addr.addr().to_string(),
                &gateway.to_string(),
                "up",
            ],
        )
        .await
    }
    #[cfg(target_os = "windows")]
    {
        let _ = gateway;
        run(
            "netsh",
            &[
                "interface",
                "ip",
                "set",
                "address",
                ifname,
                "static",
                &addr.addr().to_string(),
            ],
        )
        .await
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        let _ = (ifname, addr, gateway);
        Err(Error::system("no address shim for this platform"))
    }
}

/// Point one advertised route at the interface.
pub async fn add_route(ifname: &str, route: &IpNet, gateway: IpAddr) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let _ = gateway;
        run("ip", &["route", "add", &route.to_string(), "dev", ifname]).await
    }
    #[cfg(target_os = "macos")]
    {
        let _ = ifname;
        run(
            "route",
            &["-n", "add", "-net", &route.to_string(), &gateway.to_string()],
        )
        .await
    }
    #[cfg(target_os = "windows")]
    {
        let _ = ifname;
        run(
            "route",
            &[
                "add",
                &route.network().to_string(),
                "mask",
                &mask_of(route),
                &gateway.to_string(),
            ],
        )
        .await
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        let _ = (ifname, route, gateway);
        Err(Error::system("no route shim for this platform"))
    }
}

/// Install every advertised route, tolerating pre-existing entries.
pub async fn install_routes(ifname: &str, routes: &[IpNet], gateway: IpAddr) -> Result<()> {
    for route in routes {
        add_route(ifname, route, gateway).await?;
        debug!(route = %route, ifname, "route installed");
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn mask_of(route: &IpNet) -> String {
    match route {
        IpNet::V4(v4) => v4.netmask().to_string(),
        IpNet::V6(v6) => v6.netmask().to_string(),
    }
}

#[allow(dead_code)]
async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::system(format!("{program} spawn failed: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if route_exists(&stderr) {
        warn!(program, ?args, "route already present, continuing");
        return Ok(());
    }
    Err(Error::system(format!(
        "{program} {} failed: {}",
        args.join(" "),
        stderr.trim()
    )))
}

/// "Already exists" responses differ per tool; all of them mean the desired
/// state is already in place.
fn route_exists(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("file exists") || s.contains("already exists") || s.contains("object already exists")
}
