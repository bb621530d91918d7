//! `netsh` address and DNS configuration.

use crate::TunResult;
use crate::command::NetCommand;
use crate::routes::{RouteSet, full_tunnel_routes};
use std::net::Ipv4Addr;

/// DNS servers assigned to the tunnel adapter, primary first.
pub const TUNNEL_DNS: [Ipv4Addr; 2] = [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];

/// `netsh interface ip set address name=<adapter> static <addr> <mask> [<gateway>]`
#[must_use]
pub fn set_address(
    adapter: &str,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
) -> NetCommand {
    let mut args = vec![
        "interface".to_string(),
        "ip".to_string(),
        "set".to_string(),
        "address".to_string(),
        format!("name={adapter}"),
        "static".to_string(),
        address.to_string(),
        netmask.to_string(),
    ];
    if let Some(gateway) = gateway {
        args.push(gateway.to_string());
    }
    NetCommand::new("netsh", args)
}

/// DNS commands: the first server is set as primary, the rest are appended.
#[must_use]
pub fn set_dns(adapter: &str, servers: &[Ipv4Addr]) -> Vec<NetCommand> {
    servers
        .iter()
        .enumerate()
        .map(|(i, server)| {
            if i == 0 {
                NetCommand::new(
                    "netsh",
                    [
                        "interface".to_string(),
                        "ip".to_string(),
                        "set".to_string(),
                        "dns".to_string(),
                        format!("name={adapter}"),
                        "static".to_string(),
                        server.to_string(),
                        "primary".to_string(),
                    ],
                )
            } else {
                NetCommand::new(
                    "netsh",
                    [
                        "interface".to_string(),
                        "ip".to_string(),
                        "add".to_string(),
                        "dns".to_string(),
                        format!("name={adapter}"),
                        server.to_string(),
                        format!("index={}", i + 1),
                    ],
                )
            }
        })
        .collect()
}

/// Address the adapter, set DNS, and install full-tunnel routes when a
/// gateway is given. DNS failures are logged and ignored.
///
/// # Errors
///
/// Returns the failure of the address assignment or the default route.
pub async fn configure(
    adapter: &str,
    routes: &mut RouteSet,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
) -> TunResult<()> {
    set_address(adapter, address, netmask, gateway).run().await?;

    for cmd in set_dns(adapter, &TUNNEL_DNS) {
        cmd.run_best_effort().await;
    }

    if let Some(gateway) = gateway {
        routes.install(&full_tunnel_routes(gateway)?).await?;
    }

    tracing::info!(adapter, %address, %netmask, "adapter configured");
    Ok(())
}
