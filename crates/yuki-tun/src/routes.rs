//! Route installation for full-tunnel clients.
//!
//! A client that sends all traffic through the tunnel installs three routes
//! via the tunnel gateway: the default route plus the two `/1` halves
//! (`0.0.0.0/1`, `128.0.0.0/1`), which win over the existing default route by
//! prefix length without replacing it. [`RouteSet`] remembers what it
//! installed and removes exactly that, in reverse order, on
//! [`RouteSet::remove`] or on drop.

use crate::command::NetCommand;
use crate::{TunError, TunResult};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Metric used for tunnel routes
pub const TUNNEL_ROUTE_METRIC: u32 = 1;

/// A single IPv4 route through the tunnel gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Route {
    /// Destination prefix
    pub destination: Ipv4Net,
    /// Next hop
    pub gateway: Ipv4Addr,
    /// Route metric
    pub metric: u32,
}

impl Ipv4Route {
    /// Create a route with the tunnel metric.
    #[must_use]
    pub fn new(destination: Ipv4Net, gateway: Ipv4Addr) -> Self {
        Self {
            destination,
            gateway,
            metric: TUNNEL_ROUTE_METRIC,
        }
    }

    /// `route add <net> mask <mask> <gateway> metric <n>`
    #[must_use]
    pub fn windows_add(&self) -> NetCommand {
        NetCommand::new(
            "route",
            [
                "add".to_string(),
                self.destination.network().to_string(),
                "mask".to_string(),
                self.destination.netmask().to_string(),
                self.gateway.to_string(),
                "metric".to_string(),
                self.metric.to_string(),
            ],
        )
    }

    /// `route delete <net> mask <mask> <gateway>`
    #[must_use]
    pub fn windows_delete(&self) -> NetCommand {
        NetCommand::new(
            "route",
            [
                "delete".to_string(),
                self.destination.network().to_string(),
                "mask".to_string(),
                self.destination.netmask().to_string(),
                self.gateway.to_string(),
            ],
        )
    }

    /// `ip route add <net>/<len> via <gateway> dev <name> metric <n>`
    #[must_use]
    pub fn linux_add(&self, dev: &str) -> NetCommand {
        NetCommand::new(
            "ip",
            [
                "route".to_string(),
                "add".to_string(),
                self.destination.to_string(),
                "via".to_string(),
                self.gateway.to_string(),
                "dev".to_string(),
                dev.to_string(),
                "metric".to_string(),
                self.metric.to_string(),
            ],
        )
    }

    /// `ip route del <net>/<len> via <gateway> dev <name>`
    #[must_use]
    pub fn linux_delete(&self, dev: &str) -> NetCommand {
        NetCommand::new(
            "ip",
            [
                "route".to_string(),
                "del".to_string(),
                self.destination.to_string(),
                "via".to_string(),
                self.gateway.to_string(),
                "dev".to_string(),
                dev.to_string(),
            ],
        )
    }

    fn add_command(&self, dev: &str) -> NetCommand {
        if cfg!(windows) {
            self.windows_add()
        } else {
            self.linux_add(dev)
        }
    }

    fn delete_command(&self, dev: &str) -> NetCommand {
        if cfg!(windows) {
            self.windows_delete()
        } else {
            self.linux_delete(dev)
        }
    }
}

impl std::fmt::Display for Ipv4Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {}", self.destination, self.gateway)
    }
}

/// The default route followed by the two `/1` halves, all via `gateway`.
///
/// # Errors
///
/// Never fails for these fixed prefixes; the `Result` carries ipnet's
/// prefix validation.
pub fn full_tunnel_routes(gateway: Ipv4Addr) -> TunResult<Vec<Ipv4Route>> {
    let prefixes = [
        (Ipv4Addr::UNSPECIFIED, 0),
        (Ipv4Addr::UNSPECIFIED, 1),
        (Ipv4Addr::new(128, 0, 0, 0), 1),
    ];
    prefixes
        .into_iter()
        .map(|(addr, len)| {
            Ipv4Net::new(addr, len)
                .map(|net| Ipv4Route::new(net, gateway))
                .map_err(|e| TunError::Configure(format!("invalid route prefix: {e}")))
        })
        .collect()
}

/// Routes installed on behalf of one interface.
#[derive(Debug)]
pub struct RouteSet {
    dev: String,
    installed: Vec<Ipv4Route>,
}

impl RouteSet {
    /// Empty set for `dev`.
    #[must_use]
    pub fn new(dev: impl Into<String>) -> Self {
        Self {
            dev: dev.into(),
            installed: Vec::new(),
        }
    }

    /// Install `routes` in order.
    ///
    /// The first route is required; later routes are best-effort and only
    /// remembered if they were added.
    ///
    /// # Errors
    ///
    /// Returns the failure of the first route.
    pub async fn install(&mut self, routes: &[Ipv4Route]) -> TunResult<()> {
        for (i, route) in routes.iter().enumerate() {
            match route.add_command(&self.dev).run().await {
                Ok(()) => {
                    tracing::debug!(route = %route, dev = %self.dev, "route added");
                    self.installed.push(*route);
                }
                Err(e) if i == 0 => return Err(e),
                Err(e) => tracing::warn!(route = %route, error = %e, "failed to add route"),
            }
        }
        tracing::info!(count = self.installed.len(), dev = %self.dev, "tunnel routes installed");
        Ok(())
    }

    /// Remove everything this set installed, newest first.
    pub async fn remove(&mut self) {
        while let Some(route) = self.installed.pop() {
            route.delete_command(&self.dev).run_best_effort().await;
        }
    }

    /// Routes currently installed.
    #[must_use]
    pub fn installed(&self) -> &[Ipv4Route] {
        &self.installed
    }
}

impl Drop for RouteSet {
    fn drop(&mut self) {
        if self.installed.is_empty() {
            return;
        }
        tracing::info!(count = self.installed.len(), dev = %self.dev, "cleaning up tunnel routes");
        while let Some(route) = self.installed.pop() {
            route.delete_command(&self.dev).run_blocking_best_effort();
        }
    }
}
