//! Daemon orchestration
//!
//! Owns the interface directory and one manager per family, applies the
//! configured routes and routes upcalls to the right family.

use std::os::unix::io::RawFd;

use mroute_common::{AddressFamily, Family, MrouteError, MrouteResult, V4, V6};
use tracing::{error, info, warn};

use crate::config::MrouteConfig;
use crate::iface::InterfaceDirectory;
use crate::kernel::ControlChannel;
use crate::mroute_mgr::MrouteMgr;
use crate::types::{Operation, RouteRequest};

/// Multicast routing daemon state.
pub struct MrouteDaemon<C4: ControlChannel<V4>, C6: ControlChannel<V6>> {
    config: MrouteConfig,
    ifaces: InterfaceDirectory,
    v4: MrouteMgr<V4, C4>,
    v6: MrouteMgr<V6, C6>,
}

impl<C4: ControlChannel<V4>, C6: ControlChannel<V6>> MrouteDaemon<C4, C6> {
    pub fn new(config: MrouteConfig, ifaces: InterfaceDirectory, v4: C4, v6: C6) -> Self {
        let v6 = MrouteMgr::new(v6)
            .with_mc_forwarding_sysctl(config.daemon.forwarding_switch());

        Self {
            config,
            ifaces,
            v4: MrouteMgr::new(v4),
            v6,
        }
    }

    /// Enable the configured families and apply the configured routes.
    ///
    /// A family that fails to enable stays disabled; the daemon keeps
    /// running with the other one.
    pub fn start(&mut self) {
        if self.config.daemon.ipv4 {
            enable_family(&mut self.v4, &mut self.ifaces);
        }
        if self.config.daemon.ipv6 {
            enable_family(&mut self.v6, &mut self.ifaces);
        }

        if !self.v4.is_enabled() && !self.v6.is_enabled() {
            warn!("No multicast routing family enabled");
        }

        let applied = self.apply_config();
        info!(
            "Applied {}/{} configured routes",
            applied,
            self.config.mroute.len()
        );
    }

    /// Disable both families, dropping all kernel state.
    pub fn stop(&mut self) {
        self.v4.disable();
        self.v6.disable();
        self.ifaces.clear_slots(AddressFamily::Ipv4);
        self.ifaces.clear_slots(AddressFamily::Ipv6);
    }

    /// Replace interfaces and configuration and rebuild all state.
    pub fn reload(&mut self, ifaces: InterfaceDirectory, config: MrouteConfig) {
        info!("Reloading multicast routing state");

        self.stop();
        self.v6
            .set_mc_forwarding_sysctl(config.daemon.forwarding_switch());
        self.ifaces = ifaces;
        self.config = config;
        self.start();
    }

    /// Apply every configured route. Returns how many succeeded.
    pub fn apply_config(&mut self) -> usize {
        let requests = self.config.to_requests();
        let mut applied = 0;

        for req in &requests {
            match self.apply(req) {
                Ok(()) => applied += 1,
                Err(e) => error!(
                    "Failed to apply route for {} on {}: {}",
                    req.group, req.inbound, e
                ),
            }
        }

        applied
    }

    /// Apply one route request to the family of its group.
    pub fn apply(&mut self, req: &RouteRequest) -> MrouteResult<()> {
        match req.family() {
            AddressFamily::Ipv4 => apply_request(&mut self.v4, &self.ifaces, req),
            AddressFamily::Ipv6 => apply_request(&mut self.v6, &self.ifaces, req),
        }
    }

    /// Upcall descriptor of an enabled family.
    pub fn upcall_fd(&self, family: AddressFamily) -> Option<RawFd> {
        match family {
            AddressFamily::Ipv4 => self.v4.upcall_fd(),
            AddressFamily::Ipv6 => self.v6.upcall_fd(),
        }
    }

    /// Handle a message read from a family's control channel.
    pub fn handle_upcall(&mut self, family: AddressFamily, buf: &[u8]) {
        match family {
            AddressFamily::Ipv4 => self.v4.handle_upcall(buf),
            AddressFamily::Ipv6 => self.v6.handle_upcall(buf),
        }
    }

    pub fn config(&self) -> &MrouteConfig {
        &self.config
    }

    pub fn ifaces(&self) -> &InterfaceDirectory {
        &self.ifaces
    }

    pub fn v4(&self) -> &MrouteMgr<V4, C4> {
        &self.v4
    }

    pub fn v4_mut(&mut self) -> &mut MrouteMgr<V4, C4> {
        &mut self.v4
    }

    pub fn v6(&self) -> &MrouteMgr<V6, C6> {
        &self.v6
    }

    pub fn v6_mut(&mut self) -> &mut MrouteMgr<V6, C6> {
        &mut self.v6
    }
}

fn enable_family<F: Family, C: ControlChannel<F>>(
    mgr: &mut MrouteMgr<F, C>,
    ifaces: &mut InterfaceDirectory,
) {
    match mgr.enable(ifaces) {
        Ok(()) => {}
        // Already logged at init severity
        Err(e) if e.is_soft_enable_failure() => {}
        Err(e) => error!("Failed to enable {} multicast routing: {}", F::NAME, e),
    }
}

fn apply_request<F: Family, C: ControlChannel<F>>(
    mgr: &mut MrouteMgr<F, C>,
    ifaces: &InterfaceDirectory,
    req: &RouteRequest,
) -> MrouteResult<()> {
    if !mgr.is_enabled() {
        return Err(MrouteError::Disabled { family: F::FAMILY });
    }

    let route = mgr.route_from_request(ifaces, req)?;
    match req.op {
        Operation::Add => mgr.add_route(route),
        Operation::Remove => mgr.del_route(&route),
    }
}
