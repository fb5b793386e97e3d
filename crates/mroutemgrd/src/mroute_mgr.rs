//! Multicast route manager - per-family routing subsystem facade

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use mroute_common::{sysctl, Family, MrouteError, MrouteResult, Slot};
use tracing::{debug, error, info, instrument, warn};

use crate::iface::InterfaceDirectory;
use crate::kernel::{ControlChannel, MrouteApi};
use crate::store::RouteStore;
use crate::types::{ForwardingVector, Route, RouteRequest};
use crate::upcall::{UpcallFamily, UpcallKind};
use crate::vif::VifTable;

/// Multicast route manager for one family.
///
/// Sequences enable/disable, assigns kernel slots to interfaces and
/// dispatches route requests and upcalls to the route store or straight
/// to the kernel.
pub struct MrouteMgr<F: Family, C: ControlChannel<F>> {
    api: MrouteApi<F, C>,
    vifs: VifTable<F>,
    store: RouteStore<F>,
    /// Multicast forwarding switch toggled on enable
    mc_forwarding_sysctl: Option<PathBuf>,
}

impl<F: Family, C: ControlChannel<F>> MrouteMgr<F, C> {
    /// Create a new manager around a control channel.
    pub fn new(channel: C) -> Self {
        Self {
            api: MrouteApi::new(channel),
            vifs: VifTable::new(),
            store: RouteStore::new(),
            mc_forwarding_sysctl: F::MC_FORWARDING_SYSCTL.map(PathBuf::from),
        }
    }

    /// Overrides (or disables, with `None`) the forwarding switch path.
    pub fn with_mc_forwarding_sysctl(mut self, path: Option<PathBuf>) -> Self {
        self.mc_forwarding_sysctl = path;
        self
    }

    pub fn set_mc_forwarding_sysctl(&mut self, path: Option<PathBuf>) {
        self.mc_forwarding_sysctl = path;
    }

    /// Enable multicast routing for this family.
    ///
    /// Opens the control channel, then gives every eligible interface in
    /// `ifaces` a slot. Loopback interfaces, and interfaces without an
    /// address of this family, are marked as having no slot. A failure to
    /// open the channel is returned; the family then stays disabled.
    #[instrument(skip_all, fields(family = F::NAME))]
    pub fn enable(&mut self, ifaces: &mut InterfaceDirectory) -> MrouteResult<()> {
        if self.api.is_enabled() {
            debug!("{} multicast routing already enabled", F::NAME);
            return Ok(());
        }

        self.api.enable()?;

        self.vifs.clear();
        self.store.teardown_all();

        ifaces.clear_slots(F::FAMILY);

        for iface in ifaces.iter_mut() {
            if iface.loopback || !iface.multicast || !iface.has_family(F::FAMILY) {
                continue;
            }

            let api = &mut self.api;
            // Logged by the slot table or the adapter; the interface is
            // simply left unrouted
            let _ = self
                .vifs
                .assign(iface, |slot, iface| api.add_slot(slot, iface));
        }

        info!(
            "{} multicast routing enabled with {} {}(s)",
            F::NAME,
            self.vifs.len(),
            F::SLOT_NAME
        );

        self.enable_mc_forwarding();

        Ok(())
    }

    /// Best-effort toggle of the system's multicast forwarding switch.
    fn enable_mc_forwarding(&self) {
        let Some(path) = &self.mc_forwarding_sysctl else {
            return;
        };

        if sysctl::read_value(path).is_ok_and(|v| v == 1) {
            debug!("{} mc_forwarding already enabled", F::NAME);
            return;
        }

        match sysctl::write_value(path, 1) {
            Ok(()) => debug!("Enabled {} mc_forwarding", F::NAME),
            Err(e) if sysctl::is_permission_denied(&e) => {
                debug!("No permission to set {}: {}", path.display(), e)
            }
            Err(e) => error!("Failed enabling {} mc_forwarding: {}", F::NAME, e),
        }
    }

    /// Disable multicast routing for this family.
    ///
    /// The kernel's "done" operation flushes every forwarding entry, so
    /// the stored routes are dropped without individual removals.
    #[instrument(skip_all, fields(family = F::NAME))]
    pub fn disable(&mut self) {
        if !self.api.is_enabled() {
            return;
        }

        self.api.disable();
        self.store.teardown_all();
        self.vifs.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.api.is_enabled()
    }

    fn ensure_enabled(&self) -> MrouteResult<()> {
        if self.api.is_enabled() {
            Ok(())
        } else {
            Err(MrouteError::Disabled { family: F::FAMILY })
        }
    }

    /// Add a route. A wildcard sender stores a (*,G) template; anything
    /// else is installed in the kernel right away.
    #[instrument(skip(self), fields(route = %route))]
    pub fn add_route(&mut self, route: Route<F>) -> MrouteResult<()> {
        self.ensure_enabled()?;

        if route.is_wildcard() {
            self.store.add_template(route);
            Ok(())
        } else {
            self.store.add_concrete(&mut self.api, &route)
        }
    }

    /// Remove a route. Removing a (*,G) template also removes every route
    /// spawned from it.
    #[instrument(skip(self), fields(route = %route))]
    pub fn del_route(&mut self, route: &Route<F>) -> MrouteResult<()> {
        self.ensure_enabled()?;

        if route.is_wildcard() {
            self.store
                .remove_template(&mut self.api, route.sender, route.group, route.inbound)
        } else {
            self.api.remove(route.sender, route.group)
        }
    }

    /// Handle a kernel upcall for unmatched traffic: install (S,G) if a
    /// (*,G) template covers it, otherwise report [`MrouteError::NoMatch`].
    pub fn dynamic_add(
        &mut self,
        sender: F::Addr,
        group: F::Addr,
        inbound: Slot,
    ) -> MrouteResult<()> {
        self.ensure_enabled()?;
        self.store
            .resolve_dynamic(&mut self.api, sender, group, inbound)
    }

    /// Translate a route request into a route, mapping interface names to
    /// this family's slots.
    ///
    /// The inbound interface is never used as an outbound slot.
    pub fn route_from_request(
        &self,
        ifaces: &InterfaceDirectory,
        req: &RouteRequest,
    ) -> MrouteResult<Route<F>> {
        let group = F::from_ip(req.group).ok_or_else(|| MrouteError::FamilyMismatch {
            addr: req.group.to_string(),
            expected: F::FAMILY,
        })?;

        if !F::is_multicast(&group) {
            return Err(MrouteError::invalid_config(
                "group",
                format!("{} is not a multicast address", group),
            ));
        }

        let sender = match req.source {
            Some(source) => F::from_ip(source).ok_or_else(|| MrouteError::FamilyMismatch {
                addr: source.to_string(),
                expected: F::FAMILY,
            })?,
            None => F::WILDCARD,
        };

        let inbound = ifaces.slot_of(F::FAMILY, &req.inbound)?;

        let mut ttl = ForwardingVector::new();
        for (name, &threshold) in &req.outbound {
            let slot = ifaces.slot_of(F::FAMILY, name)?;
            if slot == inbound {
                debug!("Skipping inbound interface {} as outbound", name);
                continue;
            }
            ttl.set(slot, threshold);
        }

        Ok(Route::new(sender, group, inbound, ttl))
    }

    /// File descriptor kernel upcalls arrive on, while enabled.
    pub fn upcall_fd(&self) -> Option<RawFd> {
        self.api.upcall_fd()
    }

    pub fn vifs(&self) -> &VifTable<F> {
        &self.vifs
    }

    pub fn store(&self) -> &RouteStore<F> {
        &self.store
    }

    pub fn api(&self) -> &MrouteApi<F, C> {
        &self.api
    }

    pub fn channel(&self) -> &C {
        self.api.channel()
    }

    pub fn channel_mut(&mut self) -> &mut C {
        self.api.channel_mut()
    }
}

impl<F: UpcallFamily, C: ControlChannel<F>> MrouteMgr<F, C> {
    /// Handle one message read from the control channel.
    ///
    /// Only "no cache entry" upcalls are acted on. Traffic with no
    /// matching (*,G) template is left to the kernel.
    pub fn handle_upcall(&mut self, buf: &[u8]) {
        let upcall = match F::decode_upcall(buf) {
            Ok(Some(upcall)) => upcall,
            Ok(None) => return,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        if upcall.kind != UpcallKind::NoCache {
            debug!(
                "Ignoring {} upcall for ({}, {}) on {} {}",
                upcall.kind,
                upcall.sender,
                upcall.group,
                F::SLOT_NAME,
                upcall.inbound
            );
            return;
        }

        match self.dynamic_add(upcall.sender, upcall.group, upcall.inbound) {
            Ok(()) => {}
            Err(e) if e.is_no_match() => {}
            Err(e) => debug!("Dynamic add failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::Interface;
    use crate::kernel::{KernelOp, RecordingChannel};
    use mroute_common::{AddressFamily, V4, V6};
    use nix::errno::Errno;
    use std::net::Ipv4Addr;

    fn ifaces() -> InterfaceDirectory {
        [
            Interface::new("lo", 1)
                .with_inaddr(Ipv4Addr::LOCALHOST)
                .with_inet6()
                .with_loopback(),
            Interface::new("eth0", 2)
                .with_inaddr(Ipv4Addr::new(10, 0, 0, 1))
                .with_inet6(),
            Interface::new("eth1", 3).with_inaddr(Ipv4Addr::new(10, 0, 1, 1)),
            Interface::new("eth2", 4).with_inet6(),
        ]
        .into_iter()
        .collect()
    }

    fn mgr_v4() -> MrouteMgr<V4, RecordingChannel<V4>> {
        MrouteMgr::new(RecordingChannel::new())
    }

    #[test]
    fn test_enable_assigns_slots() {
        let mut dir = ifaces();
        let mut mgr = mgr_v4();

        mgr.enable(&mut dir).unwrap();

        assert!(mgr.is_enabled());
        assert_eq!(mgr.vifs().len(), 2);
        assert_eq!(dir.slot_of(AddressFamily::Ipv4, "eth0").unwrap(), 0);
        assert_eq!(dir.slot_of(AddressFamily::Ipv4, "eth1").unwrap(), 1);
        assert_eq!(dir.find_by_name("lo").unwrap().vif, None);
        assert_eq!(dir.find_by_name("eth2").unwrap().vif, None);
        assert_eq!(mgr.channel().ops()[0], KernelOp::Init);
    }

    #[test]
    fn test_enable_v6_uses_mifs() {
        let mut dir = ifaces();
        let mut mgr = MrouteMgr::<V6, _>::new(RecordingChannel::new())
            .with_mc_forwarding_sysctl(None);

        mgr.enable(&mut dir).unwrap();

        assert_eq!(mgr.vifs().len(), 2);
        assert_eq!(dir.find_by_name("eth0").unwrap().mif, Some(0));
        assert_eq!(dir.find_by_name("eth2").unwrap().mif, Some(1));
        assert_eq!(dir.find_by_name("eth1").unwrap().mif, None);
        assert_eq!(dir.find_by_name("lo").unwrap().mif, None);
    }

    #[test]
    fn test_enable_soft_failure() {
        let mut dir = ifaces();
        let mut mgr = MrouteMgr::<V4, _>::new(
            RecordingChannel::new().with_open_error(Errno::EADDRINUSE),
        );

        let err = mgr.enable(&mut dir).unwrap_err();

        assert!(err.is_soft_enable_failure());
        assert!(!mgr.is_enabled());
        assert!(mgr.vifs().is_empty());
        assert!(matches!(
            mgr.add_route(Route::wildcard(
                Ipv4Addr::new(239, 1, 1, 1),
                0,
                ForwardingVector::new()
            )),
            Err(MrouteError::Disabled { .. })
        ));
    }

    #[test]
    fn test_slot_registration_failure_skips_interface() {
        let mut dir = ifaces();
        let mut mgr = MrouteMgr::<V4, _>::new(
            RecordingChannel::new().with_add_slot_error(Errno::EADDRNOTAVAIL),
        );

        mgr.enable(&mut dir).unwrap();

        assert!(mgr.vifs().is_empty());
        assert_eq!(dir.find_by_name("eth0").unwrap().vif, None);
    }

    #[test]
    fn test_enable_skips_non_multicast_interface() {
        let mut dir = ifaces();
        if let Some(eth1) = dir.iter_mut().find(|i| i.name == "eth1") {
            eth1.multicast = false;
        }
        let mut mgr = mgr_v4();

        mgr.enable(&mut dir).unwrap();

        assert_eq!(mgr.vifs().len(), 1);
        assert_eq!(dir.find_by_name("eth0").and_then(|i| i.vif), Some(0));
        assert_eq!(dir.find_by_name("eth1").and_then(|i| i.vif), None);
    }

    #[test]
    fn test_enable_clears_stale_slots() {
        let mut dir = ifaces();
        if let Some(eth2) = dir.iter_mut().find(|i| i.name == "eth2") {
            eth2.vif = Some(7);
        }
        let mut mgr = mgr_v4();

        mgr.enable(&mut dir).unwrap();

        assert_eq!(dir.find_by_name("eth2").and_then(|i| i.vif), None);
    }

    #[test]
    fn test_route_from_request() {
        let mut dir = ifaces();
        let mut mgr = mgr_v4();
        mgr.enable(&mut dir).unwrap();

        let req = RouteRequest::add(None, "239.1.1.1".parse().unwrap(), "eth0")
            .with_outbound("eth0")
            .with_outbound_ttl("eth1", 4);
        let route = mgr.route_from_request(&dir, &req).unwrap();

        assert!(route.is_wildcard());
        assert_eq!(route.inbound, 0);
        assert_eq!(route.ttl.get(0), 0);
        assert_eq!(route.ttl.get(1), 4);
    }

    #[test]
    fn test_route_from_request_errors() {
        let mut dir = ifaces();
        let mut mgr = mgr_v4();
        mgr.enable(&mut dir).unwrap();

        let v6 = RouteRequest::add(None, "ff05::1".parse().unwrap(), "eth0");
        assert!(matches!(
            mgr.route_from_request(&dir, &v6),
            Err(MrouteError::FamilyMismatch { .. })
        ));

        let mixed = RouteRequest::add(
            Some("2001:db8::1".parse().unwrap()),
            "239.1.1.1".parse().unwrap(),
            "eth0",
        );
        assert!(matches!(
            mgr.route_from_request(&dir, &mixed),
            Err(MrouteError::FamilyMismatch { .. })
        ));

        let unicast = RouteRequest::add(None, "10.1.1.1".parse().unwrap(), "eth0");
        assert!(matches!(
            mgr.route_from_request(&dir, &unicast),
            Err(MrouteError::InvalidConfig { .. })
        ));

        let unrouted = RouteRequest::add(None, "239.1.1.1".parse().unwrap(), "eth2");
        assert!(matches!(
            mgr.route_from_request(&dir, &unrouted),
            Err(MrouteError::NoSlot { .. })
        ));

        let unknown =
            RouteRequest::add(None, "239.1.1.1".parse().unwrap(), "eth0").with_outbound("eth9");
        assert!(matches!(
            mgr.route_from_request(&dir, &unknown),
            Err(MrouteError::UnknownInterface { .. })
        ));
    }

    #[test]
    fn test_concrete_route_not_stored() {
        let mut dir = ifaces();
        let mut mgr = mgr_v4();
        mgr.enable(&mut dir).unwrap();
        mgr.channel_mut().take_ops();

        let route = Route::<V4>::new(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(239, 1, 1, 1),
            0,
            ForwardingVector::from([(1, 1)]),
        );
        mgr.add_route(route).unwrap();
        mgr.del_route(&route).unwrap();

        assert!(mgr.store().is_empty());
        assert_eq!(
            mgr.channel().ops(),
            &[
                KernelOp::AddRoute(route),
                KernelOp::DelRoute {
                    sender: route.sender,
                    group: route.group
                }
            ]
        );
    }

    #[test]
    fn test_disable_drops_state() {
        let mut dir = ifaces();
        let mut mgr = mgr_v4();
        mgr.enable(&mut dir).unwrap();
        let group = Ipv4Addr::new(239, 1, 1, 1);
        mgr.add_route(Route::wildcard(group, 0, ForwardingVector::from([(1, 1)])))
            .unwrap();
        mgr.dynamic_add(Ipv4Addr::new(10, 0, 0, 5), group, 0).unwrap();
        mgr.channel_mut().take_ops();

        mgr.disable();

        assert!(!mgr.is_enabled());
        assert!(mgr.store().is_empty());
        assert!(mgr.vifs().is_empty());
        assert_eq!(mgr.channel().ops(), &[KernelOp::Done]);
    }

    #[test]
    fn test_mc_forwarding_toggle() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "0").unwrap();
        let mut dir = ifaces();
        let mut mgr = MrouteMgr::<V6, _>::new(RecordingChannel::new())
            .with_mc_forwarding_sysctl(Some(file.path().to_path_buf()));

        mgr.enable(&mut dir).unwrap();

        assert_eq!(sysctl::read_value(file.path()).unwrap(), 1);
    }

    #[test]
    fn test_mc_forwarding_already_set_is_left_alone() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "1\n").unwrap();
        let mut dir = ifaces();
        let mut mgr = MrouteMgr::<V6, _>::new(RecordingChannel::new())
            .with_mc_forwarding_sysctl(Some(file.path().to_path_buf()));

        mgr.enable(&mut dir).unwrap();

        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "1\n");
    }

    #[test]
    fn test_mc_forwarding_failure_is_not_fatal() {
        let dir_path = tempfile::tempdir().unwrap();
        let mut dir = ifaces();
        let mut mgr = MrouteMgr::<V6, _>::new(RecordingChannel::new())
            .with_mc_forwarding_sysctl(Some(dir_path.path().join("missing")));

        mgr.enable(&mut dir).unwrap();

        assert!(mgr.is_enabled());
    }

    fn nocache(vif: u8, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut buf = vec![0u8; crate::upcall::IGMPMSG_LEN];
        buf[8] = 1;
        buf[10] = vif;
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        buf
    }

    #[test]
    fn test_handle_upcall_spawns_dynamic_route() {
        let mut dir = ifaces();
        let mut mgr = mgr_v4();
        mgr.enable(&mut dir).unwrap();
        let group = Ipv4Addr::new(239, 1, 1, 1);
        mgr.add_route(Route::wildcard(group, 0, ForwardingVector::from([(1, 1)])))
            .unwrap();
        mgr.channel_mut().take_ops();

        mgr.handle_upcall(&nocache(0, [10, 0, 0, 5], [239, 1, 1, 1]));
        // No template for this inbound slot
        mgr.handle_upcall(&nocache(1, [10, 0, 0, 6], [239, 1, 1, 1]));
        // Not an upcall
        let mut packet = nocache(0, [10, 0, 0, 7], [239, 1, 1, 1]);
        packet[9] = 2;
        mgr.handle_upcall(&packet);

        assert_eq!(mgr.store().dynamic_count(), 1);
        assert_eq!(
            mgr.channel().added_routes(),
            vec![Route::<V4>::new(
                Ipv4Addr::new(10, 0, 0, 5),
                group,
                0,
                ForwardingVector::from([(1, 1)])
            )]
        );
    }

    #[test]
    fn test_handle_upcall_ignores_wrongvif() {
        let mut dir = ifaces();
        let mut mgr = mgr_v4();
        mgr.enable(&mut dir).unwrap();
        let group = Ipv4Addr::new(239, 1, 1, 1);
        mgr.add_route(Route::wildcard(group, 0, ForwardingVector::from([(1, 1)])))
            .unwrap();

        let mut buf = nocache(0, [10, 0, 0, 5], [239, 1, 1, 1]);
        buf[8] = 2;
        mgr.handle_upcall(&buf);

        assert_eq!(mgr.store().dynamic_count(), 0);
    }
}
