//! Route store
//!
//! Holds the configured (*,G) templates and the (S,G) routes spawned from
//! them at runtime. Dynamic routes are indexed by their template's
//! (group, inbound) key, so removing a template finds its children without
//! scanning.

use std::collections::HashMap;

use mroute_common::{Family, MrouteError, MrouteResult, Slot};
use tracing::{debug, info, warn};

use crate::kernel::{ControlChannel, MrouteApi, RouteKind};
use crate::types::{Route, RouteKey};

/// Identifier of a stored dynamic route.
pub type DynamicId = u64;

/// Template and dynamic route collections for one family.
#[derive(Debug, Clone)]
pub struct RouteStore<F: Family> {
    /// Oldest first; matching walks from the back
    templates: Vec<Route<F>>,
    dynamic: HashMap<DynamicId, Route<F>>,
    /// Template key -> dynamic routes spawned under it, oldest first, one
    /// per sender
    children: HashMap<RouteKey<F>, Vec<DynamicId>>,
    next_id: DynamicId,
}

impl<F: Family> RouteStore<F> {
    pub fn new() -> Self {
        Self {
            templates: Vec::new(),
            dynamic: HashMap::new(),
            children: HashMap::new(),
            next_id: 0,
        }
    }

    /// Stores a (*,G) template. Nothing reaches the kernel until a sender
    /// shows up. Duplicates are kept; the newest one wins on match.
    pub fn add_template(&mut self, route: Route<F>) {
        debug!(
            "Adding (*,G) template ({}, {}) {}: {}",
            route.sender,
            route.group,
            F::SLOT_NAME,
            route.inbound
        );
        self.templates.push(route);
    }

    /// Installs a route with an explicit sender. Such routes are not kept.
    pub fn add_concrete<C: ControlChannel<F>>(
        &mut self,
        api: &mut MrouteApi<F, C>,
        route: &Route<F>,
    ) -> MrouteResult<()> {
        api.install(route, RouteKind::Concrete)
    }

    /// Finds the newest template for (group, inbound).
    pub fn find_template(&self, group: F::Addr, inbound: Slot) -> Option<&Route<F>> {
        self.templates
            .iter()
            .rev()
            .find(|t| t.group == group && t.inbound == inbound)
    }

    /// Removes every template for (group, inbound) together with all the
    /// dynamic routes spawned under it, then removes (sender, group) from
    /// the kernel as well.
    ///
    /// Failures removing children are logged and skipped; the returned
    /// result is that of the final (sender, group) removal.
    pub fn remove_template<C: ControlChannel<F>>(
        &mut self,
        api: &mut MrouteApi<F, C>,
        sender: F::Addr,
        group: F::Addr,
        inbound: Slot,
    ) -> MrouteResult<()> {
        let key = RouteKey { group, inbound };

        if self.templates.iter().any(|t| t.key() == key) {
            debug!(
                "Found (*,G) match for ({}, {}), removing spawned routes",
                sender, group
            );

            for route in self.take_children(&key) {
                // Already logged by the adapter
                let _ = api.remove(route.sender, route.group);
            }

            let before = self.templates.len();
            self.templates.retain(|t| t.key() != key);
            info!(
                "Removed {} (*,{}) template(s) on {} {}",
                before - self.templates.len(),
                group,
                F::SLOT_NAME,
                inbound
            );
        }

        api.remove(sender, group)
    }

    /// Resolves an upcall for (sender, group) on `inbound` against the
    /// templates. On a match the template's forwarding vector is copied
    /// into a new dynamic route, which is recorded and installed.
    pub fn resolve_dynamic<C: ControlChannel<F>>(
        &mut self,
        api: &mut MrouteApi<F, C>,
        sender: F::Addr,
        group: F::Addr,
        inbound: Slot,
    ) -> MrouteResult<()> {
        let Some(template) = self.find_template(group, inbound) else {
            debug!("No (*,G) match for ({}, {})", sender, group);
            return Err(MrouteError::NoMatch {
                sender: sender.to_string(),
                group: group.to_string(),
                inbound,
            });
        };

        debug!("Found (*,G) match for ({}, {})", sender, group);
        let route = template.with_sender(sender);

        if self.record_dynamic(route).is_none() {
            // The kernel route can still be installed, it just cannot be
            // torn down with its template
            warn!(
                "Failed recording dynamic route {}, installing untracked",
                route
            );
        }

        api.install(&route, RouteKind::Dynamic)
    }

    /// Records a dynamic route, returning `None` if storage for it could
    /// not be allocated. A sender already recorded under the same template
    /// keeps its id and has its route replaced.
    fn record_dynamic(&mut self, route: Route<F>) -> Option<DynamicId> {
        let key = route.key();
        let siblings = self.children.entry(key).or_default();

        let existing = siblings.iter().copied().find(|id| {
            self.dynamic
                .get(id)
                .is_some_and(|child| child.sender == route.sender)
        });
        if let Some(id) = existing {
            self.dynamic.insert(id, route);
            return Some(id);
        }

        self.dynamic.try_reserve(1).ok()?;
        siblings.try_reserve(1).ok()?;

        let id = self.next_id;
        self.next_id += 1;
        siblings.push(id);
        self.dynamic.insert(id, route);

        Some(id)
    }

    /// Unlinks and returns every dynamic route under `key`, newest first.
    fn take_children(&mut self, key: &RouteKey<F>) -> Vec<Route<F>> {
        let ids = self.children.remove(key).unwrap_or_default();
        ids.into_iter()
            .rev()
            .filter_map(|id| self.dynamic.remove(&id))
            .collect()
    }

    /// Drops both collections without touching the kernel; the kernel's
    /// "done" operation has already flushed its entries.
    pub fn teardown_all(&mut self) {
        debug!(
            "Dropping {} template(s) and {} dynamic route(s)",
            self.templates.len(),
            self.dynamic.len()
        );
        self.templates.clear();
        self.dynamic.clear();
        self.children.clear();
    }

    /// Templates, oldest first.
    pub fn templates(&self) -> &[Route<F>] {
        &self.templates
    }

    /// Dynamic routes, in no particular order.
    pub fn dynamic(&self) -> impl Iterator<Item = &Route<F>> {
        self.dynamic.values()
    }

    /// Dynamic routes spawned under (group, inbound), oldest first.
    pub fn dynamic_for(&self, group: F::Addr, inbound: Slot) -> Vec<&Route<F>> {
        self.children
            .get(&RouteKey { group, inbound })
            .map(|ids| ids.iter().filter_map(|id| self.dynamic.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn dynamic_count(&self) -> usize {
        self.dynamic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty() && self.dynamic.is_empty()
    }
}

impl<F: Family> Default for RouteStore<F> {
    fn default() -> Self {
        Self::new()
    }
}
