//! Weighted Dominant Resource Fairness ordering.
//!
//! A sorter tracks a shared resource total plus a per-client, per-agent
//! allocation, and orders its active clients by ascending dominant share.
//! The engine keeps three kinds of sorter instances in lockstep: one over
//! all roles, one over quota'd roles, and one per role over its frameworks.

use std::collections::{BTreeMap, HashMap};

use strata_resources::{ResourceQuantities, Resources, Scalar};

use crate::ids::AgentId;

#[derive(Debug, Default)]
struct Client {
    active: bool,
    /// Allocation per agent, with allocation-role tags intact.
    allocations: HashMap<AgentId, Resources>,
    /// Cached scalar quantities of the total allocation.
    quantities: ResourceQuantities,
}

/// A weighted-DRF sorter over a set of clients.
///
/// Clients are keyed by opaque strings (role paths or framework ids).
/// Weights persist independently of client membership so that a weight
/// configured before a client appears still applies.
#[derive(Debug, Default)]
pub struct DrfSorter {
    clients: BTreeMap<String, Client>,
    weights: HashMap<String, f64>,

    /// Scalar quantities of the shared total (sum of added agent totals).
    total_quantities: ResourceQuantities,

    /// Scalar quantities allocated across all clients.
    allocation_quantities: ResourceQuantities,

    /// Resource names excluded from dominant-share calculation.
    fairness_exclude: std::collections::HashSet<String>,
}

impl DrfSorter {
    #[must_use]
    pub fn new(fairness_exclude: std::collections::HashSet<String>) -> Self {
        Self {
            fairness_exclude,
            ..Self::default()
        }
    }

    /// Adds a client in the deactivated state.
    ///
    /// Panics if the client is already present; membership is managed by
    /// the engine and a duplicate add is a bookkeeping bug.
    pub fn add(&mut self, client: &str) {
        let previous = self.clients.insert(client.to_string(), Client::default());
        assert!(previous.is_none(), "sorter already contains client {client}");
    }

    /// Removes a client and its allocation bookkeeping.
    pub fn remove(&mut self, client: &str) {
        let removed = self
            .clients
            .remove(client)
            .unwrap_or_else(|| panic!("sorter does not contain client {client}"));
        self.allocation_quantities -= removed.quantities;
    }

    pub fn activate(&mut self, client: &str) {
        self.client_mut(client).active = true;
    }

    pub fn deactivate(&mut self, client: &str) {
        self.client_mut(client).active = false;
    }

    #[must_use]
    pub fn contains(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    /// Number of clients, active or not.
    #[must_use]
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Sets the client's fair-share weight (default 1.0). The client does
    /// not need to be present yet.
    pub fn update_weight(&mut self, client: &str, weight: f64) {
        self.weights.insert(client.to_string(), weight);
    }

    /// Grows the shared total by an agent's resources.
    pub fn add_agent_total(&mut self, resources: &Resources) {
        self.total_quantities += resources.scalar_quantities();
    }

    /// Shrinks the shared total by an agent's resources.
    pub fn remove_agent_total(&mut self, resources: &Resources) {
        self.total_quantities -= resources.scalar_quantities();
    }

    /// Tracks an allocation to `client` on `agent`.
    pub fn allocated(&mut self, client: &str, agent: &AgentId, resources: &Resources) {
        let quantities = resources.scalar_quantities();
        let entry = self.client_mut(client);
        *entry.allocations.entry(agent.clone()).or_default() += resources;
        entry.quantities += &quantities;
        self.allocation_quantities += quantities;
    }

    /// Untracks an allocation from `client` on `agent`.
    pub fn unallocated(&mut self, client: &str, agent: &AgentId, resources: &Resources) {
        let quantities = resources.scalar_quantities();
        let entry = self.client_mut(client);
        if let Some(allocation) = entry.allocations.get_mut(agent) {
            *allocation -= resources;
            if allocation.is_empty() {
                entry.allocations.remove(agent);
            }
        }
        entry.quantities -= &quantities;
        self.allocation_quantities -= quantities;
    }

    /// Replaces part of a client's allocation on `agent` (conversions).
    pub fn update(&mut self, client: &str, agent: &AgentId, old: &Resources, new: &Resources) {
        self.unallocated(client, agent, old);
        if !new.is_empty() {
            self.allocated(client, agent, new);
        }
    }

    /// The client's allocation per agent.
    #[must_use]
    pub fn allocation(&self, client: &str) -> &HashMap<AgentId, Resources> {
        static EMPTY: std::sync::OnceLock<HashMap<AgentId, Resources>> = std::sync::OnceLock::new();
        self.clients
            .get(client)
            .map(|c| &c.allocations)
            .unwrap_or_else(|| EMPTY.get_or_init(HashMap::new))
    }

    /// The client's allocation on one agent, empty when none.
    #[must_use]
    pub fn allocation_of(&self, client: &str, agent: &AgentId) -> Resources {
        self.clients
            .get(client)
            .and_then(|c| c.allocations.get(agent))
            .cloned()
            .unwrap_or_default()
    }

    /// All clients with allocation on `agent`, with their allocations.
    #[must_use]
    pub fn allocations_on(&self, agent: &AgentId) -> Vec<(String, Resources)> {
        self.clients
            .iter()
            .filter_map(|(name, client)| {
                client
                    .allocations
                    .get(agent)
                    .map(|resources| (name.clone(), resources.clone()))
            })
            .collect()
    }

    /// Scalar quantities allocated to one client.
    #[must_use]
    pub fn allocation_quantities_of(&self, client: &str) -> ResourceQuantities {
        self.clients
            .get(client)
            .map(|c| c.quantities.clone())
            .unwrap_or_default()
    }

    /// Scalar quantities allocated across all clients.
    #[must_use]
    pub fn allocation_scalar_quantities(&self) -> &ResourceQuantities {
        &self.allocation_quantities
    }

    /// Scalar quantities of the shared total.
    #[must_use]
    pub fn total_scalar_quantities(&self) -> &ResourceQuantities {
        &self.total_quantities
    }

    /// Returns the active clients in ascending dominant-share order.
    ///
    /// The dominant share of a client is the maximum, over resource names
    /// not excluded from fairness, of allocated quantity divided by the
    /// shared total, divided by the client's weight. Clients with equal
    /// shares order lexicographically by name, which keeps the ordering
    /// deterministic under ties (fresh clients sort by name).
    #[must_use]
    pub fn sort(&self) -> Vec<String> {
        let mut entries: Vec<(f64, &String)> = self
            .clients
            .iter()
            .filter(|(_, client)| client.active)
            .map(|(name, client)| (self.dominant_share(name, client), name))
            .collect();

        entries.sort_by(|(share_a, name_a), (share_b, name_b)| {
            share_a
                .partial_cmp(share_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| name_a.cmp(name_b))
        });

        entries.into_iter().map(|(_, name)| name.clone()).collect()
    }

    fn dominant_share(&self, name: &str, client: &Client) -> f64 {
        let mut share: f64 = 0.0;
        for (resource, quantity) in client.quantities.iter() {
            if self.fairness_exclude.contains(resource) {
                continue;
            }
            let total = self.total_quantities.get(resource);
            if total == Scalar::ZERO {
                continue;
            }
            share = share.max(quantity.as_millis() as f64 / total.as_millis() as f64);
        }
        let weight = self.weights.get(name).copied().unwrap_or(1.0);
        share / weight
    }

    fn client_mut(&mut self, client: &str) -> &mut Client {
        self.clients
            .get_mut(client)
            .unwrap_or_else(|| panic!("sorter does not contain client {client}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(s: &str) -> Resources {
        s.parse().unwrap()
    }

    fn agent(s: &str) -> AgentId {
        AgentId::new(s)
    }

    fn sorter_with_total(total: &str) -> DrfSorter {
        let mut sorter = DrfSorter::new(Default::default());
        sorter.add_agent_total(&res(total));
        sorter
    }

    #[test]
    fn test_sort_orders_by_dominant_share() {
        let mut sorter = sorter_with_total("cpus:100;mem:1000");
        for client in ["a", "b", "c"] {
            sorter.add(client);
            sorter.activate(client);
        }

        // a: dominant share 50/100 cpus = 0.5
        sorter.allocated("a", &agent("s1"), &res("cpus:50;mem:100"));
        // b: dominant share 300/1000 mem = 0.3
        sorter.allocated("b", &agent("s1"), &res("cpus:10;mem:300"));
        // c: nothing, share 0.

        assert_eq!(sorter.sort(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_ties_break_lexicographically() {
        let mut sorter = sorter_with_total("cpus:10");
        for client in ["zeta", "alpha"] {
            sorter.add(client);
            sorter.activate(client);
        }
        assert_eq!(sorter.sort(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_weight_divides_share() {
        let mut sorter = sorter_with_total("cpus:100");
        for client in ["a", "b"] {
            sorter.add(client);
            sorter.activate(client);
        }
        sorter.update_weight("b", 2.0);

        sorter.allocated("a", &agent("s1"), &res("cpus:20"));
        sorter.allocated("b", &agent("s1"), &res("cpus:30"));

        // a: 0.2 / 1.0 = 0.2; b: 0.3 / 2.0 = 0.15, so b sorts first.
        assert_eq!(sorter.sort(), vec!["b", "a"]);
    }

    #[test]
    fn test_deactivated_clients_are_hidden_but_keep_allocation() {
        let mut sorter = sorter_with_total("cpus:10");
        sorter.add("a");
        sorter.activate("a");
        sorter.allocated("a", &agent("s1"), &res("cpus:4"));

        sorter.deactivate("a");
        assert!(sorter.sort().is_empty());
        assert_eq!(
            sorter.allocation_quantities_of("a"),
            "cpus:4".parse().unwrap()
        );

        sorter.activate("a");
        assert_eq!(sorter.sort(), vec!["a"]);
    }

    #[test]
    fn test_fairness_exclusions() {
        let exclude: std::collections::HashSet<String> =
            ["gpus".to_string()].into_iter().collect();
        let mut sorter = DrfSorter::new(exclude);
        sorter.add_agent_total(&res("cpus:10;gpus:1"));
        for client in ["a", "b"] {
            sorter.add(client);
            sorter.activate(client);
        }

        // a holds the whole excluded resource; b holds a little cpu.
        sorter.allocated("a", &agent("s1"), &res("gpus:1"));
        sorter.allocated("b", &agent("s1"), &res("cpus:1"));

        // gpus are ignored, so a's share is zero and it sorts first.
        assert_eq!(sorter.sort(), vec!["a", "b"]);
    }

    #[test]
    fn test_unallocated_and_update() {
        let mut sorter = sorter_with_total("cpus:10;mem:100");
        sorter.add("a");
        sorter.activate("a");

        sorter.allocated("a", &agent("s1"), &res("cpus:4;mem:40"));
        sorter.update(
            "a",
            &agent("s1"),
            &res("cpus:4;mem:40"),
            &res("cpus:2;mem:20"),
        );
        assert_eq!(
            sorter.allocation_of("a", &agent("s1")),
            res("cpus:2;mem:20")
        );

        sorter.unallocated("a", &agent("s1"), &res("cpus:2;mem:20"));
        assert!(sorter.allocation_of("a", &agent("s1")).is_empty());
        assert!(sorter.allocation_scalar_quantities().is_empty());
    }

    #[test]
    fn test_allocations_on_agent() {
        let mut sorter = sorter_with_total("cpus:10");
        for client in ["a", "b"] {
            sorter.add(client);
            sorter.activate(client);
        }
        sorter.allocated("a", &agent("s1"), &res("cpus:1"));
        sorter.allocated("b", &agent("s1"), &res("cpus:2"));
        sorter.allocated("b", &agent("s2"), &res("cpus:3"));

        let on_s1 = sorter.allocations_on(&agent("s1"));
        assert_eq!(on_s1.len(), 2);
        let on_s2 = sorter.allocations_on(&agent("s2"));
        assert_eq!(on_s2, vec![("b".to_string(), res("cpus:3"))]);
    }

    #[test]
    #[should_panic(expected = "already contains")]
    fn test_duplicate_add_panics() {
        let mut sorter = DrfSorter::default();
        sorter.add("a");
        sorter.add("a");
    }

    #[test]
    fn test_remove_client_clears_aggregate() {
        let mut sorter = sorter_with_total("cpus:10");
        sorter.add("a");
        sorter.activate("a");
        sorter.allocated("a", &agent("s1"), &res("cpus:4"));
        sorter.remove("a");
        assert!(sorter.allocation_scalar_quantities().is_empty());
        assert_eq!(sorter.count(), 0);
    }
}
