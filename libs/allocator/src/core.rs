//! The hierarchical allocation engine.
//!
//! The engine is responsible for:
//! - Tracking agents, frameworks, roles, quotas, weights, and reservations
//! - Running the two-stage allocation cycle (quota satisfaction, then fair
//!   share) over the current candidate agents
//! - Emitting maintenance inverse offers during the deallocation phase
//! - Keeping the role, quota-role, and per-role framework sorters mutually
//!   consistent with agent state
//!
//! All methods are synchronous; serialization is the caller's concern (the
//! actor in [`crate::actor`] owns an engine on a dedicated task). Entry
//! points panic on preconditions a correct master can never violate
//! (duplicate adds, unknown ids) and silently ignore documented
//! partial-view races (e.g. resource recovery for an already-removed
//! agent).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::seq::SliceRandom;
use strata_resources::{roles, ResourceQuantities, Resources, Scalar, Value};
use tracing::{debug, info, warn};

use crate::actor::AllocatorMessage;
use crate::agent::{
    Agent, AgentCapabilities, AgentInfo, InverseOfferStatus, Maintenance, Unavailability,
    UnavailableResources,
};
use crate::error::{AllocatorError, AllocatorResult};
use crate::filters::{self, Refusal, RefusedInverseOfferFilter, RefusedOfferFilter};
use crate::framework::{Framework, FrameworkCapabilities, FrameworkSpec};
use crate::ids::{AgentId, FrameworkId};
use crate::metrics::CompletedFrameworks;
use crate::options::AllocatorOptions;
use crate::sorter::DrfSorter;

/// Offers produced for one framework in one cycle: role → agent → resources.
pub type Offers = HashMap<String, HashMap<AgentId, Resources>>;

/// Inverse offers produced for one framework in one cycle.
pub type InverseOffers = HashMap<AgentId, UnavailableResources>;

/// Invoked once per cycle per framework with any offer.
pub type OfferCallback = Box<dyn Fn(&FrameworkId, Offers) + Send>;

/// Invoked once per cycle per framework with any inverse offer.
pub type InverseOfferCallback = Box<dyn Fn(&FrameworkId, InverseOffers) + Send>;

/// One resource conversion: `consumed` is replaced by `converted`.
///
/// An empty `consumed` denotes additional allocation of an already
/// allocated shared resource; an empty `converted` removes the consumed
/// resources outright.
#[derive(Debug, Clone, Default)]
pub struct ResourceConversion {
    pub consumed: Resources,
    pub converted: Resources,
}

/// A fair-share weight override for one role.
#[derive(Debug, Clone)]
pub struct WeightSpec {
    pub role: String,
    pub weight: f64,
}

/// How long allocation stays paused during recovery before resuming
/// regardless of how many agents re-registered.
const RECOVERY_HOLD_OFF: Duration = Duration::from_secs(10 * 60);

/// Fraction of the expected agent count that must re-register before
/// recovery resumes allocation early.
const AGENT_RECOVERY_FACTOR: f64 = 0.8;

/// The hierarchical DRF allocation engine.
pub struct HierarchicalAllocator {
    options: AllocatorOptions,
    offer_callback: OfferCallback,
    inverse_offer_callback: InverseOfferCallback,

    /// Route back onto the owning actor, when there is one. Standalone
    /// engines (no actor) skip filter-expiry and recovery timers; their
    /// caller drives cycles and filter removal explicitly.
    self_tx: Option<tokio::sync::mpsc::WeakUnboundedSender<AllocatorMessage>>,

    frameworks: HashMap<FrameworkId, Framework>,
    agents: HashMap<AgentId, Agent>,

    /// Role → frameworks subscribed to it or holding allocation in it.
    roles: HashMap<String, HashSet<FrameworkId>>,

    role_sorter: DrfSorter,
    quota_role_sorter: DrfSorter,
    framework_sorters: HashMap<String, DrfSorter>,

    /// Top-level role → quota guarantee.
    quota_guarantees: HashMap<String, ResourceQuantities>,

    /// Role → reservation quantities, aggregated hierarchically (each
    /// reservation also counts toward every ancestor).
    reservation_scalar_quantities: HashMap<String, ResourceQuantities>,

    /// Agent hostnames eligible for offers; `None` admits all.
    whitelist: Option<HashSet<String>>,

    allocation_candidates: HashSet<AgentId>,
    allocation_pending: bool,
    paused: bool,

    /// During recovery: the agent count at which allocation resumes early.
    expected_agent_count: Option<usize>,

    completed_framework_metrics: CompletedFrameworks,
}

impl HierarchicalAllocator {
    /// Creates a standalone engine. Allocation cycles are driven by the
    /// caller through [`Self::run_allocation_cycle`]; installed filters do
    /// not expire on their own (there is no timer task to fire them).
    #[must_use]
    pub fn new(
        options: AllocatorOptions,
        offer_callback: OfferCallback,
        inverse_offer_callback: InverseOfferCallback,
    ) -> Self {
        Self::build(options, offer_callback, inverse_offer_callback, None)
    }

    /// Creates an engine owned by an actor that receives self-dispatched
    /// messages (allocation runs, filter expiries, recovery resume).
    pub(crate) fn with_dispatcher(
        options: AllocatorOptions,
        offer_callback: OfferCallback,
        inverse_offer_callback: InverseOfferCallback,
        self_tx: tokio::sync::mpsc::WeakUnboundedSender<AllocatorMessage>,
    ) -> Self {
        Self::build(options, offer_callback, inverse_offer_callback, Some(self_tx))
    }

    fn build(
        options: AllocatorOptions,
        offer_callback: OfferCallback,
        inverse_offer_callback: InverseOfferCallback,
        self_tx: Option<tokio::sync::mpsc::WeakUnboundedSender<AllocatorMessage>>,
    ) -> Self {
        let completed_framework_metrics =
            CompletedFrameworks::new(options.max_completed_frameworks);
        let exclude = options.fairness_exclude_resource_names.clone();
        Self {
            options,
            offer_callback,
            inverse_offer_callback,
            self_tx,
            frameworks: HashMap::new(),
            agents: HashMap::new(),
            roles: HashMap::new(),
            role_sorter: DrfSorter::new(exclude.clone()),
            quota_role_sorter: DrfSorter::new(exclude),
            framework_sorters: HashMap::new(),
            quota_guarantees: HashMap::new(),
            reservation_scalar_quantities: HashMap::new(),
            whitelist: None,
            allocation_candidates: HashSet::new(),
            allocation_pending: false,
            paused: false,
            expected_agent_count: None,
            completed_framework_metrics,
        }
    }

    // =========================================================================
    // Recovery, pause/resume
    // =========================================================================

    /// Installs recovered quotas and, when enough agents are expected to
    /// re-register, pauses allocation until a sufficient share of them is
    /// back (or a hold-off timer fires).
    pub fn recover(
        &mut self,
        expected_agents: usize,
        quotas: BTreeMap<String, ResourceQuantities>,
    ) {
        assert!(
            self.agents.is_empty(),
            "recovery must start before agents are added"
        );
        assert_eq!(
            self.quota_role_sorter.count(),
            0,
            "recovery must start before quotas are set"
        );

        // Without quota there is no risk of over-committing guarantees on a
        // partial view of the cluster, so there is nothing to hold back.
        if quotas.is_empty() {
            debug!("Skipping allocator recovery: nothing to recover");
            return;
        }

        for (role, guarantee) in quotas {
            self.set_quota(&role, guarantee);
        }

        let threshold = (expected_agents as f64 * AGENT_RECOVERY_FACTOR) as usize;
        if threshold == 0 {
            debug!("Skipping allocator recovery: no reconnecting agents to wait for");
            return;
        }

        self.expected_agent_count = Some(threshold);
        self.pause();

        if let Some(weak) = self.self_tx.clone() {
            tokio::spawn(async move {
                tokio::time::sleep(RECOVERY_HOLD_OFF).await;
                if let Some(tx) = weak.upgrade() {
                    let _ = tx.send(AllocatorMessage::Resume);
                }
            });
        }

        info!(
            expected_agents = threshold,
            hold_off_secs = RECOVERY_HOLD_OFF.as_secs(),
            "Triggered allocator recovery: waiting for agents to reconnect"
        );
    }

    pub fn pause(&mut self) {
        if !self.paused {
            debug!("Allocation paused");
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            debug!("Allocation resumed");
            self.paused = false;
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // =========================================================================
    // Framework lifecycle
    // =========================================================================

    pub fn add_framework(
        &mut self,
        framework_id: &FrameworkId,
        spec: FrameworkSpec,
        used: HashMap<AgentId, Resources>,
        active: bool,
        suppressed_roles: BTreeSet<String>,
    ) {
        assert!(
            !self.frameworks.contains_key(framework_id),
            "framework {framework_id} already added"
        );

        let framework = Framework::new(
            spec,
            suppressed_roles.clone(),
            active,
            self.options.publish_per_framework_metrics,
        );
        let subscribed = framework.roles.clone();
        self.frameworks.insert(framework_id.clone(), framework);

        for role in &subscribed {
            self.track_framework_under_role(framework_id, role);

            let sorter = self
                .framework_sorters
                .get_mut(role)
                .expect("tracked roles have a framework sorter");
            let framework = self
                .frameworks
                .get_mut(framework_id)
                .expect("framework was just inserted");
            if suppressed_roles.contains(role) {
                sorter.deactivate(framework_id.as_str());
                framework.metrics.role_suppressed();
            } else {
                sorter.activate(framework_id.as_str());
                framework.metrics.role_revived();
            }
        }

        // Seed allocations the master already knows about. Agents that have
        // not been added yet will bring their own `used` map when they are.
        for (agent_id, resources) in used {
            if !self.agents.contains_key(&agent_id) {
                continue;
            }
            self.track_allocated_resources(&agent_id, framework_id, &resources);
        }

        info!(framework = %framework_id, roles = ?subscribed, "Added framework");

        if active {
            self.trigger_allocation_all();
        } else {
            self.deactivate_framework(framework_id);
        }
    }

    pub fn remove_framework(&mut self, framework_id: &FrameworkId) {
        assert!(
            self.frameworks.contains_key(framework_id),
            "unknown framework {framework_id}"
        );

        // Untrack every role the framework is tracked under: its
        // subscriptions plus roles it merely still holds allocation in.
        let tracked: Vec<String> = self
            .roles
            .iter()
            .filter(|(_, members)| members.contains(framework_id))
            .map(|(role, _)| role.clone())
            .collect();

        for role in tracked {
            let allocation = self
                .framework_sorters
                .get(&role)
                .map(|sorter| sorter.allocation(framework_id.as_str()).clone())
                .unwrap_or_default();

            for (agent_id, allocated) in allocation {
                self.untrack_allocated_resources(&agent_id, framework_id, &allocated);
            }

            self.untrack_framework_under_role(framework_id, &role);
        }

        let framework = self
            .frameworks
            .remove(framework_id)
            .expect("framework presence was checked");
        self.completed_framework_metrics
            .insert(framework_id.clone(), framework.metrics.clone());

        info!(framework = %framework_id, "Removed framework");
    }

    pub fn activate_framework(&mut self, framework_id: &FrameworkId) {
        let framework = self
            .frameworks
            .get_mut(framework_id)
            .unwrap_or_else(|| panic!("unknown framework {framework_id}"));
        framework.active = true;

        let subscribed = framework.roles.clone();
        let suppressed = framework.suppressed_roles.clone();

        // Suppressed roles stay deactivated across framework failover.
        for role in &subscribed {
            if !suppressed.contains(role) {
                self.framework_sorters
                    .get_mut(role)
                    .expect("subscribed roles have a framework sorter")
                    .activate(framework_id.as_str());
            }
        }

        info!(framework = %framework_id, "Activated framework");
        self.trigger_allocation_all();
    }

    pub fn deactivate_framework(&mut self, framework_id: &FrameworkId) {
        let framework = self
            .frameworks
            .get_mut(framework_id)
            .unwrap_or_else(|| panic!("unknown framework {framework_id}"));
        let subscribed = framework.roles.clone();

        for role in &subscribed {
            self.framework_sorters
                .get_mut(role)
                .expect("subscribed roles have a framework sorter")
                .deactivate(framework_id.as_str());
            // The sorter keeps the allocation: if the framework fails over
            // and reactivates we still want a record of what it holds.
        }

        let framework = self
            .frameworks
            .get_mut(framework_id)
            .expect("framework presence was checked");
        framework.active = false;

        // Dropping the filters cancels their expiry timers.
        framework.offer_filters.clear();
        framework.inverse_offer_filters.clear();

        info!(framework = %framework_id, "Deactivated framework");
    }

    pub fn update_framework(
        &mut self,
        framework_id: &FrameworkId,
        spec: FrameworkSpec,
        suppressed_roles: BTreeSet<String>,
    ) {
        let framework = self
            .frameworks
            .get(framework_id)
            .unwrap_or_else(|| panic!("unknown framework {framework_id}"));

        let old_roles = framework.roles.clone();
        let new_roles = spec.roles.clone();

        for role in new_roles.difference(&old_roles) {
            // The framework may already be tracked here: unsubscribing from
            // a role keeps it tracked while allocation remains.
            if !self.is_framework_tracked_under_role(framework_id, role) {
                self.track_framework_under_role(framework_id, role);
            }
        }

        for role in old_roles.difference(&new_roles) {
            let sorter = self
                .framework_sorters
                .get_mut(role)
                .expect("subscribed roles have a framework sorter");
            sorter.deactivate(framework_id.as_str());

            // Stop tracking unless allocation remains under the role.
            if sorter.allocation(framework_id.as_str()).is_empty() {
                self.untrack_framework_under_role(framework_id, role);
            }

            let framework = self
                .frameworks
                .get_mut(framework_id)
                .expect("framework presence was checked");
            framework.offer_filters.remove(role);
            framework.suppressed_roles.remove(role);
        }

        let framework = self
            .frameworks
            .get_mut(framework_id)
            .expect("framework presence was checked");
        framework.roles = new_roles.clone();
        framework.capabilities = spec.capabilities;
        framework.min_allocatable_resources = spec.min_allocatable_resources;

        self.suppress_roles(framework_id, suppressed_roles.clone());
        self.unsuppress_roles(framework_id, &new_roles - &suppressed_roles);

        let framework = &self.frameworks[framework_id];
        assert_eq!(
            framework.suppressed_roles, suppressed_roles,
            "suppressed roles of framework {framework_id} diverged after update"
        );
    }

    // =========================================================================
    // Agent lifecycle
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn add_agent(
        &mut self,
        agent_id: &AgentId,
        info: AgentInfo,
        capabilities: AgentCapabilities,
        unavailability: Option<Unavailability>,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    ) {
        assert!(
            !self.agents.contains_key(agent_id),
            "agent {agent_id} already added"
        );
        assert!(
            !self.paused || self.expected_agent_count.is_some(),
            "agents may only be added to a paused allocator during recovery"
        );

        let allocated: Resources = used.values().cloned().sum();
        let mut agent = Agent::new(info, capabilities, total.clone(), allocated);
        if let Some(unavailability) = unavailability {
            agent.maintenance = Some(Maintenance::new(unavailability));
        }
        self.agents.insert(agent_id.clone(), agent);

        self.track_reservations(&total.reservations());

        self.role_sorter.add_agent_total(&total);
        for sorter in self.framework_sorters.values_mut() {
            sorter.add_agent_total(&total);
        }
        // The quota-role sorter only ever tracks non-revocable resources:
        // revocable resources cannot satisfy guarantees.
        self.quota_role_sorter.add_agent_total(&total.non_revocable());

        for (framework_id, allocation) in &used {
            // A framework not yet added will seed its own allocation when it
            // is; in the interim role shares under-account for it.
            if !self.frameworks.contains_key(framework_id) {
                continue;
            }
            self.track_allocated_resources(agent_id, framework_id, allocation);
        }

        if self.paused
            && self
                .expected_agent_count
                .is_some_and(|expected| self.agents.len() >= expected)
        {
            info!(
                agents = self.agents.len(),
                "Recovery complete: sufficient agents re-registered"
            );
            self.expected_agent_count = None;
            self.resume();
        }

        let agent = &self.agents[agent_id];
        info!(
            agent = %agent_id,
            hostname = %agent.info.hostname,
            total = %agent.total(),
            allocated = %agent.allocated(),
            "Added agent"
        );

        self.request_allocation([agent_id.clone()]);
    }

    pub fn remove_agent(&mut self, agent_id: &AgentId) {
        let total = self
            .agents
            .get(agent_id)
            .unwrap_or_else(|| panic!("unknown agent {agent_id}"))
            .total()
            .clone();

        self.role_sorter.remove_agent_total(&total);
        for sorter in self.framework_sorters.values_mut() {
            sorter.remove_agent_total(&total);
        }
        self.quota_role_sorter
            .remove_agent_total(&total.non_revocable());

        self.untrack_reservations(&total.reservations());

        self.agents.remove(agent_id);
        self.allocation_candidates.remove(agent_id);
        self.remove_filters_for_agent(agent_id);

        info!(agent = %agent_id, "Removed agent");
    }

    pub fn update_agent(
        &mut self,
        agent_id: &AgentId,
        info: AgentInfo,
        capabilities: Option<AgentCapabilities>,
        total: Option<Resources>,
    ) {
        assert!(
            self.agents.contains_key(agent_id),
            "unknown agent {agent_id}"
        );

        let mut updated = false;

        // Schedulers may have declined this agent based on attributes that
        // no longer hold; clear their filters so they reassess.
        let attributes_changed = self.agents[agent_id].info().attributes != info.attributes;
        if attributes_changed {
            updated = true;
            self.remove_filters_for_agent(agent_id);
        }

        {
            let agent = self.agents.get_mut(agent_id).expect("checked above");
            if agent.info != info {
                updated = true;
                agent.info = info;
            }

            if let Some(capabilities) = capabilities {
                if agent.capabilities != capabilities {
                    updated = true;
                    agent.capabilities = capabilities;
                    info!(agent = %agent_id, ?capabilities, "Agent updated capabilities");
                }
            }
        }

        if let Some(total) = total {
            updated |= self.update_agent_total(agent_id, total);
            info!(
                agent = %agent_id,
                total = %self.agents[agent_id].total(),
                "Agent updated total resources"
            );
        }

        if updated {
            self.request_allocation([agent_id.clone()]);
        }
    }

    pub fn activate_agent(&mut self, agent_id: &AgentId) {
        self.agents
            .get_mut(agent_id)
            .unwrap_or_else(|| panic!("unknown agent {agent_id}"))
            .activated = true;
        info!(agent = %agent_id, "Agent reactivated");
    }

    pub fn deactivate_agent(&mut self, agent_id: &AgentId) {
        self.agents
            .get_mut(agent_id)
            .unwrap_or_else(|| panic!("unknown agent {agent_id}"))
            .activated = false;
        info!(agent = %agent_id, "Agent deactivated");
    }

    /// Grows an agent's total (and allocation) by a resource provider's
    /// contribution.
    pub fn add_resource_provider(
        &mut self,
        agent_id: &AgentId,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    ) {
        assert!(
            self.agents.contains_key(agent_id),
            "unknown agent {agent_id}"
        );

        for (framework_id, allocation) in &used {
            if !self.frameworks.contains_key(framework_id) {
                continue;
            }
            self.track_allocated_resources(agent_id, framework_id, allocation);
        }

        let new_total = self.agents[agent_id].total().clone() + total.clone();
        self.update_agent_total(agent_id, new_total);

        let used_sum: Resources = used.values().cloned().sum();
        self.agents
            .get_mut(agent_id)
            .expect("checked above")
            .allocate(&used_sum);

        debug!(agent = %agent_id, grown_by = %total, used = %used_sum, "Grew agent");
    }

    pub fn update_whitelist(&mut self, whitelist: Option<HashSet<String>>) {
        self.whitelist = whitelist;

        match &self.whitelist {
            Some(hostnames) => {
                info!(?hostnames, "Updated agent whitelist");
                if hostnames.is_empty() {
                    warn!("Whitelist is empty, no offers will be made");
                }
            }
            None => info!("Advertising offers for all agents"),
        }
    }

    /// Advisory only; requests do not influence the allocation algorithm.
    pub fn request_resources(&mut self, framework_id: &FrameworkId, requests: Vec<Resources>) {
        info!(
            framework = %framework_id,
            requests = requests.len(),
            "Received resource request"
        );
    }

    // =========================================================================
    // Quota and weights
    // =========================================================================

    pub fn set_quota(&mut self, role: &str, guarantee: ResourceQuantities) {
        // Setting quota moves the role into the quota'd allocation group;
        // updating an existing quota is a remove + set.
        assert!(
            !self.quota_guarantees.contains_key(role),
            "quota already set for role {role}"
        );

        info!(role, guarantee = %guarantee, "Set quota");

        self.quota_guarantees
            .insert(role.to_string(), guarantee);
        self.quota_role_sorter.add(role);
        self.quota_role_sorter.activate(role);

        // Copy existing allocation for the role into the quota sorter.
        if self.role_sorter.contains(role) {
            let allocation = self.role_sorter.allocation(role).clone();
            for (agent_id, resources) in allocation {
                self.quota_role_sorter
                    .allocated(role, &agent_id, &resources.non_revocable());
            }
        }

        // Quota changes do not rebalance already-offered resources, so no
        // allocation is triggered here.
    }

    pub fn remove_quota(&mut self, role: &str) {
        assert!(
            self.quota_guarantees.contains_key(role),
            "no quota set for role {role}"
        );

        info!(
            role,
            guarantee = %self.quota_guarantees[role],
            "Removed quota"
        );

        self.quota_guarantees.remove(role);
        self.quota_role_sorter.remove(role);
    }

    pub fn update_weights(&mut self, weights: Vec<WeightSpec>) {
        for spec in weights {
            self.quota_role_sorter
                .update_weight(&spec.role, spec.weight);
            self.role_sorter.update_weight(&spec.role, spec.weight);
            debug!(role = %spec.role, weight = spec.weight, "Updated weight");
        }
        // Weight changes apply from the next allocation cycle onward.
    }

    // =========================================================================
    // Allocation updates
    // =========================================================================

    /// Applies accepted-operation conversions to an offered allocation.
    pub fn update_allocation(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        offered: Resources,
        conversions: Vec<ResourceConversion>,
    ) {
        assert!(
            self.agents.contains_key(agent_id),
            "unknown agent {agent_id}"
        );
        assert!(
            self.frameworks.contains_key(framework_id),
            "unknown framework {framework_id}"
        );

        // An allocation is tied to exactly one role.
        let allocations = offered.allocations();
        assert_eq!(
            allocations.len(),
            1,
            "offered resources must carry a single allocation role"
        );
        let role = allocations.keys().next().expect("one allocation").clone();

        let framework_allocation = self
            .framework_sorters
            .get(&role)
            .unwrap_or_else(|| panic!("no framework sorter for role {role}"))
            .allocation_of(framework_id.as_str(), agent_id);

        let updated_offered = apply_conversions(&offered, &conversions)
            .expect("master-validated conversions apply to the offered resources");

        {
            let agent = self.agents.get_mut(agent_id).expect("checked above");
            agent.unallocate(&offered);
            agent.allocate(&updated_offered);
        }

        self.framework_sorters
            .get_mut(&role)
            .expect("checked above")
            .update(framework_id.as_str(), agent_id, &offered, &updated_offered);
        self.role_sorter
            .update(&role, agent_id, &offered, &updated_offered);
        if self.quota_guarantees.contains_key(&role) {
            self.quota_role_sorter.update(
                &role,
                agent_id,
                &offered.non_revocable(),
                &updated_offered.non_revocable(),
            );
        }

        // The agent's total is stored unallocated, and must not absorb the
        // extra holders of shared resources (conversions with an empty
        // `consumed` denote those).
        let mut removed = Resources::new();
        let mut stripped = Vec::new();
        for conversion in &conversions {
            if conversion.consumed.is_empty() {
                continue;
            }
            if conversion.converted.is_empty() {
                removed += &conversion.consumed;
            }
            let mut consumed = conversion.consumed.clone();
            let mut converted = conversion.converted.clone();
            consumed.unallocate();
            converted.unallocate();
            stripped.push(ResourceConversion {
                consumed,
                converted,
            });
        }

        let new_total = apply_conversions(self.agents[agent_id].total(), &stripped)
            .expect("agent total applies conversions its allocation applied");
        self.update_agent_total(agent_id, new_total);

        let updated_allocation = self
            .framework_sorters
            .get(&role)
            .expect("checked above")
            .allocation_of(framework_id.as_str(), agent_id);

        // The framework's allocation must have changed by exactly the
        // quantities the conversions removed.
        let delta =
            framework_allocation.scalar_quantities() - updated_allocation.scalar_quantities();
        assert_eq!(
            delta,
            removed.scalar_quantities(),
            "allocation delta diverged from removed conversions for framework {framework_id}"
        );

        info!(
            framework = %framework_id,
            agent = %agent_id,
            from = %framework_allocation,
            to = %updated_allocation,
            "Updated allocation"
        );
    }

    /// Applies operations to an agent's unallocated resources. Nothing is
    /// mutated on failure.
    pub fn update_available(
        &mut self,
        agent_id: &AgentId,
        conversions: Vec<ResourceConversion>,
    ) -> AllocatorResult<()> {
        assert!(
            self.agents.contains_key(agent_id),
            "unknown agent {agent_id}"
        );

        // This can fail when an allocation run raced ahead of the request
        // and the resources are no longer available.
        let agent = &self.agents[agent_id];
        if let Err(reason) = apply_conversions(&agent.available(), &conversions) {
            debug!(agent = %agent_id, %reason, "Failed to update available resources");
            return Err(AllocatorError::OperationConflict {
                agent: agent_id.clone(),
                reason,
            });
        }

        let new_total = apply_conversions(agent.total(), &conversions)
            .expect("agent total applies operations its available resources applied");
        self.update_agent_total(agent_id, new_total);
        Ok(())
    }

    /// Returns offered resources to the agent, optionally installing a
    /// refused-offer filter.
    pub fn recover_resources(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        resources: Resources,
        refusal: Option<Refusal>,
    ) {
        if resources.is_empty() {
            return;
        }

        // Resources are recovered within a single allocation role.
        let allocations = resources.allocations();
        assert_eq!(
            allocations.len(),
            1,
            "recovered resources must carry a single allocation role"
        );
        let role = allocations.keys().next().expect("one allocation").clone();

        // The framework may already be gone (an offer raced with framework
        // removal); its resources were recovered with it.
        if self.frameworks.contains_key(framework_id) {
            if let Some(sorter) = self.framework_sorters.get(&role) {
                if sorter.contains(framework_id.as_str()) {
                    self.untrack_allocated_resources(agent_id, framework_id, &resources);

                    // Stop tracking the framework under this role if it is
                    // no longer subscribed and holds nothing there anymore.
                    let framework = &self.frameworks[framework_id];
                    let empty = self.framework_sorters[&role]
                        .allocation(framework_id.as_str())
                        .is_empty();
                    if !framework.roles.contains(&role) && empty {
                        self.untrack_framework_under_role(framework_id, &role);
                    }
                }
            }
        }

        // The agent may also be gone (offer raced with agent removal).
        if let Some(agent) = self.agents.get_mut(agent_id) {
            assert!(
                agent.allocated().contains(&resources),
                "agent {agent_id} allocation does not contain recovered resources"
            );
            agent.unallocate(&resources);

            debug!(
                agent = %agent_id,
                framework = %framework_id,
                recovered = %resources,
                total = %agent.total(),
                allocated = %agent.allocated(),
                "Recovered resources"
            );
        }

        let Some(refusal) = refusal else { return };
        if !self.frameworks.contains_key(framework_id) || !self.agents.contains_key(agent_id) {
            return;
        }

        let timeout = refusal.timeout();
        if timeout.is_zero() {
            return;
        }

        // The filter must not expire before the next allocation cycle can
        // observe it.
        let timeout = timeout.max(self.options.allocation_interval);

        debug!(
            framework = %framework_id,
            agent = %agent_id,
            timeout_secs = timeout.as_secs_f64(),
            "Framework filtered agent"
        );

        // Filters apply per role, so strip the allocation tags.
        let mut unallocated = resources;
        unallocated.unallocate();

        let (filter, watch) = RefusedOfferFilter::new(unallocated);
        self.frameworks
            .get_mut(framework_id)
            .expect("checked above")
            .offer_filters
            .entry(role.clone())
            .or_default()
            .entry(agent_id.clone())
            .or_default()
            .push(Arc::clone(&filter));

        if let Some(weak_tx) = self.self_tx.clone() {
            let weak_filter = Arc::downgrade(&filter);
            let framework_id = framework_id.clone();
            let agent_id = agent_id.clone();
            filters::schedule_expiry(timeout, watch, move || {
                if let Some(tx) = weak_tx.upgrade() {
                    let _ = tx.send(AllocatorMessage::ExpireOfferFilter {
                        framework: framework_id,
                        role,
                        agent: agent_id,
                        filter: weak_filter,
                    });
                }
            });
        }
    }

    // =========================================================================
    // Suppression and revival
    // =========================================================================

    pub fn suppress_offers(&mut self, framework_id: &FrameworkId, roles: BTreeSet<String>) {
        let roles = if roles.is_empty() {
            self.frameworks
                .get(framework_id)
                .unwrap_or_else(|| panic!("unknown framework {framework_id}"))
                .roles
                .clone()
        } else {
            roles
        };
        self.suppress_roles(framework_id, roles);
    }

    fn suppress_roles(&mut self, framework_id: &FrameworkId, roles: BTreeSet<String>) {
        assert!(
            self.frameworks.contains_key(framework_id),
            "unknown framework {framework_id}"
        );

        for role in &roles {
            self.framework_sorters
                .get_mut(role)
                .unwrap_or_else(|| panic!("no framework sorter for role {role}"))
                .deactivate(framework_id.as_str());

            let framework = self
                .frameworks
                .get_mut(framework_id)
                .expect("checked above");
            framework.suppressed_roles.insert(role.clone());
            framework.metrics.role_suppressed();
        }

        info!(framework = %framework_id, ?roles, "Suppressed offers");
    }

    pub fn unsuppress_roles(&mut self, framework_id: &FrameworkId, roles: BTreeSet<String>) {
        assert!(
            self.frameworks.contains_key(framework_id),
            "unknown framework {framework_id}"
        );

        for role in &roles {
            self.framework_sorters
                .get_mut(role)
                .unwrap_or_else(|| panic!("no framework sorter for role {role}"))
                .activate(framework_id.as_str());

            let framework = self
                .frameworks
                .get_mut(framework_id)
                .expect("checked above");
            framework.suppressed_roles.remove(role);
            framework.metrics.role_revived();
        }

        info!(framework = %framework_id, ?roles, "Unsuppressed offers");
    }

    /// Clears suppression and filters for the given roles (all subscribed
    /// roles when empty) and schedules an allocation.
    pub fn revive_offers(&mut self, framework_id: &FrameworkId, roles: BTreeSet<String>) {
        let framework = self
            .frameworks
            .get_mut(framework_id)
            .unwrap_or_else(|| panic!("unknown framework {framework_id}"));

        framework.inverse_offer_filters.clear();

        let roles = if roles.is_empty() {
            framework.roles.clone()
        } else {
            roles
        };

        for role in &roles {
            framework.offer_filters.remove(role);
        }

        self.unsuppress_roles(framework_id, roles.clone());

        info!(framework = %framework_id, ?roles, "Revived offers");

        self.trigger_allocation_all();
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Installs or clears an agent's unavailability schedule.
    pub fn update_unavailability(
        &mut self,
        agent_id: &AgentId,
        unavailability: Option<Unavailability>,
    ) {
        assert!(
            self.agents.contains_key(agent_id),
            "unknown agent {agent_id}"
        );

        // Force frameworks to reassess: unavailability changes can upend
        // their failure-domain calculations.
        for framework in self.frameworks.values_mut() {
            framework.inverse_offer_filters.remove(agent_id);
        }

        let agent = self.agents.get_mut(agent_id).expect("checked above");
        agent.maintenance = unavailability.map(Maintenance::new);

        self.request_allocation([agent_id.clone()]);
    }

    /// Records a framework's response to an inverse offer and optionally
    /// installs an inverse-offer filter.
    pub fn update_inverse_offer(
        &mut self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        status: Option<InverseOfferStatus>,
        refusal: Option<Refusal>,
    ) {
        assert!(
            self.frameworks.contains_key(framework_id),
            "unknown framework {framework_id}"
        );
        let agent = self
            .agents
            .get_mut(agent_id)
            .unwrap_or_else(|| panic!("unknown agent {agent_id}"));
        let maintenance = agent
            .maintenance
            .as_mut()
            .unwrap_or_else(|| panic!("agent {agent_id} has no maintenance scheduled"));

        // Only an outstanding offer can be answered; anything else is a
        // stale response and is safely ignored. Clearing the flag makes the
        // next cycle send a fresh inverse offer.
        if maintenance.offers_outstanding.remove(framework_id) {
            if let Some(status) = status {
                maintenance.statuses.insert(framework_id.clone(), status);
            }
        }

        let Some(refusal) = refusal else { return };

        let timeout = refusal.timeout();
        if timeout.is_zero() {
            return;
        }

        debug!(
            framework = %framework_id,
            agent = %agent_id,
            timeout_secs = timeout.as_secs_f64(),
            "Framework filtered inverse offers from agent"
        );

        let (filter, watch) = RefusedInverseOfferFilter::new(timeout);
        self.frameworks
            .get_mut(framework_id)
            .expect("checked above")
            .inverse_offer_filters
            .entry(agent_id.clone())
            .or_default()
            .push(Arc::clone(&filter));

        if let Some(weak_tx) = self.self_tx.clone() {
            let weak_filter = Arc::downgrade(&filter);
            let framework_id = framework_id.clone();
            let agent_id = agent_id.clone();
            filters::schedule_expiry(timeout, watch, move || {
                if let Some(tx) = weak_tx.upgrade() {
                    let _ = tx.send(AllocatorMessage::ExpireInverseOfferFilter {
                        framework: framework_id,
                        agent: agent_id,
                        filter: weak_filter,
                    });
                }
            });
        }
    }

    /// The latest inverse-offer responses, per agent under maintenance.
    #[must_use]
    pub fn inverse_offer_statuses(
        &self,
    ) -> HashMap<AgentId, HashMap<FrameworkId, InverseOfferStatus>> {
        self.agents
            .iter()
            .filter_map(|(id, agent)| {
                agent
                    .maintenance
                    .as_ref()
                    .map(|m| (id.clone(), m.statuses.clone()))
            })
            .collect()
    }

    // =========================================================================
    // Allocation cycle
    // =========================================================================

    /// Schedules an allocation for all known agents.
    pub fn trigger_allocation_all(&mut self) {
        let all: Vec<AgentId> = self.agents.keys().cloned().collect();
        self.request_allocation(all);
    }

    /// Schedules an allocation for one agent, coalescing with any pending
    /// run.
    pub fn trigger_allocation(&mut self, agent_id: &AgentId) {
        self.request_allocation([agent_id.clone()]);
    }

    fn request_allocation(&mut self, candidates: impl IntoIterator<Item = AgentId>) {
        if self.paused {
            debug!("Skipped allocation: allocator is paused");
            return;
        }

        self.allocation_candidates.extend(candidates);

        if !self.allocation_pending {
            self.allocation_pending = true;
            // The run message lands behind everything already enqueued, so
            // the cycle observes all earlier mutations.
            self.dispatch(AllocatorMessage::PerformAllocation);
        }
    }

    /// Runs one allocation + deallocation cycle over the current candidate
    /// set, then clears it. A paused allocator short-circuits.
    pub fn run_allocation_cycle(&mut self) {
        self.allocation_pending = false;

        if self.paused {
            debug!("Skipped allocation: allocator is paused");
            return;
        }

        let started = std::time::Instant::now();
        let candidates = self.allocation_candidates.len();

        self.allocate_candidates();
        self.deallocate_candidates();

        debug!(
            agents = candidates,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Performed allocation cycle"
        );

        self.allocation_candidates.clear();
    }

    fn allocate_candidates(&mut self) {
        let mut offerable: HashMap<FrameworkId, Offers> = HashMap::new();

        // Non-whitelisted, removed, and deactivated agents get no offers.
        let mut agent_ids: Vec<AgentId> = self
            .allocation_candidates
            .iter()
            .filter(|id| self.agents.contains_key(id))
            .filter(|id| self.agents[*id].activated)
            .filter(|id| self.is_whitelisted(id))
            .cloned()
            .collect();

        // Shuffle so no agent is systematically starved when headroom is
        // tight.
        agent_ids.shuffle(&mut rand::rng());

        // Consumed quota = reservations (allocated or not) + unreserved
        // non-revocable allocation, rolled up to the top-level role.
        let mut consumed_quota: HashMap<String, ResourceQuantities> = HashMap::new();
        for role in self.quota_guarantees.keys() {
            if let Some(reserved) = self.reservation_scalar_quantities.get(role) {
                *consumed_quota.entry(role.clone()).or_default() += reserved;
            }
        }
        for role in self.roles.keys() {
            let top = roles::top_level(role).to_string();
            if !self.quota_guarantees.contains_key(&top) {
                continue;
            }
            if !self.role_sorter.contains(role) {
                continue;
            }
            for resources in self.role_sorter.allocation(role).values() {
                *consumed_quota.entry(top.clone()).or_default() +=
                    resources.unreserved().non_revocable().scalar_quantities();
            }
        }

        // Unreserved headroom that must survive this cycle so remaining
        // guarantees stay satisfiable.
        let mut required_headroom = ResourceQuantities::new();
        for (role, guarantee) in &self.quota_guarantees {
            required_headroom +=
                guarantee.clone() - consumed_quota.get(role).cloned().unwrap_or_default();
        }

        // Available headroom = total − allocated − unallocated reservations
        // − unallocated revocable.
        let mut available_headroom = self.role_sorter.total_scalar_quantities().clone();
        available_headroom -= self.role_sorter.allocation_scalar_quantities();

        let mut total_allocated_reservation = ResourceQuantities::new();
        for role in self.roles.keys() {
            if !self.role_sorter.contains(role) {
                continue;
            }
            for resources in self.role_sorter.allocation(role).values() {
                total_allocated_reservation +=
                    resources.filter(|r| !r.is_unreserved()).scalar_quantities();
            }
        }
        // The reservation aggregate is hierarchical, so only top-level
        // entries are summed.
        let mut total_reservation = ResourceQuantities::new();
        for (role, quantities) in &self.reservation_scalar_quantities {
            if !roles::is_hierarchical(role) {
                total_reservation += quantities;
            }
        }
        available_headroom -= total_reservation - total_allocated_reservation;

        for agent in self.agents.values() {
            available_headroom -= agent.available().revocable().scalar_quantities();
        }

        if !self.quota_guarantees.is_empty() {
            info!(
                required = %required_headroom,
                available = %available_headroom,
                "Quota headroom before allocation"
            );
        }

        // A shared resource may appear in at most one offer per cycle.
        let mut offered_shared: HashMap<AgentId, Resources> = HashMap::new();

        // Stage 1: satisfy quota guarantees. Roles with unsatisfied
        // guarantees get first pick so capability and filter constraints
        // don't strand their headroom.
        for agent_id in &agent_ids {
            for role in self.quota_role_sorter.sort() {
                let guarantee = self
                    .quota_guarantees
                    .get(&role)
                    .expect("quota sorter clients have guarantees")
                    .clone();

                // No framework tracked under the role, nothing to offer to.
                if !self.roles.contains_key(&role) {
                    continue;
                }

                if self.agents[agent_id].available().is_empty() {
                    break; // Nothing left on this agent.
                }

                let framework_ids = self
                    .framework_sorters
                    .get(&role)
                    .expect("tracked roles have a framework sorter")
                    .sort();

                for framework_name in framework_ids {
                    let framework_id = FrameworkId::new(framework_name);

                    let mut available = self.agents[agent_id].available();
                    if let Some(shared) = offered_shared.get(agent_id) {
                        available -= shared;
                    }

                    if available.allocatable_to(&role).is_empty() {
                        break; // Nothing left for the role.
                    }

                    let capabilities = {
                        let framework = &self.frameworks[&framework_id];
                        assert!(framework.active, "sorted framework {framework_id} inactive");
                        framework.capabilities
                    };

                    if !self.can_receive_agent(capabilities, &self.agents[agent_id]) {
                        continue;
                    }

                    let available = strip_incapable_resources(available, capabilities);

                    // The role's reservations are always offered; unreserved
                    // resources are chopped to the unsatisfied guarantee.
                    let mut to_allocate = available.reserved(&role).non_revocable();

                    let unsatisfied = guarantee.clone()
                        - consumed_quota.get(&role).cloned().unwrap_or_default();

                    let unreserved = available.non_revocable().unreserved();
                    let new_quota_allocation =
                        shrink_to_quantities(unreserved.clone(), unsatisfied);
                    to_allocate += &new_quota_allocation;

                    // A role getting neither reservations nor guarantee
                    // progress gets nothing from this agent.
                    if to_allocate.is_empty() {
                        continue;
                    }

                    // Scalars the guarantee doesn't name ride along, up to
                    // the surplus headroom.
                    let non_guarantee =
                        unreserved.filter(|r| guarantee.get(&r.name) == Scalar::ZERO);
                    let surplus = available_headroom.clone() - required_headroom.clone();
                    to_allocate += shrink_to_quantities(non_guarantee, surplus);

                    // Quota is only defined on scalars; non-scalars are
                    // offered in full.
                    to_allocate +=
                        unreserved.filter(|r| !matches!(r.value, Value::Scalar(_)));

                    if !self.allocatable(&to_allocate, &role, &framework_id)
                        || self.is_offer_filtered(&framework_id, &role, agent_id, &to_allocate)
                    {
                        continue;
                    }

                    debug!(
                        agent = %agent_id,
                        role = %role,
                        framework = %framework_id,
                        resources = %to_allocate,
                        "Allocating toward role quota"
                    );

                    to_allocate.allocate(&role);

                    *offerable
                        .entry(framework_id.clone())
                        .or_default()
                        .entry(role.clone())
                        .or_default()
                        .entry(agent_id.clone())
                        .or_default() += &to_allocate;

                    let mut shared = to_allocate.shared();
                    shared.unallocate();
                    *offered_shared.entry(agent_id.clone()).or_default() += shared;

                    let allocated_unreserved = to_allocate.unreserved().scalar_quantities();

                    *consumed_quota.entry(role.clone()).or_default() += &allocated_unreserved;
                    for ancestor in roles::ancestors(&role) {
                        *consumed_quota.entry(ancestor).or_default() += &allocated_unreserved;
                    }

                    // Only allocation that satisfied some guarantee shrinks
                    // the required headroom; reservations and non-guarantee
                    // names do not.
                    required_headroom -= new_quota_allocation.scalar_quantities();
                    available_headroom -= &allocated_unreserved;

                    self.agents
                        .get_mut(agent_id)
                        .expect("candidate agents exist")
                        .allocate(&to_allocate);
                    self.track_allocated_resources(agent_id, &framework_id, &to_allocate);
                }
            }
        }

        // Stage 2: fair share for the remaining (non-quota'd) roles,
        // holding back whatever the unsatisfied guarantees still need.
        let mut held_back = ResourceQuantities::new();
        let mut held_back_agents = 0usize;

        for agent_id in &agent_ids {
            for role in self.role_sorter.sort() {
                if self.quota_guarantees.contains_key(&role) {
                    continue; // Quota'd roles were served in stage 1.
                }

                if self.agents[agent_id].available().is_empty() {
                    break; // Nothing left on this agent.
                }

                let framework_ids = self
                    .framework_sorters
                    .get(&role)
                    .expect("tracked roles have a framework sorter")
                    .sort();

                for framework_name in framework_ids {
                    let framework_id = FrameworkId::new(framework_name);

                    let mut available = self.agents[agent_id].available();
                    if let Some(shared) = offered_shared.get(agent_id) {
                        available -= shared;
                    }

                    if available.allocatable_to(&role).is_empty() {
                        break; // Nothing left for the role.
                    }

                    let capabilities = self.frameworks[&framework_id].capabilities;

                    if !self.can_receive_agent(capabilities, &self.agents[agent_id]) {
                        continue;
                    }

                    let available = strip_incapable_resources(available, capabilities);

                    // Coarse-grained: the entire remainder goes to this
                    // framework.
                    let mut to_allocate = available.allocatable_to(&role);

                    let headroom_resources =
                        to_allocate.scalars().unreserved().non_revocable();
                    let headroom_quantities = headroom_resources.scalar_quantities();

                    let sufficient = (available_headroom.clone()
                        - headroom_quantities.clone())
                    .contains(&required_headroom);

                    if !sufficient {
                        to_allocate -= &headroom_resources;
                        held_back += &headroom_quantities;
                        held_back_agents += 1;
                    }

                    if !self.allocatable(&to_allocate, &role, &framework_id)
                        || self.is_offer_filtered(&framework_id, &role, agent_id, &to_allocate)
                    {
                        continue;
                    }

                    debug!(
                        agent = %agent_id,
                        role = %role,
                        framework = %framework_id,
                        resources = %to_allocate,
                        "Allocating fair share"
                    );

                    to_allocate.allocate(&role);

                    *offerable
                        .entry(framework_id.clone())
                        .or_default()
                        .entry(role.clone())
                        .or_default()
                        .entry(agent_id.clone())
                        .or_default() += &to_allocate;

                    let mut shared = to_allocate.shared();
                    shared.unallocate();
                    *offered_shared.entry(agent_id.clone()).or_default() += shared;

                    if sufficient {
                        available_headroom -= &headroom_quantities;
                    }

                    self.agents
                        .get_mut(agent_id)
                        .expect("candidate agents exist")
                        .allocate(&to_allocate);
                    self.track_allocated_resources(agent_id, &framework_id, &to_allocate);
                }
            }
        }

        if !self.quota_guarantees.is_empty() {
            info!(
                required = %required_headroom,
                held_back = %held_back,
                agents = held_back_agents,
                "Quota headroom after allocation"
            );
        }

        if offerable.is_empty() {
            debug!("No allocations performed");
            return;
        }

        for (framework_id, offers) in offerable {
            if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                framework.metrics.offer_sent();
            }
            (self.offer_callback)(&framework_id, offers);
        }
    }

    /// The deallocation phase: emit inverse offers for candidate agents
    /// under maintenance, to active frameworks holding allocation there.
    fn deallocate_candidates(&mut self) {
        if self.roles.is_empty() {
            return; // No frameworks registered.
        }
        assert!(!self.framework_sorters.is_empty());

        let mut offerable: HashMap<FrameworkId, InverseOffers> = HashMap::new();
        let candidates: Vec<AgentId> = self.allocation_candidates.iter().cloned().collect();

        for sorter in self.framework_sorters.values() {
            for agent_id in &candidates {
                let Some(agent) = self.agents.get(agent_id) else {
                    continue;
                };
                let Some(maintenance) = &agent.maintenance else {
                    continue;
                };

                for (framework_name, _allocation) in sorter.allocations_on(agent_id) {
                    let framework_id = FrameworkId::new(framework_name);
                    let framework = self
                        .frameworks
                        .get(&framework_id)
                        .expect("frameworks with allocation are known");

                    // The master does not send inverse offers to inactive
                    // frameworks.
                    if !framework.active {
                        continue;
                    }

                    if offerable
                        .get(&framework_id)
                        .is_some_and(|offers| offers.contains_key(agent_id))
                    {
                        continue; // Already offered in this cycle.
                    }

                    if maintenance.offers_outstanding.contains(&framework_id) {
                        continue; // Still waiting on the previous one.
                    }

                    if self.is_inverse_filtered(&framework_id, agent_id) {
                        continue;
                    }

                    // Maintenance is whole-agent, so the inverse offer
                    // carries empty resources plus the schedule.
                    offerable.entry(framework_id).or_default().insert(
                        agent_id.clone(),
                        UnavailableResources {
                            resources: Resources::new(),
                            unavailability: maintenance.unavailability.clone(),
                        },
                    );
                }
            }
        }

        if offerable.is_empty() {
            debug!("No inverse offers to send");
            return;
        }

        // Record the outstanding offers, then notify.
        for (framework_id, offers) in &offerable {
            for agent_id in offers.keys() {
                let maintenance = self
                    .agents
                    .get_mut(agent_id)
                    .expect("collected agents exist")
                    .maintenance
                    .as_mut()
                    .expect("collected agents are under maintenance");
                maintenance.offers_outstanding.insert(framework_id.clone());
            }
        }

        for (framework_id, offers) in offerable {
            if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                framework.metrics.inverse_offer_sent();
            }
            (self.inverse_offer_callback)(&framework_id, offers);
        }
    }

    // =========================================================================
    // Filter expiry
    // =========================================================================

    /// Removes an expired offer filter. A filter already removed (revive,
    /// framework removal, agent removal) cannot be upgraded and this is a
    /// no-op.
    pub(crate) fn expire_offer_filter(
        &mut self,
        framework_id: &FrameworkId,
        role: &str,
        agent_id: &AgentId,
        filter: &Weak<RefusedOfferFilter>,
    ) {
        let Some(filter) = filter.upgrade() else { return };
        let Some(framework) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        let Some(role_filters) = framework.offer_filters.get_mut(role) else {
            return;
        };
        let Some(agent_filters) = role_filters.get_mut(agent_id) else {
            return;
        };

        agent_filters.retain(|candidate| !Arc::ptr_eq(candidate, &filter));
        if agent_filters.is_empty() {
            role_filters.remove(agent_id);
        }
        if role_filters.is_empty() {
            framework.offer_filters.remove(role);
        }
    }

    /// Removes an expired inverse-offer filter; no-op when already removed.
    pub(crate) fn expire_inverse_offer_filter(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        filter: &Weak<RefusedInverseOfferFilter>,
    ) {
        let Some(filter) = filter.upgrade() else { return };
        let Some(framework) = self.frameworks.get_mut(framework_id) else {
            return;
        };
        let Some(agent_filters) = framework.inverse_offer_filters.get_mut(agent_id) else {
            return;
        };

        agent_filters.retain(|candidate| !Arc::ptr_eq(candidate, &filter));
        if agent_filters.is_empty() {
            framework.inverse_offer_filters.remove(agent_id);
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    #[must_use]
    pub fn agent(&self, agent_id: &AgentId) -> Option<&Agent> {
        self.agents.get(agent_id)
    }

    #[must_use]
    pub fn framework(&self, framework_id: &FrameworkId) -> Option<&Framework> {
        self.frameworks.get(framework_id)
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn framework_count(&self) -> usize {
        self.frameworks.len()
    }

    /// Whether any framework is tracked under `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    #[must_use]
    pub fn quota_guarantee(&self, role: &str) -> Option<&ResourceQuantities> {
        self.quota_guarantees.get(role)
    }

    /// The hierarchical reservation aggregate for `role`.
    #[must_use]
    pub fn reservation_quantities(&self, role: &str) -> ResourceQuantities {
        self.reservation_scalar_quantities
            .get(role)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn role_sorter(&self) -> &DrfSorter {
        &self.role_sorter
    }

    #[must_use]
    pub fn quota_role_sorter(&self) -> &DrfSorter {
        &self.quota_role_sorter
    }

    #[must_use]
    pub fn framework_sorter(&self, role: &str) -> Option<&DrfSorter> {
        self.framework_sorters.get(role)
    }

    #[must_use]
    pub fn completed_framework_metrics(&self) -> &CompletedFrameworks {
        &self.completed_framework_metrics
    }

    // =========================================================================
    // Internal bookkeeping
    // =========================================================================

    fn dispatch(&self, message: AllocatorMessage) {
        if let Some(weak) = &self.self_tx {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(message);
            }
        }
    }

    fn is_whitelisted(&self, agent_id: &AgentId) -> bool {
        match &self.whitelist {
            None => true,
            Some(hostnames) => hostnames.contains(&self.agents[agent_id].info.hostname),
        }
    }

    fn is_framework_tracked_under_role(&self, framework_id: &FrameworkId, role: &str) -> bool {
        self.roles
            .get(role)
            .is_some_and(|members| members.contains(framework_id))
    }

    /// Starts tracking a framework under a role, lazily creating the role's
    /// sorter seeded with every known agent's total.
    fn track_framework_under_role(&mut self, framework_id: &FrameworkId, role: &str) {
        if !self.roles.contains_key(role) {
            self.roles.insert(role.to_string(), HashSet::new());

            assert!(!self.role_sorter.contains(role));
            self.role_sorter.add(role);
            self.role_sorter.activate(role);

            assert!(!self.framework_sorters.contains_key(role));
            let mut sorter =
                DrfSorter::new(self.options.fairness_exclude_resource_names.clone());
            for agent in self.agents.values() {
                sorter.add_agent_total(agent.total());
            }
            self.framework_sorters.insert(role.to_string(), sorter);
        }

        let members = self.roles.get_mut(role).expect("role was just ensured");
        assert!(
            members.insert(framework_id.clone()),
            "framework {framework_id} already tracked under role {role}"
        );

        self.framework_sorters
            .get_mut(role)
            .expect("role sorter was just ensured")
            .add(framework_id.as_str());
    }

    /// Stops tracking a framework under a role, destroying the role state
    /// when the last framework leaves. Quota'd roles stay in the quota-role
    /// sorter regardless: they influence allocation even with no
    /// subscribers.
    fn untrack_framework_under_role(&mut self, framework_id: &FrameworkId, role: &str) {
        let members = self
            .roles
            .get_mut(role)
            .unwrap_or_else(|| panic!("role {role} is not tracked"));
        assert!(
            members.remove(framework_id),
            "framework {framework_id} is not tracked under role {role}"
        );
        let empty = members.is_empty();

        self.framework_sorters
            .get_mut(role)
            .unwrap_or_else(|| panic!("no framework sorter for role {role}"))
            .remove(framework_id.as_str());

        if empty {
            assert_eq!(self.framework_sorters[role].count(), 0);
            self.roles.remove(role);
            self.role_sorter.remove(role);
            self.framework_sorters.remove(role);
        }
    }

    fn track_reservations(&mut self, reservations: &BTreeMap<String, Resources>) {
        for (role, resources) in reservations {
            let quantities = resources.scalar_quantities();
            if quantities.is_empty() {
                continue;
            }

            *self
                .reservation_scalar_quantities
                .entry(role.clone())
                .or_default() += &quantities;
            for ancestor in roles::ancestors(role) {
                *self
                    .reservation_scalar_quantities
                    .entry(ancestor)
                    .or_default() += &quantities;
            }
        }
    }

    fn untrack_reservations(&mut self, reservations: &BTreeMap<String, Resources>) {
        for (role, resources) in reservations {
            let quantities = resources.scalar_quantities();
            if quantities.is_empty() {
                continue;
            }

            let mut affected = vec![role.clone()];
            affected.extend(roles::ancestors(role));

            for r in affected {
                let current = self
                    .reservation_scalar_quantities
                    .get_mut(&r)
                    .unwrap_or_else(|| panic!("no tracked reservations for role {r}"));
                assert!(
                    current.contains(&quantities),
                    "reservation aggregate underflow for role {r}"
                );
                *current -= &quantities;
                if current.is_empty() {
                    self.reservation_scalar_quantities.remove(&r);
                }
            }
        }
    }

    /// Re-syncs the agent's total across all sorters and the reservation
    /// aggregate. Returns whether anything changed.
    fn update_agent_total(&mut self, agent_id: &AgentId, total: Resources) -> bool {
        let old_total = self
            .agents
            .get(agent_id)
            .unwrap_or_else(|| panic!("unknown agent {agent_id}"))
            .total()
            .clone();

        if old_total == total {
            return false;
        }

        self.agents
            .get_mut(agent_id)
            .expect("checked above")
            .update_total(total.clone());

        let old_reservations = old_total.reservations();
        let new_reservations = total.reservations();
        if old_reservations != new_reservations {
            self.untrack_reservations(&old_reservations);
            self.track_reservations(&new_reservations);
        }

        self.role_sorter.remove_agent_total(&old_total);
        self.role_sorter.add_agent_total(&total);

        for sorter in self.framework_sorters.values_mut() {
            sorter.remove_agent_total(&old_total);
            sorter.add_agent_total(&total);
        }

        self.quota_role_sorter
            .remove_agent_total(&old_total.non_revocable());
        self.quota_role_sorter.add_agent_total(&total.non_revocable());

        true
    }

    /// Tracks an allocation in the role, framework, and (when applicable)
    /// quota sorters. The framework may hold allocation under roles it is
    /// not subscribed to; it stays tracked under them regardless.
    fn track_allocated_resources(
        &mut self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        allocated: &Resources,
    ) {
        assert!(
            self.agents.contains_key(agent_id),
            "unknown agent {agent_id}"
        );
        assert!(
            self.frameworks.contains_key(framework_id),
            "unknown framework {framework_id}"
        );

        for (role, allocation) in allocated.allocations() {
            if !self.is_framework_tracked_under_role(framework_id, &role) {
                self.track_framework_under_role(framework_id, &role);
            }

            self.role_sorter.allocated(&role, agent_id, &allocation);
            self.framework_sorters
                .get_mut(&role)
                .expect("tracked roles have a framework sorter")
                .allocated(framework_id.as_str(), agent_id, &allocation);

            if self.quota_guarantees.contains_key(&role) {
                self.quota_role_sorter
                    .allocated(&role, agent_id, &allocation.non_revocable());
            }
        }
    }

    /// The inverse of [`Self::track_allocated_resources`]. The agent may
    /// already be gone (removal races recovery); only sorters are updated.
    fn untrack_allocated_resources(
        &mut self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        allocated: &Resources,
    ) {
        assert!(
            self.frameworks.contains_key(framework_id),
            "unknown framework {framework_id}"
        );

        for (role, allocation) in allocated.allocations() {
            self.framework_sorters
                .get_mut(&role)
                .unwrap_or_else(|| panic!("no framework sorter for role {role}"))
                .unallocated(framework_id.as_str(), agent_id, &allocation);

            self.role_sorter.unallocated(&role, agent_id, &allocation);

            if self.quota_guarantees.contains_key(&role) {
                self.quota_role_sorter
                    .unallocated(&role, agent_id, &allocation.non_revocable());
            }
        }
    }

    fn remove_filters_for_agent(&mut self, agent_id: &AgentId) {
        for framework in self.frameworks.values_mut() {
            framework.inverse_offer_filters.remove(agent_id);
            for agent_filters in framework.offer_filters.values_mut() {
                agent_filters.remove(agent_id);
            }
        }
        debug!(agent = %agent_id, "Removed all filters for agent");
    }

    /// Whether the offer passes the framework's (or global) minimum size:
    /// any listed minimum is sufficient.
    fn allocatable(&self, resources: &Resources, role: &str, framework_id: &FrameworkId) -> bool {
        if resources.is_empty() {
            return false;
        }

        let framework = &self.frameworks[framework_id];
        let minimums = framework
            .min_allocatable_resources
            .get(role)
            .or(self.options.min_allocatable_resources.as_ref());

        match minimums {
            None => true,
            Some(minimums) if minimums.is_empty() => true,
            Some(minimums) => minimums
                .iter()
                .any(|quantities| resources.contains_quantities(quantities)),
        }
    }

    /// Implicit capability gates plus the framework's refused-offer filters.
    fn is_offer_filtered(
        &self,
        framework_id: &FrameworkId,
        role: &str,
        agent_id: &AgentId,
        resources: &Resources,
    ) -> bool {
        let framework = &self.frameworks[framework_id];
        let agent = &self.agents[agent_id];

        // A multi-role framework cannot use offers from an agent that does
        // not understand multi-role allocations.
        if framework.capabilities.multi_role && !agent.capabilities.multi_role {
            warn!(
                agent = %agent_id,
                framework = %framework_id,
                "Implicitly filtering agent: framework is multi-role capable but the agent is not"
            );
            return true;
        }

        // Likewise for hierarchical roles.
        if !agent.capabilities.hierarchical_role && roles::is_hierarchical(role) {
            warn!(
                agent = %agent_id,
                role,
                "Implicitly filtering agent: role is hierarchical but the agent is not capable"
            );
            return true;
        }

        let filters = framework
            .offer_filters
            .get(role)
            .and_then(|role_filters| role_filters.get(agent_id));

        if let Some(filters) = filters {
            for filter in filters {
                if filter.filter(resources) {
                    debug!(
                        agent = %agent_id,
                        role,
                        framework = %framework_id,
                        resources = %resources,
                        "Filtered offer"
                    );
                    return true;
                }
            }
        }

        false
    }

    fn is_inverse_filtered(&self, framework_id: &FrameworkId, agent_id: &AgentId) -> bool {
        let framework = &self.frameworks[framework_id];
        if let Some(filters) = framework.inverse_offer_filters.get(agent_id) {
            for filter in filters {
                if filter.filter() {
                    debug!(
                        agent = %agent_id,
                        framework = %framework_id,
                        "Filtered unavailability"
                    );
                    return true;
                }
            }
        }
        false
    }

    /// Whether the agent is in a different region than the master.
    fn is_remote_agent(&self, agent: &Agent) -> bool {
        let Some(agent_domain) = &agent.info.domain else {
            return false;
        };
        let master_domain = self
            .options
            .domain
            .as_ref()
            .expect("master must have a domain when agents do");
        master_domain.region != agent_domain.region
    }

    fn can_receive_agent(&self, capabilities: FrameworkCapabilities, agent: &Agent) -> bool {
        // GPU agents are reserved for GPU-aware frameworks when configured.
        if self.options.filter_gpu_resources && !capabilities.gpu_resources && agent.has_gpu() {
            return false;
        }

        // Non-region-aware frameworks never get remote agents.
        if !capabilities.region_aware && self.is_remote_agent(agent) {
            return false;
        }

        true
    }
}

/// Applies conversions in order; fails without partial effects when a
/// consumed set is not contained.
fn apply_conversions(
    base: &Resources,
    conversions: &[ResourceConversion],
) -> Result<Resources, String> {
    let mut result = base.clone();
    for conversion in conversions {
        result = result.checked_sub(&conversion.consumed).ok_or_else(|| {
            format!(
                "{result} does not contain consumed resources {}",
                conversion.consumed
            )
        })?;
        result += &conversion.converted;
    }
    Ok(result)
}

/// Shrinks `resources` down to the target quantities. Divisible scalars are
/// chopped to fit; indivisible resources are taken whole or dropped;
/// resources whose name the target does not mention are dropped.
fn shrink_to_quantities(resources: Resources, mut target: ResourceQuantities) -> Resources {
    if target.is_empty() {
        return Resources::new();
    }

    let mut result = Resources::new();
    for mut item in resources {
        let goal = target.get(&item.name);
        if goal == Scalar::ZERO {
            continue;
        }
        if Resources::shrink(&mut item, goal) {
            target -= Resources::from(item.clone()).scalar_quantities();
            result += item;
        }
    }
    result
}

/// Drops individual resources the framework cannot consume: shared,
/// revocable, or refined-reservation items without the matching capability.
fn strip_incapable_resources(
    resources: Resources,
    capabilities: FrameworkCapabilities,
) -> Resources {
    resources.filter(|resource| {
        if !capabilities.shared_resources && resource.shared {
            return false;
        }
        if !capabilities.revocable_resources && resource.revocable {
            return false;
        }
        if !capabilities.reservation_refinement && resource.has_refined_reservation() {
            return false;
        }
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn res(s: &str) -> Resources {
        s.parse().unwrap()
    }

    fn quantities(s: &str) -> ResourceQuantities {
        s.parse().unwrap()
    }

    fn noop_engine(options: AllocatorOptions) -> HierarchicalAllocator {
        HierarchicalAllocator::new(options, Box::new(|_, _| {}), Box::new(|_, _| {}))
    }

    #[test]
    fn test_shrink_to_quantities_chops_scalars() {
        let shrunk = shrink_to_quantities(res("cpus:10;mem:1024"), quantities("cpus:4"));
        assert_eq!(shrunk, res("cpus:4"));
    }

    #[test]
    fn test_shrink_to_quantities_drops_non_scalars() {
        let shrunk =
            shrink_to_quantities(res("cpus:10;ports:[1-100]"), quantities("cpus:4;ports:50"));
        assert_eq!(shrunk, res("cpus:4"));
    }

    #[test]
    fn test_apply_conversions() {
        let base = res("cpus:10;mem:1024");
        let reserved: Resources =
            strata_resources::Resource::scalar("cpus", 4.0).reserved_to("prod").into();

        let converted = apply_conversions(
            &base,
            &[ResourceConversion {
                consumed: res("cpus:4"),
                converted: reserved.clone(),
            }],
        )
        .unwrap();
        assert_eq!(converted, res("cpus:6;mem:1024") + reserved);

        assert!(apply_conversions(
            &base,
            &[ResourceConversion {
                consumed: res("cpus:11"),
                converted: Resources::new(),
            }]
        )
        .is_err());
    }

    #[test]
    fn test_strip_incapable_resources() {
        let mut available = res("cpus:4");
        available += strata_resources::Resource::scalar("cpus", 1.0).revocable();
        available += strata_resources::Resource::scalar("disk", 10.0).shared();
        available += strata_resources::Resource::scalar("mem", 64.0)
            .reserved_to("a")
            .refined_to("a/b");

        let stripped =
            strip_incapable_resources(available.clone(), FrameworkCapabilities::default());
        assert_eq!(stripped, res("cpus:4"));

        let all_capable = FrameworkCapabilities {
            shared_resources: true,
            revocable_resources: true,
            reservation_refinement: true,
            ..Default::default()
        };
        assert_eq!(strip_incapable_resources(available.clone(), all_capable), available);
    }

    #[test]
    fn test_reservation_tracking_rolls_up_ancestors() {
        let mut engine = noop_engine(AllocatorOptions::default());

        let mut total = res("cpus:8");
        total += strata_resources::Resource::scalar("cpus", 2.0).reserved_to("eng/web");

        engine.add_agent(
            &AgentId::new("agent-1"),
            AgentInfo::new("host1"),
            AgentCapabilities::default(),
            None,
            total,
            HashMap::new(),
        );

        assert_eq!(
            engine.reservation_quantities("eng/web"),
            quantities("cpus:2")
        );
        assert_eq!(engine.reservation_quantities("eng"), quantities("cpus:2"));

        engine.remove_agent(&AgentId::new("agent-1"));
        assert!(engine.reservation_quantities("eng").is_empty());
        assert!(engine.reservation_quantities("eng/web").is_empty());
    }

    #[test]
    fn test_track_untrack_framework_under_role() {
        let mut engine = noop_engine(AllocatorOptions::default());
        let fw = FrameworkId::new("fw-1");

        engine.add_framework(
            &fw,
            FrameworkSpec::with_roles(["dev"]),
            HashMap::new(),
            true,
            BTreeSet::new(),
        );
        assert!(engine.has_role("dev"));
        assert!(engine.framework_sorter("dev").unwrap().contains("fw-1"));
        assert!(engine.role_sorter().contains("dev"));

        engine.remove_framework(&fw);
        assert!(!engine.has_role("dev"));
        assert!(engine.framework_sorter("dev").is_none());
        assert!(!engine.role_sorter().contains("dev"));
        assert_eq!(engine.completed_framework_metrics().len(), 1);
    }

    #[test]
    fn test_set_quota_seeds_existing_allocation() {
        let offers: Arc<Mutex<Vec<(FrameworkId, Offers)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&offers);
        let mut engine = HierarchicalAllocator::new(
            AllocatorOptions::default(),
            Box::new(move |id, o| sink.lock().unwrap().push((id.clone(), o))),
            Box::new(|_, _| {}),
        );

        engine.add_framework(
            &FrameworkId::new("fw-1"),
            FrameworkSpec::with_roles(["prod"]),
            HashMap::new(),
            true,
            BTreeSet::new(),
        );
        engine.add_agent(
            &AgentId::new("agent-1"),
            AgentInfo::new("host1"),
            AgentCapabilities::default(),
            None,
            res("cpus:10;mem:1024"),
            HashMap::new(),
        );

        engine.run_allocation_cycle();
        assert_eq!(offers.lock().unwrap().len(), 1);

        engine.set_quota("prod", quantities("cpus:4"));
        let quota_allocation = engine
            .quota_role_sorter()
            .allocation_quantities_of("prod");
        assert_eq!(quota_allocation, quantities("cpus:10;mem:1024"));

        engine.remove_quota("prod");
        assert!(!engine.quota_role_sorter().contains("prod"));
        assert!(engine.quota_guarantee("prod").is_none());
    }

    #[test]
    fn test_update_available_failure_leaves_state() {
        let mut engine = noop_engine(AllocatorOptions::default());
        let agent = AgentId::new("agent-1");
        engine.add_agent(
            &agent,
            AgentInfo::new("host1"),
            AgentCapabilities::default(),
            None,
            res("cpus:4"),
            HashMap::new(),
        );

        let result = engine.update_available(
            &agent,
            vec![ResourceConversion {
                consumed: res("cpus:8"),
                converted: Resources::new(),
            }],
        );
        assert!(matches!(
            result,
            Err(AllocatorError::OperationConflict { .. })
        ));
        assert_eq!(engine.agent(&agent).unwrap().total(), &res("cpus:4"));

        let reserved: Resources =
            strata_resources::Resource::scalar("cpus", 2.0).reserved_to("prod").into();
        engine
            .update_available(
                &agent,
                vec![ResourceConversion {
                    consumed: res("cpus:2"),
                    converted: reserved.clone(),
                }],
            )
            .unwrap();
        assert_eq!(
            engine.agent(&agent).unwrap().total(),
            &(res("cpus:2") + reserved)
        );
    }

    #[test]
    #[should_panic(expected = "already added")]
    fn test_duplicate_framework_panics() {
        let mut engine = noop_engine(AllocatorOptions::default());
        let fw = FrameworkId::new("fw-1");
        engine.add_framework(
            &fw,
            FrameworkSpec::with_roles(["dev"]),
            HashMap::new(),
            true,
            BTreeSet::new(),
        );
        engine.add_framework(
            &fw,
            FrameworkSpec::with_roles(["dev"]),
            HashMap::new(),
            true,
            BTreeSet::new(),
        );
    }

    #[test]
    fn test_whitelist_gates_offers() {
        let offers: Arc<Mutex<Vec<(FrameworkId, Offers)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&offers);
        let mut engine = HierarchicalAllocator::new(
            AllocatorOptions::default(),
            Box::new(move |id, o| sink.lock().unwrap().push((id.clone(), o))),
            Box::new(|_, _| {}),
        );

        engine.add_framework(
            &FrameworkId::new("fw-1"),
            FrameworkSpec::with_roles(["dev"]),
            HashMap::new(),
            true,
            BTreeSet::new(),
        );
        engine.update_whitelist(Some(["elsewhere".to_string()].into_iter().collect()));
        engine.add_agent(
            &AgentId::new("agent-1"),
            AgentInfo::new("host1"),
            AgentCapabilities::default(),
            None,
            res("cpus:4"),
            HashMap::new(),
        );
        engine.run_allocation_cycle();
        assert!(offers.lock().unwrap().is_empty());

        engine.update_whitelist(None);
        engine.trigger_allocation_all();
        engine.run_allocation_cycle();
        assert_eq!(offers.lock().unwrap().len(), 1);
    }
}
