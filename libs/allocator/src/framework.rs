//! Per-framework state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_resources::ResourceQuantities;

use crate::filters::{RefusedInverseOfferFilter, RefusedOfferFilter};
use crate::ids::AgentId;
use crate::metrics::FrameworkMetrics;

/// Framework capabilities the engine gates offers and resources on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkCapabilities {
    /// May subscribe to several roles; such frameworks can only receive
    /// offers from multi-role-capable agents.
    pub multi_role: bool,

    /// May receive offers from agents with GPUs even when
    /// `filter_gpu_resources` is set.
    pub gpu_resources: bool,

    /// May receive shared resources.
    pub shared_resources: bool,

    /// May receive revocable resources.
    pub revocable_resources: bool,

    /// May receive offers from agents in remote regions.
    pub region_aware: bool,

    /// Understands refined reservation chains.
    pub reservation_refinement: bool,
}

/// The subscription a framework registers (and re-registers) with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkSpec {
    /// Subscribed roles; hierarchical names use `/` separators.
    pub roles: BTreeSet<String>,

    pub capabilities: FrameworkCapabilities,

    /// Per-role minimum offer sizes, overriding the global option: an
    /// offer passes when it contains at least one listed entry; an empty
    /// list accepts any non-empty offer.
    #[serde(default)]
    pub min_allocatable_resources: HashMap<String, Vec<ResourceQuantities>>,
}

impl FrameworkSpec {
    #[must_use]
    pub fn with_roles<I: IntoIterator<Item = S>, S: Into<String>>(roles: I) -> Self {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: FrameworkCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// One framework's allocator-side state.
#[derive(Debug)]
pub struct Framework {
    pub(crate) roles: BTreeSet<String>,
    pub(crate) suppressed_roles: BTreeSet<String>,
    pub(crate) capabilities: FrameworkCapabilities,
    pub(crate) active: bool,
    pub(crate) min_allocatable_resources: HashMap<String, Vec<ResourceQuantities>>,

    /// Offer filters: role → agent → installed filters. The map holds the
    /// only strong references; expiry timers hold weak ones.
    pub(crate) offer_filters: HashMap<String, HashMap<AgentId, Vec<Arc<RefusedOfferFilter>>>>,

    /// Inverse-offer filters by agent.
    pub(crate) inverse_offer_filters: HashMap<AgentId, Vec<Arc<RefusedInverseOfferFilter>>>,

    pub(crate) metrics: FrameworkMetrics,
}

impl Framework {
    pub(crate) fn new(
        spec: FrameworkSpec,
        suppressed_roles: BTreeSet<String>,
        active: bool,
        publish_metrics: bool,
    ) -> Self {
        Self {
            roles: spec.roles,
            suppressed_roles,
            capabilities: spec.capabilities,
            active,
            min_allocatable_resources: spec.min_allocatable_resources,
            offer_filters: HashMap::new(),
            inverse_offer_filters: HashMap::new(),
            metrics: FrameworkMetrics::new(publish_metrics),
        }
    }

    #[must_use]
    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    #[must_use]
    pub fn suppressed_roles(&self) -> &BTreeSet<String> {
        &self.suppressed_roles
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn capabilities(&self) -> FrameworkCapabilities {
        self.capabilities
    }

    #[must_use]
    pub fn metrics(&self) -> &FrameworkMetrics {
        &self.metrics
    }

    /// Number of offer filters currently installed, across roles/agents.
    #[must_use]
    pub fn offer_filter_count(&self) -> usize {
        self.offer_filters
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Number of inverse-offer filters currently installed.
    #[must_use]
    pub fn inverse_offer_filter_count(&self) -> usize {
        self.inverse_offer_filters.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = FrameworkSpec::with_roles(["dev", "prod/web"]).with_capabilities(
            FrameworkCapabilities {
                multi_role: true,
                ..Default::default()
            },
        );
        assert_eq!(spec.roles.len(), 2);
        assert!(spec.capabilities.multi_role);
        assert!(!spec.capabilities.gpu_resources);
    }

    #[test]
    fn test_new_framework_has_no_filters() {
        let framework = Framework::new(
            FrameworkSpec::with_roles(["dev"]),
            BTreeSet::new(),
            true,
            true,
        );
        assert_eq!(framework.offer_filter_count(), 0);
        assert_eq!(framework.inverse_offer_filter_count(), 0);
        assert!(framework.is_active());
    }
}
