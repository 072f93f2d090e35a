//! Per-agent state.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_resources::{Resources, Scalar};

use crate::ids::FrameworkId;

/// A fault domain: the region/zone an agent (or the master) runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDomain {
    pub region: String,
    pub zone: String,
}

/// Static agent metadata the engine consults for placement gating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,

    /// Free-form attributes; a change invalidates outstanding offer
    /// filters against the agent.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub domain: Option<FaultDomain>,
}

impl AgentInfo {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            attributes: BTreeMap::new(),
            domain: None,
        }
    }

    #[must_use]
    pub fn with_domain(mut self, region: &str, zone: &str) -> Self {
        self.domain = Some(FaultDomain {
            region: region.to_string(),
            zone: zone.to_string(),
        });
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }
}

/// Agent capabilities the engine gates offers on. Modern agents support
/// everything, hence the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub multi_role: bool,
    pub hierarchical_role: bool,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            multi_role: true,
            hierarchical_role: true,
        }
    }
}

/// A window during which the agent is scheduled to be unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailability {
    pub start: DateTime<Utc>,

    /// Open-ended when absent.
    #[serde(default)]
    pub duration: Option<std::time::Duration>,
}

/// The payload of an inverse offer: resources the framework is asked to
/// release (currently always empty, since maintenance is whole-agent) plus
/// the unavailability window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableResources {
    pub resources: Resources,
    pub unavailability: Unavailability,
}

/// How a framework answered an inverse offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverseOfferResponse {
    Accept,
    Decline,
}

/// A framework's latest recorded response for one agent's maintenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InverseOfferStatus {
    pub response: InverseOfferResponse,
    pub updated_at: DateTime<Utc>,
}

/// Maintenance bookkeeping for one agent.
#[derive(Debug, Clone)]
pub(crate) struct Maintenance {
    pub unavailability: Unavailability,

    /// Frameworks with an inverse offer outstanding (sent, not yet
    /// responded to or rescinded).
    pub offers_outstanding: HashSet<FrameworkId>,

    /// Latest responses, by framework.
    pub statuses: HashMap<FrameworkId, InverseOfferStatus>,
}

impl Maintenance {
    pub(crate) fn new(unavailability: Unavailability) -> Self {
        Self {
            unavailability,
            offers_outstanding: HashSet::new(),
            statuses: HashMap::new(),
        }
    }
}

/// One agent's resource accounting.
#[derive(Debug)]
pub struct Agent {
    pub(crate) info: AgentInfo,
    pub(crate) capabilities: AgentCapabilities,
    pub(crate) activated: bool,

    total: Resources,

    /// Allocated resources, with allocation-role tags.
    allocated: Resources,

    pub(crate) maintenance: Option<Maintenance>,
}

impl Agent {
    #[must_use]
    pub(crate) fn new(
        info: AgentInfo,
        capabilities: AgentCapabilities,
        total: Resources,
        allocated: Resources,
    ) -> Self {
        Self {
            info,
            capabilities,
            activated: true,
            total,
            allocated,
            maintenance: None,
        }
    }

    #[must_use]
    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    #[must_use]
    pub fn capabilities(&self) -> AgentCapabilities {
        self.capabilities
    }

    #[must_use]
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    #[must_use]
    pub fn total(&self) -> &Resources {
        &self.total
    }

    #[must_use]
    pub fn allocated(&self) -> &Resources {
        &self.allocated
    }

    /// Unallocated resources: the total minus the allocation with its
    /// allocation tags stripped (the total is stored untagged).
    #[must_use]
    pub fn available(&self) -> Resources {
        let mut allocated = self.allocated.clone();
        allocated.unallocate();
        self.total.clone() - allocated
    }

    pub(crate) fn allocate(&mut self, resources: &Resources) {
        self.allocated += resources;
    }

    pub(crate) fn unallocate(&mut self, resources: &Resources) {
        self.allocated -= resources;
    }

    pub(crate) fn update_total(&mut self, total: Resources) {
        self.total = total;
    }

    /// True when the agent has any GPU resource in its total.
    #[must_use]
    pub fn has_gpu(&self) -> bool {
        self.total.quantities().get("gpus") > Scalar::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(s: &str) -> Resources {
        s.parse().unwrap()
    }

    fn agent(total: &str) -> Agent {
        Agent::new(
            AgentInfo::new("host1"),
            AgentCapabilities::default(),
            res(total),
            Resources::new(),
        )
    }

    #[test]
    fn test_available_strips_allocation_tags() {
        let mut a = agent("cpus:10;mem:1024");
        let mut offered = res("cpus:4;mem:512");
        offered.allocate("dev");
        a.allocate(&offered);

        assert_eq!(a.available(), res("cpus:6;mem:512"));
        assert!(a.total().contains(&a.available()));
    }

    #[test]
    fn test_unallocate_restores_available() {
        let mut a = agent("cpus:10");
        let mut offered = res("cpus:4");
        offered.allocate("dev");
        a.allocate(&offered);
        a.unallocate(&offered);
        assert_eq!(a.available(), res("cpus:10"));
        assert!(a.allocated().is_empty());
    }

    #[test]
    fn test_has_gpu() {
        assert!(agent("cpus:1;gpus:2").has_gpu());
        assert!(!agent("cpus:1").has_gpu());
    }
}
