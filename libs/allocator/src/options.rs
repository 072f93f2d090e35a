//! Allocator configuration.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use strata_resources::ResourceQuantities;

use crate::agent::FaultDomain;

/// Options recognized at allocator construction.
#[derive(Debug, Clone)]
pub struct AllocatorOptions {
    /// Interval between periodic allocation cycles.
    pub allocation_interval: Duration,

    /// Resource names excluded from dominant-share calculation.
    pub fairness_exclude_resource_names: HashSet<String>,

    /// Global minimum offer sizes: an offer passes when it contains at
    /// least one entry. `None` or an empty list accepts any non-empty offer.
    /// Frameworks may override this per role.
    pub min_allocatable_resources: Option<Vec<ResourceQuantities>>,

    /// Bound on the completed-framework metrics retained after removal.
    pub max_completed_frameworks: usize,

    /// When set, agents with GPUs are only offered to GPU-capable
    /// frameworks.
    pub filter_gpu_resources: bool,

    /// The master's fault domain; agents in a different region are only
    /// offered to region-aware frameworks.
    pub domain: Option<FaultDomain>,

    /// Whether per-framework counters are kept at all.
    pub publish_per_framework_metrics: bool,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            allocation_interval: Duration::from_secs(1),
            fairness_exclude_resource_names: HashSet::new(),
            min_allocatable_resources: None,
            max_completed_frameworks: 50,
            filter_gpu_resources: false,
            domain: None,
            publish_per_framework_metrics: true,
        }
    }
}

impl AllocatorOptions {
    /// Loads options from the environment (`STRATA_*`), falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();

        if let Ok(ms) = std::env::var("STRATA_ALLOCATION_INTERVAL_MS") {
            options.allocation_interval = Duration::from_millis(ms.parse()?);
        }

        if let Ok(names) = std::env::var("STRATA_FAIRNESS_EXCLUDE_RESOURCES") {
            options.fairness_exclude_resource_names = names
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(spec) = std::env::var("STRATA_MIN_ALLOCATABLE_RESOURCES") {
            // Alternatives separated by `|`: "cpus:0.1;mem:32|disk:32".
            let mut entries = Vec::new();
            for alternative in spec.split('|').filter(|s| !s.trim().is_empty()) {
                entries.push(alternative.parse::<ResourceQuantities>()?);
            }
            options.min_allocatable_resources = Some(entries);
        }

        if let Ok(max) = std::env::var("STRATA_MAX_COMPLETED_FRAMEWORKS") {
            options.max_completed_frameworks = max.parse()?;
        }

        if let Ok(filter) = std::env::var("STRATA_FILTER_GPU_RESOURCES") {
            options.filter_gpu_resources = filter.parse()?;
        }

        if let (Ok(region), Ok(zone)) = (
            std::env::var("STRATA_DOMAIN_REGION"),
            std::env::var("STRATA_DOMAIN_ZONE"),
        ) {
            options.domain = Some(FaultDomain { region, zone });
        }

        if let Ok(publish) = std::env::var("STRATA_PER_FRAMEWORK_METRICS") {
            options.publish_per_framework_metrics = publish.parse()?;
        }

        Ok(options)
    }
}
