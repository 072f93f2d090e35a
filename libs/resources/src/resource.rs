//! A single typed resource item.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::quantities::Scalar;
use crate::ResourceError;

/// Disjoint, sorted, coalesced intervals of u64 (e.g. port ranges).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ranges(Vec<(u64, u64)>);

impl Ranges {
    #[must_use]
    pub fn new(intervals: Vec<(u64, u64)>) -> Self {
        let mut ranges = Ranges(intervals.into_iter().filter(|(lo, hi)| lo <= hi).collect());
        ranges.normalize();
        ranges
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of values covered.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.0.iter().map(|(lo, hi)| hi - lo + 1).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.0.iter().copied()
    }

    fn normalize(&mut self) {
        self.0.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.0.len());
        for &(lo, hi) in &self.0 {
            match merged.last_mut() {
                // Adjacent or overlapping intervals coalesce.
                Some((_, prev_hi)) if lo <= prev_hi.saturating_add(1) => {
                    *prev_hi = (*prev_hi).max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        self.0 = merged;
    }

    #[must_use]
    pub fn union(&self, other: &Ranges) -> Ranges {
        let mut combined = self.0.clone();
        combined.extend_from_slice(&other.0);
        Ranges::new(combined)
    }

    /// Removes `other` from `self`; values absent from `self` are ignored.
    #[must_use]
    pub fn difference(&self, other: &Ranges) -> Ranges {
        let mut result = Vec::new();
        for &(lo, hi) in &self.0 {
            let mut cursor = lo;
            for &(olo, ohi) in &other.0 {
                if ohi < cursor || olo > hi {
                    continue;
                }
                if olo > cursor {
                    result.push((cursor, olo - 1));
                }
                cursor = ohi.saturating_add(1);
                if cursor > hi {
                    break;
                }
            }
            if cursor <= hi {
                result.push((cursor, hi));
            }
        }
        Ranges(result)
    }

    #[must_use]
    pub fn contains(&self, other: &Ranges) -> bool {
        other
            .0
            .iter()
            .all(|&(lo, hi)| self.0.iter().any(|&(slo, shi)| slo <= lo && hi <= shi))
    }
}

impl fmt::Display for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(lo, hi)| format!("{lo}-{hi}"))
            .collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// The value carried by a resource item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Scalar(Scalar),
    Ranges(Ranges),
    Set(BTreeSet<String>),
}

impl Value {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(s) => !s.is_positive(),
            Value::Ranges(r) => r.is_empty(),
            Value::Set(s) => s.is_empty(),
        }
    }

    /// Flattened quantity: scalar value, range size, or set cardinality.
    #[must_use]
    pub fn quantity(&self) -> Scalar {
        match self {
            Value::Scalar(s) => *s,
            Value::Ranges(r) => Scalar::from_units(r.size() as i64),
            Value::Set(s) => Scalar::from_units(s.len() as i64),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(s) => write!(f, "{s}"),
            Value::Ranges(r) => write!(f, "{r}"),
            Value::Set(s) => {
                let items: Vec<&str> = s.iter().map(String::as_str).collect();
                write!(f, "{{{}}}", items.join(","))
            }
        }
    }
}

/// Kind of disk backing a disk resource. `Mount` disks are indivisible:
/// they are offered whole or not at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    Path,
    Mount,
}

/// A single resource item: a named value plus the metadata that determines
/// who may consume it.
///
/// Two items merge under addition only when everything except the value is
/// identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: Value,

    /// Reservation chain, outermost role first. Empty means unreserved; a
    /// chain longer than one is a refined reservation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reservations: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub revocable: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shared: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskKind>,

    /// The role this item is currently allocated to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_role: Option<String>,
}

impl Resource {
    /// A scalar resource, given in whole units.
    #[must_use]
    pub fn scalar(name: &str, units: f64) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Scalar(Scalar::from_f64(units)),
            reservations: Vec::new(),
            revocable: false,
            shared: false,
            disk: None,
            allocation_role: None,
        }
    }

    /// A ranges resource (e.g. ports).
    #[must_use]
    pub fn ranges(name: &str, intervals: Vec<(u64, u64)>) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Ranges(Ranges::new(intervals)),
            reservations: Vec::new(),
            revocable: false,
            shared: false,
            disk: None,
            allocation_role: None,
        }
    }

    /// A set resource.
    #[must_use]
    pub fn set(name: &str, items: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            value: Value::Set(items.iter().map(|s| s.to_string()).collect()),
            reservations: Vec::new(),
            revocable: false,
            shared: false,
            disk: None,
            allocation_role: None,
        }
    }

    /// Statically reserves this item to `role`, replacing any existing chain.
    #[must_use]
    pub fn reserved_to(mut self, role: &str) -> Self {
        self.reservations = vec![role.to_string()];
        self
    }

    /// Pushes a reservation refinement onto the chain.
    #[must_use]
    pub fn refined_to(mut self, role: &str) -> Self {
        self.reservations.push(role.to_string());
        self
    }

    #[must_use]
    pub fn revocable(mut self) -> Self {
        self.revocable = true;
        self
    }

    #[must_use]
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    #[must_use]
    pub fn with_disk(mut self, kind: DiskKind) -> Self {
        self.disk = Some(kind);
        self
    }

    /// The innermost reservation role, if reserved.
    #[must_use]
    pub fn reservation_role(&self) -> Option<&str> {
        self.reservations.last().map(String::as_str)
    }

    #[must_use]
    pub fn is_unreserved(&self) -> bool {
        self.reservations.is_empty()
    }

    #[must_use]
    pub fn has_refined_reservation(&self) -> bool {
        self.reservations.len() > 1
    }

    /// True when this item can be shrunk to a smaller scalar in place.
    #[must_use]
    pub fn is_divisible(&self) -> bool {
        matches!(self.value, Value::Scalar(_)) && self.disk != Some(DiskKind::Mount)
    }

    /// True when the two items differ at most in their value.
    #[must_use]
    pub fn merges_with(&self, other: &Resource) -> bool {
        self.name == other.name
            && std::mem::discriminant(&self.value) == std::mem::discriminant(&other.value)
            && self.reservations == other.reservations
            && self.revocable == other.revocable
            && self.shared == other.shared
            && self.disk == other.disk
            && self.allocation_role == other.allocation_role
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(role) = self.reservation_role() {
            write!(f, "(reserved:{role})")?;
        }
        if self.revocable {
            write!(f, "(revocable)")?;
        }
        if self.shared {
            write!(f, "(shared)")?;
        }
        if let Some(role) = &self.allocation_role {
            write!(f, "(allocated:{role})")?;
        }
        write!(f, ":{}", self.value)
    }
}

/// Parses a single `name:value` item; scalars or `[lo-hi,...]` ranges.
pub(crate) fn parse_item(input: &str) -> Result<Resource, ResourceError> {
    let (name, value) = input
        .split_once(':')
        .ok_or_else(|| ResourceError::InvalidSyntax(input.to_string()))?;
    let name = name.trim();
    let value = value.trim();

    if let Some(ranges) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        let mut intervals = Vec::new();
        for part in ranges.split(',').filter(|p| !p.trim().is_empty()) {
            let (lo, hi) = part
                .split_once('-')
                .ok_or_else(|| ResourceError::InvalidSyntax(input.to_string()))?;
            let lo: u64 = lo
                .trim()
                .parse()
                .map_err(|_| ResourceError::InvalidSyntax(input.to_string()))?;
            let hi: u64 = hi
                .trim()
                .parse()
                .map_err(|_| ResourceError::InvalidSyntax(input.to_string()))?;
            intervals.push((lo, hi));
        }
        return Ok(Resource::ranges(name, intervals));
    }

    if let Some(set) = value.strip_prefix('{').and_then(|v| v.strip_suffix('}')) {
        let items: Vec<&str> = set
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        return Ok(Resource::set(name, &items));
    }

    let scalar: Scalar = value.parse()?;
    if scalar.as_millis() < 0 {
        return Err(ResourceError::InvalidSyntax(format!(
            "negative value in '{input}'"
        )));
    }
    Ok(Resource {
        name: name.to_string(),
        value: Value::Scalar(scalar),
        reservations: Vec::new(),
        revocable: false,
        shared: false,
        disk: None,
        allocation_role: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_normalize() {
        let r = Ranges::new(vec![(5, 10), (1, 3), (4, 4), (20, 25)]);
        assert_eq!(r, Ranges::new(vec![(1, 10), (20, 25)]));
        assert_eq!(r.size(), 16);
    }

    #[test]
    fn test_ranges_difference() {
        let r = Ranges::new(vec![(1, 10)]);
        let d = r.difference(&Ranges::new(vec![(3, 5), (9, 12)]));
        assert_eq!(d, Ranges::new(vec![(1, 2), (6, 8)]));
    }

    #[test]
    fn test_ranges_contains() {
        let r = Ranges::new(vec![(1, 10), (20, 30)]);
        assert!(r.contains(&Ranges::new(vec![(2, 5), (25, 30)])));
        assert!(!r.contains(&Ranges::new(vec![(9, 12)])));
    }

    #[test]
    fn test_merges_with_respects_metadata() {
        let plain = Resource::scalar("cpus", 1.0);
        let reserved = Resource::scalar("cpus", 1.0).reserved_to("prod");
        let revocable = Resource::scalar("cpus", 1.0).revocable();
        assert!(plain.merges_with(&Resource::scalar("cpus", 5.0)));
        assert!(!plain.merges_with(&reserved));
        assert!(!plain.merges_with(&revocable));
        assert!(!plain.merges_with(&Resource::scalar("mem", 1.0)));
    }

    #[test]
    fn test_mount_disk_indivisible() {
        let mount = Resource::scalar("disk", 100.0).with_disk(DiskKind::Mount);
        let path = Resource::scalar("disk", 100.0).with_disk(DiskKind::Path);
        assert!(!mount.is_divisible());
        assert!(path.is_divisible());
    }

    #[test]
    fn test_refined_reservation() {
        let r = Resource::scalar("cpus", 1.0)
            .reserved_to("eng")
            .refined_to("eng/web");
        assert!(r.has_refined_reservation());
        assert_eq!(r.reservation_role(), Some("eng/web"));
    }

    #[test]
    fn test_parse_item() {
        let cpus = parse_item("cpus:2.5").unwrap();
        assert_eq!(cpus.value, Value::Scalar(Scalar::from_f64(2.5)));

        let ports = parse_item("ports:[31000-32000]").unwrap();
        assert_eq!(ports.value.quantity(), Scalar::from_units(1001));

        assert!(parse_item("cpus").is_err());
        assert!(parse_item("cpus:-1").is_err());
    }
}
