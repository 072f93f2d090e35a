//! The `Resources` multiset and its algebra.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::quantities::{ResourceQuantities, Scalar};
use crate::resource::{parse_item, Resource, Value};
use crate::{roles, ResourceError};

/// A merged multiset of resource items.
///
/// Items whose metadata matches merge under addition; shared items are
/// atomic units and are kept as one entry per allocation (their multiplicity
/// tracks how many consumers hold them, while containment checks presence
/// only).
///
/// Addition is commutative and associative. `Sub`/`SubAssign` saturate:
/// quantities clamp at zero and absent items are ignored. `checked_sub`
/// is the partial subtraction, defined only when `self` contains the
/// subtrahend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(Vec<Resource>);

impl Resources {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resource> {
        self.0.iter()
    }

    /// Adds one item, merging with an existing entry when metadata matches.
    /// Shared items never merge: each addition is one more holder.
    pub fn add(&mut self, resource: Resource) {
        if resource.value.is_empty() {
            return;
        }
        if !resource.shared {
            if let Some(existing) = self.0.iter_mut().find(|r| r.merges_with(&resource)) {
                match (&mut existing.value, &resource.value) {
                    (Value::Scalar(a), Value::Scalar(b)) => *a += *b,
                    (Value::Ranges(a), Value::Ranges(b)) => *a = a.union(b),
                    (Value::Set(a), Value::Set(b)) => a.extend(b.iter().cloned()),
                    _ => unreachable!("merges_with checked value kinds"),
                }
                return;
            }
        }
        self.0.push(resource);
    }

    /// Removes one item, saturating; entries whose value reaches empty are
    /// dropped.
    fn subtract_item(&mut self, resource: &Resource) {
        if resource.value.is_empty() {
            return;
        }
        if resource.shared {
            // Shared items are atomic: drop one identical holder, if any.
            if let Some(idx) = self
                .0
                .iter()
                .position(|r| r.merges_with(resource) && r.value == resource.value)
            {
                self.0.remove(idx);
            }
            return;
        }
        if let Some(idx) = self.0.iter().position(|r| r.merges_with(resource)) {
            let remove = {
                let existing = &mut self.0[idx];
                match (&mut existing.value, &resource.value) {
                    (Value::Scalar(a), Value::Scalar(b)) => *a = a.saturating_sub(*b),
                    (Value::Ranges(a), Value::Ranges(b)) => *a = a.difference(b),
                    (Value::Set(a), Value::Set(b)) => {
                        a.retain(|item| !b.contains(item));
                    }
                    _ => unreachable!("merges_with checked value kinds"),
                }
                existing.value.is_empty()
            };
            if remove {
                self.0.remove(idx);
            }
        }
    }

    /// True when `resource` is covered by this set.
    #[must_use]
    pub fn contains_resource(&self, resource: &Resource) -> bool {
        if resource.value.is_empty() {
            return true;
        }
        self.0.iter().any(|r| {
            if !r.merges_with(resource) {
                return false;
            }
            if resource.shared {
                // Presence suffices for shared items.
                return r.value == resource.value;
            }
            match (&r.value, &resource.value) {
                (Value::Scalar(a), Value::Scalar(b)) => a >= b,
                (Value::Ranges(a), Value::Ranges(b)) => a.contains(b),
                (Value::Set(a), Value::Set(b)) => b.is_subset(a),
                _ => false,
            }
        })
    }

    /// True when every item of `other` is covered.
    #[must_use]
    pub fn contains(&self, other: &Resources) -> bool {
        other.iter().all(|r| self.contains_resource(r))
    }

    /// True when the flattened per-name quantities cover `quantities`.
    #[must_use]
    pub fn contains_quantities(&self, quantities: &ResourceQuantities) -> bool {
        self.quantities().contains(quantities)
    }

    /// Partial subtraction: `None` unless `self` contains `other`.
    #[must_use]
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        if !self.contains(other) {
            return None;
        }
        let mut result = self.clone();
        result -= other;
        Some(result)
    }

    /// Keeps only items satisfying `predicate`.
    #[must_use]
    pub fn filter(&self, predicate: impl Fn(&Resource) -> bool) -> Resources {
        Resources(self.0.iter().filter(|r| predicate(r)).cloned().collect())
    }

    #[must_use]
    pub fn unreserved(&self) -> Resources {
        self.filter(Resource::is_unreserved)
    }

    /// Items reserved to exactly `role`.
    #[must_use]
    pub fn reserved(&self, role: &str) -> Resources {
        self.filter(|r| r.reservation_role() == Some(role))
    }

    /// All reserved items, grouped by their innermost reservation role.
    #[must_use]
    pub fn reservations(&self) -> BTreeMap<String, Resources> {
        let mut result: BTreeMap<String, Resources> = BTreeMap::new();
        for r in &self.0 {
            if let Some(role) = r.reservation_role() {
                result.entry(role.to_string()).or_default().add(r.clone());
            }
        }
        result
    }

    /// The subset a framework in `role` may be offered: unreserved items
    /// plus items reserved to `role` or to any of its ancestors.
    #[must_use]
    pub fn allocatable_to(&self, role: &str) -> Resources {
        self.filter(|r| match r.reservation_role() {
            None => true,
            Some(reserved) => reserved == role || roles::is_ancestor(reserved, role),
        })
    }

    #[must_use]
    pub fn revocable(&self) -> Resources {
        self.filter(|r| r.revocable)
    }

    #[must_use]
    pub fn non_revocable(&self) -> Resources {
        self.filter(|r| !r.revocable)
    }

    #[must_use]
    pub fn shared(&self) -> Resources {
        self.filter(|r| r.shared)
    }

    #[must_use]
    pub fn scalars(&self) -> Resources {
        self.filter(|r| matches!(r.value, Value::Scalar(_)))
    }

    /// Groups items by allocation-role tag; untagged items are skipped.
    #[must_use]
    pub fn allocations(&self) -> BTreeMap<String, Resources> {
        let mut result: BTreeMap<String, Resources> = BTreeMap::new();
        for r in &self.0 {
            if let Some(role) = &r.allocation_role {
                result.entry(role.clone()).or_default().add(r.clone());
            }
        }
        result
    }

    /// Tags every item as allocated to `role`.
    pub fn allocate(&mut self, role: &str) {
        let items = std::mem::take(&mut self.0);
        for mut r in items {
            r.allocation_role = Some(role.to_string());
            self.add(r);
        }
    }

    /// Clears every item's allocation tag.
    pub fn unallocate(&mut self) {
        let items = std::mem::take(&mut self.0);
        for mut r in items {
            r.allocation_role = None;
            self.add(r);
        }
    }

    /// Flattened per-name quantities: scalar values, range sizes, set
    /// cardinalities.
    #[must_use]
    pub fn quantities(&self) -> ResourceQuantities {
        self.0
            .iter()
            .map(|r| (r.name.clone(), r.value.quantity()))
            .collect()
    }

    /// Per-name quantities of the scalar items only. This is the projection
    /// quota and headroom accounting operate on.
    #[must_use]
    pub fn scalar_quantities(&self) -> ResourceQuantities {
        self.0
            .iter()
            .filter(|r| matches!(r.value, Value::Scalar(_)))
            .map(|r| (r.name.clone(), r.value.quantity()))
            .collect()
    }

    /// Shrinks a scalar resource in place to `target`.
    ///
    /// Returns true when the resource now fits within `target`: either it
    /// already did, or it was divisible and has been reduced to exactly
    /// `target`. Indivisible resources (mount disks, non-scalars) that
    /// exceed the target are left unchanged and `false` is returned, so the
    /// caller can discard them whole.
    #[must_use]
    pub fn shrink(resource: &mut Resource, target: Scalar) -> bool {
        match &mut resource.value {
            Value::Scalar(s) if *s <= target => true,
            Value::Scalar(s) if resource.disk != Some(crate::DiskKind::Mount) => {
                *s = target;
                target.is_positive()
            }
            _ => false,
        }
    }
}

impl From<Resource> for Resources {
    fn from(resource: Resource) -> Self {
        let mut result = Resources::new();
        Resources::add(&mut result, resource);
        result
    }
}

impl FromIterator<Resource> for Resources {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        let mut result = Resources::new();
        for r in iter {
            Resources::add(&mut result, r);
        }
        result
    }
}

impl IntoIterator for Resources {
    type Item = Resource;
    type IntoIter = std::vec::IntoIter<Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Resources {
    type Item = &'a Resource;
    type IntoIter = std::slice::Iter<'a, Resource>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl AddAssign<Resource> for Resources {
    fn add_assign(&mut self, rhs: Resource) {
        self.add(rhs);
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, rhs: &Resources) {
        for r in rhs.iter() {
            self.add(r.clone());
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        for r in rhs.0 {
            self.add(r);
        }
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, rhs: Resources) -> Resources {
        self += rhs;
        self
    }
}

impl SubAssign<&Resources> for Resources {
    fn sub_assign(&mut self, rhs: &Resources) {
        for r in rhs.iter() {
            self.subtract_item(r);
        }
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, rhs: Resources) {
        *self -= &rhs;
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(mut self, rhs: Resources) -> Resources {
        self -= &rhs;
        self
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Resources {
        iter.fold(Resources::new(), |acc, r| acc + r)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        let parts: Vec<String> = self.0.iter().map(Resource::to_string).collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl FromStr for Resources {
    type Err = ResourceError;

    /// Parses `"cpus:10;mem:1024;ports:[31000-32000]"` into unreserved,
    /// non-revocable resources.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = Resources::new();
        for part in s.split(';').filter(|p| !p.trim().is_empty()) {
            Resources::add(&mut result, parse_item(part)?);
        }
        Ok(result)
    }
}
