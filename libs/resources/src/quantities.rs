//! Scalar values and per-name quantity maps.
//!
//! Quantities are the currency of quota accounting: a flattened view of
//! resources keyed only by name, with exact fixed-point arithmetic.

use std::collections::{btree_map, BTreeMap};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use crate::ResourceError;

/// A fixed-point scalar with millesimal precision.
///
/// Stored as integer thousandths so that arithmetic is exact and equality
/// is structural. This matches the precision resource descriptions are
/// written with (`cpus:0.5`, `mem:1024`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scalar(i64);

impl Scalar {
    pub const ZERO: Scalar = Scalar(0);

    /// Creates a scalar from integer thousandths.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Creates a scalar from whole units.
    #[must_use]
    pub const fn from_units(units: i64) -> Self {
        Self(units * 1000)
    }

    /// Returns the underlying thousandths.
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns the value as a float, for display and export only.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Rounds a float to the nearest representable scalar.
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self((value * 1000.0).round() as i64)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Subtraction clamped at zero.
    #[must_use]
    pub fn saturating_sub(self, rhs: Scalar) -> Scalar {
        Scalar((self.0 - rhs.0).max(0))
    }

    #[must_use]
    pub fn min(self, rhs: Scalar) -> Scalar {
        Scalar(self.0.min(rhs.0))
    }
}

impl Add for Scalar {
    type Output = Scalar;

    fn add(self, rhs: Scalar) -> Scalar {
        Scalar(self.0 + rhs.0)
    }
}

impl AddAssign for Scalar {
    fn add_assign(&mut self, rhs: Scalar) {
        self.0 += rhs.0;
    }
}

impl Sub for Scalar {
    type Output = Scalar;

    fn sub(self, rhs: Scalar) -> Scalar {
        Scalar(self.0 - rhs.0)
    }
}

impl SubAssign for Scalar {
    fn sub_assign(&mut self, rhs: Scalar) {
        self.0 -= rhs.0;
    }
}

impl Sum for Scalar {
    fn sum<I: Iterator<Item = Scalar>>(iter: I) -> Scalar {
        iter.fold(Scalar::ZERO, |acc, s| acc + s)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            let mut s = format!("{:.3}", self.as_f64());
            while s.ends_with('0') {
                s.pop();
            }
            write!(f, "{s}")
        }
    }
}

impl FromStr for Scalar {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<f64>()
            .map(Scalar::from_f64)
            .map_err(|_| ResourceError::InvalidSyntax(format!("bad scalar '{s}'")))
    }
}

impl serde::Serialize for Scalar {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> serde::Deserialize<'de> for Scalar {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Ok(Scalar::from_f64(value))
    }
}

/// A map from resource name to a positive scalar quantity.
///
/// A name whose quantity would be zero is absent; the empty map is the
/// additive identity. Subtraction saturates per key and never goes below
/// zero, matching quota-headroom arithmetic.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ResourceQuantities(BTreeMap<String, Scalar>);

impl ResourceQuantities {
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

    /// Returns the quantity for `name`, zero when absent.
    #[must_use]
    pub fn get(&self, name: &str) -> Scalar {
        self.0.get(name).copied().unwrap_or(Scalar::ZERO)
    }

    /// Adds `quantity` under `name`; non-positive additions are dropped.
    pub fn add(&mut self, name: &str, quantity: Scalar) {
        if !quantity.is_positive() {
            return;
        }
        *self.0.entry(name.to_string()).or_insert(Scalar::ZERO) += quantity;
    }

    /// True when every quantity in `other` is covered by this map.
    #[must_use]
    pub fn contains(&self, other: &ResourceQuantities) -> bool {
        other.0.iter().all(|(name, qty)| self.get(name) >= *qty)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Scalar> {
        self.0.iter()
    }

    /// Names with positive quantity.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl FromIterator<(String, Scalar)> for ResourceQuantities {
    fn from_iter<I: IntoIterator<Item = (String, Scalar)>>(iter: I) -> Self {
        let mut quantities = ResourceQuantities::new();
        for (name, qty) in iter {
            ResourceQuantities::add(&mut quantities, &name, qty);
        }
        quantities
    }
}

impl AddAssign<&ResourceQuantities> for ResourceQuantities {
    fn add_assign(&mut self, rhs: &ResourceQuantities) {
        for (name, qty) in rhs.iter() {
            self.add(name, *qty);
        }
    }
}

impl AddAssign for ResourceQuantities {
    fn add_assign(&mut self, rhs: ResourceQuantities) {
        *self += &rhs;
    }
}

impl Add for ResourceQuantities {
    type Output = ResourceQuantities;

    fn add(mut self, rhs: ResourceQuantities) -> ResourceQuantities {
        self += &rhs;
        self
    }
}

impl SubAssign<&ResourceQuantities> for ResourceQuantities {
    /// Saturating per-key subtraction; keys that reach zero are removed.
    fn sub_assign(&mut self, rhs: &ResourceQuantities) {
        for (name, qty) in rhs.iter() {
            if let Some(current) = self.0.get_mut(name) {
                *current = current.saturating_sub(*qty);
                if current.is_zero() {
                    self.0.remove(name);
                }
            }
        }
    }
}

impl SubAssign for ResourceQuantities {
    fn sub_assign(&mut self, rhs: ResourceQuantities) {
        *self -= &rhs;
    }
}

impl Sub for ResourceQuantities {
    type Output = ResourceQuantities;

    fn sub(mut self, rhs: ResourceQuantities) -> ResourceQuantities {
        self -= &rhs;
        self
    }
}

impl fmt::Display for ResourceQuantities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(name, qty)| format!("{name}:{qty}"))
            .collect();
        write!(f, "{}", parts.join(";"))
    }
}

impl FromStr for ResourceQuantities {
    type Err = ResourceError;

    /// Parses `"cpus:4;mem:512"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut quantities = ResourceQuantities::new();
        for part in s.split(';').filter(|p| !p.trim().is_empty()) {
            let (name, value) = part
                .split_once(':')
                .ok_or_else(|| ResourceError::InvalidSyntax(part.to_string()))?;
            let scalar: Scalar = value.parse()?;
            if scalar.as_millis() < 0 {
                return Err(ResourceError::InvalidSyntax(format!(
                    "negative quantity in '{part}'"
                )));
            }
            ResourceQuantities::add(&mut quantities, name.trim(), scalar);
        }
        Ok(quantities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_arithmetic_is_exact() {
        let a = Scalar::from_f64(0.1);
        let b = Scalar::from_f64(0.2);
        assert_eq!(a + b, Scalar::from_f64(0.3));
        assert_eq!((a + b).to_string(), "0.3");
    }

    #[test]
    fn test_scalar_display_trims() {
        assert_eq!(Scalar::from_units(4).to_string(), "4");
        assert_eq!(Scalar::from_millis(1500).to_string(), "1.5");
        assert_eq!(Scalar::from_millis(1250).to_string(), "1.25");
    }

    #[test]
    fn test_scalar_saturating_sub() {
        let a = Scalar::from_units(1);
        let b = Scalar::from_units(3);
        assert_eq!(a.saturating_sub(b), Scalar::ZERO);
        assert_eq!(b.saturating_sub(a), Scalar::from_units(2));
    }

    #[test]
    fn test_quantities_parse_and_display() {
        let q: ResourceQuantities = "cpus:4;mem:512".parse().unwrap();
        assert_eq!(q.get("cpus"), Scalar::from_units(4));
        assert_eq!(q.get("mem"), Scalar::from_units(512));
        assert_eq!(q.get("disk"), Scalar::ZERO);
        assert_eq!(q.to_string(), "cpus:4;mem:512");
    }

    #[test]
    fn test_quantities_zero_is_absent() {
        let q: ResourceQuantities = "cpus:0;mem:512".parse().unwrap();
        assert_eq!(q.len(), 1);
        assert!(!q.names().any(|n| n == "cpus"));
    }

    #[test]
    fn test_quantities_saturating_subtraction() {
        let a: ResourceQuantities = "cpus:4;mem:512".parse().unwrap();
        let b: ResourceQuantities = "cpus:10;disk:100".parse().unwrap();
        let diff = a - b;
        assert_eq!(diff, "mem:512".parse().unwrap());
    }

    #[test]
    fn test_quantities_contains() {
        let big: ResourceQuantities = "cpus:4;mem:512".parse().unwrap();
        let small: ResourceQuantities = "cpus:2".parse().unwrap();
        assert!(big.contains(&small));
        assert!(!small.contains(&big));
        assert!(big.contains(&ResourceQuantities::new()));
    }

    #[test]
    fn test_quantities_addition_merges() {
        let a: ResourceQuantities = "cpus:1".parse().unwrap();
        let b: ResourceQuantities = "cpus:2;mem:10".parse().unwrap();
        assert_eq!(a + b, "cpus:3;mem:10".parse().unwrap());
    }

    #[test]
    fn test_quantities_negative_rejected() {
        assert!("cpus:-1".parse::<ResourceQuantities>().is_err());
    }

    #[test]
    fn test_scalar_json_roundtrip() {
        let q: ResourceQuantities = "cpus:1.5;mem:512".parse().unwrap();
        let json = serde_json::to_string(&q).unwrap();
        let parsed: ResourceQuantities = serde_json::from_str(&json).unwrap();
        assert_eq!(q, parsed);
    }
}
