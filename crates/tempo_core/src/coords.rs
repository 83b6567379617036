use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A named axis of time, e.g. `validity` or `system_period`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dimension(String);

impl Dimension {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dimension {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Dimension {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One instant per dimension. Used both as a query constraint and as a record tag.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeCoords(BTreeMap<Dimension, Timestamp>);

impl TimeCoords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(dimension: impl Into<Dimension>, at: Timestamp) -> Self {
        Self::new().with(dimension, at)
    }

    pub fn with(mut self, dimension: impl Into<Dimension>, at: Timestamp) -> Self {
        self.0.insert(dimension.into(), at);
        self
    }

    pub fn get(&self, dimension: &Dimension) -> Option<Timestamp> {
        self.0.get(dimension).copied()
    }

    pub fn contains(&self, dimension: &Dimension) -> bool {
        self.0.contains_key(dimension)
    }

    pub fn insert(&mut self, dimension: Dimension, at: Timestamp) -> Option<Timestamp> {
        self.0.insert(dimension, at)
    }

    pub fn remove(&mut self, dimension: &Dimension) -> Option<Timestamp> {
        self.0.remove(dimension)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Dimension, Timestamp> {
        self.0.iter()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.0.keys()
    }

    /// Per-dimension merge; values from `other` win.
    pub fn merge(&mut self, other: &TimeCoords) {
        for (dimension, at) in other.iter() {
            self.0.insert(dimension.clone(), *at);
        }
    }

    pub fn merged(&self, other: &TimeCoords) -> TimeCoords {
        let mut merged = self.clone();
        merged.merge(other);
        merged
    }

    pub fn restrict(&self, dimensions: &[Dimension]) -> TimeCoords {
        self.0
            .iter()
            .filter(|(dimension, _)| dimensions.contains(dimension))
            .map(|(dimension, at)| (dimension.clone(), *at))
            .collect()
    }
}

impl FromIterator<(Dimension, Timestamp)> for TimeCoords {
    fn from_iter<I: IntoIterator<Item = (Dimension, Timestamp)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TimeCoords {
    type Item = (&'a Dimension, &'a Timestamp);
    type IntoIter = btree_map::Iter<'a, Dimension, Timestamp>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Either a bare instant or an explicit per-dimension map.
///
/// A bare instant means different things depending on where it is used: for
/// a query or record it targets the entity's default dimension, for the
/// global constraint it becomes the universal instant for every dimension.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsOf {
    At(Timestamp),
    Coords(TimeCoords),
}

impl From<Timestamp> for AsOf {
    fn from(value: Timestamp) -> Self {
        AsOf::At(value)
    }
}

impl From<TimeCoords> for AsOf {
    fn from(value: TimeCoords) -> Self {
        AsOf::Coords(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{Dimension, TimeCoords};
    use crate::Timestamp;

    #[test]
    fn merge_is_per_dimension() {
        let mut base = TimeCoords::single("a", Timestamp(1)).with("b", Timestamp(2));
        base.merge(&TimeCoords::single("a", Timestamp(10)));
        assert_eq!(base.get(&Dimension::new("a")), Some(Timestamp(10)));
        assert_eq!(base.get(&Dimension::new("b")), Some(Timestamp(2)));
    }

    #[test]
    fn restrict_keeps_requested_dimensions() {
        let coords = TimeCoords::single("a", Timestamp(1)).with("b", Timestamp(2));
        let restricted = coords.restrict(&[Dimension::new("b"), Dimension::new("c")]);
        assert_eq!(restricted, TimeCoords::single("b", Timestamp(2)));
    }

    #[test]
    fn serializes_as_plain_map() {
        let coords = TimeCoords::single("period", Timestamp(5));
        let encoded = serde_json::to_string(&coords).expect("encode");
        assert_eq!(encoded, r#"{"period":5}"#);
    }
}
