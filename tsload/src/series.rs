//! Series identity.
//!
//! A series is one metric kind crossed with one value from every configured
//! dimension. The full set of series for a run is the cross-product of all of
//! them, enumerated once at startup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::point::Tags;

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// A categorical dimension of the simulated fleet.
///
/// Exactly one of `values` or `count` is given. A `count` of `n` expands to
/// `<prefix>00000` through `<prefix>{n-1:05}`, with `prefix` defaulting to the
/// dimension name.
pub struct Dimension {
    /// The tag key this dimension populates
    pub name: String,
    /// Explicit tag values
    #[serde(default)]
    pub values: Vec<String>,
    /// Number of generated tag values
    #[serde(default)]
    pub count: Option<u32>,
    /// Prefix of generated tag values
    #[serde(default)]
    pub prefix: Option<String>,
}

impl Dimension {
    /// A dimension with explicit values.
    #[must_use]
    pub fn listed(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            values: values.iter().map(ToString::to_string).collect(),
            count: None,
            prefix: None,
        }
    }

    /// A dimension of `count` generated values.
    #[must_use]
    pub fn counted(name: &str, count: u32) -> Self {
        Self {
            name: name.to_string(),
            values: Vec::new(),
            count: Some(count),
            prefix: None,
        }
    }

    /// The tag values of this dimension.
    #[must_use]
    pub fn expand(&self) -> Vec<String> {
        match self.count {
            Some(count) => {
                let prefix = self.prefix.as_deref().unwrap_or(&self.name);
                (0..count).map(|i| format!("{prefix}{i:05}")).collect()
            }
            None => self.values.clone(),
        }
    }

    /// Number of tag values without expanding them.
    #[must_use]
    pub fn cardinality(&self) -> usize {
        match self.count {
            Some(count) => count as usize,
            None => self.values.len(),
        }
    }
}

/// The dimensions of the default stress fleet: 9 countries, 4 regions, 3
/// data centers and 400 servers per data center.
#[must_use]
pub fn default_dimensions() -> Vec<Dimension> {
    vec![
        Dimension::listed(
            "country",
            &["DEU", "GBR", "FRA", "SWE", "SWZ", "JPN", "USA", "CAN", "MEX"],
        ),
        Dimension::listed("region", &["nwest", "neast", "seast", "swest"]),
        Dimension::listed(
            "data_center",
            &["data_center_001", "data_center_002", "data_center_003"],
        ),
        Dimension::counted("server", 400),
    ]
}

/// Identity of one logical series. Immutable for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// The metric kind, also the measurement name of the series' points.
    pub kind: Arc<str>,
    /// Tag key to value, one entry per dimension.
    pub tags: Arc<Tags>,
}

/// Number of series `enumerate` would produce, without producing them.
#[must_use]
pub fn count(kinds: usize, dimensions: &[Dimension]) -> usize {
    dimensions
        .iter()
        .fold(kinds, |acc, d| acc.saturating_mul(d.cardinality()))
}

/// Enumerate the full cross-product of `kinds` and `dimensions`.
///
/// Given distinct kinds, distinct dimension names and distinct values within
/// each dimension every produced key is unique. Any empty input yields no
/// series. With no dimensions at all each kind is a single untagged series.
#[must_use]
pub fn enumerate(kinds: &[Arc<str>], dimensions: &[Dimension]) -> Vec<SeriesKey> {
    let mut tag_sets: Vec<Tags> = vec![Tags::new()];
    for dimension in dimensions {
        let values = dimension.expand();
        let mut next = Vec::with_capacity(tag_sets.len() * values.len());
        for tags in &tag_sets {
            for value in &values {
                let mut t = tags.clone();
                t.insert(dimension.name.clone(), value.clone());
                next.push(t);
            }
        }
        tag_sets = next;
    }

    let tag_sets: Vec<Arc<Tags>> = tag_sets.into_iter().map(Arc::new).collect();
    let mut keys = Vec::with_capacity(kinds.len() * tag_sets.len());
    for kind in kinds {
        for tags in &tag_sets {
            keys.push(SeriesKey {
                kind: Arc::clone(kind),
                tags: Arc::clone(tags),
            });
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rustc_hash::FxHashSet;

    use super::*;

    fn kinds(n: usize) -> Vec<Arc<str>> {
        (0..n).map(|i| Arc::from(format!("kind{i}"))).collect()
    }

    #[test]
    fn counted_dimension_expands_with_padding() {
        let d = Dimension::counted("server", 3);
        assert_eq!(d.expand(), vec!["server00000", "server00001", "server00002"]);

        let mut d = Dimension::counted("server", 1);
        d.prefix = Some("host-".to_string());
        assert_eq!(d.expand(), vec!["host-00000"]);
    }

    #[test]
    fn default_fleet_size() {
        let dims = default_dimensions();
        assert_eq!(count(6, &dims), 6 * 9 * 4 * 3 * 400);
    }

    #[test]
    fn empty_dimension_yields_no_series() {
        let dims = vec![
            Dimension::listed("country", &["DEU"]),
            Dimension::listed("region", &[]),
        ];
        assert!(enumerate(&kinds(3), &dims).is_empty());
        assert_eq!(count(3, &dims), 0);
    }

    #[test]
    fn tags_cover_every_dimension() {
        let dims = vec![
            Dimension::listed("country", &["DEU", "GBR"]),
            Dimension::counted("server", 2),
        ];
        let keys = enumerate(&kinds(1), &dims);
        assert_eq!(keys.len(), 4);
        for key in &keys {
            assert_eq!(
                key.tags.keys().map(String::as_str).collect::<Vec<_>>(),
                vec!["country", "server"]
            );
        }
    }

    proptest! {
        #[test]
        fn series_count_is_product_of_cardinalities(
            k in 0..4usize, a in 0..5u32, b in 0..5u32, c in 0..4u32, d in 0..6u32
        ) {
            let dims = vec![
                Dimension::counted("a", a),
                Dimension::counted("b", b),
                Dimension::counted("c", c),
                Dimension::counted("d", d),
            ];
            let keys = enumerate(&kinds(k), &dims);
            let expected = k * (a * b * c * d) as usize;
            prop_assert_eq!(keys.len(), expected);
            prop_assert_eq!(count(k, &dims), expected);

            let unique: FxHashSet<&SeriesKey> = keys.iter().collect();
            prop_assert_eq!(unique.len(), expected);
        }

        #[test]
        fn enumeration_is_idempotent(k in 1..4usize, a in 1..4u32, b in 1..4u32) {
            let dims = vec![
                Dimension::counted("a", a),
                Dimension::listed("b", &["x", "y", "z"][..b as usize]),
            ];
            let first: FxHashSet<SeriesKey> = enumerate(&kinds(k), &dims).into_iter().collect();
            let second: FxHashSet<SeriesKey> = enumerate(&kinds(k), &dims).into_iter().collect();
            prop_assert_eq!(first, second);
        }
    }
}
