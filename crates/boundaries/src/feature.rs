use std::collections::BTreeMap;

use foundation::math::LonLat;

/// Stable identifier of one boundary feature within a single dataset load.
///
/// Ids are assigned sequentially from 1 in dataset order, so they double as
/// the seed for exclusive color assignment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureId(u32);

impl FeatureId {
    pub fn new(n: u32) -> Self {
        debug_assert!(n >= 1, "feature ids start at 1");
        FeatureId(n)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// One polygon: outer ring first, holes after (GeoJSON ring convention).
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonRings {
    pub rings: Vec<Vec<LonLat>>,
}

/// One vector boundary region (typically a country) from the input dataset.
///
/// Immutable for one pipeline run; the whole set is discarded and recreated
/// whenever raster dimensions or spacing change.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFeature {
    pub id: FeatureId,
    pub name: String,
    /// Two-letter ISO code; empty when unresolvable (the feature still
    /// classifies by id, it is just not code-addressable).
    pub iso2: String,
    pub polygons: Vec<PolygonRings>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    pub features: Vec<BoundaryFeature>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn table(&self) -> FeatureTable {
        let mut entries = BTreeMap::new();
        for f in &self.features {
            entries.insert(
                f.id,
                FeatureInfo {
                    name: f.name.clone(),
                    iso2: f.iso2.clone(),
                },
            );
        }
        FeatureTable { entries }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureInfo {
    pub name: String,
    pub iso2: String,
}

/// Id → name/code lookup retained after the raster surface is dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    entries: BTreeMap<FeatureId, FeatureInfo>,
}

impl FeatureTable {
    pub fn get(&self, id: FeatureId) -> Option<&FeatureInfo> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureId, &FeatureInfo)> {
        self.entries.iter().map(|(id, info)| (*id, info))
    }
}

#[cfg(test)]
mod tests {
    use super::{BoundaryFeature, FeatureId, FeatureSet};

    fn feature(id: u32, name: &str, iso2: &str) -> BoundaryFeature {
        BoundaryFeature {
            id: FeatureId::new(id),
            name: name.to_string(),
            iso2: iso2.to_string(),
            polygons: Vec::new(),
        }
    }

    #[test]
    fn table_resolves_name_and_code_by_id() {
        let set = FeatureSet {
            features: vec![feature(1, "South Korea", "KR"), feature(2, "Somaliland", "")],
        };
        let table = set.table();
        assert_eq!(table.len(), 2);

        let info = table.get(FeatureId::new(1)).expect("entry");
        assert_eq!(info.name, "South Korea");
        assert_eq!(info.iso2, "KR");

        let info = table.get(FeatureId::new(2)).expect("entry");
        assert_eq!(info.iso2, "");
    }
}
