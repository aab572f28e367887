//! Partitioning of a region's areas into assignment units.

use std::collections::BTreeSet;

use areaplane_id::AreaId;

use crate::model::{Area, AreaRef, Position};

/// A non-empty set of areas served by one server, ordered by area index.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaGroup {
    areas: Vec<Area>,
}

impl AreaGroup {
    fn new(mut areas: Vec<Area>) -> Option<Self> {
        if areas.is_empty() {
            return None;
        }
        areas.sort_by_key(|a| (a.index, a.id));
        Some(Self { areas })
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    /// The area a server is looked up by.
    pub fn first(&self) -> &Area {
        // non-empty by construction
        &self.areas[0]
    }

    pub fn area_refs(&self) -> Vec<AreaRef> {
        self.areas.iter().map(Area::area_ref).collect()
    }

    pub fn area_ids(&self) -> BTreeSet<AreaId> {
        self.areas.iter().map(|a| a.id).collect()
    }

    pub fn position(&self) -> Option<Position> {
        Position::mean(self.areas.iter().map(|a| &a.position))
    }
}

/// Decides which areas share a server.
///
/// Every area gets its own group for now; packing quiet neighbouring areas
/// onto one server would only change this type.
#[derive(Debug, Default, Clone, Copy)]
pub struct AreaGroupingService;

impl AreaGroupingService {
    pub fn new() -> Self {
        Self
    }

    /// Groups ordered by their lowest area index. The same input always
    /// yields the same groups in the same order.
    pub fn group_areas(&self, areas: &[Area]) -> Vec<AreaGroup> {
        let mut groups: Vec<AreaGroup> = areas
            .iter()
            .filter_map(|area| AreaGroup::new(vec![area.clone()]))
            .collect();
        groups.sort_by_key(|g| (g.first().index, g.first().id));
        groups
    }
}
