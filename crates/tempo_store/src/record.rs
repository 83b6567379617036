//! Loaded records and their transient time tags.
//!
//! A tag records which instant(s) a record was resolved at. It is restricted
//! to the dimensions the record's entity declares and is never written back
//! to storage.

use std::collections::BTreeMap;
use std::sync::Arc;

use aideon_tempo_core::{
    AsOf, Dimension, Interval, TempoError, TempoResult, TimeCoords, Timestamp, Value,
};

use crate::backend::Row;
use crate::model::EntityType;

#[derive(Clone, Debug)]
pub struct Record {
    entity: Arc<EntityType>,
    row: Row,
    tag: TimeCoords,
    loaded: BTreeMap<String, Loaded>,
}

/// Targets already loaded for one association of a record.
#[derive(Clone, Debug)]
pub enum Loaded {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Loaded {
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        let (one, many) = match self {
            Loaded::One(record) => (record.as_deref(), &[][..]),
            Loaded::Many(records) => (None, records.as_slice()),
        };
        one.into_iter().chain(many.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        let (one, many): (Option<&mut Record>, &mut [Record]) = match self {
            Loaded::One(record) => (record.as_deref_mut(), &mut []),
            Loaded::Many(records) => (None, records.as_mut_slice()),
        };
        one.into_iter().chain(many.iter_mut())
    }

    pub fn one(&self) -> Option<&Record> {
        match self {
            Loaded::One(record) => record.as_deref(),
            Loaded::Many(_) => None,
        }
    }

    pub fn many(&self) -> &[Record] {
        match self {
            Loaded::One(_) => &[],
            Loaded::Many(records) => records,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn into_records(self) -> Vec<Record> {
        match self {
            Loaded::One(record) => record.map(|record| *record).into_iter().collect(),
            Loaded::Many(records) => records,
        }
    }
}

impl Record {
    /// An untagged record.
    pub fn new(entity: Arc<EntityType>, row: Row) -> Self {
        Self {
            entity,
            row,
            tag: TimeCoords::new(),
            loaded: BTreeMap::new(),
        }
    }

    /// A freshly loaded record carrying the relation's pending tag.
    pub fn materialize(entity: Arc<EntityType>, row: Row, tags: &TimeCoords) -> Self {
        let mut record = Self::new(entity, row);
        record.stamp_tag(tags);
        record
    }

    pub fn entity(&self) -> &Arc<EntityType> {
        &self.entity
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn into_row(self) -> Row {
        self.row
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.row.get(column)
    }

    pub fn id(&self) -> Option<&Value> {
        self.row.get(self.entity.primary_key())
    }

    pub fn period(&self, dimension: &Dimension) -> Option<&Interval> {
        self.row.period(dimension)
    }

    pub fn time_tag(&self) -> &TimeCoords {
        &self.tag
    }

    pub fn time_tag_for(&self, dimension: &Dimension) -> Option<Timestamp> {
        self.tag.get(dimension)
    }

    /// The tag restricted to `dimensions`, each of which the entity must declare.
    pub fn time_tags_for(&self, dimensions: &[Dimension]) -> TempoResult<TimeCoords> {
        if let Some(dimension) = dimensions
            .iter()
            .find(|dimension| !self.entity.def().declares(dimension))
        {
            return Err(TempoError::unknown_dimension(
                self.entity.name(),
                dimension.clone(),
            ));
        }
        Ok(self.tag.restrict(dimensions))
    }

    /// Like `time_tags_for`, silently skipping undeclared dimensions.
    pub(crate) fn tags_restricted_to(&self, dimensions: &[Dimension]) -> TimeCoords {
        self.tag.restrict(dimensions)
    }

    pub fn is_tagged(&self) -> bool {
        !self.tag.is_empty()
    }

    /// Overwrites the tag for every declared dimension present in `tags`.
    pub fn stamp_tag(&mut self, tags: &TimeCoords) {
        self.tag.merge(&tags.restrict(self.entity.dimensions()));
    }

    /// Tags only the declared dimensions that carry no tag yet.
    pub fn fill_tag(&mut self, tags: &TimeCoords) {
        for (dimension, at) in &tags.restrict(self.entity.dimensions()) {
            if !self.tag.contains(dimension) {
                self.tag.insert(dimension.clone(), *at);
            }
        }
    }

    pub fn clear_tag(&mut self) {
        self.tag = TimeCoords::new();
    }

    pub fn loaded_association(&self, name: &str) -> Option<&Loaded> {
        self.loaded.get(name)
    }

    pub fn loaded_mut(&mut self, name: &str) -> Option<&mut Loaded> {
        self.loaded.get_mut(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    pub fn set_loaded(&mut self, name: impl Into<String>, loaded: Loaded) {
        self.loaded.insert(name.into(), loaded);
    }

    pub fn clear_loaded(&mut self) {
        self.loaded.clear();
    }

    /// Re-tags this record in place.
    ///
    /// Every resolved instant must fall inside the record's own interval for
    /// that dimension; a dimension the row carries no interval for accepts
    /// any instant. Loaded associations are discarded since they were
    /// resolved against the previous tag.
    pub fn as_of_mut(&mut self, as_of: impl Into<AsOf>) -> TempoResult<()> {
        let coords = self.entity.resolve_as_of(&as_of.into())?;
        for (dimension, at) in &coords {
            if let Some(interval) = self.row.period(dimension)
                && !interval.contains(*at)
            {
                return Err(TempoError::out_of_range(
                    self.entity.name(),
                    dimension.clone(),
                    *at,
                ));
            }
        }
        self.clear_loaded();
        self.stamp_tag(&coords);
        Ok(())
    }

    /// Replaces the row with a freshly read version, dropping tag and loaded state.
    pub(crate) fn refresh(&mut self, row: Row) {
        self.row = row;
        self.clear_tag();
        self.clear_loaded();
    }
}
