use std::sync::Arc;

use aideon_tempo_core::{AsOf, TempoResult, TimeCoords, Value};

use crate::model::EntityType;
use crate::predicate::{CompareOp, Predicate};
use crate::walker::IncludeTree;

/// A query against one entity type: filters, time constraints, the tag its
/// results will carry and the associations to load alongside them.
///
/// Builder methods consume and return the relation; `spawn` derives an
/// independent copy.
#[derive(Clone, Debug)]
pub struct Relation {
    entity: Arc<EntityType>,
    filters: Vec<Predicate>,
    time_constraints: TimeCoords,
    pending_tags: TimeCoords,
    ambient: bool,
    tags_results: bool,
    eager_loads: Vec<IncludeTree>,
    preloads: Vec<IncludeTree>,
    limit: Option<u64>,
}

impl Relation {
    pub fn new(entity: Arc<EntityType>) -> Self {
        Self {
            entity,
            filters: Vec::new(),
            time_constraints: TimeCoords::new(),
            pending_tags: TimeCoords::new(),
            ambient: true,
            tags_results: true,
            eager_loads: Vec::new(),
            preloads: Vec::new(),
            limit: None,
        }
    }

    pub fn spawn(&self) -> Self {
        self.clone()
    }

    pub fn entity(&self) -> &Arc<EntityType> {
        &self.entity
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn filter_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Predicate::eq(column, value))
    }

    pub fn filter_cmp(self, column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.filter(Predicate::compare(column, op, value))
    }

    pub fn filter_in(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter(Predicate::is_in(column, values))
    }

    /// Rows whose intervals contain the given instant(s); results are not
    /// tagged, not even by ambient global constraints.
    pub fn existed_at(mut self, as_of: impl Into<AsOf>) -> TempoResult<Self> {
        let coords = self.entity.resolve_as_of(&as_of.into())?;
        self.time_constraints.merge(&coords);
        self.tags_results = self.tags_results && !self.pending_tags.is_empty();
        Ok(self)
    }

    /// Like [`Relation::existed_at`], and every loaded record is tagged with the instant(s).
    pub fn as_of(mut self, as_of: impl Into<AsOf>) -> TempoResult<Self> {
        let coords = self.entity.resolve_as_of(&as_of.into())?;
        self.time_constraints.merge(&coords);
        self.pending_tags.merge(&coords);
        self.tags_results = true;
        Ok(self)
    }

    /// Adds constraints for the declared dimensions in `coords`, ignoring the rest.
    pub(crate) fn constrain(mut self, coords: &TimeCoords) -> Self {
        let coords = coords.restrict(self.entity.dimensions());
        self.time_constraints.merge(&coords);
        self
    }

    pub(crate) fn tag(mut self, coords: &TimeCoords) -> Self {
        let coords = coords.restrict(self.entity.dimensions());
        self.pending_tags.merge(&coords);
        self
    }

    /// Opts out of registry global constraints; used once coordinates are fully resolved.
    pub(crate) fn detached(mut self) -> Self {
        self.ambient = false;
        self
    }

    pub fn eager_load(mut self, tree: impl Into<IncludeTree>) -> Self {
        self.eager_loads.push(tree.into());
        self
    }

    pub fn preload(mut self, tree: impl Into<IncludeTree>) -> Self {
        self.preloads.push(tree.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filters(&self) -> &[Predicate] {
        &self.filters
    }

    pub fn time_constraints(&self) -> &TimeCoords {
        &self.time_constraints
    }

    pub fn pending_tags(&self) -> &TimeCoords {
        &self.pending_tags
    }

    pub fn is_ambient(&self) -> bool {
        self.ambient
    }

    /// False for relations narrowed only by `existed_at`.
    pub fn tags_results(&self) -> bool {
        self.tags_results
    }

    pub fn eager_loads(&self) -> &[IncludeTree] {
        &self.eager_loads
    }

    pub fn preloads(&self) -> &[IncludeTree] {
        &self.preloads
    }

    pub fn requested_loads(&self) -> impl Iterator<Item = &IncludeTree> {
        self.eager_loads.iter().chain(self.preloads.iter())
    }

    pub fn limit_value(&self) -> Option<u64> {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::Relation;
    use crate::model::Model;
    use aideon_tempo_core::{AsOf, EntityDef, TempoError, TimeCoords, Timestamp};

    fn relation() -> Relation {
        let model = Model::builder()
            .entity(
                EntityDef::new("author", "authors")
                    .dimension("validity")
                    .dimension("system_period"),
            )
            .build()
            .expect("model");
        Relation::new(model.entity("author").expect("author"))
    }

    #[test]
    fn existed_at_constrains_without_tagging() {
        let relation = relation().existed_at(Timestamp(3)).expect("existed_at");
        assert_eq!(
            relation.time_constraints(),
            &TimeCoords::single("validity", Timestamp(3))
        );
        assert!(relation.pending_tags().is_empty());
        assert!(!relation.tags_results());
        assert!(self::relation().tags_results());
    }

    #[test]
    fn as_of_constrains_and_tags() {
        let coords = TimeCoords::single("validity", Timestamp(3)).with("system_period", Timestamp(4));
        let relation = relation().as_of(coords.clone()).expect("as_of");
        assert_eq!(relation.time_constraints(), &coords);
        assert_eq!(relation.pending_tags(), &coords);
    }

    #[test]
    fn as_of_rejects_undeclared_dimension() {
        let err = relation()
            .as_of(AsOf::Coords(TimeCoords::single("bogus", Timestamp(1))))
            .expect_err("unknown dimension");
        assert!(matches!(err, TempoError::UnknownDimension { .. }));
    }

    #[test]
    fn spawn_is_independent() {
        let base = relation();
        let derived = base.spawn().filter_eq("name", "ada").eager_load("books");
        assert!(base.filters().is_empty());
        assert_eq!(derived.filters().len(), 1);
        assert_eq!(derived.requested_loads().count(), 1);
    }

    #[test]
    fn constrain_ignores_undeclared_dimensions() {
        let relation = relation()
            .constrain(&TimeCoords::single("other", Timestamp(1)).with("validity", Timestamp(2)))
            .detached();
        assert_eq!(
            relation.time_constraints(),
            &TimeCoords::single("validity", Timestamp(2))
        );
        assert!(!relation.is_ambient());
    }
}
