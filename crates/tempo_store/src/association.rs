//! Association scopes and their as-of wrapping.
//!
//! A declared association carries an optional base scope, either static or
//! parametric in the owning record. Associations declared temporal wrap that
//! scope so that, when traversed, the target query is narrowed to the owner's
//! tag (or the registry defaults) and the results are tagged accordingly.

use std::fmt;
use std::sync::Arc;

use aideon_tempo_core::{AssociationDef, AssociationKind, Dimension, TempoError, TempoResult, TimeCoords};

use crate::config::PreloadPolicy;
use crate::model::EntityType;
use crate::record::Record;
use crate::registry::ScopeRegistry;
use crate::relation::Relation;

pub type StaticScope = dyn Fn(Relation) -> Relation + Send + Sync;
pub type ParametricScope = dyn Fn(Relation, &Record) -> Relation + Send + Sync;

/// Narrowing applied to an association's target query.
#[derive(Clone)]
pub enum ScopeFn {
    Static(Arc<StaticScope>),
    /// Needs the owning record; cannot be evaluated once for a batch of owners.
    Parametric(Arc<ParametricScope>),
}

impl ScopeFn {
    pub fn fixed(scope: impl Fn(Relation) -> Relation + Send + Sync + 'static) -> Self {
        ScopeFn::Static(Arc::new(scope))
    }

    pub fn per_owner(scope: impl Fn(Relation, &Record) -> Relation + Send + Sync + 'static) -> Self {
        ScopeFn::Parametric(Arc::new(scope))
    }

    pub fn is_instance_dependent(&self) -> bool {
        matches!(self, ScopeFn::Parametric(_))
    }

    /// `None` when a parametric scope is applied without an owner.
    pub fn apply(&self, relation: Relation, owner: Option<&Record>) -> Option<Relation> {
        match self {
            ScopeFn::Static(scope) => Some(scope(relation)),
            ScopeFn::Parametric(scope) => owner.map(|owner| scope(relation, owner)),
        }
    }
}

impl fmt::Debug for ScopeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeFn::Static(_) => f.write_str("ScopeFn::Static"),
            ScopeFn::Parametric(_) => f.write_str("ScopeFn::Parametric"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum AssociationScope {
    Plain(Option<ScopeFn>),
    Temporal(TemporalScope),
}

impl AssociationScope {
    pub fn base(&self) -> Option<&ScopeFn> {
        match self {
            AssociationScope::Plain(base) => base.as_ref(),
            AssociationScope::Temporal(temporal) => temporal.base.as_ref(),
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, AssociationScope::Temporal(_))
    }
}

#[derive(Clone, Debug)]
pub struct TemporalScope {
    base: Option<ScopeFn>,
    dimensions: Vec<Dimension>,
}

impl TemporalScope {
    pub fn new(base: Option<ScopeFn>, dimensions: Vec<Dimension>) -> Self {
        Self { base, dimensions }
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// The owner's tag pins its children; registry defaults fill the other
    /// constraint dimensions.
    ///
    /// The tag comes from the owner alone when there is one, so an untagged
    /// (current) owner yields untagged children. Registry association tags
    /// only apply to detached traversal.
    pub fn resolve(&self, owner: ScopeOwner<'_>, registry: &ScopeRegistry) -> TimeOverride {
        let owner_tags = owner.tags_for(&self.dimensions);
        let mut constraints = registry.association_constraints_for(&self.dimensions);
        constraints.merge(&owner_tags);
        let tags = match owner {
            ScopeOwner::Detached => registry.association_tags_for(&self.dimensions),
            ScopeOwner::Record(_) | ScopeOwner::Batch(_) => owner_tags,
        };
        TimeOverride { constraints, tags }
    }
}

/// Coordinates to narrow by and the tag to stamp, applied together.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeOverride {
    pub constraints: TimeCoords,
    pub tags: TimeCoords,
}

impl TimeOverride {
    /// An explicit as-of map both constrains and tags.
    pub fn explicit(coords: TimeCoords) -> Self {
        Self {
            constraints: coords.clone(),
            tags: coords,
        }
    }
}

/// What an association query is being resolved for.
#[derive(Clone, Copy, Debug)]
pub enum ScopeOwner<'a> {
    /// Top-level use with no owning record.
    Detached,
    Record(&'a Record),
    /// A batch of owners sharing one tag, as during eager loading.
    Batch(&'a TimeCoords),
}

impl<'a> ScopeOwner<'a> {
    pub fn record(&self) -> Option<&'a Record> {
        match self {
            ScopeOwner::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn tags_for(&self, dimensions: &[Dimension]) -> TimeCoords {
        match self {
            ScopeOwner::Detached => TimeCoords::new(),
            ScopeOwner::Record(record) => record.tags_restricted_to(dimensions),
            ScopeOwner::Batch(tags) => tags.restrict(dimensions),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStrategy {
    /// One query per association level for the whole batch.
    Eager,
    /// Batched where possible, per owner where the scope requires it.
    Preload,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    Single,
    PerOwner,
}

#[derive(Clone, Debug)]
pub struct Association {
    owner: String,
    def: AssociationDef,
    scope: AssociationScope,
    instance_dependent: bool,
}

impl Association {
    pub(crate) fn new(
        owner: String,
        def: AssociationDef,
        scope: AssociationScope,
        instance_dependent: bool,
    ) -> Self {
        Self {
            owner,
            def,
            scope,
            instance_dependent,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn target(&self) -> &str {
        &self.def.target
    }

    pub fn kind(&self) -> &AssociationKind {
        &self.def.kind
    }

    pub fn def(&self) -> &AssociationDef {
        &self.def
    }

    pub fn scope(&self) -> &AssociationScope {
        &self.scope
    }

    pub fn is_temporal(&self) -> bool {
        self.scope.is_temporal()
    }

    /// True when this association, or any hop it is composed of, has a parametric scope.
    pub fn is_instance_dependent(&self) -> bool {
        self.instance_dependent
    }

    /// Decides how a batch of owners is loaded, failing before any query runs
    /// when a single batch query cannot be valid for every owner.
    pub fn batch_mode(&self, strategy: LoadStrategy, policy: PreloadPolicy) -> TempoResult<BatchMode> {
        if !self.instance_dependent {
            return Ok(BatchMode::Single);
        }
        match (strategy, policy) {
            (LoadStrategy::Preload, PreloadPolicy::PerOwner) => Ok(BatchMode::PerOwner),
            _ => Err(TempoError::eager_load_unsupported(
                self.owner.clone(),
                self.def.name.clone(),
            )),
        }
    }

    /// Builds the target query for one traversal.
    ///
    /// Applies the base scope, then for temporal associations narrows by the
    /// resolved coordinates and records the resolved tag; an override (an
    /// explicit as-of map, or coordinates resolved by an enclosing composed
    /// association) takes precedence over both.
    pub fn scoped_relation(
        &self,
        target: Arc<EntityType>,
        owner: ScopeOwner<'_>,
        over: Option<&TimeOverride>,
        registry: &ScopeRegistry,
    ) -> TempoResult<Relation> {
        let mut relation = Relation::new(target);
        if let Some(base) = self.scope.base() {
            relation = base.apply(relation, owner.record()).ok_or_else(|| {
                TempoError::eager_load_unsupported(self.owner.clone(), self.def.name.clone())
            })?;
        }
        if let AssociationScope::Temporal(temporal) = &self.scope {
            let resolved = temporal.resolve(owner, registry);
            relation = relation
                .constrain(&resolved.constraints)
                .tag(&resolved.tags)
                .detached();
        }
        if let Some(over) = over {
            relation = relation.constrain(&over.constraints).tag(&over.tags);
        }
        Ok(relation)
    }

    /// Coordinates shared by every hop of a temporal composed association.
    pub(crate) fn resolve_override(
        &self,
        owner: ScopeOwner<'_>,
        explicit: Option<&TimeOverride>,
        registry: &ScopeRegistry,
    ) -> Option<TimeOverride> {
        let resolved = match &self.scope {
            AssociationScope::Temporal(temporal) => {
                let mut resolved = temporal.resolve(owner, registry);
                if let Some(explicit) = explicit {
                    resolved.constraints.merge(&explicit.constraints);
                    resolved.tags.merge(&explicit.tags);
                }
                resolved
            }
            AssociationScope::Plain(_) => explicit?.clone(),
        };
        Some(resolved)
    }
}
