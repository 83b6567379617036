//! Store handle and the per-execution session that runs as-of queries.
//!
//! A [`TempoStore`] is shared and cheap to clone. Each logical execution
//! (request, task, test) takes its own [`Session`], which owns a fresh
//! [`ScopeRegistry`]; nothing about ambient as-of state is global.

use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use aideon_tempo_core::{
    AsOf, AssociationKind, Clock, Dimension, SystemClock, TempoError, TempoResult, TimeCoords,
    Value, ValueKey,
};

use crate::association::{
    Association, AssociationScope, BatchMode, LoadStrategy, ScopeOwner, TimeOverride,
};
use crate::backend::{Backend, MemoryBackend};
use crate::config::{DatabaseConfig, PreloadPolicy, TempoConfig};
use crate::model::{EntityType, Model};
use crate::predicate::RangePredicateBuilder;
use crate::record::{Loaded, Record};
use crate::registry::ScopeRegistry;
use crate::relation::Relation;
use crate::sql::SqlBackend;
use crate::walker::{AssociationGraphWalker, IncludeTree};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct StoreInner {
    backend: Arc<dyn Backend>,
    model: Model,
    clock: Arc<dyn Clock>,
    preload_policy: PreloadPolicy,
}

#[derive(Clone)]
pub struct TempoStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TempoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempoStore")
            .field("backend", &self.inner.backend.name())
            .field("preload_policy", &self.inner.preload_policy)
            .finish()
    }
}

pub struct TempoStoreBuilder {
    backend: Arc<dyn Backend>,
    model: Model,
    clock: Option<Arc<dyn Clock>>,
    preload_policy: PreloadPolicy,
}

impl TempoStoreBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn preload_policy(mut self, policy: PreloadPolicy) -> Self {
        self.preload_policy = policy;
        self
    }

    pub fn build(self) -> TempoStore {
        TempoStore {
            inner: Arc::new(StoreInner {
                backend: self.backend,
                model: self.model,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                preload_policy: self.preload_policy,
            }),
        }
    }
}

impl TempoStore {
    pub fn builder(backend: Arc<dyn Backend>, model: Model) -> TempoStoreBuilder {
        TempoStoreBuilder {
            backend,
            model,
            clock: None,
            preload_policy: PreloadPolicy::default(),
        }
    }

    pub fn new(backend: Arc<dyn Backend>, model: Model) -> Self {
        Self::builder(backend, model).build()
    }

    pub async fn connect(config: &TempoConfig, base_dir: &Path, model: Model) -> TempoResult<Self> {
        let backend: Arc<dyn Backend> = match config.database {
            DatabaseConfig::Memory => Arc::new(MemoryBackend::new()),
            _ => Arc::new(SqlBackend::connect(config, base_dir).await?),
        };
        log::info!(
            "tempo: opened {} store with {} entities",
            backend.name(),
            model.entities().count()
        );
        Ok(Self::builder(backend, model)
            .preload_policy(config.preload_policy())
            .build())
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn preload_policy(&self) -> PreloadPolicy {
        self.inner.preload_policy
    }

    pub fn session(&self) -> Session {
        Session {
            store: self.clone(),
            registry: ScopeRegistry::new(self.inner.clock.clone()),
        }
    }
}

/// One logical execution: its own scope registry plus the query operations
/// that consult it.
#[derive(Debug)]
pub struct Session {
    store: TempoStore,
    registry: ScopeRegistry,
}

/// A session inside a scoped block; the block's frame is popped on drop.
///
/// Derefs to the [`Session`], and nested scopes are entered through it, so
/// blocks always close innermost first.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct ScopedSession<'a> {
    session: &'a mut Session,
    depth: usize,
}

impl Deref for ScopedSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        &*self.session
    }
}

impl DerefMut for ScopedSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        &mut *self.session
    }
}

impl Drop for ScopedSession<'_> {
    fn drop(&mut self) {
        self.session.registry.leave(self.depth);
    }
}

impl Session {
    pub fn store(&self) -> &TempoStore {
        &self.store
    }

    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    pub fn query(&self, entity: &str) -> TempoResult<Relation> {
        Ok(Relation::new(self.store.model().entity(entity)?))
    }

    /// Runs the relation, loads requested associations and tags the whole graph.
    ///
    /// Every include tree is validated before the first query runs, so an
    /// unsupported eager load fails without touching storage.
    pub async fn load(&self, relation: Relation) -> TempoResult<Vec<Record>> {
        let entity = relation.entity().clone();
        for tree in relation.eager_loads() {
            self.validate_tree(&entity, tree, LoadStrategy::Eager)?;
        }
        for tree in relation.preloads() {
            self.validate_tree(&entity, tree, LoadStrategy::Preload)?;
        }
        let (mut records, tags) = self.execute(&relation).await?;
        if !relation.eager_loads().is_empty() {
            let trees = relation.eager_loads().iter().collect();
            self.load_includes(records.iter_mut().collect(), trees, LoadStrategy::Eager)
                .await?;
        }
        if !relation.preloads().is_empty() {
            let trees = relation.preloads().iter().collect();
            self.load_includes(records.iter_mut().collect(), trees, LoadStrategy::Preload)
                .await?;
        }
        let walker = AssociationGraphWalker::new(&tags);
        for tree in relation.requested_loads() {
            walker.walk(&mut records, tree);
        }
        Ok(records)
    }

    pub async fn first(&self, relation: Relation) -> TempoResult<Option<Record>> {
        Ok(self.load(relation.limit(1)).await?.into_iter().next())
    }

    /// Lazily traverses an association, caching the targets on the owner.
    pub async fn association<'r>(
        &self,
        owner: &'r mut Record,
        name: &str,
    ) -> TempoResult<&'r Loaded> {
        if !owner.is_loaded(name) {
            let loaded = self.fetch_association(owner, name, None).await?;
            owner.set_loaded(name, loaded);
        }
        owner
            .loaded_association(name)
            .ok_or_else(|| TempoError::unknown_association(owner.entity().name(), name))
    }

    /// Traverses an association at explicit coordinates; nothing is cached.
    pub async fn association_as_of(
        &self,
        owner: &Record,
        name: &str,
        as_of: impl Into<AsOf>,
    ) -> TempoResult<Loaded> {
        let association = owner.entity().association(name)?;
        let coords = self.association_coords(association, &as_of.into())?;
        let over = TimeOverride::explicit(coords);
        self.fetch_association(owner, name, Some(&over)).await
    }

    /// The association's target query as its scope resolves it right now,
    /// without the key join to any particular owner.
    pub fn association_relation(
        &self,
        entity: &str,
        name: &str,
        owner: Option<&Record>,
    ) -> TempoResult<Relation> {
        let model = self.store.model();
        let entity = model.entity(entity)?;
        let association = entity.association(name)?;
        let target = model.entity(association.target())?;
        let scope_owner = owner.map_or(ScopeOwner::Detached, ScopeOwner::Record);
        match association.kind() {
            AssociationKind::Through { .. } => {
                let mut relation = Relation::new(target);
                if let Some(shared) =
                    association.resolve_override(scope_owner, None, &self.registry)
                {
                    relation = relation
                        .constrain(&shared.constraints)
                        .tag(&shared.tags)
                        .detached();
                }
                Ok(relation)
            }
            _ => association.scoped_relation(target, scope_owner, None, &self.registry),
        }
    }

    /// Fetches the version of `record` valid at `as_of`, tagged with it.
    pub async fn record_as_of(
        &self,
        record: &Record,
        as_of: impl Into<AsOf>,
    ) -> TempoResult<Option<Record>> {
        let entity = record.entity().clone();
        let id = primary_key_value(record)?;
        let relation = Relation::new(entity.clone())
            .filter_eq(entity.primary_key(), id)
            .as_of(as_of)?
            .limit(1);
        let (records, _) = self.execute(&relation).await?;
        Ok(records.into_iter().next())
    }

    /// Re-reads the current version of `record`, dropping its tag and loaded associations.
    pub async fn reload(&self, record: &mut Record) -> TempoResult<()> {
        let entity = record.entity().clone();
        let id = primary_key_value(record)?;
        let now = self.registry.now();
        let current: TimeCoords = entity
            .dimensions()
            .iter()
            .map(|dimension| (dimension.clone(), now))
            .collect();
        let relation = Relation::new(entity.clone())
            .filter_eq(entity.primary_key(), id.clone())
            .constrain(&current)
            .detached()
            .limit(1);
        let (records, _) = self.execute(&relation).await?;
        let fresh = records.into_iter().next().ok_or_else(|| {
            TempoError::not_found(format!("{} {id:?} has no current version", entity.name()))
        })?;
        record.refresh(fresh.into_row());
        Ok(())
    }

    /// Global default for queries outside association context. A bare instant
    /// applies to every dimension.
    ///
    /// The returned guard borrows the session exclusively and derefs to it;
    /// the scope ends when it is dropped.
    pub fn at_scope(&mut self, as_of: impl Into<AsOf>) -> TempoResult<ScopedSession<'_>> {
        let as_of = as_of.into();
        if let AsOf::Coords(coords) = &as_of {
            self.check_model_dimensions(coords)?;
        }
        let depth = self.registry.enter(|state| state.apply_global(as_of));
        Ok(ScopedSession {
            session: self,
            depth,
        })
    }

    /// Association default and tag together. A bare instant applies to every
    /// dimension the model declares.
    pub fn as_of_scope(&mut self, as_of: impl Into<AsOf>) -> TempoResult<ScopedSession<'_>> {
        let coords = match as_of.into() {
            AsOf::At(at) => self
                .store
                .model()
                .dimensions()
                .into_iter()
                .map(|dimension| (dimension, at))
                .collect(),
            AsOf::Coords(coords) => {
                self.check_model_dimensions(&coords)?;
                coords
            }
        };
        let depth = self.registry.enter(|state| state.apply_as_of(&coords));
        Ok(ScopedSession {
            session: self,
            depth,
        })
    }

    pub async fn run_at<T>(
        &mut self,
        as_of: impl Into<AsOf>,
        work: impl AsyncFnOnce(&Session) -> TempoResult<T>,
    ) -> TempoResult<T> {
        let scoped = self.at_scope(as_of)?;
        let session: &Session = &scoped;
        work(session).await
    }

    pub async fn run_as_of<T>(
        &mut self,
        as_of: impl Into<AsOf>,
        work: impl AsyncFnOnce(&Session) -> TempoResult<T>,
    ) -> TempoResult<T> {
        let scoped = self.as_of_scope(as_of)?;
        let session: &Session = &scoped;
        work(session).await
    }

    /// A session for concurrent work: same store, and a registry of its own
    /// starting from this session's current scope.
    pub fn fork(&self) -> Session {
        Session {
            store: self.store.clone(),
            registry: self.registry.fork(),
        }
    }

    fn check_model_dimensions(&self, coords: &TimeCoords) -> TempoResult<()> {
        let known = self.store.model().dimensions();
        match coords.dimensions().find(|dimension| !known.contains(dimension)) {
            Some(dimension) => Err(TempoError::unknown_dimension("model", dimension.clone())),
            None => Ok(()),
        }
    }

    fn validate_tree(
        &self,
        entity: &EntityType,
        tree: &IncludeTree,
        strategy: LoadStrategy,
    ) -> TempoResult<()> {
        for (name, children) in tree.branches() {
            let association = entity.association(name)?;
            association.batch_mode(strategy, self.store.preload_policy())?;
            if !children.is_empty() {
                let target = self.store.model().entity(association.target())?;
                for child in children {
                    self.validate_tree(&target, child, strategy)?;
                }
            }
        }
        Ok(())
    }

    /// Registry global constraints fill the dimensions the relation leaves
    /// open; they constrain and tag like an explicit as-of, except on
    /// `existed_at` relations, which never tag.
    async fn execute(&self, relation: &Relation) -> TempoResult<(Vec<Record>, TimeCoords)> {
        let entity = relation.entity();
        let mut constraints = relation.time_constraints().clone();
        let mut tags = relation.pending_tags().clone();
        if relation.is_ambient() {
            let ambient = self.registry.global_constraints_for(entity.dimensions());
            for (dimension, at) in &ambient {
                if !constraints.contains(dimension) {
                    constraints.insert(dimension.clone(), *at);
                    if relation.tags_results() && !tags.contains(dimension) {
                        tags.insert(dimension.clone(), *at);
                    }
                }
            }
        }
        let backend = self.store.backend();
        let mut predicates = relation.filters().to_vec();
        predicates.extend(RangePredicateBuilder::new(backend.as_ref()).build(entity, &constraints));
        log::debug!(
            "tempo: query {} coords={constraints:?} predicates={}",
            entity.name(),
            predicates.len()
        );
        let rows = backend
            .fetch(entity.table(), &predicates, relation.limit_value())
            .await?;
        let records = rows
            .into_iter()
            .map(|row| Record::materialize(entity.clone(), row, &tags))
            .collect();
        Ok((records, tags))
    }

    fn load_includes<'a>(
        &'a self,
        mut owners: Vec<&'a mut Record>,
        trees: Vec<&'a IncludeTree>,
        strategy: LoadStrategy,
    ) -> BoxFuture<'a, TempoResult<()>> {
        Box::pin(async move {
            let Some(first) = owners.first() else {
                return Ok(());
            };
            let entity = first.entity().clone();
            for (name, children) in IncludeTree::grouped(&trees) {
                let association = entity.association(name)?;
                let mode = association.batch_mode(strategy, self.store.preload_policy())?;
                let loaded = {
                    let refs: Vec<&Record> = owners.iter().map(|owner| &**owner).collect();
                    match mode {
                        BatchMode::Single => self.load_batched(association, &refs).await?,
                        BatchMode::PerOwner => {
                            let mut loaded = Vec::with_capacity(refs.len());
                            for owner in &refs {
                                let per_owner = self
                                    .fetch_batch(association, &[*owner], ScopeOwner::Record(*owner), None)
                                    .await?;
                                loaded.extend(per_owner);
                            }
                            loaded
                        }
                    }
                };
                for (owner, loaded) in owners.iter_mut().zip(loaded) {
                    owner.set_loaded(name, loaded);
                }
                if !children.is_empty() {
                    let targets: Vec<&mut Record> = owners
                        .iter_mut()
                        .filter_map(|owner| owner.loaded_mut(name))
                        .flat_map(Loaded::iter_mut)
                        .collect();
                    self.load_includes(targets, children, strategy).await?;
                }
            }
            Ok(())
        })
    }

    /// One query per distinct owner tag; owners loaded in one operation
    /// normally share a single tag.
    async fn load_batched(
        &self,
        association: &Association,
        owners: &[&Record],
    ) -> TempoResult<Vec<Loaded>> {
        let mut groups: Vec<(TimeCoords, Vec<usize>)> = Vec::new();
        for (index, owner) in owners.iter().enumerate() {
            match groups.iter_mut().find(|(tag, _)| tag == owner.time_tag()) {
                Some((_, indices)) => indices.push(index),
                None => groups.push((owner.time_tag().clone(), vec![index])),
            }
        }
        let mut slots: Vec<Option<Loaded>> = (0..owners.len()).map(|_| None).collect();
        for (tag, indices) in &groups {
            let batch: Vec<&Record> = indices.iter().map(|index| owners[*index]).collect();
            let loaded = self
                .fetch_batch(association, &batch, ScopeOwner::Batch(tag), None)
                .await?;
            for (index, loaded) in indices.iter().zip(loaded) {
                slots[*index] = Some(loaded);
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    async fn fetch_association(
        &self,
        owner: &Record,
        name: &str,
        over: Option<&TimeOverride>,
    ) -> TempoResult<Loaded> {
        let association = owner.entity().association(name)?;
        let mut loaded = self
            .fetch_batch(association, &[owner], ScopeOwner::Record(owner), over)
            .await?;
        loaded
            .pop()
            .ok_or_else(|| TempoError::storage(format!("no result loading '{name}'")))
    }

    /// Loads `association` for every owner, returning one entry per owner in order.
    fn fetch_batch<'a>(
        &'a self,
        association: &'a Association,
        owners: &'a [&'a Record],
        scope_owner: ScopeOwner<'a>,
        over: Option<&'a TimeOverride>,
    ) -> BoxFuture<'a, TempoResult<Vec<Loaded>>> {
        Box::pin(async move {
            let model = self.store.model();
            let target = model.entity(association.target())?;
            match association.kind() {
                AssociationKind::BelongsTo { foreign_key } => {
                    let keys: Vec<Option<ValueKey>> = owners
                        .iter()
                        .map(|owner| owner.get(foreign_key).and_then(Value::key))
                        .collect();
                    let values = distinct_values(owners.iter().filter_map(|owner| owner.get(foreign_key)));
                    if values.is_empty() {
                        return Ok(owners.iter().map(|_| Loaded::One(None)).collect());
                    }
                    let relation = association
                        .scoped_relation(target.clone(), scope_owner, over, &self.registry)?
                        .filter_in(target.primary_key(), values);
                    let (records, _) = self.execute(&relation).await?;
                    let mut by_key: HashMap<ValueKey, Record> = HashMap::new();
                    for record in records {
                        if let Some(key) = record.id().and_then(Value::key) {
                            by_key.entry(key).or_insert(record);
                        }
                    }
                    Ok(keys
                        .iter()
                        .map(|key| {
                            let found = key.as_ref().and_then(|key| by_key.get(key)).cloned();
                            Loaded::One(found.map(Box::new))
                        })
                        .collect())
                }
                AssociationKind::HasOne { foreign_key } | AssociationKind::HasMany { foreign_key } => {
                    let keys: Vec<Option<ValueKey>> = owners
                        .iter()
                        .map(|owner| owner.id().and_then(Value::key))
                        .collect();
                    let values = distinct_values(owners.iter().filter_map(|owner| owner.id()));
                    let mut grouped: HashMap<ValueKey, Vec<Record>> = HashMap::new();
                    if !values.is_empty() {
                        let relation = association
                            .scoped_relation(target.clone(), scope_owner, over, &self.registry)?
                            .filter_in(foreign_key.clone(), values);
                        let (records, _) = self.execute(&relation).await?;
                        for record in records {
                            if let Some(key) = record.get(foreign_key).and_then(Value::key) {
                                grouped.entry(key).or_default().push(record);
                            }
                        }
                    }
                    let collection = association.kind().is_collection();
                    Ok(keys
                        .iter()
                        .map(|key| {
                            let targets = key
                                .as_ref()
                                .and_then(|key| grouped.get(key))
                                .cloned()
                                .unwrap_or_default();
                            if collection {
                                Loaded::Many(targets)
                            } else {
                                Loaded::One(targets.into_iter().next().map(Box::new))
                            }
                        })
                        .collect())
                }
                AssociationKind::Through { through, source } => {
                    let owner_entity = model.entity(association.owner())?;
                    let hop = owner_entity.association(through)?;
                    let intermediate = model.entity(hop.target())?;
                    let source_hop = intermediate.association(source)?;
                    let shared = association.resolve_override(scope_owner, over, &self.registry);

                    let mids = self
                        .fetch_batch(hop, owners, scope_owner, shared.as_ref())
                        .await?;
                    let counts: Vec<usize> = mids.iter().map(Loaded::len).collect();
                    let mid_refs: Vec<&Record> = mids.iter().flat_map(Loaded::iter).collect();
                    let per_mid = if mid_refs.is_empty() {
                        Vec::new()
                    } else if source_hop.is_instance_dependent() {
                        let mut per_mid = Vec::with_capacity(mid_refs.len());
                        for mid in &mid_refs {
                            let loaded = self
                                .fetch_batch(source_hop, &[*mid], ScopeOwner::Record(*mid), shared.as_ref())
                                .await?;
                            per_mid.extend(loaded);
                        }
                        per_mid
                    } else if let Some(shared) = &shared {
                        self.fetch_batch(source_hop, &mid_refs, ScopeOwner::Batch(&shared.tags), Some(shared))
                            .await?
                    } else {
                        self.load_batched(source_hop, &mid_refs).await?
                    };
                    let mut per_mid = per_mid.into_iter();
                    Ok(counts
                        .iter()
                        .map(|count| {
                            Loaded::Many(
                                per_mid
                                    .by_ref()
                                    .take(*count)
                                    .flat_map(Loaded::into_records)
                                    .collect(),
                            )
                        })
                        .collect())
                }
            }
        })
    }

    /// Dimensions an explicit as-of map may name when traversing `association`.
    fn association_dimensions(&self, association: &Association) -> TempoResult<Vec<Dimension>> {
        if let AssociationScope::Temporal(temporal) = association.scope() {
            return Ok(temporal.dimensions().to_vec());
        }
        let model = self.store.model();
        let mut dimensions = model.entity(association.target())?.dimensions().to_vec();
        if let AssociationKind::Through { through, .. } = association.kind() {
            let owner = model.entity(association.owner())?;
            let hop = owner.association(through)?;
            for dimension in model.entity(hop.target())?.dimensions() {
                if !dimensions.contains(dimension) {
                    dimensions.push(dimension.clone());
                }
            }
        }
        Ok(dimensions)
    }

    /// A bare instant pins the target's default dimension.
    fn association_coords(&self, association: &Association, as_of: &AsOf) -> TempoResult<TimeCoords> {
        match as_of {
            AsOf::At(_) => self.store.model().entity(association.target())?.resolve_as_of(as_of),
            AsOf::Coords(coords) => {
                let dimensions = self.association_dimensions(association)?;
                match coords.dimensions().find(|dimension| !dimensions.contains(dimension)) {
                    Some(dimension) => Err(TempoError::unknown_dimension(
                        association.target(),
                        dimension.clone(),
                    )),
                    None => Ok(coords.clone()),
                }
            }
        }
    }
}

fn primary_key_value(record: &Record) -> TempoResult<Value> {
    record
        .id()
        .filter(|value| !value.is_null())
        .cloned()
        .ok_or_else(|| {
            TempoError::invalid(format!(
                "{} record has no '{}' value",
                record.entity().name(),
                record.entity().primary_key()
            ))
        })
}

fn distinct_values<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<Value> {
    let mut seen = Vec::new();
    let mut distinct = Vec::new();
    for value in values {
        if let Some(key) = value.key()
            && !seen.contains(&key)
        {
            seen.push(key);
            distinct.push(value.clone());
        }
    }
    distinct
}
