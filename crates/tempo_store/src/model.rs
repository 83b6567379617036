use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use aideon_tempo_core::{
    AsOf, AssociationDef, AssociationKind, Dimension, EntityDef, ModelManifest, TempoError,
    TempoResult, TimeCoords,
};

use crate::association::{Association, AssociationScope, ScopeFn, TemporalScope};

/// An entity declaration together with its resolved associations.
#[derive(Clone, Debug)]
pub struct EntityType {
    def: EntityDef,
    associations: BTreeMap<String, Association>,
}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn table(&self) -> &str {
        &self.def.table
    }

    pub fn primary_key(&self) -> &str {
        &self.def.primary_key
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.def.dimensions
    }

    pub fn default_dimension(&self) -> Option<&Dimension> {
        self.def.default_dimension()
    }

    pub fn def(&self) -> &EntityDef {
        &self.def
    }

    pub fn association(&self, name: &str) -> TempoResult<&Association> {
        self.associations
            .get(name)
            .ok_or_else(|| TempoError::unknown_association(self.def.name.clone(), name))
    }

    pub fn associations(&self) -> impl Iterator<Item = &Association> {
        self.associations.values()
    }

    pub fn resolve_as_of(&self, as_of: &AsOf) -> TempoResult<TimeCoords> {
        self.def.resolve_as_of(as_of)
    }
}

/// Every entity type known to a store, keyed by entity name.
#[derive(Clone, Debug, Default)]
pub struct Model {
    entities: BTreeMap<String, Arc<EntityType>>,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn from_manifest(manifest: ModelManifest) -> TempoResult<Self> {
        Self::builder().manifest(manifest).build()
    }

    pub fn entity(&self, name: &str) -> TempoResult<Arc<EntityType>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| TempoError::unknown_entity(name))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.entities.values()
    }

    /// Every dimension declared anywhere in the model, first declaration first.
    pub fn dimensions(&self) -> Vec<Dimension> {
        let mut seen = BTreeSet::new();
        let mut dimensions = Vec::new();
        for entity in self.entities.values() {
            for dimension in entity.dimensions() {
                if seen.insert(dimension.clone()) {
                    dimensions.push(dimension.clone());
                }
            }
        }
        dimensions
    }
}

struct PendingAssociation {
    owner: String,
    def: AssociationDef,
    scope: Option<ScopeFn>,
}

#[derive(Default)]
pub struct ModelBuilder {
    entities: Vec<EntityDef>,
    associations: Vec<PendingAssociation>,
}

impl ModelBuilder {
    pub fn entity(mut self, def: EntityDef) -> Self {
        self.entities.push(def);
        self
    }

    pub fn association(mut self, owner: impl Into<String>, def: AssociationDef) -> Self {
        self.associations.push(PendingAssociation {
            owner: owner.into(),
            def,
            scope: None,
        });
        self
    }

    pub fn scoped_association(
        mut self,
        owner: impl Into<String>,
        def: AssociationDef,
        scope: ScopeFn,
    ) -> Self {
        self.associations.push(PendingAssociation {
            owner: owner.into(),
            def,
            scope: Some(scope),
        });
        self
    }

    pub fn manifest(mut self, manifest: ModelManifest) -> Self {
        for entry in manifest.entities {
            let owner = entry.entity.name.clone();
            self.entities.push(entry.entity);
            for def in entry.associations {
                self.associations.push(PendingAssociation {
                    owner: owner.clone(),
                    def,
                    scope: None,
                });
            }
        }
        self
    }

    pub fn build(self) -> TempoResult<Model> {
        let mut defs = BTreeMap::new();
        for def in self.entities {
            if defs.contains_key(&def.name) {
                return Err(TempoError::invalid(format!(
                    "entity '{}' declared twice",
                    def.name
                )));
            }
            let mut seen = BTreeSet::new();
            if let Some(dimension) = def.dimensions.iter().find(|d| !seen.insert(*d)) {
                return Err(TempoError::invalid(format!(
                    "entity '{}' declares dimension '{dimension}' twice",
                    def.name
                )));
            }
            defs.insert(def.name.clone(), def);
        }

        let mut pending: BTreeMap<(String, String), PendingAssociation> = BTreeMap::new();
        for association in self.associations {
            if !defs.contains_key(&association.owner) {
                return Err(TempoError::unknown_entity(association.owner));
            }
            if !defs.contains_key(&association.def.target) {
                return Err(TempoError::unknown_entity(association.def.target));
            }
            if matches!(association.def.kind, AssociationKind::Through { .. })
                && association.scope.is_some()
            {
                return Err(TempoError::invalid(format!(
                    "association '{}.{}' is composed and cannot carry its own scope",
                    association.owner, association.def.name
                )));
            }
            let key = (association.owner.clone(), association.def.name.clone());
            if pending.contains_key(&key) {
                return Err(TempoError::invalid(format!(
                    "association '{}.{}' declared twice",
                    key.0, key.1
                )));
            }
            pending.insert(key, association);
        }

        for ((owner, name), association) in &pending {
            if let AssociationKind::Through { through, source } = &association.def.kind {
                let hop = pending
                    .get(&(owner.clone(), through.clone()))
                    .ok_or_else(|| TempoError::unknown_association(owner.clone(), through.clone()))?;
                let intermediate = hop.def.target.clone();
                let source_hop = pending
                    .get(&(intermediate.clone(), source.clone()))
                    .ok_or_else(|| TempoError::unknown_association(intermediate, source.clone()))?;
                if source_hop.def.target != association.def.target {
                    return Err(TempoError::invalid(format!(
                        "association '{owner}.{name}' targets '{}' but its source reaches '{}'",
                        association.def.target, source_hop.def.target
                    )));
                }
            }
        }

        let mut resolved: BTreeMap<String, BTreeMap<String, Association>> = BTreeMap::new();
        for ((owner, name), association) in &pending {
            let instance_dependent =
                instance_dependent(&pending, owner, name, &mut BTreeSet::new());
            let scope = if association.def.temporal {
                AssociationScope::Temporal(TemporalScope::new(
                    association.scope.clone(),
                    temporal_dimensions(&defs, &pending, association),
                ))
            } else {
                AssociationScope::Plain(association.scope.clone())
            };
            resolved.entry(owner.clone()).or_default().insert(
                name.clone(),
                Association::new(
                    owner.clone(),
                    association.def.clone(),
                    scope,
                    instance_dependent,
                ),
            );
        }

        let entities = defs
            .into_iter()
            .map(|(name, def)| {
                let associations = resolved.remove(&name).unwrap_or_default();
                (name, Arc::new(EntityType { def, associations }))
            })
            .collect();
        Ok(Model { entities })
    }
}

fn instance_dependent(
    pending: &BTreeMap<(String, String), PendingAssociation>,
    owner: &str,
    name: &str,
    visited: &mut BTreeSet<(String, String)>,
) -> bool {
    let key = (owner.to_string(), name.to_string());
    if !visited.insert(key.clone()) {
        return false;
    }
    let Some(association) = pending.get(&key) else {
        return false;
    };
    if association
        .scope
        .as_ref()
        .is_some_and(ScopeFn::is_instance_dependent)
    {
        return true;
    }
    match &association.def.kind {
        AssociationKind::Through { through, source } => {
            let intermediate = pending
                .get(&(owner.to_string(), through.clone()))
                .map(|hop| hop.def.target.clone());
            instance_dependent(pending, owner, through, visited)
                || intermediate
                    .is_some_and(|intermediate| instance_dependent(pending, &intermediate, source, visited))
        }
        _ => false,
    }
}

/// Composed associations pin the intermediate entity as well as the target.
fn temporal_dimensions(
    defs: &BTreeMap<String, EntityDef>,
    pending: &BTreeMap<(String, String), PendingAssociation>,
    association: &PendingAssociation,
) -> Vec<Dimension> {
    let mut dimensions = Vec::new();
    if let AssociationKind::Through { through, .. } = &association.def.kind
        && let Some(hop) = pending.get(&(association.owner.clone(), through.clone()))
        && let Some(intermediate) = defs.get(&hop.def.target)
    {
        dimensions.extend(intermediate.dimensions.iter().cloned());
    }
    if let Some(target) = defs.get(&association.def.target) {
        for dimension in &target.dimensions {
            if !dimensions.contains(dimension) {
                dimensions.push(dimension.clone());
            }
        }
    }
    dimensions
}
