use serde::{Deserialize, Serialize};

use crate::{AsOf, Dimension, TempoError, TempoResult, TimeCoords};

fn default_primary_key() -> String {
    "id".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Ordered; the first entry is the default dimension.
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: default_primary_key(),
            dimensions: Vec::new(),
        }
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn dimension(mut self, dimension: impl Into<Dimension>) -> Self {
        self.dimensions.push(dimension.into());
        self
    }

    pub fn default_dimension(&self) -> Option<&Dimension> {
        self.dimensions.first()
    }

    pub fn declares(&self, dimension: &Dimension) -> bool {
        self.dimensions.contains(dimension)
    }

    pub fn is_temporal(&self) -> bool {
        !self.dimensions.is_empty()
    }

    pub fn check_dimensions(&self, coords: &TimeCoords) -> TempoResult<()> {
        match coords.dimensions().find(|dimension| !self.declares(dimension)) {
            Some(dimension) => Err(TempoError::unknown_dimension(
                self.name.clone(),
                dimension.clone(),
            )),
            None => Ok(()),
        }
    }

    /// A bare instant constrains the default dimension only.
    pub fn resolve_as_of(&self, as_of: &AsOf) -> TempoResult<TimeCoords> {
        match as_of {
            AsOf::At(at) => match self.default_dimension() {
                Some(dimension) => Ok(TimeCoords::single(dimension.clone(), *at)),
                None => Err(TempoError::invalid(format!(
                    "entity '{}' declares no time dimensions",
                    self.name
                ))),
            },
            AsOf::Coords(coords) => {
                self.check_dimensions(coords)?;
                Ok(coords.clone())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssociationKind {
    /// The owner holds `foreign_key` pointing at the target's primary key.
    BelongsTo { foreign_key: String },
    /// The target holds `foreign_key` pointing at the owner's primary key.
    HasOne { foreign_key: String },
    HasMany { foreign_key: String },
    /// Composed of the owner's `through` association followed by `source` on its targets.
    Through { through: String, source: String },
}

impl AssociationKind {
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            AssociationKind::HasMany { .. } | AssociationKind::Through { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationDef {
    pub name: String,
    pub target: String,
    #[serde(flatten)]
    pub kind: AssociationKind,
    #[serde(default)]
    pub temporal: bool,
}

impl AssociationDef {
    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            target,
            AssociationKind::BelongsTo {
                foreign_key: foreign_key.into(),
            },
        )
    }

    pub fn has_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            target,
            AssociationKind::HasOne {
                foreign_key: foreign_key.into(),
            },
        )
    }

    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            target,
            AssociationKind::HasMany {
                foreign_key: foreign_key.into(),
            },
        )
    }

    pub fn through(
        name: impl Into<String>,
        target: impl Into<String>,
        through: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            target,
            AssociationKind::Through {
                through: through.into(),
                source: source.into(),
            },
        )
    }

    fn with_kind(name: impl Into<String>, target: impl Into<String>, kind: AssociationKind) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
            temporal: false,
        }
    }

    /// Opt into as-of scoping when the association is traversed.
    pub fn temporal(mut self) -> Self {
        self.temporal = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{AssociationDef, AssociationKind, EntityDef};
    use crate::{AsOf, Dimension, TempoError, TimeCoords, Timestamp};

    fn author() -> EntityDef {
        EntityDef::new("author", "authors")
            .dimension("validity")
            .dimension("system_period")
    }

    #[test]
    fn bare_instant_targets_default_dimension() {
        let coords = author()
            .resolve_as_of(&AsOf::At(Timestamp(3)))
            .expect("resolve");
        assert_eq!(coords, TimeCoords::single("validity", Timestamp(3)));
    }

    #[test]
    fn undeclared_dimension_is_rejected() {
        let err = author()
            .resolve_as_of(&AsOf::Coords(TimeCoords::single("bogus", Timestamp(1))))
            .expect_err("unknown dimension");
        match err {
            TempoError::UnknownDimension { dimension, .. } => {
                assert_eq!(dimension, Dimension::new("bogus"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn entity_without_dimensions_cannot_resolve_instant() {
        let plain = EntityDef::new("tag", "tags");
        assert!(plain.resolve_as_of(&AsOf::At(Timestamp(1))).is_err());
        assert!(!plain.is_temporal());
    }

    #[test]
    fn association_def_deserializes_flattened_kind() {
        let payload = serde_json::json!({
            "name": "books",
            "target": "book",
            "kind": "has_many",
            "foreign_key": "author_id",
            "temporal": true
        });
        let def: AssociationDef = serde_json::from_value(payload).expect("decode");
        assert_eq!(
            def,
            AssociationDef::has_many("books", "book", "author_id").temporal()
        );
        assert!(def.kind.is_collection());
        assert!(
            !AssociationKind::BelongsTo {
                foreign_key: "author_id".to_string()
            }
            .is_collection()
        );
    }
}
