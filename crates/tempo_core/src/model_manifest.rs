use serde::{Deserialize, Serialize};

use crate::{AssociationDef, EntityDef};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub manifest_version: String,
    pub entities: Vec<EntityManifest>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityManifest {
    #[serde(flatten)]
    pub entity: EntityDef,
    #[serde(default)]
    pub associations: Vec<AssociationDef>,
}

#[cfg(test)]
mod tests {
    use super::ModelManifest;
    use crate::Dimension;

    #[test]
    fn parses_entities_with_associations() {
        let payload = serde_json::json!({
            "manifest_version": "1",
            "entities": [
                {
                    "name": "author",
                    "table": "authors",
                    "dimensions": ["period"],
                    "associations": [
                        { "name": "books", "target": "book", "kind": "has_many",
                          "foreign_key": "author_id", "temporal": true }
                    ]
                },
                { "name": "book", "table": "books", "dimensions": ["period"] }
            ]
        });
        let manifest: ModelManifest = serde_json::from_value(payload).expect("manifest");
        assert_eq!(manifest.entities.len(), 2);
        let author = &manifest.entities[0];
        assert_eq!(author.entity.primary_key, "id");
        assert_eq!(author.entity.dimensions, vec![Dimension::new("period")]);
        assert!(author.associations[0].temporal);
        assert!(manifest.entities[1].associations.is_empty());
    }
}
