//! Storage-layer predicates and the range predicate builder.
//!
//! A dimension that is not backed by a physical interval on the entity's
//! table contributes no predicate at all. Mixed schemas (some tables
//! versioned, some not) rely on this: absence is non-participation, not an
//! error.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use aideon_tempo_core::{AsOf, Dimension, TempoResult, TimeCoords, Timestamp, Value};

use crate::backend::{Backend, Row};
use crate::model::EntityType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    /// The row's interval for `dimension` contains `at`.
    Contains {
        dimension: Dimension,
        at: Timestamp,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In {
            column: column.into(),
            values,
        }
    }

    pub fn contains(dimension: Dimension, at: Timestamp) -> Self {
        Predicate::Contains { dimension, at }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Compare { column, op, value } => {
                let actual = row.get(column).unwrap_or(&Value::Null);
                compare_matches(actual, *op, value)
            }
            Predicate::In { column, values } => {
                let actual = row.get(column).unwrap_or(&Value::Null);
                values
                    .iter()
                    .any(|value| compare_matches(actual, CompareOp::Eq, value))
            }
            Predicate::Contains { dimension, at } => row
                .period(dimension)
                .is_none_or(|interval| interval.contains(*at)),
            Predicate::And(items) => items.iter().all(|item| item.matches(row)),
            Predicate::Or(items) => items.iter().any(|item| item.matches(row)),
            Predicate::Not(inner) => !inner.matches(row),
        }
    }
}

fn compare_matches(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    if expected.is_null() {
        return match op {
            CompareOp::Eq => actual.is_null(),
            CompareOp::Ne => !actual.is_null(),
            _ => false,
        };
    }
    let Some(ordering) = actual.compare(expected) else {
        return false;
    };
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Lte => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Gte => ordering != Ordering::Less,
    }
}

/// Turns a coordinate map into "interval contains instant" predicates for one entity.
pub struct RangePredicateBuilder<'a> {
    backend: &'a dyn Backend,
}

impl<'a> RangePredicateBuilder<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    /// Emits one predicate per dimension present in `coords`, declared by the
    /// entity and backed by its table; the results are meant to be conjoined.
    pub fn build(&self, entity: &EntityType, coords: &TimeCoords) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        for (dimension, at) in coords {
            if !entity.def().declares(dimension) {
                continue;
            }
            if !self.backend.has_period(entity.table(), dimension) {
                log::debug!(
                    "tempo: {} has no period for '{}', not filtering",
                    entity.table(),
                    dimension
                );
                continue;
            }
            predicates.push(Predicate::contains(dimension.clone(), *at));
        }
        predicates
    }

    /// A bare instant constrains the entity's default dimension only.
    pub fn build_as_of(&self, entity: &EntityType, as_of: &AsOf) -> TempoResult<Vec<Predicate>> {
        let coords = entity.resolve_as_of(as_of)?;
        Ok(self.build(entity, &coords))
    }
}

#[cfg(test)]
mod tests {
    use super::{CompareOp, Predicate, RangePredicateBuilder};
    use crate::backend::{MemoryBackend, Row};
    use crate::model::Model;
    use aideon_tempo_core::{AsOf, Dimension, EntityDef, Interval, TimeCoords, Timestamp, Value};

    fn fixture() -> (MemoryBackend, Model) {
        let backend = MemoryBackend::new();
        backend
            .create_table("authors", ["id"], ["validity"])
            .expect("authors");
        let model = Model::builder()
            .entity(
                EntityDef::new("author", "authors")
                    .dimension("validity")
                    .dimension("system_period"),
            )
            .build()
            .expect("model");
        (backend, model)
    }

    #[test]
    fn skips_dimensions_without_backing_period() {
        let (backend, model) = fixture();
        let author = model.entity("author").expect("author");
        let coords = TimeCoords::single("validity", Timestamp(3)).with("system_period", Timestamp(4));
        let predicates = RangePredicateBuilder::new(&backend).build(&author, &coords);
        assert_eq!(
            predicates,
            vec![Predicate::contains(Dimension::new("validity"), Timestamp(3))]
        );
    }

    #[test]
    fn ignores_dimensions_the_entity_does_not_declare() {
        let (backend, model) = fixture();
        let author = model.entity("author").expect("author");
        let coords = TimeCoords::single("other", Timestamp(3));
        assert!(
            RangePredicateBuilder::new(&backend)
                .build(&author, &coords)
                .is_empty()
        );
    }

    #[test]
    fn bare_instant_uses_default_dimension() {
        let (backend, model) = fixture();
        let author = model.entity("author").expect("author");
        let predicates = RangePredicateBuilder::new(&backend)
            .build_as_of(&author, &AsOf::At(Timestamp(9)))
            .expect("predicates");
        assert_eq!(
            predicates,
            vec![Predicate::contains(Dimension::new("validity"), Timestamp(9))]
        );
    }

    #[test]
    fn contains_matches_half_open_interval() {
        let row = Row::new().with_period(
            "validity",
            Interval::between(Timestamp(1), Timestamp(3)).expect("interval"),
        );
        let at = |t| Predicate::contains(Dimension::new("validity"), Timestamp(t));
        assert!(at(1).matches(&row));
        assert!(at(2).matches(&row));
        assert!(!at(3).matches(&row));
        assert!(!at(0).matches(&row));
    }

    #[test]
    fn compare_and_boolean_combinators() {
        let row = Row::new().with("id", 5_i64).with("name", "ada");
        assert!(Predicate::compare("id", CompareOp::Gte, 5_i64).matches(&row));
        assert!(!Predicate::compare("id", CompareOp::Lt, 5_i64).matches(&row));
        assert!(Predicate::is_in("name", vec![Value::from("bob"), Value::from("ada")]).matches(&row));
        assert!(Predicate::eq("missing", Value::Null).matches(&row));
        assert!(!Predicate::compare("missing", CompareOp::Gt, 1_i64).matches(&row));
        let either = Predicate::Or(vec![
            Predicate::eq("id", 1_i64),
            Predicate::eq("name", "ada"),
        ]);
        assert!(either.matches(&row));
        assert!(!Predicate::Not(Box::new(either)).matches(&row));
        assert!(Predicate::And(Vec::new()).matches(&row));
    }
}
