use aideon_tempo_core::TimeCoords;

use crate::record::Record;

/// Nested selection of associations to load: a name, a list of selections,
/// or a name with child selections loaded on its targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncludeTree {
    Leaf(String),
    Seq(Vec<IncludeTree>),
    WithChildren(String, Vec<IncludeTree>),
}

impl IncludeTree {
    pub fn leaf(name: impl Into<String>) -> Self {
        IncludeTree::Leaf(name.into())
    }

    pub fn nested(name: impl Into<String>, child: impl Into<IncludeTree>) -> Self {
        IncludeTree::WithChildren(name.into(), vec![child.into()])
    }

    pub fn with_children(
        name: impl Into<String>,
        children: impl IntoIterator<Item = IncludeTree>,
    ) -> Self {
        IncludeTree::WithChildren(name.into(), children.into_iter().collect())
    }

    pub fn seq(items: impl IntoIterator<Item = IncludeTree>) -> Self {
        IncludeTree::Seq(items.into_iter().collect())
    }

    /// Association names at this level with their child selections, in order.
    pub fn branches(&self) -> Vec<(&str, &[IncludeTree])> {
        let mut branches = Vec::new();
        self.collect_branches(&mut branches);
        branches
    }

    fn collect_branches<'a>(&'a self, out: &mut Vec<(&'a str, &'a [IncludeTree])>) {
        match self {
            IncludeTree::Leaf(name) => out.push((name.as_str(), &[])),
            IncludeTree::Seq(items) => items.iter().for_each(|item| item.collect_branches(out)),
            IncludeTree::WithChildren(name, children) => {
                out.push((name.as_str(), children.as_slice()))
            }
        }
    }

    /// Branches of several selections grouped by association name, first occurrence first.
    pub fn grouped<'a>(trees: &[&'a IncludeTree]) -> Vec<(&'a str, Vec<&'a IncludeTree>)> {
        let mut grouped: Vec<(&'a str, Vec<&'a IncludeTree>)> = Vec::new();
        for tree in trees {
            for (name, children) in tree.branches() {
                let index = match grouped.iter().position(|(seen, _)| *seen == name) {
                    Some(index) => index,
                    None => {
                        grouped.push((name, Vec::new()));
                        grouped.len() - 1
                    }
                };
                grouped[index].1.extend(children);
            }
        }
        grouped
    }
}

impl From<&str> for IncludeTree {
    fn from(name: &str) -> Self {
        IncludeTree::leaf(name)
    }
}

impl From<String> for IncludeTree {
    fn from(name: String) -> Self {
        IncludeTree::Leaf(name)
    }
}

impl<T: Into<IncludeTree>> From<Vec<T>> for IncludeTree {
    fn from(items: Vec<T>) -> Self {
        IncludeTree::Seq(items.into_iter().map(Into::into).collect())
    }
}

/// Pushes the root relation's tag onto every record loaded with it.
///
/// Records that already carry a tag for a dimension (because their own
/// association scope resolved one) keep it; only untagged dimensions are
/// filled, so walking the same graph twice changes nothing.
pub struct AssociationGraphWalker<'a> {
    tags: &'a TimeCoords,
}

impl<'a> AssociationGraphWalker<'a> {
    pub fn new(tags: &'a TimeCoords) -> Self {
        Self { tags }
    }

    pub fn walk(&self, records: &mut [Record], tree: &IncludeTree) {
        for record in records {
            self.walk_record(record, tree);
        }
    }

    pub fn walk_record(&self, record: &mut Record, tree: &IncludeTree) {
        if self.tags.is_empty() {
            return;
        }
        for (name, children) in tree.branches() {
            let Some(loaded) = record.loaded_mut(name) else {
                continue;
            };
            for target in loaded.iter_mut() {
                target.fill_tag(self.tags);
                for child in children {
                    self.walk_record(target, child);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AssociationGraphWalker, IncludeTree};
    use crate::backend::Row;
    use crate::model::Model;
    use crate::record::{Loaded, Record};
    use aideon_tempo_core::{EntityDef, TimeCoords, Timestamp};

    fn record(model: &Model, entity: &str, id: i64) -> Record {
        Record::new(model.entity(entity).expect("entity"), Row::new().with("id", id))
    }

    fn graph() -> Vec<Record> {
        let model = Model::builder()
            .entity(EntityDef::new("author", "authors").dimension("period"))
            .entity(EntityDef::new("book", "books").dimension("period"))
            .entity(EntityDef::new("review", "reviews").dimension("period"))
            .entity(EntityDef::new("publisher", "publishers"))
            .build()
            .expect("model");
        let mut review = record(&model, "review", 7);
        review.stamp_tag(&TimeCoords::single("period", Timestamp(1)));
        let mut book = record(&model, "book", 3);
        book.set_loaded("reviews", Loaded::Many(vec![review, record(&model, "review", 8)]));
        let mut author = record(&model, "author", 1);
        author.set_loaded("books", Loaded::Many(vec![book, record(&model, "book", 4)]));
        author.set_loaded(
            "publisher",
            Loaded::One(Some(Box::new(record(&model, "publisher", 9)))),
        );
        vec![author]
    }

    #[test]
    fn branches_flatten_every_form() {
        let tree = IncludeTree::seq([
            IncludeTree::leaf("publisher"),
            IncludeTree::nested("books", "reviews"),
        ]);
        let names: Vec<_> = tree.branches().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["publisher", "books"]);

        let first = IncludeTree::with_children("books", [IncludeTree::leaf("reviews")]);
        let second = IncludeTree::from(vec!["books", "publisher"]);
        let grouped = IncludeTree::grouped(&[&first, &second]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "books");
        assert_eq!(grouped[0].1.len(), 1);
        assert_eq!(grouped[1].0, "publisher");
    }

    #[test]
    fn walks_nested_selection_to_any_depth() {
        let mut graph = graph();
        let tags = TimeCoords::single("period", Timestamp(5));
        let tree = IncludeTree::seq([
            IncludeTree::nested("books", "reviews"),
            IncludeTree::leaf("publisher"),
        ]);
        AssociationGraphWalker::new(&tags).walk(&mut graph, &tree);

        let books = graph[0].loaded_association("books").expect("books");
        for book in books.iter() {
            assert_eq!(book.time_tag(), &tags);
        }
        let reviews = books.many()[0].loaded_association("reviews").expect("reviews");
        let review_tags: Vec<_> = reviews.iter().map(|review| review.time_tag().clone()).collect();
        assert_eq!(
            review_tags,
            vec![TimeCoords::single("period", Timestamp(1)), tags.clone()]
        );
        let publisher = graph[0]
            .loaded_association("publisher")
            .and_then(|loaded| loaded.one())
            .expect("publisher");
        assert!(!publisher.is_tagged());
    }

    #[test]
    fn walking_twice_is_idempotent() {
        let mut graph = graph();
        let tags = TimeCoords::single("period", Timestamp(5));
        let tree = IncludeTree::nested("books", "reviews");
        let walker = AssociationGraphWalker::new(&tags);
        walker.walk(&mut graph, &tree);
        let once = format!("{graph:?}");
        walker.walk(&mut graph, &tree);
        assert_eq!(format!("{graph:?}"), once);
    }

    #[test]
    fn unloaded_branches_are_skipped() {
        let mut graph = graph();
        let tags = TimeCoords::single("period", Timestamp(5));
        AssociationGraphWalker::new(&tags).walk(&mut graph, &IncludeTree::leaf("awards"));
        let books = graph[0].loaded_association("books").expect("books");
        assert!(books.iter().all(|book| !book.is_tagged()));
    }
}
