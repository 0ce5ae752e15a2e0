use crate::collation::{self, Collation};
use crate::lookup::Lookup;
use crate::matcher::Matcher;
use crate::projector::Projector;
use crate::sorter::Sorter;
use crate::source::{DocumentSource, DocumentStream};
use crate::unwind::Unwind;
use crate::variables::{Scope, Variables};
use anyhow::{bail, ensure, Context, Error};
use bson::{Bson, Document};
use std::collections::BTreeSet;
use std::iter;
use tracing::debug;

/// Everything a stage needs to know about where it is compiled.
#[derive(Clone, Debug)]
pub struct ExpressionContext {
    collection_default: Option<Collation>,
    command: Option<Collation>,
    scope: Scope,
    optimize: bool,
}

impl ExpressionContext {
    pub fn new(collection_default: Option<Collation>, command: Option<Collation>) -> Self {
        Self {
            collection_default,
            command,
            scope: Scope::default(),
            optimize: true,
        }
    }

    /// Context of an aggregation run against `collection`, with an optional
    /// command-level collation.
    pub fn for_collection(
        source: &dyn DocumentSource,
        collection: &str,
        command: Option<&Document>,
    ) -> Result<Self, Error> {
        let command = command
            .map(Collation::parse)
            .transpose()
            .context("invalid collation option of the aggregate command")?;

        Ok(Self::new(source.default_collation(collection), command))
    }

    #[must_use]
    pub fn with_optimization(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn collation(&self, stage: Option<&Collation>) -> Collation {
        collation::resolve(self.collection_default.as_ref(), self.command.as_ref(), stage)
    }

    /// Context of a `$lookup` sub-pipeline: the lookup's collation takes
    /// the place of the command-level one.
    pub fn nested(&self, collation: Collation, scope: Scope) -> Self {
        Self {
            collection_default: self.collection_default.clone(),
            command: Some(collation),
            scope,
            optimize: self.optimize,
        }
    }
}

#[derive(Debug)]
pub enum Stage {
    Lookup(Box<Lookup>),
    Match { matcher: Matcher, collation: Collation },
    Project(Projector),
    Sort { sorter: Sorter, collation: Collation },
    Unset(Projector),
    Unwind(Unwind),
}

impl Stage {
    pub fn compile(spec: &Document, context: &ExpressionContext) -> Result<Self, Error> {
        ensure!(
            spec.len() == 1,
            "A pipeline stage specification object must contain exactly one field, found {spec}"
        );

        let Some((name, value)) = spec.iter().next() else {
            bail!("A pipeline stage specification object must contain exactly one field");
        };

        let stage = match name.as_str() {
            "$lookup" => Self::Lookup(Box::new(Lookup::compile(value, context)?)),
            "$match" => {
                let Bson::Document(filter) = value else {
                    bail!("the match filter must be an expression in an object, found {value}");
                };

                Self::Match {
                    matcher: Matcher::compile(filter, context.scope())?,
                    collation: context.collation(None),
                }
            }
            "$project" => Self::Project(Projector::compile(value)?),
            "$sort" => Self::Sort {
                sorter: Sorter::compile(value)?,
                collation: context.collation(None),
            },
            "$unset" => Self::Unset(Projector::compile_unset(value)?),
            "$unwind" => Self::Unwind(Unwind::compile(value)?),
            name => bail!("Unrecognized pipeline stage name: '{name}'"),
        };

        Ok(stage)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Lookup(_) => "$lookup",
            Self::Match { .. } => "$match",
            Self::Project(_) => "$project",
            Self::Sort { .. } => "$sort",
            Self::Unset(_) => "$unset",
            Self::Unwind(_) => "$unwind",
        }
    }

    /// Lazily transforms `input`. Nothing is read before the returned stream
    /// is polled.
    pub fn process<'a>(
        &'a self,
        input: DocumentStream<'a>,
        source: &'a dyn DocumentSource,
        variables: &'a Variables,
    ) -> DocumentStream<'a> {
        match self {
            Self::Lookup(lookup) => Box::new(input.flat_map(move |document| lookup.process(document, source, variables))),
            Self::Match { matcher, collation } => {
                Box::new(input.filter(move |document| matcher.matches(document, variables, collation)))
            }
            Self::Project(projector) | Self::Unset(projector) => {
                Box::new(input.map(move |document| projector.apply(document)))
            }
            Self::Sort { sorter, collation } => {
                let mut input = Some(input);
                Box::new(iter::from_fn(move || input.take()).flat_map(move |input| {
                    let mut documents: Vec<Document> = input.collect();
                    sorter.sort(&mut documents, collation);
                    documents
                }))
            }
            Self::Unwind(unwind) => Box::new(input.flat_map(move |document| unwind.apply(document))),
        }
    }

    pub fn to_document(&self) -> Document {
        let value = match self {
            Self::Lookup(lookup) => Bson::Document(lookup.to_document()),
            Self::Match { matcher, .. } => Bson::Document(matcher.to_document()),
            Self::Project(projector) => Bson::Document(projector.to_document()),
            Self::Sort { sorter, .. } => Bson::Document(sorter.to_document()),
            Self::Unset(projector) => projector
                .paths()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .into(),
            Self::Unwind(unwind) => Bson::Document(unwind.to_document()),
        };

        let mut document = Document::new();
        document.insert(self.name(), value);
        document
    }
}

#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Checks that every stage is a document.
    pub fn parse(stages: &[Bson]) -> Result<Vec<Document>, Error> {
        stages
            .iter()
            .map(|stage| match stage {
                Bson::Document(stage) => Ok(stage.clone()),
                stage => bail!("each element of the pipeline must be an object, found {stage}"),
            })
            .collect()
    }

    pub fn compile(stages: &[Document], context: &ExpressionContext) -> Result<Self, Error> {
        let stages = stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                Stage::compile(stage, context).with_context(|| format!("invalid stage #{index}: {stage}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            stages: if context.optimize { optimize(stages) } else { stages },
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn process<'a>(
        &'a self,
        input: DocumentStream<'a>,
        source: &'a dyn DocumentSource,
        variables: &'a Variables,
    ) -> DocumentStream<'a> {
        self.stages
            .iter()
            .fold(input, |stream, stage| stage.process(stream, source, variables))
    }

    pub fn execute<'a>(
        &'a self,
        collection: &str,
        source: &'a dyn DocumentSource,
        variables: &'a Variables,
    ) -> DocumentStream<'a> {
        self.process(source.scan(collection), source, variables)
    }

    pub fn explain(&self) -> Vec<Document> {
        self.stages.iter().map(Stage::to_document).collect()
    }
}

// Folds stages into a preceding `$lookup` wherever it accepts them.
fn optimize(stages: Vec<Stage>) -> Vec<Stage> {
    let mut optimized: Vec<Stage> = Vec::with_capacity(stages.len());
    for stage in stages {
        let stage = match optimized.last_mut() {
            Some(Stage::Lookup(lookup)) => lookup.absorb(stage),
            _ => Some(stage),
        };

        optimized.extend(stage);
    }

    debug!(stages = optimized.len(), "optimized pipeline");
    optimized
}

/// Runs `stages` against `collection`, optionally with a command-level
/// collation.
#[cfg(test)]
pub fn aggregate(
    source: &dyn DocumentSource,
    collection: &str,
    stages: &[Document],
    collation: Option<&Document>,
) -> Result<Vec<Document>, Error> {
    let context = ExpressionContext::for_collection(source, collection, collation)?;
    let pipeline = Pipeline::compile(stages, &context)?;
    let variables = Variables::default();
    let documents = pipeline.execute(collection, source, &variables).collect();
    Ok(documents)
}

/// Names of every collection `stages` read from through `$lookup`, nested
/// sub-pipelines included.
pub fn referenced_collections(stages: &[Document]) -> BTreeSet<String> {
    fn visit(stages: &[Document], names: &mut BTreeSet<String>) {
        for lookup in stages.iter().filter_map(|stage| stage.get_document("$lookup").ok()) {
            if let Ok(from) = lookup.get_str("from") {
                names.insert(from.to_owned());
            }

            if let Ok(pipeline) = lookup.get_array("pipeline") {
                if let Ok(pipeline) = Pipeline::parse(pipeline) {
                    visit(&pipeline, names);
                }
            }
        }
    }

    let mut names = BTreeSet::new();
    visit(stages, &mut names);
    names
}

#[cfg(test)]
mod tests {
    use super::{aggregate, referenced_collections, ExpressionContext, Pipeline, Stage};
    use crate::catalog::Catalog;
    use crate::collation::Collation;
    use crate::logging;
    use crate::variables::Variables;
    use bson::{doc, Document};

    fn case_insensitive() -> Document {
        doc! {"locale": "en_US", "strength": 1}
    }

    fn catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog.insert("local", ["a", "b", "c", "d", "e"].map(|id| doc! {"_id": id}));
        catalog.insert("foreign", ["a", "B", "c", "D", "e"].map(|id| doc! {"_id": id}));
        catalog
    }

    fn optimization_pipeline() -> Vec<Document> {
        vec![
            doc! {"$lookup": {
                "from": "foreign",
                "as": "foreignMatch",
                "let": {"l_id": "$_id"},
                "pipeline": [{"$match": {"$expr": {"$eq": ["$_id", "$$l_id"]}}}],
                "collation": case_insensitive(),
            }},
            doc! {"$unwind": "$foreignMatch"},
            doc! {"$match": {"foreignMatch._id": "b"}},
        ]
    }

    fn explain(stages: &[Document], collation: Option<&Document>) -> Vec<Document> {
        let context = ExpressionContext::for_collection(&catalog(), "local", collation).unwrap();
        Pipeline::compile(stages, &context).unwrap().explain()
    }

    #[test]
    fn match_with_other_collation_stays_separate() {
        logging::init_for_tests();
        let stages = optimization_pipeline();

        let results = aggregate(&catalog(), "local", &stages, None).unwrap();
        assert_eq!(results, Vec::<Document>::new());

        let explain = explain(&stages, None);
        assert_eq!(explain.len(), 2);
        assert_eq!(explain.last(), Some(&doc! {"$match": {"foreignMatch._id": {"$eq": "b"}}}));
        assert_eq!(
            explain[0].get_document("$lookup").unwrap().get_document("unwinding").unwrap(),
            &doc! {"preserveNullAndEmptyArrays": false}
        );
    }

    #[test]
    fn match_with_same_collation_is_fused() {
        logging::init_for_tests();
        let stages = optimization_pipeline();
        let collation = case_insensitive();

        let results = aggregate(&catalog(), "local", &stages, Some(&collation)).unwrap();
        assert_eq!(results, vec![doc! {"_id": "b", "foreignMatch": {"_id": "B"}}]);

        let explain = explain(&stages, Some(&collation));
        assert_eq!(explain.len(), 1);
        let lookup = explain[0].get_document("$lookup").unwrap();
        assert_eq!(lookup.get_document("matching").unwrap(), &doc! {"_id": {"$eq": "b"}});
    }

    #[test]
    fn fused_and_unfused_agree() {
        logging::init_for_tests();
        let mut catalog = catalog();
        catalog.insert("local", [doc! {"_id": "f", "tags": ["x", "Y"]}, doc! {"_id": "g"}]);
        catalog.insert("foreign", [doc! {"_id": "b", "tag": "y"}, doc! {"_id": "F", "tag": "X"}]);

        let pipelines = [
            optimization_pipeline(),
            vec![
                doc! {"$lookup": {"from": "foreign", "as": "m", "localField": "_id", "foreignField": "_id"}},
                doc! {"$unwind": {"path": "$m"}},
                doc! {"$match": {"m._id": {"$in": ["b", "B", "F"]}}},
                doc! {"$match": {"$or": [{"m.tag": {"$exists": false}}, {"m.tag": "X"}]}},
            ],
            vec![
                doc! {"$lookup": {"from": "foreign", "as": "m", "localField": "_id", "foreignField": "_id"}},
                doc! {"$unwind": {"path": "$m", "preserveNullAndEmptyArrays": true}},
                doc! {"$match": {"m._id": {"$gte": "b"}}},
            ],
            vec![
                doc! {"$lookup": {"from": "foreign", "as": "m", "pipeline": [{"$match": {"tag": {"$exists": true}}}]}},
                doc! {"$unwind": "$m"},
                doc! {"$match": {"m.tag": {"$gt": "x"}}},
                doc! {"$unset": ["m.tag"]},
                doc! {"$sort": {"_id": -1, "m._id": 1}},
            ],
        ];

        for stages in &pipelines {
            for collation in [None, Some(case_insensitive()), Some(doc! {"locale": "simple"})] {
                let context = ExpressionContext::for_collection(&catalog, "local", collation.as_ref()).unwrap();
                let optimized = Pipeline::compile(stages, &context).unwrap();
                let unoptimized = Pipeline::compile(stages, &context.clone().with_optimization(false)).unwrap();
                assert_eq!(unoptimized.stages().len(), stages.len());

                let variables = Variables::default();
                let lhs: Vec<Document> = optimized.execute("local", &catalog, &variables).collect();
                let rhs: Vec<Document> = unoptimized.execute("local", &catalog, &variables).collect();
                assert_eq!(lhs, rhs, "{stages:?} with {collation:?}");
            }
        }
    }

    #[test]
    fn unwind_of_other_path_is_not_fused() {
        let stages = vec![
            doc! {"$lookup": {"from": "foreign", "as": "m", "localField": "_id", "foreignField": "_id"}},
            doc! {"$unwind": "$m.x"},
            doc! {"$unwind": "$m"},
        ];

        let explain = explain(&stages, None);
        assert_eq!(explain.len(), 3);
        assert!(explain[0].get_document("$lookup").unwrap().get("unwinding").is_none());
    }

    #[test]
    fn match_without_unwind_is_not_fused() {
        let stages = vec![
            doc! {"$lookup": {"from": "foreign", "as": "m", "localField": "_id", "foreignField": "_id"}},
            doc! {"$match": {"m._id": "a"}},
        ];

        assert_eq!(explain(&stages, None).len(), 2);
    }

    #[test]
    fn match_outside_of_as_is_not_fused() {
        let stages = vec![
            doc! {"$lookup": {"from": "foreign", "as": "m", "localField": "_id", "foreignField": "_id"}},
            doc! {"$unwind": "$m"},
            doc! {"$match": {"m._id": "a", "_id": "a"}},
            doc! {"$match": {"$expr": {"$eq": ["$m._id", "a"]}}},
        ];

        let explain = explain(&stages, None);
        assert_eq!(explain.len(), 3);
        assert_eq!(explain[1], doc! {"$match": {"$and": [{"m._id": {"$eq": "a"}}, {"_id": {"$eq": "a"}}]}});
    }

    #[test]
    fn collection_default_governs_match() {
        let mut catalog = catalog();
        catalog.create_collection("local", Some(Collation::parse(&case_insensitive()).unwrap()));

        let stages = [doc! {"$match": {"_id": "B"}}];
        let results = aggregate(&catalog, "local", &stages, None).unwrap();
        assert_eq!(results, vec![doc! {"_id": "b"}]);

        let simple = doc! {"locale": "simple"};
        let results = aggregate(&catalog, "local", &stages, Some(&simple)).unwrap();
        assert_eq!(results, Vec::<Document>::new());
    }

    #[test]
    fn unset_stage() {
        let mut catalog = Catalog::default();
        catalog.insert(
            "coll",
            [
                doc! {"_id": 2, "a": [{"b": 50, "c": 60}]},
                doc! {"_id": 0, "a": 10},
                doc! {"_id": 1, "a": {"b": 20, "c": 30, "0": 40}},
            ],
        );

        let run = |stages: &[Document]| aggregate(&catalog, "coll", stages, None).unwrap();

        assert_eq!(
            run(&[doc! {"$sort": {"_id": 1}}, doc! {"$unset": ["a"]}]),
            vec![doc! {"_id": 0}, doc! {"_id": 1}, doc! {"_id": 2}]
        );
        assert_eq!(
            run(&[doc! {"$sort": {"_id": 1}}, doc! {"$unset": ["_id", "a"]}]),
            vec![doc! {}, doc! {}, doc! {}]
        );
        assert_eq!(
            run(&[doc! {"$sort": {"_id": 1}}, doc! {"$unset": ["a.b"]}]),
            vec![
                doc! {"_id": 0, "a": 10},
                doc! {"_id": 1, "a": {"c": 30, "0": 40}},
                doc! {"_id": 2, "a": [{"c": 60}]},
            ]
        );
        assert_eq!(
            run(&[doc! {"$sort": {"_id": 1}}, doc! {"$unset": ["a.0"]}]),
            vec![
                doc! {"_id": 0, "a": 10},
                doc! {"_id": 1, "a": {"b": 20, "c": 30}},
                doc! {"_id": 2, "a": [{"b": 50, "c": 60}]},
            ]
        );
    }

    #[test]
    fn project_stage() {
        let mut catalog = Catalog::default();
        catalog.insert("coll", [doc! {"_id": 1, "a": {"b": 1, "c": 2}, "d": 3}]);

        let results = aggregate(&catalog, "coll", &[doc! {"$project": {"a.b": 1}}], None).unwrap();
        assert_eq!(results, vec![doc! {"_id": 1, "a": {"b": 1}}]);
    }

    #[test]
    fn explain_lists_every_stage() {
        let stages = vec![
            doc! {"$match": {"_id": {"$in": ["a", "b"]}}},
            doc! {"$sort": {"_id": -1}},
            doc! {"$project": {"_id": 1}},
            doc! {"$unset": ["x", "y.z"]},
            doc! {"$unwind": {"path": "$y", "includeArrayIndex": "i"}},
        ];

        assert_eq!(
            explain(&stages, None),
            vec![
                doc! {"$match": {"_id": {"$in": ["a", "b"]}}},
                doc! {"$sort": {"_id": -1}},
                doc! {"$project": {"_id": true}},
                doc! {"$unset": ["x", "y.z"]},
                doc! {"$unwind": {"path": "$y", "preserveNullAndEmptyArrays": false, "includeArrayIndex": "i"}},
            ]
        );
    }

    #[test]
    fn invalid_pipelines() {
        let context = ExpressionContext::new(None, None);
        for stages in [
            vec![doc! {"$group": {"_id": null}}],
            vec![doc! {"$match": {"a": 1}, "$sort": {"a": 1}}],
            vec![doc! {}],
            vec![doc! {"$match": 1}],
            vec![doc! {"$unset": "a"}],
            vec![doc! {"$lookup": {"from": "foreign", "as": "m"}}],
        ] {
            assert!(Pipeline::compile(&stages, &context).is_err(), "{stages:?} should be rejected");
        }

        assert!(ExpressionContext::for_collection(&catalog(), "local", Some(&doc! {"strength": 1})).is_err());
    }

    #[test]
    fn sort_is_lazy() {
        let catalog = catalog();
        let context = ExpressionContext::new(None, None);
        let pipeline = Pipeline::compile(&[doc! {"$sort": {"_id": -1}}], &context).unwrap();
        let variables = Variables::default();

        let mut stream = pipeline.execute("local", &catalog, &variables);
        assert_eq!(stream.next(), Some(doc! {"_id": "e"}));
        assert_eq!(stream.count(), 4);
        assert!(matches!(pipeline.stages()[0], Stage::Sort { .. }));
    }

    #[test]
    fn collections_are_collected_recursively() {
        let stages = vec![
            doc! {"$lookup": {"from": "a", "as": "x", "pipeline": [
                {"$lookup": {"from": "b", "as": "y", "localField": "k", "foreignField": "k"}},
            ]}},
            doc! {"$match": {"from": "c"}},
            doc! {"$lookup": {"from": "a", "as": "z", "localField": "k", "foreignField": "k"}},
        ];

        let names: Vec<String> = referenced_collections(&stages).into_iter().collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
