use crate::collation::Collation;
use crate::expression::Expression;
use crate::field_path::{resolve_flat, set, FieldPath};
use crate::matcher::{Matcher, Predicate};
use crate::pipeline::{ExpressionContext, Pipeline, Stage};
use crate::source::{DocumentSource, DocumentStream};
use crate::unwind::Unwind;
use crate::variables::Variables;
use anyhow::{bail, ensure, Context, Error};
use bson::{doc, Bson, Document};
use tracing::debug;

/// A compiled `$lookup`, possibly with a following `$unwind` and `$match`
/// absorbed into it.
#[derive(Debug)]
pub struct Lookup {
    from: String,
    as_field: FieldPath,
    join: Option<(FieldPath, FieldPath)>,
    bindings: Vec<(String, Expression)>,
    pipeline: Option<Pipeline>,
    collation: Option<Collation>,
    effective_collation: Collation,
    unwinding: Option<Unwind>,
    matching: Option<Matcher>,
    fused: Vec<Document>,
}

impl Lookup {
    pub fn compile(spec: &Bson, context: &ExpressionContext) -> Result<Self, Error> {
        let Bson::Document(spec) = spec else {
            bail!("the $lookup stage specification must be an object, but found {spec}");
        };

        let mut from = None;
        let mut as_field = None;
        let mut local_field = None;
        let mut foreign_field = None;
        let mut bindings_spec = None;
        let mut pipeline_spec = None;
        let mut collation = None;
        for (key, value) in spec {
            match (key.as_str(), value) {
                ("from", Bson::String(value)) => {
                    ensure!(!value.is_empty(), "invalid $lookup namespace: '{value}'");
                    from = Some(value.clone());
                }
                ("as", Bson::String(value)) => {
                    as_field = Some(FieldPath::parse(value).context("invalid 'as' field for $lookup")?);
                }
                ("localField", Bson::String(value)) => {
                    local_field = Some(FieldPath::parse(value).context("invalid 'localField' for $lookup")?);
                }
                ("foreignField", Bson::String(value)) => {
                    foreign_field = Some(FieldPath::parse(value).context("invalid 'foreignField' for $lookup")?);
                }
                ("let", Bson::Document(value)) => bindings_spec = Some(value),
                ("pipeline", Bson::Array(value)) => pipeline_spec = Some(value),
                ("collation", Bson::Document(value)) => {
                    collation = Some(Collation::parse(value).context("invalid collation for $lookup")?);
                }
                (key @ ("from" | "as" | "localField" | "foreignField"), value) => {
                    bail!("$lookup argument '{key}' must be a string, found {value}")
                }
                (key @ ("let" | "collation"), value) => {
                    bail!("$lookup argument '{key}' must be an object, found {value}")
                }
                ("pipeline", value) => bail!("$lookup argument 'pipeline' must be an array, found {value}"),
                (key, _) => bail!("unknown argument to $lookup: {key}"),
            }
        }

        let Some(from) = from else {
            bail!("missing 'from' option to $lookup stage specification: {spec}");
        };

        let Some(as_field) = as_field else {
            bail!("must specify 'as' field for a $lookup");
        };

        let join = match (local_field, foreign_field) {
            (Some(local_field), Some(foreign_field)) => Some((local_field, foreign_field)),
            (None, None) => None,
            _ => bail!("$lookup requires both or neither of 'localField' and 'foreignField' to be specified"),
        };

        ensure!(
            join.is_some() || pipeline_spec.is_some(),
            "$lookup requires either 'pipeline' or both 'localField' and 'foreignField' to be specified"
        );
        ensure!(
            bindings_spec.is_none() || pipeline_spec.is_some(),
            "$lookup with 'let' must also specify 'pipeline'"
        );

        // `let` expressions see the outer scope, the sub-pipeline sees both.
        let mut scope = context.scope().clone();
        let mut bindings = vec![];
        for (name, expression) in bindings_spec.into_iter().flatten() {
            bindings.push((name.clone(), Expression::parse(expression, context.scope())?));
            scope.define(name)?;
        }

        let effective_collation = context.collation(collation.as_ref());
        let pipeline = pipeline_spec
            .map(|stages| {
                let stages = Pipeline::parse(stages)?;
                Pipeline::compile(&stages, &context.nested(effective_collation.clone(), scope))
                    .context("invalid $lookup pipeline")
            })
            .transpose()?;

        debug!(%from, as_field = %as_field, ?effective_collation, "compiled $lookup");

        Ok(Self {
            from,
            as_field,
            join,
            bindings,
            pipeline,
            collation,
            effective_collation,
            unwinding: None,
            matching: None,
            fused: vec![],
        })
    }

    /// Stages absorbed by the optimizer, in their original form.
    pub fn fused_stages(&self) -> &[Document] {
        &self.fused
    }

    pub fn can_fuse(&self, stage: &Stage) -> bool {
        match stage {
            Stage::Unwind(unwind) => self.unwinding.is_none() && *unwind.path() == self.as_field,
            Stage::Match { matcher, collation } => {
                self.unwinding.as_ref().is_some_and(|unwind| {
                    !unwind.preserves_null_and_empty_arrays() && !unwind.includes_array_index()
                }) && *collation == self.effective_collation
                    && matcher.strip_prefix(&self.as_field).is_some()
            }
            _ => false,
        }
    }

    /// Takes `stage` over if it can be fused, otherwise hands it back.
    pub fn absorb(&mut self, stage: Stage) -> Option<Stage> {
        if !self.can_fuse(&stage) {
            if let Stage::Match { collation, .. } = &stage {
                debug!(
                    from = %self.from,
                    ?collation,
                    effective_collation = ?self.effective_collation,
                    "$match stays separate from $lookup"
                );
            }

            return Some(stage);
        }

        debug!(from = %self.from, stage = stage.name(), "absorbed into $lookup");
        self.fused.push(stage.to_document());
        match stage {
            Stage::Unwind(unwind) => self.unwinding = Some(unwind),
            Stage::Match { matcher, .. } => {
                let mut clauses: Vec<Matcher> = self.matching.take().into_iter().collect();
                clauses.extend(matcher.strip_prefix(&self.as_field));
                self.matching = Some(if clauses.len() == 1 {
                    clauses.swap_remove(0)
                } else {
                    Matcher::And(clauses)
                });
            }
            _ => {}
        }

        None
    }

    /// Augments `document` with its matches, then unwinds them if an
    /// `$unwind` was absorbed.
    pub fn process(&self, mut document: Document, source: &dyn DocumentSource, variables: &Variables) -> Vec<Document> {
        let matches = self.lookup(&document, source, variables);
        set(
            &mut document,
            &self.as_field,
            Bson::Array(matches.into_iter().map(Bson::Document).collect()),
        );

        let Some(unwind) = &self.unwinding else {
            return vec![document];
        };

        unwind.apply(document)
    }

    /// Foreign documents matching `document`, in natural order.
    pub fn lookup(&self, document: &Document, source: &dyn DocumentSource, variables: &Variables) -> Vec<Document> {
        let collation = &self.effective_collation;

        let mut bindings = variables.clone();
        for (name, expression) in &self.bindings {
            bindings.unbind(name);
            if let Some(value) = expression.evaluate(document, variables, collation) {
                bindings.bind(name.clone(), value);
            }
        }

        let mut foreign: DocumentStream<'_> = match &self.join {
            Some((local_field, foreign_field)) => {
                let mut values: Vec<Bson> = resolve_flat(document, local_field).into_iter().cloned().collect();
                if values.is_empty() {
                    values.push(Bson::Null);
                }

                // A regex on the local side only equals the same regex.
                let matcher = Matcher::Or(
                    values
                        .into_iter()
                        .map(|value| Matcher::Field(foreign_field.clone(), Predicate::Eq(value)))
                        .collect(),
                );
                source.scan_matching(
                    &self.from,
                    Box::new(move |foreign: &Document| matcher.matches(foreign, variables, collation)),
                )
            }
            None => source.scan(&self.from),
        };

        if let Some(pipeline) = &self.pipeline {
            foreign = pipeline.process(foreign, source, &bindings);
        }

        if let Some(matcher) = &self.matching {
            foreign = Box::new(foreign.filter(move |foreign| matcher.matches(foreign, variables, collation)));
        }

        foreign.collect()
    }

    pub fn to_document(&self) -> Document {
        let mut document = doc! { "from": self.from.clone(), "as": self.as_field.to_string() };
        if let Some((local_field, foreign_field)) = &self.join {
            document.insert("localField", local_field.to_string());
            document.insert("foreignField", foreign_field.to_string());
        }

        if !self.bindings.is_empty() {
            let bindings: Document = self
                .bindings
                .iter()
                .map(|(name, expression)| (name.clone(), expression.to_bson()))
                .collect();
            document.insert("let", bindings);
        }

        if let Some(pipeline) = &self.pipeline {
            document.insert("pipeline", pipeline.explain());
        }

        if let Some(collation) = &self.collation {
            document.insert("collation", collation.to_document());
        }

        if let Some(unwind) = &self.unwinding {
            document.insert("unwinding", unwind.options_document());
        }

        if let Some(matcher) = &self.matching {
            document.insert("matching", matcher.to_document());
        }

        document
    }
}
