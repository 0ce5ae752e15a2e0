use crate::collation::Collation;
use crate::field_path::FieldPath;
use crate::sorter::{cmp_value, is_equal};
use crate::variables::{Scope, Variables, CURRENT, ROOT};
use anyhow::{anyhow, bail, ensure, Context, Error};
use bson::{Bson, Document};
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Comparison {
    Cmp,
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Ne,
}

impl Comparison {
    fn from_operator(operator: &str) -> Option<Self> {
        Some(match operator {
            "$cmp" => Self::Cmp,
            "$eq" => Self::Eq,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            "$ne" => Self::Ne,
            _ => return None,
        })
    }

    fn operator(self) -> &'static str {
        match self {
            Self::Cmp => "$cmp",
            Self::Eq => "$eq",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Ne => "$ne",
        }
    }

    fn apply(self, ordering: Ordering) -> Bson {
        match self {
            Self::Cmp => Bson::Int32(match ordering {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            }),
            Self::Eq => Bson::Boolean(ordering.is_eq()),
            Self::Gt => Bson::Boolean(ordering.is_gt()),
            Self::Gte => Bson::Boolean(ordering.is_ge()),
            Self::Lt => Bson::Boolean(ordering.is_lt()),
            Self::Lte => Bson::Boolean(ordering.is_le()),
            Self::Ne => Bson::Boolean(ordering.is_ne()),
        }
    }
}

/// An aggregation expression, as used by `$expr` and `$lookup.let`.
#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    And(Vec<Self>),
    Array(Vec<Self>),
    Compare(Comparison, Box<Self>, Box<Self>),
    In(Box<Self>, Box<Self>),
    Literal(Bson),
    Not(Box<Self>),
    Object(Vec<(String, Self)>),
    Or(Vec<Self>),
    Path(FieldPath),
    Variable(String, Option<FieldPath>),
}

impl Expression {
    pub fn parse(value: &Bson, scope: &Scope) -> Result<Self, Error> {
        match value {
            Bson::String(string) if string.starts_with("$$") => parse_variable(&string[2..], scope),
            Bson::String(string) if string.starts_with('$') => FieldPath::parse(&string[1..])
                .map(Self::Path)
                .with_context(|| format!("invalid field path '{string}'")),
            Bson::Array(values) => values
                .iter()
                .map(|value| Self::parse(value, scope))
                .collect::<Result<_, _>>()
                .map(Self::Array),
            Bson::Document(document) => parse_document(document, scope),
            value => Ok(Self::Literal(value.clone())),
        }
    }

    /// Evaluates against `root`. `None` stands for a missing value.
    pub fn evaluate(&self, root: &Document, variables: &Variables, collation: &Collation) -> Option<Bson> {
        match self {
            Self::And(expressions) => Some(Bson::Boolean(
                expressions
                    .iter()
                    .all(|expression| expression.is_true(root, variables, collation)),
            )),
            Self::Array(expressions) => Some(Bson::Array(
                expressions
                    .iter()
                    .map(|expression| expression.evaluate(root, variables, collation).unwrap_or(Bson::Null))
                    .collect(),
            )),
            Self::Compare(comparison, lhs, rhs) => {
                let lhs = lhs.evaluate(root, variables, collation);
                let rhs = rhs.evaluate(root, variables, collation);
                let ordering = match (&lhs, &rhs) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (Some(lhs), Some(rhs)) => cmp_value(lhs, rhs, collation),
                };
                Some(comparison.apply(ordering))
            }
            Self::In(needle, haystack) => {
                let needle = needle.evaluate(root, variables, collation).unwrap_or(Bson::Null);
                // A non-array haystack is treated as empty.
                let found = match haystack.evaluate(root, variables, collation) {
                    Some(Bson::Array(values)) => values.iter().any(|value| is_equal(value, &needle, collation)),
                    _ => false,
                };
                Some(Bson::Boolean(found))
            }
            Self::Literal(value) => Some(value.clone()),
            Self::Not(expression) => Some(Bson::Boolean(!expression.is_true(root, variables, collation))),
            Self::Object(fields) => Some(Bson::Document(
                fields
                    .iter()
                    .filter_map(|(key, expression)| {
                        let value = expression.evaluate(root, variables, collation)?;
                        Some((key.clone(), value))
                    })
                    .collect(),
            )),
            Self::Or(expressions) => Some(Bson::Boolean(
                expressions
                    .iter()
                    .any(|expression| expression.is_true(root, variables, collation)),
            )),
            Self::Path(path) => traverse_document(root, path.segments()),
            Self::Variable(name, path) => {
                let segments = path.as_ref().map_or(&[][..], FieldPath::segments);
                if name == ROOT || name == CURRENT {
                    return traverse_document(root, segments);
                }

                traverse(variables.get(name)?, segments)
            }
        }
    }

    pub fn is_true(&self, root: &Document, variables: &Variables, collation: &Collation) -> bool {
        match self.evaluate(root, variables, collation) {
            None | Some(Bson::Null | Bson::Undefined | Bson::Boolean(false)) => false,
            Some(Bson::Int32(value)) => value != 0,
            Some(Bson::Int64(value)) => value != 0,
            Some(Bson::Double(value)) => value != 0.0,
            Some(_) => true,
        }
    }

    pub fn to_bson(&self) -> Bson {
        fn operator(name: &str, arguments: Vec<Bson>) -> Bson {
            let mut document = Document::new();
            document.insert(name, arguments);
            Bson::Document(document)
        }

        match self {
            Self::And(expressions) => operator("$and", expressions.iter().map(Self::to_bson).collect()),
            Self::Array(expressions) => Bson::Array(expressions.iter().map(Self::to_bson).collect()),
            Self::Compare(comparison, lhs, rhs) => {
                operator(comparison.operator(), vec![lhs.to_bson(), rhs.to_bson()])
            }
            Self::In(needle, haystack) => operator("$in", vec![needle.to_bson(), haystack.to_bson()]),
            Self::Literal(value) => match value {
                Bson::Array(_) | Bson::Document(_) => literal(value),
                Bson::String(string) if string.starts_with('$') => literal(value),
                value => value.clone(),
            },
            Self::Not(expression) => operator("$not", vec![expression.to_bson()]),
            Self::Object(fields) => Bson::Document(
                fields
                    .iter()
                    .map(|(key, expression)| (key.clone(), expression.to_bson()))
                    .collect(),
            ),
            Self::Or(expressions) => operator("$or", expressions.iter().map(Self::to_bson).collect()),
            Self::Path(path) => Bson::String(format!("${path}")),
            Self::Variable(name, None) => Bson::String(format!("$${name}")),
            Self::Variable(name, Some(path)) => Bson::String(format!("$${name}.{path}")),
        }
    }
}

fn literal(value: &Bson) -> Bson {
    let mut document = Document::new();
    document.insert("$literal", value.clone());
    Bson::Document(document)
}

fn parse_variable(reference: &str, scope: &Scope) -> Result<Expression, Error> {
    let (name, path) = match reference.split_once('.') {
        Some((name, path)) => (name, Some(FieldPath::parse(path)?)),
        None => (reference, None),
    };

    ensure!(scope.is_defined(name), "Use of undefined variable: {name}");
    Ok(Expression::Variable(name.to_owned(), path))
}

fn parse_document(document: &Document, scope: &Scope) -> Result<Expression, Error> {
    let Some((operator, arguments)) = document.iter().next() else {
        return Ok(Expression::Object(vec![]));
    };

    if !operator.starts_with('$') {
        return document
            .iter()
            .map(|(key, value)| {
                ensure!(
                    !key.starts_with('$'),
                    "field path references must be prefixed with a '$' ('{key}' in {document})"
                );
                Ok((key.clone(), Expression::parse(value, scope)?))
            })
            .collect::<Result<_, _>>()
            .map(Expression::Object);
    }

    ensure!(
        document.len() == 1,
        "an expression specification must contain exactly one field, the name of the expression. Found {} fields in {document}",
        document.len()
    );

    if let Some(comparison) = Comparison::from_operator(operator) {
        let [lhs, rhs] = arity(operator, arguments, scope)?;
        return Ok(Expression::Compare(comparison, Box::new(lhs), Box::new(rhs)));
    }

    Ok(match operator.as_str() {
        "$and" => Expression::And(parse_arguments(arguments, scope)?),
        "$in" => {
            let [needle, haystack] = arity(operator, arguments, scope)?;
            Expression::In(Box::new(needle), Box::new(haystack))
        }
        "$literal" => Expression::Literal(arguments.clone()),
        "$not" => {
            let [expression] = arity(operator, arguments, scope)?;
            Expression::Not(Box::new(expression))
        }
        "$or" => Expression::Or(parse_arguments(arguments, scope)?),
        operator => bail!("Unrecognized expression '{operator}'"),
    })
}

fn parse_arguments(arguments: &Bson, scope: &Scope) -> Result<Vec<Expression>, Error> {
    match arguments {
        Bson::Array(arguments) => arguments
            .iter()
            .map(|argument| Expression::parse(argument, scope))
            .collect(),
        argument => Ok(vec![Expression::parse(argument, scope)?]),
    }
}

fn arity<const N: usize>(operator: &str, arguments: &Bson, scope: &Scope) -> Result<[Expression; N], Error> {
    parse_arguments(arguments, scope)?
        .try_into()
        .map_err(|arguments: Vec<Expression>| {
            anyhow!(
                "Expression {operator} takes exactly {N} arguments. {} were passed in.",
                arguments.len()
            )
        })
}

fn traverse_document(document: &Document, segments: &[String]) -> Option<Bson> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(Bson::Document(document.clone()));
    };

    traverse(document.get(head)?, rest)
}

// Field paths through arrays produce arrays of the values found in each
// element, skipping elements where the field is missing.
fn traverse(value: &Bson, segments: &[String]) -> Option<Bson> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };

    match value {
        Bson::Document(document) => traverse(document.get(head)?, rest),
        Bson::Array(values) => Some(Bson::Array(
            values
                .iter()
                .filter(|value| matches!(value, Bson::Array(_) | Bson::Document(_)))
                .filter_map(|value| traverse(value, segments))
                .collect(),
        )),
        _ => None,
    }
}
