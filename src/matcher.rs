use crate::collation::Collation;
use crate::expression::Expression;
use crate::field_path::{resolve, FieldPath};
use crate::sorter::{cmp_value_partial, is_equal};
use crate::variables::{Scope, Variables};
use anyhow::{bail, ensure, Context, Error};
use bson::{Bson, Document};
use regex::Regex;
use std::cmp::Ordering;

/// A compiled `$match` filter.
#[derive(Clone, Debug)]
pub enum Matcher {
    And(Vec<Self>),
    Expr(Expression),
    Field(FieldPath, Predicate),
    Nor(Vec<Self>),
    Or(Vec<Self>),
}

#[derive(Clone, Debug)]
pub enum Predicate {
    Eq(Bson),
    Exists(bool),
    Gt(Bson),
    Gte(Bson),
    In(Vec<Bson>),
    Lt(Bson),
    Lte(Bson),
    Ne(Bson),
    Nin(Vec<Bson>),
    Not(Vec<Self>),
    Regex(CompiledRegex),
}

#[derive(Clone, Debug)]
pub struct CompiledRegex {
    regex: Regex,
    pattern: String,
    options: String,
}

impl Matcher {
    pub fn compile(filter: &Document, scope: &Scope) -> Result<Self, Error> {
        let mut clauses = vec![];
        for (key, value) in filter {
            match key.as_str() {
                operator @ ("$and" | "$nor" | "$or") => {
                    let Bson::Array(filters) = value else {
                        bail!("{operator} must be an array");
                    };
                    ensure!(!filters.is_empty(), "{operator} argument must be a non-empty array");

                    let filters = filters
                        .iter()
                        .map(|filter| match filter {
                            Bson::Document(filter) => Self::compile(filter, scope),
                            filter => bail!("{operator} argument's entries must be objects, found {filter}"),
                        })
                        .collect::<Result<_, Error>>()?;

                    clauses.push(match operator {
                        "$and" => Self::And(filters),
                        "$nor" => Self::Nor(filters),
                        _ => Self::Or(filters),
                    });
                }
                "$expr" => clauses.push(Self::Expr(Expression::parse(value, scope)?)),
                key if key.starts_with('$') => bail!("unknown top level operator: {key}"),
                key => {
                    let path = FieldPath::parse(key)?;
                    for predicate in compile_predicates(value)? {
                        clauses.push(Self::Field(path.clone(), predicate));
                    }
                }
            }
        }

        Ok(if clauses.len() == 1 {
            clauses.swap_remove(0)
        } else {
            Self::And(clauses)
        })
    }

    pub fn matches(&self, document: &Document, variables: &Variables, collation: &Collation) -> bool {
        match self {
            Self::And(matchers) => matchers
                .iter()
                .all(|matcher| matcher.matches(document, variables, collation)),
            Self::Expr(expression) => expression.is_true(document, variables, collation),
            Self::Field(path, predicate) => predicate.matches(&resolve(document, path), collation),
            Self::Nor(matchers) => !matchers
                .iter()
                .any(|matcher| matcher.matches(document, variables, collation)),
            Self::Or(matchers) => matchers
                .iter()
                .any(|matcher| matcher.matches(document, variables, collation)),
        }
    }

    /// Rewrites the filter relative to `prefix`. Fails if any part of it
    /// looks outside of `prefix` or uses `$expr`.
    pub fn strip_prefix(&self, prefix: &FieldPath) -> Option<Self> {
        let strip_all = |matchers: &[Self]| {
            matchers
                .iter()
                .map(|matcher| matcher.strip_prefix(prefix))
                .collect::<Option<Vec<_>>>()
        };

        Some(match self {
            Self::And(matchers) => Self::And(strip_all(matchers)?),
            Self::Expr(_) => return None,
            Self::Field(path, predicate) => Self::Field(path.strip_prefix(prefix)?, predicate.clone()),
            Self::Nor(matchers) => Self::Nor(strip_all(matchers)?),
            Self::Or(matchers) => Self::Or(strip_all(matchers)?),
        })
    }

    /// Normalized form: implicit equalities become `$eq` and multiple clauses
    /// are wrapped in `$and`.
    pub fn to_document(&self) -> Document {
        let list = |matchers: &[Self]| -> Vec<Bson> {
            matchers
                .iter()
                .map(|matcher| Bson::Document(matcher.to_document()))
                .collect()
        };

        let mut document = Document::new();
        match self {
            Self::And(matchers) if matchers.len() == 1 => return matchers[0].to_document(),
            Self::And(matchers) if !matchers.is_empty() => {
                document.insert("$and", list(matchers));
            }
            Self::And(_) => {}
            Self::Expr(expression) => {
                document.insert("$expr", expression.to_bson());
            }
            Self::Field(path, predicate) => {
                document.insert(path.to_string(), predicate.to_document());
            }
            Self::Nor(matchers) => {
                document.insert("$nor", list(matchers));
            }
            Self::Or(matchers) => {
                document.insert("$or", list(matchers));
            }
        }

        document
    }
}

fn compile_predicates(value: &Bson) -> Result<Vec<Predicate>, Error> {
    match value {
        Bson::Document(operators) if operators.keys().next().is_some_and(|key| key.starts_with('$')) => {
            compile_operators(operators)
        }
        Bson::RegularExpression(regex) => Ok(vec![Predicate::Regex(CompiledRegex::compile(&regex.pattern, &regex.options)?)]),
        value => Ok(vec![Predicate::Eq(value.clone())]),
    }
}

fn compile_operators(operators: &Document) -> Result<Vec<Predicate>, Error> {
    let mut predicates = vec![];
    for (operator, argument) in operators {
        let predicate = match operator.as_str() {
            "$eq" => Predicate::Eq(argument.clone()),
            "$gt" => Predicate::Gt(argument.clone()),
            "$gte" => Predicate::Gte(argument.clone()),
            "$lt" => Predicate::Lt(argument.clone()),
            "$lte" => Predicate::Lte(argument.clone()),
            "$ne" => Predicate::Ne(argument.clone()),
            operator @ ("$in" | "$nin") => {
                let Bson::Array(values) = argument else {
                    bail!("{operator} needs an array");
                };

                match operator {
                    "$in" => Predicate::In(values.clone()),
                    _ => Predicate::Nin(values.clone()),
                }
            }
            "$exists" => Predicate::Exists(match argument {
                Bson::Boolean(flag) => *flag,
                Bson::Int32(value) => *value != 0,
                Bson::Int64(value) => *value != 0,
                Bson::Double(value) => *value != 0.0,
                Bson::Null | Bson::Undefined => false,
                _ => true,
            }),
            "$regex" => {
                let options = match operators.get("$options") {
                    Some(Bson::String(options)) => options.as_str(),
                    Some(_) => bail!("$options has to be a string"),
                    None => "",
                };

                Predicate::Regex(match argument {
                    Bson::String(pattern) => CompiledRegex::compile(pattern, options)?,
                    Bson::RegularExpression(regex) => {
                        ensure!(
                            options.is_empty() || regex.options.is_empty(),
                            "options set in both $regex and $options"
                        );
                        let options = if options.is_empty() { &regex.options } else { options };
                        CompiledRegex::compile(&regex.pattern, options)?
                    }
                    _ => bail!("$regex has to be a string"),
                })
            }
            "$options" => {
                ensure!(operators.contains_key("$regex"), "$options needs a $regex");
                continue;
            }
            "$not" => Predicate::Not(match argument {
                Bson::Document(operators) => {
                    ensure!(!operators.is_empty(), "$not cannot be empty");
                    compile_operators(operators)?
                }
                Bson::RegularExpression(regex) => vec![Predicate::Regex(CompiledRegex::compile(&regex.pattern, &regex.options)?)],
                _ => bail!("$not needs a regex or a document"),
            }),
            operator => bail!("unknown operator: {operator}"),
        };

        predicates.push(predicate);
    }

    Ok(predicates)
}

// A predicate holds if it holds for a value or, for arrays, any element.
fn any_value(values: &[&Bson], predicate: impl Fn(&Bson) -> bool) -> bool {
    values.iter().copied().any(|value| {
        predicate(value) || matches!(value, Bson::Array(elements) if elements.iter().any(&predicate))
    })
}

fn equals(values: &[&Bson], target: &Bson, collation: &Collation) -> bool {
    // `null` also matches a missing field.
    (values.is_empty() && matches!(target, Bson::Null))
        || any_value(values, |value| is_equal(value, target, collation))
}

// Range operators only compare values of the same canonical type.
fn compares(values: &[&Bson], target: &Bson, collation: &Collation, accept: fn(Ordering) -> bool) -> bool {
    any_value(values, |value| cmp_value_partial(value, target, collation).is_ok_and(accept))
}

fn contains(values: &[&Bson], targets: &[Bson], collation: &Collation) -> bool {
    targets.iter().any(|target| match target {
        Bson::RegularExpression(regex) => CompiledRegex::compile(&regex.pattern, &regex.options)
            .is_ok_and(|pattern| any_value(values, |value| pattern.is_match(value))),
        target => equals(values, target, collation),
    })
}

impl Predicate {
    pub fn matches(&self, values: &[&Bson], collation: &Collation) -> bool {
        match self {
            Self::Eq(target) => equals(values, target, collation),
            Self::Exists(exists) => values.is_empty() != *exists,
            Self::Gt(target) => compares(values, target, collation, Ordering::is_gt),
            Self::Gte(target) => equals(values, target, collation) || compares(values, target, collation, Ordering::is_gt),
            Self::In(targets) => contains(values, targets, collation),
            Self::Lt(target) => compares(values, target, collation, Ordering::is_lt),
            Self::Lte(target) => equals(values, target, collation) || compares(values, target, collation, Ordering::is_lt),
            Self::Ne(target) => !equals(values, target, collation),
            Self::Nin(targets) => !contains(values, targets, collation),
            Self::Not(predicates) => !predicates.iter().all(|predicate| predicate.matches(values, collation)),
            Self::Regex(pattern) => any_value(values, |value| pattern.is_match(value)),
        }
    }

    fn to_document(&self) -> Document {
        let mut document = Document::new();
        match self {
            Self::Eq(target) => document.insert("$eq", target.clone()),
            Self::Exists(exists) => document.insert("$exists", *exists),
            Self::Gt(target) => document.insert("$gt", target.clone()),
            Self::Gte(target) => document.insert("$gte", target.clone()),
            Self::In(targets) => document.insert("$in", targets.clone()),
            Self::Lt(target) => document.insert("$lt", target.clone()),
            Self::Lte(target) => document.insert("$lte", target.clone()),
            Self::Ne(target) => document.insert("$ne", target.clone()),
            Self::Nin(targets) => document.insert("$nin", targets.clone()),
            Self::Not(predicates) => {
                let inner: Document = predicates.iter().flat_map(Self::to_document).collect();
                document.insert("$not", inner)
            }
            Self::Regex(pattern) => {
                document.insert("$regex", pattern.pattern.clone());
                if pattern.options.is_empty() {
                    None
                } else {
                    document.insert("$options", pattern.options.clone())
                }
            }
        };

        document
    }
}

impl CompiledRegex {
    fn compile(pattern: &str, options: &str) -> Result<Self, Error> {
        let mut flags = String::new();
        for option in options.chars() {
            match option {
                'i' | 'm' | 's' | 'x' => flags.push(option),
                'u' => {}
                option => bail!("invalid flag in regex options: {option}"),
            }
        }

        let source = if flags.is_empty() {
            pattern.to_owned()
        } else {
            format!("(?{flags}){pattern}")
        };

        let regex = Regex::new(&source).with_context(|| format!("Regular expression is invalid: {pattern}"))?;
        Ok(Self {
            regex,
            pattern: pattern.to_owned(),
            options: options.to_owned(),
        })
    }

    fn is_match(&self, value: &Bson) -> bool {
        match value {
            Bson::String(value) | Bson::Symbol(value) => self.regex.is_match(value),
            Bson::RegularExpression(regex) => regex.pattern == self.pattern && regex.options == self.options,
            _ => false,
        }
    }
}
