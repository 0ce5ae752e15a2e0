use crate::collation::Collation;
use crate::field_path::{resolve_flat, FieldPath};
use anyhow::{anyhow, bail, Error};
use bson::{Bson, Document};
use std::cmp::Ordering;

#[derive(Clone, Debug)]
pub struct Sorter {
    keys: Vec<(FieldPath, bool)>,
}

impl Sorter {
    pub fn compile(sort: &Bson) -> Result<Self, Error> {
        let Bson::Document(sort) = sort else {
            bail!("the $sort key specification must be an object");
        };

        if sort.is_empty() {
            bail!("$sort stage must have at least one sort key");
        }

        let keys = sort
            .iter()
            .map(|(path, direction)| {
                let descending = match direction {
                    Bson::Int32(1) | Bson::Int64(1) => false,
                    Bson::Int32(-1) | Bson::Int64(-1) => true,
                    Bson::Double(direction) if *direction == 1.0 => false,
                    Bson::Double(direction) if *direction == -1.0 => true,
                    direction => {
                        return Err(anyhow!(
                            "$sort key ordering must be 1 (for ascending) or -1 (for descending), found {direction} for {path}"
                        ))
                    }
                };

                Ok((FieldPath::parse(path)?, descending))
            })
            .collect::<Result<_, Error>>()?;

        Ok(Self { keys })
    }

    pub fn cmp_document(&self, lhs: &Document, rhs: &Document, collation: &Collation) -> Ordering {
        self.keys
            .iter()
            .fold(Ordering::Equal, |ordering, (path, descending)| {
                ordering.then_with(|| {
                    let lhs = sort_key(lhs, path, *descending, collation);
                    let rhs = sort_key(rhs, path, *descending, collation);
                    let ordering = cmp_value(&lhs, &rhs, collation);
                    if *descending {
                        ordering.reverse()
                    } else {
                        ordering
                    }
                })
            })
    }

    pub fn sort(&self, documents: &mut [Document], collation: &Collation) {
        documents.sort_by(|lhs, rhs| self.cmp_document(lhs, rhs, collation));
    }

    pub fn to_document(&self) -> Document {
        self.keys
            .iter()
            .map(|(path, descending)| (path.to_string(), Bson::Int32(if *descending { -1 } else { 1 })))
            .collect()
    }
}

// Arrays sort by their smallest element ascending and their largest one
// descending. Missing values sort as `null`.
fn sort_key(document: &Document, path: &FieldPath, descending: bool, collation: &Collation) -> Bson {
    let values = resolve_flat(document, path).into_iter();
    let key = if descending {
        values.max_by(|lhs, rhs| cmp_value(lhs, rhs, collation))
    } else {
        values.min_by(|lhs, rhs| cmp_value(lhs, rhs, collation))
    };

    key.cloned().unwrap_or(Bson::Null)
}

/// Compares two values of the same canonical type. Values of different types
/// return `Err` with their canonical type ordering.
pub fn cmp_value_partial(lhs: &Bson, rhs: &Bson, collation: &Collation) -> Result<Ordering, Ordering> {
    let lhs_type = canonical_type(lhs);
    let rhs_type = canonical_type(rhs);
    if lhs_type != rhs_type {
        return Err(lhs_type.cmp(&rhs_type));
    }

    Ok(match (lhs, rhs) {
        (Bson::Array(lhs), Bson::Array(rhs)) => {
            for (lhs, rhs) in lhs.iter().zip(rhs.iter()) {
                let ordering = cmp_value(lhs, rhs, collation);
                if ordering.is_ne() {
                    return Ok(ordering);
                }
            }

            lhs.len().cmp(&rhs.len())
        }
        (Bson::Document(lhs), Bson::Document(rhs)) => {
            for (lhs, rhs) in lhs.iter().zip(rhs.iter()) {
                let ordering = canonical_type(lhs.1)
                    .cmp(&canonical_type(rhs.1))
                    .then_with(|| lhs.0.cmp(rhs.0))
                    .then_with(|| cmp_value(lhs.1, rhs.1, collation));
                if ordering.is_ne() {
                    return Ok(ordering);
                }
            }

            lhs.len().cmp(&rhs.len())
        }
        (Bson::String(lhs) | Bson::Symbol(lhs), Bson::String(rhs) | Bson::Symbol(rhs)) => {
            collation.compare(lhs, rhs)
        }
        (Bson::Binary(lhs), Bson::Binary(rhs)) => lhs
            .bytes
            .len()
            .cmp(&rhs.bytes.len())
            .then_with(|| u8::from(lhs.subtype).cmp(&u8::from(rhs.subtype)))
            .then_with(|| lhs.bytes.cmp(&rhs.bytes)),
        (Bson::ObjectId(lhs), Bson::ObjectId(rhs)) => lhs.bytes().cmp(&rhs.bytes()),
        (Bson::Boolean(lhs), Bson::Boolean(rhs)) => lhs.cmp(rhs),
        (Bson::DateTime(lhs), Bson::DateTime(rhs)) => {
            lhs.timestamp_millis().cmp(&rhs.timestamp_millis())
        }
        (Bson::Timestamp(lhs), Bson::Timestamp(rhs)) => {
            (lhs.time, lhs.increment).cmp(&(rhs.time, rhs.increment))
        }
        (Bson::RegularExpression(lhs), Bson::RegularExpression(rhs)) => lhs
            .pattern
            .cmp(&rhs.pattern)
            .then_with(|| lhs.options.cmp(&rhs.options)),
        (Bson::JavaScriptCode(lhs), Bson::JavaScriptCode(rhs)) => lhs.cmp(rhs),
        (Bson::JavaScriptCodeWithScope(lhs), Bson::JavaScriptCodeWithScope(rhs)) => lhs
            .code
            .cmp(&rhs.code)
            .then_with(|| cmp_value(&Bson::Document(lhs.scope.clone()), &Bson::Document(rhs.scope.clone()), collation)),
        (lhs, rhs) => match (as_number(lhs), as_number(rhs)) {
            (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
            // Null, undefined, MinKey, MaxKey and DBPointer have no inner order.
            _ => Ordering::Equal,
        },
    })
}

pub fn cmp_value(lhs: &Bson, rhs: &Bson, collation: &Collation) -> Ordering {
    match cmp_value_partial(lhs, rhs, collation) {
        Ok(ordering) | Err(ordering) => ordering,
    }
}

/// Values of different canonical types are never equal.
pub fn is_equal(lhs: &Bson, rhs: &Bson, collation: &Collation) -> bool {
    cmp_value_partial(lhs, rhs, collation) == Ok(Ordering::Equal)
}

enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(lhs), Self::Integer(rhs)) => lhs.cmp(rhs),
            (lhs, rhs) => {
                let lhs = lhs.as_f64();
                let rhs = rhs.as_f64();
                // NaN sorts below every other number and equals itself.
                match (lhs.is_nan(), rhs.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => lhs.partial_cmp(&rhs).unwrap_or(Ordering::Equal),
                }
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(&self) -> f64 {
        match self {
            Self::Integer(value) => *value as f64,
            Self::Float(value) => *value,
        }
    }
}

fn as_number(value: &Bson) -> Option<Number> {
    match value {
        Bson::Int32(value) => Some(Number::Integer(i64::from(*value))),
        Bson::Int64(value) => Some(Number::Integer(*value)),
        Bson::Double(value) => Some(Number::Float(*value)),
        Bson::Decimal128(value) => Some(Number::Float(value.to_string().parse().unwrap_or(f64::NAN))),
        _ => None,
    }
}

/// <https://www.mongodb.com/docs/manual/reference/bson-type-comparison-order/>
fn canonical_type(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::JavaScriptCodeWithScope(_) => 14,
        Bson::MaxKey => 15,
    }
}

#[cfg(test)]
mod tests {
    use super::{cmp_value, is_equal, Sorter};
    use crate::collation::Collation;
    use bson::{bson, doc, Bson, Document};
    use std::cmp::Ordering;

    fn case_insensitive() -> Collation {
        Collation::parse(&doc! { "locale": "en_US", "strength": 1 }).unwrap()
    }

    macro_rules! test {
        ($name:ident, $collation:expr, { $($sort:tt)* }, { $($lhs:tt)* }, { $($rhs:tt)* }, $expected:expr) => {
            #[test]
            fn $name() {
                let sort = bson!({ $($sort)* });
                let lhs = doc! { $($lhs)* };
                let rhs = doc! { $($rhs)* };

                let sorter = match Sorter::compile(&sort) {
                    Ok(sorter) => sorter,
                    Err(error) => panic!("{sort:?} is not supported: {error:?}"),
                };

                assert_eq!(sorter.cmp_document(&lhs, &rhs, &$collation), $expected);
            }
        };
    }

    macro_rules! eq {($name:ident, $collation:expr, { $($sort:tt)* }, { $($lhs:tt)* }, { $($rhs:tt)* }) => {test!($name, $collation, { $($sort)* }, { $($lhs)* }, { $($rhs)* }, Ordering::Equal);}}
    macro_rules! ge {($name:ident, $collation:expr, { $($sort:tt)* }, { $($lhs:tt)* }, { $($rhs:tt)* }) => {test!($name, $collation, { $($sort)* }, { $($lhs)* }, { $($rhs)* }, Ordering::Greater);}}
    macro_rules! le {($name:ident, $collation:expr, { $($sort:tt)* }, { $($lhs:tt)* }, { $($rhs:tt)* }) => {test!($name, $collation, { $($sort)* }, { $($lhs)* }, { $($rhs)* }, Ordering::Less);}}

    eq!(basic_1, Collation::Simple, {"a": 1}, {}, {});
    ge!(basic_2, Collation::Simple, {"a": 1}, {"a": 1}, {});
    le!(basic_3, Collation::Simple, {"a": 1}, {}, {"a": 1});
    eq!(missing_is_null, Collation::Simple, {"a": 1}, {"a": null}, {});
    le!(descending, Collation::Simple, {"a": -1}, {"a": 2}, {"a": 1});
    le!(numbers_across_types, Collation::Simple, {"a": 1}, {"a": 1}, {"a": 1.5});
    eq!(int_and_double_equal, Collation::Simple, {"a": 1}, {"a": 2_i64}, {"a": 2.0});
    le!(numbers_before_strings, Collation::Simple, {"a": 1}, {"a": 100}, {"a": "1"});
    le!(strings_before_documents, Collation::Simple, {"a": 1}, {"a": "z"}, {"a": {}});
    le!(strings_before_booleans, Collation::Simple, {"a": 1}, {"a": "x"}, {"a": true});
    le!(simple_upper_first, Collation::Simple, {"a": 1}, {"a": "B"}, {"a": "a"});
    ge!(locale_alphabetical, case_insensitive(), {"a": 1}, {"a": "B"}, {"a": "a"});
    eq!(locale_ignores_case, case_insensitive(), {"a": 1}, {"a": "B"}, {"a": "b"});
    le!(array_min_ascending, Collation::Simple, {"a": 1}, {"a": [5, 1]}, {"a": 2});
    le!(array_max_descending, Collation::Simple, {"a": -1}, {"a": [1, 5]}, {"a": 2});
    le!(second_key, Collation::Simple, {"a": 1, "b": -1}, {"a": 1, "b": 2}, {"a": 1, "b": 1});
    le!(nested_key, Collation::Simple, {"a.b": 1}, {"a": {"b": 1}}, {"a": {"b": 2}});

    #[test]
    fn equality_requires_same_type() {
        assert!(is_equal(&bson!(1), &bson!(1.0), &Collation::Simple));
        assert!(!is_equal(&bson!(1), &bson!("1"), &Collation::Simple));
        assert!(!is_equal(&bson!(null), &bson!(false), &Collation::Simple));
        assert!(is_equal(&bson!("b"), &bson!("B"), &case_insensitive()));
        assert!(!is_equal(&bson!("b"), &bson!("B"), &Collation::Simple));
        assert!(!is_equal(&bson!("b"), &bson!(["B"]), &case_insensitive()));
    }

    #[test]
    fn documents_and_arrays() {
        let collation = Collation::Simple;
        assert_eq!(cmp_value(&bson!({"a": 1}), &bson!({"a": 1, "b": 1}), &collation), Ordering::Less);
        assert_eq!(cmp_value(&bson!({"a": 1}), &bson!({"b": 1}), &collation), Ordering::Less);
        assert_eq!(cmp_value(&bson!([1, 2]), &bson!([1, 3]), &collation), Ordering::Less);
        assert_eq!(cmp_value(&bson!([2]), &bson!([1, 3]), &collation), Ordering::Greater);
        assert!(is_equal(&bson!({"x": "A"}), &bson!({"x": "a"}), &case_insensitive()));
        assert!(!is_equal(&bson!({"X": "a"}), &bson!({"x": "a"}), &case_insensitive()));
    }

    #[test]
    fn nan_sorts_first() {
        let collation = Collation::Simple;
        assert_eq!(cmp_value(&Bson::Double(f64::NAN), &bson!(-1000), &collation), Ordering::Less);
        assert!(is_equal(&Bson::Double(f64::NAN), &Bson::Double(f64::NAN), &collation));
    }

    #[test]
    fn sort_is_stable() {
        let sorter = Sorter::compile(&bson!({"k": 1})).unwrap();
        let mut documents: Vec<Document> = vec![
            doc! {"k": "b", "i": 0},
            doc! {"k": "A", "i": 1},
            doc! {"k": "B", "i": 2},
            doc! {"k": "a", "i": 3},
        ];

        sorter.sort(&mut documents, &case_insensitive());
        let order: Vec<i32> = documents.iter().map(|document| document.get_i32("i").unwrap()).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn compile_rejects_invalid_specs() {
        for sort in [bson!([]), bson!({}), bson!({"a": 0}), bson!({"a": "asc"}), bson!({"$a": 1})] {
            assert!(Sorter::compile(&sort).is_err(), "{sort:?} should be rejected");
        }
    }
}
