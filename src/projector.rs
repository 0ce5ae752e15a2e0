use crate::field_path::FieldPath;
use anyhow::{bail, ensure, Error};
use bson::{Bson, Document};

/// Projected paths, merged by their common prefixes.
#[derive(Clone, Debug)]
pub enum Node {
    Leaf,
    Branch(Vec<(String, Node)>),
}

#[derive(Clone, Debug)]
pub enum Projector {
    Exclude(Vec<(String, Node)>),
    Include(Vec<(String, Node)>),
}

impl Projector {
    pub fn apply(&self, mut document: Document) -> Document {
        match self {
            Self::Exclude(fields) => {
                exclude(&mut document, fields);
                document
            }
            Self::Include(fields) => include(&document, fields),
        }
    }

    /// `$unset: [path, ...]`, i.e. an exclusion that never touches `_id`
    /// unless asked to.
    pub fn compile_unset(spec: &Bson) -> Result<Self, Error> {
        let Bson::Array(paths) = spec else {
            bail!("$unset specification must be an array");
        };

        ensure!(
            !paths.is_empty(),
            "$unset specification must be an array with at least one field"
        );
        ensure!(
            paths.iter().all(|path| matches!(path, Bson::String(_))),
            "$unset specification must be an array containing only string values"
        );

        let mut fields = vec![];
        for path in paths.iter().filter_map(Bson::as_str) {
            insert(&mut fields, &FieldPath::parse(path)?)?;
        }

        Ok(Self::Exclude(fields))
    }

    pub fn compile(projection: &Bson) -> Result<Self, Error> {
        let Bson::Document(projection) = projection else {
            bail!("$project specification must be an object");
        };

        let mut paths = vec![];
        flatten(projection, None, &mut paths)?;
        ensure!(!paths.is_empty(), "projection specification must have at least one field");

        let mut include_all = None;
        let mut include_id = None;
        for (path, include) in &paths {
            // _id is special.
            if path == "_id" {
                include_id = Some(*include);
                continue;
            }

            match include_all {
                Some(include_all) if include_all != *include => {
                    bail!("Projection cannot be both exclusive and inclusive");
                }
                _ => include_all = Some(*include),
            }
        }

        let include_all = include_all.or(include_id).unwrap_or(false);
        let mut fields = vec![];
        for (path, include) in &paths {
            if *include == include_all {
                insert(&mut fields, &FieldPath::parse(path)?)?;
            }
        }

        if include_all && include_id.is_none() {
            insert(&mut fields, &FieldPath::parse("_id")?)?;
        }

        Ok(if include_all {
            Self::Include(fields)
        } else {
            Self::Exclude(fields)
        })
    }

    /// The projected paths, in specification order.
    pub fn paths(&self) -> Vec<FieldPath> {
        fn collect(fields: &[(String, Node)], prefix: &str, paths: &mut Vec<String>) {
            for (name, node) in fields {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}.{name}")
                };

                match node {
                    Node::Leaf => paths.push(path),
                    Node::Branch(children) => collect(children, &path, paths),
                }
            }
        }

        let (Self::Exclude(fields) | Self::Include(fields)) = self;
        let mut paths = vec![];
        collect(fields, "", &mut paths);
        paths
            .iter()
            .filter_map(|path| FieldPath::parse(path).ok())
            .collect()
    }

    pub fn to_document(&self) -> Document {
        let include = matches!(self, Self::Include(_));
        self.paths()
            .into_iter()
            .map(|path| (path.to_string(), Bson::Boolean(include)))
            .collect()
    }
}

fn flatten(projection: &Document, prefix: Option<&str>, paths: &mut Vec<(String, bool)>) -> Result<(), Error> {
    for (key, value) in projection {
        let path = prefix.map_or_else(|| key.clone(), |prefix| format!("{prefix}.{key}"));

        let include = match value {
            Bson::Boolean(include) => *include,
            Bson::Int32(value) => *value != 0,
            Bson::Int64(value) => *value != 0,
            Bson::Double(value) => *value != 0.0,
            Bson::Document(nested) if !nested.is_empty() && !nested.keys().any(|key| key.starts_with('$')) => {
                flatten(nested, Some(&path), paths)?;
                continue;
            }
            value => bail!("Projection {value} for {path} is not supported"),
        };

        paths.push((path, include));
    }

    Ok(())
}

fn insert(fields: &mut Vec<(String, Node)>, path: &FieldPath) -> Result<(), Error> {
    let mut fields = fields;
    let Some((last, init)) = path.segments().split_last() else {
        return Ok(());
    };

    for segment in init {
        let index = fields
            .iter()
            .position(|(name, _)| name == segment)
            .unwrap_or_else(|| {
                fields.push((segment.clone(), Node::Branch(vec![])));
                fields.len() - 1
            });

        fields = match &mut fields[index].1 {
            Node::Branch(children) => children,
            Node::Leaf => bail!("Invalid projection :: caused by :: Path collision at {path}"),
        };
    }

    ensure!(
        fields.iter().all(|(name, _)| name != last),
        "Invalid projection :: caused by :: Path collision at {path}"
    );

    fields.push((last.clone(), Node::Leaf));
    Ok(())
}

fn exclude(document: &mut Document, fields: &[(String, Node)]) {
    for (name, node) in fields {
        match node {
            Node::Leaf => {
                document.remove(name);
            }
            Node::Branch(children) => {
                if let Some(value) = document.get_mut(name) {
                    exclude_value(value, children);
                }
            }
        }
    }
}

// Arrays, nested ones included, apply the projection to every element.
fn exclude_value(value: &mut Bson, fields: &[(String, Node)]) {
    match value {
        Bson::Document(document) => exclude(document, fields),
        Bson::Array(values) => {
            for value in values {
                exclude_value(value, fields);
            }
        }
        _ => {}
    }
}

fn include(document: &Document, fields: &[(String, Node)]) -> Document {
    document
        .iter()
        .filter_map(|(name, value)| {
            let (_, node) = fields.iter().find(|(field, _)| field == name)?;
            let value = match node {
                Node::Leaf => value.clone(),
                Node::Branch(children) => include_value(value, children)?,
            };

            Some((name.clone(), value))
        })
        .collect()
}

// Scalars below an included path are dropped.
fn include_value(value: &Bson, fields: &[(String, Node)]) -> Option<Bson> {
    match value {
        Bson::Document(document) => Some(Bson::Document(include(document, fields))),
        Bson::Array(values) => Some(Bson::Array(
            values
                .iter()
                .filter_map(|value| include_value(value, fields))
                .collect(),
        )),
        _ => None,
    }
}
