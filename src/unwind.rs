use crate::field_path::{get, remove, set, FieldPath};
use anyhow::{bail, ensure, Context, Error};
use bson::{doc, Bson, Document};

#[derive(Clone, Debug)]
pub struct Unwind {
    path: FieldPath,
    include_array_index: Option<FieldPath>,
    preserve_null_and_empty_arrays: bool,
}

impl Unwind {
    pub fn compile(spec: &Bson) -> Result<Self, Error> {
        let (path, include_array_index, preserve_null_and_empty_arrays) = match spec {
            Bson::String(path) => (path.as_str(), None, false),
            Bson::Document(spec) => {
                let mut path = None;
                let mut include_array_index = None;
                let mut preserve_null_and_empty_arrays = false;
                for (key, value) in spec {
                    match (key.as_str(), value) {
                        ("path", Bson::String(value)) => path = Some(value.as_str()),
                        ("includeArrayIndex", Bson::String(value)) => {
                            ensure!(
                                !value.is_empty() && !value.starts_with('$'),
                                "includeArrayIndex option to $unwind stage must be a non-empty string not starting with '$', found {value}"
                            );
                            include_array_index = Some(FieldPath::parse(value)?);
                        }
                        ("preserveNullAndEmptyArrays", Bson::Boolean(value)) => {
                            preserve_null_and_empty_arrays = *value;
                        }
                        (key @ ("path" | "includeArrayIndex" | "preserveNullAndEmptyArrays"), value) => {
                            bail!("invalid type for '{key}' option to $unwind stage: {value}")
                        }
                        (key, _) => bail!("unrecognized option to $unwind stage: {key}"),
                    }
                }

                let Some(path) = path else {
                    bail!("no path specified to $unwind stage");
                };

                (path, include_array_index, preserve_null_and_empty_arrays)
            }
            spec => bail!("expected either a string or an object as specification for $unwind stage, got {spec}"),
        };

        let Some(path) = path.strip_prefix('$') else {
            bail!("path option to $unwind stage should be prefixed with a '$': {path}");
        };

        Ok(Self {
            path: FieldPath::parse(path).context("invalid path option to $unwind stage")?,
            include_array_index,
            preserve_null_and_empty_arrays,
        })
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    pub fn preserves_null_and_empty_arrays(&self) -> bool {
        self.preserve_null_and_empty_arrays
    }

    pub fn includes_array_index(&self) -> bool {
        self.include_array_index.is_some()
    }

    /// One document per array element. Scalars pass through as if they were
    /// single-element arrays.
    pub fn apply(&self, mut document: Document) -> Vec<Document> {
        let values = match get(&document, &self.path) {
            Some(Bson::Array(values)) => values.clone(),
            None | Some(Bson::Null | Bson::Undefined) => {
                return self.preserve(document);
            }
            Some(_) => {
                self.set_index(&mut document, Bson::Null);
                return vec![document];
            }
        };

        if values.is_empty() {
            remove(&mut document, &self.path);
            return self.preserve(document);
        }

        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| {
                let mut document = document.clone();
                set(&mut document, &self.path, value);
                self.set_index(&mut document, Bson::Int64(index as i64));
                document
            })
            .collect()
    }

    fn preserve(&self, mut document: Document) -> Vec<Document> {
        if !self.preserve_null_and_empty_arrays {
            return vec![];
        }

        self.set_index(&mut document, Bson::Null);
        vec![document]
    }

    fn set_index(&self, document: &mut Document, index: Bson) {
        if let Some(path) = &self.include_array_index {
            set(document, path, index);
        }
    }

    /// Options only, as shown when absorbed into a `$lookup`.
    pub fn options_document(&self) -> Document {
        let mut document = doc! { "preserveNullAndEmptyArrays": self.preserve_null_and_empty_arrays };
        if let Some(path) = &self.include_array_index {
            document.insert("includeArrayIndex", path.to_string());
        }

        document
    }

    pub fn to_document(&self) -> Document {
        let mut document = doc! { "path": format!("${}", self.path) };
        document.extend(self.options_document());
        document
    }
}
