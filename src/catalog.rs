use crate::collation::Collation;
use crate::source::{DocumentSource, DocumentStream};
use anyhow::{Context, Error};
use bson::{doc, Document};
use futures_util::TryStreamExt;
use mongodb::results::CollectionSpecification;
use mongodb::Database;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Default)]
struct Collection {
    default_collation: Option<Collation>,
    documents: Vec<Document>,
}

/// In-memory collections with their default collations.
#[derive(Default)]
pub struct Catalog {
    collections: BTreeMap<String, Collection>,
}

impl Catalog {
    pub fn create_collection(&mut self, name: &str, default_collation: Option<Collation>) {
        self.collections.entry(name.to_owned()).or_default().default_collation = default_collation;
    }

    pub fn insert(&mut self, name: &str, documents: impl IntoIterator<Item = Document>) {
        self.collections
            .entry(name.to_owned())
            .or_default()
            .documents
            .extend(documents);
    }

    /// Loads `names` with their documents and default collations. Collections
    /// missing from the database stay missing.
    pub async fn fetch(database: &Database, names: &BTreeSet<String>) -> Result<Self, Error> {
        let filter = doc! { "name": { "$in": names.iter().cloned().collect::<Vec<_>>() } };
        let specifications: Vec<CollectionSpecification> = database
            .list_collections(Some(filter), None)
            .await?
            .try_collect()
            .await?;

        let mut catalog = Self::default();
        for specification in specifications {
            let default_collation = match &specification.options.collation {
                Some(collation) => {
                    let collation = bson::to_document(collation)?;
                    Some(Collation::parse(&collation).with_context(|| {
                        format!("collection {} has an unsupported collation", specification.name)
                    })?)
                }
                None => None,
            };

            let documents: Vec<Document> = database
                .collection::<Document>(&specification.name)
                .find(None, None)
                .await?
                .try_collect()
                .await?;

            info!(
                collection = %specification.name,
                documents = documents.len(),
                ?default_collation,
                "fetched collection"
            );

            catalog.create_collection(&specification.name, default_collation);
            catalog.insert(&specification.name, documents);
        }

        for name in names.iter().filter(|name| !catalog.collections.contains_key(*name)) {
            debug!(collection = %name, "collection does not exist");
        }

        Ok(catalog)
    }
}

impl DocumentSource for Catalog {
    fn scan(&self, collection: &str) -> DocumentStream<'_> {
        match self.collections.get(collection) {
            Some(collection) => Box::new(collection.documents.iter().cloned()),
            None => Box::new(std::iter::empty()),
        }
    }

    fn default_collation(&self, collection: &str) -> Option<Collation> {
        self.collections
            .get(collection)
            .and_then(|collection| collection.default_collation.clone())
    }
}
