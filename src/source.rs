use crate::collation::Collation;
use bson::Document;

pub type DocumentStream<'a> = Box<dyn Iterator<Item = Document> + 'a>;

/// Where pipelines read collections from.
pub trait DocumentSource {
    /// Documents of `collection` in natural order. Unknown collections are
    /// empty.
    fn scan(&self, collection: &str) -> DocumentStream<'_>;

    fn scan_matching<'a>(
        &'a self,
        collection: &str,
        predicate: Box<dyn Fn(&Document) -> bool + 'a>,
    ) -> DocumentStream<'a> {
        Box::new(self.scan(collection).filter(move |document| predicate(document)))
    }

    fn default_collation(&self, collection: &str) -> Option<Collation>;
}
