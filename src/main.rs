mod catalog;
mod collation;
mod ejson;
mod expression;
mod field_path;
mod logging;
mod lookup;
mod matcher;
mod pipeline;
mod projector;
mod settings;
mod sorter;
mod source;
mod unwind;
mod variables;

use anyhow::{bail, Context, Error};
use bson::{Bson, Document};
use catalog::Catalog;
use mongodb::Client;
use pipeline::{ExpressionContext, Pipeline, Stage};
use serde_json::Value;
use settings::Settings;
use std::{env, fs};
use tracing::info;
use variables::Variables;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let path = env::args().nth(1).unwrap_or_else(|| "settings".to_owned());
    let settings = Settings::from(&path).with_context(|| format!("cannot load settings from {path}"))?;
    logging::init(&settings.logging)?;

    let aggregate = &settings.aggregate;
    let stages = read_pipeline(&aggregate.pipeline)?;
    let collation = aggregate.collation()?;

    let mut names = pipeline::referenced_collections(&stages);
    names.insert(aggregate.collection.clone());

    let database = Client::with_uri_str(&settings.mongo.url)
        .await?
        .database(&settings.mongo.database);
    let catalog = Catalog::fetch(&database, &names).await?;

    let context = ExpressionContext::for_collection(&catalog, &aggregate.collection, collation.as_ref())?
        .with_optimization(aggregate.optimize);
    let pipeline = Pipeline::compile(&stages, &context)?;
    for stage in pipeline.stages() {
        if let Stage::Lookup(lookup) = stage {
            if !lookup.fused_stages().is_empty() {
                info!(fused = ?lookup.fused_stages(), "stages fused into $lookup");
            }
        }
    }

    if aggregate.explain {
        let stages = pipeline
            .explain()
            .into_iter()
            .map(|stage| Value::Object(ejson::into_ejson_document(stage)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&Value::Array(stages))?);
        return Ok(());
    }

    let variables = Variables::default();
    let mut results = 0;
    for document in pipeline.execute(&aggregate.collection, &catalog, &variables) {
        println!("{}", Value::Object(ejson::into_ejson_document(document)));
        results += 1;
    }

    info!(collection = %aggregate.collection, results, "aggregation finished");
    Ok(())
}

fn read_pipeline(path: &str) -> Result<Vec<Document>, Error> {
    let json = fs::read_to_string(path).with_context(|| format!("cannot read pipeline from {path}"))?;
    let value: Value = serde_json::from_str(&json).with_context(|| format!("invalid JSON in {path}"))?;
    let Bson::Array(stages) = Bson::try_from(value)? else {
        bail!("{path} must contain an array of pipeline stages");
    };

    Pipeline::parse(&stages)
}
