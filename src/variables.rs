use anyhow::{bail, Error};
use bson::Bson;
use std::collections::{BTreeMap, BTreeSet};

pub const ROOT: &str = "ROOT";
pub const CURRENT: &str = "CURRENT";

/// Values bound to user variables while one document is processed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Variables {
    values: BTreeMap<String, Bson>,
}

impl Variables {
    pub fn bind(&mut self, name: String, value: Bson) {
        self.values.insert(name, value);
    }

    pub fn unbind(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&Bson> {
        self.values.get(name)
    }
}

/// Names of the variables visible while an expression is parsed.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    names: BTreeSet<String>,
}

impl Scope {
    pub fn define(&mut self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        self.names.insert(name.to_owned());
        Ok(())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        name == ROOT || name == CURRENT || self.names.contains(name)
    }
}

/// User variables start with a lowercase ASCII letter (or any non-ASCII
/// character) and continue with letters, digits and underscores.
pub fn validate_name(name: &str) -> Result<(), Error> {
    let mut characters = name.chars();
    let Some(first) = characters.next() else {
        bail!("empty variable names are not allowed");
    };

    if !(first.is_ascii_lowercase() || !first.is_ascii()) {
        bail!("'{name}' starts with an invalid character for a user variable name");
    }

    if let Some(character) =
        characters.find(|character| !(character.is_ascii_alphanumeric() || *character == '_' || !character.is_ascii()))
    {
        bail!("'{name}' contains an invalid character for a variable name: '{character}'");
    }

    Ok(())
}
