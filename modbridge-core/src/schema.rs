// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Entity schema descriptors
//!
//! An [`EntitySchema`] is a table of named fields, each with an accessor and
//! a mutator, registered explicitly with [`EntitySchemaBuilder::field`].
//! Rows are `BTreeMap<String, serde_json::Value>`; the persistence layer
//! stores them however it likes.

use crate::error::{CoreError, CoreResult};
use crate::instance::ModuleInstance;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Row = BTreeMap<String, Value>;

type Getter<T> = Box<dyn Fn(&T) -> CoreResult<Value> + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, Value) -> CoreResult<()> + Send + Sync>;

struct FieldDescriptor<T> {
    name: &'static str,
    get: Getter<T>,
    set: Setter<T>,
}

/// Field table for one entity type
pub struct EntitySchema<T> {
    entity: &'static str,
    fields: Vec<FieldDescriptor<T>>,
}

impl<T> EntitySchema<T> {
    pub fn builder(entity: &'static str) -> EntitySchemaBuilder<T> {
        EntitySchemaBuilder {
            schema: EntitySchema {
                entity,
                fields: Vec::new(),
            },
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    fn field(&self, name: &str) -> CoreResult<&FieldDescriptor<T>> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| CoreError::Other(format!("{} has no field {}", self.entity, name)))
    }

    pub fn get(&self, entity: &T, name: &str) -> CoreResult<Value> {
        (self.field(name)?.get)(entity)
    }

    pub fn set(&self, entity: &mut T, name: &str, value: Value) -> CoreResult<()> {
        (self.field(name)?.set)(entity, value)
    }

    pub fn to_row(&self, entity: &T) -> CoreResult<Row> {
        self.fields
            .iter()
            .map(|f| Ok((f.name.to_string(), (f.get)(entity)?)))
            .collect()
    }

    /// Build an entity from a row. Fields absent from the row keep their
    /// default; columns the schema does not know are ignored.
    pub fn from_row(&self, row: &Row) -> CoreResult<T>
    where
        T: Default,
    {
        let mut entity = T::default();
        for field in &self.fields {
            if let Some(value) = row.get(field.name) {
                (field.set)(&mut entity, value.clone())?;
            }
        }
        Ok(entity)
    }
}

pub struct EntitySchemaBuilder<T> {
    schema: EntitySchema<T>,
}

impl<T: 'static> EntitySchemaBuilder<T> {
    /// Register a field with typed accessor and mutator closures.
    pub fn field<V, G, S>(mut self, name: &'static str, get: G, set: S) -> Self
    where
        V: Serialize + DeserializeOwned,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let entity = self.schema.entity;
        self.schema.fields.push(FieldDescriptor {
            name,
            get: Box::new(move |target| Ok(serde_json::to_value(get(target))?)),
            set: Box::new(move |target, value| {
                let value = serde_json::from_value(value).map_err(|e| {
                    CoreError::Serialization(format!("{}.{}: {}", entity, name, e))
                })?;
                set(target, value);
                Ok(())
            }),
        });
        self
    }

    pub fn build(self) -> EntitySchema<T> {
        self.schema
    }
}

/// Persisted form of a loaded module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub entry_file: String,
    pub capabilities: Vec<String>,
    pub digest: String,
    pub loaded_at: Option<DateTime<Utc>>,
}

static MODULE_RECORD_SCHEMA: Lazy<EntitySchema<ModuleRecord>> = Lazy::new(|| {
    EntitySchema::builder("ModuleRecord")
        .field("id", |r: &ModuleRecord| r.id.clone(), |r, v| r.id = v)
        .field("name", |r: &ModuleRecord| r.name.clone(), |r, v| r.name = v)
        .field("version", |r: &ModuleRecord| r.version.clone(), |r, v| r.version = v)
        .field(
            "entryFile",
            |r: &ModuleRecord| r.entry_file.clone(),
            |r, v| r.entry_file = v,
        )
        .field(
            "capabilities",
            |r: &ModuleRecord| r.capabilities.clone(),
            |r, v| r.capabilities = v,
        )
        .field("digest", |r: &ModuleRecord| r.digest.clone(), |r, v| r.digest = v)
        .field("loadedAt", |r: &ModuleRecord| r.loaded_at, |r, v| r.loaded_at = v)
        .build()
});

impl ModuleRecord {
    pub fn schema() -> &'static EntitySchema<ModuleRecord> {
        &MODULE_RECORD_SCHEMA
    }

    pub fn from_instance(instance: &ModuleInstance) -> Self {
        let manifest = instance.module().manifest();
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            entry_file: manifest.entry_file.clone(),
            capabilities: manifest.capabilities.clone(),
            digest: instance.module().digest().to_string(),
            loaded_at: Some(instance.loaded_at()),
        }
    }

    pub fn to_row(&self) -> CoreResult<Row> {
        Self::schema().to_row(self)
    }

    pub fn from_row(row: &Row) -> CoreResult<Self> {
        Self::schema().from_row(row)
    }
}
