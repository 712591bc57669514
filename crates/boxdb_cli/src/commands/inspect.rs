//! Inspect command implementation.

use boxdb_core::{Model, Store, StoreOptions};
use serde::Serialize;
use std::path::Path;

use super::format_size;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store directory.
    pub path: String,
    /// Size of the store files in bytes.
    pub size_on_disk: u64,
    /// Bytes of live object data.
    pub data_size: u64,
    /// Newest committed sequence.
    pub committed_sequence: u64,
    /// Transactions replayed from the WAL while opening.
    pub replayed_transactions: usize,
    /// Incomplete data file bytes ignored while opening.
    pub torn_tail_bytes: u64,
    /// Per-entity summary.
    pub entities: Vec<EntityStats>,
}

/// Summary of one entity.
#[derive(Debug, Serialize)]
pub struct EntityStats {
    /// Entity ID.
    pub id: u32,
    /// Entity name.
    pub name: String,
    /// Number of stored objects.
    pub objects: u64,
    /// Properties, present when the schema was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<PropertyInfo>>,
}

/// One property of the schema.
#[derive(Debug, Serialize)]
pub struct PropertyInfo {
    /// Property ID.
    pub id: u32,
    /// Property name.
    pub name: String,
    /// Value type.
    pub ptype: String,
    /// Raw flag bits.
    pub flags: u32,
    /// Target entity of a relation property.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_schema: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(
        StoreOptions::new()
            .directory(path)
            .read_schema(true)
            .read_only(true),
    )?;
    let result = inspect(&store, path, show_schema)?;
    store.close()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result of an open store.
pub fn inspect(
    store: &Store,
    path: &Path,
    show_schema: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let model = store.model();
    let mut entities = Vec::with_capacity(model.entities.len());
    for entity in &model.entities {
        entities.push(EntityStats {
            id: entity.id,
            name: entity.name.clone(),
            objects: store.entity_box(entity.id)?.count(0)?,
            properties: show_schema.then(|| properties(model, entity.id)),
        });
    }
    let report = store.recovery_report();
    Ok(InspectResult {
        path: path.display().to_string(),
        size_on_disk: store.size_on_disk()?,
        data_size: store.data_size(),
        committed_sequence: store.committed_sequence(),
        replayed_transactions: report.replayed_transactions,
        torn_tail_bytes: report.torn_tail_bytes,
        entities,
    })
}

fn properties(model: &Model, entity: u32) -> Vec<PropertyInfo> {
    let Some(entity) = model.entity(entity) else {
        return Vec::new();
    };
    entity
        .properties
        .iter()
        .map(|p| PropertyInfo {
            id: p.id,
            name: p.name.clone(),
            ptype: p.ptype.name().to_string(),
            flags: p.flags.bits(),
            target: p
                .target_entity
                .and_then(|t| model.entity(t))
                .map(|t| t.name.clone()),
        })
        .collect()
}

fn print_text_output(result: &InspectResult) {
    println!("boxdb Store Inspection");
    println!("======================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Size on disk:  {}", format_size(result.size_on_disk));
    println!("  Live data:     {}", format_size(result.data_size));
    println!("  Last commit:   {}", result.committed_sequence);
    if result.replayed_transactions > 0 || result.torn_tail_bytes > 0 {
        println!(
            "  Recovery:      {} transactions replayed, {} torn bytes",
            result.replayed_transactions, result.torn_tail_bytes
        );
    }
    println!();
    println!("Entities:");
    for entity in &result.entities {
        println!("  [{}] {}: {} objects", entity.id, entity.name, entity.objects);
        for p in entity.properties.iter().flatten() {
            print!("      {:>3} {:<20} {:<14} flags={}", p.id, p.name, p.ptype, p.flags);
            if let Some(target) = &p.target {
                print!(" -> {target}");
            }
            println!();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxdb_core::{ModelBuilder, PropertyFlags, PropertyType};
    use boxdb_codec::ObjectRecord;

    #[test]
    fn counts_objects_per_entity() {
        let dir = tempfile::tempdir().unwrap();
        let model = ModelBuilder::new()
            .entity("Task", 1, 10)
            .property("id", PropertyType::Long, 1, 11)
            .property_flags(PropertyFlags::ID)
            .property("title", PropertyType::String, 2, 12)
            .build()
            .unwrap();
        {
            let store = Store::open(StoreOptions::new().directory(dir.path()).model(model)).unwrap();
            let tasks = store.entity_box(1).unwrap();
            for title in ["a", "b"] {
                tasks
                    .put(0, ObjectRecord::new().with(2, title).encode_padded())
                    .unwrap();
            }
            store.close().unwrap();
        }

        let store = Store::open(
            StoreOptions::new()
                .directory(dir.path())
                .read_schema(true)
                .read_only(true),
        )
        .unwrap();
        let result = inspect(&store, dir.path(), true).unwrap();
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].objects, 2);
        let props = result.entities[0].properties.as_ref().unwrap();
        assert_eq!(props[1].name, "title");
        assert_eq!(props[1].ptype, "String");
        assert!(result.committed_sequence >= 1);
    }
}
