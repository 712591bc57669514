//! Shared setup for the boxdb benchmarks.

#![warn(missing_docs)]

use boxdb_codec::{ObjectRecord, Value};
use boxdb_core::{Model, ModelBuilder, PropertyFlags, PropertyType, SchemaId, Store, StoreOptions};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Entity ID of the benchmark entity.
pub const ITEM: SchemaId = 1;
/// Indexed string property.
pub const NAME: SchemaId = 2;
/// Integer property without an index.
pub const RANK: SchemaId = 3;
/// Byte payload property.
pub const BLOB: SchemaId = 4;

/// Model with a single `Item` entity.
///
/// # Panics
///
/// Never for this fixed model.
pub fn bench_model() -> Model {
    ModelBuilder::new()
        .entity("Item", ITEM, 10)
        .property("id", PropertyType::Long, 1, 11)
        .property_flags(PropertyFlags::ID)
        .property("name", PropertyType::String, NAME, 12)
        .property_flags(PropertyFlags::INDEXED)
        .property_index_id(1, 20)
        .property("rank", PropertyType::Int, RANK, 13)
        .property("blob", PropertyType::ByteVector, BLOB, 14)
        .build()
        .expect("benchmark model is valid")
}

static STORES: AtomicUsize = AtomicUsize::new(0);

/// Opens a fresh in-memory store with [`bench_model`].
///
/// # Panics
///
/// If the store cannot be opened.
pub fn memory_store() -> Store {
    let n = STORES.fetch_add(1, Ordering::Relaxed);
    Store::open(
        StoreOptions::new()
            .directory(format!("memory:bench-{n}"))
            .model(bench_model()),
    )
    .expect("open benchmark store")
}

/// Generate random bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a random alphanumeric name.
pub fn random_name(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Encodes an item with a name, a rank and a blob of `blob_size` bytes.
pub fn item(name: &str, rank: i64, blob_size: usize) -> Vec<u8> {
    ObjectRecord::new()
        .with(NAME, name)
        .with(RANK, Value::Integer(rank))
        .with(BLOB, random_data(blob_size))
        .encode_padded()
}

/// Generate `count` encoded items with random names and ranks below 1000.
pub fn generate_items(count: usize, blob_size: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| item(&random_name(12), rng.gen_range(0..1000), blob_size))
        .collect()
}

/// Fills a store with `count` items and returns their IDs.
///
/// # Panics
///
/// If a put fails.
pub fn populate(store: &Store, count: usize, blob_size: usize) -> Vec<u64> {
    let items = store.entity_box(ITEM).expect("item box");
    let objects = generate_items(count, blob_size)
        .into_iter()
        .map(|data| (0, data))
        .collect();
    items.put_many(objects).expect("populate store")
}
