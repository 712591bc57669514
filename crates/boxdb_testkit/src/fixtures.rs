//! Test fixtures and store helpers.
//!
//! Provides throwaway stores and a small two-entity model that most
//! scenario tests share:
//!
//! ```text
//! Person (1)                          Team (2)
//!   1 id       Long  ID                 1 id     Long  ID
//!   2 name     String INDEXED           2 title  String
//!   3 age      Int
//!   4 score    Double
//!   5 email    String UNIQUE
//!   6 tags     StringVector
//!   7 team     Relation -> Team
//!   relation friends (1) -> Person
//! ```

use boxdb_codec::{ObjectRecord, Value};
use boxdb_core::{Model, ModelBuilder, PropertyFlags, PropertyType, SchemaId, Store, StoreOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Person entity ID.
pub const PERSON: SchemaId = 1;
/// Team entity ID.
pub const TEAM: SchemaId = 2;

/// Person property IDs.
pub mod person {
    use boxdb_core::SchemaId;

    /// `id`
    pub const ID: SchemaId = 1;
    /// `name`, indexed
    pub const NAME: SchemaId = 2;
    /// `age`
    pub const AGE: SchemaId = 3;
    /// `score`
    pub const SCORE: SchemaId = 4;
    /// `email`, unique
    pub const EMAIL: SchemaId = 5;
    /// `tags`
    pub const TAGS: SchemaId = 6;
    /// `team`, to-one relation to Team
    pub const TEAM: SchemaId = 7;
    /// Standalone `friends` relation to Person.
    pub const FRIENDS: SchemaId = 1;
}

/// Team property IDs.
pub mod team {
    use boxdb_core::SchemaId;

    /// `id`
    pub const ID: SchemaId = 1;
    /// `title`
    pub const TITLE: SchemaId = 2;
}

/// Builds the Person/Team model.
///
/// # Panics
///
/// Never for this fixed model.
pub fn person_model() -> Model {
    ModelBuilder::new()
        .entity("Person", PERSON, 1000)
        .property("id", PropertyType::Long, person::ID, 1001)
        .property_flags(PropertyFlags::ID)
        .property("name", PropertyType::String, person::NAME, 1002)
        .property_flags(PropertyFlags::INDEXED)
        .property_index_id(1, 1100)
        .property("age", PropertyType::Int, person::AGE, 1003)
        .property("score", PropertyType::Double, person::SCORE, 1004)
        .property("email", PropertyType::String, person::EMAIL, 1005)
        .property_flags(PropertyFlags::UNIQUE)
        .property_index_id(2, 1101)
        .property("tags", PropertyType::StringVector, person::TAGS, 1006)
        .property("team", PropertyType::Relation, person::TEAM, 1007)
        .property_relation("Team", 3, 1102)
        .relation(person::FRIENDS, 1200, PERSON, 1000)
        .entity("Team", TEAM, 2000)
        .property("id", PropertyType::Long, team::ID, 2001)
        .property_flags(PropertyFlags::ID)
        .property("title", PropertyType::String, team::TITLE, 2002)
        .build()
        .expect("fixture model is valid")
}

/// Builder of encoded Person objects.
#[derive(Debug, Clone, Default)]
pub struct PersonRecord {
    record: ObjectRecord,
}

impl PersonRecord {
    /// Starts a person with a name.
    pub fn new(name: &str) -> Self {
        Self {
            record: ObjectRecord::new().with(person::NAME, name),
        }
    }

    /// Sets the age.
    #[must_use]
    pub fn age(mut self, age: i64) -> Self {
        self.record.set(person::AGE, Value::Integer(age));
        self
    }

    /// Sets the score.
    #[must_use]
    pub fn score(mut self, score: f64) -> Self {
        self.record.set(person::SCORE, Value::Float(score));
        self
    }

    /// Sets the unique email.
    #[must_use]
    pub fn email(mut self, email: &str) -> Self {
        self.record.set(person::EMAIL, email);
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn tags(mut self, tags: &[&str]) -> Self {
        let tags: Vec<String> = tags.iter().map(|t| (*t).to_string()).collect();
        self.record.set(person::TAGS, Value::from(tags));
        self
    }

    /// Points the team relation at a Team ID.
    #[must_use]
    pub fn team(mut self, team: u64) -> Self {
        self.record.set(person::TEAM, Value::from(team));
        self
    }

    /// Sets the ID field, as an object carrying its own ID would.
    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.record.set(person::ID, Value::from(id));
        self
    }

    /// Encodes the object with padding.
    pub fn encode(&self) -> Vec<u8> {
        self.record.encode_padded()
    }
}

/// Encodes a Team object.
pub fn team_record(title: &str) -> Vec<u8> {
    ObjectRecord::new().with(team::TITLE, title).encode_padded()
}

/// Reads the name of an encoded Person.
///
/// # Panics
///
/// If the bytes are not a Person object with a name.
pub fn name_of(data: &[u8]) -> String {
    ObjectRecord::decode(data)
        .expect("valid object")
        .get(person::NAME)
        .and_then(Value::as_text)
        .expect("person has a name")
        .to_string()
}

/// A store that cleans up after itself.
pub struct TestStore {
    /// The store.
    pub store: Store,
    dir: Option<TempDir>,
}

static MEMORY_STORES: AtomicUsize = AtomicUsize::new(0);

impl TestStore {
    /// Opens an in-memory store with the Person/Team model.
    ///
    /// # Panics
    ///
    /// If the store cannot be opened.
    pub fn memory() -> Self {
        let n = MEMORY_STORES.fetch_add(1, Ordering::Relaxed);
        let options = StoreOptions::new()
            .directory(format!("memory:testkit-{n}"))
            .model(person_model());
        Self {
            store: Store::open(options).expect("open in-memory store"),
            dir: None,
        }
    }

    /// Opens a store in a fresh temporary directory.
    ///
    /// # Panics
    ///
    /// If the directory or store cannot be created.
    pub fn file() -> Self {
        Self::file_with(|options| options)
    }

    /// Opens a store in a fresh temporary directory with adjusted options.
    ///
    /// # Panics
    ///
    /// If the directory or store cannot be created.
    pub fn file_with(adjust: impl FnOnce(StoreOptions) -> StoreOptions) -> Self {
        let dir = TempDir::new().expect("create temp directory");
        let options = adjust(StoreOptions::new().directory(dir.path()).model(person_model()));
        Self {
            store: Store::open(options).expect("open file store"),
            dir: Some(dir),
        }
    }

    /// Directory of a file store.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// Closes the store and opens the same directory again.
    ///
    /// # Panics
    ///
    /// For in-memory stores, or if close or open fails.
    pub fn reopen(self) -> Self {
        self.reopen_with(|options| options)
    }

    /// Closes the store and opens the directory again with adjusted options.
    ///
    /// # Panics
    ///
    /// For in-memory stores, or if close or open fails.
    pub fn reopen_with(self, adjust: impl FnOnce(StoreOptions) -> StoreOptions) -> Self {
        let Self { store, dir } = self;
        let dir = dir.expect("only file stores can be reopened");
        store.close().expect("close store");
        drop(store);
        let options = adjust(StoreOptions::new().directory(dir.path()).model(person_model()));
        Self {
            store: Store::open(options).expect("reopen store"),
            dir: Some(dir),
        }
    }

    /// Takes the directory out, closing the store.
    ///
    /// # Panics
    ///
    /// For in-memory stores, or if close fails.
    pub fn into_dir(self) -> TempDir {
        let Self { store, dir } = self;
        store.close().expect("close store");
        dir.expect("only file stores have a directory")
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test against a fresh in-memory store.
pub fn with_memory_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let store = TestStore::memory();
    f(&store)
}

/// Runs a test against a fresh file store and its directory.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store, &Path) -> R,
{
    let store = TestStore::file();
    let path: PathBuf = store.path().map(Path::to_path_buf).unwrap_or_default();
    f(&store, &path)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Names of the people [`league`] creates, in ID order.
    pub const LEAGUE: [(&str, i64, f64); 6] = [
        ("Ann", 31, 1.5),
        ("Bob", 25, 2.5),
        ("carl", 40, 0.5),
        ("Dora", 19, 3.0),
        ("Eve", 52, 4.5),
        ("frank", 25, 2.0),
    ];

    /// Two teams and six people, alternating between them.
    ///
    /// Teams get IDs 1 (Red) and 2 (Blue); people get IDs 1 to 6.
    ///
    /// # Panics
    ///
    /// If a put fails.
    pub fn league(store: &Store) -> Vec<u64> {
        let teams = store.entity_box(TEAM).expect("team box");
        let red = teams.put(0, team_record("Red")).expect("put team");
        let blue = teams.put(0, team_record("Blue")).expect("put team");
        let people = store.entity_box(PERSON).expect("person box");
        LEAGUE
            .iter()
            .enumerate()
            .map(|(i, (name, age, score))| {
                let team = if i % 2 == 0 { red } else { blue };
                let data = PersonRecord::new(name)
                    .age(*age)
                    .score(*score)
                    .email(&format!("{}@example.com", name.to_lowercase()))
                    .tags(&[*name, "member"])
                    .team(team)
                    .encode();
                people.put(0, data).expect("put person")
            })
            .collect()
    }
}
