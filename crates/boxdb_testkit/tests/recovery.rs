//! Durability and crash recovery of on-disk stores.

use boxdb_core::{CoreError, Store, StoreOptions};
use boxdb_testkit::prelude::*;

fn open_image(path: &std::path::Path) -> Result<Store, CoreError> {
    Store::open(StoreOptions::new().directory(path).model(person_model()))
}

fn people_count(store: &Store) -> u64 {
    store.entity_box(PERSON).unwrap().count(0).unwrap()
}

#[test]
fn committed_data_survives_reopen() {
    let store = TestStore::file();
    let ids = scenarios::league(&store);
    let store = store.reopen();

    let people = store.entity_box(PERSON).unwrap();
    assert_eq!(people.count(0).unwrap(), 6);
    assert_eq!(name_of(&people.get(ids[2]).unwrap().unwrap()), "carl");
    assert_eq!(people.get_backlink_ids(person::TEAM, 2).unwrap(), vec![2, 4, 6]);
}

#[test]
fn ids_are_never_reused() {
    let store = TestStore::file();
    let people = store.entity_box(PERSON).unwrap();
    for name in ["a", "b", "c"] {
        people.put(0, PersonRecord::new(name).encode()).unwrap();
    }
    assert!(people.remove(3).unwrap());
    drop(people);
    let store = store.reopen();

    let id = store
        .entity_box(PERSON)
        .unwrap()
        .put(0, PersonRecord::new("d").encode())
        .unwrap();
    assert_eq!(id, 4);
}

#[test]
fn torn_data_file_tail_is_replayed_from_the_wal() {
    let store = TestStore::file();
    scenarios::league(&store);
    let image = crash_at(store.path().unwrap(), CrashPoint::DataFileTail(5));

    let recovered = open_image(image.path()).unwrap();
    assert!(recovered.recovery_report().torn_tail_bytes > 0);
    assert!(recovered.recovery_report().replayed_transactions >= 1);
    assert_eq!(people_count(&recovered), 6);
}

#[test]
fn read_only_open_of_a_torn_image_leaves_files_untouched() {
    let store = TestStore::file();
    scenarios::league(&store);
    let image = crash_at(store.path().unwrap(), CrashPoint::DataFileTail(5));
    let data_before = std::fs::read(image.path().join(DATA_FILE)).unwrap();
    let wal_before = std::fs::read(image.path().join(WAL_FILE)).unwrap();

    let reader = Store::open(
        StoreOptions::new()
            .directory(image.path())
            .model(person_model())
            .read_only(true),
    )
    .unwrap();
    assert!(reader.recovery_report().torn_tail_bytes > 0);
    assert_eq!(people_count(&reader), 6);
    drop(reader);

    assert_eq!(std::fs::read(image.path().join(DATA_FILE)).unwrap(), data_before);
    assert_eq!(std::fs::read(image.path().join(WAL_FILE)).unwrap(), wal_before);
}

#[test]
fn lost_data_file_writes_come_back_from_the_wal() {
    let store = TestStore::file();
    let checkpointed = file_len(&store.path().unwrap().join(DATA_FILE));
    let people = store.entity_box(PERSON).unwrap();
    for name in ["a", "b", "c"] {
        people.put(0, PersonRecord::new(name).encode()).unwrap();
    }
    let image = crash_at(store.path().unwrap(), CrashPoint::DataFileAt(checkpointed));

    let recovered = open_image(image.path()).unwrap();
    assert_eq!(recovered.recovery_report().replayed_transactions, 3);
    assert_eq!(people_count(&recovered), 3);
}

#[test]
fn torn_wal_tail_drops_only_the_unfinished_commit() {
    let store = TestStore::file();
    let checkpointed = file_len(&store.path().unwrap().join(DATA_FILE));
    let people = store.entity_box(PERSON).unwrap();
    for name in ["a", "b", "c"] {
        people.put(0, PersonRecord::new(name).encode()).unwrap();
    }
    let image = crash_at(store.path().unwrap(), CrashPoint::DataFileAt(checkpointed));
    truncate_tail(&image.path().join(WAL_FILE), 1).unwrap();

    let recovered = open_image(image.path()).unwrap();
    let people = recovered.entity_box(PERSON).unwrap();
    assert_eq!(people.count(0).unwrap(), 2);
    assert!(!people.contains(3).unwrap());
}

#[test]
fn damaged_wal_is_reported_as_corrupt() {
    let store = TestStore::file();
    store
        .entity_box(PERSON)
        .unwrap()
        .put(0, PersonRecord::new("a").encode())
        .unwrap();
    let image = crash_image(store.path().unwrap());
    flip_byte(&image.path().join(WAL_FILE), 20, 0x5a).unwrap();

    let err = open_image(image.path()).unwrap_err();
    assert_eq!(err.code(), 10502);
}

#[test]
fn previous_commit_can_be_restored() {
    let store = TestStore::file();
    let people = store.entity_box(PERSON).unwrap();
    people.put(0, PersonRecord::new("kept").encode()).unwrap();
    people.put(0, PersonRecord::new("dropped").encode()).unwrap();
    drop(people);
    // a checkpoint would fold both commits into the data file
    let image = crash_image(store.path().unwrap());

    let restored = Store::open(
        StoreOptions::new()
            .directory(image.path())
            .model(person_model())
            .use_previous_commit(true),
    )
    .unwrap();
    assert!(restored.opened_with_previous_commit());
    let people = restored.entity_box(PERSON).unwrap();
    assert_eq!(people.count(0).unwrap(), 1);
    assert_eq!(name_of(&people.get(1).unwrap().unwrap()), "kept");
}

#[test]
fn second_open_of_a_directory_is_locked() {
    let store = TestStore::file();
    let err = Store::open(
        StoreOptions::new()
            .directory(store.path().unwrap())
            .model(person_model()),
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::DatabaseLocked));
}

#[test]
fn removed_files_leave_nothing_behind() {
    let dir = TestStore::file().into_dir();
    assert!(boxdb_core::db_file_size(dir.path()).unwrap() > 0);
    boxdb_core::remove_db_files(dir.path()).unwrap();
    assert_eq!(boxdb_core::db_file_size(dir.path()).unwrap(), 0);
}
