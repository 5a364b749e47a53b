use std::collections::BTreeMap;
use std::fs;

use pathdb::{Change, Changes, Database, Error, Result, Value, ValueKind};
use tempfile::tempdir;

fn alice_changes() -> Changes {
    let mut value = BTreeMap::new();
    value.insert("email".to_string(), Value::Text("a@x".to_string()));
    let mut changes = Changes::new();
    changes.insert(
        "users/alice/info".to_string(),
        Change {
            keyname: "user_info".to_string(),
            back_serial: -1,
            value: Some(Value::Mapping(value)),
        },
    );
    changes
}

#[test]
fn import_matches_a_normal_commit() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(dir.path())?;
    let key = db.add_key("user_info", "users/{u}/info", ValueKind::Mapping)?;
    let alice = key.resolve(&[("u", "alice")])?;

    let serial = db.import_changes(0, &alice_changes())?;
    assert_eq!(serial, 0);
    assert_eq!(db.get_current_serial(), 0);

    db.transaction(false, |tx| {
        let value = tx.get(&alice)?;
        assert_eq!(
            value.as_mapping().unwrap()["email"],
            Value::Text("a@x".to_string())
        );
        Ok(())
    })?;
    assert!(matches!(
        db.get_value_at(&alice, -1),
        Err(Error::KeyAbsent(_))
    ));
    Ok(())
}

#[test]
fn import_rejects_non_contiguous_serials() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(dir.path())?;
    db.add_key("user_info", "users/{u}/info", ValueKind::Mapping)?;

    db.import_changes(0, &alice_changes())?;
    // replaying the same serial must fail, as must a gap
    assert!(db.import_changes(0, &alice_changes()).is_err());
    assert!(db.import_changes(5, &alice_changes()).is_err());
    assert_eq!(db.get_current_serial(), 0);
    Ok(())
}

#[test]
fn sequential_imports_chain_the_history() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(dir.path())?;
    let key = db.add_key("counter", "counter", ValueKind::Int)?;
    let counter = key.typed()?;

    for (serial, value) in [(0, 10), (1, 20)] {
        let mut changes = Changes::new();
        changes.insert(
            "counter".to_string(),
            Change {
                keyname: "counter".to_string(),
                back_serial: serial - 1,
                value: Some(Value::Int(value)),
            },
        );
        assert_eq!(db.import_changes(serial, &changes)?, serial);
    }

    assert_eq!(db.get_value_at(&counter, 0)?, Value::Int(10));
    assert_eq!(db.get_value_at(&counter, 1)?, Value::Int(20));
    Ok(())
}

#[test]
fn import_subscriber_stages_side_files_with_the_commit() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(dir.path())?;
    let key = db.add_key("user_info", "users/{u}/info", ValueKind::Mapping)?;

    db.subscribe_on_import(
        &key,
        Box::new(|writer, key, value, back_serial| {
            assert_eq!(back_serial, -1);
            assert!(value.is_some());
            let user = key.param("u").unwrap_or("unknown");
            writer.stage_file(&format!("exports/{user}.marker"), b"imported")
        }),
    );

    db.import_changes(0, &alice_changes())?;
    assert_eq!(
        fs::read(dir.path().join("exports/alice.marker"))?,
        b"imported"
    );
    assert!(!dir.path().join("exports/alice.marker-tmp").exists());
    Ok(())
}

#[test]
fn failing_import_subscriber_aborts_the_batch() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(dir.path())?;
    let key = db.add_key("user_info", "users/{u}/info", ValueKind::Mapping)?;

    db.subscribe_on_import(
        &key,
        Box::new(|writer, key, _value, _back_serial| {
            let user = key.param("u").unwrap_or("unknown");
            writer.stage_file(&format!("exports/{user}.marker"), b"imported")?;
            Err(Error::Other("import hook failed".to_string()))
        }),
    );

    assert!(db.import_changes(0, &alice_changes()).is_err());
    assert_eq!(db.get_current_serial(), -1);
    // the staged file was cleaned up with the aborted writer
    assert!(!dir.path().join("exports/alice.marker").exists());
    assert!(!dir.path().join("exports/alice.marker-tmp").exists());

    // the store stays usable: the same serial can be imported again
    db.transaction(true, |tx| {
        tx.set(
            &key.resolve(&[("u", "bob")])?,
            ValueKind::Mapping.empty(),
        )
    })?;
    assert_eq!(db.get_current_serial(), 0);
    Ok(())
}

#[test]
fn import_of_unregistered_key_fails() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(dir.path())?;
    assert!(db.import_changes(0, &alice_changes()).is_err());
    assert_eq!(db.get_current_serial(), -1);
    Ok(())
}
