use dimple_audit::rusqlite_migration::{Migrations, M};
use dimple_audit::{
    reconstruct, Action, AuditDb, AuditError, CaptureMode, LogFilter, ReplayMutation, RowMap, Scalar,
};

fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

fn db() -> anyhow::Result<AuditDb> {
    init_logging();
    let db = AuditDb::open_memory()?;
    db.migrate(&Migrations::new(vec![M::up(
        "
        CREATE TABLE Album (
            id     INTEGER PRIMARY KEY,
            title  TEXT NOT NULL,
            year   INTEGER,
            rating REAL
        );
        CREATE TABLE AlbumArtist (
            album_id  INTEGER NOT NULL,
            artist_id INTEGER NOT NULL,
            role      TEXT,
            PRIMARY KEY (album_id, artist_id)
        );
        ",
    )]))?;
    Ok(db)
}

fn album(id: i64, title: &str, year: i64) -> RowMap {
    RowMap::from_iter([
        ("id", Scalar::from(id)),
        ("title", Scalar::from(title)),
        ("year", Scalar::from(year)),
        ("rating", Scalar::Null),
    ])
}

fn key(id: i64) -> RowMap {
    RowMap::from_iter([("id", id)])
}

fn rows(db: &AuditDb) -> anyhow::Result<Vec<RowMap>> {
    Ok(db.query_rows("SELECT * FROM Album ORDER BY id", [])?)
}

#[test]
fn replayed_insert_recreates_the_row() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::RowLevel, false, &[])?;
    db.transaction(|txn| txn.insert("Album", &album(1, "Master of Puppets", 1986)))?;
    db.transaction(|txn| txn.delete("Album", &key(1)))?;
    assert!(rows(&db)?.is_empty());

    assert_eq!(db.replay(1)?, 1);
    assert_eq!(rows(&db)?, vec![album(1, "Master of Puppets", 1986)]);
    Ok(())
}

#[test]
fn replayed_update_touches_only_changed_fields() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::RowLevel, false, &[])?;
    db.transaction(|txn| txn.insert("Album", &album(1, "Ride the Lightning", 1984)))?;
    db.transaction(|txn| txn.update("Album", &RowMap::from_iter([("rating", 4.5)]), &key(1)))?;

    // Move the row away from the logged state, then replay.
    db.transaction(|txn| {
        txn.update(
            "Album",
            &RowMap::from_iter([("rating", Scalar::Null), ("year", Scalar::from(1999))]),
            &key(1),
        )
    })?;
    assert_eq!(db.replay(2)?, 1);

    let row = rows(&db)?.remove(0);
    assert_eq!(row.get("rating"), Some(&Scalar::Real(4.5)));
    assert_eq!(row.get("year"), Some(&Scalar::Integer(1999)));
    assert_eq!(row.get("title"), Some(&Scalar::from("Ride the Lightning")));
    Ok(())
}

#[test]
fn replayed_delete_removes_by_identity() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::RowLevel, false, &[])?;
    db.transaction(|txn| {
        txn.insert_many("Album", &[album(1, "Kill 'Em All", 1983), album(2, "...And Justice for All", 1988)])
    })?;
    db.transaction(|txn| txn.delete("Album", &key(2)))?;
    db.transaction(|txn| txn.insert("Album", &album(2, "...And Justice for All", 1988)))?;

    let delete = db.entries(&LogFilter::new().action(Action::Delete))?.remove(0);
    assert_eq!(db.replay(delete.event_id)?, 1);
    assert_eq!(rows(&db)?, vec![album(1, "Kill 'Em All", 1983)]);
    Ok(())
}

#[test]
fn replay_against_missing_row_affects_nothing() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::RowLevel, false, &[])?;
    db.transaction(|txn| txn.insert("Album", &album(1, "Load", 1996)))?;
    db.transaction(|txn| txn.update("Album", &RowMap::from_iter([("year", 1997)]), &key(1)))?;
    db.transaction(|txn| txn.truncate("Album"))?;

    assert_eq!(db.replay(2)?, 0);
    Ok(())
}

#[test]
fn composite_identity_selects_the_right_row() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("AlbumArtist", CaptureMode::RowLevel, false, &[])?;
    let credit = |album_id: i64, artist_id: i64, role: &str| {
        RowMap::from_iter([
            ("album_id", Scalar::from(album_id)),
            ("artist_id", Scalar::from(artist_id)),
            ("role", Scalar::from(role)),
        ])
    };
    db.transaction(|txn| txn.insert_many("AlbumArtist", &[credit(1, 1, "vocals"), credit(1, 2, "drums")]))?;
    db.transaction(|txn| {
        txn.update(
            "AlbumArtist",
            &RowMap::from_iter([("role", "guitar")]),
            &RowMap::from_iter([("album_id", 1), ("artist_id", 2)]),
        )
    })?;

    let update = db.entries(&LogFilter::new().action(Action::Update))?.remove(0);
    assert_eq!(update.row_id.as_deref(), Some("1,2"));

    let identity = db.identity_of("AlbumArtist")?;
    match reconstruct(&update, &identity)? {
        ReplayMutation::Update { selector, values, .. } => {
            assert_eq!(selector, RowMap::from_iter([("album_id", 1), ("artist_id", 2)]));
            assert_eq!(values, RowMap::from_iter([("role", "guitar")]));
        }
        other => panic!("expected an update, got {:?}", other),
    }
    Ok(())
}

#[test]
fn identity_change_is_replayed_against_the_old_identity() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::RowLevel, false, &[])?;
    db.transaction(|txn| txn.insert("Album", &album(1, "Reload", 1997)))?;
    db.transaction(|txn| txn.update("Album", &key(10), &key(1)))?;

    let update = db.get(2)?;
    assert_eq!(update.row_id.as_deref(), Some("10"));
    assert_eq!(update.changed_fields, Some(key(10)));

    // The selector comes from the row before the update, so replaying it once
    // the row already has its new id finds nothing.
    assert_eq!(db.replay(2)?, 0);
    Ok(())
}

#[test]
fn statement_level_entries_cannot_be_replayed() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::StatementOnly, true, &[])?;
    db.transaction(|txn| txn.insert("Album", &album(1, "St. Anger", 2003)))?;
    assert!(db.get(1)?.statement_only);

    let result = db.replay(1);
    assert!(matches!(result, Err(AuditError::Replay(_))));
    Ok(())
}

#[test]
fn excluded_identity_column_fails_replay() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::RowLevel, false, &["id"])?;
    db.transaction(|txn| txn.insert("Album", &album(1, "Death Magnetic", 2008)))?;
    db.transaction(|txn| txn.delete("Album", &key(1)))?;

    let delete = db.get(2)?;
    assert_eq!(delete.row_id.as_deref(), Some("1"));
    assert_eq!(delete.row_data.as_ref().map(|r| r.contains_key("id")), Some(false));

    let result = db.replay(2);
    assert!(matches!(result, Err(AuditError::Replay(_))));
    Ok(())
}

#[test]
fn dropped_relation_surfaces_the_store_error() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::RowLevel, false, &[])?;
    db.transaction(|txn| txn.insert("Album", &album(1, "Hardwired", 2016)))?;
    db.execute_batch("DROP TABLE Album")?;

    let result = db.replay(1);
    assert!(matches!(result, Err(AuditError::Sqlite(_))));
    Ok(())
}

#[test]
fn unknown_event_is_not_found() -> anyhow::Result<()> {
    let db = db()?;
    assert!(matches!(db.replay(42), Err(AuditError::NotFound(42))));
    Ok(())
}

#[test]
fn rollback_discards_captured_entries() -> anyhow::Result<()> {
    let db = db()?;
    db.attach("Album", CaptureMode::RowLevel, false, &[])?;
    let result: dimple_audit::Result<()> = db.transaction(|txn| {
        txn.insert("Album", &album(1, "72 Seasons", 2023))?;
        txn.insert("Album", &album(1, "72 Seasons", 2023))?;
        Ok(())
    });
    assert!(matches!(result, Err(AuditError::Sqlite(_))));
    assert_eq!(db.latest_event_id()?, None);
    assert!(rows(&db)?.is_empty());
    Ok(())
}

#[test]
fn blobs_are_replayed_as_their_text_form() -> anyhow::Result<()> {
    let db = db()?;
    db.execute_batch(
        "CREATE TABLE Cover (id INTEGER PRIMARY KEY, art BLOB);
         INSERT INTO Cover (id, art) VALUES (1, x'00ff');",
    )?;
    db.attach("Cover", CaptureMode::RowLevel, false, &[])?;
    db.transaction(|txn| txn.delete("Cover", &key(1)))?;

    let delete = db.get(1)?;
    let row_data = delete.row_data.clone().unwrap_or_default();
    assert_eq!(row_data.get("art"), Some(&Scalar::from("\\x00ff")));

    let reinsert = ReplayMutation::Insert { relation: delete.relation(), values: row_data };
    db.transaction(|txn| txn.apply(&reinsert))?;
    let stored = db.query_rows("SELECT typeof(art) AS kind, art FROM Cover", [])?;
    assert_eq!(stored, vec![RowMap::from_iter([("kind", "text"), ("art", "\\x00ff")])]);
    Ok(())
}
