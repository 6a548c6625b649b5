//! End-to-end behavior of the engine over a live SQLite database.

use std::path::Path;

use altvault_core::{AltEngine, AltId, Backend, IdentityId, RenameOutcome};
use altvault_store_sqlite::{open_vault, validate_schema, SqliteBackend};

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn vault() -> AltEngine<SqliteBackend> {
    must(open_vault(Path::new(":memory:")))
}

fn identity(raw: &str) -> IdentityId {
    must(IdentityId::new(raw))
}

fn alt(raw: &str) -> AltId {
    must(AltId::new(raw))
}

#[test]
fn bootstrap_is_idempotent() {
    let mut engine = vault();
    let user = identity("U1");

    must(engine.ensure_exist(&user));
    must(engine.ensure_exist(&user));

    assert_eq!(must(engine.alt_count(&user)), 1);
    assert_eq!(must(engine.get_limit(&user)), 1);
    assert_eq!(must(engine.active_alt(&user)), Some(alt("U1-0")));

    let entries = must(engine.list_alts(&user));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].alt_id, alt("U1-0"));
    assert_eq!(entries[0].display_name, None);
    assert_eq!(entries[0].label, "U1-0");
}

#[test]
fn second_bootstrap_keeps_the_session_pointer() {
    let mut engine = vault();
    let user = identity("U1");

    must(engine.ensure_exist(&user));
    assert!(must(engine.add_limit(&user, 1)));
    let created = must(engine.create_alt(&user));
    assert_eq!(created, Some(alt("U1-1")));
    assert!(must(engine.switch_active_alt(&user, &alt("U1-1"))));

    must(engine.ensure_exist(&user));
    assert_eq!(must(engine.active_alt(&user)), Some(alt("U1-1")));
    assert_eq!(must(engine.alt_count(&user)), 2);
}

#[test]
fn limit_blocks_creation_until_raised() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));

    // Default limit of one is already consumed by the primary alt.
    assert_eq!(must(engine.create_alt(&user)), None);
    assert_eq!(must(engine.alt_count(&user)), 1);

    assert!(must(engine.add_limit(&user, 1)));
    assert_eq!(must(engine.get_limit(&user)), 2);

    assert_eq!(must(engine.create_alt(&user)), Some(alt("U1-1")));
    assert_eq!(must(engine.create_alt(&user)), None);
}

#[test]
fn negative_limit_amount_is_rejected_without_mutation() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));

    assert!(!must(engine.add_limit(&user, -1)));
    assert_eq!(must(engine.get_limit(&user)), 1);
}

#[test]
fn get_limit_materializes_an_unseen_identity() {
    let mut engine = vault();
    let user = identity("lazy");

    assert_eq!(must(engine.get_limit(&user)), 1);

    let status = must(engine.identity_status(&user));
    let status = status.unwrap_or_else(|| panic!("identity row should exist after get_limit"));
    assert_eq!(status.alt_count, 0);
    assert_eq!(status.active_alt_id, None);
}

#[test]
fn rename_round_trips_through_name_lookup() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));
    must(engine.add_limit(&user, 1));
    must(engine.create_alt(&user));

    let outcome = must(engine.rename_alt(&user, &alt("U1-1"), Some("Shadow")));
    assert_eq!(outcome, RenameOutcome::Renamed);
    assert_eq!(must(engine.alt_name(&user, &alt("U1-1"))), Some("Shadow".to_string()));
    assert_eq!(must(engine.alt_id_by_name(&user, "Shadow")), Some(alt("U1-1")));

    // Renaming to the name it already holds stays Renamed.
    let again = must(engine.rename_alt(&user, &alt("U1-1"), Some("Shadow")));
    assert_eq!(again, RenameOutcome::Renamed);
}

#[test]
fn rename_collision_leaves_both_names_unchanged() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));
    must(engine.add_limit(&user, 1));
    must(engine.create_alt(&user));
    must(engine.rename_alt(&user, &alt("U1-1"), Some("Shadow")));

    let outcome = must(engine.rename_alt(&user, &alt("U1-0"), Some("Shadow")));
    assert_eq!(outcome, RenameOutcome::NameConflict);

    assert_eq!(must(engine.alt_name(&user, &alt("U1-0"))), None);
    assert_eq!(must(engine.alt_name(&user, &alt("U1-1"))), Some("Shadow".to_string()));
}

#[test]
fn rename_of_a_foreign_or_missing_alt_is_not_found() {
    let mut engine = vault();
    let a = identity("A");
    let b = identity("B");
    must(engine.ensure_exist(&a));
    must(engine.ensure_exist(&b));

    let foreign = must(engine.rename_alt(&a, &alt("B-0"), Some("Stolen")));
    assert_eq!(foreign, RenameOutcome::NotFound);
    assert_eq!(must(engine.alt_name(&b, &alt("B-0"))), None);

    let missing = must(engine.rename_alt(&a, &alt("A-7"), Some("Ghost")));
    assert_eq!(missing, RenameOutcome::NotFound);
}

#[test]
fn clearing_a_name_restores_the_alt_id_label() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));
    must(engine.rename_alt(&user, &alt("U1-0"), Some("Main")));

    let outcome = must(engine.rename_alt(&user, &alt("U1-0"), None));
    assert_eq!(outcome, RenameOutcome::Renamed);

    assert_eq!(must(engine.alt_id_by_name(&user, "Main")), None);
    let entries = must(engine.list_alts(&user));
    assert_eq!(entries[0].label, "U1-0");
    assert_eq!(entries[0].display_name, None);
}

#[test]
fn two_unnamed_alts_can_coexist() {
    // The unique index must not treat two NULL names as a conflict.
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));
    must(engine.add_limit(&user, 1));

    assert_eq!(must(engine.create_alt(&user)), Some(alt("U1-1")));
    assert_eq!(must(engine.alt_count(&user)), 2);
}

#[test]
fn switch_to_a_foreign_alt_fails_and_changes_nothing() {
    let mut engine = vault();
    let a = identity("A");
    let b = identity("B");
    must(engine.ensure_exist(&a));
    must(engine.ensure_exist(&b));

    assert!(!must(engine.switch_active_alt(&a, &alt("B-0"))));
    assert_eq!(must(engine.active_alt(&a)), Some(alt("A-0")));
    assert_eq!(must(engine.active_alt(&b)), Some(alt("B-0")));
}

#[test]
fn switch_to_an_unknown_alt_fails() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));

    assert!(!must(engine.switch_active_alt(&user, &alt("U1-9"))));
    assert_eq!(must(engine.active_alt(&user)), Some(alt("U1-0")));
}

#[test]
fn permissions_are_scoped_to_the_owning_identity() {
    let mut engine = vault();
    let a = identity("A");
    let b = identity("B");
    must(engine.ensure_exist(&a));
    must(engine.ensure_exist(&b));

    assert!(must(engine.grant_permission(&a, &alt("A-0"), "fly")));
    assert!(must(engine.has_permission(&a, &alt("A-0"), "fly")));

    // A cannot grant onto or read from B's alt.
    assert!(!must(engine.grant_permission(&a, &alt("B-0"), "fly")));
    assert!(!must(engine.has_permission(&a, &alt("B-0"), "fly")));
    assert!(!must(engine.has_permission(&b, &alt("B-0"), "fly")));
}

#[test]
fn granting_twice_is_idempotent() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));

    assert!(must(engine.grant_permission(&user, &alt("U1-0"), "fly")));
    assert!(must(engine.grant_permission(&user, &alt("U1-0"), "fly")));
    assert!(must(engine.has_permission(&user, &alt("U1-0"), "fly")));

    let status = must(engine.identity_status(&user));
    let status = status.unwrap_or_else(|| panic!("status should exist"));
    assert_eq!(status.alts[0].permission_count, 1);
}

#[test]
fn empty_permission_names_are_rejected() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));

    assert!(!must(engine.grant_permission(&user, &alt("U1-0"), "")));
    assert!(!must(engine.grant_permission(&user, &alt("U1-0"), "   ")));
    assert!(!must(engine.has_permission(&user, &alt("U1-0"), "")));
}

#[test]
fn snapshot_bytes_round_trip_verbatim() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));

    assert_eq!(must(engine.load_snapshot(&user)), None);

    let payload = vec![0u8, 159, 146, 150, 255, 0, 42];
    assert!(must(engine.save_snapshot(&user, &payload)));
    assert_eq!(must(engine.load_snapshot(&user)), Some(payload.clone()));

    let replacement = b"{\"slots\":[]}".to_vec();
    assert!(must(engine.save_snapshot(&user, &replacement)));
    assert_eq!(must(engine.load_snapshot(&user)), Some(replacement));
}

#[test]
fn snapshots_follow_the_active_alt() {
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));
    must(engine.add_limit(&user, 1));
    must(engine.create_alt(&user));

    assert!(must(engine.save_snapshot(&user, b"primary")));
    assert!(must(engine.switch_active_alt(&user, &alt("U1-1"))));
    assert_eq!(must(engine.load_snapshot(&user)), None);

    assert!(must(engine.switch_active_alt(&user, &alt("U1-0"))));
    assert_eq!(must(engine.load_snapshot(&user)), Some(b"primary".to_vec()));
}

#[test]
fn saving_without_a_session_reports_false() {
    let mut engine = vault();
    let user = identity("no-session");

    // Materialize the identity without bootstrapping a session.
    assert_eq!(must(engine.get_limit(&user)), 1);
    assert!(!must(engine.save_snapshot(&user, b"orphan")));
    assert_eq!(must(engine.load_snapshot(&user)), None);
}

#[test]
fn status_reports_the_full_picture() {
    let mut engine = vault();
    let user = identity("U1");

    assert_eq!(must(engine.identity_status(&user)), None);

    must(engine.ensure_exist(&user));
    must(engine.add_limit(&user, 2));
    must(engine.create_alt(&user));
    must(engine.rename_alt(&user, &alt("U1-1"), Some("Shadow")));
    must(engine.grant_permission(&user, &alt("U1-1"), "fly"));
    must(engine.grant_permission(&user, &alt("U1-1"), "glow"));
    must(engine.switch_active_alt(&user, &alt("U1-1")));
    must(engine.save_snapshot(&user, b"payload"));

    let status = must(engine.identity_status(&user));
    let status = status.unwrap_or_else(|| panic!("status should exist"));
    assert_eq!(status.contract_version, "identity_status.v1");
    assert_eq!(status.identity_id, user);
    assert_eq!(status.alt_limit, 3);
    assert_eq!(status.alt_count, 2);
    assert_eq!(status.active_alt_id, Some(alt("U1-1")));

    assert_eq!(status.alts[0].alt_id, alt("U1-0"));
    assert_eq!(status.alts[0].label, "U1-0");
    assert_eq!(status.alts[0].permission_count, 0);
    assert!(!status.alts[0].has_snapshot);

    assert_eq!(status.alts[1].alt_id, alt("U1-1"));
    assert_eq!(status.alts[1].label, "Shadow");
    assert_eq!(status.alts[1].permission_count, 2);
    assert!(status.alts[1].has_snapshot);
}

#[test]
fn a_gap_in_indexes_blocks_creation_at_the_count() {
    // Alt indexes derive from COUNT(*), not MAX(index). After a row is
    // removed out-of-band the next derived id can collide with a
    // surviving higher index, which surfaces as a blocked creation.
    let mut engine = vault();
    let user = identity("U1");
    must(engine.ensure_exist(&user));
    must(engine.add_limit(&user, 5));
    must(engine.create_alt(&user));
    must(engine.create_alt(&user));

    must(engine.backend_mut().execute(
        "DELETE FROM alts WHERE alt_id = ?1",
        &["U1-1".into()],
    ));
    assert_eq!(must(engine.alt_count(&user)), 2);

    // Derived id U1-2 already exists, so the insert loses to the
    // primary key and the call reports a blocked creation.
    assert_eq!(must(engine.create_alt(&user)), None);
}

#[test]
fn full_lifecycle_scenario() {
    let mut engine = vault();
    let user = identity("U1");

    must(engine.ensure_exist(&user));
    assert_eq!(must(engine.create_alt(&user)), None);
    assert!(must(engine.add_limit(&user, 1)));
    assert_eq!(must(engine.create_alt(&user)), Some(alt("U1-1")));
    assert_eq!(
        must(engine.rename_alt(&user, &alt("U1-1"), Some("Shadow"))),
        RenameOutcome::Renamed
    );
    assert_eq!(
        must(engine.rename_alt(&user, &alt("U1-0"), Some("Shadow"))),
        RenameOutcome::NameConflict
    );
    assert!(must(engine.switch_active_alt(&user, &alt("U1-1"))));
    assert_eq!(must(engine.active_alt(&user)), Some(alt("U1-1")));

    let entries = must(engine.list_alts(&user));
    let labels: Vec<&str> = entries.iter().map(|entry| entry.label.as_str()).collect();
    assert_eq!(labels, vec!["U1-0", "Shadow"]);
}

#[test]
fn a_file_backed_vault_survives_reopening() {
    let path = std::env::temp_dir().join(format!("altvault-{}.sqlite3", ulid::Ulid::new()));

    {
        let mut engine = must(open_vault(&path));
        let user = identity("U1");
        must(engine.ensure_exist(&user));
        must(engine.save_snapshot(&user, b"persisted"));
    }

    {
        let mut engine = must(open_vault(&path));
        must(validate_schema(engine.backend().connection()));
        let user = identity("U1");
        assert_eq!(must(engine.load_snapshot(&user)), Some(b"persisted".to_vec()));
    }

    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("sqlite3-wal"));
    let _ = std::fs::remove_file(path.with_extension("sqlite3-shm"));
}
