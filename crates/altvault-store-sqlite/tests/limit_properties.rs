//! Property checks over randomized operation sequences.

use std::collections::HashSet;
use std::path::Path;

use altvault_core::{AltEngine, AltId, IdentityId};
use altvault_store_sqlite::{open_vault, SqliteBackend};
use proptest::prelude::*;

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

#[derive(Debug, Clone)]
enum LimitOp {
    Create,
    Raise(i64),
}

fn limit_ops() -> impl Strategy<Value = Vec<LimitOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(LimitOp::Create),
            1 => (0i64..=2).prop_map(LimitOp::Raise),
        ],
        1..40,
    )
}

fn rename_ops() -> impl Strategy<Value = Vec<(usize, Option<&'static str>)>> {
    prop::collection::vec(
        (0usize..3, prop::option::of(prop::sample::select(&["a", "b", "c"][..]))),
        1..30,
    )
}

proptest! {
    /// The alt count never exceeds the limit, whatever order creations
    /// and raises arrive in.
    #[test]
    fn alt_count_never_exceeds_the_limit(ops in limit_ops()) {
        let mut engine = vault();
        let user = identity("P1");
        must(engine.ensure_exist(&user));

        for op in ops {
            match op {
                LimitOp::Create => {
                    let _ = must(engine.create_alt(&user));
                }
                LimitOp::Raise(amount) => {
                    must(engine.add_limit(&user, amount));
                }
            }
            let count = must(engine.alt_count(&user));
            let limit = must(engine.get_limit(&user));
            prop_assert!(count <= u64::from(limit));
        }
    }

    /// No sequence of renames can leave two alts with the same display
    /// name; the unique index converts would-be duplicates into
    /// conflict outcomes.
    #[test]
    fn display_names_stay_unique(ops in rename_ops()) {
        let mut engine = vault();
        let user = identity("P2");
        must(engine.ensure_exist(&user));
        must(engine.add_limit(&user, 2));
        must(engine.create_alt(&user));
        must(engine.create_alt(&user));

        let alts: Vec<AltId> = (0..3).map(|index| AltId::derived(&user, index)).collect();

        for (target, name) in ops {
            must(engine.rename_alt(&user, &alts[target], name));

            let mut seen = HashSet::new();
            for entry in must(engine.list_alts(&user)) {
                if let Some(name) = entry.display_name {
                    prop_assert!(seen.insert(name), "duplicate display name");
                }
            }
        }
    }
}
