//! Property tests for chained ref updates.
//!
//! Any sequence of well-formed updates added to a `ChainedCommands` set must,
//! once applied as one batch, leave the repository exactly where applying
//! the updates one at a time would.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use tokio::runtime::Runtime;

use cutover_repo::{
    BatchRefUpdate, ChainedCommands, MemoryRepositoryManager, ObjectId, ObjectInserter,
    ProjectName, RawObject, ReceiveCommand, RepoError, Repository, RepositoryManager,
    execute_checked,
};

const REFS: [&str; 3] = ["refs/a", "refs/b", "refs/changes/01/1/meta"];

// Strategy for one update: which ref, and which value (None deletes).
fn update() -> impl Strategy<Value = (usize, Option<usize>)> {
    (0..REFS.len(), proptest::option::of(0usize..4))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn chained_batch_matches_sequential_model(updates in prop::collection::vec(update(), 1..30)) {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        runtime.block_on(async {
            let manager = MemoryRepositoryManager::new();
            let repo = manager.create(&ProjectName::new("p")).await.unwrap();
            let ins = ObjectInserter::loose(Arc::clone(&repo));
            let mut values = Vec::new();
            for i in 0..4 {
                values.push(ins.insert(RawObject::blob(format!("value {i}"))).await.unwrap());
            }

            let mut model: BTreeMap<&str, ObjectId> = BTreeMap::new();
            let mut cmds = ChainedCommands::new(Arc::clone(&repo));
            for (ref_idx, value_idx) in updates {
                let name = REFS[ref_idx];
                let old = ObjectId::or_zero(model.get(name).copied());
                let new = ObjectId::or_zero(value_idx.map(|i| values[i]));
                prop_assert_eq!(cmds.current(name).await.unwrap(), old.non_zero());

                let result = cmds.add(ReceiveCommand::new(name, old, new));
                if old == new {
                    let is_degenerate = matches!(result, Err(RepoError::DegenerateCommand(_)));
                    prop_assert!(is_degenerate);
                    continue;
                }
                prop_assert!(result.is_ok());
                match new.non_zero() {
                    Some(id) => model.insert(name, id),
                    None => model.remove(name),
                };
            }

            // No command in the set is ever a no-op.
            prop_assert!(cmds.commands().all(|c| !c.is_noop()));

            let update =
                BatchRefUpdate::new(cmds.into_commands()).with_allow_non_fast_forward(true);
            execute_checked(repo.as_ref(), update).await.unwrap();

            let expected: BTreeMap<String, ObjectId> = model
                .into_iter()
                .map(|(name, id)| (name.to_string(), id))
                .collect();
            prop_assert_eq!(repo.refs_by_prefix("refs/").await.unwrap(), expected);
            Ok(())
        })?;
    }

    /// A command that does not continue the pending one is rejected and the
    /// pending command is kept.
    #[test]
    fn broken_chain_is_rejected(first in 0usize..4, second in 0usize..4, stray in 0usize..4) {
        prop_assume!(stray != first && stray != second);
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        runtime.block_on(async {
            let manager = MemoryRepositoryManager::new();
            let repo = manager.create(&ProjectName::new("p")).await.unwrap();
            let ids: Vec<ObjectId> = (0..4).map(|i| RawObject::blob(format!("{i}")).id()).collect();

            let mut cmds = ChainedCommands::new(repo);
            cmds.add(ReceiveCommand::new("refs/x", ObjectId::ZERO, ids[first])).unwrap();
            let err = cmds
                .add(ReceiveCommand::new("refs/x", ids[stray], ids[second]))
                .unwrap_err();
            let is_mismatch = matches!(err, RepoError::ChainMismatch { .. });
            prop_assert!(is_mismatch);
            prop_assert_eq!(cmds.current("refs/x").await.unwrap(), Some(ids[first]));
            Ok(())
        })?;
    }
}
