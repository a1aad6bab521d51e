//! Randomised writer workloads: session numbers stay gap-free and the
//! retirement pass never hands out a block some live session still sees.

#![allow(missing_docs)]

use std::sync::Arc;

use lineage::primitives::blocks::MemBlockStore;
use lineage::session::bat::BlockSet;
use lineage::session::{Identity, MemSessionStore, SessionConfig};
use lineage::{BlockId, BlockRange, SessionId, SessionManager};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::sample::Index;
use tempfile::tempdir;

#[derive(Clone, Debug)]
enum Op {
    Alloc(u32),
    Free(Index),
    Commit,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..4).prop_map(Op::Alloc),
        any::<Index>().prop_map(Op::Free),
        Just(Op::Commit),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn commits_are_gap_free_and_keep_visible_blocks(
        ops in vec(op(), 1..60),
        keep_alive in 2u32..5,
    ) {
        let dir = tempdir().unwrap();
        let blocks = MemBlockStore::new(512);
        let sessions = MemSessionStore::new();
        let mut db = SessionManager::builder(dir.path())
            .config(SessionConfig {
                block_size: 512,
                sync_write: false,
                keep_alive,
                ..SessionConfig::default()
            })
            .identity(Identity::new("prop", "node", 1))
            .block_store(Arc::new(blocks.clone()))
            .session_store(Box::new(sessions.clone()))
            .create("prop")
            .unwrap();
        db.begin_write().unwrap();

        let mut view = BlockSet::new();
        let mut last = SessionId::FIRST;
        for op in ops {
            match op {
                Op::Alloc(n) => {
                    let range = db.allocate(n).unwrap();
                    view.insert_range(range);
                }
                Op::Free(idx) => {
                    if view.is_empty() {
                        continue;
                    }
                    let victim = view.iter().nth(idx.index(view.len())).unwrap();
                    db.free(BlockRange::new(victim, 1)).unwrap();
                    view.remove(victim);
                }
                Op::Commit => {
                    let report = db.commit().unwrap();
                    prop_assert_eq!(report.session, last.0 + 1);
                    last = SessionId(report.session);

                    let chain = db.chain().unwrap();
                    prop_assert_eq!(chain.visible_blocks(last), view.clone());
                    let in_use = chain.in_use();
                    for range in blocks.free_list() {
                        for block in range.iter() {
                            prop_assert!(
                                !in_use.contains(block),
                                "block {} is free but still referenced",
                                block
                            );
                        }
                    }
                    let first = chain.get(SessionId::FIRST).unwrap();
                    prop_assert!(first.is_live());
                }
            }
        }
        prop_assert_eq!(db.committed_session(), last);
        prop_assert_eq!(db.current_session(), Some(last.next()));
        prop_assert!(!blocks.free_list().iter().any(|r| r.start == BlockId(0)));
    }
}
