mod common;

use anyhow::Result;
use lhix::{
    Completion, Engine, FragmentOptions, KeyOutcome, KeyRequest, LocalKey, LockMode, OpKind,
    Refusal, TxnId,
};

use common::{engine_with_fragment, hash_key, insert, insert_committed, req, Released, Rows, FRAG};

fn shared(key: &[u8]) -> KeyRequest<'_> {
    KeyRequest {
        lock_mode: LockMode::Shared,
        ..req(OpKind::Read, key)
    }
}

#[test]
fn shared_readers_run_in_parallel() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let a = engine.seize_lock_context(FRAG, 10, TxnId(2))?;
    let b = engine.seize_lock_context(FRAG, 11, TxnId(3))?;
    assert!(engine.key_request(a, &shared(b"k"))?.is_granted());
    assert!(engine.key_request(b, &shared(b"k"))?.is_granted());

    // An exclusive reader must wait for both.
    let c = engine.seize_lock_context(FRAG, 12, TxnId(4))?;
    assert_eq!(engine.key_request(c, &req(OpKind::Read, b"k"))?, KeyOutcome::Pending);

    engine.commit(a)?;
    assert!(engine.poll_completion().is_none());
    engine.commit(b)?;
    assert_eq!(
        engine.poll_completion(),
        Some(Completion {
            user_ref: 12,
            outcome: KeyOutcome::Granted(LocalKey(1)),
        })
    );
    engine.commit(c)?;
    Ok(())
}

#[test]
fn exclusive_holder_blocks_and_hands_over() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let a = engine.seize_lock_context(FRAG, 20, TxnId(2))?;
    assert!(engine.key_request(a, &req(OpKind::Update, b"k"))?.is_granted());

    let b = engine.seize_lock_context(FRAG, 21, TxnId(3))?;
    assert_eq!(engine.key_request(b, &shared(b"k"))?, KeyOutcome::Pending);
    assert!(engine.poll_completion().is_none());

    engine.commit(a)?;
    assert_eq!(
        engine.poll_completion(),
        Some(Completion {
            user_ref: 21,
            outcome: KeyOutcome::Granted(LocalKey(1)),
        })
    );
    engine.commit(b)?;
    Ok(())
}

#[test]
fn nowait_refuses_instead_of_queueing() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let a = engine.seize_lock_context(FRAG, 0, TxnId(2))?;
    assert!(engine.key_request(a, &req(OpKind::Update, b"k"))?.is_granted());

    let b = engine.seize_lock_context(FRAG, 1, TxnId(3))?;
    let outcome = engine.key_request(
        b,
        &KeyRequest {
            nowait: true,
            ..shared(b"k")
        },
    )?;
    assert_eq!(outcome, KeyOutcome::Refused(Refusal::LockWaitRefused));

    engine.commit(a)?;
    Ok(())
}

#[test]
fn same_transaction_upgrades_without_deadlock() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let txn = TxnId(2);
    let first = engine.seize_lock_context(FRAG, 30, txn)?;
    assert!(engine.key_request(first, &shared(b"k"))?.is_granted());

    // Upgrade by the same transaction joins the held queue.
    let upgrade = engine.seize_lock_context(FRAG, 31, txn)?;
    assert!(engine.key_request(upgrade, &req(OpKind::Read, b"k"))?.is_granted());

    // The queue is exclusive now; a foreign sharer waits.
    let foreign = engine.seize_lock_context(FRAG, 32, TxnId(3))?;
    assert_eq!(engine.key_request(foreign, &shared(b"k"))?, KeyOutcome::Pending);

    engine.commit(upgrade)?;
    engine.commit(first)?;
    assert_eq!(
        engine.poll_completion(),
        Some(Completion {
            user_ref: 32,
            outcome: KeyOutcome::Granted(LocalKey(1)),
        })
    );
    engine.commit(foreign)?;
    Ok(())
}

#[test]
fn delete_then_reinsert_collapses_in_one_transaction() -> Result<()> {
    let rows = Rows::default();
    let released = Released::default();
    let engine = Engine::builder(Box::new(rows.clone()))
        .row_deallocation(Box::new(released.clone()))
        .build();
    engine.add_fragment(FRAG, &FragmentOptions::default().hasher(hash_key))?;
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let txn = TxnId(2);
    let del = engine.seize_lock_context(FRAG, 0, txn)?;
    assert!(engine.key_request(del, &req(OpKind::Delete, b"k"))?.is_granted());

    let reinsert = insert(&engine, &rows, txn, b"k", LocalKey(2));
    engine.commit(del)?;
    engine.commit(reinsert)?;

    assert_eq!(engine.lookup(FRAG, None, b"k")?, LocalKey(2));
    // Only the replaced row version was released.
    assert_eq!(released.take(), vec![(FRAG, LocalKey(1))]);
    Ok(())
}

#[test]
fn aborted_reinsert_restores_the_doomed_row() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let txn = TxnId(2);
    let del = engine.seize_lock_context(FRAG, 0, txn)?;
    assert!(engine.key_request(del, &req(OpKind::Delete, b"k"))?.is_granted());
    let reinsert = insert(&engine, &rows, txn, b"k", LocalKey(2));

    // Roll the whole transaction back: reinsert first, then the delete.
    engine.abort(reinsert)?;
    assert_eq!(engine.lookup(FRAG, None, b"k")?, LocalKey(1));
    engine.abort(del)?;
    assert_eq!(engine.lookup(FRAG, None, b"k")?, LocalKey(1));
    Ok(())
}

#[test]
fn insert_waits_out_a_foreign_delete() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let del = engine.seize_lock_context(FRAG, 40, TxnId(2))?;
    assert!(engine.key_request(del, &req(OpKind::Delete, b"k"))?.is_granted());

    rows.put(LocalKey(2), b"k");
    let ins = engine.seize_lock_context(FRAG, 41, TxnId(3))?;
    let outcome = engine.key_request(
        ins,
        &KeyRequest {
            local_key: LocalKey(2),
            ..req(OpKind::Insert, b"k")
        },
    )?;
    assert_eq!(outcome, KeyOutcome::Pending);

    // The delete commits, the element disappears, and the waiting insert
    // revives it with its own row.
    engine.commit(del)?;
    assert_eq!(
        engine.poll_completion(),
        Some(Completion {
            user_ref: 41,
            outcome: KeyOutcome::Granted(LocalKey(2)),
        })
    );
    engine.commit(ins)?;
    assert_eq!(engine.lookup(FRAG, None, b"k")?, LocalKey(2));
    Ok(())
}

#[test]
fn insert_that_waits_out_a_surviving_element_is_refused() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let reader = engine.seize_lock_context(FRAG, 50, TxnId(2))?;
    assert!(engine.key_request(reader, &req(OpKind::Read, b"k"))?.is_granted());

    rows.put(LocalKey(2), b"k");
    let ins = engine.seize_lock_context(FRAG, 51, TxnId(3))?;
    let outcome = engine.key_request(
        ins,
        &KeyRequest {
            local_key: LocalKey(2),
            ..req(OpKind::Insert, b"k")
        },
    )?;
    assert_eq!(outcome, KeyOutcome::Pending);

    engine.commit(reader)?;
    assert_eq!(
        engine.poll_completion(),
        Some(Completion {
            user_ref: 51,
            outcome: KeyOutcome::Refused(Refusal::DuplicateKey),
        })
    );
    assert_eq!(engine.lookup(FRAG, None, b"k")?, LocalKey(1));
    Ok(())
}

#[test]
fn waiters_behind_a_committed_delete_learn_the_key_is_gone() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let del = engine.seize_lock_context(FRAG, 60, TxnId(2))?;
    assert!(engine.key_request(del, &req(OpKind::Delete, b"k"))?.is_granted());

    let reader = engine.seize_lock_context(FRAG, 61, TxnId(3))?;
    assert_eq!(engine.key_request(reader, &shared(b"k"))?, KeyOutcome::Pending);

    engine.commit(del)?;
    assert_eq!(
        engine.poll_completion(),
        Some(Completion {
            user_ref: 61,
            outcome: KeyOutcome::Refused(Refusal::KeyNotFound),
        })
    );
    // The refusal freed the waiter's record.
    assert_eq!(engine.commit(reader), Err(Refusal::InvalidRequest));
    assert_eq!(engine.lookup(FRAG, None, b"k"), Err(Refusal::KeyNotFound));
    Ok(())
}

#[test]
fn aborting_an_insert_dooms_same_transaction_followers() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);

    let txn = TxnId(1);
    let ins = insert(&engine, &rows, txn, b"k", LocalKey(1));
    let follower = engine.seize_lock_context(FRAG, 0, txn)?;
    assert!(engine.key_request(follower, &req(OpKind::Read, b"k"))?.is_granted());

    engine.abort(ins)?;
    // The follower read a row version that never existed outside the
    // transaction; it cannot commit.
    assert_eq!(engine.commit(follower), Err(Refusal::InvalidRequest));
    engine.abort(follower)?;
    assert_eq!(engine.lookup(FRAG, None, b"k"), Err(Refusal::KeyNotFound));
    Ok(())
}

#[test]
fn aborting_a_waiter_just_removes_it_from_the_queue() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    let holder = engine.seize_lock_context(FRAG, 70, TxnId(2))?;
    assert!(engine.key_request(holder, &req(OpKind::Update, b"k"))?.is_granted());
    let waiter = engine.seize_lock_context(FRAG, 71, TxnId(3))?;
    assert_eq!(engine.key_request(waiter, &shared(b"k"))?, KeyOutcome::Pending);

    engine.abort(waiter)?;
    engine.commit(holder)?;
    // Nobody was left to hand the lock to.
    assert!(engine.poll_completion().is_none());
    assert_eq!(engine.lookup(FRAG, None, b"k")?, LocalKey(1));
    Ok(())
}
