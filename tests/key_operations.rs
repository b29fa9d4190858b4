mod common;

use anyhow::Result;
use lhix::{
    Engine, FragmentId, FragmentOptions, KeyOutcome, KeyRequest, LocalKey, OpKind, Refusal, TxnId,
};

use common::{engine, engine_with_fragment, hash_key, insert, insert_committed, req, Released, Rows, FRAG};

#[test]
fn insert_read_delete_round_trip() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"alpha", LocalKey(10));

    assert_eq!(engine.lookup(FRAG, None, b"alpha")?, LocalKey(10));

    let read = engine.seize_lock_context(FRAG, 1, TxnId(2))?;
    let outcome = engine.key_request(read, &req(OpKind::Read, b"alpha"))?;
    assert_eq!(outcome, KeyOutcome::Granted(LocalKey(10)));
    engine.commit(read)?;

    let del = engine.seize_lock_context(FRAG, 2, TxnId(3))?;
    assert!(engine.key_request(del, &req(OpKind::Delete, b"alpha"))?.is_granted());
    engine.commit(del)?;

    assert_eq!(engine.lookup(FRAG, None, b"alpha"), Err(Refusal::KeyNotFound));
    Ok(())
}

#[test]
fn duplicate_insert_is_refused_and_frees_the_record() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(1));

    rows.put(LocalKey(2), b"k");
    let op = engine.seize_lock_context(FRAG, 7, TxnId(2))?;
    let outcome = engine.key_request(
        op,
        &KeyRequest {
            local_key: LocalKey(2),
            ..req(OpKind::Insert, b"k")
        },
    )?;
    assert_eq!(outcome, KeyOutcome::Refused(Refusal::DuplicateKey));
    // The refusal released the record.
    assert_eq!(engine.commit(op), Err(Refusal::InvalidRequest));
    assert_eq!(engine.lookup(FRAG, None, b"k")?, LocalKey(1));
    Ok(())
}

#[test]
fn reading_a_missing_key_is_refused() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    let op = engine.seize_lock_context(FRAG, 0, TxnId(1))?;
    let outcome = engine.key_request(op, &req(OpKind::Read, b"nothing"))?;
    assert_eq!(outcome, KeyOutcome::Refused(Refusal::KeyNotFound));
    Ok(())
}

#[test]
fn aborting_an_insert_takes_it_back_out() -> Result<()> {
    let rows = Rows::default();
    let released = Released::default();
    let engine = Engine::builder(Box::new(rows.clone()))
        .row_deallocation(Box::new(released.clone()))
        .build();
    engine.add_fragment(FRAG, &FragmentOptions::default().hasher(hash_key))?;

    let op = insert(&engine, &rows, TxnId(1), b"ephemeral", LocalKey(3));
    assert_eq!(engine.lookup(FRAG, None, b"ephemeral")?, LocalKey(3));
    engine.abort(op)?;

    assert_eq!(engine.lookup(FRAG, None, b"ephemeral"), Err(Refusal::KeyNotFound));
    assert_eq!(released.take(), vec![(FRAG, LocalKey(3))]);
    Ok(())
}

#[test]
fn committed_delete_reports_the_released_row() -> Result<()> {
    let rows = Rows::default();
    let released = Released::default();
    let engine = Engine::builder(Box::new(rows.clone()))
        .row_deallocation(Box::new(released.clone()))
        .build();
    engine.add_fragment(FRAG, &FragmentOptions::default().hasher(hash_key))?;

    insert_committed(&engine, &rows, TxnId(1), b"doomed", LocalKey(9));
    assert!(released.take().is_empty());

    let del = engine.seize_lock_context(FRAG, 0, TxnId(2))?;
    assert!(engine.key_request(del, &req(OpKind::Delete, b"doomed"))?.is_granted());
    engine.commit(del)?;
    assert_eq!(released.pending(), vec![(FRAG, LocalKey(9))]);
    assert_eq!(released.take(), vec![(FRAG, LocalKey(9))]);
    Ok(())
}

#[test]
fn dealloc_triggers_only_after_the_last_holder_leaves() -> Result<()> {
    let rows = Rows::default();
    let released = Released::default();
    let engine = Engine::builder(Box::new(rows.clone()))
        .row_deallocation(Box::new(released.clone()))
        .build();
    engine.add_fragment(FRAG, &FragmentOptions::default().hasher(hash_key))?;
    insert_committed(&engine, &rows, TxnId(1), b"held", LocalKey(5));

    // One transaction holds the row through an update while its delete
    // commits first.
    let upd = engine.seize_lock_context(FRAG, 1, TxnId(2))?;
    assert!(engine.key_request(upd, &req(OpKind::Update, b"held"))?.is_granted());
    let del = engine.seize_lock_context(FRAG, 2, TxnId(2))?;
    assert!(engine.key_request(del, &req(OpKind::Delete, b"held"))?.is_granted());
    engine.commit(del)?;

    // Doomed, but the update still references the row.
    assert_eq!(released.pending(), vec![(FRAG, LocalKey(5))]);
    assert!(released.take().is_empty());

    engine.commit(upd)?;
    assert_eq!(released.take(), vec![(FRAG, LocalKey(5))]);
    assert_eq!(engine.lookup(FRAG, None, b"held"), Err(Refusal::KeyNotFound));
    Ok(())
}

#[test]
fn vanished_row_surfaces_as_tuple_gone() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);
    insert_committed(&engine, &rows, TxnId(1), b"k", LocalKey(5));

    rows.forget(LocalKey(5));
    assert_eq!(engine.lookup(FRAG, None, b"k"), Err(Refusal::TupleGone));

    let op = engine.seize_lock_context(FRAG, 0, TxnId(2))?;
    let outcome = engine.key_request(op, &req(OpKind::Read, b"k"))?;
    assert_eq!(outcome, KeyOutcome::Refused(Refusal::TupleGone));
    Ok(())
}

#[test]
fn hash_is_required_without_a_fragment_hasher() -> Result<()> {
    let rows = Rows::default();
    let engine = engine(&rows);
    let frag = FragmentId(2);
    engine.add_fragment(frag, &FragmentOptions::default())?;

    rows.put(LocalKey(1), b"k");
    let op = engine.seize_lock_context(frag, 0, TxnId(1))?;
    let missing = engine.key_request(
        op,
        &KeyRequest {
            local_key: LocalKey(1),
            ..req(OpKind::Insert, b"k")
        },
    );
    assert_eq!(missing, Err(Refusal::InvalidRequest));

    let op = engine.seize_lock_context(frag, 0, TxnId(1))?;
    let outcome = engine.key_request(
        op,
        &KeyRequest {
            hash: Some(0x0042_1234),
            local_key: LocalKey(1),
            ..req(OpKind::Insert, b"k")
        },
    )?;
    assert!(outcome.is_granted());
    engine.commit(op)?;

    assert_eq!(engine.lookup(frag, None, b"k"), Err(Refusal::InvalidRequest));
    assert_eq!(engine.lookup(frag, Some(0x0042_1234), b"k")?, LocalKey(1));
    Ok(())
}

#[test]
fn take_over_reparents_commit_ownership() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);

    let op = insert(&engine, &rows, TxnId(1), b"k", LocalKey(1));
    engine.take_over(op, TxnId(99))?;
    engine.commit(op)?;
    assert_eq!(engine.lookup(FRAG, None, b"k")?, LocalKey(1));

    // Only executed operations can change hands.
    let idle = engine.seize_lock_context(FRAG, 0, TxnId(2))?;
    assert_eq!(engine.take_over(idle, TxnId(3)), Err(Refusal::InvalidRequest));
    Ok(())
}

#[test]
fn busy_fragment_refuses_to_drop() -> Result<()> {
    let rows = Rows::default();
    let engine = engine_with_fragment(&rows);

    let op = insert(&engine, &rows, TxnId(1), b"k", LocalKey(1));
    assert_eq!(engine.drop_fragment(FRAG), Err(Refusal::FragmentBusy));
    engine.commit(op)?;

    engine.drop_fragment(FRAG)?;
    assert_eq!(engine.lookup(FRAG, None, b"k"), Err(Refusal::UnknownFragment));
    Ok(())
}

#[test]
fn fragment_options_are_validated() {
    let rows = Rows::default();
    let engine = engine(&rows);
    let bad = FragmentOptions::default().max_load_per_bucket(0);
    assert_eq!(engine.add_fragment(FragmentId(3), &bad), Err(Refusal::InvalidRequest));
    let bad = FragmentOptions::default().max_load_per_bucket(2).min_load_per_bucket(2);
    assert_eq!(engine.add_fragment(FragmentId(3), &bad), Err(Refusal::InvalidRequest));
    let bad = FragmentOptions::default().max_pages(0);
    assert_eq!(engine.add_fragment(FragmentId(3), &bad), Err(Refusal::InvalidRequest));

    engine
        .add_fragment(FragmentId(3), &FragmentOptions::default().hasher(hash_key))
        .unwrap();
    // Duplicate id.
    assert_eq!(
        engine.add_fragment(FragmentId(3), &FragmentOptions::default()),
        Err(Refusal::InvalidRequest)
    );
}

#[test]
fn operation_records_are_budgeted_and_reused() -> Result<()> {
    let rows = Rows::default();
    let engine = Engine::builder(Box::new(rows.clone())).max_operations(1).build();
    engine.add_fragment(FRAG, &FragmentOptions::default().hasher(hash_key))?;

    let op = insert(&engine, &rows, TxnId(1), b"k", LocalKey(1));
    assert_eq!(
        engine.seize_lock_context(FRAG, 0, TxnId(2)),
        Err(Refusal::NoFreeOperation)
    );
    engine.commit(op)?;
    assert!(engine.seize_lock_context(FRAG, 0, TxnId(2)).is_ok());
    Ok(())
}

#[test]
fn a_seized_but_unused_record_aborts_back_to_the_arena() -> Result<()> {
    let rows = Rows::default();
    let engine = Engine::builder(Box::new(rows.clone())).max_operations(1).build();
    engine.add_fragment(FRAG, &FragmentOptions::default().hasher(hash_key))?;

    let op = engine.seize_lock_context(FRAG, 0, TxnId(1))?;
    // Nothing ran under it: commit has nothing to apply, abort returns it.
    assert_eq!(engine.commit(op), Err(Refusal::InvalidRequest));
    engine.abort(op)?;

    let op = engine.seize_lock_context(FRAG, 0, TxnId(2))?;
    engine.abort(op)?;
    Ok(())
}

#[test]
fn page_budget_bounds_the_index() {
    let rows = Rows::default();
    let engine = Engine::builder(Box::new(rows.clone())).page_budget(0).build();
    assert_eq!(
        engine.add_fragment(FRAG, &FragmentOptions::default().hasher(hash_key)),
        Err(Refusal::OutOfIndexMemory)
    );
}

#[test]
fn single_bucket_overflow_eventually_exhausts_one_page() -> Result<()> {
    let rows = Rows::default();
    let engine = Engine::builder(Box::new(rows.clone())).page_budget(1).build();
    // No hasher: every insert carries hash 0 and lands in bucket 0, so the
    // chain grows through every container the single page can offer.
    engine.add_fragment(FRAG, &FragmentOptions::default())?;

    let mut stored = 0u32;
    let refused = 'fill: {
        for i in 0..3000u32 {
            let key = i.to_be_bytes();
            rows.put(LocalKey(i), &key);
            let op = engine.seize_lock_context(FRAG, 0, TxnId(1))?;
            let outcome = engine.key_request(
                op,
                &KeyRequest {
                    hash: Some(0),
                    local_key: LocalKey(i),
                    ..req(OpKind::Insert, &key)
                },
            )?;
            match outcome {
                KeyOutcome::Granted(_) => {
                    engine.commit(op)?;
                    stored += 1;
                }
                KeyOutcome::Refused(refusal) => break 'fill Some(refusal),
                KeyOutcome::Pending => unreachable!("insert into an unlocked chain"),
            }
        }
        None
    };
    assert_eq!(refused, Some(Refusal::OutOfIndexMemory));
    // Everything stored before exhaustion is still addressable.
    for i in 0..stored {
        assert_eq!(engine.lookup(FRAG, Some(0), &i.to_be_bytes())?, LocalKey(i));
    }
    Ok(())
}
