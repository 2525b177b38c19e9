use tokio::sync::oneshot;

use super::write::{PutOutcome, PutTracker};
use crate::error::BlockError;
use crate::types::{BlockId, DiskId, DiskPointer, NodeId, PutBlockId};

fn ptr(node: &str, disk: &str) -> DiskPointer {
    DiskPointer::new(NodeId::from(node), DiskId::from(disk), &BlockId::from("b"))
}

#[test]
fn succeeds_only_after_every_replica() {
    let mut t = PutTracker::new();
    let (reply, mut rx) = oneshot::channel();
    let dests = [ptr("n1", "d1"), ptr("n2", "d2")];
    let id = PutBlockId::from("p");
    t.start(id.clone(), &dests, reply);

    assert_eq!(t.on_result(&id, &dests[0], Ok(())), PutOutcome::Waiting);
    assert!(rx.try_recv().is_err());

    assert_eq!(
        t.on_result(&id, &dests[1], Ok(())),
        PutOutcome::Completed(Ok(()))
    );
    assert_eq!(rx.try_recv().unwrap(), Ok(()));
    assert!(t.is_empty());
}

#[test]
fn first_error_wins_and_late_results_are_dropped() {
    let mut t = PutTracker::new();
    let (reply, mut rx) = oneshot::channel();
    let dests = [ptr("n1", "d1"), ptr("n2", "d2")];
    let id = PutBlockId::from("p");
    t.start(id.clone(), &dests, reply);

    let err = BlockError::Io("disk full".to_string());
    assert_eq!(
        t.on_result(&id, &dests[0], Err(err.clone())),
        PutOutcome::Completed(Err(err.clone()))
    );
    assert_eq!(rx.try_recv().unwrap(), Err(err));

    assert_eq!(t.on_result(&id, &dests[1], Ok(())), PutOutcome::Unknown);
    assert_eq!(
        t.on_result(&id, &dests[1], Err(BlockError::Stopped)),
        PutOutcome::Unknown
    );
}

#[test]
fn duplicate_success_from_same_disk_does_not_complete() {
    let mut t = PutTracker::new();
    let (reply, _rx) = oneshot::channel();
    let dests = [ptr("n1", "d1"), ptr("n2", "d2")];
    let id = PutBlockId::from("p");
    t.start(id.clone(), &dests, reply);

    assert_eq!(t.on_result(&id, &dests[0], Ok(())), PutOutcome::Waiting);
    assert_eq!(t.on_result(&id, &dests[0], Ok(())), PutOutcome::Waiting);
    assert_eq!(t.len(), 1);
}

#[test]
fn losing_a_node_fails_puts_waiting_on_it() {
    let mut t = PutTracker::new();
    let (reply_a, mut rx_a) = oneshot::channel();
    let (reply_b, mut rx_b) = oneshot::channel();
    t.start(
        PutBlockId::from("a"),
        &[ptr("n1", "d1"), ptr("n2", "d2")],
        reply_a,
    );
    t.start(PutBlockId::from("b"), &[ptr("n1", "d1")], reply_b);

    let failed = t.fail_node(&NodeId::from("n2"));
    assert_eq!(failed, vec![PutBlockId::from("a")]);
    assert_eq!(
        rx_a.try_recv().unwrap(),
        Err(BlockError::NoRoute(NodeId::from("n2")))
    );
    assert!(rx_b.try_recv().is_err());
    assert_eq!(t.len(), 1);
}

#[test]
fn fail_all_answers_everyone() {
    let mut t = PutTracker::new();
    let (reply, mut rx) = oneshot::channel();
    t.start(PutBlockId::from("a"), &[ptr("n1", "d1")], reply);
    t.fail_all(&BlockError::Stopped);
    assert_eq!(rx.try_recv().unwrap(), Err(BlockError::Stopped));
    assert!(t.is_empty());
}
