use super::*;

struct Fixture {
    _dir: tempfile::TempDir,
    handle: DiskHandle,
    events: mpsc::UnboundedReceiver<DiskEvent>,
    _shutdown: watch::Sender<bool>,
}

fn start() -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, _task) = spawn_executor(
        DiskId::from("d1"),
        dir.path().to_path_buf(),
        8,
        events_tx,
        shutdown_rx,
    );
    Fixture {
        _dir: dir,
        handle,
        events,
        _shutdown: shutdown_tx,
    }
}

fn pointer(block: &str) -> DiskPointer {
    DiskPointer::new(NodeId::from("n1"), DiskId::from("d1"), &BlockId::from(block))
}

async fn write(fx: &mut Fixture, block: &str, data: &[u8]) -> Result<(), String> {
    fx.handle
        .submit(DiskRequest::Write {
            caller: NodeId::from("n1"),
            put_id: PutBlockId::from("p1"),
            dest: pointer(block),
            block: Block::new(BlockId::from(block), data.to_vec()),
        })
        .await
        .unwrap();
    match fx.events.recv().await.unwrap() {
        DiskEvent::Written { put_id, result, .. } => {
            assert_eq!(put_id, PutBlockId::from("p1"));
            result
        }
        other => panic!("unexpected event {other:?}"),
    }
}

async fn read(fx: &mut Fixture, block: &str) -> Result<Block, String> {
    fx.handle
        .submit(DiskRequest::Read {
            caller: NodeId::from("n1"),
            get_id: GetBlockId::from("g1"),
            ptr: pointer(block),
        })
        .await
        .unwrap();
    match fx.events.recv().await.unwrap() {
        DiskEvent::Read { get_id, result, .. } => {
            assert_eq!(get_id, GetBlockId::from("g1"));
            result
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn write_then_read_returns_bytes() {
    let mut fx = start();
    write(&mut fx, "b1", b"hello").await.unwrap();

    let block = read(&mut fx, "b1").await.unwrap();
    assert_eq!(block.id, BlockId::from("b1"));
    assert_eq!(block.data, b"hello");
}

#[tokio::test]
async fn missing_block_reads_as_empty() {
    let mut fx = start();
    let block = read(&mut fx, "absent").await.unwrap();
    assert_eq!(block, Block::empty(BlockId::from("absent")));
}

#[tokio::test]
async fn rewrite_replaces_previous_content() {
    let mut fx = start();
    write(&mut fx, "b1", b"first version").await.unwrap();
    write(&mut fx, "b1", b"v2").await.unwrap();
    assert_eq!(read(&mut fx, "b1").await.unwrap().data, b"v2");
}

#[tokio::test]
async fn escaping_file_names_are_rejected() {
    let mut fx = start();
    assert!(write(&mut fx, "../outside", b"x").await.is_err());
    assert!(read(&mut fx, "..").await.is_err());
}

#[tokio::test]
async fn exists_list_and_delete() {
    let mut fx = start();
    write(&mut fx, "b1", b"one").await.unwrap();
    write(&mut fx, "b2", b"two").await.unwrap();

    assert!(fx.handle.exists(BlockId::from("b1")).await);
    assert!(!fx.handle.exists(BlockId::from("b3")).await);

    let ids = fx.handle.list_ids().await.unwrap();
    assert_eq!(
        ids,
        HashSet::from([BlockId::from("b1"), BlockId::from("b2")])
    );

    fx.handle.delete(BlockId::from("b1")).await.unwrap();
    // idempotent
    fx.handle.delete(BlockId::from("b1")).await.unwrap();
    assert!(!fx.handle.exists(BlockId::from("b1")).await);
    assert_eq!(fx.handle.fetch(BlockId::from("b2")).await.unwrap().data, b"two");
}

#[tokio::test]
async fn shutdown_stops_the_executor() {
    let dir = tempfile::TempDir::new().unwrap();
    let (events_tx, _events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, task) = spawn_executor(
        DiskId::from("d1"),
        dir.path().to_path_buf(),
        8,
        events_tx,
        shutdown_rx,
    );

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
    assert!(handle.list_ids().await.is_err());
}
