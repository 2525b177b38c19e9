use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::persist::{INDEX_FILE, load_index};
use super::*;
use crate::error::BlockError;
use crate::manager::{BlockClient, BlockRequest};
use crate::types::{Block, BlockId};

#[derive(Default)]
struct Recorded {
    blocks: HashMap<BlockId, Vec<u8>>,
    broadcasts: Vec<Mutation>,
    collected: Vec<BlockId>,
}

/// In-memory stand-in for the manager's block pipeline.
fn fake_blocks(fail_puts: Arc<AtomicBool>) -> (BlockClient, Arc<Mutex<Recorded>>) {
    let (tx, mut rx) = mpsc::channel(16);
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let state = recorded.clone();
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let mut state = state.lock().unwrap();
            match req {
                BlockRequest::Put { block, reply } => {
                    if fail_puts.load(Ordering::SeqCst) {
                        let _ = reply.send(Err(BlockError::NoDisks));
                    } else {
                        state.blocks.insert(block.id, block.data);
                        let _ = reply.send(Ok(()));
                    }
                }
                BlockRequest::Get { block_id, reply } => {
                    let data = state.blocks.get(&block_id).cloned().unwrap_or_default();
                    let _ = reply.send(Ok(Block::new(block_id, data)));
                }
                BlockRequest::Broadcast(mutation) => state.broadcasts.push(mutation),
                BlockRequest::Collect(block_id) => state.collected.push(block_id),
            }
        }
    });
    (BlockClient::new(tx), recorded)
}

struct Harness {
    fs: FileSystem,
    blocks: BlockClient,
    remote: mpsc::UnboundedSender<Mutation>,
    recorded: Arc<Mutex<Recorded>>,
    fail_puts: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    dir: tempfile::TempDir,
}

fn start(index: FileIndex) -> Harness {
    let dir = tempfile::TempDir::new().unwrap();
    let fail_puts = Arc::new(AtomicBool::new(false));
    let (blocks, recorded) = fake_blocks(fail_puts.clone());
    let (remote, remote_rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (fs, task) = spawn_filesystem(
        index,
        dir.path().join(INDEX_FILE),
        blocks.clone(),
        remote_rx,
        8,
        shutdown_rx,
    );
    Harness {
        fs,
        blocks,
        remote,
        recorded,
        fail_puts,
        shutdown,
        task,
        dir,
    }
}

impl Harness {
    /// Waits until the fake has handled everything sent before this call.
    async fn settle(&self) {
        self.blocks.get(BlockId::from("settle")).await.unwrap();
    }
}

fn rw() -> OpenOptions {
    OpenOptions::new().read(true).write(true)
}

#[test]
fn open_options_reject_contradictions() {
    assert!(OpenOptions::new().validate().is_err());
    assert!(OpenOptions::new().read(true).create(true).validate().is_err());
    assert!(OpenOptions::new().read(true).append(true).validate().is_err());
    assert!(rw().truncate(true).append(true).validate().is_err());
    assert!(rw().create_new(true).validate().is_ok());
    assert!(OpenOptions::new().write(true).append(true).validate().is_ok());
}

#[tokio::test]
async fn write_then_read_back() {
    let h = start(FileIndex::new());
    h.fs.write_file("/hello.txt", b"hello world").await.unwrap();

    let file = h.fs.stat("/hello.txt").await.unwrap();
    assert_eq!(file.size, 11);
    assert!(!file.is_dir());
    assert_eq!(h.fs.read_file("/hello.txt").await.unwrap(), b"hello world");

    let stored = h.recorded.lock().unwrap().blocks.get(&file.block_id).cloned();
    assert_eq!(stored.as_deref(), Some(&b"hello world"[..]));
}

#[tokio::test]
async fn missing_file_without_create_is_not_found() {
    let h = start(FileIndex::new());
    let err = h.fs.open("/nope").await.unwrap_err();
    assert!(matches!(err, FsError::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn create_new_refuses_existing_file() {
    let h = start(FileIndex::new());
    h.fs.write_file("/a", b"x").await.unwrap();
    let opts = rw().create_new(true);
    let err = h.fs.open_file("/a", opts, 0o644).await.unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)), "{err:?}");
}

#[tokio::test]
async fn positional_writes_zero_fill_and_append_goes_to_end() {
    let h = start(FileIndex::new());
    let mut f = h
        .fs
        .open_file("/f", rw().create(true), 0o644)
        .await
        .unwrap();
    f.write(b"abc").await.unwrap();
    assert_eq!(f.seek(SeekFrom::Start(5)).await.unwrap(), 5);
    f.write(b"z").await.unwrap();
    f.close().await.unwrap();
    assert_eq!(h.fs.read_file("/f").await.unwrap(), b"abc\0\0z");

    let mut f = h
        .fs
        .open_file("/f", OpenOptions::new().write(true).append(true), 0)
        .await
        .unwrap();
    f.seek(SeekFrom::Start(0)).await.unwrap();
    f.write(b"!").await.unwrap();
    f.close().await.unwrap();
    assert_eq!(h.fs.read_file("/f").await.unwrap(), b"abc\0\0z!");
    assert_eq!(h.fs.stat("/f").await.unwrap().size, 7);
}

#[tokio::test]
async fn reads_advance_and_hit_end_of_file() {
    let h = start(FileIndex::new());
    h.fs.write_file("/f", b"0123456789").await.unwrap();

    let mut f = h.fs.open("/f").await.unwrap();
    assert_eq!(f.read(4).await.unwrap(), b"0123");
    assert_eq!(f.read(4).await.unwrap(), b"4567");
    assert_eq!(f.read(4).await.unwrap(), b"89");
    assert!(f.read(4).await.unwrap().is_empty());

    assert_eq!(f.seek(SeekFrom::End(-3)).await.unwrap(), 7);
    assert_eq!(f.read(10).await.unwrap(), b"789");
    assert_eq!(f.seek(SeekFrom::Current(-11)).await, Err(FsError::NegativeSeek));
    assert!(f.read(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn access_mode_is_enforced() {
    let h = start(FileIndex::new());
    h.fs.write_file("/f", b"data").await.unwrap();

    let mut ro = h.fs.open("/f").await.unwrap();
    assert_eq!(ro.write(b"x").await, Err(FsError::NotWritable));

    let mut wo = h
        .fs
        .open_file("/f", OpenOptions::new().write(true), 0)
        .await
        .unwrap();
    assert_eq!(wo.read(1).await, Err(FsError::NotReadable));
}

#[tokio::test]
async fn failed_put_leaves_file_untouched() {
    let h = start(FileIndex::new());
    h.fs.write_file("/f", b"keep").await.unwrap();

    let mut f = h.fs.open_file("/f", rw(), 0).await.unwrap();
    h.fail_puts.store(true, Ordering::SeqCst);
    let err = f.write(b"lost").await.unwrap_err();
    assert_eq!(err, FsError::BlockPut(BlockError::NoDisks));
    h.fail_puts.store(false, Ordering::SeqCst);

    assert_eq!(h.fs.stat("/f").await.unwrap().size, 4);
    assert_eq!(f.read(10).await.unwrap(), b"keep");
}

#[tokio::test]
async fn directories_list_children_in_batches() {
    let h = start(FileIndex::new());
    h.fs.mkdir("/dir", 0o755).await.unwrap();
    for name in ["a", "b", "c"] {
        h.fs.write_file(&format!("/dir/{name}"), b"").await.unwrap();
    }
    h.fs.mkdir("/dir/sub", 0o755).await.unwrap();
    h.fs.write_file("/dir/sub/deep", b"").await.unwrap();

    let mut d = h.fs.open("/dir").await.unwrap();
    assert_eq!(d.readdir(-1).await, Err(FsError::NegativeCount));
    let first = d.readdir(2).await.unwrap();
    let rest = d.readdir(0).await.unwrap();
    let names: Vec<String> = first
        .iter()
        .chain(rest.iter())
        .map(|f| f.name().to_string())
        .collect();
    assert_eq!(names, ["a", "b", "c", "sub"]);
    assert!(d.readdir(0).await.unwrap().is_empty());

    let root = h.fs.read_dir("/").await.unwrap();
    assert_eq!(root.len(), 1);
    assert!(root[0].is_dir());

    let err = h
        .fs
        .open_file("/dir", rw(), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::IsADirectory(_)), "{err:?}");
}

#[tokio::test]
async fn rename_moves_subtree_and_broadcasts_upsert_before_delete() {
    let h = start(FileIndex::new());
    h.fs.mkdir("/a", 0o755).await.unwrap();
    h.fs.write_file("/a/f", b"content").await.unwrap();
    let block_id = h.fs.stat("/a/f").await.unwrap().block_id;
    h.settle().await;
    h.recorded.lock().unwrap().broadcasts.clear();

    h.fs.rename("/a", "/b").await.unwrap();
    assert!(matches!(h.fs.stat("/a/f").await, Err(FsError::NotFound(_))));
    let moved = h.fs.stat("/b/f").await.unwrap();
    assert_eq!(moved.block_id, block_id);
    assert_eq!(h.fs.read_file("/b/f").await.unwrap(), b"content");

    h.settle().await;
    let broadcasts = h.recorded.lock().unwrap().broadcasts.clone();
    assert_eq!(broadcasts.len(), 4);
    assert!(matches!(&broadcasts[0], Mutation::Upsert(f) if f.path.to_string() == "/b"));
    assert!(matches!(&broadcasts[1], Mutation::Delete(f) if f.path.to_string() == "/a"));
}

#[tokio::test]
async fn open_handle_follows_rename() {
    let h = start(FileIndex::new());
    h.fs.write_file("/old", b"x").await.unwrap();
    let mut f = h.fs.open_file("/old", rw(), 0).await.unwrap();
    h.fs.rename("/old", "/new").await.unwrap();
    f.write(b"y").await.unwrap();
    assert_eq!(f.stat().await.unwrap().path.to_string(), "/new");
    assert_eq!(h.fs.read_file("/new").await.unwrap(), b"y");
}

#[tokio::test]
async fn remove_all_drops_subtree_and_collects_blocks() {
    let h = start(FileIndex::new());
    h.fs.mkdir("/d", 0o755).await.unwrap();
    h.fs.write_file("/d/f", b"x").await.unwrap();
    let dir_block = h.fs.stat("/d").await.unwrap().block_id;
    let file_block = h.fs.stat("/d/f").await.unwrap().block_id;

    h.fs.remove_all("/d").await.unwrap();
    assert!(h.fs.read_dir("/").await.unwrap().is_empty());
    h.fs.remove_all("/d").await.unwrap();
    assert!(h.fs.remove_all("/").await.is_err());

    h.settle().await;
    let collected = h.recorded.lock().unwrap().collected.clone();
    assert!(collected.contains(&dir_block));
    assert!(collected.contains(&file_block));
}

#[tokio::test]
async fn remote_mutations_are_applied_and_released_blocks_collected() {
    let h = start(FileIndex::new());
    let file = File::new_file(FsPath::parse("/remote").unwrap(), 0o644);
    h.remote.send(Mutation::Upsert(file.clone())).unwrap();

    let mut seen = None;
    for _ in 0..50 {
        if let Ok(f) = h.fs.stat("/remote").await {
            seen = Some(f);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(seen, Some(file.clone()));

    h.remote.send(Mutation::Delete(file.clone())).unwrap();
    for _ in 0..50 {
        if h.fs.stat("/remote").await.is_err() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(h.fs.stat("/remote").await.is_err());
    h.settle().await;
    assert!(h.recorded.lock().unwrap().collected.contains(&file.block_id));
}

#[tokio::test]
async fn index_is_persisted_and_saved_on_shutdown() {
    let h = start(FileIndex::new());
    h.fs.mkdir("/keep", 0o755).await.unwrap();
    h.fs.write_file("/keep/f", b"abc").await.unwrap();

    let index_path = h.dir.path().join(INDEX_FILE);
    let saved = load_index(&index_path).await.unwrap();
    assert_eq!(saved.len(), 2);

    h.shutdown.send(true).unwrap();
    h.task.await.unwrap();
    let saved = load_index(&index_path).await.unwrap();
    let f = saved.get(&FsPath::parse("/keep/f").unwrap()).unwrap();
    assert_eq!(f.size, 3);
    assert_eq!(h.fs.stat("/").await, Err(FsError::Stopped));
}

#[tokio::test]
async fn closing_twice_is_a_bad_handle() {
    let h = start(FileIndex::new());
    h.fs.write_file("/f", b"").await.unwrap();
    let f = h.fs.open("/f").await.unwrap();
    let id = f.id();
    f.close().await.unwrap();

    let (reply, rx) = tokio::sync::oneshot::channel();
    h.fs.tx
        .send(FsRequest::Close {
            handle: id,
            reply: Some(reply),
        })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), Err(FsError::BadHandle));
}

#[tokio::test]
async fn readdir_on_a_file_is_not_a_directory() {
    let h = start(FileIndex::new());
    h.fs.write_file("/f", b"data").await.unwrap();
    let mut f = h.fs.open("/f").await.unwrap();
    let err = f.readdir(0).await.unwrap_err();
    assert!(matches!(err, FsError::NotADirectory(_)), "{err:?}");
}

#[tokio::test]
async fn writes_past_the_block_limit_are_refused() {
    let h = start(FileIndex::new());
    h.fs.write_file("/f", b"abc").await.unwrap();
    let mut f = h.fs.open_file("/f", rw(), 0).await.unwrap();

    assert_eq!(f.seek(SeekFrom::Start(u64::MAX)).await.unwrap(), u64::MAX);
    assert_eq!(f.write(b"x").await, Err(FsError::FileTooLarge));
    assert_eq!(f.seek(SeekFrom::Start(1 << 40)).await.unwrap(), 1 << 40);
    assert_eq!(f.write(b"x").await, Err(FsError::FileTooLarge));

    // The filesystem keeps serving and the file is unchanged.
    assert_eq!(f.stat().await.unwrap().size, 3);
    f.seek(SeekFrom::Start(3)).await.unwrap();
    f.write(b"d").await.unwrap();
    f.close().await.unwrap();
    assert_eq!(h.fs.read_file("/f").await.unwrap(), b"abcd");
}

#[tokio::test]
async fn truncating_open_keeps_old_content_until_something_is_stored() {
    let h = start(FileIndex::new());
    h.fs.write_file("/a.txt", b"old").await.unwrap();
    h.settle().await;
    h.recorded.lock().unwrap().broadcasts.clear();

    let mut f = h.fs.create("/a.txt").await.unwrap();
    assert_eq!(f.file().size, 0);
    assert_eq!(f.stat().await.unwrap().size, 0);
    assert!(f.read(10).await.unwrap().is_empty());
    assert_eq!(h.fs.stat("/a.txt").await.unwrap().size, 3);

    h.fail_puts.store(true, Ordering::SeqCst);
    let err = f.write(b"new").await.unwrap_err();
    assert_eq!(err, FsError::BlockPut(BlockError::NoDisks));
    assert_eq!(
        f.close().await,
        Err(FsError::BlockPut(BlockError::NoDisks))
    );
    h.fail_puts.store(false, Ordering::SeqCst);

    assert_eq!(h.fs.read_file("/a.txt").await.unwrap(), b"old");
    assert_eq!(h.fs.stat("/a.txt").await.unwrap().size, 3);
    h.settle().await;
    assert!(h.recorded.lock().unwrap().broadcasts.is_empty());

    // With nothing written, closing commits the truncation.
    let f = h.fs.create("/a.txt").await.unwrap();
    f.close().await.unwrap();
    assert_eq!(h.fs.stat("/a.txt").await.unwrap().size, 0);
    assert!(h.fs.read_file("/a.txt").await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_write_file_keeps_previous_state() {
    let h = start(FileIndex::new());
    h.fs.write_file("/f", b"old").await.unwrap();
    h.settle().await;
    h.recorded.lock().unwrap().broadcasts.clear();

    h.fail_puts.store(true, Ordering::SeqCst);
    assert_eq!(
        h.fs.write_file("/f", b"new").await,
        Err(FsError::BlockPut(BlockError::NoDisks))
    );
    assert_eq!(
        h.fs.write_file("/g", b"new").await,
        Err(FsError::BlockPut(BlockError::NoDisks))
    );
    h.fail_puts.store(false, Ordering::SeqCst);

    assert_eq!(h.fs.read_file("/f").await.unwrap(), b"old");
    assert!(matches!(h.fs.stat("/g").await, Err(FsError::NotFound(_))));
    h.settle().await;
    assert!(h.recorded.lock().unwrap().broadcasts.is_empty());

    h.fs.write_file("/f", b"new").await.unwrap();
    assert_eq!(h.fs.read_file("/f").await.unwrap(), b"new");
    h.settle().await;
    let sizes: Vec<u64> = h
        .recorded
        .lock()
        .unwrap()
        .broadcasts
        .iter()
        .map(|m| m.file().size)
        .collect();
    assert_eq!(sizes, [3]);
}

#[tokio::test]
async fn dropped_handle_closes_even_when_the_queue_is_full() {
    let (tx, mut rx) = mpsc::channel(1);
    let fs = FileSystem::new(tx);
    let (reply, _pending) = tokio::sync::oneshot::channel();
    fs.tx
        .send(FsRequest::Stat {
            path: "/".to_string(),
            reply,
        })
        .await
        .unwrap();

    let handle = FileHandle {
        id: HandleId(7),
        file: File::new_file(FsPath::parse("/f").unwrap(), 0o644),
        fs: fs.clone(),
        closed: false,
    };
    drop(handle);

    assert!(matches!(rx.recv().await, Some(FsRequest::Stat { .. })));
    assert!(matches!(
        rx.recv().await,
        Some(FsRequest::Close {
            handle: HandleId(7),
            reply: None
        })
    ));
}
