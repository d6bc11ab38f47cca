//! End-to-end snapshot behaviour through the public `Vfs` interface

use futures::future::{BoxFuture, FutureExt};
use rand::RngCore;
use snapfs::{
    Error, FormatOptions, FsConfig, InodeKind, MemBlockDevice, OpenFlags, Vfs, BLOCK_SIZE,
};
use std::collections::BTreeMap;
use std::sync::Arc;

async fn new_vfs(blocks: u64, inode_count: Option<u64>) -> Vfs {
    env_logger::builder().is_test(true).try_init().ok();
    let device = Arc::new(MemBlockDevice::new(blocks));
    let options = FormatOptions {
        inode_count,
        ..Default::default()
    };
    Vfs::format(device, &options, FsConfig::default())
        .await
        .expect("format")
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Path -> contents for every file below `dir`, skipping `skip` at the root
fn dump<'a>(
    vfs: &'a Vfs,
    dir: String,
    skip: Option<&'a str>,
    out: &'a mut BTreeMap<String, Vec<u8>>,
) -> BoxFuture<'a, ()> {
    async move {
        for entry in vfs.read_dir(&dir).await.expect("read_dir") {
            if entry.name == "." || entry.name == ".." || Some(entry.name.as_str()) == skip {
                continue;
            }
            let path = format!("{}/{}", dir.trim_end_matches('/'), entry.name);
            match entry.kind {
                Some(InodeKind::Directory) => {
                    out.insert(format!("{}/", path), Vec::new());
                    dump(vfs, path, None, out).await;
                }
                Some(InodeKind::File) => {
                    let data = vfs.read_file(&path).await.expect("read_file");
                    out.insert(path, data);
                }
                _ => {
                    out.insert(path, Vec::new());
                }
            }
        }
    }
    .boxed()
}

async fn live_tree(vfs: &Vfs) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    dump(vfs, "/".to_string(), Some("snapshot"), &mut out).await;
    out
}

async fn refcounts(vfs: &Vfs, paths: &[&str]) -> BTreeMap<u64, u32> {
    let mut counts = BTreeMap::new();
    for path in paths {
        for mapping in vfs.block_addrs(path).await.expect("block_addrs") {
            counts.insert(mapping.physical, mapping.refs);
        }
    }
    counts
}

#[tokio::test]
async fn test_rollback_scenario() {
    let vfs = new_vfs(4096, None).await;
    vfs.write_file("/a", b"x").await.unwrap();
    vfs.mkdir("/b").await.unwrap();
    vfs.write_file("/b/c", b"y").await.unwrap();

    assert_eq!(vfs.snapshot_create().await.unwrap(), 1);
    vfs.write_file("/a", b"z").await.unwrap();
    assert_eq!(vfs.read_file("/snapshot/01/a").await.unwrap(), b"x");

    vfs.snapshot_rollback(1).await.unwrap();
    assert_eq!(vfs.read_file("/a").await.unwrap(), b"x");
    assert_eq!(vfs.read_file("/b/c").await.unwrap(), b"y");
    assert_eq!(vfs.read_file("/snapshot/01/a").await.unwrap(), b"x");
    assert!(vfs.scrub(false).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_inode_exhaustion_rejects_snapshot() {
    let vfs = new_vfs(2048, Some(64)).await;

    // The first snapshot needs one inode per live object plus the
    // snapshot root and the namespace directory.
    let mut files = 0u64;
    loop {
        let free = vfs.free_inodes().await.unwrap();
        if free < files + 2 {
            break;
        }
        vfs.write_file(&format!("/f{}", files), b"data").await.unwrap();
        files += 1;
    }

    let free_before = vfs.free_inodes().await.unwrap();
    let blocks_before = vfs.free_blocks();
    assert!(matches!(vfs.snapshot_create().await, Err(Error::NoFreeInodes)));

    assert!(matches!(vfs.stat("/snapshot").await, Err(Error::NotFound(_))));
    assert_eq!(vfs.free_inodes().await.unwrap(), free_before);
    assert_eq!(vfs.free_blocks(), blocks_before);
    assert!(vfs.list_snapshots().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_block_exhaustion_mid_walk_removes_partial_snapshot() {
    let vfs = new_vfs(512, Some(128)).await;
    for i in 0..5 {
        vfs.mkdir(&format!("/d{}", i)).await.unwrap();
    }

    // Leave room for the namespace, the snapshot root and one copied
    // directory; the second copied directory runs out of blocks.
    let mut files = 0;
    while vfs.free_blocks() > 3 {
        let blocks = (vfs.free_blocks() - 3).min(10) as usize;
        vfs.write_file(&format!("/f{}", files), &random_bytes(blocks * BLOCK_SIZE))
            .await
            .unwrap();
        files += 1;
    }
    assert_eq!(vfs.free_blocks(), 3);
    let before = live_tree(&vfs).await;
    let free_inodes = vfs.free_inodes().await.unwrap();

    assert!(matches!(vfs.snapshot_create().await, Err(Error::NoFreeBlocks)));

    let names: Vec<String> = vfs
        .read_dir("/snapshot")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![".", ".."]);
    assert!(vfs.list_snapshots().await.unwrap().is_empty());
    assert_eq!(vfs.free_inodes().await.unwrap(), free_inodes - 1);
    assert_eq!(vfs.free_blocks(), 2);
    assert_eq!(live_tree(&vfs).await, before);
    assert!(vfs.scrub(false).await.unwrap().is_clean());

    // With space back the next attempt reuses the id.
    vfs.unlink("/f0").await.unwrap();
    assert_eq!(vfs.snapshot_create().await.unwrap(), 1);
    assert!(vfs.scrub(false).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_refcount_conservation() {
    let vfs = new_vfs(4096, None).await;
    vfs.write_file("/small", b"tiny").await.unwrap();
    vfs.mkdir("/d").await.unwrap();
    vfs.write_file("/d/large", &random_bytes(BLOCK_SIZE * 30)).await.unwrap();
    let paths = ["/small", "/d/large"];

    let before = refcounts(&vfs, &paths).await;
    assert!(before.values().all(|&c| c == 1));

    let id = vfs.snapshot_create().await.unwrap();
    let shared = refcounts(&vfs, &paths).await;
    assert_eq!(shared.len(), before.len());
    for (block, count) in &before {
        assert_eq!(shared[block], count + 1, "block {}", block);
    }

    vfs.snapshot_delete(id).await.unwrap();
    assert_eq!(refcounts(&vfs, &paths).await, before);
    assert!(vfs.scrub(false).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_write_isolation() {
    let vfs = new_vfs(4096, None).await;
    let original = random_bytes(BLOCK_SIZE * 20);
    vfs.write_file("/f", &original).await.unwrap();
    vfs.snapshot_create().await.unwrap();

    // One write in the direct range, one beyond it.
    let mut file = vfs.open("/f", OpenFlags::WRITE_ONLY).await.unwrap();
    vfs.write(&mut file, b"DIRECT").await.unwrap();
    file.seek((BLOCK_SIZE * 15 + 7) as u64);
    vfs.write(&mut file, b"INDIRECT").await.unwrap();
    vfs.close(file).await.unwrap();

    let mut expected = original.clone();
    expected[..6].copy_from_slice(b"DIRECT");
    expected[BLOCK_SIZE * 15 + 7..BLOCK_SIZE * 15 + 15].copy_from_slice(b"INDIRECT");
    assert_eq!(vfs.read_file("/f").await.unwrap(), expected);
    assert_eq!(vfs.read_file("/snapshot/01/f").await.unwrap(), original);

    let live = vfs.block_addrs("/f").await.unwrap();
    let snap = vfs.block_addrs("/snapshot/01/f").await.unwrap();
    let live_indirect = live.iter().find(|m| m.logical.is_none()).unwrap();
    let snap_indirect = snap.iter().find(|m| m.logical.is_none()).unwrap();
    assert_ne!(live_indirect.physical, snap_indirect.physical);
    assert_eq!(live_indirect.refs, 1);
    assert_eq!(snap_indirect.refs, 1);

    for (l, s) in live.iter().zip(snap.iter()).filter(|(l, _)| l.logical.is_some()) {
        let touched = matches!(l.logical, Some(0) | Some(15));
        assert_eq!(l.physical != s.physical, touched, "logical {:?}", l.logical);
        assert_eq!(l.refs, if touched { 1 } else { 2 });
    }
    assert!(vfs.scrub(false).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_snapshot_namespace_is_immutable() {
    let vfs = new_vfs(4096, None).await;
    vfs.mkdir("/d").await.unwrap();
    vfs.write_file("/d/f", b"frozen").await.unwrap();
    vfs.snapshot_create().await.unwrap();

    let mut before = BTreeMap::new();
    dump(&vfs, "/snapshot".to_string(), None, &mut before).await;

    let denied = |r: snapfs::Result<()>| matches!(r, Err(Error::SnapshotReadOnly(_)));
    assert!(denied(vfs.write_file("/snapshot/01/d/f", b"thawed").await));
    assert!(denied(vfs.write_file("/snapshot/01/new", b"x").await));
    assert!(denied(vfs.mkdir("/snapshot/02").await));
    assert!(denied(vfs.mknod("/snapshot/01/d/dev", 1, 0).await));
    assert!(denied(vfs.unlink("/snapshot/01/d/f").await));
    assert!(denied(vfs.link("/d/f", "/snapshot/01/d/g").await));
    assert!(denied(vfs.link("/snapshot/01/d/f", "/d/g").await));
    assert!(denied(vfs.unlink("/d/../snapshot/01/d/f").await));

    let mut after = BTreeMap::new();
    dump(&vfs, "/snapshot".to_string(), None, &mut after).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_delete_missing_snapshot_changes_nothing() {
    let vfs = new_vfs(4096, None).await;
    vfs.write_file("/f", &random_bytes(BLOCK_SIZE * 3)).await.unwrap();
    vfs.snapshot_create().await.unwrap();

    let counts = refcounts(&vfs, &["/f"]).await;
    let listing = vfs.read_dir("/snapshot").await.unwrap();

    assert!(matches!(vfs.snapshot_delete(7).await, Err(Error::NotFound(_))));
    assert!(matches!(vfs.snapshot_rollback(7).await, Err(Error::NotFound(_))));

    assert_eq!(refcounts(&vfs, &["/f"]).await, counts);
    assert_eq!(vfs.read_dir("/snapshot").await.unwrap(), listing);
}

#[tokio::test]
async fn test_round_trip() {
    let vfs = new_vfs(4096, None).await;
    vfs.mkdir("/etc").await.unwrap();
    vfs.mkdir("/etc/conf.d").await.unwrap();
    vfs.write_file("/etc/conf.d/net", b"dhcp").await.unwrap();
    vfs.write_file("/etc/motd", b"").await.unwrap();
    vfs.write_file("/blob", &random_bytes(BLOCK_SIZE * 12 + 99)).await.unwrap();
    vfs.link("/blob", "/blob-link").await.unwrap();

    let before = live_tree(&vfs).await;
    let id = vfs.snapshot_create().await.unwrap();
    vfs.snapshot_rollback(id).await.unwrap();
    assert_eq!(live_tree(&vfs).await, before);

    // Rolling back after changes discards them.
    vfs.write_file("/etc/motd", b"changed").await.unwrap();
    vfs.unlink("/etc/conf.d/net").await.unwrap();
    vfs.write_file("/extra", b"new").await.unwrap();
    vfs.snapshot_rollback(id).await.unwrap();

    assert_eq!(live_tree(&vfs).await, before);
    assert!(vfs.scrub(false).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_device_nodes_are_not_snapshotted() {
    let vfs = new_vfs(4096, None).await;
    vfs.mknod("/console", 1, 1).await.unwrap();
    vfs.write_file("/f", b"kept").await.unwrap();
    vfs.snapshot_create().await.unwrap();

    assert!(matches!(vfs.stat("/snapshot/01/console").await, Err(Error::NotFound(_))));
    assert_eq!(vfs.read_file("/snapshot/01/f").await.unwrap(), b"kept");
}

#[tokio::test]
async fn test_ids_and_listing() {
    let vfs = new_vfs(4096, None).await;
    vfs.write_file("/f", b"1").await.unwrap();
    for expected in 1..=3 {
        assert_eq!(vfs.snapshot_create().await.unwrap(), expected);
    }
    vfs.snapshot_delete(2).await.unwrap();
    assert_eq!(vfs.snapshot_create().await.unwrap(), 2);

    let listed: Vec<_> = vfs
        .list_snapshots()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.path)
        .collect();
    assert_eq!(listed, vec!["/snapshot/01", "/snapshot/02", "/snapshot/03"]);

    let stats = vfs.snapshot_stats().await.unwrap();
    assert_eq!(stats.total_snapshots, 3);
    assert_eq!(stats.free_ids, 96);
    assert_eq!(vfs.block_addrs("/f").await.unwrap()[0].refs, 4);
}

#[tokio::test]
async fn test_concurrent_writers_to_shared_file() {
    let vfs = Arc::new(new_vfs(4096, None).await);
    let original = random_bytes(BLOCK_SIZE * 16);
    vfs.write_file("/shared", &original).await.unwrap();
    vfs.link("/shared", "/alias").await.unwrap();
    vfs.write_file("/other", &original).await.unwrap();
    vfs.snapshot_create().await.unwrap();

    let mut tasks = Vec::new();
    for (i, path) in ["/shared", "/other"].into_iter().enumerate() {
        let vfs = Arc::clone(&vfs);
        tasks.push(tokio::spawn(async move {
            let mut file = vfs.open(path, OpenFlags::WRITE_ONLY).await?;
            for bn in 0..16u64 {
                file.seek(bn * BLOCK_SIZE as u64);
                vfs.write(&mut file, &[i as u8 + 1; 32]).await?;
            }
            vfs.close(file).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(vfs.read_file("/snapshot/01/shared").await.unwrap(), original);
    assert_eq!(vfs.read_file("/snapshot/01/other").await.unwrap(), original);
    assert_eq!(vfs.read_file("/alias").await.unwrap(), vfs.read_file("/shared").await.unwrap());
    assert!(vfs.scrub(false).await.unwrap().is_clean());
}
