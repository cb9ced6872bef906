//! Integration tests for the resource stores

use sdsio::{DirKV, KVBuffers, KVError, MemKV, OpenMode, Resource};

#[tokio::test]
async fn test_memkv_open_write_then_read() {
    let kv = MemKV::new();

    let mut resource = kv.open("test.0.sds", OpenMode::Write).await.unwrap();
    Resource::append(&mut resource, b"hello world").unwrap();
    assert_eq!(resource.len(), 11);

    let mut reader = kv.open("test.0.sds", OpenMode::Read).await.unwrap();
    let mut out = [0u8; 5];
    assert_eq!(Resource::read_at(&mut reader, 6, &mut out).unwrap(), 5);
    assert_eq!(&out, b"world");
    assert_eq!(Resource::read_at(&mut reader, 11, &mut out).unwrap(), 0);
    assert!(kv.exists("test.0.sds").await.unwrap());
}

#[tokio::test]
async fn test_memkv_write_never_replaces() {
    let kv = MemKV::new();
    let mut resource = kv.open("taken.0.sds", OpenMode::Write).await.unwrap();
    Resource::append(&mut resource, b"kept").unwrap();

    assert!(matches!(
        kv.open("taken.0.sds", OpenMode::Write).await,
        Err(KVError::Exists(path)) if path == "taken.0.sds"
    ));
    let stored = kv.open("taken.0.sds", OpenMode::Read).await.unwrap();
    assert_eq!(&*stored.lock(), b"kept");
}

#[tokio::test]
async fn test_memkv_read_not_found() {
    let kv = MemKV::new();

    match kv.open("nonexistent", OpenMode::Read).await {
        Err(KVError::NotFound(path)) => assert_eq!(path, "nonexistent"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dirkv_appends_go_straight_to_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let kv = DirKV::new(dir.path()).unwrap();
    let file = dir.path().join("temp.0.sds");

    let mut resource = kv.open("temp.0.sds", OpenMode::Write).await.unwrap();
    assert!(kv.exists("temp.0.sds").await.unwrap());
    assert_eq!(std::fs::read(&file).unwrap(), b"");

    resource.append(b"\x01\x02\x03").unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"\x01\x02\x03");
    resource.append(b"\x04").unwrap();
    assert_eq!(resource.len(), 4);

    // Dropped without sync, as after a lost connection.
    drop(resource);
    assert_eq!(std::fs::read(&file).unwrap(), b"\x01\x02\x03\x04");
}

#[tokio::test]
async fn test_dirkv_reads_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old.0.sds"), b"0123456789").unwrap();

    let kv = DirKV::new(dir.path()).unwrap();
    let mut resource = kv.open("old.0.sds", OpenMode::Read).await.unwrap();
    assert_eq!(resource.len(), 10);

    let mut out = [0u8; 4];
    assert_eq!(resource.read_at(0, &mut out).unwrap(), 4);
    assert_eq!(&out, b"0123");
    assert_eq!(resource.read_at(8, &mut out).unwrap(), 2);
    assert_eq!(&out[..2], b"89");
    assert_eq!(resource.read_at(10, &mut out).unwrap(), 0);
}

#[tokio::test]
async fn test_dirkv_missing_and_existing() {
    let dir = tempfile::tempdir().unwrap();
    let kv = DirKV::new(dir.path().join("nested")).unwrap();

    assert!(matches!(
        kv.open("missing.0.sds", OpenMode::Read).await,
        Err(KVError::NotFound(_))
    ));
    assert!(!kv.exists("missing.0.sds").await.unwrap());

    let mut resource = kv.open("a.0.sds", OpenMode::Write).await.unwrap();
    resource.append(b"data").unwrap();
    resource.sync().unwrap();
    assert!(matches!(
        kv.open("a.0.sds", OpenMode::Write).await,
        Err(KVError::Exists(_))
    ));
    assert_eq!(std::fs::read(kv.root().join("a.0.sds")).unwrap(), b"data");
}
