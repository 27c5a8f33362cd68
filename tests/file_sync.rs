//! Integration test: file commands over a loopback WebSocket.
//!
//! Digests are checked against an independent SHA-256 of the local bytes.

mod common;

use futures_util::SinkExt;
use graphsync::protocol::FileHeader;
use graphsync::{Client, FileRef, LocalFile, SyncError, BLOCK_SIZE};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use common::{exchange, raw_connect, request_frames, start, write_file, TestServer};

fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn file_ref(id: &str, name: &str) -> FileRef {
    FileRef::new(id, name).unwrap()
}

async fn logged_in(server: &TestServer) -> Client {
    let mut client = Client::new(&server.url);
    client.login("{}").await.unwrap();
    client
}

#[tokio::test]
async fn file_commands_need_login() {
    let server = start().await;
    let local = TempDir::new().unwrap();
    let path = write_file(local.path(), "report.txt", b"early");

    let mut client = Client::new(&server.url);
    match client.files_update(&[LocalFile::new("ex:doc", &path)]).await {
        Err(SyncError::Remote(text)) => assert!(text.starts_with("ERROR: NoSession:"), "{}", text),
        other => panic!("Expected NoSession, got {:?}", other),
    }
    assert_eq!(std::fs::read_dir(server.files_dir()).unwrap().count(), 0);

    client.login("{}").await.unwrap();
    client.files_update(&[LocalFile::new("ex:doc", &path)]).await.unwrap();
}

#[tokio::test]
async fn update_persists_with_owner_prefix() {
    let server = start().await;
    let local = TempDir::new().unwrap();
    let contents = b"quarterly numbers".to_vec();
    let path = write_file(local.path(), "report.txt", &contents);

    let mut client = logged_in(&server).await;
    let hashes = client.files_update(&[LocalFile::new("ex:doc", &path)]).await.unwrap();

    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[0].id, "ex:doc");
    assert_eq!(hashes[0].name, "report.txt");
    assert_eq!(hashes[0].stored, "(ex%3Adoc)report.txt");
    assert_eq!(hashes[0].sha256, sha256(&contents));

    let stored = std::fs::read(server.files_dir().join("(ex%3Adoc)report.txt")).unwrap();
    assert_eq!(stored, contents);
}

#[tokio::test]
async fn same_name_different_owners_kept_apart() {
    let server = start().await;
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let path_a = write_file(a.path(), "notes.txt", b"from a");
    let path_b = write_file(b.path(), "notes.txt", b"from b");

    let mut client = logged_in(&server).await;
    client.files_update(&[LocalFile::new("ex:a", &path_a)]).await.unwrap();
    client.files_update(&[LocalFile::new("ex:b", &path_b)]).await.unwrap();

    let hashes = client
        .files_hash(&[file_ref("ex:a", "notes.txt"), file_ref("ex:b", "notes.txt")])
        .await
        .unwrap();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes[0].sha256, sha256(b"from a"));
    assert_eq!(hashes[1].sha256, sha256(b"from b"));
}

#[tokio::test]
async fn owners_differing_only_in_punctuation_kept_apart() {
    let server = start().await;
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let path_a = write_file(a.path(), "f.txt", b"underscore");
    let path_b = write_file(b.path(), "f.txt", b"slash");

    let mut client = logged_in(&server).await;
    let first = client.files_update(&[LocalFile::new("urn:x:a_b", &path_a)]).await.unwrap();
    let second = client.files_update(&[LocalFile::new("urn:x:a/b", &path_b)]).await.unwrap();
    assert_ne!(first[0].stored, second[0].stored);

    let dest = TempDir::new().unwrap();
    let fetched = client
        .files_fetch(&[file_ref("urn:x:a_b", "f.txt"), file_ref("urn:x:a/b", "f.txt")], dest.path())
        .await
        .unwrap();
    assert_eq!(fetched.len(), 2);
    assert_eq!(std::fs::read(&fetched[0]).unwrap(), b"underscore");
    assert_eq!(std::fs::read(&fetched[1]).unwrap(), b"slash");
}

#[cfg(unix)]
#[tokio::test]
async fn unchanged_upload_leaves_stored_file_alone() {
    use std::os::unix::fs::MetadataExt;

    let server = start().await;
    let local = TempDir::new().unwrap();
    let path = write_file(local.path(), "same.txt", b"steady");
    let stored = server.files_dir().join("(ex%3Adoc)same.txt");

    let mut client = logged_in(&server).await;
    client.files_update(&[LocalFile::new("ex:doc", &path)]).await.unwrap();
    let before = std::fs::metadata(&stored).unwrap();

    let hashes = client.files_update(&[LocalFile::new("ex:doc", &path)]).await.unwrap();
    let after = std::fs::metadata(&stored).unwrap();

    assert_eq!(hashes[0].sha256, sha256(b"steady"));
    assert_eq!(before.ino(), after.ino());
    assert_eq!(before.mtime_nsec(), after.mtime_nsec());

    std::fs::write(&path, b"moved on").unwrap();
    client.files_update(&[LocalFile::new("ex:doc", &path)]).await.unwrap();
    assert_ne!(std::fs::metadata(&stored).unwrap().ino(), before.ino());
    assert_eq!(std::fs::read(&stored).unwrap(), b"moved on");
}

#[tokio::test]
async fn fetch_multi_block_file() {
    let server = start().await;
    let local = TempDir::new().unwrap();
    let contents: Vec<u8> = (0..BLOCK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
    let path = write_file(local.path(), "blob.bin", &contents);

    let mut client = logged_in(&server).await;
    client.files_update(&[LocalFile::new("ex:blob", &path)]).await.unwrap();

    let dest = TempDir::new().unwrap();
    let fetched = client
        .files_fetch(&[file_ref("ex:blob", "blob.bin")], dest.path())
        .await
        .unwrap();

    assert_eq!(fetched, vec![dest.path().join("(ex%3Ablob)blob.bin")]);
    let bytes = std::fs::read(&fetched[0]).unwrap();
    assert_eq!(sha256(&bytes), sha256(&contents));
}

#[tokio::test]
async fn fetch_response_carries_files_to_handler() {
    let server = start().await;
    let local = TempDir::new().unwrap();
    let path = write_file(local.path(), "a.txt", b"alpha");

    let mut client = logged_in(&server).await;
    client.files_update(&[LocalFile::new("ex:x", &path)]).await.unwrap();

    let payload = graphsync::graph::jsonld::to_string(&[file_ref("ex:x", "a.txt").to_triple()]);
    let (names, digests, existed) = client
        .send_with("FILES_FETCH", &payload, &[], |response| {
            let names: Vec<String> = response.files.iter().map(|f| f.name.clone()).collect();
            let digests: Vec<String> = response.files.iter().map(|f| f.sha256.clone()).collect();
            (names, digests, response.files[0].path.exists())
        })
        .await
        .unwrap();

    assert_eq!(names, vec!["(ex%3Ax)a.txt".to_string()]);
    assert_eq!(digests, vec![sha256(b"alpha")]);
    assert!(existed);
}

#[tokio::test]
async fn hash_skips_missing_files() {
    let server = start().await;
    let local = TempDir::new().unwrap();
    let path = write_file(local.path(), "present.txt", b"here");

    let mut client = logged_in(&server).await;
    client.files_update(&[LocalFile::new("ex:doc", &path)]).await.unwrap();

    let hashes = client
        .files_hash(&[file_ref("ex:doc", "present.txt"), file_ref("ex:doc", "absent.txt")])
        .await
        .unwrap();
    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[0].name, "present.txt");
}

#[tokio::test]
async fn sync_uploads_only_changed_files() {
    let server = start().await;
    let local = TempDir::new().unwrap();
    let one = write_file(local.path(), "one.txt", b"1");
    let two = write_file(local.path(), "two.txt", b"2");
    let files = [LocalFile::new("ex:doc", &one), LocalFile::new("ex:doc", &two)];

    let mut client = logged_in(&server).await;
    assert_eq!(client.sync_files(&files).await.unwrap().len(), 2);
    assert!(client.sync_files(&files).await.unwrap().is_empty());

    std::fs::write(&two, b"2, revised").unwrap();
    let uploaded = client.sync_files(&files).await.unwrap();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].name, "two.txt");
    assert_eq!(uploaded[0].sha256, sha256(b"2, revised"));
}

#[tokio::test]
async fn delete_then_rename_errors() {
    let server = start().await;
    let local = TempDir::new().unwrap();
    let path = write_file(local.path(), "draft.txt", b"draft");

    let mut client = logged_in(&server).await;
    client.files_update(&[LocalFile::new("ex:doc", &path)]).await.unwrap();

    client
        .files_rename(&[file_ref("ex:doc", "draft.txt")], &[file_ref("ex:doc", "final.txt")])
        .await
        .unwrap();
    let hashes = client
        .files_hash(&[file_ref("ex:doc", "draft.txt"), file_ref("ex:doc", "final.txt")])
        .await
        .unwrap();
    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[0].stored, "(ex%3Adoc)final.txt");

    let deleted = client.files_delete(&[file_ref("ex:doc", "final.txt")]).await.unwrap();
    assert_eq!(deleted, vec!["(ex%3Adoc)final.txt".to_string()]);
    assert!(client.files_delete(&[file_ref("ex:doc", "final.txt")]).await.unwrap().is_empty());

    match client
        .files_rename(&[file_ref("ex:doc", "final.txt")], &[file_ref("ex:doc", "other.txt")])
        .await
    {
        Err(SyncError::Remote(text)) => assert!(text.starts_with("ERROR: FileNotFound:"), "{}", text),
        other => panic!("Expected FileNotFound, got {:?}", other),
    }

    match client.files_fetch(&[file_ref("ex:doc", "final.txt")], local.path()).await {
        Err(SyncError::Remote(text)) => assert!(text.starts_with("ERROR: FileNotFound:"), "{}", text),
        other => panic!("Expected FileNotFound, got {:?}", other),
    }
    assert!(client.is_connected());
}

#[tokio::test]
async fn duplicate_attachment_names_keep_stream_aligned() {
    let server = start().await;
    let (mut sink, mut frames) = raw_connect(&server.url).await;
    let text = exchange(&mut sink, &mut frames, request_frames("LOGIN", "{}", 0)).await;
    assert_eq!(text, "OK");

    let mut request = request_frames("FILES_UPDATE", "", 2);
    for body in [b"first".to_vec(), b"second".to_vec()] {
        request.push(FileHeader { num_blocks: 1, name: "a.txt".to_string() }.encode().unwrap());
        request.push(body);
    }
    let text = exchange(&mut sink, &mut frames, request).await;
    assert!(text.starts_with("ERROR: DuplicateFile:"), "{}", text);

    let text = exchange(&mut sink, &mut frames, request_frames("FILES_HASH", "[]", 0)).await;
    assert_eq!(text, r#"{"files":[]}"#);
    sink.close().await.unwrap();
}
