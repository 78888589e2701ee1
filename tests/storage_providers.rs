use blobshift::core::{InMemoryProvider, LocalProvider, StorageError, StorageProvider};
use bytes::Bytes;
use futures::TryStreamExt;
use tempfile::tempdir;

/// Behaviour every backend must share.
async fn check_contract(provider: &dyn StorageProvider) {
    let payloads: [(&str, &[u8]); 3] = [
        ("cases/17/photo.jpg", b"\xff\xd8\xff\xe0 jpeg bytes"),
        ("cases/17/notes.txt", b"seen at 14:02"),
        ("exports/empty.bin", b""),
    ];

    for (key, data) in payloads {
        provider
            .put(key, Bytes::from_static(data), "application/octet-stream")
            .await
            .unwrap();
    }

    for (key, data) in payloads {
        assert_eq!(provider.get(key).await.unwrap().as_ref(), data, "{}", key);
        assert_eq!(provider.stat(key).await.unwrap().size, data.len() as u64);
        assert!(provider.exists(key).await.unwrap());
    }

    // Overwrite replaces the object
    provider
        .put("cases/17/notes.txt", Bytes::from_static(b"v2"), "text/plain")
        .await
        .unwrap();
    assert_eq!(
        provider.get("cases/17/notes.txt").await.unwrap().as_ref(),
        b"v2"
    );

    let mut keys: Vec<String> = provider
        .list("cases/")
        .map_ok(|info| info.key)
        .try_collect()
        .await
        .unwrap();
    keys.sort();
    assert_eq!(keys, vec!["cases/17/notes.txt", "cases/17/photo.jpg"]);

    provider.delete("cases/17/photo.jpg").await.unwrap();
    assert!(!provider.exists("cases/17/photo.jpg").await.unwrap());
    // Deleting again is not an error
    provider.delete("cases/17/photo.jpg").await.unwrap();

    let err = provider.get("cases/17/photo.jpg").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {}", err);
    assert!(provider.stat("nope").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_local_provider_contract() {
    let temp = tempdir().unwrap();
    let provider = LocalProvider::new(temp.path().join("objects"));
    check_contract(&provider).await;
}

#[tokio::test]
async fn test_memory_provider_contract() {
    check_contract(&InMemoryProvider::new("contract")).await;
}

#[tokio::test]
async fn test_local_traversal_never_escapes_root() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("objects");
    let provider = LocalProvider::new(&root);

    for key in ["../escaped.txt", "a/../../escaped.txt", "/tmp/escaped.txt"] {
        let err = provider
            .put(key, Bytes::from_static(b"nope"), "text/plain")
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::InvalidKey { .. }),
            "{} gave {}",
            key,
            err
        );

        let err = provider.get(key).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey { .. }));
    }

    assert!(!temp.path().join("escaped.txt").exists());
    assert!(!root.exists() || std::fs::read_dir(&root).unwrap().next().is_none());
}

#[tokio::test]
async fn test_local_list_is_recursive() {
    let temp = tempdir().unwrap();
    let provider = LocalProvider::new(temp.path());

    for i in 0..25 {
        let key = format!("depth/{}/{}/object-{}.bin", i % 3, i % 5, i);
        provider
            .put(&key, Bytes::from(vec![i as u8; i]), "application/octet-stream")
            .await
            .unwrap();
    }

    let objects: Vec<_> = provider.list("").try_collect().await.unwrap();
    assert_eq!(objects.len(), 25);
    let total: u64 = objects.iter().map(|o| o.size).sum();
    assert_eq!(total, (0..25u64).sum::<u64>());
}

#[tokio::test]
async fn test_memory_faults_are_per_key() {
    let provider = InMemoryProvider::new("faulty");
    provider
        .put("good", Bytes::from_static(b"1"), "text/plain")
        .await
        .unwrap();
    provider
        .put("bad", Bytes::from_static(b"2"), "text/plain")
        .await
        .unwrap();
    provider.fail_get_for("bad");

    assert!(provider.get("good").await.is_ok());
    assert!(matches!(
        provider.get("bad").await.unwrap_err(),
        StorageError::Backend(_)
    ));

    provider.set_unreachable(true);
    assert!(!provider.test_connection().await.success);
    assert!(matches!(
        provider.get("good").await.unwrap_err(),
        StorageError::Unreachable(_)
    ));
}
