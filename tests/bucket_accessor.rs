//! Bucket accessor: versioned writes, reads, GC retention and deletes

mod common;

use common::{client_on, fast_retry_config, init_tracing, memory_store, wait_for, FaultyStore};
use metacoord::bucket::{LAST_SUCCESSFUL_WRITE_KEY, LAST_WRITE_KEY};
use metacoord::{BucketConfig, BucketDataAccessor, Error, MetaClient, MetaRecord};
use std::sync::Arc;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;

const MAX_CHUNK_SIZE: usize = 50 * 1024;

fn accessor(ttl: Duration) -> BucketDataAccessor {
    init_tracing();
    let store = memory_store();
    BucketDataAccessor::new(client_on(&store), BucketConfig::new(MAX_CHUNK_SIZE, ttl)).unwrap()
}

fn sample_record(name: &str) -> MetaRecord {
    let mut record = MetaRecord::new(name);
    record.set_simple_field(name, name);
    record.set_list_field(name, vec!["1".to_string(), "2".to_string()]);
    record.set_map_field(name, BTreeMap::from([("1".to_string(), "2".to_string())]));
    record
}

fn random_string(rng: &mut StdRng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[tokio::test]
async fn test_write_then_read() {
    let bucket = accessor(Duration::from_secs(1));
    let record = sample_record("TestBucket");

    let version = bucket
        .compressed_bucket_write("/TestBucket", &record)
        .await
        .unwrap();
    assert_eq!(version, 0);

    let read: MetaRecord = bucket.compressed_bucket_read("/TestBucket").await.unwrap();
    assert_eq!(read.simple_field("TestBucket"), Some("TestBucket"));
    assert_eq!(
        read.list_field("TestBucket").unwrap(),
        &["1".to_string(), "2".to_string()]
    );
    assert_eq!(read, record);

    bucket.compressed_bucket_delete("/TestBucket").await.unwrap();
}

#[tokio::test]
async fn test_multiple_writes_collect_old_versions() {
    let ttl = Duration::from_millis(200);
    let bucket = accessor(ttl);
    let record = sample_record("multi");
    let count = 5u64;
    let paths = ["/TestBucket0", "/TestBucket1"];

    for _ in 0..=count {
        for path in paths {
            bucket.compressed_bucket_write(path, &record).await.unwrap();
        }
    }

    for path in paths {
        let client = bucket.client();
        let lsw = client
            .get(&format!("{}/{}", path, LAST_SUCCESSFUL_WRITE_KEY))
            .await
            .unwrap();
        assert_eq!(String::from_utf8(lsw).unwrap(), count.to_string());
        let lw = client
            .get(&format!("{}/{}", path, LAST_WRITE_KEY))
            .await
            .unwrap();
        assert_eq!(String::from_utf8(lw).unwrap(), count.to_string());

        let expected = vec![
            count.to_string(),
            LAST_SUCCESSFUL_WRITE_KEY.to_string(),
            LAST_WRITE_KEY.to_string(),
        ];
        let expected = &expected;
        let collected = wait_for(ttl * 3, || async move {
            client.get_children(path).await.unwrap() == *expected
        })
        .await;
        assert!(collected, "old versions of {} were not collected", path);

        // Nothing else disappears after another TTL
        tokio::time::sleep(ttl).await;
        assert_eq!(&client.get_children(path).await.unwrap(), expected);
    }

    for path in paths {
        bucket.compressed_bucket_delete(path).await.unwrap();
    }
}

#[tokio::test]
async fn test_large_write_and_read() {
    let bucket = accessor(Duration::from_secs(1));
    let entries = if cfg!(feature = "heavy-tests") { 100_000 } else { 10_000 };

    let mut rng = StdRng::seed_from_u64(1);
    let mut record = MetaRecord::new("largeResourceAssignment");
    for _ in 0..entries {
        let key = random_string(&mut rng, 20);
        let value = random_string(&mut rng, 20);
        record.set_map_field(key.clone(), BTreeMap::from([(key, value)]));
    }

    let version = bucket
        .compressed_bucket_write("/largeResourceAssignment", &record)
        .await
        .unwrap();
    let chunks = bucket
        .client()
        .get_children(&format!("/largeResourceAssignment/{}", version))
        .await
        .unwrap();
    assert!(chunks.len() > 1, "expected a multi-chunk write");

    let read: MetaRecord = bucket
        .compressed_bucket_read("/largeResourceAssignment")
        .await
        .unwrap();
    assert_eq!(read, record);
}

#[tokio::test]
async fn test_reader_keeps_superseded_version_for_ttl() {
    let ttl = Duration::from_millis(150);
    let bucket = accessor(ttl);

    bucket
        .compressed_bucket_write("/grace", &sample_record("v0"))
        .await
        .unwrap();
    let captured = bucket.published_version("/grace").await.unwrap().unwrap();
    bucket
        .compressed_bucket_write("/grace", &sample_record("v1"))
        .await
        .unwrap();

    // Superseded but within the grace period
    let old: MetaRecord = bucket.read_version("/grace", captured).await.unwrap();
    assert_eq!(old.id, "v0");

    tokio::time::sleep(ttl * 3).await;
    assert!(matches!(
        bucket.read_version::<MetaRecord>("/grace", captured).await,
        Err(Error::NotFound(_))
    ));
    let latest: MetaRecord = bucket.compressed_bucket_read("/grace").await.unwrap();
    assert_eq!(latest.id, "v1");
}

#[tokio::test]
async fn test_catch_up_collection_after_restart() {
    init_tracing();
    let ttl = Duration::from_millis(300);
    let store = memory_store();
    let client = client_on(&store);
    let record = sample_record("r");

    {
        let first = BucketDataAccessor::new(client.clone(), BucketConfig::new(1024, ttl)).unwrap();
        first.compressed_bucket_write("/restart", &record).await.unwrap();
        first.compressed_bucket_write("/restart", &record).await.unwrap();
        // Dropping the accessor loses its pending GC passes
    }
    tokio::time::sleep(ttl + Duration::from_millis(50)).await;
    assert!(client.exists("/restart/0").await.unwrap());

    let second = BucketDataAccessor::new(client.clone(), BucketConfig::new(1024, ttl)).unwrap();
    assert_eq!(second.compressed_bucket_write("/restart", &record).await.unwrap(), 2);

    let observer = &client;
    let swept = wait_for(Duration::from_millis(100), || async move {
        !observer.exists("/restart/0").await.unwrap()
    })
    .await;
    assert!(swept, "stale version 0 survived the catch-up pass");
    // The version superseded just now keeps its grace period
    assert!(client.exists("/restart/1").await.unwrap());
}

#[tokio::test]
async fn test_concurrent_writers_publish_highest() {
    init_tracing();
    let store = memory_store();
    let mut tasks = Vec::new();
    for writer in 0..4 {
        let bucket = BucketDataAccessor::new(
            client_on(&store),
            BucketConfig::new(1024, Duration::from_secs(5)),
        )
        .unwrap();
        tasks.push(tokio::spawn(async move {
            let mut versions = Vec::new();
            for i in 0..5 {
                let record = sample_record(&format!("w{}-{}", writer, i));
                if let Ok(version) = bucket.compressed_bucket_write("/shared", &record).await {
                    versions.push(version);
                }
            }
            versions
        }));
    }

    let mut published = Vec::new();
    for task in tasks {
        published.extend(task.await.unwrap());
    }
    assert!(!published.is_empty());
    let mut unique = published.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), published.len(), "a version was handed out twice");

    let reader = BucketDataAccessor::new(client_on(&store), BucketConfig::default()).unwrap();
    assert_eq!(
        reader.published_version("/shared").await.unwrap(),
        unique.last().copied()
    );
    let _: MetaRecord = reader.compressed_bucket_read("/shared").await.unwrap();
}

#[tokio::test]
async fn test_invalid_path_rejected_without_mutation() {
    let bucket = accessor(Duration::from_secs(1));
    let err = bucket
        .compressed_bucket_write("/_invalid/a/b/c", &sample_record("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPath { .. }));
    assert!(bucket.client().get_children("/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let bucket = accessor(Duration::from_secs(1));
    bucket.compressed_bucket_delete("/never-written").await.unwrap();

    bucket
        .compressed_bucket_write("/gone", &sample_record("g"))
        .await
        .unwrap();
    bucket.compressed_bucket_delete("/gone").await.unwrap();
    bucket.compressed_bucket_delete("/gone").await.unwrap();

    assert!(matches!(
        bucket.compressed_bucket_read::<MetaRecord>("/gone").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_read_before_write_is_not_found() {
    let bucket = accessor(Duration::from_secs(1));
    assert!(matches!(
        bucket.compressed_bucket_read::<MetaRecord>("/empty").await,
        Err(Error::NotFound(_))
    ));
}

fn faulty_accessor(ttl: Duration) -> (Arc<FaultyStore>, BucketDataAccessor) {
    init_tracing();
    let store = Arc::new(FaultyStore::new());
    let client = Arc::new(MetaClient::new(store.clone(), fast_retry_config(5, 50)).unwrap());
    let bucket = BucketDataAccessor::new(client, BucketConfig::new(16, ttl)).unwrap();
    (store, bucket)
}

#[tokio::test]
async fn test_slow_publish_still_succeeds() {
    let ttl = Duration::from_millis(200);
    let (store, bucket) = faulty_accessor(ttl);
    bucket
        .compressed_bucket_write("/b", &sample_record("first"))
        .await
        .unwrap();

    // The pointer update lands only after the client gave up on it
    store.stall_write_to("/b/LAST_SUCCESSFUL_WRITE", Duration::from_millis(120));
    let version = bucket
        .compressed_bucket_write("/b", &sample_record("second"))
        .await
        .unwrap();
    assert_eq!(version, 1);
    assert_eq!(bucket.published_version("/b").await.unwrap(), Some(1));
    let read: MetaRecord = bucket.compressed_bucket_read("/b").await.unwrap();
    assert_eq!(read.id, "second");

    // The write scheduled its GC pass
    let client = bucket.client();
    let collected = wait_for(ttl * 3, || async move {
        !client.exists("/b/0").await.unwrap()
    })
    .await;
    assert!(collected, "version 0 was not collected");
}

#[tokio::test]
async fn test_failed_chunk_write_keeps_previous_version() {
    let (store, bucket) = faulty_accessor(Duration::from_secs(5));
    bucket
        .compressed_bucket_write("/mid", &sample_record("first"))
        .await
        .unwrap();

    store.break_create_of("/mid/1/0");
    let err = bucket
        .compressed_bucket_write("/mid", &sample_record("second"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));

    assert_eq!(bucket.published_version("/mid").await.unwrap(), Some(0));
    assert_eq!(bucket.last_write_version("/mid").await.unwrap(), Some(1));
    let read: MetaRecord = bucket.compressed_bucket_read("/mid").await.unwrap();
    assert_eq!(read.id, "first");
    assert!(!bucket.client().exists("/mid/1").await.unwrap());

    let version = bucket
        .compressed_bucket_write("/mid", &sample_record("third"))
        .await
        .unwrap();
    assert_eq!(version, 2);
    let read: MetaRecord = bucket.compressed_bucket_read("/mid").await.unwrap();
    assert_eq!(read.id, "third");
}
