//! Remote client over the in-process transport

use std::sync::Arc;
use tablestore::entity::{EntityDescriptor, TableEntity};
use tablestore::paging::PagingInfo;
use tablestore::transport::{MemoryTransport, TransportCall};
use tablestore::{Error, RemoteTableStorage, StorageConfig, TableQuery, TableStorage};

#[derive(Debug, Clone, Default, PartialEq)]
struct Event {
    stream: String,
    seq: String,
    kind: String,
    attempts: i32,
}

impl TableEntity for Event {
    fn describe(d: &mut EntityDescriptor<Self>) {
        d.partition_key("Stream", |e: &Self| &e.stream, |e: &mut Self, v| e.stream = v)
            .row_key("Seq", |e: &Self| &e.seq, |e: &mut Self, v| e.seq = v)
            .property("Kind", |e: &Self| &e.kind, |e: &mut Self, v| e.kind = v)
            .property("Attempts", |e: &Self| &e.attempts, |e: &mut Self, v| e.attempts = v);
    }
}

fn event(stream: &str, seq: usize) -> Event {
    Event {
        stream: stream.into(),
        seq: format!("{:05}", seq),
        kind: "created".into(),
        attempts: 0,
    }
}

fn events(stream: &str, count: usize) -> Vec<Event> {
    (0..count).map(|i| event(stream, i)).collect()
}

fn storage(transport: &MemoryTransport) -> RemoteTableStorage<Event> {
    RemoteTableStorage::with_defaults(Arc::new(transport.clone()), "events").unwrap()
}

#[tokio::test]
async fn test_table_is_created_lazily_once() {
    let transport = MemoryTransport::new();
    let events = storage(&transport);
    assert!(!transport.table_exists("events"));

    events.insert(&event("s1", 0)).await.unwrap();
    events.get("s1", "00000").await.unwrap();
    assert!(transport.table_exists("events"));
    assert_eq!(transport.calls(TransportCall::CreateTable), 1);

    assert!(events.delete_table().await.unwrap());
    assert!(!transport.table_exists("events"));
    assert!(!events.delete_table().await.unwrap());

    events.insert(&event("s1", 0)).await.unwrap();
    assert_eq!(transport.calls(TransportCall::CreateTable), 2);
}

#[tokio::test]
async fn test_large_single_partition_batch_is_chunked() {
    let transport = MemoryTransport::new();
    let storage = storage(&transport);

    storage.insert_batch(&events("s1", 250)).await.unwrap();

    assert_eq!(transport.calls(TransportCall::Batch), 3);
    assert_eq!(transport.row_count("events"), 250);
}

#[tokio::test]
async fn test_partitions_are_batched_separately() {
    let transport = MemoryTransport::new();
    let storage = storage(&transport);

    let mut mixed = events("s1", 10);
    mixed.extend(events("s2", 10));
    storage.insert_or_replace_batch(&mixed).await.unwrap();

    assert_eq!(transport.calls(TransportCall::Batch), 2);
    assert_eq!(storage.get_partition("s2", None).await.unwrap().len(), 10);
}

#[tokio::test]
async fn test_failed_chunk_stops_the_batch() {
    let transport = MemoryTransport::new();
    let storage = storage(&transport);
    transport.inject_after(TransportCall::Batch, 1, Error::Transient("throttled".into()));

    let err = storage.insert_batch(&events("s1", 250)).await.unwrap_err();
    match &err {
        Error::BatchFailed {
            partition, chunk, ..
        } => {
            assert_eq!(partition, "s1");
            assert_eq!(*chunk, 1);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(transport.calls(TransportCall::Batch), 2);
    assert_eq!(transport.row_count("events"), 100);
}

#[tokio::test]
async fn test_replace_repeats_after_precondition_failure() {
    let transport = MemoryTransport::new();
    let storage = storage(&transport);
    storage.insert(&event("s1", 0)).await.unwrap();

    // the retrieve passes, the conditional write sees a stale etag
    transport.inject_after(
        TransportCall::Execute,
        1,
        Error::PreconditionFailed("etag mismatch".into()),
    );
    let updated = storage
        .replace("s1", "00000", &|mut e: Event| {
            e.attempts += 1;
            Some(e)
        })
        .await
        .unwrap();

    assert_eq!(updated.map(|e| e.attempts), Some(1));
    // insert + (retrieve, failed replace) + (retrieve, replace)
    assert_eq!(transport.calls(TransportCall::Execute), 5);
    assert_eq!(storage.get("s1", "00000").await.unwrap().unwrap().attempts, 1);
}

#[tokio::test]
async fn test_absent_rows() {
    let transport = MemoryTransport::new();
    let storage = storage(&transport);

    assert!(storage.get("s1", "missing").await.unwrap().is_none());
    assert!(storage.merge("s1", "missing", &|e: Event| Some(e)).await.unwrap().is_none());
    assert!(storage.delete_by_key("s1", "missing").await.unwrap().is_none());
    assert!(!storage.delete_if_exists("s1", "missing").await.unwrap());
    assert!(storage.delete(&event("s1", 9)).await.unwrap_err().is_not_found());
    assert!(!storage.record_exists(&event("s1", 9)).await.unwrap());
}

#[tokio::test]
async fn test_conditional_create() {
    let transport = MemoryTransport::new();
    let storage = storage(&transport);

    assert!(storage.create_if_not_exists(&event("s1", 0)).await.unwrap());
    assert!(!storage.create_if_not_exists(&event("s1", 0)).await.unwrap());
    assert!(storage.insert(&event("s1", 0)).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn test_queries_follow_continuations() {
    let transport = MemoryTransport::with_segment_size(3);
    let storage = storage(&transport);
    storage.insert_batch(&events("s1", 10)).await.unwrap();
    storage.insert_batch(&events("s2", 2)).await.unwrap();

    assert_eq!(storage.get_partition("s1", None).await.unwrap().len(), 10);
    assert_eq!(transport.calls(TransportCall::Query), 4);

    let top = storage.get_top_records("s1", 4).await.unwrap();
    assert_eq!(
        top.iter().map(|e| e.seq.as_str()).collect::<Vec<_>>(),
        ["00000", "00001", "00002", "00003"]
    );

    let mut chunks = Vec::new();
    storage
        .execute(
            &TableQuery::new(),
            &mut |chunk: Vec<Event>| chunks.push(chunk.len()),
            Some(&|| true),
        )
        .await
        .unwrap();
    assert_eq!(chunks, vec![3]);

    let mut total = 0;
    storage
        .get_data_by_chunks(&TableQuery::new(), &mut |chunk: Vec<Event>| total += chunk.len())
        .await
        .unwrap();
    assert_eq!(total, 12);

    let found = storage
        .first_or_none_via_scan("s1", &|chunk: &[Event]| {
            chunk.iter().find(|e| e.seq == "00007").cloned()
        })
        .await
        .unwrap();
    assert!(found.is_some());
}

#[tokio::test]
async fn test_key_lookups_are_split_into_pieces() {
    let transport = MemoryTransport::new();
    let config = StorageConfig {
        piece_size: 2,
        ..StorageConfig::default()
    };
    let storage: RemoteTableStorage<Event> =
        RemoteTableStorage::new(Arc::new(transport.clone()), "events", &config).unwrap();
    storage.insert_batch(&events("s1", 10)).await.unwrap();

    let wanted: Vec<String> = ["00001", "00003", "00005", "00007", "00042"]
        .iter()
        .map(|k| k.to_string())
        .collect();
    let queries_before = transport.calls(TransportCall::Query);
    let found = storage.get_by_row_keys("s1", &wanted, None).await.unwrap();

    assert_eq!(found.len(), 4);
    assert_eq!(transport.calls(TransportCall::Query) - queries_before, 3);

    let skeletons = storage
        .get_row_keys_only(&["00002".to_string()])
        .await
        .unwrap();
    assert_eq!(skeletons.len(), 1);
    assert!(skeletons[0].kind.is_empty());
}

#[tokio::test]
async fn test_calls_are_bounded_by_execution_time() {
    let transport = MemoryTransport::new();
    let config = StorageConfig {
        max_execution_time_ms: 20,
        ..StorageConfig::default()
    };
    let storage: RemoteTableStorage<Event> =
        RemoteTableStorage::new(Arc::new(transport.clone()), "events", &config).unwrap();
    storage.insert(&event("s1", 0)).await.unwrap();

    transport.set_latency(Some(std::time::Duration::from_millis(200)));
    let err = storage.get("s1", "00000").await.unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_cancellation());
}

#[tokio::test]
async fn test_pagination_forward_and_back() {
    let transport = MemoryTransport::new();
    let storage = storage(&transport);
    storage.insert_batch(&events("s1", 5)).await.unwrap();
    let query = TableQuery::new();

    let first = storage
        .execute_query_with_pagination(&query, PagingInfo::with_page_size(2))
        .await
        .unwrap();
    assert_eq!(first.len(), 2);

    let second = storage
        .execute_query_with_pagination(&query, first.paging_info.clone())
        .await
        .unwrap();
    assert_eq!(second.items[0].seq, "00002");

    let third = storage
        .execute_query_with_pagination(&query, second.paging_info.clone())
        .await
        .unwrap();
    assert_eq!(third.len(), 1);
    assert!(third.paging_info.next_page.is_none());

    let beyond = storage
        .execute_query_with_pagination(&query, third.paging_info.clone())
        .await
        .unwrap();
    assert!(beyond.is_empty());

    let back = storage
        .execute_query_with_pagination(&query, third.paging_info.clone().navigate_to(1))
        .await
        .unwrap();
    assert_eq!(back.items, second.items);

    let start = storage
        .execute_query_with_pagination(&query, third.paging_info.navigate_to(0))
        .await
        .unwrap();
    assert_eq!(start.items, first.items);
}
