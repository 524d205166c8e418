//! Decrypting range reads over uploaded objects.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{fast_retry, payload, Harness};
use zkd_core::config::{ChunkingConfig, TransferConfig};
use zkd_core::ZkdError;
use zkd_storage::chunk_key;
use zkd_sync::{DownloadSessionManager, MemorySource, UploadControl, UploadOptions, UploadOutcome};

const CHUNK: u64 = 64 * 1024;

/// Upload `len` bytes in 64 KiB chunks; returns (object id, plaintext).
async fn seeded(h: &Harness, name: &str, len: usize) -> (String, Vec<u8>) {
    let data = payload(len);
    let coordinator = h.coordinator().with_chunking(ChunkingConfig {
        small_chunk_bytes: CHUNK,
        ..ChunkingConfig::default()
    });
    let outcome = coordinator
        .upload(
            Arc::new(MemorySource::new(data.clone())),
            UploadOptions::new(name).with_mime_type("application/pdf"),
            &UploadControl::new(),
            None,
        )
        .await
        .unwrap();
    let UploadOutcome::Complete(receipt) = outcome else {
        panic!("seed upload did not complete");
    };
    (receipt.object_id, data)
}

#[tokio::test]
async fn ranges_match_plaintext_slices() {
    let h = Harness::new();
    let (oid, data) = seeded(&h, "doc.pdf", 300 * 1024).await;
    let downloads = h.downloads();

    let full = downloads.fetch_all(&oid).await.unwrap();
    assert!(full.as_ref() == data.as_slice());

    for (start, end) in [(0u64, 0u64), (10, 99), (CHUNK - 5, CHUNK + 5), (CHUNK, 2 * CHUNK - 1), (1000, 250_000)] {
        let got = downloads.fetch_range(&oid, start, Some(end)).await.unwrap();
        assert_eq!(got.as_ref(), &data[start as usize..=end as usize], "range {start}-{end}");
    }

    // end past the object is clamped
    let tail = downloads.fetch_range(&oid, 300 * 1024 - 10, Some(u64::MAX)).await.unwrap();
    assert_eq!(tail.as_ref(), &data[data.len() - 10..]);
}

#[tokio::test]
async fn registration_verifies_and_decrypts_metadata() {
    let h = Harness::new();
    let (oid, _) = seeded(&h, "doc.pdf", 300 * 1024).await;
    let downloads = h.downloads();

    let summary = downloads.summary(&oid).await.unwrap();
    assert_eq!(summary.name.as_deref(), Some("doc.pdf"));
    assert_eq!(summary.mime_type, "application/pdf");
    assert_eq!(summary.chunk_count, 5);

    let map = downloads.chunk_map(&oid).await.unwrap();
    assert_eq!(map[1].plaintext_start, CHUNK);
    assert_eq!(map.last().unwrap().plaintext_end, 300 * 1024);

    // registration is cached
    downloads.fetch_range(&oid, 0, Some(10)).await.unwrap();
    assert_eq!(downloads.registrations(), 1);
    assert_eq!(h.api.download_sessions.load(Ordering::SeqCst), 1);

    downloads.unregister(&oid);
    downloads.fetch_range(&oid, 0, Some(10)).await.unwrap();
    assert_eq!(downloads.registrations(), 2);
}

#[tokio::test]
async fn overlapping_concurrent_ranges_share_chunk_fetches() {
    let h = Harness::new();
    let (oid, data) = seeded(&h, "shared.bin", 300 * 1024).await;
    h.transport.reset_counters();
    h.transport.set_get_delay(Duration::from_millis(50));
    let downloads = h.downloads();

    // chunks 0..=2 and 1..=3: four distinct chunks in total
    let a = downloads.fetch_range(&oid, 100, Some(2 * CHUNK + 100));
    let b = downloads.fetch_range(&oid, CHUNK + 7, Some(3 * CHUNK + 7));
    let c = downloads.fetch_range(&oid, CHUNK + 7, Some(3 * CHUNK + 7));
    let (a, b, c) = tokio::join!(a, b, c);

    assert_eq!(a.unwrap().as_ref(), &data[100..=(2 * CHUNK + 100) as usize]);
    let b = b.unwrap();
    assert_eq!(b.as_ref(), &data[(CHUNK + 7) as usize..=(3 * CHUNK + 7) as usize]);
    assert_eq!(c.unwrap(), b);

    assert_eq!(downloads.chunk_fetches(), 4);
    assert_eq!(h.transport.gets.load(Ordering::SeqCst), 4);
    assert_eq!(downloads.registrations(), 1);
}

#[tokio::test]
async fn open_ended_range_reads_one_window() {
    let h = Harness::new();
    let (oid, data) = seeded(&h, "stream.bin", 300 * 1024).await;
    let downloads = DownloadSessionManager::with_config(
        h.api.clone(),
        h.transport.clone(),
        h.keys.clone(),
        h.pool.clone(),
        h.scheduler.clone(),
        &TransferConfig {
            stream_window_bytes: 100_000,
            ..TransferConfig::default()
        },
    )
    .with_retry(fast_retry());

    let window = downloads.fetch_range(&oid, 5, None).await.unwrap();
    assert_eq!(window.as_ref(), &data[5..100_005]);

    let last = downloads.fetch_range(&oid, 300 * 1024 - 3, None).await.unwrap();
    assert_eq!(last.len(), 3);
}

#[tokio::test]
async fn start_past_end_is_not_satisfiable() {
    let h = Harness::new();
    let (oid, _) = seeded(&h, "small.bin", 1000).await;
    let err = h.downloads().fetch_range(&oid, 1000, Some(2000)).await.unwrap_err();
    assert!(matches!(err, ZkdError::RangeNotSatisfiable { start: 1000, size: 1000 }));
}

#[tokio::test]
async fn expired_url_is_refreshed() {
    let h = Harness::new();
    let (oid, data) = seeded(&h, "expiring.bin", 200 * 1024).await;
    h.transport.expire_next_get(chunk_key(&oid, 1));

    let got = h.downloads().fetch_range(&oid, CHUNK, Some(2 * CHUNK - 1)).await.unwrap();
    assert_eq!(got.as_ref(), &data[CHUNK as usize..2 * CHUNK as usize]);
    assert_eq!(h.api.url_refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tampered_chunk_fails_without_retry() {
    let h = Harness::new();
    let (oid, _) = seeded(&h, "tamper.bin", 200 * 1024).await;
    let key = chunk_key(&oid, 2);
    let mut stored = h.op.read(&key).await.unwrap().to_vec();
    stored[0] ^= 0xff;
    h.op.write(&key, stored).await.unwrap();
    h.transport.reset_counters();

    let err = h
        .downloads()
        .fetch_range(&oid, 2 * CHUNK, Some(2 * CHUNK + 10))
        .await
        .unwrap_err();
    assert!(matches!(err, ZkdError::DecryptionFailed(_)));
    assert_eq!(h.transport.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tampered_manifest_blocks_registration() {
    let h = Harness::new();
    let (oid, _) = seeded(&h, "signed.bin", 1000).await;
    h.api.tamper_manifest.store(true, Ordering::SeqCst);

    let downloads = h.downloads();
    let err = downloads.fetch_range(&oid, 0, Some(10)).await.unwrap_err();
    assert!(matches!(err, ZkdError::ManifestMismatch { .. }));

    // failures are not cached
    h.api.tamper_manifest.store(false, Ordering::SeqCst);
    assert_eq!(downloads.fetch_range(&oid, 0, Some(9)).await.unwrap().len(), 10);
}

#[tokio::test]
async fn listing_without_manifest_is_refused() {
    let h = Harness::new();
    let (oid, _) = seeded(&h, "unsigned.bin", 1000).await;
    h.api.omit_manifest.store(true, Ordering::SeqCst);
    h.transport.reset_counters();

    let err = h.downloads().fetch_all(&oid).await.unwrap_err();
    assert!(matches!(err, ZkdError::SignatureInvalid(_)), "{err:?}");
    assert_eq!(h.transport.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn manifest_signed_by_another_key_is_refused() {
    let h = Harness::new();
    let (oid, _) = seeded(&h, "resigned.bin", 1000).await;
    h.api.foreign_signature.store(true, Ordering::SeqCst);

    let err = h.downloads().fetch_all(&oid).await.unwrap_err();
    assert!(matches!(err, ZkdError::SignatureInvalid(_)), "{err:?}");
}

#[tokio::test]
async fn forged_decompressed_size_is_rejected() {
    let h = Harness::new();
    let (oid, _) = seeded(&h, "forged.bin", 200 * 1024).await;

    *h.api.forged_chunk_size.lock().unwrap() = Some(u64::MAX);
    let err = h.downloads().fetch_range(&oid, 0, Some(10)).await.unwrap_err();
    assert!(matches!(err, ZkdError::Protocol(_)), "{err:?}");

    // plausible size, but not the one sealed with the chunk
    *h.api.forged_chunk_size.lock().unwrap() = Some(CHUNK + 1);
    let err = h.downloads().fetch_range(&oid, 0, Some(10)).await.unwrap_err();
    assert!(matches!(err, ZkdError::DecryptionFailed(_)), "{err:?}");
}

#[tokio::test]
async fn locked_keys_cannot_register() {
    let h = Harness::new();
    let (oid, _) = seeded(&h, "locked.bin", 1000).await;
    h.keys.clear();
    let err = h.downloads().fetch_all(&oid).await.unwrap_err();
    assert!(matches!(err, ZkdError::KeyUnavailable));
}
