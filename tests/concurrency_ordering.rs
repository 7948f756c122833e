//! Concurrent callers on one handle and on many handles

use chunkfile_rs::{Extent, FileConfig, HandleRegistry};
use futures::future::join_all;

#[tokio::test]
async fn test_unawaited_operations_apply_in_submission_order() {
    let registry = HandleRegistry::in_memory();
    let file = registry
        .create_file("ordered", FileConfig::new().chunk_size(4))
        .unwrap();

    // Enqueue everything before awaiting anything
    let w1 = file.write(0, b"aaaaaaaa".to_vec());
    let r1 = file.read(0, Extent::ToEnd);
    let t = file.truncate(2);
    let r2 = file.read(0, Extent::ToEnd);
    let w2 = file.write(2, b"zz".to_vec());
    let r3 = file.read(0, Extent::ToEnd);
    assert!(file.queue_len() > 0);

    // Await in reverse to show await order does not matter
    assert_eq!(r3.await.unwrap(), b"aazz");
    w2.await.unwrap();
    assert_eq!(r2.await.unwrap(), b"aa");
    t.await.unwrap();
    assert_eq!(r1.await.unwrap(), b"aaaaaaaa");
    w1.await.unwrap();
}

#[tokio::test]
async fn test_dropped_future_still_runs() {
    let registry = HandleRegistry::in_memory();
    let file = registry.create_file("detached", FileConfig::new()).unwrap();

    drop(file.write(0, b"fire and forget".to_vec()));
    assert_eq!(file.read(0, 4u64).await.unwrap(), b"fire");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_writers_on_one_file() {
    let registry = HandleRegistry::in_memory();
    let file = registry
        .create_file("shared", FileConfig::new().chunk_size(7))
        .unwrap();

    let writers: Vec<_> = (0u8..32)
        .map(|i| {
            let file = file.clone();
            tokio::spawn(async move {
                file.write(i as u64 * 10, vec![i; 10]).await.unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let content = file.read(0, Extent::ToEnd).await.unwrap();
    assert_eq!(content.len(), 320);
    for (i, region) in content.chunks(10).enumerate() {
        assert!(region.iter().all(|&b| b == i as u8), "region {}", i);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_files_progress_in_parallel() {
    let registry = HandleRegistry::in_memory();

    let jobs = (0..16).map(|i| {
        let file = registry
            .create_file(&format!("file-{}", i), FileConfig::new().chunk_size(16))
            .unwrap();
        async move {
            for round in 0..20u64 {
                file.write(round * 5, format!("{:05}", round).into_bytes())
                    .await
                    .unwrap();
            }
            file.read(95, 5u64).await.unwrap()
        }
    });

    for last in join_all(jobs).await {
        assert_eq!(last, b"00019");
    }
    assert_eq!(registry.len(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suspend_while_operations_stream_in() {
    let registry = HandleRegistry::in_memory();
    let file = registry.create_file("busy", FileConfig::new()).unwrap();

    let mut pending = Vec::new();
    for i in 0..50u64 {
        pending.push(file.write(i, vec![i as u8]));
        if i % 10 == 0 {
            file.suspend().await.unwrap();
        }
    }
    for fut in pending {
        fut.await.unwrap();
    }

    let content = file.read(0, Extent::ToEnd).await.unwrap();
    assert_eq!(content, (0u8..50).collect::<Vec<_>>());
}
