//! JobBatcher coalescing seen from callers awaiting their own replies

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use sceneflow::{JobBatcher, SceneError};
use tokio::sync::oneshot;

type Batches = Arc<Mutex<Vec<Vec<u32>>>>;

/// Batcher that answers every job with its value doubled and records each batch.
fn doubling_batcher(limit: usize, window: Duration) -> (JobBatcher<(u32, oneshot::Sender<u32>)>, Batches) {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let recorded = batches.clone();
    let batcher = JobBatcher::new(limit, window, move |jobs: Vec<(u32, oneshot::Sender<u32>)>| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().push(jobs.iter().map(|(value, _)| *value).collect());
            for (value, reply) in jobs {
                let _ = reply.send(value * 2);
            }
            Ok::<(), SceneError>(())
        }
        .boxed()
    });
    (batcher, batches)
}

async fn submit(batcher: &JobBatcher<(u32, oneshot::Sender<u32>)>, value: u32) -> u32 {
    let (reply, answer) = oneshot::channel();
    batcher.enqueue((value, reply));
    answer.await.unwrap()
}

#[tokio::test]
async fn test_same_turn_jobs_share_a_batch_and_later_job_starts_new_cycle() {
    let (batcher, batches) = doubling_batcher(100, Duration::ZERO);

    let answers = join_all([submit(&batcher, 1), submit(&batcher, 2)]).await;
    assert_eq!(answers, vec![2, 4]);
    assert_eq!(*batches.lock(), vec![vec![1, 2]]);
    assert!(!batcher.is_draining());

    assert_eq!(submit(&batcher, 3).await, 6);
    assert_eq!(*batches.lock(), vec![vec![1, 2], vec![3]]);
}

#[tokio::test]
async fn test_size_limit_splits_one_turn_into_several_batches() {
    let (batcher, batches) = doubling_batcher(2, Duration::ZERO);

    let answers = join_all((1..=5).map(|value| submit(&batcher, value))).await;
    assert_eq!(answers, vec![2, 4, 6, 8, 10]);
    assert_eq!(*batches.lock(), vec![vec![1, 2], vec![3, 4], vec![5]]);
}

#[tokio::test]
async fn test_window_coalesces_jobs_from_separate_turns() {
    let (batcher, batches) = doubling_batcher(100, Duration::from_millis(50));

    let first = submit(&batcher, 1);
    let second = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        submit(&batcher, 2).await
    };
    let (a, b) = futures::join!(first, second);
    assert_eq!((a, b), (2, 4));
    assert_eq!(*batches.lock(), vec![vec![1, 2]]);
}

#[tokio::test]
async fn test_failed_batch_does_not_poison_batcher() {
    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    let batcher = JobBatcher::new(1, Duration::ZERO, move |jobs: Vec<oneshot::Sender<()>>| {
        let counter = counter.clone();
        async move {
            let attempt = {
                let mut calls = counter.lock();
                *calls += 1;
                *calls
            };
            if attempt == 1 {
                return Err(SceneError::Remote("wtf".to_string()));
            }
            for reply in jobs {
                let _ = reply.send(());
            }
            Ok(())
        }
        .boxed()
    });

    let (first, first_answer) = oneshot::channel();
    let (second, second_answer) = oneshot::channel();
    batcher.enqueue(first);
    batcher.enqueue(second);

    // The failing batch dropped its sender without answering.
    assert!(first_answer.await.is_err());
    second_answer.await.unwrap();
    assert_eq!(*calls.lock(), 2);
}

/// Jobs enqueued from one task turn on a busy multi-threaded runtime still share a batch.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_turn_jobs_share_a_batch_on_multi_thread_runtime() {
    for _ in 0..20 {
        let (batcher, batches) = doubling_batcher(100, Duration::ZERO);
        let (first, first_answer) = oneshot::channel();
        let (second, second_answer) = oneshot::channel();

        batcher.enqueue((1, first));
        // Keep this task busy without yielding so the drain task can start elsewhere.
        let started = std::time::Instant::now();
        while started.elapsed() < Duration::from_micros(300) {
            std::hint::spin_loop();
        }
        batcher.enqueue((2, second));

        assert_eq!(first_answer.await.unwrap(), 2);
        assert_eq!(second_answer.await.unwrap(), 4);
        assert_eq!(*batches.lock(), vec![vec![1, 2]]);
    }
}
