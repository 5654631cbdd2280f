//! Concurrency tests for the lock-free mailbox queue: exact delivery
//! counts, per-producer FIFO order, and the empty-mailbox timeout
//! contract.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use messaging_actors::{Mbox, Timeout};
use rand::Rng;
use types::{Message, Payload, SubtransactionCmd};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Tag a message with `(producer, seq)` so the consumer can check
/// per-producer ordering.
fn tagged(producer: i64, seq: i64) -> Message {
    Message::new(Payload::Subtransaction(SubtransactionCmd {
        subtransactionid: producer,
        tableid: 0,
        rowid: seq,
        row: vec![],
    }))
}

fn untag(msg: &Message) -> (i64, i64) {
    match &msg.payload {
        Payload::Subtransaction(cmd) => (cmd.subtransactionid, cmd.rowid),
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn concurrent_producers_deliver_exactly_once_in_producer_order() {
    init_tracing();
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: i64 = 16_000;

    let (mut consumer, mbox) = Mbox::new();

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let mbox = Arc::clone(&mbox);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for seq in 0..PER_PRODUCER {
                    mbox.push(tagged(p as i64, seq));
                    // Occasional jitter so producers interleave in
                    // different patterns run to run.
                    if rng.gen_ratio(1, 4096) {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    // Drain concurrently with production.
    let mut next_expected = [0i64; PRODUCERS];
    let mut received = 0u64;
    let total = (PRODUCERS as u64) * (PER_PRODUCER as u64);
    while received < total {
        if let Some(msg) = consumer.recv(Timeout::Micros(100)) {
            let (producer, seq) = untag(&msg);
            let expected = next_expected[producer as usize];
            assert_eq!(
                seq, expected,
                "producer {producer} out of order: got {seq}, expected {expected}"
            );
            next_expected[producer as usize] = expected + 1;
            received += 1;
        }
    }

    for handle in handles {
        handle.join().expect("producer panicked");
    }

    // Exactly N×M messages: nothing lost, nothing duplicated.
    assert_eq!(received, total);
    assert!(consumer.recv(Timeout::Immediate).is_none());
    for (producer, &count) in next_expected.iter().enumerate() {
        assert_eq!(count, PER_PRODUCER, "producer {producer} shortfall");
    }
}

#[test]
fn empty_recv_with_zero_timeout_returns_immediately() {
    init_tracing();
    let (mut consumer, _mbox) = Mbox::new();
    let start = Instant::now();
    assert!(consumer.recv(Timeout::Immediate).is_none());
    assert!(start.elapsed() < Duration::from_millis(10));
}

#[test]
fn empty_recv_with_timeout_sleeps_about_that_long() {
    init_tracing();
    let (mut consumer, _mbox) = Mbox::new();
    let start = Instant::now();
    assert!(consumer.recv(Timeout::Micros(50_000)).is_none());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(45), "returned after {elapsed:?}");
}

#[test]
fn timed_recv_returns_empty_even_if_message_arrives_mid_sleep() {
    // The timeout path sleeps once and reports empty without
    // re-checking; the message is picked up by the *next* call. This
    // pins the documented latency slack.
    init_tracing();
    let (mut consumer, mbox) = Mbox::new();

    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        mbox.push(tagged(0, 0));
    });

    assert!(consumer.recv(Timeout::Micros(100_000)).is_none());
    producer.join().expect("producer panicked");
    assert!(consumer.recv(Timeout::Immediate).is_some());
}

#[test]
fn blocking_recv_wakes_on_arrival() {
    init_tracing();
    let (mut consumer, mbox) = Mbox::new();

    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        mbox.push(tagged(3, 7));
    });

    let msg = consumer.recv(Timeout::Block).expect("blocking recv yields the message");
    assert_eq!(untag(&msg), (3, 7));
    producer.join().expect("producer panicked");
}

#[test]
fn teardown_with_pending_messages_is_clean() {
    init_tracing();
    let (mut consumer, mbox) = Mbox::new();
    for seq in 0..10_000 {
        mbox.push(tagged(0, seq));
    }
    // Consume a few, then drop with the rest still queued.
    for _ in 0..100 {
        assert!(consumer.recv(Timeout::Immediate).is_some());
    }
    drop(consumer);
    drop(mbox);
}
