//! Channel semantics: rendezvous ordering, close signals, back-pressure,
//! MPMC distribution, capacity resizing, generate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use weave::{
    await_on, buffered_channel, generate, sleep_for_on, unbuffered_channel, Reactor, Routine,
    WorkerPool,
};

fn pool_of(workers: usize) -> (Arc<Reactor>, WorkerPool) {
    let reactor = Arc::new(Reactor::new());
    let pool = WorkerPool::with_reactor(workers, reactor.clone());
    (reactor, pool)
}

#[test]
fn rendezvous_delivers_in_order_between_routines() {
    let (reactor, _pool) = pool_of(2);
    let (mut sender, receiver) = unbuffered_channel::<i32>();

    let producer = Routine::with_reactor(reactor.clone(), move || {
        for i in 0..100 {
            assert!(sender.send(i));
        }
    });
    let consumer = Routine::with_reactor(reactor, move || {
        let mut receiver = receiver;
        let got: Vec<i32> = receiver.by_ref().collect();
        got
    });

    producer.join();
    assert_eq!(consumer.join(), (0..100).collect::<Vec<_>>());
}

#[test]
fn rendezvous_works_between_a_thread_and_a_routine() {
    let (reactor, _pool) = pool_of(1);
    let (mut sender, mut receiver) = unbuffered_channel::<i32>();

    let producer = thread::spawn(move || {
        for i in 0..50 {
            assert!(sender.send(i));
        }
    });
    let consumer = Routine::with_reactor(reactor, move || {
        let mut sum = 0;
        while let Some(v) = receiver.recv() {
            sum += v;
        }
        sum
    });

    producer.join().unwrap();
    assert_eq!(consumer.join(), (0..50).sum::<i32>());
}

#[test]
fn closing_the_sender_ends_an_outstanding_recv() {
    let (reactor, _pool) = pool_of(1);
    let (mut sender, mut receiver) = unbuffered_channel::<i32>();

    let consumer = Routine::with_reactor(reactor, move || {
        assert_eq!(receiver.recv(), Some(1));
        // This recv parks until the close lands.
        assert_eq!(receiver.recv(), None);
        // And stays closed afterwards.
        assert_eq!(receiver.recv(), None);
        true
    });

    assert!(sender.send(1));
    thread::sleep(Duration::from_millis(5));
    sender.close();
    assert!(consumer.join());
}

#[test]
fn closing_the_receiver_refuses_the_parked_send() {
    let (reactor, _pool) = pool_of(1);
    let (mut sender, mut receiver) = unbuffered_channel::<i32>();

    let producer = Routine::with_reactor(reactor, move || {
        assert!(sender.send(1));
        // The receiver closes instead of taking this one.
        assert!(!sender.send(2));
    });

    assert_eq!(receiver.recv(), Some(1));
    thread::sleep(Duration::from_millis(5));
    receiver.close();
    producer.join();
}

#[test]
fn fan_out_fan_in_sums_squares() {
    let (reactor, _pool) = pool_of(4);
    let (sender, receiver) = buffered_channel::<usize>(16);

    for i in 0..100usize {
        let sender = sender.clone();
        Routine::with_reactor(reactor.clone(), move || {
            sender.send(i * i);
        })
        .detach();
    }
    drop(sender);

    let total: usize = receiver.sum();
    assert_eq!(total, 328350);
}

#[test]
fn bounded_queue_applies_back_pressure() {
    let (reactor, _pool) = pool_of(2);
    let (sender, receiver) = buffered_channel::<usize>(2);

    let producer_reactor = reactor.clone();
    let producer = Routine::with_reactor(producer_reactor, move || {
        let start = Instant::now();
        for i in 0..5 {
            assert!(sender.send(i));
        }
        start.elapsed()
    });

    let consumer_reactor = reactor.clone();
    let consumer = Routine::with_reactor(reactor, move || {
        let mut got = Vec::new();
        loop {
            await_on(sleep_for_on(consumer_reactor.clone(), Duration::from_millis(10)));
            match receiver.recv() {
                Some(v) => got.push(v),
                None => break,
            }
        }
        got
    });

    let producer_elapsed = producer.join();
    assert_eq!(consumer.join(), vec![0, 1, 2, 3, 4]);
    // With capacity 2, the producer's wall clock is dominated by the
    // consumer's pacing. Generous margin for slow CI.
    assert!(
        producer_elapsed >= Duration::from_millis(25),
        "producer finished in {producer_elapsed:?}, expected back-pressure"
    );
}

#[test]
fn mpmc_distributes_every_item_once() {
    let (reactor, _pool) = pool_of(4);
    let (sender, receiver) = buffered_channel::<usize>(8);

    let received = Arc::new(AtomicUsize::new(0));
    let consumers: Vec<Routine<()>> = (0..2)
        .map(|_| {
            let receiver = receiver.clone();
            let received = received.clone();
            Routine::with_reactor(reactor.clone(), move || {
                while let Some(v) = receiver.recv() {
                    received.fetch_add(v, Ordering::Relaxed);
                }
            })
        })
        .collect();
    drop(receiver);

    let producers: Vec<Routine<()>> = (0..4)
        .map(|p| {
            let sender = sender.clone();
            Routine::with_reactor(reactor.clone(), move || {
                for i in 0..25 {
                    assert!(sender.send(p * 25 + i));
                }
            })
        })
        .collect();
    drop(sender);

    for producer in producers {
        producer.join();
    }
    for consumer in consumers {
        consumer.join();
    }
    assert_eq!(received.load(Ordering::Relaxed), (0..100).sum::<usize>());
}

#[test]
fn growing_capacity_releases_parked_senders() {
    let (reactor, _pool) = pool_of(2);
    let (sender, receiver) = buffered_channel::<i32>(1);

    let parked = sender.clone();
    let producer = Routine::with_reactor(reactor, move || {
        // Capacity 1: each send parks until there is room again.
        assert!(parked.send(1));
        assert!(parked.send(2));
    });

    thread::sleep(Duration::from_millis(10));
    assert!(!producer.is_ready(), "producer should be parked on capacity");
    sender.set_capacity(4);
    producer.join();

    drop(sender);
    assert_eq!(receiver.collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn generate_yields_until_the_producer_returns() {
    let _pool = WorkerPool::new(1);

    let receiver = generate::<i32, _>(|sender| {
        for i in 0..=10 {
            assert!(sender.send(i));
        }
    });
    assert_eq!(receiver.collect::<Vec<_>>(), (0..=10).collect::<Vec<_>>());
}
