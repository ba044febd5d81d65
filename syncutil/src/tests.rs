// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::{AsyncLatch, AsyncValue};

#[tokio::test]
async fn latch_triggers_current_and_future_waiters() {
    let latch = AsyncLatch::new();
    assert!(!latch.poll_triggered());

    let waiter = {
        let latch = latch.clone();
        tokio::spawn(async move { latch.triggered().await })
    };
    sleep(Duration::from_millis(10)).await;
    latch.trigger();
    timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();

    // A waiter arriving after the trigger returns immediately.
    assert!(latch.poll_triggered());
    timeout(Duration::from_secs(5), latch.triggered())
        .await
        .unwrap();
}

#[tokio::test]
async fn value_send_recv() {
    let (_value, sender, receiver) = AsyncValue::<u32>::new();
    sender.send(42);
    assert_eq!(Some(42), receiver.recv().await);
}

#[tokio::test]
async fn value_cancelled_by_drop() {
    let (value, mut sender, receiver) = AsyncValue::<u32>::new();
    let waiter = tokio::spawn(async move { receiver.recv().await });

    // Dropping the AsyncValue surfaces as a `None` interrupt to the sender, and dropping the
    // sender in response cancels the receiver.
    std::mem::drop(value);
    assert_eq!(None, sender.interrupted().await);
    std::mem::drop(sender);

    assert_eq!(None, waiter.await.unwrap());
}

#[tokio::test]
async fn value_cancelled_when_receivers_go_away() {
    let (value, mut sender, receiver) = AsyncValue::<u32>::new();
    std::mem::drop(receiver);
    assert!(value.receiver().is_none());
    assert_eq!(None, sender.interrupted().await);
}

#[tokio::test]
async fn value_interrupt_delivered_in_order() {
    let (value, mut sender, receiver) = AsyncValue::<u32, &'static str>::new();
    value.try_interrupt("dirtied").unwrap();
    assert_eq!(Some("dirtied"), sender.interrupted().await);

    // The work survives an interrupt and can still complete.
    sender.send(1);
    assert_eq!(Some(1), receiver.recv().await);
}
