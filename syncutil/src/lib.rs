// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Small async synchronisation primitives shared by the engine crates.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// A condition that can be triggered exactly once to release all waiters.
///
/// Roughly a CountDownLatch with a count of one: once triggered it stays triggered.
#[derive(Clone)]
pub struct AsyncLatch {
    sender: Arc<Mutex<Option<watch::Sender<()>>>>,
    receiver: watch::Receiver<()>,
}

impl AsyncLatch {
    pub fn new() -> AsyncLatch {
        let (sender, receiver) = watch::channel(());
        AsyncLatch {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    /// Triggers the latch, releasing all current and future waiters. Idempotent.
    pub fn trigger(&self) {
        // Triggering the latch drops the sender, which wakes every receiver.
        self.sender.lock().take();
    }

    /// Waits for this latch to be triggered.
    pub async fn triggered(&self) {
        // The sender being dropped surfaces as an Err on the cloned receiver.
        let mut receiver = self.receiver.clone();
        while receiver.changed().await.is_ok() {}
    }

    /// Returns true if the latch has been triggered.
    pub fn poll_triggered(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// A cancellable value computed by a single sender and broadcast to any number of receivers.
///
/// The associated work is cancelled either explicitly (by dropping the `AsyncValue`) or
/// implicitly (when all receivers go away). The owner of the `AsyncValue` may additionally
/// deliver out-of-band interrupts to the sender while it runs.
#[derive(Debug)]
pub struct AsyncValue<T: Clone + Send + Sync + 'static, I: Send + 'static = ()> {
    item_receiver: Weak<watch::Receiver<Option<T>>>,
    interrupt_sender: mpsc::UnboundedSender<I>,
}

impl<T: Clone + Send + Sync + 'static, I: Send + 'static> AsyncValue<T, I> {
    pub fn new() -> (AsyncValue<T, I>, AsyncValueSender<T, I>, AsyncValueReceiver<T>) {
        let (interrupt_sender, interrupt_receiver) = mpsc::unbounded_channel();
        let (item_sender, item_receiver) = watch::channel(None);
        let item_receiver = Arc::new(item_receiver);
        (
            AsyncValue {
                item_receiver: Arc::downgrade(&item_receiver),
                interrupt_sender,
            },
            AsyncValueSender {
                item_sender,
                interrupt_receiver,
            },
            AsyncValueReceiver { item_receiver },
        )
    }

    /// Returns a new receiver for the value, unless the work has already been cancelled.
    pub fn receiver(&self) -> Option<AsyncValueReceiver<T>> {
        self.item_receiver
            .upgrade()
            .map(|item_receiver| AsyncValueReceiver { item_receiver })
    }

    /// Attempts to deliver an interrupt to the sender, failing if it has already completed.
    pub fn try_interrupt(&self, interrupt: I) -> Result<(), I> {
        self.interrupt_sender
            .send(interrupt)
            .map_err(|mpsc::error::SendError(i)| i)
    }
}

pub struct AsyncValueReceiver<T: Clone + Send + Sync + 'static> {
    item_receiver: Arc<watch::Receiver<Option<T>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueReceiver<T> {
    /// Waits for the value, or returns None if the work was cancelled.
    pub async fn recv(&self) -> Option<T> {
        let mut item_receiver = (*self.item_receiver).clone();
        loop {
            if let Some(ref value) = *item_receiver.borrow() {
                return Some(value.clone());
            }

            if item_receiver.changed().await.is_err() {
                return None;
            }
        }
    }
}

pub struct AsyncValueSender<T: Clone + Send + Sync + 'static, I: Send + 'static = ()> {
    item_sender: watch::Sender<Option<T>>,
    interrupt_receiver: mpsc::UnboundedReceiver<I>,
}

impl<T: Clone + Send + Sync + 'static, I: Send + 'static> AsyncValueSender<T, I> {
    /// Publishes the value, consuming the sender.
    pub fn send(self, item: T) {
        let _ = self.item_sender.send(Some(item));
    }

    /// Waits for an interrupt, or for the work to be cancelled.
    ///
    /// Returns None when the work has been cancelled, either because the `AsyncValue` was
    /// dropped, or because all receivers went away.
    pub async fn interrupted(&mut self) -> Option<I> {
        tokio::select! {
          res = self.interrupt_receiver.recv() => res,
          _ = self.item_sender.closed() => None,
        }
    }
}

#[cfg(test)]
mod tests;
