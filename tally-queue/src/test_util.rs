// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Consumers that record what they see, for testing code built on a [`crate::ConsumerPool`].

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
};

use crate::{BatchError, Consumer};

#[derive(Debug)]
struct State<T> {
    consumed: Vec<(usize, T)>,
    errors: Vec<String>,
    inits: usize,
    exits: usize,
}

/// Shared log written by every [`RecordingConsumer`] of a pool.
#[derive(Debug)]
pub struct Recorded<T>(Arc<Mutex<State<T>>>);

impl<T> Default for Recorded<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(State {
            consumed: vec![],
            errors: vec![],
            inits: 0,
            exits: 0,
        })))
    }
}

impl<T> Clone for Recorded<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Clone> Recorded<T> {
    /// `(worker index, item)` in consumption order.
    pub fn consumed(&self) -> Vec<(usize, T)> {
        self.0.lock().unwrap().consumed.clone()
    }

    /// Consumed items without the worker index.
    pub fn values(&self) -> Vec<T> {
        self.consumed().into_iter().map(|(_, v)| v).collect()
    }

    /// Rendered errors passed to `on_error`.
    pub fn errors(&self) -> Vec<String> {
        self.0.lock().unwrap().errors.clone()
    }

    /// Number of [`Consumer::init`] calls.
    pub fn inits(&self) -> usize {
        self.0.lock().unwrap().inits
    }

    /// Number of [`Consumer::on_exit`] calls.
    pub fn exits(&self) -> usize {
        self.0.lock().unwrap().exits
    }
}

/// A [`Consumer`] that appends every item to a [`Recorded`] log, optionally failing or
/// panicking on chosen items.
pub struct RecordingConsumer<T> {
    thread: usize,
    recorded: Recorded<T>,
    fail_on: Option<fn(&T) -> bool>,
    panic_on: Option<fn(&T) -> bool>,
}

impl<T> RecordingConsumer<T> {
    /// A consumer for worker `thread` that logs into `recorded`.
    pub fn new(thread: usize, recorded: Recorded<T>) -> Self {
        Self {
            thread,
            recorded,
            fail_on: None,
            panic_on: None,
        }
    }

    /// Return an error for any batch containing an item matching `predicate`.
    pub fn fail_on(mut self, predicate: fn(&T) -> bool) -> Self {
        self.fail_on = Some(predicate);
        self
    }

    /// Panic for any batch containing an item matching `predicate`.
    pub fn panic_on(mut self, predicate: fn(&T) -> bool) -> Self {
        self.panic_on = Some(predicate);
        self
    }
}

impl<T: Clone + Debug + Send> Consumer<T> for RecordingConsumer<T> {
    type Error = String;

    fn init(&mut self) {
        self.recorded.0.lock().unwrap().inits += 1;
    }

    fn consume(&mut self, batch: &[T]) -> Result<(), String> {
        for item in batch {
            if self.panic_on.is_some_and(|p| p(item)) {
                panic!("refusing {item:?}");
            }
            if self.fail_on.is_some_and(|p| p(item)) {
                return Err(format!("rejected {item:?}"));
            }
        }
        let mut state = self.recorded.0.lock().unwrap();
        state
            .consumed
            .extend(batch.iter().map(|item| (self.thread, item.clone())));
        Ok(())
    }

    fn on_error(&mut self, _batch: &[T], error: BatchError<String>) {
        self.recorded.0.lock().unwrap().errors.push(error.to_string());
    }

    fn on_exit(&mut self) {
        self.recorded.0.lock().unwrap().exits += 1;
    }
}
