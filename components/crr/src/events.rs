/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Table-change notifications.
//!
//! Reactive callers (live queries, UI adapters) register interest in
//! particular tables; every local mutation entry point publishes the set of
//! tables it touched after its transaction commits.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub document: String,
    pub tables: Vec<String>,
}

type Callback = Box<dyn Fn(&TableChange) + Send>;

struct Subscriber {
    /// None = interested in every table.
    tables: Option<Vec<String>>,
    callback: Callback,
}

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug)]
pub struct Subscription(usize);

#[derive(Default)]
pub struct Events {
    next_id: AtomicUsize,
    subscribers: Mutex<HashMap<usize, Subscriber>>,
}

impl Events {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Be notified whenever one of `tables` changes.
    pub fn subscribe<F>(&self, tables: &[&str], callback: F) -> Subscription
    where
        F: Fn(&TableChange) + Send + 'static,
    {
        self.add(Some(tables.iter().map(|t| t.to_string()).collect()), callback)
    }

    /// Be notified on every table change.
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TableChange) + Send + 'static,
    {
        self.add(None, callback)
    }

    fn add<F>(&self, tables: Option<Vec<String>>, callback: F) -> Subscription
    where
        F: Fn(&TableChange) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(
            id,
            Subscriber {
                tables,
                callback: Box::new(callback),
            },
        );
        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers.lock().remove(&subscription.0);
    }

    pub(crate) fn notify(&self, event: &TableChange) {
        let subscribers = self.subscribers.lock();
        for sub in subscribers.values() {
            let interested = match &sub.tables {
                None => true,
                Some(tables) => event.tables.iter().any(|t| tables.contains(t)),
            };
            if interested {
                (sub.callback)(event);
            }
        }
    }
}
