//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FIFO with a recycle cache and a lookahead cursor.
//!
//! Items live in exactly one of three places: the recycle cache, the live
//! queue, or in flight with a caller. Transfer between them is by move.
//!
//! Besides the consumption cursor (front of the live queue) the list keeps
//! a second, non-consuming "prophet" cursor the scheduler uses to inspect
//! a future item (e.g. to learn the next batch size) without committing
//! to it. The prophet never trails consumption: popping the front item
//! requires the prophet to have moved past it.

use std::collections::VecDeque;

/// Recycling FIFO. Not synchronized; the owner provides locking.
pub struct CachingList<T> {
    full: VecDeque<T>,
    cache: Vec<T>,
    /// Index into `full` of the first item the prophet has not seen yet.
    prophet: usize,
}

impl<T> Default for CachingList<T> {
    fn default() -> Self {
        Self {
            full: VecDeque::new(),
            cache: Vec::new(),
            prophet: 0,
        }
    }
}

impl<T> CachingList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
    }

    /// Number of items in the live queue.
    pub fn len(&self) -> usize {
        self.full.len()
    }

    /// Takes an item from the recycle cache, constructing a new one only
    /// when the cache is empty.
    pub fn get_empty(&mut self) -> T
    where
        T: Default,
    {
        self.cache.pop().unwrap_or_default()
    }

    /// Appends a filled item to the live queue.
    pub fn push_back(&mut self, item: T) {
        self.full.push_back(item);
    }

    pub fn peek_front(&self) -> Option<&T> {
        self.full.front()
    }

    /// Removes and returns the oldest live item. The prophet must already
    /// have advanced past it.
    pub fn pop_front(&mut self) -> Option<T> {
        let item = self.full.pop_front()?;
        debug_assert!(self.prophet > 0, "consumed an item the prophet has not seen");
        self.prophet = self.prophet.saturating_sub(1);
        Some(item)
    }

    /// Returns a consumed item to the cache for reuse.
    pub fn recycle(&mut self, item: T) {
        self.cache.push(item);
    }

    /// True iff the prophet has not reached the live tail.
    pub fn can_prophet_advance(&self) -> bool {
        self.prophet < self.full.len()
    }

    /// The item the prophet currently points at.
    pub fn peek_prophet(&self) -> Option<&T> {
        self.full.get(self.prophet)
    }

    /// Moves the prophet past the item it points at.
    ///
    /// # Panics
    /// When the prophet is already at the live tail.
    pub fn advance_prophet(&mut self) {
        assert!(
            self.can_prophet_advance(),
            "prophet advanced past the live tail"
        );
        self.prophet += 1;
    }
}
