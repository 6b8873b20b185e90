// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

/// A random-access collection whose indices can be partitioned into chunks.
pub trait IndexedSource {
    /// Number of items in the collection.
    fn source_len(&self) -> usize;
}

impl<T> IndexedSource for [T] {
    fn source_len(&self) -> usize {
        self.len()
    }
}

impl<T, const N: usize> IndexedSource for [T; N] {
    fn source_len(&self) -> usize {
        N
    }
}

impl<T> IndexedSource for Vec<T> {
    fn source_len(&self) -> usize {
        self.len()
    }
}

impl<T> IndexedSource for VecDeque<T> {
    fn source_len(&self) -> usize {
        self.len()
    }
}

impl<T> IndexedSource for Box<[T]> {
    fn source_len(&self) -> usize {
        self.len()
    }
}

impl<T: IndexedSource + ?Sized> IndexedSource for Arc<T> {
    fn source_len(&self) -> usize {
        (**self).source_len()
    }
}

impl<T: IndexedSource + ?Sized> IndexedSource for Rc<T> {
    fn source_len(&self) -> usize {
        (**self).source_len()
    }
}

impl<T: IndexedSource + ?Sized> IndexedSource for &T {
    fn source_len(&self) -> usize {
        (**self).source_len()
    }
}
