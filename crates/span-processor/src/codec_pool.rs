// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::codec::Codec;

/// Pool of reusable [`Codec`] instances.
///
/// Codecs are created lazily on first demand. Released codecs are kept for reuse up to
/// `max_idle`; anything above that is dropped and recreated on demand later.
#[derive(Debug)]
pub struct CodecPool {
    idle: Mutex<Vec<Codec>>,
    max_idle: usize,
    next_id: AtomicU64,
}

impl CodecPool {
    pub fn new(max_idle: usize) -> Self {
        CodecPool {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            next_id: AtomicU64::new(0),
        }
    }

    /// Returns an empty codec, recycled when one is idle. The codec goes back to the pool when
    /// the returned guard is dropped.
    pub fn acquire(&self) -> PooledCodec<'_> {
        let recycled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut codec = match recycled {
            Some(codec) => codec,
            None => Codec::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
        };
        codec.reset();
        PooledCodec {
            codec: Some(codec),
            pool: self,
        }
    }

    /// Returns `codec` to the idle list, or drops it when the list is full.
    pub fn release(&self, mut codec: Codec) {
        codec.reset();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(codec);
        }
    }

    /// Number of codecs constructed so far.
    pub fn created(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A codec checked out of a [`CodecPool`].
#[derive(Debug)]
pub struct PooledCodec<'a> {
    codec: Option<Codec>,
    pool: &'a CodecPool,
}

impl PooledCodec<'_> {
    /// Returns the codec to its pool now instead of at the end of scope.
    pub fn release(mut self) {
        if let Some(codec) = self.codec.take() {
            self.pool.release(codec);
        }
    }
}

impl Deref for PooledCodec<'_> {
    type Target = Codec;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Codec {
        self.codec.as_ref().expect("codec is present until released")
    }
}

impl DerefMut for PooledCodec<'_> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Codec {
        self.codec.as_mut().expect("codec is present until released")
    }
}

impl Drop for PooledCodec<'_> {
    fn drop(&mut self) {
        if let Some(codec) = self.codec.take() {
            self.pool.release(codec);
        }
    }
}
