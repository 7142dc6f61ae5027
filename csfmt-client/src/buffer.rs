//! The shared response buffer.
//!
//! One buffer is allocated per format call. The worker writes the payload
//! once, publishes `length` and then `status` with release stores, and wakes
//! the caller; the caller blocks until `status` leaves `PENDING` and reads
//! the payload after an acquire load. Layout mirrors the wire-independent
//! hand-off contract: `[status:i32][length:i32][payload:byte[capacity]]`.

use csfmt_protocol::{Diagnostic, ErrorCode, FormatMetrics};
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// No result delivered yet.
pub const STATUS_PENDING: i32 = 0;
/// Payload carries a successful delivery.
pub const STATUS_OK: i32 = 1;
/// Payload carries an error delivery.
pub const STATUS_ERROR: i32 = 2;

/// Minimum buffer capacity (64 KiB).
pub const MIN_CAPACITY: usize = 64 * 1024;

/// Headroom added on top of twice the source length (4 KiB).
pub const CAPACITY_HEADROOM: usize = 4 * 1024;

/// What the worker hands the caller through the buffer. Deliberately
/// decoupled from the wire schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Delivery {
    Ok {
        formatted: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        diagnostics: Vec<Diagnostic>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metrics: Option<FormatMetrics>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Present when the host itself answered with an error response;
        /// absent for transport-level failures (exit, timeout, fatal
        /// notification).
        #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
}

/// A bounded single-producer single-consumer response slot.
pub struct ResponseBuffer {
    status: AtomicI32,
    length: AtomicI32,
    payload: UnsafeCell<Box<[u8]>>,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

// SAFETY: `payload` is written exactly once by the worker before its release
// store to `status`, and read by the caller only after observing a
// non-pending `status` with an acquire load. The release/acquire pair on
// `status` orders the payload bytes; there is never a concurrent write and
// read of the same region.
unsafe impl Send for ResponseBuffer {}
unsafe impl Sync for ResponseBuffer {}

impl ResponseBuffer {
    /// Allocates a buffer with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            status: AtomicI32::new(STATUS_PENDING),
            length: AtomicI32::new(0),
            payload: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Allocates a buffer sized for the given source text:
    /// `max(64 KiB, 2 * utf8_len + 4 KiB)`.
    pub fn for_source(source: &str) -> Self {
        let sized = source.len().saturating_mul(2).saturating_add(CAPACITY_HEADROOM);
        Self::with_capacity(sized.max(MIN_CAPACITY))
    }

    /// The payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        // SAFETY: reading the slice length does not touch the payload bytes,
        // and the box itself is never reallocated.
        unsafe { (&*self.payload.get()).len() }
    }

    /// Worker side: writes the payload and publishes `status`, waking the
    /// caller. Panics if the payload exceeds capacity; the worker substitutes
    /// the overflow delivery before calling.
    pub fn publish(&self, status: i32, payload: &[u8]) {
        assert!(payload.len() <= self.capacity(), "payload exceeds capacity");
        assert!(status == STATUS_OK || status == STATUS_ERROR);

        // SAFETY: single producer; the caller does not read until `status`
        // is published below.
        unsafe {
            (&mut *self.payload.get())[..payload.len()].copy_from_slice(payload);
        }
        self.length.store(payload.len() as i32, Ordering::Release);
        self.status.store(status, Ordering::Release);

        let _guard = self.wake_lock.lock().unwrap();
        self.wake.notify_all();
    }

    /// Serializes a delivery and publishes it, substituting the overflow
    /// error when it does not fit.
    pub fn publish_delivery(&self, delivery: &Delivery) {
        let status = match delivery {
            Delivery::Ok { .. } => STATUS_OK,
            Delivery::Error { .. } => STATUS_ERROR,
        };
        let bytes = match serde_json::to_vec(delivery) {
            Ok(bytes) => bytes,
            Err(e) => {
                let fallback = Delivery::Error {
                    message: Some(format!("failed to serialize host response: {e}")),
                    error_code: None,
                };
                self.publish(STATUS_ERROR, &serde_json::to_vec(&fallback).unwrap());
                return;
            }
        };

        if bytes.len() > self.capacity() {
            let overflow = Delivery::Error {
                message: Some("Host response exceeded buffer capacity.".to_string()),
                error_code: None,
            };
            self.publish(STATUS_ERROR, &serde_json::to_vec(&overflow).unwrap());
            return;
        }
        self.publish(status, &bytes);
    }

    /// Caller side: blocks until a delivery is published or the timeout
    /// elapses. Returns `None` on timeout; the call is then an error
    /// regardless of what the worker publishes later.
    pub fn wait(&self, timeout: Duration) -> Option<(i32, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.wake_lock.lock().unwrap();
        loop {
            let status = self.status.load(Ordering::Acquire);
            if status != STATUS_PENDING {
                drop(guard);
                let length = self.length.load(Ordering::Acquire) as usize;
                // SAFETY: the acquire load of a published `status` orders
                // this read after the worker's writes; the worker writes
                // nothing further.
                let bytes = unsafe { (&*self.payload.get())[..length].to_vec() };
                return Some((status, bytes));
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _timeout_result) = self.wake.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    /// Parses a published payload into a delivery.
    pub fn parse(bytes: &[u8]) -> Result<Delivery, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
