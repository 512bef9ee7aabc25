//! Per-subscription delivery: cooperative, frame-tied, globally budgeted.
//!
//! A notification drains the shared buffer into a local pending queue under a
//! small time slice (yielding with a zero-delay timer when the slice runs
//! out), then schedules a flush on the animation frame, or on an idle
//! callback with a 100 ms deadline during cold start, when available. Each
//! flush delivers at most what the shared FrameBudget grants for that frame;
//! leftovers reschedule. Cancellation is observed at every suspension point.

use gloo_timers::future::TimeoutFuture;
use js_sys::SharedArrayBuffer;
use shared::sub_buffer::SubBufferReader;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::debug;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::spawn_local;

use crate::budget::FrameBudget;

/// Receives each delivered record.
pub type Deliver = Rc<dyn Fn(&[u8])>;

pub struct SubscriptionReader {
    fingerprint: String,
    reader: RefCell<SubBufferReader>,
    pending: RefCell<VecDeque<Vec<u8>>>,
    running: Cell<bool>,
    reading: Cell<bool>,
    flush_scheduled: Cell<bool>,
    raf_handle: Cell<Option<i32>>,
    idle_handle: Cell<Option<f64>>,
    budget: Rc<FrameBudget>,
    deliver: Deliver,
}

impl SubscriptionReader {
    pub fn new(
        fingerprint: String,
        buffer: &SharedArrayBuffer,
        budget: Rc<FrameBudget>,
        deliver: Deliver,
    ) -> Rc<Self> {
        Rc::new(Self {
            fingerprint,
            reader: RefCell::new(SubBufferReader::new(buffer)),
            pending: RefCell::new(VecDeque::new()),
            running: Cell::new(true),
            reading: Cell::new(false),
            flush_scheduled: Cell::new(false),
            raf_handle: Cell::new(None),
            idle_handle: Cell::new(None),
            budget,
            deliver,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The producer signalled new data in our buffer.
    pub fn on_notify(self: &Rc<Self>) {
        if !self.running.get() || self.reading.get() {
            return;
        }
        self.reading.set(true);
        let this = self.clone();
        spawn_local(async move {
            this.drain().await;
        });
    }

    async fn drain(self: Rc<Self>) {
        loop {
            if !self.running.get() {
                break;
            }
            let start = js_sys::Date::now();
            let slice_ms = self.budget.read_budget_ms(start);
            let mut slice_exhausted = false;

            loop {
                if self.pending.borrow().len() >= self.budget.max_pending() {
                    // Reading pauses until flushes relieve the backlog.
                    debug!(sub = %self.fingerprint, "pending queue full, read paused");
                    break;
                }
                let batch = self.reader.borrow_mut().read_new();
                if batch.is_empty() {
                    break;
                }
                self.push_pending(batch);
                if js_sys::Date::now() - start >= slice_ms {
                    slice_exhausted = true;
                    break;
                }
            }

            if !self.pending.borrow().is_empty() {
                self.schedule_flush();
            }
            if slice_exhausted {
                // Yield to the event loop, then keep reading.
                TimeoutFuture::new(0).await;
                continue;
            }
            break;
        }
        self.reading.set(false);
    }

    fn push_pending(&self, records: Vec<Vec<u8>>) {
        let mut pending = self.pending.borrow_mut();
        let max = self.budget.max_pending();
        for record in records {
            if pending.len() >= max {
                pending.pop_front();
            }
            pending.push_back(record);
        }
    }

    fn schedule_flush(self: &Rc<Self>) {
        if self.flush_scheduled.get() || !self.running.get() {
            return;
        }
        self.flush_scheduled.set(true);

        if self.budget.is_cold(js_sys::Date::now()) {
            if let Some(handle) = self.request_idle(100.0) {
                self.idle_handle.set(Some(handle));
                return;
            }
        }
        self.request_raf();
    }

    fn request_raf(self: &Rc<Self>) {
        let Some(window) = web_sys::window() else {
            self.flush_scheduled.set(false);
            return;
        };
        let this = self.clone();
        let callback = Closure::once_into_js(move |frame_ts: f64| {
            this.flush(frame_ts);
        });
        match window.request_animation_frame(callback.unchecked_ref()) {
            Ok(handle) => self.raf_handle.set(Some(handle)),
            Err(_) => self.flush_scheduled.set(false),
        }
    }

    /// requestIdleCallback is feature-detected; None falls back to rAF.
    fn request_idle(self: &Rc<Self>, timeout_ms: f64) -> Option<f64> {
        let window = web_sys::window()?;
        let request = js_sys::Reflect::get(&window, &JsValue::from_str("requestIdleCallback"))
            .ok()?
            .dyn_into::<js_sys::Function>()
            .ok()?;

        let this = self.clone();
        let callback = Closure::once_into_js(move |_deadline: JsValue| {
            // Idle callbacks carry no frame timestamp; quantize wall time so
            // readers flushed in the same period share one token pool.
            let stamp = (js_sys::Date::now() / 16.0).floor();
            this.flush(stamp);
        });

        let options = js_sys::Object::new();
        js_sys::Reflect::set(
            &options,
            &JsValue::from_str("timeout"),
            &JsValue::from_f64(timeout_ms),
        )
        .ok()?;

        request
            .call2(&window, callback.unchecked_ref(), &options)
            .ok()?
            .as_f64()
    }

    fn flush(self: Rc<Self>, frame_stamp: f64) {
        self.flush_scheduled.set(false);
        self.raf_handle.set(None);
        self.idle_handle.set(None);
        if !self.running.get() {
            return;
        }

        self.budget.begin_frame(frame_stamp, js_sys::Date::now());
        let want = self.pending.borrow().len() as u32;
        let granted = self.budget.take(want);

        for _ in 0..granted {
            let record = self.pending.borrow_mut().pop_front();
            match record {
                Some(record) => (self.deliver)(&record),
                None => break,
            }
        }

        // Backlog left (tokens ran out or more arrived): next frame.
        if !self.pending.borrow().is_empty() {
            self.schedule_flush();
        }
    }

    /// Stop delivering: cancel scheduled work and forget the backlog.
    pub fn cancel(&self) {
        self.running.set(false);
        self.flush_scheduled.set(false);
        if let Some(handle) = self.raf_handle.take() {
            if let Some(window) = web_sys::window() {
                let _ = window.cancel_animation_frame(handle);
            }
        }
        if let Some(handle) = self.idle_handle.take() {
            cancel_idle(handle);
        }
        self.pending.borrow_mut().clear();
    }
}

fn cancel_idle(handle: f64) {
    let Some(window) = web_sys::window() else {
        return;
    };
    if let Ok(cancel) = js_sys::Reflect::get(&window, &JsValue::from_str("cancelIdleCallback")) {
        if let Ok(cancel) = cancel.dyn_into::<js_sys::Function>() {
            let _ = cancel.call1(&window, &JsValue::from_f64(handle));
        }
    }
}
