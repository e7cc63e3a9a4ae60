//! Streams, events and stream callbacks

use super::{Context, Driver, ScopedActivateContext, logged};
use crate::error::{Error, Result};
use crate::runtime::{Backend, EventFlags, EventStatus, RawEvent, RawStream, Status};
use std::fmt;
use std::marker::PhantomData;

// ============================================================================
// Handles
// ============================================================================

/// An in-order work queue owned by the caller.
///
/// Release with [`Driver::destroy_stream`], which nulls the handle. The null
/// stream ([`Stream::null`]) names the context's default stream and needs no
/// release.
pub struct Stream<B: Backend> {
    raw: RawStream,
    _backend: PhantomData<B>,
}

impl<B: Backend> Stream<B> {
    /// The context's default stream
    pub fn null() -> Self {
        Self {
            raw: RawStream::NULL,
            _backend: PhantomData,
        }
    }

    /// Raw driver handle
    #[inline]
    pub fn raw(&self) -> RawStream {
        self.raw
    }

    /// Whether this is the null stream (or a destroyed one)
    #[inline]
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }
}

impl<B: Backend> fmt::Debug for Stream<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({:?})", self.raw)
    }
}

impl<B: Backend> Drop for Stream<B> {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            tracing::warn!(
                backend = B::NAME,
                "stream {:?} dropped without destroy_stream; leaked",
                self.raw
            );
        }
    }
}

/// A completion marker recorded into a stream.
///
/// Release with [`Driver::destroy_event`], which nulls the handle.
pub struct Event<B: Backend> {
    raw: RawEvent,
    flags: EventFlags,
    _backend: PhantomData<B>,
}

impl<B: Backend> Event<B> {
    /// Raw driver handle
    #[inline]
    pub fn raw(&self) -> RawEvent {
        self.raw
    }

    /// Flags the event was created with
    #[inline]
    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// Whether the event has been destroyed
    #[inline]
    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }
}

impl<B: Backend> fmt::Debug for Event<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("raw", &self.raw)
            .field("flags", &self.flags)
            .finish()
    }
}

impl<B: Backend> Drop for Event<B> {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            tracing::warn!(
                backend = B::NAME,
                "event {:?} dropped without destroy_event; leaked",
                self.raw
            );
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

impl<B: Backend> Driver<B> {
    /// Create a stream in `context`.
    pub fn create_stream(context: &Context<B>) -> Result<Stream<B>> {
        let _scope = ScopedActivateContext::new(context)?;
        let raw = logged::<B, _>("stream_create", B::stream_create()).map_err(|status| {
            Error::Context {
                op: "stream_create",
                status,
            }
        })?;
        tracing::trace!(backend = B::NAME, context = context.id(), "created stream {:?}", raw);
        Ok(Stream {
            raw,
            _backend: PhantomData,
        })
    }

    /// Destroy `stream` and null its handle.
    ///
    /// Work already queued on the stream still runs. The handle is nulled even
    /// if the driver reports an error, since it is unusable either way.
    pub fn destroy_stream(context: &Context<B>, stream: &mut Stream<B>) -> Result<()> {
        if stream.raw.is_null() {
            return Ok(());
        }
        let raw = std::mem::replace(&mut stream.raw, RawStream::NULL);
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("stream_destroy", B::stream_destroy(raw)).map_err(|status| {
            Error::Context {
                op: "stream_destroy",
                status,
            }
        })
    }

    /// Block until all work queued on `stream` has completed.
    pub fn synchronize_stream(context: &Context<B>, stream: &Stream<B>) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("stream_synchronize", B::stream_synchronize(stream.raw)).map_err(
            |status| Error::Synchronization {
                op: "stream_synchronize",
                status,
            },
        )
    }

    /// Whether `stream` has no pending work.
    ///
    /// An execution error also reports `false` (after logging it); the error
    /// itself surfaces at the next synchronization.
    pub fn is_stream_idle(context: &Context<B>, stream: &Stream<B>) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        match B::stream_query(stream.raw) {
            Ok(()) => true,
            Err(Status::NOT_READY) => false,
            Err(status) => {
                super::log_failure(B::NAME, "stream_query", status);
                false
            }
        }
    }

    /// Make future work on `stream` wait for the latest record of `event`.
    pub fn wait_stream_on_event(context: &Context<B>, stream: &Stream<B>, event: &Event<B>) -> bool {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>("stream_wait_event", B::stream_wait_event(stream.raw, event.raw)).is_ok()
    }

    /// Run `callback` on a driver thread once all prior work on `stream` is done.
    ///
    /// The callback receives the stream status at that point. It must not call
    /// back into the driver.
    pub fn add_stream_callback<F>(context: &Context<B>, stream: &Stream<B>, callback: F) -> bool
    where
        F: FnOnce(std::result::Result<(), Status>) + Send + 'static,
    {
        let Ok(_scope) = ScopedActivateContext::new(context) else {
            return false;
        };
        logged::<B, _>(
            "stream_add_callback",
            B::stream_add_callback(stream.raw, Box::new(callback)),
        )
        .is_ok()
    }

    /// Run `f` with a fresh stream that is destroyed on every exit path.
    ///
    /// The stream is synchronized before it is destroyed, so work queued by `f`
    /// has completed (or failed) when this returns.
    pub fn with_stream<R>(
        context: &Context<B>,
        f: impl FnOnce(&Stream<B>) -> Result<R>,
    ) -> Result<R> {
        let mut stream = Self::create_stream(context)?;
        let result = f(&stream);
        let synced = Self::synchronize_stream(context, &stream);
        let destroyed = Self::destroy_stream(context, &mut stream);
        let value = result?;
        synced?;
        destroyed?;
        Ok(value)
    }
}

// ============================================================================
// Events
// ============================================================================

impl<B: Backend> Driver<B> {
    /// Create an event in `context`.
    pub fn init_event(context: &Context<B>, flags: EventFlags) -> Result<Event<B>> {
        let _scope = ScopedActivateContext::new(context)?;
        let raw = logged::<B, _>("event_create", B::event_create(flags)).map_err(|status| {
            Error::Context {
                op: "event_create",
                status,
            }
        })?;
        Ok(Event {
            raw,
            flags,
            _backend: PhantomData,
        })
    }

    /// Destroy `event` and null its handle.
    pub fn destroy_event(context: &Context<B>, event: &mut Event<B>) -> Result<()> {
        if event.raw.is_null() {
            return Ok(());
        }
        let raw = std::mem::replace(&mut event.raw, RawEvent::NULL);
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("event_destroy", B::event_destroy(raw)).map_err(|status| Error::Context {
            op: "event_destroy",
            status,
        })
    }

    /// Record `event` at the current tail of `stream`.
    pub fn record_event(context: &Context<B>, event: &Event<B>, stream: &Stream<B>) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("event_record", B::event_record(event.raw, stream.raw)).map_err(|status| {
            Error::Context {
                op: "event_record",
                status,
            }
        })
    }

    /// Poll `event` without blocking.
    pub fn query_event(context: &Context<B>, event: &Event<B>) -> Result<EventStatus> {
        let _scope = ScopedActivateContext::new(context)?;
        match B::event_query(event.raw) {
            Ok(()) => Ok(EventStatus::Complete),
            Err(Status::NOT_READY) => Ok(EventStatus::Pending),
            Err(status) => {
                super::log_failure(B::NAME, "event_query", status);
                Err(Error::Synchronization {
                    op: "event_query",
                    status,
                })
            }
        }
    }

    /// Block until the latest record of `event` has completed.
    pub fn synchronize_event(context: &Context<B>, event: &Event<B>) -> Result<()> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>("event_synchronize", B::event_synchronize(event.raw)).map_err(|status| {
            Error::Synchronization {
                op: "event_synchronize",
                status,
            }
        })
    }

    /// Milliseconds between two completed, timing-enabled events.
    pub fn event_elapsed_time(context: &Context<B>, start: &Event<B>, stop: &Event<B>) -> Result<f32> {
        let _scope = ScopedActivateContext::new(context)?;
        logged::<B, _>(
            "event_elapsed_time",
            B::event_elapsed_time(start.raw, stop.raw),
        )
        .map_err(|status| Error::Query {
            op: "event_elapsed_time",
            status,
        })
    }
}
