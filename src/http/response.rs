//! Response tracking for the access-log hook.
//!
//! [`TrackedBody`] sits between the handler's response body and hyper. It
//! counts the bytes hyper pulls out of it and reports the finished request to
//! the access-log hook once the body ends, errors, or is dropped early.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use chrono::{DateTime, Local};
use http::StatusCode;
use http_body::{Frame, SizeHint};

use crate::access_log::{AccessLogHook, AccessRecord, RequestMeta};

/// Everything needed to build the access record once the body is done.
pub(crate) struct Completion {
    pub request: RequestMeta,
    pub started: DateTime<Local>,
    pub clock: Instant,
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub hook: Arc<dyn AccessLogHook>,
}

/// Response body wrapper that counts written bytes.
pub struct TrackedBody {
    inner: Body,
    written: u64,
    completion: Option<Completion>,
}

impl TrackedBody {
    pub(crate) fn new(inner: Body, completion: Completion) -> Self {
        Self {
            inner,
            written: 0,
            completion: Some(completion),
        }
    }

    /// Bytes handed to the connection so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    fn complete(&mut self) {
        let Some(done) = self.completion.take() else {
            return;
        };

        let record = AccessRecord {
            request: done.request,
            started: done.started,
            elapsed: done.clock.elapsed(),
            status: done.status,
            bytes: done.content_length.unwrap_or(self.written),
        };
        done.hook.log(&record);
    }
}

impl http_body::Body for TrackedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.written += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.complete(),
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.complete();
    }
}
