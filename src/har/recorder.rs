//! In-memory transaction buffer and the modifier that fills it

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use super::entry::{self, BodyCapture, Entry, HarLog, Timings};
use crate::modifier::{Context, HttpRequest, HttpResponse, Modifier, ModifierError};

/// Request half of an entry, parked in the context until the response arrives
#[derive(Clone)]
struct Pending {
    request: entry::Request,
}

/// Collects one [`Entry`] per exchange.
///
/// The buffer only grows until it is swapped out by
/// [`export_and_reset`](Recorder::export_and_reset); every recorded entry is
/// handed out by exactly one export.
pub struct Recorder {
    entries: Mutex<Vec<Entry>>,
    capture: BodyCapture,
}

impl Recorder {
    pub fn new(capture: BodyCapture) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            capture,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        // A panic while holding the lock cannot leave the Vec half-updated
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, entry: Entry) {
        self.lock().push(entry);
    }

    /// Take every buffered entry, leaving the buffer empty
    pub fn export_and_reset(&self) -> Vec<Entry> {
        std::mem::take(&mut *self.lock())
    }

    /// Put a batch back at the front of the buffer, ahead of anything
    /// recorded since it was taken
    pub fn restore(&self, mut batch: Vec<Entry>) {
        if batch.is_empty() {
            return;
        }
        let mut entries = self.lock();
        batch.append(&mut entries);
        *entries = batch;
    }

    /// HAR document of the current buffer; the buffer is left untouched
    pub fn export(&self) -> HarLog {
        HarLog::new(self.lock().clone())
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn millis_between(from: Instant, to: Instant) -> f64 {
    to.saturating_duration_since(from).as_secs_f64() * 1000.0
}

impl Modifier for Recorder {
    fn modify_request(&self, ctx: &mut Context, req: &mut HttpRequest) -> Result<(), ModifierError> {
        let request = entry::Request::from_http(req, ctx.is_secure(), &self.capture);
        ctx.extensions_mut().insert(Pending { request });
        Ok(())
    }

    fn modify_response(
        &self,
        ctx: &mut Context,
        res: &mut HttpResponse,
    ) -> Result<(), ModifierError> {
        let Some(pending) = ctx.extensions_mut().remove::<Pending>() else {
            return Ok(());
        };

        let now = Instant::now();
        let marks = ctx.timings();
        let sent = marks.request_sent.unwrap_or(marks.started);
        let received = marks.response_received.unwrap_or(sent);
        let timings = Timings {
            send: millis_between(marks.started, sent),
            wait: millis_between(sent, received),
            receive: millis_between(received, now),
        };

        self.record(Entry {
            id: ctx.id().to_string(),
            started_date_time: entry::format_rfc3339(marks.started_at),
            time: millis_between(marks.started, now),
            request: pending.request,
            response: entry::Response::from_http(res, &self.capture),
            timings,
        });
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modifier::testing::{request, response};
    use crate::test_report;
    use std::collections::HashSet;
    use std::sync::Arc;

    pub(crate) fn sample_entry(id: &str, method: &str) -> Entry {
        let req = hyper::Request::builder()
            .method(method)
            .uri("http://example.com/")
            .body(bytes::Bytes::new())
            .unwrap();
        let res = hyper::Response::builder().body(bytes::Bytes::new()).unwrap();
        Entry {
            id: id.to_string(),
            started_date_time: entry::now_iso8601(),
            time: 0.0,
            request: entry::Request::from_http(&req, false, &BodyCapture::default()),
            response: entry::Response::from_http(&res, &BodyCapture::default()),
            timings: Timings::default(),
        }
    }

    #[test]
    fn test_export_and_reset_drains() {
        let t = test_report!("Three records come out once, then the buffer is empty");
        let recorder = Recorder::new(BodyCapture::default());
        for id in ["a", "b", "c"] {
            recorder.record(sample_entry(id, "GET"));
        }
        let first: Vec<String> = recorder.export_and_reset().into_iter().map(|e| e.id).collect();
        t.assert_eq("first export", &first, &vec!["a".to_string(), "b".into(), "c".into()]);
        t.assert_true("second export empty", recorder.export_and_reset().is_empty());
    }

    #[test]
    fn test_export_keeps_buffer() {
        let t = test_report!("export() snapshots without draining; reset() clears");
        let recorder = Recorder::new(BodyCapture::default());
        recorder.record(sample_entry("a", "GET"));
        let doc = recorder.export();
        t.assert_eq("version", &doc.log.version.as_str(), &"1.2");
        t.assert_eq("entries", &doc.log.entries.len(), &1usize);
        t.assert_eq("still buffered", &recorder.len(), &1usize);
        recorder.reset();
        t.assert_true("cleared", recorder.is_empty());
    }

    #[test]
    fn test_restore_goes_in_front() {
        let t = test_report!("Restored batches keep their place ahead of newer records");
        let recorder = Recorder::new(BodyCapture::default());
        recorder.record(sample_entry("a", "GET"));
        let batch = recorder.export_and_reset();
        recorder.record(sample_entry("b", "GET"));
        recorder.restore(batch);
        let ids: Vec<String> = recorder.export_and_reset().into_iter().map(|e| e.id).collect();
        t.assert_eq("order", &ids, &vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_concurrent_record_and_export_conserves_entries() {
        let t = test_report!("Concurrent recording and exporting loses and duplicates nothing");
        let recorder = Arc::new(Recorder::new(BodyCapture::default()));
        let writers = 8;
        let per_writer = 250;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    for i in 0..per_writer {
                        recorder.record(sample_entry(&format!("{}-{}", w, i), "GET"));
                    }
                })
            })
            .collect();

        let mut exported = Vec::new();
        while handles.iter().any(|h| !h.is_finished()) {
            exported.extend(recorder.export_and_reset());
        }
        for h in handles {
            h.join().unwrap();
        }
        exported.extend(recorder.export_and_reset());

        let ids: HashSet<String> = exported.iter().map(|e| e.id.clone()).collect();
        t.assert_eq("count", &exported.len(), &(writers * per_writer));
        t.assert_eq("unique", &ids.len(), &(writers * per_writer));

        // Per-writer order survives batching
        for w in 0..writers {
            let prefix = format!("{}-", w);
            let seq: Vec<usize> = exported
                .iter()
                .filter_map(|e| e.id.strip_prefix(&prefix))
                .filter_map(|n| n.parse().ok())
                .collect();
            t.assert_true(&format!("writer {} ordered", w), seq.windows(2).all(|p| p[0] < p[1]));
        }
    }

    #[test]
    fn test_modifier_records_exchange() {
        let t = test_report!("Recorder builds an entry across both phases");
        let recorder = Recorder::new(BodyCapture::default());
        let mut ctx = Context::detached();
        let mut req = request("http://example.com/hello?x=1");
        recorder.modify_request(&mut ctx, &mut req).unwrap();
        t.assert_true("nothing yet", recorder.is_empty());

        ctx.mark_request_sent();
        ctx.mark_response_received();
        let mut res = response(201);
        recorder.modify_response(&mut ctx, &mut res).unwrap();

        let entries = recorder.export_and_reset();
        t.assert_eq("one entry", &entries.len(), &1usize);
        let e = &entries[0];
        t.assert_eq("id", &e.id, &ctx.id().to_string());
        t.assert_eq("url", &e.request.url.as_str(), &"http://example.com/hello?x=1");
        t.assert_eq("status", &e.response.status, &201u16);
        t.assert_true("time non-negative", e.time >= 0.0);
    }

    #[test]
    fn test_response_without_request_is_ignored() {
        let t = test_report!("A response phase without a pending request records nothing");
        let recorder = Recorder::new(BodyCapture::default());
        recorder
            .modify_response(&mut Context::detached(), &mut response(200))
            .unwrap();
        t.assert_true("empty", recorder.is_empty());
    }
}
