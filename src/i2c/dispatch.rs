//! Poll dispatch thread
//!
//! Reads poll pushes off the poll socket and routes each to the callback of
//! its registration. Unknown ids are skipped. A line whose id prefix cannot
//! be parsed means the stream is out of sync, so the connection is dropped
//! and left for the watchdog to re-establish.

use super::channel::ChannelShared;
use super::line_framer::LineFramer;
use super::poll::PollRegistry;
use super::protocol;
use super::source::ByteSource;
use crate::error::Result;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// How long the idle thread sleeps between shutdown checks
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Why a poll stream stopped being read
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Shutdown,
    Closed,
    Failed(String),
    Corrupt(String),
}

pub(crate) fn run(shared: Arc<ChannelShared>) {
    log::debug!("Poll dispatch thread started");

    while let Some((generation, mut reader)) = shared.wait_for_poll_reader(IDLE_WAIT) {
        let end = pump(&mut reader, &shared.registry, || {
            shared.shutdown.load(Ordering::SeqCst)
        });
        drop(reader);

        match &end {
            StreamEnd::Shutdown => break,
            StreamEnd::Closed => log::warn!("Poll stream closed by proxy"),
            StreamEnd::Failed(e) => log::warn!("Poll stream read failed: {}", e),
            StreamEnd::Corrupt(e) => log::error!("Poll stream corrupt, reconnecting: {}", e),
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        shared.disconnect_generation(generation);
    }

    log::debug!("Poll dispatch thread stopped");
}

/// Read and dispatch lines until the stream ends or `stopping` turns true
fn pump<S: ByteSource>(
    reader: &mut LineFramer<S>,
    registry: &PollRegistry,
    stopping: impl Fn() -> bool,
) -> StreamEnd {
    loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => {
                return if stopping() {
                    StreamEnd::Shutdown
                } else {
                    StreamEnd::Closed
                };
            }
            Err(e) => {
                return if stopping() {
                    StreamEnd::Shutdown
                } else {
                    StreamEnd::Failed(e.to_string())
                };
            }
        };
        if stopping() {
            return StreamEnd::Shutdown;
        }
        if let Err(e) = dispatch_line(registry, &line) {
            return StreamEnd::Corrupt(e.to_string());
        }
    }
}

/// Route one poll line to its callback.
///
/// Only a malformed id prefix is an error; everything else is delivered or
/// skipped.
pub(crate) fn dispatch_line(registry: &PollRegistry, line: &str) -> Result<()> {
    let parsed = protocol::parse_poll_line(line)?;

    let Some(registration) = registry.get(parsed.id) else {
        log::debug!("Unknown poll id {}, skipping", parsed.id);
        return Ok(());
    };

    let values = protocol::parse_poll_values(parsed.payload, registration.request.count);
    if values.is_none() {
        log::debug!(
            "Poll {} returned no values: '{}'",
            parsed.id,
            protocol::trim_line_ending(line)
        );
    }

    let event = registration.event(values);
    let callback = Arc::clone(&registration.callback);
    if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
        log::error!("Callback for poll {} panicked", parsed.id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::i2c::poll::{PollEvent, PollId, PollRegistration, PollRequest};
    use parking_lot::Mutex;

    fn register(registry: &PollRegistry, id: PollId, count: usize) -> Arc<Mutex<Vec<PollEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.insert(PollRegistration {
            id,
            request: PollRequest {
                delay_ms: 1000,
                address: 0x10,
                register: 2,
                count,
            },
            user_data: None,
            callback: Arc::new(move |event: &PollEvent| sink.lock().push(event.clone())),
        });
        seen
    }

    struct Lines(Vec<u8>, usize);

    impl ByteSource for Lines {
        fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
            let n = (self.0.len() - self.1).min(buffer.len());
            buffer[..n].copy_from_slice(&self.0[self.1..self.1 + n]);
            self.1 += n;
            Ok(n)
        }
    }

    #[test]
    fn test_values_delivered() {
        let registry = PollRegistry::new();
        let seen = register(&registry, 5, 2);

        dispatch_line(&registry, "5: 12 34\r\n").unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].poll_id, 5);
        assert_eq!(events[0].values, Some(vec![12, 34]));
    }

    #[test]
    fn test_error_and_mismatch_deliver_none() {
        let registry = PollRegistry::new();
        let seen = register(&registry, 1, 2);

        dispatch_line(&registry, "1: ERROR\r\n").unwrap();
        dispatch_line(&registry, "1: 7\r\n").unwrap();
        dispatch_line(&registry, "1: 7 x\r\n").unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.values.is_none()));
    }

    #[test]
    fn test_unknown_id_skipped() {
        let registry = PollRegistry::new();
        let seen = register(&registry, 1, 1);

        dispatch_line(&registry, "2: 9\r\n").unwrap();

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_removed_id_not_dispatched() {
        let registry = PollRegistry::new();
        let seen = register(&registry, 3, 1);
        registry.remove(3);

        dispatch_line(&registry, "3: 1\r\n").unwrap();

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_bad_prefix_is_error() {
        let registry = PollRegistry::new();
        assert!(matches!(
            dispatch_line(&registry, "hello\r\n"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            dispatch_line(&registry, "abc: 1\r\n"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_panicking_callback_contained() {
        let registry = PollRegistry::new();
        registry.insert(PollRegistration {
            id: 4,
            request: PollRequest {
                delay_ms: 10,
                address: 0x20,
                register: 0,
                count: 1,
            },
            user_data: None,
            callback: Arc::new(|event: &PollEvent| {
                assert!(event.values.is_none(), "callback failure");
            }),
        });
        assert!(dispatch_line(&registry, "4: 1\r\n").is_ok());
    }

    #[test]
    fn test_pump_stops_on_corruption() {
        let registry = PollRegistry::new();
        let seen = register(&registry, 1, 1);
        let source = Lines(b"1: 5\r\n1: 6\r\n???\r\n1: 7\r\n".to_vec(), 0);
        let mut reader = LineFramer::new(source, 64);

        let end = pump(&mut reader, &registry, || false);

        assert!(matches!(end, StreamEnd::Corrupt(_)));
        let values: Vec<_> = seen.lock().iter().map(|e| e.values.clone()).collect();
        assert_eq!(values, vec![Some(vec![5]), Some(vec![6])]);
    }

    #[test]
    fn test_pump_reports_close() {
        let registry = PollRegistry::new();
        let mut reader = LineFramer::new(Lines(b"9: 1\r\n".to_vec(), 0), 16);
        assert_eq!(pump(&mut reader, &registry, || false), StreamEnd::Closed);

        let mut reader = LineFramer::new(Lines(b"9: 1\r\n".to_vec(), 0), 16);
        assert_eq!(pump(&mut reader, &registry, || true), StreamEnd::Shutdown);
    }
}
