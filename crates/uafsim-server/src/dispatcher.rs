//! Routes decoded requests to the chunk registry.
//!
//! The dispatcher holds no lifecycle logic of its own. It decodes a frame,
//! calls exactly one registry operation, and wraps the typed outcome in a
//! [`Response`]. Every failure, including a panic inside dispatch, comes back
//! as a response so the connection survives it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uafsim_registry::{ChunkRegistry, DeleteOutcome, FreeOutcome, ReadOutcome, UseOutcome};

use crate::protocol::{Command, ProtocolError, Request, Response};

/// Result of handling one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Command the frame decoded to, if any.
    pub command: Option<Command>,
    pub response: Response,
}

impl Dispatch {
    /// The connection should close after this response is written.
    #[must_use]
    pub fn ends_connection(&self) -> bool {
        self.command == Some(Command::Shutdown)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ChunkRegistry>,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<ChunkRegistry>, stop: Arc<AtomicBool>) -> Self {
        Self { registry, stop }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ChunkRegistry> {
        &self.registry
    }

    /// Whether a `SHUTDOWN` has been processed.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Decode and execute one frame.
    pub fn dispatch_frame(&self, frame: &[u8]) -> Dispatch {
        self.guarded(|| self.try_dispatch(frame))
    }

    /// Run one dispatch step, turning decode errors and panics into replies.
    fn guarded(
        &self,
        step: impl FnOnce() -> Result<Dispatch, (Option<Command>, ProtocolError)>,
    ) -> Dispatch {
        match catch_unwind(AssertUnwindSafe(step)) {
            Ok(Ok(dispatch)) => dispatch,
            Ok(Err((command, err))) => Dispatch {
                command,
                response: Response::from_error(&err),
            },
            Err(panic) => Dispatch {
                command: None,
                response: Response::from_error(&ProtocolError::Dispatch(panic_message(
                    panic.as_ref(),
                ))),
            },
        }
    }

    fn try_dispatch(&self, frame: &[u8]) -> Result<Dispatch, (Option<Command>, ProtocolError)> {
        let request = Request::decode(frame).map_err(|err| {
            let command = match &err {
                ProtocolError::MalformedRequest { command, .. } => Some(*command),
                _ => None,
            };
            (command, err)
        })?;
        let command = request.command();
        Ok(Dispatch {
            command: Some(command),
            response: self.execute(request),
        })
    }

    /// Execute an already decoded request.
    pub fn execute(&self, request: Request) -> Response {
        let reg = &self.registry;
        match request {
            Request::Create { id } => Response::Created(reg.create(&id)),
            Request::Alloc(alloc) => Response::Allocated(reg.allocate(alloc.size, &alloc.data)),
            Request::Delete { id } => match reg.mark_deleted(&id) {
                DeleteOutcome::Deleted => Response::Deleted,
                DeleteOutcome::AlreadyDeleted => Response::DoubleFreeDetected,
                DeleteOutcome::NotFound => Response::NotFound,
            },
            Request::Free { id } => match reg.free(&id) {
                FreeOutcome::Freed => Response::Freed,
                FreeOutcome::AlreadyFreed => Response::DoubleFreeDetected,
                FreeOutcome::NotFound => Response::ChunkNotFound,
            },
            Request::Use { id } => match reg.use_chunk(&id) {
                UseOutcome::Value(payload) => Response::Payload(payload),
                UseOutcome::UafDetected { sentinel, leaked } => {
                    Response::UafDetected { sentinel, leaked }
                }
                UseOutcome::NotFound => Response::ObjectNotFound,
            },
            Request::Read { id } => match reg.read(&id) {
                ReadOutcome::Value(payload) => Response::Payload(payload),
                ReadOutcome::ReadAfterFree(leaked) => Response::ReadAfterFree(leaked),
                ReadOutcome::NotFound => Response::ChunkNotFound,
            },
            Request::HeapInfo => Response::HeapInfo(reg.info()),
            Request::Shutdown => {
                self.stop.store(true, Ordering::SeqCst);
                Response::ServerShutdown
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "dispatch panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uafsim_registry::config::sentinel_bytes;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(ChunkRegistry::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn wire(d: &Dispatcher, frame: &[u8]) -> Vec<u8> {
        d.dispatch_frame(frame).response.encode()
    }

    #[test]
    fn delete_then_use_reports_uaf() {
        let d = dispatcher();
        assert_eq!(wire(&d, b"CREATE:obj1"), b"CREATED:obj1");
        let live = wire(&d, b"USE:obj1");
        assert!(live.starts_with(b"initial_data_"));
        assert_eq!(wire(&d, b"DELETE:obj1"), b"DELETED");

        let mut expected = b"UAF_DETECTED:".to_vec();
        expected.extend_from_slice(&sentinel_bytes());
        expected.extend_from_slice(&live[..8]);
        assert_eq!(wire(&d, b"USE:obj1"), expected);

        // Second delete of a freed record is a double free, not a miss.
        assert_eq!(wire(&d, b"DELETE:obj1"), b"DOUBLE_FREE_DETECTED");
        assert_eq!(wire(&d, b"DELETE:never"), b"NOT_FOUND");
    }

    #[test]
    fn free_then_read_reports_read_after_free() {
        let d = dispatcher();
        let alloc = wire(&d, b"ALLOC:\x0a\x00\x00\x00hello");
        assert_eq!(alloc, b"ALLOCATED:chunk_0");
        assert_eq!(wire(&d, b"READ:chunk_0"), b"hello");
        assert_eq!(wire(&d, b"FREE:chunk_0"), b"FREED");
        assert_eq!(wire(&d, b"FREE:chunk_0"), b"DOUBLE_FREE_DETECTED");
        assert_eq!(wire(&d, b"READ:chunk_0"), b"READ_AFTER_FREE:hello");
        assert_eq!(wire(&d, b"FREE:chunk_9"), b"CHUNK_NOT_FOUND");
        assert_eq!(wire(&d, b"READ:chunk_9"), b"CHUNK_NOT_FOUND");
        assert_eq!(wire(&d, b"USE:chunk_9"), b"OBJECT_NOT_FOUND");
    }

    #[test]
    fn short_alloc_fails_without_touching_registry() {
        let d = dispatcher();
        let out = d.dispatch_frame(b"ALLOC:\x01\x02");
        assert_eq!(out.command, Some(Command::Alloc));
        assert_eq!(out.response.encode(), b"ALLOC_FAILED");
        assert!(d.registry().is_empty());
    }

    #[test]
    fn heapinfo_counts_distinct_freed_ids() {
        let d = dispatcher();
        for frame in [&b"CREATE:a"[..], b"CREATE:b", b"FREE:a", b"FREE:a", b"DELETE:b"] {
            d.dispatch_frame(frame);
        }
        assert_eq!(wire(&d, b"HEAPINFO"), b"Chunks: 2, Freed: 2");
        assert_eq!(wire(&d, b"HEAPINFO\n"), b"Chunks: 2, Freed: 2");
    }

    #[test]
    fn unknown_commands_do_not_mutate() {
        let d = dispatcher();
        let out = d.dispatch_frame(b"PING:x");
        assert_eq!(out.command, None);
        assert_eq!(out.response, Response::UnknownCommand);
        assert_eq!(wire(&d, b""), b"UNKNOWN_COMMAND");
        assert!(d.registry().is_empty());
    }

    #[test]
    fn shutdown_sets_stop_flag_and_ends_connection() {
        let d = dispatcher();
        assert!(!d.stop_requested());
        let out = d.dispatch_frame(b"SHUTDOWN");
        assert_eq!(out.response.encode(), b"SERVER_SHUTDOWN");
        assert!(out.ends_connection());
        assert!(d.stop_requested());
        // Other commands keep working on connections that remain open.
        assert_eq!(wire(&d, b"CREATE:late"), b"CREATED:late");
    }

    #[test]
    fn panic_during_dispatch_becomes_error_reply() {
        let d = dispatcher();
        let out = d.guarded(|| {
            d.registry().create("half");
            panic!("registry exploded")
        });
        assert_eq!(out.command, None);
        assert_eq!(out.response.encode(), b"ERROR: registry exploded");

        let formatted = d.guarded(|| panic!("bad chunk {}", 7));
        assert_eq!(formatted.response.encode(), b"ERROR: bad chunk 7");

        // The registry lock is not poisoned; later frames still dispatch.
        assert!(wire(&d, b"USE:half").starts_with(b"initial_data_"));
        assert_eq!(wire(&d, b"HEAPINFO"), b"Chunks: 1, Freed: 0");
    }

    #[test]
    fn panic_message_falls_back_for_opaque_payloads() {
        let caught = catch_unwind::<_, ()>(|| std::panic::panic_any(42_u32)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "dispatch panicked");
    }
}
