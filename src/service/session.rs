//! Session Layer (spec §4.4): bridges a control-plane websocket to an
//! in-container process. This module holds the logic that is testable
//! without a live websocket or container — control-directive parsing and
//! log batching policy; the websocket plumbing itself lives in
//! `api::ws` and `api::vms`, grounded on the same trait objects.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const RESIZE_PREFIX: &str = "$$MATRISEA_RESIZE";

/// A terminal-resize directive embedded in the input stream of an
/// interactive session (spec §4.4.1): the literal control string
/// `"$$MATRISEA_RESIZE <cols> <rows>"` rather than raw keystrokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeDirective {
    pub cols: u16,
    pub rows: u16,
}

/// Outcome of scanning one incoming text frame for the control prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDirective {
    Resize(ResizeDirective),
    /// Carried the control prefix but the arguments did not parse; spec
    /// §4.4 says these are logged and ignored, not forwarded as input.
    Malformed,
}

/// Scans one incoming websocket text frame. `None` means ordinary terminal
/// input that should be forwarded verbatim; `Some` means the frame carried
/// the `"$$MATRISEA_RESIZE"` control prefix, either well-formed or not.
pub fn parse_resize_directive(frame: &str) -> Option<ControlDirective> {
    let rest = frame.trim().strip_prefix(RESIZE_PREFIX)?;
    let mut args = rest.split_whitespace();
    match (args.next(), args.next(), args.next()) {
        (Some(cols), Some(rows), None) => match (cols.parse(), rows.parse()) {
            (Ok(cols), Ok(rows)) => Some(ControlDirective::Resize(ResizeDirective { cols, rows })),
            _ => Some(ControlDirective::Malformed),
        },
        _ => Some(ControlDirective::Malformed),
    }
}

/// Batches raw log bytes so the websocket is not driven one line at a time:
/// a flush is due once either the byte threshold or the time threshold is
/// reached (spec §4.4.2 "Log tailer").
pub struct LogBatcher {
    flush_bytes: usize,
    buf: Vec<u8>,
}

impl LogBatcher {
    pub fn new(flush_bytes: usize) -> Self {
        LogBatcher {
            flush_bytes,
            buf: Vec::new(),
        }
    }

    /// Appends `chunk` and returns the buffered bytes (draining the
    /// buffer) if the byte threshold was crossed.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() >= self.flush_bytes {
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }

    /// Forces a flush regardless of size, used on the periodic timer tick.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Uniquely identifies a live session for the `live_sessions` bookkeeping
/// registry in `AppState` (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn next() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Terminal,
    LogTail,
    Provisioning,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub device_name: String,
    pub kind: SessionKind,
    pub cancel: tokio_util::sync::CancellationToken,
}

/// In-memory registry of sessions currently attached to a device, used only
/// so `VMRemove` can politely close sessions on a device it is about to
/// tear down (spec §4.3.9); never used for authentication or tenant
/// isolation, which remain out of scope.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, device_name: &str, kind: SessionKind) -> SessionHandle {
        let handle = SessionHandle {
            id: SessionId::next(),
            device_name: device_name.to_string(),
            kind,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        self.inner.write().await.insert(handle.id, handle.clone());
        handle
    }

    pub async fn unregister(&self, id: SessionId) {
        self.inner.write().await.remove(&id);
    }

    /// Cancels every session attached to `device_name`, called right
    /// before a container is torn down.
    pub async fn close_device_sessions(&self, device_name: &str) {
        let sessions = self.inner.read().await;
        for handle in sessions.values() {
            if handle.device_name == device_name {
                handle.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resize_directive() {
        let got = parse_resize_directive("$$MATRISEA_RESIZE 120 40");
        assert_eq!(
            got,
            Some(ControlDirective::Resize(ResizeDirective { cols: 120, rows: 40 }))
        );
    }

    #[test]
    fn ordinary_input_is_not_a_directive() {
        assert_eq!(parse_resize_directive("ls -la\n"), None);
        assert_eq!(parse_resize_directive("stty size\r"), None);
    }

    #[test]
    fn malformed_resize_directive_is_flagged_not_forwarded() {
        assert_eq!(
            parse_resize_directive("$$MATRISEA_RESIZE abc 40"),
            Some(ControlDirective::Malformed)
        );
        assert_eq!(
            parse_resize_directive("$$MATRISEA_RESIZE 120"),
            Some(ControlDirective::Malformed)
        );
    }

    #[test]
    fn batcher_flushes_at_threshold() {
        let mut batcher = LogBatcher::new(4);
        assert_eq!(batcher.push(b"ab"), None);
        assert_eq!(batcher.push(b"cd"), Some(b"abcd".to_vec()));
        assert_eq!(batcher.flush(), None);
    }

    #[test]
    fn batcher_forced_flush_returns_partial_buffer() {
        let mut batcher = LogBatcher::new(100);
        batcher.push(b"partial");
        assert_eq!(batcher.flush(), Some(b"partial".to_vec()));
        assert_eq!(batcher.flush(), None);
    }

    #[tokio::test]
    async fn registry_closes_only_matching_device_sessions() {
        let registry = SessionRegistry::new();
        let a = registry.register("device-a", SessionKind::Terminal).await;
        let b = registry.register("device-b", SessionKind::LogTail).await;

        registry.close_device_sessions("device-a").await;

        assert!(a.cancel.is_cancelled());
        assert!(!b.cancel.is_cancelled());
    }
}
