use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Info,
    Success,
    Warn,
    Error,
}

/// User-facing message with its own expiry.
#[derive(Debug, Clone)]
pub struct Toast {
    pub text: String,
    pub kind: ToastKind,
    pub created: Instant,
    pub duration_ms: u64,
}

impl Toast {
    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) >= Duration::from_millis(self.duration_ms)
    }
}

/// Most toasts kept at once; the oldest are dropped first.
pub const MAX_TOASTS: usize = 16;

/// Warning surface shared by the widget and its host.
#[derive(Debug, Default)]
pub struct Toasts {
    items: Mutex<Vec<Toast>>,
}

impl Toasts {
    pub fn push(&self, text: impl Into<String>, kind: ToastKind) {
        let duration_ms = match kind {
            ToastKind::Error => 5000,
            ToastKind::Warn => 4000,
            _ => 3000,
        };
        let now = Instant::now();
        let toast = Toast { text: text.into(), kind, created: now, duration_ms };
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.retain(|t| !t.expired(now));
        if items.len() >= MAX_TOASTS {
            let excess = items.len() + 1 - MAX_TOASTS;
            items.drain(..excess);
        }
        items.push(toast);
    }

    /// Drop expired toasts and return the rest, oldest first.
    pub fn active(&self) -> Vec<Toast> {
        let now = Instant::now();
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.retain(|t| !t.expired(now));
        items.clone()
    }

    pub fn drain(&self) -> Vec<Toast> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
