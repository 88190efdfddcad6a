//! Dark-mode provider injected at construction instead of looked up from
//! an ambient application element.

use tokio::sync::watch;

#[derive(Debug)]
pub struct DarkModeSource {
    tx: watch::Sender<bool>,
}

impl DarkModeSource {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, dark: bool) {
        self.tx.send_replace(dark);
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for DarkModeSource {
    fn default() -> Self {
        Self::new(false)
    }
}
