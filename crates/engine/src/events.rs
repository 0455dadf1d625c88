use std::sync::{Arc, Mutex};

use ghostpixel_protocol::{ReconcileEvent, StatusReport};
use tokio::sync::broadcast;

/// One-way channel from the loop to whoever is listening, plus the latest status.
#[derive(Clone)]
pub struct Emitter {
    tx: broadcast::Sender<ReconcileEvent>,
    status: Arc<Mutex<StatusReport>>,
}

impl Emitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            status: Arc::new(Mutex::new(StatusReport::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ReconcileEvent) {
        self.update_status(|s| match &event {
            ReconcileEvent::Started { mode } => {
                s.mode = *mode;
                s.last_error = None;
            }
            ReconcileEvent::Progress(p) => s.progress = Some(*p),
            ReconcileEvent::Failed { message } => s.last_error = Some(message.clone()),
            _ => {}
        });
        // No listeners is fine.
        let _ = self.tx.send(event);
    }

    pub fn update_status(&self, f: impl FnOnce(&mut StatusReport)) {
        let mut s = self.status.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut s);
    }

    pub fn status(&self) -> StatusReport {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
