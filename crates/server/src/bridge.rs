//! Host state pushed over HTTP by the page that owns the canvas.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use ghostpixel_engine::color::ColorId;
use ghostpixel_engine::{EnergyState, HostAdapter, Session, TemplateSource, TileBitmap, TileKey};
use ghostpixel_protocol::PendingRequests;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Default)]
struct BridgeState {
    template: Option<TemplateSource>,
    colors: Option<HashSet<ColorId>>,
    energy: Option<EnergyState>,
    tiles: HashMap<TileKey, TileBitmap>,
    session: Option<Session>,
    relog_requested: bool,
    sync_requested: bool,
    page_visible: bool,
}

pub struct BridgeHost {
    state: RwLock<BridgeState>,
    session_posted: Notify,
    relog_timeout: Duration,
}

impl BridgeHost {
    pub fn new(relog_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(BridgeState::default()),
            session_posted: Notify::new(),
            relog_timeout,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BridgeState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BridgeState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_template(&self, source: TemplateSource) {
        info!(
            width = source.width,
            x = source.top_left.x,
            y = source.top_left.y,
            "template received"
        );
        self.write().template = Some(source);
    }

    pub fn put_tile(&self, key: TileKey, bitmap: TileBitmap) {
        debug!(tile = %key, "tile received");
        self.write().tiles.insert(key, bitmap);
    }

    pub fn set_colors(&self, colors: HashSet<ColorId>) {
        debug!(count = colors.len(), "color catalog received");
        self.write().colors = Some(colors);
    }

    pub fn set_energy(&self, energy: EnergyState) {
        self.write().energy = Some(energy);
    }

    /// Stores fresh credentials and wakes a pending re-login.
    pub fn set_session(&self, session: Session) {
        {
            let mut s = self.write();
            s.session = Some(session);
            s.relog_requested = false;
        }
        self.session_posted.notify_waiters();
    }

    /// Hands the page its outstanding requests. One-shot requests are cleared.
    pub fn take_pending(&self) -> PendingRequests {
        let mut s = self.write();
        let pending = PendingRequests {
            relog: s.relog_requested,
            sync: s.sync_requested,
            page_visible: s.page_visible,
        };
        s.sync_requested = false;
        pending
    }
}

impl HostAdapter for BridgeHost {
    fn template_source(&self) -> Option<TemplateSource> {
        self.read().template.clone()
    }

    fn available_colors(&self) -> Option<HashSet<ColorId>> {
        self.read().colors.clone()
    }

    fn energy(&self) -> Option<EnergyState> {
        self.read().energy
    }

    fn tile_bitmap(&self, key: &TileKey) -> Option<TileBitmap> {
        self.read().tiles.get(key).cloned()
    }

    fn session(&self) -> Option<Session> {
        self.read().session.clone()
    }

    fn clear_session(&self) {
        self.write().session = None;
    }

    fn mark_page_visible(&self) {
        self.write().page_visible = true;
    }

    async fn reauthenticate(&self) -> bool {
        let posted = self.session_posted.notified();
        tokio::pin!(posted);
        posted.as_mut().enable();
        {
            let mut s = self.write();
            if let Some(session) = s.session.as_mut() {
                session.token.clear();
            }
            s.relog_requested = true;
        }
        info!("waiting for the page to log in again");

        if tokio::time::timeout(self.relog_timeout, posted).await.is_err() {
            self.write().relog_requested = false;
            return false;
        }
        self.read().session.as_ref().is_some_and(Session::is_valid)
    }

    async fn refresh_canvas(&self) {
        self.write().sync_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn session(token: &str) -> Session {
        Session {
            token: token.into(),
            user_id: "1".into(),
            subject: "s".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn relog_waits_for_a_new_session() {
        let host = Arc::new(BridgeHost::new(Duration::from_secs(30)));
        host.set_session(session("old"));

        let waiter = {
            let host = host.clone();
            tokio::spawn(async move { host.reauthenticate().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(host.take_pending().relog);
        assert!(!host.session().unwrap().is_valid());

        host.set_session(session("new"));
        assert!(waiter.await.unwrap());
        assert!(!host.take_pending().relog);
        assert_eq!(host.session().unwrap().token, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn relog_gives_up_after_timeout() {
        let host = BridgeHost::new(Duration::from_secs(30));
        host.set_session(session("old"));
        assert!(!host.reauthenticate().await);
        assert!(!host.take_pending().relog);
    }

    #[tokio::test]
    async fn sync_requests_are_one_shot() {
        let host = BridgeHost::new(Duration::from_secs(1));
        host.refresh_canvas().await;
        host.mark_page_visible();
        assert_eq!(
            host.take_pending(),
            PendingRequests {
                relog: false,
                sync: true,
                page_visible: true
            }
        );
        assert!(!host.take_pending().sync);
        assert!(host.take_pending().page_visible);
    }
}
