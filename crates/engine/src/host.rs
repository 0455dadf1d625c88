//! The seam between the reconciliation core and the page that owns the canvas.
//!
//! Everything the core needs from its surroundings goes through [`HostAdapter`].
//! Accessors return `None` when the host has not produced the value yet; the core
//! never guesses.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use crate::color::ColorId;
use crate::template::{TemplateSource, TileKey};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyState {
    pub current: u32,
    pub max: u32,
    /// Seconds to regenerate one point.
    pub rate_secs: f64,
}

impl EnergyState {
    pub const EMPTY: EnergyState = EnergyState {
        current: 0,
        max: 0,
        rate_secs: 0.0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub subject: String,
}

impl Session {
    pub fn is_valid(&self) -> bool {
        !self.token.is_empty()
    }
}

/// A tile bitmap as handed over by the host: RGBA rows of `width` pixels.
#[derive(Debug, Clone)]
pub struct TileBitmap {
    pub width: u32,
    pub height: u32,
    pub rgba: Arc<[u8]>,
}

pub trait HostAdapter: Send + Sync + 'static {
    fn template_source(&self) -> Option<TemplateSource>;

    /// Colors the account may currently place.
    fn available_colors(&self) -> Option<HashSet<ColorId>>;

    fn energy(&self) -> Option<EnergyState>;

    fn tile_bitmap(&self, key: &TileKey) -> Option<TileBitmap>;

    /// Current credentials; `None` or an empty token means logged out.
    fn session(&self) -> Option<Session>;

    fn clear_session(&self);

    /// Keeps the host streaming canvas updates while the agent runs.
    fn mark_page_visible(&self);

    /// Runs the host's login flow; resolves to whether a valid session exists afterwards.
    fn reauthenticate(&self) -> impl Future<Output = bool> + Send;

    /// Asks the host to pull fresh tile data from the server.
    fn refresh_canvas(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
