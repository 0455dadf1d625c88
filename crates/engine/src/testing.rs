//! In-memory host and sink used by the engine's tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ghostpixel_protocol::PlacePixelRequest;

use crate::color::{Color, ColorId};
use crate::host::{EnergyState, HostAdapter, Session, TileBitmap};
use crate::submit::{PixelSink, SinkResponse};
use crate::error::SubmitError;
use crate::template::{GridCoord, TemplateSource, TileKey};

struct Tile {
    size: u32,
    rgba: Vec<u8>,
}

pub struct FakeHost {
    template: Mutex<Option<TemplateSource>>,
    colors: Mutex<Option<HashSet<ColorId>>>,
    energy: Mutex<Option<EnergyState>>,
    tiles: Mutex<HashMap<TileKey, Tile>>,
    session: Mutex<Option<Session>>,
    pub reauth_succeeds: AtomicBool,
    pub reauth_calls: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub page_visible: AtomicBool,
    /// Makes `energy()` panic, standing in for a bug inside the loop.
    pub panic_on_energy: AtomicBool,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            template: Mutex::new(None),
            colors: Mutex::new(None),
            energy: Mutex::new(None),
            tiles: Mutex::new(HashMap::new()),
            session: Mutex::new(Some(Session {
                token: "token".into(),
                user_id: "7".into(),
                subject: "subject".into(),
            })),
            reauth_succeeds: AtomicBool::new(true),
            reauth_calls: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            page_visible: AtomicBool::new(false),
            panic_on_energy: AtomicBool::new(false),
        }
    }

    /// A host with a template, its colors available, and the given energy.
    pub fn with_template(colors: &[Color], width: u32, top_left: GridCoord, energy: u32, max: u32) -> Self {
        let host = Self::new();
        let bytes: Vec<u8> = colors.iter().flat_map(|c| [c.r, c.g, c.b, c.a]).collect();
        host.set_template(TemplateSource::new(bytes, top_left, width));
        host.set_colors(colors.iter().map(Color::identity).collect());
        host.set_energy(energy, max);
        host
    }

    pub fn set_template(&self, source: TemplateSource) {
        *self.template.lock().unwrap() = Some(source);
    }

    pub fn set_colors(&self, colors: HashSet<ColorId>) {
        *self.colors.lock().unwrap() = Some(colors);
    }

    pub fn set_energy(&self, current: u32, max: u32) {
        self.set_energy_state(EnergyState {
            current,
            max,
            rate_secs: 30.0,
        });
    }

    pub fn set_energy_state(&self, energy: EnergyState) {
        *self.energy.lock().unwrap() = Some(energy);
    }

    pub fn spend_energy(&self, n: u32) {
        if let Some(e) = self.energy.lock().unwrap().as_mut() {
            e.current = e.current.saturating_sub(n);
        }
    }

    pub fn fill_tile(&self, key: TileKey, size: u32, color: Color) {
        let rgba = std::iter::repeat([color.r, color.g, color.b, color.a])
            .take((size * size) as usize)
            .flatten()
            .collect();
        self.tiles.lock().unwrap().insert(key, Tile { size, rgba });
    }

    pub fn paint(&self, key: TileKey, x: usize, y: usize, color: Color) {
        let mut tiles = self.tiles.lock().unwrap();
        let tile = tiles.get_mut(&key).expect("tile loaded");
        let i = (y * tile.size as usize + x) * 4;
        tile.rgba[i..i + 4].copy_from_slice(&[color.r, color.g, color.b, color.a]);
    }

    pub fn paint_grid(&self, c: GridCoord, color: Color) {
        let key = TileKey::containing(c);
        let (x, y) = key.local_offset(c).expect("inside its own tile");
        self.paint(key, x, y, color);
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().unwrap().as_ref().is_some_and(Session::is_valid)
    }
}

impl HostAdapter for FakeHost {
    fn template_source(&self) -> Option<TemplateSource> {
        self.template.lock().unwrap().clone()
    }

    fn available_colors(&self) -> Option<HashSet<ColorId>> {
        self.colors.lock().unwrap().clone()
    }

    fn energy(&self) -> Option<EnergyState> {
        if self.panic_on_energy.load(Ordering::SeqCst) {
            panic!("energy source exploded");
        }
        *self.energy.lock().unwrap()
    }

    fn tile_bitmap(&self, key: &TileKey) -> Option<TileBitmap> {
        self.tiles.lock().unwrap().get(key).map(|t| TileBitmap {
            width: t.size,
            height: t.size,
            rgba: t.rgba.clone().into(),
        })
    }

    fn session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    fn clear_session(&self) {
        *self.session.lock().unwrap() = None;
    }

    fn mark_page_visible(&self) {
        self.page_visible.store(true, Ordering::SeqCst);
    }

    async fn reauthenticate(&self) -> bool {
        self.reauth_calls.fetch_add(1, Ordering::SeqCst);
        self.reauth_succeeds.load(Ordering::SeqCst)
    }

    async fn refresh_canvas(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records requests and answers with scripted statuses (200 once the script runs out).
/// When linked to a host, successful writes are painted and their energy spent.
pub struct FakeSink {
    host: Option<Arc<FakeHost>>,
    script: Mutex<VecDeque<u16>>,
    repeat: Option<u16>,
    delay: Option<Duration>,
    pub requests: Mutex<Vec<PlacePixelRequest>>,
}

impl FakeSink {
    pub fn ok() -> Self {
        Self {
            host: None,
            script: Mutex::new(VecDeque::new()),
            repeat: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn painting(host: Arc<FakeHost>) -> Self {
        Self {
            host: Some(host),
            ..Self::ok()
        }
    }

    pub fn always(status: u16) -> Self {
        Self {
            repeat: Some(status),
            ..Self::ok()
        }
    }

    pub fn scripted(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            script: Mutex::new(statuses.into_iter().collect()),
            ..Self::ok()
        }
    }

    /// Answers each request only after `delay` has passed.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn sent(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.requests.lock().unwrap().iter().map(|r| r.pixels.len()).collect()
    }
}

impl PixelSink for FakeSink {
    async fn send(&self, request: &PlacePixelRequest) -> Result<SinkResponse, SubmitError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let status = self
            .repeat
            .or_else(|| self.script.lock().unwrap().pop_front())
            .unwrap_or(200);
        if status == 200 {
            if let Some(host) = &self.host {
                for p in &request.pixels {
                    let color = if p.color < 0 {
                        Color::rgba(0, 0, 0, 0)
                    } else {
                        Color::rgb((p.color >> 16) as u8, (p.color >> 8) as u8, p.color as u8)
                    };
                    host.paint_grid(GridCoord::new(p.grid_x, p.grid_y), color);
                }
                host.spend_energy(request.pixels.len() as u32);
            }
        }
        Ok(SinkResponse {
            status,
            body: String::new(),
        })
    }
}
