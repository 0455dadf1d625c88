use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Converge once, then stop.
    Build,
    /// Keep polling and repair drift forever.
    Maintain,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Build
    }
}

/// One pixel write as the placement endpoint expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PixelWrite {
    pub grid_x: i64,
    pub grid_y: i64,
    /// Packed `(r<<16)|(g<<8)|b`, or `-1` for fully transparent.
    pub color: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlacePixelRequest {
    pub token: String,
    pub subject: String,
    pub user_id: String,
    pub pixels: Vec<PixelWrite>,
}

impl PlacePixelRequest {
    /// Builds a request, stamping every pixel with the sender's user id.
    pub fn new(
        token: impl Into<String>,
        subject: impl Into<String>,
        user_id: impl Into<String>,
        pixels: impl IntoIterator<Item = PixelWrite>,
    ) -> Self {
        let user_id = user_id.into();
        let pixels = pixels
            .into_iter()
            .map(|p| PixelWrite {
                user_id: Some(user_id.clone()),
                ..p
            })
            .collect();
        Self {
            token: token.into(),
            subject: subject.into(),
            user_id,
            pixels,
        }
    }
}

/// User-facing reconciliation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub include_transparent: bool,
    #[serde(default = "default_true")]
    pub include_free_colors: bool,
    #[serde(default)]
    pub mode: Mode,
    /// Energy to accumulate before a build-mode batch. `None` waits for a full bar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_threshold: Option<u32>,
    #[serde(default)]
    pub ignored_colors: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            include_transparent: false,
            include_free_colors: true,
            mode: Mode::Build,
            energy_threshold: None,
            ignored_colors: Vec::new(),
        }
    }
}

/// Partial update of [`ReconcileConfig`]; absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_transparent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_free_colors: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    /// `Some(None)` clears the threshold back to "full bar".
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub energy_threshold: Option<Option<u32>>,
}

impl ConfigPatch {
    /// Applies the patch and reports whether the template filter changed.
    pub fn apply(&self, config: &mut ReconcileConfig) -> bool {
        let mut filter_changed = false;
        if let Some(v) = self.include_transparent {
            filter_changed |= config.include_transparent != v;
            config.include_transparent = v;
        }
        if let Some(v) = self.include_free_colors {
            filter_changed |= config.include_free_colors != v;
            config.include_free_colors = v;
        }
        if let Some(v) = self.mode {
            config.mode = v;
        }
        if let Some(v) = self.energy_threshold {
            config.energy_threshold = v;
        }
        filter_changed
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Option<u32>>, s: S) -> Result<S::Ok, S::Error> {
        (*v).flatten().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Option<u32>>, D::Error> {
        Ok(Some(Option::<u32>::deserialize(d)?))
    }
}

/// Ignored colors may arrive as a list or as one separator-joined string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColorList {
    List(Vec<String>),
    Joined(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoreColorsInput {
    pub colors: ColorList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub remaining: usize,
    pub eta_secs: f64,
}

/// Events the reconciliation loop emits toward its UI collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReconcileEvent {
    Started {
        mode: Mode,
    },
    NotReady {
        reason: String,
    },
    Progress(Progress),
    BatchPlaced {
        count: usize,
        remaining: usize,
    },
    BatchFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        message: String,
    },
    Completed {
        placed: usize,
    },
    Stopped {
        placed: usize,
    },
    Failed {
        message: String,
    },
}

impl ReconcileEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Stopped { .. } | Self::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    pub placed: usize,
    pub fixes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnergyInput {
    pub current: u32,
    pub max: u32,
    pub rate_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInput {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorsInput {
    pub colors: Vec<String>,
}

/// What the agent currently wants the page bridge to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequests {
    pub relog: bool,
    pub sync: bool,
    pub page_visible: bool,
}

pub mod routes {
    pub const HEALTH: &str = "/health";
    pub const BOT_START: &str = "/api/bot/start";
    pub const BOT_STOP: &str = "/api/bot/stop";
    pub const BOT_RELOAD: &str = "/api/bot/reload";
    pub const BOT_IGNORED_COLORS: &str = "/api/bot/ignored-colors";
    pub const BOT_CONFIG: &str = "/api/bot/config";
    pub const BOT_STATUS: &str = "/api/bot/status";
    pub const HOST_TEMPLATE: &str = "/api/host/template";
    pub const HOST_TILE: &str = "/api/host/tiles/{x}/{y}";
    pub const HOST_COLORS: &str = "/api/host/colors";
    pub const HOST_ENERGY: &str = "/api/host/energy";
    pub const HOST_SESSION: &str = "/api/host/session";
    pub const HOST_PENDING: &str = "/api/host/pending";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_request_uses_site_field_names() {
        let req = PlacePixelRequest::new(
            "tok",
            "sub",
            "42",
            [PixelWrite {
                grid_x: 3,
                grid_y: -7,
                color: 0xff0000,
                user_id: None,
            }],
        );
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "Token": "tok",
                "Subject": "sub",
                "UserId": "42",
                "Pixels": [{ "GridX": 3, "GridY": -7, "Color": 16711680, "UserId": "42" }],
            })
        );
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let c: ReconcileConfig = serde_json::from_str(r#"{"mode":"maintain"}"#).unwrap();
        assert_eq!(c.mode, Mode::Maintain);
        assert!(c.include_free_colors);
        assert!(!c.include_transparent);
        assert_eq!(c.energy_threshold, None);
    }

    #[test]
    fn patch_distinguishes_cleared_threshold_from_absent() {
        let mut c = ReconcileConfig {
            energy_threshold: Some(10),
            ..Default::default()
        };
        let keep: ConfigPatch = serde_json::from_str(r#"{"mode":"maintain"}"#).unwrap();
        assert!(!keep.apply(&mut c));
        assert_eq!(c.energy_threshold, Some(10));

        let clear: ConfigPatch = serde_json::from_str(r#"{"energy_threshold":null}"#).unwrap();
        clear.apply(&mut c);
        assert_eq!(c.energy_threshold, None);
    }

    #[test]
    fn patch_reports_filter_changes() {
        let mut c = ReconcileConfig::default();
        let p = ConfigPatch {
            include_transparent: Some(true),
            ..Default::default()
        };
        assert!(p.apply(&mut c));
        assert!(!p.apply(&mut c));
    }

    #[test]
    fn color_list_accepts_both_shapes() {
        let a: IgnoreColorsInput = serde_json::from_str(r##"{"colors":["#fff","000"]}"##).unwrap();
        assert!(matches!(a.colors, ColorList::List(ref v) if v.len() == 2));
        let b: IgnoreColorsInput = serde_json::from_str(r##"{"colors":"#fff;#000","separator":";"}"##).unwrap();
        assert!(matches!(b.colors, ColorList::Joined(_)));
    }

    #[test]
    fn events_are_tagged() {
        let v = serde_json::to_value(ReconcileEvent::Completed { placed: 3 }).unwrap();
        assert_eq!(v["event"], "completed");
        assert!(ReconcileEvent::Stopped { placed: 0 }.is_terminal());
        assert!(!ReconcileEvent::Started { mode: Mode::Build }.is_terminal());
    }
}
