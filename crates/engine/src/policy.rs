use std::collections::HashSet;
use std::sync::RwLock;

use ghostpixel_protocol::{ConfigPatch, Mode, ReconcileConfig};

use crate::color::{parse_color_ids, ColorId};
use crate::error::ColorError;
use crate::template::FilterPolicy;

/// A consistent copy of the policy taken at the top of a loop iteration.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub mode: Mode,
    pub energy_threshold: Option<u32>,
    pub filter: FilterPolicy,
    /// Bumped whenever the template must be rebuilt.
    pub generation: u64,
}

struct Inner {
    config: ReconcileConfig,
    ignored: HashSet<ColorId>,
    generation: u64,
}

/// Policy shared between the control surface and the running loop.
pub struct SharedPolicy {
    inner: RwLock<Inner>,
}

impl SharedPolicy {
    pub fn new(config: ReconcileConfig) -> Result<Self, ColorError> {
        let ignored = parse_color_ids(&config.ignored_colors)?;
        Ok(Self {
            inner: RwLock::new(Inner {
                config,
                ignored,
                generation: 0,
            }),
        })
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        let g = self.inner.read().unwrap_or_else(|e| e.into_inner());
        PolicySnapshot {
            mode: g.config.mode,
            energy_threshold: g.config.energy_threshold,
            filter: FilterPolicy {
                include_transparent: g.config.include_transparent,
                include_free_colors: g.config.include_free_colors,
                ignored: g.ignored.clone(),
            },
            generation: g.generation,
        }
    }

    pub fn config(&self) -> ReconcileConfig {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .config
            .clone()
    }

    /// Applies a patch; a filter change forces a template rebuild.
    pub fn update(&self, patch: &ConfigPatch) -> ReconcileConfig {
        let mut g = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if patch.apply(&mut g.config) {
            g.generation += 1;
        }
        g.config.clone()
    }

    /// Replaces the ignored colors wholesale. Invalid input leaves the policy untouched.
    pub fn set_ignored_colors<I, S>(&self, colors: I) -> Result<HashSet<ColorId>, ColorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let colors: Vec<String> = colors
            .into_iter()
            .map(|c| c.as_ref().trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let ids = parse_color_ids(&colors)?;
        let mut g = self.inner.write().unwrap_or_else(|e| e.into_inner());
        g.config.ignored_colors = colors;
        g.ignored = ids.clone();
        g.generation += 1;
        Ok(ids)
    }

    pub fn invalidate(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).generation += 1;
    }
}
