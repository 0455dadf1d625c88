//! Reconciliation core: turns a template image into placements on a shared canvas.
//!
//! The host (a browser page, a bridge, a test fake) supplies the template,
//! palette, energy, tiles and session through [`HostAdapter`]; placements go out
//! through a [`PixelSink`]. [`Controller`] owns the loop.

pub mod color;
pub mod control;
pub mod diff;
pub mod error;
pub mod events;
pub mod governor;
pub mod host;
pub mod policy;
pub mod sampler;
pub mod submit;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

pub use color::{Color, ColorId, FREE_COLORS};
pub use control::Controller;
pub use diff::{compute_diff, Diff};
pub use error::{ColorError, ReconcileError, SubmitError, TemplateError};
pub use events::Emitter;
pub use governor::{Decision, Governor, GovernorTuning, RunOutcome, RunSummary};
pub use host::{EnergyState, HostAdapter, Session, TileBitmap};
pub use policy::SharedPolicy;
pub use submit::{HttpSink, PixelSink, SinkResponse, SubmitOutcome, DEFAULT_ENDPOINT};
pub use template::{load_template, FilterPolicy, GridCoord, Template, TemplateSource, TileKey, TILE_SIZE};
