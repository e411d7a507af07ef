//! # rapport-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RapportSettings::default()`]
//! 2. **User file**: `~/.rapport/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `RAPPORT_*` overrides (highest priority)
//!
//! The provider API key is only ever taken from `RAPPORT_API_KEY` or
//! `OPENAI_API_KEY`.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
