//! Client for the artifact service: parallel block uploads and the two
//! supported login flows, with tokens persisted in the user settings file.

pub mod auth;
pub mod store;
pub mod upload;

pub use auth::{DeviceCodeFlow, PublicKeyFlow};
pub use store::{OAuthTokens, PubkeyCache, SettingsStore};
pub use upload::{plan_blocks, Block, BlockTransport, Uploader};
