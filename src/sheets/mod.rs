//! Spreadsheet destination: auth, REST client, and the projection engine.

pub mod auth;
pub mod client;
pub mod projector;

pub use auth::TokenProvider;
pub use client::SheetsClient;
pub use projector::{Layout, Projector, UpsertReport, WorksheetHandle};
