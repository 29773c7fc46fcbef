// Status API client and polling state
pub mod api;
pub mod poller;

pub use api::StatusClient;
pub use poller::{display_order, render_line, watch, ClientState};
