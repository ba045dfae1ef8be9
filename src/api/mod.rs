pub mod middleware;
pub mod rooms;
pub mod streams;
pub mod ws;

pub use rooms::{room_routes, AppState};
pub use streams::stream_routes;
pub use ws::ws_routes;
