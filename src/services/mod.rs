pub mod auth;
pub mod catalog;
pub mod hls;
pub mod preheat;
pub mod room_cache;
pub mod room_hub;
pub mod room_manager;
pub mod room_store;
pub mod storage;
pub mod stream_processor;
pub mod transcode;

pub use auth::AuthService;
pub use catalog::CatalogClient;
pub use hls::ProgressiveHlsManager;
pub use preheat::PreheatService;
pub use room_cache::RoomCache;
pub use room_hub::RoomHub;
pub use room_manager::RoomManager;
pub use room_store::RoomStore;
pub use stream_processor::StreamProcessor;
