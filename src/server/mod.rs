//! Web服务器模块

pub mod handlers;
pub mod state;

pub use handlers::build_router;
pub use state::AppState;
