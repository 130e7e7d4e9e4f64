mod cache;
mod selection;
mod server;

pub use cache::ModelCacheEntry;
pub use selection::select_clients;
pub use server::{Server, SharedClient};
