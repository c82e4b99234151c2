pub mod auth_handler;
pub mod get_handler;
pub mod delete_handler;
pub mod upload_handler;

pub use auth_handler::*;
pub use get_handler::*;
pub use delete_handler::*;
pub use upload_handler::*;