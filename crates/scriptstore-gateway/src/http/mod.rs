pub mod error;
pub mod health;
pub mod scripts;
pub mod webhooks;
