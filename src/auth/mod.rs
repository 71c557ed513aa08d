// Identity side: claims resolution and user reconciliation

pub mod claims_source;
pub mod login;
pub mod reconciler;
pub mod user_store;
