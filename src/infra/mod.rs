pub mod oidc;
pub mod postgres;
pub mod redis_notifications;
