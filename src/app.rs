// Component wiring shared by the binary and any embedding web layer

use crate::auth::claims_source::ClaimsSource;
use crate::auth::login::LoginFlow;
use crate::auth::reconciler::IdentityReconciler;
use crate::config::Config;
use crate::core::errors::ReconcileError;
use crate::infra::oidc::OidcClaimsSource;
use crate::infra::postgres::{self, DbOrderStore, DbUserStore};
use crate::infra::redis_notifications::RedisNotificationSource;
use crate::state::expiry::ExpiryReconciler;
use crate::state::listener::spawn_expiry_tasks;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fully wired reconcilers
pub struct App {
    pub login: Arc<LoginFlow>,
    pub oidc: Arc<OidcClaimsSource>,
    pub expiry: Arc<ExpiryReconciler>,
    pub notifications: Arc<RedisNotificationSource>,
    sweep_interval: Duration,
}

impl App {
    pub async fn build(config: &Config) -> Result<Self, ReconcileError> {
        let db_pool = postgres::connect(&config.database_url, config.db_max_connections).await?;

        let users = Arc::new(DbUserStore::new(db_pool.clone(), config.initial_credit));
        let orders = Arc::new(DbOrderStore::new(db_pool));

        let oidc = Arc::new(OidcClaimsSource::discover(&config.oidc_settings()).await?);
        if !oidc.has_verifier() {
            info!("ID token verification disabled, logins use the user endpoint");
        }

        let identity = Arc::new(IdentityReconciler::new(users.clone(), users));
        let source: Arc<dyn ClaimsSource> = oidc.clone();
        let login = Arc::new(LoginFlow::new(source, identity));

        let notifications = Arc::new(
            RedisNotificationSource::new(&config.redis_url, config.redis_connection_timeout()).await?,
        );
        if let Err(e) = notifications.enable_keyspace_notifications().await {
            warn!(
                error = %e,
                "Could not enable keyspace notifications; run `CONFIG SET notify-keyspace-events Ex` on the server, relying on the sweep until then"
            );
        }

        Ok(Self {
            login,
            oidc,
            expiry: Arc::new(ExpiryReconciler::new(orders)),
            notifications,
            sweep_interval: config.sweep_interval(),
        })
    }

    /// Spawn the expiry sweeper and listener. Both stop when `cancel` fires.
    pub fn start_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let channel = self.notifications.channel();
        info!(channel = %channel, interval_secs = self.sweep_interval.as_secs(), "Starting expiry reconciliation");
        spawn_expiry_tasks(
            self.expiry.clone(),
            self.notifications.clone(),
            channel,
            self.sweep_interval,
            cancel,
        )
    }
}
