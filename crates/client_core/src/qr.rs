use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Collaborator that makes a login handshake token visible to the human
/// operator. Rendering is outside the core; the default implementation just
/// logs the public QR URL for the token.
#[async_trait]
pub trait QrPresenter: Send + Sync {
    async fn present_challenge(&self, uuid: &str) -> Result<()>;

    /// Called once the confirmation poll concludes, successfully or not, so
    /// any presentation resource can be released.
    async fn challenge_resolved(&self, error: Option<String>);
}

pub struct LogQrPresenter {
    login_host: String,
}

impl LogQrPresenter {
    pub fn new(login_host: impl Into<String>) -> Self {
        Self {
            login_host: login_host.into(),
        }
    }
}

#[async_trait]
impl QrPresenter for LogQrPresenter {
    async fn present_challenge(&self, uuid: &str) -> Result<()> {
        info!(
            url = format!("{}/qrcode/{uuid}", self.login_host),
            "scan the QR code with the mobile application to log in"
        );
        Ok(())
    }

    async fn challenge_resolved(&self, error: Option<String>) {
        match error {
            None => info!("login challenge confirmed"),
            Some(message) => warn!(%message, "login challenge failed"),
        }
    }
}
