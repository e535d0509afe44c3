use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use shared::{
    domain::{Contact, ContactKind, Gender},
    protocol::{ApiCall, SendMsgResponse},
};
use storage::{FileSessionStore, SessionStore};
use tokio::sync::RwLock;
use tracing::warn;
use url::Url;

pub mod cache;
pub mod config;
pub mod events;
mod login;
pub mod qr;
pub mod session;
mod sync;
pub mod transport;

pub use cache::ContactCache;
pub use config::{load_config, BotConfig};
pub use events::{Event, EventBus, EventPayload, MessageEvent, SHUTDOWN_PATH};
pub use login::LoginError;
pub use qr::{LogQrPresenter, QrPresenter};
pub use session::SessionState;

use transport::Transport;

/// The bot: login state machine, contact mirror and event bus behind one
/// embedder-facing surface. Collaborators (session store, QR presenter) are
/// injected so the whole machine runs against fakes in tests.
pub struct Bot {
    pub(crate) config: BotConfig,
    pub(crate) transport: RwLock<Transport>,
    pub(crate) session: SessionState,
    pub(crate) cache: ContactCache,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) presenter: Arc<dyn QrPresenter>,
    pub(crate) bus: EventBus,
    pub(crate) logged_in: AtomicBool,
}

impl Bot {
    pub fn new(config: BotConfig) -> Result<Arc<Self>> {
        let store = Arc::new(FileSessionStore::new(&config.storage_root));
        let presenter = Arc::new(LogQrPresenter::new(config.login_host.clone()));
        Self::with_dependencies(config, store, presenter)
    }

    pub fn with_dependencies(
        config: BotConfig,
        store: Arc<dyn SessionStore>,
        presenter: Arc<dyn QrPresenter>,
    ) -> Result<Arc<Self>> {
        let transport = Transport::new(&config.user_agent)?;
        Ok(Arc::new(Self {
            config,
            transport: RwLock::new(transport),
            session: SessionState::new(),
            cache: ContactCache::new(),
            store,
            presenter,
            bus: EventBus::new(),
            logged_in: AtomicBool::new(false),
        }))
    }

    /// Register a handler for a path prefix; the longest registered prefix
    /// of an incoming event's path wins.
    pub fn handle<F, Fut>(&self, path: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.bus.handle(path, handler);
    }

    /// Observer invoked with every event after dispatch, matched or not.
    pub fn hook<F>(&self, hook: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.hook(hook);
    }

    pub fn reset_handlers(&self) {
        self.bus.reset_handlers();
    }

    pub fn add_timer(&self, period: Duration) {
        self.bus.add_timer(period);
    }

    pub fn add_timing(&self, spec: &str) -> Result<()> {
        self.bus.add_timing(spec)
    }

    /// Spawn the supervised login loop and block on the event bus until
    /// `stop()` is called.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tokio::spawn(Arc::clone(self).supervise_login());
        self.bus.run().await
    }

    pub fn stop(&self) {
        self.bus.stop();
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// The logged-in user's own contact record, once initialized.
    pub async fn myself(&self) -> Option<Contact> {
        self.session.myself().await
    }

    pub fn contact_by_user_name(&self, user_name: &str) -> Option<Contact> {
        self.cache.lookup(user_name)
    }

    /// Exact-nickname search; `None` filters match anything.
    pub fn search_contacts(
        &self,
        nick_name: &str,
        city: Option<&str>,
        gender: Option<Gender>,
        kind: Option<ContactKind>,
    ) -> Option<Vec<Contact>> {
        self.cache.search(nick_name, city, gender, kind)
    }

    pub fn all_contacts(&self) -> Vec<Contact> {
        self.cache.all()
    }

    pub fn members_of_group(&self, group_user_name: &str) -> Option<Vec<Contact>> {
        self.cache.members_of(group_user_name)
    }

    /// Re-fetch one group's roster and fold it into the cache.
    pub async fn force_update_group(&self, group_user_name: &str) -> Result<()> {
        self.refresh_group(group_user_name).await
    }

    /// Send a plain text message. Returns the server-assigned message id.
    pub async fn send_text(&self, to: &str, content: &str) -> Result<String> {
        if !self.is_logged_in() {
            return Err(anyhow!("not logged in"));
        }
        let data = self.session.snapshot().await;
        let myself = data
            .myself
            .as_ref()
            .ok_or_else(|| anyhow!("own identity not initialized"))?;

        let local_id = Utc::now().timestamp_micros().to_string();
        let url = format!(
            "{}/webwxsendmsg?lang=zh_CN&pass_ticket={}",
            data.base_url, data.base_request.pass_ticket,
        );
        let body = serde_json::json!({
            "BaseRequest": data.base_request,
            "Msg": {
                "Type": 1,
                "Content": content,
                "FromUserName": myself.user_name,
                "ToUserName": to,
                "LocalID": local_id,
                "ClientMsgId": local_id,
            },
            "Scene": 0,
        });
        let response: SendMsgResponse = self.execute_api(&url, Some(body)).await?;
        Ok(response.msg_id)
    }

    /// Fetch a contact's avatar bytes from the session host.
    pub async fn fetch_avatar(&self, contact: &Contact) -> Result<Vec<u8>> {
        if contact.avatar_url.is_empty() {
            return Err(anyhow!("contact {} has no avatar", contact.user_name));
        }
        let full_url = if contact.avatar_url.starts_with("http") {
            contact.avatar_url.clone()
        } else {
            let base = Url::parse(&self.session.base_url().await)
                .context("no usable base url for avatar fetch")?;
            let host = base
                .host_str()
                .ok_or_else(|| anyhow!("base url has no host"))?;
            format!("{}://{host}{}", base.scheme(), contact.avatar_url)
        };
        let transport = self.transport.read().await;
        transport.get_bytes(&full_url).await
    }

    /// Execute one authenticated call and apply the response post-processing
    /// step: pick up a rotated security key and refresh the persisted
    /// session.
    pub(crate) async fn execute_api<T>(&self, url: &str, body: Option<serde_json::Value>) -> Result<T>
    where
        T: DeserializeOwned + ApiCall,
    {
        let response: T = {
            let transport = self.transport.read().await;
            transport.execute(url, body).await?
        };
        if let Some(skey) = response.rotated_skey() {
            self.session.rotate_skey(skey).await;
        }
        self.persist_session().await;
        Ok(response)
    }

    /// Persistence failures never fail the call that triggered them; a
    /// restart just falls back to the QR handshake.
    pub(crate) async fn persist_session(&self) {
        let base_url = self.session.base_url().await;
        if base_url.is_empty() {
            return;
        }
        let cookies = {
            let transport = self.transport.read().await;
            transport.snapshot_cookies(&base_url)
        };
        let persisted = self.session.to_persisted(cookies).await;
        if let Err(err) = self.store.save(&persisted).await {
            warn!(error = %err, "failed to persist session");
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
