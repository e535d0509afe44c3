use shared::{
    domain::Contact,
    protocol::{BaseRequest, SyncCursor},
};
use storage::{PersistedSession, StoredCookie};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Mutable state of one authenticated session. Injected into every
/// component that needs it; written by the login flow and the post-response
/// credential rotation, read (as a consistent snapshot) by every outbound
/// call.
pub struct SessionState {
    inner: RwLock<SessionData>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionData {
    pub base_request: BaseRequest,
    pub base_url: String,
    pub myself: Option<Contact>,
    pub sync_cursor: SyncCursor,
    /// Supervised-login retry counter. Monotonic: it is never reset on a
    /// successful login, matching the indefinitely-retrying bot design.
    pub retry_times: u64,
}

impl SessionState {
    pub fn new() -> Self {
        let mut data = SessionData::default();
        data.base_request.device_id = random_device_id();
        Self {
            inner: RwLock::new(data),
        }
    }

    pub async fn snapshot(&self) -> SessionData {
        self.inner.read().await.clone()
    }

    pub async fn base_request(&self) -> BaseRequest {
        self.inner.read().await.base_request.clone()
    }

    pub async fn base_url(&self) -> String {
        self.inner.read().await.base_url.clone()
    }

    pub async fn my_user_name(&self) -> Option<String> {
        self.inner
            .read()
            .await
            .myself
            .as_ref()
            .map(|c| c.user_name.clone())
    }

    pub async fn myself(&self) -> Option<Contact> {
        self.inner.read().await.myself.clone()
    }

    /// Query-string fragment carrying the rotating credentials, e.g.
    /// `pass_ticket=..&skey=..`.
    pub async fn credential_query(&self) -> String {
        let data = self.inner.read().await;
        format!(
            "pass_ticket={}&skey={}",
            data.base_request.pass_ticket, data.base_request.skey
        )
    }

    pub async fn apply_credentials(
        &self,
        sid: String,
        skey: String,
        uin: i64,
        pass_ticket: String,
        base_url: String,
    ) {
        let mut data = self.inner.write().await;
        data.base_request.sid = sid;
        data.base_request.skey = skey;
        data.base_request.uin = uin;
        data.base_request.pass_ticket = pass_ticket;
        data.base_url = base_url;
    }

    /// The service rotates the security key server-side; every successful
    /// authenticated response that carries one refreshes it here.
    pub async fn rotate_skey(&self, skey: &str) {
        let mut data = self.inner.write().await;
        data.base_request.skey = skey.to_string();
    }

    pub async fn set_myself(&self, myself: Contact) {
        self.inner.write().await.myself = Some(myself);
    }

    pub async fn sync_cursor(&self) -> SyncCursor {
        self.inner.read().await.sync_cursor.clone()
    }

    pub async fn set_sync_cursor(&self, cursor: SyncCursor) {
        self.inner.write().await.sync_cursor = cursor;
    }

    pub async fn bump_retry(&self) -> u64 {
        let mut data = self.inner.write().await;
        data.retry_times += 1;
        data.retry_times
    }

    pub async fn retry_times(&self) -> u64 {
        self.inner.read().await.retry_times
    }

    pub async fn to_persisted(&self, cookies: Vec<StoredCookie>) -> PersistedSession {
        let data = self.inner.read().await;
        PersistedSession {
            base_url: data.base_url.clone(),
            sid: data.base_request.sid.clone(),
            skey: data.base_request.skey.clone(),
            uin: data.base_request.uin,
            device_id: data.base_request.device_id.clone(),
            pass_ticket: data.base_request.pass_ticket.clone(),
            cookies,
        }
    }

    pub async fn restore(&self, persisted: &PersistedSession) {
        let mut data = self.inner.write().await;
        data.base_request.sid = persisted.sid.clone();
        data.base_request.skey = persisted.skey.clone();
        data.base_request.uin = persisted.uin;
        data.base_request.device_id = persisted.device_id.clone();
        data.base_request.pass_ticket = persisted.pass_ticket.clone();
        data.base_url = persisted.base_url.clone();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Device ids follow the service's `e` + 15 digits convention.
fn random_device_id() -> String {
    let digits: String = Uuid::new_v4()
        .into_bytes()
        .iter()
        .take(15)
        .map(|b| char::from(b'0' + b % 10))
        .collect();
    format!("e{digits}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_matches_service_convention() {
        let id = random_device_id();
        assert_eq!(id.len(), 16);
        assert!(id.starts_with('e'));
        assert!(id[1..].chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn persisted_round_trip_preserves_credentials() {
        let state = SessionState::new();
        state
            .apply_credentials(
                "sid-1".into(),
                "skey-1".into(),
                42,
                "ticket-1".into(),
                "https://wx.example.com/cgi-bin/mmwebwx-bin".into(),
            )
            .await;

        let persisted = state
            .to_persisted(vec![StoredCookie {
                name: "wxsid".into(),
                value: "sid-1".into(),
            }])
            .await;
        assert!(persisted.is_complete());

        let restored = SessionState::new();
        restored.restore(&persisted).await;
        let data = restored.snapshot().await;
        assert_eq!(data.base_request.skey, "skey-1");
        assert_eq!(data.base_request.uin, 42);
        assert_eq!(data.base_url, "https://wx.example.com/cgi-bin/mmwebwx-bin");
    }

    #[tokio::test]
    async fn retry_counter_only_grows() {
        let state = SessionState::new();
        assert_eq!(state.bump_retry().await, 1);
        assert_eq!(state.bump_retry().await, 2);
        assert_eq!(state.retry_times().await, 2);
    }
}
