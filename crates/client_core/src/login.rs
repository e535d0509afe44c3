use std::sync::{atomic::Ordering, Arc};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    events::{Event, EventPayload},
    transport::Transport,
    Bot,
};

const LOGIN_APP_ID: &str = "wx782c26e4c19acffb";
/// Each confirmation poll is held open server-side for up to ~25s; this
/// bounds one login attempt to roughly fifteen minutes.
const MAX_CONFIRM_POLLS: usize = 40;

const CODE_CONFIRMED: &str = "200";
const CODE_SCANNED: &str = "201";
const CODE_POLL_TIMEOUT: &str = "408";

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("login rejected by server, ret={ret}: [{message}]")]
    Rejected { ret: i64, message: String },
    #[error("login confirmation polling exhausted after {0} attempts")]
    Timeout(usize),
    #[error("unexpected handshake payload: {0}")]
    Protocol(String),
}

#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    Scanned,
    Confirmed(String),
    Waiting,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct LoginCredentials {
    ret: i64,
    message: String,
    skey: String,
    sid: String,
    uin: i64,
    pass_ticket: String,
}

impl Bot {
    /// Supervised login loop: runs for the life of the process, retrying the
    /// whole connect sequence with a backoff that scales with the (monotonic)
    /// retry counter, and re-entering login whenever the long-poll sync loop
    /// dies.
    pub(crate) async fn supervise_login(self: Arc<Self>) {
        loop {
            if let Err(err) = self.login_once().await {
                error!(error = %err, "login attempt failed");
                let retry = self.session.bump_retry().await;
                warn!(retry, "will retry login after backoff");
                tokio::time::sleep(self.config.retry_base * retry as u32).await;
                continue;
            }

            info!("login succeeded");
            if let Err(err) = self.sync_contacts().await {
                error!(error = %err, "full contact sync failed");
            } else {
                info!(contacts = self.cache.len(), "contact sync complete");
            }

            self.logged_in.store(true, Ordering::SeqCst);
            self.bus.emit(Event::new(
                "/login",
                "login",
                EventPayload::LoginResult { success: true },
            ));

            let err = self.sync_loop().await;
            self.logged_in.store(false, Ordering::SeqCst);
            self.bus.emit(Event::new(
                "/login",
                "login",
                EventPayload::LoginResult { success: false },
            ));
            error!(error = %err, "sync loop ended, re-entering login");
        }
    }

    /// One full pass of the state machine: resume a persisted session when
    /// possible, otherwise run the QR handshake, then initialize.
    pub(crate) async fn login_once(self: &Arc<Self>) -> Result<()> {
        // A fresh cookie jar per attempt; stale cookies poison re-login.
        self.reset_transport().await?;

        if self.try_resume_session().await? {
            return Ok(());
        }

        let uuid = self.fetch_login_token().await?;
        debug!(%uuid, "login token issued");
        self.presenter.present_challenge(&uuid).await?;

        let redirect = match self.wait_for_confirmation(&uuid).await {
            Ok(redirect) => {
                self.presenter.challenge_resolved(None).await;
                redirect
            }
            Err(err) => {
                self.presenter.challenge_resolved(Some(err.to_string())).await;
                return Err(err);
            }
        };

        self.exchange_credentials(&redirect).await?;
        self.init_session().await
    }

    /// `Ok(true)` when a persisted session was restored and re-validated.
    /// Any load, decode, structural, or re-validation failure clears the
    /// persisted artifacts and falls through to the QR path.
    pub(crate) async fn try_resume_session(self: &Arc<Self>) -> Result<bool> {
        let persisted = match self.store.load().await {
            Ok(Some(persisted)) if persisted.is_complete() => persisted,
            Ok(Some(_)) => {
                warn!("persisted session is structurally incomplete, discarding");
                let _ = self.store.clear().await;
                return Ok(false);
            }
            Ok(None) => return Ok(false),
            Err(err) => {
                warn!(error = %err, "persisted session is unreadable, discarding");
                let _ = self.store.clear().await;
                return Ok(false);
            }
        };

        info!("attempting session resumption");
        self.session.restore(&persisted).await;
        {
            let transport = self.transport.read().await;
            transport.restore_cookies(&persisted.base_url, &persisted.cookies)?;
        }

        match self.init_session().await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(error = %err, "session resumption failed, falling back to QR login");
                let _ = self.store.clear().await;
                Ok(false)
            }
        }
    }

    async fn fetch_login_token(&self) -> Result<String> {
        let url = format!("{}/jslogin", self.config.login_host);
        let params = [
            ("appid", LOGIN_APP_ID.to_string()),
            ("fun", "new".to_string()),
            ("lang", "zh_CN".to_string()),
            ("_", Utc::now().timestamp().to_string()),
        ];
        let body = {
            let transport = self.transport.read().await;
            transport.post_form_text(&url, &params).await?
        };
        parse_login_token(&body).map_err(Into::into)
    }

    /// Poll the status endpoint until the operator confirms on the phone.
    /// `201` means scanned-awaiting-confirmation (not an error); the `tip`
    /// parameter drops to 0 after the first response, as the service
    /// expects.
    async fn wait_for_confirmation(&self, uuid: &str) -> Result<String> {
        let mut tip = 1;
        for _ in 0..MAX_CONFIRM_POLLS {
            let url = format!(
                "{}/cgi-bin/mmwebwx-bin/login?tip={tip}&uuid={uuid}&_={}",
                self.config.login_host,
                Utc::now().timestamp(),
            );
            let body = {
                let transport = self.transport.read().await;
                transport.get_text(&url).await?
            };
            tip = 0;
            match parse_poll_body(&body)? {
                PollOutcome::Scanned => {
                    debug!("scan acknowledged, waiting for confirmation on the phone");
                }
                PollOutcome::Waiting => {}
                PollOutcome::Confirmed(redirect) => return Ok(redirect),
            }
        }
        Err(LoginError::Timeout(MAX_CONFIRM_POLLS).into())
    }

    /// Follow the confirmation redirect and capture the credential payload
    /// into session state. A non-zero result code is a hard failure carrying
    /// the server's message.
    async fn exchange_credentials(&self, redirect: &str) -> Result<()> {
        let body = {
            let transport = self.transport.read().await;
            transport.get_text(redirect).await?
        };
        let credentials = parse_credentials(&body)?;
        if credentials.ret != 0 {
            return Err(LoginError::Rejected {
                ret: credentials.ret,
                message: credentials.message,
            }
            .into());
        }

        let base_url = base_url_of(redirect)?;
        self.session
            .apply_credentials(
                credentials.sid,
                credentials.skey,
                credentials.uin,
                credentials.pass_ticket,
                base_url,
            )
            .await;
        self.persist_session().await;
        Ok(())
    }

    /// Session-init call: re-validates the credentials and captures the
    /// rotated skey, our own contact and the initial sync cursor.
    async fn init_session(self: &Arc<Self>) -> Result<()> {
        use shared::{domain::ContactKind, protocol::InitResponse};

        let base_url = self.session.base_url().await;
        if base_url.is_empty() {
            return Err(anyhow!("no base url captured before init"));
        }
        let url = format!(
            "{base_url}/webwxinit?{}&r={}",
            self.session.credential_query().await,
            Utc::now().timestamp(),
        );
        let body = serde_json::json!({ "BaseRequest": self.session.base_request().await });
        let response: InitResponse = self.execute_api(&url, Some(body)).await?;

        let myself = shared::domain::Contact::from_raw(&response.user, ContactKind::Friend);
        info!(user_name = %myself.user_name, nick_name = %myself.nick_name, "session initialized");
        self.session.set_myself(myself).await;
        self.session.set_sync_cursor(response.sync_key).await;
        self.persist_session().await;
        Ok(())
    }

    async fn reset_transport(&self) -> Result<()> {
        let fresh = Transport::new(&self.config.user_agent)?;
        *self.transport.write().await = fresh;
        Ok(())
    }
}

fn parse_login_token(body: &str) -> Result<String, LoginError> {
    let code = extract_between(body, "window.QRLogin.code = ", ";")
        .ok_or_else(|| LoginError::Protocol(format!("no QRLogin code in: {body}")))?;
    if code != CODE_CONFIRMED {
        return Err(LoginError::Protocol(format!(
            "unexpected QRLogin code {code} in: {body}"
        )));
    }
    extract_between(body, "window.QRLogin.uuid = \"", "\";")
        .map(str::to_string)
        .ok_or_else(|| LoginError::Protocol(format!("no QRLogin uuid in: {body}")))
}

fn parse_poll_body(body: &str) -> Result<PollOutcome, LoginError> {
    let code = extract_between(body, "window.code=", ";")
        .ok_or_else(|| LoginError::Protocol(format!("no status code in: {body}")))?;
    match code {
        CODE_SCANNED => Ok(PollOutcome::Scanned),
        CODE_POLL_TIMEOUT => Ok(PollOutcome::Waiting),
        CODE_CONFIRMED => {
            let redirect = extract_between(body, "window.redirect_uri=\"", "\";")
                .ok_or_else(|| LoginError::Protocol(format!("no redirect uri in: {body}")))?;
            Ok(PollOutcome::Confirmed(format!("{redirect}&fun=new")))
        }
        other => Err(LoginError::Protocol(format!(
            "unexpected login status code {other}"
        ))),
    }
}

fn parse_credentials(body: &str) -> Result<LoginCredentials, LoginError> {
    let field = |tag: &str| {
        extract_between(body, &format!("<{tag}>"), &format!("</{tag}>"))
            .unwrap_or_default()
            .to_string()
    };
    let ret = field("ret")
        .parse::<i64>()
        .map_err(|_| LoginError::Protocol(format!("credential payload has no ret: {body}")))?;
    let uin = field("wxuin").parse::<i64>().unwrap_or(0);
    Ok(LoginCredentials {
        ret,
        message: field("message"),
        skey: field("skey"),
        sid: field("wxsid"),
        uin,
        pass_ticket: field("pass_ticket"),
    })
}

/// The assigned server shard is the redirect URL truncated at its last path
/// segment.
fn base_url_of(redirect: &str) -> Result<String> {
    let mut url = Url::parse(redirect).context("redirect url is not parseable")?;
    url.set_query(None);
    url.set_fragment(None);
    let text = url.to_string();
    let cut = text.rfind('/').unwrap_or(text.len());
    Ok(text[..cut].to_string())
}

fn extract_between<'a>(haystack: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let start = haystack.find(prefix)? + prefix.len();
    let end = haystack[start..].find(suffix)? + start;
    Some(&haystack[start..end])
}
