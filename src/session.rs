//! HTTP session and login handshake

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::{Authenticator, SiteSession};
use crate::config::BotConfig;
use crate::error::{ApiError, AuthError};
use crate::parse;
use crate::throttle::Throttle;
use crate::types::{BoostTarget, InventoryInstance, OfferId, Owner, QuotaSnapshot};

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// An authenticated HTTP session against the card service.
///
/// Holds the cookie jar so liveness can be checked locally, and the csrf
/// token the service expects on every mutating request. A response that
/// bounces to the login page drops the liveness marker so the guard's
/// recovery path engages on the next cycle.
pub struct HttpSession {
    client: Client,
    jar: Arc<Jar>,
    base: Url,
    session_cookie: String,
    user_id: u64,
    csrf: RwLock<String>,
    alive: AtomicBool,
    throttle: Arc<Throttle>,
}

impl HttpSession {
    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Malformed(format!("bad url {}: {}", path, e)))
    }

    fn expired(&self) -> ApiError {
        self.alive.store(false, Ordering::SeqCst);
        ApiError::Unauthenticated
    }

    /// Throttled GET returning the page body. A redirect back to the
    /// login page means the session died server-side.
    async fn get_page(&self, path: &str) -> Result<String, ApiError> {
        self.throttle.acquire().await;
        let url = self.url(path)?;
        let resp = self.client.get(url).send().await?;

        if path != "/login" && resp.url().path().ends_with("/login") {
            return Err(self.expired());
        }
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(self.expired());
        }
        if !status.is_success() {
            return Err(ApiError::Malformed(format!("{} from {}", status, path)));
        }
        Ok(resp.text().await?)
    }

    /// Throttled form POST with the csrf header, decoding a JSON body.
    async fn post_form<T, F>(&self, path: &str, form: &F) -> Result<T, ApiError>
    where
        T: serde::de::DeserializeOwned,
        F: serde::Serialize + ?Sized,
    {
        self.throttle.acquire().await;
        let url = self.url(path)?;
        let csrf = self.csrf.read().map(|t| t.clone()).unwrap_or_default();
        let resp = self
            .client
            .post(url)
            .header("X-CSRF-TOKEN", csrf)
            .header("X-Requested-With", "XMLHttpRequest")
            .form(form)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(self.expired());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::Malformed(format!("{} from {}: {}", status, path, text)));
        }
        Ok(resp.json().await?)
    }

    fn set_csrf(&self, token: String) {
        if let Ok(mut slot) = self.csrf.write() {
            *slot = token;
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendOfferResponse {
    offer_id: String,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    #[serde(default)]
    success: bool,
}

#[async_trait]
impl SiteSession for HttpSession {
    fn is_live(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let marker = format!("{}=", self.session_cookie);
        self.jar
            .cookies(&self.base)
            .and_then(|header| header.to_str().map(str::to_string).ok())
            .map(|cookies| cookies.contains(&marker))
            .unwrap_or(false)
    }

    async fn refresh_token(&self) -> Result<bool, ApiError> {
        debug!("Refreshing csrf token");
        let page = self.get_page("/trades/offers").await?;
        match parse::csrf_token(&page) {
            Some(token) => {
                self.set_csrf(token);
                self.alive.store(true, Ordering::SeqCst);
                info!("Csrf token refreshed");
                Ok(true)
            }
            None => {
                warn!("No csrf token found during refresh");
                Ok(false)
            }
        }
    }

    async fn logout(&self) -> Result<(), ApiError> {
        // The service bounces to the login page after a logout; either
        // way the session is gone.
        match self.get_page("/logout").await {
            Ok(_) | Err(ApiError::Unauthenticated) => {
                self.alive.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_target(&self) -> Result<BoostTarget, ApiError> {
        let page = self.get_page("/club/boost").await?;
        parse::boost_target(&page)
            .ok_or_else(|| ApiError::Malformed("no boost target on club page".to_string()))
    }

    async fn fetch_quota(&self) -> Result<QuotaSnapshot, ApiError> {
        let page = self.get_page("/club/boost").await?;
        parse::quota(&page)
            .ok_or_else(|| ApiError::Malformed("no quota counters on club page".to_string()))
    }

    async fn count_wants(&self, item_id: u64) -> Result<u32, ApiError> {
        let page = self.get_page(&format!("/cards/{}/want", item_id)).await?;
        parse::want_count(&page)
            .ok_or_else(|| ApiError::Malformed(format!("no want count for card {}", item_id)))
    }

    async fn fetch_owners(&self, item_id: u64) -> Result<Vec<Owner>, ApiError> {
        let page = self.get_page(&format!("/cards/{}/users", item_id)).await?;
        Ok(parse::owners(&page))
    }

    async fn fetch_inventory(&self) -> Result<Vec<InventoryInstance>, ApiError> {
        let page = self
            .get_page(&format!("/users/{}/cards", self.user_id))
            .await?;
        Ok(parse::inventory(&page))
    }

    async fn send_offer(
        &self,
        owner: &Owner,
        instance: &InventoryInstance,
    ) -> Result<OfferId, ApiError> {
        let form = [
            ("user_id", owner.user_id.to_string()),
            ("instance_id", instance.instance_id.to_string()),
        ];
        let resp: SendOfferResponse = self.post_form("/trades/create", &form).await?;
        Ok(OfferId(resp.offer_id))
    }

    async fn cancel_offer(&self, offer: &OfferId) -> Result<(), ApiError> {
        let form = [("offer_id", offer.0.clone())];
        let resp: AckResponse = self
            .post_form(&format!("/trades/{}/cancel", offer.0), &form)
            .await?;
        if resp.success {
            Ok(())
        } else {
            Err(ApiError::Malformed(format!("cancel of offer {} refused", offer)))
        }
    }

    async fn outstanding_offers(&self) -> Result<Vec<OfferId>, ApiError> {
        let page = self.get_page("/trades/offers").await?;
        Ok(parse::offer_ids(&page).into_iter().map(OfferId).collect())
    }

    async fn completed_trade_count(&self) -> Result<u64, ApiError> {
        let page = self.get_page("/trades/history").await?;
        parse::history_total(&page)
            .ok_or_else(|| ApiError::Malformed("no completed total on history page".to_string()))
    }

    async fn submit_replacement(&self) -> Result<(), ApiError> {
        let form: [(&str, String); 0] = [];
        let resp: AckResponse = self.post_form("/club/boost/replace", &form).await?;
        if resp.success {
            Ok(())
        } else {
            Err(ApiError::Malformed("replacement request refused".to_string()))
        }
    }
}

/// Performs the login handshake and builds `HttpSession` objects.
pub struct HttpAuthenticator {
    base_url: String,
    email: String,
    password: String,
    user_id: u64,
    session_cookie: String,
    proxy_url: Option<String>,
    timeout: Duration,
    throttle: Arc<Throttle>,
}

impl HttpAuthenticator {
    pub fn new(cfg: &BotConfig, throttle: Arc<Throttle>) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            email: cfg.email.clone(),
            password: cfg.password.clone(),
            user_id: cfg.user_id,
            session_cookie: cfg.session_cookie.clone(),
            proxy_url: cfg.proxy_url.clone(),
            timeout: Duration::from_secs(cfg.request_timeout_secs),
            throttle,
        }
    }

    fn build_client(&self, jar: Arc<Jar>) -> Result<Client, AuthError> {
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .cookie_provider(jar);
        if let Some(proxy) = &self.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn login(&self) -> Result<Arc<dyn SiteSession>, AuthError> {
        let base: Url = format!("{}/", self.base_url)
            .parse()
            .map_err(|_| AuthError::Rejected)?;
        let jar = Arc::new(Jar::default());
        let client = self.build_client(jar.clone())?;

        info!("Logging in as {}", self.email);

        self.throttle.acquire().await;
        let login_page = client
            .get(base.join("/login").map_err(|_| AuthError::Rejected)?)
            .send()
            .await?
            .text()
            .await?;
        let csrf = parse::csrf_token(&login_page).ok_or(AuthError::MissingCsrf)?;

        self.throttle.acquire().await;
        let form = [
            ("email", self.email.as_str()),
            ("password", self.password.as_str()),
            ("_token", csrf.as_str()),
        ];
        client
            .post(base.join("/login").map_err(|_| AuthError::Rejected)?)
            .header("X-CSRF-TOKEN", csrf.as_str())
            .form(&form)
            .send()
            .await?;

        let marker = format!("{}=", self.session_cookie);
        let live = jar
            .cookies(&base)
            .and_then(|header| header.to_str().map(str::to_string).ok())
            .map(|cookies| cookies.contains(&marker))
            .unwrap_or(false);
        if !live {
            return Err(AuthError::Rejected);
        }

        info!("Login succeeded");
        Ok(Arc::new(HttpSession {
            client,
            jar,
            base,
            session_cookie: self.session_cookie.clone(),
            user_id: self.user_id,
            csrf: RwLock::new(csrf),
            alive: AtomicBool::new(true),
            throttle: self.throttle.clone(),
        }))
    }
}
