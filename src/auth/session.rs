//! Server-side sessions.
//!
//! Session data lives in memory keyed by a random id carried in an
//! HttpOnly cookie. `session_middleware` loads the session before the
//! handler runs and writes it back (rotating the id when required) after.

use actix_web::body::MessageBody;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::dev::{Payload, ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, Error, FromRequest, HttpMessage, HttpRequest};
use chrono::{DateTime, Duration, Utc};
use futures::future::{ready, Ready};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::record_access;
use crate::auth::csrf::CsrfToken;
use crate::auth::tokens::random_hex;
use crate::config::SecurityConfig;
use crate::db::models::{is_admin_role, Usuario};
use crate::error::{AppError, AuthError};
use crate::AppState;

/// Identity cached in the session after the password check.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUser {
    pub id: i64,
    pub nombre: String,
    pub apellido: String,
    pub email: String,
    pub rol: String,
}

impl SessionUser {
    pub fn is_admin(&self) -> bool {
        is_admin_role(&self.rol)
    }
}

impl From<&Usuario> for SessionUser {
    fn from(user: &Usuario) -> Self {
        Self {
            id: user.id,
            nombre: user.nombre.clone(),
            apellido: user.apellido.clone(),
            email: user.email.clone(),
            rol: user.rol.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
    Anonymous,
    /// Password accepted, second factor still required.
    AwaitingTwoFactor { user: SessionUser, expires_at: DateTime<Utc> },
    /// Password accepted, account must enrol an authenticator first.
    AwaitingSetup { user: SessionUser, expires_at: DateTime<Utc> },
    Authenticated { user: SessionUser },
}

/// Secret generated for enrolment; only persisted once a code confirms it.
#[derive(Debug, Clone, PartialEq)]
pub struct TotpSetup {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionData {
    pub auth: AuthState,
    pub csrf: Option<CsrfToken>,
    pub totp_setup: Option<TotpSetup>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub rotated_at: DateTime<Utc>,
}

impl SessionData {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            auth: AuthState::Anonymous,
            csrf: None,
            totp_setup: None,
            created_at: now,
            last_activity: now,
            rotated_at: now,
        }
    }
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    data: SessionData,
    is_new: bool,
    dirty: bool,
    rotate: bool,
    destroyed: bool,
    /// Set when an authenticated session was dropped for inactivity.
    expired: bool,
}

/// Request-scoped view of the session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Session(Rc<RefCell<SessionInner>>);

impl Session {
    fn new(inner: SessionInner) -> Self {
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn id(&self) -> String {
        self.0.borrow().id.clone()
    }

    pub fn auth(&self) -> AuthState {
        self.0.borrow().data.auth.clone()
    }

    pub fn set_auth(&self, auth: AuthState) {
        let mut inner = self.0.borrow_mut();
        inner.data.auth = auth;
        inner.dirty = true;
    }

    pub fn user(&self) -> Option<SessionUser> {
        match &self.0.borrow().data.auth {
            AuthState::Authenticated { user } => Some(user.clone()),
            _ => None,
        }
    }

    pub fn csrf(&self) -> Option<CsrfToken> {
        self.0.borrow().data.csrf.clone()
    }

    pub fn set_csrf(&self, token: Option<CsrfToken>) {
        let mut inner = self.0.borrow_mut();
        inner.data.csrf = token;
        inner.dirty = true;
    }

    pub fn totp_setup(&self) -> Option<TotpSetup> {
        self.0.borrow().data.totp_setup.clone()
    }

    pub fn set_totp_setup(&self, setup: Option<TotpSetup>) {
        let mut inner = self.0.borrow_mut();
        inner.data.totp_setup = setup;
        inner.dirty = true;
    }

    pub fn was_expired(&self) -> bool {
        self.0.borrow().expired
    }

    /// Issue a fresh id for this session when the response is written.
    pub fn renew(&self) {
        let mut inner = self.0.borrow_mut();
        inner.rotate = true;
        inner.dirty = true;
    }

    /// Drop all session state and expire the cookie.
    pub fn purge(&self) {
        let mut inner = self.0.borrow_mut();
        inner.data = SessionData::new(Utc::now());
        inner.destroyed = true;
    }

    /// Detached session for unit tests that call handlers directly.
    #[cfg(test)]
    pub fn for_test(auth: AuthState) -> Self {
        let mut data = SessionData::new(Utc::now());
        data.auth = auth;
        Self::new(SessionInner {
            id: random_hex(32),
            data,
            is_new: false,
            dirty: false,
            rotate: false,
            destroyed: false,
            expired: false,
        })
    }
}

impl FromRequest for Session {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Session>()
                .cloned()
                .ok_or_else(|| AppError::InternalError("session middleware not installed".to_string())),
        )
    }
}

/// Authenticated caller. Rejects anonymous sessions and sessions still in
/// the middle of the two-factor step.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: SessionUser,
    pub session: Session,
}

impl CurrentUser {
    pub fn from_session(session: Session) -> Result<Self, AppError> {
        match session.auth() {
            AuthState::Authenticated { user } => Ok(Self { user, session }),
            AuthState::AwaitingTwoFactor { .. } | AuthState::AwaitingSetup { .. } => {
                Err(AuthError::TwoFactorPending.into())
            }
            AuthState::Anonymous if session.was_expired() => Err(AuthError::SessionExpired.into()),
            AuthState::Anonymous => Err(AuthError::NotAuthenticated.into()),
        }
    }
}

impl FromRequest for CurrentUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        let session = match Session::from_request(req, payload).into_inner() {
            Ok(session) => session,
            Err(e) => return ready(Err(e)),
        };
        ready(CurrentUser::from_session(session))
    }
}

#[derive(Debug, Clone)]
pub struct AdminUser(pub CurrentUser);

impl std::ops::Deref for AdminUser {
    type Target = CurrentUser;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromRequest for AdminUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, payload: &mut Payload) -> Self::Future {
        ready(CurrentUser::from_request(req, payload).into_inner().and_then(|current| {
            if current.user.is_admin() {
                Ok(AdminUser(current))
            } else {
                Err(AuthError::Forbidden.into())
            }
        }))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub secure: bool,
    pub idle_timeout: Duration,
    pub rotate_every: Duration,
}

impl SessionConfig {
    pub fn from_settings(security: &SecurityConfig) -> Self {
        Self {
            cookie_name: security.session_cookie.clone(),
            secure: security.cookie_secure,
            idle_timeout: Duration::seconds(security.session_idle_secs),
            rotate_every: Duration::seconds(security.session_rotate_secs),
        }
    }
}

/// What `open` found for the incoming cookie.
pub struct OpenedSession {
    pub session: Session,
    /// User whose session was dropped for inactivity on this request.
    pub expired_user: Option<SessionUser>,
}

pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionData>>>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    pub async fn open(&self, cookie_id: Option<String>) -> OpenedSession {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;

        let existing = cookie_id.and_then(|id| sessions.get(&id).cloned().map(|data| (id, data)));
        let mut expired_user = None;

        if let Some((id, mut data)) = existing {
            if now - data.last_activity <= self.config.idle_timeout {
                let authenticated = matches!(data.auth, AuthState::Authenticated { .. });
                let rotate = authenticated && now - data.rotated_at > self.config.rotate_every;
                data.last_activity = now;
                return OpenedSession {
                    session: Session::new(SessionInner {
                        id,
                        data,
                        is_new: false,
                        dirty: false,
                        rotate,
                        destroyed: false,
                        expired: false,
                    }),
                    expired_user: None,
                };
            }

            sessions.remove(&id);
            if let AuthState::Authenticated { user } = data.auth {
                expired_user = Some(user);
            }
        }

        let expired = expired_user.is_some();
        OpenedSession {
            session: Session::new(SessionInner {
                id: random_hex(32),
                data: SessionData::new(now),
                is_new: true,
                dirty: false,
                rotate: false,
                destroyed: false,
                expired,
            }),
            expired_user,
        }
    }

    /// Writes the session back. Returns the cookie the response must carry,
    /// if any.
    ///
    /// An existing session that another request removed (logout, rotation,
    /// cleanup) is never recreated. A request that did not change the data
    /// only refreshes the activity time, so it cannot undo a concurrent
    /// write.
    pub async fn persist(&self, session: &Session, had_cookie: bool) -> Option<Cookie<'static>> {
        let (id, data, is_new, dirty, rotate, destroyed) = {
            let inner = session.0.borrow();
            (
                inner.id.clone(),
                inner.data.clone(),
                inner.is_new,
                inner.dirty,
                inner.rotate,
                inner.destroyed,
            )
        };
        let mut sessions = self.sessions.write().await;

        if destroyed {
            sessions.remove(&id);
            if !had_cookie {
                return None;
            }
            let mut cookie = self.cookie(String::new());
            cookie.make_removal();
            return Some(cookie);
        }

        if is_new {
            if !dirty {
                return None;
            }
            sessions.insert(id.clone(), data);
            return Some(self.cookie(id));
        }

        let stored = match sessions.remove(&id) {
            Some(stored) => stored,
            None => {
                debug!("Session ended by a concurrent request, not written back");
                return None;
            }
        };
        let mut data = if dirty {
            data
        } else {
            SessionData {
                last_activity: stored.last_activity.max(data.last_activity),
                ..stored
            }
        };

        let new_id = if rotate {
            data.rotated_at = Utc::now();
            debug!("Session id rotated");
            random_hex(32)
        } else {
            id.clone()
        };
        sessions.insert(new_id.clone(), data);

        if new_id != id {
            session.0.borrow_mut().id = new_id.clone();
            Some(self.cookie(new_id))
        } else {
            None
        }
    }

    fn cookie(&self, value: String) -> Cookie<'static> {
        Cookie::build(self.config.cookie_name.clone(), value)
            .path("/")
            .http_only(true)
            .same_site(SameSite::Strict)
            .secure(self.config.secure)
            .finish()
    }

    /// Removes sessions idle past the timeout. Returns how many were dropped.
    pub async fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - self.config.idle_timeout;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, data| data.last_activity >= cutoff);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

pub async fn session_middleware(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or_else(|| AppError::InternalError("application state missing".to_string()))?;

    let cookie_id = req
        .cookie(state.sessions.cookie_name())
        .map(|cookie| cookie.value().to_string());
    let had_cookie = cookie_id.is_some();
    let opened = state.sessions.open(cookie_id).await;

    if let Some(user) = opened.expired_user {
        record_access(&state, req.request(), user.id, true, "Cierre de sesión automático por inactividad").await;
        info!("Session for user {} expired by inactivity", user.id);
    }

    let session = opened.session;
    req.extensions_mut().insert(session.clone());

    let mut res = next.call(req).await?;

    if let Some(cookie) = state.sessions.persist(&session, had_cookie).await {
        if let Err(e) = res.response_mut().add_cookie(&cookie) {
            warn!("Could not set session cookie: {}", e);
        }
    }
    Ok(res)
}
