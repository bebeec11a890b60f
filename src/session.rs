use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, trace, warn};

use crate::domain::{AppConfig, FdError};

pub const EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";
pub const INACTIVE_MESSAGE: &str = "Your session expired after a period of inactivity.";
pub const SIGNED_OUT_MESSAGE: &str = "You have been signed out.";
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    pub email: String,
    pub issued_at: DateTime<Utc>,
}

impl Identity {
    pub fn token_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.issued_at).to_std().unwrap_or(Duration::ZERO)
    }
}

pub trait IdentityProvider {
    /// The signed-in identity, if any.
    fn current(&self) -> Result<Option<Identity>, FdError>;
    fn sign_out(&self) -> Result<(), FdError>;
    /// Replace the password after re-checking the current one.
    fn change_password(&self, current: &str, new: &str) -> Result<(), FdError>;
}

/// Checks a password change form before the identity service is asked.
pub fn validate_password_change(current: &str, new: &str, confirm: &str) -> Result<(), FdError> {
    if current.is_empty() || new.is_empty() || confirm.is_empty() {
        return Err(FdError::Validation("Please fill in all fields.".to_string()));
    }
    if new.chars().count() < MIN_PASSWORD_LEN {
        return Err(FdError::Validation(format!(
            "The new password must have at least {MIN_PASSWORD_LEN} characters."
        )));
    }
    if new != confirm {
        return Err(FdError::Validation("The new passwords do not match.".to_string()));
    }
    if new == current {
        return Err(FdError::Validation(
            "The new password must differ from the current one.".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Administrator,
    Operator,
    Viewer,
}

impl Role {
    pub fn parse(label: &str) -> Option<Role> {
        match label.trim().to_lowercase().as_str() {
            "administrator" | "administrador" | "admin" => Some(Role::Administrator),
            "operator" | "operador" => Some(Role::Operator),
            "viewer" | "lector" => Some(Role::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    UploadFiles,
    ViewFiles,
}

impl Permission {
    pub fn parse(label: &str) -> Option<Permission> {
        match label.trim().to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "uploadfiles" | "upload" | "subirarchivos" => Some(Permission::UploadFiles),
            "viewfiles" | "view" | "verarchivos" => Some(Permission::ViewFiles),
            _ => None,
        }
    }
}

/// Answers "may this user do X" from the profile's role and permission list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    pub role: Option<Role>,
    pub permissions: Vec<Permission>,
}

impl Capabilities {
    pub fn allows(&self, permission: Permission) -> bool {
        self.role == Some(Role::Administrator) || self.permissions.contains(&permission)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconCategory {
    Male,
    Female,
    Other,
}

/// Profile document as stored by the profile service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDoc {
    pub full_name: Option<String>,
    pub username: Option<String>,
    pub gender: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub last_login: Option<DateTime<Utc>>,
}

pub trait ProfileStore {
    fn profile(&self, uid: &str) -> Result<Option<ProfileDoc>, FdError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub display_name: String,
    pub icon: IconCategory,
    pub role_label: String,
    pub capabilities: Capabilities,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn from_doc(doc: ProfileDoc, identity: &Identity) -> Self {
        let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());
        let display_name = non_empty(doc.full_name)
            .or_else(|| non_empty(doc.username))
            .unwrap_or_else(|| {
                identity
                    .email
                    .split('@')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });
        let icon = match doc.gender.as_deref().map(str::to_lowercase).as_deref() {
            Some("male") | Some("hombre") => IconCategory::Male,
            Some("female") | Some("mujer") => IconCategory::Female,
            _ => IconCategory::Other,
        };
        let role_label = doc.role.unwrap_or_default();
        let capabilities = Capabilities {
            role: Role::parse(&role_label),
            permissions: doc
                .permissions
                .iter()
                .filter_map(|p| {
                    let parsed = Permission::parse(p);
                    if parsed.is_none() {
                        debug!("Ignoring unknown permission {:?}", p);
                    }
                    parsed
                })
                .collect(),
        };
        Self {
            display_name,
            icon,
            role_label,
            capabilities,
            last_login: doc.last_login,
        }
    }

    pub fn role_badge(&self) -> &str {
        if self.role_label.is_empty() {
            "No role"
        } else {
            &self.role_label
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    LastAccess { hours: i64, minutes: i64 },
}

impl SessionStatus {
    pub fn from_last_login(last_login: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let minutes = last_login
            .map(|t| (now - t).num_minutes())
            .unwrap_or(0);
        if minutes < 5 {
            SessionStatus::Connected
        } else {
            SessionStatus::LastAccess {
                hours: minutes / 60,
                minutes: minutes % 60,
            }
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Connected => f.write_str("Connected"),
            SessionStatus::LastAccess { hours, minutes } => {
                f.write_str("Last access: ")?;
                if *hours > 0 {
                    write!(f, "{hours} hour{} ", if *hours > 1 { "s" } else { "" })?;
                }
                write!(f, "{minutes} min")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Admit(Identity),
    /// Leave the shell for the entry screen, optionally telling the user why.
    Redirect(Option<String>),
}

/// Decides whether the shell may be shown and enforces session lifetime.
///
/// Holds no session state of its own beyond the activity clock; the identity
/// provider stays the source of truth.
pub struct Gatekeeper {
    identity: Box<dyn IdentityProvider>,
    profiles: Box<dyn ProfileStore>,
    session_window: Duration,
    inactivity_window: Duration,
    sign_out_delay: Duration,
    last_activity: Instant,
    pending_sign_out: Option<(Instant, String)>,
    admitted: Option<String>,
}

impl Gatekeeper {
    pub fn new(
        cfg: &AppConfig,
        identity: Box<dyn IdentityProvider>,
        profiles: Box<dyn ProfileStore>,
        now: Instant,
    ) -> Self {
        Self {
            identity,
            profiles,
            session_window: cfg.session_window,
            inactivity_window: cfg.inactivity_window,
            sign_out_delay: cfg.forced_sign_out_delay,
            last_activity: now,
            pending_sign_out: None,
            admitted: None,
        }
    }

    pub fn check(&mut self, now: DateTime<Utc>) -> Result<GateDecision, FdError> {
        let Some(identity) = self.identity.current()? else {
            info!("No identity, redirecting to entry screen");
            return Ok(GateDecision::Redirect(None));
        };
        if identity.token_age(now) > self.session_window {
            warn!("Session of {} expired", identity.uid);
            self.identity.sign_out()?;
            return Ok(GateDecision::Redirect(Some(EXPIRED_MESSAGE.to_string())));
        }
        self.admitted = Some(identity.uid.clone());
        Ok(GateDecision::Admit(identity))
    }

    pub fn load_profile(&self, identity: &Identity) -> Result<UserProfile, FdError> {
        let doc = self
            .profiles
            .profile(&identity.uid)?
            .ok_or_else(|| FdError::Data("user profile document not found".to_string()))?;
        Ok(UserProfile::from_doc(doc, identity))
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Sign out after the configured delay so the user can read `message` first.
    pub fn schedule_sign_out(&mut self, now: Instant, message: impl Into<String>) {
        let message = message.into();
        error!("Forcing sign out: {message}");
        self.pending_sign_out = Some((now + self.sign_out_delay, message));
    }

    pub fn sign_out(&mut self) -> Result<(), FdError> {
        self.pending_sign_out = None;
        self.admitted = None;
        self.identity.sign_out()
    }

    pub fn change_password(&self, current: &str, new: &str) -> Result<(), FdError> {
        validate_password_change(current, new, new)?;
        self.identity.change_password(current, new)
    }

    /// Follow identity changes made outside the shell. Gone or replaced means leave.
    fn identity_changed(&mut self) -> Option<String> {
        let uid = self.admitted.as_ref()?;
        match self.identity.current() {
            Ok(Some(identity)) if identity.uid == *uid => None,
            Ok(Some(identity)) => {
                warn!("Identity changed from {uid} to {}", identity.uid);
                Some(SIGNED_OUT_MESSAGE.to_string())
            }
            Ok(None) => {
                info!("Identity {uid} signed out elsewhere");
                Some(SIGNED_OUT_MESSAGE.to_string())
            }
            Err(e) => {
                error!("Identity check failed: {e}");
                Some(e.to_string())
            }
        }
    }

    /// Advance the timers. Returns a redirect when the session has to end.
    pub fn tick(&mut self, now: Instant) -> Option<GateDecision> {
        let mut message = match &self.pending_sign_out {
            Some((at, message)) if now >= *at => Some(message.clone()),
            _ => None,
        };
        if message.is_none() && now.duration_since(self.last_activity) >= self.inactivity_window {
            message = Some(INACTIVE_MESSAGE.to_string());
        }
        if message.is_none() {
            message = self.identity_changed();
        }
        let message = message?;
        if let Err(e) = self.sign_out() {
            error!("Sign out failed: {e}");
        }
        Some(GateDecision::Redirect(Some(message)))
    }
}

/// Identity provider backed by one session file per user.
#[derive(Debug)]
pub struct LocalIdentityProvider {
    path: PathBuf,
    credentials: PathBuf,
    user: String,
}

/// Salted password hash kept in `credentials/<user>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Credentials {
    salt: String,
    hash: String,
}

impl Credentials {
    fn new(user: &str, password: &str) -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let salt = hex::encode(Sha256::digest(format!("{user}:{nanos}").as_bytes()));
        let hash = Self::digest(&salt, password);
        Self { salt, hash }
    }

    fn digest(salt: &str, password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn matches(&self, password: &str) -> bool {
        Self::digest(&self.salt, password) == self.hash
    }
}

impl LocalIdentityProvider {
    pub fn new(data_dir: impl Into<PathBuf>, user: &str) -> Self {
        let data_dir = data_dir.into();
        Self {
            path: data_dir.join("sessions").join(format!("{user}.json")),
            credentials: data_dir.join("credentials").join(format!("{user}.json")),
            user: user.to_string(),
        }
    }

    /// Store a new password hash for the user.
    pub fn set_password(&self, password: &str) -> Result<(), FdError> {
        if let Some(parent) = self.credentials.parent() {
            fs::create_dir_all(parent)?;
        }
        let credentials = Credentials::new(&self.user, password);
        fs::write(&self.credentials, serde_json::to_string_pretty(&credentials)?)?;
        trace!("Stored credentials for {}", self.user);
        Ok(())
    }

    /// Start a fresh session, standing in for the sign-in screen.
    pub fn sign_in(&self, identity: &Identity) -> Result<(), FdError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(identity)?)?;
        info!("Signed in {}", identity.uid);
        Ok(())
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn current(&self) -> Result<Option<Identity>, FdError> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| FdError::Auth(format!("unreadable session: {e}")))
    }

    fn sign_out(&self) -> Result<(), FdError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FdError::Auth(format!("sign out failed: {e}"))),
        }
    }

    fn change_password(&self, current: &str, new: &str) -> Result<(), FdError> {
        if !self.credentials.is_file() {
            return Err(FdError::Validation("No password is set for this account.".to_string()));
        }
        let text = fs::read_to_string(&self.credentials)?;
        let stored: Credentials = serde_json::from_str(&text)?;
        if !stored.matches(current) {
            warn!("Password change for {} with wrong current password", self.user);
            return Err(FdError::Validation("The current password is incorrect.".to_string()));
        }
        self.set_password(new)?;
        info!("Password changed for {}", self.user);
        Ok(())
    }
}

/// Profile store reading `users/<uid>.json` documents.
#[derive(Debug)]
pub struct JsonProfileStore {
    dir: PathBuf,
}

impl JsonProfileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: data_dir.into().join("users"),
        }
    }
}

impl ProfileStore for JsonProfileStore {
    fn profile(&self, uid: &str) -> Result<Option<ProfileDoc>, FdError> {
        let path = self.dir.join(format!("{uid}.json"));
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| FdError::Data(format!("could not read profile: {e}")))?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| FdError::Data(format!("invalid profile document: {e}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    pub(crate) struct FakeIdentity {
        pub identity: Rc<RefCell<Option<Identity>>>,
        pub sign_outs: Rc<RefCell<usize>>,
        pub password: Rc<RefCell<String>>,
        pub unreadable: Rc<RefCell<bool>>,
    }

    impl IdentityProvider for FakeIdentity {
        fn current(&self) -> Result<Option<Identity>, FdError> {
            if *self.unreadable.borrow() {
                return Err(FdError::Auth("session file is corrupt".into()));
            }
            Ok(self.identity.borrow().clone())
        }

        fn sign_out(&self) -> Result<(), FdError> {
            *self.sign_outs.borrow_mut() += 1;
            self.identity.borrow_mut().take();
            Ok(())
        }

        fn change_password(&self, current: &str, new: &str) -> Result<(), FdError> {
            if *self.password.borrow() != current {
                return Err(FdError::Validation("The current password is incorrect.".into()));
            }
            *self.password.borrow_mut() = new.to_string();
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeProfiles(pub Option<ProfileDoc>);

    impl ProfileStore for FakeProfiles {
        fn profile(&self, _uid: &str) -> Result<Option<ProfileDoc>, FdError> {
            Ok(self.0.clone())
        }
    }

    pub(crate) fn identity(issued_at: DateTime<Utc>) -> Identity {
        Identity {
            uid: "u1".into(),
            email: "ana.ruiz@clinic.test".into(),
            issued_at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()
    }

    fn gate(fake: &FakeIdentity, profile: Option<ProfileDoc>, now: Instant) -> Gatekeeper {
        Gatekeeper::new(
            &AppConfig::default(),
            Box::new(fake.clone()),
            Box::new(FakeProfiles(profile)),
            now,
        )
    }

    #[test]
    fn no_identity_redirects_without_message() {
        let fake = FakeIdentity::default();
        let mut g = gate(&fake, None, Instant::now());
        assert_eq!(g.check(t0()).unwrap(), GateDecision::Redirect(None));
    }

    #[test]
    fn expired_token_signs_out() {
        let fake = FakeIdentity::default();
        *fake.identity.borrow_mut() = Some(identity(t0()));
        let mut g = gate(&fake, None, Instant::now());

        let later = t0() + chrono::Duration::hours(5);
        assert!(matches!(g.check(later).unwrap(), GateDecision::Admit(_)));

        let expired = later + chrono::Duration::seconds(1);
        assert_eq!(
            g.check(expired).unwrap(),
            GateDecision::Redirect(Some(EXPIRED_MESSAGE.to_string()))
        );
        assert_eq!(*fake.sign_outs.borrow(), 1);
    }

    #[test]
    fn inactivity_timer_resets_on_activity() {
        let fake = FakeIdentity::default();
        *fake.identity.borrow_mut() = Some(identity(t0()));
        let start = Instant::now();
        let mut g = gate(&fake, None, start);

        let four_hours = start + Duration::from_secs(4 * 3600);
        assert_eq!(g.tick(four_hours), None);
        g.record_activity(four_hours);
        assert_eq!(g.tick(start + Duration::from_secs(8 * 3600)), None);

        let idle = four_hours + Duration::from_secs(5 * 3600);
        assert_eq!(
            g.tick(idle),
            Some(GateDecision::Redirect(Some(INACTIVE_MESSAGE.to_string())))
        );
        assert_eq!(*fake.sign_outs.borrow(), 1);
    }

    #[test]
    fn scheduled_sign_out_waits_for_delay() {
        let fake = FakeIdentity::default();
        let start = Instant::now();
        let mut g = gate(&fake, None, start);
        g.schedule_sign_out(start, "profile missing");
        assert_eq!(g.tick(start + Duration::from_secs(2)), None);
        assert_eq!(
            g.tick(start + Duration::from_secs(3)),
            Some(GateDecision::Redirect(Some("profile missing".into())))
        );
    }

    #[test]
    fn identity_removed_elsewhere_redirects() {
        let fake = FakeIdentity::default();
        *fake.identity.borrow_mut() = Some(identity(t0()));
        let start = Instant::now();
        let mut g = gate(&fake, None, start);
        assert!(matches!(g.check(t0()).unwrap(), GateDecision::Admit(_)));
        assert_eq!(g.tick(start), None);

        fake.identity.borrow_mut().take();
        assert_eq!(
            g.tick(start + Duration::from_millis(100)),
            Some(GateDecision::Redirect(Some(SIGNED_OUT_MESSAGE.to_string())))
        );
        // Once out, nothing is re-checked.
        assert_eq!(g.tick(start + Duration::from_millis(200)), None);
    }

    #[test]
    fn another_identity_also_redirects() {
        let fake = FakeIdentity::default();
        *fake.identity.borrow_mut() = Some(identity(t0()));
        let start = Instant::now();
        let mut g = gate(&fake, None, start);
        g.check(t0()).unwrap();
        fake.identity.borrow_mut().as_mut().unwrap().uid = "u2".into();
        assert!(matches!(g.tick(start), Some(GateDecision::Redirect(Some(_)))));
    }

    #[test]
    fn password_change_is_validated() {
        assert!(validate_password_change("", "secret1", "secret1").is_err());
        assert!(matches!(
            validate_password_change("old-pass", "short", "short"),
            Err(FdError::Validation(m)) if m.contains("6")
        ));
        assert!(validate_password_change("old-pass", "secret1", "secret2").is_err());
        assert!(validate_password_change("secret1", "secret1", "secret1").is_err());
        assert!(validate_password_change("old-pass", "secret1", "secret1").is_ok());
    }

    #[test]
    fn local_password_change_checks_current_password() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalIdentityProvider::new(dir.path(), "u1");
        assert!(matches!(provider.change_password("a", "bbbbbb"), Err(FdError::Validation(_))));

        provider.set_password("old-pass").unwrap();
        assert!(matches!(
            provider.change_password("wrong", "new-pass"),
            Err(FdError::Validation(m)) if m.contains("incorrect")
        ));
        provider.change_password("old-pass", "new-pass").unwrap();
        assert!(provider.change_password("old-pass", "other-pass").is_err());
        provider.change_password("new-pass", "other-pass").unwrap();
    }

    #[test]
    fn missing_profile_is_data_error() {
        let fake = FakeIdentity::default();
        let g = gate(&fake, None, Instant::now());
        assert!(matches!(g.load_profile(&identity(t0())), Err(FdError::Data(_))));
    }

    #[test]
    fn display_name_falls_back_to_email() {
        let doc = ProfileDoc {
            gender: Some("Mujer".into()),
            role: Some("Operador".into()),
            permissions: vec!["upload_files".into(), "bogus".into()],
            ..Default::default()
        };
        let profile = UserProfile::from_doc(doc, &identity(t0()));
        assert_eq!(profile.display_name, "ana.ruiz");
        assert_eq!(profile.icon, IconCategory::Female);
        assert_eq!(profile.capabilities.role, Some(Role::Operator));
        assert!(profile.capabilities.allows(Permission::UploadFiles));
        assert!(!profile.capabilities.allows(Permission::ViewFiles));
    }

    #[test]
    fn administrators_have_every_permission() {
        let caps = Capabilities {
            role: Some(Role::Administrator),
            permissions: Vec::new(),
        };
        assert!(caps.allows(Permission::ViewFiles));
        assert!(caps.allows(Permission::UploadFiles));
    }

    #[test]
    fn session_status_text() {
        let now = t0();
        assert_eq!(
            SessionStatus::from_last_login(Some(now - chrono::Duration::minutes(3)), now).to_string(),
            "Connected"
        );
        assert_eq!(SessionStatus::from_last_login(None, now), SessionStatus::Connected);
        assert_eq!(
            SessionStatus::from_last_login(Some(now - chrono::Duration::minutes(42)), now).to_string(),
            "Last access: 42 min"
        );
        assert_eq!(
            SessionStatus::from_last_login(Some(now - chrono::Duration::minutes(130)), now).to_string(),
            "Last access: 2 hours 10 min"
        );
    }

    #[test]
    fn local_identity_round_trips_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalIdentityProvider::new(dir.path(), "u1");
        assert_eq!(provider.current().unwrap(), None);
        provider.sign_in(&identity(t0())).unwrap();
        assert_eq!(provider.current().unwrap(), Some(identity(t0())));
        provider.sign_out().unwrap();
        assert_eq!(provider.current().unwrap(), None);
    }
}
