use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::{Duration, Instant};

use arboard::Clipboard;
use chrono::{DateTime, Local, Utc};
use ratatui::crossterm::event::KeyEvent;
use tracing::{debug, error, info, trace, warn};

use crate::account::PasswordForm;
use crate::domain::{AppConfig, CMDMode, FdError, HELP_TEXT, Message};
use crate::engine::{EngineAction, RecordEngine};
use crate::inputter::{InputResult, Inputter};
use crate::loader::{AssetSource, LoaderEvent, Markup, ModuleKind, ModuleLoader, StyleSheet};
use crate::records::RecordStore;
use crate::session::{
    GateDecision, Gatekeeper, Identity, IdentityProvider, ProfileStore, SessionStatus,
    UserProfile,
};
use crate::storage::{FileListing, ObjectStore, UploadEvent, spawn_list_files, spawn_upload};

const STATUS_MESSAGE_TTL: Duration = Duration::from_secs(8);

#[derive(Debug, PartialEq)]
pub enum Status {
    READY,
    QUITTING,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Modus {
    SHELL,
    MENU,
    LOGOUT,
    POPUP,
    FILES,
    UPLOAD,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MenuItem {
    Records,
    PersonalData,
    ChangePassword,
    ToggleTheme,
    Logout,
}

impl MenuItem {
    pub const ALL: [MenuItem; 5] = [
        MenuItem::Records,
        MenuItem::PersonalData,
        MenuItem::ChangePassword,
        MenuItem::ToggleTheme,
        MenuItem::Logout,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MenuItem::Records => "Patient records",
            MenuItem::PersonalData => "Personal data",
            MenuItem::ChangePassword => "Change password",
            MenuItem::ToggleTheme => "Toggle dark mode",
            MenuItem::Logout => "Log out",
        }
    }
}

/// Read-only profile module.
pub struct ProfileView {
    pub profile: UserProfile,
    pub email: String,
}

pub enum ActiveModule {
    Records(Box<RecordEngine>),
    PersonalData(ProfileView),
    ChangePassword(PasswordForm),
}

impl ActiveModule {
    pub fn kind(&self) -> ModuleKind {
        match self {
            ActiveModule::Records(_) => ModuleKind::Records,
            ActiveModule::PersonalData(_) => ModuleKind::PersonalData,
            ActiveModule::ChangePassword(_) => ModuleKind::ChangePassword,
        }
    }

    pub fn dispose(&mut self) {
        match self {
            ActiveModule::Records(engine) => engine.dispose(),
            ActiveModule::PersonalData(_) => trace!("Unmounting personal data view"),
            ActiveModule::ChangePassword(_) => trace!("Unmounting password form"),
        }
    }
}

/// What the content region currently holds.
pub enum Content {
    Empty,
    Mounted {
        markup: Markup,
        style: StyleSheet,
    },
    Active {
        markup: Markup,
        style: StyleSheet,
        module: ActiveModule,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PanelMessage {
    Info(String),
    Success(String),
    Error(String),
}

/// Upload prompt for one record's folder.
pub struct UploadPanel {
    pub admission_code: String,
    pub folder: String,
    input: Inputter,
    pub last_input: InputResult,
    pub busy: bool,
    pub message: Option<PanelMessage>,
    pub url: Option<String>,
    events: Option<Receiver<UploadEvent>>,
}

pub struct FilesPopup {
    pub admission_code: String,
    /// `None` while the listing is still running.
    pub listing: Option<Result<FileListing, String>>,
    pending: Option<Receiver<Result<FileListing, FdError>>>,
}

/// Collaborators the shell talks to.
pub struct Services {
    pub identity: Box<dyn IdentityProvider>,
    pub profiles: Box<dyn ProfileStore>,
    pub records: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub assets: Arc<dyn AssetSource>,
}

pub struct Model {
    config: AppConfig,
    pub status: Status,
    modus: Modus,
    previous_modus: Modus,
    gate: Gatekeeper,
    identity: Option<Identity>,
    profile: Option<UserProfile>,
    loader: ModuleLoader,
    content: Content,
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    menu_selected: usize,
    upload: Option<UploadPanel>,
    detached_uploads: Vec<Receiver<UploadEvent>>,
    files: Option<FilesPopup>,
    popup_message: String,
    clipboard: Option<Clipboard>,
    dark_mode: bool,
    session_status: SessionStatus,
    last_status_refresh: Instant,
    status_message: String,
    last_status_message_update: Instant,
    exit_message: Option<String>,
}

impl Model {
    pub fn init(config: &AppConfig, services: Services, now: Instant, utc_now: DateTime<Utc>) -> Self {
        let Services {
            identity,
            profiles,
            records,
            objects,
            assets,
        } = services;
        let mut model = Self {
            config: config.clone(),
            status: Status::READY,
            modus: Modus::SHELL,
            previous_modus: Modus::SHELL,
            gate: Gatekeeper::new(config, identity, profiles, now),
            identity: None,
            profile: None,
            loader: ModuleLoader::new(config, assets),
            content: Content::Empty,
            records,
            objects,
            menu_selected: 0,
            upload: None,
            detached_uploads: Vec::new(),
            files: None,
            popup_message: String::new(),
            clipboard: None,
            dark_mode: false,
            session_status: SessionStatus::Connected,
            last_status_refresh: now,
            status_message: "Starting ...".to_string(),
            last_status_message_update: now,
            exit_message: None,
        };
        model.enter(now, utc_now);
        model
    }

    /// Gate the shell, resolve the profile and mount the records module.
    fn enter(&mut self, now: Instant, utc_now: DateTime<Utc>) {
        let identity = match self.gate.check(utc_now) {
            Ok(GateDecision::Admit(identity)) => identity,
            Ok(GateDecision::Redirect(message)) => return self.redirect(message),
            Err(e) => {
                if let Err(sign_out) = self.gate.sign_out() {
                    error!("Sign out failed: {sign_out}");
                }
                return self.redirect(Some(e.to_string()));
            }
        };
        self.gate.record_activity(now);

        match self.gate.load_profile(&identity) {
            Ok(profile) => {
                info!("Welcome {} ({})", profile.display_name, profile.role_badge());
                self.session_status = SessionStatus::from_last_login(profile.last_login, utc_now);
                self.profile = Some(profile);
                self.identity = Some(identity);
                self.load_module(ModuleKind::Records);
            }
            Err(e) => {
                let message = format!("Could not load the application: {e}. Contact the administrator.");
                self.content = Content::Error(message.clone());
                self.gate.schedule_sign_out(now, e.to_string());
                self.set_status_message(message);
            }
        }
    }

    fn redirect(&mut self, message: Option<String>) {
        if let Some(m) = &message {
            warn!("Leaving shell: {m}");
        }
        self.exit_message = message;
        self.status = Status::QUITTING;
    }

    pub fn quit(&mut self) {
        self.status = Status::QUITTING;
    }

    /// Message shown on the entry screen after leaving the shell.
    pub fn exit_message(&self) -> Option<&str> {
        self.exit_message.as_deref()
    }

    /// Tear down the active module and start loading `kind` into the content region.
    pub fn load_module(&mut self, kind: ModuleKind) {
        if let Content::Active { module, .. } = &mut self.content {
            debug!("Unloading {:?} for {kind:?}", module.kind());
            module.dispose();
        }
        self.content = Content::Empty;
        self.loader.load(kind.spec());
    }

    fn handle_loader_event(&mut self, event: LoaderEvent) {
        match event {
            LoaderEvent::Mount { markup, style, .. } => {
                self.content = Content::Mounted { markup, style };
            }
            LoaderEvent::Activate { kind, .. } => {
                let (markup, style) = match std::mem::replace(&mut self.content, Content::Empty) {
                    Content::Mounted { markup, style } => (markup, style),
                    _ => {
                        warn!("Module {kind:?} activated without mounted markup");
                        (Markup::default(), StyleSheet::default())
                    }
                };
                let module = self.build_module(kind);
                self.content = Content::Active { markup, style, module };
            }
            LoaderEvent::Failed { message, .. } => {
                self.content = Content::Error(format!("Could not load the content: {message}"));
            }
        }
    }

    fn build_module(&mut self, kind: ModuleKind) -> ActiveModule {
        let (uid, email) = self
            .identity
            .as_ref()
            .map(|i| (i.uid.clone(), i.email.clone()))
            .unwrap_or_default();
        let profile = self.profile.clone();
        match kind {
            ModuleKind::Records => {
                let caps = profile.map(|p| p.capabilities).unwrap_or_default();
                let mut engine =
                    RecordEngine::new(&self.config, &uid, caps, Local::now().date_naive());
                engine.mount(Arc::clone(&self.records));
                self.set_status_message("Loading records ...");
                ActiveModule::Records(Box::new(engine))
            }
            ModuleKind::PersonalData => ActiveModule::PersonalData(ProfileView {
                profile: profile.unwrap_or_else(|| UserProfile {
                    display_name: uid,
                    icon: crate::session::IconCategory::Other,
                    role_label: String::new(),
                    capabilities: Default::default(),
                    last_login: None,
                }),
                email,
            }),
            ModuleKind::ChangePassword => ActiveModule::ChangePassword(PasswordForm::new()),
        }
    }

    // -------------------- Accessors for the ui ---------------------- //

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn modus(&self) -> Modus {
        self.modus
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session_status
    }

    pub fn menu_selected(&self) -> usize {
        self.menu_selected
    }

    pub fn upload_panel(&self) -> Option<&UploadPanel> {
        self.upload.as_ref()
    }

    pub fn files_popup(&self) -> Option<&FilesPopup> {
        self.files.as_ref()
    }

    pub fn popup_message(&self) -> &str {
        &self.popup_message
    }

    pub fn dark_mode(&self) -> bool {
        self.dark_mode
    }

    /// The latest status message, until it goes stale.
    pub fn status_message(&self) -> &str {
        if self.last_status_message_update.elapsed() > STATUS_MESSAGE_TTL {
            ""
        } else {
            &self.status_message
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loader.is_busy() || self.engine().is_some_and(|e| e.is_loading())
    }

    pub fn header_date(&self) -> String {
        Local::now().format("%A, %-d %B %Y").to_string()
    }

    fn engine_mut(&mut self) -> Option<&mut RecordEngine> {
        match &mut self.content {
            Content::Active {
                module: ActiveModule::Records(engine),
                ..
            } => Some(&mut **engine),
            _ => None,
        }
    }

    fn password_form(&self) -> Option<&PasswordForm> {
        match &self.content {
            Content::Active {
                module: ActiveModule::ChangePassword(form),
                ..
            } => Some(form),
            _ => None,
        }
    }

    fn password_form_mut(&mut self) -> Option<&mut PasswordForm> {
        match &mut self.content {
            Content::Active {
                module: ActiveModule::ChangePassword(form),
                ..
            } => Some(form),
            _ => None,
        }
    }

    pub fn engine(&self) -> Option<&RecordEngine> {
        match &self.content {
            Content::Active {
                module: ActiveModule::Records(engine),
                ..
            } => Some(&**engine),
            _ => None,
        }
    }

    /// Which prompt, if any, is taking raw keys.
    pub fn cmd_mode(&self) -> Option<CMDMode> {
        if self.modus == Modus::UPLOAD {
            return Some(CMDMode::UploadPath);
        }
        if self.modus == Modus::SHELL
            && let Some(field) = self.password_form().and_then(|f| f.focus())
        {
            return Some(CMDMode::PasswordField(field));
        }
        if self.modus == Modus::SHELL {
            return self
                .engine()
                .and_then(|e| e.view().popover.as_ref().map(|(c, _)| CMDMode::ColumnFilter(*c)));
        }
        None
    }

    pub fn raw_keyevents(&self) -> bool {
        self.cmd_mode().is_some()
    }

    fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = message.into();
        self.last_status_message_update = Instant::now();
        debug!("Status: {}", self.status_message);
    }

    // -------------------- Update ---------------------- //

    pub fn update(&mut self, message: Option<Message>) -> Result<(), FdError> {
        if let Some(msg) = message {
            self.update_at(msg, Instant::now(), Utc::now());
        }
        Ok(())
    }

    pub fn update_at(&mut self, msg: Message, now: Instant, utc_now: DateTime<Utc>) {
        if let Message::Tick(at) = msg {
            return self.tick(at, utc_now);
        }
        if !matches!(msg, Message::Resize(_, _)) {
            self.gate.record_activity(now);
        }
        match self.modus {
            Modus::SHELL => self.update_shell(msg, now),
            Modus::MENU => match msg {
                Message::Quit => self.quit(),
                Message::MoveUp => self.menu_selected = self.menu_selected.saturating_sub(1),
                Message::MoveDown => {
                    self.menu_selected = std::cmp::min(self.menu_selected + 1, MenuItem::ALL.len() - 1)
                }
                Message::Enter => self.menu_action(MenuItem::ALL[self.menu_selected]),
                Message::Exit | Message::Menu => self.modus = Modus::SHELL,
                _ => (),
            },
            Modus::LOGOUT => match msg {
                Message::Enter => self.logout(),
                Message::Exit | Message::Quit => self.modus = Modus::SHELL,
                _ => (),
            },
            Modus::POPUP => match msg {
                Message::Quit => self.quit(),
                Message::Exit | Message::Enter | Message::Help => {
                    self.modus = self.previous_modus;
                    self.previous_modus = Modus::POPUP;
                }
                _ => (),
            },
            Modus::FILES => match msg {
                Message::Quit => self.quit(),
                Message::Exit | Message::Enter | Message::OpenFolder => {
                    // A listing still running is dropped with the popup.
                    self.files = None;
                    self.modus = Modus::SHELL;
                }
                _ => (),
            },
            Modus::UPLOAD => {
                if let Message::RawKey(key) = msg {
                    self.upload_key(key);
                }
            }
        }
    }

    fn update_shell(&mut self, msg: Message, now: Instant) {
        if self.password_form().is_some() {
            return self.update_password_form(msg);
        }
        match msg {
            Message::RawKey(_) => {}
            Message::Quit => return self.quit(),
            Message::Menu => {
                self.menu_selected = 0;
                self.modus = Modus::MENU;
                return;
            }
            Message::Help => return self.show_help(),
            Message::ToggleTheme => return self.toggle_theme(),
            Message::Resize(w, h) => {
                trace!("UI was resized to {w}x{h}");
                return;
            }
            _ => {}
        }
        let action = self.engine_mut().and_then(|e| e.update(&msg, now));
        if let Some(action) = action {
            self.engine_action(action);
        }
    }

    fn tick(&mut self, now: Instant, utc_now: DateTime<Utc>) {
        if let Some(GateDecision::Redirect(message)) = self.gate.tick(now) {
            return self.redirect(message);
        }

        let mounted = matches!(self.content, Content::Mounted { .. });
        for event in self.loader.poll(now, mounted) {
            self.handle_loader_event(event);
        }

        let fetched = self.engine_mut().and_then(|engine| {
            engine.tick(now);
            engine.poll_fetch()
        });
        match fetched {
            Some(Ok(count)) => self.set_status_message(format!("Loaded {count} records")),
            Some(Err(e)) => {
                if e.is_fatal() {
                    self.gate.schedule_sign_out(now, e.to_string());
                }
                self.set_status_message(format!("Error loading records: {e}"));
            }
            None => {}
        }
        self.drain_files_listing();
        self.drain_upload_events();
        self.drain_detached_uploads();

        if now.duration_since(self.last_status_refresh) >= self.config.status_refresh {
            self.last_status_refresh = now;
            self.session_status = SessionStatus::from_last_login(
                self.profile.as_ref().and_then(|p| p.last_login),
                utc_now,
            );
        }
    }

    fn engine_action(&mut self, action: EngineAction) {
        match action {
            EngineAction::Upload {
                folder,
                admission_code,
            } => {
                self.upload = Some(UploadPanel {
                    admission_code,
                    folder,
                    input: Inputter::default(),
                    last_input: InputResult::default(),
                    busy: false,
                    message: None,
                    url: None,
                    events: None,
                });
                self.modus = Modus::UPLOAD;
            }
            EngineAction::OpenFolder {
                folder,
                admission_code,
            } => {
                debug!("Listing {folder}");
                self.files = Some(FilesPopup {
                    admission_code,
                    listing: None,
                    pending: Some(spawn_list_files(Arc::clone(&self.objects), &folder)),
                });
                self.modus = Modus::FILES;
            }
            EngineAction::Copy(text) => self.copy_to_clipboard(text),
            EngineAction::Reload => {
                let store = Arc::clone(&self.records);
                if let Some(engine) = self.engine_mut() {
                    engine.reload(store);
                    self.set_status_message("Reloading records ...");
                }
            }
            EngineAction::Notify(message) => {
                warn!("{message}");
                self.set_status_message(message);
            }
        }
    }

    fn copy_to_clipboard(&mut self, text: String) {
        if self.clipboard.is_none() {
            match Clipboard::new() {
                Ok(c) => self.clipboard = Some(c),
                Err(e) => {
                    error!("Clipboard unavailable: {e:?}");
                    return self.set_status_message("Clipboard unavailable");
                }
            }
        }
        if let Some(clipboard) = self.clipboard.as_mut() {
            match clipboard.set_text(text.clone()) {
                Ok(_) => self.set_status_message(format!("Copied {text}")),
                Err(e) => {
                    error!("Error copying to clipboard: {e:?}");
                    self.set_status_message("Could not copy to clipboard");
                }
            }
        }
    }

    fn upload_key(&mut self, key: KeyEvent) {
        let Some(panel) = self.upload.as_mut() else {
            self.modus = Modus::SHELL;
            return;
        };
        let result = panel.input.read(key);
        panel.last_input = result.clone();
        if result.canceled || result.left_focus {
            if panel.busy
                && let Some(events) = panel.events.take()
            {
                info!("Upload panel closed while upload is running");
                self.detached_uploads.push(events);
            }
            self.upload = None;
            self.modus = Modus::SHELL;
        } else if result.finished {
            if panel.busy {
                // The control is disabled while an upload runs.
                panel.input.clear();
                panel.input.set(&result.input);
                return;
            }
            let source = PathBuf::from(shellexpand::tilde(result.input.trim()).as_ref());
            match spawn_upload(
                Arc::clone(&self.objects),
                &source,
                &panel.folder,
                &self.config.allowed_mime_types,
            ) {
                Ok(events) => {
                    panel.busy = true;
                    panel.url = None;
                    panel.message = Some(PanelMessage::Info("Uploading...".to_string()));
                    panel.events = Some(events);
                }
                Err(e) => {
                    warn!("Upload rejected: {e}");
                    panel.message = Some(PanelMessage::Error(e.to_string()));
                }
            }
            let text = result.input;
            panel.input.clear();
            panel.input.set(&text);
            panel.last_input = panel.input.get();
        }
    }

    fn drain_upload_events(&mut self) {
        let Some(panel) = self.upload.as_mut() else {
            return;
        };
        let Some(rx) = &panel.events else { return };
        let events: Vec<UploadEvent> = rx.try_iter().collect();
        for event in events {
            match event {
                UploadEvent::Progress(pct) => {
                    panel.message = Some(PanelMessage::Info(format!("Uploading: {pct}%")));
                }
                UploadEvent::Done(url) => {
                    panel.busy = false;
                    panel.events = None;
                    panel.message = Some(PanelMessage::Success("File uploaded successfully!".into()));
                    panel.url = Some(url);
                    panel.input.clear();
                    panel.last_input = panel.input.get();
                }
                UploadEvent::Failed(message) => {
                    panel.busy = false;
                    panel.events = None;
                    panel.message = Some(PanelMessage::Error(format!("Upload failed: {message}")));
                }
            }
        }
    }

    /// Report uploads whose panel was closed while they ran.
    fn drain_detached_uploads(&mut self) {
        let mut outcomes = Vec::new();
        self.detached_uploads.retain(|rx| loop {
            match rx.try_recv() {
                Ok(UploadEvent::Progress(_)) => continue,
                Ok(UploadEvent::Done(url)) => {
                    outcomes.push(format!("File uploaded successfully: {url}"));
                    break false;
                }
                Ok(UploadEvent::Failed(message)) => {
                    outcomes.push(format!("Upload failed: {message}"));
                    break false;
                }
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Disconnected) => {
                    outcomes.push("Upload ended without a result".to_string());
                    break false;
                }
            }
        });
        for message in outcomes {
            info!("{message}");
            self.set_status_message(message);
        }
    }

    fn drain_files_listing(&mut self) {
        let Some(files) = self.files.as_mut() else {
            return;
        };
        let Some(rx) = &files.pending else { return };
        let listing = match rx.try_recv() {
            Ok(listing) => listing,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => {
                Err(FdError::Storage("listing ended without a result".to_string()))
            }
        };
        files.pending = None;
        files.listing = Some(listing.map_err(|e| {
            error!("Listing {} failed: {e}", files.admission_code);
            e.to_string()
        }));
    }

    fn update_password_form(&mut self, msg: Message) {
        let Some(form) = self.password_form_mut() else {
            return;
        };
        match msg {
            Message::RawKey(key) => {
                if let Some(change) = form.read(key) {
                    let result = self.gate.change_password(&change.current, &change.new);
                    if let Err(e) = &result {
                        warn!("Password change failed: {e}");
                    }
                    if let Some(form) = self.password_form_mut() {
                        form.finish(result);
                    }
                }
            }
            Message::Enter => form.take_focus(),
            Message::Quit => self.quit(),
            Message::Menu => {
                self.menu_selected = 0;
                self.modus = Modus::MENU;
            }
            Message::Help => self.show_help(),
            Message::ToggleTheme => self.toggle_theme(),
            _ => {}
        }
    }

    fn menu_action(&mut self, item: MenuItem) {
        self.modus = Modus::SHELL;
        match item {
            MenuItem::Records => self.load_module(ModuleKind::Records),
            MenuItem::PersonalData => self.load_module(ModuleKind::PersonalData),
            MenuItem::ChangePassword => self.load_module(ModuleKind::ChangePassword),
            MenuItem::ToggleTheme => self.toggle_theme(),
            MenuItem::Logout => self.modus = Modus::LOGOUT,
        }
    }

    fn logout(&mut self) {
        match self.gate.sign_out() {
            Ok(()) => {
                if let Content::Active { module, .. } = &mut self.content {
                    module.dispose();
                }
                self.loader.cancel();
                self.redirect(None);
            }
            Err(e) => {
                error!("Error signing out: {e}");
                self.modus = Modus::SHELL;
                self.set_status_message(format!("Error signing out: {e}"));
            }
        }
    }

    fn toggle_theme(&mut self) {
        self.dark_mode = !self.dark_mode;
    }

    fn show_help(&mut self) {
        self.previous_modus = self.modus;
        self.modus = Modus::POPUP;
        self.popup_message = HELP_TEXT.to_string();
    }
}
