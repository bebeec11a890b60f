use std::path::PathBuf;
use std::time::{Duration, Instant};

use derive_setters::Setters;
use polars::error::PolarsError;
use ratatui::crossterm::event::KeyEvent;
use thiserror::Error;

pub const HELP_TEXT: &str = "\
Records
  ↑/k ↓/j     select row
  ←/h →/l     select column
  n / p       next / previous page
  [ / ]       previous / next year
  { / }       previous / next month
  1..9        toggle status facet
  s           cycle through status facets
  /           filter selected column (Enter commit, Esc cancel, Tab leave)
  x           clear filter of selected column
  < / >       narrow / widen selected column
  u           upload file for selected record
  o           open folder of selected record
  c           copy admission code
  r           reload records

Shell
  m           user menu
  t           toggle dark / light theme
  ?           this help
  Esc         close popup
  q           quit";

/// Column headers of the records table, in rendering order.
pub const RECORD_COLUMNS: [&str; 5] = ["Source", "Admission", "Patient", "Surgery date", "Status"];

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Quit,
    Tick(Instant),
    Resize(usize, usize),
    RawKey(KeyEvent),
    MoveUp,
    MoveDown,
    MoveLeft,
    MoveRight,
    NextPage,
    PrevPage,
    NextYear,
    PrevYear,
    NextMonth,
    PrevMonth,
    ToggleStatus(usize),
    CycleStatus,
    FilterColumn,
    ClearColumnFilter,
    WidenColumn,
    NarrowColumn,
    Upload,
    OpenFolder,
    CopyCell,
    Reload,
    Menu,
    ToggleTheme,
    Help,
    Enter,
    Exit,
}

/// Raw-input prompts the status line can host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CMDMode {
    ColumnFilter(usize),
    UploadPath,
    PasswordField(usize),
}

#[derive(Debug, Clone, Setters)]
#[setters(prefix = "with_")]
pub struct AppConfig {
    pub event_poll_time: u64,
    pub page_size: usize,
    pub session_window: Duration,
    pub inactivity_window: Duration,
    pub forced_sign_out_delay: Duration,
    pub filter_debounce: Duration,
    pub loader_max_attempts: usize,
    pub loader_retry_interval: Duration,
    pub status_refresh: Duration,
    pub min_column_width: u16,
    pub max_column_width: u16,
    pub allowed_mime_types: Vec<String>,
    pub data_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub storage_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            event_poll_time: 100,
            page_size: 10,
            session_window: Duration::from_secs(5 * 60 * 60),
            inactivity_window: Duration::from_secs(5 * 60 * 60),
            forced_sign_out_delay: Duration::from_secs(3),
            filter_debounce: Duration::from_millis(300),
            loader_max_attempts: 100,
            loader_retry_interval: Duration::from_millis(10),
            status_refresh: Duration::from_secs(60),
            min_column_width: 5,
            max_column_width: 50,
            allowed_mime_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "application/pdf".to_string(),
            ],
            data_dir: PathBuf::from("data"),
            assets_dir: PathBuf::from("assets"),
            storage_dir: PathBuf::from("storage"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FdError {
    /// Session missing, expired or rejected by the identity service.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Module assets could not be fetched or mounted.
    #[error("could not load module: {0}")]
    Load(String),

    /// Record or profile query failed.
    #[error("could not load data: {0}")]
    Data(String),

    /// User input rejected before any call was made.
    #[error("{0}")]
    Validation(String),

    /// Upload failed; the message is the store's own.
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl FdError {
    /// Errors that end the session instead of being shown inline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FdError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_allows_only_images_and_pdf() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.allowed_mime_types.len(), 3);
        assert!(!cfg.allowed_mime_types.iter().any(|m| m == "text/plain"));
    }

    #[test]
    fn setters_override_defaults() {
        let cfg = AppConfig::default().with_page_size(25).with_event_poll_time(50);
        assert_eq!(cfg.page_size, 25);
        assert_eq!(cfg.event_poll_time, 50);
    }

    #[test]
    fn only_auth_errors_are_fatal() {
        assert!(FdError::Auth("expired".into()).is_fatal());
        assert!(!FdError::Data("offline".into()).is_fatal());
        assert!(!FdError::Validation("bad type".into()).is_fatal());
    }
}
