use ratatui::crossterm::event::KeyEvent;
use tracing::{debug, info};

use crate::domain::FdError;
use crate::inputter::{InputResult, Inputter};
use crate::model::PanelMessage;
use crate::session::validate_password_change;

pub const PASSWORD_FIELDS: [&str; 3] = ["Current password", "New password", "Confirm new password"];

/// The three fields of a submitted form.
#[derive(Debug, Clone, PartialEq)]
pub struct PasswordChange {
    pub current: String,
    pub new: String,
}

/// Change-password module: three masked inputs and an inline message.
#[derive(Default)]
pub struct PasswordForm {
    inputs: [Inputter; 3],
    last: [InputResult; 3],
    focus: Option<usize>,
    message: Option<PanelMessage>,
}

impl PasswordForm {
    pub fn new() -> Self {
        Self {
            focus: Some(0),
            ..Default::default()
        }
    }

    pub fn focus(&self) -> Option<usize> {
        self.focus
    }

    /// Take the keyboard again, starting at the first empty field.
    pub fn take_focus(&mut self) {
        let first_empty = self.last.iter().position(|r| r.input.is_empty()).unwrap_or(0);
        self.focus = Some(first_empty);
    }

    pub fn message(&self) -> Option<&PanelMessage> {
        self.message.as_ref()
    }

    /// The field text as shown, one mask character per typed character.
    pub fn masked(&self, field: usize) -> String {
        "•".repeat(self.last[field].input.chars().count())
    }

    pub fn curser_pos(&self, field: usize) -> usize {
        self.last[field].curser_pos
    }

    /// Feed a key to the focused field. Returns a change once the form is
    /// submitted and passes validation.
    pub fn read(&mut self, key: KeyEvent) -> Option<PasswordChange> {
        let field = self.focus?;
        let result = self.inputs[field].read(key);
        self.last[field] = result.clone();
        if result.canceled {
            self.rearm(field);
            self.focus = None;
            return None;
        }
        if result.left_focus || (result.finished && field + 1 < PASSWORD_FIELDS.len()) {
            self.rearm(field);
            self.focus = Some((field + 1) % PASSWORD_FIELDS.len());
            return None;
        }
        if !result.finished {
            return None;
        }
        self.rearm(field);
        let [current, new, confirm] = [0, 1, 2].map(|i| self.last[i].input.clone());
        match validate_password_change(&current, &new, &confirm) {
            Ok(()) => Some(PasswordChange { current, new }),
            Err(e) => {
                debug!("Password form rejected: {e}");
                self.message = Some(PanelMessage::Error(e.to_string()));
                None
            }
        }
    }

    /// Show the outcome of a submitted change.
    pub fn finish(&mut self, result: Result<(), FdError>) {
        match result {
            Ok(()) => {
                info!("Password updated");
                for input in self.inputs.iter_mut() {
                    input.clear();
                }
                self.last = Default::default();
                self.focus = None;
                self.message = Some(PanelMessage::Success("Password updated successfully.".into()));
            }
            Err(e) => {
                self.message = Some(PanelMessage::Error(e.to_string()));
                self.focus = Some(0);
            }
        }
    }

    /// Drop the one-shot key flags, keeping the text.
    fn rearm(&mut self, field: usize) {
        let text = self.last[field].input.clone();
        self.inputs[field].clear();
        self.inputs[field].set(&text);
        self.last[field] = self.inputs[field].get();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputter::tests::key;
    use ratatui::crossterm::event::KeyCode;

    fn type_text(form: &mut PasswordForm, text: &str) -> Option<PasswordChange> {
        for c in text.chars() {
            form.read(key(KeyCode::Char(c)));
        }
        form.read(key(KeyCode::Enter))
    }

    #[test]
    fn enter_moves_through_fields_then_submits() {
        let mut form = PasswordForm::new();
        assert_eq!(type_text(&mut form, "old-pass"), None);
        assert_eq!(form.focus(), Some(1));
        assert_eq!(type_text(&mut form, "new-pass"), None);
        assert_eq!(form.masked(1), "••••••••");
        assert_eq!(
            type_text(&mut form, "new-pass"),
            Some(PasswordChange {
                current: "old-pass".into(),
                new: "new-pass".into()
            })
        );
    }

    #[test]
    fn mismatch_is_reported_inline() {
        let mut form = PasswordForm::new();
        type_text(&mut form, "old-pass");
        type_text(&mut form, "new-pass");
        assert_eq!(type_text(&mut form, "other-pass"), None);
        assert!(matches!(form.message(), Some(PanelMessage::Error(m)) if m.contains("match")));
    }

    #[test]
    fn escape_releases_focus_and_success_clears() {
        let mut form = PasswordForm::new();
        type_text(&mut form, "old-pass");
        form.read(key(KeyCode::Esc));
        assert_eq!(form.focus(), None);
        assert_eq!(form.read(key(KeyCode::Char('x'))), None);

        form.take_focus();
        assert_eq!(form.focus(), Some(1));
        form.finish(Ok(()));
        assert_eq!(form.masked(0), "");
        assert!(matches!(form.message(), Some(PanelMessage::Success(_))));
    }
}
