use super::{Assessment, ChangeStatus};
use crate::contracts::{ToolError, ToolResult};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::collections::BTreeMap;

/// # NDOC
/// component: `subsystems::change_tracking::notifications`
/// purpose: Email dispatch surface, generalized from `tools::email_sender_tool::EmailSenderTool`
///   into a trait so the checkpoint engine can inject a fake in tests instead of touching SMTP.
pub trait NotificationDispatcher: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> ToolResult<()>;
}

/// # NDOC
/// component: `subsystems::change_tracking::notifications`
/// purpose: `lettre`-backed dispatcher, same credential shape and `SmtpTransport::relay` call as
///   `EmailSenderTool`, parameterized instead of reading `env::var` directly so the engine's own
///   `config::EngineConfig` is the single source of truth for SMTP settings.
pub struct SmtpNotificationDispatcher {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl SmtpNotificationDispatcher {
    pub fn new(host: String, port: u16, username: String, password: String) -> Self {
        Self {
            host,
            port,
            username,
            password,
        }
    }
}

impl NotificationDispatcher for SmtpNotificationDispatcher {
    fn send(&self, to: &str, subject: &str, body: &str) -> ToolResult<()> {
        let email = Message::builder()
            .from(
                self.username
                    .parse()
                    .map_err(|err| ToolError::configuration(format!("invalid from address: {err}")))?,
            )
            .to(to
                .parse()
                .map_err(|err| ToolError::validation(format!("invalid recipient address: {err}")))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|err| ToolError::internal(format!("failed to build notification email: {err}")))?;

        let credentials = Credentials::new(self.username.clone(), self.password.clone());
        let mailer = SmtpTransport::relay(&self.host)
            .map_err(|err| ToolError::configuration(format!("invalid smtp host: {err}")))?
            .port(self.port)
            .credentials(credentials)
            .build();

        mailer
            .send(&email)
            .map_err(|err| ToolError::provider(format!("smtp send failed: {err}"), true))?;
        Ok(())
    }
}

/// # NDOC
/// component: `subsystems::change_tracking::notifications`
/// purpose: One change's terminal-status line item, ready to be folded into a batch email.
#[derive(Debug, Clone)]
pub struct TerminalStatusEntry {
    pub change_id: String,
    pub page_url: String,
    pub element: String,
    pub status: ChangeStatus,
    pub assessment: Option<Assessment>,
    pub horizon_days: u32,
    pub reasoning: String,
}

/// # NDOC
/// component: `subsystems::change_tracking::notifications`
/// purpose: Coalesces `validated` transitions observed during one checkpoint batch run into a
///   single email per user, per spec.md §4.5/§6: a user who owns five changes that all validate
///   on the same run gets one message, not five.
/// invariants:
///   - Only `validated` transitions are notification-worthy — spec.md §6 names exactly one
///     terminal-status email kind ("correlation unlocked"), not one per possible status.
///   - Keyed by `change_id` within a user: a change that validates twice in one run (D+30 then
///     reconfirmed at D+60) overwrites its own pending entry rather than queuing twice.
///   - If a later horizon in the same run flips a change away from `validated`, the pending entry
///     is dropped rather than replaced, per spec.md §4.5 "Terminal-status notification coalescing".
#[derive(Default)]
pub struct NotificationBatch {
    entries_by_user: BTreeMap<String, BTreeMap<String, TerminalStatusEntry>>,
}

impl NotificationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues or replaces a pending `validated` entry for `entry.change_id`. Any other status is
    /// ignored here — use `cancel` when a later horizon reverses a prior validation.
    pub fn push(&mut self, user_id: &str, entry: TerminalStatusEntry) {
        if entry.status != ChangeStatus::Validated {
            return;
        }
        self.entries_by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(entry.change_id.clone(), entry);
    }

    /// Drops any pending entry for `change_id` under `user_id`, if one was queued earlier in this
    /// run. A no-op if the change never queued a `validated` entry.
    pub fn cancel(&mut self, user_id: &str, change_id: &str) {
        if let Some(entries) = self.entries_by_user.get_mut(user_id) {
            entries.remove(change_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries_by_user.values().all(|entries| entries.is_empty())
    }

    /// Sends one coalesced email per user with a pending entry. `recipient_for_user` resolves a
    /// user id to an email address; a user with no resolvable address is skipped rather than
    /// failing the whole batch.
    pub fn dispatch(
        &self,
        dispatcher: &dyn NotificationDispatcher,
        recipient_for_user: impl Fn(&str) -> Option<String>,
    ) -> ToolResult<usize> {
        let mut sent = 0;
        for (user_id, entries) in &self.entries_by_user {
            if entries.is_empty() {
                continue;
            }
            let Some(to) = recipient_for_user(user_id) else {
                continue;
            };
            let entries: Vec<TerminalStatusEntry> = entries.values().cloned().collect();
            let subject = format!(
                "{} page change{} validated",
                entries.len(),
                if entries.len() == 1 { "" } else { "s" }
            );
            let body = render_digest_body(&entries);
            dispatcher.send(&to, &subject, &body)?;
            sent += 1;
        }
        Ok(sent)
    }
}

fn render_digest_body(entries: &[TerminalStatusEntry]) -> String {
    let mut lines = Vec::with_capacity(entries.len());
    for entry in entries {
        let assessment_text = entry
            .assessment
            .map(|a| format!("{a:?}"))
            .unwrap_or_else(|| "n/a".to_string());
        lines.push(format!(
            "- {} on {}: {:?} at day {} ({}) — {}",
            entry.element,
            entry.page_url,
            entry.status,
            entry.horizon_days,
            assessment_text,
            entry.reasoning
        ));
    }
    lines.join("\n")
}
