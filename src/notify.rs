//! Milestone notifications.
//!
//! A long-running collection is mostly silent; the few events an operator
//! cares about (a new archive appeared, the retry backlog drained, a domain
//! finished an archive, an archive could not be processed) are sent through a
//! [`Notifier`]. Notifications go to **stderr** so stdout stays parseable.

use std::io::Write;

/// An event worth telling the operator about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Milestone {
    /// The catalog listed an archive that was not known before.
    NewArchive { archive_id: String },
    /// A successful retry emptied the retry ledger.
    BacklogCleared,
    /// Every record of a domain in an archive has been fetched.
    DomainCompleted { domain: String, archive_id: String },
    /// An archive failed in a way that is not retried automatically.
    ArchiveFailed {
        domain: String,
        archive_id: String,
        reason: String,
    },
}

/// Receives milestones. Implementations write to stderr (human or JSON).
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Milestone);
}

/// Human-friendly lines on stderr: "new archive: CC-MAIN-2024-10".
pub struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, event: Milestone) {
        let line = match &event {
            Milestone::NewArchive { archive_id } => format!("new archive: {}\n", archive_id),
            Milestone::BacklogCleared => "retry backlog cleared\n".to_string(),
            Milestone::DomainCompleted { domain, archive_id } => {
                format!("{} complete in {}\n", domain, archive_id)
            }
            Milestone::ArchiveFailed {
                domain,
                archive_id,
                reason,
            } => format!("{} failed in {}: {}\n", domain, archive_id, reason),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable notifications: one JSON object per line on stderr.
pub struct JsonNotifier;

impl Notifier for JsonNotifier {
    fn notify(&self, event: Milestone) {
        let obj = milestone_json(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn milestone_json(event: &Milestone) -> serde_json::Value {
    match event {
        Milestone::NewArchive { archive_id } => serde_json::json!({
            "event": "new_archive",
            "archive": archive_id
        }),
        Milestone::BacklogCleared => serde_json::json!({
            "event": "backlog_cleared"
        }),
        Milestone::DomainCompleted { domain, archive_id } => serde_json::json!({
            "event": "domain_completed",
            "domain": domain,
            "archive": archive_id
        }),
        Milestone::ArchiveFailed {
            domain,
            archive_id,
            reason,
        } => serde_json::json!({
            "event": "archive_failed",
            "domain": domain,
            "archive": archive_id,
            "reason": reason
        }),
    }
}

/// No-op notifier when notifications are disabled.
pub struct NoNotifier;

impl Notifier for NoNotifier {
    fn notify(&self, _event: Milestone) {}
}

/// Notification mode: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyMode {
    Off,
    Human,
    Json,
}

impl NotifyMode {
    /// Human notifications when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            NotifyMode::Human
        } else {
            NotifyMode::Off
        }
    }

    /// Parse the `logging.notify` setting (`auto`, `human`, `json`, `off`).
    pub fn from_setting(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::default_for_tty()),
            "human" => Some(NotifyMode::Human),
            "json" => Some(NotifyMode::Json),
            "off" => Some(NotifyMode::Off),
            _ => None,
        }
    }

    pub fn notifier(&self) -> Box<dyn Notifier> {
        match self {
            NotifyMode::Off => Box::new(NoNotifier),
            NotifyMode::Human => Box::new(StderrNotifier),
            NotifyMode::Json => Box::new(JsonNotifier),
        }
    }
}

/// Thousands separators for counts in human output: `1234567` → `1,234,567`.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}
