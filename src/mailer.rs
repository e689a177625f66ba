use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message as Email, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::broadcast::{Broadcaster, Message};
use crate::status::{UpsState, UpsStatus};

// Keep a slow relay from holding up the poll cycle for long.
const SMTP_TIMEOUT: u64 = 10;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MailerSettings {
    pub user: String,
    pub pass: String,
    pub relay: String,
    pub from: String,
    pub to: Vec<String>,
    /// Prefixed to every subject, defaults to this machine's host name.
    pub machine_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("invalid mail address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("mailer needs at least one recipient")]
    NoRecipients,
    #[error("invalid smtp relay: {0}")]
    Relay(#[from] lettre::transport::smtp::Error),
}

/// Mails ups status changes. Snapshots are ignored.
pub struct Mailer {
    from: Mailbox,
    vec_to: Vec<Mailbox>,
    machine_id: String,
    relay: SmtpTransport,
}

impl Mailer {
    pub fn new(settings: MailerSettings) -> Result<Mailer, MailerError> {
        if settings.to.is_empty() {
            return Err(MailerError::NoRecipients);
        }

        let from = parse_mailbox(&settings.from)?;
        let vec_to = settings
            .to
            .iter()
            .map(|to| parse_mailbox(to))
            .collect::<Result<Vec<_>, _>>()?;

        let machine_id = settings.machine_id.unwrap_or_else(|| {
            hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "ups".to_string())
        });

        let relay = SmtpTransport::relay(&settings.relay)?
            .credentials(Credentials::new(settings.user, settings.pass))
            .timeout(Some(Duration::from_secs(SMTP_TIMEOUT)))
            .build();

        Ok(Mailer {
            from,
            vec_to,
            machine_id,
            relay,
        })
    }

    pub fn compose(&self, state: &UpsState) -> Result<Email, lettre::error::Error> {
        let mut builder = Email::builder().from(self.from.clone());
        for to in &self.vec_to {
            builder = builder.to(to.clone())
        }
        builder
            .subject(format!("{}: {}", self.machine_id, subject_for(state)))
            .body(describe(state))
    }

    fn send(&self, state: &UpsState) {
        let email = match self.compose(state) {
            Ok(email) => email,
            Err(e) => {
                warn!(error = %e, "Failed to build email");
                return;
            }
        };

        match self.relay.send(&email) {
            Ok(_) => info!(subject = subject_for(state), "Sent status change email"),
            Err(e) => warn!(error = %e, "Failed to send email"),
        }
    }
}

impl Broadcaster for Mailer {
    fn publish(&self, message: &Message) {
        if let Message::Transition { state, .. } = message {
            self.send(state);
        }
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailerError> {
    address.parse().map_err(|source| MailerError::Address {
        address: address.to_string(),
        source,
    })
}

pub fn subject_for(state: &UpsState) -> &'static str {
    match state.status {
        UpsStatus::OnBattery => "UPS on battery.",
        UpsStatus::Online => "UPS back on line power.",
        UpsStatus::Unknown => "UPS status unknown.",
    }
}

fn describe(state: &UpsState) -> String {
    let mut body = format!("Status: {}\n", subject_for(state));
    if state.charge >= 0 {
        body.push_str(&format!("Charge: {}%\n", state.charge));
    }
    if state.runtime >= 0 {
        let minutes = (state.runtime + 30) / 60;
        body.push_str(&format!("Remaining: {:02}:{:02}h\n", minutes / 60, minutes % 60));
    }
    body
}
