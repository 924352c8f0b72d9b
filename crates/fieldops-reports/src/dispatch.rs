use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use fieldops_core::Report;
use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::ReportError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid mail address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: AddressError,
    },
    #[error("building message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp transport: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("send to {recipient} rejected: {reason}")]
    Rejected { recipient: String, reason: String },
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, html_body: &str)
        -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Implicit relay TLS. Off means plaintext, for local catch-all servers.
    pub tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            username: None,
            password: None,
            tls: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    pub from: String,
    pub recipients: Vec<String>,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig, from: &str) -> Result<Self, DeliveryError> {
        let mut builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?.port(config.port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port)
        };

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from: parse_mailbox(from)?,
        })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address.parse().map_err(|source| DeliveryError::Address {
        address: address.to_string(),
        source,
    })
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<(), DeliveryError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(recipient)?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())?;

        let response = self.transport.send(email).await?;
        if !response.is_positive() {
            return Err(DeliveryError::Rejected {
                recipient: recipient.to_string(),
                reason: response.message().collect::<Vec<_>>().join(" "),
            });
        }
        Ok(())
    }
}

#[derive(Template)]
#[template(path = "report_email.html")]
struct ReportEmail<'a> {
    kind: &'a str,
    start: String,
    end: String,
    agent_count: usize,
    rows: Vec<EmailRow<'a>>,
}

struct EmailRow<'a> {
    cce_id: &'a str,
    name: &'a str,
    missed_calls: u64,
    completed_shoots: u64,
    attended_calls: u64,
    total_talk_time: u64,
    avg_talk_time: String,
}

pub fn subject_for(report: &Report) -> String {
    format!(
        "{} Report: {} to {}",
        report.report_type,
        report.start_date.format("%Y-%m-%d"),
        report.end_date.format("%Y-%m-%d")
    )
}

pub fn render_body(report: &Report) -> Result<String, askama::Error> {
    let rows = report
        .cce_reports
        .values()
        .map(|r| EmailRow {
            cce_id: &r.cce_id,
            name: &r.name,
            missed_calls: r.missed_calls,
            completed_shoots: r.completed_shoots,
            attended_calls: r.attended_calls,
            total_talk_time: r.total_talk_time,
            avg_talk_time: format!("{:.1}", r.avg_talk_time),
        })
        .collect();

    ReportEmail {
        kind: report.report_type.as_str(),
        start: report.start_date.format("%Y-%m-%d").to_string(),
        end: report.end_date.format("%Y-%m-%d").to_string(),
        agent_count: report.cce_reports.len(),
        rows,
    }
    .render()
}

/// Renders a finished report and mails it to every configured recipient.
pub struct ReportDispatcher {
    mailer: Option<Arc<dyn Mailer>>,
    settings: MailSettings,
}

impl ReportDispatcher {
    pub fn new(mailer: Arc<dyn Mailer>, settings: MailSettings) -> Self {
        Self {
            mailer: Some(mailer),
            settings,
        }
    }

    /// Dispatcher for deployments without outbound mail. Reports are still
    /// rendered, then dropped with a warning.
    pub fn disabled() -> Self {
        Self {
            mailer: None,
            settings: MailSettings::default(),
        }
    }

    /// One send per recipient; the first failure aborts the rest. No retry.
    pub async fn dispatch(&self, report: &Report) -> Result<(), ReportError> {
        let subject = subject_for(report);
        let body = render_body(report)?;

        let mailer = match &self.mailer {
            Some(mailer) if !self.settings.recipients.is_empty() => mailer,
            _ => {
                warn!(report_id = %report.id, "report mail not configured; skipping dispatch");
                return Ok(());
            }
        };

        for recipient in &self.settings.recipients {
            mailer.send(recipient, &subject, &body).await?;
        }
        info!(
            report_id = %report.id,
            kind = %report.report_type,
            from = %self.settings.from,
            recipients = self.settings.recipients.len(),
            "report mailed"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fieldops_core::{AgentReport, Cce, ReportKind};
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Captures every send; fails for recipients listed in `reject`.
    #[derive(Default)]
    pub(crate) struct RecordingMailer {
        pub sent: Mutex<Vec<(String, String, String)>>,
        pub reject: Vec<String>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(
            &self,
            recipient: &str,
            subject: &str,
            html_body: &str,
        ) -> Result<(), DeliveryError> {
            if self.reject.iter().any(|r| r == recipient) {
                return Err(DeliveryError::Rejected {
                    recipient: recipient.to_string(),
                    reason: "mailbox unavailable".into(),
                });
            }
            self.sent.lock().await.push((
                recipient.to_string(),
                subject.to_string(),
                html_body.to_string(),
            ));
            Ok(())
        }
    }

    fn sample_report() -> Report {
        let mut alice = AgentReport::seeded(&Cce {
            id: "A1".into(),
            name: "Alice <Ops>".into(),
        });
        alice.attended_calls = 2;
        alice.total_talk_time = 125;
        alice.finalize();
        let bob = AgentReport::seeded(&Cce {
            id: "B2".into(),
            name: "Bob".into(),
        });
        Report {
            id: Uuid::new_v4(),
            report_type: ReportKind::Weekly,
            start_date: Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap(),
            created_at: Utc.with_ymd_and_hms(2024, 6, 10, 2, 0, 0).unwrap(),
            cce_reports: BTreeMap::from([("A1".to_string(), alice), ("B2".to_string(), bob)]),
        }
    }

    #[test]
    fn subject_embeds_kind_and_dates() {
        assert_eq!(
            subject_for(&sample_report()),
            "weekly Report: 2024-06-03 to 2024-06-10"
        );
    }

    #[test]
    fn body_lists_agents_and_escapes_names() {
        let body = render_body(&sample_report()).unwrap();
        assert!(body.contains("Total CCEs: 2"));
        assert!(body.contains("Period: 2024-06-03 to 2024-06-10"));
        assert!(body.contains("<td>62.5</td>"));
        assert!(body.contains("Alice &lt;Ops&gt;"));
    }

    #[tokio::test]
    async fn dispatch_sends_once_per_recipient() {
        let mailer = Arc::new(RecordingMailer::default());
        let dispatcher = ReportDispatcher::new(
            mailer.clone(),
            MailSettings {
                from: "reports@example.com".into(),
                recipients: vec!["ops@example.com".into(), "lead@example.com".into()],
            },
        );
        dispatcher.dispatch(&sample_report()).await.unwrap();

        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "ops@example.com");
        assert_eq!(sent[1].1, "weekly Report: 2024-06-03 to 2024-06-10");
    }

    #[tokio::test]
    async fn first_rejection_aborts_remaining_sends() {
        let mailer = Arc::new(RecordingMailer {
            reject: vec!["ops@example.com".into()],
            ..Default::default()
        });
        let dispatcher = ReportDispatcher::new(
            mailer.clone(),
            MailSettings {
                from: "reports@example.com".into(),
                recipients: vec!["ops@example.com".into(), "lead@example.com".into()],
            },
        );
        let err = dispatcher.dispatch(&sample_report()).await.unwrap_err();
        assert!(matches!(err, ReportError::Delivery(DeliveryError::Rejected { .. })));
        assert!(mailer.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_dispatcher_renders_but_sends_nothing() {
        assert!(ReportDispatcher::disabled()
            .dispatch(&sample_report())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn smtp_mailer_rejects_bad_sender() {
        let config = SmtpConfig {
            host: "localhost".into(),
            port: 2525,
            tls: false,
            ..Default::default()
        };
        assert!(matches!(
            SmtpMailer::new(&config, "not an address"),
            Err(DeliveryError::Address { .. })
        ));
        assert!(SmtpMailer::new(&config, "reports@example.com").is_ok());
    }
}
