use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use fieldops_reports::{MailSettings, ScheduleConfig, SmtpConfig};
use fieldops_storage::PgStoreConfig;
use fieldops_web::{AuthConfig, ServerConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown store backend {other:?} (expected postgres or memory)"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub postgres: PgStoreConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub smtp: SmtpConfig,
    pub mail: MailSettings,
    pub schedule: ScheduleConfig,
}

impl AppConfig {
    /// YAML file (missing file means defaults), then process environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("DATABASE_URL") {
            self.store.postgres.url = v;
        }
        if let Some(v) = get("FIELDOPS_STORE") {
            self.store.backend = v.parse()?;
        }
        if let Some(v) = get("FIELDOPS_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("FIELDOPS_PORT") {
            self.server.port = parse_var("FIELDOPS_PORT", &v)?;
        }
        if let Some(v) = get("FIELDOPS_JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = get("SMTP_HOST") {
            self.smtp.host = v;
        }
        if let Some(v) = get("SMTP_PORT") {
            self.smtp.port = parse_var("SMTP_PORT", &v)?;
        }
        if let Some(v) = get("SMTP_USERNAME") {
            self.smtp.username = Some(v);
        }
        if let Some(v) = get("SMTP_PASSWORD") {
            self.smtp.password = Some(v);
        }
        if let Some(v) = get("REPORT_MAIL_FROM") {
            self.mail.from = v;
        }
        if let Some(v) = get("REPORT_MAIL_TO") {
            self.mail.recipients = v
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("FIELDOPS_SCHEDULER_ENABLED") {
            self.schedule.enabled = matches!(v.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = get("REPORT_CRON_DAILY") {
            self.schedule.daily = v;
        }
        if let Some(v) = get("REPORT_CRON_WEEKLY") {
            self.schedule.weekly = v;
        }
        if let Some(v) = get("REPORT_CRON_MONTHLY") {
            self.schedule.monthly = v;
        }
        if let Some(v) = get("REPORT_RUN_TIMEOUT_SECS") {
            self.schedule.run_timeout_secs = parse_var("REPORT_RUN_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    /// Settings needed to run the API server.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if self.auth.jwt_secret.trim().is_empty() {
            bail!("auth.jwt_secret is empty (set FIELDOPS_JWT_SECRET)");
        }
        if self.schedule.enabled {
            self.validate_mail()?;
        }
        Ok(())
    }

    /// Settings needed for a one-off report run. A fresh in-memory store has no
    /// agents, so only Postgres makes sense here. Mail is optional.
    pub fn validate_report(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Memory {
            bail!("report needs the postgres store; the memory store starts empty");
        }
        Ok(())
    }

    /// Settings needed to mail a report.
    pub fn validate_mail(&self) -> Result<()> {
        if self.smtp.host.trim().is_empty() {
            bail!("smtp.host is required to send reports (set SMTP_HOST)");
        }
        if self.mail.from.trim().is_empty() {
            bail!("mail.from is required to send reports (set REPORT_MAIL_FROM)");
        }
        if self.mail.recipients.is_empty() {
            bail!("mail.recipients is empty (set REPORT_MAIL_TO)");
        }
        Ok(())
    }

    pub fn mail_configured(&self) -> bool {
        self.validate_mail().is_ok()
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{key} has invalid value {value:?}"))
}
