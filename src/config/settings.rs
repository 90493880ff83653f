use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub documents: DocumentConfig,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
    #[serde(default)]
    pub otel: OtelConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Outbound mail settings shared by the dispatcher and its transports.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_mail_domain")]
    pub domain: String,
    #[serde(default = "default_mail_host")]
    pub host: String,
    #[serde(default = "default_mail_port")]
    pub port: u16,
    #[serde(default)]
    pub encryption: MailEncryption,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    /// Which delivery backend the dispatcher hands messages to
    #[serde(default)]
    pub transport: TransportKind,
    /// Directory used by the `outbox` transport
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
    /// Capacity of the bounded dispatcher queue; senders wait once it is full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// SMTP command timeout in seconds
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailEncryption {
    #[default]
    None,
    StartTls,
    Tls,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Smtp,
    Outbox,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateConfig {
    /// Optional directory of `<name>.html.tmpl` / `<name>.plain.tmpl` pairs
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShutdownSettings {
    /// Upper bound on waiting for background tasks. Unset means wait forever.
    pub drain_timeout_secs: Option<u64>,
}

impl ShutdownSettings {
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_mail_domain() -> String {
    "localhost".to_string()
}

fn default_mail_host() -> String {
    "localhost".to_string()
}

fn default_mail_port() -> u16 {
    1025
}

fn default_from_name() -> String {
    "info".to_string()
}

fn default_from_address() -> String {
    "info@localhost.com".to_string()
}

fn default_outbox_dir() -> PathBuf {
    PathBuf::from("./outbox")
}

fn default_queue_capacity() -> usize {
    100
}

fn default_smtp_timeout() -> u64 {
    10
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "membership-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("mail.queue_capacity", 100)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // MEMBERSHIP__SERVER__PORT, MEMBERSHIP__MAIL__FROM_ADDRESS, ...
            .add_source(
                Environment::with_prefix("MEMBERSHIP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mail.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "mail.queue_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            domain: default_mail_domain(),
            host: default_mail_host(),
            port: default_mail_port(),
            encryption: MailEncryption::default(),
            username: None,
            password: None,
            from_name: default_from_name(),
            from_address: default_from_address(),
            transport: TransportKind::default(),
            outbox_dir: default_outbox_dir(),
            queue_capacity: default_queue_capacity(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}
