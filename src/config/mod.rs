mod settings;

pub use settings::{
    DocumentConfig, LogConfig, LogFormat, MailConfig, MailEncryption, OtelConfig, ServerConfig,
    Settings, ShutdownSettings, TemplateConfig, TransportKind,
};
