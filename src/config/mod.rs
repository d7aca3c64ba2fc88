//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File, FileFormat};
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "truss";
const ENV_PREFIX: &str = "TRUSS";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_DATABASE_URL: &str = "postgres://localhost:5432/truss";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_LOGIN_VIEW: &str = "main.login";
const DEFAULT_LOGIN_MESSAGE: &str = "You do not have access to that page.";
const DEFAULT_REFRESH_MESSAGE: &str = "Please reauthenticate to access this page.";
const DEFAULT_SESSION_COOKIE: &str = "session";
const DEFAULT_FRESH_SECONDS: u64 = 900;
const DEFAULT_PASSWORD_MEMORY_KIB: u32 = 19_456;
const DEFAULT_PASSWORD_ITERATIONS: u32 = 2;
const DEFAULT_PASSWORD_PARALLELISM: u32 = 1;
const DEFAULT_PROXY_X_FOR: usize = 1;
const DEFAULT_PROXY_X_PROTO: usize = 1;
const DEFAULT_PROXY_X_HOST: usize = 1;
const DEFAULT_TASK_CONCURRENCY: u32 = 2;
const DEFAULT_TASK_MAX_ATTEMPTS: u32 = 5;
pub const MIN_SECRET_KEY_LEN: usize = 32;

/// Command-line arguments for the Truss binary.
#[derive(Debug, Parser)]
#[command(name = "truss", version, about = "Truss web application server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TRUSS_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP application.
    Serve(Box<ServeArgs>),
    /// Run the task-queue worker.
    Worker(WorkerArgs),
    /// Apply database and task-queue migrations.
    Migrate(MigrateArgs),
    /// Create a user account.
    #[command(name = "create-user")]
    CreateUser(CreateUserArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BrokerOverride {
    /// Override the task-queue broker URL.
    #[arg(long = "broker-url", value_name = "URL")]
    pub broker_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub broker: BrokerOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Toggle debug mode (admin UI and debug toolbar).
    #[arg(
        long = "debug",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub debug: Option<bool>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Directory receiving the warning-and-above log file.
    #[arg(long = "warn-log-dir", value_name = "PATH")]
    pub warn_log_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub broker: BrokerOverride,

    /// Override the worker concurrency.
    #[arg(long = "concurrency", value_name = "COUNT")]
    pub concurrency: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub broker: BrokerOverride,
}

#[derive(Debug, Args, Clone)]
pub struct CreateUserArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Login name of the new account.
    #[arg(value_name = "USERNAME")]
    pub username: String,

    /// Password of the new account.
    #[arg(long = "password", env = "TRUSS_NEW_USER_PASSWORD", hide_env_values = true)]
    pub password: String,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub debug: bool,
    pub secret_key: Secret<String>,
    pub broker_url: String,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub passwords: PasswordSettings,
    pub proxy: ProxySettings,
    pub tasks: TaskSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
    pub warn_log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: NonZeroU32,
}

/// Login manager behaviour: redirect targets, flash messages and session cookie.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub login_view: String,
    pub refresh_view: String,
    pub login_message: String,
    pub refresh_message: String,
    pub session_cookie: String,
    pub fresh_for: Duration,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone)]
pub struct PasswordSettings {
    pub memory_kib: NonZeroU32,
    pub iterations: NonZeroU32,
    pub parallelism: NonZeroU32,
}

/// Number of trusted proxy hops per forwarded header; zero disables the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxySettings {
    pub x_for: usize,
    pub x_proto: usize,
    pub x_host: usize,
    pub x_port: usize,
    pub x_prefix: usize,
}

#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub concurrency: NonZeroU32,
    pub max_attempts: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = base_builder();

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Worker(args)) => raw.apply_worker_overrides(args),
        Some(Command::Migrate(args)) => {
            raw.apply_database_override(&args.database);
            raw.apply_broker_override(&args.broker);
        }
        Some(Command::CreateUser(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Load settings from the default files and the environment, without CLI overrides.
pub fn load_default() -> Result<Settings, LoadError> {
    let raw: RawSettings = base_builder()
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

/// Load settings from an in-memory TOML document only.
pub fn load_from_toml(document: &str) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from_str(document, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

fn base_builder() -> config::ConfigBuilder<config::builder::DefaultState> {
    Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    debug: Option<bool>,
    secret_key: Option<String>,
    broker_url: Option<String>,
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    auth: RawAuthSettings,
    passwords: RawPasswordSettings,
    proxy: RawProxySettings,
    tasks: RawTaskSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(debug) = overrides.debug {
            self.debug = Some(debug);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dir) = overrides.warn_log_dir.as_ref() {
            self.logging.warn_log_dir = Some(dir.clone());
        }

        self.apply_database_override(&overrides.database);
        self.apply_broker_override(&overrides.broker);
    }

    fn apply_worker_overrides(&mut self, args: &WorkerArgs) {
        self.apply_database_override(&args.database);
        self.apply_broker_override(&args.broker);
        if let Some(concurrency) = args.concurrency {
            self.tasks.concurrency = Some(concurrency.into());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_broker_override(&mut self, overrides: &BrokerOverride) {
        if let Some(url) = overrides.broker_url.as_ref() {
            self.broker_url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            debug,
            secret_key,
            broker_url,
            server,
            logging,
            database,
            auth,
            passwords,
            proxy,
            tasks,
        } = raw;

        let secret_key = build_secret_key(secret_key)?;
        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let broker_url = non_empty(broker_url).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let auth = build_auth_settings(auth)?;
        let passwords = build_password_settings(passwords)?;
        let proxy = build_proxy_settings(proxy);
        let tasks = build_task_settings(tasks)?;

        Ok(Self {
            debug: debug.unwrap_or(false),
            secret_key,
            broker_url,
            server,
            logging,
            database,
            auth,
            passwords,
            proxy,
            tasks,
        })
    }
}

fn build_secret_key(secret_key: Option<String>) -> Result<Secret<String>, LoadError> {
    let secret = non_empty(secret_key)
        .ok_or_else(|| LoadError::invalid("secret_key", "must be configured"))?;
    if secret.len() < MIN_SECRET_KEY_LEN {
        return Err(LoadError::invalid(
            "secret_key",
            format!("must be at least {MIN_SECRET_KEY_LEN} bytes"),
        ));
    }
    Ok(Secret::new(secret))
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    let warn_log_dir = logging
        .warn_log_dir
        .filter(|dir| !dir.as_os_str().is_empty());

    Ok(LoggingSettings {
        level,
        format,
        warn_log_dir,
    })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_empty(database.url).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS.into()),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    let login_view = non_empty(auth.login_view).unwrap_or_else(|| DEFAULT_LOGIN_VIEW.to_string());
    let refresh_view = non_empty(auth.refresh_view).unwrap_or_else(|| login_view.clone());
    let login_message = auth
        .login_message
        .unwrap_or_else(|| DEFAULT_LOGIN_MESSAGE.to_string());
    let refresh_message = auth
        .refresh_message
        .unwrap_or_else(|| DEFAULT_REFRESH_MESSAGE.to_string());
    let session_cookie =
        non_empty(auth.session_cookie).unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string());
    if !session_cookie
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(LoadError::invalid(
            "auth.session_cookie",
            "cookie name may only contain ASCII letters, digits, `_` and `-`",
        ));
    }

    let fresh_seconds = auth.fresh_seconds.unwrap_or(DEFAULT_FRESH_SECONDS);
    if fresh_seconds == 0 {
        return Err(LoadError::invalid(
            "auth.fresh_seconds",
            "must be greater than zero",
        ));
    }

    Ok(AuthSettings {
        login_view,
        refresh_view,
        login_message,
        refresh_message,
        session_cookie,
        fresh_for: Duration::from_secs(fresh_seconds),
    })
}

fn build_password_settings(
    passwords: RawPasswordSettings,
) -> Result<PasswordSettings, LoadError> {
    Ok(PasswordSettings {
        memory_kib: non_zero_u32(
            passwords
                .memory_kib
                .unwrap_or(DEFAULT_PASSWORD_MEMORY_KIB.into()),
            "passwords.memory_kib",
        )?,
        iterations: non_zero_u32(
            passwords
                .iterations
                .unwrap_or(DEFAULT_PASSWORD_ITERATIONS.into()),
            "passwords.iterations",
        )?,
        parallelism: non_zero_u32(
            passwords
                .parallelism
                .unwrap_or(DEFAULT_PASSWORD_PARALLELISM.into()),
            "passwords.parallelism",
        )?,
    })
}

fn build_proxy_settings(proxy: RawProxySettings) -> ProxySettings {
    ProxySettings {
        x_for: proxy.x_for.unwrap_or(DEFAULT_PROXY_X_FOR),
        x_proto: proxy.x_proto.unwrap_or(DEFAULT_PROXY_X_PROTO),
        x_host: proxy.x_host.unwrap_or(DEFAULT_PROXY_X_HOST),
        x_port: proxy.x_port.unwrap_or(0),
        x_prefix: proxy.x_prefix.unwrap_or(0),
    }
}

fn build_task_settings(tasks: RawTaskSettings) -> Result<TaskSettings, LoadError> {
    Ok(TaskSettings {
        concurrency: non_zero_u32(
            tasks.concurrency.unwrap_or(DEFAULT_TASK_CONCURRENCY.into()),
            "tasks.concurrency",
        )?,
        max_attempts: non_zero_u32(
            tasks.max_attempts.unwrap_or(DEFAULT_TASK_MAX_ATTEMPTS.into()),
            "tasks.max_attempts",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
    warn_log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    login_view: Option<String>,
    refresh_view: Option<String>,
    login_message: Option<String>,
    refresh_message: Option<String>,
    session_cookie: Option<String>,
    fresh_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPasswordSettings {
    memory_kib: Option<u64>,
    iterations: Option<u64>,
    parallelism: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProxySettings {
    x_for: Option<usize>,
    x_proto: Option<usize>,
    x_host: Option<usize>,
    x_port: Option<usize>,
    x_prefix: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTaskSettings {
    concurrency: Option<u64>,
    max_attempts: Option<u64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
