use std::{net::SocketAddr, process, sync::Arc};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use secrecy::Secret;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use truss::{
    app::{ExtensionSet, create_app},
    application::{
        error::AppError,
        passwords::Passwords,
        repos::{NewUser, UsersRepo},
        tasks::{RecordLoginTask, TaskContext, process_record_login_task},
    },
    config,
    domain::users::{validate_password, validate_username},
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::shutdown_signal,
        tasks::create_task_queue,
        telemetry,
    },
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    let _warn_log_guard = telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Worker(_) => run_worker(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
        config::Command::CreateUser(args) => run_create_user(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let extensions = ExtensionSet::default();
    let mut app = create_app(&settings, &extensions)?;
    let queue = create_task_queue(&settings)?;
    app.insert_extension(Arc::new(queue));

    let router = app.into_router();
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        target = "truss::serve",
        addr = %settings.server.addr,
        debug = settings.debug,
        "listening"
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn connect_repositories(
    settings: &config::Settings,
) -> Result<Arc<PostgresRepositories>, AppError> {
    let pool = PostgresRepositories::connect(
        &settings.database.url,
        settings.database.max_connections.get(),
    )
    .await
    .map_err(InfraError::from)?;
    Ok(Arc::new(PostgresRepositories::new(pool)))
}

async fn run_worker(settings: config::Settings) -> Result<(), AppError> {
    let repositories = connect_repositories(&settings).await?;
    let queue = create_task_queue(&settings)?;
    let context = TaskContext {
        users: repositories,
    };

    let concurrency = settings.tasks.concurrency.get() as usize;
    let record_login_worker = WorkerBuilder::new("record-login-worker")
        .concurrency(concurrency)
        .data(context)
        .backend(queue.storage::<RecordLoginTask>())
        .build_fn(process_record_login_task);

    info!(
        target = "truss::worker",
        concurrency,
        "task worker started"
    );

    Monitor::new()
        .register(record_login_worker)
        .run()
        .await
        .map_err(|err| AppError::unexpected(format!("task monitor stopped: {err}")))
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let repositories = connect_repositories(&settings).await?;
    PostgresRepositories::run_migrations(repositories.pool())
        .await
        .map_err(InfraError::from)?;

    let queue = create_task_queue(&settings)?;
    queue.setup().await?;

    info!(target = "truss::migrate", "migrations applied");
    Ok(())
}

async fn run_create_user(
    settings: config::Settings,
    args: config::CreateUserArgs,
) -> Result<(), AppError> {
    let username = validate_username(&args.username)?;
    validate_password(&args.password)?;

    let repositories = connect_repositories(&settings).await?;
    let passwords = Passwords::new(&settings.passwords)?;
    let password_hash = passwords.hash_blocking(Secret::new(args.password)).await?;

    let user = repositories
        .create_user(NewUser {
            username,
            password_hash,
        })
        .await?;

    info!(
        target = "truss::create_user",
        user_id = user.id,
        username = %user.username,
        "user created"
    );
    Ok(())
}
