use gip_switch_common::config::DbConfig;
use gip_switch_common::tracing::init_tracing_with_default_env_filter;
use gip_switch_service::api::make_open_api_service;
use gip_switch_service::config::{make_config_loader, SwitchServiceConfig};
use gip_switch_service::service::Services;
use gip_switch_service::{api, db, workers};
use poem::listener::TcpListener;
use poem::middleware::CookieJarManager;
use poem::EndpointExt;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    if std::env::args().any(|arg| arg == "--dump-openapi-yaml") {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(dump_openapi_yaml())
    } else if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(&config))
    } else {
        Ok(())
    }
}

async fn dump_openapi_yaml() -> Result<(), std::io::Error> {
    let config = SwitchServiceConfig::default();
    let services = Services::new(&config).await.map_err(|e| {
        error!("Services - init error: {}", e);
        std::io::Error::other(e)
    })?;
    let open_api_service = make_open_api_service(&services);
    println!("{}", open_api_service.spec_yaml());
    Ok(())
}

async fn async_main(config: &SwitchServiceConfig) -> Result<(), std::io::Error> {
    let http_port = config.http_port;

    info!("Starting GIP switch on port: http: {}", http_port);

    match config.db.clone() {
        DbConfig::Postgres(c) => {
            db::postgres_migrate(&c).await.map_err(|e| {
                error!("DB - init error: {}", e);
                std::io::Error::other(format!("Init error: {e:?}"))
            })?;
        }
        DbConfig::Sqlite(c) => {
            db::sqlite_migrate(&c).await.map_err(|e| {
                error!("DB - init error: {}", e);
                std::io::Error::other(format!("Init error: {e:?}"))
            })?;
        }
    };

    let services = Services::new(config).await.map_err(|e| {
        error!("Services - init error: {}", e);
        std::io::Error::other(e)
    })?;

    let shutdown = CancellationToken::new();
    let worker_handles = workers::spawn_all(&services, &config.workers, &shutdown);

    let http_services = services.clone();
    let http_shutdown = shutdown.clone();
    let http_server = tokio::spawn(async move {
        let app = api::combined_routes(&http_services).with(CookieJarManager::new());

        poem::Server::new(TcpListener::bind(format!("0.0.0.0:{}", http_port)))
            .run_with_graceful_shutdown(app, http_shutdown.cancelled_owned(), None)
            .await
            .expect("HTTP server failed");
    });

    select! {
        _ = http_server => {},
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }

    Ok(())
}
