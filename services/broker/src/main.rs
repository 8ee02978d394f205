// crossbard entry point.
use anyhow::Result;
use broker::{config, observability, service};
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init("crossbard");
    let config = config::ServiceConfig::from_env_or_yaml()?;

    // Expose Prometheus metrics on the configured bind address.
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let core = service::build_core(&config);
    let (path, listener) = service::bind(&config)?;
    tracing::info!(path = %path.display(), identity = core.identity(), "broker listening");

    let accept_task = {
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(err) = core.serve(listener).await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    core.shutdown();
    // Serve returns on its own once it sees the shutdown flag.
    let _ = accept_task.await;
    if let Err(err) = std::fs::remove_file(&path) {
        tracing::debug!(path = %path.display(), error = %err, "socket file not removed");
    }
    tracing::info!("broker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => std::env::set_var(self.key, value),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_starts_and_stops() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let _g1 = EnvGuard::set(
            "CROSSBAR_RUNTIME_DIR",
            dir.path().to_str().expect("utf8 path"),
        );
        let _g2 = EnvGuard::set("CROSSBAR_METRICS_BIND", "127.0.0.1:0");
        let _g3 = EnvGuard::unset("CROSSBAR_CONFIG");
        run_with_shutdown(async {}).await?;
        Ok(())
    }
}
