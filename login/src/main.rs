/*
 * main.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portcullis, an IMAP/POP3 login front-end.
 *
 * Portcullis is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portcullis is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portcullis.  If not, see <http://www.gnu.org/licenses/>.
 */

//! portcullis-login: the login front-end process.
//!
//! Usage: `portcullis-login [CONFIG]`. Without an argument the configuration
//! is read from `/etc/portcullis/login.xml` if that exists, otherwise the
//! built-in defaults are used.

use std::path::{Path, PathBuf};

use anyhow::Context;
use portcullis_core::{AuthService, LoginConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/portcullis/login.xml";

fn load_config() -> anyhow::Result<LoginConfig> {
    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => LoginConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            LoginConfig::load(Path::new(DEFAULT_CONFIG_PATH))
                .with_context(|| format!("loading configuration from {}", DEFAULT_CONFIG_PATH))
        }
        None => {
            let mut config = LoginConfig::default();
            config.apply_env(|name| std::env::var(name).ok())?;
            Ok(config)
        }
    }
}

fn setup_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let mut config = load_config()?;
    setup_tracing(&config.log_level);

    // Worker sockets are opened by bare name relative to the socket directory.
    std::env::set_current_dir(&config.socket_dir)
        .with_context(|| format!("chdir({})", config.socket_dir.display()))?;
    info!(
        "portcullis-login {} starting in {}",
        env!("CARGO_PKG_VERSION"),
        config.socket_dir.display()
    );
    config.socket_dir = PathBuf::from(".");

    let service = AuthService::new(&config);
    let local = LocalSet::new();
    local
        .run_until(async move {
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
            let signals = tokio::task::spawn_local(async move {
                let res = shutdown_signal().await;
                let _ = stop_tx.send(());
                res
            });
            service
                .run(async {
                    let _ = stop_rx.await;
                })
                .await;
            signals.await.context("signal task")?
        })
        .await?;

    info!("portcullis-login stopped");
    Ok(())
}
