//! qpx client main loop
// (c) 2024 Ross Younger

use std::sync::Arc;

use anyhow::Context as _;
use tokio::task::JoinSet;
use tracing::info;

use crate::acl::Engine;
use crate::config::Configuration;
use crate::proxy::http::{HttpOptions, HttpServer};
use crate::proxy::socks5::{SocksOptions, SocksServer};
use crate::proxy::Dispatcher;
use crate::tunnel::TunnelClient;

/// Brings up the tunnel and the configured front-ends, then runs until
/// interrupted or until a front-end fails.
pub(crate) async fn client_main(config: Configuration) -> anyhow::Result<()> {
    let tunnel = Arc::new(TunnelClient::new(config.tunnel_options()?));
    // Eager connect: a bad server address or a rejected credential should
    // be reported at startup, not on the first request.
    tunnel.connect().await.context("unable to connect to server")?;

    let acl = match config.acl_file() {
        Some(path) => Some(Engine::load_from_file(path)?),
        None => None,
    };
    let dispatcher = Arc::new(Dispatcher::new(tunnel, acl));

    let mut servers = JoinSet::new();
    if !config.socks5_addr.is_empty() {
        let server = Arc::new(SocksServer::new(
            dispatcher.clone(),
            SocksOptions {
                listen: config.socks5_addr.clone(),
                auth: auth_pair(&config.socks5_user, &config.socks5_password),
                idle_timeout: config.socks5_timeout(),
                udp_enabled: !config.socks5_disable_udp,
            },
        ));
        let _ = servers.spawn(server.listen_and_serve());
    }
    if !config.http_addr.is_empty() {
        let tls = if config.https_cert.is_empty() {
            None
        } else {
            Some((
                config.https_cert.clone().into(),
                config.https_key.clone().into(),
            ))
        };
        let server = Arc::new(HttpServer::new(
            dispatcher.clone(),
            HttpOptions {
                listen: config.http_addr.clone(),
                auth: auth_pair(&config.http_user, &config.http_password),
                idle_timeout: config.http_timeout(),
                tls,
            },
        )?);
        let _ = servers.spawn(server.listen_and_serve());
    }

    tokio::select! {
        result = servers.join_next() => {
            if let Some(r) = result {
                // Panic or accept-loop error; either way we're done for.
                r.context("front-end task failed")??;
            }
            Err(anyhow::anyhow!("front-end server exited unexpectedly"))
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}

fn auth_pair(user: &str, password: &str) -> Option<(String, String)> {
    if user.is_empty() && password.is_empty() {
        None
    } else {
        Some((user.to_string(), password.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::auth_pair;

    #[test]
    fn empty_credentials_mean_no_auth() {
        assert_eq!(auth_pair("", ""), None);
        assert_eq!(
            auth_pair("u", "p"),
            Some(("u".to_string(), "p".to_string()))
        );
        // A password-only pair still switches auth on
        assert!(auth_pair("", "p").is_some());
    }
}
