//! Command-line interface.
//!
//! Every command runs the three contexts in-process: a [`PageClient`] talks
//! to a [`Relay`], which forwards to the [`BackgroundCoordinator`].

pub mod doctor;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::auth::{AccountMode, AuthFlowController, SessionStore};
use crate::background::{AlarmHost, BackgroundCoordinator, TokioAlarmHost};
use crate::config::BridgeConfig;
use crate::contexts::{
    self, ContextEndpoint, DEFAULT_LINK_CAPACITY, DEFAULT_RESPONSE_TIMEOUT, PageClient, Relay,
};
use crate::error::{ConfigError, Error};
use crate::remote::{HttpAuthApi, RemoteAuthApi};
use crate::storage::{JsonFileStorage, Storage};
use crate::wallet::{LocalKeyWallet, WalletProvider};

/// Origin the in-process relay identifies itself with.
pub const RELAY_ORIGIN: &str = "chrome-extension://authbridge-relay";

/// Port the relay holds open on the background for pushes.
const RELAY_PORT: &str = "relay";

#[derive(Parser, Debug)]
#[command(name = "authbridge", version, about = "Wallet sign-in bridge")]
pub struct Cli {
    /// TOML config file (defaults to ~/.authbridge/config.toml).
    #[arg(long, global = true, env = "AUTHBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Sign in with the key in AUTHBRIDGE_DEV_PRIVATE_KEY.
    Login {
        /// Account the session is bound to.
        #[arg(long, default_value = "live")]
        mode: AccountMode,

        /// Chain id reported by the local wallet.
        #[arg(long, env = "AUTHBRIDGE_CHAIN_ID", default_value = "0x1")]
        chain_id: String,
    },
    /// Print the stored session and check it against the remote API.
    Status,
    /// End the session locally and remotely.
    Logout,
    /// Check configuration, storage and remote API reachability.
    Doctor {
        /// Exit non-zero when any check fails.
        #[arg(long)]
        strict: bool,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Doctor { strict } => doctor::run_doctor_command(cli.config, strict).await,
        Command::Login { mode, chain_id } => {
            let config = BridgeConfig::from_env_with_toml(cli.config.as_deref())?;
            let wallet = dev_wallet(&chain_id)?;
            let stack = BridgeStack::from_config(&config, Some(wallet)).await?;
            let result = stack.page.connect(mode).await;
            stack.shutdown();
            let data = result?;
            print_json(&data)?;
            Ok(())
        }
        Command::Status => {
            let config = BridgeConfig::from_env_with_toml(cli.config.as_deref())?;
            let stack = BridgeStack::from_config(&config, None).await?;
            let session = stack.page.get_session().await;
            let validation = match &session {
                Ok(data) if data.get("authenticated") == Some(&Value::Bool(true)) => {
                    Some(stack.page.validate_session().await)
                }
                _ => None,
            };
            stack.shutdown();

            let session = session?;
            print_json(&session)?;
            match validation {
                Some(Ok(data)) => println!(
                    "valid: {}",
                    data.get("valid").and_then(Value::as_bool).unwrap_or(false)
                ),
                Some(Err(e)) => println!("validation failed: {e}"),
                None => println!("not signed in"),
            }
            Ok(())
        }
        Command::Logout => {
            let config = BridgeConfig::from_env_with_toml(cli.config.as_deref())?;
            let stack = BridgeStack::from_config(&config, None).await?;
            let result = stack.page.disconnect().await;
            stack.shutdown();
            print_json(&result?)?;
            Ok(())
        }
    }
}

fn print_json(data: &Map<String, Value>) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

/// Local signer from `AUTHBRIDGE_DEV_PRIVATE_KEY`.
pub fn dev_wallet(chain_id: &str) -> Result<Arc<dyn WalletProvider>, ConfigError> {
    let key = std::env::var("AUTHBRIDGE_DEV_PRIVATE_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "AUTHBRIDGE_DEV_PRIVATE_KEY".to_string(),
            message: "required for login".to_string(),
        })?;
    let wallet = LocalKeyWallet::from_hex(key.expose_secret().trim(), chain_id).map_err(|message| {
        ConfigError::InvalidValue {
            key: "AUTHBRIDGE_DEV_PRIVATE_KEY".to_string(),
            message,
        }
    })?;
    Ok(Arc::new(wallet))
}

/// The page, relay and background contexts wired together over context
/// links, with the relay holding a background port for session pushes.
pub struct BridgeStack {
    pub page: PageClient,
    pub relay: Arc<Relay>,
    pub background: Arc<BackgroundCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeStack {
    /// Stack backed by the configured HTTP API and JSON file storage.
    pub async fn from_config(
        config: &BridgeConfig,
        wallet: Option<Arc<dyn WalletProvider>>,
    ) -> Result<Self, Error> {
        let api: Arc<dyn RemoteAuthApi> =
            Arc::new(HttpAuthApi::new(config.remote.base_url.clone(), config.remote.timeout)?);
        let storage: Arc<dyn Storage> = Arc::new(JsonFileStorage::new(config.storage.path.clone()));
        Self::start(config, wallet, api, storage, Arc::new(TokioAlarmHost::new())).await
    }

    pub async fn start(
        config: &BridgeConfig,
        wallet: Option<Arc<dyn WalletProvider>>,
        api: Arc<dyn RemoteAuthApi>,
        storage: Arc<dyn Storage>,
        alarms: Arc<dyn AlarmHost>,
    ) -> Result<Self, Error> {
        let page_origin = config
            .router
            .allowed_origins
            .first()
            .cloned()
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "AUTHBRIDGE_ALLOWED_ORIGINS".to_string(),
                message: "at least one origin is required".to_string(),
            })?;

        let auth = Arc::new(AuthFlowController::new(
            wallet,
            api,
            SessionStore::new(storage),
            config.auth_flow_config(),
        ));
        let background =
            BackgroundCoordinator::cold_start(config.background_config(RELAY_ORIGIN), auth, alarms)
                .await?;

        let mut tasks = Vec::new();

        let (to_background, background_rx) =
            contexts::link(DEFAULT_LINK_CAPACITY, DEFAULT_RESPONSE_TIMEOUT);
        tasks.push(tokio::spawn(Arc::clone(&background).serve(background_rx)));

        let relay = Arc::new(Relay::new(
            RELAY_ORIGIN,
            config.router_config("relay", config.router.allowed_origins.clone()),
            to_background,
        ));
        let (to_relay, relay_rx) = contexts::link(DEFAULT_LINK_CAPACITY, DEFAULT_RESPONSE_TIMEOUT);
        let relay_endpoint: Arc<dyn ContextEndpoint> = Arc::clone(&relay) as Arc<dyn ContextEndpoint>;
        tasks.push(tokio::spawn(contexts::serve(relay_endpoint, relay_rx)));

        let page = PageClient::new(
            page_origin,
            to_relay,
            config.router_config("page", vec![RELAY_ORIGIN.to_string()]),
        );
        let (to_page, page_rx) = contexts::link(DEFAULT_LINK_CAPACITY, DEFAULT_RESPONSE_TIMEOUT);
        let page_endpoint: Arc<dyn ContextEndpoint> = page.router();
        tasks.push(tokio::spawn(contexts::serve(page_endpoint, page_rx)));

        let (port_id, port_rx) = background.open_port(RELAY_PORT);
        tasks.push(relay.forward_notifications(port_rx, to_page));
        tracing::debug!(port_id = %port_id, "Bridge contexts wired");

        Ok(Self {
            page,
            relay,
            background,
            tasks,
        })
    }

    /// Stop the context tasks and tear the background down.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        self.background.teardown();
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn login_mode_parses() {
        let cli = Cli::try_parse_from(["authbridge", "login", "--mode", "demo", "--chain-id", "0x2"])
            .expect("parse");
        match cli.command {
            Command::Login { mode, chain_id } => {
                assert_eq!(mode, AccountMode::Demo);
                assert_eq!(chain_id, "0x2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["authbridge", "login", "--mode", "paper"]).is_err());
    }
}
