//! Composition root: builds every capability (C1 through C9) from [`Config`]
//! and holds the `Arc` handles shared between the HTTP server and the
//! background tasks.
//!
//! One struct holding every shared service, built once at startup and
//! handed to both the server and the background workers as `Arc<App>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use signer_api::SignerApiClient;

use crate::chain::{ChainClient, ChainClients, RetryPolicy};
use crate::config::{Config, SignerConfig};
use crate::counters::CounterCache;
use crate::nonce::NonceAllocator;
use crate::pipeline::RelayPipeline;
use crate::policy::PolicyEngine;
use crate::shutdown::Shutdown;
use crate::signer::local::LocalSigner;
use crate::signer::remote::RemoteSigner;
use crate::signer::Signer;
use crate::store::Store;
use crate::utils::auth::AuthValidator;

/// Upper bound on how far back the Counter Cache (C5) needs to retain
/// per-key sums; the longest quota window the Policy Engine evaluates is
/// daily (spec §4.4).
const COUNTER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Every shared service the HTTP server and background tasks need, built
/// once at startup from [`Config`].
pub struct App {
    pub config: Config,
    pub store: Arc<Store>,
    pub chain: ChainClients,
    pub policy: Arc<PolicyEngine>,
    pub counters: Arc<CounterCache>,
    pub nonce: Arc<NonceAllocator>,
    pub pipeline: Arc<RelayPipeline>,
    pub auth: AuthValidator,
    pub shutdown: Shutdown,
}

impl App {
    pub async fn new(config: Config, shutdown: Shutdown) -> anyhow::Result<Self> {
        let store = Arc::new(Store::new(&config.database).await?);

        let chain = build_chain_clients(&config)?;
        let signer = build_signer(&config).await?;

        let existing_rules = store.list_policy_rules(None).await?;
        let policy = Arc::new(PolicyEngine::new(existing_rules));

        let counters = Arc::new(CounterCache::new(COUNTER_RETENTION));
        let nonce = Arc::new(NonceAllocator::new());

        let networks: HashMap<_, _> = config.networks.networks.0.clone();

        let pipeline = Arc::new(RelayPipeline::new(
            policy.clone(),
            counters.clone(),
            nonce.clone(),
            signer,
            chain.clone(),
            store.clone(),
            networks,
            config.app.clone(),
        ));

        let auth = AuthValidator::new(
            config.server.auth_mode,
            config.server.basic_auth_credentials.clone(),
        );

        Ok(Self {
            config,
            store,
            chain,
            policy,
            counters,
            nonce,
            pipeline,
            auth,
            shutdown,
        })
    }
}

fn build_chain_clients(config: &Config) -> anyhow::Result<ChainClients> {
    let mut clients = HashMap::new();
    for (network, network_config) in &config.networks.networks.0 {
        let rpc_endpoint: url::Url = network_config.rpc_endpoint.expose().parse()?;
        let client = ChainClient::new(
            network.clone(),
            network_config.chain_id,
            network_config.forwarder_address,
            rpc_endpoint,
            RetryPolicy::default(),
        );
        clients.insert(network.clone(), Arc::new(client));
    }
    Ok(ChainClients::new(clients))
}

async fn build_signer(config: &Config) -> anyhow::Result<Arc<dyn Signer>> {
    match &config.signer {
        SignerConfig::Local(local) => {
            let signer = LocalSigner::from_hex(local.private_key.expose())?;
            Ok(Arc::new(signer))
        }
        SignerConfig::Remote(remote) => {
            let client = SignerApiClient::new(
                remote.signer_api_url.expose(),
                remote.signer_api_key.expose(),
                remote.signer_api_secret.expose(),
            )
            .await?;
            Ok(Arc::new(RemoteSigner::new(
                client,
                remote.relayer_address,
                remote.send_timeout,
            )))
        }
    }
}
