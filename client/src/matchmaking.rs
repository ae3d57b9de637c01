//! Client for the matchmaking service that pairs a player with a bot and
//! returns the parameters of the channel to open.

use crate::{Error, Result};
use rand::{CryptoRng, RngCore};
use rochambeau_types::{Address, ChannelConfig, Keypair};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// Error code returned when an account may not open new channels.
pub const GREYLISTED: &str = "greylisted";

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenRequest {
    pub address: Address,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Clone, Debug)]
pub struct Matchmaker {
    http: reqwest::Client,
    base_url: Url,
}

impl Matchmaker {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::InvalidScheme(other.to_string())),
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Ask for a bot to play against `address`.
    pub async fn open(&self, address: &Address, host: &str, port: u16) -> Result<ChannelConfig> {
        let url = self.base_url.join("open")?;
        let request = OpenRequest {
            address: address.clone(),
            host: host.to_string(),
            port,
        };
        debug!(%address, %url, "requesting channel");
        let response = self.http.post(url).json(&request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<ChannelConfig>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        if let Ok(ErrorBody { error }) = serde_json::from_str::<ErrorBody>(&body) {
            if error == GREYLISTED {
                return Err(Error::Greylisted);
            }
        }
        Err(Error::FailedWithBody { status, body })
    }

    /// Like [Matchmaker::open], but replaces a greylisted `keypair` with a fresh
    /// one and tries once more.
    pub async fn open_with_regeneration<R: RngCore + CryptoRng>(
        &self,
        keypair: &mut Keypair,
        rng: &mut R,
        host: &str,
        port: u16,
    ) -> Result<ChannelConfig> {
        match self.open(keypair.address(), host, port).await {
            Err(Error::Greylisted) => {
                warn!(address = %keypair.address(), "account greylisted, regenerating keypair");
                *keypair = Keypair::generate(rng);
                self.open(keypair.address(), host, port).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State as AxumState, http::StatusCode, routing::post, Json, Router};
    use rand::{rngs::StdRng, SeedableRng};
    use rochambeau_types::channel::Timeouts;
    use std::{
        collections::HashSet,
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    type Greylist = Arc<Mutex<HashSet<Address>>>;

    fn config_for(address: Address, host: String, port: u16) -> ChannelConfig {
        ChannelConfig {
            initiator_id: Address::new("ak_bot"),
            responder_id: address,
            initiator_amount: 1_000,
            responder_amount: 1_000,
            push_amount: 0,
            channel_reserve: 1,
            host,
            port,
            lock_period: 10,
            timeouts: Timeouts::default(),
            existing_channel_id: None,
            existing_fsm_id: None,
        }
    }

    async fn serve(greylist: Greylist) -> (String, tokio::task::JoinHandle<()>) {
        let router = Router::new()
            .route(
                "/open",
                post(
                    |AxumState(greylist): AxumState<Greylist>,
                     Json(request): Json<OpenRequest>| async move {
                        if greylist.lock().unwrap().contains(&request.address) {
                            return Err((
                                StatusCode::FORBIDDEN,
                                Json(ErrorBody {
                                    error: GREYLISTED.to_string(),
                                }),
                            ));
                        }
                        Ok(Json(config_for(request.address, request.host, request.port)))
                    },
                ),
            )
            .with_state(greylist);

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });
        (base_url, handle)
    }

    #[test]
    fn test_matchmaker_invalid_scheme() {
        let err = Matchmaker::new("ftp://example.com").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid URL scheme: ftp (expected http or https)"
        );
        assert!(Matchmaker::new("https://localhost:8080").is_ok());
    }

    #[tokio::test]
    async fn test_open_returns_channel_config() {
        let (base_url, handle) = serve(Greylist::default()).await;
        let matchmaker = Matchmaker::new(&base_url).unwrap();
        let address = Address::new("ak_user");
        let config = matchmaker.open(&address, "localhost", 3001).await.unwrap();
        assert_eq!(config.responder_id, address);
        assert_eq!(config.port, 3001);
        handle.abort();
    }

    #[tokio::test]
    async fn test_greylisted_account_is_regenerated() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut keypair = Keypair::generate(&mut rng);
        let original = keypair.address().clone();
        let greylist = Greylist::default();
        greylist.lock().unwrap().insert(original.clone());
        let (base_url, handle) = serve(greylist).await;
        let matchmaker = Matchmaker::new(&base_url).unwrap();

        let err = matchmaker
            .open(&original, "localhost", 3001)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Greylisted));

        let config = matchmaker
            .open_with_regeneration(&mut keypair, &mut rng, "localhost", 3001)
            .await
            .unwrap();
        assert_ne!(keypair.address(), &original);
        assert_eq!(&config.responder_id, keypair.address());
        handle.abort();
    }
}
