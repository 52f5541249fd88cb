use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use tracing::debug;

use crate::{
    config::{BotConfig, Credentials, Secret},
    error::Lookup,
};

/// Side channel for announcements. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Lookup<()>;
}

/// Posts messages to a Gitter room.
pub struct Gitter {
    client: ClientWithMiddleware,
    api: String,
    room: String,
    token: Option<Secret>,
}

impl Gitter {
    pub fn new(client: ClientWithMiddleware, config: &BotConfig) -> Self {
        Self {
            client,
            api: config.endpoints.gitter_api.trim_end_matches('/').to_string(),
            room: config.gitter_room.clone(),
            token: config.credentials.gitter_token.clone(),
        }
    }
}

#[async_trait]
impl Notifier for Gitter {
    async fn notify(&self, text: &str) -> Lookup<()> {
        let token = match Credentials::require(&self.token, "GITTER_TOKEN") {
            Ok(token) => token,
            Err(err) => return Lookup::Transient(err.into()),
        };
        let url = format!("{}/rooms/{}/chatMessages", self.api, self.room);
        debug!(url, "Sending chat message");

        let sent = self
            .client
            .post(&url)
            .bearer_auth(token.expose())
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => Lookup::Found(()),
            Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => Lookup::NotFound,
            Ok(response) => Lookup::Transient(anyhow::anyhow!("HTTP {} from {}", response.status(), url)),
            Err(err) => Lookup::Transient(anyhow::Error::new(err).context(format!("Chat request failed: {}", url))),
        }
    }
}
