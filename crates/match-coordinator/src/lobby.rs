//! Lobby service client
//!
//! The lobby knows who joined the match and who pressed ready. It offers a
//! one-shot status read over HTTP and a WebSocket stream that pushes the
//! same snapshot shape whenever it changes.

use crate::types::MatchStatus;
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LobbyError {
    #[error("Lobby request failed: {0}")]
    Http(String),

    #[error("Lobby returned status {0}")]
    Status(u16),

    #[error("Lobby stream failed: {0}")]
    Stream(String),

    #[error("Undecodable lobby payload: {0}")]
    Decode(String),

    #[error("Invalid lobby URL: {0}")]
    InvalidUrl(String),
}

/// Pushed status snapshots; ends when the lobby closes the stream
pub type StatusUpdates = BoxStream<'static, Result<MatchStatus, LobbyError>>;

#[async_trait]
pub trait LobbyService: Send + Sync {
    /// Read the current snapshot once
    async fn fetch_status(&self) -> Result<MatchStatus, LobbyError>;

    /// Open the push channel. Callers fall back to polling on error.
    async fn open_updates(&self) -> Result<StatusUpdates, LobbyError>;
}

/// Lobby over HTTP and WebSocket with bearer authentication.
///
/// The session token is a credential; it is never logged.
#[derive(Clone)]
pub struct HttpLobby {
    base_url: Url,
    ws_url: Url,
    match_token: String,
    session_token: String,
    http: reqwest::Client,
}

impl HttpLobby {
    /// Create a new lobby client for one match
    pub fn new(
        base_url: &str,
        ws_url: &str,
        match_token: &str,
        session_token: &str,
    ) -> Result<Self, LobbyError> {
        let parse =
            |raw: &str| Url::parse(raw).map_err(|e| LobbyError::InvalidUrl(format!("{raw}: {e}")));
        Ok(Self {
            base_url: parse(base_url)?,
            ws_url: parse(ws_url)?,
            match_token: match_token.to_string(),
            session_token: session_token.to_string(),
            http: reqwest::Client::new(),
        })
    }

    fn status_url(&self) -> Result<Url, LobbyError> {
        match_endpoint(&self.base_url, &self.match_token, "status")
    }

    fn updates_url(&self) -> Result<Url, LobbyError> {
        match_endpoint(&self.ws_url, &self.match_token, "updates")
    }
}

/// `{base}/matches/{token}/{leaf}` with the token percent-encoded as a
/// single path segment
fn match_endpoint(base: &Url, match_token: &str, leaf: &str) -> Result<Url, LobbyError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| LobbyError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(["matches", match_token, leaf]);
    Ok(url)
}

fn decode_update(text: &str) -> Result<MatchStatus, LobbyError> {
    serde_json::from_str(text).map_err(|e| LobbyError::Decode(e.to_string()))
}

#[async_trait]
impl LobbyService for HttpLobby {
    async fn fetch_status(&self) -> Result<MatchStatus, LobbyError> {
        let resp = self
            .http
            .get(self.status_url()?)
            .bearer_auth(&self.session_token)
            .send()
            .await
            .map_err(|e| LobbyError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LobbyError::Status(status.as_u16()));
        }

        resp.json::<MatchStatus>()
            .await
            .map_err(|e| LobbyError::Decode(e.to_string()))
    }

    async fn open_updates(&self) -> Result<StatusUpdates, LobbyError> {
        let mut request = self
            .updates_url()?
            .as_str()
            .into_client_request()
            .map_err(|e| LobbyError::Stream(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.session_token))
            .map_err(|e| LobbyError::Stream(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| LobbyError::Stream(e.to_string()))?;

        tracing::debug!("Lobby push channel open for match {}", self.match_token);

        let updates = futures::stream::unfold(Some(ws_stream), |state| async move {
            let mut ws = state?;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return Some((decode_update(&text), Some(ws))),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("Lobby closed push channel");
                        return None;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some((Err(LobbyError::Stream(e.to_string())), None)),
                }
            }
        });
        Ok(updates.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let lobby =
            HttpLobby::new("https://lobby.example/", "wss://lobby.example", "m-1", "jwt").unwrap();
        assert_eq!(
            lobby.status_url().unwrap().as_str(),
            "https://lobby.example/matches/m-1/status"
        );
        assert_eq!(
            lobby.updates_url().unwrap().as_str(),
            "wss://lobby.example/matches/m-1/updates"
        );
    }

    #[test]
    fn test_match_token_is_one_encoded_segment() {
        let lobby =
            HttpLobby::new("https://lobby.example/api/", "wss://lobby.example", "a b/c?d", "jwt")
                .unwrap();
        assert_eq!(
            lobby.status_url().unwrap().as_str(),
            "https://lobby.example/api/matches/a%20b%2Fc%3Fd/status"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpLobby::new("lobby.example", "wss://lobby.example", "m-1", "jwt"),
            Err(LobbyError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_decode_update() {
        let status = decode_update(r#"{"allReady": false, "participants": []}"#).unwrap();
        assert!(!status.all_ready);
        assert!(matches!(decode_update("not json"), Err(LobbyError::Decode(_))));
    }
}
