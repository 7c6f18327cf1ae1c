use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::RngCore;
use url::Url;

use super::digest::DigestChallenge;
use super::{ActuatorError, PtzCommand};

/// HTTP client for the camera's continuous-move endpoint.
///
/// Sends `PUT <url>` with the command as XML. The digest challenge from the
/// last `401` is cached so later commands authenticate on the first request.
pub struct PtzClient {
    url: String,
    uri: String,
    username: String,
    password: String,
    agent: ureq::Agent,
    challenge: Mutex<Option<DigestChallenge>>,
    nonce_count: AtomicU32,
}

impl PtzClient {
    pub fn new(
        url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ActuatorError> {
        let parsed = Url::parse(url)
            .map_err(|e| ActuatorError::Transport(format!("invalid PTZ url: {e}")))?;
        let uri = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            url: url.to_string(),
            uri,
            username: username.to_string(),
            password: password.to_string(),
            agent,
            challenge: Mutex::new(None),
            nonce_count: AtomicU32::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one command. Success is exactly HTTP 200.
    pub fn send(&self, command: &PtzCommand) -> Result<(), ActuatorError> {
        let body = command.to_xml();
        let cached = self.cached_challenge();
        let first = self.put(&body, cached.as_ref());
        let outcome = match first {
            Err(ureq::Error::Status(401, response)) => {
                let header = response.header("WWW-Authenticate").ok_or_else(|| {
                    ActuatorError::Auth("401 without WWW-Authenticate".to_string())
                })?;
                let challenge = DigestChallenge::parse(header)?;
                self.nonce_count.store(0, Ordering::SeqCst);
                self.store_challenge(Some(challenge.clone()));
                self.put(&body, Some(&challenge))
            }
            other => other,
        };

        match outcome {
            Ok(response) if response.status() == 200 => Ok(()),
            Ok(response) => Err(ActuatorError::Status(response.status())),
            Err(ureq::Error::Status(401, _)) => {
                self.store_challenge(None);
                Err(ActuatorError::Auth("credentials rejected".to_string()))
            }
            Err(ureq::Error::Status(code, _)) => Err(ActuatorError::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(ActuatorError::Transport(err.to_string())),
        }
    }

    fn put(
        &self,
        body: &str,
        challenge: Option<&DigestChallenge>,
    ) -> Result<ureq::Response, ureq::Error> {
        let mut request = self
            .agent
            .put(&self.url)
            .set("Content-Type", "application/xml");
        if let Some(challenge) = challenge {
            let nc = self.nonce_count.fetch_add(1, Ordering::SeqCst) + 1;
            let header = challenge.authorization(
                &self.username,
                &self.password,
                "PUT",
                &self.uri,
                nc,
                &new_cnonce(),
            );
            request = request.set("Authorization", &header);
        }
        request.send_string(body)
    }

    fn cached_challenge(&self) -> Option<DigestChallenge> {
        self.challenge.lock().ok().and_then(|guard| guard.clone())
    }

    fn store_challenge(&self, challenge: Option<DigestChallenge>) {
        if let Ok(mut guard) = self.challenge.lock() {
            *guard = challenge;
        }
    }
}

fn new_cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
