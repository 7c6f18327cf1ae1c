//! HTTP digest access authentication (RFC 7616), client side.
//!
//! Cameras answer an unauthenticated request with `401` and a
//! `WWW-Authenticate: Digest ...` challenge. The client answers with an
//! `Authorization` header derived from the challenge and the shared secret.

use md5::Md5;
use sha2::{Digest, Sha256};

use super::ActuatorError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn parse(value: &str) -> Result<Self, ActuatorError> {
        match value.to_ascii_uppercase().as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA-256" => Ok(Self::Sha256),
            other => Err(ActuatorError::Auth(format!(
                "unsupported digest algorithm {other}"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }

    fn hash(self, input: &str) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            Self::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// Parsed `WWW-Authenticate: Digest` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// True when the server offered `qop=auth`.
    pub qop_auth: bool,
    pub algorithm: DigestAlgorithm,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Result<Self, ActuatorError> {
        let header = header.trim();
        let Some(params) = header
            .get(..6)
            .filter(|scheme| scheme.eq_ignore_ascii_case("digest"))
            .map(|_| &header[6..])
        else {
            return Err(ActuatorError::Auth(format!(
                "expected a Digest challenge, got '{}'",
                header.split_whitespace().next().unwrap_or("")
            )));
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut algorithm = DigestAlgorithm::Md5;
        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => {
                    qop_auth = value
                        .split(',')
                        .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                }
                "algorithm" => algorithm = DigestAlgorithm::parse(&value)?,
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| ActuatorError::Auth("challenge missing realm".into()))?,
            nonce: nonce.ok_or_else(|| ActuatorError::Auth("challenge missing nonce".into()))?,
            opaque,
            qop_auth,
            algorithm,
        })
    }

    /// `Authorization` header value for one request.
    ///
    /// `nc` is the request count under this nonce, starting at 1.
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nc: u32,
        cnonce: &str,
    ) -> String {
        let alg = self.algorithm;
        let ha1 = alg.hash(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = alg.hash(&format!("{}:{}", method, uri));
        let nc_value = format!("{:08x}", nc);

        let response = if self.qop_auth {
            alg.hash(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc_value, cnonce, ha2
            ))
        } else {
            alg.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            username,
            self.realm,
            self.nonce,
            uri,
            alg.as_str(),
            response
        );
        if self.qop_auth {
            header.push_str(&format!(
                ", qop=auth, nc={}, cnonce=\"{}\"",
                nc_value, cnonce
            ));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}

/// Split `k=v, k="v, with comma"` pairs; quotes are removed.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let key: String = chars
            .by_ref()
            .take_while(|c| *c != '=')
            .collect::<String>()
            .trim()
            .to_string();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for c in chars.by_ref() {
                match (escaped, c) {
                    (false, '\\') => escaped = true,
                    (false, '"') => break,
                    _ => {
                        value.push(c);
                        escaped = false;
                    }
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        out.push((key, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_challenge_with_commas() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="IP Camera(C1234)", qop="auth,auth-int", nonce="abc, def", opaque="xyz", stale=FALSE"#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "IP Camera(C1234)");
        assert_eq!(challenge.nonce, "abc, def");
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert!(challenge.qop_auth);
        assert_eq!(challenge.algorithm, DigestAlgorithm::Md5);
    }

    #[test]
    fn rejects_basic_and_incomplete_challenges() {
        assert!(DigestChallenge::parse(r#"Basic realm="cam""#).is_err());
        assert!(DigestChallenge::parse(r#"Digest realm="cam""#).is_err());
        assert!(DigestChallenge::parse(r#"Digest realm="cam", nonce="n", algorithm=SHA-512"#).is_err());
    }

    // Worked example from RFC 2617 section 3.5.
    #[test]
    fn md5_response_matches_rfc_2617_example() {
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".to_string()),
            qop_auth: true,
            algorithm: DigestAlgorithm::Md5,
        };
        let header = challenge.authorization(
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            1,
            "0a4f113b",
        );
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn legacy_challenge_omits_qop_fields() {
        let challenge = DigestChallenge::parse(r#"Digest realm="cam", nonce="n1""#).unwrap();
        let header = challenge.authorization("admin", "pw", "PUT", "/ptz", 1, "c");
        assert!(!header.contains("qop="));
        assert!(!header.contains("cnonce"));
    }
}
