//! HTTP Basic and Digest authentication.
//!
//! Digest challenges are remembered server-wide so a response can only be
//! accepted against a nonce this server actually issued.

use crate::http::Method;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::VecDeque;

/// How many outstanding Digest challenges are remembered
const MAX_OUTSTANDING_CHALLENGES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Digest,
}

/// A Digest challenge handed to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: String,
}

impl Challenge {
    /// Value of the `WWW-Authenticate` header carrying this challenge
    pub fn header_value(&self) -> String {
        format!(
            "Digest realm=\"{}\", qop=\"auth\", nonce=\"{}\", opaque=\"{}\"",
            self.realm, self.nonce, self.opaque
        )
    }
}

/// An issued challenge and the highest nonce count accepted against it
#[derive(Debug)]
struct Outstanding {
    challenge: Challenge,
    last_nc: u32,
}

/// Outstanding Digest challenges, oldest evicted first
#[derive(Debug, Default)]
pub struct ChallengeStore {
    challenges: Mutex<VecDeque<Outstanding>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh challenge for `realm`
    pub fn issue(&self, realm: &str) -> Challenge {
        let challenge = Challenge {
            realm: realm.to_string(),
            nonce: random_hex(16),
            opaque: random_hex(16),
        };

        let mut challenges = self.challenges.lock();
        if challenges.len() >= MAX_OUTSTANDING_CHALLENGES {
            challenges.pop_front();
        }
        challenges.push_back(Outstanding {
            challenge: challenge.clone(),
            last_nc: 0,
        });
        challenge
    }

    /// Find the challenge a client answered
    pub fn find(&self, nonce: &str) -> Option<Challenge> {
        self.challenges
            .lock()
            .iter()
            .find(|o| o.challenge.nonce == nonce)
            .map(|o| o.challenge.clone())
    }

    /// Record a verified use of `nonce`. With a nonce count the count must
    /// grow on every use; without one the nonce is good for a single use.
    pub fn accept(&self, nonce: &str, nc: Option<u32>) -> bool {
        let mut challenges = self.challenges.lock();
        let Some(pos) = challenges.iter().position(|o| o.challenge.nonce == nonce) else {
            return false;
        };
        match nc {
            Some(nc) if nc > challenges[pos].last_nc => {
                challenges[pos].last_nc = nc;
                true
            }
            Some(_) => false,
            None => {
                challenges.remove(pos);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.challenges.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.lock().is_empty()
    }
}

/// Random lowercase hex string built from `bytes` random bytes
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Value of `name` in a comma separated `key=value` list. Quoted values run to
/// the closing quote, bare values to the next comma.
pub fn extract_param(header: &str, name: &str) -> Option<String> {
    let needle = format!("{}=", name);
    let mut search_from = 0;

    while let Some(found) = header[search_from..].find(&needle) {
        let start = search_from + found;
        let at_boundary = header[..start]
            .chars()
            .next_back()
            .map(|c| c == ',' || c.is_whitespace())
            .unwrap_or(true);
        let value_start = start + needle.len();

        if !at_boundary {
            search_from = value_start;
            continue;
        }

        let rest = &header[value_start..];
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"')?;
            &quoted[..end]
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            rest[..end].trim()
        };
        return Some(value.to_string());
    }

    None
}

/// Check `Authorization: Basic <base64(user:pass)>`
pub fn check_basic(credentials: &str, username: &str, password: &str) -> bool {
    let decoded = match base64::decode(credentials.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    match String::from_utf8(decoded) {
        Ok(pair) => pair == format!("{}:{}", username, password),
        Err(_) => false,
    }
}

/// Compute the `response` value a Digest client sends
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: Method,
    uri: &str,
    nonce: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method.as_str(), uri));
    match qop {
        Some((qop, nc, cnonce)) => {
            md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        }
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Check the parameter list of an `Authorization: Digest ...` header
pub fn check_digest(
    params: &str,
    username: &str,
    password: &str,
    method: Method,
    request_uri: &str,
    challenges: &ChallengeStore,
) -> bool {
    let field = |name: &str| extract_param(params, name).filter(|v| !v.is_empty());

    let (user, realm, nonce, uri, response) = match (
        field("username"),
        field("realm"),
        field("nonce"),
        field("uri"),
        field("response"),
    ) {
        (Some(u), Some(r), Some(n), Some(uri), Some(resp)) => (u, r, n, uri, resp),
        _ => return false,
    };

    if user != username || uri != request_uri {
        return false;
    }

    let challenge = match challenges.find(&nonce) {
        Some(challenge) => challenge,
        None => {
            log::debug!("Digest response for unknown nonce");
            return false;
        }
    };
    if challenge.realm != realm || field("opaque").as_deref() != Some(challenge.opaque.as_str()) {
        return false;
    }

    let (expected, count) = match field("qop") {
        Some(qop) => {
            let (Some(nc), Some(cnonce)) = (field("nc"), field("cnonce")) else {
                return false;
            };
            let Ok(count) = u32::from_str_radix(&nc, 16) else {
                return false;
            };
            let expected =
                digest_response(username, &realm, password, method, &uri, &nonce, Some((&qop, &nc, &cnonce)));
            (expected, Some(count))
        }
        None => (digest_response(username, &realm, password, method, &uri, &nonce, None), None),
    };

    if !expected.eq_ignore_ascii_case(&response) {
        return false;
    }
    if !challenges.accept(&nonce, count) {
        log::debug!("Replayed Digest response rejected");
        return false;
    }
    true
}
