//! Password authentication primitives.
//!
//! MD5 challenge response and the client side of SCRAM-SHA-256.
//!
//! <https://datatracker.ietf.org/doc/html/rfc5802>
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::Rng;
use sha2::Sha256;
use std::borrow::Cow;

/// The only SASL mechanism supported.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

const CLIENT_NONCE_LEN: usize = 18;

/// `AuthenticationMD5Password` response.
///
/// The response is `md5` followed by `md5(md5(password + user) + salt)` in lowercase hex.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let inner = md5.finalize_reset();
    md5.update(format!("{inner:x}"));
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

/// An error during the SCRAM exchange.
pub struct SaslError {
    reason: Cow<'static, str>,
}

impl SaslError {
    fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for SaslError { }

impl std::fmt::Display for SaslError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SASL: {}", self.reason)
    }
}

impl std::fmt::Debug for SaslError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Client side of one SCRAM-SHA-256 exchange.
///
/// The exchange is: [`client_first`][Scram::client_first] →
/// `AuthenticationSASLContinue` → [`client_final`][Scram::client_final] →
/// `AuthenticationSASLFinal` → [`verify`][Scram::verify]. Verification of the
/// server signature is mandatory, a server that passed the password check but
/// fails it is not in possession of the salted password.
pub struct Scram {
    client_nonce: String,
    server_signature: Option<String>,
}

impl Scram {
    pub fn new() -> Self {
        let mut nonce = [0u8; CLIENT_NONCE_LEN];
        rand::thread_rng().fill(&mut nonce[..]);
        Self::with_nonce(BASE64.encode(nonce))
    }

    fn with_nonce(client_nonce: String) -> Self {
        Self { client_nonce, server_signature: None }
    }

    /// The initial client message, `n,,n=*,r=<nonce>`.
    ///
    /// Channel binding is not offered (`n,,`) and the username is left to the
    /// startup message (`n=*`), which is what the server expects.
    pub fn client_first(&self) -> String {
        format!("n,,n=*,r={}", self.client_nonce)
    }

    /// Consume the server first message and produce the client final message.
    ///
    /// Retains the expected server signature for [`verify`][Scram::verify].
    pub fn client_final(&mut self, password: &str, server_first: &str) -> Result<String, SaslError> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for chunk in server_first.split(',') {
            match chunk.split_at_checked(2) {
                Some(("r=", v)) => nonce = Some(v),
                Some(("s=", v)) => salt = BASE64.decode(v).ok(),
                Some(("i=", v)) => iterations = v.parse::<u32>().ok(),
                _ => { }
            }
        }

        let nonce = nonce.ok_or_else(|| SaslError::new("server first message carries no nonce"))?;
        let salt = salt.ok_or_else(|| SaslError::new("invalid salt"))?;
        let iterations = iterations.ok_or_else(|| SaslError::new("invalid iteration count"))?;

        // The server nonce must extend ours, anything else is a replay.
        if !nonce.starts_with(&self.client_nonce) || nonce.len() <= self.client_nonce.len() {
            return Err(SaslError::new("server nonce does not extend client nonce"));
        }

        let salted = hi(password.as_bytes(), &salt, iterations);

        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let auth_message = format!(
            "n=*,r={},{},c=biws,r={}",
            self.client_nonce, server_first, nonce,
        );

        let mut proof = client_key;
        for (proof, signature) in proof.iter_mut().zip(hmac(&stored_key, auth_message.as_bytes())) {
            *proof ^= signature;
        }

        let server_key = hmac(&salted, b"Server Key");
        self.server_signature = Some(BASE64.encode(hmac(&server_key, auth_message.as_bytes())));

        Ok(format!("c=biws,r={},p={}", nonce, BASE64.encode(proof)))
    }

    /// Verify the server signature from `AuthenticationSASLFinal`.
    pub fn verify(&self, server_final: &str) -> Result<(), SaslError> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(SaslError::new(format!("server rejected authentication: {err}")));
        }
        let Some(signature) = server_final.strip_prefix("v=") else {
            return Err(SaslError::new("server final message carries no signature"));
        };
        match self.server_signature.as_deref() {
            Some(expect) if expect == signature => Ok(()),
            _ => Err(SaslError::new("server signature verification failed")),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    Hmac::<Sha256>::new_from_slice(key)
        .expect("hmac accepts any key length")
        .chain_update(data)
        .finalize()
        .into_bytes()
        .into()
}

/// `Hi(str, salt, i)`, the PBKDF2-style iterated XOR of RFC 5802.
fn hi(str: &[u8], salt: &[u8], i: u32) -> [u8; 32] {
    let mut prev = Hmac::<Sha256>::new_from_slice(str)
        .expect("hmac accepts any key length")
        .chain_update(salt)
        .chain_update([0, 0, 0, 1])
        .finalize()
        .into_bytes();
    let mut hi = prev;

    for _ in 1..i {
        prev = Hmac::<Sha256>::new_from_slice(str)
            .expect("hmac accepts any key length")
            .chain_update(prev)
            .finalize()
            .into_bytes();

        for (hi, prev) in hi.iter_mut().zip(prev) {
            *hi ^= prev;
        }
    }

    hi.into()
}

#[cfg(test)]
mod test {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn hi_matches_pbkdf2_vectors() {
        // published PBKDF2-HMAC-SHA256 vectors, Hi is PBKDF2 with dkLen = 32
        assert_eq!(
            hex(&hi(b"password", b"salt", 1)),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b",
        );
        assert_eq!(
            hex(&hi(b"password", b"salt", 4096)),
            "c5e478d59288c841aa530db6845c4c8d962893a001ce4e11a4963873aa98134a",
        );
    }

    #[test]
    fn md5_challenge_shape() {
        let response = md5_password("postgres", "hunter2", [1, 2, 3, 4]);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 3 + 32);
        assert!(response[3..].bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        // deterministic, and sensitive to the salt
        assert_eq!(response, md5_password("postgres", "hunter2", [1, 2, 3, 4]));
        assert_ne!(response, md5_password("postgres", "hunter2", [4, 3, 2, 1]));
    }

    /// Server side of the exchange, written out independently from the client
    /// code against RFC 5802 so a shared mistake cannot cancel out.
    #[test]
    fn full_exchange_with_signature_check() {
        let password = "pencil";
        let salt = b"0123456789abcdef";
        let iterations = 4096;

        let mut scram = Scram::with_nonce("rOprNGfwEbeRWgbN".into());
        let first = scram.client_first();
        assert_eq!(first, "n,,n=*,r=rOprNGfwEbeRWgbN");

        let server_first = format!(
            "r=rOprNGfwEbeRWgbNSERVERNONCE,s={},i={iterations}",
            BASE64.encode(salt),
        );
        let finale = scram.client_final(password, &server_first).unwrap();

        // server derivation
        let salted = hi(password.as_bytes(), salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(client_key);
        let auth_message = format!(
            "n=*,r=rOprNGfwEbeRWgbN,{server_first},c=biws,r=rOprNGfwEbeRWgbNSERVERNONCE",
        );
        let client_signature = hmac(&stored_key, auth_message.as_bytes());

        // recover the client key from the proof and check it against storage
        let proof = finale.rsplit_once("p=").unwrap().1;
        let proof = BASE64.decode(proof).unwrap();
        let recovered: Vec<u8> = proof
            .iter()
            .zip(client_signature)
            .map(|(p, s)| p ^ s)
            .collect();
        assert_eq!(&recovered[..], &client_key[..]);
        assert!(finale.starts_with("c=biws,r=rOprNGfwEbeRWgbNSERVERNONCE,p="));

        let server_key = hmac(&salted, b"Server Key");
        let server_signature = BASE64.encode(hmac(&server_key, auth_message.as_bytes()));
        scram.verify(&format!("v={server_signature}")).unwrap();
        scram.verify("v=AAAA").unwrap_err();
        scram.verify("e=other-error").unwrap_err();
    }

    #[test]
    fn nonce_must_extend() {
        let mut scram = Scram::with_nonce("abcdef".into());
        // same length nonce is rejected
        scram
            .client_final("x", "r=abcdef,s=c2FsdA==,i=1")
            .unwrap_err();
        // unrelated nonce is rejected
        scram
            .client_final("x", "r=zzzzzzzz,s=c2FsdA==,i=1")
            .unwrap_err();
    }
}
