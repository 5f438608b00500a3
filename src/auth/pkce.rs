//! PKCE S256 challenge and state generation
//!
//! Implements the Proof Key for Code Exchange extension (RFC 7636) with the
//! `S256` method only, plus the random `state` value that binds the
//! authorization callback to the request that started it.
//!
//! # How PKCE works
//!
//! 1. The bridge generates a high-entropy `code_verifier`.
//! 2. It sends `BASE64URL(SHA256(code_verifier))` as the `code_challenge`
//!    on the authorization request.
//! 3. The token exchange carries the original verifier, which the
//!    authorization server hashes and compares.
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>

use base64::Engine as _;
use rand::RngCore as _;
use sha2::{Digest, Sha256};

/// The only challenge method the bridge offers.
pub const CHALLENGE_METHOD: &str = "S256";

/// Number of random bytes behind a code verifier (43 base64url characters).
const VERIFIER_BYTES: usize = 32;

/// Number of random bytes behind a state token.
const STATE_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// PkceChallenge
// ---------------------------------------------------------------------------

/// A verifier together with its derived S256 challenge.
///
/// # Examples
///
/// ```
/// use mcpbridge::auth::pkce;
///
/// let pair = pkce::generate();
/// assert_eq!(pair.verifier.len(), 43);
/// assert_eq!(pair.method, "S256");
/// assert_eq!(pair.challenge, pkce::code_challenge(&pair.verifier));
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// Base64url (no padding) encoding of 32 random bytes.
    pub verifier: String,

    /// Base64url (no padding) SHA-256 digest of [`Self::verifier`].
    pub challenge: String,

    /// Always [`CHALLENGE_METHOD`].
    pub method: &'static str,
}

// ---------------------------------------------------------------------------
// Public functions
// ---------------------------------------------------------------------------

/// Generates a fresh verifier/challenge pair.
pub fn generate() -> PkceChallenge {
    let verifier = random_base64url(VERIFIER_BYTES);
    let challenge = code_challenge(&verifier);

    PkceChallenge {
        verifier,
        challenge,
        method: CHALLENGE_METHOD,
    }
}

/// Computes the S256 challenge for a verifier.
///
/// A pure function: the same verifier always yields the same challenge.
///
/// # Examples
///
/// ```
/// use mcpbridge::auth::pkce::code_challenge;
///
/// // RFC 7636 Appendix B
/// assert_eq!(
///     code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
///     "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
/// );
/// ```
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Generates an unguessable state token (16 random bytes, base64url).
pub fn generate_state() -> String {
    random_base64url(STATE_BYTES)
}

fn random_base64url(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
