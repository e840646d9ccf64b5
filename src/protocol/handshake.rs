//! Circuit create/extend handshakes (client side)
//!
//! Two handshakes are supported:
//! - **ntor** (ntor1): X25519 key exchange with server authentication,
//!   carried in CREATE2/EXTEND2 cells.
//! - **fast**: keyless first-hop creation carried in CREATE_FAST, where
//!   the link itself provides confidentiality.
//!
//! References:
//! - Tor Spec: https://spec.torproject.org/tor-spec/create-created-cells.html

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Result, TorError};
use crate::protocol::crypto::{derive_fast, derive_ntor, HopKeyMaterial};
use crate::relay::Relay;
use crate::rng::SecureRandom;

type HmacSha256 = Hmac<Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

/// CREATE2/EXTEND2 handshake type for ntor
pub const NTOR_HTYPE: u16 = 2;

/// Link specifier: IPv4 address and port
const LSTYPE_IPV4: u8 = 0;
/// Link specifier: legacy RSA identity
const LSTYPE_LEGACY_ID: u8 = 2;

/// An in-flight client handshake for one hop.
pub enum HopHandshake {
    /// CREATE_FAST in flight
    Fast(FastClient),
    /// ntor CREATE2/EXTEND2 in flight
    Ntor(NtorClient),
}

impl HopHandshake {
    /// Complete the handshake with the hdata of the reply cell.
    pub fn complete(self, reply: &[u8]) -> Result<HopKeyMaterial> {
        match self {
            HopHandshake::Fast(fast) => fast.complete(reply),
            HopHandshake::Ntor(ntor) => ntor.complete(reply),
        }
    }
}

/// Client side of the fast-create handshake.
pub struct FastClient {
    x: [u8; 20],
}

impl FastClient {
    /// Begin a fast create. Returns the handshake state and the
    /// CREATE_FAST payload (the key material half X).
    pub fn start(rng: &SecureRandom) -> (HopHandshake, Vec<u8>) {
        let mut x = [0u8; 20];
        rng.fill(&mut x);
        (HopHandshake::Fast(Self { x }), x.to_vec())
    }

    /// Complete with the CREATED_FAST payload `Y | KH`.
    fn complete(self, reply: &[u8]) -> Result<HopKeyMaterial> {
        if reply.len() < 40 {
            return Err(TorError::HandshakeFailed(
                "CREATED_FAST reply too short".into(),
            ));
        }
        let mut y = [0u8; 20];
        y.copy_from_slice(&reply[..20]);
        let (kh, km) = derive_fast(&self.x, &y);

        let kh_ok: bool = kh.ct_eq(&reply[20..40]).into();
        if !kh_ok {
            return Err(TorError::HandshakeFailed(
                "CREATED_FAST derivative key mismatch".into(),
            ));
        }
        Ok(km)
    }
}

/// Client side of the ntor handshake.
pub struct NtorClient {
    client_secret: StaticSecret,
    client_public: PublicKey,
    relay_id: [u8; 20],
    relay_onion_key: PublicKey,
}

impl NtorClient {
    /// Begin an ntor handshake with `relay`. Returns the handshake
    /// state and the onionskin `ID | B | X` for CREATE2/EXTEND2.
    pub fn start(relay: &Relay) -> Result<(HopHandshake, Vec<u8>)> {
        let relay_id = relay.identity()?;
        let relay_onion_key = relay.ntor_public_key()?;

        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);

        let mut onionskin = Vec::with_capacity(84);
        onionskin.extend_from_slice(&relay_id);
        onionskin.extend_from_slice(relay_onion_key.as_bytes());
        onionskin.extend_from_slice(client_public.as_bytes());

        let client = Self {
            client_secret,
            client_public,
            relay_id,
            relay_onion_key,
        };
        Ok((HopHandshake::Ntor(client), onionskin))
    }

    /// Complete with the reply hdata `Y | AUTH`.
    ///
    /// `secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID`
    fn complete(self, reply: &[u8]) -> Result<HopKeyMaterial> {
        if reply.len() < 64 {
            return Err(TorError::HandshakeFailed("ntor reply too short".into()));
        }
        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[..32]);
        let server_public = PublicKey::from(y_bytes);
        let server_auth = &reply[32..64];

        let shared_yx = self.client_secret.diffie_hellman(&server_public);
        let shared_bx = self.client_secret.diffie_hellman(&self.relay_onion_key);

        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.relay_id);
        secret_input.extend_from_slice(self.relay_onion_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        // KEY_SEED = H(secret_input, t_key); verify = H(secret_input, t_verify)
        let key_seed = hmac_tagged(T_KEY, &secret_input);
        let verify = hmac_tagged(T_VERIFY, &secret_input);

        // auth_input = verify | ID | B | Y | X | PROTOID | "Server"
        let mut auth_input = Vec::with_capacity(verify.len() + 20 + 32 * 3 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.relay_id);
        auth_input.extend_from_slice(self.relay_onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let auth = hmac_tagged(T_MAC, &auth_input);
        let auth_ok: bool = auth.ct_eq(server_auth).into();
        if !auth_ok {
            return Err(TorError::HandshakeFailed(
                "ntor server authentication failed".into(),
            ));
        }

        derive_ntor(&key_seed)
    }
}

/// `H(message, tag)` from the ntor spec: HMAC-SHA256 keyed by the tag.
pub fn hmac_tagged(tag: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(tag).expect("HMAC accepts any key length");
    mac.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Relay side of the ntor handshake.
///
/// Consumes a client onionskin `ID | B | X` and produces the reply
/// `Y | AUTH` plus the hop key material. The client role lives in
/// [`NtorClient`]; this half exists for relay emulators in tests and
/// tools, not for an actual relay role.
pub fn ntor_server_handshake(
    relay_id: &[u8; 20],
    onion_secret: [u8; 32],
    onionskin: &[u8],
) -> Result<(Vec<u8>, HopKeyMaterial)> {
    if onionskin.len() < 84 {
        return Err(TorError::HandshakeFailed("onionskin too short".into()));
    }
    if &onionskin[..20] != relay_id {
        return Err(TorError::HandshakeFailed(
            "onionskin addressed to another relay".into(),
        ));
    }
    let onion_secret = StaticSecret::from(onion_secret);
    let onion_public = PublicKey::from(&onion_secret);
    if onionskin[20..52] != onion_public.as_bytes()[..] {
        return Err(TorError::HandshakeFailed(
            "onionskin uses a stale onion key".into(),
        ));
    }
    let mut x_bytes = [0u8; 32];
    x_bytes.copy_from_slice(&onionskin[52..84]);
    let client_public = PublicKey::from(x_bytes);

    let server_secret = StaticSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&server_secret);

    let xy = server_secret.diffie_hellman(&client_public);
    let xb = onion_secret.diffie_hellman(&client_public);

    let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
    secret_input.extend_from_slice(xy.as_bytes());
    secret_input.extend_from_slice(xb.as_bytes());
    secret_input.extend_from_slice(relay_id);
    secret_input.extend_from_slice(onion_public.as_bytes());
    secret_input.extend_from_slice(client_public.as_bytes());
    secret_input.extend_from_slice(server_public.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = hmac_tagged(T_KEY, &secret_input);
    let verify = hmac_tagged(T_VERIFY, &secret_input);

    let mut auth_input = Vec::with_capacity(verify.len() + 20 + 32 * 3 + PROTOID.len() + 6);
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(relay_id);
    auth_input.extend_from_slice(onion_public.as_bytes());
    auth_input.extend_from_slice(server_public.as_bytes());
    auth_input.extend_from_slice(client_public.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(b"Server");
    let auth = hmac_tagged(T_MAC, &auth_input);

    let mut reply = Vec::with_capacity(64);
    reply.extend_from_slice(server_public.as_bytes());
    reply.extend_from_slice(&auth);

    let material = derive_ntor(&key_seed)?;
    Ok((reply, material))
}

/// Build a CREATE2 payload: `htype | hlen | hdata`.
pub fn create2_payload(hdata: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + hdata.len());
    buf.extend_from_slice(&NTOR_HTYPE.to_be_bytes());
    buf.extend_from_slice(&(hdata.len() as u16).to_be_bytes());
    buf.extend_from_slice(hdata);
    buf
}

/// Parse a CREATED2 (or EXTENDED2) payload: `hlen | hdata`.
pub fn parse_created2(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 2 {
        return Err(TorError::ProtocolError("CREATED2 too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + hlen {
        return Err(TorError::ProtocolError("CREATED2 hdata truncated".into()));
    }
    Ok(&payload[2..2 + hlen])
}

/// Parse a CREATED_FAST payload: `Y | KH` (40 bytes).
pub fn parse_created_fast(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 40 {
        return Err(TorError::ProtocolError("CREATED_FAST too short".into()));
    }
    Ok(&payload[..40])
}

/// Build the EXTEND2 relay data for extending to `relay`:
/// link specifiers (IPv4+port and legacy identity), then the ntor
/// onionskin.
pub fn extend2_data(relay: &Relay, hdata: &[u8]) -> Result<Vec<u8>> {
    let identity = relay.identity()?;
    let addr = relay.address.octets();

    let mut buf = Vec::with_capacity(2 + 8 + 22 + 4 + hdata.len());
    buf.push(2); // NSPEC

    buf.push(LSTYPE_IPV4);
    buf.push(6);
    buf.extend_from_slice(&addr);
    buf.extend_from_slice(&relay.or_port.to_be_bytes());

    buf.push(LSTYPE_LEGACY_ID);
    buf.push(20);
    buf.extend_from_slice(&identity);

    buf.extend_from_slice(&NTOR_HTYPE.to_be_bytes());
    buf.extend_from_slice(&(hdata.len() as u16).to_be_bytes());
    buf.extend_from_slice(hdata);
    Ok(buf)
}

/// Parse an EXTEND2 relay payload into its link specifiers and hdata.
///
/// The client never receives EXTEND2; this is exercised by test
/// harnesses that play the relay side.
pub fn parse_extend2(data: &[u8]) -> Result<(Vec<(u8, Vec<u8>)>, Vec<u8>)> {
    if data.is_empty() {
        return Err(TorError::ProtocolError("EXTEND2 empty".into()));
    }
    let nspec = data[0] as usize;
    let mut offset = 1;
    let mut specs = Vec::with_capacity(nspec);
    for _ in 0..nspec {
        if data.len() < offset + 2 {
            return Err(TorError::ProtocolError("EXTEND2 specifier truncated".into()));
        }
        let lstype = data[offset];
        let lslen = data[offset + 1] as usize;
        offset += 2;
        if data.len() < offset + lslen {
            return Err(TorError::ProtocolError("EXTEND2 specifier truncated".into()));
        }
        specs.push((lstype, data[offset..offset + lslen].to_vec()));
        offset += lslen;
    }
    if data.len() < offset + 4 {
        return Err(TorError::ProtocolError("EXTEND2 handshake truncated".into()));
    }
    let hlen = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
    offset += 4;
    if data.len() < offset + hlen {
        return Err(TorError::ProtocolError("EXTEND2 hdata truncated".into()));
    }
    Ok((specs, data[offset..offset + hlen].to_vec()))
}
